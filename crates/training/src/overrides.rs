//! `key.path=value` overrides applied to a loaded [`TrainingConfig`] through its
//! JSON form, so any field reachable by serde can be set from the command line.

use std::str::FromStr;

use serde_json::{Map, Number, Value};

use crate::{TrainingConfig, TrainingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Applies overrides in order and re-validates the result.
pub fn apply_overrides(
    config: TrainingConfig,
    overrides: &[ConfigOverride],
) -> Result<TrainingConfig, TrainingError> {
    if overrides.is_empty() {
        return Ok(config);
    }
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    let config: TrainingConfig = serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("invalid config after overrides: {err}"))
    })?;
    config.validate()?;
    Ok(config)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((base, idx_part)) => {
                let index = idx_part
                    .trim_end_matches(']')
                    .parse::<usize>()
                    .map_err(|err| {
                        TrainingError::runtime(format!(
                            "invalid index in override path '{segment}': {err}"
                        ))
                    })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments = parse_path(path)?;
    if segments.iter().any(|segment| segment.key.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{path}' has an empty segment"
        )));
    }
    assign_at_path(value, &segments, new_value)
}

fn object_at<'a>(
    value: &'a mut Value,
    key: &str,
) -> Result<&'a mut Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{key}' points to a non-object value"
        ))
    })
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    let entry = object_at(target, &segment.key)?
        .entry(segment.key.clone())
        .or_insert(Value::Null);

    let slot = match segment.index {
        None => entry,
        Some(array_index) => {
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            let array = entry.as_array_mut().ok_or_else(|| {
                TrainingError::runtime(format!(
                    "override path segment '{}' expects an array value",
                    segment.key
                ))
            })?;
            while array.len() <= array_index {
                array.push(Value::Null);
            }
            &mut array[array_index]
        }
    };
    assign_at_path(slot, rest, new_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TrainingConfig {
        toml::from_str("[corruption]\nname = \"gaussian_noise\"\nlevels = [0.4]\n").unwrap()
    }

    fn arg(raw: &str) -> ConfigOverride {
        raw.parse().unwrap()
    }

    #[test]
    fn overrides_reach_nested_fields_and_lists() {
        let config = apply_overrides(
            base(),
            &[
                arg("runtime.train_steps=12"),
                arg("corruption.levels[0]=0.25"),
                arg("interpolant.variant=follmer"),
                arg("interpolant.diffusion_coef=0.5"),
                arg("scheduler.enabled=true"),
            ],
        )
        .unwrap();
        assert_eq!(config.runtime.train_steps, 12);
        assert_eq!(config.corruption.levels, vec![0.25]);
        assert_eq!(config.interpolant.diffusion_coef, Some(0.5));
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn invalid_results_are_rejected() {
        assert!("no_equals_sign".parse::<ConfigOverride>().is_err());
        assert!(apply_overrides(base(), &[arg("runtime.train_steps=0")]).is_err());
        assert!(apply_overrides(base(), &[arg("runtime.train_steps.inner=1")]).is_err());
    }
}
