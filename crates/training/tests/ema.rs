use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use training::EmaModel;
use velocity::{FeedForwardConfig, FeedForwardVelocity, VelocityModel};

fn model() -> FeedForwardVelocity {
    FeedForwardVelocity::new(
        FeedForwardConfig {
            input_dim: 2,
            time_embedding_dim: 4,
            hidden_widths: vec![4],
            latent_dim: None,
            dtype: DType::F32,
        },
        &Device::Cpu,
    )
    .unwrap()
}

fn flat(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn shadow_follows_the_closed_form_decay() -> Result<()> {
    let live = model();
    let decay = 0.8;
    let update_every = 3;
    let mut ema = EmaModel::new(&live, decay, update_every)?;

    let initial: Vec<(String, Vec<f32>)> = live
        .named_parameters()
        .iter()
        .map(|(name, var)| (name.clone(), flat(var.as_tensor())))
        .collect();
    for (_, var) in live.named_parameters() {
        var.set(&var.as_tensor().ones_like()?)?;
    }

    let events = 4;
    let mut moved = 0;
    for _ in 0..events * update_every {
        if ema.update(&live)? {
            moved += 1;
        }
    }
    assert_eq!(moved, events);
    assert_eq!(ema.state().calls, events * update_every);
    assert_eq!(ema.state().updates, events);

    let kept = (decay as f32).powi(events as i32);
    let shadow: std::collections::HashMap<String, Vec<f32>> = ema
        .named_parameters()
        .iter()
        .map(|(name, var)| (name.clone(), flat(var.as_tensor())))
        .collect();
    for (name, start) in initial {
        let current = &shadow[&name];
        for (value, original) in current.iter().zip(start) {
            let expected = kept * original + (1.0 - kept);
            assert!(
                (value - expected).abs() < 1e-5,
                "{name}: {value} vs {expected}"
            );
        }
    }
    Ok(())
}

#[test]
fn shadow_is_independent_of_the_live_model() -> Result<()> {
    let live = model();
    let ema = EmaModel::new(&live, 0.5, 1)?;
    let before: Vec<Vec<f32>> = ema
        .named_parameters()
        .iter()
        .map(|(_, var)| flat(var.as_tensor()))
        .collect();

    for (_, var) in live.named_parameters() {
        var.set(&var.as_tensor().zeros_like()?)?;
    }
    let after: Vec<Vec<f32>> = ema
        .named_parameters()
        .iter()
        .map(|(_, var)| flat(var.as_tensor()))
        .collect();
    assert_eq!(before, after);
    Ok(())
}
