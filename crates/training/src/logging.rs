use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{config::LoggingConfig, guard::RollbackReason, metrics::StepSnapshot, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl From<&LoggingConfig> for LoggingSettings {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Progress line on stdout plus optional TensorBoard scalars. Only the primary
/// worker should own one with outputs enabled.
pub struct Logger {
    settings: LoggingSettings,
    events: Option<EventFile>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let events = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(EventFile::open(dir, settings.tensorboard_flush_every_n)?),
            None => None,
        };
        Ok(Self { settings, events })
    }

    /// A logger that writes nothing, used on non-primary workers.
    pub fn disabled() -> Self {
        Self {
            settings: LoggingSettings {
                enable_stdout: false,
                tensorboard_dir: None,
                tensorboard_flush_every_n: 1,
            },
            events: None,
        }
    }

    pub fn log_training_step(
        &mut self,
        step: usize,
        total_steps: usize,
        lr: f64,
        loss_scale: f32,
        snapshot: &StepSnapshot,
    ) {
        if self.settings.enable_stdout {
            println!(
                "[progress] step {}/{} | loss {:.5} (avg {:.5}) | grad {:.3} | lr {:.3e} | {:.0} ex/s | rollbacks {}",
                step,
                total_steps,
                snapshot.step_loss,
                snapshot.loss,
                snapshot.grad_norm,
                lr,
                snapshot.examples_per_sec,
                snapshot.rollbacks
            );
        }
        self.record(
            step,
            &[
                (Scalar::StepLoss, snapshot.step_loss),
                (Scalar::SmoothedLoss, snapshot.loss),
                (Scalar::GradNorm, snapshot.grad_norm),
                (Scalar::LearningRate, lr),
                (Scalar::LossScale, f64::from(loss_scale)),
                (Scalar::ExamplesPerSec, snapshot.examples_per_sec),
            ],
        );
    }

    pub fn log_rollback(&mut self, step: usize, reason: &RollbackReason, total_rollbacks: usize) {
        let rejected = match *reason {
            RollbackReason::NonFinite { loss } => {
                log::warn!(
                    "non-finite loss {loss} at step {step}; rolling back to best checkpoint"
                );
                loss
            }
            RollbackReason::Spike { loss, window_mean } => {
                log::warn!(
                    "loss spike {loss:.5} (recent mean {window_mean:.5}) at step {step}; rolling back to best checkpoint"
                );
                loss
            }
        };
        self.record(
            step,
            &[
                (Scalar::Rollbacks, total_rollbacks as f64),
                (Scalar::RejectedLoss, rejected),
            ],
        );
    }

    pub fn log_best(&mut self, step: usize, loss: f64) {
        log::info!("New best model at step {step} (loss {loss:.5})");
        self.record(step, &[(Scalar::BestLoss, loss)]);
    }

    pub fn flush(&mut self) {
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.flush() {
                log::warn!("{err}");
            }
        }
    }

    fn record(&mut self, step: usize, scalars: &[(Scalar, f64)]) {
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.record(step as i64, scalars) {
                log::warn!("{err}");
            }
        }
    }
}

/// Scalars tracked over a run, grouped by TensorBoard section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    StepLoss,
    SmoothedLoss,
    GradNorm,
    LearningRate,
    LossScale,
    ExamplesPerSec,
    Rollbacks,
    RejectedLoss,
    BestLoss,
}

impl Scalar {
    pub fn tag(self) -> &'static str {
        match self {
            Scalar::StepLoss => "interpolant/loss",
            Scalar::SmoothedLoss => "interpolant/loss_smoothed",
            Scalar::GradNorm => "optimizer/grad_norm",
            Scalar::LearningRate => "optimizer/learning_rate",
            Scalar::LossScale => "optimizer/loss_scale",
            Scalar::ExamplesPerSec => "throughput/examples_per_sec",
            Scalar::Rollbacks => "stability/rollbacks",
            Scalar::RejectedLoss => "stability/rejected_loss",
            Scalar::BestLoss => "stability/best_loss",
        }
    }
}

/// One `events.out.tfevents.*` file. Every call to [`EventFile::record`] becomes a
/// single event holding all scalars of that step, framed as
/// `len | crc(len) | event | crc(event)`.
struct EventFile {
    writer: BufWriter<File>,
    flush_every: usize,
    unflushed: usize,
}

impl EventFile {
    fn open(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}.interpolant",
            unix_seconds(),
            hostname()
        ));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            unflushed: 0,
        })
    }

    fn record(&mut self, step: i64, scalars: &[(Scalar, f64)]) -> Result<(), TrainingError> {
        if scalars.is_empty() {
            return Ok(());
        }
        let event = Event {
            wall_time: wall_seconds(),
            step,
            summary: Some(Summary {
                value: scalars
                    .iter()
                    .map(|&(scalar, value)| summary::Value {
                        tag: scalar.tag().to_string(),
                        simple_value: Some(value as f32),
                    })
                    .collect(),
            }),
        };

        let mut payload = BytesMut::with_capacity(32 + 40 * scalars.len());
        event.encode(&mut payload).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let length = (payload.len() as u64).to_le_bytes();

        let mut frame = BytesMut::with_capacity(payload.len() + 16);
        frame.extend_from_slice(&length);
        frame.extend_from_slice(&record_crc(&length).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&record_crc(&payload).to_le_bytes());
        self.writer.write_all(&frame).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.unflushed = 0;
        Ok(())
    }
}

impl Drop for EventFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Masked checksum of the TFRecord framing.
fn record_crc(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize().rotate_right(15).wrapping_add(0xa282_ead8)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn wall_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
