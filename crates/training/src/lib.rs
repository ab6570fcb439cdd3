pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod ema;
pub mod guard;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod overrides;
pub mod pipeline;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManifest, LoadOutcome, Milestone};
pub use config::{RollbackPolicy, TrainingConfig, TrainingError};
pub use context::{GradientReducer, LocalReducer, WorkerContext};
pub use data::{BlockingDataLoader, CorruptionDataLoader, DataBatch, DataLoader};
pub use ema::{EmaModel, EmaState};
pub use guard::{GuardVerdict, RollbackReason, StabilityGuard};
pub use optimizer::{OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use overrides::{apply_overrides, ConfigOverride};
pub use pipeline::Components;
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::{StepOutcome, Trainer};
