use std::{
    sync::{
        mpsc::{sync_channel, Receiver},
        Arc,
    },
    thread::JoinHandle,
};

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use interpolant::ForwardOperator;
use inverse_data::CleanSource;

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Micro-batch of clean examples and their corruption, already on the trainer's device.
#[derive(Debug)]
pub struct DataBatch {
    pub clean: Tensor,
    pub corrupted: Tensor,
    pub latent: Option<Tensor>,
    pub micro_batch_size: usize,
    pub micro_batch_index: usize,
    pub micro_batches_per_step: usize,
    pub global_step: usize,
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

struct RawBatch {
    clean: Tensor,
    corrupted: Tensor,
    latent: Option<Tensor>,
}

fn produce(
    source: &dyn CleanSource,
    operator: &dyn ForwardOperator,
    count: usize,
) -> Result<RawBatch> {
    let clean = source.sample(count, &Device::Cpu)?;
    let corruption = operator.apply(&clean)?;
    Ok(RawBatch {
        clean,
        corrupted: corruption.corrupted,
        latent: corruption.latent,
    })
}

enum Producer {
    Inline {
        source: Arc<dyn CleanSource>,
        operator: Arc<dyn ForwardOperator>,
    },
    Prefetch {
        receiver: Option<Receiver<Result<RawBatch>>>,
        workers: Vec<JoinHandle<()>>,
    },
}

impl Drop for Producer {
    fn drop(&mut self) {
        if let Producer::Prefetch { receiver, workers } = self {
            // Workers exit on their next send once the receiver is gone.
            drop(receiver.take());
            for handle in workers.drain(..) {
                if handle.join().is_err() {
                    log::warn!("data worker panicked during shutdown");
                }
            }
        }
    }
}

/// Endless stream of corrupted micro-batches drawn from a clean source, aligned
/// with gradient accumulation. With `num_workers > 0`, batches are produced on
/// background threads into a bounded channel of `prefetch` slots.
pub struct CorruptionDataLoader {
    producer: Producer,
    device: Device,
    micro_batch_size: usize,
    micro_batches_per_step: usize,
    micro_batch_index: usize,
    global_step: usize,
}

impl CorruptionDataLoader {
    pub fn new(
        source: Arc<dyn CleanSource>,
        operator: Arc<dyn ForwardOperator>,
        device: Device,
        global_batch_size: usize,
        gradient_accumulation_steps: usize,
        num_workers: usize,
        prefetch: usize,
    ) -> Result<Self> {
        if global_batch_size == 0 {
            return Err(TrainingError::initialization(
                "global batch size must be greater than zero",
            ));
        }

        let micro_batches_per_step = gradient_accumulation_steps.max(1);
        let micro_batch_size = if global_batch_size % micro_batches_per_step == 0 {
            global_batch_size / micro_batches_per_step
        } else {
            return Err(TrainingError::initialization(
                "global batch size must be divisible by gradient accumulation steps",
            ));
        };

        let producer = if num_workers == 0 {
            Producer::Inline { source, operator }
        } else {
            let (sender, receiver) = sync_channel(prefetch.max(1));
            let mut workers = Vec::with_capacity(num_workers);
            for worker in 0..num_workers {
                let sender = sender.clone();
                let source = Arc::clone(&source);
                let operator = Arc::clone(&operator);
                let handle = std::thread::Builder::new()
                    .name(format!("data-worker-{worker}"))
                    .spawn(move || loop {
                        let batch = produce(source.as_ref(), operator.as_ref(), micro_batch_size);
                        let failed = batch.is_err();
                        if sender.send(batch).is_err() || failed {
                            break;
                        }
                    })
                    .map_err(|err| {
                        TrainingError::initialization(format!("failed to spawn data worker: {err}"))
                    })?;
                workers.push(handle);
            }
            log::info!("data loader started {num_workers} worker(s), prefetch {prefetch}");
            Producer::Prefetch {
                receiver: Some(receiver),
                workers,
            }
        };

        Ok(Self {
            producer,
            device,
            micro_batch_size,
            micro_batches_per_step,
            micro_batch_index: 0,
            global_step: 0,
        })
    }

    pub fn micro_batch_size(&self) -> usize {
        self.micro_batch_size
    }

    fn build_batch(&mut self) -> Result<Option<DataBatch>> {
        let raw = match &self.producer {
            Producer::Inline { source, operator } => {
                produce(source.as_ref(), operator.as_ref(), self.micro_batch_size)?
            }
            Producer::Prefetch { receiver, .. } => {
                let Some(receiver) = receiver else {
                    return Ok(None);
                };
                match receiver.recv() {
                    Ok(batch) => batch?,
                    Err(_) => return Ok(None),
                }
            }
        };

        let to_device = |tensor: Tensor| {
            tensor
                .to_device(&self.device)
                .map_err(|err| TrainingError::runtime(format!("failed to move batch: {err}")))
        };
        let clean = to_device(raw.clean)?;
        let corrupted = to_device(raw.corrupted)?;
        let latent = raw.latent.map(to_device).transpose()?;

        let micro_batch_index = self.micro_batch_index;
        let global_step = self.global_step;
        if micro_batch_index + 1 == self.micro_batches_per_step {
            self.micro_batch_index = 0;
            self.global_step = self.global_step.wrapping_add(1);
        } else {
            self.micro_batch_index += 1;
        }

        Ok(Some(DataBatch {
            clean,
            corrupted,
            latent,
            micro_batch_size: self.micro_batch_size,
            micro_batch_index,
            micro_batches_per_step: self.micro_batches_per_step,
            global_step,
        }))
    }
}

impl DataLoader for CorruptionDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move { self.build_batch() })
    }
}
