use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{corruption::lock, CleanSource, DataError, Result};

struct Cursor {
    order: Vec<u32>,
    position: usize,
    epoch: usize,
    rng: StdRng,
}

impl Cursor {
    fn next_indices(&mut self, count: usize) -> Vec<u32> {
        let mut indices = Vec::with_capacity(count);
        while indices.len() < count {
            if self.position == self.order.len() {
                self.order.shuffle(&mut self.rng);
                self.position = 0;
                self.epoch += 1;
                log::debug!("dataset epoch {} started", self.epoch);
            }
            let take = (count - indices.len()).min(self.order.len() - self.position);
            indices.extend_from_slice(&self.order[self.position..self.position + take]);
            self.position += take;
        }
        indices
    }
}

/// Clean examples stored as one tensor in a safetensors file, with the leading
/// dimension indexing examples. Batches walk a reshuffled permutation and wrap
/// around indefinitely.
pub struct TensorDataset {
    path: PathBuf,
    key: String,
    examples: Tensor,
    cursor: Mutex<Cursor>,
}

impl TensorDataset {
    pub fn open(path: impl AsRef<Path>, key: &str, seed: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(DataError::MissingDataset(path));
        }
        let mut tensors = candle_core::safetensors::load(&path, &Device::Cpu)?;
        let examples = tensors.remove(key).ok_or_else(|| {
            DataError::Dataset(format!("'{}' has no tensor named '{key}'", path.display()))
        })?;
        Self::from_tensor(examples, seed).map(|mut dataset| {
            dataset.path = path;
            dataset.key = key.to_string();
            dataset
        })
    }

    pub fn from_tensor(examples: Tensor, seed: u64) -> Result<Self> {
        if examples.rank() < 2 {
            return Err(DataError::Dataset(format!(
                "expected at least two dimensions (examples, features...), got {:?}",
                examples.dims()
            )));
        }
        let len = examples.dim(0)?;
        if len == 0 {
            return Err(DataError::Dataset("dataset has no examples".to_string()));
        }
        let examples = examples.to_dtype(DType::F32)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<u32> = (0..len as u32).collect();
        order.shuffle(&mut rng);
        log::info!("loaded {} examples of shape {:?}", len, &examples.dims()[1..]);

        Ok(Self {
            path: PathBuf::new(),
            key: String::new(),
            examples,
            cursor: Mutex::new(Cursor {
                order,
                position: 0,
                epoch: 0,
                rng,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.examples.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completed passes over the data.
    pub fn epoch(&self) -> usize {
        lock(&self.cursor).epoch
    }
}

impl CleanSource for TensorDataset {
    fn name(&self) -> String {
        match self.path.file_stem() {
            Some(stem) => format!("{}:{}", stem.to_string_lossy(), self.key),
            None => "tensor".to_string(),
        }
    }

    fn feature_shape(&self) -> Vec<usize> {
        self.examples.dims()[1..].to_vec()
    }

    fn sample(&self, count: usize, device: &Device) -> Result<Tensor> {
        let indices = lock(&self.cursor).next_indices(count);
        let indices = Tensor::from_vec(indices, count, &Device::Cpu)?;
        Ok(self.examples.index_select(&indices, 0)?.to_device(device)?)
    }
}
