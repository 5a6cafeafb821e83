use super::system::{System, SystemError};
use crate::core::tensor::TensorMapError;
use crate::core::tensor::map::TensorMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read dataset '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse dataset '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Unknown chemical element '{0}'")]
    UnknownElement(String),

    #[error("Structure {index} is invalid: {reason}")]
    InvalidStructure { index: usize, reason: String },

    #[error("Target '{0}' is not among the model's outputs")]
    IncompatibleTarget(String),

    #[error("Atomic type {0} is not supported by the model")]
    IncompatibleSpecies(i32),

    #[error("Sample {sample} has no target '{target}'")]
    MissingTarget { sample: usize, target: String },

    #[error("Invalid dataset split: {0}")]
    InvalidSplit(String),

    #[error("Invalid system: {0}")]
    System(#[from] SystemError),

    #[error("Tensor map error: {0}")]
    TensorMap(#[from] TensorMapError),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// One structure and its reference targets.
#[derive(Debug, Clone)]
pub struct Sample {
    pub system: System,
    pub targets: BTreeMap<String, TensorMap>,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    /// A new dataset holding the samples at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Dataset {
        Dataset {
            samples: indices
                .iter()
                .filter_map(|i| self.samples.get(*i).cloned())
                .collect(),
        }
    }
}
