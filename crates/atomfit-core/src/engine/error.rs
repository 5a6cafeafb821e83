use super::batching::BatchError;
use super::config::ConfigError;
use super::distributed::DistributedError;
use super::model::ModelError;
use crate::core::capabilities::CapabilityError;
use crate::core::io::checkpoint::CheckpointError;
use crate::core::models::dataset::DatasetError;
use crate::core::models::neighbors::NeighborError;
use crate::core::models::system::SystemError;
use crate::core::tensor::TensorMapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Requested target '{0}' is not among the model outputs")]
    MissingOutput(String),

    #[error("Strain gradients need a non-zero cell, but systems {0:?} are not periodic")]
    NonPeriodicStrain(Vec<usize>),

    #[error("Batching failed: {0}")]
    Batch(#[from] BatchError),

    #[error("Capability mismatch: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Tensor map error: {0}")]
    TensorMap(#[from] TensorMapError),

    #[error("Invalid system: {0}")]
    System(#[from] SystemError),

    #[error("Neighbor list error: {0}")]
    Neighbors(#[from] NeighborError),

    #[error("Model evaluation failed: {0}")]
    Model(#[from] ModelError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Distributed collective failed: {0}")]
    Distributed(#[from] DistributedError),

    #[error("Composition weights for '{target}' could not be computed: {reason}")]
    Composition { target: String, reason: String },

    #[error("Failed to write metric history '{path}': {source}")]
    History {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Internal logic error: {0}")]
    Internal(String),
}
