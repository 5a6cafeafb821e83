//! File formats: TOML datasets and safetensors model checkpoints.

pub mod checkpoint;
pub mod dataset;
pub mod elements;
