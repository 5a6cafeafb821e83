//! Labelled tensor containers.
//!
//! A [`map::TensorMap`] holds blocks addressed by [`labels::Labels`] keys; each
//! [`block::TensorBlock`] carries a values tensor whose axes are described by
//! sample, component and property labels, plus named gradient sub-blocks
//! (`positions`, `strain`).

pub mod block;
pub mod io;
pub mod labels;
pub mod map;
pub mod ops;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TensorMapError {
    #[error("Labels must have at least one dimension name")]
    EmptyLabelNames,

    #[error("Label entry {row} has {found} values, expected {expected}")]
    LabelWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Duplicate label entry {0:?}")]
    DuplicateLabel(Vec<i32>),

    #[error("Values shape {found:?} does not match labels shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Gradient '{0}' is already attached to this block")]
    DuplicateGradient(String),

    #[error("Gradient '{parameter}' is invalid: {reason}")]
    InvalidGradient { parameter: String, reason: String },

    #[error("Expected a single block, found {0}")]
    NotSingleBlock(usize),

    #[error("Got {keys} keys for {blocks} blocks")]
    KeyCount { keys: usize, blocks: usize },

    #[error("Cannot join tensor maps: {0}")]
    Join(String),

    #[error("Missing label dimension '{0}'")]
    MissingDimension(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed tensor map file: {0}")]
    Format(String),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}
