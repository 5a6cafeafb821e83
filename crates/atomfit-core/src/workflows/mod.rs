//! # Workflows Module
//!
//! High-level entry points that tie datasets, models and the engine
//! together into complete procedures.
//!
//! ## Architecture
//!
//! - **Training** ([`train`]) - Composition weights, sharded batching, the
//!   optimizer and scheduler loop, checkpoints and early stopping.
//! - **Evaluation** ([`eval`]) - Batched predictions of an exported model
//!   over a dataset, with RMSEs against the dataset targets.
//! - **Export** ([`export`]) - Freezing a trained model into a deployable
//!   file.
//!
//! Every workflow reports its phases through a
//! [`ProgressReporter`](crate::engine::progress::ProgressReporter).

pub mod eval;
pub mod export;
pub mod train;
