//! # Core Module
//!
//! Stateless data models and I/O shared by the batching pipeline, the
//! evaluation engine and the training workflows.
//!
//! - **Structures** ([`models`]) - systems, neighbor lists and the species vocabulary
//! - **Labelled tensors** ([`tensor`]) - tensor maps with gradient blocks and TOML persistence
//! - **Capabilities** ([`capabilities`]) - declared model and dataset outputs and their merge
//! - **File I/O** ([`io`]) - dataset files and model checkpoints

pub mod capabilities;
pub mod io;
pub mod models;
pub mod tensor;
