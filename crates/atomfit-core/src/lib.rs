//! # atomfit Core Library
//!
//! Training and evaluation of machine-learned interatomic potentials on
//! batched neighbor graphs.
//!
//! ## Architectural Philosophy
//!
//! The library is organized in layers with a clear separation of concerns.
//!
//! - **[`core`]: The Foundation.** Stateless data models (`System`, neighbor
//!   lists, species vocabularies), labelled tensor maps, capability
//!   declarations and file formats.
//!
//! - **[`engine`]: The Logic Core.** Neighbor-graph batching, the
//!   gradient-aware evaluator, losses, metrics, data loading, the learning
//!   rate scheduler and the collectives used by data-parallel training.
//!
//! - **[`architectures`]: The Models.** Trainable model architectures and
//!   their checkpoint persistence.
//!
//! - **[`workflows`]: The Public API.** Complete training, evaluation and
//!   export procedures built on the layers above.

pub mod architectures;
pub mod core;
pub mod engine;
pub mod workflows;
