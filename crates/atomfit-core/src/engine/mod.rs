//! # Engine Module
//!
//! The stateful machinery between raw structures and a trained model: batching of
//! neighbor lists into padded graphs, gradient-aware evaluation, data loading, losses,
//! metrics and the training-loop building blocks.
//!
//! ## Architecture
//!
//! - **Batching** ([`batching`]) - Index remapping, per-system graphs (fast and reference
//!   paths) and collation into a [`batching::GraphBatch`]
//! - **Evaluation** ([`evaluate`], [`model`]) - The [`model::AtomisticModel`] seam, exported
//!   models, and evaluation with positions and strain gradients
//! - **Data** ([`data`], [`composition`]) - Dataset checks, splits, sharded batch loading
//!   and per-species composition weights
//! - **Optimization** ([`loss`], [`metrics`], [`scheduler`]) - Weighted losses, RMSE
//!   accumulation and the plateau learning-rate schedule
//! - **Runtime** ([`config`], [`device`], [`distributed`], [`progress`], [`error`]) -
//!   Hyperparameters, device selection, data-parallel collectives, progress events and errors

pub mod batching;
pub mod composition;
pub mod config;
pub mod data;
pub mod device;
pub mod distributed;
pub mod error;
pub mod evaluate;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod scheduler;
