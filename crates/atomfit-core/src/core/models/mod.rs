//! Atomic structure models shared by every layer of the crate.
//!
//! A [`system::System`] holds positions, atom types and a cell as tensors, together
//! with any number of cached [`neighbors::NeighborList`]s keyed by their options.
//! The [`species::SpeciesVocabulary`] maps atomic types to contiguous positions used
//! for per-species parameter arrays, and [`dataset::Dataset`] pairs systems with
//! their reference targets.

pub mod dataset;
pub mod neighbors;
pub mod species;
pub mod system;
