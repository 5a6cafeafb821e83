//! Conversion of neighbor lists into padded, batched graph tensors.
//!
//! Each system is first remapped onto a dense atom range ([`remap`]) and its
//! pairs are grouped by centre atom with a stable sort. A per-system
//! [`SystemGraph`] is then filled either by the vectorised [`fast`] path or by
//! the explicit-loop [`reference`] path, and [`collate`] concatenates the
//! graphs of a batch into one [`GraphBatch`].

pub mod collate;
pub mod fast;
pub mod reference;
pub mod remap;

use crate::core::models::neighbors::{NeighborList, NeighborListOptions};
use crate::core::models::species::SpeciesVocabulary;
use crate::core::models::system::System;
use crate::core::tensor::labels::Labels;
use candle_core::Tensor;
use remap::IndexRemap;
use thiserror::Error;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

pub use collate::{GraphBatch, collate};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("System {system} has no neighbor list for cutoff {cutoff} (full list: {full_list})")]
    MissingNeighborList {
        system: usize,
        cutoff: f64,
        full_list: bool,
    },

    #[error("Half neighbor lists cannot be batched; request a full list")]
    HalfNeighborList,

    #[error("Atomic species {0} is not part of the model's species vocabulary")]
    UnknownSpecies(i32),

    #[error("Index {index} is outside the remapping table of size {size}")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("Atom {atom} has {count} neighbors, more than the batch maximum of {max}")]
    TooManyNeighbors { atom: usize, count: usize, max: usize },

    #[error("Pair {first} -> {second} with shift {shift:?} has no reverse edge in the neighbor list")]
    MissingReverseEdge {
        first: usize,
        second: usize,
        shift: [i32; 3],
    },

    #[error("Graphs have different neighbor widths: {expected} and {found}")]
    WidthMismatch { expected: usize, found: usize },

    #[error("Cannot collate an empty list of graphs")]
    EmptyBatch,

    #[error("Invalid atom selection: {0}")]
    Selection(String),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Which implementation fills the per-system graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchStrategy {
    /// Hash lookup of reverse edges and a differentiable gather of the
    /// displacements.
    #[default]
    Fast,
    /// Explicit per-atom loops on host copies; displacements are not tracked
    /// by autograd.
    Reference,
}

/// Padded neighbor arrays of one system, row-major over
/// `(n_atoms, max_num_neighbors)`.
///
/// Atoms are numbered densely in the order of `atoms`, which holds the
/// original index of every atom in the system.
#[derive(Debug, Clone)]
pub struct SystemGraph {
    pub max_num_neighbors: usize,
    pub atoms: Vec<usize>,
    pub central_species: Vec<i64>,
    pub x: Tensor,
    pub neighbor_species: Vec<i64>,
    pub neighbors_pos: Vec<i64>,
    pub neighbors_index: Vec<i64>,
    pub nums: Vec<i64>,
    pub mask: Vec<bool>,
}

impl SystemGraph {
    pub fn n_atoms(&self) -> usize {
        self.central_species.len()
    }
}

/// Pairs of one system remapped to dense indices and grouped by centre atom.
pub(crate) struct SortedPairs {
    pub remap: IndexRemap,
    pub species: Vec<i32>,
    pub first: Vec<usize>,
    pub second: Vec<usize>,
    pub shifts: Vec<[i32; 3]>,
    pub pair_ids: Vec<usize>,
}

impl SortedPairs {
    pub(crate) fn new(
        system: &System,
        list: &NeighborList,
        selected: &[usize],
    ) -> Result<Self, BatchError> {
        if let Some(atom) = selected.iter().find(|a| **a >= system.len()) {
            return Err(BatchError::Selection(format!(
                "atom {atom} does not exist in a system of {} atoms",
                system.len()
            )));
        }
        let pairs = list.pairs();
        let remap = IndexRemap::new(selected, pairs.iter().map(|p| p.first));

        let mut pair_ids: Vec<usize> = (0..pairs.len()).collect();
        pair_ids.sort_by_key(|p| pairs[*p].first);

        let mut first = Vec::with_capacity(pairs.len());
        let mut second = Vec::with_capacity(pairs.len());
        let mut shifts = Vec::with_capacity(pairs.len());
        for p in &pair_ids {
            first.push(remap.remap(pairs[*p].first)?);
            second.push(remap.remap(pairs[*p].second)?);
            shifts.push(pairs[*p].shift);
        }

        let species = remap
            .unique()
            .iter()
            .map(|a| {
                system
                    .types()
                    .get(*a)
                    .copied()
                    .ok_or(BatchError::IndexOutOfRange {
                        index: *a,
                        size: system.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            remap,
            species,
            first,
            second,
            shifts,
            pair_ids,
        })
    }

    pub(crate) fn n_atoms(&self) -> usize {
        self.remap.len()
    }

    pub(crate) fn missing_reverse(&self, pair: usize) -> BatchError {
        BatchError::MissingReverseEdge {
            first: self.remap.original(self.first[pair]).unwrap_or(self.first[pair]),
            second: self
                .remap
                .original(self.second[pair])
                .unwrap_or(self.second[pair]),
            shift: self.shifts[pair],
        }
    }
}

pub(crate) fn negated(shift: [i32; 3]) -> [i32; 3] {
    [-shift[0], -shift[1], -shift[2]]
}

pub(crate) fn species_indices(
    species: &[i32],
    vocabulary: &SpeciesVocabulary,
) -> Result<Vec<i64>, BatchError> {
    species
        .iter()
        .map(|s| {
            vocabulary
                .index_of(*s)
                .map(|i| i as i64)
                .ok_or(BatchError::UnknownSpecies(*s))
        })
        .collect()
}

fn neighbor_list<'a>(
    system: &'a System,
    index: usize,
    options: &NeighborListOptions,
) -> Result<&'a NeighborList, BatchError> {
    system
        .get_neighbor_list(options)
        .ok_or(BatchError::MissingNeighborList {
            system: index,
            cutoff: options.cutoff(),
            full_list: options.full_list(),
        })
}

/// Largest number of neighbors of any centre atom across `systems`, or zero
/// when no system has any pair.
pub fn get_max_num_neighbors(
    systems: &[System],
    options: &NeighborListOptions,
) -> Result<usize, BatchError> {
    let mut max = 0;
    for (index, system) in systems.iter().enumerate() {
        let list = neighbor_list(system, index, options)?;
        let size = list.pairs().iter().map(|p| p.first + 1).max().unwrap_or(0);
        let mut counts = vec![0usize; size];
        for pair in list.pairs() {
            counts[pair.first] += 1;
        }
        max = max.max(counts.into_iter().max().unwrap_or(0));
    }
    Ok(max)
}

/// Builds the padded graph of a single system.
pub fn system_to_graph(
    system: &System,
    list: &NeighborList,
    selected: &[usize],
    vocabulary: &SpeciesVocabulary,
    max_num_neighbors: usize,
    strategy: BatchStrategy,
) -> Result<SystemGraph, BatchError> {
    let sorted = SortedPairs::new(system, list, selected)?;
    match strategy {
        BatchStrategy::Fast => fast::build(list, &sorted, vocabulary, max_num_neighbors),
        BatchStrategy::Reference => {
            reference::build(list, &sorted, vocabulary, max_num_neighbors)
        }
    }
}

fn selections(
    systems: &[System],
    selected_atoms: Option<&Labels>,
) -> Result<Vec<Vec<usize>>, BatchError> {
    let Some(labels) = selected_atoms else {
        return Ok(systems.iter().map(|s| (0..s.len()).collect()).collect());
    };
    let column = |name: &str| {
        labels
            .column(name)
            .map_err(|e| BatchError::Selection(e.to_string()))
    };
    let (system_ids, atom_ids) = (column("system")?, column("atom")?);

    let mut selections = vec![Vec::new(); systems.len()];
    for (system, atom) in system_ids.into_iter().zip(atom_ids) {
        let slot = usize::try_from(system)
            .ok()
            .and_then(|s| selections.get_mut(s))
            .ok_or_else(|| BatchError::Selection(format!("system {system} is not in the batch")))?;
        let atom = usize::try_from(atom)
            .map_err(|_| BatchError::Selection(format!("negative atom index {atom}")))?;
        slot.push(atom);
    }
    Ok(selections)
}

/// Converts a list of systems into one batched graph.
///
/// Every system must carry a full neighbor list for `options`. With
/// `selected_atoms` (labels with `system` and `atom` dimensions) only the
/// selected atoms and the centre atoms of the neighbor list take part.
///
/// # Errors
///
/// Returns [`BatchError::HalfNeighborList`] for half-list options, and
/// propagates missing lists, unknown species and reverse-edge failures.
pub fn systems_to_batch(
    systems: &[System],
    options: &NeighborListOptions,
    vocabulary: &SpeciesVocabulary,
    selected_atoms: Option<&Labels>,
    strategy: BatchStrategy,
) -> Result<GraphBatch, BatchError> {
    if !options.full_list() {
        return Err(BatchError::HalfNeighborList);
    }
    let max_num_neighbors = get_max_num_neighbors(systems, options)?;
    let selections = selections(systems, selected_atoms)?;
    debug!(
        systems = systems.len(),
        max_num_neighbors, "Building batched neighbor graph"
    );

    let jobs: Vec<(usize, &System)> = systems.iter().enumerate().collect();

    #[cfg(not(feature = "parallel"))]
    let iterator = jobs.into_iter();

    #[cfg(feature = "parallel")]
    let iterator = jobs.into_par_iter();

    let graphs = iterator
        .map(|(index, system)| {
            let list = neighbor_list(system, index, options)?;
            system_to_graph(
                system,
                list,
                &selections[index],
                vocabulary,
                max_num_neighbors,
                strategy,
            )
        })
        .collect::<Result<Vec<_>, BatchError>>()?;

    collate(&graphs)
}
