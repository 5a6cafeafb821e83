use super::{BatchError, SortedPairs, SystemGraph, negated, species_indices};
use crate::core::models::neighbors::NeighborList;
use crate::core::models::species::SpeciesVocabulary;
use candle_core::Tensor;
use std::collections::HashMap;

/// Fills the padded graph of one system with a hash lookup of reverse edges.
///
/// Displacements are gathered from the neighbor list tensor (with an extra
/// zero row for padding), so `x` stays differentiable with respect to the
/// system positions and cell.
pub(crate) fn build(
    list: &NeighborList,
    sorted: &SortedPairs,
    vocabulary: &SpeciesVocabulary,
    max_num_neighbors: usize,
) -> Result<SystemGraph, BatchError> {
    let n_atoms = sorted.n_atoms();
    let n_pairs = sorted.first.len();
    let n_slots = n_atoms * max_num_neighbors;
    let central_species = species_indices(&sorted.species, vocabulary)?;

    let mut nums = vec![0usize; n_atoms];
    let mut slot_of_pair = Vec::with_capacity(n_pairs);
    let mut neighbors_index = vec![0i64; n_slots];
    let mut gather = vec![n_pairs as u32; n_slots];
    for (k, (a, b)) in sorted.first.iter().zip(&sorted.second).enumerate() {
        let slot = nums[*a];
        if slot >= max_num_neighbors {
            return Err(BatchError::TooManyNeighbors {
                atom: sorted.remap.original(*a).unwrap_or(*a),
                count: slot + 1,
                max: max_num_neighbors,
            });
        }
        let flat = a * max_num_neighbors + slot;
        neighbors_index[flat] = *b as i64;
        gather[flat] = sorted.pair_ids[k] as u32;
        slot_of_pair.push(flat);
        nums[*a] += 1;
    }

    let mut first_slot: HashMap<(usize, usize, [i32; 3]), i64> = HashMap::with_capacity(n_pairs);
    for k in 0..n_pairs {
        first_slot
            .entry((sorted.first[k], sorted.second[k], sorted.shifts[k]))
            .or_insert((slot_of_pair[k] % max_num_neighbors) as i64);
    }

    let mut neighbors_pos = vec![0i64; n_slots];
    for k in 0..n_pairs {
        let reverse = (sorted.second[k], sorted.first[k], negated(sorted.shifts[k]));
        let slot = first_slot
            .get(&reverse)
            .ok_or_else(|| sorted.missing_reverse(k))?;
        neighbors_pos[slot_of_pair[k]] = *slot;
    }

    let neighbor_species = neighbors_index
        .iter()
        .map(|j| central_species[*j as usize])
        .collect();
    let mask = (0..n_slots)
        .map(|flat| flat % max_num_neighbors >= nums[flat / max_num_neighbors])
        .collect();

    let displacements = list.displacements();
    let x = if n_pairs == 0 || n_slots == 0 {
        Tensor::zeros(
            (n_atoms, max_num_neighbors, 3),
            displacements.dtype(),
            displacements.device(),
        )?
    } else {
        let padding = Tensor::zeros((1, 3), displacements.dtype(), displacements.device())?;
        let padded = Tensor::cat(&[displacements, &padding], 0)?;
        let ids = Tensor::from_vec(gather, n_slots, displacements.device())?;
        padded
            .index_select(&ids, 0)?
            .reshape((n_atoms, max_num_neighbors, 3))?
    };

    Ok(SystemGraph {
        max_num_neighbors,
        atoms: sorted.remap.unique().to_vec(),
        central_species,
        x,
        neighbor_species,
        neighbors_pos,
        neighbors_index,
        nums: nums.into_iter().map(|n| n as i64).collect(),
        mask,
    })
}
