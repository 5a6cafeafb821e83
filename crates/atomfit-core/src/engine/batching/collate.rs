use super::{BatchError, SystemGraph};
use candle_core::{Device, Tensor};

/// Padded neighbor tensors of a whole batch.
///
/// Integer arrays are `I64` tensors, `mask` is `U8` with `1` for padded
/// slots, and `x` keeps the dtype and autograd history of the displacements.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    pub central_species: Tensor,
    pub x: Tensor,
    pub neighbor_species: Tensor,
    pub neighbors_pos: Tensor,
    pub neighbors_index: Tensor,
    pub nums: Tensor,
    pub mask: Tensor,
    pub batch: Tensor,
    /// `(system, original atom index)` of every atom, in batch order.
    pub atoms: Vec<(usize, usize)>,
    pub n_systems: usize,
    pub max_num_neighbors: usize,
}

impl GraphBatch {
    pub fn n_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn device(&self) -> &Device {
        self.x.device()
    }
}

/// Concatenates per-system graphs along the atom axis.
///
/// `neighbors_index` values point into the atom axis and are shifted by the
/// number of atoms of the preceding systems; slot pointers
/// (`neighbors_pos`) and plain values are copied unchanged.
pub fn collate(graphs: &[SystemGraph]) -> Result<GraphBatch, BatchError> {
    let first = graphs.first().ok_or(BatchError::EmptyBatch)?;
    let width = first.max_num_neighbors;
    if let Some(other) = graphs.iter().find(|g| g.max_num_neighbors != width) {
        return Err(BatchError::WidthMismatch {
            expected: width,
            found: other.max_num_neighbors,
        });
    }

    let n_atoms: usize = graphs.iter().map(SystemGraph::n_atoms).sum();
    let n_slots = n_atoms * width;
    let mut central_species = Vec::with_capacity(n_atoms);
    let mut neighbor_species = Vec::with_capacity(n_slots);
    let mut neighbors_pos = Vec::with_capacity(n_slots);
    let mut neighbors_index = Vec::with_capacity(n_slots);
    let mut nums = Vec::with_capacity(n_atoms);
    let mut mask = Vec::with_capacity(n_slots);
    let mut batch = Vec::with_capacity(n_atoms);
    let mut atoms = Vec::with_capacity(n_atoms);

    let mut offset = 0i64;
    for (system, graph) in graphs.iter().enumerate() {
        central_species.extend_from_slice(&graph.central_species);
        neighbor_species.extend_from_slice(&graph.neighbor_species);
        neighbors_pos.extend_from_slice(&graph.neighbors_pos);
        neighbors_index.extend(graph.neighbors_index.iter().map(|j| j + offset));
        nums.extend_from_slice(&graph.nums);
        mask.extend(graph.mask.iter().map(|m| u8::from(*m)));
        batch.extend(std::iter::repeat_n(system as i64, graph.n_atoms()));
        atoms.extend(graph.atoms.iter().map(|a| (system, *a)));
        offset += graph.n_atoms() as i64;
    }

    let device = first.x.device();
    let pieces: Vec<&Tensor> = graphs
        .iter()
        .filter(|g| g.n_atoms() > 0)
        .map(|g| &g.x)
        .collect();
    let x = if n_slots == 0 || pieces.is_empty() {
        Tensor::zeros((n_atoms, width, 3), first.x.dtype(), device)?
    } else {
        Tensor::cat(&pieces, 0)?
    };

    Ok(GraphBatch {
        central_species: Tensor::from_vec(central_species, n_atoms, device)?,
        x,
        neighbor_species: Tensor::from_vec(neighbor_species, (n_atoms, width), device)?,
        neighbors_pos: Tensor::from_vec(neighbors_pos, (n_atoms, width), device)?,
        neighbors_index: Tensor::from_vec(neighbors_index, (n_atoms, width), device)?,
        nums: Tensor::from_vec(nums, n_atoms, device)?,
        mask: Tensor::from_vec(mask, (n_atoms, width), device)?,
        batch: Tensor::from_vec(batch, n_atoms, device)?,
        atoms,
        n_systems: graphs.len(),
        max_num_neighbors: width,
    })
}

#[cfg(test)]
mod tests {
    use super::super::{BatchStrategy, systems_to_batch};
    use super::*;
    use crate::core::models::neighbors::NeighborListOptions;
    use crate::core::models::species::SpeciesVocabulary;
    use crate::core::models::system::System;

    fn molecule(n_atoms: usize) -> System {
        let positions: Vec<[f64; 3]> = (0..n_atoms)
            .map(|i| [0.9 * i as f64, 0.1 * (i % 2) as f64, 0.0])
            .collect();
        let types = (0..n_atoms).map(|i| if i % 3 == 0 { 8 } else { 1 }).collect();
        let mut system = System::from_coordinates(&positions, types, None, &Device::Cpu).unwrap();
        system
            .attach_neighbor_list(NeighborListOptions::new(2.0, true))
            .unwrap();
        system
    }

    fn batch_of(sizes: &[usize]) -> GraphBatch {
        let systems: Vec<System> = sizes.iter().map(|n| molecule(*n)).collect();
        systems_to_batch(
            &systems,
            &NeighborListOptions::new(2.0, true),
            &SpeciesVocabulary::new([1, 8]),
            None,
            BatchStrategy::Fast,
        )
        .unwrap()
    }

    #[test]
    fn batch_vector_marks_system_of_every_atom() {
        let batch = batch_of(&[1, 3, 6]);

        assert_eq!(batch.n_atoms(), 10);
        assert_eq!(
            batch.batch.to_vec1::<i64>().unwrap(),
            vec![0, 1, 1, 1, 2, 2, 2, 2, 2, 2]
        );
    }

    #[test]
    fn neighbor_indices_are_offset_but_slot_pointers_are_not() {
        let systems = [molecule(3), molecule(4)];
        let options = NeighborListOptions::new(2.0, true);
        let vocabulary = SpeciesVocabulary::new([1, 8]);
        let single: Vec<GraphBatch> = systems
            .iter()
            .map(|s| {
                systems_to_batch(
                    std::slice::from_ref(s),
                    &options,
                    &vocabulary,
                    None,
                    BatchStrategy::Fast,
                )
                .unwrap()
            })
            .collect();
        let joint = systems_to_batch(&systems, &options, &vocabulary, None, BatchStrategy::Fast)
            .unwrap();

        let width = joint.max_num_neighbors;
        assert_eq!(width, single[1].max_num_neighbors);
        let index = joint.neighbors_index.to_vec2::<i64>().unwrap();
        let pos = joint.neighbors_pos.to_vec2::<i64>().unwrap();
        let second_index = single[1].neighbors_index.to_vec2::<i64>().unwrap();
        let second_pos = single[1].neighbors_pos.to_vec2::<i64>().unwrap();
        for atom in 0..4 {
            let row: Vec<i64> = second_index[atom].iter().map(|j| j + 3).collect();
            assert_eq!(index[3 + atom], row);
            assert_eq!(pos[3 + atom], second_pos[atom]);
        }
    }

    #[test]
    fn empty_graph_list_is_rejected() {
        assert!(matches!(collate(&[]), Err(BatchError::EmptyBatch)));
    }
}
