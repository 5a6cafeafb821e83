use super::{BatchError, SortedPairs, SystemGraph, negated, species_indices};
use crate::core::models::neighbors::NeighborList;
use crate::core::models::species::SpeciesVocabulary;
use candle_core::Tensor;

/// Fills the padded graph of one system with explicit per-atom loops.
///
/// Produces the same arrays as the fast path. `x` is built from a host copy
/// of the displacements and carries no autograd history.
pub(crate) fn build(
    list: &NeighborList,
    sorted: &SortedPairs,
    vocabulary: &SpeciesVocabulary,
    max_num_neighbors: usize,
) -> Result<SystemGraph, BatchError> {
    let n_atoms = sorted.n_atoms();
    let width = max_num_neighbors;

    let mut central_species = Vec::with_capacity(n_atoms);
    for species in &sorted.species {
        central_species.extend(species_indices(&[*species], vocabulary)?);
    }

    let mut nums = vec![0usize; n_atoms];
    for a in &sorted.first {
        nums[*a] += 1;
    }
    if let Some(atom) = (0..n_atoms).find(|a| nums[*a] > width) {
        return Err(BatchError::TooManyNeighbors {
            atom: sorted.remap.original(atom).unwrap_or(atom),
            count: nums[atom],
            max: width,
        });
    }
    let mut offsets = vec![0usize; n_atoms];
    for a in 1..n_atoms {
        offsets[a] = offsets[a - 1] + nums[a - 1];
    }

    let displacements = list.displacements().to_vec2::<f64>()?;
    let mut neighbors_index = vec![vec![0i64; width]; n_atoms];
    let mut shifts = vec![vec![[0i32; 3]; width]; n_atoms];
    let mut x = vec![0.0; n_atoms * width * 3];
    for a in 0..n_atoms {
        for k in 0..nums[a] {
            let p = offsets[a] + k;
            neighbors_index[a][k] = sorted.second[p] as i64;
            shifts[a][k] = sorted.shifts[p];
            let start = (a * width + k) * 3;
            x[start..start + 3].copy_from_slice(&displacements[sorted.pair_ids[p]]);
        }
    }

    let mut neighbors_pos = vec![vec![0i64; width]; n_atoms];
    for j in 0..n_atoms {
        for k in 0..nums[j] {
            let neighbor = neighbors_index[j][k] as usize;
            let target = negated(shifts[j][k]);
            let mut found = None;
            for m in 0..nums[neighbor] {
                if neighbors_index[neighbor][m] == j as i64 && shifts[neighbor][m] == target {
                    found = Some(m);
                    break;
                }
            }
            match found {
                Some(m) => neighbors_pos[j][k] = m as i64,
                None => return Err(sorted.missing_reverse(offsets[j] + k)),
            }
        }
    }

    let mut neighbor_species = Vec::with_capacity(n_atoms * width);
    let mut mask = Vec::with_capacity(n_atoms * width);
    for a in 0..n_atoms {
        for k in 0..width {
            neighbor_species.push(central_species[neighbors_index[a][k] as usize]);
            mask.push(k >= nums[a]);
        }
    }

    let device = list.displacements().device();
    Ok(SystemGraph {
        max_num_neighbors,
        atoms: sorted.remap.unique().to_vec(),
        central_species,
        x: Tensor::from_vec(x, (n_atoms, width, 3), device)?,
        neighbor_species,
        neighbors_pos: neighbors_pos.into_iter().flatten().collect(),
        neighbors_index: neighbors_index.into_iter().flatten().collect(),
        nums: nums.into_iter().map(|n| n as i64).collect(),
        mask,
    })
}

#[cfg(test)]
mod tests {
    use super::super::{BatchStrategy, system_to_graph, systems_to_batch};
    use super::*;
    use crate::core::models::neighbors::{NeighborListOptions, NeighborPair};
    use crate::core::models::system::System;
    use candle_core::Device;

    const TOLERANCE: f64 = 1e-12;

    fn periodic_system() -> System {
        let mut system = System::from_coordinates(
            &[[0.0, 0.0, 0.0], [1.1, 0.2, 0.1], [0.3, 1.4, 0.9], [2.2, 2.0, 1.6]],
            vec![8, 1, 1, 6],
            Some([[3.0, 0.0, 0.0], [0.0, 3.2, 0.0], [0.4, 0.0, 2.9]]),
            &Device::Cpu,
        )
        .unwrap();
        system
            .attach_neighbor_list(NeighborListOptions::new(2.4, true))
            .unwrap();
        system
    }

    fn vocabulary() -> SpeciesVocabulary {
        SpeciesVocabulary::new([1, 6, 8])
    }

    fn both_graphs(system: &System) -> (SystemGraph, SystemGraph) {
        let options = NeighborListOptions::new(2.4, true);
        let list = system.get_neighbor_list(&options).unwrap();
        let max = super::super::get_max_num_neighbors(std::slice::from_ref(system), &options)
            .unwrap();
        let selected: Vec<usize> = (0..system.len()).collect();
        let fast = system_to_graph(
            system,
            list,
            &selected,
            &vocabulary(),
            max,
            BatchStrategy::Fast,
        )
        .unwrap();
        let reference = system_to_graph(
            system,
            list,
            &selected,
            &vocabulary(),
            max,
            BatchStrategy::Reference,
        )
        .unwrap();
        (fast, reference)
    }

    #[test]
    fn fast_and_reference_paths_agree() {
        let (fast, reference) = both_graphs(&periodic_system());

        assert_eq!(fast.central_species, reference.central_species);
        assert_eq!(fast.neighbor_species, reference.neighbor_species);
        assert_eq!(fast.mask, reference.mask);
        assert_eq!(fast.nums, reference.nums);
        assert_eq!(fast.neighbors_index, reference.neighbors_index);
        assert_eq!(fast.neighbors_pos, reference.neighbors_pos);

        let a = fast.x.flatten_all().unwrap().to_vec1::<f64>().unwrap();
        let b = reference.x.flatten_all().unwrap().to_vec1::<f64>().unwrap();
        assert_eq!(a.len(), b.len());
        for (u, v) in a.iter().zip(&b) {
            assert!((u - v).abs() < TOLERANCE);
        }
    }

    #[test]
    fn reverse_edge_points_back_with_opposite_shift() {
        let system = periodic_system();
        let (graph, _) = both_graphs(&system);
        let width = graph.max_num_neighbors;
        let x = graph.x.to_vec3::<f64>().unwrap();

        for i in 0..graph.n_atoms() {
            for k in 0..graph.nums[i] as usize {
                let j = graph.neighbors_index[i * width + k] as usize;
                let m = graph.neighbors_pos[i * width + k] as usize;
                assert_eq!(graph.neighbors_index[j * width + m], i as i64);
                for c in 0..3 {
                    assert!((x[j][m][c] + x[i][k][c]).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn padding_follows_convention() {
        let (graph, _) = both_graphs(&periodic_system());
        let width = graph.max_num_neighbors;

        for i in 0..graph.n_atoms() {
            for k in graph.nums[i] as usize..width {
                let flat = i * width + k;
                assert!(graph.mask[flat]);
                assert_eq!(graph.neighbors_index[flat], 0);
                assert_eq!(graph.neighbors_pos[flat], 0);
                assert_eq!(graph.neighbor_species[flat], graph.central_species[0]);
            }
        }
    }

    #[test]
    fn unknown_species_is_reported() {
        let system = periodic_system();
        let options = NeighborListOptions::new(2.4, true);
        let result = systems_to_batch(
            &[system],
            &options,
            &SpeciesVocabulary::new([1, 8]),
            None,
            BatchStrategy::Reference,
        );
        assert!(matches!(result, Err(BatchError::UnknownSpecies(6))));
    }

    #[test]
    fn half_list_is_rejected() {
        let options = NeighborListOptions::new(2.4, false);
        let result = systems_to_batch(
            &[periodic_system()],
            &options,
            &vocabulary(),
            None,
            BatchStrategy::Fast,
        );
        assert!(matches!(result, Err(BatchError::HalfNeighborList)));
    }

    #[test]
    fn missing_reverse_edge_is_a_consistency_error() {
        let mut system =
            System::from_coordinates(&[[0.0; 3], [1.0, 0.0, 0.0]], vec![1, 1], None, &Device::Cpu)
                .unwrap();
        let options = NeighborListOptions::new(2.0, true);
        let pairs = vec![
            NeighborPair::new(0, 1, [0, 0, 0]),
            NeighborPair::new(1, 0, [1, 0, 0]),
        ];
        let displacements =
            Tensor::from_vec(vec![1.0, 0.0, 0.0, -1.0, 0.0, 0.0], (2, 3), &Device::Cpu).unwrap();
        system
            .add_neighbor_list(options, NeighborList::new(pairs, displacements).unwrap())
            .unwrap();

        for strategy in [BatchStrategy::Fast, BatchStrategy::Reference] {
            let result = systems_to_batch(
                std::slice::from_ref(&system),
                &options,
                &SpeciesVocabulary::new([1]),
                None,
                strategy,
            );
            assert!(matches!(
                result,
                Err(BatchError::MissingReverseEdge {
                    first: 0,
                    second: 1,
                    ..
                })
            ));
        }
    }

    fn graphs_for(
        system: &System,
        options: &NeighborListOptions,
        selected: &[usize],
        vocabulary: &SpeciesVocabulary,
    ) -> (SystemGraph, SystemGraph) {
        let list = system.get_neighbor_list(options).unwrap();
        let max =
            super::super::get_max_num_neighbors(std::slice::from_ref(system), options).unwrap();
        let build = |strategy| {
            system_to_graph(system, list, selected, vocabulary, max, strategy).unwrap()
        };
        (build(BatchStrategy::Fast), build(BatchStrategy::Reference))
    }

    #[test]
    fn cutoff_longer_than_the_cell_uses_several_images() {
        let options = NeighborListOptions::new(2.4, true);
        let mut system = System::from_coordinates(
            &[[0.1, 0.2, 0.3], [0.8, 0.7, 0.9]],
            vec![1, 8],
            Some([[1.5, 0.0, 0.0], [0.0, 1.6, 0.0], [0.2, 0.0, 1.7]]),
            &Device::Cpu,
        )
        .unwrap();
        system.attach_neighbor_list(options).unwrap();
        let (fast, reference) = graphs_for(&system, &options, &[0, 1], &vocabulary());

        assert_eq!(fast.neighbors_index, reference.neighbors_index);
        assert_eq!(fast.neighbors_pos, reference.neighbors_pos);
        assert_eq!(fast.nums, reference.nums);
        assert_eq!(fast.mask, reference.mask);
        let a = fast.x.flatten_all().unwrap().to_vec1::<f64>().unwrap();
        let b = reference.x.flatten_all().unwrap().to_vec1::<f64>().unwrap();
        for (u, v) in a.iter().zip(&b) {
            assert!((u - v).abs() < TOLERANCE);
        }

        let graph = fast;
        let width = graph.max_num_neighbors;
        let x = graph.x.to_vec3::<f64>().unwrap();
        let mut self_images = 0;
        for i in 0..graph.n_atoms() {
            // Every atom sees more periodic copies than there are atoms.
            assert!(graph.nums[i] as usize > graph.n_atoms());
            for k in 0..graph.nums[i] as usize {
                let j = graph.neighbors_index[i * width + k] as usize;
                let m = graph.neighbors_pos[i * width + k] as usize;
                if i == j {
                    self_images += 1;
                    assert_ne!(m, k);
                }
                assert_eq!(graph.neighbors_index[j * width + m], i as i64);
                for c in 0..3 {
                    assert!((x[j][m][c] + x[i][k][c]).abs() < 1e-9);
                }
            }
        }
        assert!(self_images > 0);
    }

    #[test]
    fn sparse_selection_is_renumbered_densely() {
        let options = NeighborListOptions::new(2.0, true);
        let mut system = System::from_coordinates(
            &[[0.0; 3], [5.0, 0.0, 0.0], [0.0, 5.0, 0.0], [1.0, 5.0, 0.0]],
            vec![8, 1, 6, 1],
            None,
            &Device::Cpu,
        )
        .unwrap();
        let pairs = vec![
            NeighborPair::new(2, 3, [0, 0, 0]),
            NeighborPair::new(3, 2, [0, 0, 0]),
        ];
        let displacements =
            Tensor::from_vec(vec![1.0, 0.0, 0.0, -1.0, 0.0, 0.0], (2, 3), &Device::Cpu).unwrap();
        system
            .add_neighbor_list(options, NeighborList::new(pairs, displacements).unwrap())
            .unwrap();

        let (fast, reference) = graphs_for(&system, &options, &[1], &vocabulary());
        for graph in [&fast, &reference] {
            assert_eq!(graph.atoms, vec![1, 2, 3]);
            assert_eq!(graph.max_num_neighbors, 1);
            assert_eq!(graph.central_species, vec![0, 1, 0]);
            assert_eq!(graph.nums, vec![0, 1, 1]);
            assert_eq!(graph.mask, vec![true, false, false]);
            assert_eq!(graph.neighbors_index, vec![0, 2, 1]);
            assert_eq!(graph.neighbors_pos, vec![0, 0, 0]);
            assert_eq!(graph.neighbor_species, vec![0, 0, 1]);

            let x = graph.x.to_vec3::<f64>().unwrap();
            assert_eq!(x[0][0], [0.0, 0.0, 0.0]);
            assert_eq!(x[1][0], [1.0, 0.0, 0.0]);
            assert_eq!(x[2][0], [-1.0, 0.0, 0.0]);
        }
    }
}
