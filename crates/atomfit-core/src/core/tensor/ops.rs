use super::TensorMapError;
use super::block::TensorBlock;
use super::labels::Labels;
use super::map::TensorMap;
use candle_core::Tensor;

/// Joins single-block maps along the sample axis.
///
/// The first sample dimension of map `m` is renumbered to `m`, so joining the
/// per-structure targets of a batch yields samples indexed by the position
/// of each structure in the batch. Gradient blocks are joined as well, with
/// their `sample` dimension shifted by the number of parent samples before
/// them.
pub fn join_samples(maps: &[TensorMap]) -> Result<TensorMap, TensorMapError> {
    join_with(maps, |m, _| m as i32)
}

/// Joins single-block maps of consecutive batches along the sample axis.
///
/// `n_systems[m]` is the number of structures of batch `m`; the first sample
/// dimension of each batch is shifted by the structures of the batches
/// before it.
pub fn join_batches(maps: &[TensorMap], n_systems: &[usize]) -> Result<TensorMap, TensorMapError> {
    if maps.len() != n_systems.len() {
        return Err(TensorMapError::Join(format!(
            "{} maps for {} batch sizes",
            maps.len(),
            n_systems.len()
        )));
    }
    let offsets: Vec<i32> = n_systems
        .iter()
        .scan(0usize, |total, n| {
            let offset = *total;
            *total += n;
            Some(offset as i32)
        })
        .collect();
    join_with(maps, |m, system| offsets[m] + system)
}

fn join_with(
    maps: &[TensorMap],
    renumber: impl Fn(usize, i32) -> i32,
) -> Result<TensorMap, TensorMapError> {
    let blocks = maps
        .iter()
        .map(TensorMap::block)
        .collect::<Result<Vec<_>, _>>()?;
    let reference = *blocks
        .first()
        .ok_or_else(|| TensorMapError::Join("no tensor maps to join".into()))?;

    for block in &blocks[1..] {
        if block.samples().names() != reference.samples().names()
            || block.components() != reference.components()
            || block.properties() != reference.properties()
        {
            return Err(TensorMapError::Join(
                "blocks have different sample, component or property labels".into(),
            ));
        }
        if block.gradient_names() != reference.gradient_names() {
            return Err(TensorMapError::Join(
                "blocks carry different gradients".into(),
            ));
        }
    }

    let mut sample_values = Vec::new();
    for (m, block) in blocks.iter().enumerate() {
        for row in block.samples().rows() {
            sample_values.push(renumber(m, row[0]));
            sample_values.extend_from_slice(&row[1..]);
        }
    }
    let samples = Labels::from_flat(reference.samples().names().to_vec(), sample_values)?;
    let values: Vec<&Tensor> = blocks.iter().map(|b| b.values()).collect();
    let mut joined = TensorBlock::new(
        Tensor::cat(&values, 0)?,
        samples,
        reference.components().to_vec(),
        reference.properties().clone(),
    )?;

    for parameter in reference.gradient_names() {
        let mut offset = 0;
        let mut gradient_samples = Vec::new();
        let mut gradient_values = Vec::new();
        let mut template = None;
        for block in &blocks {
            let gradient = block.gradient(parameter).ok_or_else(|| {
                TensorMapError::Join(format!("missing gradient '{parameter}'"))
            })?;
            for row in gradient.samples().rows() {
                gradient_samples.push(row[0] + offset);
                gradient_samples.extend_from_slice(&row[1..]);
            }
            gradient_values.push(gradient.values());
            offset += block.samples().count() as i32;
            template.get_or_insert(gradient);
        }
        let template = template.ok_or_else(|| {
            TensorMapError::Join(format!("missing gradient '{parameter}'"))
        })?;
        let gradient = TensorBlock::new(
            Tensor::cat(&gradient_values, 0)?,
            Labels::from_flat(template.samples().names().to_vec(), gradient_samples)?,
            template.components().to_vec(),
            template.properties().clone(),
        )?;
        joined.add_gradient(parameter, gradient)?;
    }

    Ok(TensorMap::single(joined))
}

/// Divides per-structure values by the number of atoms of each structure.
///
/// `num_atoms[s]` is the atom count of the structure whose first sample
/// dimension equals `s`. Strain gradients are divided as well; position
/// gradients are per atom already and stay unchanged.
pub fn divide_by_num_atoms(map: &TensorMap, num_atoms: &[usize]) -> Result<TensorMap, TensorMapError> {
    map.try_map_blocks(|block| {
        let divisor = atom_counts_for(block, block.samples(), num_atoms)?;
        let mut divided = block.with_values(block.values().broadcast_div(&divisor)?)?;
        if let Some(strain) = block.gradient("strain") {
            let parent_rows = strain.samples().column("sample")?;
            let parents = block.samples().column(&block.samples().names()[0])?;
            let counts = parent_rows
                .iter()
                .map(|p| lookup_count(parents[*p as usize], num_atoms))
                .collect::<Result<Vec<_>, _>>()?;
            let divisor = broadcast_column(counts, strain.values())?;
            divided.map_gradient("strain", |values| values.broadcast_div(&divisor))?;
        }
        Ok(divided)
    })
}

fn atom_counts_for(
    block: &TensorBlock,
    samples: &Labels,
    num_atoms: &[usize],
) -> Result<Tensor, TensorMapError> {
    let systems = samples.column(&samples.names()[0])?;
    let counts = systems
        .iter()
        .map(|s| lookup_count(*s, num_atoms))
        .collect::<Result<Vec<_>, _>>()?;
    broadcast_column(counts, block.values())
}

fn lookup_count(system: i32, num_atoms: &[usize]) -> Result<f64, TensorMapError> {
    usize::try_from(system)
        .ok()
        .and_then(|s| num_atoms.get(s))
        .map(|n| *n as f64)
        .ok_or_else(|| {
            TensorMapError::Join(format!("no atom count for structure {system}"))
        })
}

/// Sums per-atom blocks into per-structure blocks.
///
/// Blocks must have `system` and `atom` sample dimensions; the result has a
/// single `system` dimension with entries `0..n_systems`. Gradient blocks are
/// not carried over.
pub fn sum_over_atoms(map: &TensorMap, n_systems: usize) -> Result<TensorMap, TensorMapError> {
    map.try_map_blocks(|block| {
        block.samples().column("atom")?;
        let systems = block.samples().column("system")?;
        let index = systems
            .iter()
            .map(|s| {
                u32::try_from(*s)
                    .ok()
                    .filter(|s| (*s as usize) < n_systems)
                    .ok_or_else(|| {
                        TensorMapError::Join(format!(
                            "structure {s} is outside of 0..{n_systems}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let values = block.values();
        let index = Tensor::from_vec(index, systems.len(), values.device())?;
        let mut shape = values.dims().to_vec();
        shape[0] = n_systems;
        let summed = Tensor::zeros(shape, values.dtype(), values.device())?.index_add(
            &index,
            values,
            0,
        )?;
        TensorBlock::new(
            summed,
            Labels::range("system", n_systems),
            block.components().to_vec(),
            block.properties().clone(),
        )
    })
}

fn broadcast_column(values: Vec<f64>, like: &Tensor) -> Result<Tensor, TensorMapError> {
    let mut shape = vec![1; like.rank()];
    shape[0] = values.len();
    Ok(Tensor::from_vec(values, shape, like.device())?.to_dtype(like.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn energy_map(energy: f64, n_atoms: usize) -> TensorMap {
        let mut block = TensorBlock::new(
            Tensor::from_vec(vec![energy], (1, 1), &Device::Cpu).unwrap(),
            Labels::range("system", 1),
            vec![],
            Labels::range("energy", 1),
        )
        .unwrap();
        let forces: Vec<f64> = (0..3 * n_atoms).map(|v| v as f64).collect();
        let entries = (0..n_atoms).map(|a| vec![0, a as i32]).collect();
        let gradient = TensorBlock::new(
            Tensor::from_vec(forces, (n_atoms, 3, 1), &Device::Cpu).unwrap(),
            Labels::new(&["sample", "atom"], entries).unwrap(),
            vec![Labels::range("xyz", 3)],
            Labels::range("energy", 1),
        )
        .unwrap();
        block.add_gradient("positions", gradient).unwrap();
        TensorMap::single(block)
    }

    #[test]
    fn join_renumbers_structures_and_offsets_gradient_samples() {
        let joined = join_samples(&[energy_map(1.0, 1), energy_map(2.0, 2)]).unwrap();
        let block = joined.block().unwrap();

        assert_eq!(block.samples().column("system").unwrap(), vec![0, 1]);
        assert_eq!(
            block.values().flatten_all().unwrap().to_vec1::<f64>().unwrap(),
            vec![1.0, 2.0]
        );
        let gradient = block.gradient("positions").unwrap();
        assert_eq!(gradient.samples().column("sample").unwrap(), vec![0, 1, 1]);
        assert_eq!(gradient.samples().column("atom").unwrap(), vec![0, 0, 1]);
        assert_eq!(gradient.values().dims(), &[3, 3, 1]);
    }

    #[test]
    fn join_of_nothing_is_an_error() {
        assert!(matches!(join_samples(&[]), Err(TensorMapError::Join(_))));
    }

    #[test]
    fn divide_by_num_atoms_leaves_position_gradients_untouched() {
        let joined = join_samples(&[energy_map(3.0, 1), energy_map(8.0, 2)]).unwrap();
        let divided = divide_by_num_atoms(&joined, &[1, 2]).unwrap();
        let block = divided.block().unwrap();

        assert_eq!(
            block.values().flatten_all().unwrap().to_vec1::<f64>().unwrap(),
            vec![3.0, 4.0]
        );
        let before = joined.block().unwrap().gradient("positions").unwrap().values();
        let after = block.gradient("positions").unwrap().values();
        assert_eq!(
            before.flatten_all().unwrap().to_vec1::<f64>().unwrap(),
            after.flatten_all().unwrap().to_vec1::<f64>().unwrap()
        );
    }

    #[test]
    fn sum_over_atoms_collapses_atoms_of_each_structure() {
        let per_atom = TensorBlock::new(
            Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (4, 1), &Device::Cpu).unwrap(),
            Labels::new(
                &["system", "atom"],
                vec![vec![0, 0], vec![1, 0], vec![1, 1], vec![1, 2]],
            )
            .unwrap(),
            vec![],
            Labels::range("energy", 1),
        )
        .unwrap();
        let summed = sum_over_atoms(&TensorMap::single(per_atom), 3).unwrap();
        let block = summed.block().unwrap();

        assert_eq!(block.samples().column("system").unwrap(), vec![0, 1, 2]);
        assert_eq!(
            block.values().flatten_all().unwrap().to_vec1::<f64>().unwrap(),
            vec![1.0, 9.0, 0.0]
        );
    }

    #[test]
    fn sum_over_atoms_requires_an_atom_dimension() {
        let map = energy_map(1.0, 1);
        assert!(matches!(
            sum_over_atoms(&map, 1),
            Err(TensorMapError::MissingDimension(_))
        ));
    }

    #[test]
    fn join_batches_offsets_structures_by_batch_size() {
        let first = join_samples(&[energy_map(1.0, 1), energy_map(2.0, 1)]).unwrap();
        let second = energy_map(3.0, 2);
        let joined = join_batches(&[first, second], &[2, 1]).unwrap();
        let block = joined.block().unwrap();

        assert_eq!(block.samples().column("system").unwrap(), vec![0, 1, 2]);
        let gradient = block.gradient("positions").unwrap();
        assert_eq!(gradient.samples().column("sample").unwrap(), vec![0, 1, 2, 2]);
    }
}
