use crate::core::capabilities::ModelCapabilities;
use crate::core::models::dataset::{Dataset, DatasetError};
use crate::core::models::neighbors::NeighborListOptions;
use crate::core::models::system::System;
use crate::core::tensor::map::TensorMap;
use crate::core::tensor::ops::join_samples;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Sorted atomic types present in any system of `datasets`.
pub fn get_all_species(datasets: &[Dataset]) -> Vec<i32> {
    datasets
        .iter()
        .flat_map(Dataset::samples)
        .flat_map(|sample| sample.system.types().iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Sorted names of the targets present in any sample of `datasets`.
pub fn get_all_targets(datasets: &[Dataset]) -> Vec<String> {
    datasets
        .iter()
        .flat_map(Dataset::samples)
        .flat_map(|sample| sample.targets.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Checks training and validation datasets against each other and against
/// the model capabilities.
///
/// # Errors
///
/// Returns [`DatasetError::IncompatibleTarget`] or
/// [`DatasetError::IncompatibleSpecies`] when any dataset holds a target or
/// an atomic type the model does not declare. Targets and species that only
/// appear in the validation datasets are logged as warnings.
pub fn check_datasets(
    train: &[Dataset],
    validation: &[Dataset],
    capabilities: &ModelCapabilities,
) -> Result<(), DatasetError> {
    let train_targets = get_all_targets(train);
    let validation_targets = get_all_targets(validation);
    if let Some(target) = train_targets
        .iter()
        .chain(&validation_targets)
        .find(|t| !capabilities.outputs.contains_key(*t))
    {
        return Err(DatasetError::IncompatibleTarget(target.clone()));
    }
    for target in validation_targets.iter().filter(|t| !train_targets.contains(t)) {
        warn!("The validation dataset has a target ({target}) that is not in the training dataset.");
    }

    let train_species = get_all_species(train);
    let validation_species = get_all_species(validation);
    if let Some(species) = train_species
        .iter()
        .chain(&validation_species)
        .find(|s| !capabilities.atomic_types.contains(s))
    {
        return Err(DatasetError::IncompatibleSpecies(*species));
    }
    for species in validation_species
        .iter()
        .filter(|s| train_species.binary_search(s).is_err())
    {
        warn!(
            "The validation dataset has a species ({species}) that is not in the training \
             dataset. This could be a result of a random train/validation split. You can \
             avoid this by providing a validation dataset manually."
        );
    }
    Ok(())
}

/// Randomly splits `dataset` into training and validation parts.
///
/// The two fractions are normalized by their sum. Each part receives the
/// floor of its share and leftover samples go to the parts in order, so
/// every sample lands in exactly one part.
pub fn train_validation_split(
    dataset: &Dataset,
    train_fraction: f64,
    validation_fraction: f64,
    seed: u64,
) -> Result<(Dataset, Dataset), DatasetError> {
    if !(train_fraction > 0.0) {
        return Err(DatasetError::InvalidSplit(
            "fraction of the train set is smaller or equal to 0".into(),
        ));
    }
    if !(validation_fraction >= 0.0) {
        return Err(DatasetError::InvalidSplit(format!(
            "validation fraction {validation_fraction} is negative"
        )));
    }

    let total = train_fraction + validation_fraction;
    let fractions = [train_fraction / total, validation_fraction / total];
    let mut lengths = fractions.map(|f| (f * dataset.len() as f64).floor() as usize);
    let remainder = dataset.len() - lengths.iter().sum::<usize>();
    for i in 0..remainder {
        lengths[i % lengths.len()] += 1;
    }

    let mut permutation: Vec<usize> = (0..dataset.len()).collect();
    permutation.shuffle(&mut StdRng::seed_from_u64(seed));
    let (train, validation) = permutation.split_at(lengths[0]);
    Ok((dataset.subset(train), dataset.subset(validation)))
}

/// Deterministic partition of sample indices across data-parallel replicas.
///
/// Every replica computes the same (optionally shuffled) order from `seed`
/// and the epoch, pads it by wrapping around (or truncates it with
/// `drop_last`) to a multiple of `num_replicas`, and keeps every
/// `num_replicas`-th index starting at its rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSampler {
    pub num_replicas: usize,
    pub rank: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub drop_last: bool,
}

impl ShardSampler {
    pub fn single(shuffle: bool, seed: u64) -> Self {
        Self {
            num_replicas: 1,
            rank: 0,
            shuffle,
            seed,
            drop_last: false,
        }
    }

    pub fn indices(&self, len: usize, epoch: usize) -> Vec<usize> {
        let replicas = self.num_replicas.max(1);
        let mut order: Vec<usize> = (0..len).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64)));
        }

        if self.drop_last {
            order.truncate(len / replicas * replicas);
        } else if len > 0 {
            let total = len.div_ceil(replicas) * replicas;
            let mut k = 0;
            while order.len() < total {
                order.push(order[k % len]);
                k += 1;
            }
        }

        order
            .into_iter()
            .skip(self.rank)
            .step_by(replicas)
            .collect()
    }
}

/// Groups of sample indices of one dataset forming a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchIndices {
    pub dataset: usize,
    pub indices: Vec<usize>,
}

/// Batches over several datasets at once.
///
/// Batches never mix datasets. With `shuffle`, the order of the batches
/// across datasets is shuffled too.
#[derive(Debug, Clone)]
pub struct BatchLoader<'d> {
    datasets: &'d [Dataset],
    batch_size: usize,
    drop_last: bool,
    sampler: ShardSampler,
}

impl<'d> BatchLoader<'d> {
    pub fn new(
        datasets: &'d [Dataset],
        batch_size: usize,
        drop_last: bool,
        sampler: ShardSampler,
    ) -> Self {
        Self {
            datasets,
            batch_size: batch_size.max(1),
            drop_last,
            sampler,
        }
    }

    pub fn datasets(&self) -> &'d [Dataset] {
        self.datasets
    }

    pub fn batches(&self, epoch: usize) -> Vec<BatchIndices> {
        let mut batches = Vec::new();
        for (dataset, data) in self.datasets.iter().enumerate() {
            let indices = self.sampler.indices(data.len(), epoch);
            for chunk in indices.chunks(self.batch_size) {
                if self.drop_last && chunk.len() < self.batch_size {
                    continue;
                }
                batches.push(BatchIndices {
                    dataset,
                    indices: chunk.to_vec(),
                });
            }
        }
        if self.sampler.shuffle {
            let seed = self.sampler.seed.wrapping_add(epoch as u64).rotate_left(17);
            batches.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        batches
    }

    pub fn len(&self, epoch: usize) -> usize {
        self.batches(epoch).len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.iter().all(Dataset::is_empty)
    }

    /// Collates the samples of `batch`.
    pub fn load(&self, batch: &BatchIndices) -> Result<Batch, DatasetError> {
        let dataset = self.datasets.get(batch.dataset).ok_or_else(|| {
            DatasetError::InvalidSplit(format!("no dataset with index {}", batch.dataset))
        })?;
        collate_batch(dataset, &batch.indices)
    }
}

/// Systems of a batch together with their joined targets.
#[derive(Debug, Clone)]
pub struct Batch {
    pub systems: Vec<System>,
    pub targets: BTreeMap<String, TensorMap>,
}

/// Collects the systems at `indices` and joins their targets along the
/// sample axis, so target samples are numbered by position in the batch.
///
/// # Errors
///
/// Returns [`DatasetError::MissingTarget`] when a sample lacks a target
/// that the first sample of the batch has.
pub fn collate_batch(dataset: &Dataset, indices: &[usize]) -> Result<Batch, DatasetError> {
    let samples = indices
        .iter()
        .map(|i| {
            dataset.get(*i).ok_or_else(|| {
                DatasetError::InvalidSplit(format!("sample {i} is out of range"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut targets = BTreeMap::new();
    if let Some(first) = samples.first() {
        for name in first.targets.keys() {
            let maps = samples
                .iter()
                .zip(indices)
                .map(|(sample, index)| {
                    sample
                        .targets
                        .get(name)
                        .cloned()
                        .ok_or_else(|| DatasetError::MissingTarget {
                            sample: *index,
                            target: name.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            targets.insert(name.clone(), join_samples(&maps)?);
        }
    }

    Ok(Batch {
        systems: samples.iter().map(|s| s.system.clone()).collect(),
        targets,
    })
}

/// Computes and attaches the `requested` neighbor lists to every system.
pub fn attach_neighbor_lists(
    dataset: &mut Dataset,
    requested: &[NeighborListOptions],
) -> Result<(), DatasetError> {
    #[cfg(not(feature = "parallel"))]
    let mut iterator = dataset.samples_mut().iter_mut();

    #[cfg(feature = "parallel")]
    let iterator = dataset.samples_mut().par_iter_mut();

    iterator.try_for_each(|sample| {
        requested
            .iter()
            .try_for_each(|options| sample.system.attach_neighbor_list(*options))
            .map_err(DatasetError::from)
    })
}
