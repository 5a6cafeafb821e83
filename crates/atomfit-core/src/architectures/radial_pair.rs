use super::TrainableModel;
use crate::core::capabilities::{
    DatasetInfo, ModelCapabilities, ModelOutput, merge_capabilities,
};
use crate::core::io::checkpoint::{Checkpoint, CheckpointError};
use crate::core::models::neighbors::NeighborListOptions;
use crate::core::models::species::SpeciesVocabulary;
use crate::core::models::system::System;
use crate::core::tensor::block::TensorBlock;
use crate::core::tensor::labels::Labels;
use crate::core::tensor::map::TensorMap;
use crate::core::tensor::ops::sum_over_atoms;
use crate::engine::batching::{BatchStrategy, GraphBatch, systems_to_batch};
use crate::engine::composition::CompositionWeights;
use crate::engine::config::ConfigError;
use crate::engine::error::EngineError;
use crate::engine::model::{AtomisticModel, ModelError};
use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::f64::consts::PI;
use tracing::{debug, info};

pub const ARCHITECTURE_NAME: &str = "radial-pair";

const DEFAULT_NUM_BASIS: usize = 8;
const INITIAL_WEIGHT_SCALE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RadialPairHypers {
    pub cutoff: f64,
    pub num_basis: usize,
    pub seed: u64,
}

#[derive(Default)]
pub struct RadialPairHypersBuilder {
    cutoff: Option<f64>,
    num_basis: Option<usize>,
    seed: u64,
}

impl RadialPairHypersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = Some(cutoff);
        self
    }
    pub fn num_basis(mut self, num_basis: usize) -> Self {
        self.num_basis = Some(num_basis);
        self
    }
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> Result<RadialPairHypers, ConfigError> {
        let cutoff = self.cutoff.ok_or(ConfigError::MissingParameter("cutoff"))?;
        if !(cutoff > 0.0 && cutoff.is_finite()) {
            return Err(ConfigError::InvalidValue {
                parameter: "cutoff",
                reason: format!("{cutoff} is not a positive length"),
            });
        }
        let num_basis = self.num_basis.unwrap_or(DEFAULT_NUM_BASIS);
        if num_basis == 0 {
            return Err(ConfigError::InvalidValue {
                parameter: "num_basis",
                reason: "must be at least 1".into(),
            });
        }
        Ok(RadialPairHypers {
            cutoff,
            num_basis,
            seed: self.seed,
        })
    }
}

/// Parameters of one output: a weight per species pair and basis function,
/// and a fixed per-species offset.
#[derive(Debug, Clone)]
struct OutputHead {
    /// `(n_species * n_species, num_basis)`, row `a * n_species + b` for a
    /// centre of vocabulary position `a` and a neighbor of position `b`.
    pair_weights: Var,
    composition: Tensor,
    present: Vec<bool>,
}

fn name_seed(seed: u64, name: &str) -> u64 {
    name.bytes()
        .fold(seed, |h, b| h.wrapping_mul(31).wrapping_add(u64::from(b)))
}

impl OutputHead {
    fn new(
        name: &str,
        hypers: &RadialPairHypers,
        n_species: usize,
        device: &Device,
    ) -> Result<Self, ModelError> {
        let mut rng = StdRng::seed_from_u64(name_seed(hypers.seed, name));
        let scale = INITIAL_WEIGHT_SCALE / (hypers.num_basis as f64).sqrt();
        let values: Vec<f64> = (0..n_species * n_species * hypers.num_basis)
            .map(|_| rng.gen_range(-scale..scale))
            .collect();
        Ok(Self {
            pair_weights: Var::from_vec(
                values,
                (n_species * n_species, hypers.num_basis),
                device,
            )?,
            composition: Tensor::zeros(n_species, DType::F64, device)?,
            present: vec![false; n_species],
        })
    }

    /// `(n_atoms)` energies of every atom of the batch.
    fn atom_energies(
        &self,
        batch: &GraphBatch,
        features: Option<&Tensor>,
        n_species: usize,
    ) -> Result<Tensor, ModelError> {
        let central = batch.central_species.to_vec1::<i64>()?;
        let central_ids: Vec<u32> = central.iter().map(|s| *s as u32).collect();
        let central_ids = Tensor::from_vec(central_ids, central.len(), batch.device())?;
        let offsets = self.composition.index_select(&central_ids, 0)?;

        let Some(features) = features else {
            return Ok(offsets);
        };
        let (n_atoms, width) = (batch.n_atoms(), batch.max_num_neighbors);
        let neighbors = batch.neighbor_species.to_vec2::<i64>()?;
        let pair_ids: Vec<u32> = central
            .iter()
            .zip(&neighbors)
            .flat_map(|(a, row)| row.iter().map(move |b| (*a as usize * n_species + *b as usize) as u32))
            .collect();
        let pair_ids = Tensor::from_vec(pair_ids, n_atoms * width, batch.device())?;
        let num_basis = self.pair_weights.dim(1)?;
        let weights = self
            .pair_weights
            .as_tensor()
            .index_select(&pair_ids, 0)?
            .reshape((n_atoms, width, num_basis))?;

        let pair_energies = features.mul(&weights)?.sum(2)?;
        Ok(pair_energies.sum(1)?.affine(0.5, 0.0)?.add(&offsets)?)
    }
}

/// Pair potential expanded on Gaussian radial functions with a cosine cutoff.
///
/// The energy of an atom is the composition weight of its species plus half
/// the sum, over its neighbors, of `sum_k w[a, b, k] * g_k(r) * f_c(r)`.
#[derive(Debug, Clone)]
pub struct RadialPairModel {
    hypers: RadialPairHypers,
    dataset_info: DatasetInfo,
    capabilities: ModelCapabilities,
    vocabulary: SpeciesVocabulary,
    heads: BTreeMap<String, OutputHead>,
    strategy: BatchStrategy,
    device: Device,
}

impl RadialPairModel {
    /// Creates a model with one output per target of `dataset_info`.
    pub fn new(
        hypers: RadialPairHypers,
        dataset_info: &DatasetInfo,
        device: &Device,
    ) -> Result<Self, ModelError> {
        let capabilities = ModelCapabilities::from_dataset_info(dataset_info, hypers.cutoff);
        let vocabulary = SpeciesVocabulary::new(capabilities.atomic_types.iter().copied());
        let mut model = Self {
            hypers,
            dataset_info: dataset_info.clone(),
            capabilities: ModelCapabilities {
                outputs: BTreeMap::new(),
                ..capabilities.clone()
            },
            vocabulary,
            heads: BTreeMap::new(),
            strategy: BatchStrategy::default(),
            device: device.clone(),
        };
        for (name, output) in &capabilities.outputs {
            model.add_output(name, output)?;
        }
        Ok(model)
    }

    pub fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn hypers(&self) -> &RadialPairHypers {
        &self.hypers
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Declares a new output with freshly initialized weights. Existing
    /// outputs are left untouched.
    pub fn add_output(&mut self, name: &str, output: &ModelOutput) -> Result<(), ModelError> {
        if self.heads.contains_key(name) {
            return Ok(());
        }
        let head = OutputHead::new(name, &self.hypers, self.vocabulary.len(), &self.device)?;
        self.heads.insert(name.to_string(), head);
        self.capabilities
            .outputs
            .insert(name.to_string(), output.clone());
        debug!(output = name, "Added model output");
        Ok(())
    }

    /// Prepares the model for training on `dataset_info`, returning the
    /// outputs it did not declare before.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Capability`] for conflicting units and
    /// [`EngineError::Config`] when the datasets contain atomic types the
    /// model was not built for.
    pub fn restart(
        &mut self,
        dataset_info: &DatasetInfo,
    ) -> Result<BTreeMap<String, ModelOutput>, EngineError> {
        let requested = ModelCapabilities::from_dataset_info(dataset_info, self.hypers.cutoff);
        let (merged, novel) = merge_capabilities(&self.capabilities, &requested)?;
        if merged.atomic_types != self.capabilities.atomic_types {
            return Err(ConfigError::InvalidValue {
                parameter: "atomic_types",
                reason: format!(
                    "restarting with types {:?} is not supported by a model built for {:?}",
                    merged.atomic_types, self.capabilities.atomic_types
                ),
            }
            .into());
        }
        for (name, output) in &novel {
            self.add_output(name, output)?;
        }
        self.dataset_info
            .targets
            .extend(dataset_info.targets.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !novel.is_empty() {
            info!(outputs = ?novel.keys().collect::<Vec<_>>(), "Restart adds new outputs");
        }
        Ok(novel)
    }

    /// Rebuilds a model from a checkpoint written through
    /// [`TrainableModel::state_tensors`].
    pub fn from_checkpoint(checkpoint: &Checkpoint, device: &Device) -> Result<Self, CheckpointError> {
        let metadata = &checkpoint.metadata;
        let hypers: RadialPairHypers = metadata
            .hypers
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| CheckpointError::Metadata(e.to_string()))?;
        let vocabulary = SpeciesVocabulary::new(metadata.capabilities.atomic_types.iter().copied());
        let n_species = vocabulary.len();

        let mut heads = BTreeMap::new();
        for name in metadata.capabilities.outputs.keys() {
            let pair_weights = checkpoint.tensor(&format!("{name}.pair_weights"))?;
            if pair_weights.dims() != [n_species * n_species, hypers.num_basis] {
                return Err(CheckpointError::Metadata(format!(
                    "pair weights of '{name}' have shape {:?}",
                    pair_weights.dims()
                )));
            }
            let composition = checkpoint
                .tensor(&format!("{name}.composition_weights"))?
                .to_device(device)?;
            let present = checkpoint
                .tensor(&format!("{name}.composition_present"))?
                .to_vec1::<f64>()?
                .into_iter()
                .map(|v| v > 0.5)
                .collect();
            heads.insert(
                name.clone(),
                OutputHead {
                    pair_weights: Var::from_tensor(&pair_weights.to_device(device)?)?,
                    composition,
                    present,
                },
            );
        }

        Ok(Self {
            hypers,
            dataset_info: metadata.dataset_info.clone(),
            capabilities: metadata.capabilities.clone(),
            vocabulary,
            heads,
            strategy: BatchStrategy::default(),
            device: device.clone(),
        })
    }

    /// `(n_atoms, width, num_basis)` radial features, zero on padded slots,
    /// or `None` when no atom of the batch has a neighbor.
    fn radial_features(&self, batch: &GraphBatch) -> Result<Option<Tensor>, ModelError> {
        if batch.n_atoms() == 0 || batch.max_num_neighbors == 0 {
            return Ok(None);
        }
        let cutoff = self.hypers.cutoff;
        let num_basis = self.hypers.num_basis;
        let dtype = batch.x.dtype();
        let padded = batch.mask.to_dtype(dtype)?;
        let valid = padded.affine(-1.0, 1.0)?;
        let distances = batch.x.sqr()?.sum(2)?.add(&padded)?.sqrt()?;

        let centers: Vec<f64> = if num_basis == 1 {
            vec![0.0]
        } else {
            (0..num_basis)
                .map(|k| cutoff * k as f64 / (num_basis - 1) as f64)
                .collect()
        };
        let width = cutoff / num_basis as f64;
        let centers = Tensor::from_vec(centers, (1, 1, num_basis), batch.device())?.to_dtype(dtype)?;
        let gaussians = distances
            .unsqueeze(2)?
            .broadcast_sub(&centers)?
            .affine(1.0 / width, 0.0)?
            .sqr()?
            .neg()?
            .exp()?;
        let smooth_cutoff = distances
            .clamp(0.0, cutoff)?
            .affine(PI / cutoff, 0.0)?
            .cos()?
            .affine(0.5, 0.5)?
            .mul(&valid)?;
        Ok(Some(gaussians.broadcast_mul(&smooth_cutoff.unsqueeze(2)?)?))
    }
}

fn selection_mask(batch: &GraphBatch, selected_atoms: Option<&Labels>) -> Result<Vec<bool>, ModelError> {
    let Some(labels) = selected_atoms else {
        return Ok(vec![true; batch.n_atoms()]);
    };
    let systems = labels.column("system")?;
    let atoms = labels.column("atom")?;
    let selected: HashSet<(usize, usize)> = systems
        .into_iter()
        .zip(atoms)
        .map(|(s, a)| (s as usize, a as usize))
        .collect();
    Ok(batch.atoms.iter().map(|atom| selected.contains(atom)).collect())
}

impl AtomisticModel for RadialPairModel {
    fn capabilities(&self) -> &ModelCapabilities {
        &self.capabilities
    }

    fn requested_neighbor_lists(&self) -> Vec<NeighborListOptions> {
        vec![NeighborListOptions::new(self.hypers.cutoff, true)]
    }

    fn forward(
        &self,
        systems: &[System],
        outputs: &BTreeMap<String, ModelOutput>,
        selected_atoms: Option<&Labels>,
    ) -> Result<BTreeMap<String, TensorMap>, ModelError> {
        if let Some(name) = outputs.keys().find(|name| !self.heads.contains_key(*name)) {
            return Err(ModelError::UnsupportedOutput(name.clone()));
        }
        let options = NeighborListOptions::new(self.hypers.cutoff, true);
        let batch = systems_to_batch(
            systems,
            &options,
            &self.vocabulary,
            selected_atoms,
            self.strategy,
        )?;
        let features = self.radial_features(&batch)?;
        let mask = selection_mask(&batch, selected_atoms)?;
        let kept: Vec<usize> = (0..batch.n_atoms()).filter(|i| mask[*i]).collect();
        let kept_ids = Tensor::from_vec(
            kept.iter().map(|i| *i as u32).collect::<Vec<_>>(),
            kept.len(),
            batch.device(),
        )?;
        let samples = Labels::new(
            &["system", "atom"],
            kept.iter()
                .map(|i| {
                    let (system, atom) = batch.atoms[*i];
                    vec![system as i32, atom as i32]
                })
                .collect(),
        )?;

        let mut predictions = BTreeMap::new();
        for (name, requested) in outputs {
            let head = &self.heads[name];
            let energies = if kept.is_empty() {
                Tensor::zeros(0, DType::F64, batch.device())?
            } else {
                head.atom_energies(&batch, features.as_ref(), self.vocabulary.len())?
                    .index_select(&kept_ids, 0)?
            };
            let per_atom = TensorMap::single(TensorBlock::new(
                energies.unsqueeze(1)?,
                samples.clone(),
                vec![],
                Labels::range("energy", 1),
            )?);
            let map = if requested.per_atom {
                per_atom
            } else {
                sum_over_atoms(&per_atom, systems.len())?
            };
            predictions.insert(name.clone(), map);
        }
        Ok(predictions)
    }
}

impl TrainableModel for RadialPairModel {
    fn architecture_name(&self) -> &'static str {
        ARCHITECTURE_NAME
    }

    fn hypers_value(&self) -> Result<toml::Value, CheckpointError> {
        toml::Value::try_from(&self.hypers).map_err(|e| CheckpointError::Metadata(e.to_string()))
    }

    fn dataset_info(&self) -> &DatasetInfo {
        &self.dataset_info
    }

    fn trainable_variables(&self) -> Vec<Var> {
        self.heads.values().map(|h| h.pair_weights.clone()).collect()
    }

    fn set_composition_weights(
        &mut self,
        output: &str,
        weights: &CompositionWeights,
    ) -> Result<(), ModelError> {
        let n_species = self.vocabulary.len();
        let head = self
            .heads
            .get_mut(output)
            .ok_or_else(|| ModelError::UnsupportedOutput(output.to_string()))?;
        let mut values = head.composition.to_vec1::<f64>()?;
        for (species, weight) in weights.atomic_types.iter().zip(&weights.weights) {
            let index = self
                .vocabulary
                .index_of(*species)
                .ok_or_else(|| ModelError::Composition {
                    output: output.to_string(),
                    reason: format!("atomic type {species} is not supported by the model"),
                })?;
            values[index] = *weight;
            head.present[index] = true;
        }
        head.composition = Tensor::from_vec(values, n_species, &self.device)?;
        Ok(())
    }

    fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors = Vec::with_capacity(3 * self.heads.len());
        for (name, head) in &self.heads {
            let present: Vec<f64> = head.present.iter().map(|p| f64::from(u8::from(*p))).collect();
            let n_species = present.len();
            tensors.push((format!("{name}.pair_weights"), head.pair_weights.as_tensor().detach()));
            tensors.push((format!("{name}.composition_weights"), head.composition.clone()));
            if let Ok(present) = Tensor::from_vec(present, n_species, &self.device) {
                tensors.push((format!("{name}.composition_present"), present));
            }
        }
        tensors
    }

    fn to_exportable(&self) -> Box<dyn AtomisticModel> {
        Box::new(self.clone())
    }
}
