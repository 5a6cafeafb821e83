use super::batching::BatchError;
use crate::core::capabilities::{ModelCapabilities, ModelOutput};
use crate::core::models::neighbors::NeighborListOptions;
use crate::core::models::system::System;
use crate::core::tensor::TensorMapError;
use crate::core::tensor::labels::Labels;
use crate::core::tensor::map::TensorMap;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Output '{0}' is not supported by this model")]
    UnsupportedOutput(String),

    #[error("System {system} contains atomic type {species}, which the model does not support")]
    UnsupportedSpecies { system: usize, species: i32 },

    #[error("System {system} is missing the neighbor list with cutoff {cutoff}")]
    MissingNeighborList { system: usize, cutoff: f64 },

    #[error("Requested length unit '{requested}' differs from the model's '{declared}'")]
    LengthUnit { requested: String, declared: String },

    #[error("Output '{name}' is inconsistent: {reason}")]
    InconsistentOutput { name: String, reason: String },

    #[error("Invalid model hyperparameters: {0}")]
    InvalidHypers(String),

    #[error("Composition weights for '{output}' are invalid: {reason}")]
    Composition { output: String, reason: String },

    #[error("Batching failed: {0}")]
    Batch(#[from] BatchError),

    #[error("Tensor map error: {0}")]
    TensorMap(#[from] TensorMapError),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// A model mapping atomic systems to labelled predictions.
///
/// `forward` must build its outputs from the system positions, cell and
/// neighbor-list displacement tensors so that gradients flow back to them.
pub trait AtomisticModel: Send + Sync {
    fn capabilities(&self) -> &ModelCapabilities;

    fn requested_neighbor_lists(&self) -> Vec<NeighborListOptions>;

    fn forward(
        &self,
        systems: &[System],
        outputs: &BTreeMap<String, ModelOutput>,
        selected_atoms: Option<&Labels>,
    ) -> Result<BTreeMap<String, TensorMap>, ModelError>;
}

/// What an exported model is asked to compute.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOptions {
    /// Unit of the system positions; empty means the model's own unit.
    pub length_unit: String,
    pub outputs: BTreeMap<String, ModelOutput>,
    pub selected_atoms: Option<Labels>,
}

/// A model frozen for deployment: its capabilities are fixed at export time
/// and every evaluation goes through [`EvaluationOptions`].
pub struct ExportedModel {
    model: Box<dyn AtomisticModel>,
    capabilities: ModelCapabilities,
}

impl std::fmt::Debug for ExportedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedModel")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl ExportedModel {
    pub fn new(model: Box<dyn AtomisticModel>) -> Self {
        let capabilities = model.capabilities().clone();
        Self {
            model,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &ModelCapabilities {
        &self.capabilities
    }

    pub fn requested_neighbor_lists(&self) -> Vec<NeighborListOptions> {
        self.model.requested_neighbor_lists()
    }

    /// Evaluates the wrapped model.
    ///
    /// With `check_consistency`, inputs are checked against the declared
    /// capabilities before the call (atomic types, neighbor lists) and the
    /// outputs are checked after it (names, sample layout).
    pub fn evaluate(
        &self,
        systems: &[System],
        options: &EvaluationOptions,
        check_consistency: bool,
    ) -> Result<BTreeMap<String, TensorMap>, ModelError> {
        if !options.length_unit.is_empty() && options.length_unit != self.capabilities.length_unit
        {
            return Err(ModelError::LengthUnit {
                requested: options.length_unit.clone(),
                declared: self.capabilities.length_unit.clone(),
            });
        }
        if let Some(name) = options
            .outputs
            .keys()
            .find(|name| !self.capabilities.outputs.contains_key(*name))
        {
            return Err(ModelError::UnsupportedOutput(name.clone()));
        }
        if check_consistency {
            self.check_inputs(systems)?;
        }

        let outputs =
            self.model
                .forward(systems, &options.outputs, options.selected_atoms.as_ref())?;

        if check_consistency {
            check_outputs(&outputs, options, systems.len())?;
        }
        Ok(outputs)
    }

    fn check_inputs(&self, systems: &[System]) -> Result<(), ModelError> {
        let requested = self.requested_neighbor_lists();
        for (index, system) in systems.iter().enumerate() {
            if let Some(species) = system
                .types()
                .iter()
                .find(|t| !self.capabilities.atomic_types.contains(*t))
            {
                return Err(ModelError::UnsupportedSpecies {
                    system: index,
                    species: *species,
                });
            }
            if let Some(missing) = requested
                .iter()
                .find(|o| system.get_neighbor_list(o).is_none())
            {
                return Err(ModelError::MissingNeighborList {
                    system: index,
                    cutoff: missing.cutoff(),
                });
            }
        }
        Ok(())
    }
}

fn check_outputs(
    outputs: &BTreeMap<String, TensorMap>,
    options: &EvaluationOptions,
    n_systems: usize,
) -> Result<(), ModelError> {
    let inconsistent = |name: &str, reason: String| ModelError::InconsistentOutput {
        name: name.to_string(),
        reason,
    };
    for name in outputs.keys() {
        if !options.outputs.contains_key(name) {
            return Err(inconsistent(name, "returned but not requested".into()));
        }
    }
    for (name, requested) in &options.outputs {
        let map = outputs
            .get(name)
            .ok_or_else(|| inconsistent(name, "requested but not returned".into()))?;
        for block in map.blocks() {
            let names = block.samples().names();
            let expected: &[&str] = if requested.per_atom {
                &["system", "atom"]
            } else {
                &["system"]
            };
            if names.iter().map(String::as_str).ne(expected.iter().copied()) {
                return Err(inconsistent(
                    name,
                    format!("sample dimensions {names:?}, expected {expected:?}"),
                ));
            }
            if !requested.per_atom && block.samples().count() != n_systems {
                return Err(inconsistent(
                    name,
                    format!(
                        "{} samples for {n_systems} systems",
                        block.samples().count()
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// A model passed to the evaluator, tagged with how it is deployed.
///
/// The tag selects how positions are tracked for differentiation: models in
/// training receive fresh system copies, exported models have the positions
/// of the caller's systems swapped for tracked tensors.
#[derive(Clone, Copy)]
pub enum ModelHandle<'m> {
    Training(&'m dyn AtomisticModel),
    Exported(&'m ExportedModel),
}

impl ModelHandle<'_> {
    pub fn capabilities(&self) -> &ModelCapabilities {
        match self {
            ModelHandle::Training(model) => model.capabilities(),
            ModelHandle::Exported(model) => model.capabilities(),
        }
    }

    pub fn is_exported(&self) -> bool {
        matches!(self, ModelHandle::Exported(_))
    }
}
