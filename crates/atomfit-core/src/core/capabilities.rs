//! Declared outputs of models and datasets, and their reconciliation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Length units differ: '{old}' vs '{new}'")]
    LengthUnit { old: String, new: String },

    #[error("Output '{name}' conflicts with the existing declaration: {reason}")]
    OutputConflict { name: String, reason: String },

    #[error("Target '{name}' is declared differently across datasets")]
    TargetConflict { name: String },
}

/// One output a model can produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub quantity: String,
    pub unit: String,
    pub per_atom: bool,
    #[serde(default)]
    pub explicit_gradients: Vec<String>,
}

impl ModelOutput {
    pub fn new(quantity: &str, unit: &str, per_atom: bool) -> Self {
        Self {
            quantity: quantity.to_string(),
            unit: unit.to_string(),
            per_atom,
            explicit_gradients: Vec::new(),
        }
    }
}

/// A requested target: what the model must predict and which gradients of
/// it are needed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub quantity: String,
    pub unit: String,
    pub per_atom: bool,
    #[serde(default)]
    pub gradients: BTreeSet<String>,
}

impl TargetInfo {
    pub fn energy(unit: &str) -> Self {
        Self {
            quantity: "energy".to_string(),
            unit: unit.to_string(),
            per_atom: false,
            gradients: BTreeSet::new(),
        }
    }

    pub fn with_gradient(mut self, parameter: &str) -> Self {
        self.gradients.insert(parameter.to_string());
        self
    }

    pub fn is_energy(&self) -> bool {
        self.quantity == "energy"
    }

    pub fn to_model_output(&self) -> ModelOutput {
        ModelOutput::new(&self.quantity, &self.unit, self.per_atom)
    }
}

/// What a collection of datasets contains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub length_unit: String,
    pub atomic_types: Vec<i32>,
    pub targets: BTreeMap<String, TargetInfo>,
}

impl DatasetInfo {
    /// Union of two descriptions. Targets present in both must be declared
    /// identically.
    pub fn union(&self, other: &DatasetInfo) -> Result<DatasetInfo, CapabilityError> {
        if self.length_unit != other.length_unit {
            return Err(CapabilityError::LengthUnit {
                old: self.length_unit.clone(),
                new: other.length_unit.clone(),
            });
        }
        let mut targets = self.targets.clone();
        for (name, info) in &other.targets {
            match targets.get(name) {
                Some(existing) if existing != info => {
                    return Err(CapabilityError::TargetConflict { name: name.clone() });
                }
                Some(_) => {}
                None => {
                    targets.insert(name.clone(), info.clone());
                }
            }
        }
        Ok(DatasetInfo {
            length_unit: self.length_unit.clone(),
            atomic_types: sorted_union(&self.atomic_types, &other.atomic_types),
            targets,
        })
    }
}

/// Everything a model declares about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub length_unit: String,
    pub atomic_types: Vec<i32>,
    pub interaction_range: f64,
    pub outputs: BTreeMap<String, ModelOutput>,
    pub supported_devices: Vec<String>,
    pub dtype: String,
}

impl ModelCapabilities {
    /// Capabilities covering every target of `info`.
    pub fn from_dataset_info(info: &DatasetInfo, interaction_range: f64) -> Self {
        Self {
            length_unit: info.length_unit.clone(),
            atomic_types: info.atomic_types.clone(),
            interaction_range,
            outputs: info
                .targets
                .iter()
                .map(|(name, target)| (name.clone(), target.to_model_output()))
                .collect(),
            supported_devices: vec!["cpu".to_string()],
            dtype: "float64".to_string(),
        }
    }
}

fn sorted_union(a: &[i32], b: &[i32]) -> Vec<i32> {
    a.iter()
        .chain(b.iter())
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Merges previously declared capabilities with a newly requested set.
///
/// Returns the merged capabilities and the outputs that `old` did not
/// declare. Outputs present in both must agree on quantity and unit.
///
/// # Errors
///
/// Returns [`CapabilityError`] for differing length units or a conflicting
/// output declaration.
pub fn merge_capabilities(
    old: &ModelCapabilities,
    new: &ModelCapabilities,
) -> Result<(ModelCapabilities, BTreeMap<String, ModelOutput>), CapabilityError> {
    if old.length_unit != new.length_unit {
        return Err(CapabilityError::LengthUnit {
            old: old.length_unit.clone(),
            new: new.length_unit.clone(),
        });
    }

    let mut novel = BTreeMap::new();
    for (name, output) in &new.outputs {
        match old.outputs.get(name) {
            Some(existing) => {
                if existing.quantity != output.quantity {
                    return Err(CapabilityError::OutputConflict {
                        name: name.clone(),
                        reason: format!(
                            "quantity '{}' vs '{}'",
                            existing.quantity, output.quantity
                        ),
                    });
                }
                if existing.unit != output.unit {
                    return Err(CapabilityError::OutputConflict {
                        name: name.clone(),
                        reason: format!("unit '{}' vs '{}'", existing.unit, output.unit),
                    });
                }
                if existing.per_atom != output.per_atom {
                    return Err(CapabilityError::OutputConflict {
                        name: name.clone(),
                        reason: format!(
                            "per_atom {} vs {}",
                            existing.per_atom, output.per_atom
                        ),
                    });
                }
            }
            None => {
                novel.insert(name.clone(), output.clone());
            }
        }
    }

    let mut outputs = old.outputs.clone();
    outputs.extend(novel.iter().map(|(k, v)| (k.clone(), v.clone())));

    let merged = ModelCapabilities {
        length_unit: old.length_unit.clone(),
        atomic_types: sorted_union(&old.atomic_types, &new.atomic_types),
        interaction_range: old.interaction_range.max(new.interaction_range),
        outputs,
        supported_devices: old.supported_devices.clone(),
        dtype: old.dtype.clone(),
    };
    Ok((merged, novel))
}
