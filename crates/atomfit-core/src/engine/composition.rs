use super::config::ConfigError;
use super::data::get_all_species;
use super::error::EngineError;
use crate::core::models::dataset::Dataset;
use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use tracing::debug;

const SINGULAR_VALUE_EPSILON: f64 = 1e-12;

/// Per-species offsets of a target, one weight per atomic type.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositionWeights {
    pub weights: Vec<f64>,
    pub atomic_types: Vec<i32>,
}

/// Fits per-species weights so that `sum over atoms of weight[type]`
/// approximates the `target` value of every structure, by linear least
/// squares over all samples holding the target.
///
/// # Errors
///
/// Returns [`EngineError::Composition`] when no sample holds the target or
/// the least-squares problem cannot be solved.
pub fn calculate_composition_weights(
    datasets: &[Dataset],
    target: &str,
) -> Result<CompositionWeights, EngineError> {
    let atomic_types = get_all_species(datasets);
    let failure = |reason: String| EngineError::Composition {
        target: target.to_string(),
        reason,
    };

    let mut counts = Vec::new();
    let mut values = Vec::new();
    for sample in datasets.iter().flat_map(Dataset::samples) {
        let Some(map) = sample.targets.get(target) else {
            continue;
        };
        let value = map.block()?.values().flatten_all()?.sum_all()?.to_scalar::<f64>()?;
        values.push(value);
        let mut row = vec![0.0; atomic_types.len()];
        for species in sample.system.types() {
            if let Ok(column) = atomic_types.binary_search(species) {
                row[column] += 1.0;
            }
        }
        counts.extend(row);
    }
    if values.is_empty() {
        return Err(failure("no training structure holds this target".into()));
    }

    let n_structures = values.len();
    let composition = DMatrix::from_row_slice(n_structures, atomic_types.len(), &counts);
    let solution = composition
        .svd(true, true)
        .solve(&DVector::from_vec(values), SINGULAR_VALUE_EPSILON)
        .map_err(|e| failure(e.to_string()))?;
    debug!(target, ?atomic_types, weights = ?solution.as_slice(), "Fitted composition weights");

    Ok(CompositionWeights {
        weights: solution.iter().copied().collect(),
        atomic_types,
    })
}

/// Turns user-supplied weights into [`CompositionWeights`].
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] unless the supplied atomic types are
/// exactly `atomic_types`.
pub fn fixed_composition_weights(
    target: &str,
    supplied: &BTreeMap<i32, f64>,
    atomic_types: &[i32],
) -> Result<CompositionWeights, ConfigError> {
    let supplied_types: Vec<i32> = supplied.keys().copied().collect();
    let expected: Vec<i32> = atomic_types.iter().copied().sorted_unstable().dedup().collect();
    if supplied_types != expected {
        return Err(ConfigError::InvalidValue {
            parameter: "fixed_composition_weights",
            reason: format!(
                "weights for '{target}' cover types {supplied_types:?}, but the model has {expected:?}"
            ),
        });
    }
    Ok(CompositionWeights {
        weights: supplied.values().copied().collect(),
        atomic_types: supplied_types,
    })
}
