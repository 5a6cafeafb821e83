use super::error::EngineError;
use super::model::{EvaluationOptions, ModelError, ModelHandle};
use crate::core::capabilities::{ModelOutput, TargetInfo};
use crate::core::models::system::System;
use crate::core::tensor::block::TensorBlock;
use crate::core::tensor::labels::Labels;
use crate::core::tensor::map::TensorMap;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use std::collections::BTreeMap;
use std::sync::Once;
use tracing::debug;

/// Read by candle at the first backward pass of every thread.
const KEEP_GRADIENT_GRAPHS_VARIABLE: &str = "CANDLE_GRAD_DO_NOT_DETACH";

static KEEP_GRADIENT_GRAPHS: Once = Once::new();

/// Makes backward passes record the operations that produce gradients, so
/// that a loss on forces or stresses can be differentiated again with
/// respect to the model parameters.
///
/// candle reads the switch once per thread, at that thread's first backward
/// pass. Call this before it; [`evaluate_model`] in training mode and the
/// training workflow do so.
pub fn keep_gradient_graphs() {
    KEEP_GRADIENT_GRAPHS.call_once(|| {
        // SAFETY: the environment is only accessed through `std::env`, which
        // serializes reads and writes.
        unsafe { std::env::set_var(KEEP_GRADIENT_GRAPHS_VARIABLE, "1") };
        debug!("Backward passes now keep gradient graphs");
    });
}

/// How position variables are introduced for a position-only evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionTracking {
    /// Build new systems around a tracked copy of the positions.
    FreshCopies,
    /// Swap the positions of the caller's systems for tracked tensors.
    InPlace,
}

impl From<&ModelHandle<'_>> for PositionTracking {
    fn from(model: &ModelHandle<'_>) -> Self {
        if model.is_exported() {
            PositionTracking::InPlace
        } else {
            PositionTracking::FreshCopies
        }
    }
}

#[derive(Default)]
struct TrackedVariables {
    positions: Vec<Var>,
    strains: Vec<Var>,
}

fn tracked_positions(system: &System) -> Result<Var, EngineError> {
    Ok(Var::from_tensor(&system.positions().detach())?)
}

/// Evaluates `model` on `systems` and attaches the requested gradients of
/// every energy target.
///
/// Energy targets asking for `positions` gradients get a gradient block
/// with samples `(sample, atom)` and one `xyz` component; `strain` gradients
/// get samples `(sample)` and components `xyz_1`, `xyz_2`. When
/// `is_training` is false the gradients are detached from the autograd
/// graph; otherwise they keep their dependence on the model parameters (see
/// [`keep_gradient_graphs`]), so losses on them train the model.
///
/// Exported models have the positions of `systems` replaced in place by
/// tracked tensors when only position gradients are needed. All other cases
/// work on copies and leave `systems` untouched.
///
/// # Errors
///
/// Returns [`EngineError::MissingOutput`] when a target is not a model
/// output and [`EngineError::NonPeriodicStrain`] when strain gradients are
/// requested for systems without a cell.
pub fn evaluate_model(
    model: ModelHandle<'_>,
    systems: &mut [System],
    targets: &BTreeMap<String, TargetInfo>,
    is_training: bool,
) -> Result<BTreeMap<String, TensorMap>, EngineError> {
    if is_training {
        keep_gradient_graphs();
    }
    let capabilities = model.capabilities();
    if let Some(name) = targets
        .keys()
        .find(|name| !capabilities.outputs.contains_key(*name))
    {
        return Err(EngineError::MissingOutput(name.clone()));
    }

    let wants = |parameter: &str| {
        targets
            .values()
            .any(|t| t.is_energy() && t.gradients.contains(parameter))
    };
    let (needs_positions, needs_strain) = (wants("positions"), wants("strain"));

    let mut tracked = TrackedVariables::default();
    let mut copies: Option<Vec<System>> = None;

    if needs_strain {
        let non_periodic: Vec<usize> = systems
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_periodic())
            .map(|(i, _)| i)
            .collect();
        if !non_periodic.is_empty() {
            return Err(EngineError::NonPeriodicStrain(non_periodic));
        }

        let mut strained = Vec::with_capacity(systems.len());
        for system in systems.iter() {
            let strain = Var::from_tensor(&Tensor::eye(3, DType::F64, system.device())?)?;
            let positions = if needs_positions {
                let var = tracked_positions(system)?;
                let tensor = var.as_tensor().clone();
                tracked.positions.push(var);
                tensor
            } else {
                system.positions().detach()
            };
            strained.push(system.with_positions_and_cell(
                positions.matmul(strain.as_tensor())?,
                system.cell().detach().matmul(strain.as_tensor())?,
            )?);
            tracked.strains.push(strain);
        }
        copies = Some(strained);
    } else if needs_positions {
        match PositionTracking::from(&model) {
            PositionTracking::FreshCopies => {
                let mut fresh = Vec::with_capacity(systems.len());
                for system in systems.iter() {
                    let var = tracked_positions(system)?;
                    fresh.push(
                        system.with_positions_and_cell(var.as_tensor().clone(), system.cell().clone())?,
                    );
                    tracked.positions.push(var);
                }
                copies = Some(fresh);
            }
            PositionTracking::InPlace => {
                for system in systems.iter_mut() {
                    let var = tracked_positions(system)?;
                    system.replace_positions(var.as_tensor().clone())?;
                    tracked.positions.push(var);
                }
            }
        }
    }
    let inputs: &[System] = copies.as_deref().unwrap_or(&*systems);

    let requested: BTreeMap<String, ModelOutput> = targets
        .iter()
        .map(|(name, target)| (name.clone(), target.to_model_output()))
        .collect();
    debug!(
        outputs = ?requested.keys().collect::<Vec<_>>(),
        needs_positions, needs_strain, "Evaluating model"
    );

    let mut predictions = match model {
        ModelHandle::Training(model) => model.forward(inputs, &requested, None)?,
        ModelHandle::Exported(model) => {
            let options = EvaluationOptions {
                length_unit: String::new(),
                outputs: requested.clone(),
                selected_atoms: None,
            };
            model.evaluate(inputs, &options, true)?
        }
    };
    predictions.retain(|name, _| targets.contains_key(name));

    for (name, target) in targets {
        let map = predictions.get(name).ok_or_else(|| ModelError::InconsistentOutput {
            name: name.clone(),
            reason: "requested but not returned".into(),
        })?;
        if !target.is_energy() || target.gradients.is_empty() {
            continue;
        }

        let mut block = map.block()?.clone();
        let grads = block.values().sum_all()?.backward()?;
        if target.gradients.contains("positions") {
            let gradient = positions_gradient(&grads, &tracked.positions, inputs, &block, is_training)?;
            block.add_gradient("positions", gradient)?;
        }
        if target.gradients.contains("strain") {
            let gradient = strain_gradient(&grads, &tracked.strains, &block, is_training)?;
            block.add_gradient("strain", gradient)?;
        }
        let rebuilt = TensorMap::new(map.keys().clone(), vec![block])?;
        predictions.insert(name.clone(), rebuilt);
    }

    Ok(predictions)
}

fn gradient_of(grads: &GradStore, var: &Var, is_training: bool) -> Result<Tensor, EngineError> {
    let gradient = match grads.get(var.as_tensor()) {
        Some(gradient) => gradient.clone(),
        None => var.as_tensor().zeros_like()?,
    };
    Ok(if is_training {
        gradient
    } else {
        gradient.detach()
    })
}

fn positions_gradient(
    grads: &GradStore,
    variables: &[Var],
    systems: &[System],
    parent: &TensorBlock,
    is_training: bool,
) -> Result<TensorBlock, EngineError> {
    let mut values = Vec::with_capacity(variables.len());
    let mut samples = Vec::new();
    for (index, (var, system)) in variables.iter().zip(systems).enumerate() {
        values.push(gradient_of(grads, var, is_training)?);
        for atom in 0..system.len() {
            samples.extend_from_slice(&[index as i32, atom as i32]);
        }
    }
    let values = Tensor::cat(&values, 0)?.unsqueeze(2)?;
    Ok(TensorBlock::new(
        values,
        Labels::from_flat(vec!["sample".into(), "atom".into()], samples)?,
        vec![Labels::range("xyz", 3)],
        parent.properties().clone(),
    )?)
}

fn strain_gradient(
    grads: &GradStore,
    variables: &[Var],
    parent: &TensorBlock,
    is_training: bool,
) -> Result<TensorBlock, EngineError> {
    let values = variables
        .iter()
        .map(|var| gradient_of(grads, var, is_training))
        .collect::<Result<Vec<_>, _>>()?;
    let values = Tensor::stack(&values, 0)?.unsqueeze(3)?;
    Ok(TensorBlock::new(
        values,
        Labels::range("sample", variables.len()),
        vec![Labels::range("xyz_1", 3), Labels::range("xyz_2", 3)],
        parent.properties().clone(),
    )?)
}
