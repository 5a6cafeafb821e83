use super::error::EngineError;
use crate::core::capabilities::TargetInfo;
use crate::core::models::system::System;
use crate::core::tensor::TensorMapError;
use crate::core::tensor::map::TensorMap;
use crate::core::tensor::ops::divide_by_num_atoms;
use candle_core::Tensor;
use std::collections::BTreeMap;

/// Name under which the loss and metrics of a gradient are reported.
pub fn gradient_key(target: &str, parameter: &str) -> String {
    format!("{target}_{parameter}_gradients")
}

fn mse(prediction: &Tensor, target: &Tensor) -> Result<Tensor, EngineError> {
    if prediction.dims() != target.dims() {
        return Err(TensorMapError::ShapeMismatch {
            expected: target.dims().to_vec(),
            found: prediction.dims().to_vec(),
        }
        .into());
    }
    if target.elem_count() == 0 {
        return Ok(Tensor::zeros((), prediction.dtype(), prediction.device())?);
    }
    Ok(prediction.sub(target)?.sqr()?.mean_all()?)
}

/// Weighted mean squared error of one target map: its values plus any of
/// its gradients.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMapLoss {
    pub values: f64,
    pub gradients: BTreeMap<String, f64>,
}

impl TensorMapLoss {
    pub fn compute(&self, prediction: &TensorMap, target: &TensorMap) -> Result<Tensor, EngineError> {
        let mut total: Option<Tensor> = None;
        let mut accumulate = |term: Tensor| -> Result<(), EngineError> {
            total = Some(match total.take() {
                Some(sum) => sum.add(&term)?,
                None => term,
            });
            Ok(())
        };

        for (predicted, expected) in prediction.blocks().iter().zip(target.blocks()) {
            accumulate(mse(predicted.values(), expected.values())?.affine(self.values, 0.0)?)?;
            for (parameter, weight) in &self.gradients {
                let Some(expected) = expected.gradient(parameter) else {
                    continue;
                };
                let predicted =
                    predicted
                        .gradient(parameter)
                        .ok_or_else(|| TensorMapError::InvalidGradient {
                            parameter: parameter.clone(),
                            reason: "present in the target but not in the prediction".into(),
                        })?;
                accumulate(mse(predicted.values(), expected.values())?.affine(*weight, 0.0)?)?;
            }
        }

        match total {
            Some(total) => Ok(total),
            None => Err(TensorMapError::NotSingleBlock(0).into()),
        }
    }
}

/// Sum of [`TensorMapLoss`]es over named targets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMapDictLoss {
    losses: BTreeMap<String, TensorMapLoss>,
}

impl TensorMapDictLoss {
    pub fn new(losses: BTreeMap<String, TensorMapLoss>) -> Self {
        Self { losses }
    }

    /// Unit weights for every target and requested gradient, replaced by the
    /// entries of `overrides` keyed by target name or by [`gradient_key`].
    pub fn from_targets(
        targets: &BTreeMap<String, TargetInfo>,
        overrides: &BTreeMap<String, f64>,
    ) -> Self {
        let weight = |key: &str| overrides.get(key).copied().unwrap_or(1.0);
        let losses = targets
            .iter()
            .map(|(name, info)| {
                let gradients = info
                    .gradients
                    .iter()
                    .map(|p| (p.clone(), weight(&gradient_key(name, p))))
                    .collect();
                (
                    name.clone(),
                    TensorMapLoss {
                        values: weight(name),
                        gradients,
                    },
                )
            })
            .collect();
        Self { losses }
    }

    pub fn losses(&self) -> &BTreeMap<String, TensorMapLoss> {
        &self.losses
    }

    /// Total loss over the targets present in `targets`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingOutput`] when a target has no prediction.
    pub fn compute(
        &self,
        predictions: &BTreeMap<String, TensorMap>,
        targets: &BTreeMap<String, TensorMap>,
    ) -> Result<Tensor, EngineError> {
        let mut total: Option<Tensor> = None;
        for (name, target) in targets {
            let Some(loss) = self.losses.get(name) else {
                continue;
            };
            let prediction = predictions
                .get(name)
                .ok_or_else(|| EngineError::MissingOutput(name.clone()))?;
            let term = loss.compute(prediction, target)?;
            total = Some(match total {
                Some(sum) => sum.add(&term)?,
                None => term,
            });
        }
        total.ok_or_else(|| EngineError::Internal("no target to compute a loss on".into()))
    }
}

/// Divides predictions and targets by the atom counts of their structures,
/// except for `per_structure_targets`.
pub fn average_by_num_atoms(
    predictions: BTreeMap<String, TensorMap>,
    targets: BTreeMap<String, TensorMap>,
    systems: &[System],
    per_structure_targets: &[String],
) -> Result<(BTreeMap<String, TensorMap>, BTreeMap<String, TensorMap>), EngineError> {
    let num_atoms: Vec<usize> = systems.iter().map(System::len).collect();
    let average = |maps: BTreeMap<String, TensorMap>| {
        maps.into_iter()
            .map(|(name, map)| {
                if per_structure_targets.contains(&name) {
                    Ok((name, map))
                } else {
                    Ok((name, divide_by_num_atoms(&map, &num_atoms)?))
                }
            })
            .collect::<Result<BTreeMap<_, _>, EngineError>>()
    };
    Ok((average(predictions)?, average(targets)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tensor::block::TensorBlock;
    use crate::core::tensor::labels::Labels;
    use candle_core::Device;

    const TOLERANCE: f64 = 1e-12;

    fn energy(values: &[f64], forces: Option<&[f64]>) -> TensorMap {
        let n = values.len();
        let mut block = TensorBlock::new(
            Tensor::from_vec(values.to_vec(), (n, 1), &Device::Cpu).unwrap(),
            Labels::range("system", n),
            vec![],
            Labels::range("energy", 1),
        )
        .unwrap();
        if let Some(forces) = forces {
            let atoms = forces.len() / 3;
            block
                .add_gradient(
                    "positions",
                    TensorBlock::new(
                        Tensor::from_vec(forces.to_vec(), (atoms, 3, 1), &Device::Cpu).unwrap(),
                        Labels::new(&["sample", "atom"], (0..atoms).map(|a| vec![0, a as i32]).collect())
                            .unwrap(),
                        vec![Labels::range("xyz", 3)],
                        Labels::range("energy", 1),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        TensorMap::single(block)
    }

    fn scalar(tensor: Tensor) -> f64 {
        tensor.to_scalar::<f64>().unwrap()
    }

    #[test]
    fn loss_weights_values_and_gradients() {
        let targets = BTreeMap::from([(
            "energy".to_string(),
            TargetInfo::energy("eV").with_gradient("positions"),
        )]);
        let overrides = BTreeMap::from([("energy_positions_gradients".to_string(), 0.5)]);
        let loss = TensorMapDictLoss::from_targets(&targets, &overrides);

        let prediction = BTreeMap::from([(
            "energy".to_string(),
            energy(&[1.0, 2.0], Some(&[1.0, 0.0, 0.0])),
        )]);
        let reference = BTreeMap::from([(
            "energy".to_string(),
            energy(&[0.0, 0.0], Some(&[0.0, 0.0, 3.0])),
        )]);

        // values: (1 + 4) / 2 = 2.5, gradients: 0.5 * (1 + 9) / 3
        let value = scalar(loss.compute(&prediction, &reference).unwrap());
        assert!((value - (2.5 + 0.5 * 10.0 / 3.0)).abs() < TOLERANCE);
    }

    #[test]
    fn gradients_missing_from_the_target_are_skipped() {
        let targets = BTreeMap::from([(
            "energy".to_string(),
            TargetInfo::energy("eV").with_gradient("positions"),
        )]);
        let loss = TensorMapDictLoss::from_targets(&targets, &BTreeMap::new());
        let prediction = BTreeMap::from([("energy".to_string(), energy(&[3.0], Some(&[1.0, 1.0, 1.0])))]);
        let reference = BTreeMap::from([("energy".to_string(), energy(&[1.0], None))]);

        let value = scalar(loss.compute(&prediction, &reference).unwrap());
        assert!((value - 4.0).abs() < TOLERANCE);
    }

    #[test]
    fn missing_prediction_is_an_error() {
        let targets = BTreeMap::from([("energy".to_string(), TargetInfo::energy("eV"))]);
        let loss = TensorMapDictLoss::from_targets(&targets, &BTreeMap::new());
        let reference = BTreeMap::from([("energy".to_string(), energy(&[1.0], None))]);
        assert!(matches!(
            loss.compute(&BTreeMap::new(), &reference),
            Err(EngineError::MissingOutput(_))
        ));
    }

    #[test]
    fn per_structure_targets_are_not_averaged() {
        let positions = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        let systems = [System::from_coordinates(&positions, vec![1, 1], None, &Device::Cpu).unwrap()];
        let maps = || {
            BTreeMap::from([
                ("energy".to_string(), energy(&[4.0], None)),
                ("free".to_string(), energy(&[4.0], None)),
            ])
        };

        let (predictions, _) =
            average_by_num_atoms(maps(), maps(), &systems, &["free".to_string()]).unwrap();
        let value = |name: &str| {
            predictions[name].block().unwrap().values().flatten_all().unwrap().to_vec1::<f64>().unwrap()[0]
        };
        assert!((value("energy") - 2.0).abs() < TOLERANCE);
        assert!((value("free") - 4.0).abs() < TOLERANCE);
    }
}
