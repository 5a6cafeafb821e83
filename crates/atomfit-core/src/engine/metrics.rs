use super::distributed::Communicator;
use super::error::EngineError;
use super::loss::gradient_key;
use crate::core::capabilities::ModelCapabilities;
use crate::core::tensor::map::TensorMap;
use candle_core::Tensor;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SquaredError {
    sum: f64,
    count: usize,
}

fn squared_error(prediction: &Tensor, target: &Tensor) -> Result<SquaredError, EngineError> {
    let sum = prediction
        .detach()
        .sub(&target.detach())?
        .sqr()?
        .sum_all()?
        .to_scalar::<f64>()?;
    Ok(SquaredError {
        sum,
        count: target.elem_count(),
    })
}

/// Accumulates root mean squared errors of values and gradients over the
/// batches of an epoch.
#[derive(Debug, Clone, Default)]
pub struct RmseAccumulator {
    information: BTreeMap<String, SquaredError>,
}

impl RmseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        predictions: &BTreeMap<String, TensorMap>,
        targets: &BTreeMap<String, TensorMap>,
    ) -> Result<(), EngineError> {
        for (name, target) in targets {
            let prediction = predictions
                .get(name)
                .ok_or_else(|| EngineError::MissingOutput(name.clone()))?;
            for (predicted, expected) in prediction.blocks().iter().zip(target.blocks()) {
                self.add(name.clone(), squared_error(predicted.values(), expected.values())?);
                for (parameter, expected) in expected.gradients() {
                    if let Some(predicted) = predicted.gradient(parameter) {
                        self.add(
                            gradient_key(name, parameter),
                            squared_error(predicted.values(), expected.values())?,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn add(&mut self, key: String, error: SquaredError) {
        let entry = self.information.entry(key).or_default();
        entry.sum += error.sum;
        entry.count += error.count;
    }

    /// Final RMSEs named `<key> RMSE`, or `<key> RMSE (per atom)` unless the
    /// key contains one of `not_per_atom`.
    ///
    /// Sums and counts are reduced over `communicator` first, so every rank
    /// must have accumulated the same keys.
    pub fn finalize(
        &self,
        not_per_atom: &[String],
        communicator: &dyn Communicator,
    ) -> Result<BTreeMap<String, f64>, EngineError> {
        let mut reduced: Vec<f64> = self
            .information
            .values()
            .flat_map(|e| [e.sum, e.count as f64])
            .collect();
        communicator.all_reduce_sum(&mut reduced)?;

        Ok(self
            .information
            .keys()
            .zip(reduced.chunks_exact(2))
            .map(|(key, pair)| {
                let name = if not_per_atom.iter().any(|s| key.contains(s.as_str())) {
                    format!("{key} RMSE")
                } else {
                    format!("{key} RMSE (per atom)")
                };
                let rmse = if pair[1] > 0.0 {
                    (pair[0] / pair[1]).sqrt()
                } else {
                    0.0
                };
                (name, rmse)
            })
            .collect())
    }
}

/// Writes epoch metrics to the log and, optionally, to a CSV history.
pub struct MetricLogger {
    names: Vec<String>,
    units: BTreeMap<String, String>,
    history: Option<(String, csv::Writer<File>)>,
    columns: Vec<String>,
}

impl MetricLogger {
    /// `names` label the metric sets passed to [`MetricLogger::log`], for
    /// instance `["train", "validation"]`.
    pub fn new(capabilities: &ModelCapabilities, names: &[&str]) -> Self {
        let mut units = BTreeMap::new();
        for (name, output) in &capabilities.outputs {
            units.insert(name.clone(), output.unit.clone());
            if !output.unit.is_empty() && !capabilities.length_unit.is_empty() {
                units.insert(
                    gradient_key(name, "positions"),
                    format!("{}/{}", output.unit, capabilities.length_unit),
                );
                units.insert(gradient_key(name, "strain"), output.unit.clone());
            }
        }
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            units,
            history: None,
            columns: Vec::new(),
        }
    }

    pub fn with_history(mut self, path: &Path) -> Result<Self, EngineError> {
        let writer = csv::Writer::from_path(path).map_err(|source| EngineError::History {
            path: path.display().to_string(),
            source,
        })?;
        self.history = Some((path.display().to_string(), writer));
        Ok(self)
    }

    fn unit_of(&self, metric: &str) -> Option<&str> {
        let key = metric.split(" RMSE").next()?;
        self.units
            .get(key)
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }

    pub fn log(&mut self, metrics: &[BTreeMap<String, f64>], epoch: usize) -> Result<(), EngineError> {
        let mut parts = Vec::new();
        let mut row = vec![epoch.to_string()];
        let mut columns = vec!["epoch".to_string()];
        for (name, values) in self.names.iter().zip(metrics) {
            for (metric, value) in values {
                let unit = self.unit_of(metric).map(|u| format!(" {u}")).unwrap_or_default();
                parts.push(format!("{name} {metric}: {value:.4e}{unit}"));
                columns.push(format!("{name} {metric}"));
                row.push(value.to_string());
            }
        }
        info!("Epoch {epoch:>4}, {}", parts.join(", "));

        if let Some((path, writer)) = &mut self.history {
            let write_error = |source| EngineError::History {
                path: path.clone(),
                source,
            };
            if self.columns.is_empty() {
                writer.write_record(&columns).map_err(write_error)?;
                self.columns = columns;
            }
            writer.write_record(&row).map_err(write_error)?;
            writer
                .flush()
                .map_err(|e| write_error(csv::Error::from(e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capabilities::{DatasetInfo, TargetInfo};
    use crate::core::tensor::block::TensorBlock;
    use crate::core::tensor::labels::Labels;
    use crate::engine::distributed::{SingleProcess, ThreadGroup};
    use candle_core::Device;

    const TOLERANCE: f64 = 1e-12;

    fn energy(values: &[f64]) -> BTreeMap<String, TensorMap> {
        let block = TensorBlock::new(
            Tensor::from_vec(values.to_vec(), (values.len(), 1), &Device::Cpu).unwrap(),
            Labels::range("system", values.len()),
            vec![],
            Labels::range("energy", 1),
        )
        .unwrap();
        BTreeMap::from([("energy".to_string(), TensorMap::single(block))])
    }

    #[test]
    fn rmse_accumulates_over_batches() {
        let mut accumulator = RmseAccumulator::new();
        accumulator.update(&energy(&[1.0, 1.0]), &energy(&[0.0, 0.0])).unwrap();
        accumulator.update(&energy(&[3.0]), &energy(&[0.0])).unwrap();

        let finalized = accumulator.finalize(&[], &SingleProcess).unwrap();
        let expected = (11.0f64 / 3.0).sqrt();
        assert!((finalized["energy RMSE (per atom)"] - expected).abs() < TOLERANCE);
    }

    #[test]
    fn per_structure_keys_are_not_marked_per_atom() {
        let mut accumulator = RmseAccumulator::new();
        accumulator.update(&energy(&[2.0]), &energy(&[0.0])).unwrap();
        let finalized = accumulator
            .finalize(&["energy".to_string()], &SingleProcess)
            .unwrap();
        assert!((finalized["energy RMSE"] - 2.0).abs() < TOLERANCE);
    }

    #[test]
    fn finalize_reduces_over_the_group() {
        let members = ThreadGroup::new(2).unwrap();
        let results: Vec<f64> = std::thread::scope(|scope| {
            let handles: Vec<_> = members
                .iter()
                .map(|member| {
                    scope.spawn(move || {
                        let mut accumulator = RmseAccumulator::new();
                        let error = if member.rank() == 0 { 1.0 } else { 3.0 };
                        accumulator.update(&energy(&[error]), &energy(&[0.0])).unwrap();
                        accumulator.finalize(&[], member).unwrap()["energy RMSE (per atom)"]
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for rmse in results {
            assert!((rmse - 5.0f64.sqrt()).abs() < TOLERANCE);
        }
    }

    #[test]
    fn logger_writes_csv_history() {
        let info = DatasetInfo {
            length_unit: "angstrom".into(),
            atomic_types: vec![1],
            targets: BTreeMap::from([("energy".to_string(), TargetInfo::energy("eV"))]),
        };
        let capabilities = ModelCapabilities::from_dataset_info(&info, 3.0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");

        let mut logger = MetricLogger::new(&capabilities, &["train", "validation"])
            .with_history(&path)
            .unwrap();
        assert_eq!(logger.unit_of("energy RMSE (per atom)"), Some("eV"));
        assert_eq!(
            logger.unit_of("energy_positions_gradients RMSE"),
            Some("eV/angstrom")
        );
        let metrics = |loss: f64| BTreeMap::from([("loss".to_string(), loss)]);
        logger.log(&[metrics(1.0), metrics(2.0)], 0).unwrap();
        logger.log(&[metrics(0.5), metrics(1.5)], 1).unwrap();
        drop(logger);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "epoch,train loss,validation loss");
        assert_eq!(lines[2], "1,0.5,1.5");
    }
}
