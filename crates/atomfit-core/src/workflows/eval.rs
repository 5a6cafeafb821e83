use crate::core::capabilities::TargetInfo;
use crate::core::models::dataset::Dataset;
use crate::core::tensor::io as tensor_io;
use crate::core::tensor::map::TensorMap;
use crate::core::tensor::ops::join_batches;
use crate::engine::data::{Batch, BatchLoader, ShardSampler, attach_neighbor_lists};
use crate::engine::distributed::SingleProcess;
use crate::engine::error::EngineError;
use crate::engine::evaluate::evaluate_model;
use crate::engine::loss::average_by_num_atoms;
use crate::engine::metrics::RmseAccumulator;
use crate::engine::model::{ExportedModel, ModelHandle};
use crate::engine::progress::{Progress, ProgressReporter};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct EvaluationReport {
    /// Predictions over the whole dataset, samples numbered by structure.
    pub predictions: BTreeMap<String, TensorMap>,
    /// Per-atom RMSEs against the dataset targets.
    pub metrics: BTreeMap<String, f64>,
}

/// Evaluates an exported model on every structure of `dataset`.
///
/// `targets` names the outputs to predict and the gradients to compute for
/// them. Metrics are only computed for targets the dataset holds.
#[instrument(skip_all, name = "evaluation_workflow")]
pub fn run(
    model: &ExportedModel,
    dataset: &mut Dataset,
    targets: &BTreeMap<String, TargetInfo>,
    batch_size: usize,
    reporter: &ProgressReporter,
) -> Result<EvaluationReport, EngineError> {
    // === Phase 0: Preparation ===
    reporter.report(Progress::PhaseStart {
        name: "Preparation",
    });
    attach_neighbor_lists(dataset, &model.requested_neighbor_lists())?;
    let datasets = std::slice::from_ref(&*dataset);
    let loader = BatchLoader::new(datasets, batch_size, false, ShardSampler::single(false, 0));
    let batches = loader.batches(0);
    reporter.report(Progress::PhaseFinish);

    // === Phase 1: Evaluation ===
    reporter.report(Progress::PhaseStart { name: "Evaluation" });
    reporter.report(Progress::TaskStart {
        total_steps: batches.len() as u64,
    });

    let mut per_batch: BTreeMap<String, Vec<TensorMap>> = BTreeMap::new();
    let mut batch_sizes = Vec::with_capacity(batches.len());
    let mut rmse = RmseAccumulator::new();
    for indices in &batches {
        let Batch {
            mut systems,
            targets: batch_targets,
        } = loader.load(indices)?;
        let predictions = evaluate_model(
            ModelHandle::Exported(model),
            &mut systems,
            targets,
            false,
        )?;

        let batch_targets: BTreeMap<String, TensorMap> = batch_targets
            .into_iter()
            .filter(|(name, _)| targets.contains_key(name))
            .collect();
        if !batch_targets.is_empty() {
            let (averaged, batch_targets) =
                average_by_num_atoms(predictions.clone(), batch_targets, &systems, &[])?;
            rmse.update(&averaged, &batch_targets)?;
        }

        for (name, map) in predictions {
            per_batch.entry(name).or_default().push(map);
        }
        batch_sizes.push(systems.len());
        reporter.report(Progress::TaskIncrement);
    }

    let predictions = per_batch
        .into_iter()
        .map(|(name, maps)| Ok((name, join_batches(&maps, &batch_sizes)?)))
        .collect::<Result<BTreeMap<_, _>, EngineError>>()?;
    let metrics = rmse.finalize(&["positions_gradients".to_string()], &SingleProcess)?;

    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);

    for (name, value) in &metrics {
        info!("{name}: {value:.4e}");
    }
    Ok(EvaluationReport {
        predictions,
        metrics,
    })
}

/// Writes one TOML file per prediction next to `path`, named
/// `<stem>_<target>.toml`, and returns the written paths.
pub fn write_predictions(
    path: &Path,
    predictions: &BTreeMap<String, TensorMap>,
) -> Result<Vec<PathBuf>, EngineError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("predictions");
    predictions
        .iter()
        .map(|(name, map)| {
            let target_path = path.with_file_name(format!("{stem}_{name}.toml"));
            tensor_io::save(&target_path, map)?;
            info!(path = %target_path.display(), "Wrote predictions for '{name}'");
            Ok(target_path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architectures::TrainableModel;
    use crate::architectures::radial_pair::{RadialPairHypersBuilder, RadialPairModel};
    use crate::core::io::dataset::parse_dataset;
    use crate::engine::composition::CompositionWeights;
    use candle_core::Device;

    const WATERS: &str = r#"
energy-unit = "eV"

[[structure]]
types = ["O", "H", "H"]
positions = [[0.0, 0.0, 0.0], [0.96, 0.0, 0.0], [-0.24, 0.93, 0.0]]
energy = -5.0
forces = [[0.0, 0.0, 0.0], [0.1, 0.0, 0.0], [0.0, 0.1, 0.0]]

[[structure]]
types = ["H", "H"]
positions = [[0.0, 0.0, 0.0], [0.74, 0.0, 0.0]]
energy = -1.0
forces = [[0.2, 0.0, 0.0], [-0.2, 0.0, 0.0]]

[[structure]]
types = ["O"]
positions = [[0.0, 0.0, 0.0]]
energy = -4.0
forces = [[0.0, 0.0, 0.0]]
"#;

    fn setup() -> (ExportedModel, Dataset, BTreeMap<String, TargetInfo>) {
        let (dataset, info) = parse_dataset(WATERS, Path::new("waters.toml"), &Device::Cpu).unwrap();
        let hypers = RadialPairHypersBuilder::new().cutoff(2.0).seed(1).build().unwrap();
        let mut model = RadialPairModel::new(hypers, &info, &Device::Cpu).unwrap();
        model
            .set_composition_weights(
                "energy",
                &CompositionWeights {
                    weights: vec![-0.5, -4.0],
                    atomic_types: vec![1, 8],
                },
            )
            .unwrap();
        let exported = ExportedModel::new(model.to_exportable());
        (exported, dataset, info.targets)
    }

    #[test]
    fn predictions_cover_every_structure_across_batches() {
        let (model, mut dataset, targets) = setup();
        let report = run(&model, &mut dataset, &targets, 2, &ProgressReporter::new()).unwrap();

        let block = report.predictions["energy"].block().unwrap();
        assert_eq!(block.samples().column("system").unwrap(), vec![0, 1, 2]);
        let forces = block.gradient("positions").unwrap();
        assert_eq!(forces.samples().count(), 6);
        assert!(report.metrics.contains_key("energy RMSE (per atom)"));
        assert!(report.metrics.contains_key("energy_positions_gradients RMSE"));
    }

    #[test]
    fn isolated_atom_energy_is_its_composition_weight() {
        let (model, mut dataset, targets) = setup();
        let report = run(&model, &mut dataset, &targets, 3, &ProgressReporter::new()).unwrap();
        let energies = report.predictions["energy"]
            .block()
            .unwrap()
            .values()
            .flatten_all()
            .unwrap()
            .to_vec1::<f64>()
            .unwrap();
        assert!((energies[2] + 4.0).abs() < 1e-12);
    }

    #[test]
    fn predictions_are_written_per_target() {
        let (model, mut dataset, targets) = setup();
        let report = run(&model, &mut dataset, &targets, 2, &ProgressReporter::new()).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let written = write_predictions(&dir.path().join("output.toml"), &report.predictions).unwrap();
        assert_eq!(written, vec![dir.path().join("output_energy.toml")]);
        let restored = tensor_io::load(&written[0], &Device::Cpu).unwrap();
        assert_eq!(
            restored.block().unwrap().samples().count(),
            report.predictions["energy"].block().unwrap().samples().count()
        );
    }
}
