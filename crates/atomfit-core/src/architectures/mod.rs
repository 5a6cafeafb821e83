//! Model architectures that can be trained, checkpointed and exported.
//!
//! An architecture implements [`TrainableModel`] on top of
//! [`AtomisticModel`]; the functions of this module turn such models into
//! checkpoint files and back.

pub mod radial_pair;

use crate::core::capabilities::DatasetInfo;
use crate::core::io::checkpoint::{
    CheckpointError, CheckpointKind, CheckpointMetadata, load_checkpoint, reject_options_file,
    save_checkpoint,
};
use crate::engine::composition::CompositionWeights;
use crate::engine::model::{AtomisticModel, ExportedModel, ModelError};
use candle_core::{Device, Tensor, Var};
use radial_pair::{ARCHITECTURE_NAME, RadialPairModel};
use std::path::Path;
use tracing::info;

/// A model whose parameters can be optimized and persisted.
pub trait TrainableModel: AtomisticModel {
    fn architecture_name(&self) -> &'static str;

    /// Hyperparameters as stored in checkpoint metadata.
    fn hypers_value(&self) -> Result<toml::Value, CheckpointError>;

    fn dataset_info(&self) -> &DatasetInfo;

    fn trainable_variables(&self) -> Vec<Var>;

    fn set_composition_weights(
        &mut self,
        output: &str,
        weights: &CompositionWeights,
    ) -> Result<(), ModelError>;

    /// Every tensor needed to rebuild the model, by name.
    fn state_tensors(&self) -> Vec<(String, Tensor)>;

    /// A copy of the model to wrap in an [`ExportedModel`].
    fn to_exportable(&self) -> Box<dyn AtomisticModel>;
}

/// Writes `model` to `path` as a training checkpoint or an exported model.
pub fn save_model(
    model: &dyn TrainableModel,
    path: &Path,
    kind: CheckpointKind,
    epoch: Option<usize>,
) -> Result<(), CheckpointError> {
    let metadata = CheckpointMetadata {
        kind,
        architecture: model.architecture_name().to_string(),
        epoch,
        hypers: model.hypers_value()?,
        dataset_info: model.dataset_info().clone(),
        capabilities: model.capabilities().clone(),
    };
    save_checkpoint(path, &metadata, &model.state_tensors())
}

/// Loads a trainable model from a checkpoint, together with the epoch the
/// checkpoint was written at.
///
/// With `architecture`, the checkpoint must have been written by that
/// architecture.
pub fn load_trainable(
    path: &Path,
    architecture: Option<&str>,
    device: &Device,
) -> Result<(RadialPairModel, Option<usize>), CheckpointError> {
    let checkpoint = load_checkpoint(path, device)?;
    let found = checkpoint.metadata.architecture.as_str();
    if let Some(expected) = architecture.filter(|expected| *expected != found) {
        return Err(CheckpointError::ArchitectureMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    match found {
        ARCHITECTURE_NAME => {
            info!(path = %path.display(), epoch = ?checkpoint.metadata.epoch, "Loaded checkpoint");
            let model = RadialPairModel::from_checkpoint(&checkpoint, device)?;
            Ok((model, checkpoint.metadata.epoch))
        }
        other => Err(CheckpointError::UnknownArchitecture(other.to_string())),
    }
}

/// Loads a model for evaluation from an exported file or a checkpoint.
///
/// # Errors
///
/// Returns [`CheckpointError::OptionsFile`] when `path` looks like an
/// options file instead of a model.
pub fn load_model(path: &Path, device: &Device) -> Result<ExportedModel, CheckpointError> {
    reject_options_file(path)?;
    let (model, _) = load_trainable(path, None, device)?;
    Ok(ExportedModel::new(model.to_exportable()))
}

#[cfg(test)]
mod tests {
    use super::radial_pair::RadialPairHypersBuilder;
    use super::*;
    use crate::core::capabilities::TargetInfo;
    use crate::core::capabilities::ModelOutput;
    use crate::core::io::checkpoint::is_exported_file;
    use crate::core::models::neighbors::NeighborListOptions;
    use crate::core::models::system::System;
    use crate::engine::model::EvaluationOptions;
    use std::collections::BTreeMap;

    fn model() -> RadialPairModel {
        let info = DatasetInfo {
            length_unit: "angstrom".into(),
            atomic_types: vec![1, 8],
            targets: BTreeMap::from([("energy".to_string(), TargetInfo::energy("eV"))]),
        };
        let hypers = RadialPairHypersBuilder::new()
            .cutoff(2.5)
            .num_basis(3)
            .seed(9)
            .build()
            .unwrap();
        let mut model = RadialPairModel::new(hypers, &info, &Device::Cpu).unwrap();
        model
            .set_composition_weights(
                "energy",
                &CompositionWeights {
                    weights: vec![-0.5, -2.0],
                    atomic_types: vec![1, 8],
                },
            )
            .unwrap();
        model
    }

    fn water() -> System {
        let mut system = System::from_coordinates(
            &[[0.0, 0.0, 0.0], [0.96, 0.0, 0.0], [-0.24, 0.93, 0.0]],
            vec![8, 1, 1],
            None,
            &Device::Cpu,
        )
        .unwrap();
        system
            .attach_neighbor_list(NeighborListOptions::new(2.5, true))
            .unwrap();
        system
    }

    fn energy(model: &dyn AtomisticModel) -> f64 {
        let outputs = BTreeMap::from([("energy".to_string(), ModelOutput::new("energy", "eV", false))]);
        model.forward(&[water()], &outputs, None).unwrap()["energy"]
            .block()
            .unwrap()
            .values()
            .flatten_all()
            .unwrap()
            .to_vec1::<f64>()
            .unwrap()[0]
    }

    #[test]
    fn checkpoint_restores_identical_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        let original = model();

        save_model(&original, &path, CheckpointKind::Training, Some(4)).unwrap();
        let (restored, epoch) = load_trainable(&path, Some(ARCHITECTURE_NAME), &Device::Cpu).unwrap();

        assert_eq!(epoch, Some(4));

        assert_eq!(restored.hypers(), original.hypers());
        assert_eq!(restored.capabilities(), original.capabilities());
        assert!((energy(&restored) - energy(&original)).abs() < 1e-12);
    }

    #[test]
    fn architecture_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        save_model(&model(), &path, CheckpointKind::Training, None).unwrap();

        assert!(matches!(
            load_trainable(&path, Some("pet"), &Device::Cpu),
            Err(CheckpointError::ArchitectureMismatch { .. })
        ));
    }

    #[test]
    fn exported_model_evaluates_like_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.atomfit");
        let original = model();
        save_model(&original, &path, CheckpointKind::Exported, None).unwrap();
        assert!(is_exported_file(&path));

        let exported = load_model(&path, &Device::Cpu).unwrap();
        let options = EvaluationOptions {
            length_unit: "angstrom".into(),
            outputs: BTreeMap::from([("energy".to_string(), ModelOutput::new("energy", "eV", false))]),
            selected_atoms: None,
        };
        let outputs = exported.evaluate(&[water()], &options, true).unwrap();
        let value = outputs["energy"].block().unwrap().values().flatten_all().unwrap().to_vec1::<f64>().unwrap()[0];
        assert!((value - energy(&original)).abs() < 1e-12);
    }

    #[test]
    fn options_files_are_not_models() {
        assert!(matches!(
            load_model(Path::new("options.yaml"), &Device::Cpu),
            Err(CheckpointError::OptionsFile(_))
        ));
    }
}
