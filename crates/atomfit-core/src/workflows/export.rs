use crate::architectures::{TrainableModel, save_model};
use crate::core::io::checkpoint::{CheckpointKind, check_file_extension};
use crate::engine::error::EngineError;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// File extension of exported models.
pub const EXPORTED_EXTENSION: &str = "atomfit";

/// Freezes `model` into an exported model file and returns its path.
///
/// The path receives the `.atomfit` extension if it has another one. Missing
/// length or output units are reported as warnings; the model is exported
/// anyway.
#[instrument(skip_all, name = "export_workflow")]
pub fn run(model: &dyn TrainableModel, path: &Path) -> Result<PathBuf, EngineError> {
    let capabilities = model.capabilities();
    if capabilities.length_unit.is_empty() {
        warn!(
            "No `length_unit` was provided for the model. As a result, lengths and those \
             derived from them (such as forces) will not be converted."
        );
    }
    for (name, output) in &capabilities.outputs {
        if output.unit.is_empty() {
            warn!(
                "No target units were provided for output '{name}'. As a result, this model \
                 output will be passed as is."
            );
        }
    }

    let path = check_file_extension(path, EXPORTED_EXTENSION);
    save_model(model, &path, CheckpointKind::Exported, None)?;
    info!(path = %path.display(), "Exported model");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architectures::load_model;
    use crate::architectures::radial_pair::{RadialPairHypersBuilder, RadialPairModel};
    use crate::core::capabilities::{DatasetInfo, TargetInfo};
    use crate::core::io::checkpoint::is_exported_file;
    use crate::engine::model::AtomisticModel;
    use candle_core::Device;
    use std::collections::BTreeMap;

    fn model(energy_unit: &str) -> RadialPairModel {
        let info = DatasetInfo {
            length_unit: "angstrom".into(),
            atomic_types: vec![1, 6],
            targets: BTreeMap::from([("energy".to_string(), TargetInfo::energy(energy_unit))]),
        };
        let hypers = RadialPairHypersBuilder::new().cutoff(3.0).build().unwrap();
        RadialPairModel::new(hypers, &info, &Device::Cpu).unwrap()
    }

    #[test]
    fn export_appends_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = run(&model("eV"), &dir.path().join("model.pt")).unwrap();

        assert_eq!(path, dir.path().join("model.pt.atomfit"));
        assert!(is_exported_file(&path));
    }

    #[test]
    fn exported_model_keeps_its_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let original = model("");
        let path = run(&original, &dir.path().join("model.atomfit")).unwrap();

        assert_eq!(path, dir.path().join("model.atomfit"));
        let exported = load_model(&path, &Device::Cpu).unwrap();
        assert_eq!(exported.capabilities(), original.capabilities());
    }
}
