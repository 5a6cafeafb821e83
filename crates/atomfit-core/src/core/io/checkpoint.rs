use crate::core::capabilities::{DatasetInfo, ModelCapabilities};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::{SafeTensorError, SafeTensors, TensorView};
use safetensors::Dtype;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const METADATA_KEY: &str = "atomfit";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid safetensors data: {0}")]
    SafeTensors(#[from] SafeTensorError),

    #[error("Invalid checkpoint metadata: {0}")]
    Metadata(String),

    #[error("File '{0}' carries no model metadata")]
    MissingMetadata(PathBuf),

    #[error("Tensor '{name}' has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("Checkpoint has no tensor named '{0}'")]
    MissingTensor(String),

    #[error("'{0}' looks like an options file, not a model")]
    OptionsFile(PathBuf),

    #[error("Unknown architecture '{0}'")]
    UnknownArchitecture(String),

    #[error("'{path}' holds a '{found}' model, not '{expected}'")]
    ArchitectureMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointKind {
    /// Parameters and state needed to resume training.
    Training,
    /// A frozen model for evaluation only.
    Exported,
}

/// Everything about a model that is not a parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckpointMetadata {
    pub kind: CheckpointKind,
    pub architecture: String,
    pub epoch: Option<usize>,
    pub hypers: toml::Value,
    pub dataset_info: DatasetInfo,
    pub capabilities: ModelCapabilities,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub tensors: BTreeMap<String, Tensor>,
}

impl Checkpoint {
    pub fn tensor(&self, name: &str) -> Result<&Tensor, CheckpointError> {
        self.tensors
            .get(name)
            .ok_or_else(|| CheckpointError::MissingTensor(name.to_string()))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes named tensors and metadata to a safetensors file.
///
/// Tensors are stored as little-endian f64; the metadata is a TOML document
/// in the safetensors header.
pub fn save_checkpoint(
    path: &Path,
    metadata: &CheckpointMetadata,
    tensors: &[(String, Tensor)],
) -> Result<(), CheckpointError> {
    let header = toml::to_string(metadata).map_err(|e| CheckpointError::Metadata(e.to_string()))?;

    let mut buffers = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let bytes: Vec<u8> = tensor
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        buffers.push((name.as_str(), tensor.dims().to_vec(), bytes));
    }
    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| Ok((*name, TensorView::new(Dtype::F64, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>, SafeTensorError>>()?;

    let info = Some(HashMap::from([(METADATA_KEY.to_string(), header)]));
    let serialized = safetensors::tensor::serialize(views, &info)?;
    std::fs::write(path, serialized).map_err(io_error(path))?;
    debug!(path = %path.display(), tensors = tensors.len(), "Saved checkpoint");
    Ok(())
}

fn read_metadata(path: &Path, bytes: &[u8]) -> Result<CheckpointMetadata, CheckpointError> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let content = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(METADATA_KEY))
        .ok_or_else(|| CheckpointError::MissingMetadata(path.to_path_buf()))?;
    toml::from_str(content).map_err(|e| CheckpointError::Metadata(e.to_string()))
}

/// Reads a file written by [`save_checkpoint`].
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<Checkpoint, CheckpointError> {
    reject_options_file(path)?;
    let bytes = std::fs::read(path).map_err(io_error(path))?;
    let metadata = read_metadata(path, &bytes)?;

    let safetensors = SafeTensors::deserialize(&bytes)?;
    let mut tensors = BTreeMap::new();
    for (name, view) in safetensors.tensors() {
        if view.dtype() != Dtype::F64 {
            return Err(CheckpointError::UnsupportedDtype {
                name,
                dtype: format!("{:?}", view.dtype()),
            });
        }
        let values: Vec<f64> = view
            .data()
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        tensors.insert(name, Tensor::from_vec(values, view.shape().to_vec(), device)?);
    }
    Ok(Checkpoint { metadata, tensors })
}

/// Whether `path` holds an exported model rather than a training checkpoint.
pub fn is_exported_file(path: &Path) -> bool {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| read_metadata(path, &bytes).ok())
        .is_some_and(|metadata| metadata.kind == CheckpointKind::Exported)
}

/// Rejects paths with an options-file extension (`.yaml`, `.yml`, `.toml`).
pub fn reject_options_file(path: &Path) -> Result<(), CheckpointError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml" | "toml") => Err(CheckpointError::OptionsFile(path.to_path_buf())),
        _ => Ok(()),
    }
}

/// Returns `path` with the expected `extension`, appending it with a warning
/// when the path ends differently.
pub fn check_file_extension(path: &Path, extension: &str) -> PathBuf {
    let expected = extension.trim_start_matches('.');
    if path.extension().and_then(|e| e.to_str()) == Some(expected) {
        return path.to_path_buf();
    }
    let mut fixed = path.as_os_str().to_os_string();
    fixed.push(".");
    fixed.push(expected);
    let fixed = PathBuf::from(fixed);
    warn!(
        "The file name should have a '.{expected}' extension; using '{}' instead of '{}'",
        fixed.display(),
        path.display()
    );
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capabilities::TargetInfo;

    fn metadata(kind: CheckpointKind) -> CheckpointMetadata {
        let info = DatasetInfo {
            length_unit: "angstrom".into(),
            atomic_types: vec![1, 8],
            targets: BTreeMap::from([("energy".to_string(), TargetInfo::energy("eV"))]),
        };
        CheckpointMetadata {
            kind,
            architecture: "radial-pair".into(),
            epoch: Some(3),
            hypers: toml::Value::Table(toml::Table::from_iter([(
                "cutoff".to_string(),
                toml::Value::Float(4.0),
            )])),
            capabilities: ModelCapabilities::from_dataset_info(&info, 4.0),
            dataset_info: info,
        }
    }

    #[test]
    fn checkpoint_round_trips_tensors_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        let weights = Tensor::from_vec(vec![1.0, -2.5, 3.25, 0.0], (2, 2), &Device::Cpu).unwrap();

        save_checkpoint(
            &path,
            &metadata(CheckpointKind::Training),
            &[("weights".to_string(), weights)],
        )
        .unwrap();
        let loaded = load_checkpoint(&path, &Device::Cpu).unwrap();

        assert_eq!(loaded.metadata, metadata(CheckpointKind::Training));
        let weights = loaded.tensor("weights").unwrap();
        assert_eq!(weights.dims(), &[2, 2]);
        assert_eq!(
            weights.to_vec2::<f64>().unwrap(),
            vec![vec![1.0, -2.5], vec![3.25, 0.0]]
        );
        assert!(matches!(
            loaded.tensor("bias"),
            Err(CheckpointError::MissingTensor(_))
        ));
        assert!(!is_exported_file(&path));
    }

    #[test]
    fn exported_files_are_recognized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.atomfit");
        save_checkpoint(&path, &metadata(CheckpointKind::Exported), &[]).unwrap();

        assert!(is_exported_file(&path));
        assert!(!is_exported_file(&dir.path().join("missing.atomfit")));
    }

    #[test]
    fn options_files_are_not_loaded_as_models() {
        for name in ["options.yaml", "options.yml", "options.toml"] {
            assert!(matches!(
                load_checkpoint(Path::new(name), &Device::Cpu),
                Err(CheckpointError::OptionsFile(_))
            ));
        }
    }

    #[test]
    fn file_extension_is_appended_when_missing() {
        assert_eq!(
            check_file_extension(Path::new("model.ckpt"), ".ckpt"),
            PathBuf::from("model.ckpt")
        );
        assert_eq!(
            check_file_extension(Path::new("model"), ".ckpt"),
            PathBuf::from("model.ckpt")
        );
        assert_eq!(
            check_file_extension(Path::new("model.pt"), "atomfit"),
            PathBuf::from("model.pt.atomfit")
        );
    }
}
