use super::TensorMapError;
use super::block::TensorBlock;
use super::labels::Labels;
use super::map::TensorMap;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct StoredLabels {
    names: Vec<String>,
    values: Vec<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBlock {
    shape: Vec<usize>,
    values: Vec<f64>,
    samples: StoredLabels,
    #[serde(default)]
    components: Vec<StoredLabels>,
    properties: StoredLabels,
    #[serde(default)]
    gradients: Vec<StoredGradient>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredGradient {
    parameter: String,
    block: StoredBlock,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTensorMap {
    keys: StoredLabels,
    blocks: Vec<StoredBlock>,
}

impl From<&Labels> for StoredLabels {
    fn from(labels: &Labels) -> Self {
        Self {
            names: labels.names().to_vec(),
            values: labels.rows().flatten().copied().collect(),
        }
    }
}

impl TryFrom<StoredLabels> for Labels {
    type Error = TensorMapError;

    fn try_from(stored: StoredLabels) -> Result<Self, Self::Error> {
        Labels::from_flat(stored.names, stored.values)
    }
}

fn store_block(block: &TensorBlock) -> Result<StoredBlock, TensorMapError> {
    let values = block
        .values()
        .to_dtype(candle_core::DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?;
    let gradients = block
        .gradients()
        .map(|(parameter, gradient)| {
            Ok(StoredGradient {
                parameter: parameter.to_string(),
                block: store_block(gradient)?,
            })
        })
        .collect::<Result<Vec<_>, TensorMapError>>()?;
    Ok(StoredBlock {
        shape: block.values().dims().to_vec(),
        values,
        samples: block.samples().into(),
        components: block.components().iter().map(StoredLabels::from).collect(),
        properties: block.properties().into(),
        gradients,
    })
}

fn restore_block(stored: StoredBlock, device: &Device) -> Result<TensorBlock, TensorMapError> {
    let expected: usize = stored.shape.iter().product();
    if expected != stored.values.len() {
        return Err(TensorMapError::Format(format!(
            "shape {:?} needs {expected} values, found {}",
            stored.shape,
            stored.values.len()
        )));
    }
    let values = Tensor::from_vec(stored.values, stored.shape, device)?;
    let components = stored
        .components
        .into_iter()
        .map(Labels::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let mut block = TensorBlock::new(
        values,
        stored.samples.try_into()?,
        components,
        stored.properties.try_into()?,
    )?;
    for gradient in stored.gradients {
        block.add_gradient(&gradient.parameter, restore_block(gradient.block, device)?)?;
    }
    Ok(block)
}

pub fn to_toml_string(map: &TensorMap) -> Result<String, TensorMapError> {
    let stored = StoredTensorMap {
        keys: map.keys().into(),
        blocks: map
            .blocks()
            .iter()
            .map(store_block)
            .collect::<Result<Vec<_>, _>>()?,
    };
    toml::to_string(&stored).map_err(|e| TensorMapError::Format(e.to_string()))
}

pub fn from_toml_str(content: &str, device: &Device) -> Result<TensorMap, TensorMapError> {
    let stored: StoredTensorMap =
        toml::from_str(content).map_err(|e| TensorMapError::Format(e.to_string()))?;
    let blocks = stored
        .blocks
        .into_iter()
        .map(|b| restore_block(b, device))
        .collect::<Result<Vec<_>, _>>()?;
    TensorMap::new(stored.keys.try_into()?, blocks)
}

/// Writes a tensor map, gradients included, as a TOML document.
pub fn save(path: &Path, map: &TensorMap) -> Result<(), TensorMapError> {
    fs::write(path, to_toml_string(map)?)?;
    Ok(())
}

pub fn load(path: &Path, device: &Device) -> Result<TensorMap, TensorMapError> {
    from_toml_str(&fs::read_to_string(path)?, device)
}
