use super::elements::atomic_number;
use crate::core::capabilities::{DatasetInfo, TargetInfo};
use crate::core::models::dataset::{Dataset, DatasetError, Sample};
use crate::core::models::system::System;
use crate::core::tensor::block::TensorBlock;
use crate::core::tensor::labels::Labels;
use crate::core::tensor::map::TensorMap;
use candle_core::{Device, Tensor};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct DatasetFile {
    #[serde(default = "default_length_unit")]
    length_unit: String,
    #[serde(default)]
    energy_unit: String,
    #[serde(default = "default_target")]
    target: String,
    #[serde(default, rename = "structure")]
    structures: Vec<StructureEntry>,
}

fn default_length_unit() -> String {
    "angstrom".to_string()
}

fn default_target() -> String {
    "energy".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AtomType {
    Number(i32),
    Symbol(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StructureEntry {
    types: Vec<AtomType>,
    positions: Vec<[f64; 3]>,
    cell: Option<[[f64; 3]; 3]>,
    energy: f64,
    forces: Option<Vec<[f64; 3]>>,
    stress: Option<[[f64; 3]; 3]>,
}

/// Reads a TOML dataset file.
///
/// The file holds optional `length-unit`, `energy-unit` and `target` keys and
/// one `[[structure]]` table per structure with `types` (atomic numbers or
/// element symbols), `positions`, an optional `cell`, the `energy` and
/// optional `forces` and `stress`. Forces become `positions` gradients
/// (`-F`) and stresses become `strain` gradients (`stress * volume`); either
/// must be given for all structures or none.
///
/// # Errors
///
/// Returns [`DatasetError::Io`] if the file cannot be read and
/// [`DatasetError::Parse`] or [`DatasetError::InvalidStructure`] for
/// malformed content.
pub fn read_dataset(path: &Path, device: &Device) -> Result<(Dataset, DatasetInfo), DatasetError> {
    let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let (dataset, info) = parse_dataset(&content, path, device)?;
    info!(
        path = %path.display(),
        structures = dataset.len(),
        "Read dataset"
    );
    Ok((dataset, info))
}

/// Parses the content of a dataset file; `path` is only used in errors.
pub fn parse_dataset(
    content: &str,
    path: &Path,
    device: &Device,
) -> Result<(Dataset, DatasetInfo), DatasetError> {
    let file: DatasetFile = toml::from_str(content).map_err(|e| DatasetError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let has_forces = uniform_presence(&file.structures, |s| s.forces.is_some(), "forces")?;
    let has_stress = uniform_presence(&file.structures, |s| s.stress.is_some(), "stress")?;

    let mut target = TargetInfo::energy(&file.energy_unit);
    if has_forces {
        target = target.with_gradient("positions");
    }
    if has_stress {
        target = target.with_gradient("strain");
    }

    let mut species = BTreeSet::new();
    let mut samples = Vec::with_capacity(file.structures.len());
    for (index, entry) in file.structures.iter().enumerate() {
        let sample = build_sample(index, entry, &file.target, device)?;
        species.extend(sample.system.types().iter().copied());
        samples.push(sample);
    }
    debug!(target = %file.target, ?species, "Parsed dataset structures");

    let info = DatasetInfo {
        length_unit: file.length_unit,
        atomic_types: species.into_iter().collect(),
        targets: BTreeMap::from([(file.target, target)]),
    };
    Ok((Dataset::new(samples), info))
}

fn uniform_presence(
    structures: &[StructureEntry],
    present: impl Fn(&StructureEntry) -> bool,
    what: &str,
) -> Result<bool, DatasetError> {
    let first = structures.first().map(&present).unwrap_or(false);
    match structures.iter().position(|s| present(s) != first) {
        Some(index) => Err(DatasetError::InvalidStructure {
            index,
            reason: format!("'{what}' must be given for every structure or for none"),
        }),
        None => Ok(first),
    }
}

fn build_sample(
    index: usize,
    entry: &StructureEntry,
    target: &str,
    device: &Device,
) -> Result<Sample, DatasetError> {
    let invalid = |reason: String| DatasetError::InvalidStructure { index, reason };
    let n_atoms = entry.positions.len();
    let types = entry
        .types
        .iter()
        .map(|t| match t {
            AtomType::Number(z) => Ok(*z),
            AtomType::Symbol(symbol) => {
                atomic_number(symbol).ok_or_else(|| DatasetError::UnknownElement(symbol.clone()))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    if types.len() != n_atoms {
        return Err(invalid(format!(
            "{} types for {n_atoms} positions",
            types.len()
        )));
    }

    let system = System::from_coordinates(&entry.positions, types, entry.cell, device)?;
    let properties = Labels::range("energy", 1);
    let mut block = TensorBlock::new(
        Tensor::from_vec(vec![entry.energy], (1, 1), device)?,
        Labels::new(&["system"], vec![vec![index as i32]])?,
        vec![],
        properties.clone(),
    )?;

    if let Some(forces) = &entry.forces {
        if forces.len() != n_atoms {
            return Err(invalid(format!(
                "{} forces for {n_atoms} atoms",
                forces.len()
            )));
        }
        let negated: Vec<f64> = forces.iter().flatten().map(|f| -f).collect();
        let samples = (0..n_atoms).map(|a| vec![0, a as i32]).collect();
        block.add_gradient(
            "positions",
            TensorBlock::new(
                Tensor::from_vec(negated, (n_atoms, 3, 1), device)?,
                Labels::new(&["sample", "atom"], samples)?,
                vec![Labels::range("xyz", 3)],
                properties.clone(),
            )?,
        )?;
    }

    if let Some(stress) = &entry.stress {
        if !system.is_periodic() {
            return Err(invalid("stress given for a structure without a cell".into()));
        }
        let volume = system.cell_matrix()?.determinant().abs();
        let scaled: Vec<f64> = stress.iter().flatten().map(|s| s * volume).collect();
        block.add_gradient(
            "strain",
            TensorBlock::new(
                Tensor::from_vec(scaled, (1, 3, 3, 1), device)?,
                Labels::range("sample", 1),
                vec![Labels::range("xyz_1", 3), Labels::range("xyz_2", 3)],
                properties,
            )?,
        )?;
    }

    Ok(Sample {
        system,
        targets: BTreeMap::from([(target.to_string(), TensorMap::single(block))]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TOLERANCE: f64 = 1e-12;

    const WATER_AND_CRYSTAL: &str = r#"
energy-unit = "eV"

[[structure]]
types = ["O", "H", "H"]
positions = [[0.0, 0.0, 0.0], [0.96, 0.0, 0.0], [-0.24, 0.93, 0.0]]
energy = -14.2
forces = [[0.1, 0.0, 0.0], [-0.05, 0.0, 0.0], [-0.05, 0.0, 0.0]]

[[structure]]
types = [1, 1]
positions = [[0.0, 0.0, 0.0], [0.74, 0.0, 0.0]]
cell = [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]]
energy = -6.8
forces = [[0.2, 0.0, 0.0], [-0.2, 0.0, 0.0]]
"#;

    fn parse(content: &str) -> Result<(Dataset, DatasetInfo), DatasetError> {
        parse_dataset(content, Path::new("test.toml"), &Device::Cpu)
    }

    #[test]
    fn parses_structures_with_symbols_and_numbers() {
        let (dataset, info) = parse(WATER_AND_CRYSTAL).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(info.atomic_types, vec![1, 8]);
        assert_eq!(info.length_unit, "angstrom");
        let target = &info.targets["energy"];
        assert_eq!(target.unit, "eV");
        assert!(target.gradients.contains("positions"));
        assert!(!target.gradients.contains("strain"));
        assert_eq!(dataset.samples()[0].system.types(), &[8, 1, 1]);
        assert!(dataset.samples()[1].system.is_periodic());
    }

    #[test]
    fn forces_are_stored_as_negative_position_gradients() {
        let (dataset, _) = parse(WATER_AND_CRYSTAL).unwrap();
        let block = dataset.samples()[0].targets["energy"].block().unwrap();
        let gradient = block.gradient("positions").unwrap();
        let values = gradient.values().flatten_all().unwrap().to_vec1::<f64>().unwrap();

        assert!((values[0] + 0.1).abs() < TOLERANCE);
        assert!((values[3] - 0.05).abs() < TOLERANCE);
        assert_eq!(gradient.samples().column("atom").unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn stress_is_scaled_by_cell_volume() {
        let content = r#"
[[structure]]
types = ["Si"]
positions = [[0.0, 0.0, 0.0]]
cell = [[2.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 2.0]]
energy = -5.0
stress = [[0.5, 0.0, 0.0], [0.0, 0.5, 0.0], [0.0, 0.0, 0.5]]
"#;
        let (dataset, info) = parse(content).unwrap();
        let gradient = dataset.samples()[0].targets["energy"]
            .block()
            .unwrap()
            .gradient("strain")
            .unwrap()
            .values()
            .flatten_all()
            .unwrap()
            .to_vec1::<f64>()
            .unwrap();

        assert!(info.targets["energy"].gradients.contains("strain"));
        assert!((gradient[0] - 4.0).abs() < TOLERANCE);
        assert!(gradient[1].abs() < TOLERANCE);
    }

    #[test]
    fn stress_without_cell_is_rejected() {
        let content = r#"
[[structure]]
types = [1]
positions = [[0.0, 0.0, 0.0]]
energy = 0.0
stress = [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]
"#;
        assert!(matches!(
            parse(content),
            Err(DatasetError::InvalidStructure { index: 0, .. })
        ));
    }

    #[test]
    fn forces_on_some_structures_only_are_rejected() {
        let content = r#"
[[structure]]
types = [1]
positions = [[0.0, 0.0, 0.0]]
energy = 0.0
forces = [[0.0, 0.0, 0.0]]

[[structure]]
types = [1]
positions = [[0.0, 0.0, 0.0]]
energy = 0.0
"#;
        assert!(matches!(
            parse(content),
            Err(DatasetError::InvalidStructure { index: 1, .. })
        ));
    }

    #[test]
    fn unknown_element_symbol_is_reported() {
        let content = r#"
[[structure]]
types = ["Qq"]
positions = [[0.0, 0.0, 0.0]]
energy = 0.0
"#;
        assert!(matches!(
            parse(content),
            Err(DatasetError::UnknownElement(symbol)) if symbol == "Qq"
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let content = r#"
[[structure]]
types = [1]
positions = [[0.0, 0.0, 0.0]]
energy = 0.0
charges = [0.0]
"#;
        assert!(matches!(parse(content), Err(DatasetError::Parse { .. })));
    }

    #[test]
    fn reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(WATER_AND_CRYSTAL.as_bytes()).unwrap();

        let (dataset, _) = read_dataset(file.path(), &Device::Cpu).unwrap();
        assert_eq!(dataset.len(), 2);

        let missing = read_dataset(Path::new("/nonexistent/data.toml"), &Device::Cpu);
        assert!(matches!(missing, Err(DatasetError::Io { .. })));
    }
}
