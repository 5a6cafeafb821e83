use super::TensorMapError;
use std::collections::HashSet;

/// A set of unique integer entries with named dimensions, describing one
/// axis of a tensor block.
///
/// Entries are stored row-major in a flat vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    names: Vec<String>,
    values: Vec<i32>,
}

impl Labels {
    pub fn new(names: &[&str], entries: Vec<Vec<i32>>) -> Result<Self, TensorMapError> {
        Self::from_flat(
            names.iter().map(|n| n.to_string()).collect(),
            entries.into_iter().flatten().collect(),
        )
    }

    pub fn from_flat(names: Vec<String>, values: Vec<i32>) -> Result<Self, TensorMapError> {
        if names.is_empty() {
            return Err(TensorMapError::EmptyLabelNames);
        }
        let width = names.len();
        if values.len() % width != 0 {
            return Err(TensorMapError::LabelWidth {
                row: values.len() / width,
                expected: width,
                found: values.len() % width,
            });
        }
        let mut seen = HashSet::new();
        for row in values.chunks(width) {
            if !seen.insert(row) {
                return Err(TensorMapError::DuplicateLabel(row.to_vec()));
            }
        }
        Ok(Self { names, values })
    }

    /// The conventional labels of an axis with exactly one entry.
    pub fn single() -> Self {
        Self {
            names: vec!["_".to_string()],
            values: vec![0],
        }
    }

    /// One dimension named `name` holding `0..count`.
    pub fn range(name: &str, count: usize) -> Self {
        Self {
            names: vec![name.to_string()],
            values: (0..count as i32).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn count(&self) -> usize {
        self.values.len() / self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn row(&self, index: usize) -> &[i32] {
        let width = self.names.len();
        &self.values[index * width..(index + 1) * width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[i32]> {
        self.values.chunks(self.names.len())
    }

    pub fn column(&self, name: &str) -> Result<Vec<i32>, TensorMapError> {
        let position = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| TensorMapError::MissingDimension(name.to_string()))?;
        Ok(self.rows().map(|row| row[position]).collect())
    }

    pub fn position(&self, entry: &[i32]) -> Option<usize> {
        self.rows().position(|row| row == entry)
    }
}
