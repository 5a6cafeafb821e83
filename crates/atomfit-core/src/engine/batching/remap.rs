use super::BatchError;

/// Maps sparse atom indices, possibly including ghost atoms, onto the dense
/// range `0..len()`.
///
/// The dense order is the sorted order of the original indices, so
/// [`IndexRemap::original`] is the inverse of [`IndexRemap::remap`].
#[derive(Debug, Clone)]
pub struct IndexRemap {
    unique: Vec<usize>,
    table: Vec<Option<usize>>,
}

impl IndexRemap {
    /// Builds the remapping from the selected atoms and the centre atoms of
    /// a neighbor list.
    pub fn new(selected: &[usize], centers: impl IntoIterator<Item = usize>) -> Self {
        let mut unique: Vec<usize> = selected.iter().copied().chain(centers).collect();
        unique.sort_unstable();
        unique.dedup();

        let size = unique.last().map_or(0, |max| max + 1);
        let mut table = vec![None; size];
        for (dense, original) in unique.iter().enumerate() {
            table[*original] = Some(dense);
        }
        Self { unique, table }
    }

    pub fn len(&self) -> usize {
        self.unique.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unique.is_empty()
    }

    /// Original indices, in dense order.
    pub fn unique(&self) -> &[usize] {
        &self.unique
    }

    pub fn original(&self, dense: usize) -> Option<usize> {
        self.unique.get(dense).copied()
    }

    pub fn remap(&self, index: usize) -> Result<usize, BatchError> {
        self.table
            .get(index)
            .copied()
            .flatten()
            .ok_or(BatchError::IndexOutOfRange {
                index,
                size: self.table.len(),
            })
    }

    pub fn remap_all(&self, indices: &[usize]) -> Result<Vec<usize>, BatchError> {
        indices.iter().map(|i| self.remap(*i)).collect()
    }
}
