use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Ordered set of supported atomic types.
///
/// Per-species parameters are stored in arrays indexed by the position of a
/// type in this vocabulary, so lookups must fail loudly for unknown types
/// rather than fall back to a default slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesVocabulary {
    species: Vec<i32>,
}

impl SpeciesVocabulary {
    /// Creates a vocabulary from any collection of types; duplicates are
    /// removed and the result is sorted.
    pub fn new(species: impl IntoIterator<Item = i32>) -> Self {
        Self {
            species: species.into_iter().sorted_unstable().dedup().collect(),
        }
    }

    pub fn index_of(&self, species: i32) -> Option<usize> {
        self.species.binary_search(&species).ok()
    }

    pub fn contains(&self, species: i32) -> bool {
        self.index_of(species).is_some()
    }

    pub fn species(&self) -> &[i32] {
        &self.species
    }

    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_sorted_and_deduplicated() {
        let vocabulary = SpeciesVocabulary::new([8, 1, 8, 6, 1]);
        assert_eq!(vocabulary.species(), &[1, 6, 8]);
        assert_eq!(vocabulary.len(), 3);
    }

    #[test]
    fn index_of_returns_position_or_none() {
        let vocabulary = SpeciesVocabulary::new([1, 8]);
        assert_eq!(vocabulary.index_of(1), Some(0));
        assert_eq!(vocabulary.index_of(8), Some(1));
        assert_eq!(vocabulary.index_of(6), None);
        assert!(!vocabulary.contains(6));
    }
}
