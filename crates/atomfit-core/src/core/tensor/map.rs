use super::TensorMapError;
use super::block::TensorBlock;
use super::labels::Labels;

/// A collection of blocks addressed by key labels.
#[derive(Debug, Clone)]
pub struct TensorMap {
    keys: Labels,
    blocks: Vec<TensorBlock>,
}

impl TensorMap {
    pub fn new(keys: Labels, blocks: Vec<TensorBlock>) -> Result<Self, TensorMapError> {
        if keys.count() != blocks.len() {
            return Err(TensorMapError::KeyCount {
                keys: keys.count(),
                blocks: blocks.len(),
            });
        }
        Ok(Self { keys, blocks })
    }

    /// A map with the conventional single key `_ = 0`.
    pub fn single(block: TensorBlock) -> Self {
        Self {
            keys: Labels::single(),
            blocks: vec![block],
        }
    }

    pub fn keys(&self) -> &Labels {
        &self.keys
    }

    pub fn blocks(&self) -> &[TensorBlock] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<TensorBlock> {
        self.blocks
    }

    /// The only block of the map.
    pub fn block(&self) -> Result<&TensorBlock, TensorMapError> {
        match self.blocks.as_slice() {
            [block] => Ok(block),
            blocks => Err(TensorMapError::NotSingleBlock(blocks.len())),
        }
    }

    pub fn block_mut(&mut self) -> Result<&mut TensorBlock, TensorMapError> {
        let count = self.blocks.len();
        match self.blocks.as_mut_slice() {
            [block] => Ok(block),
            _ => Err(TensorMapError::NotSingleBlock(count)),
        }
    }

    pub fn block_by_key(&self, key: &[i32]) -> Option<&TensorBlock> {
        self.keys.position(key).map(|i| &self.blocks[i])
    }

    /// Applies `f` to every block, keeping the keys.
    pub fn try_map_blocks(
        &self,
        f: impl Fn(&TensorBlock) -> Result<TensorBlock, TensorMapError>,
    ) -> Result<Self, TensorMapError> {
        let blocks = self.blocks.iter().map(f).collect::<Result<Vec<_>, _>>()?;
        Self::new(self.keys.clone(), blocks)
    }

    pub fn detach(&self) -> Result<Self, TensorMapError> {
        self.try_map_blocks(TensorBlock::detach)
    }
}
