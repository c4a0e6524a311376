use std::collections::BTreeSet;

/// A byte range reported as different since the previous backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hint {
    pub offset: u64,
    pub length: u64,
    /// `true` if the range was written, `false` if it was discarded.
    pub changed: bool,
}

impl From<(u64, u64, bool)> for Hint {
    fn from((offset, length, changed): (u64, u64, bool)) -> Self {
        Self {
            offset,
            length,
            changed,
        }
    }
}

impl Hint {
    /// The indices of all blocks this range intersects.
    fn blocks(&self, block_size: u64) -> impl Iterator<Item = u64> {
        match (self.length, block_size) {
            (0, _) | (_, 0) => 0..0,
            (length, block_size) => {
                let last_byte = self.offset.saturating_add(length - 1);
                self.offset / block_size..last_byte / block_size + 1
            }
        }
    }
}

/// Reduces a list of hints to the sorted set of blocks they touch.
///
/// The `changed` flag is not considered here, see [`split_hints`] for that.
pub fn blocks_from_hints(hints: &[Hint], block_size: u64) -> BTreeSet<u64> {
    hints
        .iter()
        .flat_map(|hint| hint.blocks(block_size))
        .collect()
}

/// Blocks touched by written and by discarded ranges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HintedBlocks {
    /// Blocks that have to be read from the source again.
    pub written: BTreeSet<u64>,
    /// Blocks only touched by discarded ranges.
    pub discarded: BTreeSet<u64>,
}

pub fn split_hints(hints: &[Hint], block_size: u64) -> HintedBlocks {
    let mut written = BTreeSet::new();
    let mut discarded = BTreeSet::new();
    for hint in hints {
        let target = if hint.changed {
            &mut written
        } else {
            &mut discarded
        };
        target.extend(hint.blocks(block_size));
    }
    discarded.retain(|block| !written.contains(block));

    HintedBlocks { written, discarded }
}
