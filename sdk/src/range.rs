//! Maps a byte range of a file onto the blocks of its manifest.

use {
    crate::{
        crypto::SymmetricKey,
        manifest::{BlockRef, ChunkGroup, FileBlobManifest, push_block},
    },
    anyhow::{Context as _, Result, ensure},
    std::ops::Range,
};

/// A block that straddles one end of the range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryBlock {
    pub key: SymmetricKey,
    pub block: BlockRef,
    /// Part of the block that falls inside the range, relative to the block.
    pub included: Range<u64>,
}

impl BoundaryBlock {
    /// Splits the block's plaintext into the excluded prefix, the included
    /// part and the excluded suffix.
    pub fn split<'a>(&self, plaintext: &'a [u8]) -> Result<(&'a [u8], &'a [u8], &'a [u8])> {
        let start = usize::try_from(self.included.start)?;
        let end = usize::try_from(self.included.end)?;
        ensure!(
            start <= end && end <= plaintext.len(),
            "range {start}..{end} is outside of block {} ({} bytes)",
            self.block.block_id,
            plaintext.len(),
        );
        let (head, rest) = plaintext.split_at(start);
        let (included, tail) = rest
            .split_at_checked(end - start)
            .context("invalid boundary range")?;
        Ok((head, included, tail))
    }
}

/// Five-way partition of a manifest around `offset..offset + size`.
///
/// Wholly excluded and wholly included blocks are only referenced. Only the
/// two boundary blocks need to be fetched to extract their partial bytes.
/// When the range lies inside a single block, that block is the
/// `pre_included_partial` one and `post_included_partial` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeDecomposition {
    pub pre_excluded: Vec<ChunkGroup>,
    pub pre_included_partial: Option<BoundaryBlock>,
    pub included: Vec<ChunkGroup>,
    pub post_included_partial: Option<BoundaryBlock>,
    pub post_excluded: Vec<ChunkGroup>,
}

#[must_use]
pub fn locate_range(manifest: &FileBlobManifest, offset: u64, size: u64) -> RangeDecomposition {
    let range_end = offset.saturating_add(size);
    let mut result = RangeDecomposition::default();
    let mut cursor = 0u64;
    for (key, block) in manifest.blocks() {
        let start = cursor;
        let end = start + block.size;
        cursor = end;

        if end <= offset {
            push_block(&mut result.pre_excluded, key, block.clone());
        } else if start >= range_end && start >= offset {
            push_block(&mut result.post_excluded, key, block.clone());
        } else if start < offset {
            result.pre_included_partial = Some(BoundaryBlock {
                key: key.clone(),
                block: block.clone(),
                included: offset - start..range_end.min(end) - start,
            });
        } else if end > range_end {
            result.post_included_partial = Some(BoundaryBlock {
                key: key.clone(),
                block: block.clone(),
                included: 0..range_end - start,
            });
        } else {
            push_block(&mut result.included, key, block.clone());
        }
    }
    result
}
