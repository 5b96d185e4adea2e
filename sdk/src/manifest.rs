use {
    crate::crypto::{Cipher, SymmetricKey},
    anyhow::{Context as _, Result},
    realmvault_protocol::{BlockDigest, BlockId, encoding},
    serde::{Deserialize, Serialize},
    std::collections::HashSet,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub block_id: BlockId,
    /// Digest of the block's plaintext.
    pub digest: BlockDigest,
    /// Plaintext size.
    pub size: u64,
}

/// Consecutive blocks encrypted with the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGroup {
    pub key: SymmetricKey,
    pub blocks: Vec<BlockRef>,
}

/// Decrypted content of a file vlob.
///
/// The blocks, in order, cover the file with no gap and no overlap. A
/// manifest always holds at least one chunk group; an empty file is a single
/// zero-length block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlobManifest {
    pub chunks: Vec<ChunkGroup>,
}

impl FileBlobManifest {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.blocks().map(|(_, block)| block.size).sum()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (&SymmetricKey, &BlockRef)> {
        self.chunks
            .iter()
            .flat_map(|group| group.blocks.iter().map(move |block| (&group.key, block)))
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.chunks.iter().map(|group| group.blocks.len()).sum()
    }

    #[must_use]
    pub fn block_ids(&self) -> HashSet<BlockId> {
        self.blocks().map(|(_, block)| block.block_id).collect()
    }

    pub fn encrypt(&self, key: &SymmetricKey) -> Result<Vec<u8>> {
        Cipher::new(key).encrypt(&encoding::serialize(self)?)
    }

    pub fn decrypt(key: &SymmetricKey, blob: &[u8]) -> Result<Self> {
        let plaintext = Cipher::new(key)
            .decrypt(blob)
            .context("failed to decrypt file manifest")?;
        encoding::deserialize(&plaintext)
    }
}

/// Appends `block` to the last group if it uses the same key, or opens a new
/// group otherwise.
pub(crate) fn push_block(chunks: &mut Vec<ChunkGroup>, key: &SymmetricKey, block: BlockRef) {
    match chunks.last_mut() {
        Some(group) if group.key == *key => group.blocks.push(block),
        _ => chunks.push(ChunkGroup {
            key: key.clone(),
            blocks: vec![block],
        }),
    }
}
