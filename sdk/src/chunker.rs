use {
    crate::{
        crypto::{Cipher, SymmetricKey, plaintext_digest},
        manifest::{BlockRef, ChunkGroup},
    },
    anyhow::{Result, ensure},
    realmvault_protocol::BlockId,
};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// A block ready to be uploaded.
#[derive(Debug, Clone)]
pub struct EncryptedBlock {
    pub block_id: BlockId,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct BuiltChunks {
    pub group: ChunkGroup,
    pub blocks: Vec<EncryptedBlock>,
}

/// Splits plaintext into fixed-size chunks and encrypts each of them.
///
/// Boundaries depend only on offsets, never on content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChunker {
    chunk_size: usize,
}

impl Default for BlockChunker {
    #[inline]
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl BlockChunker {
    pub fn new(chunk_size: usize) -> Result<Self> {
        ensure!(chunk_size > 0, "chunk size cannot be zero");
        Ok(Self { chunk_size })
    }

    #[must_use]
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Builds one chunk group under a fresh key. Empty input still yields a
    /// single zero-length block.
    pub fn build(&self, plaintext: &[u8]) -> Result<BuiltChunks> {
        let key = SymmetricKey::generate()?;
        let cipher = Cipher::new(&key);
        let chunks: Vec<&[u8]> = if plaintext.is_empty() {
            vec![plaintext]
        } else {
            plaintext.chunks(self.chunk_size).collect()
        };

        let mut refs = Vec::with_capacity(chunks.len());
        let mut blocks = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let block_id = BlockId::generate();
            refs.push(BlockRef {
                block_id,
                digest: plaintext_digest(chunk),
                size: chunk.len() as u64,
            });
            blocks.push(EncryptedBlock {
                block_id,
                data: cipher.encrypt(chunk)?,
            });
        }
        Ok(BuiltChunks {
            group: ChunkGroup { key, blocks: refs },
            blocks,
        })
    }
}
