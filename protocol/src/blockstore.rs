use {
    crate::{BlockError, BlockId, OrganizationId},
    async_trait::async_trait,
    parking_lot::Mutex,
    std::collections::{HashMap, hash_map::Entry},
};

/// Physical storage of encrypted blocks, scoped by organization.
///
/// Operations are expected to be idempotent and independently retryable.
#[async_trait]
pub trait Blockstore: Send + Sync {
    async fn put(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
        block: Vec<u8>,
    ) -> Result<(), BlockError>;

    async fn get(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<Vec<u8>, BlockError>;

    async fn delete(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<(), BlockError>;
}

#[derive(Debug, Default)]
pub struct MemoryBlockstore {
    blocks: Mutex<HashMap<(OrganizationId, BlockId), Vec<u8>>>,
}

impl MemoryBlockstore {
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    #[must_use]
    #[inline]
    pub fn contains(&self, organization_id: &OrganizationId, block_id: BlockId) -> bool {
        self.blocks
            .lock()
            .contains_key(&(organization_id.clone(), block_id))
    }

    /// Overwrites a stored block in place. Only meant for corruption tests.
    #[inline]
    pub fn tamper(&self, organization_id: &OrganizationId, block_id: BlockId, block: Vec<u8>) {
        self.blocks
            .lock()
            .insert((organization_id.clone(), block_id), block);
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    async fn put(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
        block: Vec<u8>,
    ) -> Result<(), BlockError> {
        match self
            .blocks
            .lock()
            .entry((organization_id.clone(), block_id))
        {
            Entry::Occupied(_) => Err(BlockError::AlreadyExists),
            Entry::Vacant(entry) => {
                entry.insert(block);
                Ok(())
            }
        }
    }

    async fn get(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<Vec<u8>, BlockError> {
        self.blocks
            .lock()
            .get(&(organization_id.clone(), block_id))
            .cloned()
            .ok_or(BlockError::NotFound)
    }

    async fn delete(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<(), BlockError> {
        self.blocks
            .lock()
            .remove(&(organization_id.clone(), block_id))
            .map(drop)
            .ok_or(BlockError::NotFound)
    }
}
