use {
    anyhow::{Result, ensure},
    async_trait::async_trait,
    futures::future::{join_all, select_ok},
    realmvault_protocol::{BlockError, BlockId, OrganizationId, blockstore::Blockstore},
    std::sync::Arc,
    tracing::warn,
};

/// Mirrors every block on all of its stores.
pub struct Raid1Blockstore {
    stores: Vec<Arc<dyn Blockstore>>,
}

impl Raid1Blockstore {
    pub fn new(stores: Vec<Arc<dyn Blockstore>>) -> Result<Self> {
        ensure!(
            !stores.is_empty(),
            "raid1 blockstore needs at least one store"
        );
        Ok(Self { stores })
    }
}

impl std::fmt::Debug for Raid1Blockstore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Raid1Blockstore")
            .field("stores", &self.stores.len())
            .finish()
    }
}

#[async_trait]
impl Blockstore for Raid1Blockstore {
    /// Succeeds when every store holds the block afterwards. A store that
    /// already has it completes an earlier partial write.
    async fn put(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
        block: Vec<u8>,
    ) -> Result<(), BlockError> {
        let results = join_all(
            self.stores
                .iter()
                .map(|store| store.put(organization_id, block_id, block.clone())),
        )
        .await;
        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) | Err(BlockError::AlreadyExists) => {}
                Err(err) => {
                    warn!(?err, index, %block_id, "replica failed to store block");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Returns the first replica that answers; the other reads are dropped.
    async fn get(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<Vec<u8>, BlockError> {
        let (block, _pending) = select_ok(
            self.stores
                .iter()
                .map(|store| store.get(organization_id, block_id)),
        )
        .await?;
        Ok(block)
    }

    async fn delete(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<(), BlockError> {
        let results = join_all(
            self.stores
                .iter()
                .map(|store| store.delete(organization_id, block_id)),
        )
        .await;
        let mut deleted = false;
        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => deleted = true,
                Err(BlockError::NotFound) => {}
                Err(err) => {
                    warn!(?err, index, %block_id, "replica failed to delete block");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None if deleted => Ok(()),
            None => Err(BlockError::NotFound),
        }
    }
}
