//! Realm-scoped access to the blockstore.
//!
//! Every stored block is prefixed with the id of the realm that owns it, so
//! authorization does not need a separate index.

use {
    crate::policy::{self, Action},
    anyhow::Context as _,
    async_trait::async_trait,
    realmvault_protocol::{
        BlockError, BlockId, DeviceId, OrganizationId, RealmAccess, RealmError, RealmId,
        blockstore::Blockstore, store::RealmStore,
    },
    std::sync::Arc,
    tracing::debug,
    uuid::Uuid,
};

const HEADER_LEN: usize = 16;

fn block_error(err: RealmError) -> BlockError {
    match err {
        RealmError::NotFound(_) => BlockError::NotFound,
        RealmError::AccessDenied => BlockError::AccessDenied,
        RealmError::InMaintenance => BlockError::InMaintenance,
        RealmError::Internal(err) => BlockError::Internal(err),
        other => BlockError::Internal(other.into()),
    }
}

fn split_header(stored: Vec<u8>) -> Result<(RealmId, Vec<u8>), BlockError> {
    let header: [u8; HEADER_LEN] = stored
        .get(..HEADER_LEN)
        .and_then(|header| header.try_into().ok())
        .context("stored block is too short")?;
    Ok((
        RealmId(Uuid::from_bytes(header)),
        stored[HEADER_LEN..].to_vec(),
    ))
}

pub struct BlockService {
    realms: Arc<dyn RealmStore>,
    blockstore: Arc<dyn Blockstore>,
}

impl BlockService {
    #[must_use]
    pub fn new(realms: Arc<dyn RealmStore>, blockstore: Arc<dyn Blockstore>) -> Self {
        Self { realms, blockstore }
    }

    async fn check(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        action: Action,
    ) -> Result<RealmAccess, BlockError> {
        let access = self
            .realms
            .get_access(organization_id, author, realm_id)
            .await
            .map_err(block_error)?;
        policy::check(action, access.role).map_err(block_error)?;
        Ok(access)
    }

    /// Stores a block in `realm_id`. Needs a write role and a realm in
    /// normal operation.
    pub async fn create(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        block_id: BlockId,
        realm_id: RealmId,
        block: Vec<u8>,
    ) -> Result<(), BlockError> {
        let access = self
            .check(organization_id, author, realm_id, Action::WriteData)
            .await?;
        policy::check_not_in_maintenance(&access.status).map_err(block_error)?;

        let mut stored = Vec::with_capacity(HEADER_LEN + block.len());
        stored.extend_from_slice(realm_id.0.as_bytes());
        stored.extend_from_slice(&block);
        self.blockstore
            .put(organization_id, block_id, stored)
            .await?;
        debug!(%organization_id, %realm_id, %block_id, %author, "block created");
        Ok(())
    }

    /// Reads a block. Any role in the owning realm will do, even during
    /// reencryption.
    pub async fn read(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        block_id: BlockId,
    ) -> Result<Vec<u8>, BlockError> {
        let (realm_id, block) =
            split_header(self.blockstore.get(organization_id, block_id).await?)?;
        self.check(organization_id, author, realm_id, Action::ReadData)
            .await?;
        Ok(block)
    }

    pub async fn delete(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        block_id: BlockId,
    ) -> Result<(), BlockError> {
        let (realm_id, _) = split_header(self.blockstore.get(organization_id, block_id).await?)?;
        self.check(organization_id, author, realm_id, Action::WriteData)
            .await?;
        self.blockstore.delete(organization_id, block_id).await?;
        debug!(%organization_id, %realm_id, %block_id, %author, "block deleted");
        Ok(())
    }

    /// A `Blockstore` acting as `author` on `realm_id`.
    #[must_use]
    pub fn scoped(self: &Arc<Self>, author: DeviceId, realm_id: RealmId) -> ScopedBlocks {
        ScopedBlocks {
            service: Arc::clone(self),
            author,
            realm_id,
        }
    }
}

pub struct ScopedBlocks {
    service: Arc<BlockService>,
    author: DeviceId,
    realm_id: RealmId,
}

#[async_trait]
impl Blockstore for ScopedBlocks {
    async fn put(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
        block: Vec<u8>,
    ) -> Result<(), BlockError> {
        self.service
            .create(
                organization_id,
                &self.author,
                block_id,
                self.realm_id,
                block,
            )
            .await
    }

    async fn get(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<Vec<u8>, BlockError> {
        self.service
            .read(organization_id, &self.author, block_id)
            .await
    }

    async fn delete(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<(), BlockError> {
        self.service
            .delete(organization_id, &self.author, block_id)
            .await
    }
}
