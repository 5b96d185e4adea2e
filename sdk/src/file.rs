//! Files stored as an encrypted manifest vlob plus encrypted blocks.
//!
//! Changes are staged on the local manifest and become durable on
//! [`FileBlob::commit`]. Blocks dropped by a staged change are deleted only
//! after the vlob update has succeeded, and only if the context reclaims
//! them (see [`BlockRetention`]).

use {
    crate::{
        chunker::{BlockChunker, BuiltChunks},
        crypto::{Cipher, SymmetricKey, plaintext_digest},
        manifest::{BlockRef, ChunkGroup, FileBlobManifest},
        range::locate_range,
    },
    anyhow::Context as _,
    chrono::Utc,
    futures::future::{join_all, try_join_all},
    realmvault_protocol::{
        BlockError, BlockId, DeviceId, OrganizationId, RealmError, RealmId, VlobId, VlobVersion,
        blockstore::Blockstore, store::VlobStore,
    },
    std::{collections::HashSet, sync::Arc},
    thiserror::Error,
    tracing::{debug, warn},
};

/// Largest size a file may reach through `write`.
pub const MAX_FILE_SIZE: u64 = 1 << 40;

/// A gap before a write past the end of the file is zero-filled this many
/// blocks at a time.
const ZERO_FILL_BLOCKS: usize = 256;

#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Realm(#[from] RealmError),
    #[error(transparent)]
    Block(#[from] BlockError),
    /// The block was found but its content does not match the manifest.
    #[error("block {block_id} is corrupted")]
    Integrity { block_id: BlockId },
    #[error("writing {len} bytes at offset {offset} exceeds the maximum file size")]
    TooLarge { offset: u64, len: u64 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// What happens to blocks that a committed version no longer references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockRetention {
    /// Delete them once the new version is durable. Older versions stay
    /// listed in the history but their content may be gone.
    #[default]
    ReclaimOnCommit,
    /// Keep them, so that every version can still be read and restored.
    KeepHistory,
}

/// Everything a file needs to reach its storage, on behalf of one device.
#[derive(Clone)]
pub struct FileContext {
    pub organization_id: OrganizationId,
    pub author: DeviceId,
    pub realm_id: RealmId,
    /// Protects the manifests of the realm's files.
    pub key: SymmetricKey,
    pub vlobs: Arc<dyn VlobStore>,
    pub blocks: Arc<dyn Blockstore>,
    pub chunker: BlockChunker,
    pub retention: BlockRetention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub version: u32,
    pub dirty: bool,
    pub blocks: usize,
}

pub struct FileBlob {
    context: FileContext,
    vlob_id: VlobId,
    /// Last committed version.
    version: u32,
    manifest: FileBlobManifest,
    dirty: bool,
    /// Uploaded since the last commit; no committed version references them.
    uploaded: HashSet<BlockId>,
    /// Referenced by the committed manifest but not by the staged one.
    obsoleted: HashSet<BlockId>,
}

impl FileBlob {
    /// Creates an empty file as version 1 of a new vlob.
    pub async fn create(context: FileContext, vlob_id: VlobId) -> Result<Self, FileError> {
        let built = context.chunker.build(&[])?;
        let manifest = FileBlobManifest {
            chunks: vec![built.group.clone()],
        };
        let mut file = Self {
            context,
            vlob_id,
            version: 0,
            manifest,
            dirty: true,
            uploaded: HashSet::new(),
            obsoleted: HashSet::new(),
        };
        file.upload(built).await?;

        let blob = file.manifest.encrypt(&file.context.key)?;
        let created = file
            .context
            .vlobs
            .create(
                &file.context.organization_id,
                &file.context.author,
                file.context.realm_id,
                vlob_id,
                Utc::now(),
                blob,
            )
            .await;
        if let Err(err) = created {
            file.delete_uploaded().await;
            return Err(err.into());
        }
        file.version = 1;
        file.dirty = false;
        file.uploaded.clear();
        debug!(%vlob_id, "created file");
        Ok(file)
    }

    /// Opens `version` of a file, or its latest version.
    pub async fn load(
        context: FileContext,
        vlob_id: VlobId,
        version: Option<u32>,
    ) -> Result<Self, FileError> {
        let atom = context
            .vlobs
            .read(&context.organization_id, &context.author, vlob_id, version)
            .await?;
        let manifest = FileBlobManifest::decrypt(&context.key, &atom.blob)
            .with_context(|| format!("invalid manifest in vlob {vlob_id}"))?;
        Ok(Self {
            context,
            vlob_id,
            version: atom.version,
            manifest,
            dirty: false,
            uploaded: HashSet::new(),
            obsoleted: HashSet::new(),
        })
    }

    #[must_use]
    #[inline]
    pub fn vlob_id(&self) -> VlobId {
        self.vlob_id
    }

    #[must_use]
    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> u64 {
        self.manifest.size()
    }

    #[must_use]
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    #[inline]
    pub fn manifest(&self) -> &FileBlobManifest {
        &self.manifest
    }

    #[must_use]
    pub fn stat(&self) -> FileStat {
        FileStat {
            size: self.manifest.size(),
            version: self.version,
            dirty: self.dirty,
            blocks: self.manifest.block_count(),
        }
    }

    pub async fn history(&self) -> Result<Vec<VlobVersion>, FileError> {
        Ok(self
            .context
            .vlobs
            .list_versions(
                &self.context.organization_id,
                &self.context.author,
                self.vlob_id,
            )
            .await?)
    }

    /// Reads up to `size` bytes at `offset`. Reading past the end returns
    /// fewer bytes.
    pub async fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, FileError> {
        let file_size = self.manifest.size();
        if offset >= file_size || size == 0 {
            return Ok(Vec::new());
        }
        let size = size.min(file_size - offset);
        let range = locate_range(&self.manifest, offset, size);

        let mut output = Vec::new();
        if let Some(boundary) = &range.pre_included_partial {
            let plaintext = self.fetch(&boundary.key, &boundary.block).await?;
            output.extend_from_slice(boundary.split(&plaintext)?.1);
        }
        let included = try_join_all(range.included.iter().flat_map(|group| {
            group
                .blocks
                .iter()
                .map(move |block| self.fetch(&group.key, block))
        }))
        .await?;
        for plaintext in included {
            output.extend_from_slice(&plaintext);
        }
        if let Some(boundary) = &range.post_included_partial {
            let plaintext = self.fetch(&boundary.key, &boundary.block).await?;
            output.extend_from_slice(boundary.split(&plaintext)?.1);
        }
        Ok(output)
    }

    /// Stages `data` at `offset` and returns the ids of the blocks it made
    /// obsolete. A gap past the end of the file is filled with zeros; if the
    /// write then fails, part of that fill may remain staged.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<Vec<BlockId>, FileError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let len = data.len() as u64;
        if offset
            .checked_add(len)
            .is_none_or(|end| end > MAX_FILE_SIZE)
        {
            return Err(FileError::TooLarge { offset, len });
        }

        let before = self.manifest.block_ids();
        let segment = self
            .context
            .chunker
            .chunk_size()
            .saturating_mul(ZERO_FILL_BLOCKS);
        let mut zeros = Vec::new();
        loop {
            let file_size = self.manifest.size();
            if file_size >= offset {
                break;
            }
            let gap = usize::try_from(offset - file_size).map_or(segment, |gap| gap.min(segment));
            zeros.resize(gap, 0);
            self.splice(file_size, &zeros).await?;
        }
        self.splice(offset, data).await?;
        Ok(self.dropped_since(&before))
    }

    /// Stages a truncation to `length` bytes and returns the ids of the
    /// blocks it made obsolete. Does nothing if the file is not longer than
    /// `length`.
    pub async fn truncate(&mut self, length: u64) -> Result<Vec<BlockId>, FileError> {
        let file_size = self.manifest.size();
        if length >= file_size {
            return Ok(Vec::new());
        }
        let before = self.manifest.block_ids();
        let range = locate_range(&self.manifest, length, file_size - length);
        let mut chunks = kept(range.pre_excluded);
        let mut built = None;
        if let Some(boundary) = &range.pre_included_partial {
            let plaintext = self.fetch(&boundary.key, &boundary.block).await?;
            let (prefix, _, _) = boundary.split(&plaintext)?;
            built = Some(self.context.chunker.build(prefix)?);
        }
        if built.is_none() && chunks.is_empty() {
            built = Some(self.context.chunker.build(&[])?);
        }
        if let Some(built) = &built {
            chunks.push(built.group.clone());
        }
        self.replace(FileBlobManifest { chunks }, built).await?;
        Ok(self.dropped_since(&before))
    }

    /// Makes the staged manifest durable as the next version, then deletes
    /// the blocks it no longer references. Does nothing if nothing is staged.
    pub async fn commit(&mut self) -> Result<(), FileError> {
        if !self.dirty {
            return Ok(());
        }
        let blob = self.manifest.encrypt(&self.context.key)?;
        let version = self.version + 1;
        self.context
            .vlobs
            .update(
                &self.context.organization_id,
                &self.context.author,
                self.vlob_id,
                version,
                Utc::now(),
                blob,
            )
            .await?;
        self.version = version;
        self.dirty = false;
        self.uploaded.clear();
        debug!(vlob_id = %self.vlob_id, version, "committed file");

        let obsoleted: Vec<_> = self.obsoleted.drain().collect();
        if self.context.retention == BlockRetention::ReclaimOnCommit {
            self.delete_blocks(&obsoleted).await;
        }
        Ok(())
    }

    /// Commits the content of `version` as a new version. Staged changes
    /// are dropped. Fails without staging anything if blocks of that
    /// version have been reclaimed.
    pub async fn restore(&mut self, version: u32) -> Result<(), FileError> {
        let atom = self
            .context
            .vlobs
            .read(
                &self.context.organization_id,
                &self.context.author,
                self.vlob_id,
                Some(version),
            )
            .await?;
        let manifest = FileBlobManifest::decrypt(&self.context.key, &atom.blob)
            .with_context(|| format!("invalid manifest in vlob {} v{version}", self.vlob_id))?;

        let current = self.manifest.block_ids();
        try_join_all(
            manifest
                .blocks()
                .filter(|(_, block)| !current.contains(&block.block_id))
                .map(|(key, block)| self.fetch(key, block)),
        )
        .await?;

        self.replace(manifest, None).await?;
        self.commit().await?;
        debug!(vlob_id = %self.vlob_id, from = version, version = self.version, "restored file");
        Ok(())
    }

    /// Drops staged changes and deletes the blocks uploaded for them.
    pub async fn discard(&mut self) -> Result<(), FileError> {
        if !self.dirty && self.uploaded.is_empty() {
            return Ok(());
        }
        self.delete_uploaded().await;
        let atom = self
            .context
            .vlobs
            .read(
                &self.context.organization_id,
                &self.context.author,
                self.vlob_id,
                Some(self.version),
            )
            .await?;
        self.manifest = FileBlobManifest::decrypt(&self.context.key, &atom.blob)?;
        self.obsoleted.clear();
        self.dirty = false;
        Ok(())
    }

    async fn fetch(&self, key: &SymmetricKey, block: &BlockRef) -> Result<Vec<u8>, FileError> {
        let block_id = block.block_id;
        let data = self
            .context
            .blocks
            .get(&self.context.organization_id, block_id)
            .await?;
        let plaintext = Cipher::new(key).decrypt(&data).map_err(|err| {
            warn!(?err, %block_id, "failed to decrypt block");
            FileError::Integrity { block_id }
        })?;
        if plaintext.len() as u64 != block.size || plaintext_digest(&plaintext) != block.digest {
            warn!(%block_id, "block digest mismatch");
            return Err(FileError::Integrity { block_id });
        }
        Ok(plaintext)
    }

    /// Replaces `data.len()` bytes at `offset`, which must not lie past the
    /// end of the file.
    async fn splice(&mut self, offset: u64, data: &[u8]) -> Result<(), FileError> {
        let range = locate_range(&self.manifest, offset, data.len() as u64);
        let mut head = Vec::new();
        let mut tail = Vec::new();
        for boundary in [&range.pre_included_partial, &range.post_included_partial]
            .into_iter()
            .flatten()
        {
            let plaintext = self.fetch(&boundary.key, &boundary.block).await?;
            let (prefix, _, suffix) = boundary.split(&plaintext)?;
            head.extend_from_slice(prefix);
            tail.extend_from_slice(suffix);
        }
        head.extend_from_slice(data);
        head.extend_from_slice(&tail);

        let built = self.context.chunker.build(&head)?;
        let mut chunks = kept(range.pre_excluded);
        chunks.push(built.group.clone());
        chunks.extend(kept(range.post_excluded));
        self.replace(FileBlobManifest { chunks }, Some(built)).await
    }

    /// Stores every block of `built`. If any of them fails, the ones that
    /// made it are deleted again before the error is returned.
    async fn upload(&mut self, built: BuiltChunks) -> Result<(), FileError> {
        let organization_id = &self.context.organization_id;
        let blocks = &self.context.blocks;
        let results = join_all(built.blocks.into_iter().map(|block| async move {
            let block_id = block.block_id;
            blocks
                .put(organization_id, block_id, block.data)
                .await
                .map(|()| block_id)
        }))
        .await;

        let mut stored = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(block_id) => stored.push(block_id),
                Err(err) => {
                    warn!(?err, "failed to upload block");
                    first_error = first_error.or(Some(err));
                }
            }
        }
        if let Some(err) = first_error {
            self.delete_blocks(&stored).await;
            return Err(err.into());
        }
        self.uploaded.extend(stored);
        Ok(())
    }

    async fn replace(
        &mut self,
        manifest: FileBlobManifest,
        built: Option<BuiltChunks>,
    ) -> Result<(), FileError> {
        if let Some(built) = built {
            self.upload(built).await?;
        }
        let kept = manifest.block_ids();
        // A restored manifest may reference blocks a staged change dropped.
        self.obsoleted.retain(|id| !kept.contains(id));
        let dropped: Vec<BlockId> = self
            .manifest
            .block_ids()
            .into_iter()
            .filter(|id| !kept.contains(id))
            .collect();
        self.manifest = manifest;
        self.dirty = true;

        let mut unreferenced = Vec::new();
        for block_id in dropped {
            if self.uploaded.remove(&block_id) {
                unreferenced.push(block_id);
            } else {
                self.obsoleted.insert(block_id);
            }
        }
        self.delete_blocks(&unreferenced).await;
        Ok(())
    }

    /// Ids that were in `before` and are not in the staged manifest.
    fn dropped_since(&self, before: &HashSet<BlockId>) -> Vec<BlockId> {
        let after = self.manifest.block_ids();
        before.difference(&after).copied().collect()
    }

    async fn delete_uploaded(&mut self) {
        let uploaded: Vec<_> = self.uploaded.drain().collect();
        self.delete_blocks(&uploaded).await;
    }

    /// Best effort: a block that is already gone counts as reclaimed.
    async fn delete_blocks(&self, block_ids: &[BlockId]) {
        let organization_id = &self.context.organization_id;
        join_all(block_ids.iter().map(|&block_id| async move {
            match self.context.blocks.delete(organization_id, block_id).await {
                Ok(()) | Err(BlockError::NotFound) => {}
                Err(err) => warn!(?err, %block_id, "failed to delete obsolete block"),
            }
        }))
        .await;
    }
}

/// Excluded groups carried over to a new manifest. Zero-length blocks are
/// dropped; they only exist to keep an empty manifest non-empty.
fn kept(groups: Vec<ChunkGroup>) -> Vec<ChunkGroup> {
    groups
        .into_iter()
        .filter_map(|mut group| {
            group.blocks.retain(|block| block.size > 0);
            (!group.blocks.is_empty()).then_some(group)
        })
        .collect()
}
