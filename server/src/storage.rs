use {
    anyhow::{Context as _, Result, bail},
    async_trait::async_trait,
    base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD},
    fs_err::{create_dir_all, read, remove_file},
    realmvault_protocol::{BlockError, BlockId, OrganizationId, blockstore::Blockstore},
    std::{
        io::{self, ErrorKind, Write},
        path::{Path, PathBuf},
        time::Duration,
    },
    tempfile::NamedTempFile,
    tokio::{task::spawn_blocking, time::timeout},
    tracing::debug,
};

/// Blocks stored as files under `root/<org>/x/y/z/<block_id>`.
///
/// Writes go to a temporary file first and are moved into place, so a reader
/// never observes a partially written block.
#[derive(Debug, Clone)]
pub struct FilesystemBlockstore {
    root: PathBuf,
    tmp: PathBuf,
    timeout: Duration,
}

fn block_paths(
    root: &Path,
    organization_id: &OrganizationId,
    block_id: BlockId,
) -> (PathBuf, PathBuf) {
    let name = BASE64_URL_SAFE_NO_PAD.encode(block_id.0.as_bytes());
    let dir = root
        .join(BASE64_URL_SAFE_NO_PAD.encode(&organization_id.0))
        .join(&name[0..1])
        .join(&name[1..2])
        .join(&name[2..3]);
    let file_path = dir.join(name);
    (dir, file_path)
}

fn io_error(err: io::Error) -> BlockError {
    match err.kind() {
        ErrorKind::NotFound => BlockError::NotFound,
        ErrorKind::AlreadyExists => BlockError::AlreadyExists,
        _ => BlockError::Internal(err.into()),
    }
}

impl FilesystemBlockstore {
    pub fn new(root: PathBuf, timeout: Duration) -> Result<Self> {
        if !root.try_exists()? {
            bail!("blockstore root {} doesn't exist", root.display());
        }

        let tmp = root.join("tmp");
        create_dir_all(&tmp)?;

        Ok(Self { root, tmp, timeout })
    }

    fn put_blocking(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
        block: &[u8],
    ) -> Result<(), BlockError> {
        let (dir, path) = block_paths(&self.root, organization_id, block_id);
        let mut file = NamedTempFile::new_in(&self.tmp).context("failed to create temp file")?;
        file.write_all(block).context("failed to write block")?;
        file.flush().context("failed to flush block")?;
        create_dir_all(dir).map_err(io_error)?;
        // Refuses to replace an existing block; the temp file is removed on failure.
        file.persist_noclobber(path)
            .map_err(|err| io_error(err.error))?;
        Ok(())
    }

    fn get_blocking(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<Vec<u8>, BlockError> {
        let (_, path) = block_paths(&self.root, organization_id, block_id);
        read(path).map_err(io_error)
    }

    fn delete_blocking(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<(), BlockError> {
        let (_, path) = block_paths(&self.root, organization_id, block_id);
        remove_file(path).map_err(io_error)
    }

    /// Runs a filesystem operation off the async runtime, bounded by the
    /// configured timeout.
    async fn run<T, F>(&self, f: F) -> Result<T, BlockError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, BlockError> + Send + 'static,
    {
        let this = self.clone();
        let task = spawn_blocking(move || f(&this));
        match timeout(self.timeout, task).await {
            Ok(joined) => joined.context("block operation panicked")?,
            Err(_elapsed) => Err(BlockError::Timeout),
        }
    }
}

#[async_trait]
impl Blockstore for FilesystemBlockstore {
    async fn put(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
        block: Vec<u8>,
    ) -> Result<(), BlockError> {
        debug!(%organization_id, %block_id, size = block.len(), "storing block");
        let organization_id = organization_id.clone();
        self.run(move |this| this.put_blocking(&organization_id, block_id, &block))
            .await
    }

    async fn get(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<Vec<u8>, BlockError> {
        let organization_id = organization_id.clone();
        self.run(move |this| this.get_blocking(&organization_id, block_id))
            .await
    }

    async fn delete(
        &self,
        organization_id: &OrganizationId,
        block_id: BlockId,
    ) -> Result<(), BlockError> {
        debug!(%organization_id, %block_id, "deleting block");
        let organization_id = organization_id.clone();
        self.run(move |this| this.delete_blocking(&organization_id, block_id))
            .await
    }
}
