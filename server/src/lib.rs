use {
    crate::{
        block::BlockService,
        config::{BackendConfig, BlockstoreConfig},
        maintenance::MaintenanceCoordinator,
        memory::MemoryStore,
        messaging::{MemoryMessaging, Messaging},
        postgres::PostgresStore,
        raid1::Raid1Blockstore,
        storage::FilesystemBlockstore,
    },
    anyhow::Result,
    realmvault_protocol::{
        blockstore::{Blockstore, MemoryBlockstore},
        events::{EventBus, EventSink},
        store::{RealmStore, ReencryptionProgress, VlobStore},
    },
    sqlx::PgPool,
    std::{sync::Arc, time::Duration},
    tracing::info,
};

pub mod block;
pub mod config;
pub mod maintenance;
pub mod memory;
pub mod messaging;
pub mod policy;
pub mod postgres;
pub mod raid1;
pub mod roles;
pub mod storage;

pub use crate::config::Config;

/// Every component of the engine, wired once per process.
pub struct Server {
    pub events: EventBus,
    pub messaging: Arc<MemoryMessaging>,
    pub realms: Arc<dyn RealmStore>,
    pub vlobs: Arc<dyn VlobStore>,
    pub maintenance: MaintenanceCoordinator,
    pub blocks: Arc<BlockService>,
}

pub async fn open(config: &Config) -> Result<Server> {
    let events = EventBus::default();
    let sink: Arc<dyn EventSink> = Arc::new(events.clone());
    let (realms, vlobs, progress) = match &config.backend {
        BackendConfig::Memory => {
            let store = Arc::new(MemoryStore::new(Arc::clone(&sink)));
            shared_store(store)
        }
        BackendConfig::Postgres { database_url } => {
            let store = Arc::new(PostgresStore::connect(database_url, Arc::clone(&sink)).await?);
            shared_store(store)
        }
    };
    info!(backend = ?config.backend, "opened realm store");

    let blockstore = open_blockstore(&config.blockstore, config.block_timeout)?;
    let messaging = Arc::new(MemoryMessaging::new());
    let maintenance = MaintenanceCoordinator::new(
        Arc::clone(&realms),
        Arc::clone(&messaging) as Arc<dyn Messaging>,
        sink,
        progress,
    );
    let blocks = Arc::new(BlockService::new(Arc::clone(&realms), blockstore));
    Ok(Server {
        events,
        messaging,
        realms,
        vlobs,
        maintenance,
        blocks,
    })
}

type Stores = (
    Arc<dyn RealmStore>,
    Arc<dyn VlobStore>,
    Arc<dyn ReencryptionProgress>,
);

fn shared_store<S: RealmStore + VlobStore + ReencryptionProgress + 'static>(
    store: Arc<S>,
) -> Stores {
    (
        Arc::clone(&store) as Arc<dyn RealmStore>,
        Arc::clone(&store) as Arc<dyn VlobStore>,
        store as Arc<dyn ReencryptionProgress>,
    )
}

pub fn open_blockstore(
    config: &BlockstoreConfig,
    timeout: Duration,
) -> Result<Arc<dyn Blockstore>> {
    let store: Arc<dyn Blockstore> = match config {
        BlockstoreConfig::Memory => Arc::new(MemoryBlockstore::new()),
        BlockstoreConfig::Filesystem { path } => {
            Arc::new(FilesystemBlockstore::new(path.clone(), timeout)?)
        }
        BlockstoreConfig::Raid1 { stores } => Arc::new(Raid1Blockstore::new(
            stores
                .iter()
                .map(|store| open_blockstore(store, timeout))
                .collect::<Result<_>>()?,
        )?),
    };
    Ok(store)
}

pub async fn migrate(database_url: &str) -> Result<()> {
    let pool = PgPool::connect(database_url).await?;
    postgres::migrate(&pool).await
}
