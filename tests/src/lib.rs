//! Fixtures shared by the scenario tests.

pub mod shuffle;

use {
    anyhow::Result,
    chrono::Utc,
    realmvault_protocol::{
        DateTimeUtc, DeviceId, OrganizationId, RealmGrantedRole, RealmId, Role,
        blockstore::Blockstore,
    },
    realmvault_sdk::{BlockChunker, BlockRetention, FileContext, crypto::SymmetricKey},
    realmvault_server::{Config, Server},
    std::sync::Arc,
    tracing_subscriber::{EnvFilter, util::SubscriberInitExt},
};

/// Installs a log subscriber that writes through the test harness. Only the
/// first call has an effect.
pub fn init_logging() {
    if let Ok(filter) = EnvFilter::try_new("info,sqlx=warn,realmvault_server=debug") {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(filter)
            .finish()
            .try_init();
    }
}

#[must_use]
pub fn grant(
    realm_id: RealmId,
    user: &str,
    role: Option<Role>,
    granted_by: &DeviceId,
    granted_on: DateTimeUtc,
) -> RealmGrantedRole {
    RealmGrantedRole {
        certificate: format!("{realm_id}:{user}:{role:?}:{granted_on}").into_bytes(),
        realm_id,
        user_id: user.into(),
        role,
        granted_by: granted_by.clone(),
        granted_on,
    }
}

/// A running engine with two devices: `alice@laptop` and `bob@phone`.
pub struct Env {
    pub organization_id: OrganizationId,
    pub server: Server,
    pub alice: DeviceId,
    pub bob: DeviceId,
}

impl Env {
    pub async fn new(config: &Config) -> Result<Self> {
        init_logging();
        Ok(Self {
            organization_id: OrganizationId::from("org"),
            server: realmvault_server::open(config).await?,
            alice: "alice@laptop".parse()?,
            bob: "bob@phone".parse()?,
        })
    }

    pub async fn memory() -> Result<Self> {
        Self::new(&Config::default()).await
    }

    /// Creates a realm owned by alice.
    pub async fn create_realm(&self) -> Result<RealmId> {
        let realm_id = RealmId::generate();
        self.server
            .realms
            .create(
                &self.organization_id,
                grant(
                    realm_id,
                    "alice",
                    Some(Role::Owner),
                    &self.alice,
                    Utc::now(),
                ),
            )
            .await?;
        Ok(realm_id)
    }

    /// Grants `role` to `user` on behalf of alice.
    pub async fn share(&self, realm_id: RealmId, user: &str, role: Option<Role>) -> Result<()> {
        self.server
            .realms
            .update_roles(
                &self.organization_id,
                grant(realm_id, user, role, &self.alice, Utc::now()),
            )
            .await?;
        Ok(())
    }

    /// File access for `author`, with blocks going through the realm-scoped
    /// block service.
    #[must_use]
    pub fn file_context(
        &self,
        author: &DeviceId,
        realm_id: RealmId,
        key: SymmetricKey,
        chunker: BlockChunker,
    ) -> FileContext {
        let blocks: Arc<dyn Blockstore> =
            Arc::new(self.server.blocks.scoped(author.clone(), realm_id));
        FileContext {
            organization_id: self.organization_id.clone(),
            author: author.clone(),
            realm_id,
            key,
            vlobs: Arc::clone(&self.server.vlobs),
            blocks,
            chunker,
            retention: BlockRetention::default(),
        }
    }
}
