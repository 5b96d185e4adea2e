//! PostgreSQL backend.
//!
//! Mutations lock the realm row (`SELECT ... FOR UPDATE`) for the duration of
//! their transaction. The `UNIQUE (vlob, version)` constraint backs up the
//! optimistic version check.

use {
    crate::{
        maintenance,
        policy::{self, Action},
        roles::RoleLedger,
    },
    anyhow::{Context as _, bail},
    async_trait::async_trait,
    realmvault_protocol::{
        DateTimeUtc, DeviceId, Maintenance, MaintenanceType, OrganizationId, RealmAccess,
        RealmChanges, RealmError, RealmGrantedRole, RealmId, RealmStatus, ReencryptionBatchEntry,
        ReencryptionBatchStats, Role, UserId, VlobAtom, VlobId, VlobVersion,
        events::{Event, EventSink},
        store::{RealmStore, ReencryptionProgress, VlobStore},
    },
    sqlx::{FromRow, PgConnection, PgPool},
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    },
    tracing::debug,
    uuid::Uuid,
};

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505")
    )
}

fn to_db(value: u64) -> anyhow::Result<i64> {
    i64::try_from(value).with_context(|| format!("{value} does not fit in BIGINT"))
}

fn from_db(value: i64) -> anyhow::Result<u64> {
    u64::try_from(value).with_context(|| format!("unexpected negative value {value}"))
}

fn version_to_db(version: u32) -> anyhow::Result<i32> {
    i32::try_from(version).with_context(|| format!("version {version} does not fit in INTEGER"))
}

/// `None` if no stored atom can carry `version`.
fn stored_version(version: u32) -> Option<i32> {
    i32::try_from(version).ok()
}

fn version_from_db(version: i32) -> anyhow::Result<u32> {
    u32::try_from(version).with_context(|| format!("unexpected negative version {version}"))
}

#[derive(Debug, FromRow)]
struct RealmRow {
    id: i64,
    encryption_revision: i64,
    maintenance_type: Option<String>,
    maintenance_started_by: Option<String>,
    maintenance_started_on: Option<DateTimeUtc>,
    checkpoint: i64,
}

impl RealmRow {
    fn status(&self) -> anyhow::Result<RealmStatus> {
        let maintenance = match (
            &self.maintenance_type,
            &self.maintenance_started_by,
            self.maintenance_started_on,
        ) {
            (Some(kind), Some(started_by), Some(started_on)) => Some(Maintenance {
                kind: kind.parse()?,
                started_by: started_by.parse()?,
                started_on,
            }),
            (None, None, None) => None,
            _ => bail!("inconsistent maintenance columns for realm row {}", self.id),
        };
        Ok(RealmStatus {
            maintenance,
            encryption_revision: from_db(self.encryption_revision)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct RoleRow {
    user_id: String,
    role: Option<String>,
    certificate: Vec<u8>,
    granted_by: String,
    granted_on: DateTimeUtc,
}

#[derive(Debug, FromRow)]
struct VlobRow {
    id: i64,
    realm_id: Uuid,
}

#[derive(Debug, FromRow)]
struct AtomRow {
    version: i32,
    blob: Vec<u8>,
    author: String,
    created_on: DateTimeUtc,
}

impl AtomRow {
    fn into_atom(self) -> anyhow::Result<VlobAtom> {
        Ok(VlobAtom {
            version: version_from_db(self.version)?,
            blob: self.blob,
            author: self.author.parse()?,
            created_on: self.created_on,
        })
    }
}

const REALM_COLUMNS: &str = "id, encryption_revision, maintenance_type, \
    maintenance_started_by, maintenance_started_on, checkpoint";

#[derive(Debug, Clone, Copy)]
enum RowLock {
    None,
    /// Waits for writers of the realm row and keeps them out until commit.
    Share,
    Update,
}

async fn fetch_realm(
    conn: &mut PgConnection,
    organization_id: &OrganizationId,
    realm_id: RealmId,
    lock: RowLock,
) -> Result<RealmRow, RealmError> {
    let sql = format!(
        "SELECT {REALM_COLUMNS} FROM realm WHERE organization_id = $1 AND realm_id = $2{}",
        match lock {
            RowLock::None => "",
            RowLock::Share => " FOR SHARE",
            RowLock::Update => " FOR UPDATE",
        },
    );
    sqlx::query_as::<_, RealmRow>(&sql)
        .bind(&organization_id.0)
        .bind(realm_id.0)
        .fetch_optional(&mut *conn)
        .await
        .context("failed to fetch realm")?
        .ok_or_else(|| RealmError::not_found(format_args!("realm {realm_id}")))
}

async fn fetch_vlob(
    conn: &mut PgConnection,
    organization_id: &OrganizationId,
    vlob_id: VlobId,
) -> Result<VlobRow, RealmError> {
    sqlx::query_as::<_, VlobRow>(
        "SELECT vlob.id, realm.realm_id FROM vlob \
        JOIN realm ON realm.id = vlob.realm \
        WHERE vlob.organization_id = $1 AND vlob.vlob_id = $2",
    )
    .bind(&organization_id.0)
    .bind(vlob_id.0)
    .fetch_optional(&mut *conn)
    .await
    .context("failed to fetch vlob")?
    .ok_or_else(|| RealmError::not_found(format_args!("vlob {vlob_id}")))
}

async fn load_ledger(
    conn: &mut PgConnection,
    realm: &RealmRow,
    realm_id: RealmId,
) -> Result<RoleLedger, RealmError> {
    let rows = sqlx::query_as::<_, RoleRow>(
        "SELECT user_id, role, certificate, granted_by, granted_on \
        FROM realm_user_role WHERE realm = $1 ORDER BY id",
    )
    .bind(realm.id)
    .fetch_all(&mut *conn)
    .await
    .context("failed to fetch realm roles")?;
    let grants = rows
        .into_iter()
        .map(|row| {
            anyhow::Ok(RealmGrantedRole {
                certificate: row.certificate,
                realm_id,
                user_id: row.user_id.into(),
                role: row.role.as_deref().map(str::parse::<Role>).transpose()?,
                granted_by: row.granted_by.parse()?,
                granted_on: row.granted_on,
            })
        })
        .collect::<anyhow::Result<_>>()?;
    Ok(RoleLedger::new(grants))
}

async fn insert_role(
    conn: &mut PgConnection,
    realm: &RealmRow,
    grant: &RealmGrantedRole,
) -> Result<(), RealmError> {
    sqlx::query(
        "INSERT INTO realm_user_role (realm, user_id, role, certificate, granted_by, granted_on) \
        VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(realm.id)
    .bind(&grant.user_id.0)
    .bind(grant.role.map(Role::as_str))
    .bind(&grant.certificate)
    .bind(grant.granted_by.to_string())
    .bind(grant.granted_on)
    .execute(&mut *conn)
    .await
    .context("failed to insert role")?;
    Ok(())
}

/// Appends an atom and its checkpoint log entry. Returns the new checkpoint.
async fn append_atom(
    conn: &mut PgConnection,
    realm: &RealmRow,
    vlob_row: i64,
    version: u32,
    author: &DeviceId,
    timestamp: DateTimeUtc,
    blob: &[u8],
) -> Result<u64, RealmError> {
    let atom: i64 = sqlx::query_scalar(
        "INSERT INTO vlob_atom (vlob, version, blob, author, created_on) \
        VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(vlob_row)
    .bind(version_to_db(version)?)
    .bind(blob)
    .bind(author.to_string())
    .bind(timestamp)
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            RealmError::Version
        } else {
            RealmError::Internal(anyhow::Error::new(err).context("failed to insert vlob atom"))
        }
    })?;

    let checkpoint: i64 = sqlx::query_scalar(
        "UPDATE realm SET checkpoint = checkpoint + 1 WHERE id = $1 RETURNING checkpoint",
    )
    .bind(realm.id)
    .fetch_one(&mut *conn)
    .await
    .context("failed to bump realm checkpoint")?;
    sqlx::query("INSERT INTO realm_vlob_update (realm, checkpoint, vlob_atom) VALUES ($1, $2, $3)")
        .bind(realm.id)
        .bind(checkpoint)
        .bind(atom)
        .execute(&mut *conn)
        .await
        .context("failed to append checkpoint log entry")?;
    Ok(from_db(checkpoint)?)
}

async fn reencryption_stats(
    conn: &mut PgConnection,
    realm: &RealmRow,
    encryption_revision: u64,
) -> Result<ReencryptionBatchStats, RealmError> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM vlob_atom JOIN vlob ON vlob.id = vlob_atom.vlob \
        WHERE vlob.realm = $1",
    )
    .bind(realm.id)
    .fetch_one(&mut *conn)
    .await
    .context("failed to count vlob atoms")?;
    let done: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM vlob_reencryption \
        JOIN vlob_atom ON vlob_atom.id = vlob_reencryption.vlob_atom \
        JOIN vlob ON vlob.id = vlob_atom.vlob \
        WHERE vlob.realm = $1 AND vlob_reencryption.encryption_revision = $2",
    )
    .bind(realm.id)
    .bind(to_db(encryption_revision)?)
    .fetch_one(&mut *conn)
    .await
    .context("failed to count re-encrypted atoms")?;
    Ok(ReencryptionBatchStats {
        total: from_db(total)?,
        done: from_db(done)?,
    })
}

pub struct PostgresStore {
    pool: PgPool,
    events: Arc<dyn EventSink>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, events: Arc<dyn EventSink>) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect to database")?;
        Ok(Self::from_pool(pool, events))
    }

    #[must_use]
    pub fn from_pool(pool: PgPool, events: Arc<dyn EventSink>) -> Self {
        Self { pool, events }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, RealmError> {
        Ok(self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?)
    }
}

#[async_trait]
impl RealmStore for PostgresStore {
    async fn create(
        &self,
        organization_id: &OrganizationId,
        self_granted_role: RealmGrantedRole,
    ) -> Result<(), RealmError> {
        policy::check_self_granted_owner(&self_granted_role)?;
        let realm_id = self_granted_role.realm_id;
        let mut tx = self.begin().await?;
        let realm = sqlx::query_as::<_, RealmRow>(&format!(
            "INSERT INTO realm (organization_id, realm_id, encryption_revision) \
            VALUES ($1, $2, $3) ON CONFLICT (organization_id, realm_id) DO NOTHING \
            RETURNING {REALM_COLUMNS}"
        ))
        .bind(&organization_id.0)
        .bind(realm_id.0)
        .bind(to_db(RealmStatus::INITIAL_ENCRYPTION_REVISION)?)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert realm")?
        .ok_or(RealmError::AlreadyExists)?;
        insert_role(&mut tx, &realm, &self_granted_role).await?;
        tx.commit().await.context("failed to commit")?;

        debug!(%organization_id, %realm_id, "realm created");
        self.events.send(
            organization_id,
            Event::RolesUpdated {
                realm_id,
                author: self_granted_role.granted_by,
                user: self_granted_role.user_id,
                role: self_granted_role.role,
            },
        );
        Ok(())
    }

    async fn get_status(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<RealmStatus, RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
        let ledger = load_ledger(&mut tx, &realm, realm_id).await?;
        policy::check(Action::ReadData, ledger.role_of(author.user_id()))?;
        Ok(realm.status()?)
    }

    async fn get_roles(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<HashMap<UserId, Role>, RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
        let roles = load_ledger(&mut tx, &realm, realm_id)
            .await?
            .current_roles();
        policy::check_member(&roles, author.user_id())?;
        Ok(roles)
    }

    async fn get_access(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<RealmAccess, RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::Share).await?;
        let ledger = load_ledger(&mut tx, &realm, realm_id).await?;
        Ok(RealmAccess {
            role: ledger.role_of(author.user_id()),
            status: realm.status()?,
        })
    }

    async fn get_role_certificates(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        since: Option<DateTimeUtc>,
    ) -> Result<Vec<Vec<u8>>, RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
        let ledger = load_ledger(&mut tx, &realm, realm_id).await?;
        policy::check(Action::ReadData, ledger.role_of(author.user_id()))?;
        Ok(ledger.certificates_since(since))
    }

    async fn update_roles(
        &self,
        organization_id: &OrganizationId,
        new_role: RealmGrantedRole,
    ) -> Result<(), RealmError> {
        let realm_id = new_role.realm_id;
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::Update).await?;
        let roles = load_ledger(&mut tx, &realm, realm_id)
            .await?
            .current_roles();
        policy::check_role_change(&roles, &new_role)?;
        policy::check_not_in_maintenance(&realm.status()?)?;
        if roles.get(&new_role.user_id).copied() == new_role.role {
            return Err(RealmError::AlreadyExists);
        }
        insert_role(&mut tx, &realm, &new_role).await?;
        tx.commit().await.context("failed to commit")?;

        debug!(%organization_id, %realm_id, user = %new_role.user_id, role = ?new_role.role, "role updated");
        self.events.send(
            organization_id,
            Event::RolesUpdated {
                realm_id,
                author: new_role.granted_by,
                user: new_role.user_id,
                role: new_role.role,
            },
        );
        Ok(())
    }

    async fn get_realms_for_user(
        &self,
        organization_id: &OrganizationId,
        user: &UserId,
    ) -> Result<HashMap<RealmId, Role>, RealmError> {
        let rows: Vec<(Uuid, Option<String>)> = sqlx::query_as(
            "SELECT realm.realm_id, realm_user_role.role FROM realm_user_role \
            JOIN realm ON realm.id = realm_user_role.realm \
            WHERE realm.organization_id = $1 AND realm_user_role.user_id = $2 \
            ORDER BY realm_user_role.granted_on, realm_user_role.id",
        )
        .bind(&organization_id.0)
        .bind(&user.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch user roles")?;

        let mut realms = HashMap::new();
        for (realm_id, role) in rows {
            match role {
                Some(role) => {
                    realms.insert(RealmId(realm_id), role.parse()?);
                }
                None => {
                    realms.remove(&RealmId(realm_id));
                }
            }
        }
        Ok(realms)
    }

    async fn start_reencryption_maintenance(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        recipients: &HashSet<UserId>,
        timestamp: DateTimeUtc,
    ) -> Result<(), RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::Update).await?;
        let roles = load_ledger(&mut tx, &realm, realm_id)
            .await?
            .current_roles();
        maintenance::check_start(
            &roles,
            author,
            &realm.status()?,
            encryption_revision,
            recipients,
        )?;
        sqlx::query(
            "UPDATE realm SET encryption_revision = $2, maintenance_type = $3, \
            maintenance_started_by = $4, maintenance_started_on = $5 WHERE id = $1",
        )
        .bind(realm.id)
        .bind(to_db(encryption_revision)?)
        .bind(MaintenanceType::Reencryption.as_str())
        .bind(author.to_string())
        .bind(timestamp)
        .execute(&mut *tx)
        .await
        .context("failed to start maintenance")?;
        tx.commit().await.context("failed to commit")?;
        Ok(())
    }

    async fn finish_reencryption_maintenance(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        progress: &dyn ReencryptionProgress,
    ) -> Result<(), RealmError> {
        {
            let mut tx = self.begin().await?;
            let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
            let roles = load_ledger(&mut tx, &realm, realm_id)
                .await?
                .current_roles();
            maintenance::check_in_reencryption(
                &roles,
                author,
                &realm.status()?,
                encryption_revision,
            )?;
        }

        if !progress
            .is_finished(organization_id, realm_id, encryption_revision)
            .await?
        {
            return Err(RealmError::Maintenance(
                "reencryption operations are not over".into(),
            ));
        }

        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::Update).await?;
        let roles = load_ledger(&mut tx, &realm, realm_id)
            .await?
            .current_roles();
        maintenance::check_in_reencryption(&roles, author, &realm.status()?, encryption_revision)?;
        sqlx::query(
            "UPDATE vlob_atom SET blob = vlob_reencryption.blob \
            FROM vlob_reencryption, vlob \
            WHERE vlob_reencryption.vlob_atom = vlob_atom.id \
            AND vlob_reencryption.encryption_revision = $2 \
            AND vlob.id = vlob_atom.vlob AND vlob.realm = $1",
        )
        .bind(realm.id)
        .bind(to_db(encryption_revision)?)
        .execute(&mut *tx)
        .await
        .context("failed to swap re-encrypted blobs")?;
        sqlx::query(
            "DELETE FROM vlob_reencryption USING vlob_atom, vlob \
            WHERE vlob_atom.id = vlob_reencryption.vlob_atom \
            AND vlob.id = vlob_atom.vlob AND vlob.realm = $1",
        )
        .bind(realm.id)
        .execute(&mut *tx)
        .await
        .context("failed to clear re-encrypted blobs")?;
        sqlx::query(
            "UPDATE realm SET maintenance_type = NULL, maintenance_started_by = NULL, \
            maintenance_started_on = NULL WHERE id = $1",
        )
        .bind(realm.id)
        .execute(&mut *tx)
        .await
        .context("failed to finish maintenance")?;
        tx.commit().await.context("failed to commit")?;
        Ok(())
    }
}

#[async_trait]
impl VlobStore for PostgresStore {
    async fn create(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        vlob_id: VlobId,
        timestamp: DateTimeUtc,
        blob: Vec<u8>,
    ) -> Result<(), RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::Update).await?;
        let ledger = load_ledger(&mut tx, &realm, realm_id).await?;
        policy::check(Action::WriteData, ledger.role_of(author.user_id()))?;
        policy::check_not_in_maintenance(&realm.status()?)?;

        let vlob_row: i64 = sqlx::query_scalar(
            "INSERT INTO vlob (organization_id, vlob_id, realm) VALUES ($1, $2, $3) \
            ON CONFLICT (organization_id, vlob_id) DO NOTHING RETURNING id",
        )
        .bind(&organization_id.0)
        .bind(vlob_id.0)
        .bind(realm.id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert vlob")?
        .ok_or(RealmError::AlreadyExists)?;
        let checkpoint =
            append_atom(&mut tx, &realm, vlob_row, 1, author, timestamp, &blob).await?;
        tx.commit().await.context("failed to commit")?;

        debug!(%organization_id, %realm_id, %vlob_id, checkpoint, "vlob created");
        self.events.send(
            organization_id,
            Event::VlobsUpdated {
                realm_id,
                author: author.clone(),
                checkpoint,
                vlob_id,
                version: 1,
            },
        );
        Ok(())
    }

    async fn read(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        vlob_id: VlobId,
        version: Option<u32>,
    ) -> Result<VlobAtom, RealmError> {
        let mut tx = self.begin().await?;
        let vlob = fetch_vlob(&mut tx, organization_id, vlob_id).await?;
        let realm_id = RealmId(vlob.realm_id);
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
        let ledger = load_ledger(&mut tx, &realm, realm_id).await?;
        policy::check(Action::ReadData, ledger.role_of(author.user_id()))?;

        let columns = "SELECT version, blob, author, created_on FROM vlob_atom WHERE vlob = $1";
        let row = match version {
            None => {
                sqlx::query_as::<_, AtomRow>(&format!("{columns} ORDER BY version DESC LIMIT 1"))
                    .bind(vlob.id)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("failed to fetch vlob atom")?
                    .ok_or_else(|| RealmError::not_found("vlob version"))?
            }
            Some(0) => return Err(RealmError::not_found("vlob version 0")),
            // Versions are gapless, so a missing one lies past the latest.
            Some(version) => {
                let version = stored_version(version).ok_or(RealmError::Version)?;
                sqlx::query_as::<_, AtomRow>(&format!("{columns} AND version = $2"))
                    .bind(vlob.id)
                    .bind(version)
                    .fetch_optional(&mut *tx)
                    .await
                    .context("failed to fetch vlob atom")?
                    .ok_or(RealmError::Version)?
            }
        };
        Ok(row.into_atom()?)
    }

    async fn update(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        vlob_id: VlobId,
        version: u32,
        timestamp: DateTimeUtc,
        blob: Vec<u8>,
    ) -> Result<(), RealmError> {
        let mut tx = self.begin().await?;
        let vlob = fetch_vlob(&mut tx, organization_id, vlob_id).await?;
        let realm_id = RealmId(vlob.realm_id);
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::Update).await?;
        let ledger = load_ledger(&mut tx, &realm, realm_id).await?;
        policy::check(Action::WriteData, ledger.role_of(author.user_id()))?;
        policy::check_not_in_maintenance(&realm.status()?)?;

        let latest: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM vlob_atom WHERE vlob = $1")
                .bind(vlob.id)
                .fetch_one(&mut *tx)
                .await
                .context("failed to fetch latest version")?;
        if version_from_db(latest)?.checked_add(1) != Some(version) {
            return Err(RealmError::Version);
        }
        let checkpoint =
            append_atom(&mut tx, &realm, vlob.id, version, author, timestamp, &blob).await?;
        tx.commit().await.context("failed to commit")?;

        debug!(%organization_id, %realm_id, %vlob_id, version, checkpoint, "vlob updated");
        self.events.send(
            organization_id,
            Event::VlobsUpdated {
                realm_id,
                author: author.clone(),
                checkpoint,
                vlob_id,
                version,
            },
        );
        Ok(())
    }

    async fn poll_changes(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        checkpoint: u64,
    ) -> Result<RealmChanges, RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
        let ledger = load_ledger(&mut tx, &realm, realm_id).await?;
        policy::check(Action::ReadData, ledger.role_of(author.user_id()))?;

        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            "SELECT vlob.vlob_id, vlob_atom.version FROM realm_vlob_update \
            JOIN vlob_atom ON vlob_atom.id = realm_vlob_update.vlob_atom \
            JOIN vlob ON vlob.id = vlob_atom.vlob \
            WHERE realm_vlob_update.realm = $1 AND realm_vlob_update.checkpoint > $2 \
            ORDER BY realm_vlob_update.checkpoint",
        )
        .bind(realm.id)
        .bind(to_db(checkpoint)?)
        .fetch_all(&mut *tx)
        .await
        .context("failed to fetch realm changes")?;
        let changes = rows
            .into_iter()
            .map(|(vlob_id, version)| anyhow::Ok((VlobId(vlob_id), version_from_db(version)?)))
            .collect::<anyhow::Result<_>>()?;
        Ok(RealmChanges {
            checkpoint: from_db(realm.checkpoint)?.max(checkpoint),
            changes,
        })
    }

    async fn list_versions(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        vlob_id: VlobId,
    ) -> Result<Vec<VlobVersion>, RealmError> {
        let mut tx = self.begin().await?;
        let vlob = fetch_vlob(&mut tx, organization_id, vlob_id).await?;
        let realm_id = RealmId(vlob.realm_id);
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
        let ledger = load_ledger(&mut tx, &realm, realm_id).await?;
        policy::check(Action::ReadData, ledger.role_of(author.user_id()))?;

        let rows: Vec<(i32, String, DateTimeUtc)> = sqlx::query_as(
            "SELECT version, author, created_on FROM vlob_atom WHERE vlob = $1 ORDER BY version",
        )
        .bind(vlob.id)
        .fetch_all(&mut *tx)
        .await
        .context("failed to fetch vlob versions")?;
        Ok(rows
            .into_iter()
            .map(|(version, author, created_on)| {
                anyhow::Ok(VlobVersion {
                    version: version_from_db(version)?,
                    author: author.parse()?,
                    created_on,
                })
            })
            .collect::<anyhow::Result<_>>()?)
    }

    async fn maintenance_get_reencryption_batch(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        size: usize,
    ) -> Result<Vec<ReencryptionBatchEntry>, RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
        let roles = load_ledger(&mut tx, &realm, realm_id)
            .await?
            .current_roles();
        maintenance::check_in_reencryption(&roles, author, &realm.status()?, encryption_revision)?;

        let rows: Vec<(Uuid, i32, Vec<u8>)> = sqlx::query_as(
            "SELECT vlob.vlob_id, vlob_atom.version, vlob_atom.blob FROM vlob_atom \
            JOIN vlob ON vlob.id = vlob_atom.vlob \
            LEFT JOIN vlob_reencryption ON vlob_reencryption.vlob_atom = vlob_atom.id \
                AND vlob_reencryption.encryption_revision = $2 \
            WHERE vlob.realm = $1 AND vlob_reencryption.vlob_atom IS NULL \
            ORDER BY vlob.vlob_id, vlob_atom.version LIMIT $3",
        )
        .bind(realm.id)
        .bind(to_db(encryption_revision)?)
        .bind(i64::try_from(size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .context("failed to fetch reencryption batch")?;
        Ok(rows
            .into_iter()
            .map(|(vlob_id, version, blob)| {
                anyhow::Ok(ReencryptionBatchEntry {
                    vlob_id: VlobId(vlob_id),
                    version: version_from_db(version)?,
                    blob,
                })
            })
            .collect::<anyhow::Result<_>>()?)
    }

    async fn maintenance_save_reencryption_batch(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        batch: Vec<ReencryptionBatchEntry>,
    ) -> Result<ReencryptionBatchStats, RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::Update).await?;
        let roles = load_ledger(&mut tx, &realm, realm_id)
            .await?
            .current_roles();
        maintenance::check_in_reencryption(&roles, author, &realm.status()?, encryption_revision)?;

        for entry in batch {
            let Some(version) = stored_version(entry.version) else {
                continue;
            };
            // Entries naming atoms outside this realm match no row.
            sqlx::query(
                "INSERT INTO vlob_reencryption (vlob_atom, encryption_revision, blob) \
                SELECT vlob_atom.id, $3, $4 FROM vlob_atom \
                JOIN vlob ON vlob.id = vlob_atom.vlob \
                WHERE vlob.realm = $1 AND vlob.vlob_id = $2 AND vlob_atom.version = $5 \
                ON CONFLICT (vlob_atom, encryption_revision) DO UPDATE SET blob = EXCLUDED.blob",
            )
            .bind(realm.id)
            .bind(entry.vlob_id.0)
            .bind(to_db(encryption_revision)?)
            .bind(entry.blob)
            .bind(version)
            .execute(&mut *tx)
            .await
            .context("failed to save re-encrypted blob")?;
        }
        let stats = reencryption_stats(&mut tx, &realm, encryption_revision).await?;
        tx.commit().await.context("failed to commit")?;
        Ok(stats)
    }
}

#[async_trait]
impl ReencryptionProgress for PostgresStore {
    async fn is_finished(
        &self,
        organization_id: &OrganizationId,
        realm_id: RealmId,
        encryption_revision: u64,
    ) -> Result<bool, RealmError> {
        let mut tx = self.begin().await?;
        let realm = fetch_realm(&mut tx, organization_id, realm_id, RowLock::None).await?;
        let status = realm.status()?;
        if !status.in_reencryption() || status.encryption_revision != encryption_revision {
            return Ok(false);
        }
        let stats = reencryption_stats(&mut tx, &realm, encryption_revision).await?;
        Ok(stats.done == stats.total)
    }
}
