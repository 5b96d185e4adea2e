//! Single-process backend.
//!
//! All state sits behind one mutex. Every check and the mutation it guards
//! happen inside the same critical section, so the lock is the serialization
//! point for racing writers.

use {
    crate::{
        maintenance,
        policy::{self, Action},
        roles::RoleLedger,
    },
    async_trait::async_trait,
    parking_lot::Mutex,
    realmvault_protocol::{
        DateTimeUtc, DeviceId, OrganizationId, RealmAccess, RealmChanges, RealmError,
        RealmGrantedRole, RealmId, RealmStatus, ReencryptionBatchEntry, ReencryptionBatchStats,
        Role, UserId, VlobAtom, VlobId, VlobVersion,
        events::{Event, EventSink},
        store::{RealmStore, ReencryptionProgress, VlobStore},
    },
    std::{
        collections::{HashMap, HashSet},
        mem,
        sync::Arc,
    },
    tracing::debug,
};

#[derive(Debug)]
struct Realm {
    status: RealmStatus,
    ledger: RoleLedger,
    /// Checkpoint log: entry `i` was written at checkpoint `i + 1`.
    updates: Vec<(VlobId, u32)>,
    /// Blobs re-encrypted under the revision being rolled out.
    reencrypted: HashMap<(VlobId, u32), Vec<u8>>,
}

impl Realm {
    fn checkpoint(&self) -> u64 {
        self.updates.len() as u64
    }

    fn role_of(&self, author: &DeviceId) -> Option<Role> {
        self.ledger.role_of(author.user_id())
    }
}

#[derive(Debug)]
struct Vlob {
    realm_id: RealmId,
    /// Gapless: `atoms[i].version == i + 1`.
    atoms: Vec<VlobAtom>,
}

#[derive(Debug, Default)]
struct State {
    realms: HashMap<(OrganizationId, RealmId), Realm>,
    vlobs: HashMap<(OrganizationId, VlobId), Vlob>,
}

impl State {
    fn realm(
        &self,
        organization_id: &OrganizationId,
        realm_id: RealmId,
    ) -> Result<&Realm, RealmError> {
        self.realms
            .get(&(organization_id.clone(), realm_id))
            .ok_or_else(|| RealmError::not_found(format_args!("realm {realm_id}")))
    }

    fn vlob(&self, organization_id: &OrganizationId, vlob_id: VlobId) -> Result<&Vlob, RealmError> {
        self.vlobs
            .get(&(organization_id.clone(), vlob_id))
            .ok_or_else(|| RealmError::not_found(format_args!("vlob {vlob_id}")))
    }

    fn realm_atoms<'a>(
        &'a self,
        organization_id: &'a OrganizationId,
        realm_id: RealmId,
    ) -> impl Iterator<Item = (VlobId, &'a VlobAtom)> + 'a {
        self.vlobs
            .iter()
            .filter(move |((org, _), vlob)| org == organization_id && vlob.realm_id == realm_id)
            .flat_map(|((_, vlob_id), vlob)| vlob.atoms.iter().map(|atom| (*vlob_id, atom)))
    }

    fn reencryption_stats(
        &self,
        organization_id: &OrganizationId,
        realm_id: RealmId,
    ) -> Result<ReencryptionBatchStats, RealmError> {
        let realm = self.realm(organization_id, realm_id)?;
        Ok(ReencryptionBatchStats {
            total: self.realm_atoms(organization_id, realm_id).count() as u64,
            done: realm.reencrypted.len() as u64,
        })
    }
}

/// Resolves `version` (latest if `None`) in a gapless atom chain.
fn resolve_atom(atoms: &[VlobAtom], version: Option<u32>) -> Result<&VlobAtom, RealmError> {
    match version {
        None => atoms
            .last()
            .ok_or_else(|| RealmError::not_found("vlob version")),
        Some(0) => Err(RealmError::not_found("vlob version 0")),
        Some(version) => usize::try_from(version - 1)
            .ok()
            .and_then(|index| atoms.get(index))
            .ok_or(RealmError::Version),
    }
}

/// In-memory `RealmStore`, `VlobStore` and `ReencryptionProgress`.
pub struct MemoryStore {
    state: Mutex<State>,
    events: Arc<dyn EventSink>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }
}

#[async_trait]
impl RealmStore for MemoryStore {
    async fn create(
        &self,
        organization_id: &OrganizationId,
        self_granted_role: RealmGrantedRole,
    ) -> Result<(), RealmError> {
        policy::check_self_granted_owner(&self_granted_role)?;
        let realm_id = self_granted_role.realm_id;
        let mut state = self.state.lock();
        let key = (organization_id.clone(), realm_id);
        if state.realms.contains_key(&key) {
            return Err(RealmError::AlreadyExists);
        }
        let event = Event::RolesUpdated {
            realm_id,
            author: self_granted_role.granted_by.clone(),
            user: self_granted_role.user_id.clone(),
            role: self_granted_role.role,
        };
        state.realms.insert(
            key,
            Realm {
                status: RealmStatus::new(),
                ledger: RoleLedger::new(vec![self_granted_role]),
                updates: Vec::new(),
                reencrypted: HashMap::new(),
            },
        );
        debug!(%organization_id, %realm_id, "realm created");
        self.events.send(organization_id, event);
        Ok(())
    }

    async fn get_status(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<RealmStatus, RealmError> {
        let state = self.state.lock();
        let realm = state.realm(organization_id, realm_id)?;
        policy::check(Action::ReadData, realm.role_of(author))?;
        Ok(realm.status.clone())
    }

    async fn get_roles(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<HashMap<UserId, Role>, RealmError> {
        let state = self.state.lock();
        let realm = state.realm(organization_id, realm_id)?;
        let roles = realm.ledger.current_roles();
        policy::check_member(&roles, author.user_id())?;
        Ok(roles)
    }

    async fn get_access(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<RealmAccess, RealmError> {
        let state = self.state.lock();
        let realm = state.realm(organization_id, realm_id)?;
        Ok(RealmAccess {
            role: realm.role_of(author),
            status: realm.status.clone(),
        })
    }

    async fn get_role_certificates(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        since: Option<DateTimeUtc>,
    ) -> Result<Vec<Vec<u8>>, RealmError> {
        let state = self.state.lock();
        let realm = state.realm(organization_id, realm_id)?;
        policy::check(Action::ReadData, realm.role_of(author))?;
        Ok(realm.ledger.certificates_since(since))
    }

    async fn update_roles(
        &self,
        organization_id: &OrganizationId,
        new_role: RealmGrantedRole,
    ) -> Result<(), RealmError> {
        let realm_id = new_role.realm_id;
        let mut state = self.state.lock();
        let realm = state
            .realms
            .get_mut(&(organization_id.clone(), realm_id))
            .ok_or_else(|| RealmError::not_found(format_args!("realm {realm_id}")))?;
        let roles = realm.ledger.current_roles();
        policy::check_role_change(&roles, &new_role)?;
        policy::check_not_in_maintenance(&realm.status)?;
        if roles.get(&new_role.user_id).copied() == new_role.role {
            return Err(RealmError::AlreadyExists);
        }

        let event = Event::RolesUpdated {
            realm_id,
            author: new_role.granted_by.clone(),
            user: new_role.user_id.clone(),
            role: new_role.role,
        };
        debug!(%organization_id, %realm_id, user = %new_role.user_id, role = ?new_role.role, "role updated");
        realm.ledger.append(new_role);
        self.events.send(organization_id, event);
        Ok(())
    }

    async fn get_realms_for_user(
        &self,
        organization_id: &OrganizationId,
        user: &UserId,
    ) -> Result<HashMap<RealmId, Role>, RealmError> {
        let state = self.state.lock();
        Ok(state
            .realms
            .iter()
            .filter(|((org, _), _)| org == organization_id)
            .filter_map(|((_, realm_id), realm)| {
                realm.ledger.role_of(user).map(|role| (*realm_id, role))
            })
            .collect())
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
        let mut state = self.state.lock();
        let realm = state
            .realms
            .get_mut(&(organization_id.clone(), realm_id))
            .ok_or_else(|| RealmError::not_found(format_args!("realm {realm_id}")))?;
        maintenance::check_start(
            &realm.ledger.current_roles(),
            author,
            &realm.status,
            encryption_revision,
            recipients,
        )?;
        realm.status = maintenance::reencryption_status(author, encryption_revision, timestamp);
        realm.reencrypted.clear();
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
            let state = self.state.lock();
            let realm = state.realm(organization_id, realm_id)?;
            maintenance::check_in_reencryption(
                &realm.ledger.current_roles(),
                author,
                &realm.status,
                encryption_revision,
            )?;
        }

        // The predicate may call back into this store, so it runs unlocked.
        if !progress
            .is_finished(organization_id, realm_id, encryption_revision)
            .await?
        {
            return Err(RealmError::Maintenance(
                "reencryption operations are not over".into(),
            ));
        }

        let mut state = self.state.lock();
        let State { realms, vlobs } = &mut *state;
        let realm = realms
            .get_mut(&(organization_id.clone(), realm_id))
            .ok_or_else(|| RealmError::not_found(format_args!("realm {realm_id}")))?;
        maintenance::check_in_reencryption(
            &realm.ledger.current_roles(),
            author,
            &realm.status,
            encryption_revision,
        )?;
        for ((vlob_id, version), blob) in mem::take(&mut realm.reencrypted) {
            let atom = vlobs
                .get_mut(&(organization_id.clone(), vlob_id))
                .and_then(|vlob| vlob.atoms.get_mut(usize::try_from(version - 1).ok()?));
            if let Some(atom) = atom {
                atom.blob = blob;
            }
        }
        realm.status.maintenance = None;
        Ok(())
    }
}

#[async_trait]
impl VlobStore for MemoryStore {
    async fn create(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        vlob_id: VlobId,
        timestamp: DateTimeUtc,
        blob: Vec<u8>,
    ) -> Result<(), RealmError> {
        let mut state = self.state.lock();
        let State { realms, vlobs } = &mut *state;
        let realm = realms
            .get_mut(&(organization_id.clone(), realm_id))
            .ok_or_else(|| RealmError::not_found(format_args!("realm {realm_id}")))?;
        policy::check(Action::WriteData, realm.role_of(author))?;
        policy::check_not_in_maintenance(&realm.status)?;
        let key = (organization_id.clone(), vlob_id);
        if vlobs.contains_key(&key) {
            return Err(RealmError::AlreadyExists);
        }

        vlobs.insert(
            key,
            Vlob {
                realm_id,
                atoms: vec![VlobAtom {
                    version: 1,
                    blob,
                    author: author.clone(),
                    created_on: timestamp,
                }],
            },
        );
        realm.updates.push((vlob_id, 1));
        let checkpoint = realm.checkpoint();
        debug!(%organization_id, %realm_id, %vlob_id, checkpoint, "vlob created");
        // Published under the lock so subscribers observe checkpoints in order.
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
        let state = self.state.lock();
        let vlob = state.vlob(organization_id, vlob_id)?;
        let realm = state.realm(organization_id, vlob.realm_id)?;
        policy::check(Action::ReadData, realm.role_of(author))?;
        resolve_atom(&vlob.atoms, version).cloned()
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
        let mut state = self.state.lock();
        let State { realms, vlobs } = &mut *state;
        let vlob = vlobs
            .get_mut(&(organization_id.clone(), vlob_id))
            .ok_or_else(|| RealmError::not_found(format_args!("vlob {vlob_id}")))?;
        let realm_id = vlob.realm_id;
        let realm = realms
            .get_mut(&(organization_id.clone(), realm_id))
            .ok_or_else(|| RealmError::not_found(format_args!("realm {realm_id}")))?;
        policy::check(Action::WriteData, realm.role_of(author))?;
        policy::check_not_in_maintenance(&realm.status)?;
        if usize::try_from(version).ok() != Some(vlob.atoms.len() + 1) {
            return Err(RealmError::Version);
        }

        vlob.atoms.push(VlobAtom {
            version,
            blob,
            author: author.clone(),
            created_on: timestamp,
        });
        realm.updates.push((vlob_id, version));
        let checkpoint = realm.checkpoint();
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
        let state = self.state.lock();
        let realm = state.realm(organization_id, realm_id)?;
        policy::check(Action::ReadData, realm.role_of(author))?;
        let skip = usize::try_from(checkpoint).unwrap_or(usize::MAX);
        let changes = realm.updates.iter().skip(skip).copied().collect();
        Ok(RealmChanges {
            checkpoint: realm.checkpoint().max(checkpoint),
            changes,
        })
    }

    async fn list_versions(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        vlob_id: VlobId,
    ) -> Result<Vec<VlobVersion>, RealmError> {
        let state = self.state.lock();
        let vlob = state.vlob(organization_id, vlob_id)?;
        let realm = state.realm(organization_id, vlob.realm_id)?;
        policy::check(Action::ReadData, realm.role_of(author))?;
        Ok(vlob
            .atoms
            .iter()
            .map(|atom| VlobVersion {
                version: atom.version,
                author: atom.author.clone(),
                created_on: atom.created_on,
            })
            .collect())
    }

    async fn maintenance_get_reencryption_batch(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        size: usize,
    ) -> Result<Vec<ReencryptionBatchEntry>, RealmError> {
        let state = self.state.lock();
        let realm = state.realm(organization_id, realm_id)?;
        maintenance::check_in_reencryption(
            &realm.ledger.current_roles(),
            author,
            &realm.status,
            encryption_revision,
        )?;
        let mut batch: Vec<_> = state
            .realm_atoms(organization_id, realm_id)
            .filter(|(vlob_id, atom)| !realm.reencrypted.contains_key(&(*vlob_id, atom.version)))
            .map(|(vlob_id, atom)| ReencryptionBatchEntry {
                vlob_id,
                version: atom.version,
                blob: atom.blob.clone(),
            })
            .collect();
        batch.sort_by_key(|entry| (entry.vlob_id, entry.version));
        batch.truncate(size);
        Ok(batch)
    }

    async fn maintenance_save_reencryption_batch(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        batch: Vec<ReencryptionBatchEntry>,
    ) -> Result<ReencryptionBatchStats, RealmError> {
        let mut state = self.state.lock();
        let State { realms, vlobs } = &mut *state;
        let realm = realms
            .get_mut(&(organization_id.clone(), realm_id))
            .ok_or_else(|| RealmError::not_found(format_args!("realm {realm_id}")))?;
        maintenance::check_in_reencryption(
            &realm.ledger.current_roles(),
            author,
            &realm.status,
            encryption_revision,
        )?;
        for entry in batch {
            let known = vlobs
                .get(&(organization_id.clone(), entry.vlob_id))
                .is_some_and(|vlob| {
                    vlob.realm_id == realm_id
                        && entry.version >= 1
                        && usize::try_from(entry.version).is_ok_and(|v| v <= vlob.atoms.len())
                });
            if known {
                realm
                    .reencrypted
                    .insert((entry.vlob_id, entry.version), entry.blob);
            }
        }
        state.reencryption_stats(organization_id, realm_id)
    }
}

#[async_trait]
impl ReencryptionProgress for MemoryStore {
    async fn is_finished(
        &self,
        organization_id: &OrganizationId,
        realm_id: RealmId,
        encryption_revision: u64,
    ) -> Result<bool, RealmError> {
        let state = self.state.lock();
        let realm = state.realm(organization_id, realm_id)?;
        if !realm.status.in_reencryption()
            || realm.status.encryption_revision != encryption_revision
        {
            return Ok(false);
        }
        let stats = state.reencryption_stats(organization_id, realm_id)?;
        Ok(stats.done == stats.total)
    }
}
