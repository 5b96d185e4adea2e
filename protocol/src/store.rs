//! Contracts of the realm/vlob storage engine.
//!
//! Every call receives an already-authenticated `(organization_id, author)`
//! pair. Implementations must make the membership check, the role check, the
//! version check and the mutation atomic with respect to concurrent calls on
//! the same realm or vlob.

use {
    crate::{
        DateTimeUtc, DeviceId, OrganizationId, RealmAccess, RealmChanges, RealmError,
        RealmGrantedRole, RealmId, RealmStatus, ReencryptionBatchEntry, ReencryptionBatchStats,
        Role, UserId, VlobAtom, VlobId, VlobVersion,
    },
    async_trait::async_trait,
    std::collections::{HashMap, HashSet},
};

#[async_trait]
pub trait RealmStore: Send + Sync {
    /// Creates a realm from the creator's self-granted `OWNER` role.
    async fn create(
        &self,
        organization_id: &OrganizationId,
        self_granted_role: RealmGrantedRole,
    ) -> Result<(), RealmError>;

    async fn get_status(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<RealmStatus, RealmError>;

    async fn get_roles(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<HashMap<UserId, Role>, RealmError>;

    /// Reads the author's role and the realm status in one consistent step.
    /// Unlike the other getters this does not reject non-members.
    async fn get_access(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
    ) -> Result<RealmAccess, RealmError>;

    /// Returns certificates of grants made strictly after `since`, or all of them.
    async fn get_role_certificates(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        since: Option<DateTimeUtc>,
    ) -> Result<Vec<Vec<u8>>, RealmError>;

    async fn update_roles(
        &self,
        organization_id: &OrganizationId,
        new_role: RealmGrantedRole,
    ) -> Result<(), RealmError>;

    async fn get_realms_for_user(
        &self,
        organization_id: &OrganizationId,
        user: &UserId,
    ) -> Result<HashMap<RealmId, Role>, RealmError>;

    /// Validates and applies the `Normal -> Reencryption` transition.
    ///
    /// `recipients` must be exactly the set of current members.
    async fn start_reencryption_maintenance(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        recipients: &HashSet<UserId>,
        timestamp: DateTimeUtc,
    ) -> Result<(), RealmError>;

    /// Validates and applies the `Reencryption -> Normal` transition.
    ///
    /// `progress` is consulted after the ownership, status and revision checks.
    async fn finish_reencryption_maintenance(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        progress: &dyn ReencryptionProgress,
    ) -> Result<(), RealmError>;
}

#[async_trait]
pub trait VlobStore: Send + Sync {
    async fn create(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        vlob_id: VlobId,
        timestamp: DateTimeUtc,
        blob: Vec<u8>,
    ) -> Result<(), RealmError>;

    /// Reads `version`, or the latest version if `None`.
    async fn read(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        vlob_id: VlobId,
        version: Option<u32>,
    ) -> Result<VlobAtom, RealmError>;

    /// Appends `version`, which must be exactly the current version plus one.
    async fn update(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        vlob_id: VlobId,
        version: u32,
        timestamp: DateTimeUtc,
        blob: Vec<u8>,
    ) -> Result<(), RealmError>;

    async fn poll_changes(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        checkpoint: u64,
    ) -> Result<RealmChanges, RealmError>;

    /// Returns the full history of a vlob, ordered by version.
    async fn list_versions(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        vlob_id: VlobId,
    ) -> Result<Vec<VlobVersion>, RealmError>;

    /// Returns up to `size` atoms of the realm that have not been re-encrypted
    /// under `encryption_revision` yet.
    async fn maintenance_get_reencryption_batch(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        size: usize,
    ) -> Result<Vec<ReencryptionBatchEntry>, RealmError>;

    /// Stores re-encrypted blobs and reports how many atoms are done.
    async fn maintenance_save_reencryption_batch(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        batch: Vec<ReencryptionBatchEntry>,
    ) -> Result<ReencryptionBatchStats, RealmError>;
}

/// Completion predicate of a reencryption ceremony.
#[async_trait]
pub trait ReencryptionProgress: Send + Sync {
    async fn is_finished(
        &self,
        organization_id: &OrganizationId,
        realm_id: RealmId,
        encryption_revision: u64,
    ) -> Result<bool, RealmError>;
}
