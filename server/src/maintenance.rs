//! Reencryption maintenance: the transition rules shared by the backends and
//! the coordinator that drives the ceremony.

use {
    crate::{
        messaging::Messaging,
        policy::{self, Action},
    },
    realmvault_protocol::{
        DateTimeUtc, DeviceId, Maintenance, MaintenanceType, OrganizationId, RealmError, RealmId,
        RealmStatus, Role, UserId,
        events::{Event, EventSink},
        store::{RealmStore, ReencryptionProgress},
    },
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    },
    tracing::{info, warn},
};

pub fn check_start(
    roles: &HashMap<UserId, Role>,
    author: &DeviceId,
    status: &RealmStatus,
    encryption_revision: u64,
    recipients: &HashSet<UserId>,
) -> Result<(), RealmError> {
    policy::check(Action::Maintenance, roles.get(author.user_id()).copied())?;
    policy::check_not_in_maintenance(status)?;
    if status.encryption_revision.checked_add(1) != Some(encryption_revision) {
        return Err(RealmError::EncryptionRevision);
    }
    let participants: HashSet<&UserId> = roles.keys().collect();
    if participants != recipients.iter().collect() {
        return Err(RealmError::ParticipantsMismatch);
    }
    Ok(())
}

/// Checks shared by `finish` and the reencryption batch operations.
pub fn check_in_reencryption(
    roles: &HashMap<UserId, Role>,
    author: &DeviceId,
    status: &RealmStatus,
    encryption_revision: u64,
) -> Result<(), RealmError> {
    policy::check(Action::Maintenance, roles.get(author.user_id()).copied())?;
    if !status.in_reencryption() {
        return Err(RealmError::NotInMaintenance);
    }
    if encryption_revision != status.encryption_revision {
        return Err(RealmError::EncryptionRevision);
    }
    Ok(())
}

#[must_use]
pub fn reencryption_status(
    author: &DeviceId,
    encryption_revision: u64,
    timestamp: DateTimeUtc,
) -> RealmStatus {
    RealmStatus {
        maintenance: Some(Maintenance {
            kind: MaintenanceType::Reencryption,
            started_by: author.clone(),
            started_on: timestamp,
        }),
        encryption_revision,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartedReencryption {
    /// Recipients whose message could not be delivered; the caller should retry them.
    pub undelivered: Vec<UserId>,
}

pub struct MaintenanceCoordinator {
    realms: Arc<dyn RealmStore>,
    messaging: Arc<dyn Messaging>,
    events: Arc<dyn EventSink>,
    progress: Arc<dyn ReencryptionProgress>,
}

impl MaintenanceCoordinator {
    #[must_use]
    pub fn new(
        realms: Arc<dyn RealmStore>,
        messaging: Arc<dyn Messaging>,
        events: Arc<dyn EventSink>,
        progress: Arc<dyn ReencryptionProgress>,
    ) -> Self {
        Self {
            realms,
            messaging,
            events,
            progress,
        }
    }

    /// Puts the realm in reencryption maintenance and hands every current
    /// member their message.
    ///
    /// `MaintenanceStarted` is published before any message is delivered.
    /// A failed delivery does not undo the transition.
    pub async fn start_reencryption(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
        per_participant_message: HashMap<UserId, Vec<u8>>,
        timestamp: DateTimeUtc,
    ) -> Result<StartedReencryption, RealmError> {
        let recipients: HashSet<UserId> = per_participant_message.keys().cloned().collect();
        self.realms
            .start_reencryption_maintenance(
                organization_id,
                author,
                realm_id,
                encryption_revision,
                &recipients,
                timestamp,
            )
            .await?;
        info!(%organization_id, %realm_id, %author, encryption_revision, "reencryption started");

        self.events.send(
            organization_id,
            Event::MaintenanceStarted {
                realm_id,
                author: author.clone(),
                encryption_revision,
            },
        );

        let mut undelivered = Vec::new();
        for (recipient, body) in per_participant_message {
            if let Err(err) = self
                .messaging
                .send(organization_id, author, &recipient, timestamp, body)
                .await
            {
                warn!(?err, %realm_id, %recipient, "failed to deliver reencryption message");
                undelivered.push(recipient);
            }
        }
        Ok(StartedReencryption { undelivered })
    }

    pub async fn finish_reencryption(
        &self,
        organization_id: &OrganizationId,
        author: &DeviceId,
        realm_id: RealmId,
        encryption_revision: u64,
    ) -> Result<(), RealmError> {
        self.realms
            .finish_reencryption_maintenance(
                organization_id,
                author,
                realm_id,
                encryption_revision,
                &*self.progress,
            )
            .await?;
        info!(%organization_id, %realm_id, %author, encryption_revision, "reencryption finished");

        self.events.send(
            organization_id,
            Event::MaintenanceFinished {
                realm_id,
                author: author.clone(),
                encryption_revision,
            },
        );
        Ok(())
    }
}
