use {
    crate::{DeviceId, OrganizationId, RealmId, Role, UserId, VlobId},
    serde::{Deserialize, Serialize},
    tokio::sync::broadcast,
    tracing::trace,
};

/// Notifications published by the engine after a mutation has been committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RolesUpdated {
        realm_id: RealmId,
        author: DeviceId,
        user: UserId,
        role: Option<Role>,
    },
    MaintenanceStarted {
        realm_id: RealmId,
        author: DeviceId,
        encryption_revision: u64,
    },
    MaintenanceFinished {
        realm_id: RealmId,
        author: DeviceId,
        encryption_revision: u64,
    },
    VlobsUpdated {
        realm_id: RealmId,
        author: DeviceId,
        checkpoint: u64,
        vlob_id: VlobId,
        version: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationEvent {
    pub organization_id: OrganizationId,
    pub event: Event,
}

/// Fire-and-forget outbound event channel.
pub trait EventSink: Send + Sync {
    fn send(&self, organization_id: &OrganizationId, event: Event);
}

/// Event bus backed by a broadcast channel.
///
/// Subscribers that fall behind lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrganizationEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    #[inline]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    #[must_use]
    #[inline]
    pub fn subscribe(&self) -> broadcast::Receiver<OrganizationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    #[inline]
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventSink for EventBus {
    fn send(&self, organization_id: &OrganizationId, event: Event) {
        trace!(%organization_id, ?event, "publishing event");
        // No subscribers is not an error.
        let _ = self.sender.send(OrganizationEvent {
            organization_id: organization_id.clone(),
            event,
        });
    }
}
