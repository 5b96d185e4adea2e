use {
    anyhow::Result,
    async_trait::async_trait,
    parking_lot::Mutex,
    realmvault_protocol::{DateTimeUtc, DeviceId, OrganizationId, UserId},
    std::collections::HashMap,
    tracing::debug,
};

/// Delivery of opaque messages between users of an organization.
#[async_trait]
pub trait Messaging: Send + Sync {
    async fn send(
        &self,
        organization_id: &OrganizationId,
        sender: &DeviceId,
        recipient: &UserId,
        timestamp: DateTimeUtc,
        body: Vec<u8>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: DeviceId,
    pub timestamp: DateTimeUtc,
    pub body: Vec<u8>,
}

/// Keeps messages in per-recipient inboxes.
#[derive(Debug, Default)]
pub struct MemoryMessaging {
    inboxes: Mutex<HashMap<(OrganizationId, UserId), Vec<Message>>>,
}

impl MemoryMessaging {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn inbox(&self, organization_id: &OrganizationId, user: &UserId) -> Vec<Message> {
        self.inboxes
            .lock()
            .get(&(organization_id.clone(), user.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Messaging for MemoryMessaging {
    async fn send(
        &self,
        organization_id: &OrganizationId,
        sender: &DeviceId,
        recipient: &UserId,
        timestamp: DateTimeUtc,
        body: Vec<u8>,
    ) -> Result<()> {
        debug!(%organization_id, %sender, %recipient, "delivering message");
        self.inboxes
            .lock()
            .entry((organization_id.clone(), recipient.clone()))
            .or_default()
            .push(Message {
                sender: sender.clone(),
                timestamp,
                body,
            });
        Ok(())
    }
}
