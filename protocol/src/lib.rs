pub mod blockstore;
pub mod encoding;
pub mod error;
pub mod events;
pub mod store;

use {
    anyhow::{bail, ensure},
    chrono::Utc,
    derive_more::{Display, From, Into},
    serde::{Deserialize, Serialize},
    std::{collections::HashMap, fmt, str::FromStr},
    uuid::Uuid,
};

pub use crate::error::{BlockError, RealmError};

pub type DateTimeUtc = chrono::DateTime<Utc>;

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
pub struct OrganizationId(pub String);

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
pub struct UserId(pub String);

impl From<&str> for OrganizationId {
    #[inline]
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&str> for UserId {
    #[inline]
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A device of a user, written as `user@device`.
///
/// Every engine call is made on behalf of a device; authorization is always
/// evaluated against the device's user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    user_id: UserId,
    device_name: String,
}

impl DeviceId {
    #[inline]
    pub fn new(user_id: impl Into<UserId>, device_name: impl Into<String>) -> anyhow::Result<Self> {
        let user_id = user_id.into();
        let device_name = device_name.into();
        ensure!(!user_id.0.is_empty(), "user id cannot be empty");
        ensure!(!device_name.is_empty(), "device name cannot be empty");
        ensure!(!user_id.0.contains('@'), "user id cannot contain '@'");
        ensure!(!device_name.contains('@'), "device name cannot contain '@'");
        Ok(Self {
            user_id,
            device_name,
        })
    }

    #[must_use]
    #[inline]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    #[inline]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.device_name)
    }
}

impl FromStr for DeviceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((user_id, device_name)) = s.split_once('@') else {
            bail!("invalid device id `{s}`: expected `user@device`");
        };
        Self::new(user_id, device_name)
    }
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
            From,
            Into,
            Display,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            #[inline]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }
    };
}

uuid_id!(RealmId);
uuid_id!(VlobId);
uuid_id!(BlockId);

/// Permission level of a user inside a realm.
///
/// Variants are declared from the weakest to the strongest so that the derived
/// ordering follows `OWNER > MANAGER > CONTRIBUTOR > READER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Reader,
    Contributor,
    Manager,
    Owner,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Reader, Role::Contributor, Role::Manager, Role::Owner];

    #[must_use]
    #[inline]
    pub fn can_write(self) -> bool {
        self >= Self::Contributor
    }

    #[must_use]
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reader => "READER",
            Self::Contributor => "CONTRIBUTOR",
            Self::Manager => "MANAGER",
            Self::Owner => "OWNER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READER" => Ok(Self::Reader),
            "CONTRIBUTOR" => Ok(Self::Contributor),
            "MANAGER" => Ok(Self::Manager),
            "OWNER" => Ok(Self::Owner),
            _ => bail!("invalid value for Role: {s}"),
        }
    }
}

/// A single entry of a realm's role history.
///
/// `role: None` revokes any access the user had.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmGrantedRole {
    pub certificate: Vec<u8>,
    pub realm_id: RealmId,
    pub user_id: UserId,
    pub role: Option<Role>,
    pub granted_by: DeviceId,
    pub granted_on: DateTimeUtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaintenanceType {
    Reencryption,
}

impl MaintenanceType {
    #[must_use]
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reencryption => "REENCRYPTION",
        }
    }
}

impl FromStr for MaintenanceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REENCRYPTION" => Ok(Self::Reencryption),
            _ => bail!("invalid value for MaintenanceType: {s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintenance {
    pub kind: MaintenanceType,
    pub started_by: DeviceId,
    pub started_on: DateTimeUtc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmStatus {
    /// `None` while the realm is in normal operation.
    pub maintenance: Option<Maintenance>,
    /// Revision of the key material currently protecting the realm's vlobs.
    /// While a reencryption is running, this is the revision being rolled out.
    pub encryption_revision: u64,
}

impl RealmStatus {
    pub const INITIAL_ENCRYPTION_REVISION: u64 = 1;

    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self {
            maintenance: None,
            encryption_revision: Self::INITIAL_ENCRYPTION_REVISION,
        }
    }

    #[must_use]
    #[inline]
    pub fn in_maintenance(&self) -> bool {
        self.maintenance.is_some()
    }

    #[must_use]
    #[inline]
    pub fn in_reencryption(&self) -> bool {
        self.maintenance
            .as_ref()
            .is_some_and(|m| m.kind == MaintenanceType::Reencryption)
    }
}

impl Default for RealmStatus {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// The author's role and the realm's status, read together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmAccess {
    /// `None` if the author is not a member.
    pub role: Option<Role>,
    pub status: RealmStatus,
}

/// One version of a vlob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlobAtom {
    pub version: u32,
    pub blob: Vec<u8>,
    pub author: DeviceId,
    pub created_on: DateTimeUtc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlobVersion {
    pub version: u32,
    pub author: DeviceId,
    pub created_on: DateTimeUtc,
}

/// Result of polling a realm for vlob changes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RealmChanges {
    pub checkpoint: u64,
    /// Latest version of every vlob written after the requested checkpoint.
    pub changes: HashMap<VlobId, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptionBatchEntry {
    pub vlob_id: VlobId,
    pub version: u32,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReencryptionBatchStats {
    pub total: u64,
    pub done: u64,
}

/// SHA-512 digest of a block's plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct BlockDigest(pub Vec<u8>);

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}
