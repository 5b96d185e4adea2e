use {
    aes_siv::{Aes256SivAead, Key},
    anyhow::{Result, format_err},
    rand::{TryRngCore, rngs::OsRng},
    serde::{Deserialize, Deserializer, Serialize, Serializer, de},
    std::fmt::{self, Debug},
};

/// Secret protecting one chunk group, or the manifests of a realm.
///
/// Chunk group keys travel inside the encrypted manifest, so they are
/// serialized as raw bytes. `Debug` never shows the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey(Key<Aes256SivAead>);

impl SymmetricKey {
    pub const LENGTH: usize = 64;

    /// Draws a fresh key from the operating system's RNG.
    pub fn generate() -> Result<Self> {
        let mut key = Key::<Aes256SivAead>::default();
        OsRng.try_fill_bytes(&mut key)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = Key::<Aes256SivAead>::try_from(bytes).map_err(|_| {
            format_err!(
                "invalid key length; got {}, expected {}",
                bytes.len(),
                Self::LENGTH
            )
        })?;
        Ok(Self(key))
    }

    #[must_use]
    #[inline]
    pub(crate) fn get(&self) -> &Key<Aes256SivAead> {
        &self.0
    }
}

impl Serialize for SymmetricKey {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.as_slice().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

impl Debug for SymmetricKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey").finish_non_exhaustive()
    }
}
