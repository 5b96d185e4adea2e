use {
    super::SymmetricKey,
    aes_siv::{Aes256SivAead, KeyInit, Nonce, aead::Aead},
    anyhow::{Context, Result},
    rand::{RngCore, rand_core, rngs::OsRng},
    realmvault_protocol::BlockDigest,
    sha2::{Digest, Sha512},
};

const NONCE_LENGTH: usize = 16;

pub struct Cipher {
    inner: Aes256SivAead,
}

impl Cipher {
    #[must_use]
    #[inline]
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            inner: Aes256SivAead::new(key.get()),
        }
    }

    #[inline]
    pub fn encrypt_bytes(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.inner
            .encrypt(nonce, plaintext)
            .context("encryption failed for bytes")
    }

    #[inline]
    pub fn decrypt_bytes(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.inner
            .decrypt(nonce, ciphertext)
            .context("decryption failed for bytes")
    }

    /// Encrypts with a fresh random nonce and returns `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Nonce::default();
        rand_core::UnwrapErr(OsRng).fill_bytes(&mut nonce);
        let ciphertext = self.encrypt_bytes(&nonce, plaintext)?;

        let mut output = Vec::with_capacity(nonce.len() + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let (nonce, ciphertext) = data
            .split_at_checked(NONCE_LENGTH)
            .context("encrypted data is too short")?;
        let nonce = Nonce::try_from(nonce).context("invalid nonce")?;
        self.decrypt_bytes(&nonce, ciphertext)
    }
}

#[must_use]
pub fn plaintext_digest(plaintext: &[u8]) -> BlockDigest {
    BlockDigest(Sha512::digest(plaintext).to_vec())
}
