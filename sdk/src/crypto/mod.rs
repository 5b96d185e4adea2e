//! All encryption operations use AES-SIV.
//!
//! Every block of file content is encrypted with a random nonce. The nonce is
//! stored in front of the ciphertext:
//!
//! - nonce (128 bits) - the random nonce used to encrypt this block
//! - encrypted content, including the SIV tag
//!
//! A chunk group shares one key, so the nonce is what keeps two blocks with
//! equal plaintext from producing equal ciphertext. File manifests are
//! encrypted the same way with the key of the file.
//!
//! Integrity of a block is checked twice on read: AES-SIV authenticates the
//! ciphertext, and the SHA-512 digest of the plaintext must match the one
//! recorded in the manifest.

mod cipher;
mod key;

pub use self::{
    cipher::{Cipher, plaintext_digest},
    key::SymmetricKey,
};
