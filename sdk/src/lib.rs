//! Client side of realmvault: files split into individually encrypted blocks,
//! described by an encrypted manifest stored as a vlob.

pub mod chunker;
pub mod crypto;
pub mod file;
pub mod manifest;
pub mod range;

pub use crate::{
    chunker::BlockChunker,
    file::{BlockRetention, FileBlob, FileContext, FileError, FileStat},
    manifest::FileBlobManifest,
};
