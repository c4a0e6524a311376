use std::sync::Arc;

use thiserror::Error;

use crate::blobstore::BlobUid;
use crate::catalog::VersionUid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The data backend hit an unrecoverable I/O error and stopped all work.
    #[error("data backend failed fatally: {0}")]
    Fatal(Arc<Error>),

    #[error("blob {0} not found")]
    BlobNotFound(BlobUid),

    #[error("read completion for block {got} does not match the request for block {expected}")]
    ReadMismatch { expected: u64, got: u64 },

    #[error("data backend is closed")]
    Closed,

    #[error("version {0} not found")]
    VersionNotFound(VersionUid),

    #[error("no block references blob {0}")]
    BlockNotFound(BlobUid),

    #[error("version {version} has no block {expected} (block ids must be dense)")]
    BlockGap { version: VersionUid, expected: u64 },

    #[error("blob {uid} holds {actual} bytes, {needed} are required")]
    ShortBlock {
        uid: BlobUid,
        needed: usize,
        actual: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] fjall::Error),

    #[error("catalog transaction conflict")]
    CatalogConflict,

    #[error("catalog encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}
