use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod fs_impl;
pub mod mem_impl;

pub use fs_impl::FsBlobStore;
pub use mem_impl::MemBlobStore;

/// Alphabet of the random part of a [`BlobUid`], without look-alike characters.
const TOKEN_ALPHABET: &[u8; 57] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
/// 57^22 > 2^128, so every UUID fits.
const TOKEN_LEN: usize = 22;
/// Number of hex characters of the token hash put in front of the token.
const HASH_PREFIX_LEN: usize = 10;

/// The name of a blob inside a [`BlobStore`].
///
/// Generated uids are a random base-57 token prefixed with a piece of its
/// own hash, so that stores which partition by key prefix spread the load.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobUid(String);

impl BlobUid {
    pub fn generate() -> Self {
        let token = encode_token(uuid::Uuid::new_v4().as_u128());
        let hash = blake3::hash(token.as_bytes());
        let prefix = format!(
            "{:x}",
            base16ct::HexDisplay(&hash.as_bytes()[..HASH_PREFIX_LEN / 2])
        );
        Self(prefix + &token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn encode_token(mut value: u128) -> String {
    let base = TOKEN_ALPHABET.len() as u128;
    let mut digits = [TOKEN_ALPHABET[0]; TOKEN_LEN];
    for digit in digits.iter_mut().rev() {
        *digit = TOKEN_ALPHABET[(value % base) as usize];
        value /= base;
    }
    digits.iter().map(|&b| b as char).collect()
}

impl From<String> for BlobUid {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

impl From<&str> for BlobUid {
    fn from(uid: &str) -> Self {
        Self(uid.to_owned())
    }
}

impl fmt::Display for BlobUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobUid({})", self.0)
    }
}

/// Raw access to a blob container (a bucket, a directory, ...).
///
/// Implementations only move bytes. Queueing, throttling and failure policy
/// live in [`DataBackend`](crate::backend::DataBackend).
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Makes sure the container exists. Creating an existing container is not an error.
    async fn create_container(&self) -> Result<()>;

    async fn store_blob(&self, uid: &BlobUid, blob: Vec<u8>) -> Result<()>;

    /// Returns `Ok(None)` if the store definitively has no such blob.
    async fn fetch_blob(&self, uid: &BlobUid) -> Result<Option<Vec<u8>>>;

    /// Fails with [`Error::BlobNotFound`](crate::Error::BlobNotFound) if the blob does not exist.
    async fn delete_blob(&self, uid: &BlobUid) -> Result<()>;

    async fn list_blobs(&self, prefix: Option<&str>) -> Result<Vec<BlobUid>>;
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn uid_is_hash_prefixed_token() {
        let uid = BlobUid::generate();
        let uid = uid.as_str();
        assert_eq!(uid.len(), HASH_PREFIX_LEN + TOKEN_LEN);

        let (prefix, token) = uid.split_at(HASH_PREFIX_LEN);
        assert!(token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));

        let hash = blake3::hash(token.as_bytes()).to_hex();
        assert_eq!(prefix, &hash.as_str()[..HASH_PREFIX_LEN]);
    }

    #[test]
    fn uids_are_unique() {
        let uids: HashSet<_> = (0..10_000).map(|_| BlobUid::generate()).collect();
        assert_eq!(uids.len(), 10_000);
    }

    #[test]
    fn token_encoding_is_fixed_width() {
        assert_eq!(encode_token(0), "2".repeat(TOKEN_LEN));
        assert_eq!(encode_token(56), format!("{}z", "2".repeat(TOKEN_LEN - 1)));
        assert_eq!(encode_token(57), format!("{}32", "2".repeat(TOKEN_LEN - 2)));
        assert_eq!(encode_token(u128::MAX).len(), TOKEN_LEN);
    }
}
