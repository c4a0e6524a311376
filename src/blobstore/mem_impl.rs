use core::fmt;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use super::*;
use crate::error::Error;

/// A [`BlobStore`] keeping everything in memory.
#[derive(Default)]
pub struct MemBlobStore {
    blobs: RwLock<BTreeMap<BlobUid, Vec<u8>>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MemBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        let bytes: usize = blobs.values().map(Vec::len).sum();
        write!(f, "MemBlobStore({} blobs, {bytes} bytes)", blobs.len())
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBlobStore {
    async fn create_container(&self) -> Result<()> {
        Ok(())
    }

    async fn store_blob(&self, uid: &BlobUid, blob: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.insert(uid.clone(), blob);
        Ok(())
    }

    async fn fetch_blob(&self, uid: &BlobUid) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(uid).cloned())
    }

    async fn delete_blob(&self, uid: &BlobUid) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        match blobs.remove(uid) {
            Some(_) => Ok(()),
            None => Err(Error::BlobNotFound(uid.clone())),
        }
    }

    async fn list_blobs(&self, prefix: Option<&str>) -> Result<Vec<BlobUid>> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        let prefix = prefix.unwrap_or_default();
        Ok(blobs
            .keys()
            .filter(|uid| uid.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }
}
