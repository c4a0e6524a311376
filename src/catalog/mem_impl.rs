use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::*;
use crate::error::Error;

#[derive(Debug, Default)]
struct Tables {
    versions: HashMap<VersionUid, Version>,
    blocks: BTreeMap<(VersionUid, u64), Block>,
}

/// A [`Catalog`] that lives and dies with the process.
#[derive(Debug, Default)]
pub struct MemCatalog {
    tables: RwLock<Tables>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalog for MemCatalog {
    fn set_version(
        &self,
        name: &str,
        snapshot_name: &str,
        size: u64,
        size_bytes: u64,
        valid: Validity,
    ) -> Result<VersionUid> {
        let uid = VersionUid::new();
        let version = Version {
            uid,
            name: name.into(),
            snapshot_name: snapshot_name.into(),
            size,
            size_bytes,
            valid,
        };
        self.write().versions.insert(uid, version);
        Ok(uid)
    }

    fn get_version(&self, uid: &VersionUid) -> Result<Version> {
        self.read()
            .versions
            .get(uid)
            .cloned()
            .ok_or(Error::VersionNotFound(*uid))
    }

    fn versions(&self) -> Result<Vec<Version>> {
        let mut versions: Vec<_> = self.read().versions.values().cloned().collect();
        versions.sort_by(|a, b| a.name.cmp(&b.name).then(a.uid.cmp(&b.uid)));
        Ok(versions)
    }

    fn finalize_version(
        &self,
        uid: &VersionUid,
        size: u64,
        size_bytes: u64,
        valid: Validity,
    ) -> Result<()> {
        let mut tables = self.write();
        let version = tables
            .versions
            .get_mut(uid)
            .ok_or(Error::VersionNotFound(*uid))?;
        version.size = size;
        version.size_bytes = size_bytes;
        version.valid = valid;
        Ok(())
    }

    fn set_version_valid(&self, uid: &VersionUid, valid: Validity) -> Result<()> {
        let mut tables = self.write();
        let version = tables
            .versions
            .get_mut(uid)
            .ok_or(Error::VersionNotFound(*uid))?;
        version.valid = valid;
        Ok(())
    }

    fn set_block(
        &self,
        id: u64,
        version_uid: &VersionUid,
        uid: &BlobUid,
        checksum: &str,
        size: u64,
        valid: bool,
    ) -> Result<()> {
        let block = Block {
            id,
            version_uid: *version_uid,
            uid: uid.clone(),
            checksum: checksum.into(),
            size,
            valid,
        };
        self.write().blocks.insert((*version_uid, id), block);
        Ok(())
    }

    fn get_block(&self, uid: &BlobUid) -> Result<Block> {
        self.read()
            .blocks
            .values()
            .find(|block| &block.uid == uid)
            .cloned()
            .ok_or_else(|| Error::BlockNotFound(uid.clone()))
    }

    fn get_blocks_by_version(&self, version_uid: &VersionUid) -> Result<Vec<Block>> {
        let tables = self.read();
        let range = (*version_uid, 0)..=(*version_uid, u64::MAX);
        Ok(tables.blocks.range(range).map(|(_, b)| b.clone()).collect())
    }

    fn set_block_invalid(&self, uid: &BlobUid) -> Result<()> {
        let mut tables = self.write();
        let mut found = false;
        for block in tables.blocks.values_mut().filter(|b| &b.uid == uid) {
            block.valid = false;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(Error::BlockNotFound(uid.clone()))
        }
    }

    fn blob_uids(&self) -> Result<HashSet<BlobUid>> {
        Ok(self
            .read()
            .blocks
            .values()
            .map(|block| block.uid.clone())
            .collect())
    }
}
