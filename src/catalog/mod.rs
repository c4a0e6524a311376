use core::fmt;
use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::blobstore::BlobUid;
use crate::error::Result;

pub mod fjall_impl;
pub mod mem_impl;

pub use fjall_impl::FjallCatalog;
pub use mem_impl::MemCatalog;

/// Unique identifier of a [`Version`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionUid(uuid::Uuid);

impl VersionUid {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for VersionUid {
    fn default() -> Self {
        Self::new()
    }
}

impl From<uuid::Uuid> for VersionUid {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for VersionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl fmt::Debug for VersionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionUid({})", self.0.hyphenated())
    }
}

/// Outcome of the last verification of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Validity {
    Invalid = 0,
    Valid = 1,
    Unknown = 2,
}

/// One backup generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub uid: VersionUid,
    pub name: String,
    pub snapshot_name: String,
    /// Number of blocks.
    pub size: u64,
    pub size_bytes: u64,
    pub valid: Validity,
}

/// One fixed-size chunk of a version and the blob holding its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Position within the version; ids are dense and start at 0.
    pub id: u64,
    pub version_uid: VersionUid,
    pub uid: BlobUid,
    /// Lower-hex BLAKE3 hash of the block contents.
    pub checksum: String,
    pub size: u64,
    pub valid: bool,
}

/// Lower-hex BLAKE3 checksum as stored in [`Block::checksum`].
pub fn checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// The metadata catalog: which blocks make up which versions.
pub trait Catalog: Send + Sync {
    fn set_version(
        &self,
        name: &str,
        snapshot_name: &str,
        size: u64,
        size_bytes: u64,
        valid: Validity,
    ) -> Result<VersionUid>;

    fn get_version(&self, uid: &VersionUid) -> Result<Version>;

    /// All versions, ordered by name.
    fn versions(&self) -> Result<Vec<Version>>;

    /// Fixes the final size and validity once a backup completed.
    fn finalize_version(
        &self,
        uid: &VersionUid,
        size: u64,
        size_bytes: u64,
        valid: Validity,
    ) -> Result<()>;

    fn set_version_valid(&self, uid: &VersionUid, valid: Validity) -> Result<()>;

    fn set_block(
        &self,
        id: u64,
        version_uid: &VersionUid,
        uid: &BlobUid,
        checksum: &str,
        size: u64,
        valid: bool,
    ) -> Result<()>;

    /// Returns a block referencing the blob `uid`.
    fn get_block(&self, uid: &BlobUid) -> Result<Block>;

    /// The blocks of a version, ordered by id.
    fn get_blocks_by_version(&self, version_uid: &VersionUid) -> Result<Vec<Block>>;

    /// Marks every block referencing `uid` as invalid.
    fn set_block_invalid(&self, uid: &BlobUid) -> Result<()>;

    /// Every blob uid referenced by any block.
    fn blob_uids(&self) -> Result<HashSet<BlobUid>>;
}

/// Copies all blocks of `previous` that are not in `changed` into `next`.
///
/// This is how an incremental backup references unchanged data: the new
/// block records point to the very same blobs. Returns the number of copied
/// blocks.
pub fn carry_forward_blocks<C: Catalog + ?Sized>(
    catalog: &C,
    previous: &VersionUid,
    next: &VersionUid,
    changed: &BTreeSet<u64>,
) -> Result<usize> {
    // fail early on an unknown target version
    catalog.get_version(next)?;

    let mut copied = 0;
    for block in catalog.get_blocks_by_version(previous)? {
        if changed.contains(&block.id) {
            continue;
        }
        catalog.set_block(
            block.id,
            next,
            &block.uid,
            &block.checksum,
            block.size,
            block.valid,
        )?;
        copied += 1;
    }
    tracing::debug!(%previous, %next, copied, "carried forward unchanged blocks");
    Ok(copied)
}

/// Shared behavior tests, run against every [`Catalog`] implementation.
#[cfg(test)]
pub(crate) mod testsuite {
    use super::*;
    use crate::error::Error;

    pub fn set_and_get_version(catalog: &impl Catalog) {
        let name = "backup-mysystem1-20150110140015";
        let uid = catalog
            .set_version(name, "snapname", 10, 5000, Validity::Valid)
            .unwrap();

        let version = catalog.get_version(&uid).unwrap();
        assert_eq!(version.name, name);
        assert_eq!(version.snapshot_name, "snapname");
        assert_eq!(version.size, 10);
        assert_eq!(version.size_bytes, 5000);
        assert_eq!(version.uid, uid);
        assert_eq!(version.valid, Validity::Valid);
    }

    pub fn version_not_found(catalog: &impl Catalog) {
        let missing = VersionUid::new();
        let err = catalog.get_version(&missing).unwrap_err();
        assert!(matches!(err, Error::VersionNotFound(uid) if uid == missing));
        assert_eq!(
            format!("{}", catalog.get_version(&missing).unwrap_err()),
            format!("version {missing} not found")
        );
        assert!(catalog
            .set_version_valid(&missing, Validity::Invalid)
            .is_err());
    }

    pub fn version_lifecycle(catalog: &impl Catalog) {
        let b = catalog
            .set_version("b-nightly", "snap-b", 0, 0, Validity::Unknown)
            .unwrap();
        let a = catalog
            .set_version("a-nightly", "snap-a", 0, 0, Validity::Unknown)
            .unwrap();

        catalog
            .finalize_version(&b, 3, 3 * 4096, Validity::Valid)
            .unwrap();
        catalog.set_version_valid(&a, Validity::Invalid).unwrap();

        let versions = catalog.versions().unwrap();
        let names: Vec<_> = versions.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["a-nightly", "b-nightly"]);
        assert_eq!(versions[0].valid, Validity::Invalid);
        assert_eq!(versions[1].size, 3);
        assert_eq!(versions[1].size_bytes, 3 * 4096);
        assert_eq!(versions[1].valid, Validity::Valid);
    }

    pub fn set_and_get_block(catalog: &impl Catalog) {
        let version_uid = catalog
            .set_version("backup", "snapname", 10, 5000, Validity::Valid)
            .unwrap();
        let uid = BlobUid::from("asdfgh");
        catalog
            .set_block(0, &version_uid, &uid, "1234567890", 5000, true)
            .unwrap();

        let block = catalog.get_block(&uid).unwrap();
        assert_eq!(block.checksum, "1234567890");
        assert_eq!(block.uid, uid);
        assert_eq!(block.id, 0);
        assert_eq!(block.size, 5000);
        assert_eq!(block.version_uid, version_uid);
        assert!(block.valid);

        catalog.set_block_invalid(&uid).unwrap();
        assert!(!catalog.get_block(&uid).unwrap().valid);

        let missing = BlobUid::from("missing");
        assert!(matches!(
            catalog.get_block(&missing),
            Err(Error::BlockNotFound(uid)) if uid == missing
        ));
    }

    pub fn blocks_by_version(catalog: &impl Catalog) {
        const TESTLEN: u64 = 10;
        let version_uid = catalog
            .set_version("backup", "snapname", TESTLEN, 5000, Validity::Valid)
            .unwrap();
        let other_uid = catalog
            .set_version("other", "snapname", 1, 5000, Validity::Valid)
            .unwrap();
        catalog
            .set_block(0, &other_uid, &BlobUid::generate(), "x", 5000, true)
            .unwrap();

        let block_uids: Vec<_> = (0..TESTLEN).map(|_| BlobUid::generate()).collect();
        // insert in reverse to make sure ordering comes from the ids
        for id in (0..TESTLEN).rev() {
            catalog
                .set_block(
                    id,
                    &version_uid,
                    &block_uids[id as usize],
                    &format!("checksum-{id}"),
                    5000,
                    true,
                )
                .unwrap();
        }

        let blocks = catalog.get_blocks_by_version(&version_uid).unwrap();
        assert_eq!(blocks.len(), TESTLEN as usize);
        for (id, block) in blocks.iter().enumerate() {
            assert_eq!(block.id, id as u64);
            assert_eq!(block.uid, block_uids[id]);
            assert_eq!(block.checksum, format!("checksum-{id}"));
            assert_eq!(block.version_uid, version_uid);
        }

        let all = catalog.blob_uids().unwrap();
        assert_eq!(all.len(), TESTLEN as usize + 1);
        assert!(block_uids.iter().all(|uid| all.contains(uid)));
    }

    pub fn carry_forward(catalog: &impl Catalog) {
        let previous = catalog
            .set_version("backup-1", "snap-1", 4, 4 * 1024, Validity::Valid)
            .unwrap();
        let uids: Vec<_> = (0..4).map(|_| BlobUid::generate()).collect();
        for (id, uid) in uids.iter().enumerate() {
            catalog
                .set_block(id as u64, &previous, uid, "c", 1024, true)
                .unwrap();
        }

        let next = catalog
            .set_version("backup-2", "snap-2", 4, 4 * 1024, Validity::Unknown)
            .unwrap();
        let changed = BTreeSet::from([1, 3]);
        let copied = carry_forward_blocks(catalog, &previous, &next, &changed).unwrap();
        assert_eq!(copied, 2);

        let fresh = BlobUid::generate();
        catalog.set_block(1, &next, &fresh, "d", 1024, true).unwrap();
        catalog.set_block(3, &next, &fresh, "d", 1024, true).unwrap();

        let blocks = catalog.get_blocks_by_version(&next).unwrap();
        let ids: Vec<_> = blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, [0, 1, 2, 3]);
        assert_eq!(blocks[0].uid, uids[0]);
        assert_eq!(blocks[1].uid, fresh);
        assert_eq!(blocks[2].uid, uids[2]);

        let unknown = VersionUid::new();
        assert!(carry_forward_blocks(catalog, &previous, &unknown, &changed).is_err());
    }
}
