use std::collections::HashSet;
use std::path::Path;

use fjall::{TransactionalKeyspace, TransactionalPartitionHandle};

use super::*;
use crate::error::Error;

/// Separates the blob uid from the block key in the blob index.
const INDEX_SEPARATOR: u8 = 0;

/// A persistent [`Catalog`] on top of a transactional fjall keyspace.
///
/// Block keys are `version uid ‖ big-endian id`, so a prefix scan over a
/// version yields its blocks ordered by id. A secondary index maps
/// `blob uid ‖ 0 ‖ block key` to nothing, to find blocks by their blob.
pub struct FjallCatalog {
    database: TransactionalKeyspace,
    versions: TransactionalPartitionHandle,
    blocks: TransactionalPartitionHandle,
    blob_index: TransactionalPartitionHandle,
}

type BlockKey = [u8; 24];

fn block_key(version_uid: &VersionUid, id: u64) -> BlockKey {
    let mut key = [0; 24];
    key[..16].copy_from_slice(version_uid.as_bytes());
    key[16..].copy_from_slice(&id.to_be_bytes());
    key
}

fn index_prefix(uid: &BlobUid) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(uid.as_str().len() + 1);
    prefix.extend_from_slice(uid.as_str().as_bytes());
    prefix.push(INDEX_SEPARATOR);
    prefix
}

fn index_key(uid: &BlobUid, block_key: &[u8]) -> Vec<u8> {
    let mut key = index_prefix(uid);
    key.extend_from_slice(block_key);
    key
}

impl FjallCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let database = fjall::Config::new(path).open_transactional()?;
        let versions = database.open_partition("versions", Default::default())?;
        let blocks = database.open_partition("blocks", Default::default())?;
        let blob_index = database.open_partition("blob_index", Default::default())?;

        Ok(Self {
            database,
            versions,
            blocks,
            blob_index,
        })
    }

    fn update_version(
        &self,
        uid: &VersionUid,
        update: impl FnOnce(&mut Version),
    ) -> Result<()> {
        let mut write_tx = self.database.write_tx()?;
        let version = write_tx
            .get(&self.versions, uid.as_bytes())?
            .ok_or(Error::VersionNotFound(*uid))?;
        let mut version: Version = postcard::from_bytes(&version)?;

        update(&mut version);

        let version = postcard::to_stdvec(&version)?;
        write_tx.insert(&self.versions, &uid.as_bytes()[..], version);
        write_tx.commit()?.map_err(|_| Error::CatalogConflict)
    }
}

impl Catalog for FjallCatalog {
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
        let version = postcard::to_stdvec(&version)?;

        let mut write_tx = self.database.write_tx()?;
        write_tx.insert(&self.versions, &uid.as_bytes()[..], version);
        write_tx.commit()?.map_err(|_| Error::CatalogConflict)?;

        Ok(uid)
    }

    fn get_version(&self, uid: &VersionUid) -> Result<Version> {
        let read_tx = self.database.read_tx();
        let version = read_tx
            .get(&self.versions, uid.as_bytes())?
            .ok_or(Error::VersionNotFound(*uid))?;
        Ok(postcard::from_bytes(&version)?)
    }

    fn versions(&self) -> Result<Vec<Version>> {
        let read_tx = self.database.read_tx();
        let mut versions = read_tx
            .iter(&self.versions)
            .map(|kv| -> Result<Version> {
                let (_, version) = kv?;
                Ok(postcard::from_bytes(&version)?)
            })
            .collect::<Result<Vec<_>>>()?;
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
        self.update_version(uid, |version| {
            version.size = size;
            version.size_bytes = size_bytes;
            version.valid = valid;
        })
    }

    fn set_version_valid(&self, uid: &VersionUid, valid: Validity) -> Result<()> {
        self.update_version(uid, |version| version.valid = valid)
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
        let key = block_key(version_uid, id);
        let block = Block {
            id,
            version_uid: *version_uid,
            uid: uid.clone(),
            checksum: checksum.into(),
            size,
            valid,
        };
        let block = postcard::to_stdvec(&block)?;

        let mut write_tx = self.database.write_tx()?;
        if let Some(previous) = write_tx.get(&self.blocks, key)? {
            let previous: Block = postcard::from_bytes(&previous)?;
            write_tx.remove(&self.blob_index, index_key(&previous.uid, &key));
        }
        write_tx.insert(&self.blocks, &key[..], block);
        write_tx.insert(&self.blob_index, index_key(uid, &key), Vec::<u8>::new());
        write_tx.commit()?.map_err(|_| Error::CatalogConflict)
    }

    fn get_block(&self, uid: &BlobUid) -> Result<Block> {
        let prefix = index_prefix(uid);
        let read_tx = self.database.read_tx();

        let Some(entry) = read_tx.prefix(&self.blob_index, &prefix).next() else {
            return Err(Error::BlockNotFound(uid.clone()));
        };
        let (index_key, _) = entry?;
        let block = read_tx
            .get(&self.blocks, &index_key[prefix.len()..])?
            .ok_or_else(|| Error::BlockNotFound(uid.clone()))?;
        Ok(postcard::from_bytes(&block)?)
    }

    fn get_blocks_by_version(&self, version_uid: &VersionUid) -> Result<Vec<Block>> {
        let read_tx = self.database.read_tx();
        read_tx
            .prefix(&self.blocks, version_uid.as_bytes())
            .map(|kv| -> Result<Block> {
                let (_, block) = kv?;
                Ok(postcard::from_bytes(&block)?)
            })
            .collect()
    }

    fn set_block_invalid(&self, uid: &BlobUid) -> Result<()> {
        let prefix = index_prefix(uid);
        let mut write_tx = self.database.write_tx()?;

        let block_keys = write_tx
            .prefix(&self.blob_index, &prefix)
            .map(|kv| -> Result<Vec<u8>> {
                let (index_key, _) = kv?;
                Ok(index_key[prefix.len()..].to_vec())
            })
            .collect::<Result<Vec<_>>>()?;
        if block_keys.is_empty() {
            return Err(Error::BlockNotFound(uid.clone()));
        }

        for key in block_keys {
            let Some(block) = write_tx.get(&self.blocks, &key)? else {
                continue;
            };
            let mut block: Block = postcard::from_bytes(&block)?;
            block.valid = false;
            write_tx.insert(&self.blocks, key, postcard::to_stdvec(&block)?);
        }
        write_tx.commit()?.map_err(|_| Error::CatalogConflict)
    }

    fn blob_uids(&self) -> Result<HashSet<BlobUid>> {
        let read_tx = self.database.read_tx();
        read_tx
            .iter(&self.blob_index)
            .map(|kv| -> Result<BlobUid> {
                let (index_key, _) = kv?;
                let end = index_key
                    .iter()
                    .position(|&b| b == INDEX_SEPARATOR)
                    .unwrap_or(index_key.len());
                Ok(BlobUid::from(
                    String::from_utf8_lossy(&index_key[..end]).into_owned(),
                ))
            })
            .collect()
    }
}
