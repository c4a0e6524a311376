use tracing::{debug, info};

use crate::backend::DataBackend;
use crate::blobstore::{BlobStore, BlobUid};
use crate::catalog::Catalog;
use crate::error::Result;

/// Blobs in the store that no block references, sorted by uid.
///
/// Blobs that were saved but whose block records are not written yet look
/// exactly like orphans, so writes have to be flushed and recorded first.
pub async fn orphaned_blobs<C: Catalog + ?Sized, S: BlobStore>(
    catalog: &C,
    backend: &DataBackend<S>,
    prefix: Option<&str>,
) -> Result<Vec<BlobUid>> {
    let referenced = catalog.blob_uids()?;
    let mut orphans: Vec<_> = backend
        .get_all_blob_uids(prefix)
        .await?
        .into_iter()
        .filter(|uid| !referenced.contains(uid))
        .collect();
    orphans.sort_unstable();

    debug!(
        referenced = referenced.len(),
        orphans = orphans.len(),
        prefix = prefix.unwrap_or_default(),
        "looked for orphaned blobs"
    );
    Ok(orphans)
}

/// Deletes all orphaned blobs and returns the ones that could not be deleted.
pub async fn remove_orphans<C: Catalog + ?Sized, S: BlobStore>(
    catalog: &C,
    backend: &DataBackend<S>,
    prefix: Option<&str>,
) -> Result<Vec<BlobUid>> {
    let orphans = orphaned_blobs(catalog, backend, prefix).await?;
    let found = orphans.len();
    let failed = backend.rm_many(orphans).await;

    info!(
        removed = found - failed.len(),
        failed = failed.len(),
        "removed orphaned blobs"
    );
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::MemBlobStore;
    use crate::catalog::{checksum, MemCatalog, Validity};
    use crate::config::BackendConfig;

    #[tokio::test]
    async fn removes_unreferenced_blobs_only() {
        let catalog = MemCatalog::new();
        let backend = DataBackend::new(MemBlobStore::new(), &BackendConfig::default())
            .await
            .unwrap();

        let version = catalog
            .set_version("backup", "snap", 2, 8, Validity::Valid)
            .unwrap();
        let mut kept = Vec::new();
        for id in 0..2 {
            let data = vec![id as u8; 4];
            let uid = backend.save_sync(data.clone()).await.unwrap();
            catalog
                .set_block(id, &version, &uid, &checksum(&data), 4, true)
                .unwrap();
            kept.push(uid);
        }
        let mut orphans = Vec::new();
        for i in 0..3u8 {
            orphans.push(backend.save_sync(vec![0xa0 + i; 4]).await.unwrap());
        }
        orphans.sort_unstable();

        assert_eq!(orphaned_blobs(&catalog, &backend, None).await.unwrap(), orphans);

        let first = orphans[0].as_str();
        let by_prefix = orphaned_blobs(&catalog, &backend, Some(first)).await.unwrap();
        assert_eq!(by_prefix, [orphans[0].clone()]);

        assert!(remove_orphans(&catalog, &backend, None).await.unwrap().is_empty());
        let mut remaining = backend.get_all_blob_uids(None).await.unwrap();
        remaining.sort_unstable();
        kept.sort_unstable();
        assert_eq!(remaining, kept);
        assert!(orphaned_blobs(&catalog, &backend, None).await.unwrap().is_empty());

        backend.close().await;
    }
}
