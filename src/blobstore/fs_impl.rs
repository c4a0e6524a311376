use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::*;
use crate::config::BackendConfig;
use crate::error::Error;

const DEFAULT_DEPTH: usize = 2;
const DEFAULT_SPLIT: usize = 2;

/// A [`BlobStore`] on the local filesystem.
///
/// Blobs are spread over a directory tree built from the leading characters
/// of their uid, e.g. `c2/ca/c2cac25a7afd11e5b45aa44e314f9270` with the
/// default depth and split of 2.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    depth: usize,
    split: usize,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            depth: DEFAULT_DEPTH,
            split: DEFAULT_SPLIT,
        }
    }

    /// Roots the store at `<path>/<bucket_name>`.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let path = config.path.as_ref().ok_or_else(|| {
            Error::Config("the local blob store requires a `path`".into())
        })?;
        Ok(Self::new(path.join(&config.bucket_name)))
    }

    pub fn with_layout(mut self, depth: usize, split: usize) -> Self {
        self.depth = depth;
        self.split = split;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_dir(&self, uid: &str) -> PathBuf {
        let mut dir = PathBuf::new();
        let mut rest = uid;
        for _ in 0..self.depth {
            let Some(part) = rest.get(..self.split) else {
                break;
            };
            dir.push(part);
            rest = &rest[self.split..];
        }
        dir
    }

    fn blob_path(&self, uid: &BlobUid) -> Result<PathBuf> {
        let uid = uid.as_str();
        if uid.is_empty() || uid.starts_with('.') || uid.contains(['/', '\\']) {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("unsafe blob uid '{uid}'"),
            )));
        }
        Ok(self.root.join(self.relative_dir(uid)).join(uid))
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn create_container(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn store_blob(&self, uid: &BlobUid, blob: Vec<u8>) -> Result<()> {
        let path = self.blob_path(uid)?;
        let dir = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(dir).await?;

        // readers must never observe a partially written blob
        let tmp = dir.join(format!(".{uid}.{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, blob).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn fetch_blob(&self, uid: &BlobUid) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(uid)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_blob(&self, uid: &BlobUid) -> Result<()> {
        let path = self.blob_path(uid)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::BlobNotFound(uid.clone())),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_blobs(&self, prefix: Option<&str>) -> Result<Vec<BlobUid>> {
        let prefix = prefix.unwrap_or_default();
        let mut uids = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if !name.starts_with('.') && name.starts_with(prefix) {
                    uids.push(BlobUid::from(name));
                }
            }
        }

        uids.sort_unstable();
        Ok(uids)
    }
}
