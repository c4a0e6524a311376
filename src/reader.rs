use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{DataBackend, ReadCompletion};
use crate::blobstore::{BlobStore, BlobUid};
use crate::catalog::{checksum, Block, Catalog, Validity, VersionUid};
use crate::error::{Error, Result};
use crate::mapper::{map_range, BlockRead};

/// How many block lists a [`VersionReader`] keeps around.
const CACHED_VERSIONS: usize = 10;

/// Maximum number of scrub reads in flight.
const SCRUB_WINDOW: usize = 32;

/// Reads byte ranges out of backed up versions.
///
/// Reads go through the pipelined read path of the backend, so nothing else
/// may issue pipelined reads on the same backend while a read is running.
pub struct VersionReader<'a, C: ?Sized, S> {
    catalog: &'a C,
    backend: &'a DataBackend<S>,
    block_size: u64,
    /// Most recently used first.
    block_lists: VecDeque<(VersionUid, Arc<Vec<Block>>)>,
}

impl<'a, C: Catalog + ?Sized, S: BlobStore> VersionReader<'a, C, S> {
    pub fn new(catalog: &'a C, backend: &'a DataBackend<S>, block_size: u64) -> Self {
        Self {
            catalog,
            backend,
            block_size,
            block_lists: VecDeque::with_capacity(CACHED_VERSIONS),
        }
    }

    /// The blocks of a version, ordered by id.
    pub fn blocks(&mut self, version_uid: &VersionUid) -> Result<Arc<Vec<Block>>> {
        if let Some(position) = self
            .block_lists
            .iter()
            .position(|(uid, _)| uid == version_uid)
        {
            if let Some(entry) = self.block_lists.remove(position) {
                let blocks = Arc::clone(&entry.1);
                self.block_lists.push_front(entry);
                return Ok(blocks);
            }
        }

        self.catalog.get_version(version_uid)?;
        let blocks = self.catalog.get_blocks_by_version(version_uid)?;
        for (expected, block) in (0u64..).zip(&blocks) {
            if block.id != expected {
                return Err(Error::BlockGap {
                    version: *version_uid,
                    expected,
                });
            }
        }

        let blocks = Arc::new(blocks);
        self.block_lists
            .push_front((*version_uid, Arc::clone(&blocks)));
        self.block_lists.truncate(CACHED_VERSIONS);
        Ok(blocks)
    }

    /// Reads `length` bytes at `offset`, clipped to the end of the version.
    pub async fn read(
        &mut self,
        version_uid: &VersionUid,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let blocks = self.blocks(version_uid)?;
        let reads = map_range(&blocks, self.block_size, offset, length);

        // where each block lands in the output
        let mut targets = HashMap::with_capacity(reads.len());
        let mut position = 0;
        for read in &reads {
            targets.insert(read.block.id, (read, position));
            position += read.length as usize;
        }
        let mut buffer = vec![0; position];

        let mut first_error = None;
        let mut issued = 0;
        for read in &reads {
            if let Err(err) = self.backend.read(read.block) {
                first_error = Some(err);
                break;
            }
            issued += 1;
        }

        // every issued read is drained, or later reads would get our completions
        for _ in 0..issued {
            let result = self.backend.read_get().await.and_then(|completion| {
                let Some(&(read, position)) = targets.get(&completion.block.id) else {
                    return Err(Error::ReadMismatch {
                        expected: reads[0].block.id,
                        got: completion.block.id,
                    });
                };
                let target = &mut buffer[position..position + read.length as usize];
                copy_block(read, &completion, target)
            });
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(buffer),
        }
    }
}

fn copy_block(
    read: &BlockRead<'_>,
    completion: &ReadCompletion,
    target: &mut [u8],
) -> Result<()> {
    if completion.block.uid != read.block.uid {
        return Err(Error::ReadMismatch {
            expected: read.block.id,
            got: completion.block.id,
        });
    }
    let data = completion
        .data
        .as_ref()
        .ok_or_else(|| Error::BlobNotFound(read.block.uid.clone()))?;

    let start = read.start as usize;
    let end = start + target.len();
    let slice = data.get(start..end).ok_or_else(|| Error::ShortBlock {
        uid: read.block.uid.clone(),
        needed: end,
        actual: data.len(),
    })?;
    target.copy_from_slice(slice);
    Ok(())
}

/// Result of a [`scrub`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrubReport {
    pub checked: u64,
    /// Ids of blocks whose blob is gone.
    pub missing: Vec<u64>,
    /// Ids of blocks whose blob does not match the recorded checksum.
    pub corrupt: Vec<u64>,
}

impl ScrubReport {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

/// Reads every block of a version and verifies it against its checksum.
///
/// Bad blocks are marked invalid in the catalog, and the version is marked
/// [`Validity::Valid`] or [`Validity::Invalid`] depending on the outcome.
/// Like [`VersionReader::read`], this needs the pipelined read path for
/// itself.
pub async fn scrub<C: Catalog + ?Sized, S: BlobStore>(
    catalog: &C,
    backend: &DataBackend<S>,
    version_uid: &VersionUid,
) -> Result<ScrubReport> {
    catalog.get_version(version_uid)?;
    let blocks = catalog.get_blocks_by_version(version_uid)?;

    let mut report = ScrubReport::default();
    let mut bad: Vec<BlobUid> = Vec::new();
    let mut first_error = None;
    let mut in_flight = 0;

    let mut check = |completion: Result<ReadCompletion>| match completion {
        Ok(ReadCompletion { block, data, .. }) => {
            report.checked += 1;
            match data {
                None => {
                    warn!(version = %version_uid, block = block.id, uid = %block.uid, "blob is missing");
                    report.missing.push(block.id);
                    bad.push(block.uid);
                }
                Some(data)
                    if data.len() as u64 != block.size || checksum(&data) != block.checksum =>
                {
                    warn!(version = %version_uid, block = block.id, uid = %block.uid, "checksum mismatch");
                    report.corrupt.push(block.id);
                    bad.push(block.uid);
                }
                Some(_) => {}
            }
        }
        Err(err) => {
            first_error.get_or_insert(err);
        }
    };

    for block in &blocks {
        if in_flight == SCRUB_WINDOW {
            check(backend.read_get().await);
            in_flight -= 1;
        }
        if let Err(err) = backend.read(block) {
            check(Err(err));
            break;
        }
        in_flight += 1;
    }
    for _ in 0..in_flight {
        check(backend.read_get().await);
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    for uid in &bad {
        catalog.set_block_invalid(uid)?;
    }
    let validity = if report.is_valid() {
        Validity::Valid
    } else {
        Validity::Invalid
    };
    catalog.set_version_valid(version_uid, validity)?;

    report.missing.sort_unstable();
    report.corrupt.sort_unstable();
    info!(
        version = %version_uid,
        checked = report.checked,
        missing = report.missing.len(),
        corrupt = report.corrupt.len(),
        "scrub finished"
    );
    debug!(version = %version_uid, ?validity, "updated version validity");
    Ok(report)
}
