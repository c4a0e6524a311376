use crate::catalog::Block;

/// A slice of one block needed to serve a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRead<'a> {
    pub block: &'a Block,
    /// Offset inside the block.
    pub start: u64,
    pub length: u64,
}

/// Maps a read of `length` bytes at `offset` onto the blocks of a version.
///
/// `blocks` must be ordered by id with block `i` covering
/// `[i * block_size, (i + 1) * block_size)`. The returned reads are in
/// ascending block order and cover the requested range without gaps or
/// overlaps, clipped to the data the blocks hold. Only the first read may
/// start inside a block.
pub fn map_range(
    blocks: &[Block],
    block_size: u64,
    offset: u64,
    length: u64,
) -> Vec<BlockRead<'_>> {
    let mut reads = Vec::new();
    if length == 0 || block_size == 0 {
        return reads;
    }

    let mut index = offset / block_size;
    let mut start = offset % block_size;
    let mut remaining = length;

    while remaining > 0 {
        let Some(block) = usize::try_from(index).ok().and_then(|i| blocks.get(i)) else {
            break;
        };
        // the final block of a version may be shorter than `block_size`
        let available = block.size.min(block_size).saturating_sub(start);
        if available == 0 {
            break;
        }
        let read_length = available.min(remaining);
        reads.push(BlockRead {
            block,
            start,
            length: read_length,
        });

        remaining -= read_length;
        index += 1;
        start = 0;
    }

    reads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::BlobUid;
    use crate::catalog::VersionUid;

    fn blocks(count: u64, block_size: u64, last_size: u64) -> Vec<Block> {
        let version_uid = VersionUid::new();
        (0..count)
            .map(|id| Block {
                id,
                version_uid,
                uid: BlobUid::generate(),
                checksum: String::new(),
                size: if id + 1 == count { last_size } else { block_size },
                valid: true,
            })
            .collect()
    }

    fn assert_covers(reads: &[BlockRead<'_>], block_size: u64, offset: u64, length: u64) {
        let mut position = offset;
        for read in reads {
            assert_eq!(read.block.id * block_size + read.start, position);
            assert!(read.length > 0);
            assert!(read.start + read.length <= block_size);
            position += read.length;
        }
        assert_eq!(position, offset + length);
    }

    #[test]
    fn covers_every_range_exactly() {
        const B: u64 = 16;
        let blocks = blocks(5, B, B);
        let total = 5 * B;

        for offset in 0..total {
            for length in 0..=(total - offset) {
                let reads = map_range(&blocks, B, offset, length);
                if length == 0 {
                    assert!(reads.is_empty());
                    continue;
                }
                assert_eq!(reads[0].start, offset % B);
                assert!(reads[1..].iter().all(|read| read.start == 0));
                assert_eq!(reads.iter().map(|r| r.length).sum::<u64>(), length);
                assert_covers(&reads, B, offset, length);
            }
        }
    }

    #[test]
    fn random_reads_within_a_version() {
        const B: u64 = 4096;
        let blocks = blocks(10, B, B);

        for (offset, length) in [(0, 15000), (6500, 15000), (4095, 2), (1, 0), (4097, 12)] {
            let reads = map_range(&blocks, B, offset, length);
            assert_eq!(reads.iter().map(|r| r.length).sum::<u64>(), length);
            if let Some(first) = reads.first() {
                assert_eq!(first.start, offset % B);
            }
        }
    }

    #[test]
    fn range_ending_on_boundary_excludes_next_block() {
        let blocks = blocks(4, 1024, 1024);

        let reads = map_range(&blocks, 1024, 512, 512);
        assert_eq!(reads.len(), 1);
        assert_eq!((reads[0].block.id, reads[0].start, reads[0].length), (0, 512, 512));

        let reads = map_range(&blocks, 1024, 1024, 2048);
        let ids: Vec<_> = reads.iter().map(|r| r.block.id).collect();
        assert_eq!(ids, [1, 2]);
    }

    #[test]
    fn clips_to_version_end() {
        let blocks = blocks(3, 1024, 100);

        // runs into the short final block
        let reads = map_range(&blocks, 1024, 2000, 5000);
        let parts: Vec<_> = reads
            .iter()
            .map(|r| (r.block.id, r.start, r.length))
            .collect();
        assert_eq!(parts, [(1, 976, 48), (2, 0, 100)]);

        // starts beyond the data
        assert!(map_range(&blocks, 1024, 2148, 10).is_empty());
        assert!(map_range(&blocks, 1024, 10 * 1024, 10).is_empty());
        assert!(map_range(&[], 1024, 0, 10).is_empty());
    }
}
