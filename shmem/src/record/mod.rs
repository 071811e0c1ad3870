//! Layout of the block template record inside the shared segment.
//!
//! ```text
//! record base (handed out by the lock guard)
//! ├─ RecordFields        256 bytes, fixed
//! ├─ hashing blob        hashing_blob_capacity bytes (rounded up to 8)
//! └─ block blob          block_blob_capacity bytes (rounded up to 8)
//! ```
//!
//! Nothing in here locks. A [`RecordView`] is only ever created by the
//! segment while the cross-process lock is held.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::slice;

use crate::core::{HEADER_SIZE, LOCK_REGION_SIZE};
use crate::errors::{Result, ShmemLibError};

mod digest;

pub use digest::{HexDigest, HEX_DIGEST_LEN};

/// Where the record starts, relative to the start of the mapping.
pub(crate) const RECORD_OFFSET: usize = HEADER_SIZE + LOCK_REGION_SIZE;

const FIELDS_SIZE: usize = mem::size_of::<RecordFields>();

const _: () = assert!(FIELDS_SIZE == 256);
const _: () = assert!(RECORD_OFFSET % 8 == 0);

/// A block template as produced by the fetcher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockTemplate {
    pub height: u64,
    pub difficulty: u64,
    pub seed_hash: HexDigest,
    pub next_seed_hash: HexDigest,
    pub prev_hash: HexDigest,
    /// Bytes fed to the proof-of-work function.
    pub hashing_blob: Vec<u8>,
    /// Full block serialization, needed once a share meets network difficulty.
    pub block_blob: Option<Vec<u8>>,
    /// Offset of the nonce/extra-nonce bytes patched into the blob.
    pub reserved_offset: u32,
    pub tx_count: u64,
    /// Creation time, unix seconds.
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobKind {
    Hashing,
    Block,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobKind::Hashing => f.write_str("hashing"),
            BlobKind::Block => f.write_str("block"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct RecordFields {
    template_version: u64,
    height: u64,
    difficulty: u64,
    tx_count: u64,
    timestamp: u64,
    hashing_blob_size: u64,
    block_blob_size: u64,
    reserved_offset: u32,
    has_block_blob: u32,
    seed_hash: HexDigest,
    next_seed_hash: HexDigest,
    prev_hash: HexDigest,
}

#[inline]
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Sizes and offsets derived from the configured blob capacities.
///
/// Every process attached to a segment must compute the same layout; the
/// segment header records the capacities so a mismatch is caught at attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordLayout {
    hashing_blob_capacity: usize,
    block_blob_capacity: usize,
}

impl RecordLayout {
    pub const fn new(hashing_blob_capacity: usize, block_blob_capacity: usize) -> RecordLayout {
        RecordLayout {
            hashing_blob_capacity,
            block_blob_capacity,
        }
    }

    pub fn hashing_blob_capacity(&self) -> usize {
        self.hashing_blob_capacity
    }

    pub fn block_blob_capacity(&self) -> usize {
        self.block_blob_capacity
    }

    fn hashing_blob_offset(&self) -> usize {
        FIELDS_SIZE
    }

    fn block_blob_offset(&self) -> usize {
        self.hashing_blob_offset() + align8(self.hashing_blob_capacity)
    }

    pub fn record_size(&self) -> usize {
        self.block_blob_offset() + align8(self.block_blob_capacity)
    }

    /// Bytes needed for the whole mapping: header, lock and record.
    pub fn segment_size(&self) -> usize {
        RECORD_OFFSET + self.record_size()
    }

    pub fn validate(&self, template: &BlockTemplate) -> Result<()> {
        check_capacity(
            BlobKind::Hashing,
            template.hashing_blob.len(),
            self.hashing_blob_capacity,
        )?;
        if let Some(block) = &template.block_blob {
            check_capacity(BlobKind::Block, block.len(), self.block_blob_capacity)?;
        }
        Ok(())
    }
}

fn check_capacity(blob: BlobKind, size: usize, capacity: usize) -> Result<()> {
    if size > capacity {
        return Err(ShmemLibError::BlobTooLarge {
            blob,
            size,
            capacity,
        });
    }
    Ok(())
}

fn stored_len(blob: BlobKind, size: u64, capacity: usize) -> Result<usize> {
    match usize::try_from(size) {
        Ok(len) if len <= capacity => Ok(len),
        _ => Err(ShmemLibError::CorruptRecord(format!(
            "{} blob size {} exceeds capacity {}",
            blob, size, capacity
        ))),
    }
}

/// Field-level access to the record. Not thread-safe on its own.
pub struct RecordView<'a> {
    base: *mut u8,
    layout: RecordLayout,
    _guard: PhantomData<&'a mut [u8]>,
}

impl<'a> RecordView<'a> {
    /// # Safety
    ///
    /// `base` must point at `layout.record_size()` mapped, 8-byte aligned bytes
    /// and the caller must hold the segment lock for all of `'a`.
    pub(crate) unsafe fn new(base: *mut u8, layout: RecordLayout) -> RecordView<'a> {
        RecordView {
            base,
            layout,
            _guard: PhantomData,
        }
    }

    #[inline]
    fn fields(&self) -> RecordFields {
        unsafe { ptr::read(self.base as *const RecordFields) }
    }

    #[inline]
    fn blob(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.add(offset), len) }
    }

    pub fn version(&self) -> u64 {
        unsafe { ptr::addr_of!((*(self.base as *const RecordFields)).template_version).read() }
    }

    pub fn read_template(&self) -> Result<BlockTemplate> {
        let mut template = BlockTemplate::default();
        self.read_template_into(&mut template)?;
        Ok(template)
    }

    /// Copies the record into `out`, reusing its blob allocations.
    pub fn read_template_into(&self, out: &mut BlockTemplate) -> Result<()> {
        let fields = self.fields();
        let hashing_len = stored_len(
            BlobKind::Hashing,
            fields.hashing_blob_size,
            self.layout.hashing_blob_capacity,
        )?;
        let block_len = stored_len(
            BlobKind::Block,
            fields.block_blob_size,
            self.layout.block_blob_capacity,
        )?;

        out.hashing_blob.clear();
        out.hashing_blob
            .extend_from_slice(self.blob(self.layout.hashing_blob_offset(), hashing_len));
        if fields.has_block_blob != 0 {
            let block = out.block_blob.get_or_insert_with(Vec::new);
            block.clear();
            block.extend_from_slice(self.blob(self.layout.block_blob_offset(), block_len));
        } else {
            out.block_blob = None;
        }

        out.height = fields.height;
        out.difficulty = fields.difficulty;
        out.seed_hash = fields.seed_hash;
        out.next_seed_hash = fields.next_seed_hash;
        out.prev_hash = fields.prev_hash;
        out.reserved_offset = fields.reserved_offset;
        out.tx_count = fields.tx_count;
        out.timestamp = fields.timestamp;
        Ok(())
    }

    /// Replaces every field with `template`. The version is left alone.
    ///
    /// Fails with `BlobTooLarge` before touching anything.
    pub(crate) fn write_template(&mut self, template: &BlockTemplate) -> Result<()> {
        self.layout.validate(template)?;
        let previous = self.fields();
        let block: &[u8] = template.block_blob.as_deref().unwrap_or(&[]);

        unsafe {
            self.write_blob(
                self.layout.hashing_blob_offset(),
                &template.hashing_blob,
                previous.hashing_blob_size as usize,
                self.layout.hashing_blob_capacity,
            );
            self.write_blob(
                self.layout.block_blob_offset(),
                block,
                previous.block_blob_size as usize,
                self.layout.block_blob_capacity,
            );
            ptr::write(
                self.base as *mut RecordFields,
                RecordFields {
                    template_version: previous.template_version,
                    height: template.height,
                    difficulty: template.difficulty,
                    tx_count: template.tx_count,
                    timestamp: template.timestamp,
                    hashing_blob_size: template.hashing_blob.len() as u64,
                    block_blob_size: block.len() as u64,
                    reserved_offset: template.reserved_offset,
                    has_block_blob: template.block_blob.is_some() as u32,
                    seed_hash: template.seed_hash,
                    next_seed_hash: template.next_seed_hash,
                    prev_hash: template.prev_hash,
                },
            );
        }
        Ok(())
    }

    /// Copies `data` in and zeroes whatever the previous, longer blob left
    /// behind.
    unsafe fn write_blob(&mut self, offset: usize, data: &[u8], previous_len: usize, capacity: usize) {
        let dest = self.base.add(offset);
        ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        let stale = previous_len.min(capacity);
        if stale > data.len() {
            ptr::write_bytes(dest.add(data.len()), 0, stale - data.len());
        }
    }

    /// Increments the version by exactly one and returns the new value.
    pub(crate) fn bump_version(&mut self) -> u64 {
        let next = self.version() + 1;
        unsafe {
            ptr::addr_of_mut!((*(self.base as *mut RecordFields)).template_version).write(next);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8-byte aligned scratch memory standing in for the mapping.
    fn scratch(layout: &RecordLayout) -> Vec<u64> {
        vec![0u64; layout.record_size() / 8]
    }

    fn sample(height: u64) -> BlockTemplate {
        BlockTemplate {
            height,
            difficulty: 300_000_000,
            seed_hash: HexDigest::from_digest(&[1; 32]),
            next_seed_hash: HexDigest::from_digest(&[2; 32]),
            prev_hash: HexDigest::from_digest(&[3; 32]),
            hashing_blob: vec![0x10; 76],
            block_blob: Some(vec![0x20; 300]),
            reserved_offset: 130,
            tx_count: 12,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn layout_sizes() {
        let layout = RecordLayout::new(4096, 65536);
        assert_eq!(layout.record_size(), 256 + 4096 + 65536);
        assert_eq!(layout.segment_size(), RECORD_OFFSET + layout.record_size());

        let odd = RecordLayout::new(77, 3);
        assert_eq!(odd.block_blob_offset(), 256 + 80);
        assert_eq!(odd.record_size(), 256 + 80 + 8);
    }

    #[test]
    fn validate_at_and_over_capacity() {
        let layout = RecordLayout::new(76, 300);
        assert!(layout.validate(&sample(1)).is_ok());

        let mut hashing = sample(1);
        hashing.hashing_blob.push(0);
        match layout.validate(&hashing) {
            Err(ShmemLibError::BlobTooLarge {
                blob: BlobKind::Hashing,
                size: 77,
                capacity: 76,
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }

        let mut block = sample(1);
        block.block_blob = Some(vec![0; 301]);
        assert!(matches!(
            layout.validate(&block),
            Err(ShmemLibError::BlobTooLarge {
                blob: BlobKind::Block,
                ..
            })
        ));
    }

    #[test]
    fn write_then_read_is_identical() {
        let layout = RecordLayout::new(4096, 4096);
        let mut mem = scratch(&layout);
        let mut view = unsafe { RecordView::new(mem.as_mut_ptr() as *mut u8, layout) };

        assert_eq!(view.version(), 0);
        assert_eq!(view.read_template().unwrap(), BlockTemplate::default());

        view.write_template(&sample(100)).unwrap();
        assert_eq!(view.bump_version(), 1);
        assert_eq!(view.read_template().unwrap(), sample(100));
        assert_eq!(view.version(), 1);
    }

    #[test]
    fn shorter_blob_clears_the_tail() {
        let layout = RecordLayout::new(128, 0);
        let mut mem = scratch(&layout);
        let base = mem.as_mut_ptr() as *mut u8;
        let mut view = unsafe { RecordView::new(base, layout) };

        let mut long = BlockTemplate::default();
        long.hashing_blob = vec![0xff; 100];
        view.write_template(&long).unwrap();

        let mut short = BlockTemplate::default();
        short.hashing_blob = vec![0xee; 10];
        view.write_template(&short).unwrap();

        let tail = unsafe { slice::from_raw_parts(base.add(FIELDS_SIZE + 10), 90) };
        assert!(tail.iter().all(|&b| b == 0));
        assert_eq!(view.read_template().unwrap().hashing_blob, vec![0xee; 10]);
    }

    #[test]
    fn empty_and_absent_block_blobs_differ() {
        let layout = RecordLayout::new(64, 64);
        let mut mem = scratch(&layout);
        let mut view = unsafe { RecordView::new(mem.as_mut_ptr() as *mut u8, layout) };

        let mut empty = BlockTemplate::default();
        empty.block_blob = Some(Vec::new());
        view.write_template(&empty).unwrap();
        assert_eq!(view.read_template().unwrap().block_blob, Some(Vec::new()));

        view.write_template(&BlockTemplate::default()).unwrap();
        assert_eq!(view.read_template().unwrap().block_blob, None);
    }

    #[test]
    fn oversized_write_leaves_record_alone() {
        let layout = RecordLayout::new(76, 300);
        let mut mem = scratch(&layout);
        let mut view = unsafe { RecordView::new(mem.as_mut_ptr() as *mut u8, layout) };
        view.write_template(&sample(7)).unwrap();

        let mut too_big = sample(8);
        too_big.hashing_blob = vec![0; 77];
        assert!(view.write_template(&too_big).is_err());
        assert_eq!(view.read_template().unwrap(), sample(7));
    }

    #[test]
    fn corrupt_size_is_reported() {
        let layout = RecordLayout::new(16, 16);
        let mut mem = scratch(&layout);
        let base = mem.as_mut_ptr() as *mut u8;
        unsafe {
            ptr::addr_of_mut!((*(base as *mut RecordFields)).hashing_blob_size).write(17);
        }
        let view = unsafe { RecordView::new(base, layout) };
        assert!(matches!(
            view.read_template(),
            Err(ShmemLibError::CorruptRecord(_))
        ));
    }
}
