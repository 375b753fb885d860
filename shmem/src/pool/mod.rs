//! Fixed-size block allocator over a contiguous (possibly shared) region.
//!
//! Region layout:
//!
//! ```text
//! | RingHeader | handle slots (u32 x n) | block states (u8 x n) | pad | blocks (block_size x n) |
//! ```
//!
//! Handles are byte offsets from the region start, so every process that maps
//! the region agrees on them regardless of where the mapping lands.

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use tracing::{debug, warn};

use crate::errors::{Result, ShmcastError};
use crate::ring::{FreeList, RingHeader};

pub const BLOCK_ALIGN: usize = 8;
const HANDLE_WIDTH: usize = mem::size_of::<u32>();
const STATE_WIDTH: usize = mem::size_of::<u8>();

const BLOCK_FREE: u8 = 0;
const BLOCK_ALLOCATED: u8 = 1;

/// Opaque reference to one block of a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle(u32);

impl BlockHandle {
    #[inline]
    pub fn from_raw(raw: u32) -> BlockHandle {
        BlockHandle(raw)
    }

    #[inline]
    pub fn into_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolLayout {
    pub region_size: usize,
    pub block_size: usize,
    pub num_blocks: usize,
    slots_offset: usize,
    states_offset: usize,
    blocks_offset: usize,
}

impl PoolLayout {
    /// Partitions `region_size` bytes into blocks after reserving the ring
    /// header plus one handle slot and one state byte per potential block.
    pub fn compute(region_size: usize, block_size: usize) -> Result<PoolLayout> {
        if block_size < HANDLE_WIDTH {
            return Err(ShmcastError::InvalidConfig(format!(
                "block size {} is smaller than a handle ({} bytes)",
                block_size, HANDLE_WIDTH
            )));
        }
        if region_size > u32::MAX as usize {
            return Err(ShmcastError::InvalidConfig(format!(
                "region of {} bytes is not addressable by a 32-bit handle",
                region_size
            )));
        }
        let too_small = ShmcastError::RegionTooSmall {
            size: region_size,
            block_size,
        };
        let header = mem::size_of::<RingHeader>();
        if region_size <= header {
            return Err(too_small);
        }
        let potential = (region_size - header) / block_size;
        let slots_offset = header;
        let states_offset = slots_offset + potential * HANDLE_WIDTH;
        let blocks_offset = align_up(states_offset + potential * STATE_WIDTH, BLOCK_ALIGN);
        if region_size < blocks_offset + block_size {
            return Err(too_small);
        }
        let num_blocks = (region_size - blocks_offset) / block_size;
        Ok(PoolLayout {
            region_size,
            block_size,
            num_blocks,
            slots_offset,
            states_offset,
            blocks_offset,
        })
    }

    #[inline]
    fn handle_of(&self, index: usize) -> BlockHandle {
        BlockHandle((self.blocks_offset + index * self.block_size) as u32)
    }

    /// Maps a handle back to its block index, rejecting foreign and
    /// misaligned handles.
    fn index_of(&self, handle: BlockHandle) -> Result<usize> {
        let offset = handle.0 as usize;
        let end = self.blocks_offset + self.num_blocks * self.block_size;
        if offset < self.blocks_offset || offset >= end {
            return Err(ShmcastError::ForeignHandle(handle.0));
        }
        let relative = offset - self.blocks_offset;
        if relative % self.block_size != 0 {
            return Err(ShmcastError::MisalignedHandle(handle.0));
        }
        Ok(relative / self.block_size)
    }
}

pub struct BlockPool {
    base: NonNull<u8>,
    layout: PoolLayout,
}

// Every piece of shared state reached through `base` is an atomic or is only
// touched through raw copies by the block's current owner.
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Partitions the region and enqueues every block in ascending address order.
    ///
    /// # Safety
    /// `region` must be valid for reads and writes of `region_size` bytes,
    /// aligned to 8, and must outlive the returned pool.
    pub unsafe fn init(region: *mut u8, region_size: usize, block_size: usize) -> Result<BlockPool> {
        let pool = Self::view(region, region_size, block_size)?;
        FreeList::init(pool.ring_header(), pool.slots())?;
        pool.reset()?;
        debug!(
            blocks = pool.layout.num_blocks,
            block_size = pool.layout.block_size,
            "initialized block pool"
        );
        Ok(pool)
    }

    /// Views a pool another process already initialized in `region`.
    ///
    /// # Safety
    /// Same contract as [`BlockPool::init`].
    pub unsafe fn attach(region: *mut u8, region_size: usize, block_size: usize) -> Result<BlockPool> {
        let pool = Self::view(region, region_size, block_size)?;
        FreeList::attach(pool.ring_header(), pool.slots())?;
        Ok(pool)
    }

    unsafe fn view(region: *mut u8, region_size: usize, block_size: usize) -> Result<BlockPool> {
        let base = NonNull::new(region)
            .ok_or_else(|| ShmcastError::InvalidConfig("pool region is null".to_string()))?;
        if (region as usize) % BLOCK_ALIGN != 0 {
            return Err(ShmcastError::InvalidConfig(
                "pool region is not 8-byte aligned".to_string(),
            ));
        }
        let layout = PoolLayout::compute(region_size, block_size)?;
        Ok(BlockPool { base, layout })
    }

    fn ring_header(&self) -> &RingHeader {
        unsafe { &*(self.base.as_ptr() as *const RingHeader) }
    }

    fn slots(&self) -> &[AtomicU32] {
        unsafe {
            let p = self.base.as_ptr().add(self.layout.slots_offset) as *const AtomicU32;
            slice::from_raw_parts(p, self.layout.num_blocks)
        }
    }

    fn states(&self) -> &[AtomicU8] {
        unsafe {
            let p = self.base.as_ptr().add(self.layout.states_offset) as *const AtomicU8;
            slice::from_raw_parts(p, self.layout.num_blocks)
        }
    }

    #[inline]
    fn free_list(&self) -> FreeList<'_> {
        // The layout was validated against the header in init/attach.
        FreeList::from_parts(self.ring_header(), self.slots())
    }

    pub fn alloc(&self) -> Result<BlockHandle> {
        let raw = self.free_list().get().ok_or(ShmcastError::PoolExhausted)?;
        let handle = BlockHandle(raw);
        let index = self.layout.index_of(handle)?;
        if self.states()[index]
            .compare_exchange(BLOCK_FREE, BLOCK_ALLOCATED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(%handle, "free-list handed out a block marked allocated");
        }
        Ok(handle)
    }

    /// Returns a block to the pool. Foreign, misaligned and already free
    /// handles are rejected without touching pool state.
    pub fn free(&self, handle: BlockHandle) -> Result<()> {
        let index = self.layout.index_of(handle)?;
        let state = &self.states()[index];
        if state
            .compare_exchange(BLOCK_ALLOCATED, BLOCK_FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ShmcastError::DoubleFree(handle.0));
        }
        if let Err(e) = self.free_list().put(handle.0) {
            state.store(BLOCK_ALLOCATED, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    pub fn is_allocated(&self, handle: BlockHandle) -> bool {
        self.layout
            .index_of(handle)
            .map(|i| self.states()[i].load(Ordering::Acquire) == BLOCK_ALLOCATED)
            .unwrap_or(false)
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_list().count() as usize
    }

    #[inline]
    pub fn used_count(&self) -> usize {
        self.layout.num_blocks - self.free_count()
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.layout.num_blocks
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.layout.block_size
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    /// Re-enqueues every block, discarding outstanding allocations.
    pub fn reset(&self) -> Result<()> {
        let ring = self.free_list();
        ring.reset();
        for (index, state) in self.states().iter().enumerate() {
            state.store(BLOCK_FREE, Ordering::Relaxed);
            ring.put(self.layout.handle_of(index).0)?;
        }
        Ok(())
    }

    fn checked_range(&self, handle: BlockHandle, offset: usize, len: usize) -> Result<*mut u8> {
        self.layout.index_of(handle)?;
        if offset + len > self.layout.block_size {
            return Err(ShmcastError::MessageTooLong {
                len: offset + len,
                max: self.layout.block_size,
            });
        }
        Ok(unsafe { self.base.as_ptr().add(handle.0 as usize + offset) })
    }

    /// Copies `src` into the block at `offset`. Only the process that
    /// allocated the block may write to it.
    pub fn copy_into_block(&self, handle: BlockHandle, offset: usize, src: &[u8]) -> Result<()> {
        let dest = self.checked_range(handle, offset, src.len())?;
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dest, src.len()) };
        Ok(())
    }

    pub fn copy_from_block(&self, handle: BlockHandle, offset: usize, dest: &mut [u8]) -> Result<()> {
        let src = self.checked_range(handle, offset, dest.len())?;
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dest.as_mut_ptr(), dest.len()) };
        Ok(())
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("num_blocks", &self.layout.num_blocks)
            .field("block_size", &self.layout.block_size)
            .field("free", &self.free_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    /// Heap-backed, 8-byte aligned stand-in for a shared region.
    pub(crate) struct HeapRegion {
        words: Vec<u64>,
    }

    impl HeapRegion {
        pub(crate) fn new(size: usize) -> HeapRegion {
            HeapRegion {
                words: vec![0u64; align_up(size, 8) / 8],
            }
        }

        pub(crate) fn len(&self) -> usize {
            self.words.len() * 8
        }

        pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
            self.words.as_mut_ptr() as *mut u8
        }
    }

    pub(crate) fn heap_pool(region: &mut HeapRegion, block_size: usize) -> BlockPool {
        let len = region.len();
        unsafe { BlockPool::init(region.as_mut_ptr(), len, block_size) }.unwrap()
    }

    #[test]
    fn rejects_null_region() {
        let result = unsafe { BlockPool::init(ptr::null_mut(), 4096, 64) };
        assert!(matches!(result, Err(ShmcastError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_block_smaller_than_handle() {
        assert!(matches!(
            PoolLayout::compute(4096, 2),
            Err(ShmcastError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_region_without_room_for_one_block() {
        let header = mem::size_of::<RingHeader>();
        assert!(matches!(
            PoolLayout::compute(header, 64),
            Err(ShmcastError::RegionTooSmall { .. })
        ));
        assert!(matches!(
            PoolLayout::compute(header + 64, 64),
            Err(ShmcastError::RegionTooSmall { .. })
        ));
        let fits_one = align_up(header + HANDLE_WIDTH + STATE_WIDTH, BLOCK_ALIGN) + 64;
        assert_eq!(PoolLayout::compute(fits_one, 64).unwrap().num_blocks, 1);
    }

    #[test]
    fn blocks_do_not_overlap_overhead() {
        let layout = PoolLayout::compute(4096, 384).unwrap();
        assert_eq!(layout.num_blocks, 10);
        assert!(layout.blocks_offset >= layout.states_offset + layout.num_blocks);
        assert_eq!(layout.blocks_offset % BLOCK_ALIGN, 0);
        let last = layout.handle_of(layout.num_blocks - 1).into_raw() as usize;
        assert!(last + layout.block_size <= layout.region_size);
    }

    #[test]
    fn alloc_hands_out_ascending_blocks_until_exhausted() {
        let mut region = HeapRegion::new(4096);
        let pool = heap_pool(&mut region, 256);
        let n = pool.num_blocks();
        let mut previous = None;
        for _ in 0..n {
            let handle = pool.alloc().unwrap();
            if let Some(p) = previous {
                assert_eq!(handle.into_raw(), p + 256);
            }
            previous = Some(handle.into_raw());
        }
        assert!(matches!(pool.alloc(), Err(ShmcastError::PoolExhausted)));
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.used_count(), n);
    }

    #[test]
    fn free_and_used_always_sum_to_capacity() {
        let mut region = HeapRegion::new(8192);
        let pool = heap_pool(&mut region, 128);
        let n = pool.num_blocks();
        let mut held = Vec::new();
        for step in 0..200 {
            if step % 3 == 2 {
                if let Some(h) = held.pop() {
                    pool.free(h).unwrap();
                }
            } else if let Ok(h) = pool.alloc() {
                held.push(h);
            }
            assert_eq!(pool.free_count() + pool.used_count(), n);
            assert_eq!(pool.used_count(), held.len());
        }
    }

    #[test]
    fn handle_is_not_reissued_before_free() {
        let mut region = HeapRegion::new(4096);
        let pool = heap_pool(&mut region, 64);
        let mut live = HashSet::new();
        while let Ok(h) = pool.alloc() {
            assert!(live.insert(h));
        }
        let returned = *live.iter().next().unwrap();
        pool.free(returned).unwrap();
        assert_eq!(pool.alloc().unwrap(), returned);
    }

    #[test]
    fn rejects_foreign_misaligned_and_double_free() {
        let mut region = HeapRegion::new(4096);
        let pool = heap_pool(&mut region, 64);
        let handle = pool.alloc().unwrap();
        let free_before = pool.free_count();

        let foreign = BlockHandle::from_raw(1);
        assert!(matches!(pool.free(foreign), Err(ShmcastError::ForeignHandle(1))));
        let past_end = BlockHandle::from_raw(4096);
        assert!(matches!(pool.free(past_end), Err(ShmcastError::ForeignHandle(_))));
        let misaligned = BlockHandle::from_raw(handle.into_raw() + 3);
        assert!(matches!(pool.free(misaligned), Err(ShmcastError::MisalignedHandle(_))));
        assert_eq!(pool.free_count(), free_before);

        pool.free(handle).unwrap();
        assert!(matches!(pool.free(handle), Err(ShmcastError::DoubleFree(_))));
        assert_eq!(pool.free_count(), free_before + 1);
    }

    #[test]
    fn reset_reclaims_outstanding_blocks() {
        let mut region = HeapRegion::new(4096);
        let pool = heap_pool(&mut region, 64);
        let h = pool.alloc().unwrap();
        pool.alloc().unwrap();
        pool.reset().unwrap();
        assert_eq!(pool.used_count(), 0);
        assert!(!pool.is_allocated(h));
    }

    #[test]
    fn attach_sees_initializer_state() {
        let mut region = HeapRegion::new(4096);
        let len = region.len();
        let pool = heap_pool(&mut region, 64);
        let h = pool.alloc().unwrap();
        let other = unsafe { BlockPool::attach(region.as_mut_ptr(), len, 64) }.unwrap();
        assert_eq!(other.used_count(), 1);
        assert!(other.is_allocated(h));
        other.free(h).unwrap();
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn block_copies_stay_inside_the_block() {
        let mut region = HeapRegion::new(4096);
        let pool = heap_pool(&mut region, 64);
        let h = pool.alloc().unwrap();
        pool.copy_into_block(h, 60, b"abcd").unwrap();
        let mut out = [0u8; 4];
        pool.copy_from_block(h, 60, &mut out).unwrap();
        assert_eq!(&out, b"abcd");
        assert!(pool.copy_into_block(h, 61, b"abcd").is_err());
    }

    #[test]
    fn concurrent_alloc_free_preserves_invariant() {
        let mut region = HeapRegion::new(16 * 1024);
        let pool = Arc::new(heap_pool(&mut region, 128));
        let n = pool.num_blocks();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut held = Vec::new();
                        for _ in 0..4 {
                            if let Ok(h) = pool.alloc() {
                                held.push(h);
                            }
                        }
                        for h in held {
                            pool.free(h).unwrap();
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("pool worker panicked");
        }
        assert_eq!(pool.free_count(), n);
        assert_eq!(pool.used_count(), 0);
    }
}
