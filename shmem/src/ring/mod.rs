//! Bounded circular queue of block handles shared between processes.
//!
//! Producers (`put`) and consumers (`get`) take different spinlocks, so a free
//! and an alloc only contend on `count`.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::errors::{Result, ShmcastError};
use crate::sync::SpinLock;

/// Header stored at the start of the ring's shared region. The handle slots
/// follow it directly.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RingHeader {
    capacity: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
    count: AtomicU32,
    producer_lock: SpinLock,
    consumer_lock: SpinLock,
}

pub struct FreeList<'a> {
    header: &'a RingHeader,
    slots: &'a [AtomicU32],
}

impl<'a> FreeList<'a> {
    /// Initializes an empty ring whose capacity is the number of slots.
    pub fn init(header: &'a RingHeader, slots: &'a [AtomicU32]) -> Result<FreeList<'a>> {
        let capacity = ring_capacity(slots)?;
        header.producer_lock.force_unlock();
        header.consumer_lock.force_unlock();
        header.capacity.store(capacity, Ordering::Relaxed);
        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        header.count.store(0, Ordering::Release);
        Ok(FreeList { header, slots })
    }

    /// Views a ring another process already initialized.
    pub fn attach(header: &'a RingHeader, slots: &'a [AtomicU32]) -> Result<FreeList<'a>> {
        let capacity = ring_capacity(slots)?;
        let stored = header.capacity.load(Ordering::Acquire);
        if stored != capacity {
            return Err(ShmcastError::IncompatibleSegment(format!(
                "free-list capacity is {} but the layout expects {}",
                stored, capacity
            )));
        }
        Ok(FreeList { header, slots })
    }

    pub(crate) fn from_parts(header: &'a RingHeader, slots: &'a [AtomicU32]) -> FreeList<'a> {
        FreeList { header, slots }
    }

    pub fn put(&self, handle: u32) -> Result<()> {
        if self.is_full() {
            return Err(ShmcastError::FreeListFull);
        }
        let _guard = self.header.producer_lock.lock();
        if self.is_full() {
            return Err(ShmcastError::FreeListFull);
        }
        let tail = self.header.tail.load(Ordering::Relaxed);
        self.slots[tail as usize].store(handle, Ordering::Relaxed);
        self.header.tail.store((tail + 1) % self.capacity(), Ordering::Relaxed);
        self.header.count.fetch_add(1, Ordering::Release);
        trace!(handle, tail, "free-list put");
        Ok(())
    }

    pub fn get(&self) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let _guard = self.header.consumer_lock.lock();
        if self.is_empty() {
            return None;
        }
        let head = self.header.head.load(Ordering::Relaxed);
        let handle = self.slots[head as usize].load(Ordering::Relaxed);
        self.header.head.store((head + 1) % self.capacity(), Ordering::Relaxed);
        self.header.count.fetch_sub(1, Ordering::AcqRel);
        trace!(handle, head, "free-list get");
        Some(handle)
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.header.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity()
    }

    /// Rewinds the ring to empty. Holds both locks so no put or get is in flight.
    pub fn reset(&self) {
        let _producer = self.header.producer_lock.lock();
        let _consumer = self.header.consumer_lock.lock();
        self.header.head.store(0, Ordering::Relaxed);
        self.header.tail.store(0, Ordering::Relaxed);
        self.header.count.store(0, Ordering::Release);
    }
}

fn ring_capacity(slots: &[AtomicU32]) -> Result<u32> {
    if slots.is_empty() {
        return Err(ShmcastError::InvalidConfig(
            "free-list needs at least one slot".to_string(),
        ));
    }
    u32::try_from(slots.len()).map_err(|_| {
        ShmcastError::InvalidConfig(format!("free-list of {} slots is too large", slots.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn slots(n: usize) -> Vec<AtomicU32> {
        (0..n).map(|_| AtomicU32::new(0)).collect()
    }

    #[test]
    fn rejects_zero_capacity() {
        let header = RingHeader::default();
        let empty = slots(0);
        assert!(matches!(
            FreeList::init(&header, &empty),
            Err(ShmcastError::InvalidConfig(_))
        ));
    }

    #[test]
    fn fills_to_capacity_then_rejects() {
        let header = RingHeader::default();
        let storage = slots(4);
        let ring = FreeList::init(&header, &storage).unwrap();
        for h in 1..=4 {
            ring.put(h).unwrap();
        }
        assert!(ring.is_full());
        assert!(matches!(ring.put(5), Err(ShmcastError::FreeListFull)));

        assert_eq!(ring.get(), Some(1));
        ring.put(5).unwrap();
        assert!(matches!(ring.put(6), Err(ShmcastError::FreeListFull)));
        assert_eq!(ring.count(), 4);
    }

    #[test]
    fn fifo_across_wraparound() {
        let header = RingHeader::default();
        let storage = slots(3);
        let ring = FreeList::init(&header, &storage).unwrap();
        let mut drained = Vec::new();
        for round in 0..3u32 {
            ring.put(round * 10 + 1).unwrap();
            ring.put(round * 10 + 2).unwrap();
            drained.push(ring.get().unwrap());
            drained.push(ring.get().unwrap());
        }
        assert_eq!(drained, vec![1, 2, 11, 12, 21, 22]);
        assert!(ring.is_empty());
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn reset_empties() {
        let header = RingHeader::default();
        let storage = slots(2);
        let ring = FreeList::init(&header, &storage).unwrap();
        ring.put(7).unwrap();
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.get(), None);
        ring.put(8).unwrap();
        assert_eq!(ring.get(), Some(8));
    }

    #[test]
    fn attach_checks_capacity() {
        let header = RingHeader::default();
        let storage = slots(8);
        FreeList::init(&header, &storage).unwrap();
        assert!(FreeList::attach(&header, &storage).is_ok());
        assert!(matches!(
            FreeList::attach(&header, &storage[..4]),
            Err(ShmcastError::IncompatibleSegment(_))
        ));
    }

    #[test]
    fn concurrent_put_get_keeps_every_handle_once() {
        const HANDLES: u32 = 64;
        let header = Arc::new(RingHeader::default());
        let storage = Arc::new(slots(HANDLES as usize));
        {
            let ring = FreeList::init(&header, &storage).unwrap();
            for h in 1..=HANDLES {
                ring.put(h).unwrap();
            }
        }
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let header = Arc::clone(&header);
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    let ring = FreeList::attach(&header, &storage).unwrap();
                    for _ in 0..2000 {
                        if let Some(h) = ring.get() {
                            ring.put(h).unwrap();
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("ring worker panicked");
        }
        let ring = FreeList::attach(&header, &storage).unwrap();
        assert_eq!(ring.count(), HANDLES);
        let mut seen = HashSet::new();
        while let Some(h) = ring.get() {
            assert!(seen.insert(h), "handle {} dequeued twice", h);
        }
        assert_eq!(seen.len(), HANDLES as usize);
    }
}
