//! Per-message acknowledgment table.
//!
//! Every broadcast occupies one slot until each participant that was active at
//! broadcast time has read it. The block is then returned to the pool by
//! whichever reader observes the refcount reaching zero.

use std::array;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::core::{unix_now, ParticipantId, ParticipantMask, ALL_PARTICIPANTS, MAX_PARTICIPANTS, MAX_TRACKED_MESSAGES};
use crate::errors::{Result, ShmcastError};
use crate::pool::{BlockHandle, BlockPool};
use crate::sync::{SpinLock, SpinLockGuard};

/// Raw handle value marking an unoccupied slot. Offset zero always falls on
/// the pool's ring header, never on a block.
const EMPTY: u32 = 0;

#[repr(C)]
#[derive(Debug, Default)]
pub struct TrackedMessage {
    block: AtomicU32,
    /// Equals `unread_mask.count_ones()` while the table lock is held.
    /// Lock-free readers derive the count from the mask instead.
    ref_count: AtomicU32,
    unread_mask: AtomicU64,
    timestamp: AtomicU64,
    sent_at: AtomicU64,
}

impl TrackedMessage {
    fn clear(&self) {
        self.block.store(EMPTY, Ordering::Release);
        self.unread_mask.store(0, Ordering::Relaxed);
        self.ref_count.store(0, Ordering::Relaxed);
        self.timestamp.store(0, Ordering::Relaxed);
        self.sent_at.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of an occupied slot. Comparing two snapshots of the same slot
/// tells whether the slot was recycled in between.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrackedEntry {
    pub slot: usize,
    pub block: BlockHandle,
    pub timestamp: u64,
    pub sent_at: u64,
}

#[repr(C)]
#[derive(Debug)]
pub struct MessageTracker {
    lock: SpinLock,
    count: AtomicU32,
    next_index: AtomicU32,
    next_timestamp: AtomicU64,
    messages: [TrackedMessage; MAX_TRACKED_MESSAGES],
}

impl Default for MessageTracker {
    fn default() -> Self {
        MessageTracker::new()
    }
}

#[inline]
fn participant_bit(participant: ParticipantId) -> Result<ParticipantMask> {
    if participant >= MAX_PARTICIPANTS {
        return Err(ShmcastError::ParticipantOutOfRange(participant));
    }
    Ok(1 << participant)
}

#[inline]
fn check_slot(slot: usize) -> Result<()> {
    if slot >= MAX_TRACKED_MESSAGES {
        return Err(ShmcastError::SlotOutOfRange(slot));
    }
    Ok(())
}

impl MessageTracker {
    pub fn new() -> MessageTracker {
        MessageTracker {
            lock: SpinLock::new(),
            count: AtomicU32::new(0),
            next_index: AtomicU32::new(0),
            next_timestamp: AtomicU64::new(1),
            messages: array::from_fn(|_| TrackedMessage::default()),
        }
    }

    /// Clears every slot. Only used while the segment is being initialized.
    pub fn reset(&self) {
        self.lock.force_unlock();
        let _guard = self.lock.lock();
        for message in self.messages.iter() {
            message.clear();
        }
        self.count.store(0, Ordering::Release);
        self.next_index.store(0, Ordering::Relaxed);
        self.next_timestamp.store(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    /// Registers a broadcast owed to every participant in `mask`.
    pub fn add(&self, block: BlockHandle, mask: ParticipantMask) -> Result<usize> {
        let mask = mask & ALL_PARTICIPANTS;
        let _guard = self.lock.lock();
        if self.count() >= MAX_TRACKED_MESSAGES {
            return Err(ShmcastError::TrackerFull);
        }
        let start = self.next_index.load(Ordering::Relaxed) as usize % MAX_TRACKED_MESSAGES;
        let slot = (0..MAX_TRACKED_MESSAGES)
            .map(|i| (start + i) % MAX_TRACKED_MESSAGES)
            .find(|&i| self.messages[i].block.load(Ordering::Relaxed) == EMPTY)
            .ok_or(ShmcastError::TrackerFull)?;

        let message = &self.messages[slot];
        let timestamp = self.next_timestamp.fetch_add(1, Ordering::Relaxed);
        message.timestamp.store(timestamp, Ordering::Relaxed);
        message.sent_at.store(unix_now(), Ordering::Relaxed);
        message.ref_count.store(mask.count_ones(), Ordering::Relaxed);
        message.unread_mask.store(mask, Ordering::Relaxed);
        // Publishing the block last makes the slot visible to lock-free readers.
        message.block.store(block.into_raw(), Ordering::Release);

        self.count.fetch_add(1, Ordering::AcqRel);
        self.next_index
            .store(((slot + 1) % MAX_TRACKED_MESSAGES) as u32, Ordering::Relaxed);
        trace!(slot, timestamp, mask = format_args!("{:#b}", mask), "tracking message");
        Ok(slot)
    }

    /// Clears the participant's bit. Reading twice has no further effect.
    pub fn mark_read(&self, slot: usize, participant: ParticipantId) -> Result<()> {
        check_slot(slot)?;
        let bit = participant_bit(participant)?;
        let _guard = self.lock.lock();
        let message = &self.messages[slot];
        if message.block.load(Ordering::Acquire) == EMPTY {
            return Err(ShmcastError::EmptySlot(slot));
        }
        Self::clear_bit(message, bit);
        Ok(())
    }

    fn clear_bit(message: &TrackedMessage, bit: ParticipantMask) -> bool {
        if message.unread_mask.load(Ordering::Relaxed) & bit == 0 {
            return false;
        }
        message.unread_mask.fetch_and(!bit, Ordering::AcqRel);
        message.ref_count.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Invalid or empty slots count as read so a reader never waits on them.
    pub fn has_read(&self, slot: usize, participant: ParticipantId) -> bool {
        let bit = match (check_slot(slot), participant_bit(participant)) {
            (Ok(()), Ok(bit)) => bit,
            _ => return true,
        };
        let message = &self.messages[slot];
        if message.block.load(Ordering::Acquire) == EMPTY {
            return true;
        }
        message.unread_mask.load(Ordering::Acquire) & bit == 0
    }

    /// Oldest message still unread by `participant`.
    pub fn next_unread(&self, participant: ParticipantId) -> Option<TrackedEntry> {
        let bit = participant_bit(participant).ok()?;
        let mut oldest: Option<TrackedEntry> = None;
        for slot in 0..MAX_TRACKED_MESSAGES {
            let entry = match self.entry(slot) {
                Some(entry) => entry,
                None => continue,
            };
            if self.messages[slot].unread_mask.load(Ordering::Acquire) & bit == 0 {
                continue;
            }
            if oldest.map_or(true, |o| entry.timestamp < o.timestamp) {
                oldest = Some(entry);
            }
        }
        oldest
    }

    pub fn entry(&self, slot: usize) -> Option<TrackedEntry> {
        check_slot(slot).ok()?;
        let message = &self.messages[slot];
        let raw = message.block.load(Ordering::Acquire);
        if raw == EMPTY {
            return None;
        }
        Some(TrackedEntry {
            slot,
            block: BlockHandle::from_raw(raw),
            timestamp: message.timestamp.load(Ordering::Relaxed),
            sent_at: message.sent_at.load(Ordering::Relaxed),
        })
    }

    /// Readers still owed the slot's message, taken from a single load of
    /// the unread mask.
    pub fn ref_count(&self, slot: usize) -> Option<u32> {
        self.unread_mask(slot).map(ParticipantMask::count_ones)
    }

    pub fn unread_mask(&self, slot: usize) -> Option<ParticipantMask> {
        self.entry(slot)
            .map(|_| self.messages[slot].unread_mask.load(Ordering::Acquire))
    }

    /// Frees the slot's block once nobody owes a read. The refcount is checked
    /// again under the lock, which also serializes `mark_read`, so the block
    /// is released exactly once.
    pub fn try_free(&self, slot: usize, pool: &BlockPool) -> Result<()> {
        check_slot(slot)?;
        let message = &self.messages[slot];
        if message.block.load(Ordering::Acquire) == EMPTY {
            return Err(ShmcastError::EmptySlot(slot));
        }
        let ref_count = message.unread_mask.load(Ordering::Acquire).count_ones();
        if ref_count > 0 {
            return Err(ShmcastError::StillReferenced { slot, ref_count });
        }
        let guard = self.lock.lock();
        self.release_slot(&guard, slot, pool)
    }

    fn release_slot(&self, _guard: &SpinLockGuard<'_>, slot: usize, pool: &BlockPool) -> Result<()> {
        let message = &self.messages[slot];
        let raw = message.block.load(Ordering::Acquire);
        if raw == EMPTY {
            return Err(ShmcastError::EmptySlot(slot));
        }
        let ref_count = message.ref_count.load(Ordering::Acquire);
        if ref_count > 0 {
            return Err(ShmcastError::StillReferenced { slot, ref_count });
        }
        pool.free(BlockHandle::from_raw(raw))?;
        message.clear();
        self.count.fetch_sub(1, Ordering::AcqRel);
        trace!(slot, "released tracked message");
        Ok(())
    }

    /// Drops every read owed by `participant` and frees the messages nobody
    /// else is waiting on. Returns how many blocks went back to the pool.
    pub fn release_participant(&self, participant: ParticipantId, pool: &BlockPool) -> Result<usize> {
        let bit = participant_bit(participant)?;
        let guard = self.lock.lock();
        let mut freed = 0;
        for slot in 0..MAX_TRACKED_MESSAGES {
            let message = &self.messages[slot];
            if message.block.load(Ordering::Acquire) == EMPTY {
                continue;
            }
            if !Self::clear_bit(message, bit) {
                continue;
            }
            if message.ref_count.load(Ordering::Acquire) == 0 {
                self.release_slot(&guard, slot, pool)?;
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(participant, freed, "released messages owed by participant");
        }
        Ok(freed)
    }
}
