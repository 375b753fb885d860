//! Shared table of participants.
//!
//! A participant's slot index doubles as its bit in every tracked message's
//! unread mask, so a slot keeps its index for as long as it is active.

use std::array;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use tracing::{debug, info};

use crate::core::{ParticipantId, ParticipantMask, MAX_PARTICIPANTS, MAX_USERNAME_LENGTH};
use crate::errors::{Result, ShmcastError};
use crate::sync::SpinLock;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParticipantStatus {
    Inactive = 0,
    Active = 1,
}

impl From<u8> for ParticipantStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => ParticipantStatus::Active,
            _ => ParticipantStatus::Inactive,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct ParticipantSlot {
    pid: AtomicU32,
    generation: AtomicU32,
    status: AtomicU8,
    name_len: AtomicU8,
    username: [AtomicU8; MAX_USERNAME_LENGTH],
    last_active: AtomicU64,
}

impl ParticipantSlot {
    #[inline]
    fn status(&self) -> ParticipantStatus {
        ParticipantStatus::from(self.status.load(Ordering::Acquire))
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.status() == ParticipantStatus::Active
    }

    fn username(&self) -> String {
        let len = (self.name_len.load(Ordering::Relaxed) as usize).min(MAX_USERNAME_LENGTH);
        let bytes: Vec<u8> = self.username[..len]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn name_equals(&self, name: &str) -> bool {
        let len = self.name_len.load(Ordering::Relaxed) as usize;
        len == name.len()
            && self.username[..len]
                .iter()
                .zip(name.bytes())
                .all(|(stored, b)| stored.load(Ordering::Relaxed) == b)
    }

    fn store_username(&self, name: &str) {
        for (stored, b) in self.username.iter().zip(name.bytes()) {
            stored.store(b, Ordering::Relaxed);
        }
        self.name_len.store(name.len() as u8, Ordering::Relaxed);
    }
}

/// One tenure of a slot. The generation changes on every join, so a seat
/// held by an evicted participant no longer matches once the slot is reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Seat {
    pub id: ParticipantId,
    pub generation: u32,
}

/// A participant removed by the liveness sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictedParticipant {
    pub id: ParticipantId,
    pub username: String,
    pub pid: u32,
}

#[repr(C)]
#[derive(Debug)]
pub struct Directory {
    lock: SpinLock,
    count: AtomicU32,
    last_ping: AtomicU64,
    slots: [ParticipantSlot; MAX_PARTICIPANTS],
}

impl Default for Directory {
    fn default() -> Self {
        Directory::new()
    }
}

pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(ShmcastError::InvalidUsername("username is empty".to_string()));
    }
    if username.len() >= MAX_USERNAME_LENGTH {
        return Err(ShmcastError::InvalidUsername(format!(
            "{} is longer than {} bytes",
            username,
            MAX_USERNAME_LENGTH - 1
        )));
    }
    if username.chars().any(char::is_control) {
        return Err(ShmcastError::InvalidUsername(format!(
            "{:?} contains control characters",
            username
        )));
    }
    Ok(())
}

impl Directory {
    pub fn new() -> Directory {
        Directory {
            lock: SpinLock::new(),
            count: AtomicU32::new(0),
            last_ping: AtomicU64::new(0),
            slots: array::from_fn(|_| ParticipantSlot::default()),
        }
    }

    /// Marks every slot inactive. Only used while the segment is being initialized.
    pub fn reset(&self, now: u64) {
        self.lock.force_unlock();
        let _guard = self.lock.lock();
        for slot in self.slots.iter() {
            slot.status.store(ParticipantStatus::Inactive as u8, Ordering::Release);
            slot.pid.store(0, Ordering::Relaxed);
            slot.name_len.store(0, Ordering::Relaxed);
            slot.last_active.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Release);
        self.last_ping.store(now, Ordering::Relaxed);
    }

    pub fn join(&self, username: &str, pid: u32, now: u64) -> Result<ParticipantId> {
        self.join_with(username, pid, now, |_| Ok(())).map(|seat| seat.id)
    }

    /// Claims the first inactive slot. `prepare` runs under the directory lock
    /// before the slot turns active, so it can scrub state left behind by the
    /// slot's previous owner without racing a concurrent sweep.
    pub fn join_with<F>(&self, username: &str, pid: u32, now: u64, prepare: F) -> Result<Seat>
    where
        F: FnOnce(ParticipantId) -> Result<()>,
    {
        validate_username(username)?;
        let _guard = self.lock.lock();
        if self.slots.iter().any(|s| s.is_active() && s.name_equals(username)) {
            return Err(ShmcastError::UsernameTaken(username.to_string()));
        }
        let id = self
            .slots
            .iter()
            .position(|s| !s.is_active())
            .ok_or(ShmcastError::DirectoryFull)?;
        prepare(id)?;

        let slot = &self.slots[id];
        slot.pid.store(pid, Ordering::Relaxed);
        slot.store_username(username);
        slot.last_active.store(now, Ordering::Relaxed);
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        slot.status.store(ParticipantStatus::Active as u8, Ordering::Release);
        self.count.fetch_add(1, Ordering::AcqRel);
        info!(id, username, pid, generation, "participant joined");
        Ok(Seat { id, generation })
    }

    /// Marks the slot inactive. Leaving twice is a no-op.
    pub fn leave(&self, id: ParticipantId) -> Result<()> {
        if id >= MAX_PARTICIPANTS {
            return Err(ShmcastError::ParticipantOutOfRange(id));
        }
        let _guard = self.lock.lock();
        self.deactivate(id);
        Ok(())
    }

    /// Leaves only if `seat` still holds its slot, so an evicted participant
    /// cannot remove whoever claimed the slot after it.
    pub fn leave_seat(&self, seat: Seat) -> Result<()> {
        self.with_seat(seat, || {
            self.deactivate(seat.id);
            Ok(())
        })
    }

    fn deactivate(&self, id: ParticipantId) {
        let slot = &self.slots[id];
        if slot.is_active() {
            slot.status.store(ParticipantStatus::Inactive as u8, Ordering::Release);
            self.count.fetch_sub(1, Ordering::AcqRel);
            info!(id, username = %slot.username(), "participant left");
        }
    }

    /// Whether `seat` is the slot's current active tenure.
    pub fn holds(&self, seat: Seat) -> bool {
        self.slots
            .get(seat.id)
            .map_or(false, |s| s.is_active() && s.generation.load(Ordering::Acquire) == seat.generation)
    }

    /// Runs `f` under the directory lock if `seat` still holds its slot.
    /// The seat cannot be evicted or reused until `f` returns.
    pub fn with_seat<F, T>(&self, seat: Seat, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if seat.id >= MAX_PARTICIPANTS {
            return Err(ShmcastError::ParticipantOutOfRange(seat.id));
        }
        let _guard = self.lock.lock();
        if !self.holds(seat) {
            return Err(ShmcastError::Evicted(seat.id));
        }
        f()
    }

    /// Refreshes the participant's liveness timestamp.
    pub fn touch(&self, id: ParticipantId, now: u64) {
        if let Some(slot) = self.slots.get(id) {
            if slot.is_active() {
                slot.last_active.store(now, Ordering::Relaxed);
            }
        }
    }

    /// Like `touch`, but only for the seat's own tenure.
    pub fn touch_seat(&self, seat: Seat, now: u64) -> Result<()> {
        self.with_seat(seat, || {
            self.slots[seat.id].last_active.store(now, Ordering::Relaxed);
            Ok(())
        })
    }

    /// Evicts active participants idle for longer than `timeout` seconds.
    pub fn check_liveness(&self, now: u64, timeout: u64) -> Vec<EvictedParticipant> {
        self.sweep(now, timeout, |_| true, |_| Ok(()))
            .unwrap_or_default()
    }

    /// Full liveness pass. Besides the timeout, participants for which
    /// `is_alive(pid)` is false are evicted. `release` is then called under the
    /// directory lock for every inactive slot, evicted ones included.
    pub fn sweep<A, R>(&self, now: u64, timeout: u64, is_alive: A, mut release: R) -> Result<Vec<EvictedParticipant>>
    where
        A: Fn(u32) -> bool,
        R: FnMut(ParticipantId) -> Result<()>,
    {
        let _guard = self.lock.lock();
        self.last_ping.store(now, Ordering::Relaxed);
        let mut evicted = Vec::new();
        for (id, slot) in self.slots.iter().enumerate() {
            if !slot.is_active() {
                continue;
            }
            let idle = now.saturating_sub(slot.last_active.load(Ordering::Relaxed));
            let pid = slot.pid.load(Ordering::Relaxed);
            if idle > timeout || !is_alive(pid) {
                slot.status.store(ParticipantStatus::Inactive as u8, Ordering::Release);
                self.count.fetch_sub(1, Ordering::AcqRel);
                let username = slot.username();
                info!(id, username = %username, pid, idle, "evicted participant");
                evicted.push(EvictedParticipant { id, username, pid });
            }
        }
        for (id, slot) in self.slots.iter().enumerate() {
            if !slot.is_active() {
                release(id)?;
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "liveness sweep evicted participants");
        }
        Ok(evicted)
    }

    /// Bitmask of the slots active right now.
    pub fn active_mask(&self) -> ParticipantMask {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_active())
            .fold(0, |mask, (id, _)| mask | (1 << id))
    }

    /// Runs `f` with the active mask while holding the directory lock, so no
    /// participant can join or be evicted until `f` returns.
    pub fn with_active_mask<F, T>(&self, f: F) -> T
    where
        F: FnOnce(ParticipantMask) -> T,
    {
        let _guard = self.lock.lock();
        f(self.active_mask())
    }

    /// Lock-free roster snapshot.
    pub fn list_active(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.is_active())
            .map(ParticipantSlot::username)
            .collect()
    }

    pub fn is_active(&self, id: ParticipantId) -> bool {
        self.slots.get(id).map_or(false, ParticipantSlot::is_active)
    }

    pub fn username(&self, id: ParticipantId) -> Option<String> {
        self.slots
            .get(id)
            .filter(|s| s.is_active())
            .map(ParticipantSlot::username)
    }

    pub fn last_active(&self, id: ParticipantId) -> Option<u64> {
        self.slots
            .get(id)
            .filter(|s| s.is_active())
            .map(|s| s.last_active.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn last_ping(&self) -> u64 {
        self.last_ping.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_claims_first_inactive_slot() {
        let dir = Directory::new();
        assert_eq!(dir.join("alice", 1, 100).unwrap(), 0);
        assert_eq!(dir.join("bob", 2, 100).unwrap(), 1);
        dir.leave(0).unwrap();
        assert_eq!(dir.join("carol", 3, 100).unwrap(), 0);
        assert_eq!(dir.count(), 2);
        assert_eq!(dir.active_mask(), 0b11);
    }

    #[test]
    fn join_validates_username() {
        let dir = Directory::new();
        assert!(matches!(dir.join("", 1, 0), Err(ShmcastError::InvalidUsername(_))));
        let long = "x".repeat(MAX_USERNAME_LENGTH);
        assert!(matches!(dir.join(&long, 1, 0), Err(ShmcastError::InvalidUsername(_))));
        let longest = "x".repeat(MAX_USERNAME_LENGTH - 1);
        assert!(dir.join(&longest, 1, 0).is_ok());
        assert!(matches!(dir.join("a\nb", 1, 0), Err(ShmcastError::InvalidUsername(_))));
    }

    #[test]
    fn duplicate_active_username_is_rejected() {
        let dir = Directory::new();
        let id = dir.join("alice", 1, 0).unwrap();
        assert!(matches!(dir.join("alice", 2, 0), Err(ShmcastError::UsernameTaken(_))));
        dir.leave(id).unwrap();
        assert!(dir.join("alice", 2, 0).is_ok());
    }

    #[test]
    fn full_directory_is_rejected() {
        let dir = Directory::new();
        for i in 0..MAX_PARTICIPANTS {
            dir.join(&format!("user{}", i), 1, 0).unwrap();
        }
        assert!(matches!(dir.join("late", 1, 0), Err(ShmcastError::DirectoryFull)));
        assert_eq!(dir.count(), MAX_PARTICIPANTS);
    }

    #[test]
    fn leave_is_idempotent_and_keeps_stale_name() {
        let dir = Directory::new();
        let id = dir.join("alice", 1, 0).unwrap();
        dir.leave(id).unwrap();
        dir.leave(id).unwrap();
        assert_eq!(dir.count(), 0);
        assert_eq!(dir.username(id), None);
        assert!(matches!(
            dir.leave(MAX_PARTICIPANTS),
            Err(ShmcastError::ParticipantOutOfRange(_))
        ));
    }

    #[test]
    fn liveness_evicts_only_idle_participants() {
        let dir = Directory::new();
        let idle = dir.join("idle", 1, 100).unwrap();
        let busy = dir.join("busy", 2, 100).unwrap();
        dir.touch(busy, 150);

        assert!(dir.check_liveness(160, 60).is_empty());
        let evicted = dir.check_liveness(161, 60);
        assert_eq!(
            evicted,
            vec![EvictedParticipant { id: idle, username: "idle".to_string(), pid: 1 }]
        );
        assert_eq!(dir.list_active(), vec!["busy".to_string()]);
        assert_eq!(dir.count(), 1);
        assert_eq!(dir.last_ping(), 161);
    }

    #[test]
    fn sweep_evicts_dead_processes_and_releases_inactive_slots() {
        let dir = Directory::new();
        dir.join("alive", 10, 0).unwrap();
        let dead = dir.join("dead", 20, 0).unwrap();
        let mut released = Vec::new();
        let evicted = dir
            .sweep(0, 60, |pid| pid != 20, |id| {
                released.push(id);
                Ok(())
            })
            .unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, dead);
        assert!(released.contains(&dead));
        assert!(!released.contains(&0));
        assert_eq!(released.len(), MAX_PARTICIPANTS - 1);
    }

    #[test]
    fn join_with_runs_prepare_before_activation() {
        let dir = Directory::new();
        let result = dir.join_with("alice", 1, 0, |id| {
            assert!(!dir_is_active_unlocked(&dir, id));
            Err(ShmcastError::TrackerFull)
        });
        assert!(matches!(result, Err(ShmcastError::TrackerFull)));
        assert_eq!(dir.count(), 0);
    }

    #[test]
    fn active_mask_is_read_under_the_lock() {
        let dir = Directory::new();
        dir.join("alice", 1, 0).unwrap();
        let mask = dir.with_active_mask(|mask| {
            assert!(dir.lock.is_locked());
            mask
        });
        assert_eq!(mask, 0b1);
        assert!(!dir.lock.is_locked());
    }

    #[test]
    fn reused_slot_gets_a_new_generation() {
        let dir = Directory::new();
        let first = dir.join_with("alice", 1, 0, |_| Ok(())).unwrap();
        assert!(dir.holds(first));
        assert_eq!(dir.check_liveness(61, 60).len(), 1);
        assert!(!dir.holds(first));

        let second = dir.join_with("carol", 2, 61, |_| Ok(())).unwrap();
        assert_eq!(second.id, first.id);
        assert_ne!(second.generation, first.generation);
        assert!(!dir.holds(first));
        assert!(dir.holds(second));
    }

    #[test]
    fn stale_seat_cannot_touch_or_leave() {
        let dir = Directory::new();
        let stale = dir.join_with("alice", 1, 0, |_| Ok(())).unwrap();
        dir.leave(stale.id).unwrap();
        let current = dir.join_with("carol", 2, 10, |_| Ok(())).unwrap();

        assert!(matches!(dir.touch_seat(stale, 50), Err(ShmcastError::Evicted(0))));
        assert_eq!(dir.last_active(current.id), Some(10));
        assert!(matches!(dir.leave_seat(stale), Err(ShmcastError::Evicted(0))));
        assert_eq!(dir.list_active(), vec!["carol".to_string()]);

        dir.touch_seat(current, 50).unwrap();
        assert_eq!(dir.last_active(current.id), Some(50));
        dir.leave_seat(current).unwrap();
        assert_eq!(dir.count(), 0);
    }

    #[test]
    fn with_seat_rejects_out_of_range_ids() {
        let dir = Directory::new();
        let seat = Seat { id: MAX_PARTICIPANTS, generation: 1 };
        assert!(matches!(
            dir.with_seat(seat, || Ok(())),
            Err(ShmcastError::ParticipantOutOfRange(_))
        ));
    }

    fn dir_is_active_unlocked(dir: &Directory, id: ParticipantId) -> bool {
        dir.slots[id].is_active()
    }
}
