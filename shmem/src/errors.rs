use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShmcastError>;

#[derive(Debug, Error)]
pub enum ShmcastError {
    // Environment
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("A session already exists at {0}")]
    SessionExists(String),
    #[error("No session found at {0}")]
    SessionNotFound(String),
    #[error("Incompatible segment: {0}")]
    IncompatibleSegment(String),

    // Capacity
    #[error("No free block left in the pool")]
    PoolExhausted,
    #[error("Free-list is full")]
    FreeListFull,
    #[error("Message tracker is full")]
    TrackerFull,
    #[error("Participant directory is full")]
    DirectoryFull,

    // Foreign or corrupted handles
    #[error("Block handle {0:#x} does not belong to the pool")]
    ForeignHandle(u32),
    #[error("Block handle {0:#x} is not on a block boundary")]
    MisalignedHandle(u32),
    #[error("Block handle {0:#x} is not allocated")]
    DoubleFree(u32),

    // Invalid arguments
    #[error("Region of {size} bytes cannot hold a single block of {block_size} bytes")]
    RegionTooSmall { size: usize, block_size: usize },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Message of {len} bytes exceeds the limit of {max} bytes")]
    MessageTooLong { len: usize, max: usize },
    #[error("Invalid username: {0}")]
    InvalidUsername(String),
    #[error("Username {0} is already in use")]
    UsernameTaken(String),
    #[error("Tracker slot {0} is out of range")]
    SlotOutOfRange(usize),
    #[error("Participant {0} is out of range")]
    ParticipantOutOfRange(usize),
    #[error("Tracker slot {0} is empty")]
    EmptySlot(usize),
    #[error("Tracker slot {slot} is still referenced by {ref_count} participant(s)")]
    StillReferenced { slot: usize, ref_count: u32 },
    #[error("Session has not joined")]
    NotJoined,
    #[error("Session already joined as participant {0}")]
    AlreadyJoined(usize),
    #[error("Participant {0} was evicted from the roster")]
    Evicted(usize),
}

impl ShmcastError {
    /// Capacity errors are transient: the caller may retry once readers catch up.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(
            self,
            ShmcastError::PoolExhausted
                | ShmcastError::FreeListFull
                | ShmcastError::TrackerFull
                | ShmcastError::DirectoryFull
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_retryable() {
        assert!(ShmcastError::PoolExhausted.is_capacity_exhausted());
        assert!(ShmcastError::TrackerFull.is_capacity_exhausted());
        assert!(ShmcastError::DirectoryFull.is_capacity_exhausted());
        assert!(!ShmcastError::EmptyMessage.is_capacity_exhausted());
        assert!(!ShmcastError::DoubleFree(64).is_capacity_exhausted());
    }

    #[test]
    fn display_mentions_limits() {
        let e = ShmcastError::MessageTooLong { len: 300, max: 255 };
        assert_eq!(e.to_string(), "Message of 300 bytes exceeds the limit of 255 bytes");
    }
}
