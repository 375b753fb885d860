pub mod core;
pub mod directory;
pub mod errors;
pub mod message;
mod platform;
pub mod pool;
pub mod ring;
pub mod session;
pub mod sync;
pub mod tracker;


pub use crate::core::{
    unix_now, ParticipantId, ParticipantMask, SessionConfig, SessionConfigBuilder, ALL_PARTICIPANTS,
    LIVENESS_TIMEOUT_SECS, MAX_MESSAGE_LENGTH, MAX_PARTICIPANTS, MAX_TRACKED_MESSAGES, MAX_USERNAME_LENGTH,
    MEMORY_POOL_SIZE, MESSAGE_BLOCK_SIZE, POLL_INTERVAL_MS,
};
pub use crate::errors::{Result, ShmcastError};
pub use crate::message::{StoredMessage, MAX_TEXT_BYTES};
pub use crate::session::{Role, Session, SessionStats, SYSTEM_SENDER};
