use std::fmt;
use std::fs;
use std::io;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::errors::{Result, ShmcastError};
use crate::message::MESSAGE_HEADER_SIZE;
use crate::pool::{align_up, BlockPool, PoolLayout};
use crate::tracker::MessageTracker;

pub const MAX_PARTICIPANTS: usize = 32;
pub const MAX_USERNAME_LENGTH: usize = 32;
pub const MAX_MESSAGE_LENGTH: usize = 256;
pub const MAX_TRACKED_MESSAGES: usize = 100;
pub const MEMORY_POOL_SIZE: usize = 1024 * 1024;
pub const MESSAGE_BLOCK_SIZE: usize = MAX_MESSAGE_LENGTH + 128;
pub const LIVENESS_TIMEOUT_SECS: u64 = 60;
pub const POLL_INTERVAL_MS: u64 = 100;

/// Index of a participant slot, and its bit position in every unread mask.
pub type ParticipantId = usize;
pub type ParticipantMask = u64;

const _: () = assert!(MAX_PARTICIPANTS <= ParticipantMask::BITS as usize);
const _: () = assert!(MAX_USERNAME_LENGTH <= u8::MAX as usize);
const _: () = assert!(MESSAGE_BLOCK_SIZE >= MESSAGE_HEADER_SIZE + MAX_MESSAGE_LENGTH);

pub const ALL_PARTICIPANTS: ParticipantMask = if MAX_PARTICIPANTS == ParticipantMask::BITS as usize {
    ParticipantMask::MAX
} else {
    (1 << MAX_PARTICIPANTS) - 1
};

pub static SHMEM_FILE_NAME: &str = "shmcast-chat";

const SEGMENT_MAGIC: u64 = 0x7368_6d63_6173_7431; // "shmcast1"
const SEGMENT_VERSION: u32 = 1;
const SECTION_ALIGN: usize = 64;

#[inline]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub data_dir: String,
    pub segment_name: String,
    pub pool_size: usize,
    pub block_size: usize,
    pub liveness_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Also evict participants whose process has exited. Disable when
    /// processes live in different PID namespaces.
    pub probe_processes: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            data_dir: "/tmp".to_string(),
            segment_name: SHMEM_FILE_NAME.to_string(),
            pool_size: MEMORY_POOL_SIZE,
            block_size: MESSAGE_BLOCK_SIZE,
            liveness_timeout_secs: LIVENESS_TIMEOUT_SECS,
            poll_interval_ms: POLL_INTERVAL_MS,
            probe_processes: true,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Path of the link file through which attachers find the segment.
    pub fn link_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.segment_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_name.is_empty() {
            return Err(ShmcastError::InvalidConfig("segment_name is empty".to_string()));
        }
        if self.block_size < MESSAGE_HEADER_SIZE + MAX_MESSAGE_LENGTH {
            return Err(ShmcastError::InvalidConfig(format!(
                "block_size {} cannot hold a {} byte header and a {} byte message",
                self.block_size, MESSAGE_HEADER_SIZE, MAX_MESSAGE_LENGTH
            )));
        }
        PoolLayout::compute(self.pool_size, self.block_size)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn data_dir(mut self, data_dir: String) -> Self {
        self.config.data_dir = data_dir;
        self
    }

    pub fn segment_name(mut self, segment_name: String) -> Self {
        self.config.segment_name = segment_name;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = block_size;
        self
    }

    pub fn liveness_timeout_secs(mut self, secs: u64) -> Self {
        self.config.liveness_timeout_secs = secs;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn probe_processes(mut self, probe: bool) -> Self {
        self.config.probe_processes = probe;
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// First bytes of the segment. `ready` is published last by the creator.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SegmentHeader {
    magic: AtomicU64,
    version: AtomicU32,
    ready: AtomicU32,
    pool_size: AtomicU64,
    block_size: AtomicU64,
    creator_pid: AtomicU32,
}

/// Byte offsets of each structure inside the segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SegmentLayout {
    pub directory_offset: usize,
    pub tracker_offset: usize,
    pub pool_offset: usize,
    pub pool_size: usize,
    pub total_size: usize,
}

impl SegmentLayout {
    pub fn new(pool_size: usize) -> SegmentLayout {
        let directory_offset = align_up(mem::size_of::<SegmentHeader>(), SECTION_ALIGN);
        let tracker_offset = align_up(directory_offset + mem::size_of::<Directory>(), SECTION_ALIGN);
        let pool_offset = align_up(tracker_offset + mem::size_of::<MessageTracker>(), SECTION_ALIGN);
        SegmentLayout {
            directory_offset,
            tracker_offset,
            pool_offset,
            pool_size,
            total_size: pool_offset + pool_size,
        }
    }
}

fn open_linked(cfg: &SessionConfig) -> Result<Shmem> {
    let link = cfg.link_path();
    match ShmemConf::new().flink(&link).open() {
        Ok(v) => Ok(v),
        Err(ShmemError::LinkDoesNotExist) => {
            Err(ShmcastError::SessionNotFound(link.display().to_string()))
        }
        Err(ShmemError::LinkOpenFailed(e)) if e.kind() == io::ErrorKind::NotFound => {
            Err(ShmcastError::SessionNotFound(link.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Creates the backing segment. Fails if a segment is already linked at the
/// configured path.
pub fn server_context(cfg: &SessionConfig, layout: &SegmentLayout) -> Result<Shmem> {
    let link = cfg.link_path();
    match ShmemConf::new().size(layout.total_size).flink(&link).create() {
        Ok(v) => Ok(v),
        Err(ShmemError::LinkExists) | Err(ShmemError::MappingIdExists) => {
            Err(ShmcastError::SessionExists(link.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn client_context(cfg: &SessionConfig) -> Result<Shmem> {
    open_linked(cfg)
}

/// Process-local view over the mapped segment.
pub struct ShmemService {
    shmem: Shmem,
    layout: SegmentLayout,
    pool: BlockPool,
}

// All structures reached through the mapping are atomics guarded by
// spinlocks that are already safe to share across processes.
unsafe impl Send for ShmemService {}
unsafe impl Sync for ShmemService {}

impl ShmemService {
    /// Creates and initializes a fresh segment. If any step fails the owned
    /// mapping is dropped, which unlinks it.
    pub fn create(cfg: &SessionConfig) -> Result<ShmemService> {
        cfg.validate()?;
        let layout = SegmentLayout::new(cfg.pool_size);
        let shmem = server_context(cfg, &layout)?;
        debug!(os_id = shmem.get_os_id(), size = layout.total_size, "created segment");

        let base = shmem.as_ptr();
        let pool = unsafe { BlockPool::init(base.add(layout.pool_offset), layout.pool_size, cfg.block_size)? };
        let service = ShmemService { shmem, layout, pool };

        let now = unix_now();
        service.directory().reset(now);
        service.tracker().reset();

        let header = service.header();
        header.magic.store(SEGMENT_MAGIC, Ordering::Relaxed);
        header.version.store(SEGMENT_VERSION, Ordering::Relaxed);
        header.pool_size.store(cfg.pool_size as u64, Ordering::Relaxed);
        header.block_size.store(cfg.block_size as u64, Ordering::Relaxed);
        header.creator_pid.store(std::process::id(), Ordering::Relaxed);
        header.ready.store(1, Ordering::Release);

        info!(
            link = %cfg.link_path().display(),
            blocks = service.pool.num_blocks(),
            block_size = cfg.block_size,
            "segment ready"
        );
        Ok(service)
    }

    /// Maps an existing segment, taking the pool geometry from its header.
    pub fn attach(cfg: &SessionConfig) -> Result<ShmemService> {
        let shmem = client_context(cfg)?;
        let base = shmem.as_ptr();
        if shmem.len() < mem::size_of::<SegmentHeader>() {
            return Err(ShmcastError::IncompatibleSegment(format!(
                "segment of {} bytes is too small",
                shmem.len()
            )));
        }
        let header = unsafe { &*(base as *const SegmentHeader) };
        if header.ready.load(Ordering::Acquire) != 1 {
            return Err(ShmcastError::IncompatibleSegment("segment is not initialized".to_string()));
        }
        let magic = header.magic.load(Ordering::Relaxed);
        let version = header.version.load(Ordering::Relaxed);
        if magic != SEGMENT_MAGIC || version != SEGMENT_VERSION {
            return Err(ShmcastError::IncompatibleSegment(format!(
                "magic {:#x} version {}",
                magic, version
            )));
        }
        let pool_size = header.pool_size.load(Ordering::Relaxed) as usize;
        let block_size = header.block_size.load(Ordering::Relaxed) as usize;
        if pool_size != cfg.pool_size || block_size != cfg.block_size {
            warn!(
                pool_size,
                block_size, "segment geometry differs from local configuration, using the segment's"
            );
        }
        let layout = SegmentLayout::new(pool_size);
        if shmem.len() < layout.total_size {
            return Err(ShmcastError::IncompatibleSegment(format!(
                "segment of {} bytes is smaller than its layout ({} bytes)",
                shmem.len(),
                layout.total_size
            )));
        }
        let pool = unsafe { BlockPool::attach(base.add(layout.pool_offset), pool_size, block_size)? };
        debug!(os_id = shmem.get_os_id(), "attached segment");
        Ok(ShmemService { shmem, layout, pool })
    }

    /// Removes a segment left behind by a creator that never tore it down.
    /// Returns whether anything was removed.
    pub fn remove_stale(cfg: &SessionConfig) -> Result<bool> {
        let link = cfg.link_path();
        match open_linked(cfg) {
            Ok(mut shmem) => {
                shmem.set_owner(true);
                drop(shmem);
                warn!(link = %link.display(), "removed stale segment");
                Ok(true)
            }
            Err(ShmcastError::SessionNotFound(_)) => Ok(false),
            Err(e) => {
                // The link outlived its mapping.
                match fs::remove_file(&link) {
                    Ok(()) => {
                        warn!(link = %link.display(), error = %e, "removed dangling link");
                        Ok(true)
                    }
                    Err(io_err) if io_err.kind() == io::ErrorKind::NotFound => Err(e),
                    Err(io_err) => Err(io_err.into()),
                }
            }
        }
    }

    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.shmem.as_ptr() as *const SegmentHeader) }
    }

    pub fn directory(&self) -> &Directory {
        unsafe { &*(self.shmem.as_ptr().add(self.layout.directory_offset) as *const Directory) }
    }

    pub fn tracker(&self) -> &MessageTracker {
        unsafe { &*(self.shmem.as_ptr().add(self.layout.tracker_offset) as *const MessageTracker) }
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub fn creator_pid(&self) -> u32 {
        self.header().creator_pid.load(Ordering::Relaxed)
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    /// An owning service removes the segment and its link when dropped.
    pub fn set_owner(&mut self, owner: bool) {
        self.shmem.set_owner(owner);
    }
}

impl fmt::Debug for ShmemService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmemService")
            .field("os_id", &self.shmem.get_os_id())
            .field("owner", &self.shmem.is_owner())
            .field("layout", &self.layout)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sections_are_aligned_and_disjoint() {
        let layout = SegmentLayout::new(MEMORY_POOL_SIZE);
        assert_eq!(layout.directory_offset % SECTION_ALIGN, 0);
        assert_eq!(layout.tracker_offset % SECTION_ALIGN, 0);
        assert_eq!(layout.pool_offset % SECTION_ALIGN, 0);
        assert!(layout.tracker_offset >= layout.directory_offset + mem::size_of::<Directory>());
        assert!(layout.pool_offset >= layout.tracker_offset + mem::size_of::<MessageTracker>());
        assert_eq!(layout.total_size, layout.pool_offset + MEMORY_POOL_SIZE);
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = SessionConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.link_path(), PathBuf::from("/tmp").join(SHMEM_FILE_NAME));
    }

    #[test]
    fn builder_rejects_blocks_too_small_for_a_message() {
        let result = SessionConfig::builder().block_size(MAX_MESSAGE_LENGTH).build();
        assert!(matches!(result, Err(ShmcastError::InvalidConfig(_))));
        let result = SessionConfig::builder().pool_size(16).build();
        assert!(matches!(result, Err(ShmcastError::RegionTooSmall { .. })));
    }

    #[test]
    fn participant_mask_covers_every_slot() {
        assert_eq!(ALL_PARTICIPANTS.count_ones() as usize, MAX_PARTICIPANTS);
    }
}
