//! A process's handle on the shared chat segment.
//!
//! The server creates the segment, clients attach to it. Either may join the
//! roster, broadcast and poll for messages.

use std::fmt;

use tracing::{debug, info, warn};

use crate::core::{unix_now, ParticipantId, SessionConfig, ShmemService};
use crate::directory::{EvictedParticipant, Seat};
use crate::errors::{Result, ShmcastError};
use crate::message::{self, StoredMessage};
use crate::platform;

/// Sender name of broadcasts the segment makes on its own behalf.
pub const SYSTEM_SENDER: &str = "System";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStats {
    pub num_blocks: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub block_size: usize,
    pub tracked_messages: usize,
    pub active_participants: usize,
    pub last_ping: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks {}/{} free, {} tracked, {} active",
            self.free_blocks, self.num_blocks, self.tracked_messages, self.active_participants
        )
    }
}

struct Membership {
    seat: Seat,
    username: String,
}

pub struct Session {
    pub(crate) service: ShmemService,
    role: Role,
    config: SessionConfig,
    membership: Option<Membership>,
}

impl Session {
    /// Creates the segment. Fails with `SessionExists` if one is already linked.
    pub fn create(config: SessionConfig) -> Result<Session> {
        let service = ShmemService::create(&config)?;
        info!(link = %config.link_path().display(), "session created");
        Ok(Session {
            service,
            role: Role::Server,
            config,
            membership: None,
        })
    }

    pub fn attach(config: SessionConfig) -> Result<Session> {
        let service = ShmemService::attach(&config)?;
        info!(
            link = %config.link_path().display(),
            creator = service.creator_pid(),
            "session attached"
        );
        Ok(Session {
            service,
            role: Role::Client,
            config,
            membership: None,
        })
    }

    /// Removes a segment whose creator exited without tearing it down.
    pub fn remove_stale(config: &SessionConfig) -> Result<bool> {
        ShmemService::remove_stale(config)
    }

    /// Leaves the roster if joined. With `unlink`, the segment is removed and
    /// later `attach` calls fail. Processes already attached keep their mapping.
    pub fn teardown(mut self, unlink: bool) -> Result<()> {
        let left = match self.leave() {
            Ok(()) | Err(ShmcastError::NotJoined) | Err(ShmcastError::Evicted(_)) => Ok(()),
            Err(e) => Err(e),
        };
        self.service.set_owner(unlink);
        info!(unlink, "session torn down");
        left
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.membership.as_ref().map(|m| m.seat.id)
    }

    pub fn username(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.username.as_str())
    }

    fn membership(&self) -> Result<&Membership> {
        self.membership.as_ref().ok_or(ShmcastError::NotJoined)
    }

    /// False once this session left, or was evicted by a liveness sweep.
    pub fn is_joined(&self) -> bool {
        self.membership
            .as_ref()
            .map_or(false, |m| self.service.directory().holds(m.seat))
    }

    /// Claims a roster slot. Reads still owed by the slot's previous owner
    /// are released first, so a joiner only sees messages sent after it joined.
    pub fn join(&mut self, username: &str) -> Result<ParticipantId> {
        if let Some(m) = &self.membership {
            return Err(ShmcastError::AlreadyJoined(m.seat.id));
        }
        let tracker = self.service.tracker();
        let pool = self.service.pool();
        let seat = self
            .service
            .directory()
            .join_with(username, std::process::id(), unix_now(), |id| {
                tracker.release_participant(id, pool).map(|_| ())
            })?;
        self.membership = Some(Membership {
            seat,
            username: username.to_string(),
        });
        Ok(seat.id)
    }

    /// Leaves the roster. Messages still owed to this participant are
    /// released by the next liveness sweep. An evicted session gets
    /// `Evicted` and leaves the slot to its new owner.
    pub fn leave(&mut self) -> Result<()> {
        let membership = self.membership.take().ok_or(ShmcastError::NotJoined)?;
        self.service.directory().leave_seat(membership.seat)
    }

    pub fn list_active(&self) -> Vec<String> {
        self.service.directory().list_active()
    }

    /// Refreshes this participant's liveness. `send` and `receive` do it too.
    pub fn heartbeat(&self) -> Result<()> {
        let seat = self.membership()?.seat;
        self.service.directory().touch_seat(seat, unix_now())
    }

    /// Broadcasts `text` to every participant active right now, the sender included.
    pub fn send(&self, text: &str) -> Result<()> {
        let membership = self.membership()?;
        message::validate_text(text)?;
        self.service.directory().touch_seat(membership.seat, unix_now())?;
        self.broadcast(&membership.username, text, Some(membership.seat))
    }

    /// Broadcasts on behalf of the segment. Does not require a joined session.
    pub fn send_system(&self, text: &str) -> Result<()> {
        message::validate_text(text)?;
        self.broadcast(SYSTEM_SENDER, text, None)
    }

    fn broadcast(&self, sender: &str, text: &str, seat: Option<Seat>) -> Result<()> {
        let directory = self.service.directory();
        let pool = self.service.pool();
        let handle = pool.alloc()?;
        if let Err(e) = message::write(pool, handle, sender, text, unix_now()) {
            pool.free(handle)?;
            return Err(e);
        }
        // Holding the directory lock keeps the mask exact until the message
        // is tracked: a concurrent joiner either is in it or scrubs after it.
        let tracked = directory.with_active_mask(|mask| {
            if let Some(seat) = seat.filter(|&seat| !directory.holds(seat)) {
                return Err(ShmcastError::Evicted(seat.id));
            }
            if mask == 0 {
                return Ok(None);
            }
            self.service.tracker().add(handle, mask).map(Some)
        });
        match tracked {
            Ok(Some(slot)) => {
                debug!(slot, %handle, sender, "broadcast");
                Ok(())
            }
            Ok(None) => {
                debug!(sender, "nobody to deliver to");
                pool.free(handle)
            }
            Err(e) => {
                pool.free(handle)?;
                Err(e)
            }
        }
    }

    /// Delivers every pending message, oldest first. Never blocks.
    pub fn receive<F>(&self, callback: F) -> Result<usize>
    where
        F: FnMut(&StoredMessage),
    {
        self.receive_at_most(usize::MAX, callback)
    }

    pub fn receive_at_most<F>(&self, limit: usize, mut callback: F) -> Result<usize>
    where
        F: FnMut(&StoredMessage),
    {
        let seat = self.membership()?.seat;
        let id = seat.id;
        let directory = self.service.directory();
        directory.touch_seat(seat, unix_now())?;
        let tracker = self.service.tracker();
        let pool = self.service.pool();
        let mut delivered = 0;
        while delivered < limit {
            let entry = match tracker.next_unread(id) {
                Some(entry) => entry,
                None => break,
            };
            let message = message::read(pool, entry.block)?;
            // The copy only counts if the slot still holds the same message
            // and still owes it to this seat. Claiming under the directory
            // lock keeps an evicted seat off bits owed to the slot's next owner.
            let claimed = directory.with_seat(seat, || {
                if tracker.entry(entry.slot) != Some(entry) || tracker.has_read(entry.slot, id) {
                    return Ok(false);
                }
                match tracker.mark_read(entry.slot, id) {
                    Ok(()) => Ok(true),
                    Err(ShmcastError::EmptySlot(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })?;
            if !claimed {
                continue;
            }
            callback(&message);
            match tracker.try_free(entry.slot, pool) {
                Ok(()) | Err(ShmcastError::EmptySlot(_)) | Err(ShmcastError::StillReferenced { .. }) => {}
                Err(e) => return Err(e),
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn check_liveness(&self) -> Result<Vec<EvictedParticipant>> {
        self.check_liveness_at(unix_now())
    }

    /// Evicts participants idle past the configured timeout (or whose process
    /// is gone), then frees what every inactive slot still holds. A server
    /// session announces each eviction.
    pub fn check_liveness_at(&self, now: u64) -> Result<Vec<EvictedParticipant>> {
        let tracker = self.service.tracker();
        let pool = self.service.pool();
        let probe = self.config.probe_processes;
        let evicted = self.service.directory().sweep(
            now,
            self.config.liveness_timeout_secs,
            |pid| !probe || platform::process_alive(pid),
            |id| tracker.release_participant(id, pool).map(|_| ()),
        )?;
        if self.role == Role::Server {
            for participant in evicted.iter() {
                let notice = format!("{} has been disconnected (timeout)", participant.username);
                match self.send_system(&notice) {
                    Ok(()) => {}
                    Err(e) if e.is_capacity_exhausted() => {
                        warn!(username = %participant.username, error = %e, "could not announce eviction");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(evicted)
    }

    pub fn stats(&self) -> SessionStats {
        let pool = self.service.pool();
        let directory = self.service.directory();
        SessionStats {
            num_blocks: pool.num_blocks(),
            free_blocks: pool.free_count(),
            used_blocks: pool.used_count(),
            block_size: pool.block_size(),
            tracked_messages: self.service.tracker().count(),
            active_participants: directory.count(),
            last_ping: directory.last_ping(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(m) = self.membership.take() {
            match self.service.directory().leave_seat(m.seat) {
                Ok(()) => {}
                Err(ShmcastError::Evicted(id)) => debug!(id, "evicted before drop"),
                Err(e) => warn!(id = m.seat.id, error = %e, "failed to leave on drop"),
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("participant", &self.participant_id())
            .field("service", &self.service)
            .finish()
    }
}
