//! The command engine: the single primary command ring, serialized
//! submission, and per-channel completion correlation.
//!
//! Grounded on `mhi_send_cmd` in the reference driver. Completions are
//! correlated by the channel id embedded in the *originating* command TRE,
//! not by the order completions arrive in — the command ring can have only
//! one command outstanding per channel at a time, but commands for
//! different channels (or the channel-agnostic `SfrConfig`) may be
//! in flight together. A completion for a channel with nothing outstanding
//! is a protocol violation and is surfaced rather than silently dropped,
//! matching the `BUG_ON` the reference driver hits on out-of-order command
//! completion.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{MhiError, MhiResult};
use crate::register::{Doorbell, RegisterIo};
use crate::ring::Ring;
use crate::trb::{CommandTre, EventCode};

struct CompletionState {
    outstanding: HashSet<u32>,
    completions: HashMap<u32, EventCode>,
}

/// Owns the command ring and doorbell, and the state needed to let callers
/// submit a command and block for its completion.
pub struct CommandEngine {
    ring: Mutex<Ring>,
    doorbell: Mutex<Doorbell>,
    state: Mutex<CompletionState>,
    condvar: Condvar,
}

impl CommandEngine {
    /// Creates a command engine over `ring`.
    pub fn new(ring: Ring, doorbell: Doorbell) -> Self {
        CommandEngine {
            ring: Mutex::new(ring),
            doorbell: Mutex::new(doorbell),
            state: Mutex::new(CompletionState {
                outstanding: HashSet::new(),
                completions: HashMap::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Enqueues `command` and rings the command doorbell, without blocking
    /// for its completion. Returns the device-visible pointer of the TRE
    /// just written, for correlating a completion event back to it.
    ///
    /// Only one command may be outstanding per channel id (`SfrConfig`
    /// commands all share channel id 0) at a time; callers serialize their
    /// own per-channel command sequencing (the reference driver does this
    /// by holding the channel mutex across the whole sequence).
    pub fn submit(&self, io: &dyn RegisterIo, command: CommandTre) -> MhiResult<u64> {
        let channel_id = command.channel_id();
        {
            let mut state = self.state.lock().unwrap();
            if !state.outstanding.insert(channel_id) {
                return Err(MhiError::InvalidArgument(format!(
                    "command already outstanding for channel {channel_id}"
                )));
            }
        }

        let (tre_ptr, wp_ptr) = {
            let mut ring = self.ring.lock().unwrap();
            let tre_ptr = ring.enqueue(command.to_bytes())?;
            let wp_ptr = ring.index_to_device_ptr(ring.write_index());
            (tre_ptr, wp_ptr)
        };
        self.doorbell.lock().unwrap().ring(io, wp_ptr)?;
        debug!(channel_id, "command submitted");
        Ok(tre_ptr)
    }

    /// Blocks until `channel_id`'s outstanding command completes or
    /// `timeout` elapses. The command is not withdrawn from the ring on
    /// timeout; a late completion is simply never observed since the
    /// channel is no longer in `outstanding`.
    pub fn wait(&self, channel_id: u32, timeout: Duration) -> MhiResult<EventCode> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(code) = state.completions.remove(&channel_id) {
                state.outstanding.remove(&channel_id);
                return Ok(code);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.outstanding.remove(&channel_id);
                return Err(MhiError::Timeout(format!(
                    "command completion for channel {channel_id}"
                )));
            }
            let (guard, _timeout_result) = self.condvar.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
    }

    /// Submits `command` and blocks until its completion event arrives or
    /// `timeout` elapses. A thin wrapper over [`CommandEngine::submit`] +
    /// [`CommandEngine::wait`] for callers that have no reason to interleave
    /// other work between issuing a command and waiting for it.
    pub fn send_and_wait(&self, io: &dyn RegisterIo, command: CommandTre, timeout: Duration) -> MhiResult<EventCode> {
        let channel_id = command.channel_id();
        self.submit(io, command)?;
        self.wait(channel_id, timeout)
    }

    /// Called by the event-ring processor when a `CmdCompletion` event
    /// arrives. Looks up the originating command's channel id from the
    /// command ring itself and wakes whoever is waiting on it.
    pub fn complete(&self, command_ptr: u64, code: EventCode) -> MhiResult<()> {
        let channel_id = {
            let ring = self.ring.lock().unwrap();
            let index = ring.device_ptr_to_index(command_ptr)?;
            CommandTre::from_bytes(ring.element_at(index))
                .ok_or_else(|| MhiError::Protocol("command ring element is undecodable".into()))?
                .channel_id()
        };

        let mut state = self.state.lock().unwrap();
        if !state.outstanding.contains(&channel_id) {
            error!(channel_id, "command completion with nothing outstanding");
            return Err(MhiError::Protocol(format!(
                "out-of-order command completion for channel {channel_id}"
            )));
        }
        state.completions.insert(channel_id, code);
        self.condvar.notify_all();
        Ok(())
    }
}
