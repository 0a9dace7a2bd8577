//! The event-ring processor: drains completion events the device posts and
//! dispatches them by kind, then republishes the host's read pointer.
//!
//! Grounded on `mhi_process_ctrl_ev_ring`/`mhi_process_data_event_ring` and
//! `parse_xfer_event`/`parse_rsc_event` in the reference driver: process in
//! quota-limited batches, re-validate the device's published write pointer
//! every iteration (a corrupt pointer aborts just this pass, the caller's
//! next interrupt retries), and recycle the local read/write pointers
//! together before ringing the event-ring doorbell.

use tracing::{trace, warn};

use crate::error::{MhiError, MhiResult};
use crate::register::{Doorbell, RegisterIo};
use crate::ring::Ring;
use crate::trb::{EventCode, EventElement, EventKind};

/// Marker written into a stale event's type field by
/// [`EventElement::mark_stale`]; recognized here and skipped silently
/// instead of being treated as protocol corruption.
const STALE_EVENT_TYPE_MARKER: [u8; 2] = 0xffffu16.to_le_bytes();

/// Receives dispatched events. Implemented by the controller that owns the
/// channel/command engines, keeping this module free of any dependency on
/// how channels or commands are represented.
pub trait EventHandlers {
    /// A transfer-ring TRE completed on a normal channel.
    fn handle_tx(&mut self, channel_id: u32, code: EventCode, tre_ptr: u64, length: u32) -> MhiResult<()>;

    /// A transfer-ring TRE completed on a resource-constrained (pre-alloc)
    /// channel.
    fn handle_rsc_tx(&mut self, channel_id: u32, code: EventCode, tre_ptr: u64, length: u32) -> MhiResult<()>;

    /// A command-ring TRE completed.
    fn handle_cmd_completion(&mut self, code: EventCode, command_ptr: u64) -> MhiResult<()>;

    /// The device's power-management state transitioned (M0/M1/M3/SYS_ERR).
    /// This is device-wide, not channel-scoped: the raw state value rides in
    /// the event's `length` field (see `original_source/...main.c:884-919`),
    /// and `channel_id` is unused for this event kind.
    fn handle_state_change(&mut self, raw_state: u32) -> MhiResult<()>;

    /// The device's execution environment changed.
    fn handle_ee_change(&mut self, code: EventCode, new_ee: u32) -> MhiResult<()>;

    /// The device is requesting a bandwidth/link change.
    fn handle_bw_req(&mut self, code: EventCode) -> MhiResult<()>;
}

/// Owns one event ring (control or data) and the doorbell used to
/// republish the host's read pointer after draining it.
pub struct EventRingProcessor {
    ring: Ring,
    doorbell: Doorbell,
    /// Register offset holding the device's published write pointer for
    /// this ring.
    device_wp_register: u64,
}

impl EventRingProcessor {
    /// Creates a processor over `ring`, publishing read-pointer updates
    /// through `doorbell`, reading the device's write pointer from
    /// `device_wp_register`.
    pub fn new(ring: Ring, doorbell: Doorbell, device_wp_register: u64) -> Self {
        EventRingProcessor {
            ring,
            doorbell,
            device_wp_register,
        }
    }

    /// Drains up to `quota` events, dispatching each to `handlers`, and
    /// republishes the read pointer if anything was consumed.
    ///
    /// Returns the number of events processed. A malformed device write
    /// pointer ends the pass early (logged, not propagated) so the next
    /// interrupt can retry; a `BadTre` completion code or an unrecognized
    /// event type is a protocol violation and is propagated so the caller
    /// can escalate to recovery.
    pub fn process(&mut self, io: &dyn RegisterIo, handlers: &mut dyn EventHandlers, quota: usize) -> MhiResult<usize> {
        let mut processed = 0usize;

        while processed < quota {
            let device_wp = self.read_device_wp(io)?;
            let device_wp_index = match self.ring.device_ptr_to_index(device_wp) {
                Ok(idx) => idx,
                Err(_) => {
                    warn!(pointer = device_wp, "event ring write pointer out of bounds, aborting pass");
                    break;
                }
            };
            if device_wp_index == self.ring.read_index() {
                break;
            }

            let bytes = self.ring.element_at(self.ring.read_index());
            self.ring.dequeue()?;
            processed += 1;

            if bytes[13..15] == STALE_EVENT_TYPE_MARKER {
                trace!("skipping stale event");
                continue;
            }

            let event = EventElement::from_bytes(bytes)
                .ok_or_else(|| MhiError::Protocol("unrecognized event ring element".into()))?;

            self.dispatch(event, handlers)?;
        }

        if processed > 0 {
            self.republish(io)?;
        }
        Ok(processed)
    }

    fn dispatch(&mut self, event: EventElement, handlers: &mut dyn EventHandlers) -> MhiResult<()> {
        if event.code == EventCode::BadTre {
            return Err(MhiError::Protocol(format!(
                "device flagged BAD_TRE for {:?} on channel {}",
                event.kind, event.channel_id
            )));
        }
        if event.code == EventCode::Oob || event.code == EventCode::DbMode {
            self.doorbell.rearm();
        }
        match event.kind {
            EventKind::Tx => handlers.handle_tx(event.channel_id, event.code, event.pointer, event.length),
            EventKind::RscTx => handlers.handle_rsc_tx(event.channel_id, event.code, event.pointer, event.length),
            EventKind::CmdCompletion => handlers.handle_cmd_completion(event.code, event.pointer),
            EventKind::StateChange => handlers.handle_state_change(event.length),
            EventKind::EeChange => handlers.handle_ee_change(event.code, event.length),
            EventKind::BwReq => handlers.handle_bw_req(event.code),
        }
    }

    fn read_device_wp(&self, io: &dyn RegisterIo) -> MhiResult<u64> {
        let lo = io.read32(self.device_wp_register)? as u64;
        let hi = io.read32(self.device_wp_register + 4)? as u64;
        Ok((hi << 32) | lo)
    }

    fn republish(&mut self, io: &dyn RegisterIo) -> MhiResult<()> {
        let rp_ptr = self.ring.index_to_device_ptr(self.ring.read_index());
        self.doorbell.ring(io, rp_ptr)
    }

    /// Posts `element` onto this event ring and publishes the new device
    /// write pointer. Stands in for the device side of the transport: a
    /// real device writes events and its own write-pointer register
    /// directly; this lets test and demo code drive the same path a real
    /// device would, rather than calling into channel/command internals
    /// directly.
    pub fn post(&mut self, io: &dyn RegisterIo, element: EventElement) -> MhiResult<()> {
        self.ring.enqueue(element.to_bytes())?;
        let wp_ptr = self.ring.index_to_device_ptr(self.ring.write_index());
        io.write32(self.device_wp_register, wp_ptr as u32)?;
        io.write32(self.device_wp_register + 4, (wp_ptr >> 32) as u32)?;
        Ok(())
    }

    /// Scans events between the local read pointer and the device's
    /// published write pointer, rewriting any `Tx`/`RscTx` event for
    /// `channel_id` to STALE in place so a later drain pass skips it
    /// without delivering a callback for a channel that has since been
    /// reset. Mirrors `mhi_mark_stale_events` in the reference driver.
    pub fn mark_stale_for_channel(&mut self, io: &dyn RegisterIo, channel_id: u32) -> MhiResult<()> {
        let device_wp = self.read_device_wp(io)?;
        let device_wp_index = match self.ring.device_ptr_to_index(device_wp) {
            Ok(idx) => idx,
            Err(_) => return Ok(()),
        };
        let mut idx = self.ring.read_index();
        while idx != device_wp_index {
            let mut bytes = self.ring.element_at(idx);
            if bytes[13..15] != STALE_EVENT_TYPE_MARKER {
                if let Some(ev) = EventElement::from_bytes(bytes) {
                    if matches!(ev.kind, EventKind::Tx | EventKind::RscTx) && ev.channel_id == channel_id {
                        EventElement::mark_stale(&mut bytes);
                        self.ring.set_element_at(idx, bytes);
                    }
                }
            }
            idx = (idx + 1) % self.ring.capacity();
        }
        Ok(())
    }
}
