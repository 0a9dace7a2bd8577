//! The channel engine: per-channel transfer ring, its buffer-info shadow
//! ring, and the submission/retirement operations a client drives.
//!
//! Grounded on `mhi_gen_tre`/`mhi_queue_skb`/`mhi_queue_dma`/`mhi_queue_buf`
//! in the reference driver for submission, and `mhi_reset_data_chan` for
//! what a RESET does to an in-flight channel: every pending transfer is
//! handed back to the mapper unfulfilled and the local ring pointers return
//! to zero.

use tracing::{debug, warn};

use crate::buffer::{Buffer, BufferMapper, Direction, PendingTransfer};
use crate::error::{MhiError, MhiResult};
use crate::register::{Doorbell, RegisterIo};
use crate::ring::Ring;
use crate::state::{ChannelCommand, ChannelState};
use crate::trb::{data_flags, DataTre};

/// One channel: a transfer ring, the shadow ring of in-flight buffer
/// bookkeeping parallel to it, and the mapping strategy its buffers use.
pub struct Channel {
    id: u32,
    ring: Ring,
    /// 1:1 indexed with `ring`'s slots; `Some` for a slot holding a
    /// transfer the device has not yet completed.
    shadow: Vec<Option<PendingTransfer>>,
    mapper: Box<dyn BufferMapper>,
    doorbell: Doorbell,
    state: ChannelState,
    /// Pre-alloc channels are refilled by the core rather than a client
    /// queuing individual receive buffers.
    pre_alloc: bool,
    /// Buffer size the core allocates on each [`Channel::refill`] call.
    /// Only meaningful when `pre_alloc` is set.
    prealloc_buffer_size: Option<usize>,
}

impl Channel {
    /// Creates a new, disabled channel over `ring`.
    pub fn new(id: u32, ring: Ring, mapper: Box<dyn BufferMapper>, doorbell: Doorbell, pre_alloc: bool) -> Self {
        let capacity = ring.capacity();
        Channel {
            id,
            ring,
            shadow: (0..capacity).map(|_| None).collect(),
            mapper,
            doorbell,
            state: ChannelState::Disabled,
            pre_alloc,
            prealloc_buffer_size: None,
        }
    }

    /// Configures the buffer size [`Channel::refill`] allocates. Only
    /// meaningful for a channel created with `pre_alloc = true`.
    pub fn with_prealloc_buffer_size(mut self, buffer_size: usize) -> Self {
        self.prealloc_buffer_size = Some(buffer_size);
        self
    }

    /// This channel's id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether this is a pre-alloc (core-refilled) channel.
    pub fn is_pre_alloc(&self) -> bool {
        self.pre_alloc
    }

    /// Free descriptor slots on this channel's transfer ring.
    pub fn available_descriptors(&self) -> usize {
        self.ring.available()
    }

    /// Applies a channel-state-machine command, returning the new state.
    /// `Reset` additionally clears the ring and hands every in-flight
    /// transfer back unfulfilled, matching `mhi_reset_data_chan`.
    pub fn apply_command(&mut self, command: ChannelCommand) -> MhiResult<ChannelState> {
        let new_state = self.state.apply(command)?;
        if matches!(command, ChannelCommand::Reset) {
            self.reset();
        }
        self.state = new_state;
        Ok(new_state)
    }

    fn reset(&mut self) {
        let stranded = self.shadow.iter_mut().filter(|s| s.is_some()).count();
        if stranded > 0 {
            warn!(channel = self.id, stranded, "resetting channel with in-flight transfers");
        }
        for slot in self.shadow.iter_mut() {
            *slot = None;
        }
        self.ring.advance_both_to(0);
    }

    /// Queues `buf` for transfer, returning the device-visible pointer the
    /// TRE was written at. `flags` is a bitwise-or of [`data_flags`]
    /// constants (callers typically set `IEOT`, add `CHAIN`/clear it for
    /// scatter/gather).
    ///
    /// Rejected on a pre-alloc channel: §4.5 step 1 reserves buffer
    /// submission on those channels to the core itself (see
    /// [`Channel::refill`]).
    pub fn queue_buf(&mut self, buf: Buffer, flags: u32) -> MhiResult<u64> {
        if self.pre_alloc {
            return Err(MhiError::InvalidArgument(format!(
                "channel {} is pre-alloc; the core owns buffer submission",
                self.id
            )));
        }
        self.enqueue_buffer(buf, flags)
    }

    /// Allocates and queues a fresh receive buffer on a pre-alloc channel,
    /// the way `prepare_channel` and post-completion recycle do in the
    /// reference driver. Returns the device-visible pointer of the TRE
    /// written.
    pub fn refill(&mut self) -> MhiResult<u64> {
        let size = self.prealloc_buffer_size.ok_or_else(|| {
            MhiError::InvalidArgument(format!("channel {} has no configured pre-alloc buffer size", self.id))
        })?;
        self.enqueue_buffer(Buffer::new(vec![0u8; size], Direction::FromDevice, 0), data_flags::IEOT)
    }

    fn enqueue_buffer(&mut self, buf: Buffer, flags: u32) -> MhiResult<u64> {
        if !self.state.accepts_submissions() {
            return Err(MhiError::Disconnected {
                channel_id: self.id,
                reason: format!("channel is {:?}", self.state),
            });
        }
        if self.ring.is_full() {
            return Err(MhiError::NoMemory {
                channel_id: self.id,
                reason: "transfer ring full".into(),
            });
        }
        let length = buf.data.len() as u32;
        if length > DataTre::MAX_LENGTH {
            return Err(MhiError::Overflow(format!(
                "buffer length {length} exceeds max TRE length"
            )));
        }

        let index = self.ring.write_index();
        let pending = self.mapper.prepare(buf)?;
        let tre = DataTre {
            buffer_ptr: pending.device_ptr(),
            length,
            flags: flags | data_flags::IEOT,
        };
        let ptr = self.ring.enqueue(tre.to_bytes())?;
        self.shadow[index] = Some(pending);
        debug!(channel = self.id, index, length, "queued buffer");
        Ok(ptr)
    }

    /// Rings this channel's doorbell with its current write pointer,
    /// notifying the device that new TREs are available.
    pub fn ring_doorbell(&mut self, io: &dyn RegisterIo) -> MhiResult<()> {
        let wp_ptr = self.ring.index_to_device_ptr(self.ring.write_index());
        self.doorbell.ring(io, wp_ptr)
    }

    /// Re-arms this channel's doorbell burst-mode latch; called when an
    /// `Oob`/`DbMode` event arrives for this channel.
    pub fn rearm_doorbell(&mut self) {
        self.doorbell.rearm();
    }

    /// Retires every shadow-ring slot from the current read pointer through
    /// (and including) the slot addressed by `tre_ptr`, handling chained
    /// transfers where one completion event covers several TREs.
    ///
    /// `event_len` is the length the completion event carried; per §4.4 it
    /// applies only to the *last* TRE in the chain — earlier TREs report
    /// their own full buffer length. Returns `(buffer, bytes_transferred)`
    /// pairs in completion order, ready to be handed back to the client.
    pub fn retire_through(&mut self, tre_ptr: u64, event_len: u32) -> MhiResult<Vec<(Buffer, u32)>> {
        let target = self.ring.device_ptr_to_index(tre_ptr)?;
        let mut results = Vec::new();
        loop {
            let current = self.ring.read_index();
            let pending = self.shadow[current].take().ok_or_else(|| {
                MhiError::Protocol(format!(
                    "completion for channel {} index {current} with no pending transfer",
                    self.id
                ))
            })?;
            let buf_len = pending.original.data.len() as u32;
            self.ring.dequeue()?;
            let is_last = current == target;
            let transferred = if is_last { buf_len.min(event_len) } else { buf_len };
            results.push((self.mapper.retire(pending)?, transferred));
            if is_last {
                break;
            }
        }
        Ok(results)
    }

    /// Retires a single resource-constrained (pre-alloc) completion
    /// addressed by `cookie`, which indexes the shadow ring directly rather
    /// than naming a TRE pointer (§4.4 `parse_rsc_event`). The device may
    /// complete out of order within its in-flight window; the local read
    /// pointer still advances by exactly one per event, since the device
    /// guarantees in-order *consumption* of descriptors even when reporting
    /// completions on a different one.
    pub fn retire_rsc(&mut self, cookie: u64, event_len: u32) -> MhiResult<(Buffer, u32)> {
        let index = cookie as usize;
        let pending = self.shadow.get_mut(index).and_then(Option::take).ok_or_else(|| {
            MhiError::Protocol(format!(
                "RSC completion for channel {} cookie {cookie} with no pending transfer",
                self.id
            ))
        })?;
        let buf_len = pending.original.data.len() as u32;
        self.ring.dequeue()?;
        let transferred = buf_len.min(event_len);
        Ok((self.mapper.retire(pending)?, transferred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferMapper, Direction, IommuMapper};
    use crate::register::{DoorbellMode, FakeRegisterFile};

    struct IdentityMapper;
    impl IommuMapper for IdentityMapper {
        fn map(&mut self, _len: usize, _direction: Direction) -> MhiResult<u64> {
            Ok(0x9000)
        }
        fn unmap(&mut self, _device_ptr: u64, _len: usize) {}
    }

    fn direct_mapper() -> Box<dyn BufferMapper> {
        Box::new(crate::buffer::DirectMapper::new(Box::new(IdentityMapper)))
    }

    fn new_channel(num_elements: usize) -> Channel {
        let ring = Ring::new("chan", num_elements, 0x5000);
        let doorbell = Doorbell::new(0x200, DoorbellMode::Disabled);
        Channel::new(7, ring, direct_mapper(), doorbell, false)
    }

    #[test]
    fn queue_buf_rejected_when_disabled() {
        let mut chan = new_channel(4);
        let buf = Buffer::new(vec![1], Direction::ToDevice, 1);
        assert!(matches!(chan.queue_buf(buf, 0), Err(MhiError::Disconnected { .. })));
    }

    #[test]
    fn queue_buf_and_retire_round_trip() {
        let mut chan = new_channel(4);
        chan.apply_command(ChannelCommand::Start).unwrap();

        let buf = Buffer::new(vec![1, 2, 3], Direction::ToDevice, 55);
        let ptr = chan.queue_buf(buf, 0).unwrap();

        let retired = chan.retire_through(ptr, 3).unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].0.client_token, 55);
        assert_eq!(retired[0].1, 3);
        assert_eq!(chan.available_descriptors(), 3);
    }

    #[test]
    fn retire_through_truncates_last_tre_to_event_length() {
        let mut chan = new_channel(4);
        chan.apply_command(ChannelCommand::Start).unwrap();
        let buf = Buffer::new(vec![0u8; 96], Direction::ToDevice, 1);
        let ptr = chan.queue_buf(buf, 0).unwrap();
        let retired = chan.retire_through(ptr, 64).unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].1, 64);
    }

    #[test]
    fn pre_alloc_channel_rejects_direct_submission() {
        let ring = Ring::new("chan", 4, 0x5000);
        let doorbell = Doorbell::new(0x200, DoorbellMode::Disabled);
        let mut chan = Channel::new(7, ring, direct_mapper(), doorbell, true).with_prealloc_buffer_size(64);
        chan.apply_command(ChannelCommand::Start).unwrap();
        assert!(matches!(
            chan.queue_buf(Buffer::new(vec![1], Direction::ToDevice, 1), 0),
            Err(MhiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn refill_queues_a_fresh_buffer_on_a_prealloc_channel() {
        let ring = Ring::new("chan", 4, 0x5000);
        let doorbell = Doorbell::new(0x200, DoorbellMode::Disabled);
        let mut chan = Channel::new(7, ring, direct_mapper(), doorbell, true).with_prealloc_buffer_size(64);
        chan.apply_command(ChannelCommand::Start).unwrap();
        let ptr = chan.refill().unwrap();
        let (buf, _) = chan.retire_rsc(0, 32).unwrap();
        assert_eq!(buf.data.len(), 64);
        let _ = ptr;
    }

    #[test]
    fn retire_rsc_advances_rp_by_one_regardless_of_cookie_order() {
        let ring = Ring::new("chan", 4, 0x5000);
        let doorbell = Doorbell::new(0x200, DoorbellMode::Disabled);
        let mut chan = Channel::new(7, ring, direct_mapper(), doorbell, true).with_prealloc_buffer_size(16);
        chan.apply_command(ChannelCommand::Start).unwrap();
        chan.refill().unwrap();
        chan.refill().unwrap();
        // device completes cookie 1 before cookie 0
        let (_, len1) = chan.retire_rsc(1, 16).unwrap();
        assert_eq!(len1, 16);
        assert_eq!(chan.available_descriptors(), 2);
        let (_, len0) = chan.retire_rsc(0, 8).unwrap();
        assert_eq!(len0, 8);
        assert_eq!(chan.available_descriptors(), 3);
    }

    #[test]
    fn reset_clears_in_flight_transfers_and_ring_position() {
        let mut chan = new_channel(4);
        chan.apply_command(ChannelCommand::Start).unwrap();
        chan.queue_buf(Buffer::new(vec![0], Direction::ToDevice, 1), 0).unwrap();
        assert_eq!(chan.apply_command(ChannelCommand::Reset).unwrap(), ChannelState::Disabled);
        assert_eq!(chan.available_descriptors(), 3);
    }

    #[test]
    fn chain_of_tres_retires_together_through_single_event() {
        let mut chan = new_channel(4);
        chan.apply_command(ChannelCommand::Start).unwrap();
        let _p1 = chan
            .queue_buf(Buffer::new(vec![1], Direction::ToDevice, 1), data_flags::CHAIN)
            .unwrap();
        let p2 = chan
            .queue_buf(Buffer::new(vec![2], Direction::ToDevice, 2), data_flags::EOB)
            .unwrap();
        let retired = chan.retire_through(p2, 1).unwrap();
        assert_eq!(retired.len(), 2);
        assert_eq!(retired[0].0.client_token, 1);
        assert_eq!(retired[1].0.client_token, 2);
        // only the last TRE in the chain is truncated to the event length
        assert_eq!(retired[0].1, 1);
        assert_eq!(retired[1].1, 1);
    }

    #[test]
    fn overlong_buffer_is_rejected() {
        let mut chan = new_channel(4);
        chan.apply_command(ChannelCommand::Start).unwrap();
        let buf = Buffer::new(vec![0u8; (DataTre::MAX_LENGTH + 1) as usize], Direction::ToDevice, 1);
        assert!(matches!(chan.queue_buf(buf, 0), Err(MhiError::Overflow(_))));
    }

    #[test]
    fn full_ring_rejects_further_submissions() {
        let mut chan = new_channel(2);
        chan.apply_command(ChannelCommand::Start).unwrap();
        chan.queue_buf(Buffer::new(vec![0], Direction::ToDevice, 1), 0).unwrap();
        assert!(matches!(
            chan.queue_buf(Buffer::new(vec![0], Direction::ToDevice, 2), 0),
            Err(MhiError::NoMemory { .. })
        ));
    }

    #[test]
    fn register_io_is_used_for_doorbell() {
        let mut chan = new_channel(4);
        chan.apply_command(ChannelCommand::Start).unwrap();
        chan.queue_buf(Buffer::new(vec![1], Direction::ToDevice, 1), 0).unwrap();
        let regs = FakeRegisterFile::new(0x1000);
        chan.ring_doorbell(&regs).unwrap();
        assert_ne!(regs.read32(0x200).unwrap(), 0);
    }
}
