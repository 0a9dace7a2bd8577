//! The per-channel client collaborator: whatever code above this crate owns
//! a channel's data (a modem protocol driver, a diagnostics sink, ...).
//!
//! This crate never constructs a client; it is handed one per channel and
//! calls back into it as transfers complete and the channel's state
//! changes, the same shape as `usbvfiod`'s injected `MsiReceiver`/
//! `InterruptLine` collaborators.

use crate::buffer::Buffer;
use crate::state::ChannelState;
use crate::trb::EventCode;

/// Receives completions and state notifications for one channel.
pub trait Client: Send + Sync {
    /// A previously queued buffer finished transferring.
    ///
    /// `code` reports how it finished (`Success`/`Eot`/`Eob`/`Overflow`);
    /// `transferred_len` is how many bytes the device actually moved, which
    /// may be less than the buffer's length.
    fn on_transfer_complete(&mut self, channel_id: u32, code: EventCode, transferred_len: u32, buffer: Buffer);

    /// The channel's state machine transitioned, e.g. in response to a
    /// command this client's owner issued, or a local reset.
    fn on_state_change(&mut self, channel_id: u32, new_state: ChannelState);
}
