//! Wire layout of the 16-byte ring elements: transfer/command TREs on the
//! host-writable rings, and event elements on the device-writable event
//! ring.
//!
//! Every element is a `[u32; 4]` little-endian quadword pair, matching the
//! shared-memory layout a real MHI peripheral expects. Encoding/decoding
//! lives here so the ring and engine modules never touch raw bytes.

/// Size in bytes of every ring element, transfer or event.
pub const TRE_SIZE: usize = 16;

/// Flag bits carried in a data TRE's word 3 (see `DataTre::flags`).
pub mod data_flags {
    /// Block Event Interrupt: suppress the completion event for this TRE
    /// unless an error occurs.
    pub const BEI: u32 = 1 << 0;
    /// Interrupt on Completion / End Of Transfer: request a completion
    /// event once this TRE retires.
    pub const IEOT: u32 = 1 << 1;
    /// End Of Block: the last TRE of a chained scatter/gather transfer.
    pub const EOB: u32 = 1 << 2;
    /// Chain: more TREs belonging to the same transfer follow.
    pub const CHAIN: u32 = 1 << 3;
}

/// A host-to-device data transfer descriptor, written into a channel's
/// transfer ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTre {
    /// Device-visible address of the buffer this TRE describes.
    pub buffer_ptr: u64,
    /// Length of the buffer in bytes (24-bit field: at most `0xff_ffff`).
    pub length: u32,
    /// Bitwise-or of the `data_flags` constants.
    pub flags: u32,
}

impl DataTre {
    /// Maximum length a single data TRE can describe.
    pub const MAX_LENGTH: u32 = 0x00ff_ffff;

    /// Encodes this TRE into its 16-byte wire representation.
    pub fn to_bytes(self) -> [u8; TRE_SIZE] {
        let mut bytes = [0u8; TRE_SIZE];
        bytes[0..8].copy_from_slice(&self.buffer_ptr.to_le_bytes());
        bytes[8..12].copy_from_slice(&(self.length & Self::MAX_LENGTH).to_le_bytes());
        bytes[12..16].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }

    /// Decodes a TRE previously written by [`DataTre::to_bytes`].
    pub fn from_bytes(bytes: [u8; TRE_SIZE]) -> Self {
        DataTre {
            buffer_ptr: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            length: u32::from_le_bytes(bytes[8..12].try_into().unwrap()) & Self::MAX_LENGTH,
            flags: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }
}

/// A command issued on the single primary command ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTre {
    /// Tear the channel down to the DISABLED state unconditionally.
    Reset {
        /// Target channel.
        channel_id: u32,
    },
    /// Transition an ENABLED channel to STOP.
    Stop {
        /// Target channel.
        channel_id: u32,
    },
    /// Transition a channel from STOP/DISABLED to ENABLED.
    Start {
        /// Target channel.
        channel_id: u32,
    },
    /// Vendor/system-failure-reason configuration command. Channel-agnostic;
    /// always addressed to channel 0.
    SfrConfig {
        /// Opaque configuration payload understood by the peer.
        payload: u32,
    },
}

mod cmd_type {
    pub const RESET: u32 = 16;
    pub const STOP: u32 = 17;
    pub const START: u32 = 18;
    pub const SFR_CFG: u32 = 23;
}

impl CommandTre {
    /// Channel id this command is addressed to; `SfrConfig` is always 0.
    pub fn channel_id(&self) -> u32 {
        match *self {
            CommandTre::Reset { channel_id }
            | CommandTre::Stop { channel_id }
            | CommandTre::Start { channel_id } => channel_id,
            CommandTre::SfrConfig { .. } => 0,
        }
    }

    /// Encodes this command into its 16-byte wire representation.
    pub fn to_bytes(self) -> [u8; TRE_SIZE] {
        let mut bytes = [0u8; TRE_SIZE];
        let (cmd_type, chan, payload) = match self {
            CommandTre::Reset { channel_id } => (cmd_type::RESET, channel_id, 0),
            CommandTre::Stop { channel_id } => (cmd_type::STOP, channel_id, 0),
            CommandTre::Start { channel_id } => (cmd_type::START, channel_id, 0),
            CommandTre::SfrConfig { payload } => (cmd_type::SFR_CFG, 0, payload),
        };
        bytes[8..12].copy_from_slice(&payload.to_le_bytes());
        bytes[12..16].copy_from_slice(&cmd_type.to_le_bytes());
        bytes[4..8].copy_from_slice(&chan.to_le_bytes());
        bytes
    }

    /// Decodes a command previously written by [`CommandTre::to_bytes`].
    pub fn from_bytes(bytes: [u8; TRE_SIZE]) -> Option<Self> {
        let chan = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let payload = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let cmd_type = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        Some(match cmd_type {
            cmd_type::RESET => CommandTre::Reset { channel_id: chan },
            cmd_type::STOP => CommandTre::Stop { channel_id: chan },
            cmd_type::START => CommandTre::Start { channel_id: chan },
            cmd_type::SFR_CFG => CommandTre::SfrConfig { payload },
            _ => return None,
        })
    }
}

/// Completion status carried by every event element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    /// The operation completed without incident.
    Success = 0,
    /// A transfer finished exactly at a TRE marked `IEOT`.
    Eot = 1,
    /// A chained transfer's last TRE (`EOB`) retired.
    Eob = 2,
    /// The device produced more data than the posted buffer could hold.
    Overflow = 3,
    /// The transfer completed out-of-band (e.g. the peer stopped early).
    Oob = 4,
    /// The device is requesting the host re-arm doorbell mode.
    DbMode = 5,
    /// The device rejected a TRE as malformed.
    BadTre = 6,
}

impl EventCode {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => EventCode::Success,
            1 => EventCode::Eot,
            2 => EventCode::Eob,
            3 => EventCode::Overflow,
            4 => EventCode::Oob,
            5 => EventCode::DbMode,
            6 => EventCode::BadTre,
            _ => return None,
        })
    }
}

/// Discriminates what kind of event an [`EventElement`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A data TRE on a normal transfer ring retired.
    Tx,
    /// A data TRE on a resource-constrained (pre-alloc) channel retired.
    RscTx,
    /// A command on the command ring completed.
    CmdCompletion,
    /// The device's power-management state transitioned (M0/M1/M3/SYS_ERR).
    /// Device-wide, not scoped to a channel.
    StateChange,
    /// The device's execution environment changed (e.g. into RDDM).
    EeChange,
    /// The device is asking for a bandwidth/link adjustment.
    BwReq,
}

/// One 16-byte element on the event ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventElement {
    /// What kind of event this is.
    pub kind: EventKind,
    /// Completion status of the associated operation.
    pub code: EventCode,
    /// Channel this event concerns, for `Tx`/`RscTx`. Unused (reserved 0)
    /// for `StateChange`, which is device-wide.
    pub channel_id: u32,
    /// For `Tx`/`RscTx`: device-visible pointer to the TRE that completed.
    /// For `CmdCompletion`: pointer to the completed command TRE.
    pub pointer: u64,
    /// Transfer length actually moved (`Tx`/`RscTx`); the raw encoded
    /// `PmState` for `StateChange`; a kind-specific auxiliary value
    /// otherwise.
    pub length: u32,
}

mod event_type {
    pub const TX: u32 = 32;
    pub const RSC_TX: u32 = 33;
    pub const CMD_COMPLETION: u32 = 34;
    pub const STATE_CHANGE: u32 = 35;
    pub const EE_CHANGE: u32 = 36;
    pub const BW_REQ: u32 = 37;
}

impl EventElement {
    /// Encodes this event into its 16-byte wire representation, for use by
    /// test doubles that emulate the peer.
    pub fn to_bytes(self) -> [u8; TRE_SIZE] {
        let mut bytes = [0u8; TRE_SIZE];
        let ev_type = match self.kind {
            EventKind::Tx => event_type::TX,
            EventKind::RscTx => event_type::RSC_TX,
            EventKind::CmdCompletion => event_type::CMD_COMPLETION,
            EventKind::StateChange => event_type::STATE_CHANGE,
            EventKind::EeChange => event_type::EE_CHANGE,
            EventKind::BwReq => event_type::BW_REQ,
        };
        bytes[0..8].copy_from_slice(&self.pointer.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.length.to_le_bytes());
        bytes[12] = self.code as u8;
        bytes[13..15].copy_from_slice(&(ev_type as u16).to_le_bytes());
        bytes[15] = self.channel_id as u8;
        bytes
    }

    /// Decodes an event element read off the event ring.
    ///
    /// Returns `None` if the event-type or completion-code fields hold a
    /// value outside the defined range; callers surface this as
    /// [`crate::error::MhiError::Protocol`].
    pub fn from_bytes(bytes: [u8; TRE_SIZE]) -> Option<Self> {
        let pointer = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let length = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let code = EventCode::from_u8(bytes[12])?;
        let ev_type = u16::from_le_bytes(bytes[13..15].try_into().unwrap()) as u32;
        let channel_id = bytes[15] as u32;
        let kind = match ev_type {
            event_type::TX => EventKind::Tx,
            event_type::RSC_TX => EventKind::RscTx,
            event_type::CMD_COMPLETION => EventKind::CmdCompletion,
            event_type::STATE_CHANGE => EventKind::StateChange,
            event_type::EE_CHANGE => EventKind::EeChange,
            event_type::BW_REQ => EventKind::BwReq,
            _ => return None,
        };
        Some(EventElement {
            kind,
            code,
            channel_id,
            pointer,
            length,
        })
    }

    /// Overwrites this event's wire bytes in place so a stale completion is
    /// seen as a harmless, unrecognized event rather than re-delivered to a
    /// client that has already torn its channel down.
    pub fn mark_stale(bytes: &mut [u8; TRE_SIZE]) {
        bytes[13..15].copy_from_slice(&0xffffu16.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_tre_roundtrip() {
        let tre = DataTre {
            buffer_ptr: 0xdead_beef_0000,
            length: 4096,
            flags: data_flags::IEOT | data_flags::CHAIN,
        };
        assert_eq!(DataTre::from_bytes(tre.to_bytes()), tre);
    }

    #[test]
    fn data_tre_length_truncated_to_24_bits() {
        let tre = DataTre {
            buffer_ptr: 0,
            length: 0xffff_ffff,
            flags: 0,
        };
        assert_eq!(DataTre::from_bytes(tre.to_bytes()).length, DataTre::MAX_LENGTH);
    }

    #[test]
    fn command_tre_roundtrip() {
        for cmd in [
            CommandTre::Reset { channel_id: 7 },
            CommandTre::Stop { channel_id: 2 },
            CommandTre::Start { channel_id: 255 },
            CommandTre::SfrConfig { payload: 0x1234 },
        ] {
            assert_eq!(CommandTre::from_bytes(cmd.to_bytes()), Some(cmd));
        }
    }

    #[test]
    fn event_element_roundtrip() {
        let ev = EventElement {
            kind: EventKind::Tx,
            code: EventCode::Eot,
            channel_id: 12,
            pointer: 0x1000,
            length: 64,
        };
        assert_eq!(EventElement::from_bytes(ev.to_bytes()), Some(ev));
    }

    #[test]
    fn mark_stale_makes_event_unrecognizable() {
        let ev = EventElement {
            kind: EventKind::Tx,
            code: EventCode::Success,
            channel_id: 0,
            pointer: 0,
            length: 0,
        };
        let mut bytes = ev.to_bytes();
        EventElement::mark_stale(&mut bytes);
        assert_eq!(EventElement::from_bytes(bytes), None);
    }
}
