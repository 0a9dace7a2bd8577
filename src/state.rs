//! Channel state machine.
//!
//! Grounded on `mhi_update_channel_state` in the reference driver: four
//! states, five commands, and RESET always reachable regardless of the
//! current state (it is the only transition that can also originate from a
//! local failure, not just a command completion). Suspend/Resume have no
//! command-ring wire encoding in the reference driver's command set (it only
//! defines RESET/STOP/START/SFR_CFG) — they are local flow-control pauses,
//! not device round-trips, so [`Controller`](crate::controller::Controller)
//! applies them without going through the command engine.

use crate::error::MhiError;

/// A channel's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not prepared for transfer; the default state and the state every
    /// channel returns to on RESET.
    Disabled,
    /// Prepared and accepting submissions.
    Enabled,
    /// Prepared but not accepting new submissions; outstanding transfers
    /// still complete.
    Stop,
    /// Host-local pause: doorbells are withheld without a device round
    /// trip. Resumes back to `Enabled`.
    Suspended,
}

/// The command types that drive the channel state machine. `Reset` is
/// handled separately in [`ChannelState::apply`] since it is valid from any
/// state, not looked up in the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Reach ENABLED from DISABLED or STOP.
    Start,
    /// Reach STOP from ENABLED.
    Stop,
    /// Reach DISABLED from any state.
    Reset,
    /// Reach SUSPENDED from ENABLED. Local only, no command-ring round trip.
    Suspend,
    /// Reach ENABLED from SUSPENDED. Local only, no command-ring round trip.
    Resume,
}

impl ChannelState {
    /// Applies `command`, returning the new state or an error if the
    /// transition is not defined for the current state.
    pub fn apply(self, command: ChannelCommand) -> Result<ChannelState, MhiError> {
        if command == ChannelCommand::Reset {
            return Ok(ChannelState::Disabled);
        }
        match (self, command) {
            (ChannelState::Disabled, ChannelCommand::Start) => Ok(ChannelState::Enabled),
            (ChannelState::Stop, ChannelCommand::Start) => Ok(ChannelState::Enabled),
            (ChannelState::Enabled, ChannelCommand::Stop) => Ok(ChannelState::Stop),
            (ChannelState::Enabled, ChannelCommand::Suspend) => Ok(ChannelState::Suspended),
            (ChannelState::Suspended, ChannelCommand::Resume) => Ok(ChannelState::Enabled),
            (state, command) => Err(MhiError::InvalidArgument(format!(
                "no transition from {state:?} via {command:?}"
            ))),
        }
    }

    /// Whether a channel in this state accepts new buffer submissions.
    pub fn accepts_submissions(self) -> bool {
        matches!(self, ChannelState::Enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_from_disabled_and_stop_succeeds() {
        assert_eq!(
            ChannelState::Disabled.apply(ChannelCommand::Start),
            Ok(ChannelState::Enabled)
        );
        assert_eq!(ChannelState::Stop.apply(ChannelCommand::Start), Ok(ChannelState::Enabled));
    }

    #[test]
    fn stop_only_from_enabled() {
        assert_eq!(ChannelState::Enabled.apply(ChannelCommand::Stop), Ok(ChannelState::Stop));
        assert!(ChannelState::Disabled.apply(ChannelCommand::Stop).is_err());
        assert!(ChannelState::Stop.apply(ChannelCommand::Stop).is_err());
    }

    #[test]
    fn reset_always_succeeds() {
        for state in [
            ChannelState::Disabled,
            ChannelState::Enabled,
            ChannelState::Stop,
            ChannelState::Suspended,
        ] {
            assert_eq!(state.apply(ChannelCommand::Reset), Ok(ChannelState::Disabled));
        }
    }

    #[test]
    fn suspend_and_resume_round_trip() {
        assert_eq!(
            ChannelState::Enabled.apply(ChannelCommand::Suspend),
            Ok(ChannelState::Suspended)
        );
        assert_eq!(
            ChannelState::Suspended.apply(ChannelCommand::Resume),
            Ok(ChannelState::Enabled)
        );
        assert!(ChannelState::Disabled.apply(ChannelCommand::Suspend).is_err());
        assert!(ChannelState::Suspended.apply(ChannelCommand::Start).is_err());
    }

    #[test]
    fn only_enabled_accepts_submissions() {
        assert!(ChannelState::Enabled.accepts_submissions());
        assert!(!ChannelState::Disabled.accepts_submissions());
        assert!(!ChannelState::Stop.accepts_submissions());
        assert!(!ChannelState::Suspended.accepts_submissions());
    }
}
