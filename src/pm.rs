//! The power-management collaborator: the outermost lock in this crate's
//! concurrency hierarchy and the source of truth for whether doorbells may
//! be rung right now.
//!
//! A real implementation tracks the MHI device power state (`READY`, `M0`,
//! `M1`, `M2`, `M3`, `SYS_ERR`, ...) and the PCIe link; this crate only
//! needs to ask it two things before touching hardware: is the link up
//! enough to ring a doorbell, and what execution environment is the device
//! currently reporting.

/// Device power-management state, named after the MHI power-state
/// glossary entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmState {
    /// Device has not yet been brought up.
    Reset,
    /// Device is initialized and ready for channels to start.
    Ready,
    /// Fully active.
    M0,
    /// Device-initiated low-power idle.
    M1,
    /// Host-initiated low-power idle.
    M2,
    /// Link-down suspend.
    M3,
    /// Unrecoverable device error; only a full reset clears this.
    SysErr,
}

impl PmState {
    /// Decodes the raw power-state value carried in a `STATE_CHANGE`
    /// event's `length` field (see `original_source/...main.c:884-919`,
    /// where the event payload is the new `MHI_PM_STATE_*` value rather
    /// than a channel id). Returns `None` for a value this host doesn't
    /// recognize.
    pub fn from_raw(raw: u32) -> Option<PmState> {
        match raw {
            0 => Some(PmState::Reset),
            1 => Some(PmState::Ready),
            2 => Some(PmState::M0),
            3 => Some(PmState::M1),
            4 => Some(PmState::M2),
            5 => Some(PmState::M3),
            6 => Some(PmState::SysErr),
            _ => None,
        }
    }

    /// Encodes this state the way [`PmState::from_raw`] decodes it, for
    /// tests and the demo binary constructing `STATE_CHANGE` events.
    pub fn to_raw(self) -> u32 {
        match self {
            PmState::Reset => 0,
            PmState::Ready => 1,
            PmState::M0 => 2,
            PmState::M1 => 3,
            PmState::M2 => 4,
            PmState::M3 => 5,
            PmState::SysErr => 6,
        }
    }

    /// Whether this state is the unrecoverable error class that rejects
    /// submissions with an I/O error (§7).
    pub fn is_error(self) -> bool {
        matches!(self, PmState::SysErr)
    }
}

/// Collaborator queried before any doorbell write and notified of
/// execution-environment and power-state transitions.
///
/// Implementations must be cheap to call from the hot path (submission,
/// event dispatch): this is consulted on every doorbell ring. Named after
/// `§6`'s controller-collaborator contract: `runtime_get`/`runtime_put`
/// bracket a held wakelock the way the reference driver's PM runtime calls
/// do, `wake_toggle` nudges the link out of `M2`, and `status_cb` delivers
/// decoded `STATE_CHANGE` transitions.
pub trait PmCollaborator: Send + Sync {
    /// Current power-management state.
    fn current_state(&self) -> PmState;

    /// Whether a doorbell write is currently permitted. `false` while the
    /// link is suspended (`M3`) or the device is in `SysErr`.
    fn doorbells_allowed(&self) -> bool {
        !matches!(self.current_state(), PmState::M3 | PmState::SysErr)
    }

    /// Takes a runtime-PM reference, triggering a resume if the link is
    /// currently suspended. Called once per submission before the TRE is
    /// written (§4.5 step 3).
    fn runtime_get(&mut self);

    /// Releases the runtime-PM reference taken by a matching
    /// [`PmCollaborator::runtime_get`]. Called on every submission exit
    /// path, success or failure.
    fn runtime_put(&mut self);

    /// Nudges the link out of `M2` so a doorbell the host is about to ring
    /// is actually observed. Called unconditionally on every submission.
    fn wake_toggle(&mut self);

    /// Notifies the collaborator of a decoded device-level power-state
    /// transition carried by a `STATE_CHANGE` event.
    fn status_cb(&mut self, state: PmState);
}

/// A fixed-state collaborator for tests and the demo binary. `runtime_get`/
/// `runtime_put`/`wake_toggle` are no-ops; `status_cb` overwrites the held
/// state, mirroring what a real collaborator would do with the decoded
/// transition.
#[derive(Debug)]
pub struct StaticPm(pub PmState);

impl PmCollaborator for StaticPm {
    fn current_state(&self) -> PmState {
        self.0
    }

    fn runtime_get(&mut self) {}

    fn runtime_put(&mut self) {}

    fn wake_toggle(&mut self) {}

    fn status_cb(&mut self, state: PmState) {
        self.0 = state;
    }
}
