//! Error types shared by the ring, channel, command and event-ring engines.

use thiserror::Error;

/// Convenience alias for fallible operations in this crate.
pub type MhiResult<T> = Result<T, MhiError>;

/// Everything that can go wrong while driving the MHI transport.
///
/// Variants map onto the error kinds a host driver has to distinguish at the
/// call site: some are recoverable in-band, others must be escalated to the
/// power-management/controller layer for a full-stack recovery.
#[derive(Debug, Error)]
pub enum MhiError {
    /// A caller passed a value that violates a documented precondition
    /// (zero-length buffer, channel id out of range, ring too small, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A ring has no free descriptor, or the host is out of bounce-buffer
    /// memory for a mapping that requires one.
    #[error("no memory available for channel {channel_id}: {reason}")]
    NoMemory {
        /// Channel the allocation was attempted for.
        channel_id: u32,
        /// Human-readable reason, e.g. "descriptor ring full".
        reason: String,
    },

    /// The device-visible read or write pointer for `ring` fell outside the
    /// ring's mapped address range. The current processing pass is aborted;
    /// the next interrupt will re-validate and may recover. Also used for
    /// the PM-error-class submission rejection in §7 (`ring: "pm"`), since
    /// that is the same "I/O error" classification the spec names rather
    /// than a dedicated variant.
    #[error("I/O error on {ring}: {pointer:#x}")]
    Io {
        /// Name of the offending ring (`"event"`, `"command"`, a channel
        /// transfer ring's label, or `"pm"` for a PM-error-class rejection).
        ring: &'static str,
        /// The invalid device-side pointer value observed, or 0 for a
        /// non-pointer I/O error.
        pointer: u64,
    },

    /// A blocking wait (command completion, channel stop) exceeded its
    /// deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The channel, or the transport as a whole, is not in a state that
    /// accepts this operation (e.g. submitting to a disabled channel).
    #[error("channel {channel_id} is disconnected: {reason}")]
    Disconnected {
        /// Channel that rejected the operation.
        channel_id: u32,
        /// Why it is unavailable.
        reason: String,
    },

    /// A 24-bit or smaller field was asked to hold a value that does not
    /// fit, or a ring was asked to hold more elements than it has room for.
    #[error("value overflows field: {0}")]
    Overflow(String),

    /// The peer violated the wire protocol in a way that cannot be handled
    /// locally (malformed TRE, out-of-order command completion, unknown
    /// event code). Callers should treat this as fatal and hand off to
    /// controller-level recovery.
    #[error("protocol violation: {0}")]
    Protocol(String),
}
