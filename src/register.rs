//! Register and doorbell access: the narrow MMIO surface this crate touches
//! on the PCIe BAR, generalized from the `Request`/`RequestSize`
//! byte-addressed-I/O idiom used for guest-facing device emulation into a
//! trait a real PCIe BAR mapping (or a test double) implements for us.

use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::{MhiError, MhiResult};

/// Interval between register re-reads in [`poll_reg_field`]. Grounded
/// loosely in the reference driver's fixed micro-sleep poll loop
/// (`mhi_poll_reg_field`'s `udelay`-based retry).
const POLL_INTERVAL: Duration = Duration::from_micros(25);

/// Busy-waits on `offset` until `value & mask == expected`, retrying every
/// [`POLL_INTERVAL`] until `timeout` elapses.
pub fn poll_reg_field(io: &dyn RegisterIo, offset: u64, mask: u32, expected: u32, timeout: Duration) -> MhiResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let value = io.read32(offset)?;
        if value & mask == expected {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(offset, mask, expected, "register field poll timed out");
            return Err(MhiError::Timeout(format!(
                "register {offset:#x} field (mask {mask:#x}) did not reach {expected:#x}"
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Byte-addressed access to the subset of the BAR this crate needs: 32-bit
/// register reads/writes (control/status registers, context base-address
/// registers) and raw doorbell writes.
///
/// A real implementation backs this with a `memmap2`-style volatile MMIO
/// mapping; tests back it with an in-memory register file.
pub trait RegisterIo: Send + Sync {
    /// Reads a 32-bit register at `offset` bytes from the BAR base.
    fn read32(&self, offset: u64) -> MhiResult<u32>;

    /// Writes a 32-bit register at `offset` bytes from the BAR base.
    fn write32(&self, offset: u64, value: u32) -> MhiResult<()>;
}

/// Whether a doorbell suppresses redundant writes (burst mode) or always
/// writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellMode {
    /// Every ring update triggers a doorbell write.
    Disabled,
    /// Doorbell writes are suppressed once the device has indicated (via an
    /// `Oob`/`DbMode` event) that it is still processing the ring; a write
    /// only goes out once the latch has been re-armed.
    Burst,
}

/// One doorbell register pair (`offset`, `offset + 4`) plus the burst-mode
/// latch state for it.
///
/// Mirrors `mhi_ring_doorbell`/`mhi_db_brstmode` in the reference driver:
/// the 64-bit doorbell value is always written as two 32-bit stores with
/// the upper half first, and in burst mode a write is skipped unless the
/// latch is armed. Firing the doorbell disarms the latch again; an
/// `Oob`/`DbMode` event re-arms it.
#[derive(Debug)]
pub struct Doorbell {
    offset: u64,
    mode: DoorbellMode,
    armed: bool,
}

impl Doorbell {
    /// Creates a doorbell at `offset` with the given mode. Burst-mode
    /// doorbells start armed, matching the reference driver's initial
    /// `db_mode = 1` after channel start.
    pub fn new(offset: u64, mode: DoorbellMode) -> Self {
        Doorbell {
            offset,
            mode,
            armed: true,
        }
    }

    /// Re-arms a burst-mode doorbell so the next [`Doorbell::ring`] call is
    /// guaranteed to write through. Called from the event-ring processor
    /// when an `Oob`/`DbMode` event arrives. No-op for `Disabled` doorbells.
    pub fn rearm(&mut self) {
        self.armed = true;
    }

    /// Writes `value` to the doorbell register pair if this doorbell's mode
    /// allows it right now, then (for burst mode) disarms the latch.
    ///
    /// The upper 32 bits are always written before the lower 32 bits: a
    /// peer that polls after seeing the lower half written must already see
    /// a consistent upper half.
    pub fn ring(&mut self, io: &dyn RegisterIo, value: u64) -> MhiResult<()> {
        if self.mode == DoorbellMode::Burst && !self.armed {
            trace!(offset = self.offset, "doorbell write suppressed (burst mode disarmed)");
            return Ok(());
        }
        io.write32(self.offset + 4, (value >> 32) as u32)?;
        io.write32(self.offset, value as u32)?;
        if self.mode == DoorbellMode::Burst {
            self.armed = false;
        }
        trace!(offset = self.offset, value, "doorbell rung");
        Ok(())
    }
}

/// A fixed-size in-memory register file, used by tests and the demo binary
/// in place of a real BAR mapping.
#[derive(Debug)]
pub struct FakeRegisterFile {
    regs: std::sync::Mutex<Vec<u8>>,
}

impl FakeRegisterFile {
    /// Creates a zero-initialized register file of `size` bytes.
    pub fn new(size: usize) -> Self {
        FakeRegisterFile {
            regs: std::sync::Mutex::new(vec![0u8; size]),
        }
    }
}

impl RegisterIo for FakeRegisterFile {
    fn read32(&self, offset: u64) -> MhiResult<u32> {
        let regs = self.regs.lock().unwrap();
        let offset = offset as usize;
        regs.get(offset..offset + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .ok_or_else(|| MhiError::InvalidArgument(format!("register offset {offset:#x} out of range")))
    }

    fn write32(&self, offset: u64, value: u32) -> MhiResult<()> {
        let mut regs = self.regs.lock().unwrap();
        let offset = offset as usize;
        let slot = regs
            .get_mut(offset..offset + 4)
            .ok_or_else(|| MhiError::InvalidArgument(format!("register offset {offset:#x} out of range")))?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_disabled_mode_always_writes() {
        let regs = FakeRegisterFile::new(16);
        let mut db = Doorbell::new(0, DoorbellMode::Disabled);
        db.ring(&regs, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(regs.read32(0).unwrap(), 0x5566_7788);
        assert_eq!(regs.read32(4).unwrap(), 0x1122_3344);

        regs.write32(0, 0).unwrap();
        db.ring(&regs, 0xaabb_ccdd_eeff_0011).unwrap();
        assert_eq!(regs.read32(0).unwrap(), 0xeeff_0011);
    }

    #[test]
    fn doorbell_burst_mode_suppresses_after_first_ring() {
        let regs = FakeRegisterFile::new(16);
        let mut db = Doorbell::new(0, DoorbellMode::Burst);
        db.ring(&regs, 42).unwrap();
        assert_eq!(regs.read32(0).unwrap(), 42);

        regs.write32(0, 0).unwrap();
        db.ring(&regs, 99).unwrap();
        assert_eq!(regs.read32(0).unwrap(), 0, "second ring should be suppressed");

        db.rearm();
        db.ring(&regs, 99).unwrap();
        assert_eq!(regs.read32(0).unwrap(), 99);
    }

    #[test]
    fn upper_half_written_before_lower_half() {
        struct OrderRecorder {
            writes: std::sync::Mutex<Vec<u64>>,
        }
        impl RegisterIo for OrderRecorder {
            fn read32(&self, _offset: u64) -> MhiResult<u32> {
                Ok(0)
            }
            fn write32(&self, offset: u64, _value: u32) -> MhiResult<()> {
                self.writes.lock().unwrap().push(offset);
                Ok(())
            }
        }
        let recorder = OrderRecorder {
            writes: std::sync::Mutex::new(Vec::new()),
        };
        let mut db = Doorbell::new(0x100, DoorbellMode::Disabled);
        db.ring(&recorder, 1).unwrap();
        assert_eq!(*recorder.writes.lock().unwrap(), vec![0x104, 0x100]);
    }

    #[test]
    fn poll_reg_field_returns_once_value_matches() {
        let regs = FakeRegisterFile::new(16);
        regs.write32(0, 0xff).unwrap();
        poll_reg_field(&regs, 0, 0xff, 0xff, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn poll_reg_field_times_out_if_value_never_matches() {
        let regs = FakeRegisterFile::new(16);
        let result = poll_reg_field(&regs, 0, 0xff, 0x11, Duration::from_millis(5));
        assert!(matches!(result, Err(MhiError::Timeout(_))));
    }
}
