//! Generic circular ring buffer shared between host and device.
//!
//! A ring is a fixed array of `num_elements` fixed-size elements. One slot is
//! always left unused so that `write_ptr == read_ptr` is unambiguously
//! "empty" and never confused with "full". The host owns a local,
//! process-virtual mirror (`local`) of the element bytes; `iommu_base` is the
//! address the *device* uses to address the same memory, needed only to
//! translate event-element pointers back to a local index and to bounds-check
//! pointers the device hands back.

use crate::error::{MhiError, MhiResult};
use crate::trb::TRE_SIZE;

/// A single MHI ring: event ring, command ring, or one channel's transfer
/// ring. Generic over nothing but the element size, which is always
/// [`TRE_SIZE`] for this transport.
#[derive(Debug)]
pub struct Ring {
    label: &'static str,
    local: Vec<[u8; TRE_SIZE]>,
    iommu_base: u64,
    num_elements: usize,
    /// Local write pointer: index of the next slot the host will populate.
    wp: usize,
    /// Local read pointer: index of the next slot the host will consume.
    rp: usize,
}

impl Ring {
    /// Creates a new, empty ring with `num_elements` slots (one of which is
    /// permanently unusable) backed by the device-visible address range
    /// starting at `iommu_base`.
    ///
    /// `label` is used only in diagnostics and error messages.
    pub fn new(label: &'static str, num_elements: usize, iommu_base: u64) -> Self {
        assert!(num_elements >= 2, "a ring needs at least 2 elements");
        Ring {
            label,
            local: vec![[0u8; TRE_SIZE]; num_elements],
            iommu_base,
            num_elements,
            wp: 0,
            rp: 0,
        }
    }

    /// Number of elements the ring can hold, including the always-empty
    /// slot.
    pub fn capacity(&self) -> usize {
        self.num_elements
    }

    /// Device-visible base address of the ring.
    pub fn iommu_base(&self) -> u64 {
        self.iommu_base
    }

    /// Device-visible address one past the last element.
    pub fn iommu_end(&self) -> u64 {
        self.iommu_base + (self.num_elements * TRE_SIZE) as u64
    }

    /// Number of elements currently queued (written but not yet consumed).
    pub fn used(&self) -> usize {
        if self.wp >= self.rp {
            self.wp - self.rp
        } else {
            self.num_elements - self.rp + self.wp
        }
    }

    /// Number of elements that can still be written before the ring is full.
    pub fn available(&self) -> usize {
        self.num_elements - 1 - self.used()
    }

    /// True if no further element can be enqueued without first dequeuing.
    pub fn is_full(&self) -> bool {
        self.available() == 0
    }

    /// True if there is nothing queued.
    pub fn is_empty(&self) -> bool {
        self.wp == self.rp
    }

    /// Local write-pointer index.
    pub fn write_index(&self) -> usize {
        self.wp
    }

    /// Local read-pointer index.
    pub fn read_index(&self) -> usize {
        self.rp
    }

    /// Writes `element` at the current write pointer and advances it,
    /// wrapping around the end of the ring. Fails if the ring is full.
    pub fn enqueue(&mut self, element: [u8; TRE_SIZE]) -> MhiResult<u64> {
        if self.is_full() {
            return Err(MhiError::NoMemory {
                channel_id: 0,
                reason: format!("ring '{}' is full", self.label),
            });
        }
        let idx = self.wp;
        self.local[idx] = element;
        let ptr = self.index_to_device_ptr(idx);
        self.wp = (self.wp + 1) % self.num_elements;
        Ok(ptr)
    }

    /// Reads the element at the current read pointer without consuming it.
    pub fn peek(&self) -> Option<[u8; TRE_SIZE]> {
        if self.is_empty() {
            None
        } else {
            Some(self.local[self.rp])
        }
    }

    /// Advances the local read pointer by one, consuming the element last
    /// returned by [`Ring::peek`]. No-op bookkeeping check: callers must not
    /// call this on an empty ring.
    pub fn dequeue(&mut self) -> MhiResult<()> {
        if self.is_empty() {
            return Err(MhiError::Protocol(format!(
                "dequeue on empty ring '{}'",
                self.label
            )));
        }
        self.rp = (self.rp + 1) % self.num_elements;
        Ok(())
    }

    /// Translates a local index into the device-visible pointer for that
    /// slot.
    pub fn index_to_device_ptr(&self, index: usize) -> u64 {
        self.iommu_base + (index * TRE_SIZE) as u64
    }

    /// Translates a device-visible pointer into a local index, validating
    /// that it lies within this ring and on an element boundary.
    ///
    /// Mirrors `is_valid_ring_ptr`/`mhi_to_virtual` from the reference
    /// driver: an out-of-range or misaligned pointer is never trusted, it is
    /// reported so the caller can abort just this processing pass.
    pub fn device_ptr_to_index(&self, ptr: u64) -> MhiResult<usize> {
        if ptr < self.iommu_base || ptr >= self.iommu_end() {
            return Err(MhiError::Io {
                ring: self.label,
                pointer: ptr,
            });
        }
        let offset = ptr - self.iommu_base;
        if offset % TRE_SIZE as u64 != 0 {
            return Err(MhiError::Io {
                ring: self.label,
                pointer: ptr,
            });
        }
        Ok((offset / TRE_SIZE as u64) as usize)
    }

    /// Reads the element at an arbitrary local index, without touching the
    /// read pointer. Used when recycling event-ring slots the device has
    /// already advanced past.
    pub fn element_at(&self, index: usize) -> [u8; TRE_SIZE] {
        self.local[index]
    }

    /// Overwrites the element at an arbitrary local index in place.
    pub fn set_element_at(&mut self, index: usize, element: [u8; TRE_SIZE]) {
        self.local[index] = element;
    }

    /// Moves both local pointers to `index`, used when the event-ring
    /// processor recycles a run of consumed slots back to the device in one
    /// step (local rp/wp move together, then get published via
    /// [`Ring::write_index`]/doorbell).
    pub fn advance_both_to(&mut self, index: usize) {
        self.wp = index;
        self.rp = index;
    }
}
