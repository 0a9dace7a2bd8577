//! Buffer mapping strategies for channel transfers.
//!
//! A client hands a [`Buffer`] to a channel; before a [`crate::trb::DataTre`]
//! can be posted it needs a device-visible address. Two strategies exist,
//! mirroring `mhi_map_single_no_bb`/`mhi_map_single_use_bb` in the reference
//! driver: map the buffer directly via an IOMMU collaborator, or bounce it
//! through a pre-allocated coherent shadow buffer. A buffer the client
//! already addressed in device-visible terms (`pre_mapped`) skips mapping
//! entirely.

use tracing::warn;

use crate::error::{MhiError, MhiResult};

/// Direction of a transfer relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host writes, device reads.
    ToDevice,
    /// Device writes, host reads.
    FromDevice,
}

/// A client-owned buffer submitted for transfer.
#[derive(Debug)]
pub struct Buffer {
    /// Buffer contents. For `ToDevice` this is filled in by the client
    /// before submission; for `FromDevice` it is overwritten by the time the
    /// completion callback fires.
    pub data: Vec<u8>,
    /// Transfer direction.
    pub direction: Direction,
    /// Opaque value the client gets back unchanged in the completion
    /// callback, e.g. a request id.
    pub client_token: u64,
    /// If `true`, `data`'s address is already device-visible and mapping is
    /// skipped; `device_ptr` must be set in that case.
    pub pre_mapped: bool,
    /// Required when `pre_mapped` is `true`; ignored otherwise.
    pub device_ptr: u64,
}

impl Buffer {
    /// A normal buffer that needs mapping before it can be posted.
    pub fn new(data: Vec<u8>, direction: Direction, client_token: u64) -> Self {
        Buffer {
            data,
            direction,
            client_token,
            pre_mapped: false,
            device_ptr: 0,
        }
    }

    /// A buffer the client has already made device-visible at `device_ptr`.
    pub fn pre_mapped(data: Vec<u8>, direction: Direction, client_token: u64, device_ptr: u64) -> Self {
        Buffer {
            data,
            direction,
            client_token,
            pre_mapped: true,
            device_ptr,
        }
    }
}

/// A buffer that has been mapped and is awaiting retirement once its TRE
/// completes. Lives in the buffer-info shadow ring entry alongside the TRE
/// it corresponds to.
#[derive(Debug)]
pub struct PendingTransfer {
    /// The buffer as the client submitted it, minus any ownership the
    /// mapper needed to take (the shadow copy, if bounced).
    pub original: Buffer,
    device_ptr: u64,
    shadow: Option<Vec<u8>>,
}

impl PendingTransfer {
    /// Device-visible address this transfer was posted at.
    pub fn device_ptr(&self) -> u64 {
        self.device_ptr
    }
}

/// Maps/unmaps buffers for transfer. Implementations correspond to the two
/// mapping strategies a channel can be configured with.
pub trait BufferMapper: Send + Sync {
    /// Makes `buf` device-visible, returning the device-visible pointer to
    /// hand to [`crate::trb::DataTre`] and the bookkeeping needed to retire
    /// it later.
    fn prepare(&mut self, buf: Buffer) -> MhiResult<PendingTransfer>;

    /// Reverses [`BufferMapper::prepare`] once the transfer has completed,
    /// returning the buffer to the client with `FromDevice` data filled in.
    fn retire(&mut self, pending: PendingTransfer) -> MhiResult<Buffer>;
}

/// Collaborator that performs the actual host IOMMU mapping for
/// [`DirectMapper`]. A real implementation wraps the platform's DMA API;
/// tests use a no-op bump allocator.
pub trait IommuMapper: Send + Sync {
    /// Maps `len` bytes for `direction`, returning a device-visible address.
    fn map(&mut self, len: usize, direction: Direction) -> MhiResult<u64>;
    /// Releases a mapping previously returned by [`IommuMapper::map`].
    fn unmap(&mut self, device_ptr: u64, len: usize);
}

/// Maps each transfer's buffer directly through an [`IommuMapper`]; no copy
/// is made. Fails with [`MhiError::NoMemory`] if the IOMMU has no room,
/// exactly as the reference driver's `no_bb` path does.
pub struct DirectMapper {
    iommu: Box<dyn IommuMapper>,
}

impl DirectMapper {
    /// Creates a direct mapper backed by `iommu`.
    pub fn new(iommu: Box<dyn IommuMapper>) -> Self {
        DirectMapper { iommu }
    }
}

impl BufferMapper for DirectMapper {
    fn prepare(&mut self, buf: Buffer) -> MhiResult<PendingTransfer> {
        if buf.pre_mapped {
            return Ok(PendingTransfer {
                device_ptr: buf.device_ptr,
                shadow: None,
                original: buf,
            });
        }
        let device_ptr = self.iommu.map(buf.data.len(), buf.direction)?;
        Ok(PendingTransfer {
            device_ptr,
            shadow: None,
            original: buf,
        })
    }

    fn retire(&mut self, pending: PendingTransfer) -> MhiResult<Buffer> {
        if !pending.original.pre_mapped {
            self.iommu.unmap(pending.device_ptr, pending.original.data.len());
        }
        Ok(pending.original)
    }
}

/// Bounces every transfer through a pre-allocated coherent shadow region
/// instead of mapping the client's own buffer. Used when the platform
/// cannot map arbitrary client memory (e.g. it is not DMA-coherent).
pub struct BounceMapper {
    next_addr: u64,
    region_end: u64,
}

impl BounceMapper {
    /// Creates a bounce mapper that hands out shadow addresses starting at
    /// `region_base` and never exceeding `region_base + region_size`.
    pub fn new(region_base: u64, region_size: u64) -> Self {
        BounceMapper {
            next_addr: region_base,
            region_end: region_base + region_size,
        }
    }

    fn allocate(&mut self, len: usize) -> MhiResult<u64> {
        let addr = self.next_addr;
        let end = addr
            .checked_add(len as u64)
            .ok_or_else(|| MhiError::Overflow("bounce buffer address overflow".into()))?;
        if end > self.region_end {
            return Err(MhiError::NoMemory {
                channel_id: 0,
                reason: "bounce buffer region exhausted".into(),
            });
        }
        self.next_addr = end;
        Ok(addr)
    }
}

impl BufferMapper for BounceMapper {
    fn prepare(&mut self, buf: Buffer) -> MhiResult<PendingTransfer> {
        if buf.pre_mapped {
            warn!("pre-mapped buffer submitted to a bounce-mapped channel; skipping bounce copy");
            return Ok(PendingTransfer {
                device_ptr: buf.device_ptr,
                shadow: None,
                original: buf,
            });
        }
        let device_ptr = self.allocate(buf.data.len())?;
        let mut shadow = vec![0u8; buf.data.len()];
        if buf.direction == Direction::ToDevice {
            shadow.copy_from_slice(&buf.data);
        }
        Ok(PendingTransfer {
            device_ptr,
            shadow: Some(shadow),
            original: buf,
        })
    }

    fn retire(&mut self, pending: PendingTransfer) -> MhiResult<Buffer> {
        let PendingTransfer {
            mut original,
            shadow,
            ..
        } = pending;
        if let Some(shadow) = shadow {
            if original.direction == Direction::FromDevice {
                original.data.copy_from_slice(&shadow);
            }
        }
        Ok(original)
    }
}
