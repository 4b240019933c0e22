//! Memory-mapped buffer pool.
//!
//! The pool owns every kernel buffer mapping for one streaming session and is
//! the only code that unmaps them. Each buffer carries an ownership tag:
//!
//! ```text
//! Free --enqueue--> QueuedToKernel --dequeue--> OwnedByApplication
//!                        ^                              |
//!                        +----------- enqueue ----------+
//! ```
//!
//! Stream-off hands every buffer back as `Free`. Unmapping is only allowed
//! when all buffers are `Free`.

use std::ptr::NonNull;

use crate::device::{DequeuedBuffer, DeviceHandle, VideoBackend};
use crate::error::{CaptureError, Result};

/// Fewest buffers streaming can run with.
pub const MIN_BUFFERS: u32 = 2;

/// Who may touch a buffer right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Free,
    QueuedToKernel,
    OwnedByApplication,
}

/// One kernel buffer mapped into this process.
#[derive(Debug)]
pub struct MappedBuffer {
    index: u32,
    base: NonNull<u8>,
    capacity: usize,
    bytes_used: usize,
    ownership: Ownership,
}

impl MappedBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }
}

/// All mapped buffers of a streaming session.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<MappedBuffer>,
}

impl BufferPool {
    /// Reserve `requested` kernel buffers and map each of them.
    ///
    /// On any failure every buffer mapped so far is unmapped and the driver
    /// reservation is dropped before the error is returned. Sessions allocate
    /// through `Session::allocate_buffers`, which keeps the pool paired with
    /// its device.
    pub(crate) fn allocate<B: VideoBackend>(
        device: &mut DeviceHandle<B>,
        requested: u32,
    ) -> Result<Self> {
        if requested < MIN_BUFFERS {
            return Err(CaptureError::InsufficientBuffers {
                requested,
                granted: 0,
            });
        }
        let backend = device.backend_mut();
        let granted = backend
            .request_buffers(requested)
            .map_err(|err| CaptureError::kernel("VIDIOC_REQBUFS", &err))?;
        if granted < MIN_BUFFERS {
            free_reservation(backend);
            return Err(CaptureError::InsufficientBuffers { requested, granted });
        }

        let mut pool = Self {
            buffers: Vec::with_capacity(granted as usize),
        };
        for index in 0..granted {
            if let Err(err) = pool.map_one(backend, index) {
                pool.unmap_all(backend);
                free_reservation(backend);
                return Err(err);
            }
        }

        log::info!(
            "BufferPool: mapped {} buffers of {} bytes on {}",
            pool.len(),
            pool.buffers.first().map(|b| b.capacity).unwrap_or(0),
            device.path()
        );
        Ok(pool)
    }

    fn map_one<B: VideoBackend>(&mut self, backend: &mut B, index: u32) -> Result<()> {
        let layout = backend
            .query_buffer(index)
            .map_err(|err| CaptureError::kernel("VIDIOC_QUERYBUF", &err))?;
        let base = backend
            .map(index, &layout)
            .map_err(|source| CaptureError::MappingFailed { index, source })?;
        self.buffers.push(MappedBuffer {
            index,
            base,
            capacity: layout.length as usize,
            bytes_used: 0,
            ownership: Ownership::Free,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[MappedBuffer] {
        &self.buffers
    }

    pub fn ownership(&self, index: u32) -> Option<Ownership> {
        self.buffers.get(index as usize).map(|b| b.ownership)
    }

    pub fn count(&self, ownership: Ownership) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.ownership == ownership)
            .count()
    }

    fn slot(&mut self, operation: &'static str, index: u32) -> Result<&mut MappedBuffer> {
        let count = self.buffers.len();
        self.buffers.get_mut(index as usize).ok_or_else(|| {
            CaptureError::invalid_state(operation, format!("buffer {index} out of range 0..{count}"))
        })
    }

    /// Hand buffer `index` to the kernel for filling.
    pub(crate) fn enqueue<B: VideoBackend>(&mut self, backend: &mut B, index: u32) -> Result<()> {
        let slot = self.slot("enqueue", index)?;
        if slot.ownership == Ownership::QueuedToKernel {
            return Err(CaptureError::invalid_state(
                "enqueue",
                format!("buffer {index} is already queued"),
            ));
        }
        backend
            .queue(index)
            .map_err(|err| CaptureError::kernel("VIDIOC_QBUF", &err))?;
        slot.ownership = Ownership::QueuedToKernel;
        slot.bytes_used = 0;
        Ok(())
    }

    /// Queue every `Free` buffer.
    pub(crate) fn enqueue_all<B: VideoBackend>(&mut self, backend: &mut B) -> Result<()> {
        for index in 0..self.buffers.len() as u32 {
            if self.buffers[index as usize].ownership == Ownership::Free {
                self.enqueue(backend, index)?;
            }
        }
        Ok(())
    }

    /// Record a buffer the kernel just returned as filled.
    pub(crate) fn mark_dequeued(&mut self, dequeued: &DequeuedBuffer) -> Result<()> {
        let slot = self.slot("dequeue", dequeued.index)?;
        if slot.ownership != Ownership::QueuedToKernel {
            return Err(CaptureError::invalid_state(
                "dequeue",
                format!(
                    "kernel returned buffer {} in state {:?}",
                    dequeued.index, slot.ownership
                ),
            ));
        }
        slot.ownership = Ownership::OwnedByApplication;
        slot.bytes_used = (dequeued.bytes_used as usize).min(slot.capacity);
        Ok(())
    }

    /// Filled bytes of an application-owned buffer.
    pub fn bytes(&self, index: u32) -> Option<&[u8]> {
        let buffer = self.buffers.get(index as usize)?;
        if buffer.ownership != Ownership::OwnedByApplication {
            return None;
        }
        // The kernel does not write to a buffer while the application owns it,
        // and the mapping outlives every borrow of the pool.
        Some(unsafe { std::slice::from_raw_parts(buffer.base.as_ptr(), buffer.bytes_used) })
    }

    /// Stream-off returns every buffer to the application side.
    pub(crate) fn reclaim_all(&mut self) {
        for buffer in &mut self.buffers {
            buffer.ownership = Ownership::Free;
            buffer.bytes_used = 0;
        }
    }

    /// Unmap every buffer exactly once and drop the driver reservation.
    ///
    /// Refuses, leaving the pool untouched, while any buffer is queued or
    /// owned by the application. Afterwards the pool is empty.
    pub(crate) fn release<B: VideoBackend>(&mut self, device: &mut DeviceHandle<B>) -> Result<()> {
        let busy = self.len() - self.count(Ownership::Free);
        if busy > 0 {
            return Err(CaptureError::invalid_state(
                "release",
                format!("{busy} buffers still queued or owned by the application"),
            ));
        }
        let backend = device.backend_mut();
        let failure = self.unmap_all(backend);
        free_reservation(backend);
        log::info!("BufferPool: released buffers on {}", device.path());
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Unmap everything, continuing past failures. Returns the first failure.
    fn unmap_all<B: VideoBackend>(&mut self, backend: &mut B) -> Option<CaptureError> {
        let mut first = None;
        for buffer in self.buffers.drain(..) {
            debug_assert_eq!(buffer.ownership, Ownership::Free);
            if let Err(err) = unsafe { backend.unmap(buffer.base, buffer.capacity) } {
                log::error!("BufferPool: munmap of buffer {} failed: {}", buffer.index, err);
                first.get_or_insert_with(|| CaptureError::kernel("munmap", &err));
            }
        }
        first
    }
}

fn free_reservation<B: VideoBackend>(backend: &mut B) {
    if let Err(err) = backend.request_buffers(0) {
        log::warn!("BufferPool: freeing driver buffers failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{StubBackend, StubConfig};
    use crate::format::{negotiate, FormatRequest};

    fn configured(config: StubConfig) -> (DeviceHandle<StubBackend>, crate::device::StubLedger) {
        let backend = StubBackend::new(config);
        let ledger = backend.ledger();
        let mut device = DeviceHandle::open_with(backend, "stub://pool").expect("open stub");
        negotiate(&mut device, &FormatRequest::default()).expect("negotiate");
        (device, ledger)
    }

    #[test]
    fn maps_exactly_what_was_granted() -> Result<()> {
        for requested in 2..=6 {
            let (mut device, ledger) = configured(StubConfig::default());
            let mut pool = BufferPool::allocate(&mut device, requested)?;
            assert_eq!(pool.len(), requested as usize);
            assert_eq!(ledger.live_mappings(), requested as usize);
            assert_eq!(pool.count(Ownership::Free), requested as usize);
            pool.release(&mut device)?;
            assert!(pool.is_empty());
            assert_eq!(ledger.live_mappings(), 0);
        }
        Ok(())
    }

    #[test]
    fn failed_mapping_leaves_nothing_mapped() {
        let (mut device, ledger) = configured(StubConfig {
            fail_map_at: Some(2),
            ..StubConfig::default()
        });
        let err = BufferPool::allocate(&mut device, 4).expect_err("mapping must fail");
        assert!(matches!(err, CaptureError::MappingFailed { index: 2, .. }));
        assert_eq!(ledger.maps(), 2);
        assert_eq!(ledger.unmaps(), 2);
        assert_eq!(ledger.live_mappings(), 0);
    }

    #[test]
    fn too_few_granted_is_insufficient() {
        let (mut device, ledger) = configured(StubConfig {
            max_buffers: 1,
            ..StubConfig::default()
        });
        let err = BufferPool::allocate(&mut device, 4).expect_err("grant too small");
        assert!(matches!(
            err,
            CaptureError::InsufficientBuffers {
                requested: 4,
                granted: 1
            }
        ));
        assert_eq!(ledger.live_mappings(), 0);
    }

    #[test]
    fn fewer_than_two_requested_is_rejected_up_front() {
        let (mut device, ledger) = configured(StubConfig::default());
        let err = BufferPool::allocate(&mut device, 1).expect_err("one buffer is not enough");
        assert!(matches!(err, CaptureError::InsufficientBuffers { .. }));
        assert_eq!(ledger.maps(), 0);
    }

    #[test]
    fn ownership_follows_the_protocol() -> Result<()> {
        let (mut device, _ledger) = configured(StubConfig::default());
        let mut pool = BufferPool::allocate(&mut device, 2)?;

        pool.enqueue(device.backend_mut(), 0)?;
        assert_eq!(pool.ownership(0), Some(Ownership::QueuedToKernel));
        assert!(pool.bytes(0).is_none());

        let again = pool.enqueue(device.backend_mut(), 0);
        assert!(matches!(again, Err(CaptureError::InvalidState { .. })));

        pool.enqueue(device.backend_mut(), 1)?;
        device.backend_mut().stream_on().map_err(|e| CaptureError::kernel("on", &e))?;
        let dequeued = device
            .backend_mut()
            .dequeue()
            .map_err(|e| CaptureError::kernel("dq", &e))?;
        pool.mark_dequeued(&dequeued)?;
        assert_eq!(pool.ownership(dequeued.index), Some(Ownership::OwnedByApplication));
        assert_eq!(pool.bytes(dequeued.index).map(<[u8]>::len), Some(640 * 480 * 2));

        pool.enqueue(device.backend_mut(), dequeued.index)?;
        assert_eq!(pool.count(Ownership::QueuedToKernel), 2);
        Ok(())
    }

    #[test]
    fn release_refuses_while_buffers_are_queued() -> Result<()> {
        let (mut device, ledger) = configured(StubConfig::default());
        let mut pool = BufferPool::allocate(&mut device, 3)?;
        pool.enqueue_all(device.backend_mut())?;

        let err = pool.release(&mut device).expect_err("buffers are queued");
        assert!(matches!(err, CaptureError::InvalidState { .. }));
        assert_eq!(ledger.unmaps(), 0);
        assert_eq!(pool.len(), 3);

        pool.reclaim_all();
        pool.release(&mut device)?;
        pool.release(&mut device)?;
        assert_eq!(ledger.unmaps(), 3);
        Ok(())
    }
}
