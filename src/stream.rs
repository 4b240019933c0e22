//! Streaming controller.
//!
//! Owns the device handle and the buffer pool for one session and issues the
//! enqueue, stream-on and stream-off calls against them. Dropping it tears
//! everything down in reverse order of acquisition: stream off, release the
//! pool, close the device.

use crate::device::{DeviceHandle, VideoBackend};
use crate::error::{CaptureError, Result};
use crate::pool::{BufferPool, Ownership};

pub(crate) struct StreamController<B: VideoBackend> {
    device: DeviceHandle<B>,
    pool: Option<BufferPool>,
    streaming: bool,
}

impl<B: VideoBackend> StreamController<B> {
    pub(crate) fn new(device: DeviceHandle<B>) -> Self {
        Self {
            device,
            pool: None,
            streaming: false,
        }
    }

    pub(crate) fn device(&self) -> &DeviceHandle<B> {
        &self.device
    }

    pub(crate) fn device_mut(&mut self) -> &mut DeviceHandle<B> {
        &mut self.device
    }

    pub(crate) fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    pub(crate) fn pool_mut(&mut self, operation: &'static str) -> Result<&mut BufferPool> {
        self.pool
            .as_mut()
            .ok_or_else(|| CaptureError::invalid_state(operation, "no buffers allocated"))
    }

    pub(crate) fn allocate(&mut self, count: u32) -> Result<()> {
        if self.pool.is_some() {
            return Err(CaptureError::invalid_state(
                "allocate_buffers",
                "buffers already allocated",
            ));
        }
        self.pool = Some(BufferPool::allocate(&mut self.device, count)?);
        Ok(())
    }

    pub(crate) fn enqueue_all(&mut self) -> Result<()> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| CaptureError::invalid_state("enqueue_all", "no buffers allocated"))?;
        pool.enqueue_all(self.device.backend_mut())
    }

    pub(crate) fn requeue(&mut self, index: u32) -> Result<()> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| CaptureError::invalid_state("release_frame", "no buffers allocated"))?;
        pool.enqueue(self.device.backend_mut(), index)
    }

    /// Turn capture on. Every allocated buffer must already be queued.
    pub(crate) fn start(&mut self) -> Result<()> {
        let pool = self.pool_mut("start_streaming")?;
        let queued = pool.count(Ownership::QueuedToKernel);
        if queued == 0 || queued != pool.len() {
            return Err(CaptureError::invalid_state(
                "start_streaming",
                format!("{queued} of {} buffers queued", pool.len()),
            ));
        }
        self.device
            .backend_mut()
            .stream_on()
            .map_err(|err| CaptureError::kernel("VIDIOC_STREAMON", &err))?;
        self.streaming = true;
        log::info!(
            "StreamController: streaming on {} with {} buffers",
            self.device.path(),
            queued
        );
        Ok(())
    }

    /// Halt capture. The kernel gives every buffer back.
    ///
    /// Also issued when streaming never started but buffers were queued,
    /// since stream-off is what drains the kernel's queues.
    pub(crate) fn stop(&mut self) -> Result<()> {
        let handed_out = self
            .pool
            .as_ref()
            .map_or(0, |pool| pool.len() - pool.count(Ownership::Free));
        if !self.streaming && handed_out == 0 {
            return Ok(());
        }
        self.device
            .backend_mut()
            .stream_off()
            .map_err(|err| CaptureError::kernel("VIDIOC_STREAMOFF", &err))?;
        self.streaming = false;
        if let Some(pool) = self.pool.as_mut() {
            pool.reclaim_all();
        }
        log::info!("StreamController: streaming off on {}", self.device.path());
        Ok(())
    }

    /// Unmap and free the pool. Streaming must be off.
    pub(crate) fn release_pool(&mut self) -> Result<()> {
        if self.streaming {
            return Err(CaptureError::invalid_state(
                "release",
                "streaming is still on",
            ));
        }
        let Some(pool) = self.pool.as_mut() else {
            return Ok(());
        };
        let result = pool.release(&mut self.device);
        if pool.is_empty() {
            self.pool = None;
        }
        result
    }

    fn teardown(&mut self) -> Result<()> {
        let stopped = self.stop();
        let released = self.release_pool();
        stopped.and(released)
    }

    /// Tear down and close the device, reporting the first failure.
    pub(crate) fn close(mut self) -> Result<()> {
        let torn_down = self.teardown();
        let closed = self.device.close();
        torn_down.and(closed)
    }
}

impl<B: VideoBackend> Drop for StreamController<B> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            log::error!("StreamController: teardown of {} failed: {}", self.device.path(), err);
        }
    }
}
