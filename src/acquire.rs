//! Frame acquisition.
//!
//! `wait_for_frame` blocks on device readiness for at most the given timeout,
//! dequeues one filled buffer and lends it out as a `FrameView`. The view
//! borrows the session mutably, so no second frame can be acquired until it
//! is released, and its bytes cannot outlive the release.
//!
//! Nothing here copies frame data. Consumers copy out what they need before
//! the frame is released.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::device::{DequeuedBuffer, Readiness, VideoBackend};
use crate::error::{CaptureError, Result};
use crate::format::{CaptureFormat, PixelEncoding};
use crate::session::{Session, Streaming};
use crate::stream::StreamController;

/// Default readiness wait, matching the classic capture loop.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Counters for one streaming run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub timeouts: u64,
    /// Waits cut short by a signal and retried.
    pub interruptions: u64,
}

/// What a wait timeout means to the acquisition loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// End the loop with `CaptureTimeout` on the first timeout.
    #[default]
    Fail,
    /// Keep waiting through up to `max_consecutive` timeouts in a row.
    Tolerate { max_consecutive: u32 },
}

impl TimeoutPolicy {
    /// `0` means fail on the first timeout.
    pub fn from_max_timeouts(max_consecutive: u32) -> Self {
        if max_consecutive == 0 {
            TimeoutPolicy::Fail
        } else {
            TimeoutPolicy::Tolerate { max_consecutive }
        }
    }

    pub fn tolerates(&self, consecutive: u32) -> bool {
        match self {
            TimeoutPolicy::Fail => false,
            TimeoutPolicy::Tolerate { max_consecutive } => consecutive <= *max_consecutive,
        }
    }
}

/// Settings for `Session::run`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopOptions {
    pub timeout: Duration,
    pub policy: TimeoutPolicy,
    /// Stop after this many delivered frames.
    pub frame_limit: Option<u64>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            policy: TimeoutPolicy::Fail,
            frame_limit: None,
        }
    }
}

/// Why `Session::run` returned without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    FrameLimit,
}

/// A filled buffer lent to the application.
///
/// Release it with `release`; dropping it re-enqueues the buffer as well but
/// can only log a failure.
pub struct FrameView<'a, B: VideoBackend> {
    ctl: &'a mut StreamController<B>,
    format: CaptureFormat,
    buffer: DequeuedBuffer,
    released: bool,
}

impl<'a, B: VideoBackend> FrameView<'a, B> {
    /// Exactly the bytes the driver reported as used.
    pub fn data(&self) -> &[u8] {
        self.ctl
            .pool()
            .and_then(|pool| pool.bytes(self.buffer.index))
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> &CaptureFormat {
        &self.format
    }

    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    pub fn encoding(&self) -> PixelEncoding {
        self.format.encoding
    }

    /// Pool slot backing this frame.
    pub fn index(&self) -> u32 {
        self.buffer.index
    }

    /// Driver frame counter.
    pub fn sequence(&self) -> u32 {
        self.buffer.sequence
    }

    /// Driver capture timestamp.
    pub fn timestamp(&self) -> Duration {
        self.buffer.timestamp
    }

    /// Give the buffer back to the kernel. The view is gone afterwards.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.ctl.requeue(self.buffer.index)
    }
}

impl<'a, B: VideoBackend> Drop for FrameView<'a, B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.ctl.requeue(self.buffer.index) {
            log::error!("FrameView: re-enqueue of buffer {} failed: {}", self.buffer.index, err);
        }
    }
}

impl<B: VideoBackend> Session<B, Streaming> {
    /// Block until a frame is ready or `timeout` has elapsed.
    ///
    /// A wait interrupted by a signal, or one that returns early, is retried
    /// against the same deadline, so neither surfaces as an error nor extends
    /// the wait.
    pub fn wait_for_frame(&mut self, timeout: Duration) -> Result<FrameView<'_, B>> {
        let deadline = Instant::now() + timeout;
        let buffer = loop {
            self.await_ready(deadline, timeout)?;
            match self.ctl.device_mut().backend_mut().dequeue() {
                Ok(buffer) => break buffer,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(self.timed_out(timeout));
                    }
                    log::debug!("Acquisition: readiness without a filled buffer, waiting again");
                }
                Err(err) => return Err(CaptureError::kernel("VIDIOC_DQBUF", &err)),
            }
        };
        self.ctl.pool_mut("wait_for_frame")?.mark_dequeued(&buffer)?;
        self.state.stats.frames += 1;
        Ok(FrameView {
            ctl: &mut self.ctl,
            format: self.state.format,
            buffer,
            released: false,
        })
    }

    fn await_ready(&mut self, deadline: Instant, timeout: Duration) -> Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.ctl.device_mut().backend_mut().wait_readable(remaining) {
                Ok(Readiness::Ready) => return Ok(()),
                Ok(Readiness::TimedOut) if Instant::now() >= deadline => {
                    return Err(self.timed_out(timeout));
                }
                Ok(Readiness::TimedOut) => {
                    log::debug!("Acquisition: wait returned before the deadline, waiting again");
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.state.stats.interruptions += 1;
                    log::debug!(
                        "Acquisition: wait interrupted, {:?} of {:?} left",
                        remaining,
                        timeout
                    );
                }
                Err(err) => return Err(CaptureError::kernel("poll", &err)),
            }
        }
    }

    fn timed_out(&mut self, timeout: Duration) -> CaptureError {
        self.state.stats.timeouts += 1;
        log::warn!(
            "Acquisition: no frame from {} within {:?}",
            self.ctl.device().path(),
            timeout
        );
        CaptureError::CaptureTimeout { timeout }
    }

    /// Drive the acquisition loop until cancelled, the frame limit is hit, or
    /// an error the timeout policy does not absorb.
    ///
    /// `cancel` is checked before every wait; an in-flight wait is never cut
    /// short. `on_frame` runs synchronously before the frame is released and
    /// must not keep the byte view.
    pub fn run<F>(
        &mut self,
        options: &LoopOptions,
        cancel: &AtomicBool,
        mut on_frame: F,
    ) -> Result<LoopExit>
    where
        F: FnMut(&[u8], u32, u32, PixelEncoding),
    {
        let mut delivered = 0u64;
        let mut consecutive_timeouts = 0u32;
        loop {
            if cancel.load(Ordering::SeqCst) {
                log::info!("Acquisition: cancelled after {} frames", delivered);
                return Ok(LoopExit::Cancelled);
            }
            if options.frame_limit.is_some_and(|limit| delivered >= limit) {
                return Ok(LoopExit::FrameLimit);
            }
            match self.wait_for_frame(options.timeout) {
                Ok(frame) => {
                    consecutive_timeouts = 0;
                    on_frame(frame.data(), frame.width(), frame.height(), frame.encoding());
                    frame.release()?;
                    delivered += 1;
                }
                Err(err) if err.is_recoverable() => {
                    consecutive_timeouts += 1;
                    if !options.policy.tolerates(consecutive_timeouts) {
                        return Err(err);
                    }
                    log::warn!(
                        "Acquisition: tolerating timeout {} of {:?}",
                        consecutive_timeouts,
                        options.policy
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
