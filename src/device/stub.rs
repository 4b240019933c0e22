//! Synthetic capture device.
//!
//! `StubBackend` behaves like a cooperative V4L2 driver that supports exactly
//! one format. Buffers are heap allocations standing in for kernel memory,
//! frames are a moving byte pattern, and every kernel call is recorded in a
//! `StubLedger` so tests can check open/close and map/unmap pairing.
//!
//! Paths use the `stub://<name>` scheme.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::{BufferLayout, Capabilities, DequeuedBuffer, Readiness, VideoBackend};
use crate::format::{CaptureFormat, FormatRequest, PixelEncoding};

pub const STUB_SCHEME: &str = "stub://";

const EINVAL: i32 = 22;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EIO: i32 = 5;
const PAGE_SIZE: u32 = 4096;
const SPURIOUS_WAKEUP_DELAY: Duration = Duration::from_millis(1);

/// Behaviour of the synthetic device.
#[derive(Clone, Debug)]
pub struct StubConfig {
    /// `false` makes `open` fail with `NotFound`.
    pub present: bool,
    pub capabilities: u32,
    /// The only geometry the device supports; every request is coerced to it.
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
    /// Fail the format-set call itself.
    pub reject_format: bool,
    /// Upper bound on buffers granted by `request_buffers`.
    pub max_buffers: u32,
    /// Fail the mapping of this buffer index.
    pub fail_map_at: Option<u32>,
    /// Fail the dequeue that would deliver this frame sequence number.
    pub fail_dequeue_at: Option<u32>,
    /// Fail stream-on.
    pub fail_stream_on: bool,
    /// Fail every queue call after this many have succeeded.
    pub fail_queue_after: Option<u32>,
    /// Never signal readiness.
    pub silent: bool,
    /// Number of waits that end in a signal interruption before behaving normally.
    pub interrupted_waits: u32,
    /// How long an interrupted wait blocks before the interruption arrives.
    pub interrupt_after: Duration,
    /// Number of waits that report readiness with no filled buffer behind it.
    pub spurious_wakeups: u32,
    /// Number of waits that report a timeout at once, before the timeout passed.
    pub early_timeouts: u32,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            present: true,
            capabilities: Capabilities::VIDEO_CAPTURE | Capabilities::STREAMING,
            width: 640,
            height: 480,
            encoding: PixelEncoding::Yuyv,
            reject_format: false,
            max_buffers: 32,
            fail_map_at: None,
            fail_dequeue_at: None,
            fail_stream_on: false,
            fail_queue_after: None,
            silent: false,
            interrupted_waits: 0,
            interrupt_after: Duration::from_millis(10),
            spurious_wakeups: 0,
            early_timeouts: 0,
        }
    }
}

/// Kernel calls observed by a `StubBackend`, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubCall {
    Open,
    Close,
    SetFormat,
    RequestBuffers(u32),
    Map(u32),
    Unmap,
    Queue(u32),
    Dequeue(u32),
    StreamOn,
    StreamOff,
    Wait,
}

/// Shared view of what a `StubBackend` has been asked to do.
#[derive(Clone, Debug, Default)]
pub struct StubLedger {
    calls: Rc<RefCell<Vec<StubCall>>>,
    live_mappings: Rc<Cell<usize>>,
}

impl StubLedger {
    fn record(&self, call: StubCall) {
        self.calls.borrow_mut().push(call);
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.borrow().clone()
    }

    fn count(&self, pred: impl Fn(&StubCall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }

    pub fn opens(&self) -> usize {
        self.count(|c| *c == StubCall::Open)
    }

    pub fn closes(&self) -> usize {
        self.count(|c| *c == StubCall::Close)
    }

    pub fn maps(&self) -> usize {
        self.count(|c| matches!(c, StubCall::Map(_)))
    }

    pub fn unmaps(&self) -> usize {
        self.count(|c| *c == StubCall::Unmap)
    }

    pub fn waits(&self) -> usize {
        self.count(|c| *c == StubCall::Wait)
    }

    pub fn dequeues(&self) -> usize {
        self.count(|c| matches!(c, StubCall::Dequeue(_)))
    }

    /// Mappings currently alive.
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.get()
    }
}

/// In-process synthetic capture device.
pub struct StubBackend {
    config: StubConfig,
    ledger: StubLedger,
    open: bool,
    format: Option<CaptureFormat>,
    granted: u32,
    mappings: HashMap<u32, (NonNull<u8>, usize)>,
    queued: VecDeque<u32>,
    queued_set: HashSet<u32>,
    streaming: bool,
    stream_started: Option<Instant>,
    sequence: u32,
    queued_total: u32,
    interrupts_left: u32,
    spurious_left: u32,
    spurious_pending: bool,
    early_timeouts_left: u32,
}

impl StubBackend {
    pub fn new(config: StubConfig) -> Self {
        Self {
            interrupts_left: config.interrupted_waits,
            spurious_left: config.spurious_wakeups,
            early_timeouts_left: config.early_timeouts,
            config,
            ledger: StubLedger::default(),
            open: false,
            format: None,
            granted: 0,
            mappings: HashMap::new(),
            queued: VecDeque::new(),
            queued_set: HashSet::new(),
            streaming: false,
            stream_started: None,
            sequence: 0,
            queued_total: 0,
            spurious_pending: false,
        }
    }

    pub fn ledger(&self) -> StubLedger {
        self.ledger.clone()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(EINVAL))
        }
    }

    fn buffer_length(&self) -> u32 {
        self.format.map(|f| f.size_image).unwrap_or(0)
    }

    fn fill(&mut self, index: u32) -> u32 {
        let Some(&(base, len)) = self.mappings.get(&index) else {
            return 0;
        };
        let seed = self.sequence as usize;
        // The application only reads this buffer after it has been dequeued.
        let bytes = unsafe { std::slice::from_raw_parts_mut(base.as_ptr(), len) };
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = ((i + seed) % 256) as u8;
        }
        len as u32
    }
}

impl VideoBackend for StubBackend {
    fn open(&mut self, path: &str) -> io::Result<()> {
        if !self.config.present || !path.starts_with(STUB_SCHEME) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no stub device at {path}"),
            ));
        }
        self.open = true;
        self.ledger.record(StubCall::Open);
        Ok(())
    }

    fn query_capabilities(&mut self) -> io::Result<Capabilities> {
        self.ensure_open()?;
        Ok(Capabilities {
            driver: "stub".to_string(),
            card: "Synthetic Camera".to_string(),
            bus_info: "platform:stub".to_string(),
            capabilities: self.config.capabilities,
        })
    }

    fn set_format(&mut self, _request: &FormatRequest) -> io::Result<CaptureFormat> {
        self.ensure_open()?;
        self.ledger.record(StubCall::SetFormat);
        if self.config.reject_format {
            return Err(io::Error::from_raw_os_error(EINVAL));
        }
        if self.granted > 0 {
            return Err(io::Error::from_raw_os_error(EBUSY));
        }
        let encoding = self.config.encoding;
        let (width, height) = (self.config.width, self.config.height);
        let format = CaptureFormat {
            width,
            height,
            encoding,
            bytes_per_line: encoding.bytes_per_line(width).unwrap_or(0),
            size_image: encoding
                .image_size(width, height)
                .unwrap_or(width.saturating_mul(height)),
        };
        self.format = Some(format);
        Ok(format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.ensure_open()?;
        self.ledger.record(StubCall::RequestBuffers(count));
        if self.streaming || !self.mappings.is_empty() {
            return Err(io::Error::from_raw_os_error(EBUSY));
        }
        self.granted = count.min(self.config.max_buffers);
        Ok(self.granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferLayout> {
        self.ensure_open()?;
        if index >= self.granted {
            return Err(io::Error::from_raw_os_error(EINVAL));
        }
        let length = self.buffer_length();
        let stride = length.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        Ok(BufferLayout {
            length,
            offset: index * stride,
        })
    }

    fn map(&mut self, index: u32, layout: &BufferLayout) -> io::Result<NonNull<u8>> {
        self.ensure_open()?;
        if self.config.fail_map_at == Some(index) {
            return Err(io::Error::from_raw_os_error(ENOMEM));
        }
        if layout.length == 0 || self.mappings.contains_key(&index) {
            return Err(io::Error::from_raw_os_error(EINVAL));
        }
        let region = vec![0u8; layout.length as usize].into_boxed_slice();
        let len = region.len();
        let raw = Box::into_raw(region) as *mut u8;
        let base = NonNull::new(raw).ok_or_else(|| io::Error::from_raw_os_error(ENOMEM))?;
        self.mappings.insert(index, (base, len));
        self.ledger.live_mappings.set(self.ledger.live_mappings() + 1);
        self.ledger.record(StubCall::Map(index));
        Ok(base)
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, length: usize) -> io::Result<()> {
        let index = self
            .mappings
            .iter()
            .find(|(_, (b, l))| *b == base && *l == length)
            .map(|(i, _)| *i)
            .ok_or_else(|| io::Error::from_raw_os_error(EINVAL))?;
        self.mappings.remove(&index);
        let slice = std::ptr::slice_from_raw_parts_mut(base.as_ptr(), length);
        drop(Box::from_raw(slice));
        self.ledger.live_mappings.set(self.ledger.live_mappings() - 1);
        self.ledger.record(StubCall::Unmap);
        Ok(())
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        self.ensure_open()?;
        if self
            .config
            .fail_queue_after
            .is_some_and(|limit| self.queued_total >= limit)
        {
            return Err(io::Error::from_raw_os_error(EIO));
        }
        if !self.mappings.contains_key(&index) || !self.queued_set.insert(index) {
            return Err(io::Error::from_raw_os_error(EINVAL));
        }
        self.queued_total += 1;
        self.queued.push_back(index);
        self.ledger.record(StubCall::Queue(index));
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<DequeuedBuffer> {
        self.ensure_open()?;
        if !self.streaming {
            return Err(io::Error::from_raw_os_error(EINVAL));
        }
        if self.spurious_pending {
            self.spurious_pending = false;
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        if self.config.fail_dequeue_at == Some(self.sequence) {
            return Err(io::Error::from_raw_os_error(EIO));
        }
        let index = self
            .queued
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        self.queued_set.remove(&index);
        let bytes_used = self.fill(index);
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.ledger.record(StubCall::Dequeue(index));
        Ok(DequeuedBuffer {
            index,
            bytes_used,
            sequence,
            timestamp: self
                .stream_started
                .map(|t| t.elapsed())
                .unwrap_or_default(),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        if self.queued.is_empty() {
            return Err(io::Error::from_raw_os_error(EINVAL));
        }
        if self.config.fail_stream_on {
            return Err(io::Error::from_raw_os_error(EIO));
        }
        self.streaming = true;
        self.stream_started = Some(Instant::now());
        self.ledger.record(StubCall::StreamOn);
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.streaming = false;
        self.spurious_pending = false;
        self.queued.clear();
        self.queued_set.clear();
        self.ledger.record(StubCall::StreamOff);
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness> {
        self.ensure_open()?;
        self.ledger.record(StubCall::Wait);
        if self.interrupts_left > 0 {
            self.interrupts_left -= 1;
            std::thread::sleep(self.config.interrupt_after.min(timeout));
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        if self.early_timeouts_left > 0 {
            self.early_timeouts_left -= 1;
            return Ok(Readiness::TimedOut);
        }
        if self.streaming && self.spurious_left > 0 {
            self.spurious_left -= 1;
            self.spurious_pending = true;
            std::thread::sleep(SPURIOUS_WAKEUP_DELAY.min(timeout));
            return Ok(Readiness::Ready);
        }
        if self.streaming && !self.config.silent && !self.queued.is_empty() {
            return Ok(Readiness::Ready);
        }
        std::thread::sleep(timeout);
        Ok(Readiness::TimedOut)
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::from_raw_os_error(EINVAL));
        }
        self.open = false;
        self.streaming = false;
        self.ledger.record(StubCall::Close);
        Ok(())
    }
}

impl Drop for StubBackend {
    fn drop(&mut self) {
        // Leaked mappings still own heap memory.
        for (_, (base, len)) in self.mappings.drain() {
            let slice = std::ptr::slice_from_raw_parts_mut(base.as_ptr(), len);
            drop(unsafe { Box::from_raw(slice) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_every_request_to_the_supported_mode() -> io::Result<()> {
        let mut stub = StubBackend::new(StubConfig::default());
        stub.open("stub://cam")?;
        let format = stub.set_format(&FormatRequest {
            width: 1920,
            height: 1080,
            encoding: PixelEncoding::Mjpeg,
        })?;
        assert_eq!((format.width, format.height), (640, 480));
        assert_eq!(format.encoding, PixelEncoding::Yuyv);
        assert_eq!(format.size_image, 640 * 480 * 2);
        Ok(())
    }

    #[test]
    fn rejects_double_queue() -> io::Result<()> {
        let mut stub = StubBackend::new(StubConfig::default());
        stub.open("stub://cam")?;
        stub.set_format(&FormatRequest::default())?;
        stub.request_buffers(2)?;
        let layout = stub.query_buffer(0)?;
        stub.map(0, &layout)?;
        stub.queue(0)?;
        assert!(stub.queue(0).is_err());
        Ok(())
    }

    #[test]
    fn spurious_readiness_leaves_nothing_to_dequeue() -> io::Result<()> {
        let mut stub = StubBackend::new(StubConfig {
            spurious_wakeups: 1,
            ..StubConfig::default()
        });
        stub.open("stub://cam")?;
        stub.set_format(&FormatRequest::default())?;
        stub.request_buffers(2)?;
        let layout = stub.query_buffer(0)?;
        stub.map(0, &layout)?;
        stub.queue(0)?;
        stub.stream_on()?;

        assert_eq!(stub.wait_readable(Duration::from_secs(1))?, Readiness::Ready);
        let err = stub.dequeue().expect_err("no buffer behind the wakeup");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(stub.wait_readable(Duration::from_secs(1))?, Readiness::Ready);
        assert_eq!(stub.dequeue()?.index, 0);
        Ok(())
    }
}
