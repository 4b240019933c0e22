//! Typed streaming state machine.
//!
//! A `Session` moves through
//!
//! ```text
//! Opened --negotiate--> Configured --allocate_buffers--> Allocated
//!     --enqueue_all + start_streaming--> Streaming --stop_streaming--> Stopped
//! Stopped --release--> Configured        Stopped --close--> (closed)
//! ```
//!
//! Each state is a distinct type, so an out-of-order call does not compile.
//! Consuming transitions that fail drop the session, which stops streaming,
//! releases the buffers and closes the device in that order.
//!
//! ```
//! use std::time::Duration;
//! use framegrab::{FormatRequest, Session, StubBackend, StubConfig};
//!
//! let session = Session::open_with(StubBackend::new(StubConfig::default()), "stub://cam")?;
//! let session = session.negotiate(&FormatRequest::default())?;
//! let mut session = session.allocate_buffers(2)?;
//! session.enqueue_all()?;
//! let mut session = session.start_streaming()?;
//! let frame = session.wait_for_frame(Duration::from_secs(1))?;
//! assert_eq!(frame.data().len(), 640 * 480 * 2);
//! frame.release()?;
//! session.stop_streaming()?.release()?.close()?;
//! # Ok::<(), framegrab::CaptureError>(())
//! ```

use crate::acquire::CaptureStats;
use crate::device::{DeviceHandle, SystemBackend, VideoBackend};
use crate::error::Result;
use crate::format::{negotiate, CaptureFormat, FormatRequest};
use crate::pool::BufferPool;
use crate::stream::StreamController;

mod sealed {
    pub trait Sealed {}
}

/// Marker for the states a `Session` can be in.
pub trait SessionState: sealed::Sealed {}

/// States in which the negotiated format is known.
pub trait Negotiated: SessionState {
    fn format(&self) -> &CaptureFormat;
}

/// Device open and verified, no format yet.
#[derive(Debug)]
pub struct Opened;

/// Format negotiated, no buffers.
#[derive(Debug)]
pub struct Configured {
    format: CaptureFormat,
}

/// Buffers mapped, streaming not started.
#[derive(Debug)]
pub struct Allocated {
    format: CaptureFormat,
}

/// Kernel is capturing into the pool.
#[derive(Debug)]
pub struct Streaming {
    pub(crate) format: CaptureFormat,
    pub(crate) stats: CaptureStats,
}

/// Capture halted, buffers still mapped.
#[derive(Debug)]
pub struct Stopped {
    format: CaptureFormat,
    stats: CaptureStats,
}

macro_rules! negotiated_state {
    ($($state:ident),*) => {
        $(
            impl sealed::Sealed for $state {}
            impl SessionState for $state {}
            impl Negotiated for $state {
                fn format(&self) -> &CaptureFormat {
                    &self.format
                }
            }
        )*
    };
}

impl sealed::Sealed for Opened {}
impl SessionState for Opened {}
negotiated_state!(Configured, Allocated, Streaming, Stopped);

// `Streaming` gets no `close`: capture has to be stopped first.
macro_rules! closable_state {
    ($($state:ident),*) => {
        $(
            impl<B: VideoBackend> Session<B, $state> {
                /// Release whatever is still held and close the device.
                pub fn close(self) -> Result<()> {
                    self.ctl.close()
                }
            }
        )*
    };
}

closable_state!(Opened, Configured, Allocated, Stopped);

/// One capture device driven through the streaming state machine.
pub struct Session<B: VideoBackend, S: SessionState> {
    pub(crate) ctl: StreamController<B>,
    pub(crate) state: S,
}

impl Session<SystemBackend, Opened> {
    /// Open `path` with the backend its scheme selects.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(SystemBackend::for_path(path), path)
    }
}

impl<B: VideoBackend> Session<B, Opened> {
    pub fn open_with(backend: B, path: &str) -> Result<Self> {
        let device = DeviceHandle::open_with(backend, path)?;
        Ok(Self {
            ctl: StreamController::new(device),
            state: Opened,
        })
    }

    /// Ask for a format and keep whatever the device actually selected.
    pub fn negotiate(mut self, request: &FormatRequest) -> Result<Session<B, Configured>> {
        let format = negotiate(self.ctl.device_mut(), request)?;
        Ok(Session {
            ctl: self.ctl,
            state: Configured { format },
        })
    }
}

impl<B: VideoBackend> Session<B, Configured> {
    /// Reserve and map `count` buffers (at least two).
    pub fn allocate_buffers(mut self, count: u32) -> Result<Session<B, Allocated>> {
        self.ctl.allocate(count)?;
        Ok(Session {
            ctl: self.ctl,
            state: Allocated {
                format: self.state.format,
            },
        })
    }
}

impl<B: VideoBackend> Session<B, Allocated> {
    /// Hand every buffer to the kernel.
    pub fn enqueue_all(&mut self) -> Result<()> {
        self.ctl.enqueue_all()
    }

    /// Start capture. Fails unless every buffer has been enqueued.
    pub fn start_streaming(mut self) -> Result<Session<B, Streaming>> {
        self.ctl.start()?;
        Ok(Session {
            ctl: self.ctl,
            state: Streaming {
                format: self.state.format,
                stats: CaptureStats::default(),
            },
        })
    }
}

impl<B: VideoBackend> Session<B, Streaming> {
    /// Halt capture. No frame can be waited for until streaming restarts.
    pub fn stop_streaming(mut self) -> Result<Session<B, Stopped>> {
        self.ctl.stop()?;
        log::info!(
            "Session: stopped after {} frames, {} timeouts",
            self.state.stats.frames,
            self.state.stats.timeouts
        );
        Ok(Session {
            ctl: self.ctl,
            state: Stopped {
                format: self.state.format,
                stats: self.state.stats,
            },
        })
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.state.stats
    }
}

impl<B: VideoBackend> Session<B, Stopped> {
    /// Unmap the pool. The negotiated format is kept.
    pub fn release(mut self) -> Result<Session<B, Configured>> {
        self.ctl.release_pool()?;
        Ok(Session {
            ctl: self.ctl,
            state: Configured {
                format: self.state.format,
            },
        })
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.state.stats
    }
}

impl<B: VideoBackend, S: Negotiated> Session<B, S> {
    pub fn format(&self) -> &CaptureFormat {
        self.state.format()
    }
}

impl<B: VideoBackend, S: SessionState> Session<B, S> {
    pub fn device(&self) -> &DeviceHandle<B> {
        self.ctl.device()
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.ctl.pool()
    }
}
