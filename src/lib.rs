//! Framegrab: a V4L2 capture core.
//!
//! Opens a video capture device, negotiates a pixel format, maps a pool of
//! kernel buffers into the process and cycles them through the driver while
//! lending each filled frame to the caller without copying.
//!
//! # Module Structure
//!
//! - `device`: device handle, the `VideoBackend` seam, real and stub backends
//! - `format`: pixel encodings and format negotiation
//! - `pool`: memory-mapped buffer pool and per-buffer ownership
//! - `session`: the typed streaming state machine
//! - `acquire`: readiness waits, `FrameView`, the acquisition loop
//! - `config`: layered file/environment configuration

pub mod acquire;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod pool;
pub mod session;
mod stream;

pub use acquire::{CaptureStats, FrameView, LoopExit, LoopOptions, TimeoutPolicy};
pub use config::CaptureConfig;
pub use device::{
    Capabilities, DeviceHandle, StubBackend, StubConfig, StubLedger, SystemBackend, VideoBackend,
};
pub use error::{CaptureError, Result};
pub use format::{CaptureFormat, FormatRequest, FourCC, PixelEncoding};
pub use pool::{BufferPool, Ownership};
pub use session::{Allocated, Configured, Opened, Session, Stopped, Streaming};
