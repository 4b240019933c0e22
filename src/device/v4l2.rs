//! V4L2 backend on top of the `v4l` crate's raw layer.
//!
//! Structure layouts and request numbers come from `v4l::v4l_sys` and
//! `v4l::v4l2::vidioc`; the buffer bookkeeping above them stays in the pool.

use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::time::Duration;

use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_capability, v4l2_format, v4l2_requestbuffers};

use super::poll::poll_readable;
use super::{BufferLayout, Capabilities, DequeuedBuffer, Readiness, VideoBackend};
use crate::format::{CaptureFormat, FormatRequest, FourCC, PixelEncoding};

const V4L2_FIELD_INTERLACED: u32 = 4;

fn xioctl<T>(fd: RawFd, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    unsafe { v4l2::ioctl(fd, request, arg as *mut T as *mut c_void) }
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn capture_buffer(index: u32) -> v4l2_buffer {
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = Memory::Mmap as u32;
    buf
}

/// Real V4L2 device node.
#[derive(Debug, Default)]
pub struct V4l2Backend {
    fd: Option<RawFd>,
}

impl V4l2Backend {
    pub fn new() -> Self {
        Self::default()
    }

    fn fd(&self) -> io::Result<RawFd> {
        self.fd
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl VideoBackend for V4l2Backend {
    fn open(&mut self, path: &str) -> io::Result<()> {
        let fd = unsafe { v4l2::open(path, libc::O_RDWR | libc::O_NONBLOCK)? };
        self.fd = Some(fd);
        Ok(())
    }

    fn query_capabilities(&mut self) -> io::Result<Capabilities> {
        let fd = self.fd()?;
        let mut cap: v4l2_capability = unsafe { mem::zeroed() };
        xioctl(fd, vidioc::VIDIOC_QUERYCAP, &mut cap)?;
        Ok(Capabilities {
            driver: c_str(&cap.driver),
            card: c_str(&cap.card),
            bus_info: c_str(&cap.bus_info),
            capabilities: Capabilities::node_bits(cap.capabilities, cap.device_caps),
        })
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<CaptureFormat> {
        let fd = self.fd()?;
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = Type::VideoCapture as u32;
        unsafe {
            fmt.fmt.pix.width = request.width;
            fmt.fmt.pix.height = request.height;
            fmt.fmt.pix.pixelformat = request.encoding.fourcc().to_u32();
            fmt.fmt.pix.field = V4L2_FIELD_INTERLACED;
        }

        xioctl(fd, vidioc::VIDIOC_S_FMT, &mut fmt)?;

        // The driver writes back the format it actually selected.
        let pix = unsafe { fmt.fmt.pix };
        Ok(CaptureFormat {
            width: pix.width,
            height: pix.height,
            encoding: PixelEncoding::from_fourcc(FourCC::from_u32(pix.pixelformat)),
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let fd = self.fd()?;
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        xioctl(fd, vidioc::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferLayout> {
        let fd = self.fd()?;
        let mut buf = capture_buffer(index);
        xioctl(fd, vidioc::VIDIOC_QUERYBUF, &mut buf)?;
        Ok(BufferLayout {
            length: buf.length,
            offset: unsafe { buf.m.offset },
        })
    }

    fn map(&mut self, _index: u32, layout: &BufferLayout) -> io::Result<NonNull<u8>> {
        let fd = self.fd()?;
        let base = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                layout.length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                layout.offset as libc::off_t,
            )?
        };
        NonNull::new(base as *mut u8)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))
    }

    unsafe fn unmap(&mut self, base: NonNull<u8>, length: usize) -> io::Result<()> {
        v4l2::munmap(base.as_ptr() as *mut c_void, length)
    }

    fn queue(&mut self, index: u32) -> io::Result<()> {
        let fd = self.fd()?;
        let mut buf = capture_buffer(index);
        xioctl(fd, vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue(&mut self) -> io::Result<DequeuedBuffer> {
        let fd = self.fd()?;
        let mut buf = capture_buffer(0);
        xioctl(fd, vidioc::VIDIOC_DQBUF, &mut buf)?;
        let secs = (buf.timestamp.tv_sec as i64).max(0) as u64;
        let micros = (buf.timestamp.tv_usec as i64).max(0) as u64;
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp: Duration::from_secs(secs) + Duration::from_micros(micros),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let fd = self.fd()?;
        let mut kind = Type::VideoCapture as c_int;
        xioctl(fd, vidioc::VIDIOC_STREAMON, &mut kind)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let fd = self.fd()?;
        let mut kind = Type::VideoCapture as c_int;
        xioctl(fd, vidioc::VIDIOC_STREAMOFF, &mut kind)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness> {
        poll_readable(self.fd()?, timeout)
    }

    fn close(&mut self) -> io::Result<()> {
        let fd = self.fd()?;
        self.fd = None;
        unsafe { v4l2::close(fd) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_reports_not_found() {
        let mut backend = V4l2Backend::new();
        let err = backend
            .open("/dev/framegrab-does-not-exist")
            .expect_err("open must fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn driver_strings_stop_at_nul() {
        assert_eq!(c_str(b"uvcvideo\0\0\0\0"), "uvcvideo");
    }

    #[test]
    fn closed_backend_refuses_kernel_calls() {
        let mut backend = V4l2Backend::new();
        let err = backend.stream_on().expect_err("no descriptor");
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
