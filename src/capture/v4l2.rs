//! V4L2 capture device.
//!
//! Opens a device node with libv4l's `Device`, negotiates the capture format,
//! and runs the mmap buffer protocol with raw ioctls so buffers can be queued
//! and dequeued by index from either relay thread. Multi-planar capture is
//! used when the driver advertises it.

use anyhow::{anyhow, Context, Result};
use std::io;
use std::os::raw::{c_int, c_void};
use std::os::unix::fs::FileTypeExt;
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_format, v4l2_plane, v4l2_requestbuffers};

use super::{CaptureDevice, Dequeued, FormatRequest, MappedBuffer, MappedPlane, NegotiatedFormat};
use crate::error::CaptureError;
use crate::format::{FourCc, Resolution};

const MAX_PLANES: usize = 8;

/// Buffer type for a device: multi-planar capture when advertised.
fn capture_type(capabilities: Flags) -> Option<Type> {
    if capabilities.contains(Flags::VIDEO_CAPTURE_MPLANE) {
        Some(Type::VideoCaptureMplane)
    } else if capabilities.contains(Flags::VIDEO_CAPTURE) {
        Some(Type::VideoCapture)
    } else {
        None
    }
}

// `Type` has no `PartialEq`.
fn is_multiplanar(buf_type: Type) -> bool {
    matches!(buf_type, Type::VideoCaptureMplane)
}

pub struct V4l2Device {
    path: String,
    device: v4l::Device,
    buf_type: Type,
    plane_counts: Vec<u32>,
}

/// ioctl that retries on EINTR.
fn xioctl<T>(fd: c_int, request: v4l2::vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: `arg` is the argument struct matching `request`.
        let res = unsafe { v4l2::ioctl(fd, request, arg as *mut T as *mut c_void) };
        match res {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

impl V4l2Device {
    pub fn open(path: &str) -> Result<Self> {
        let meta = std::fs::metadata(path).with_context(|| format!("cannot identify '{}'", path))?;
        if !meta.file_type().is_char_device() {
            return Err(anyhow!("{} is no device", path));
        }

        let device =
            v4l::Device::with_path(path).with_context(|| format!("cannot open '{}'", path))?;
        let caps = device
            .query_caps()
            .with_context(|| format!("{} is no V4L2 device", path))?;

        log::info!("V4l2Device: path={} driver={} card={}", path, caps.driver, caps.card);
        for (flag, label) in [
            (Flags::VIDEO_OUTPUT, "output"),
            (Flags::VIDEO_CAPTURE, "capture"),
            (Flags::VIDEO_CAPTURE_MPLANE, "capture mplane"),
            (Flags::READ_WRITE, "read/write"),
            (Flags::STREAMING, "streaming"),
            (Flags::VIDEO_M2M_MPLANE, "m2m mplane"),
        ] {
            if caps.capabilities.contains(flag) {
                log::info!("V4l2Device: {} supports {}", path, label);
            }
        }

        let buf_type = capture_type(caps.capabilities)
            .ok_or_else(|| anyhow!("{} does not support video capture", path))?;
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(anyhow!("{} does not support streaming i/o", path));
        }

        Ok(Self {
            path: path.to_string(),
            device,
            buf_type,
            plane_counts: Vec::new(),
        })
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }

    fn multiplanar(&self) -> bool {
        is_multiplanar(self.buf_type)
    }

    fn get_format(&self) -> io::Result<v4l2_format> {
        // SAFETY: v4l2_format is a plain C struct.
        let mut fmt: v4l2_format = unsafe { std::mem::zeroed() };
        fmt.type_ = self.buf_type as u32;
        xioctl(self.fd(), v4l2::vidioc::VIDIOC_G_FMT, &mut fmt)?;
        Ok(fmt)
    }

    fn read_format(&self, fmt: &v4l2_format) -> NegotiatedFormat {
        // SAFETY: the active union member matches `buf_type`.
        let (width, height, pixelformat) = unsafe {
            if self.multiplanar() {
                let pix = &fmt.fmt.pix_mp;
                (pix.width, pix.height, pix.pixelformat)
            } else {
                let pix = &fmt.fmt.pix;
                (pix.width, pix.height, pix.pixelformat)
            }
        };
        NegotiatedFormat {
            resolution: Resolution::new(width, height),
            fourcc: FourCc::from_u32(pixelformat),
        }
    }

    fn buffer_desc(&self, index: u32) -> v4l2_buffer {
        // SAFETY: v4l2_buffer is a plain C struct.
        let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.type_ = self.buf_type as u32;
        buf.memory = Memory::Mmap as u32;
        buf.index = index;
        buf
    }

    fn map_plane(&self, length: u32, offset: u32) -> Result<MappedPlane, CaptureError> {
        // SAFETY: offset/length come from VIDIOC_QUERYBUF for this fd.
        let addr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                offset as libc::off_t,
            )
        }
        .map_err(|e| CaptureError::io("mmap", e))?;
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| CaptureError::io("mmap", io::Error::from(io::ErrorKind::Other)))?;
        // SAFETY: mapped above, unmapped in `unmap`.
        Ok(unsafe { MappedPlane::new(ptr, length as usize, offset) })
    }
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn negotiate(&mut self, request: &FormatRequest) -> Result<NegotiatedFormat> {
        let mut fmt = self.get_format().context("VIDIOC_G_FMT")?;
        let current = self.read_format(&fmt);
        log::info!(
            "V4l2Device: current format {} {}",
            current.fourcc,
            current.resolution
        );

        let multiplanar = self.multiplanar();
        // SAFETY: the active union member matches `buf_type`.
        unsafe {
            if multiplanar {
                let pix = &mut fmt.fmt.pix_mp;
                if let Some(width) = request.width {
                    pix.width = width;
                }
                if let Some(height) = request.height {
                    pix.height = height;
                }
                if let Some(fourcc) = request.fourcc {
                    pix.pixelformat = fourcc.to_u32();
                }
            } else {
                let pix = &mut fmt.fmt.pix;
                if let Some(width) = request.width {
                    pix.width = width;
                }
                if let Some(height) = request.height {
                    pix.height = height;
                }
                if let Some(fourcc) = request.fourcc {
                    pix.pixelformat = fourcc.to_u32();
                }
            }
        }
        if *request != FormatRequest::default() {
            log::info!(
                "V4l2Device: setting format width={:?} height={:?} fourcc={:?}",
                request.width,
                request.height,
                request.fourcc.map(|f| f.to_string())
            );
        }

        xioctl(self.fd(), v4l2::vidioc::VIDIOC_S_FMT, &mut fmt).context("VIDIOC_S_FMT")?;
        let fmt = self.get_format().context("VIDIOC_G_FMT")?;
        let actual = self.read_format(&fmt);

        if let Some(fourcc) = request.fourcc {
            if fourcc != actual.fourcc {
                log::warn!(
                    "V4l2Device: cannot set pixel format to {}, current pixel format {}",
                    fourcc,
                    actual.fourcc
                );
            }
        }
        if let Some(width) = request.width {
            if width != actual.resolution.width {
                log::warn!(
                    "V4l2Device: cannot set frame width to {}, current width {}",
                    width,
                    actual.resolution.width
                );
            }
        }
        if let Some(height) = request.height {
            if height != actual.resolution.height {
                log::warn!(
                    "V4l2Device: cannot set frame height to {}, current height {}",
                    height,
                    actual.resolution.height
                );
            }
        }
        Ok(actual)
    }

    fn request_buffers(&mut self, count: u32) -> Result<Vec<MappedBuffer>, CaptureError> {
        // SAFETY: plain C struct.
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = self.buf_type as u32;
        req.memory = Memory::Mmap as u32;
        xioctl(self.fd(), v4l2::vidioc::VIDIOC_REQBUFS, &mut req)
            .map_err(|e| CaptureError::io("VIDIOC_REQBUFS", e))?;

        let mut buffers = Vec::with_capacity(req.count as usize);
        self.plane_counts.clear();
        for index in 0..req.count {
            let mut buf = self.buffer_desc(index);
            // SAFETY: plain C structs.
            let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { std::mem::zeroed() };
            if self.multiplanar() {
                buf.length = MAX_PLANES as u32;
                buf.m.planes = planes.as_mut_ptr();
            }
            xioctl(self.fd(), v4l2::vidioc::VIDIOC_QUERYBUF, &mut buf)
                .map_err(|e| CaptureError::io("VIDIOC_QUERYBUF", e))?;

            let mut mapped = Vec::new();
            if self.multiplanar() {
                let count = (buf.length as usize).min(MAX_PLANES);
                log::info!("V4l2Device: buffer {} has {} planes", index, count);
                for (p, plane) in planes.iter().take(count).enumerate() {
                    // SAFETY: MMAP buffers report `mem_offset`.
                    let offset = unsafe { plane.m.mem_offset };
                    log::debug!(
                        "V4l2Device: mapping buffer {} plane {} len {}",
                        index,
                        p,
                        plane.length
                    );
                    mapped.push(self.map_plane(plane.length, offset)?);
                }
            } else {
                // SAFETY: MMAP buffers report `offset`.
                let offset = unsafe { buf.m.offset };
                log::debug!("V4l2Device: mapping buffer {} len {}", index, buf.length);
                mapped.push(self.map_plane(buf.length, offset)?);
            }
            self.plane_counts.push(mapped.len() as u32);
            buffers.push(MappedBuffer {
                index,
                planes: mapped,
            });
        }
        Ok(buffers)
    }

    fn queue(&self, index: u32) -> Result<(), CaptureError> {
        let mut buf = self.buffer_desc(index);
        // SAFETY: plain C structs.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { std::mem::zeroed() };
        if self.multiplanar() {
            buf.length = self
                .plane_counts
                .get(index as usize)
                .copied()
                .unwrap_or(1);
            buf.m.planes = planes.as_mut_ptr();
        }
        xioctl(self.fd(), v4l2::vidioc::VIDIOC_QBUF, &mut buf)
            .map_err(|e| CaptureError::io("VIDIOC_QBUF", e))
    }

    fn dequeue(&self) -> Result<Dequeued, CaptureError> {
        let mut buf = self.buffer_desc(0);
        // SAFETY: plain C structs.
        let mut planes: [v4l2_plane; MAX_PLANES] = unsafe { std::mem::zeroed() };
        if self.multiplanar() {
            buf.length = MAX_PLANES as u32;
            buf.m.planes = planes.as_mut_ptr();
        }
        match xioctl(self.fd(), v4l2::vidioc::VIDIOC_DQBUF, &mut buf) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                return Err(CaptureError::NoData)
            }
            Err(err) => return Err(CaptureError::io("VIDIOC_DQBUF", err)),
        }
        if buf.index as usize >= self.plane_counts.len() {
            return Err(CaptureError::desync(
                buf.index,
                "driver returned an index outside the mapped range",
            ));
        }
        let bytes_used = if self.multiplanar() {
            planes[0].bytesused
        } else {
            buf.bytesused
        };
        Ok(Dequeued {
            index: buf.index,
            bytes_used,
            sequence: buf.sequence,
        })
    }

    fn stream_on(&self) -> Result<(), CaptureError> {
        let mut buf_type = self.buf_type as c_int;
        xioctl(self.fd(), v4l2::vidioc::VIDIOC_STREAMON, &mut buf_type)
            .map_err(|e| CaptureError::io("VIDIOC_STREAMON", e))?;
        log::info!("V4l2Device: streaming started on {}", self.path);
        Ok(())
    }

    fn stream_off(&self) -> Result<(), CaptureError> {
        let mut buf_type = self.buf_type as c_int;
        xioctl(self.fd(), v4l2::vidioc::VIDIOC_STREAMOFF, &mut buf_type)
            .map_err(|e| CaptureError::io("VIDIOC_STREAMOFF", e))
    }

    fn wait_ready(&self, timeout: Duration) -> Result<bool, CaptureError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut pfd = libc::pollfd {
                fd: self.fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let timeout_ms = remaining.as_millis().min(c_int::MAX as u128) as c_int;
            // SAFETY: one valid pollfd.
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            match ret {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(CaptureError::io("poll", err));
                }
                0 => return Ok(false),
                _ => return Ok(true),
            }
        }
    }

    fn unmap(&mut self, buffers: Vec<MappedBuffer>) -> Result<(), CaptureError> {
        for buffer in buffers {
            for plane in buffer.planes {
                // SAFETY: mapped by `map_plane` with this length.
                unsafe { v4l2::munmap(plane.as_ptr() as *mut c_void, plane.len()) }
                    .map_err(|e| CaptureError::io("munmap", e))?;
            }
        }
        // SAFETY: plain C struct.
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = 0;
        req.type_ = self.buf_type as u32;
        req.memory = Memory::Mmap as u32;
        if let Err(err) = xioctl(self.fd(), v4l2::vidioc::VIDIOC_REQBUFS, &mut req) {
            log::debug!("V4l2Device: freeing buffers on {} failed: {}", self.path, err);
        }
        self.plane_counts.clear();
        Ok(())
    }
}
