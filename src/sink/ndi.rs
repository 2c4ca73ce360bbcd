//! NDI sender backed by the NDI runtime library, loaded at startup.
//!
//! The runtime is searched for as:
//! - an explicit path (`--ndi-library` / `V4L2NDI_NDI_LIBRARY`),
//! - `libndi.so.6`, `libndi.so.5`, `libndi.so` on the loader path.
//!
//! Function pointers are resolved once and cached; the `Library` is kept
//! alive for as long as the sender exists.

use anyhow::{anyhow, Context, Result};
use libloading::{Library, Symbol};
use std::ffi::{c_char, c_int, c_void, CString};
use std::path::Path;
use std::ptr;
use std::time::Duration;

use super::{OutgoingFrame, Sink};

const LIBRARY_CANDIDATES: &[&str] = &["libndi.so.6", "libndi.so.5", "libndi.so"];

/// `NDIlib_frame_format_type_progressive`.
const FRAME_FORMAT_PROGRESSIVE: c_int = 1;
/// `NDIlib_send_timecode_synthesize`.
const TIMECODE_SYNTHESIZE: i64 = i64::MAX;

#[repr(C)]
struct NdiSendCreate {
    p_ndi_name: *const c_char,
    p_groups: *const c_char,
    clock_video: bool,
    clock_audio: bool,
}

#[repr(C)]
struct NdiVideoFrameV2 {
    xres: c_int,
    yres: c_int,
    four_cc: u32,
    frame_rate_n: c_int,
    frame_rate_d: c_int,
    picture_aspect_ratio: f32,
    frame_format_type: c_int,
    timecode: i64,
    p_data: *const u8,
    line_stride_in_bytes: c_int,
    p_metadata: *const c_char,
    timestamp: i64,
}

type InitializeFn = unsafe extern "C" fn() -> bool;
type DestroyFn = unsafe extern "C" fn();
type SendCreateFn = unsafe extern "C" fn(*const NdiSendCreate) -> *mut c_void;
type SendDestroyFn = unsafe extern "C" fn(*mut c_void);
type SendVideoFn = unsafe extern "C" fn(*mut c_void, *const NdiVideoFrameV2);
type GetNoConnectionsFn = unsafe extern "C" fn(*mut c_void, u32) -> c_int;

struct NdiApi {
    destroy: DestroyFn,
    send_destroy: SendDestroyFn,
    send_video: SendVideoFn,
    send_video_async: SendVideoFn,
    get_no_connections: GetNoConnectionsFn,
}

pub struct NdiSender {
    name: String,
    instance: *mut c_void,
    api: NdiApi,
    // Dropped last: the cached function pointers point into it.
    _lib: Library,
}

// NDI send instances may be used from several threads; the SDK serializes
// internally.
unsafe impl Send for NdiSender {}
unsafe impl Sync for NdiSender {}

fn load_library(explicit: Option<&Path>) -> Result<Library> {
    if let Some(path) = explicit {
        // SAFETY: loading the NDI runtime runs its initializers, which have no
        // preconditions.
        return unsafe { Library::new(path) }
            .with_context(|| format!("load NDI runtime {}", path.display()));
    }
    let mut last_err = None;
    for candidate in LIBRARY_CANDIDATES {
        // SAFETY: as above.
        match unsafe { Library::new(candidate) } {
            Ok(lib) => {
                log::debug!("NdiSender: loaded {}", candidate);
                return Ok(lib);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(anyhow!(
        "NDI runtime not found (tried {}): {}",
        LIBRARY_CANDIDATES.join(", "),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T> {
    let sym: Symbol<T> = lib
        .get(name.as_bytes())
        .with_context(|| format!("NDI runtime is missing {}", name))?;
    Ok(*sym)
}

impl NdiSender {
    /// Initialize the runtime and create a clocked video sender named
    /// `stream_name`.
    pub fn create(stream_name: &str, library: Option<&Path>) -> Result<Self> {
        let lib = load_library(library)?;
        let c_name = CString::new(stream_name)
            .with_context(|| format!("invalid NDI stream name {:?}", stream_name))?;

        // SAFETY: signatures match the NDI SDK v5/v6 headers.
        let (initialize, send_create, api) = unsafe {
            let initialize: InitializeFn = symbol(&lib, "NDIlib_initialize")?;
            let send_create: SendCreateFn = symbol(&lib, "NDIlib_send_create")?;
            let api = NdiApi {
                destroy: symbol(&lib, "NDIlib_destroy")?,
                send_destroy: symbol(&lib, "NDIlib_send_destroy")?,
                send_video: symbol(&lib, "NDIlib_send_send_video_v2")?,
                send_video_async: symbol(&lib, "NDIlib_send_send_video_async_v2")?,
                get_no_connections: symbol(&lib, "NDIlib_send_get_no_connections")?,
            };
            (initialize, send_create, api)
        };

        // SAFETY: no preconditions.
        if !unsafe { initialize() } {
            return Err(anyhow!(
                "NDI runtime refused to initialize (CPU not supported?)"
            ));
        }

        let desc = NdiSendCreate {
            p_ndi_name: c_name.as_ptr(),
            p_groups: ptr::null(),
            clock_video: true,
            clock_audio: false,
        };
        // SAFETY: `desc` and the name it points to outlive the call; the SDK
        // copies the name.
        let instance = unsafe { send_create(&desc) };
        if instance.is_null() {
            // SAFETY: balanced with the successful initialize above.
            unsafe { (api.destroy)() };
            return Err(anyhow!("failed to create NDI sender {}", stream_name));
        }

        log::info!("NdiSender: publishing {}", stream_name);
        Ok(Self {
            name: stream_name.to_string(),
            instance,
            api,
            _lib: lib,
        })
    }

    fn video_frame(frame: &OutgoingFrame<'_>) -> Result<NdiVideoFrameV2> {
        let xres = c_int::try_from(frame.resolution.width)?;
        let yres = c_int::try_from(frame.resolution.height)?;
        let stride = c_int::try_from(frame.line_stride())?;
        let expected = frame.resolution.packed_422_len();
        if frame.data.len() < expected {
            return Err(anyhow!(
                "frame holds {} bytes, {} needs {}",
                frame.data.len(),
                frame.resolution,
                expected
            ));
        }
        Ok(NdiVideoFrameV2 {
            xres,
            yres,
            four_cc: frame.fourcc.to_u32(),
            frame_rate_n: c_int::try_from(frame.frame_rate.numerator)?,
            frame_rate_d: c_int::try_from(frame.frame_rate.denominator)?,
            picture_aspect_ratio: 0.0,
            frame_format_type: FRAME_FORMAT_PROGRESSIVE,
            timecode: TIMECODE_SYNTHESIZE,
            p_data: frame.data.as_ptr(),
            line_stride_in_bytes: stride,
            p_metadata: ptr::null(),
            timestamp: 0,
        })
    }
}

impl Sink for NdiSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_receivers(&self, timeout: Duration) -> bool {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        // SAFETY: `instance` is live until drop.
        unsafe { (self.api.get_no_connections)(self.instance, timeout_ms) > 0 }
    }

    fn send_sync(&self, frame: &OutgoingFrame<'_>) -> Result<()> {
        let video = Self::video_frame(frame)?;
        // SAFETY: the SDK is done with `frame.data` when this returns.
        unsafe { (self.api.send_video)(self.instance, &video) };
        Ok(())
    }

    unsafe fn send_async(&self, frame: &OutgoingFrame<'_>) -> Result<()> {
        let video = Self::video_frame(frame)?;
        // The descriptor is copied by the SDK; only the pixel memory must
        // outlive the call, which the caller guarantees.
        (self.api.send_video_async)(self.instance, &video);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // SAFETY: a null frame waits for the pending async frame.
        unsafe { (self.api.send_video_async)(self.instance, ptr::null()) };
        Ok(())
    }
}

impl Drop for NdiSender {
    fn drop(&mut self) {
        // SAFETY: `instance` came from `NDIlib_send_create` and is destroyed
        // exactly once, after flushing pending async memory.
        unsafe {
            (self.api.send_video_async)(self.instance, ptr::null());
            (self.api.send_destroy)(self.instance);
            (self.api.destroy)();
        }
        log::info!("NdiSender: {} destroyed", self.name);
    }
}
