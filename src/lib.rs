//! V4L2 to NDI relay (v4l2ndi)
//!
//! This crate relays frames from a memory-mapped V4L2 capture device to an NDI
//! sender at the device's native cadence.
//!
//! # Architecture
//!
//! The relay keeps three guarantees by construction:
//!
//! 1. **No lost buffers**: every dequeued buffer is requeued exactly once,
//!    whether it was sent, skipped, evicted or failed conversion. The one
//!    exception is the in-flight frame abandoned at shutdown, which is
//!    unmapped with the rest of the pool.
//! 2. **No use after release**: a `CapturedFrame` is a move-only token. Its
//!    bytes are only reachable while it is held, and `BufferPool::release`
//!    consumes it.
//! 3. **Async lifetime**: memory handed to an asynchronous send stays untouched
//!    until the next send returns.
//!
//! Data flow: `BufferPool` -> capture loop (`Relay`) -> `Dispatcher`
//! (sync, async double buffer, or threaded through `FrameQueue` and the
//! processing thread) -> `Sink`.
//!
//! # Module Structure
//!
//! - `capture`: capture sources (V4L2 device nodes, `stub://` synthetic devices)
//! - `pool`: buffer ownership (`BufferPool`, `CapturedFrame`)
//! - `queue`: bounded drop-oldest frame queue
//! - `dispatch`, `processor`: dispatch strategies and the processing thread
//! - `sink`: transmitters (NDI, recording stub)
//! - `relay`: capture loop and lifecycle
//! - `config`, `stats`, `convert`, `format`, `error`: supporting types

pub mod capture;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod relay;
pub mod sink;
pub mod stats;

pub use capture::{open_device, CaptureDevice, FormatRequest, NegotiatedFormat, StubConfig, StubDevice};
pub use config::{DispatchMode, Overrides, RelayConfig, SinkKind};
pub use convert::{yuyv_to_uyvy_in_place, Conversion};
pub use dispatch::{Dispatcher, DoubleBuffer};
pub use error::{CaptureError, ConvertError};
pub use format::{CaptureFormat, FourCc, FrameRate, Resolution};
pub use pool::{BufferPool, CapturedFrame, FrameRecycler, Ownership};
pub use processor::{ProcessorExit, ProcessorHandle};
pub use queue::{FrameQueue, QueueItem};
pub use relay::{PipelineContext, Relay, Step};
pub use sink::{open_sink, OutgoingFrame, Sink, StubSink};
pub use stats::{RelayStats, StatsSnapshot};
