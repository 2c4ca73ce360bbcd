//! Processing thread for threaded dispatch.
//!
//! Drains the frame queue and sends each frame asynchronously straight from
//! mapped capture memory. The sink may read a frame until the following send,
//! so the thread always retains the latest submitted frame and releases the
//! one before it only after the next send has returned.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::pool::CapturedFrame;
use crate::queue::{FrameQueue, QueueItem};
use crate::relay::PipelineContext;
use crate::sink::OutgoingFrame;

/// What the processing thread hands back when it stops.
#[derive(Debug)]
pub struct ProcessorExit {
    /// Frames submitted to the sink.
    pub delivered: u64,
    /// The last submitted frame, still referenced by the sink at exit and
    /// therefore never released.
    pub abandoned: Option<CapturedFrame>,
}

pub struct ProcessorHandle {
    join: JoinHandle<Result<ProcessorExit>>,
}

impl ProcessorHandle {
    pub fn spawn(ctx: Arc<PipelineContext>, queue: Arc<FrameQueue>) -> Result<Self> {
        let join = std::thread::Builder::new()
            .name("v4l2ndi-process".to_string())
            .spawn(move || {
                let result = process_frames(&ctx, &queue);
                if let Err(err) = &result {
                    log::error!("processing thread stopped: {:#}", err);
                    ctx.stats.set_last_error(err);
                }
                result
            })?;
        Ok(Self { join })
    }

    /// True once the thread has returned, normally or not.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<ProcessorExit> {
        self.join
            .join()
            .map_err(|_| anyhow!("processing thread panicked"))?
    }
}

fn process_frames(ctx: &PipelineContext, queue: &FrameQueue) -> Result<ProcessorExit> {
    let mut in_flight: Option<CapturedFrame> = None;
    let mut delivered = 0u64;
    loop {
        queue.wait_for_data();
        while let Some(item) = queue.try_pop() {
            let mut frame = match item {
                QueueItem::Frame(frame) => frame,
                QueueItem::Terminate => {
                    if let Some(frame) = &in_flight {
                        log::debug!(
                            "processing thread: leaving buffer {} with the sink at exit",
                            frame.index()
                        );
                    }
                    return Ok(ProcessorExit {
                        delivered,
                        abandoned: in_flight,
                    });
                }
            };

            if let Err(err) = ctx
                .conversion
                .apply(ctx.pool.bytes_mut(&mut frame), ctx.resolution)
            {
                log::warn!("dropping frame {}: {}", frame.sequence(), err);
                ctx.stats.record_conversion_failure(&err);
                ctx.pool.release(frame)?;
                continue;
            }

            let outgoing = OutgoingFrame::uyvy(ctx.resolution, ctx.frame_rate, ctx.pool.bytes(&frame));
            // SAFETY: `frame` moves into `in_flight` and is not released until
            // the next send has returned.
            unsafe { ctx.sink.send_async(&outgoing)? };

            if let Some(previous) = in_flight.replace(frame) {
                ctx.pool.release(previous)?;
            }
            delivered += 1;
            ctx.stats.record_dispatched();
        }
    }
}
