//! Dispatch strategies: how a captured frame reaches the sink.
//!
//! | Mode     | Path                                                    |
//! |----------|---------------------------------------------------------|
//! | Sync     | convert in place, blocking send, release                |
//! | Async    | copy into a `DoubleBuffer` slot, release, async send    |
//! | Threaded | push onto the `FrameQueue` for the processing thread    |
//!
//! Async mode assumes the sink finishes with a frame within one frame
//! interval. The sink contract only guarantees the previous slot is free once
//! the next send returns, and the double buffer reuses a slot two sends later.
//!
//! Threaded mode must leave the driver at least one buffer. The processing
//! thread holds up to two frames (the one being sent and the previous one
//! still in flight), so a bounded queue is capped at `granted - 3` frames.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::config::DispatchMode;
use crate::error::CaptureError;
use crate::pool::CapturedFrame;
use crate::processor::ProcessorHandle;
use crate::queue::FrameQueue;
use crate::relay::PipelineContext;
use crate::sink::OutgoingFrame;

/// Two owned frame copies used alternately for asynchronous sends.
///
/// At most one slot is in flight with the sink; `stage` always writes the
/// other one. Allocations are kept and reused across frames.
#[derive(Debug, Default)]
pub struct DoubleBuffer {
    slots: [Vec<u8>; 2],
    next: usize,
    in_flight: Option<usize>,
}

impl DoubleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `data` into the slot that is not in flight.
    pub fn stage(&mut self, data: &[u8]) -> &mut [u8] {
        let slot = &mut self.slots[self.next];
        slot.clear();
        slot.extend_from_slice(data);
        slot.as_mut_slice()
    }

    /// The staged slot, for submission.
    pub fn staged(&self) -> &[u8] {
        &self.slots[self.next]
    }

    /// Mark the staged slot as submitted and return its index.
    pub fn commit(&mut self) -> usize {
        let submitted = self.next;
        self.in_flight = Some(submitted);
        self.next = 1 - submitted;
        submitted
    }

    pub fn in_flight(&self) -> Option<usize> {
        self.in_flight
    }
}

/// Frames the processing thread can hold outside the queue.
pub const PROCESSOR_HELD_FRAMES: usize = 2;

/// Smallest grant threaded mode can run on: one queued frame, the frames the
/// processor holds, and one buffer left with the driver.
pub const THREADED_MIN_BUFFERS: usize = PROCESSOR_HELD_FRAMES + 2;

/// Queue depth the pool can sustain without starving the driver.
///
/// A bounded depth is lowered to `granted - 3`. `0` (unbounded) is returned
/// unchanged.
pub fn threaded_queue_depth(requested: usize, granted: usize, device: &str) -> Result<usize, CaptureError> {
    if granted < THREADED_MIN_BUFFERS {
        return Err(CaptureError::InsufficientBuffers {
            device: device.to_string(),
            granted: granted as u32,
            required: THREADED_MIN_BUFFERS as u32,
        });
    }
    let limit = granted - PROCESSOR_HELD_FRAMES - 1;
    if requested == 0 {
        log::warn!(
            "dispatch: unbounded queue on {} buffers; a sink slower than capture will stall the driver",
            granted
        );
        return Ok(0);
    }
    if requested > limit {
        log::warn!(
            "dispatch: queue depth {} lowered to {} ({} buffers granted)",
            requested,
            limit,
            granted
        );
        return Ok(limit);
    }
    Ok(requested)
}

pub enum Dispatcher {
    Sync,
    Async(DoubleBuffer),
    Threaded {
        queue: Arc<FrameQueue>,
        processor: Option<ProcessorHandle>,
    },
}

impl Dispatcher {
    /// Build the strategy for `mode`, spawning the processing thread when
    /// threaded. The threaded queue depth is fitted to the pool size.
    pub fn new(mode: DispatchMode, ctx: &Arc<PipelineContext>, queue_depth: usize) -> Result<Self> {
        Ok(match mode {
            DispatchMode::Sync => Dispatcher::Sync,
            DispatchMode::Async => Dispatcher::Async(DoubleBuffer::new()),
            DispatchMode::Threaded => {
                let queue_depth =
                    threaded_queue_depth(queue_depth, ctx.pool.len(), ctx.pool.device_name())?;
                let queue = Arc::new(FrameQueue::new(queue_depth, ctx.pool.clone()));
                let processor = ProcessorHandle::spawn(ctx.clone(), queue.clone())
                    .context("spawn processing thread")?;
                log::info!(
                    "dispatch: threaded, queue depth {}",
                    if queue_depth == 0 {
                        "unbounded".to_string()
                    } else {
                        queue_depth.to_string()
                    }
                );
                Dispatcher::Threaded {
                    queue,
                    processor: Some(processor),
                }
            }
        })
    }

    pub fn mode(&self) -> DispatchMode {
        match self {
            Dispatcher::Sync => DispatchMode::Sync,
            Dispatcher::Async(_) => DispatchMode::Async,
            Dispatcher::Threaded { .. } => DispatchMode::Threaded,
        }
    }

    /// Current frame queue depth (threaded mode only).
    pub fn queue_len(&self) -> Option<usize> {
        match self {
            Dispatcher::Threaded { queue, .. } => Some(queue.len()),
            _ => None,
        }
    }

    /// Move one captured frame toward the sink. Every path returns the buffer
    /// to the pool, now or later.
    pub fn dispatch(&mut self, ctx: &PipelineContext, frame: CapturedFrame) -> Result<()> {
        match self {
            Dispatcher::Sync => dispatch_sync(ctx, frame),
            Dispatcher::Async(double) => dispatch_async(ctx, double, frame),
            Dispatcher::Threaded { queue, processor } => {
                if processor.as_ref().map_or(true, ProcessorHandle::is_finished) {
                    ctx.pool.release(frame)?;
                    return Err(match processor.take().map(ProcessorHandle::join) {
                        Some(Err(err)) => err.context("processing thread failed"),
                        _ => anyhow!("processing thread exited before terminate"),
                    });
                }
                let evicted = queue.push(frame)?;
                if evicted > 0 {
                    ctx.stats.record_dropped(evicted as u64);
                }
                Ok(())
            }
        }
    }

    /// Stop dispatching: drain and join the processing thread, and make sure
    /// the sink no longer references any frame memory.
    pub fn finish(self, ctx: &PipelineContext) -> Result<()> {
        match self {
            Dispatcher::Sync => {}
            Dispatcher::Async(double) => {
                ctx.sink.flush()?;
                drop(double);
            }
            Dispatcher::Threaded { queue, processor } => {
                queue.terminate();
                if let Some(processor) = processor {
                    let exit = processor.join()?;
                    ctx.sink.flush()?;
                    if let Some(frame) = exit.abandoned {
                        ctx.stats.record_abandoned(1);
                        log::debug!(
                            "dispatch: buffer {} abandoned at shutdown ({} delivered)",
                            frame.index(),
                            exit.delivered
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

fn dispatch_sync(ctx: &PipelineContext, mut frame: CapturedFrame) -> Result<()> {
    if let Err(err) = ctx
        .conversion
        .apply(ctx.pool.bytes_mut(&mut frame), ctx.resolution)
    {
        log::warn!("dropping frame {}: {}", frame.sequence(), err);
        ctx.stats.record_conversion_failure(&err);
        ctx.pool.release(frame)?;
        return Ok(());
    }
    let outgoing = OutgoingFrame::uyvy(ctx.resolution, ctx.frame_rate, ctx.pool.bytes(&frame));
    let sent = ctx.sink.send_sync(&outgoing);
    ctx.pool.release(frame)?;
    sent?;
    ctx.stats.record_dispatched();
    Ok(())
}

fn dispatch_async(ctx: &PipelineContext, double: &mut DoubleBuffer, frame: CapturedFrame) -> Result<()> {
    let staged = double.stage(ctx.pool.bytes(&frame));
    ctx.pool.release(frame)?;

    if let Err(err) = ctx.conversion.apply(staged, ctx.resolution) {
        log::warn!("dropping copied frame: {}", err);
        ctx.stats.record_conversion_failure(&err);
        return Ok(());
    }
    let outgoing = OutgoingFrame::uyvy(ctx.resolution, ctx.frame_rate, double.staged());
    // SAFETY: the staged slot is not written again until after the next
    // send, and `finish` flushes the sink before the buffer is dropped.
    unsafe { ctx.sink.send_async(&outgoing)? };
    let slot = double.commit();
    log::trace!("dispatch: async send from slot {}", slot);
    ctx.stats.record_dispatched();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_alternate_on_commit() {
        let mut double = DoubleBuffer::new();
        let mut order = Vec::new();
        for i in 0..4u8 {
            double.stage(&[i; 4]);
            order.push(double.commit());
        }
        assert_eq!(order, vec![0, 1, 0, 1]);
        assert_eq!(double.in_flight(), Some(1));
    }

    #[test]
    fn staging_never_touches_the_in_flight_slot() {
        let mut double = DoubleBuffer::new();
        double.stage(&[1; 4]);
        let first = double.commit();
        double.stage(&[2; 4]);
        assert_eq!(double.slots[first], vec![1; 4]);
        assert_eq!(double.staged(), &[2; 4]);
    }

    #[test]
    fn uncommitted_stage_is_overwritten_in_place() {
        let mut double = DoubleBuffer::new();
        double.stage(&[1; 4]);
        double.stage(&[2; 4]);
        assert_eq!(double.commit(), 0);
        assert_eq!(double.slots[0], vec![2; 4]);
    }

    #[test]
    fn bounded_depth_leaves_the_driver_a_buffer() {
        assert_eq!(threaded_queue_depth(3, 8, "stub://t").unwrap(), 3);
        assert_eq!(threaded_queue_depth(3, 5, "stub://t").unwrap(), 2);
        assert_eq!(threaded_queue_depth(3, 4, "stub://t").unwrap(), 1);
        assert_eq!(threaded_queue_depth(0, 4, "stub://t").unwrap(), 0);
    }

    #[test]
    fn threaded_mode_rejects_a_small_grant() {
        let err = threaded_queue_depth(1, 3, "stub://t").unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InsufficientBuffers {
                granted: 3,
                required: 4,
                ..
            }
        ));
    }

    #[test]
    fn slot_allocations_are_reused() {
        let mut double = DoubleBuffer::new();
        let a = double.stage(&[0; 64]).as_ptr() as usize;
        double.commit();
        let b = double.stage(&[0; 64]).as_ptr() as usize;
        double.commit();
        let a2 = double.stage(&[1; 64]).as_ptr() as usize;
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }
}
