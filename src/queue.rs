//! Bounded frame handoff between the capture thread and the processing thread.
//!
//! Single producer, single consumer, one mutex and one condition variable.
//! Overflow never blocks the producer: the oldest queued frames are evicted
//! and handed back to the pool. Termination is an in-band sentinel, so the
//! consumer cannot observe "empty" and "exit" out of order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::CaptureError;
use crate::pool::{CapturedFrame, FrameRecycler};

/// Default maximum queue depth.
pub const DEFAULT_MAX_DEPTH: usize = 3;

#[derive(Debug)]
pub enum QueueItem {
    Frame(CapturedFrame),
    Terminate,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    terminated: bool,
}

pub struct FrameQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    /// 0 disables the cap.
    max_depth: usize,
    recycler: Arc<dyn FrameRecycler>,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(max_depth: usize, recycler: Arc<dyn FrameRecycler>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            max_depth,
            recycler,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a frame, evicting the oldest frames while the depth exceeds the
    /// cap. Returns how many frames were evicted.
    ///
    /// Evicted frames go back to the pool. A recycle failure is returned after
    /// the push completes; the pool is desynchronized at that point.
    pub fn push(&self, frame: CapturedFrame) -> Result<usize, CaptureError> {
        let mut evicted = Vec::new();
        {
            let mut state = self.lock();
            if state.terminated {
                drop(state);
                log::warn!(
                    "FrameQueue: frame {} pushed after terminate, returning it",
                    frame.index()
                );
                self.recycler.recycle(frame)?;
                return Ok(0);
            }
            state.items.push_back(QueueItem::Frame(frame));
            if self.max_depth > 0 {
                while state.items.len() > self.max_depth {
                    match state.items.pop_front() {
                        Some(QueueItem::Frame(old)) => evicted.push(old),
                        // Frames are never queued behind the sentinel.
                        Some(QueueItem::Terminate) | None => break,
                    }
                }
            }
        }
        self.available.notify_one();

        let count = evicted.len();
        let mut first_err = None;
        for old in evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!(
                "FrameQueue: dropped frame {} (seq {}), {} dropped so far",
                old.index(),
                old.sequence(),
                total
            );
            if let Err(err) = self.recycler.recycle(old) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Enqueue the terminate sentinel behind every queued frame.
    ///
    /// The sentinel is exempt from the depth cap. Returns `false` when the
    /// queue was already terminated.
    pub fn terminate(&self) -> bool {
        {
            let mut state = self.lock();
            if state.terminated {
                log::warn!("FrameQueue: terminate requested twice, ignoring");
                return false;
            }
            state.terminated = true;
            state.items.push_back(QueueItem::Terminate);
        }
        self.available.notify_all();
        true
    }

    /// Pop the oldest item without blocking.
    pub fn try_pop(&self) -> Option<QueueItem> {
        self.lock().items.pop_front()
    }

    /// Block until at least one item is queued.
    pub fn wait_for_data(&self) {
        let mut state = self.lock();
        while state.items.is_empty() {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Frames evicted by the depth cap since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
