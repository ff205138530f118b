use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::shared::frame::RawFrame;

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    dropped: AtomicUsize,
    /// Drops not yet reported through `take_dropped`.
    unreported: AtomicUsize,
}

/// Bounded live-frame queue that evicts the oldest frame when full.
///
/// The producer never blocks; the consumer reads through a plain
/// crossbeam receiver so it can sit in a `select!`.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<RawFrame>,
    rx: Receiver<RawFrame>,
    stats: Arc<Stats>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            stats: Arc::new(Stats::default()),
        }
    }

    /// Enqueues `frame`, evicting older frames as needed. Returns how many
    /// were evicted.
    pub fn push(&self, frame: RawFrame) -> usize {
        let mut frame = frame;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    if let Ok(old) = self.rx.try_recv() {
                        log::trace!("queue full, dropping frame {}", old.index());
                        evicted += 1;
                    }
                }
                // Unreachable while `self` holds a receiver.
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.stats.dropped.fetch_add(evicted, Ordering::Relaxed);
            self.stats.unreported.fetch_add(evicted, Ordering::Relaxed);
        }
        evicted
    }

    pub fn receiver(&self) -> &Receiver<RawFrame> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(0)
    }

    /// Total frames evicted so far.
    pub fn dropped(&self) -> usize {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Drops evicted since the previous call.
    pub fn take_dropped(&self) -> usize {
        self.stats.unreported.swap(0, Ordering::Relaxed)
    }

    /// Discards everything queued, releasing frame memory.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}
