use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::pipeline::frame_queue::FrameQueue;
use crate::shared::error::VitalsError;
use crate::video::domain::frame_source::FrameSource;

const PAUSE_POLL: Duration = Duration::from_millis(10);

/// Out-of-band news from the pump thread.
#[derive(Debug)]
pub enum PumpEvent {
    /// A frame could not be read; the source goes on.
    Skipped { index: usize, reason: String },
    Failed(VitalsError),
    Ended,
}

/// Moves frames from `source` into `queue` until the source ends or
/// `cancelled` is set. While `paused`, the source is not read.
///
/// A source blocked in `next_frame` only notices cancellation at its next
/// frame, so callers should not wait on the handle unconditionally.
pub fn spawn_pump(
    mut source: Box<dyn FrameSource>,
    queue: FrameQueue,
    events: Sender<PumpEvent>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut next_index = 0usize;
        loop {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }
            if paused.load(Ordering::Relaxed) {
                std::thread::sleep(PAUSE_POLL);
                continue;
            }

            match source.next_frame() {
                None => {
                    log::debug!("frame source ended after {next_index} frames");
                    let _ = events.send(PumpEvent::Ended);
                    break;
                }
                Some(Ok(frame)) => {
                    next_index = frame.index() + 1;
                    if cancelled.load(Ordering::Relaxed) {
                        break;
                    }
                    queue.push(frame);
                }
                Some(Err(e)) if e.is_fatal() => {
                    let _ = events.send(PumpEvent::Failed(e));
                    break;
                }
                Some(Err(e)) => {
                    let skipped = PumpEvent::Skipped {
                        index: next_index,
                        reason: e.to_string(),
                    };
                    if events.send(skipped).is_err() {
                        break;
                    }
                }
            }
        }
    })
}
