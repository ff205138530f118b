use std::collections::BTreeMap;

use crate::shared::frame::RawFrame;
use crate::shared::region::FaceBox;

enum Slot {
    /// The frame is at the detector.
    Pending,
    Detected {
        frame: RawFrame,
        face: Option<FaceBox>,
    },
    /// Skipped by the detection cadence.
    Unsampled { frame: RawFrame },
}

/// What the tracker gets to know about a released frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Alignment {
    Detected(Option<FaceBox>),
    /// Not sent to the detector. `upcoming` is the next sampled frame's
    /// face when it is already known.
    Unsampled { upcoming: Option<FaceBox> },
}

/// Reorders frames and asynchronous detection results by frame index.
///
/// Frames are released strictly in index order. An unsampled frame is
/// held until the next sampled frame has resolved, so the tracker can
/// bridge the gap.
#[derive(Default)]
pub struct FrameAligner {
    slots: BTreeMap<usize, Slot>,
    in_flight: usize,
}

impl FrameAligner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that frame `index` was sent to the detector.
    pub fn mark_pending(&mut self, index: usize) {
        if self.slots.insert(index, Slot::Pending).is_none() {
            self.in_flight += 1;
        }
    }

    pub fn push_unsampled(&mut self, frame: RawFrame) {
        self.slots.insert(frame.index(), Slot::Unsampled { frame });
    }

    /// Attaches a detection result to its pending frame.
    pub fn resolve(&mut self, frame: RawFrame, face: Option<FaceBox>) {
        let index = frame.index();
        match self.slots.get(&index) {
            Some(Slot::Pending) => self.in_flight -= 1,
            _ => {
                log::debug!("detection for unknown frame {index} ignored");
                return;
            }
        }
        self.slots.insert(index, Slot::Detected { frame, face });
    }

    /// Detections sent but not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Frames held, pending ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Releases the lowest-index frame if it can go. With `finishing`,
    /// unsampled frames no longer wait for a later sampled frame.
    pub fn pop_ready(&mut self, finishing: bool) -> Option<(RawFrame, Alignment)> {
        let (&index, head) = self.slots.iter().next()?;
        let alignment = match head {
            Slot::Pending => return None,
            Slot::Detected { .. } => None,
            Slot::Unsampled { .. } => {
                let next_sampled = self
                    .slots
                    .range(index + 1..)
                    .map(|(_, s)| s)
                    .find(|s| !matches!(s, Slot::Unsampled { .. }));
                match next_sampled {
                    Some(Slot::Pending) => return None,
                    Some(Slot::Detected { face, .. }) => Some(Alignment::Unsampled { upcoming: *face }),
                    _ if finishing => Some(Alignment::Unsampled { upcoming: None }),
                    _ => return None,
                }
            }
        };

        match self.slots.remove(&index)? {
            Slot::Detected { frame, face } => Some((frame, Alignment::Detected(face))),
            Slot::Unsampled { frame } => alignment.map(|a| (frame, a)),
            Slot::Pending => None,
        }
    }

    /// Forgets everything, pending detections included.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.in_flight = 0;
    }
}
