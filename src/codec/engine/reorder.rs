use crate::av::VideoFrame;
use std::collections::BTreeMap;

/// Frames held back waiting for an earlier picture.
pub const MAX_HELD_FRAMES: usize = 2;

/// Restores presentation order for decoders that emit in decode order.
///
/// Input timestamps are recorded as packets go in. An output frame is released
/// as soon as it is the earliest outstanding input; otherwise it is held, and
/// once more than [`MAX_HELD_FRAMES`] are held the earliest one is released
/// anyway. When disabled, frames pass straight through.
#[derive(Debug, Default)]
pub struct ReorderQueue {
    enabled: bool,
    inputs: BTreeMap<i64, usize>,
    held: Vec<VideoFrame>,
}

impl ReorderQueue {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn push_input(&mut self, pts: i64) {
        *self.inputs.entry(pts).or_insert(0) += 1;
    }

    /// Accepts one decoder output and returns the frames now ready, in order.
    pub fn push_output(&mut self, frame: VideoFrame) -> Vec<VideoFrame> {
        if !self.enabled {
            self.retire(frame.pts);
            return vec![frame];
        }

        let at = self.held.partition_point(|held| held.pts <= frame.pts);
        self.held.insert(at, frame);

        let mut ready = Vec::new();
        while let Some(first) = self.held.first() {
            let next_input = self.inputs.keys().next().copied();
            if next_input == Some(first.pts) || self.held.len() > MAX_HELD_FRAMES {
                let frame = self.held.remove(0);
                self.retire(frame.pts);
                ready.push(frame);
            } else {
                break;
            }
        }
        ready
    }

    /// Releases everything held, in presentation order.
    pub fn flush(&mut self) -> Vec<VideoFrame> {
        self.inputs.clear();
        std::mem::take(&mut self.held)
    }

    /// Packets whose frame has not been released yet.
    pub fn pending(&self) -> usize {
        self.inputs.values().sum()
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    // Inputs at or before a released frame can no longer come out ahead of it.
    fn retire(&mut self, pts: i64) {
        if let Some(count) = self.inputs.get_mut(&pts) {
            *count -= 1;
            if *count == 0 {
                self.inputs.remove(&pts);
            }
        }
        while let Some((&first, _)) = self.inputs.iter().next() {
            if first >= pts {
                break;
            }
            self.inputs.remove(&first);
        }
    }
}
