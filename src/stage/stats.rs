//! Optional statistics collaborator.
//!
//! Stages call into a [`StatsSink`] when one is attached to a task; nothing
//! in the pipeline depends on it being there.

use crate::av::{MediaKind, Packet};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Receives incremental counter updates from the stages. Every method
/// defaults to doing nothing.
pub trait StatsSink: Send + Sync {
    fn on_packet(&self, _track: usize, _kind: MediaKind, _size: usize) {}

    fn on_queue_depth(&self, _track: usize, _depth: usize) {}

    /// A GOP closed: `length` packets, `interval_ms` between its keyframes.
    fn on_gop(&self, _track: usize, _length: u32, _interval_ms: i64) {}

    fn on_encode_rate(&self, _track: usize, _fps: f64) {}

    fn on_frame(&self, _size: usize) {}

    fn on_decode_error(&self) {}

    /// Queue statistics start over, e.g. after a seek.
    fn on_reset(&self) {}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackStats {
    pub packets: u64,
    pub bytes: u64,
    pub queue_depth: usize,
    pub gop_length: Option<u32>,
    pub keyframe_interval_ms: Option<i64>,
    pub encode_fps: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub tracks: BTreeMap<usize, TrackStats>,
    pub frames: u64,
    pub frame_bytes: u64,
    pub decode_errors: u64,
}

impl StatsSnapshot {
    pub fn total_packets(&self) -> u64 {
        self.tracks.values().map(|t| t.packets).sum()
    }
}

/// A [`StatsSink`] that keeps plain counters.
#[derive(Default)]
pub struct StreamStatistics {
    inner: Mutex<StatsSnapshot>,
}

impl StreamStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().clone()
    }
}

impl StatsSink for StreamStatistics {
    fn on_packet(&self, track: usize, _kind: MediaKind, size: usize) {
        let mut inner = self.inner.lock();
        let stats = inner.tracks.entry(track).or_default();
        stats.packets += 1;
        stats.bytes += size as u64;
    }

    fn on_queue_depth(&self, track: usize, depth: usize) {
        self.inner.lock().tracks.entry(track).or_default().queue_depth = depth;
    }

    fn on_gop(&self, track: usize, length: u32, interval_ms: i64) {
        let mut inner = self.inner.lock();
        let stats = inner.tracks.entry(track).or_default();
        stats.gop_length = Some(length);
        stats.keyframe_interval_ms = Some(interval_ms);
    }

    fn on_encode_rate(&self, track: usize, fps: f64) {
        self.inner.lock().tracks.entry(track).or_default().encode_fps = Some(fps);
    }

    fn on_frame(&self, size: usize) {
        let mut inner = self.inner.lock();
        inner.frames += 1;
        inner.frame_bytes += size as u64;
    }

    fn on_decode_error(&self) {
        self.inner.lock().decode_errors += 1;
    }

    fn on_reset(&self) {
        for stats in self.inner.lock().tracks.values_mut() {
            stats.queue_depth = 0;
        }
    }
}

/// What a [`GopTracker`] learned from one packet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GopUpdate {
    /// Set when the packet is a keyframe closing a GOP: (length, interval ms).
    pub closed_gop: Option<(u32, i64)>,
    pub encode_fps: Option<f64>,
}

/// Per-track GOP and encode-rate estimation from the demuxed packet stream.
#[derive(Debug, Clone, Default)]
pub struct GopTracker {
    first_dts_ms: Option<i64>,
    last_dts_ms: Option<i64>,
    last_key_ms: Option<i64>,
    since_key: u32,
    packets: u64,
}

impl GopTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, kind: MediaKind, packet: &Packet) -> GopUpdate {
        let mut update = GopUpdate::default();
        let dts_ms = packet
            .dts
            .or(packet.pts)
            .map(|ts| packet.time_base.to_millis(ts));

        if let Some(dts) = dts_ms {
            self.first_dts_ms.get_or_insert(dts);
            self.last_dts_ms = Some(dts);
        }
        self.packets += 1;

        if kind != MediaKind::Video {
            return update;
        }

        if packet.is_key {
            if let (Some(last), Some(now)) = (self.last_key_ms, packet.pts_millis()) {
                update.closed_gop = Some((self.since_key, now - last));
            }
            if let Some(now) = packet.pts_millis() {
                self.last_key_ms = Some(now);
            }
            self.since_key = 0;
        }
        self.since_key += 1;

        if let (Some(first), Some(last)) = (self.first_dts_ms, self.last_dts_ms) {
            if last > first {
                update.encode_fps = Some((self.packets - 1) as f64 * 1000.0 / (last - first) as f64);
            }
        }
        update
    }

    /// The stream was repositioned; timestamps start over.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
