use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

mod frame;
mod packet;
pub mod pool;

pub use frame::*;
pub use packet::*;
pub use pool::{BufferPool, Pooled, Recycle};

/// Pool of demuxed packets shared between the demux and decode stages.
pub type PacketPool = BufferPool<Packet>;
/// A pooled packet; returns to its pool when dropped.
pub type PacketRef = Pooled<Packet>;
/// Pool of decoded frames shared between decode engines and consumers.
pub type FramePool = BufferPool<VideoFrame>;
/// A pooled frame; returns to its pool when dropped.
pub type FrameRef = Pooled<VideoFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecType {
    H264,
    H265,
    VP9,
    AV1,
    AAC,
    MP3,
    OPUS,
    DvbSubtitle,
    WebVtt,
    Unknown,
}

impl CodecType {
    pub fn kind(&self) -> MediaKind {
        match self {
            CodecType::H264 | CodecType::H265 | CodecType::VP9 | CodecType::AV1 => MediaKind::Video,
            CodecType::AAC | CodecType::MP3 | CodecType::OPUS => MediaKind::Audio,
            CodecType::DvbSubtitle | CodecType::WebVtt => MediaKind::Subtitle,
            CodecType::Unknown => MediaKind::Data,
        }
    }

    /// Codecs whose software decode costs noticeably more per pixel than H.264.
    pub fn is_compute_heavy(&self) -> bool {
        matches!(self, CodecType::H265 | CodecType::VP9 | CodecType::AV1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

/// A rational number, used for time bases and frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const MILLIS: Rational = Rational::new(1, 1000);
    pub const MPEG: Rational = Rational::new(1, 90_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    /// Converts `value` expressed in `self` units into `to` units, rounding to nearest.
    pub fn rescale(&self, value: i64, to: Rational) -> i64 {
        let n = value as i128 * self.num as i128 * to.den as i128;
        let d = self.den as i128 * to.num as i128;
        if d == 0 {
            return 0;
        }
        let q = n / d;
        let r = n % d;
        if 2 * r.abs() >= d.abs() {
            (q + n.signum() * d.signum()) as i64
        } else {
            q as i64
        }
    }

    pub fn to_millis(&self, value: i64) -> i64 {
        self.rescale(value, Rational::MILLIS)
    }

    pub fn from_millis(&self, millis: i64) -> i64 {
        Rational::MILLIS.rescale(millis, *self)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Rational::MPEG
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Description of one elementary stream, as produced by stream analysis.
///
/// The decode stage receives the same structure as its codec parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub codec_type: CodecType,
    pub time_base: Rational,
    /// First timestamp of the track, in `time_base` units.
    pub start_time: Option<i64>,
    /// Track duration, in `time_base` units.
    pub duration: Option<i64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<Rational>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub extra_data: Option<Bytes>,
    pub metadata: HashMap<String, String>,
}

impl StreamInfo {
    pub fn new(index: usize, codec_type: CodecType, time_base: Rational) -> Self {
        Self {
            index,
            codec_type,
            time_base,
            start_time: None,
            duration: None,
            width: None,
            height: None,
            frame_rate: None,
            sample_rate: None,
            channels: None,
            extra_data: None,
            metadata: HashMap::new(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.codec_type.kind()
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: Rational) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn with_extra_data(mut self, extra_data: impl Into<Bytes>) -> Self {
        self.extra_data = Some(extra_data.into());
        self
    }

    pub fn with_start_time(mut self, start_time: i64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Frames per second, when known.
    pub fn fps(&self) -> Option<f64> {
        self.frame_rate.map(|r| r.as_f64()).filter(|fps| *fps > 0.0)
    }

    /// Rebases a timestamp of this track to milliseconds since the track start.
    pub fn relative_millis(&self, ts: i64) -> i64 {
        let start = self.start_time.unwrap_or(0);
        self.time_base.to_millis(ts - start)
    }
}
