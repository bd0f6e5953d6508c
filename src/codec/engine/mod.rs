//! # Decoder engines
//!
//! The decode stage drives one of three engine kinds through the
//! [`DecoderEngine`] contract:
//!
//! - [`EngineKind::Hardware`]: a platform decoder backed by a hardware codec,
//! - [`EngineKind::SoftwareNative`]: a platform software codec,
//! - [`EngineKind::SoftwarePortable`]: the bundled [`H264Engine`].
//!
//! Platform decoders are plugged in through [`PlatformProvider`] and wrapped
//! in a [`NativeAdapter`], which handles output reordering, extradata changes
//! and keyframe gating. Engines hand decoded frames (and asynchronous errors)
//! to the stage through their [`EngineContext`], tagged with the engine's
//! serial so the stage can ignore engines it has already replaced.

mod h264;
mod native;
mod reorder;

pub use self::h264::H264Engine;
pub use native::{ErrorSink, NativeAdapter, PlatformDecoder, PlatformProvider};
pub use reorder::ReorderQueue;

use crate::av::{FramePool, FrameRef, Packet, StreamInfo, VideoFrame};
use crate::{PipelineError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Hardware,
    SoftwareNative,
    SoftwarePortable,
}

impl EngineKind {
    pub fn is_software(&self) -> bool {
        !matches!(self, EngineKind::Hardware)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Hardware => "hardware",
            EngineKind::SoftwareNative => "software-native",
            EngineKind::SoftwarePortable => "software-portable",
        })
    }
}

/// Which pictures a software engine may skip to keep up with fast playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipPolicy {
    #[default]
    None,
    /// Skip pictures nothing references.
    NonRef,
    /// Skip everything but intra pictures.
    NonIntra,
    /// Decode IDR pictures only.
    KeyOnly,
}

impl SkipPolicy {
    /// Policy for a source of `fps` frames per second played at `rate`.
    pub fn for_play_rate(fps: f64, rate: f64) -> Self {
        let effective = fps * rate;
        if rate <= 1.0 || effective <= 60.0 {
            SkipPolicy::None
        } else if effective <= 120.0 {
            SkipPolicy::NonRef
        } else if effective <= 240.0 {
            SkipPolicy::NonIntra
        } else {
            SkipPolicy::KeyOnly
        }
    }
}

pub enum EngineEvent {
    Frame(FrameRef),
    /// A failure reported outside of a `decode` call.
    Error(PipelineError),
}

/// An [`EngineEvent`] tagged with the serial of the engine that produced it.
pub struct EngineMessage {
    pub serial: u64,
    pub event: EngineEvent,
}

/// Output side of an engine: where its frames and asynchronous errors go.
#[derive(Clone)]
pub struct EngineContext {
    serial: u64,
    pool: FramePool,
    events: mpsc::UnboundedSender<EngineMessage>,
}

impl EngineContext {
    pub fn new(serial: u64, pool: FramePool, events: mpsc::UnboundedSender<EngineMessage>) -> Self {
        Self {
            serial,
            pool,
            events,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Moves `frame` into a pooled buffer and hands it to the stage.
    pub fn emit_frame(&self, frame: VideoFrame) -> Result<()> {
        let mut pooled = self.pool.alloc()?;
        *pooled = frame;
        self.send(EngineEvent::Frame(pooled))
    }

    pub fn emit_error(&self, error: PipelineError) -> Result<()> {
        self.send(EngineEvent::Error(error))
    }

    fn send(&self, event: EngineEvent) -> Result<()> {
        self.events
            .send(EngineMessage {
                serial: self.serial,
                event,
            })
            .map_err(|_| PipelineError::PortClosed)
    }
}

/// The decoder contract the decode stage drives.
///
/// Frames are not returned from `decode`; engines emit them through their
/// [`EngineContext`] whenever they become available, and `flush` emits every
/// frame still buffered before it returns.
#[async_trait]
pub trait DecoderEngine: Send {
    fn kind(&self) -> EngineKind;

    fn is_supported(&self, params: &StreamInfo) -> bool;

    async fn open(&mut self, params: &StreamInfo, threads: usize) -> Result<()>;

    async fn decode(&mut self, packet: &Packet) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    async fn close(&mut self);

    fn set_skip_policy(&mut self, _policy: SkipPolicy) {}

    /// Packets accepted but not yet turned into frames.
    fn queue_depth(&self) -> usize {
        0
    }
}

/// Builds engines of a requested kind; `None` when that kind is unavailable.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        kind: EngineKind,
        params: &StreamInfo,
        ctx: EngineContext,
    ) -> Option<Box<dyn DecoderEngine>>;
}

/// The bundled portable engine, plus platform engines when a provider is set.
#[derive(Clone, Default)]
pub struct DefaultEngineFactory {
    platform: Option<Arc<dyn PlatformProvider>>,
}

impl DefaultEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform(platform: Arc<dyn PlatformProvider>) -> Self {
        Self {
            platform: Some(platform),
        }
    }
}

impl EngineFactory for DefaultEngineFactory {
    fn create(
        &self,
        kind: EngineKind,
        params: &StreamInfo,
        ctx: EngineContext,
    ) -> Option<Box<dyn DecoderEngine>> {
        let engine: Box<dyn DecoderEngine> = match kind {
            EngineKind::SoftwarePortable => Box::new(H264Engine::new(ctx)),
            EngineKind::SoftwareNative => {
                let decoder = self.platform.as_ref()?.software(params)?;
                Box::new(NativeAdapter::new(decoder, EngineKind::SoftwareNative, ctx))
            }
            EngineKind::Hardware => {
                let decoder = self.platform.as_ref()?.hardware(params)?;
                Box::new(NativeAdapter::new(decoder, EngineKind::Hardware, ctx))
            }
        };
        engine.is_supported(params).then_some(engine)
    }
}

/// Software decoder threads for `params`, capped at `available`.
///
/// Higher resolutions and frame rates get more threads, as do codecs that
/// cost more per pixel than H.264.
pub fn thread_count(params: &StreamInfo, available: usize) -> usize {
    let pixels = params.width.unwrap_or(0) as u64 * params.height.unwrap_or(0) as u64;
    let mut threads = match pixels {
        p if p >= 3840 * 2160 => 8,
        p if p >= 1920 * 1080 => 4,
        p if p >= 1280 * 720 => 2,
        _ => 1,
    };

    if params.fps().is_some_and(|fps| fps > 30.0) {
        threads *= 2;
    }
    if params.codec_type.is_compute_heavy() {
        threads += (threads / 2).max(1);
    }

    threads.clamp(1, available.max(1))
}

/// [`thread_count`] against the machine's logical CPUs.
pub fn default_thread_count(params: &StreamInfo) -> usize {
    thread_count(params, num_cpus::get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::{CodecType, Rational};

    fn video(codec: CodecType, width: u32, height: u32, fps: i32) -> StreamInfo {
        StreamInfo::new(0, codec, Rational::MPEG)
            .with_dimensions(width, height)
            .with_frame_rate(Rational::new(fps, 1))
    }

    #[test]
    fn test_thread_count_heuristic() {
        assert_eq!(thread_count(&video(CodecType::H264, 640, 360, 25), 16), 1);
        assert_eq!(thread_count(&video(CodecType::H264, 1920, 1080, 25), 16), 4);
        assert_eq!(thread_count(&video(CodecType::H264, 1920, 1080, 60), 16), 8);
        assert_eq!(thread_count(&video(CodecType::H265, 1920, 1080, 25), 16), 6);
        assert_eq!(thread_count(&video(CodecType::AV1, 3840, 2160, 60), 4), 4);
        assert_eq!(thread_count(&video(CodecType::H264, 3840, 2160, 30), 0), 1);
    }

    #[test]
    fn test_skip_policy_for_rate() {
        assert_eq!(SkipPolicy::for_play_rate(30.0, 1.0), SkipPolicy::None);
        assert_eq!(SkipPolicy::for_play_rate(30.0, 2.0), SkipPolicy::None);
        assert_eq!(SkipPolicy::for_play_rate(30.0, 4.0), SkipPolicy::NonRef);
        assert_eq!(SkipPolicy::for_play_rate(60.0, 4.0), SkipPolicy::NonIntra);
        assert_eq!(SkipPolicy::for_play_rate(60.0, 16.0), SkipPolicy::KeyOnly);
        assert_eq!(SkipPolicy::for_play_rate(120.0, 0.5), SkipPolicy::None);
    }

    #[tokio::test]
    async fn test_factory_without_platform() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = DefaultEngineFactory::new();
        let params = video(CodecType::H264, 320, 240, 25);
        let ctx = |serial| EngineContext::new(serial, FramePool::new(), tx.clone());

        let portable = factory.create(EngineKind::SoftwarePortable, &params, ctx(1));
        assert_eq!(portable.map(|e| e.kind()), Some(EngineKind::SoftwarePortable));
        assert!(factory.create(EngineKind::Hardware, &params, ctx(2)).is_none());
        assert!(factory.create(EngineKind::SoftwareNative, &params, ctx(3)).is_none());

        let hevc = video(CodecType::H265, 320, 240, 25);
        assert!(factory.create(EngineKind::SoftwarePortable, &hevc, ctx(4)).is_none());
    }

    #[tokio::test]
    async fn test_context_tags_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = FramePool::new();
        let ctx = EngineContext::new(7, pool.clone(), tx);

        ctx.emit_frame(VideoFrame {
            pts: 40,
            ..Default::default()
        })
        .unwrap();
        ctx.emit_error(PipelineError::Codec("lost device".into())).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.serial, 7);
        match first.event {
            EngineEvent::Frame(frame) => assert_eq!(frame.pts, 40),
            EngineEvent::Error(_) => panic!("expected a frame"),
        }
        assert_eq!(pool.live(), 0);
        assert!(matches!(rx.recv().await.unwrap().event, EngineEvent::Error(_)));
    }
}
