use super::{DecoderEngine, EngineContext, EngineKind, ReorderQueue, SkipPolicy};
use crate::av::{Packet, Rational, StreamInfo, VideoFrame};
use crate::{PipelineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};

/// Reports failures a platform decoder detects outside of a `decode` call
/// (device loss, driver resets).
#[derive(Clone)]
pub struct ErrorSink {
    ctx: EngineContext,
}

impl ErrorSink {
    pub fn report(&self, error: PipelineError) {
        if self.ctx.emit_error(error).is_err() {
            debug!("engine {} reported an error after its stage went away", self.ctx.serial());
        }
    }
}

/// A decoder provided by the platform (system codec or hardware).
#[async_trait]
pub trait PlatformDecoder: Send {
    fn is_supported(&self, params: &StreamInfo) -> bool;

    /// Whether output already comes in presentation order.
    fn ordered_output(&self) -> bool {
        false
    }

    async fn configure(
        &mut self,
        params: &StreamInfo,
        extra_data: Option<&Bytes>,
        threads: usize,
        errors: ErrorSink,
    ) -> Result<()>;

    /// Decodes one access unit, returning whatever frames are ready now.
    async fn decode(&mut self, data: &Bytes, pts: i64, is_key: bool) -> Result<Vec<VideoFrame>>;

    async fn flush(&mut self) -> Result<Vec<VideoFrame>>;

    async fn close(&mut self);

    fn set_skip_policy(&mut self, _policy: SkipPolicy) {}
}

/// Source of platform decoders for the default engine factory.
pub trait PlatformProvider: Send + Sync {
    fn software(&self, params: &StreamInfo) -> Option<Box<dyn PlatformDecoder>>;

    fn hardware(&self, params: &StreamInfo) -> Option<Box<dyn PlatformDecoder>>;
}

/// Adapts a [`PlatformDecoder`] to the [`DecoderEngine`] contract.
pub struct NativeAdapter<D: PlatformDecoder + ?Sized = dyn PlatformDecoder> {
    decoder: Box<D>,
    kind: EngineKind,
    ctx: EngineContext,
    params: Option<StreamInfo>,
    extra_data: Option<Bytes>,
    threads: usize,
    /// Time base of the packets fed so far; drained frames carry it too.
    time_base: Rational,
    reorder: ReorderQueue,
    need_keyframe: bool,
}

impl<D: PlatformDecoder + ?Sized> NativeAdapter<D> {
    pub fn new(decoder: Box<D>, kind: EngineKind, ctx: EngineContext) -> Self {
        Self {
            decoder,
            kind,
            ctx,
            params: None,
            extra_data: None,
            threads: 1,
            time_base: Rational::MILLIS,
            reorder: ReorderQueue::new(false),
            need_keyframe: true,
        }
    }

    fn emit(&self, frames: Vec<VideoFrame>) -> Result<()> {
        for frame in frames {
            self.ctx.emit_frame(frame)?;
        }
        Ok(())
    }

    /// Pushes whatever the decoder still holds through the reorder queue.
    async fn drain(&mut self) -> Result<()> {
        let drained = self.decoder.flush().await?;
        for mut frame in drained {
            frame.time_base = self.time_base;
            let ready = self.reorder.push_output(frame);
            self.emit(ready)?;
        }
        let held = self.reorder.flush();
        self.emit(held)
    }

    async fn reconfigure(&mut self, extra_data: Bytes) -> Result<()> {
        let Some(params) = self.params.clone() else {
            return Err(PipelineError::InvalidOperate("decoder not opened".into()));
        };
        debug!(
            "{} engine {}: extradata changed, reconfiguring",
            self.kind,
            self.ctx.serial()
        );

        self.drain().await?;

        let errors = ErrorSink {
            ctx: self.ctx.clone(),
        };
        self.decoder
            .configure(&params, Some(&extra_data), self.threads, errors)
            .await?;
        self.extra_data = Some(extra_data);
        self.need_keyframe = true;
        Ok(())
    }
}

#[async_trait]
impl<D: PlatformDecoder + ?Sized> DecoderEngine for NativeAdapter<D> {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn is_supported(&self, params: &StreamInfo) -> bool {
        self.decoder.is_supported(params)
    }

    async fn open(&mut self, params: &StreamInfo, threads: usize) -> Result<()> {
        let errors = ErrorSink {
            ctx: self.ctx.clone(),
        };
        self.decoder
            .configure(params, params.extra_data.as_ref(), threads, errors)
            .await
            .map_err(|e| PipelineError::CodecNotSupport(e.to_string()))?;

        self.params = Some(params.clone());
        self.extra_data = params.extra_data.clone();
        self.threads = threads;
        self.time_base = params.time_base;
        self.reorder = ReorderQueue::new(!self.decoder.ordered_output());
        self.need_keyframe = true;
        Ok(())
    }

    async fn decode(&mut self, packet: &Packet) -> Result<()> {
        if let Some(extra_data) = packet.new_extra_data() {
            if self.extra_data.as_ref() != Some(extra_data) {
                self.reconfigure(extra_data.clone()).await?;
            }
        }

        if self.need_keyframe {
            if !packet.is_key {
                debug!("{} engine dropped a packet while waiting for a keyframe", self.kind);
                return Ok(());
            }
            self.need_keyframe = false;
        }

        let pts = packet.timestamp().unwrap_or(0);
        self.time_base = packet.time_base;
        self.reorder.push_input(pts);
        let frames = self.decoder.decode(&packet.data, pts, packet.is_key).await?;
        for mut frame in frames {
            frame.time_base = self.time_base;
            let ready = self.reorder.push_output(frame);
            self.emit(ready)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.drain().await?;
        self.need_keyframe = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.decoder.close().await;
        let dropped = self.reorder.flush().len();
        if dropped > 0 {
            warn!("{} engine closed with {} frames held", self.kind, dropped);
        }
    }

    fn set_skip_policy(&mut self, policy: SkipPolicy) {
        self.decoder.set_skip_policy(policy);
    }

    fn queue_depth(&self) -> usize {
        self.reorder.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::{CodecType, FramePool, Rational};
    use crate::codec::engine::{EngineEvent, EngineMessage};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Calls {
        configured: Vec<Option<Bytes>>,
        decoded: Vec<i64>,
    }

    /// Emits each picture one call late, in decode order.
    struct LaggingDecoder {
        calls: Arc<Mutex<Calls>>,
        delayed: Option<VideoFrame>,
    }

    #[async_trait]
    impl PlatformDecoder for LaggingDecoder {
        fn is_supported(&self, params: &StreamInfo) -> bool {
            params.codec_type == CodecType::H264
        }

        async fn configure(
            &mut self,
            _params: &StreamInfo,
            extra_data: Option<&Bytes>,
            _threads: usize,
            _errors: ErrorSink,
        ) -> Result<()> {
            self.calls.lock().configured.push(extra_data.cloned());
            Ok(())
        }

        async fn decode(&mut self, _data: &Bytes, pts: i64, is_key: bool) -> Result<Vec<VideoFrame>> {
            self.calls.lock().decoded.push(pts);
            let frame = VideoFrame {
                pts,
                key_frame: is_key,
                ..Default::default()
            };
            Ok(self.delayed.replace(frame).into_iter().collect())
        }

        async fn flush(&mut self) -> Result<Vec<VideoFrame>> {
            Ok(self.delayed.take().into_iter().collect())
        }

        async fn close(&mut self) {}
    }

    fn adapter() -> (
        NativeAdapter<LaggingDecoder>,
        Arc<Mutex<Calls>>,
        mpsc::UnboundedReceiver<EngineMessage>,
    ) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let decoder = LaggingDecoder {
            calls: calls.clone(),
            delayed: None,
        };
        let ctx = EngineContext::new(1, FramePool::new(), tx);
        (
            NativeAdapter::new(Box::new(decoder), EngineKind::SoftwareNative, ctx),
            calls,
            rx,
        )
    }

    fn params() -> StreamInfo {
        StreamInfo::new(0, CodecType::H264, Rational::MPEG).with_extra_data(vec![0x67, 0x01])
    }

    fn drain_frames(rx: &mut mpsc::UnboundedReceiver<EngineMessage>) -> Vec<VideoFrame> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let EngineEvent::Frame(frame) = message.event {
                out.push(VideoFrame::clone(&frame));
            }
        }
        out
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineMessage>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let EngineEvent::Frame(frame) = message.event {
                out.push(frame.pts);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_presentation_order_output() {
        let (mut engine, _calls, mut rx) = adapter();
        engine.open(&params(), 2).await.unwrap();

        for (pts, key) in [(0, true), (3, false), (1, false), (2, false)] {
            let packet = Packet::new(vec![0u8]).with_pts(pts).with_key_flag(key);
            engine.decode(&packet).await.unwrap();
        }
        assert_eq!(drain(&mut rx), vec![0, 1]);
        assert_eq!(engine.queue_depth(), 2);

        engine.flush().await.unwrap();
        assert_eq!(drain(&mut rx), vec![2, 3]);
        assert_eq!(engine.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_drained_frames_keep_time_base() {
        let (mut engine, _calls, mut rx) = adapter();
        engine.open(&params(), 1).await.unwrap();

        for (pts, key) in [(0, true), (40, false)] {
            let packet = Packet::new(vec![0u8])
                .with_pts(pts)
                .with_key_flag(key)
                .with_time_base(Rational::MILLIS);
            engine.decode(&packet).await.unwrap();
        }
        // the second picture only comes out of the flush
        engine.flush().await.unwrap();

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.iter().map(|f| f.pts).collect::<Vec<_>>(), vec![0, 40]);
        assert!(frames.iter().all(|f| f.time_base == Rational::MILLIS));
        assert_eq!(frames[1].pts_millis(), 40);
    }

    #[tokio::test]
    async fn test_keyframe_gating() {
        let (mut engine, calls, _rx) = adapter();
        engine.open(&params(), 1).await.unwrap();

        engine.decode(&Packet::new(vec![0u8]).with_pts(1)).await.unwrap();
        engine
            .decode(&Packet::new(vec![0u8]).with_pts(2).with_key_flag(true))
            .await
            .unwrap();
        engine.decode(&Packet::new(vec![0u8]).with_pts(3)).await.unwrap();

        assert_eq!(calls.lock().decoded, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_extradata_change_reconfigures_once() {
        let (mut engine, calls, _rx) = adapter();
        engine.open(&params(), 1).await.unwrap();

        let mut same = Packet::new(vec![0u8]).with_pts(0).with_key_flag(true);
        same.set_new_extra_data(Bytes::from_static(&[0x67, 0x01]));
        engine.decode(&same).await.unwrap();
        assert_eq!(calls.lock().configured.len(), 1);

        let mut changed = Packet::new(vec![0u8]).with_pts(1);
        changed.set_new_extra_data(Bytes::from_static(&[0x67, 0x02]));
        engine.decode(&changed).await.unwrap();

        let calls = calls.lock();
        assert_eq!(
            calls.configured,
            vec![
                Some(Bytes::from_static(&[0x67, 0x01])),
                Some(Bytes::from_static(&[0x67, 0x02]))
            ]
        );
        // reconfiguring rearms keyframe gating, so the delta packet is skipped
        assert_eq!(calls.decoded, vec![0]);
    }
}
