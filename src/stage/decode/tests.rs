use super::*;
use crate::av::{CodecType, FrameRef, Packet, PacketRef, Rational, VideoFrame};
use crate::codec::engine::{DecoderEngine, EngineContext, EngineKind, SkipPolicy};
use crate::stage::port::{self, PortListener};
use crate::stage::{PullReply, PullRequest};
use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How stub engines of one kind behave.
#[derive(Default, Clone)]
struct Behavior {
    fail_open: bool,
    /// `decode` returns an error for these timestamps.
    fail_decode: HashSet<i64>,
    /// Reports an asynchronous error instead of a frame for this timestamp.
    report_error_at: Option<i64>,
    /// Holds every frame until `flush`.
    hold_frames: bool,
    /// Emits each frame one `decode` call late.
    lag: bool,
    /// `flush` never returns.
    hang_on_flush: bool,
}

#[derive(Default)]
struct Script {
    behavior: HashMap<EngineKind, Behavior>,
    log: Vec<String>,
    policies: Vec<SkipPolicy>,
}

impl Script {
    fn with(kinds: &[(EngineKind, Behavior)]) -> Arc<Mutex<Script>> {
        Arc::new(Mutex::new(Script {
            behavior: kinds.iter().cloned().collect(),
            ..Default::default()
        }))
    }
}

struct StubEngine {
    kind: EngineKind,
    behavior: Behavior,
    ctx: EngineContext,
    script: Arc<Mutex<Script>>,
    held: Vec<i64>,
}

impl StubEngine {
    fn emit(&self, pts: i64) -> Result<()> {
        let frame = VideoFrame {
            data: vec![Bytes::from_static(&[0u8; 8])],
            pts,
            ..Default::default()
        };
        self.ctx.emit_frame(frame)
    }

    fn record(&self, event: &str) {
        self.script
            .lock()
            .log
            .push(format!("{} {}#{}", event, self.kind, self.ctx.serial()));
    }
}

#[async_trait]
impl DecoderEngine for StubEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn is_supported(&self, params: &StreamInfo) -> bool {
        params.codec_type == CodecType::H264
    }

    async fn open(&mut self, _params: &StreamInfo, _threads: usize) -> Result<()> {
        if self.behavior.fail_open {
            self.record("open-failed");
            return Err(PipelineError::CodecNotSupport("stub refuses".into()));
        }
        self.record("open");
        Ok(())
    }

    async fn decode(&mut self, packet: &Packet) -> Result<()> {
        let pts = packet.pts.unwrap_or(0);
        if self.behavior.fail_decode.contains(&pts) {
            return Err(PipelineError::Codec(format!("corrupt picture at {}", pts)));
        }
        if self.behavior.report_error_at == Some(pts) {
            self.ctx
                .emit_error(PipelineError::Codec("device lost".into()))
                .unwrap();
            return Ok(());
        }
        if self.behavior.hold_frames {
            self.held.push(pts);
        } else if self.behavior.lag {
            if let Some(previous) = self.held.pop() {
                self.emit(previous)?;
            }
            self.held.push(pts);
        } else {
            self.emit(pts)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.behavior.hang_on_flush {
            std::future::pending::<()>().await;
        }
        for pts in std::mem::take(&mut self.held) {
            self.emit(pts)?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.record("close");
    }

    fn set_skip_policy(&mut self, policy: SkipPolicy) {
        self.script.lock().policies.push(policy);
    }
}

/// Builds stub engines for the kinds present in the script.
struct StubFactory {
    script: Arc<Mutex<Script>>,
}

impl EngineFactory for StubFactory {
    fn create(
        &self,
        kind: EngineKind,
        params: &StreamInfo,
        ctx: EngineContext,
    ) -> Option<Box<dyn DecoderEngine>> {
        let behavior = self.script.lock().behavior.get(&kind)?.clone();
        let engine = StubEngine {
            kind,
            behavior,
            ctx,
            script: self.script.clone(),
            held: Vec::new(),
        };
        engine.is_supported(params).then(|| Box::new(engine) as Box<dyn DecoderEngine>)
    }
}

/// Serves packets to a decode task and counts its keyframe requests.
struct Upstream {
    port: PacketPort,
    keyframe_requests: Arc<AtomicUsize>,
}

impl Upstream {
    fn serve(packets: Vec<Packet>) -> Self {
        let (port, mut listener) = port::channel::<PullRequest, PullReply<PacketRef>>();
        let keyframe_requests = Arc::new(AtomicUsize::new(0));
        let requests = keyframe_requests.clone();
        tokio::spawn(async move {
            let mut packets = packets.into_iter();
            while let Some(envelope) = listener.recv().await {
                match (envelope.request, envelope.responder) {
                    (PullRequest::RequestKeyframe, _) => {
                        requests.fetch_add(1, Ordering::SeqCst);
                    }
                    (PullRequest::Pull, Some(responder)) => {
                        let reply = match packets.next() {
                            Some(packet) => PullReply::Data(PacketRef::detached(packet)),
                            None => PullReply::End,
                        };
                        let _ = responder.send(reply);
                    }
                    (PullRequest::Pull, None) => {}
                }
            }
        });
        Self {
            port,
            keyframe_requests,
        }
    }

    /// A port whose requests are never answered.
    fn silent() -> (PacketPort, PortListener<PullRequest, PullReply<PacketRef>>) {
        port::channel()
    }

    fn keyframe_requests(&self) -> usize {
        self.keyframe_requests.load(Ordering::SeqCst)
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn params() -> StreamInfo {
    StreamInfo::new(0, CodecType::H264, Rational::MILLIS)
        .with_dimensions(1280, 720)
        .with_frame_rate(Rational::new(30, 1))
}

/// `n` packets 40 ms apart, a keyframe every `gop`.
fn packets(n: i64, gop: i64) -> Vec<Packet> {
    (0..n)
        .map(|i| {
            Packet::new(vec![0u8; 4])
                .with_pts(i * 40)
                .with_dts(i * 40)
                .with_key_flag(i % gop == 0)
                .with_time_base(Rational::MILLIS)
        })
        .collect()
}

fn software_only() -> DecodeOptions {
    DecodeOptions {
        allow_hardware: false,
        ..Default::default()
    }
}

fn stage(script: &Arc<Mutex<Script>>) -> DecodeStage {
    stage_with(script, PipelineConfig::default())
}

fn stage_with(script: &Arc<Mutex<Script>>, config: PipelineConfig) -> DecodeStage {
    init_logging();
    DecodeStage::with_factory(
        config,
        Arc::new(StubFactory {
            script: script.clone(),
        }),
    )
}

async fn pull(port: &FramePort) -> PullReply<FrameRef> {
    port.call(PullRequest::Pull).await.unwrap()
}

/// Pulls until end of stream, collecting frame timestamps.
async fn pull_all(port: &FramePort) -> Vec<i64> {
    let mut out = Vec::new();
    loop {
        match pull(port).await {
            PullReply::Data(frame) => out.push(frame.pts),
            PullReply::End => return out,
            PullReply::Error(e) => panic!("unexpected error {}", e),
        }
    }
}

fn fails_at(pts: &[i64]) -> Behavior {
    Behavior {
        fail_decode: pts.iter().copied().collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_prefers_hardware() {
    let script = Script::with(&[
        (EngineKind::Hardware, Behavior::default()),
        (EngineKind::SoftwareNative, Behavior::default()),
    ]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(3, 10));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    assert_eq!(pull_all(&port).await, vec![0, 40, 80]);
    let selection = stage.selection(1).await.unwrap();
    assert_eq!(selection.target, Some(EngineKind::Hardware));
    assert_eq!(selection.software, Some(EngineKind::SoftwareNative));
    assert_eq!(selection.frames_decoded, 3);
    // the standby software engine is never opened
    assert_eq!(script.lock().log, vec!["open hardware#1"]);
    stage.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_and_unknown_tasks() {
    let script = Script::with(&[(EngineKind::SoftwarePortable, Behavior::default())]);
    let stage = stage(&script);
    let upstream = Upstream::serve(Vec::new());
    stage
        .register_task(1, params(), upstream.port.clone(), software_only())
        .await
        .unwrap();

    let duplicate = stage
        .register_task(1, params(), upstream.port.clone(), software_only())
        .await;
    assert!(matches!(duplicate, Err(PipelineError::InvalidOperate(_))));
    assert!(matches!(
        stage.reset_task(7).await,
        Err(PipelineError::InvalidOperate(_))
    ));
    assert!(matches!(
        stage.unregister_task(7).await,
        Err(PipelineError::InvalidOperate(_))
    ));
    stage.unregister_task(1).await.unwrap();
}

#[tokio::test]
async fn test_no_engine_for_codec() {
    let script = Script::with(&[(EngineKind::SoftwarePortable, Behavior::default())]);
    let stage = stage(&script);
    let upstream = Upstream::serve(Vec::new());
    let hevc = StreamInfo::new(0, CodecType::H265, Rational::MILLIS);

    let result = stage
        .register_task(1, hevc, upstream.port.clone(), DecodeOptions::default())
        .await;
    assert!(matches!(result, Err(PipelineError::CodecNotSupport(_))));
    assert!(matches!(
        stage.selection(1).await,
        Err(PipelineError::InvalidOperate(_))
    ));
}

#[tokio::test]
async fn test_native_open_failure_uses_portable() {
    let script = Script::with(&[
        (
            EngineKind::SoftwareNative,
            Behavior {
                fail_open: true,
                ..Default::default()
            },
        ),
        (EngineKind::SoftwarePortable, Behavior::default()),
    ]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(2, 10));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    assert_eq!(pull_all(&port).await, vec![0, 40]);
    assert_eq!(
        stage.selection(1).await.unwrap().target,
        Some(EngineKind::SoftwarePortable)
    );
    assert_eq!(
        script.lock().log,
        vec![
            "open-failed software-native#1",
            "close software-native#1",
            "open software-portable#2",
        ]
    );
}

#[tokio::test]
async fn test_hardware_failure_falls_back_once() {
    let script = Script::with(&[
        (EngineKind::Hardware, fails_at(&[80])),
        (EngineKind::SoftwareNative, Behavior::default()),
    ]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(6, 4));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    // 80 fails on hardware; 120 is dropped until the keyframe at 160
    assert_eq!(pull_all(&port).await, vec![0, 40, 160, 200]);
    assert_eq!(upstream.keyframe_requests(), 1);

    let selection = stage.selection(1).await.unwrap();
    assert_eq!(selection.target, Some(EngineKind::SoftwareNative));
    assert!(!selection.hardware);
    assert_eq!(
        script.lock().log,
        vec!["open hardware#1", "close hardware#1", "open software-native#2"]
    );
}

#[tokio::test]
async fn test_failed_keyframe_is_retried() {
    let script = Script::with(&[
        (EngineKind::Hardware, fails_at(&[0])),
        (EngineKind::SoftwareNative, fails_at(&[0])),
        (EngineKind::SoftwarePortable, Behavior::default()),
    ]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(3, 10));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    assert_eq!(pull_all(&port).await, vec![0, 40, 80]);
    assert_eq!(upstream.keyframe_requests(), 0);
    assert_eq!(
        stage.selection(1).await.unwrap().target,
        Some(EngineKind::SoftwarePortable)
    );
}

#[tokio::test]
async fn test_exhausted_chain_fails_the_pull() {
    let script = Script::with(&[(EngineKind::SoftwarePortable, fails_at(&[40]))]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(6, 4));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), software_only())
        .await
        .unwrap();

    assert!(matches!(pull(&port).await, PullReply::Data(f) if f.pts == 0));
    match pull(&port).await {
        PullReply::Error(e) => assert_eq!(e.code(), crate::error::CODEC_NOT_SUPPORT),
        _ => panic!("expected a decode failure"),
    }
    assert_eq!(upstream.keyframe_requests(), 1);

    // the engine stays; decoding resumes at the next keyframe
    assert_eq!(pull_all(&port).await, vec![160, 200]);
    assert!(!stage.selection(1).await.unwrap().need_keyframe);
}

#[tokio::test]
async fn test_waits_for_first_keyframe() {
    let script = Script::with(&[(EngineKind::SoftwarePortable, Behavior::default())]);
    let stage = stage(&script);
    let mut input = packets(5, 4);
    input.rotate_left(1);
    let upstream = Upstream::serve(input);
    let port = stage
        .register_task(1, params(), upstream.port.clone(), software_only())
        .await
        .unwrap();

    assert!(stage.selection(1).await.unwrap().need_keyframe);
    // 40, 80 and 120 precede the keyframe at 160
    assert_eq!(pull_all(&port).await, vec![160, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_hardware_flush_timeout_discards_frames() {
    let script = Script::with(&[(
        EngineKind::Hardware,
        Behavior {
            hold_frames: true,
            hang_on_flush: true,
            ..Default::default()
        },
    )]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(2, 10));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    assert!(pull(&port).await.is_end());
    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert_eq!(stage.selection(1).await.unwrap().frames_decoded, 0);
}

#[tokio::test]
async fn test_hardware_flush_drains_held_frames() {
    let script = Script::with(&[(
        EngineKind::Hardware,
        Behavior {
            hold_frames: true,
            ..Default::default()
        },
    )]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(3, 10));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    assert_eq!(pull_all(&port).await, vec![0, 40, 80]);
}

#[tokio::test]
async fn test_async_hardware_error_reopens() {
    let script = Script::with(&[
        (
            EngineKind::Hardware,
            Behavior {
                report_error_at: Some(40),
                ..Default::default()
            },
        ),
        (EngineKind::SoftwarePortable, Behavior::default()),
    ]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(5, 3));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    assert_eq!(pull_all(&port).await, vec![0, 120, 160]);
    assert_eq!(upstream.keyframe_requests(), 1);

    let selection = stage.selection(1).await.unwrap();
    assert_eq!(selection.target, Some(EngineKind::Hardware));
    assert_eq!(selection.hardware_retries, 1);
    assert_eq!(
        script.lock().log,
        vec!["open hardware#1", "open hardware#3", "close hardware#1"]
    );
}

#[tokio::test]
async fn test_reopened_hardware_error_before_output_falls_back() {
    let script = Script::with(&[
        (
            EngineKind::Hardware,
            Behavior {
                report_error_at: Some(40),
                ..Default::default()
            },
        ),
        (EngineKind::SoftwarePortable, Behavior::default()),
    ]);
    let stage = stage(&script);
    // the reopened engine fails on its first keyframe, before any output
    let mut input = packets(3, 10);
    input.push(
        Packet::new(vec![0u8; 4])
            .with_pts(40)
            .with_key_flag(true)
            .with_time_base(Rational::MILLIS),
    );
    input.push(
        Packet::new(vec![0u8; 4])
            .with_pts(200)
            .with_key_flag(true)
            .with_time_base(Rational::MILLIS),
    );
    let upstream = Upstream::serve(input);
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    assert_eq!(pull_all(&port).await, vec![0, 200]);
    let selection = stage.selection(1).await.unwrap();
    assert_eq!(selection.target, Some(EngineKind::SoftwarePortable));
    assert_eq!(selection.hardware_retries, 1);
    assert_eq!(upstream.keyframe_requests(), 2);
    assert_eq!(
        script.lock().log,
        vec![
            "open hardware#1",
            "open hardware#3",
            "close hardware#1",
            "close hardware#3",
            "open software-portable#2",
        ]
    );
}

#[tokio::test]
async fn test_async_hardware_error_before_output_falls_back() {
    let script = Script::with(&[
        (
            EngineKind::Hardware,
            Behavior {
                report_error_at: Some(0),
                ..Default::default()
            },
        ),
        (EngineKind::SoftwarePortable, Behavior::default()),
    ]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(5, 3));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    assert_eq!(pull_all(&port).await, vec![120, 160]);
    let selection = stage.selection(1).await.unwrap();
    assert_eq!(selection.target, Some(EngineKind::SoftwarePortable));
    assert_eq!(selection.hardware_retries, 0);
    assert_eq!(upstream.keyframe_requests(), 1);
}

#[tokio::test]
async fn test_exhausted_frame_pool_keeps_engine() {
    let script = Script::with(&[
        (EngineKind::Hardware, Behavior::default()),
        (EngineKind::SoftwarePortable, Behavior::default()),
    ]);
    let config = PipelineConfig {
        pool_capacity: Some(1),
        ..Default::default()
    };
    let stage = stage_with(&script, config);
    let upstream = Upstream::serve(packets(4, 10));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    let held = match pull(&port).await {
        PullReply::Data(frame) => frame,
        _ => panic!("expected the first frame"),
    };
    assert_eq!(held.pts, 0);
    match pull(&port).await {
        PullReply::Error(e) => assert_eq!(e.code(), crate::error::NO_MEMORY),
        _ => panic!("expected an exhausted pool"),
    }

    let selection = stage.selection(1).await.unwrap();
    assert_eq!(selection.target, Some(EngineKind::Hardware));
    assert!(selection.hardware);
    assert!(!selection.need_keyframe);
    assert_eq!(upstream.keyframe_requests(), 0);

    // 40 could not be emitted; decoding goes on once the frame is back
    drop(held);
    assert_eq!(pull_all(&port).await, vec![80, 120]);
    assert_eq!(script.lock().log, vec!["open hardware#1"]);
}

#[tokio::test]
async fn test_play_rate_sets_skip_policy() {
    let script = Script::with(&[(EngineKind::SoftwarePortable, Behavior::default())]);
    let stage = stage(&script);
    let upstream = Upstream::serve(Vec::new());
    stage
        .register_task(1, params(), upstream.port.clone(), software_only())
        .await
        .unwrap();

    stage.set_play_rate(1, 4.0).await.unwrap();
    stage.set_play_rate(1, 1.0).await.unwrap();
    assert!(matches!(
        stage.set_play_rate(1, 0.0).await,
        Err(PipelineError::InvalidOperate(_))
    ));
    assert!(matches!(
        stage.set_play_rate(1, f64::NAN).await,
        Err(PipelineError::InvalidOperate(_))
    ));

    // applied once on open, then per rate change
    assert_eq!(
        script.lock().policies,
        vec![SkipPolicy::None, SkipPolicy::NonRef, SkipPolicy::None]
    );
}

#[tokio::test]
async fn test_reset_discards_buffered_frames() {
    let script = Script::with(&[(
        EngineKind::SoftwarePortable,
        Behavior {
            lag: true,
            ..Default::default()
        },
    )]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(6, 3));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), software_only())
        .await
        .unwrap();

    assert!(matches!(pull(&port).await, PullReply::Data(f) if f.pts == 0));
    stage.reset_task(1).await.unwrap();
    assert!(stage.selection(1).await.unwrap().need_keyframe);

    // 40 was held by the engine and is gone; 80 precedes the next keyframe
    assert_eq!(pull_all(&port).await, vec![120, 160, 200]);
}

#[tokio::test]
async fn test_reopen_replaces_engines() {
    let script = Script::with(&[(EngineKind::SoftwarePortable, Behavior::default())]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(4, 2));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), software_only())
        .await
        .unwrap();

    assert!(matches!(pull(&port).await, PullReply::Data(f) if f.pts == 0));
    stage
        .reopen_decoder(1, params().with_dimensions(1920, 1080))
        .await
        .unwrap();
    assert!(stage.selection(1).await.unwrap().need_keyframe);

    assert_eq!(pull_all(&port).await, vec![80, 120]);
    assert_eq!(
        script.lock().log,
        vec![
            "open software-portable#1",
            "open software-portable#2",
            "close software-portable#1",
        ]
    );

    let unsupported = StreamInfo::new(0, CodecType::H265, Rational::MILLIS);
    assert!(matches!(
        stage.reopen_decoder(1, unsupported).await,
        Err(PipelineError::CodecNotSupport(_))
    ));
}

#[tokio::test]
async fn test_second_pull_rejected() {
    let script = Script::with(&[(EngineKind::SoftwarePortable, Behavior::default())]);
    let stage = stage(&script);
    let (upstream, _listener) = Upstream::silent();
    let port = stage
        .register_task(1, params(), upstream, software_only())
        .await
        .unwrap();

    let first = port.request(PullRequest::Pull).unwrap();
    let second = port.call(PullRequest::Pull).await.unwrap();
    assert!(matches!(second, PullReply::Error(PipelineError::InvalidOperate(_))));

    stage.unregister_task(1).await.unwrap();
    assert!(matches!(first.await, Err(PipelineError::PortClosed)));
}

#[tokio::test]
async fn test_closed_upstream_ends_stream() {
    let script = Script::with(&[(EngineKind::SoftwarePortable, Behavior::default())]);
    let stage = stage(&script);
    let (upstream, listener) = Upstream::silent();
    drop(listener);
    let port = stage
        .register_task(1, params(), upstream, software_only())
        .await
        .unwrap();

    assert!(pull(&port).await.is_end());
    assert!(pull(&port).await.is_end());
}

#[tokio::test]
async fn test_unregister_closes_engines() {
    let script = Script::with(&[
        (EngineKind::Hardware, Behavior::default()),
        (EngineKind::SoftwareNative, Behavior::default()),
    ]);
    let stage = stage(&script);
    let upstream = Upstream::serve(packets(2, 10));
    let port = stage
        .register_task(1, params(), upstream.port.clone(), DecodeOptions::default())
        .await
        .unwrap();

    stage.unregister_task(1).await.unwrap();
    assert!(port.call(PullRequest::Pull).await.is_err());
    assert_eq!(
        script.lock().log,
        vec!["open hardware#1", "close hardware#1"]
    );
}
