use super::selection::{EngineBuilder, Selection, Target};
use super::{DecodeCommand, DecodeOptions};
use crate::av::{FramePool, FrameRef, PacketRef, StreamInfo};
use crate::codec::engine::{EngineEvent, EngineFactory, EngineKind, EngineMessage, SkipPolicy};
use crate::config::PipelineConfig;
use crate::stage::port::{self, Envelope, PendingReply, PortListener, Responder};
use crate::stage::stats::StatsSink;
use crate::stage::{FramePort, PacketPort, PullReply, PullRequest, TaskId};
use crate::{PipelineError, Result};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

type FrameEnvelope = Envelope<PullRequest, PullReply<FrameRef>>;
type UpstreamReply = PendingReply<PullReply<PacketRef>>;

/// Frame rate assumed for skip decisions when the stream doesn't say.
const DEFAULT_FPS: f64 = 25.0;

/// State of one decode task, owned by its actor.
pub(super) struct DecodeTask {
    id: TaskId,
    config: PipelineConfig,
    params: StreamInfo,
    allow_hardware: bool,
    builder: EngineBuilder,
    selection: Selection,
    upstream: PacketPort,
    listener: PortListener<PullRequest, PullReply<FrameRef>>,
    downstream_open: bool,
    events: mpsc::UnboundedReceiver<EngineMessage>,
    /// Frames from engines with another serial are dropped.
    accept_serial: Option<u64>,
    frames: VecDeque<FrameRef>,
    pending: Option<Responder<PullReply<FrameRef>>>,
    in_flight: Option<UpstreamReply>,
    input_end: bool,
    frames_decoded: u64,
    stats: Option<Arc<dyn StatsSink>>,
}

impl DecodeTask {
    /// Builds the task and opens its target engine.
    pub async fn open(
        id: TaskId,
        config: PipelineConfig,
        factory: Arc<dyn EngineFactory>,
        pool: FramePool,
        params: StreamInfo,
        upstream: PacketPort,
        options: DecodeOptions,
    ) -> Result<(Self, FramePort)> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut builder = EngineBuilder::new(id, factory, pool, events_tx, &options);
        let selection = builder.build(&params, options.allow_hardware).await?;
        info!(
            "decode task {}: {:?} decoding on {:?}",
            id,
            params.codec_type,
            selection.target_slot()
        );

        let (port, listener) = port::channel();
        let task = Self {
            id,
            config,
            params,
            allow_hardware: options.allow_hardware,
            builder,
            accept_serial: selection.target_serial(),
            selection,
            upstream,
            listener,
            downstream_open: true,
            events,
            frames: VecDeque::new(),
            pending: None,
            in_flight: None,
            input_end: false,
            frames_decoded: 0,
            stats: options.stats,
        };
        Ok((task, port))
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DecodeCommand>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        debug!("decode task {}: stage dropped, stopping", self.id);
                        self.teardown().await;
                        break;
                    }
                },
                Some(message) = self.events.recv() => {
                    self.on_engine_message(message).await;
                    self.advance().await;
                }
                reply = upstream_reply(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.on_upstream(reply).await;
                }
                envelope = self.listener.recv(), if self.downstream_open => match envelope {
                    Some(envelope) => self.on_request(envelope).await,
                    None => {
                        debug!("decode task {}: consumer port dropped", self.id);
                        self.downstream_open = false;
                    }
                },
            }
        }
    }

    /// Closes the engines of a task that never ran.
    pub async fn close(mut self) {
        self.teardown().await;
    }

    /// Applies one command. True once the task has been unregistered.
    async fn handle_command(&mut self, command: DecodeCommand) -> bool {
        match command {
            DecodeCommand::Reopen { params, result } => {
                let _ = result.send(self.reopen(params).await);
                self.advance().await;
            }
            DecodeCommand::SetPlayRate { rate, result } => {
                let _ = result.send(self.set_play_rate(rate));
            }
            DecodeCommand::Reset { result } => {
                let _ = result.send(self.reset().await);
                self.advance().await;
            }
            DecodeCommand::Selection { result } => {
                let _ = result.send(Ok(self.selection.snapshot(self.frames_decoded)));
            }
            DecodeCommand::Unregister { result } => {
                self.teardown().await;
                let _ = result.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn on_request(&mut self, envelope: FrameEnvelope) {
        match envelope.request {
            PullRequest::RequestKeyframe => self.request_keyframe(),
            PullRequest::Pull => {
                let Some(responder) = envelope.responder else {
                    return;
                };
                if self.pending.as_ref().is_some_and(|p| !p.is_closed()) {
                    warn!("decode task {}: second pull rejected", self.id);
                    let _ = responder.send(PullReply::Error(PipelineError::InvalidOperate(
                        "pull already pending".into(),
                    )));
                    return;
                }
                self.pending = Some(responder);
                self.advance().await;
            }
        }
    }

    /// Moves the pending pull forward: answers it from the frame queue, with
    /// end of stream, or asks upstream for another packet.
    async fn advance(&mut self) {
        loop {
            self.drain_events().await;

            let Some(responder) = self.pending.take() else {
                return;
            };
            if responder.is_closed() {
                return;
            }
            if let Some(frame) = self.frames.pop_front() {
                if let Err(PullReply::Data(frame)) = responder.send(PullReply::Data(frame)) {
                    self.frames.push_front(frame);
                }
                return;
            }
            if self.input_end {
                let _ = responder.send(PullReply::End);
                return;
            }

            self.pending = Some(responder);
            if self.in_flight.is_some() {
                return;
            }
            match self.upstream.request(PullRequest::Pull) {
                Ok(reply) => {
                    self.in_flight = Some(reply);
                    return;
                }
                Err(e) => {
                    debug!("decode task {}: upstream unavailable: {}", self.id, e);
                    self.end_input().await;
                }
            }
        }
    }

    async fn on_upstream(&mut self, reply: Result<PullReply<PacketRef>>) {
        match reply {
            Ok(PullReply::Data(packet)) => self.on_packet(packet).await,
            Ok(PullReply::End) => {
                debug!("decode task {}: upstream ended", self.id);
                self.end_input().await;
            }
            Ok(PullReply::Error(e)) => {
                warn!("decode task {}: upstream error: {}", self.id, e);
                self.fail_pull(e);
            }
            Err(e) => {
                debug!("decode task {}: upstream gone: {}", self.id, e);
                self.end_input().await;
            }
        }
        self.advance().await;
    }

    async fn on_packet(&mut self, packet: PacketRef) {
        if self.selection.need_keyframe {
            if !packet.is_key {
                trace!("decode task {}: waiting for a keyframe, dropped packet", self.id);
                return;
            }
            self.selection.need_keyframe = false;
        }
        self.decode(packet).await;
    }

    /// Feeds `packet` to the target engine, walking the fallback chain on failure.
    async fn decode(&mut self, packet: PacketRef) {
        loop {
            let Some(slot) = self.selection.target_slot_mut() else {
                self.fail_pull(PipelineError::CodecNotSupport("no decoder engine available".into()));
                return;
            };
            let kind = slot.kind();

            let failure = match slot.engine.decode(&packet).await {
                Ok(()) => {
                    if kind.is_software() && slot.engine.queue_depth() > self.config.software_queue_cap {
                        tokio::task::yield_now().await;
                    }
                    return;
                }
                Err(PipelineError::NoMemory(e)) => {
                    // frames are still held downstream, the engine itself is fine
                    warn!("decode task {}: {} engine could not emit: {}", self.id, kind, e);
                    self.fail_pull(PipelineError::NoMemory(e));
                    return;
                }
                Err(e) => e,
            };

            warn!(
                "decode task {}: {} engine failed on {}: {}",
                self.id,
                kind,
                if packet.is_key { "keyframe" } else { "packet" },
                failure
            );
            if let Some(stats) = &self.stats {
                stats.on_decode_error();
            }

            if !self.fall_back().await {
                self.selection.need_keyframe = true;
                self.request_keyframe();
                self.fail_pull(PipelineError::CodecNotSupport(format!(
                    "no decoder left after {} engine failed: {}",
                    kind, failure
                )));
                return;
            }
            if !packet.is_key {
                self.selection.need_keyframe = true;
                self.request_keyframe();
                return;
            }
            debug!("decode task {}: retrying keyframe on the next engine", self.id);
        }
    }

    /// Moves to the next engine of the chain. False when there is none.
    async fn fall_back(&mut self) -> bool {
        let params = self.params.clone();
        match self.selection.target {
            Some(Target::Hardware) => {
                if let Some(mut hardware) = self.selection.hardware.take() {
                    hardware.engine.close().await;
                }
                self.selection.target = Some(Target::Software);
            }
            Some(Target::Software) => {
                let native = self
                    .selection
                    .software
                    .as_ref()
                    .is_some_and(|slot| slot.kind() == EngineKind::SoftwareNative);
                if !native {
                    return false;
                }
                let Some(portable) = self.builder.create(EngineKind::SoftwarePortable, &params) else {
                    return false;
                };
                if let Some(mut native) = self.selection.software.replace(portable) {
                    native.engine.close().await;
                }
            }
            None => return false,
        }

        match self.builder.open_software(&mut self.selection, &params).await {
            Ok(()) => {
                self.accept_serial = self.selection.target_serial();
                info!("decode task {}: fell back to {:?}", self.id, self.selection.target_slot());
                true
            }
            Err(e) => {
                warn!("decode task {}: fallback chain exhausted: {}", self.id, e);
                self.selection.target = None;
                self.accept_serial = None;
                false
            }
        }
    }

    /// Replaces the hardware engine with a fresh one. False if that fails.
    async fn reopen_hardware(&mut self) -> bool {
        let params = self.params.clone();
        let Some(mut slot) = self.builder.create(EngineKind::Hardware, &params) else {
            return false;
        };
        if let Err(e) = self.builder.open(&mut slot, &params).await {
            warn!("decode task {}: hardware reopen failed: {}", self.id, e);
            slot.engine.close().await;
            return false;
        }
        if let Some(mut old) = self.selection.hardware.replace(slot) {
            old.engine.close().await;
        }
        self.selection.target = Some(Target::Hardware);
        self.accept_serial = self.selection.target_serial();
        true
    }

    async fn on_engine_message(&mut self, message: EngineMessage) {
        match message.event {
            EngineEvent::Frame(frame) => {
                if self.accept_serial != Some(message.serial) {
                    trace!("decode task {}: discarding frame of engine #{}", self.id, message.serial);
                    return;
                }
                self.frames_decoded += 1;
                if let Some(slot) = self.selection.target_slot_mut() {
                    if slot.serial == message.serial {
                        slot.frames += 1;
                    }
                }
                if let Some(stats) = &self.stats {
                    stats.on_frame(frame.data.iter().map(|plane| plane.len()).sum());
                }
                self.frames.push_back(frame);
            }
            EngineEvent::Error(e) => self.on_engine_error(message.serial, e).await,
        }
    }

    /// An error the hardware engine reported outside of a decode call.
    async fn on_engine_error(&mut self, serial: u64, error: PipelineError) {
        let hardware_serial = self.selection.hardware.as_ref().map(|slot| slot.serial);
        if self.selection.target != Some(Target::Hardware) || hardware_serial != Some(serial) {
            debug!("decode task {}: ignoring error of engine #{}: {}", self.id, serial, error);
            return;
        }
        if let PipelineError::NoMemory(e) = error {
            warn!("decode task {}: hardware engine could not emit: {}", self.id, e);
            self.fail_pull(PipelineError::NoMemory(e));
            return;
        }
        warn!("decode task {}: hardware engine reported {}", self.id, error);
        if let Some(stats) = &self.stats {
            stats.on_decode_error();
        }

        let hardware_frames = self.selection.hardware.as_ref().map_or(0, |slot| slot.frames);
        let reopened = if self.selection.hardware_retries < self.config.hardware_retry_limit
            && hardware_frames > 0
        {
            self.selection.hardware_retries += 1;
            info!(
                "decode task {}: reopening hardware engine (attempt {})",
                self.id, self.selection.hardware_retries
            );
            self.reopen_hardware().await
        } else {
            false
        };
        if !reopened {
            self.fall_back().await;
        }
        self.selection.need_keyframe = true;
        self.request_keyframe();
    }

    async fn drain_events(&mut self) {
        while let Ok(message) = self.events.try_recv() {
            self.on_engine_message(message).await;
        }
    }

    /// Upstream is exhausted: flush the target engine. A hardware flush that
    /// overruns its timeout loses whatever it had not emitted.
    async fn end_input(&mut self) {
        if self.input_end {
            return;
        }
        self.input_end = true;
        self.in_flight = None;
        self.drain_events().await;

        let timeout = self.config.hardware_flush_timeout;
        let Some(slot) = self.selection.target_slot_mut() else {
            return;
        };
        if slot.kind() == EngineKind::Hardware {
            match tokio::time::timeout(timeout, slot.engine.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("decode task {}: hardware flush failed: {}", self.id, e),
                Err(_) => {
                    warn!(
                        "decode task {}: hardware flush timed out after {:?}, dropping undrained frames",
                        self.id, timeout
                    );
                    self.accept_serial = None;
                }
            }
        } else if let Err(e) = slot.engine.flush().await {
            warn!("decode task {}: flush failed: {}", self.id, e);
        }
        self.drain_events().await;
    }

    async fn reopen(&mut self, params: StreamInfo) -> Result<()> {
        let selection = self.builder.build(&params, self.allow_hardware).await?;
        let mut previous = std::mem::replace(&mut self.selection, selection);
        self.params = params;
        self.accept_serial = self.selection.target_serial();
        for mut slot in previous.take_engines().into_iter().filter(|slot| slot.opened) {
            slot.engine.close().await;
        }
        info!(
            "decode task {}: reopened on {:?}",
            self.id,
            self.selection.target_slot()
        );
        Ok(())
    }

    fn set_play_rate(&mut self, rate: f64) -> Result<()> {
        if rate.is_nan() || rate <= 0.0 {
            return Err(PipelineError::InvalidOperate(format!("invalid play rate {}", rate)));
        }
        let policy = SkipPolicy::for_play_rate(self.params.fps().unwrap_or(DEFAULT_FPS), rate);
        self.builder.skip_policy = policy;
        if let Some(slot) = self.selection.software.as_mut() {
            slot.engine.set_skip_policy(policy);
        }
        debug!("decode task {}: play rate {} skips {:?}", self.id, rate, policy);
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.in_flight = None;
        self.frames.clear();
        match self.selection.target {
            Some(Target::Hardware) => {
                if !self.reopen_hardware().await {
                    self.fall_back().await;
                }
            }
            Some(Target::Software) => {
                // flushed frames belong to the old position
                self.accept_serial = None;
                if let Some(slot) = self.selection.target_slot_mut() {
                    if let Err(e) = slot.engine.flush().await {
                        warn!("decode task {}: flush on reset failed: {}", self.id, e);
                    }
                }
            }
            None => {}
        }
        self.drain_events().await;
        self.frames.clear();

        self.accept_serial = self.selection.target_serial();
        self.selection.need_keyframe = true;
        self.input_end = false;
        debug!("decode task {}: reset", self.id);
        Ok(())
    }

    fn fail_pull(&mut self, error: PipelineError) {
        if let Some(responder) = self.pending.take() {
            let _ = responder.send(PullReply::Error(error));
        }
    }

    fn request_keyframe(&self) {
        if let Err(e) = self.upstream.notify(PullRequest::RequestKeyframe) {
            debug!("decode task {}: keyframe request not sent: {}", self.id, e);
        }
    }

    async fn teardown(&mut self) {
        for mut slot in self.selection.take_engines().into_iter().filter(|slot| slot.opened) {
            slot.engine.close().await;
        }
        self.frames.clear();
        self.pending = None;
        self.in_flight = None;
        info!("decode task {}: closed", self.id);
    }
}

async fn upstream_reply(in_flight: &mut Option<UpstreamReply>) -> Result<PullReply<PacketRef>> {
    match in_flight {
        Some(reply) => reply.await,
        None => std::future::pending().await,
    }
}
