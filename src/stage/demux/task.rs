use super::queue::TrackQueue;
use super::{ConnectOptions, DemuxCommand, TaskState, TrackKey};
use crate::av::{MediaKind, PacketPool, PacketRef, StreamInfo};
use crate::config::PipelineConfig;
use crate::format::{ContainerFormat, FormatParser, IoContext, OpenOptions, ReadStatus, SeekFlags};
use crate::stage::port::{Envelope, PortId, PortListener};
use crate::stage::stats::{GopTracker, StatsSink};
use crate::stage::{PacketPort, PullReply, PullRequest, TaskId};
use crate::{PipelineError, Result};
use log::{debug, error, info, trace, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

type PacketEnvelope = Envelope<PullRequest, PullReply<PacketRef>>;

/// State of one demux task, owned by its actor.
pub(super) struct DemuxTask {
    id: TaskId,
    config: PipelineConfig,
    pool: PacketPool,
    io: IoContext,
    parser: Option<Box<dyn FormatParser>>,
    state: TaskState,
    streams: Vec<StreamInfo>,
    queues: BTreeMap<TrackKey, TrackQueue>,
    ports: HashMap<PortId, TrackKey>,
    listener: PortListener<PullRequest, PullReply<PacketRef>>,
    /// Keeps the listener able to mint ports while the task lives.
    _port_tx: mpsc::UnboundedSender<PacketEnvelope>,
    looping: bool,
    live: bool,
    min_queue_length: usize,
    ended: bool,
    /// The packet pool ran dry; reading waits for the next pull.
    starved: bool,
    stats: Option<Arc<dyn StatsSink>>,
    gop: HashMap<usize, GopTracker>,
}

impl DemuxTask {
    pub fn new(
        id: TaskId,
        config: PipelineConfig,
        pool: PacketPool,
        io: IoContext,
        stats: Option<Arc<dyn StatsSink>>,
    ) -> Self {
        let (listener, port_tx) = PortListener::detached();
        let min_queue_length = config.min_queue_length;
        Self {
            id,
            config,
            pool,
            io,
            parser: None,
            state: TaskState::Created,
            streams: Vec::new(),
            queues: BTreeMap::new(),
            ports: HashMap::new(),
            listener,
            _port_tx: port_tx,
            looping: false,
            live: false,
            min_queue_length,
            ended: false,
            starved: false,
            stats,
            gop: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DemuxCommand>) {
        loop {
            let can_read = self.looping && !self.ended && !self.starved && !self.backpressured();
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        debug!("demux task {}: stage dropped, stopping", self.id);
                        self.teardown();
                        break;
                    }
                },
                Some(envelope) = self.listener.recv() => self.handle_pull(envelope),
                _ = std::future::ready(()), if can_read => self.read_once().await,
            }
        }
    }

    /// Applies one command. True once the task has been unregistered.
    async fn handle_command(&mut self, command: DemuxCommand) -> bool {
        match command {
            DemuxCommand::OpenStream {
                max_probe_duration_ms,
                result,
            } => {
                let _ = result.send(self.open_stream(max_probe_duration_ms).await);
            }
            DemuxCommand::OpenWith {
                parser,
                max_probe_duration_ms,
                result,
            } => {
                let _ = result.send(self.open_with(parser, max_probe_duration_ms).await);
            }
            DemuxCommand::AnalyzeStreams { result } => {
                let _ = result.send(self.analyze_streams().await);
            }
            DemuxCommand::Connect {
                track,
                options,
                result,
            } => {
                let _ = result.send(self.connect(track, options));
            }
            DemuxCommand::ChangeConnect {
                new,
                old,
                force,
                result,
            } => {
                let _ = result.send(self.change_connect(new, old, force));
            }
            DemuxCommand::Start {
                live,
                min_queue_length,
                result,
            } => {
                let _ = result.send(self.start(live, min_queue_length));
            }
            DemuxCommand::Seek {
                time_ms,
                flags,
                track,
                result,
            } => {
                let _ = result.send(self.seek(time_ms, flags, track).await);
            }
            DemuxCommand::Crop { max_ms, result } => {
                self.crop(max_ms);
                self.starved = false;
                let _ = result.send(Ok(()));
            }
            DemuxCommand::State { result } => {
                let _ = result.send(Ok(self.state));
            }
            DemuxCommand::QueueDepths { result } => {
                let depths = self
                    .queues
                    .iter()
                    .map(|(key, queue)| (*key, queue.packets.len()))
                    .collect();
                let _ = result.send(Ok(depths));
            }
            DemuxCommand::Unregister { result } => {
                self.teardown();
                let _ = result.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn open_stream(&mut self, max_probe_duration_ms: u64) -> Result<ContainerFormat> {
        self.open_io().await?;

        self.io.ensure(self.config.probe_size).await?;
        self.state = TaskState::Probing;
        let format = ContainerFormat::probe(self.io.peek(self.config.probe_size)).ok_or_else(|| {
            PipelineError::FormatNotSupport("no known container signature".into())
        })?;
        debug!("demux task {}: probed {}", self.id, format);

        let parser = format.create_parser()?;
        self.open_parser(parser, max_probe_duration_ms).await?;
        Ok(format)
    }

    async fn open_with(&mut self, parser: Box<dyn FormatParser>, max_probe_duration_ms: u64) -> Result<()> {
        self.open_io().await?;
        self.state = TaskState::Probing;
        self.open_parser(parser, max_probe_duration_ms).await
    }

    async fn open_io(&mut self) -> Result<()> {
        if self.state != TaskState::Created {
            return Err(PipelineError::InvalidOperate(format!(
                "demux task {} already opened",
                self.id
            )));
        }
        self.io.open().await?;
        self.state = TaskState::Opened;
        Ok(())
    }

    async fn open_parser(&mut self, mut parser: Box<dyn FormatParser>, max_probe_duration_ms: u64) -> Result<()> {
        let options = OpenOptions {
            max_analyze_duration_ms: match max_probe_duration_ms {
                0 => self.config.max_probe_duration_ms,
                ms => ms,
            },
            fast_open: false,
        };
        parser
            .open(&mut self.io, &options)
            .await
            .map_err(PipelineError::into_data_invalid)?;
        info!("demux task {}: opened {} stream", self.id, parser.name());
        self.parser = Some(parser);
        Ok(())
    }

    async fn analyze_streams(&mut self) -> Result<Vec<StreamInfo>> {
        let parser = self.parser.as_mut().ok_or_else(|| {
            PipelineError::InvalidOperate("stream not opened".into())
        })?;
        let streams = parser
            .analyze_streams(&mut self.io)
            .await
            .map_err(PipelineError::into_data_invalid)?;
        for stream in &streams {
            info!(
                "demux task {}: track {} {:?} time base {}",
                self.id, stream.index, stream.codec_type, stream.time_base
            );
        }
        self.streams = streams.clone();
        Ok(streams)
    }

    fn connect(&mut self, track: TrackKey, options: ConnectOptions) -> Result<PacketPort> {
        let kind = self.track_kind(track)?;
        if self.queues.contains_key(&track) {
            return Err(PipelineError::InvalidOperate(format!(
                "track {} already connected",
                track
            )));
        }
        let port = self
            .listener
            .connect()
            .ok_or(PipelineError::PortClosed)?;

        self.queues
            .insert(track, TrackQueue::new(port.id(), kind, options.copy_on_reply));
        self.ports.insert(port.id(), track);
        debug!("demux task {}: {} connected to track {}", self.id, port.id(), track);
        Ok(port)
    }

    fn change_connect(&mut self, new: TrackKey, old: TrackKey, force: bool) -> Result<()> {
        let kind = self.track_kind(new)?;
        if new != old && self.queues.contains_key(&new) {
            return Err(PipelineError::InvalidOperate(format!(
                "track {} already connected",
                new
            )));
        }
        let mut queue = self.queues.remove(&old).ok_or_else(|| {
            PipelineError::InvalidOperate(format!("track {} not connected", old))
        })?;

        if force {
            let released = queue.release_all();
            self.starved = false;
            debug!(
                "demux task {}: switched {} -> {}, released {} packets",
                self.id, old, new, released
            );
        } else {
            queue.extradata_refresh = true;
        }
        queue.kind = kind;
        self.ports.insert(queue.port, new);
        self.queues.insert(new, queue);
        Ok(())
    }

    fn start(&mut self, live: bool, min_queue_length: usize) -> Result<()> {
        if self.parser.is_none() {
            return Err(PipelineError::InvalidOperate("stream not opened".into()));
        }
        self.live = live;
        self.min_queue_length = if min_queue_length == 0 {
            self.config.min_queue_length
        } else {
            min_queue_length
        };
        self.looping = true;
        if !self.ended {
            self.state = TaskState::Demuxing;
        }
        info!(
            "demux task {}: started (live: {}, min queue length {})",
            self.id, live, self.min_queue_length
        );
        Ok(())
    }

    async fn seek(&mut self, time_ms: i64, flags: SeekFlags, track: Option<usize>) -> Result<i64> {
        let target = time_ms + self.start_ms(track);
        let parser = self
            .parser
            .as_mut()
            .ok_or_else(|| PipelineError::InvalidOperate("stream not opened".into()))?;

        if !self.looping {
            parser
                .seek(&mut self.io, track, target, flags)
                .await
                .map_err(PipelineError::into_data_invalid)?;
            return Ok(time_ms);
        }

        let previous = self.state;
        self.state = TaskState::Seeking;
        if let Err(e) = parser.seek(&mut self.io, track, target, flags).await {
            warn!("demux task {}: seek to {} ms failed: {}", self.id, time_ms, e);
            self.state = previous;
            return Err(e.into_data_invalid());
        }

        let released: usize = self.queues.values_mut().map(TrackQueue::release_all).sum();
        self.gop.values_mut().for_each(GopTracker::reset);
        if let Some(stats) = &self.stats {
            stats.on_reset();
        }
        self.ended = false;
        self.starved = false;
        debug!("demux task {}: seek released {} packets", self.id, released);

        loop {
            match self.read_packet().await {
                Ok(Some(packet)) => {
                    if self.route(packet.stream_index).is_none() {
                        trace!("demux task {}: skipping untracked track {}", self.id, packet.stream_index);
                        continue;
                    }
                    let landed = match (self.streams.get(packet.stream_index), packet.timestamp()) {
                        (Some(stream), Some(ts)) => stream.relative_millis(ts),
                        (None, Some(_)) => packet.pts_millis().unwrap_or(time_ms),
                        (_, None) => time_ms,
                    };
                    self.dispatch(packet);
                    self.state = TaskState::Demuxing;
                    info!("demux task {}: seek to {} ms landed at {} ms", self.id, time_ms, landed);
                    return Ok(landed);
                }
                Ok(None) => break,
                Err(PipelineError::NoMemory(e)) => {
                    warn!("demux task {}: no packet buffer after seek: {}", self.id, e);
                    self.starved = true;
                    self.state = TaskState::Demuxing;
                    return Ok(time_ms);
                }
                Err(e) => {
                    error!("demux task {}: read after seek failed: {}", self.id, e);
                    break;
                }
            }
        }

        self.end_of_stream();
        Ok(time_ms)
    }

    fn crop(&mut self, max_ms: i64) {
        let streams = &self.streams;
        let is_audio = |index: usize| streams.get(index).is_some_and(|s| s.kind() == MediaKind::Audio);
        for (key, queue) in self.queues.iter_mut() {
            let dropped = queue.crop(max_ms, is_audio);
            if dropped > 0 {
                debug!("demux task {}: cropped {} packets from {}", self.id, dropped, key);
            }
        }
    }

    fn handle_pull(&mut self, envelope: PacketEnvelope) {
        let Some(&key) = self.ports.get(&envelope.origin) else {
            warn!("demux task {}: request from unknown {}", self.id, envelope.origin);
            if let Some(responder) = envelope.responder {
                let _ = responder.send(PullReply::Error(PipelineError::InvalidOperate(
                    "port not connected".into(),
                )));
            }
            return;
        };
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };
        // held packets may have come back since
        self.starved = false;

        match envelope.request {
            PullRequest::RequestKeyframe => {
                let dropped = queue.skip_to_keyframe();
                debug!("demux task {}: keyframe requested on {}, dropped {}", self.id, key, dropped);
            }
            PullRequest::Pull => {
                let Some(responder) = envelope.responder else {
                    return;
                };
                if queue.has_pending() {
                    warn!("demux task {}: second pull on {} rejected", self.id, key);
                    let _ = responder.send(PullReply::Error(PipelineError::InvalidOperate(
                        format!("pull already pending on track {}", key),
                    )));
                    return;
                }

                if let Some(packet) = queue.packets.pop_front() {
                    let track = packet.stream_index;
                    queue.reply(responder, packet);
                    if let Some(stats) = &self.stats {
                        stats.on_queue_depth(track, queue.packets.len());
                    }
                } else if self.ended {
                    let _ = responder.send(PullReply::End);
                } else {
                    queue.pending = Some(responder);
                }
            }
        }
    }

    /// One iteration of the read loop.
    async fn read_once(&mut self) {
        match self.read_packet().await {
            Ok(Some(packet)) => self.dispatch(packet),
            Ok(None) => {
                info!("demux task {}: end of stream", self.id);
                self.end_of_stream();
            }
            Err(PipelineError::NoMemory(e)) => {
                debug!("demux task {}: waiting for packet buffers: {}", self.id, e);
                self.starved = true;
            }
            Err(e) => {
                error!("demux task {}: read failed: {}", self.id, e);
                self.end_of_stream();
            }
        }
    }

    async fn read_packet(&mut self) -> Result<Option<PacketRef>> {
        let parser = self
            .parser
            .as_mut()
            .ok_or_else(|| PipelineError::InvalidOperate("stream not opened".into()))?;
        let mut packet = self.pool.alloc()?;
        match parser.read_packet(&mut self.io, &mut packet).await? {
            ReadStatus::Packet => Ok(Some(packet)),
            ReadStatus::End => Ok(None),
        }
    }

    fn dispatch(&mut self, mut packet: PacketRef) {
        let index = packet.stream_index;
        let kind = self.streams.get(index).map(|s| s.kind());

        if let Some(extra_data) = packet.new_extra_data() {
            if let Some(stream) = self.streams.get_mut(index) {
                stream.extra_data = Some(extra_data.clone());
            }
        }
        self.update_stats(&packet, kind);

        let Some(key) = self.route(index) else {
            trace!("demux task {}: dropping packet of unconnected track {}", self.id, index);
            return;
        };
        let current_extra_data = self.streams.get(index).and_then(|s| s.extra_data.clone());
        let min_queue_length = self.min_queue_length;
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };

        if queue.extradata_refresh {
            queue.extradata_refresh = false;
            if let (None, Some(extra_data)) = (packet.new_extra_data(), current_extra_data) {
                packet.set_new_extra_data(extra_data);
            }
        }
        queue.deliver(packet, min_queue_length);

        if let Some(stats) = &self.stats {
            stats.on_queue_depth(index, queue.packets.len());
        }
    }

    fn update_stats(&mut self, packet: &PacketRef, kind: Option<MediaKind>) {
        let Some(stats) = &self.stats else {
            return;
        };
        let kind = kind.unwrap_or(MediaKind::Data);
        let index = packet.stream_index;
        stats.on_packet(index, kind, packet.size());

        let update = self.gop.entry(index).or_default().update(kind, packet);
        if let Some((length, interval_ms)) = update.closed_gop {
            stats.on_gop(index, length, interval_ms);
        }
        if let Some(fps) = update.encode_fps {
            stats.on_encode_rate(index, fps);
        }
    }

    fn end_of_stream(&mut self) {
        self.ended = true;
        self.state = TaskState::Ended;
        let mut ended = 0;
        for queue in self.queues.values_mut() {
            if queue.end() {
                ended += 1;
            }
        }
        debug!("demux task {}: ended {} pending pulls", self.id, ended);
    }

    /// The queue a packet of track `index` goes to.
    fn route(&self, index: usize) -> Option<TrackKey> {
        let track = TrackKey::Track(index);
        if self.queues.contains_key(&track) {
            Some(track)
        } else if self.queues.contains_key(&TrackKey::Any) {
            Some(TrackKey::Any)
        } else {
            None
        }
    }

    /// True when reading more would only grow full queues.
    fn backpressured(&self) -> bool {
        if self.live {
            return false;
        }
        let full = |q: &TrackQueue| q.packets.len() >= self.min_queue_length;
        // subtitle queues only hold the loop back when nothing else is connected
        if self.queues.values().any(|q| !q.is_subtitle()) {
            self.queues.values().filter(|q| !q.is_subtitle()).all(full)
        } else {
            self.queues.values().all(full)
        }
    }

    fn track_kind(&self, track: TrackKey) -> Result<Option<MediaKind>> {
        match track {
            TrackKey::Any => Ok(None),
            TrackKey::Track(index) if self.streams.is_empty() => {
                debug!("demux task {}: connecting track {} before analysis", self.id, index);
                Ok(None)
            }
            TrackKey::Track(index) => self
                .streams
                .get(index)
                .map(|s| Some(s.kind()))
                .ok_or_else(|| PipelineError::InvalidOperate(format!("no track {}", index))),
        }
    }

    /// Start time of `track` (or of the first connected track) in milliseconds.
    fn start_ms(&self, track: Option<usize>) -> i64 {
        let index = track
            .or_else(|| {
                self.queues.keys().find_map(|key| match key {
                    TrackKey::Track(i) => Some(*i),
                    TrackKey::Any => None,
                })
            })
            .unwrap_or(0);
        self.streams
            .get(index)
            .and_then(|s| s.start_time.map(|start| s.time_base.to_millis(start)))
            .unwrap_or(0)
    }

    fn teardown(&mut self) {
        self.looping = false;
        let released: usize = self.queues.values_mut().map(TrackQueue::release_all).sum();
        self.queues.clear();
        self.ports.clear();
        self.parser = None;
        info!("demux task {}: torn down, released {} packets", self.id, released);
    }
}
