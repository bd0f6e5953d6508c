//! # Demux stage
//!
//! Turns a byte stream from an upstream loader into per-track packet queues.
//!
//! Each registered task is an actor owning its [`IoContext`], its format
//! parser and one [`TrackQueue`](queue::TrackQueue) per connected downstream
//! port. Commands and pulls are handled between iterations of the read loop,
//! so stopping the loop for a seek or a reconnection never interrupts a read
//! in flight.
//!
//! Once started, the loop reads one packet per iteration. Outside live mode
//! it idles while every active track already has `min_queue_length` packets
//! queued; a pull that drains a queue wakes it again.
//!
//! ```rust
//! use avpipe::config::PipelineConfig;
//! use avpipe::format::MemorySource;
//! use avpipe::stage::{ConnectOptions, DemuxStage, PullReply, PullRequest, RegisterOptions, TrackKey};
//!
//! # tokio_test::block_on(async {
//! // two ADTS frames: AAC-LC, 44.1 kHz, stereo, 2 payload bytes each
//! let frame = [0xFF, 0xF1, 0x50, 0x80, 0x01, 0x3F, 0xFC, 0xAA, 0xBB];
//! let data = [frame, frame].concat();
//!
//! let stage = DemuxStage::new(PipelineConfig::default());
//! stage.register_task(RegisterOptions::new(1, MemorySource::new(data).spawn())).await?;
//! stage.open_stream(1, 1000).await?;
//! let streams = stage.analyze_streams(1).await?;
//! assert_eq!(streams[0].sample_rate, Some(44100));
//!
//! let port = stage.connect_stream_task(1, TrackKey::Track(0), ConnectOptions::default()).await?;
//! stage.start_demux(1, false, 4).await?;
//! for _ in 0..2 {
//!     let reply = port.call(PullRequest::Pull).await?;
//!     assert_eq!(reply.into_data().map(|p| p.data.to_vec()), Some(vec![0xAA, 0xBB]));
//! }
//! assert!(port.call(PullRequest::Pull).await?.is_end());
//! stage.unregister_task(1).await?;
//! # Ok::<(), avpipe::PipelineError>(())
//! # }).unwrap();
//! ```

mod queue;
mod task;

use crate::av::{PacketPool, StreamInfo};
use crate::config::PipelineConfig;
use crate::format::{ContainerFormat, FormatParser, IoContext, IoPort, SeekFlags};
use crate::stage::stats::StatsSink;
use crate::stage::{PacketPort, TaskId};
use crate::{PipelineError, Result};
use futures::future::join_all;
use log::{error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use task::DemuxTask;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Lifecycle of a demux task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Opened,
    Probing,
    Demuxing,
    Seeking,
    Ended,
}

/// Which packets a downstream port receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKey {
    /// Packets of every track nobody else is connected to.
    Any,
    Track(usize),
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKey::Any => f.write_str("any"),
            TrackKey::Track(i) => write!(f, "#{}", i),
        }
    }
}

pub struct RegisterOptions {
    pub task_id: TaskId,
    pub io: IoPort,
    /// Read buffer size; the configured default when `None`.
    pub buffer_size: Option<usize>,
    pub stats: Option<Arc<dyn StatsSink>>,
}

impl RegisterOptions {
    pub fn new(task_id: TaskId, io: IoPort) -> Self {
        Self {
            task_id,
            io,
            buffer_size: None,
            stats: None,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(stats);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Reply with a detached copy and release the pooled packet at once.
    /// For consumers that hold packets across an isolation boundary.
    pub copy_on_reply: bool,
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum DemuxCommand {
    OpenStream {
        max_probe_duration_ms: u64,
        result: Reply<ContainerFormat>,
    },
    OpenWith {
        parser: Box<dyn FormatParser>,
        max_probe_duration_ms: u64,
        result: Reply<()>,
    },
    AnalyzeStreams {
        result: Reply<Vec<StreamInfo>>,
    },
    Connect {
        track: TrackKey,
        options: ConnectOptions,
        result: Reply<PacketPort>,
    },
    ChangeConnect {
        new: TrackKey,
        old: TrackKey,
        force: bool,
        result: Reply<()>,
    },
    Start {
        live: bool,
        min_queue_length: usize,
        result: Reply<()>,
    },
    Seek {
        time_ms: i64,
        flags: SeekFlags,
        track: Option<usize>,
        result: Reply<i64>,
    },
    Crop {
        max_ms: i64,
        result: Reply<()>,
    },
    State {
        result: Reply<TaskState>,
    },
    QueueDepths {
        result: Reply<Vec<(TrackKey, usize)>>,
    },
    Unregister {
        result: Reply<()>,
    },
}

struct TaskHandle {
    commands: mpsc::UnboundedSender<DemuxCommand>,
    join: JoinHandle<()>,
}

/// The demux stage: a registry of demux task actors.
pub struct DemuxStage {
    config: PipelineConfig,
    pool: PacketPool,
    tasks: Mutex<HashMap<TaskId, TaskHandle>>,
}

impl DemuxStage {
    pub fn new(config: PipelineConfig) -> Self {
        let pool = PacketPool::with_capacity(config.pool_capacity);
        Self::with_pool(config, pool)
    }

    /// A stage allocating packets from an existing pool.
    pub fn with_pool(config: PipelineConfig, pool: PacketPool) -> Self {
        Self {
            config,
            pool,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// Allocates the task's read buffer and spawns its actor.
    pub async fn register_task(&self, options: RegisterOptions) -> Result<()> {
        let id = options.task_id;
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&id) {
            return Err(PipelineError::InvalidOperate(format!(
                "demux task {} already registered",
                id
            )));
        }

        let buffer_size = options.buffer_size.unwrap_or(self.config.read_buffer_size);
        let io = IoContext::new(options.io, buffer_size)?;
        let (commands, rx) = mpsc::unbounded_channel();
        let task = DemuxTask::new(id, self.config.clone(), self.pool.clone(), io, options.stats);
        let join = tokio::spawn(task.run(rx));

        tasks.insert(id, TaskHandle { commands, join });
        info!("demux task {} registered ({} byte read buffer)", id, buffer_size);
        Ok(())
    }

    /// Opens the loader, detects the container and opens its parser.
    pub async fn open_stream(&self, id: TaskId, max_probe_duration_ms: u64) -> Result<ContainerFormat> {
        self.send(id, |result| DemuxCommand::OpenStream {
            max_probe_duration_ms,
            result,
        })
        .await
    }

    /// Opens the loader and a caller-supplied parser, skipping detection.
    pub async fn open_stream_with(
        &self,
        id: TaskId,
        parser: Box<dyn FormatParser>,
        max_probe_duration_ms: u64,
    ) -> Result<()> {
        self.send(id, |result| DemuxCommand::OpenWith {
            parser,
            max_probe_duration_ms,
            result,
        })
        .await
    }

    pub async fn analyze_streams(&self, id: TaskId) -> Result<Vec<StreamInfo>> {
        self.send(id, |result| DemuxCommand::AnalyzeStreams { result })
            .await
    }

    /// Attaches a new downstream port fed by `track`.
    pub async fn connect_stream_task(
        &self,
        id: TaskId,
        track: TrackKey,
        options: ConnectOptions,
    ) -> Result<PacketPort> {
        self.send(id, |result| DemuxCommand::Connect {
            track,
            options,
            result,
        })
        .await
    }

    /// Re-keys the port bound to `old` so it receives `new` instead.
    pub async fn change_connect_stream(
        &self,
        id: TaskId,
        new: TrackKey,
        old: TrackKey,
        force: bool,
    ) -> Result<()> {
        self.send(id, |result| DemuxCommand::ChangeConnect {
            new,
            old,
            force,
            result,
        })
        .await
    }

    /// Starts the read loop. A `min_queue_length` of 0 uses the configured default.
    pub async fn start_demux(&self, id: TaskId, live: bool, min_queue_length: usize) -> Result<()> {
        self.send(id, |result| DemuxCommand::Start {
            live,
            min_queue_length,
            result,
        })
        .await
    }

    /// Seeks to `time_ms` relative to the track start. Returns the rebased
    /// presentation time of the first packet delivered afterwards.
    pub async fn seek(
        &self,
        id: TaskId,
        time_ms: i64,
        flags: SeekFlags,
        track: Option<usize>,
    ) -> Result<i64> {
        self.send(id, |result| DemuxCommand::Seek {
            time_ms,
            flags,
            track,
            result,
        })
        .await
    }

    /// Caps every queue to the last `max_ms` of packets.
    pub async fn crop_packet_queue(&self, id: TaskId, max_ms: i64) -> Result<()> {
        self.send(id, |result| DemuxCommand::Crop { max_ms, result })
            .await
    }

    pub async fn task_state(&self, id: TaskId) -> Result<TaskState> {
        self.send(id, |result| DemuxCommand::State { result }).await
    }

    /// Queued packets per connected port.
    pub async fn queue_depths(&self, id: TaskId) -> Result<Vec<(TrackKey, usize)>> {
        self.send(id, |result| DemuxCommand::QueueDepths { result })
            .await
    }

    /// Stops the loop, closes every port and releases everything the task holds.
    pub async fn unregister_task(&self, id: TaskId) -> Result<()> {
        let handle = self.tasks.lock().remove(&id).ok_or_else(|| unknown(id))?;
        let (tx, rx) = oneshot::channel();
        if handle.commands.send(DemuxCommand::Unregister { result: tx }).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = handle.join.await {
            error!("demux task {} did not stop cleanly: {}", id, e);
        }
        info!("demux task {} unregistered", id);
        Ok(())
    }

    /// Unregisters every task.
    pub async fn shutdown(&self) {
        let ids: Vec<TaskId> = self.tasks.lock().keys().copied().collect();
        join_all(ids.into_iter().map(|id| self.unregister_task(id))).await;
    }

    async fn send<T>(&self, id: TaskId, command: impl FnOnce(Reply<T>) -> DemuxCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        {
            let tasks = self.tasks.lock();
            let handle = tasks.get(&id).ok_or_else(|| unknown(id))?;
            handle
                .commands
                .send(command(tx))
                .map_err(|_| PipelineError::PortClosed)?;
        }
        rx.await.map_err(|_| PipelineError::PortClosed)?
    }
}

fn unknown(id: TaskId) -> PipelineError {
    error!("no demux task {}", id);
    PipelineError::InvalidOperate(format!("no demux task {}", id))
}
