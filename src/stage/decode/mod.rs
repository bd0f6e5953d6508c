//! # Decode stage
//!
//! Pulls packets from a demux port and serves decoded frames on its own port.
//!
//! Each task holds up to two engines: a software one (platform-native when
//! allowed and available, else the portable engine) and, when permitted, a
//! hardware one, which is preferred as the target. Decode failures walk a
//! fallback chain: hardware to software, then platform-native software to
//! the portable engine. A failing keyframe is retried on the next engine; a
//! failing non-keyframe instead asks upstream for a fresh keyframe.
//!
//! Engines emit frames asynchronously, tagged with a serial. Only frames
//! from the current target engine reach the consumer.

mod selection;
mod task;
#[cfg(test)]
mod tests;

pub use selection::SelectionSnapshot;

use crate::av::{FramePool, StreamInfo};
use crate::codec::engine::{DefaultEngineFactory, EngineFactory};
use crate::config::PipelineConfig;
use crate::stage::stats::StatsSink;
use crate::stage::{FramePort, PacketPort, TaskId};
use crate::{PipelineError, Result};
use futures::future::join_all;
use log::{error, info};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use task::DecodeTask;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct DecodeOptions {
    pub allow_hardware: bool,
    /// Prefer a platform software codec over the portable engine.
    pub allow_native: bool,
    /// Software decoder threads; picked from the stream parameters when `None`.
    pub threads: Option<usize>,
    pub stats: Option<Arc<dyn StatsSink>>,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            allow_hardware: true,
            allow_native: true,
            threads: None,
            stats: None,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum DecodeCommand {
    Reopen {
        params: StreamInfo,
        result: Reply<()>,
    },
    SetPlayRate {
        rate: f64,
        result: Reply<()>,
    },
    Reset {
        result: Reply<()>,
    },
    Selection {
        result: Reply<SelectionSnapshot>,
    },
    Unregister {
        result: Reply<()>,
    },
}

struct TaskHandle {
    commands: mpsc::UnboundedSender<DecodeCommand>,
    join: JoinHandle<()>,
}

/// The decode stage: a registry of decode task actors.
pub struct DecodeStage {
    config: PipelineConfig,
    factory: Arc<dyn EngineFactory>,
    pool: FramePool,
    tasks: Mutex<HashMap<TaskId, TaskHandle>>,
}

impl DecodeStage {
    /// A stage using the bundled engines only.
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultEngineFactory::new()))
    }

    pub fn with_factory(config: PipelineConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let pool = FramePool::with_capacity(config.pool_capacity);
        Self {
            config,
            factory,
            pool,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Opens the engines for `params` and starts serving frames decoded from
    /// `upstream`. Returns the port consumers pull frames from.
    pub async fn register_task(
        &self,
        id: TaskId,
        params: StreamInfo,
        upstream: PacketPort,
        options: DecodeOptions,
    ) -> Result<FramePort> {
        if self.tasks.lock().contains_key(&id) {
            return Err(PipelineError::InvalidOperate(format!(
                "decode task {} already registered",
                id
            )));
        }

        let (task, port) = DecodeTask::open(
            id,
            self.config.clone(),
            Arc::clone(&self.factory),
            self.pool.clone(),
            params,
            upstream,
            options,
        )
        .await?;

        let duplicate = {
            let mut tasks = self.tasks.lock();
            match tasks.entry(id) {
                Entry::Occupied(_) => Some(task),
                Entry::Vacant(slot) => {
                    let (commands, rx) = mpsc::unbounded_channel();
                    let join = tokio::spawn(task.run(rx));
                    slot.insert(TaskHandle { commands, join });
                    None
                }
            }
        };
        if let Some(task) = duplicate {
            task.close().await;
            return Err(PipelineError::InvalidOperate(format!(
                "decode task {} already registered",
                id
            )));
        }
        info!("decode task {} registered", id);
        Ok(port)
    }

    /// Replaces the task's engines for new codec parameters. Ports stay as they are.
    pub async fn reopen_decoder(&self, id: TaskId, params: StreamInfo) -> Result<()> {
        self.send(id, |result| DecodeCommand::Reopen { params, result })
            .await
    }

    /// Adjusts the software engine's frame skipping for playback at `rate`.
    pub async fn set_play_rate(&self, id: TaskId, rate: f64) -> Result<()> {
        self.send(id, |result| DecodeCommand::SetPlayRate { rate, result })
            .await
    }

    /// Drops queued frames and decoder state, e.g. after a seek upstream.
    pub async fn reset_task(&self, id: TaskId) -> Result<()> {
        self.send(id, |result| DecodeCommand::Reset { result }).await
    }

    pub async fn selection(&self, id: TaskId) -> Result<SelectionSnapshot> {
        self.send(id, |result| DecodeCommand::Selection { result })
            .await
    }

    /// Closes the engines and the task's port.
    pub async fn unregister_task(&self, id: TaskId) -> Result<()> {
        let handle = self.tasks.lock().remove(&id).ok_or_else(|| unknown(id))?;
        let (tx, rx) = oneshot::channel();
        if handle.commands.send(DecodeCommand::Unregister { result: tx }).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = handle.join.await {
            error!("decode task {} did not stop cleanly: {}", id, e);
        }
        info!("decode task {} unregistered", id);
        Ok(())
    }

    /// Unregisters every task.
    pub async fn shutdown(&self) {
        let ids: Vec<TaskId> = self.tasks.lock().keys().copied().collect();
        join_all(ids.into_iter().map(|id| self.unregister_task(id))).await;
    }

    async fn send<T>(&self, id: TaskId, command: impl FnOnce(Reply<T>) -> DecodeCommand) -> Result<T> {
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
    error!("no decode task {}", id);
    PipelineError::InvalidOperate(format!("no decode task {}", id))
}
