//! # Pipeline stages
//!
//! A stage owns a set of tasks. Every task runs as its own tokio actor: the
//! stage handle sends it commands and awaits a `oneshot` reply, and
//! downstream consumers reach it through [`Port`]s speaking the pull
//! protocol.
//!
//! ```text
//!  loader --IoPort--> DemuxStage --PacketPort--> DecodeStage --FramePort--> consumer
//! ```
//!
//! A consumer sends [`PullRequest::Pull`] and receives exactly one
//! [`PullReply`]: a packet or frame, [`PullReply::End`], or an error. The
//! producer may hold the reply back until data is available. Only one pull
//! per port may be outstanding; a second one is answered with
//! `InvalidOperate` while the first stays pending.

pub mod decode;
pub mod demux;
pub mod port;
pub mod stats;

pub use decode::{DecodeOptions, DecodeStage, SelectionSnapshot};
pub use demux::{ConnectOptions, DemuxStage, RegisterOptions, TaskState, TrackKey};
pub use port::{Envelope, Method, PendingReply, Port, PortId, PortListener, Responder};
pub use stats::{GopTracker, StatsSink, StatsSnapshot, StreamStatistics};

use crate::av::{FrameRef, PacketRef};
use crate::PipelineError;

/// Identifier of a task within its stage.
pub type TaskId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequest {
    /// Ask for the next unit.
    Pull,
    /// Fire-and-forget: the consumer cannot continue without a keyframe.
    RequestKeyframe,
}

impl Method for PullRequest {
    fn method(&self) -> &'static str {
        match self {
            PullRequest::Pull => "pull",
            PullRequest::RequestKeyframe => "requestKeyframe",
        }
    }
}

#[derive(Debug)]
pub enum PullReply<T> {
    Data(T),
    /// The stream is exhausted. Not an error.
    End,
    Error(PipelineError),
}

impl<T> PullReply<T> {
    pub fn is_end(&self) -> bool {
        matches!(self, PullReply::End)
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            PullReply::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Negative wire code for errors, 0 otherwise.
    pub fn code(&self) -> i32 {
        match self {
            PullReply::Error(e) => e.code(),
            _ => 0,
        }
    }
}

pub type PacketPort = Port<PullRequest, PullReply<PacketRef>>;
pub type FramePort = Port<PullRequest, PullReply<FrameRef>>;
