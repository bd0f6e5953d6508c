use crate::av::{MediaKind, PacketRef};
use crate::stage::port::{PortId, Responder};
use crate::stage::PullReply;
use log::trace;
use std::collections::VecDeque;

type PacketResponder = Responder<PullReply<PacketRef>>;

/// Packets waiting for one downstream port, plus that port's pending pull.
pub(super) struct TrackQueue {
    pub port: PortId,
    /// Media kind of the bound track; `None` for the any-track queue.
    pub kind: Option<MediaKind>,
    pub packets: VecDeque<PacketRef>,
    pub pending: Option<PacketResponder>,
    pub copy_on_reply: bool,
    /// Attach the track's current extradata to the next packet delivered.
    pub extradata_refresh: bool,
}

impl TrackQueue {
    pub fn new(port: PortId, kind: Option<MediaKind>, copy_on_reply: bool) -> Self {
        Self {
            port,
            kind,
            packets: VecDeque::new(),
            pending: None,
            copy_on_reply,
            extradata_refresh: false,
        }
    }

    pub fn is_subtitle(&self) -> bool {
        self.kind == Some(MediaKind::Subtitle)
    }

    /// True while a live pull is waiting on this queue.
    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|r| !r.is_closed())
    }

    /// Answers `responder` with `packet`. A packet whose requester went away
    /// goes back to the front of the queue.
    pub fn reply(&mut self, responder: PacketResponder, packet: PacketRef) {
        let packet = if self.copy_on_reply {
            packet.into_detached()
        } else {
            packet
        };
        if let Err(PullReply::Data(packet)) = responder.send(PullReply::Data(packet)) {
            trace!("{} dropped its pull, requeueing", self.port);
            self.packets.push_front(packet);
        }
    }

    /// Delivers to the pending pull if there is one, else queues.
    pub fn deliver(&mut self, packet: PacketRef, min_queue_length: usize) {
        match self.pending.take() {
            Some(responder) if !responder.is_closed() => self.reply(responder, packet),
            _ => {
                self.packets.push_back(packet);
                if self.is_subtitle() {
                    while self.packets.len() > min_queue_length.max(1) {
                        self.packets.pop_front();
                    }
                }
            }
        }
    }

    /// Answers a pending pull with end of stream, if nothing is queued for it.
    pub fn end(&mut self) -> bool {
        if !self.packets.is_empty() {
            return false;
        }
        match self.pending.take() {
            Some(responder) => responder.send(PullReply::End).is_ok(),
            None => false,
        }
    }

    /// Drops queued packets ahead of the first queued keyframe.
    pub fn skip_to_keyframe(&mut self) -> usize {
        match self.packets.iter().position(|p| p.is_key) {
            Some(at) => {
                self.packets.drain(..at);
                at
            }
            None => 0,
        }
    }

    /// Releases everything older than `max_ms` behind the newest packet.
    ///
    /// Only keyframes and audio packets count as cut points; `is_audio`
    /// resolves a packet's track kind. Video packets that depended on a
    /// dropped keyframe are not protected.
    pub fn crop(&mut self, max_ms: i64, is_audio: impl Fn(usize) -> bool) -> usize {
        let Some(newest) = self.packets.back().and_then(|p| p.pts_millis()) else {
            return 0;
        };

        let mut cut = None;
        for (i, packet) in self.packets.iter().enumerate().rev() {
            let Some(ms) = packet.pts_millis() else {
                continue;
            };
            if newest - ms > max_ms {
                break;
            }
            if packet.is_key || is_audio(packet.stream_index) {
                cut = Some(i);
            }
        }

        match cut {
            Some(at) => {
                self.packets.drain(..at);
                at
            }
            None => 0,
        }
    }

    /// Releases every queued packet.
    pub fn release_all(&mut self) -> usize {
        let n = self.packets.len();
        self.packets.clear();
        n
    }
}
