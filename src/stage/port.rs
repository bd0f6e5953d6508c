//! Stage ports: request/reply channels between adjacent stages.
//!
//! A [`Port`] is the sending end. Several ports can feed one
//! [`PortListener`]; every envelope carries the [`PortId`] of the port it came
//! through, so the owning stage knows which consumer is asking.

use crate::{PipelineError, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl PortId {
    fn next() -> Self {
        PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Requests name their method for logging.
pub trait Method {
    fn method(&self) -> &'static str;
}

/// The reply side of one request.
pub struct Responder<R> {
    tx: oneshot::Sender<R>,
}

impl<R> Responder<R> {
    /// Sends the reply. Gives it back when the requester has gone away.
    pub fn send(self, reply: R) -> std::result::Result<(), R> {
        self.tx.send(reply)
    }

    /// True once the requester stopped waiting.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<R> fmt::Debug for Responder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One message as seen by the stage that owns the listener.
pub struct Envelope<Q, R> {
    pub origin: PortId,
    pub request: Q,
    /// `None` for notifications.
    pub responder: Option<Responder<R>>,
}

/// Sending end of a stage port.
pub struct Port<Q, R> {
    id: PortId,
    tx: mpsc::UnboundedSender<Envelope<Q, R>>,
}

impl<Q, R> Clone for Port<Q, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<Q, R> fmt::Debug for Port<Q, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({})", self.id)
    }
}

impl<Q: Method, R> Port<Q, R> {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Sends a request and waits for its reply.
    pub async fn call(&self, request: Q) -> Result<R> {
        self.request(request)?.await
    }

    /// Sends a request; the reply is awaited separately.
    pub fn request(&self, request: Q) -> Result<PendingReply<R>> {
        let (tx, rx) = oneshot::channel();
        log::trace!("{} -> {}", self.id, request.method());
        self.tx
            .send(Envelope {
                origin: self.id,
                request,
                responder: Some(Responder { tx }),
            })
            .map_err(|_| PipelineError::PortClosed)?;
        Ok(PendingReply { rx })
    }

    /// Fire-and-forget message.
    pub fn notify(&self, request: Q) -> Result<()> {
        log::trace!("{} -> {} (notify)", self.id, request.method());
        self.tx
            .send(Envelope {
                origin: self.id,
                request,
                responder: None,
            })
            .map_err(|_| PipelineError::PortClosed)
    }
}

/// A reply not received yet. Resolves to `PortClosed` if the other side
/// dropped the request unanswered.
pub struct PendingReply<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> Future for PendingReply<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.map_err(|_| PipelineError::PortClosed))
    }
}

/// Receiving end of one or more ports.
pub struct PortListener<Q, R> {
    rx: mpsc::UnboundedReceiver<Envelope<Q, R>>,
    tx: mpsc::WeakUnboundedSender<Envelope<Q, R>>,
}

/// A port and the listener it feeds.
pub fn channel<Q, R>() -> (Port<Q, R>, PortListener<Q, R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = PortListener {
        rx,
        tx: tx.downgrade(),
    };
    (
        Port {
            id: PortId::next(),
            tx,
        },
        listener,
    )
}

impl<Q, R> PortListener<Q, R> {
    /// A listener with no port yet; ports are minted with [`connect`](Self::connect).
    pub fn detached() -> (Self, mpsc::UnboundedSender<Envelope<Q, R>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PortListener {
                rx,
                tx: tx.downgrade(),
            },
            tx,
        )
    }

    /// Mints another port with its own id feeding this listener. `None` once
    /// every sender has been dropped.
    pub fn connect(&self) -> Option<Port<Q, R>> {
        self.tx.upgrade().map(|tx| Port {
            id: PortId::next(),
            tx,
        })
    }

    /// Next envelope; `None` when every port is gone.
    pub async fn recv(&mut self) -> Option<Envelope<Q, R>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope<Q, R>> {
        self.rx.try_recv().ok()
    }
}
