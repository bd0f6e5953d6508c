//! Byte-stream access for the demuxer.
//!
//! The demux stage never touches a file or socket itself. It talks to a
//! loader over an [`IoPort`] using [`IoRequest`]s, and [`IoContext`] puts a
//! fixed read buffer in front of that port for the format parsers.

use crate::stage::port::{self, Method, Port};
use crate::{PipelineError, Result};
use bytes::Bytes;
use log::{debug, trace};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

#[derive(Debug, Clone, PartialEq)]
pub enum IoRequest {
    Open,
    Read { len: usize },
    Seek { pos: u64 },
    Size,
}

impl Method for IoRequest {
    fn method(&self) -> &'static str {
        match self {
            IoRequest::Open => "open",
            IoRequest::Read { .. } => "read",
            IoRequest::Seek { .. } => "seek",
            IoRequest::Size => "size",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IoReply {
    Opened,
    /// Up to the requested number of bytes; empty at end of stream.
    Data(Bytes),
    Position(u64),
    Size(u64),
    Failed(String),
}

pub type IoPort = Port<IoRequest, IoReply>;

fn unexpected(reply: IoReply) -> PipelineError {
    match reply {
        IoReply::Failed(msg) => PipelineError::Transport(msg),
        other => PipelineError::Transport(format!("unexpected loader reply {:?}", other)),
    }
}

/// Buffered reader over an [`IoPort`].
pub struct IoContext {
    port: IoPort,
    buffer: Vec<u8>,
    start: usize,
    /// Stream offset of `buffer[start]`.
    position: u64,
    eof: bool,
    size: Option<u64>,
}

impl IoContext {
    /// Allocates the read buffer up front; fails with `NoMemory` if it can't.
    pub fn new(port: IoPort, buffer_size: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(buffer_size).map_err(|e| {
            PipelineError::NoMemory(format!("read buffer of {} bytes: {}", buffer_size, e))
        })?;
        Ok(Self {
            port,
            buffer,
            start: 0,
            position: 0,
            eof: false,
            size: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Asks the loader to open its source.
    pub async fn open(&mut self) -> Result<()> {
        match self.port.call(IoRequest::Open).await? {
            IoReply::Opened => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Reads once from the loader into the free part of the buffer.
    /// Returns the number of bytes added; 0 means end of stream.
    pub async fn fill(&mut self) -> Result<usize> {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        let free = self.buffer.capacity() - self.buffer.len();
        if free == 0 {
            return Ok(0);
        }

        match self.port.call(IoRequest::Read { len: free }).await? {
            IoReply::Data(data) if data.is_empty() => {
                self.eof = true;
                Ok(0)
            }
            IoReply::Data(data) => {
                let n = data.len().min(free);
                self.buffer.extend_from_slice(&data[..n]);
                trace!("filled {} bytes at {}", n, self.position + self.available() as u64);
                Ok(n)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Makes at least `n` bytes available. `Ok(false)` when the stream ends first.
    pub async fn ensure(&mut self, n: usize) -> Result<bool> {
        if n > self.buffer.capacity() - self.start {
            let extra = n.saturating_sub(self.buffer.len());
            self.buffer.try_reserve(extra).map_err(|e| {
                PipelineError::NoMemory(format!("growing read buffer to {} bytes: {}", n, e))
            })?;
        }
        while self.available() < n {
            if self.eof || self.fill().await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn available(&self) -> usize {
        self.buffer.len() - self.start
    }

    /// The buffered bytes not consumed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.start..]
    }

    /// Up to `n` buffered bytes without consuming them.
    pub fn peek(&self, n: usize) -> &[u8] {
        let end = self.start + n.min(self.available());
        &self.buffer[self.start..end]
    }

    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.available());
        self.start += n;
        self.position += n as u64;
    }

    /// Reads exactly `n` bytes, or `None` at end of stream.
    pub async fn read_bytes(&mut self, n: usize) -> Result<Option<Bytes>> {
        if !self.ensure(n).await? {
            return Ok(None);
        }
        let bytes = Bytes::copy_from_slice(self.peek(n));
        self.consume(n);
        Ok(Some(bytes))
    }

    /// Skips `n` bytes. `Ok(false)` when the stream ends first.
    pub async fn skip(&mut self, mut n: usize) -> Result<bool> {
        loop {
            let step = n.min(self.available());
            self.consume(step);
            n -= step;
            if n == 0 {
                return Ok(true);
            }
            if self.eof || self.fill().await? == 0 {
                return Ok(false);
            }
        }
    }

    /// Stream offset of the next unconsumed byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True once the loader reported end of stream and the buffer is drained.
    pub fn is_eof(&self) -> bool {
        self.eof && self.available() == 0
    }

    /// Repositions the stream, reusing buffered bytes when the target is inside them.
    pub async fn seek(&mut self, pos: u64) -> Result<()> {
        let buffered_start = self.position - (self.start as u64);
        let buffered_end = self.position + self.available() as u64;
        if pos >= buffered_start && pos <= buffered_end {
            self.start = (pos - buffered_start) as usize;
            self.position = pos;
            return Ok(());
        }

        match self.port.call(IoRequest::Seek { pos }).await? {
            IoReply::Position(actual) => {
                debug!("loader seek to {} landed at {}", pos, actual);
                self.buffer.clear();
                self.start = 0;
                self.position = actual;
                self.eof = false;
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Total stream size, asked once and cached.
    pub async fn size(&mut self) -> Result<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        match self.port.call(IoRequest::Size).await? {
            IoReply::Size(size) => {
                self.size = Some(size);
                Ok(size)
            }
            other => Err(unexpected(other)),
        }
    }
}

/// Serves the I/O protocol from bytes held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    chunk_size: usize,
    fail_after: Option<u64>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            chunk_size: usize::MAX,
            fail_after: None,
        }
    }

    /// Answers reads with at most `chunk_size` bytes.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Fails every read that starts at or after `offset`.
    pub fn fail_after(mut self, offset: u64) -> Self {
        self.fail_after = Some(offset);
        self
    }

    /// Spawns the loader and returns the port to reach it.
    pub fn spawn(self) -> IoPort {
        let (port, mut listener) = port::channel::<IoRequest, IoReply>();
        tokio::spawn(async move {
            let mut pos = 0u64;
            while let Some(envelope) = listener.recv().await {
                let reply = match envelope.request {
                    IoRequest::Open => IoReply::Opened,
                    IoRequest::Read { .. } if self.fail_after.is_some_and(|at| pos >= at) => {
                        IoReply::Failed(format!("read failed at offset {}", pos))
                    }
                    IoRequest::Read { len } => {
                        let start = (pos as usize).min(self.data.len());
                        let end = start.saturating_add(len.min(self.chunk_size)).min(self.data.len());
                        pos = end as u64;
                        IoReply::Data(self.data.slice(start..end))
                    }
                    IoRequest::Seek { pos: target } => {
                        pos = target.min(self.data.len() as u64);
                        IoReply::Position(pos)
                    }
                    IoRequest::Size => IoReply::Size(self.data.len() as u64),
                };
                if let Some(responder) = envelope.responder {
                    let _ = responder.send(reply);
                }
            }
        });
        port
    }
}

/// Serves the I/O protocol from a local file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn spawn(self) -> IoPort {
        let (port, mut listener) = port::channel::<IoRequest, IoReply>();
        tokio::spawn(async move {
            let mut file: Option<File> = None;
            while let Some(envelope) = listener.recv().await {
                let reply = match self.handle(&mut file, envelope.request).await {
                    Ok(reply) => reply,
                    Err(e) => IoReply::Failed(format!("{}: {}", self.path.display(), e)),
                };
                if let Some(responder) = envelope.responder {
                    let _ = responder.send(reply);
                }
            }
        });
        port
    }

    async fn handle(&self, file: &mut Option<File>, request: IoRequest) -> std::io::Result<IoReply> {
        if let IoRequest::Open = request {
            *file = Some(File::open(&self.path).await?);
            return Ok(IoReply::Opened);
        }
        let Some(file) = file.as_mut() else {
            return Ok(IoReply::Failed("file not opened".into()));
        };

        Ok(match request {
            IoRequest::Open => IoReply::Opened,
            IoRequest::Read { len } => {
                let mut buf = vec![0u8; len.min(1 << 20)];
                let n = file.read(&mut buf).await?;
                buf.truncate(n);
                IoReply::Data(Bytes::from(buf))
            }
            IoRequest::Seek { pos } => IoReply::Position(file.seek(SeekFrom::Start(pos)).await?),
            IoRequest::Size => IoReply::Size(file.metadata().await?.len()),
        })
    }
}
