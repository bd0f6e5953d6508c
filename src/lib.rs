#![doc(html_root_url = "https://docs.rs/avpipe/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! # avpipe - pull-driven media pipeline
//!
//! `avpipe` turns a byte stream into decoded video frames through two
//! cooperating stages connected by request/reply ports:
//!
//! - the **demux stage** probes the container, analyzes its tracks and fills
//!   one packet queue per connected consumer, with backpressure, seeking and
//!   lossy queue cropping;
//! - the **decode stage** pulls packets from a demux port and serves frames,
//!   preferring a hardware engine and falling back to software ones when
//!   engines fail.
//!
//! Packets and frames live in recycling [`BufferPool`](av::BufferPool)s, so a
//! steady-state pipeline does not allocate per packet.
//!
//! ## Features
//!
//! ### Containers
//! - MPEG-TS (`mpegts` feature)
//! - ADTS AAC elementary streams (`adts` feature)
//! - Annex-B H.264 elementary streams (`h264` feature)
//!
//! ### Decoding
//! - Portable H.264 engine, always available
//! - Platform software and hardware engines through
//!   [`PlatformProvider`](codec::engine::PlatformProvider)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use avpipe::config;
//! use avpipe::format::FileSource;
//! use avpipe::stage::{
//!     ConnectOptions, DecodeOptions, DecodeStage, DemuxStage, PullReply, PullRequest,
//!     RegisterOptions, TrackKey,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let demux = DemuxStage::new(config::current());
//!     let decode = DecodeStage::new(config::current());
//!
//!     demux
//!         .register_task(RegisterOptions::new(1, FileSource::new("input.ts").spawn()))
//!         .await?;
//!     demux.open_stream(1, 0).await?;
//!     let streams = demux.analyze_streams(1).await?;
//!     let video = streams
//!         .iter()
//!         .find(|s| s.kind() == avpipe::av::MediaKind::Video)
//!         .ok_or("no video track")?;
//!
//!     let packets = demux
//!         .connect_stream_task(1, TrackKey::Track(video.index), ConnectOptions::default())
//!         .await?;
//!     let frames = decode
//!         .register_task(1, video.clone(), packets, DecodeOptions::default())
//!         .await?;
//!     demux.start_demux(1, false, 0).await?;
//!
//!     loop {
//!         match frames.call(PullRequest::Pull).await? {
//!             PullReply::Data(frame) => println!("frame at {} ms", frame.pts_millis()),
//!             PullReply::End => break,
//!             PullReply::Error(e) => return Err(e.into()),
//!         }
//!     }
//!
//!     decode.shutdown().await;
//!     demux.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `av`: packets, frames, stream descriptions and buffer pools
//! - `codec`: bitstream helpers and the decoder engines
//! - `format`: the I/O adapter, seek index and container parsers
//! - `stage`: ports, the demux and decode stages, stream statistics
//! - `config`: pipeline tunables loaded from the environment or a file
//! - `error`: the error type shared by every stage
//! - `utils`: bit reading and CRC helpers

/// Media types and buffer pools
pub mod av;

/// Bitstream helpers and decoder engines
pub mod codec;

/// Error types and utilities
pub mod error;

/// Container formats and the I/O adapter
pub mod format;

/// Pipeline stages and the ports between them
pub mod stage;

/// Common utilities and helper functions
pub mod utils;

/// Configuration module
pub mod config;

pub use error::{PipelineError, Result};
