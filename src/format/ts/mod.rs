//! # MPEG Transport Stream
//!
//! Demuxing of single-program transport streams:
//!
//! - PAT/PMT parsing with CRC checks
//! - PES reassembly per PID, with the PES header stripped from the payload
//! - Keyframe detection from the random access indicator, H.264 IDR and
//!   H.265 IRAP units
//! - Mid-stream H.264 parameter set changes carried as packet side data
//! - A seek index built while reading
//!
//! ```rust
//! use avpipe::format::ts::{TSPacketParser, TS_PACKET_SIZE};
//!
//! let mut packet = [0xFFu8; TS_PACKET_SIZE];
//! packet[..4].copy_from_slice(&[0x47, 0x40, 0x00, 0x10]);
//! let header = TSPacketParser::new().parse_header(&packet).unwrap();
//! assert!(header.payload_unit_start);
//! assert_eq!(header.pid, 0);
//! ```

pub mod demuxer;

/// Low-level TS packet, PSI and PES header parsing
pub mod parser;

pub mod types;


pub use demuxer::TSDemuxer;
pub use parser::{Section, TSPacketParser};
pub use types::{
    PESHeader, TSHeader, PID_PAT, STREAM_TYPE_AAC, STREAM_TYPE_H264, STREAM_TYPE_H265,
    TS_PACKET_SIZE,
};
