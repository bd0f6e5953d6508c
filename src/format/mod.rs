//! # Container formats
//!
//! The demux stage reaches container parsers through the [`FormatParser`]
//! trait. Built-in parsers are listed in the closed [`ContainerFormat`]
//! registry, which also detects the format of a byte stream from its first
//! bytes. Each built-in parser sits behind a cargo feature of the same name.
//!
//! ```rust
//! use avpipe::format::ContainerFormat;
//!
//! let mut ts = vec![0u8; 188 * 3];
//! for chunk in ts.chunks_mut(188) {
//!     chunk[0] = 0x47;
//! }
//! assert_eq!(ContainerFormat::probe(&ts), Some(ContainerFormat::MpegTs));
//! assert_eq!(ContainerFormat::probe(b"not media"), None);
//! ```

use crate::av::{Packet, StreamInfo};
use crate::codec::aac::{find_adts_sync, parse_adts_header};
use crate::codec::h264::find_start_code;
use crate::{PipelineError, Result};
use async_trait::async_trait;
use std::fmt;

#[cfg(feature = "adts")]
pub mod aac;
#[cfg(feature = "h264")]
pub mod h264;
pub mod index;
pub mod io;
#[cfg(feature = "mpegts")]
pub mod ts;

pub use index::{IndexEntry, Indexed, SeekFlags, SeekIndex};
pub use io::{FileSource, IoContext, IoPort, IoReply, IoRequest, MemorySource};

/// Options handed to [`FormatParser::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Upper bound on how much media stream analysis may read.
    pub max_analyze_duration_ms: u64,
    /// Skip reading ahead for stream parameters the container headers don't carry.
    pub fast_open: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            max_analyze_duration_ms: 5000,
            fast_open: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The output packet was filled.
    Packet,
    End,
}

/// Container parser contract used by the demux stage.
#[async_trait]
pub trait FormatParser: Send {
    fn name(&self) -> &'static str;

    async fn open(&mut self, io: &mut IoContext, options: &OpenOptions) -> Result<()>;

    /// Per-track codec parameters, available after `open`.
    async fn analyze_streams(&mut self, io: &mut IoContext) -> Result<Vec<StreamInfo>>;

    /// Reads the next packet into `packet`.
    async fn read_packet(&mut self, io: &mut IoContext, packet: &mut Packet) -> Result<ReadStatus>;

    /// Repositions reading near `time_ms` (track time, milliseconds) and
    /// returns the timestamp actually landed on.
    async fn seek(
        &mut self,
        io: &mut IoContext,
        track: Option<usize>,
        time_ms: i64,
        flags: SeekFlags,
    ) -> Result<i64>;
}

/// Built-in container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    MpegTs,
    Adts,
    H264AnnexB,
}

const TS_PACKET_SIZE: usize = 188;

impl ContainerFormat {
    pub const ALL: [ContainerFormat; 3] = [
        ContainerFormat::MpegTs,
        ContainerFormat::Adts,
        ContainerFormat::H264AnnexB,
    ];

    /// Detects the container from the first bytes of a stream.
    pub fn probe(data: &[u8]) -> Option<ContainerFormat> {
        ContainerFormat::ALL
            .into_iter()
            .map(|format| (format.score(data), format))
            .filter(|(score, _)| *score > 0)
            .max_by_key(|(score, _)| *score)
            .map(|(_, format)| format)
    }

    /// Confidence (0 to 100) that `data` starts a stream of this format.
    pub fn score(&self, data: &[u8]) -> u32 {
        match self {
            ContainerFormat::MpegTs => {
                let packets = data.len() / TS_PACKET_SIZE;
                if packets == 0 {
                    return 0;
                }
                let synced = (0..packets.min(8))
                    .take_while(|i| data[i * TS_PACKET_SIZE] == 0x47)
                    .count();
                match synced {
                    n if n >= 3 || (n == packets && n > 0) => 100,
                    _ => 0,
                }
            }
            ContainerFormat::Adts => {
                if find_adts_sync(data, 0) != Some(0) {
                    return 0;
                }
                let Ok(first) = parse_adts_header(data) else {
                    return 0;
                };
                let next = first.frame_length as usize;
                match data.get(next..).map(parse_adts_header) {
                    Some(Ok(second)) if second.same_stream(&first) => 90,
                    Some(Ok(_)) | Some(Err(_)) if next < data.len() => 0,
                    _ => 50,
                }
            }
            ContainerFormat::H264AnnexB => {
                let Some((pos, len)) = find_start_code(data, 0) else {
                    return 0;
                };
                if data[..pos].iter().any(|&b| b != 0) {
                    return 0;
                }
                match data.get(pos + len).map(|b| b & 0x1F) {
                    Some(7) | Some(9) => 80,
                    Some(5) => 40,
                    _ => 0,
                }
            }
        }
    }

    pub fn is_compiled_in(&self) -> bool {
        match self {
            ContainerFormat::MpegTs => cfg!(feature = "mpegts"),
            ContainerFormat::Adts => cfg!(feature = "adts"),
            ContainerFormat::H264AnnexB => cfg!(feature = "h264"),
        }
    }

    /// A fresh parser for this format; `FormatNotSupport` when its feature is off.
    pub fn create_parser(&self) -> Result<Box<dyn FormatParser>> {
        match self {
            #[cfg(feature = "mpegts")]
            ContainerFormat::MpegTs => Ok(Box::new(ts::TSDemuxer::new())),
            #[cfg(feature = "adts")]
            ContainerFormat::Adts => Ok(Box::new(aac::AACDemuxer::new())),
            #[cfg(feature = "h264")]
            ContainerFormat::H264AnnexB => Ok(Box::new(h264::AnnexBDemuxer::new())),
            #[allow(unreachable_patterns)]
            other => Err(PipelineError::FormatNotSupport(format!(
                "{} support is not compiled in",
                other
            ))),
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContainerFormat::MpegTs => "mpegts",
            ContainerFormat::Adts => "adts",
            ContainerFormat::H264AnnexB => "h264",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::aac::parser::samples::adts_frame;
    use crate::codec::h264::parser::samples::*;

    #[test]
    fn test_probe_ts() {
        let mut data = vec![0u8; TS_PACKET_SIZE * 4];
        for chunk in data.chunks_mut(TS_PACKET_SIZE) {
            chunk[0] = 0x47;
        }
        assert_eq!(ContainerFormat::probe(&data), Some(ContainerFormat::MpegTs));

        data[TS_PACKET_SIZE] = 0x00;
        assert_eq!(ContainerFormat::MpegTs.score(&data), 0);
        assert_eq!(ContainerFormat::MpegTs.score(&data[..TS_PACKET_SIZE]), 100);
    }

    #[test]
    fn test_probe_adts() {
        let mut data = adts_frame(&[1, 2, 3]);
        assert_eq!(ContainerFormat::Adts.score(&data), 50);
        data.extend_from_slice(&adts_frame(&[4, 5]));
        assert_eq!(ContainerFormat::probe(&data), Some(ContainerFormat::Adts));
        assert_eq!(ContainerFormat::Adts.score(&data), 90);

        let mut broken = adts_frame(&[1, 2, 3]);
        broken.extend_from_slice(&[0u8; 10]);
        assert_eq!(ContainerFormat::Adts.score(&broken), 0);
    }

    #[test]
    fn test_probe_annexb() {
        let data = annexb(&[&SPS_320X240, &PPS, &IDR_SLICE]);
        assert_eq!(ContainerFormat::probe(&data), Some(ContainerFormat::H264AnnexB));
        assert_eq!(ContainerFormat::H264AnnexB.score(&annexb(&[&P_SLICE])), 0);

        let mut leading_garbage = vec![0x12];
        leading_garbage.extend_from_slice(&data);
        assert_eq!(ContainerFormat::probe(&leading_garbage), None);
    }

    #[test]
    fn test_registry_creates_parsers() {
        for format in ContainerFormat::ALL {
            let parser = format.create_parser();
            assert_eq!(parser.is_ok(), format.is_compiled_in(), "{}", format);
        }
    }
}
