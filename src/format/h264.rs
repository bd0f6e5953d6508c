//! Raw H.264 Annex-B elementary streams.
//!
//! The stream carries no timestamps, so packets are stamped in decode order
//! at a nominal 25 frames per second on the 90 kHz clock.

use crate::av::{CodecType, Packet, Rational, StreamInfo};
use crate::codec::h264::{find_start_code, H264Parser, NALUnit};
use crate::format::index::{seek_indexed, IndexEntry, Indexed, SeekFlags, SeekIndex};
use crate::format::io::IoContext;
use crate::format::{FormatParser, OpenOptions, ReadStatus};
use crate::{PipelineError, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use std::collections::VecDeque;

const FRAME_RATE: Rational = Rational::new(25, 1);
/// Ticks per frame at 25 fps on the 90 kHz clock.
const FRAME_TICKS: i64 = 3600;
const SCAN_CHUNK: usize = 4096;

/// Access unit being collected from NAL units.
#[derive(Default)]
struct AccessUnit {
    pos: u64,
    units: Vec<NALUnit>,
    has_slice: bool,
    key: bool,
}

impl AccessUnit {
    fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Whether `unit` opens the next access unit instead of extending this one.
    fn starts_next(&self, unit: &NALUnit) -> bool {
        match unit.nal_type {
            9 => !self.is_empty(),
            6 | 7 | 8 => self.has_slice,
            // first_mb_in_slice == 0 is a single '1' bit
            1 | 5 => self.has_slice && unit.payload().first().is_some_and(|b| b & 0x80 != 0),
            _ => false,
        }
    }

    fn push(&mut self, pos: u64, unit: NALUnit) {
        if self.units.is_empty() {
            self.pos = pos;
        }
        self.has_slice |= unit.is_slice();
        self.key |= unit.is_idr();
        self.units.push(unit);
    }

    fn to_annexb(&self) -> Bytes {
        let size = self.units.iter().map(|u| u.data.len() + 4).sum();
        let mut out = BytesMut::with_capacity(size);
        for unit in &self.units {
            out.put_slice(&[0, 0, 0, 1]);
            out.put_slice(&unit.data);
        }
        out.freeze()
    }
}

/// Annex-B demuxer producing one packet per access unit.
pub struct AnnexBDemuxer {
    parser: H264Parser,
    options: OpenOptions,
    current: AccessUnit,
    lookahead: Option<(u64, NALUnit)>,
    ready: VecDeque<Packet>,
    /// Decode-order number of the next access unit.
    frame: i64,
    extra_data: Option<Bytes>,
    index: SeekIndex,
    ended: bool,
}

impl Default for AnnexBDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnexBDemuxer {
    pub fn new() -> Self {
        Self {
            parser: H264Parser::new(),
            options: OpenOptions::default(),
            current: AccessUnit::default(),
            lookahead: None,
            ready: VecDeque::new(),
            frame: 0,
            extra_data: None,
            index: SeekIndex::new(),
            ended: false,
        }
    }

    /// Next NAL unit and the offset of its start code.
    async fn next_unit(&mut self, io: &mut IoContext) -> Result<Option<(u64, NALUnit)>> {
        loop {
            let code_len = loop {
                if !io.ensure(4).await? {
                    io.consume(io.available());
                    return Ok(None);
                }
                match find_start_code(io.buffered(), 0) {
                    Some((0, len)) => break len,
                    Some((at, _)) => io.consume(at),
                    None => {
                        io.consume(io.available().saturating_sub(3));
                        if !io.ensure(io.available() + SCAN_CHUNK).await? && io.available() < 4 {
                            io.consume(io.available());
                            return Ok(None);
                        }
                    }
                }
            };

            let pos = io.position();
            let mut scanned = code_len;
            let mut at_end = false;
            let data = loop {
                let buffered = io.buffered();
                let from = scanned.saturating_sub(4).max(code_len);
                if let Some((next, _)) = find_start_code(buffered, from) {
                    let data = Bytes::copy_from_slice(&buffered[code_len..next]);
                    io.consume(next);
                    break data;
                }
                if at_end {
                    let data = Bytes::copy_from_slice(&buffered[code_len.min(buffered.len())..]);
                    io.consume(io.available());
                    break data;
                }
                scanned = buffered.len();
                // the tail that arrived before the end still needs a scan
                at_end = !io.ensure(scanned + SCAN_CHUNK).await?;
            };

            // back-to-back start codes carry no unit
            if let Some(unit) = NALUnit::new(data) {
                return Ok(Some((pos, unit)));
            }
        }
    }

    /// Reads until one access unit is complete and queued. `Ok(false)` at end of stream.
    async fn read_access_unit(&mut self, io: &mut IoContext) -> Result<bool> {
        loop {
            let next = match self.lookahead.take() {
                Some(next) => Some(next),
                None => self.next_unit(io).await?,
            };
            let Some((pos, unit)) = next else {
                if self.current.is_empty() {
                    return Ok(false);
                }
                self.finish_access_unit();
                return Ok(true);
            };

            if self.current.starts_next(&unit) {
                self.lookahead = Some((pos, unit));
                self.finish_access_unit();
                return Ok(true);
            }
            if let Err(e) = self.parser.parse_nalu(&unit) {
                debug!("NAL type {} at {}: {}", unit.nal_type, pos, e);
            }
            self.current.push(pos, unit);
        }
    }

    fn finish_access_unit(&mut self) {
        let au = std::mem::take(&mut self.current);
        let pts = self.frame * FRAME_TICKS;
        self.frame += 1;

        let mut packet = Packet::new(au.to_annexb())
            .with_pts(pts)
            .with_dts(pts)
            .with_duration(FRAME_TICKS)
            .with_key_flag(au.key)
            .with_time_base(Rational::MPEG);
        packet.pos = Some(au.pos);

        if let Some(extra_data) = self.parser.extra_data() {
            if self.extra_data.as_ref() != Some(&extra_data) {
                self.extra_data = Some(extra_data.clone());
                packet.set_new_extra_data(extra_data);
            }
        }

        trace!("access unit {} at {}, {} bytes", self.frame - 1, au.pos, packet.size());
        self.index.add(IndexEntry {
            pos: au.pos,
            pts,
            time_ms: Rational::MPEG.to_millis(pts),
            track: 0,
            key: au.key,
        });
        self.ready.push_back(packet);
    }
}

#[async_trait]
impl FormatParser for AnnexBDemuxer {
    fn name(&self) -> &'static str {
        "h264"
    }

    async fn open(&mut self, io: &mut IoContext, options: &OpenOptions) -> Result<()> {
        self.options = *options;
        if !io.ensure(4).await? || find_start_code(io.buffered(), 0).is_none() {
            return Err(PipelineError::DataInvalid("no Annex-B start code".into()));
        }
        Ok(())
    }

    async fn analyze_streams(&mut self, io: &mut IoContext) -> Result<Vec<StreamInfo>> {
        if !self.options.fast_open {
            let limit = self.options.max_analyze_duration_ms as i64;
            while self.extra_data.is_none() && Rational::MPEG.to_millis(self.frame * FRAME_TICKS) < limit {
                if !self.read_access_unit(io).await? {
                    break;
                }
            }
        }

        let mut info = StreamInfo::new(0, CodecType::H264, Rational::MPEG)
            .with_frame_rate(FRAME_RATE)
            .with_start_time(0);
        if let Some((width, height)) = self.parser.dimensions() {
            info = info.with_dimensions(width, height);
        }
        if let Some(extra_data) = &self.extra_data {
            info = info.with_extra_data(extra_data.clone());
        }
        Ok(vec![info])
    }

    async fn read_packet(&mut self, io: &mut IoContext, packet: &mut Packet) -> Result<ReadStatus> {
        loop {
            if let Some(next) = self.ready.pop_front() {
                *packet = next;
                return Ok(ReadStatus::Packet);
            }
            if self.ended {
                return Ok(ReadStatus::End);
            }
            if !self.read_access_unit(io).await? {
                self.ended = true;
            }
        }
    }

    async fn seek(
        &mut self,
        io: &mut IoContext,
        track: Option<usize>,
        time_ms: i64,
        flags: SeekFlags,
    ) -> Result<i64> {
        seek_indexed(self, io, track, time_ms, flags).await
    }
}

impl Indexed for AnnexBDemuxer {
    fn index(&self) -> &SeekIndex {
        &self.index
    }

    fn index_mut(&mut self) -> &mut SeekIndex {
        &mut self.index
    }

    fn reset_to(&mut self, entry: &IndexEntry) {
        self.current = AccessUnit::default();
        self.lookahead = None;
        self.ready.clear();
        self.frame = entry.pts / FRAME_TICKS;
        self.ended = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::parser::samples::*;
    use crate::format::io::MemorySource;
    use pretty_assertions::assert_eq;

    const AUD: [u8; 2] = [0x09, 0xF0];

    fn gop(frames: usize, gop: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..frames {
            if i % gop == 0 {
                data.extend(annexb(&[&AUD, &SPS_320X240, &PPS, &IDR_SLICE]));
            } else {
                data.extend(annexb(&[&AUD, &P_SLICE]));
            }
        }
        data
    }

    async fn open(data: Vec<u8>, chunk: usize) -> (AnnexBDemuxer, IoContext, StreamInfo) {
        let mut io = IoContext::new(MemorySource::new(data).with_chunk_size(chunk).spawn(), 64).unwrap();
        io.open().await.unwrap();
        let mut demuxer = AnnexBDemuxer::new();
        demuxer.open(&mut io, &OpenOptions::default()).await.unwrap();
        let mut streams = demuxer.analyze_streams(&mut io).await.unwrap();
        (demuxer, io, streams.remove(0))
    }

    async fn read_all(demuxer: &mut AnnexBDemuxer, io: &mut IoContext) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut packet = Packet::default();
        while demuxer.read_packet(io, &mut packet).await.unwrap() == ReadStatus::Packet {
            packets.push(std::mem::take(&mut packet));
        }
        packets
    }

    #[tokio::test]
    async fn test_analyze() {
        let (_, _, info) = open(gop(3, 3), 7).await;
        assert_eq!(info.codec_type, CodecType::H264);
        assert_eq!((info.width, info.height), (Some(320), Some(240)));
        assert_eq!(info.fps(), Some(25.0));
        assert_eq!(info.extra_data.unwrap()[..], annexb(&[&SPS_320X240, &PPS])[..]);
    }

    #[tokio::test]
    async fn test_splits_access_units() {
        let (mut demuxer, mut io, _) = open(gop(5, 3), 5).await;
        let packets = read_all(&mut demuxer, &mut io).await;

        let summary: Vec<_> = packets.iter().map(|p| (p.pts, p.is_key)).collect();
        assert_eq!(
            summary,
            vec![
                (Some(0), true),
                (Some(3600), false),
                (Some(7200), false),
                (Some(10800), true),
                (Some(14400), false),
            ]
        );
        assert_eq!(packets[1].data[..], annexb(&[&AUD, &P_SLICE])[..]);
        assert!(packets[0].new_extra_data().is_some());
        assert!(packets[3].new_extra_data().is_none());
    }

    #[tokio::test]
    async fn test_splits_without_delimiters() {
        let data = annexb(&[&SPS_320X240, &PPS, &IDR_SLICE, &P_SLICE, &B_SLICE, &P_SLICE]);
        let (mut demuxer, mut io, _) = open(data, 1024).await;
        let packets = read_all(&mut demuxer, &mut io).await;
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0].data[..], annexb(&[&SPS_320X240, &PPS, &IDR_SLICE])[..]);
        assert_eq!(packets[2].data[..], annexb(&[&B_SLICE])[..]);
    }

    #[tokio::test]
    async fn test_seek_restores_frame_numbering() {
        let (mut demuxer, mut io, _) = open(gop(12, 4), 64).await;
        // 40 ms per frame, keyframes at 0, 160 and 320 ms
        let landed = demuxer
            .seek(&mut io, Some(0), 300, SeekFlags::BACKWARD)
            .await
            .unwrap();
        assert_eq!(landed, 160);

        let mut packet = Packet::default();
        demuxer.read_packet(&mut io, &mut packet).await.unwrap();
        assert_eq!(packet.pts, Some(4 * 3600));
        assert!(packet.is_key);
        demuxer.read_packet(&mut io, &mut packet).await.unwrap();
        assert_eq!(packet.pts, Some(5 * 3600));
    }

    #[tokio::test]
    async fn test_short_stream_keeps_every_access_unit() {
        for chunk in [1, 5, 1024] {
            let (mut demuxer, mut io, info) = open(gop(5, 4), chunk).await;
            assert!(info.extra_data.is_some(), "chunk {}", chunk);
            let packets = read_all(&mut demuxer, &mut io).await;
            assert_eq!(packets.len(), 5, "chunk {}", chunk);
            assert_eq!(packets[0].data[..], annexb(&[&AUD, &SPS_320X240, &PPS, &IDR_SLICE])[..]);
            assert_eq!(packets[4].data[..], annexb(&[&AUD, &P_SLICE])[..]);
            assert_eq!(packets[4].pts, Some(4 * 3600));
        }
    }

    #[tokio::test]
    async fn test_rejects_non_annexb() {
        let mut io = IoContext::new(MemorySource::new(vec![0x12; 32]).spawn(), 64).unwrap();
        let mut demuxer = AnnexBDemuxer::new();
        let err = demuxer.open(&mut io, &OpenOptions::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::DataInvalid(_)));
    }
}
