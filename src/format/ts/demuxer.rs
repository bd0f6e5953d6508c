use super::parser::TSPacketParser;
use super::types::*;
use crate::av::{CodecType, MediaKind, Packet, Rational, StreamInfo};
use crate::codec::aac::parse_adts_header;
use crate::codec::h264::H264Parser;
use crate::codec::h265;
use crate::error::{PipelineError, Result};
use crate::format::index::{seek_indexed, IndexEntry, Indexed, SeekFlags, SeekIndex};
use crate::format::io::IoContext;
use crate::format::{FormatParser, OpenOptions, ReadStatus};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};

/// MPEG Transport Stream demuxer.
///
/// Follows the first program of the PAT. Elementary streams are numbered in
/// PMT order, skipping stream types it cannot map to a codec. PES packets are
/// reassembled per PID and handed out with their headers stripped, timestamps
/// on the 90 kHz clock.
pub struct TSDemuxer {
    parser: TSPacketParser,
    options: OpenOptions,
    pmt_pid: Option<u16>,
    tracks: HashMap<u16, TrackState>,
    streams: Vec<StreamInfo>,
    ready: VecDeque<Packet>,
    index: SeekIndex,
    /// First and latest timestamps seen, used to bound stream analysis.
    span: Option<(i64, i64)>,
    ended: bool,
}

/// Per-PID demux state.
struct TrackState {
    index: usize,
    pes: Option<PesAssembly>,
    h264: Option<H264Parser>,
    /// Last extradata handed out for this track.
    extra_data: Option<Bytes>,
}

/// A PES packet being collected from TS payloads.
struct PesAssembly {
    data: BytesMut,
    random_access: bool,
    /// Offset of the TS packet that started this PES.
    pos: u64,
    /// Total PES size, once the header is in and bounds it.
    expected: Option<usize>,
}

impl PesAssembly {
    fn new(pos: u64, random_access: bool) -> Self {
        Self {
            data: BytesMut::with_capacity(TS_PACKET_SIZE * 4),
            random_access,
            pos,
            expected: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.expected.is_some_and(|n| self.data.len() >= n)
    }
}

fn codec_for(info: &ElementaryStreamInfo) -> Option<CodecType> {
    match info.stream_type {
        STREAM_TYPE_H264 => Some(CodecType::H264),
        STREAM_TYPE_H265 => Some(CodecType::H265),
        STREAM_TYPE_AAC => Some(CodecType::AAC),
        STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO => Some(CodecType::MP3),
        STREAM_TYPE_PRIVATE_PES if info.has_descriptor(DESCRIPTOR_DVB_SUBTITLING) => {
            Some(CodecType::DvbSubtitle)
        }
        _ => None,
    }
}

impl Default for TSDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TSDemuxer {
    pub fn new() -> Self {
        Self {
            parser: TSPacketParser::new(),
            options: OpenOptions::default(),
            pmt_pid: None,
            tracks: HashMap::new(),
            streams: Vec::new(),
            ready: VecDeque::new(),
            index: SeekIndex::new(),
            span: None,
            ended: false,
        }
    }

    /// Streams found so far.
    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    /// Consumes one TS packet. `Ok(false)` at end of stream.
    async fn read_ts_packet(&mut self, io: &mut IoContext) -> Result<bool> {
        if !io.ensure(TS_PACKET_SIZE).await? {
            if io.available() > 0 {
                debug!("dropping {} trailing bytes", io.available());
                io.consume(io.available());
            }
            return Ok(false);
        }

        let buffered = io.peek(TS_PACKET_SIZE);
        if buffered[0] != 0x47 {
            let skip = buffered[1..]
                .iter()
                .position(|&b| b == 0x47)
                .map_or(TS_PACKET_SIZE, |i| i + 1);
            debug!("lost sync at {}, skipping {} bytes", io.position(), skip);
            io.consume(skip);
            return Ok(true);
        }

        let pos = io.position();
        let data = buffered.to_vec();
        io.consume(TS_PACKET_SIZE);
        self.handle_ts_packet(&data, pos)?;
        Ok(true)
    }

    fn handle_ts_packet(&mut self, data: &[u8], pos: u64) -> Result<()> {
        let header = self.parser.parse_header(data)?;
        if header.transport_error || header.pid == PID_NULL {
            return Ok(());
        }

        let adaptation = match self
            .parser
            .parse_adaptation_field(&header, data, TS_HEADER_SIZE)
        {
            Ok(field) => field,
            Err(e) => {
                warn!("pid {}: {}", header.pid, e);
                return Ok(());
            }
        };
        let offset = TS_HEADER_SIZE + adaptation.as_ref().map_or(0, |f| f.length + 1);
        if !header.contains_payload || offset >= data.len() {
            return Ok(());
        }
        let payload = &data[offset..];
        let random_access = adaptation.is_some_and(|f| f.random_access);

        match header.pid {
            PID_PAT if header.payload_unit_start => self.handle_pat(payload),
            pid if Some(pid) == self.pmt_pid => {
                if header.payload_unit_start {
                    self.handle_pmt(payload);
                }
            }
            pid if self.tracks.contains_key(&pid) => {
                self.handle_pes_payload(pid, header.payload_unit_start, random_access, payload, pos)
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_pat(&mut self, payload: &[u8]) {
        let pat = match self.parser.parse_section(payload) {
            Ok(section) if section.table_id == TABLE_ID_PAT => self.parser.parse_pat(section.body),
            Ok(_) => return,
            Err(e) => {
                warn!("PAT: {}", e);
                return;
            }
        };
        if let Ok(pmt_pid) = pat.map(|pat| pat.first_program_pid()) {
            if pmt_pid.is_some() && self.pmt_pid != pmt_pid {
                debug!("program map on pid {:?}", pmt_pid);
                self.pmt_pid = pmt_pid;
            }
        }
    }

    fn handle_pmt(&mut self, payload: &[u8]) {
        if !self.streams.is_empty() {
            return;
        }
        let pmt = match self.parser.parse_section(payload) {
            Ok(section) if section.table_id == TABLE_ID_PMT => self.parser.parse_pmt(section.body),
            Ok(_) => return,
            Err(e) => Err(e),
        };
        let pmt = match pmt {
            Ok(pmt) => pmt,
            Err(e) => {
                warn!("PMT: {}", e);
                return;
            }
        };

        for es in &pmt.elementary_stream_infos {
            let Some(codec_type) = codec_for(es) else {
                debug!(
                    "skipping pid {} with stream type {:#04x}",
                    es.elementary_pid, es.stream_type
                );
                continue;
            };
            let index = self.streams.len();
            self.streams
                .push(StreamInfo::new(index, codec_type, Rational::new(1, PTS_HZ)));
            self.tracks.insert(
                es.elementary_pid,
                TrackState {
                    index,
                    pes: None,
                    h264: (codec_type == CodecType::H264).then(H264Parser::new),
                    extra_data: None,
                },
            );
            debug!("track {}: {:?} on pid {}", index, codec_type, es.elementary_pid);
        }
    }

    fn handle_pes_payload(
        &mut self,
        pid: u16,
        unit_start: bool,
        random_access: bool,
        payload: &[u8],
        pos: u64,
    ) {
        let Some(track) = self.tracks.get_mut(&pid) else {
            return;
        };

        let finished = if unit_start {
            track.pes.replace(PesAssembly::new(pos, random_access))
        } else {
            None
        };
        if let Some(done) = finished {
            self.finish_pes(pid, done);
        }

        let Some(track) = self.tracks.get_mut(&pid) else {
            return;
        };
        // Payload of a PES whose start we never saw.
        let Some(assembly) = track.pes.as_mut() else {
            return;
        };
        assembly.data.extend_from_slice(payload);
        assembly.random_access |= random_access;

        if assembly.expected.is_none() {
            match self.parser.parse_pes_header(&assembly.data) {
                Ok(Some(header)) => assembly.expected = header.total_length(),
                Ok(None) => {}
                Err(e) => {
                    warn!("pid {}: {}", pid, e);
                    track.pes = None;
                    return;
                }
            }
        }

        if assembly.is_complete() {
            if let Some(done) = track.pes.take() {
                self.finish_pes(pid, done);
            }
        }
    }

    /// Turns a collected PES into a packet on the ready queue.
    fn finish_pes(&mut self, pid: u16, assembly: PesAssembly) {
        let header = match self.parser.parse_pes_header(&assembly.data) {
            Ok(Some(header)) => header,
            Ok(None) => {
                trace!("pid {}: truncated PES header", pid);
                return;
            }
            Err(e) => {
                warn!("pid {}: {}", pid, e);
                return;
            }
        };
        let end = header
            .total_length()
            .map_or(assembly.data.len(), |n| n.min(assembly.data.len()));
        if header.header_length >= end {
            return;
        }
        let data = assembly.data.freeze().slice(header.header_length..end);

        let Some(track) = self.tracks.get_mut(&pid) else {
            return;
        };
        let info = &mut self.streams[track.index];
        let mut packet = Packet::new(data.clone())
            .with_stream_index(track.index)
            .with_time_base(info.time_base);
        packet.pts = header.pts;
        packet.dts = header.dts.or(header.pts);
        packet.pos = Some(assembly.pos);

        packet.is_key = match info.codec_type {
            CodecType::H264 => {
                let mut idr = false;
                if let Some(parser) = track.h264.as_mut() {
                    match parser.parse_annexb(&data) {
                        Ok(units) => idr = units.iter().any(|u| u.is_idr()),
                        Err(e) => debug!("track {}: {}", track.index, e),
                    }
                    if let Some(extra_data) = parser.extra_data() {
                        if track.extra_data.as_ref() != Some(&extra_data) {
                            if let Some((width, height)) = parser.dimensions() {
                                info.width = Some(width);
                                info.height = Some(height);
                            }
                            info.extra_data = Some(extra_data.clone());
                            track.extra_data = Some(extra_data.clone());
                            packet.set_new_extra_data(extra_data);
                        }
                    }
                }
                assembly.random_access || idr
            }
            CodecType::H265 => assembly.random_access || h265::contains_irap(&data),
            _ if info.kind() == MediaKind::Video => assembly.random_access,
            _ => true,
        };

        if info.codec_type == CodecType::AAC && info.sample_rate.is_none() {
            if let Ok(adts) = parse_adts_header(&data) {
                info.sample_rate = adts.sample_rate();
                info.channels = Some(adts.channel_configuration);
                info.extra_data = Some(Bytes::copy_from_slice(&adts.audio_specific_config()));
            }
        }

        if let Some(ts) = packet.timestamp() {
            if info.start_time.map_or(true, |start| ts < start) {
                info.start_time = Some(ts);
            }
            self.span = Some(match self.span {
                Some((first, last)) => (first.min(ts), last.max(ts)),
                None => (ts, ts),
            });
            self.index.add(IndexEntry {
                pos: assembly.pos,
                pts: ts,
                time_ms: info.time_base.to_millis(ts),
                track: track.index,
                key: packet.is_key,
            });
        }

        self.ready.push_back(packet);
    }

    /// Emits the PES packets still being collected.
    fn flush_assemblies(&mut self) {
        let mut pending: Vec<(u16, PesAssembly)> = self
            .tracks
            .iter_mut()
            .filter_map(|(pid, track)| track.pes.take().map(|pes| (*pid, pes)))
            .collect();
        pending.sort_by_key(|(_, pes)| pes.pos);
        for (pid, pes) in pending {
            self.finish_pes(pid, pes);
        }
    }

    /// Whether analysis has everything the headers alone don't give.
    fn analysis_complete(&self) -> bool {
        self.streams.iter().all(|info| {
            let parameters = match info.codec_type {
                CodecType::H264 => info.extra_data.is_some(),
                CodecType::AAC => info.sample_rate.is_some(),
                _ => true,
            };
            parameters && info.start_time.is_some()
        })
    }

    fn analyzed_ms(&self) -> u64 {
        self.span
            .map_or(0, |(first, last)| Rational::MPEG.to_millis(last - first).max(0) as u64)
    }
}

#[async_trait]
impl FormatParser for TSDemuxer {
    fn name(&self) -> &'static str {
        "mpegts"
    }

    async fn open(&mut self, io: &mut IoContext, options: &OpenOptions) -> Result<()> {
        self.options = *options;
        if !io.ensure(TS_PACKET_SIZE).await? || io.peek(1)[0] != 0x47 {
            return Err(PipelineError::DataInvalid(
                "stream does not start with a TS packet".into(),
            ));
        }
        Ok(())
    }

    async fn analyze_streams(&mut self, io: &mut IoContext) -> Result<Vec<StreamInfo>> {
        while self.streams.is_empty() {
            if !self.read_ts_packet(io).await? {
                return Err(PipelineError::DataInvalid("no program map found".into()));
            }
        }

        if !self.options.fast_open {
            while !self.analysis_complete()
                && self.analyzed_ms() < self.options.max_analyze_duration_ms
            {
                if !self.read_ts_packet(io).await? {
                    break;
                }
            }
        }

        debug!(
            "analyzed {} tracks, {} packets buffered",
            self.streams.len(),
            self.ready.len()
        );
        Ok(self.streams.clone())
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
            if !self.read_ts_packet(io).await? {
                self.flush_assemblies();
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

impl Indexed for TSDemuxer {
    fn index(&self) -> &SeekIndex {
        &self.index
    }

    fn index_mut(&mut self) -> &mut SeekIndex {
        &mut self.index
    }

    fn reset_to(&mut self, _entry: &IndexEntry) {
        self.ready.clear();
        for track in self.tracks.values_mut() {
            track.pes = None;
        }
        self.ended = false;
    }
}
