//! Raw ADTS (AAC) streams.

use crate::av::{CodecType, Packet, Rational, StreamInfo};
use crate::codec::aac::{find_adts_sync, parse_adts_header, ADTSHeader, ADTS_HEADER_LEN, SAMPLES_PER_FRAME};
use crate::format::index::{seek_indexed, IndexEntry, Indexed, SeekFlags, SeekIndex};
use crate::format::io::IoContext;
use crate::format::{FormatParser, OpenOptions, ReadStatus};
use crate::{PipelineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;

/// ADTS demuxer: one audio track, timestamps counted in samples.
pub struct AACDemuxer {
    first: Option<ADTSHeader>,
    time_base: Rational,
    /// Timestamp of the next frame, in samples.
    next_pts: i64,
    index: SeekIndex,
}

impl Default for AACDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl AACDemuxer {
    pub fn new() -> Self {
        Self {
            first: None,
            time_base: Rational::new(1, 44100),
            next_pts: 0,
            index: SeekIndex::new(),
        }
    }

    /// Skips to the next byte that can start an ADTS frame. `Ok(false)` at end of stream.
    async fn resync(&mut self, io: &mut IoContext) -> Result<bool> {
        loop {
            if let Some(at) = find_adts_sync(io.buffered(), 1) {
                debug!("ADTS resync, skipping {} bytes at {}", at, io.position());
                io.consume(at);
                return Ok(true);
            }
            let keep = 1.min(io.available());
            io.consume(io.available() - keep);
            if !io.ensure(ADTS_HEADER_LEN).await? {
                return Ok(false);
            }
        }
    }
}

#[async_trait]
impl FormatParser for AACDemuxer {
    fn name(&self) -> &'static str {
        "adts"
    }

    async fn open(&mut self, io: &mut IoContext, _options: &OpenOptions) -> Result<()> {
        if !io.ensure(ADTS_HEADER_LEN).await? {
            return Err(PipelineError::DataInvalid("stream too short for ADTS".into()));
        }
        let header = parse_adts_header(io.peek(ADTS_HEADER_LEN)).map_err(|e| e.into_data_invalid())?;
        if let Some(rate) = header.sample_rate() {
            self.time_base = Rational::new(1, rate as i32);
        }
        self.first = Some(header);
        Ok(())
    }

    async fn analyze_streams(&mut self, _io: &mut IoContext) -> Result<Vec<StreamInfo>> {
        let header = self
            .first
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidOperate("ADTS stream not opened".into()))?;

        let mut info = StreamInfo::new(0, CodecType::AAC, self.time_base)
            .with_extra_data(Bytes::copy_from_slice(&header.audio_specific_config()))
            .with_start_time(0);
        info.sample_rate = header.sample_rate();
        info.channels = Some(header.channel_configuration);
        Ok(vec![info])
    }

    async fn read_packet(&mut self, io: &mut IoContext, packet: &mut Packet) -> Result<ReadStatus> {
        loop {
            if !io.ensure(ADTS_HEADER_LEN).await? {
                return Ok(ReadStatus::End);
            }
            let header = match parse_adts_header(io.peek(ADTS_HEADER_LEN)) {
                Ok(header) => header,
                Err(e) => {
                    debug!("{} at {}", e, io.position());
                    if !self.resync(io).await? {
                        return Ok(ReadStatus::End);
                    }
                    continue;
                }
            };

            let pos = io.position();
            let Some(frame) = io.read_bytes(header.frame_length as usize).await? else {
                debug!("truncated ADTS frame at {}", pos);
                io.consume(io.available());
                return Ok(ReadStatus::End);
            };

            let duration = SAMPLES_PER_FRAME * (header.number_of_raw_blocks as i64 + 1);
            let pts = self.next_pts;
            self.next_pts += duration;

            *packet = Packet::new(frame.slice(header.header_len()..))
                .with_pts(pts)
                .with_dts(pts)
                .with_duration(duration)
                .with_key_flag(true)
                .with_time_base(self.time_base);
            packet.pos = Some(pos);

            self.index.add(IndexEntry {
                pos,
                pts,
                time_ms: self.time_base.to_millis(pts),
                track: 0,
                key: true,
            });
            return Ok(ReadStatus::Packet);
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

impl Indexed for AACDemuxer {
    fn index(&self) -> &SeekIndex {
        &self.index
    }

    fn index_mut(&mut self) -> &mut SeekIndex {
        &mut self.index
    }

    fn reset_to(&mut self, entry: &IndexEntry) {
        self.next_pts = entry.pts;
    }
}
