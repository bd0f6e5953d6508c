use super::{DecoderEngine, EngineContext, EngineKind, SkipPolicy};
use crate::av::{CodecType, Packet, StreamInfo, VideoFrame};
use crate::codec::h264::{split_nal_units, H264Parser, NALUnit};
use crate::{PipelineError, Result};
use async_trait::async_trait;
use log::trace;

/// The bundled portable H.264 engine.
///
/// Validates Annex-B structure, keeps track of the active parameter sets and
/// turns every picture into one frame whose single plane carries the access
/// unit. Pictures are emitted as soon as they are decoded.
pub struct H264Engine {
    ctx: EngineContext,
    parser: H264Parser,
    skip: SkipPolicy,
    opened: bool,
    threads: usize,
}

impl H264Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            parser: H264Parser::new(),
            skip: SkipPolicy::None,
            opened: false,
            threads: 1,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn should_skip(&mut self, slice: &NALUnit) -> Result<bool> {
        Ok(match self.skip {
            SkipPolicy::None => false,
            SkipPolicy::NonRef => !slice.is_reference(),
            SkipPolicy::NonIntra => !self.parser.slice_type(slice)?.is_intra(),
            SkipPolicy::KeyOnly => !slice.is_idr(),
        })
    }
}

#[async_trait]
impl DecoderEngine for H264Engine {
    fn kind(&self) -> EngineKind {
        EngineKind::SoftwarePortable
    }

    fn is_supported(&self, params: &StreamInfo) -> bool {
        params.codec_type == CodecType::H264
    }

    async fn open(&mut self, params: &StreamInfo, threads: usize) -> Result<()> {
        if !self.is_supported(params) {
            return Err(PipelineError::CodecNotSupport(format!(
                "{:?} is not H.264",
                params.codec_type
            )));
        }

        self.parser = H264Parser::new();
        if let Some(extra_data) = &params.extra_data {
            self.parser
                .parse_annexb(extra_data)
                .map_err(|e| PipelineError::CodecNotSupport(format!("bad extradata: {}", e)))?;
        }
        self.threads = threads.max(1);
        self.opened = true;
        Ok(())
    }

    async fn decode(&mut self, packet: &Packet) -> Result<()> {
        if !self.opened {
            return Err(PipelineError::InvalidOperate("H.264 engine not opened".into()));
        }

        if let Some(extra_data) = packet.new_extra_data() {
            self.parser
                .parse_annexb(extra_data)
                .map_err(PipelineError::into_data_invalid)?;
        }

        let units = split_nal_units(&packet.data);
        if units.is_empty() {
            return Err(PipelineError::DataInvalid(
                "packet holds no Annex-B NAL units".into(),
            ));
        }

        let mut first_slice = None;
        let mut idr = false;
        for unit in &units {
            self.parser
                .parse_nalu(unit)
                .map_err(PipelineError::into_data_invalid)?;
            if unit.is_slice() {
                idr |= unit.is_idr();
                first_slice.get_or_insert(unit);
            }
        }

        let Some(slice) = first_slice else {
            trace!("packet without slices, parameter sets only");
            return Ok(());
        };
        let Some((width, height)) = self.parser.dimensions() else {
            return Err(PipelineError::DataInvalid("slice before any SPS".into()));
        };
        if self
            .should_skip(slice)
            .map_err(PipelineError::into_data_invalid)?
        {
            trace!("skipping picture at {:?}", packet.pts);
            return Ok(());
        }

        self.ctx.emit_frame(VideoFrame {
            data: vec![packet.data.clone()],
            width,
            height,
            pts: packet.timestamp().unwrap_or(0),
            duration: packet.duration,
            time_base: packet.time_base,
            key_frame: idr,
            native: None,
        })
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {
        self.opened = false;
    }

    fn set_skip_policy(&mut self, policy: SkipPolicy) {
        self.skip = policy;
    }
}
