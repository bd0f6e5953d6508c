#[cfg(test)]
mod tests {
    use avpipe::av::{CodecType, MediaKind};
    use avpipe::config::PipelineConfig;
    use avpipe::format::{ContainerFormat, MemorySource, SeekFlags};
    use avpipe::stage::{
        ConnectOptions, DecodeOptions, DecodeStage, DemuxStage, FramePort, PullReply,
        PullRequest, RegisterOptions, StreamStatistics, TaskState, TrackKey,
    };
    use avpipe::{PipelineError, Result};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const AUD: [u8; 2] = [0x09, 0xF0];
    const SPS_320X240: [u8; 8] = [0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];
    const IDR_SLICE: [u8; 4] = [0x65, 0x88, 0x84, 0x00];
    const P_SLICE: [u8; 4] = [0x41, 0x9A, 0x02, 0x00];

    const ADTS_FRAME: [u8; 9] = [0xFF, 0xF1, 0x50, 0x80, 0x01, 0x3F, 0xFC, 0xAA, 0xBB];

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        out
    }

    /// An Annex-B stream of `frames` pictures with an IDR every `gop`.
    fn h264_stream(frames: usize, gop: usize) -> Vec<u8> {
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

    async fn demux_stage(data: Vec<u8>) -> Result<DemuxStage> {
        let stage = DemuxStage::new(PipelineConfig::default());
        let source = MemorySource::new(data).with_chunk_size(100).spawn();
        stage.register_task(RegisterOptions::new(1, source)).await?;
        Ok(stage)
    }

    /// Frame times in milliseconds until end of stream.
    async fn drain(frames: &FramePort) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        loop {
            match frames.call(PullRequest::Pull).await? {
                PullReply::Data(frame) => {
                    assert_eq!((frame.width, frame.height), (320, 240));
                    out.push(frame.pts_millis());
                }
                PullReply::End => return Ok(out),
                PullReply::Error(e) => return Err(e),
            }
        }
    }

    #[tokio::test]
    async fn test_annexb_to_frames() -> Result<()> {
        init_logging();
        let demux = demux_stage(h264_stream(12, 4)).await?;
        assert_eq!(demux.open_stream(1, 0).await?, ContainerFormat::H264AnnexB);
        let streams = demux.analyze_streams(1).await?;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].codec_type, CodecType::H264);

        let packets = demux
            .connect_stream_task(1, TrackKey::Track(0), ConnectOptions::default())
            .await?;
        let decode = DecodeStage::new(PipelineConfig::default());
        let frames = decode
            .register_task(1, streams[0].clone(), packets, DecodeOptions::default())
            .await?;
        demux.start_demux(1, false, 4).await?;

        let times = drain(&frames).await?;
        assert_eq!(times, (0..12).map(|i| i * 40).collect::<Vec<_>>());
        assert_eq!(demux.task_state(1).await?, TaskState::Ended);

        let selection = decode.selection(1).await?;
        assert_eq!(
            selection.target,
            Some(avpipe::codec::EngineKind::SoftwarePortable)
        );
        assert_eq!(selection.frames_decoded, 12);

        decode.shutdown().await;
        demux.shutdown().await;
        assert_eq!(demux.pool().live(), 0);
        assert_eq!(decode.pool().live(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_seek_and_reset_resume_from_keyframe() -> Result<()> {
        init_logging();
        let demux = demux_stage(h264_stream(12, 4)).await?;
        demux.open_stream(1, 0).await?;
        let streams = demux.analyze_streams(1).await?;
        let packets = demux
            .connect_stream_task(1, TrackKey::Track(0), ConnectOptions::default())
            .await?;
        let decode = DecodeStage::new(PipelineConfig::default());
        let frames = decode
            .register_task(1, streams[0].clone(), packets, DecodeOptions::default())
            .await?;
        demux.start_demux(1, false, 4).await?;
        assert_eq!(drain(&frames).await?.len(), 12);

        // keyframes sit at 0, 160 and 320 ms
        let landed = demux.seek(1, 200, SeekFlags::BACKWARD, Some(0)).await?;
        assert_eq!(landed, 160);
        decode.reset_task(1).await?;

        let times = drain(&frames).await?;
        assert_eq!(times, (4..12).map(|i| i * 40).collect::<Vec<_>>());

        decode.unregister_task(1).await?;
        demux.unregister_task(1).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_audio_track_has_no_decoder() -> Result<()> {
        init_logging();
        let statistics = Arc::new(StreamStatistics::new());
        let stage = DemuxStage::new(PipelineConfig::default());
        let source = MemorySource::new([ADTS_FRAME; 3].concat()).spawn();
        stage
            .register_task(RegisterOptions::new(1, source).with_stats(statistics.clone()))
            .await?;
        assert_eq!(stage.open_stream(1, 0).await?, ContainerFormat::Adts);
        let streams = stage.analyze_streams(1).await?;
        assert_eq!(streams[0].kind(), MediaKind::Audio);

        let packets = stage
            .connect_stream_task(1, TrackKey::Any, ConnectOptions::default())
            .await?;
        let decode = DecodeStage::new(PipelineConfig::default());
        let result = decode
            .register_task(1, streams[0].clone(), packets.clone(), DecodeOptions::default())
            .await;
        assert!(matches!(result, Err(PipelineError::CodecNotSupport(_))));

        // the packets are still there for an audio consumer
        stage.start_demux(1, false, 0).await?;
        let mut count = 0;
        while let PullReply::Data(packet) = packets.call(PullRequest::Pull).await? {
            assert_eq!(packet.data[..], [0xAA, 0xBB]);
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(statistics.snapshot().total_packets(), 3);

        stage.shutdown().await;
        Ok(())
    }
}
