use super::types::{ADTSHeader, ProfileType};
use crate::utils::BitReader;
use crate::{PipelineError, Result};

/// Smallest ADTS header (no CRC).
pub const ADTS_HEADER_LEN: usize = 7;

/// Parses the ADTS header at the start of `data`.
pub fn parse_adts_header(data: &[u8]) -> Result<ADTSHeader> {
    if data.len() < ADTS_HEADER_LEN {
        return Err(PipelineError::Parser("ADTS header too short".into()));
    }

    let mut reader = BitReader::new(data);

    if reader.read_bits(12)? != 0xFFF {
        return Err(PipelineError::Parser("invalid ADTS sync word".into()));
    }

    reader.skip_bits(1)?; // id
    if reader.read_bits(2)? != 0 {
        return Err(PipelineError::Parser("ADTS layer must be 0".into()));
    }
    let protection_absent = reader.read_bit()?;
    let profile = ProfileType::from(reader.read_bits(2)? as u8);
    let sample_rate_index = reader.read_bits(4)? as u8;
    reader.skip_bits(1)?; // private_bit
    let channel_configuration = reader.read_bits(3)? as u8;
    reader.skip_bits(4)?; // original_copy, home, copyright id bit + start
    let frame_length = reader.read_bits(13)? as u16;
    reader.skip_bits(11)?; // buffer_fullness
    let number_of_raw_blocks = reader.read_bits(2)? as u8;

    let header = ADTSHeader {
        protection_absent,
        profile,
        sample_rate_index,
        channel_configuration,
        frame_length,
        number_of_raw_blocks,
    };

    if header.sample_rate().is_none() {
        return Err(PipelineError::Parser(format!(
            "reserved ADTS sample rate index {}",
            sample_rate_index
        )));
    }
    if (frame_length as usize) < header.header_len() {
        return Err(PipelineError::Parser(format!(
            "ADTS frame length {} shorter than its header",
            frame_length
        )));
    }

    Ok(header)
}

/// Offset of the first plausible ADTS sync word at or after `from`.
pub fn find_adts_sync(data: &[u8], from: usize) -> Option<usize> {
    (from..data.len().saturating_sub(1))
        .find(|&i| data[i] == 0xFF && data[i + 1] & 0xF6 == 0xF0)
}
