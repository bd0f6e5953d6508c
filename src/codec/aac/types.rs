#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileType {
    Main = 0,
    LC = 1,
    SSR = 2,
    LTP = 3,
}

impl From<u8> for ProfileType {
    fn from(value: u8) -> Self {
        match value {
            0 => ProfileType::Main,
            1 => ProfileType::LC,
            2 => ProfileType::SSR,
            3 => ProfileType::LTP,
            _ => ProfileType::LC,
        }
    }
}

/// Samples per AAC frame.
pub const SAMPLES_PER_FRAME: i64 = 1024;

/// Fixed and variable ADTS header fields the pipeline cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct ADTSHeader {
    pub protection_absent: bool,
    pub profile: ProfileType,
    pub sample_rate_index: u8,
    pub channel_configuration: u8,
    /// Whole frame length including the header.
    pub frame_length: u16,
    pub number_of_raw_blocks: u8,
}

impl ADTSHeader {
    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            7
        } else {
            9
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        sample_rate_for_index(self.sample_rate_index)
    }

    /// Two-byte AudioSpecificConfig used as codec extradata.
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let object_type = self.profile as u16 + 1;
        let value = (object_type << 11)
            | ((self.sample_rate_index as u16) << 7)
            | ((self.channel_configuration as u16) << 3);
        value.to_be_bytes()
    }

    /// True when `other` can belong to the same elementary stream.
    pub fn same_stream(&self, other: &ADTSHeader) -> bool {
        self.profile == other.profile
            && self.sample_rate_index == other.sample_rate_index
            && self.channel_configuration == other.channel_configuration
    }
}

pub fn sample_rate_for_index(index: u8) -> Option<u32> {
    match index {
        0 => Some(96000),
        1 => Some(88200),
        2 => Some(64000),
        3 => Some(48000),
        4 => Some(44100),
        5 => Some(32000),
        6 => Some(24000),
        7 => Some(22050),
        8 => Some(16000),
        9 => Some(12000),
        10 => Some(11025),
        11 => Some(8000),
        12 => Some(7350),
        _ => None,
    }
}
