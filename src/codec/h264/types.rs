use bytes::Bytes;

/// One NAL unit with its header fields split out.
#[derive(Debug, Clone)]
pub struct NALUnit {
    pub nal_type: u8,
    pub nal_ref_idc: u8,
    /// The unit including its one-byte header, without start code.
    pub data: Bytes,
}

impl NALUnit {
    /// Returns `None` for an empty unit.
    pub fn new(data: Bytes) -> Option<Self> {
        let header = *data.first()?;
        Some(Self {
            nal_type: header & 0x1F,
            nal_ref_idc: (header >> 5) & 0x03,
            data,
        })
    }

    pub fn unit_type(&self) -> NALUnitType {
        NALUnitType::from(self.nal_type)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[1..]
    }

    pub fn is_idr(&self) -> bool {
        self.nal_type == 5
    }

    pub fn is_slice(&self) -> bool {
        matches!(self.nal_type, 1 | 5)
    }

    /// Whether other pictures may reference this one.
    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SPSInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PPSInfo {
    pub pic_parameter_set_id: u32,
    pub seq_parameter_set_id: u32,
    pub entropy_coding_mode_flag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    SP,
    SI,
}

impl SliceType {
    pub fn from_code(code: u32) -> Self {
        match code % 5 {
            0 => SliceType::P,
            1 => SliceType::B,
            2 => SliceType::I,
            3 => SliceType::SP,
            _ => SliceType::SI,
        }
    }

    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I | SliceType::SI)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NALUnitType {
    Unspecified = 0,
    CodedSliceNonIDR = 1,
    CodedSliceDataPartitionA = 2,
    CodedSliceDataPartitionB = 3,
    CodedSliceDataPartitionC = 4,
    CodedSliceIDR = 5,
    SEI = 6,
    SPS = 7,
    PPS = 8,
    AccessUnitDelimiter = 9,
    EndOfSequence = 10,
    EndOfStream = 11,
    FillerData = 12,
}

impl From<u8> for NALUnitType {
    fn from(value: u8) -> Self {
        match value {
            1 => NALUnitType::CodedSliceNonIDR,
            2 => NALUnitType::CodedSliceDataPartitionA,
            3 => NALUnitType::CodedSliceDataPartitionB,
            4 => NALUnitType::CodedSliceDataPartitionC,
            5 => NALUnitType::CodedSliceIDR,
            6 => NALUnitType::SEI,
            7 => NALUnitType::SPS,
            8 => NALUnitType::PPS,
            9 => NALUnitType::AccessUnitDelimiter,
            10 => NALUnitType::EndOfSequence,
            11 => NALUnitType::EndOfStream,
            12 => NALUnitType::FillerData,
            _ => NALUnitType::Unspecified,
        }
    }
}
