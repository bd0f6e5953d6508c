// PIDs
pub const PID_PAT: u16 = 0x0000;
pub const PID_NULL: u16 = 0x1FFF;

// Table IDs
pub const TABLE_ID_PAT: u8 = 0x00;
pub const TABLE_ID_PMT: u8 = 0x02;

// Elementary Stream Types
pub const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
pub const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
pub const STREAM_TYPE_PRIVATE_PES: u8 = 0x06;
pub const STREAM_TYPE_AAC: u8 = 0x0f;
pub const STREAM_TYPE_H264: u8 = 0x1b;
pub const STREAM_TYPE_H265: u8 = 0x24;

// Descriptor tags
pub const DESCRIPTOR_DVB_SUBTITLING: u8 = 0x59;

// Constants
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_HEADER_SIZE: usize = 4;
pub const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
pub const PTS_HZ: i32 = 90_000;

#[derive(Debug, Clone, PartialEq)]
pub struct PATEntry {
    pub program_number: u16,
    pub program_map_pid: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PAT {
    pub entries: Vec<PATEntry>,
}

impl PAT {
    /// PMT PID of the first real program (program 0 points at the NIT).
    pub fn first_program_pid(&self) -> Option<u16> {
        self.entries
            .iter()
            .find(|e| e.program_number != 0)
            .map(|e| e.program_map_pid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub tag: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementaryStreamInfo {
    pub stream_type: u8,
    pub elementary_pid: u16,
    pub descriptors: Vec<Descriptor>,
}

impl ElementaryStreamInfo {
    pub fn has_descriptor(&self, tag: u8) -> bool {
        self.descriptors.iter().any(|d| d.tag == tag)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PMT {
    pub pcr_pid: u16,
    pub program_descriptors: Vec<Descriptor>,
    pub elementary_stream_infos: Vec<ElementaryStreamInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptationField {
    pub length: usize,
    pub discontinuity: bool,
    pub random_access: bool,
    pub pcr: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TSHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_exists: bool,
    pub contains_payload: bool,
    pub continuity_counter: u8,
}

/// Fields of a PES header the demuxer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PESHeader {
    pub stream_id: u8,
    /// PES_packet_length; 0 means unbounded (video).
    pub packet_length: usize,
    /// Bytes before the elementary stream payload.
    pub header_length: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
}

impl PESHeader {
    /// Total PES size when the header bounds it.
    pub fn total_length(&self) -> Option<usize> {
        (self.packet_length > 0).then_some(self.packet_length + 6)
    }
}
