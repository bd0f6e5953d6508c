//! H.265/HEVC helpers needed by the demuxer: NAL header decoding and random
//! access point detection.

use super::h264::find_start_code;

/// NAL unit type from the first header byte.
pub fn nal_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// BLA, IDR and CRA pictures (types 16 to 23) are random access points.
pub fn is_irap(nal_type: u8) -> bool {
    (16..=23).contains(&nal_type)
}

/// True when an Annex-B access unit contains an IRAP picture.
pub fn contains_irap(data: &[u8]) -> bool {
    let mut from = 0;
    while let Some((pos, len)) = find_start_code(data, from) {
        let header = pos + len;
        match data.get(header) {
            Some(&byte) if is_irap(nal_type(byte)) => return true,
            Some(_) => from = header,
            None => return false,
        }
    }
    false
}
