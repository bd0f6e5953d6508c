use bytes::{BufMut, Bytes, BytesMut};

use super::types::{NALUnit, NALUnitType, PPSInfo, SPSInfo, SliceType};
use crate::utils::BitReader;
use crate::{PipelineError, Result};

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Finds the next Annex-B start code at or after `from`.
/// Returns its position and length (3 or 4 bytes).
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                if i > from && data[i - 1] == 0 {
                    return Some((i - 1, 4));
                }
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 3 < data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Splits an Annex-B buffer into NAL units without copying.
pub fn split_nal_units(data: &Bytes) -> Vec<NALUnit> {
    let mut units = Vec::new();
    let Some((mut pos, mut len)) = find_start_code(data, 0) else {
        return units;
    };

    loop {
        let start = pos + len;
        let next = find_start_code(data, start);
        let end = next.map(|(p, _)| p).unwrap_or(data.len());
        if let Some(unit) = NALUnit::new(data.slice(start..end)) {
            units.push(unit);
        }
        match next {
            Some((p, l)) => {
                pos = p;
                len = l;
            }
            None => break,
        }
    }
    units
}

/// True when the access unit carries an IDR slice.
pub fn contains_idr(data: &Bytes) -> bool {
    split_nal_units(data).iter().any(NALUnit::is_idr)
}

/// Stateful H.264 header parser: remembers the active SPS/PPS.
#[derive(Debug, Default)]
pub struct H264Parser {
    sps: Option<SPSInfo>,
    pps: Option<PPSInfo>,
    sps_raw: Option<Bytes>,
    pps_raw: Option<Bytes>,
    buffer: BytesMut,
}

impl H264Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one NAL unit (header byte first, no start code), updating the
    /// parameter sets when it is an SPS or PPS.
    pub fn parse_nalu(&mut self, nalu: &NALUnit) -> Result<()> {
        match nalu.unit_type() {
            NALUnitType::SPS => {
                let rbsp = self.remove_emulation_prevention(nalu.payload());
                self.sps = Some(parse_sps(&rbsp)?);
                self.sps_raw = Some(nalu.data.clone());
            }
            NALUnitType::PPS => {
                let rbsp = self.remove_emulation_prevention(nalu.payload());
                self.pps = Some(parse_pps(&rbsp)?);
                self.pps_raw = Some(nalu.data.clone());
            }
            _ => {}
        }
        Ok(())
    }

    /// Parses every parameter set found in an Annex-B buffer (extradata or access unit).
    pub fn parse_annexb(&mut self, data: &Bytes) -> Result<Vec<NALUnit>> {
        let units = split_nal_units(data);
        for unit in &units {
            self.parse_nalu(unit)?;
        }
        Ok(units)
    }

    pub fn remove_emulation_prevention(&mut self, data: &[u8]) -> Vec<u8> {
        self.buffer.clear();
        let mut i = 0;

        while i < data.len() {
            if i + 2 < data.len() && data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x03
            {
                self.buffer.put_u8(0x00);
                self.buffer.put_u8(0x00);
                i += 3;
                continue;
            }
            self.buffer.put_u8(data[i]);
            i += 1;
        }

        self.buffer.to_vec()
    }

    /// Slice type of a coded slice unit.
    pub fn slice_type(&mut self, nalu: &NALUnit) -> Result<SliceType> {
        if !nalu.is_slice() {
            return Err(PipelineError::Codec(format!(
                "NAL type {} is not a coded slice",
                nalu.nal_type
            )));
        }
        let head = nalu.payload().get(..8.min(nalu.payload().len())).unwrap_or(&[]);
        let rbsp = self.remove_emulation_prevention(head);
        let mut reader = BitReader::new(&rbsp);
        reader.read_golomb()?; // first_mb_in_slice
        Ok(SliceType::from_code(reader.read_golomb()?))
    }

    pub fn sps(&self) -> Option<&SPSInfo> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&PPSInfo> {
        self.pps.as_ref()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.sps.as_ref().map(|sps| (sps.width, sps.height))
    }

    /// SPS and PPS as Annex-B extradata, once both were seen.
    pub fn extra_data(&self) -> Option<Bytes> {
        let (sps, pps) = (self.sps_raw.as_ref()?, self.pps_raw.as_ref()?);
        let mut out = BytesMut::with_capacity(sps.len() + pps.len() + 8);
        out.put_slice(&START_CODE);
        out.put_slice(sps);
        out.put_slice(&START_CODE);
        out.put_slice(pps);
        Some(out.freeze())
    }
}

fn parse_sps(data: &[u8]) -> Result<SPSInfo> {
    let mut reader = BitReader::new(data);

    let profile_idc = reader.read_bits(8)? as u8;
    reader.skip_bits(8)?; // constraint_set flags + reserved_zero_2bits
    let level_idc = reader.read_bits(8)? as u8;
    reader.read_golomb()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = reader.read_golomb()?;
        if chroma_format_idc == 3 {
            reader.skip_bits(1)?; // separate_colour_plane_flag
        }
        reader.read_golomb()?; // bit_depth_luma_minus8
        reader.read_golomb()?; // bit_depth_chroma_minus8
        reader.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag

        if reader.read_bit()? {
            let count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                if reader.read_bit()? {
                    skip_scaling_list(&mut reader, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    reader.read_golomb()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = reader.read_golomb()?;
    if pic_order_cnt_type == 0 {
        reader.read_golomb()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        reader.skip_bits(1)?; // delta_pic_order_always_zero_flag
        reader.read_signed_golomb()?; // offset_for_non_ref_pic
        reader.read_signed_golomb()?; // offset_for_top_to_bottom_field
        let cycle = reader.read_golomb()?;
        for _ in 0..cycle {
            reader.read_signed_golomb()?;
        }
    }

    reader.read_golomb()?; // max_num_ref_frames
    reader.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = reader.read_golomb()? + 1;
    let pic_height_in_map_units = reader.read_golomb()? + 1;
    let frame_mbs_only_flag = reader.read_bits(1)?;
    if frame_mbs_only_flag == 0 {
        reader.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }
    reader.skip_bits(1)?; // direct_8x8_inference_flag

    let mut width = pic_width_in_mbs * 16;
    let mut height = (2 - frame_mbs_only_flag) * pic_height_in_map_units * 16;

    if reader.read_bit()? {
        let (crop_x, crop_y) = match chroma_format_idc {
            0 | 3 => (1, 2 - frame_mbs_only_flag),
            2 => (2, 2 - frame_mbs_only_flag),
            _ => (2, 2 * (2 - frame_mbs_only_flag)),
        };
        let left = reader.read_golomb()?;
        let right = reader.read_golomb()?;
        let top = reader.read_golomb()?;
        let bottom = reader.read_golomb()?;
        width = width.saturating_sub((left + right) * crop_x);
        height = height.saturating_sub((top + bottom) * crop_y);
    }

    Ok(SPSInfo {
        profile_idc,
        level_idc,
        width,
        height,
    })
}

fn parse_pps(data: &[u8]) -> Result<PPSInfo> {
    let mut reader = BitReader::new(data);

    let pic_parameter_set_id = reader.read_golomb()?;
    let seq_parameter_set_id = reader.read_golomb()?;
    let entropy_coding_mode_flag = reader.read_bit()?;

    Ok(PPSInfo {
        pic_parameter_set_id,
        seq_parameter_set_id,
        entropy_coding_mode_flag,
    })
}

fn skip_scaling_list(reader: &mut BitReader, size: usize) -> Result<()> {
    let mut last_scale = 8;
    let mut next_scale = 8;

    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = reader.read_signed_golomb()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        last_scale = if next_scale == 0 { last_scale } else { next_scale };
    }

    Ok(())
}
