use super::types::*;
use crate::error::{PipelineError, Result};
use crate::utils::Crc32Mpeg2;

/// A PSI section with its CRC checked.
#[derive(Debug, PartialEq)]
pub struct Section<'a> {
    pub table_id: u8,
    pub table_id_extension: u16,
    /// Table content between the section header and the CRC.
    pub body: &'a [u8],
}

/// Stateless parsing of TS packets, PSI tables and PES headers.
pub struct TSPacketParser {
    crc: Crc32Mpeg2,
}

impl Default for TSPacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TSPacketParser {
    pub fn new() -> Self {
        Self {
            crc: Crc32Mpeg2::new(),
        }
    }

    pub fn parse_header(&self, data: &[u8]) -> Result<TSHeader> {
        if data.len() < TS_HEADER_SIZE {
            return Err(PipelineError::Parser("TS packet too short".into()));
        }

        if data[0] != 0x47 {
            return Err(PipelineError::Parser("invalid sync byte".into()));
        }

        Ok(TSHeader {
            transport_error: (data[1] & 0x80) != 0,
            payload_unit_start: (data[1] & 0x40) != 0,
            pid: (((data[1] & 0x1F) as u16) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_exists: (data[3] & 0x20) != 0,
            contains_payload: (data[3] & 0x10) != 0,
            continuity_counter: data[3] & 0x0F,
        })
    }

    /// Adaptation field at `offset`, if the header announces one.
    pub fn parse_adaptation_field(
        &self,
        header: &TSHeader,
        data: &[u8],
        offset: usize,
    ) -> Result<Option<AdaptationField>> {
        if !header.adaptation_field_exists {
            return Ok(None);
        }

        let Some(&length) = data.get(offset) else {
            return Err(PipelineError::Parser("adaptation field missing".into()));
        };
        let length = length as usize;
        if data.len() < offset + length + 1 {
            return Err(PipelineError::Parser("adaptation field too short".into()));
        }
        if length == 0 {
            return Ok(Some(AdaptationField::default()));
        }

        let flags = data[offset + 1];
        let mut field = AdaptationField {
            length,
            discontinuity: (flags & 0x80) != 0,
            random_access: (flags & 0x40) != 0,
            pcr: None,
        };

        if (flags & 0x10) != 0 && length >= 7 {
            let pos = offset + 2;
            let pcr_base = ((data[pos] as u64) << 25)
                | ((data[pos + 1] as u64) << 17)
                | ((data[pos + 2] as u64) << 9)
                | ((data[pos + 3] as u64) << 1)
                | ((data[pos + 4] & 0x80) as u64 >> 7);
            let pcr_ext = (((data[pos + 4] & 0x01) as u64) << 8) | (data[pos + 5] as u64);
            field.pcr = Some(pcr_base * 300 + pcr_ext);
        }

        Ok(Some(field))
    }

    /// Parses the section starting a PSI payload (pointer field first) and
    /// validates its CRC.
    pub fn parse_section<'a>(&self, payload: &'a [u8]) -> Result<Section<'a>> {
        let pointer = *payload
            .first()
            .ok_or_else(|| PipelineError::Parser("empty PSI payload".into()))?
            as usize;
        let section = payload
            .get(1 + pointer..)
            .ok_or_else(|| PipelineError::Parser("PSI pointer past payload".into()))?;
        if section.len() < 3 {
            return Err(PipelineError::Parser("PSI section too short".into()));
        }

        let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
        let total = 3 + section_length;
        if section_length < 9 || section.len() < total {
            return Err(PipelineError::Parser(format!(
                "PSI section length {} exceeds payload",
                section_length
            )));
        }
        if !self.crc.verify(&section[..total]) {
            return Err(PipelineError::Parser("PSI section CRC mismatch".into()));
        }

        Ok(Section {
            table_id: section[0],
            table_id_extension: ((section[3] as u16) << 8) | section[4] as u16,
            body: &section[8..total - 4],
        })
    }

    pub fn parse_pat(&self, body: &[u8]) -> Result<PAT> {
        let entries = body
            .chunks_exact(4)
            .map(|entry| PATEntry {
                program_number: ((entry[0] as u16) << 8) | entry[1] as u16,
                program_map_pid: (((entry[2] & 0x1F) as u16) << 8) | entry[3] as u16,
            })
            .collect();
        Ok(PAT { entries })
    }

    pub fn parse_pmt(&self, data: &[u8]) -> Result<PMT> {
        let mut pmt = PMT::default();
        let end = data.len();
        let mut pos = 0;

        if pos + 4 > end {
            return Err(PipelineError::Parser("PMT too short".into()));
        }

        pmt.pcr_pid = ((data[pos] as u16 & 0x1F) << 8) | data[pos + 1] as u16;
        let program_info_length = ((data[pos + 2] as usize & 0x0F) << 8) | data[pos + 3] as usize;
        pos += 4;

        if pos + program_info_length > end {
            return Err(PipelineError::Parser("program info data too short".into()));
        }
        pmt.program_descriptors = self.parse_descriptors(&data[pos..pos + program_info_length])?;
        pos += program_info_length;

        while pos + 5 <= end {
            let stream_type = data[pos];
            let elementary_pid = ((data[pos + 1] as u16 & 0x1F) << 8) | data[pos + 2] as u16;
            let es_info_length = ((data[pos + 3] as usize & 0x0F) << 8) | data[pos + 4] as usize;
            pos += 5;

            if pos + es_info_length > end {
                return Err(PipelineError::Parser("ES info data too short".into()));
            }

            let descriptors = self.parse_descriptors(&data[pos..pos + es_info_length])?;
            pos += es_info_length;

            pmt.elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type,
                elementary_pid,
                descriptors,
            });
        }

        Ok(pmt)
    }

    fn parse_descriptors(&self, data: &[u8]) -> Result<Vec<Descriptor>> {
        let mut descriptors = Vec::new();
        let mut pos = 0;

        while pos + 2 <= data.len() {
            let tag = data[pos];
            let length = data[pos + 1] as usize;
            pos += 2;

            if pos + length > data.len() {
                return Err(PipelineError::Parser("descriptor data too short".into()));
            }

            descriptors.push(Descriptor {
                tag,
                data: data[pos..pos + length].to_vec(),
            });
            pos += length;
        }

        Ok(descriptors)
    }

    /// PES header at the start of `data`; `Ok(None)` while more bytes are needed.
    pub fn parse_pes_header(&self, data: &[u8]) -> Result<Option<PESHeader>> {
        if data.len() < 6 {
            return Ok(None);
        }
        if data[..3] != PES_START_CODE {
            return Err(PipelineError::Parser("missing PES start code".into()));
        }

        let stream_id = data[3];
        let packet_length = ((data[4] as usize) << 8) | data[5] as usize;

        // padding, private_stream_2, ECM, EMM, DSMCC, H.222.1 type E, directory
        if matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xF2 | 0xF8 | 0xFF) {
            return Ok(Some(PESHeader {
                stream_id,
                packet_length,
                header_length: 6,
                pts: None,
                dts: None,
            }));
        }

        if data.len() < 9 {
            return Ok(None);
        }
        let header_length = 9 + data[8] as usize;
        if data.len() < header_length {
            return Ok(None);
        }

        let flags = data[7] >> 6;
        let pts = match flags {
            0b10 | 0b11 if header_length >= 14 => Some(parse_timestamp(&data[9..14])),
            _ => None,
        };
        let dts = match flags {
            0b11 if header_length >= 19 => Some(parse_timestamp(&data[14..19])),
            _ => None,
        };

        Ok(Some(PESHeader {
            stream_id,
            packet_length,
            header_length,
            pts,
            dts,
        }))
    }
}

/// 33-bit PTS/DTS from its 5-byte marker-bit layout.
pub fn parse_timestamp(data: &[u8]) -> i64 {
    (((data[0] as i64 >> 1) & 0x07) << 30)
        | ((data[1] as i64) << 22)
        | (((data[2] as i64) >> 1) << 15)
        | ((data[3] as i64) << 7)
        | ((data[4] as i64) >> 1)
}

#[cfg(test)]
mod tests {
    use super::super::tests::builder::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ts_header() {
        let parser = TSPacketParser::new();
        let header = parser.parse_header(&[0x47, 0x41, 0x00, 0x3A]).unwrap();
        assert!(header.payload_unit_start);
        assert_eq!(header.pid, 0x100);
        assert!(header.adaptation_field_exists);
        assert!(header.contains_payload);
        assert_eq!(header.continuity_counter, 0x0A);

        assert!(parser.parse_header(&[0x46, 0, 0, 0]).is_err());
        assert!(parser.parse_header(&[0x47]).is_err());
    }

    #[test]
    fn test_adaptation_field() {
        let parser = TSPacketParser::new();
        let packet = ts_packet(0x100, true, 0, true, &[0u8; 100]);
        let header = parser.parse_header(&packet).unwrap();
        let field = parser
            .parse_adaptation_field(&header, &packet, TS_HEADER_SIZE)
            .unwrap()
            .unwrap();
        assert!(field.random_access);
        assert_eq!(TS_HEADER_SIZE + 1 + field.length + 100, TS_PACKET_SIZE);
    }

    #[test]
    fn test_parse_pat_section() {
        let parser = TSPacketParser::new();
        let packet = pat_packet(0x1000);
        let section = parser.parse_section(&packet[TS_HEADER_SIZE..]).unwrap();
        assert_eq!(section.table_id, TABLE_ID_PAT);

        let pat = parser.parse_pat(section.body).unwrap();
        assert_eq!(pat.first_program_pid(), Some(0x1000));

        let mut corrupt = packet.clone();
        corrupt[TS_HEADER_SIZE + 10] ^= 0xFF;
        assert!(parser.parse_section(&corrupt[TS_HEADER_SIZE..]).is_err());
    }

    #[test]
    fn test_parse_pmt_section() {
        let parser = TSPacketParser::new();
        let packet = pmt_packet(
            0x1000,
            &[
                (STREAM_TYPE_H264, 0x100, vec![]),
                (STREAM_TYPE_PRIVATE_PES, 0x102, vec![DESCRIPTOR_DVB_SUBTITLING, 0]),
            ],
        );
        let section = parser.parse_section(&packet[TS_HEADER_SIZE..]).unwrap();
        assert_eq!(section.table_id, TABLE_ID_PMT);

        let pmt = parser.parse_pmt(section.body).unwrap();
        assert_eq!(pmt.pcr_pid, 0x100);
        assert_eq!(pmt.elementary_stream_infos.len(), 2);
        assert_eq!(pmt.elementary_stream_infos[0].elementary_pid, 0x100);
        assert!(pmt.elementary_stream_infos[1].has_descriptor(DESCRIPTOR_DVB_SUBTITLING));
    }

    #[test]
    fn test_parse_pes_header() {
        let parser = TSPacketParser::new();
        let data = pes(0xE0, Some(0x1_2345_6789), Some(900), &[9, 9], true);
        let header = parser.parse_pes_header(&data).unwrap().unwrap();
        assert_eq!(header.pts, Some(0x1_2345_6789));
        assert_eq!(header.dts, Some(900));
        assert_eq!(header.header_length, 19);
        assert_eq!(header.total_length(), Some(data.len()));

        assert_eq!(parser.parse_pes_header(&data[..8]).unwrap(), None);
        assert!(parser.parse_pes_header(&[1, 2, 3, 4, 5, 6]).is_err());

        let unbounded = pes(0xE0, Some(0), None, &[1], false);
        let header = parser.parse_pes_header(&unbounded).unwrap().unwrap();
        assert_eq!(header.total_length(), None);
        assert_eq!(header.header_length, 14);
    }
}
