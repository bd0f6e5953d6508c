/// CRC32 for MPEG-2 TS PSI sections (ITU-T H.222.0 / ISO/IEC 13818-1).
/// Polynomial 0x04C11DB7, initial value 0xFFFFFFFF, no final xor.
const CRC32_MPEG2: u32 = 0x04C11DB7;

/// MPEG-2 CRC32 calculator used to validate PAT/PMT sections.
pub struct Crc32Mpeg2 {
    table: [u32; 256],
}

impl Crc32Mpeg2 {
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = (i as u32) << 24;
            for _ in 0..8 {
                crc = if (crc & 0x80000000) != 0 {
                    (crc << 1) ^ CRC32_MPEG2
                } else {
                    crc << 1
                };
            }
            *entry = crc;
        }
        Self { table }
    }

    /// CRC of `data`.
    pub fn calculate(&self, data: &[u8]) -> u32 {
        data.iter().fold(0xFFFFFFFF, |crc, &byte| {
            let index = ((crc >> 24) ^ (byte as u32)) & 0xFF;
            (crc << 8) ^ self.table[index as usize]
        })
    }

    /// Checks a section that ends with its own big-endian CRC field.
    ///
    /// Running the CRC over the section including the trailing field yields
    /// zero when the section is intact.
    pub fn verify(&self, section_with_crc: &[u8]) -> bool {
        section_with_crc.len() >= 4 && self.calculate(section_with_crc) == 0
    }
}

impl Default for Crc32Mpeg2 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        let crc = Crc32Mpeg2::new();
        assert_eq!(crc.calculate(&[0x01, 0x01]), 0xD66FB816);
    }

    #[test]
    fn test_verify_section() {
        let crc = Crc32Mpeg2::new();
        let mut section = vec![
            0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xE1, 0x00,
        ];
        let value = crc.calculate(&section);
        section.extend_from_slice(&value.to_be_bytes());
        assert!(crc.verify(&section));

        section[3] ^= 0x01;
        assert!(!crc.verify(&section));
        assert!(!crc.verify(&[0x00]));
    }
}
