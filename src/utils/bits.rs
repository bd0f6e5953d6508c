use crate::error::{PipelineError, Result};

/// A big-endian bit reader for codec headers (SPS, slice headers, ADTS).
///
/// Supports fixed-width fields and the exp-Golomb codes used by H.264/H.265:
///
/// ```
/// use avpipe::utils::BitReader;
///
/// let data = [0b1011_1000];
/// let mut reader = BitReader::new(&data);
///
/// assert_eq!(reader.read_bit().unwrap(), true);
/// assert_eq!(reader.read_bits(3).unwrap(), 0b011);
/// assert_eq!(reader.read_golomb().unwrap(), 0); // "1" -> 0
/// ```
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_offset: usize,
    bit_offset: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            byte_offset: 0,
            bit_offset: 0,
        }
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        let Some(&byte) = self.data.get(self.byte_offset) else {
            return Err(PipelineError::Codec("bit reader ran past end of data".into()));
        };

        let bit = (byte >> (7 - self.bit_offset)) & 1;
        self.bit_offset += 1;
        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }

        Ok(bit == 1)
    }

    /// Reads `n` (at most 32) bits as a big-endian number.
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        if n > 32 {
            return Err(PipelineError::Codec(format!("cannot read {} bits at once", n)));
        }
        if (n as usize) > self.available_bits() {
            return Err(PipelineError::Codec("bit reader ran past end of data".into()));
        }

        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value as u32)
    }

    /// Unsigned exp-Golomb code, ue(v): M zeros, a one, then M info bits;
    /// value = 2^M + info - 1.
    pub fn read_golomb(&mut self) -> Result<u32> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(PipelineError::Codec("invalid exp-Golomb code".into()));
            }
        }

        if leading_zeros == 0 {
            return Ok(0);
        }

        let info = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) + info as u64 - 1) as u32)
    }

    /// Signed exp-Golomb code, se(v): odd codes map to positive values.
    pub fn read_signed_golomb(&mut self) -> Result<i32> {
        let k = self.read_golomb()?;
        let magnitude = ((k as i64 + 1) >> 1) as i32;
        Ok(if k & 1 == 1 { magnitude } else { -magnitude })
    }

    pub fn skip_bits(&mut self, n: u32) -> Result<()> {
        if (n as usize) > self.available_bits() {
            return Err(PipelineError::Codec("bit reader ran past end of data".into()));
        }
        let total = self.bit_offset as usize + n as usize;
        self.byte_offset += total / 8;
        self.bit_offset = (total % 8) as u8;
        Ok(())
    }

    /// Skips to the next byte boundary.
    pub fn align_byte(&mut self) {
        if self.bit_offset != 0 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }
    }

    pub fn available_bits(&self) -> usize {
        (self.data.len().saturating_sub(self.byte_offset)) * 8 - self.bit_offset as usize
    }

    pub fn bits_read(&self) -> usize {
        self.byte_offset * 8 + self.bit_offset as usize
    }
}
