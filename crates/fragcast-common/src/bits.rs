//! Bit-granularity reader for bitstream syntax (SPS parsing and friends).

use tracing::warn;

/// Reader that consumes a byte slice bit by bit, most significant bit
/// first.
///
/// Like [`ByteReader`](crate::ByteReader), it clamps rather than fails:
/// reading past the end simply stops accumulating bits, so a truncated
/// bitstream yields short values instead of a panic.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
    bit: u8,
}

impl<'a> BitReader<'a> {
    /// Create a cursor at the first bit of the slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            bit: 0,
        }
    }

    /// Bits remaining.
    pub fn available(&self) -> usize {
        (self.data.len() - self.position) * 8 - usize::from(self.bit)
    }

    /// Skip up to `count` bits; returns how many were actually skipped.
    pub fn next(&mut self, count: usize) -> usize {
        let mut gotten = 0;
        while self.position != self.data.len() && gotten < count {
            gotten += 1;
            self.bit += 1;
            if self.bit == 8 {
                self.bit = 0;
                self.position += 1;
            }
        }
        gotten
    }

    /// Read a single bit (false at the end).
    pub fn read_bit(&mut self) -> bool {
        self.read_bits(1) != 0
    }

    /// Read up to `count` bits into a u32; stops accumulating at the end
    /// of the data.
    pub fn read_bits(&mut self, count: usize) -> u32 {
        let mut result = 0u32;
        let mut count = count;
        while self.position != self.data.len() && count > 0 {
            count -= 1;
            result <<= 1;
            if self.data[self.position] & (0x80 >> self.bit) != 0 {
                result |= 1;
            }
            self.bit += 1;
            if self.bit == 8 {
                self.bit = 0;
                self.position += 1;
            }
        }
        result
    }

    /// Decode an unsigned Exp-Golomb value.
    ///
    /// The leading-zero count is bounded to 15; a longer code is treated
    /// as corrupt syntax and decodes to 0 with a warning.
    pub fn read_exp_golomb(&mut self) -> u32 {
        let mut zeros = 0usize;
        while self.available() > 0 && !self.read_bit() {
            zeros += 1;
        }
        let result = self.read_bits(zeros);
        if zeros > 15 {
            warn!("Exponential-Golomb code exceeding unsigned 16 bits");
            return 0;
        }
        result + (1 << zeros) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_msb_first() {
        let mut reader = BitReader::new(&[0b1010_0000, 0xFF]);
        assert!(reader.read_bit());
        assert!(!reader.read_bit());
        assert!(reader.read_bit());
        assert_eq!(reader.read_bits(5), 0);
        assert_eq!(reader.read_bits(8), 0xFF);
        assert_eq!(reader.available(), 0);
    }

    #[test]
    fn clamps_at_end() {
        let mut reader = BitReader::new(&[0b1100_0000]);
        assert_eq!(reader.read_bits(16), 0b1100_0000);
        assert_eq!(reader.read_bits(4), 0);
    }

    #[test]
    fn exp_golomb_small_codes() {
        // "1" => 0, "010" => 1, "011" => 2, "00100" => 3
        let mut reader = BitReader::new(&[0b1_010_011_0, 0b0100_0000]);
        assert_eq!(reader.read_exp_golomb(), 0);
        assert_eq!(reader.read_exp_golomb(), 1);
        assert_eq!(reader.read_exp_golomb(), 2);
        assert_eq!(reader.read_exp_golomb(), 3);
    }

    #[test]
    fn exp_golomb_bounded() {
        // 17 leading zeros: rejected as corrupt
        let mut reader = BitReader::new(&[0x00, 0x00, 0b0100_0000, 0xFF]);
        assert_eq!(reader.read_exp_golomb(), 0);
    }
}
