//! MSB-first bit packing for consent strings.

use crate::base::error::AuditError;

#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the low `width` bits of `value`, most significant first.
    pub fn write(&mut self, value: u64, width: u8) {
        debug_assert!(width <= 64);
        for shift in (0..width).rev() {
            self.push_bit((value >> shift) & 1 == 1);
        }
    }

    pub fn write_bool(&mut self, bit: bool) {
        self.push_bit(bit);
    }

    fn push_bit(&mut self, bit: bool) {
        if self.bit_len % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Bytes written so far; the final byte is zero-padded.
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read(&mut self, width: u8) -> Result<u64, AuditError> {
        if self.pos + usize::from(width) > self.bytes.len() * 8 {
            return Err(AuditError::Decoding(format!(
                "need {width} bits at offset {}, have {}",
                self.pos,
                self.bytes.len() * 8
            )));
        }
        let mut value = 0u64;
        for _ in 0..width {
            let byte = self.bytes[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | u64::from(bit);
            self.pos += 1;
        }
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool, AuditError> {
        Ok(self.read(1)? == 1)
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}
