//! LSB-first bit streams over byte I/O.
//!
//! Bit `i` of a stream lands in byte `i / 8` at bit position `i % 8`. Pad
//! bits after the last declared bit are written as zero and never
//! interpreted on read.

use std::io::{self, Read, Write};

use crate::error::{TypeError, TypeResult};
use crate::number_size::NumberSize;

/// Bits needed to tell apart `universe` distinct values.
pub fn bits_for_universe(universe: usize) -> u32 {
    if universe <= 1 {
        0
    } else {
        usize::BITS - (universe - 1).leading_zeros()
    }
}

/// Bytes needed to hold `bits` bits.
pub fn bytes_for_bits(bits: u64) -> u64 {
    bits.div_ceil(8)
}

/// Accumulates bits and writes each byte to `inner` as soon as it fills.
pub struct BitWriter<W: Write> {
    inner: W,
    current: u8,
    filled: u32,
    written: u64,
}

impl<W: Write> BitWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            current: 0,
            filled: 0,
            written: 0,
        }
    }

    pub fn write_bit(&mut self, bit: bool) -> TypeResult<()> {
        if bit {
            self.current |= 1 << self.filled;
        }
        self.filled += 1;
        self.written += 1;
        if self.filled == 8 {
            self.inner.write_all(&[self.current])?;
            self.current = 0;
            self.filled = 0;
        }
        Ok(())
    }

    pub fn write_bits(&mut self, bits: &[bool]) -> TypeResult<()> {
        bits.iter().try_for_each(|&b| self.write_bit(b))
    }

    /// Write the low `bits` bits of `value`, least significant first.
    pub fn write_value(&mut self, value: u64, bits: u32) -> TypeResult<()> {
        debug_assert!(bits <= 64);
        for i in 0..bits {
            self.write_bit((value >> i) & 1 == 1)?;
        }
        Ok(())
    }

    /// Write an ordinal out of a universe of `universe` values.
    pub fn write_enum(&mut self, ordinal: u64, universe: usize) -> TypeResult<()> {
        if ordinal >= universe as u64 {
            return Err(TypeError::InvalidEnumOrdinal { ordinal, universe });
        }
        self.write_value(ordinal, bits_for_universe(universe))
    }

    pub fn write_number_size(&mut self, size: NumberSize) -> TypeResult<()> {
        self.write_value(size.ordinal() as u64, NumberSize::FLAG_BITS)
    }

    /// Bits written so far, not counting padding.
    pub fn bits_written(&self) -> u64 {
        self.written
    }

    /// Flush the partial last byte (zero padded) and return the bit count.
    pub fn finish(mut self) -> TypeResult<u64> {
        if self.filled > 0 {
            self.inner.write_all(&[self.current])?;
        }
        Ok(self.written)
    }
}

/// Reads bits back in the order [`BitWriter`] wrote them.
///
/// When the total bit count is known up front ([`BitReader::with_bit_count`])
/// exactly `ceil(n / 8)` bytes are pulled from the source and reading past
/// `n` bits fails. Otherwise bytes are pulled one at a time on demand.
pub struct BitReader<R: Read> {
    inner: R,
    current: u8,
    available: u32,
    read: u64,
    limit: Option<u64>,
    prefetched: Option<(Vec<u8>, usize)>,
}

impl<R: Read> BitReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            current: 0,
            available: 0,
            read: 0,
            limit: None,
            prefetched: None,
        }
    }

    pub fn with_bit_count(mut inner: R, bits: u64) -> TypeResult<Self> {
        let mut buf = vec![0u8; bytes_for_bits(bits) as usize];
        inner.read_exact(&mut buf)?;
        Ok(Self {
            inner,
            current: 0,
            available: 0,
            read: 0,
            limit: Some(bits),
            prefetched: Some((buf, 0)),
        })
    }

    fn next_byte(&mut self) -> TypeResult<u8> {
        match &mut self.prefetched {
            Some((buf, pos)) => {
                let byte = *buf.get(*pos).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "bit buffer exhausted")
                })?;
                *pos += 1;
                Ok(byte)
            }
            None => {
                let mut byte = [0u8; 1];
                self.inner.read_exact(&mut byte)?;
                Ok(byte[0])
            }
        }
    }

    pub fn read_bit(&mut self) -> TypeResult<bool> {
        if let Some(limit) = self.limit {
            if self.read >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read past declared bit count {limit}"),
                )
                .into());
            }
        }
        if self.available == 0 {
            self.current = self.next_byte()?;
            self.available = 8;
        }
        let bit = (self.current >> (8 - self.available)) & 1 == 1;
        self.available -= 1;
        self.read += 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, count: usize) -> TypeResult<Vec<bool>> {
        (0..count).map(|_| self.read_bit()).collect()
    }

    pub fn read_value(&mut self, bits: u32) -> TypeResult<u64> {
        debug_assert!(bits <= 64);
        let mut value = 0u64;
        for i in 0..bits {
            if self.read_bit()? {
                value |= 1 << i;
            }
        }
        Ok(value)
    }

    pub fn read_enum(&mut self, universe: usize) -> TypeResult<u64> {
        let ordinal = self.read_value(bits_for_universe(universe))?;
        if ordinal >= universe as u64 {
            return Err(TypeError::InvalidEnumOrdinal { ordinal, universe });
        }
        Ok(ordinal)
    }

    pub fn read_number_size(&mut self) -> TypeResult<NumberSize> {
        let ordinal = self.read_value(NumberSize::FLAG_BITS)?;
        NumberSize::from_ordinal(ordinal as u8)
    }

    pub fn bits_read(&self) -> u64 {
        self.read
    }

    /// Drop any unread pad bits and return the number of bits consumed.
    pub fn finish(self) -> u64 {
        self.read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn universe_bits() {
        assert_eq!(bits_for_universe(0), 0);
        assert_eq!(bits_for_universe(1), 0);
        assert_eq!(bits_for_universe(2), 1);
        assert_eq!(bits_for_universe(3), 2);
        assert_eq!(bits_for_universe(4), 2);
        assert_eq!(bits_for_universe(5), 3);
        assert_eq!(bits_for_universe(32), 5);
        assert_eq!(bits_for_universe(33), 6);
    }

    #[test]
    fn lsb_first_packing() {
        let mut out = Vec::new();
        let mut w = BitWriter::new(&mut out);
        w.write_bits(&[true, false, false, false, false, false, false, false, true])
            .unwrap();
        assert_eq!(w.finish().unwrap(), 9);
        assert_eq!(out, vec![0b0000_0001, 0b0000_0001]);
    }

    #[test]
    fn pad_bits_are_zero() {
        let mut out = Vec::new();
        let mut w = BitWriter::new(&mut out);
        w.write_value(0b111, 3).unwrap();
        w.finish().unwrap();
        assert_eq!(out, vec![0b0000_0111]);
    }

    #[test]
    fn empty_stream_writes_nothing() {
        let mut out = Vec::new();
        let w = BitWriter::new(&mut out);
        assert_eq!(w.finish().unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn enum_and_number_size_flags() {
        let mut out = Vec::new();
        let mut w = BitWriter::new(&mut out);
        w.write_enum(4, 5).unwrap();
        w.write_number_size(NumberSize::SmallLong).unwrap();
        assert_eq!(w.bits_written(), 6);
        w.finish().unwrap();

        let mut r = BitReader::with_bit_count(&out[..], 6).unwrap();
        assert_eq!(r.read_enum(5).unwrap(), 4);
        assert_eq!(r.read_number_size().unwrap(), NumberSize::SmallLong);
        assert_eq!(r.finish(), 6);
    }

    #[test]
    fn enum_ordinal_outside_universe_fails() {
        let mut out = Vec::new();
        let mut w = BitWriter::new(&mut out);
        let err = w.write_enum(5, 5).unwrap_err();
        assert!(matches!(err, TypeError::InvalidEnumOrdinal { ordinal: 5, .. }));
    }

    #[test]
    fn bounded_reader_consumes_exact_bytes() {
        let data = [0xFFu8, 0x01, 0xAA, 0xBB];
        let mut src = &data[..];
        let mut r = BitReader::with_bit_count(&mut src, 9).unwrap();
        assert_eq!(r.read_value(9).unwrap(), 0x1FF);
        assert!(r.read_bit().is_err());
        drop(r);
        assert_eq!(src, &[0xAA, 0xBB]);
    }

    #[test]
    fn unbounded_reader_consumes_started_bytes() {
        let data = [0b0000_0101u8, 0xEE];
        let mut src = &data[..];
        let mut r = BitReader::new(&mut src);
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.finish(), 2);
        assert_eq!(src, &[0xEE]);
    }

    proptest! {
        #[test]
        fn bool_stream_roundtrip(bits in proptest::collection::vec(any::<bool>(), 0..4096)) {
            let mut out = Vec::new();
            let mut w = BitWriter::new(&mut out);
            w.write_bits(&bits).unwrap();
            prop_assert_eq!(w.finish().unwrap(), bits.len() as u64);
            prop_assert_eq!(out.len() as u64, bytes_for_bits(bits.len() as u64));

            let mut r = BitReader::with_bit_count(&out[..], bits.len() as u64).unwrap();
            let back = r.read_bits(bits.len()).unwrap();
            prop_assert_eq!(back, bits);
        }

        #[test]
        fn value_roundtrip(value in any::<u64>(), width in 0u32..=64) {
            let masked = if width == 64 { value } else { value & ((1u64 << width) - 1) };
            let mut out = Vec::new();
            let mut w = BitWriter::new(&mut out);
            w.write_value(masked, width).unwrap();
            w.finish().unwrap();
            let mut r = BitReader::with_bit_count(&out[..], width as u64).unwrap();
            prop_assert_eq!(r.read_value(width).unwrap(), masked);
        }
    }
}
