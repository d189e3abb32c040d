use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

/// Ladder of fixed integer encoding widths.
///
/// A value is stored at the narrowest width that can hold it; the chosen
/// width is itself recorded as a 3-bit flag ([`NumberSize::FLAG_BITS`]) so a
/// reader knows how many bytes follow. All multi-byte values are
/// little-endian. Signed values use two's complement truncated to the width.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NumberSize {
    #[default]
    Void,
    Byte,
    Short,
    SmallInt,
    Int,
    BigInt,
    SmallLong,
    Long,
}

impl NumberSize {
    /// Bits needed to store a width selector.
    pub const FLAG_BITS: u32 = 3;

    /// Every width, narrowest first.
    pub const ALL: [NumberSize; 8] = [
        NumberSize::Void,
        NumberSize::Byte,
        NumberSize::Short,
        NumberSize::SmallInt,
        NumberSize::Int,
        NumberSize::BigInt,
        NumberSize::SmallLong,
        NumberSize::Long,
    ];

    /// Encoded width in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Void => 0,
            Self::Byte => 1,
            Self::Short => 2,
            Self::SmallInt => 3,
            Self::Int => 4,
            Self::BigInt => 5,
            Self::SmallLong => 6,
            Self::Long => 8,
        }
    }

    /// Encoded width in bits.
    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// Position of this width in the ladder; this is what flags store.
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> TypeResult<Self> {
        Self::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or(TypeError::InvalidNumberSize(ordinal))
    }

    /// Largest unsigned value representable at this width.
    pub const fn max_unsigned(self) -> u64 {
        match self.bytes() {
            0 => 0,
            8 => u64::MAX,
            b => (1u64 << (b * 8)) - 1,
        }
    }

    /// Largest signed value representable at this width.
    pub const fn max_signed(self) -> i64 {
        match self.bytes() {
            0 => 0,
            8 => i64::MAX,
            b => (1i64 << (b * 8 - 1)) - 1,
        }
    }

    /// Smallest signed value representable at this width.
    pub const fn min_signed(self) -> i64 {
        match self.bytes() {
            0 => 0,
            8 => i64::MIN,
            b => -(1i64 << (b * 8 - 1)),
        }
    }

    /// Narrowest width whose unsigned range covers `value`.
    pub fn by_size(value: u64) -> Self {
        Self::ALL
            .into_iter()
            .find(|size| value <= size.max_unsigned())
            .unwrap_or(Self::Long)
    }

    /// Narrowest width whose signed range covers `value`.
    pub fn by_size_signed(value: i64) -> Self {
        Self::ALL
            .into_iter()
            .find(|size| size.min_signed() <= value && value <= size.max_signed())
            .unwrap_or(Self::Long)
    }

    /// Next narrower width, if any.
    pub fn prev(self) -> Option<Self> {
        match self.ordinal() {
            0 => None,
            o => Some(Self::ALL[o as usize - 1]),
        }
    }

    /// Next wider width, if any.
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.ordinal() as usize + 1).copied()
    }

    pub fn can_fit_unsigned(self, value: u64) -> bool {
        value <= self.max_unsigned()
    }

    pub fn can_fit_signed(self, value: i64) -> bool {
        self.min_signed() <= value && value <= self.max_signed()
    }

    /// Write `value` into the first [`bytes`](Self::bytes) bytes of `buf`.
    pub fn write_unsigned(self, buf: &mut [u8], value: u64) -> TypeResult<()> {
        if !self.can_fit_unsigned(value) {
            return Err(TypeError::OutOfRange {
                value: value as i128,
                size: self,
            });
        }
        let n = self.bytes();
        if buf.len() < n {
            return Err(TypeError::BufferTooShort {
                needed: n,
                actual: buf.len(),
            });
        }
        buf[..n].copy_from_slice(&value.to_le_bytes()[..n]);
        Ok(())
    }

    pub fn write_signed(self, buf: &mut [u8], value: i64) -> TypeResult<()> {
        if !self.can_fit_signed(value) {
            return Err(TypeError::OutOfRange {
                value: value as i128,
                size: self,
            });
        }
        let n = self.bytes();
        if buf.len() < n {
            return Err(TypeError::BufferTooShort {
                needed: n,
                actual: buf.len(),
            });
        }
        buf[..n].copy_from_slice(&(value as u64).to_le_bytes()[..n]);
        Ok(())
    }

    pub fn read_unsigned(self, buf: &[u8]) -> TypeResult<u64> {
        let n = self.bytes();
        if buf.len() < n {
            return Err(TypeError::BufferTooShort {
                needed: n,
                actual: buf.len(),
            });
        }
        let mut raw = [0u8; 8];
        raw[..n].copy_from_slice(&buf[..n]);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a two's complement value and sign-extend it to 64 bits.
    pub fn read_signed(self, buf: &[u8]) -> TypeResult<i64> {
        let raw = self.read_unsigned(buf)?;
        Ok(match self.bits() {
            0 => 0,
            64 => raw as i64,
            bits => {
                let shift = 64 - bits;
                ((raw << shift) as i64) >> shift
            }
        })
    }

    pub fn write_to<W: Write>(self, w: &mut W, value: u64) -> TypeResult<()> {
        let mut buf = [0u8; 8];
        self.write_unsigned(&mut buf, value)?;
        w.write_all(&buf[..self.bytes()])?;
        Ok(())
    }

    pub fn write_signed_to<W: Write>(self, w: &mut W, value: i64) -> TypeResult<()> {
        let mut buf = [0u8; 8];
        self.write_signed(&mut buf, value)?;
        w.write_all(&buf[..self.bytes()])?;
        Ok(())
    }

    pub fn read_from<R: Read>(self, r: &mut R) -> TypeResult<u64> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf[..self.bytes()])?;
        self.read_unsigned(&buf)
    }

    pub fn read_signed_from<R: Read>(self, r: &mut R) -> TypeResult<i64> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf[..self.bytes()])?;
        self.read_signed(&buf)
    }
}

impl fmt::Debug for NumberSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Void => "Void",
            Self::Byte => "Byte",
            Self::Short => "Short",
            Self::SmallInt => "SmallInt",
            Self::Int => "Int",
            Self::BigInt => "BigInt",
            Self::SmallLong => "SmallLong",
            Self::Long => "Long",
        };
        write!(f, "{name}({})", self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ladder_is_strictly_widening() {
        for pair in NumberSize::ALL.windows(2) {
            assert!(pair[0].bytes() < pair[1].bytes());
            assert!(pair[0].max_unsigned() < pair[1].max_unsigned());
        }
    }

    #[test]
    fn ordinal_roundtrip() {
        for size in NumberSize::ALL {
            assert_eq!(NumberSize::from_ordinal(size.ordinal()).unwrap(), size);
        }
        assert!(matches!(
            NumberSize::from_ordinal(8),
            Err(TypeError::InvalidNumberSize(8))
        ));
    }

    #[test]
    fn by_size_picks_narrowest() {
        assert_eq!(NumberSize::by_size(0), NumberSize::Void);
        assert_eq!(NumberSize::by_size(1), NumberSize::Byte);
        assert_eq!(NumberSize::by_size(255), NumberSize::Byte);
        assert_eq!(NumberSize::by_size(256), NumberSize::Short);
        assert_eq!(NumberSize::by_size(0xFF_FFFF), NumberSize::SmallInt);
        assert_eq!(NumberSize::by_size(0x1_0000_0000), NumberSize::BigInt);
        assert_eq!(NumberSize::by_size(u64::MAX), NumberSize::Long);
    }

    #[test]
    fn signed_boundaries() {
        assert_eq!(NumberSize::Byte.min_signed(), -128);
        assert_eq!(NumberSize::Byte.max_signed(), 127);
        assert_eq!(NumberSize::SmallInt.min_signed(), -(1 << 23));
        assert_eq!(NumberSize::by_size_signed(-128), NumberSize::Byte);
        assert_eq!(NumberSize::by_size_signed(-129), NumberSize::Short);
        assert_eq!(NumberSize::by_size_signed(127), NumberSize::Byte);
        assert_eq!(NumberSize::by_size_signed(128), NumberSize::Short);
        assert_eq!(NumberSize::by_size_signed(i64::MIN), NumberSize::Long);
        assert_eq!(NumberSize::by_size_signed(0), NumberSize::Void);
    }

    #[test]
    fn signed_boundary_values_roundtrip() {
        for size in NumberSize::ALL {
            for value in [size.min_signed(), size.max_signed(), 0] {
                let mut buf = [0u8; 8];
                size.write_signed(&mut buf, value).unwrap();
                assert_eq!(size.read_signed(&buf).unwrap(), value, "{size:?}");
            }
        }
    }

    #[test]
    fn write_out_of_range_fails() {
        let mut buf = [0u8; 8];
        let err = NumberSize::Byte.write_unsigned(&mut buf, 256).unwrap_err();
        assert!(matches!(err, TypeError::OutOfRange { value: 256, .. }));
        let err = NumberSize::Short.write_signed(&mut buf, 40_000).unwrap_err();
        assert!(matches!(err, TypeError::OutOfRange { .. }));
    }

    #[test]
    fn void_writes_nothing() {
        let mut out = Vec::new();
        NumberSize::Void.write_to(&mut out, 0).unwrap();
        assert!(out.is_empty());
        assert_eq!(NumberSize::Void.read_from(&mut &out[..]).unwrap(), 0);
    }

    #[test]
    fn stream_roundtrip_little_endian() {
        let mut out = Vec::new();
        NumberSize::SmallInt.write_to(&mut out, 0x0A0B0C).unwrap();
        assert_eq!(out, vec![0x0C, 0x0B, 0x0A]);
        assert_eq!(
            NumberSize::SmallInt.read_from(&mut &out[..]).unwrap(),
            0x0A0B0C
        );
    }

    #[test]
    fn prev_and_next() {
        assert_eq!(NumberSize::Void.prev(), None);
        assert_eq!(NumberSize::Long.next(), None);
        assert_eq!(NumberSize::Int.prev(), Some(NumberSize::SmallInt));
        assert_eq!(NumberSize::Int.next(), Some(NumberSize::BigInt));
    }

    #[test]
    fn serde_roundtrip() {
        let json = serde_json::to_string(&NumberSize::BigInt).unwrap();
        let parsed: NumberSize = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, NumberSize::BigInt);
    }

    proptest! {
        #[test]
        fn by_size_signed_is_tight(value in any::<i64>()) {
            let size = NumberSize::by_size_signed(value);
            prop_assert!(size.min_signed() <= value && value <= size.max_signed());
            if let Some(narrower) = size.prev() {
                prop_assert!(!narrower.can_fit_signed(value));
            }
        }

        #[test]
        fn by_size_unsigned_is_tight(value in any::<u64>()) {
            let size = NumberSize::by_size(value);
            prop_assert!(value <= size.max_unsigned());
            if let Some(narrower) = size.prev() {
                prop_assert!(!narrower.can_fit_unsigned(value));
            }
        }

        #[test]
        fn signed_roundtrip_at_chosen_width(value in any::<i64>()) {
            let size = NumberSize::by_size_signed(value);
            let mut out = Vec::new();
            size.write_signed_to(&mut out, value).unwrap();
            prop_assert_eq!(out.len(), size.bytes());
            prop_assert_eq!(size.read_signed_from(&mut &out[..]).unwrap(), value);
        }
    }
}
