//! Bit-packed group at the head of every struct layout.

use std::io::{Read, Write};

use chunkdb_types::{bytes_for_bits, BitReader, BitWriter, SizeDescriptor, WordSpace};

use crate::error::{CodecError, CodecResult};

/// What a member of the bit group encodes for its field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BitRole {
    /// Set when the field is null.
    Null,
    /// NumberSize of the field's value or length.
    Width,
    /// NumberSize shared by all elements of a variable-width array.
    ElemWidth,
    /// Index of the selected sealed variant.
    Universe,
    /// NumberSize of an inline type id.
    TypeIdWidth,
    /// The value itself: a bool or an enum ordinal.
    Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitMember {
    /// Index of the owning field in the schema.
    pub field: usize,
    pub role: BitRole,
    pub bits: u32,
}

/// Packs every bit-sized member of a struct into one byte-aligned unit.
///
/// Member bits always sum to [`total_bits`](Self::total_bits); the group
/// occupies `ceil(total_bits / 8)` bytes and the remainder are safety bits,
/// written as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitFieldMerger {
    members: Vec<BitMember>,
    total_bits: u64,
}

impl BitFieldMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: usize, role: BitRole, bits: u32) {
        self.members.push(BitMember { field, role, bits });
        self.total_bits += u64::from(bits);
    }

    pub fn members(&self) -> &[BitMember] {
        &self.members
    }

    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    pub fn byte_len(&self) -> u64 {
        bytes_for_bits(self.total_bits)
    }

    pub fn safety_bits(&self) -> u64 {
        self.byte_len() * 8 - self.total_bits
    }

    pub fn size_descriptor<P: ?Sized, I: ?Sized>(&self) -> SizeDescriptor<P, I> {
        SizeDescriptor::fixed(WordSpace::Byte, self.byte_len())
    }

    /// Write one value per member, in member order.
    pub fn write<W: Write>(&self, out: W, values: &[u64]) -> CodecResult<()> {
        if values.len() != self.members.len() {
            return Err(CodecError::InvalidValue(format!(
                "bit group has {} members, got {} values",
                self.members.len(),
                values.len()
            )));
        }
        let mut writer = BitWriter::new(out);
        for (member, value) in self.members.iter().zip(values) {
            writer.write_value(*value, member.bits)?;
        }
        let written = writer.finish()?;
        debug_assert_eq!(written, self.total_bits);
        Ok(())
    }

    /// Read the group back, one value per member.
    pub fn read<R: Read>(&self, input: R) -> CodecResult<Vec<u64>> {
        let mut reader = BitReader::with_bit_count(input, self.total_bits)?;
        let values = self
            .members
            .iter()
            .map(|m| reader.read_value(m.bits))
            .collect::<Result<Vec<_>, _>>()?;
        reader.finish();
        Ok(values)
    }
}
