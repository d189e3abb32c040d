//! Helpers for decoding from an in-memory byte cursor.

use std::io::{self, Cursor, Read};

use crate::error::CodecResult;

pub(crate) type Input<'a> = Cursor<&'a [u8]>;

pub(crate) fn remaining(input: &Input<'_>) -> u64 {
    (input.get_ref().len() as u64).saturating_sub(input.position())
}

fn eof(wanted: u64, input: &Input<'_>) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "need {wanted} bytes at offset {}, {} left",
            input.position(),
            remaining(input)
        ),
    )
}

pub(crate) fn skip(input: &mut Input<'_>, n: u64) -> CodecResult<()> {
    if remaining(input) < n {
        return Err(eof(n, input).into());
    }
    input.set_position(input.position() + n);
    Ok(())
}

pub(crate) fn read_u8(input: &mut Input<'_>) -> CodecResult<u8> {
    let mut b = [0u8; 1];
    input.read_exact(&mut b)?;
    Ok(b[0])
}

pub(crate) fn read_array<const N: usize>(input: &mut Input<'_>) -> CodecResult<[u8; N]> {
    let mut b = [0u8; N];
    input.read_exact(&mut b)?;
    Ok(b)
}

/// Read `len` bytes, failing before allocating if fewer remain.
pub(crate) fn read_vec(input: &mut Input<'_>, len: u64) -> CodecResult<Vec<u8>> {
    if remaining(input) < len {
        return Err(eof(len, input).into());
    }
    let mut buf = vec![0u8; len as usize];
    input.read_exact(&mut buf)?;
    Ok(buf)
}
