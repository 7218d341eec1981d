//! Low-level I/O primitives shared by all parsers and writers.
//!
//! Each reader reads exactly the bytes it promises or returns an error -
//! there is no partial-read ambiguity. Writers pad with `0xFF`, the erased
//! state of cartridge mask ROM.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::{Error, Result};

/// Byte used for every gap and padding run in a ROM image.
pub const FILL: u8 = 0xFF;

/// Read one byte.
#[inline]
pub(crate) fn u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

/// Read a little-endian `u16`.
#[inline]
pub(crate) fn le_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

/// Read a little-endian `u32`.
#[inline]
pub(crate) fn le_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Read exactly `N` bytes into a fixed-size array.
#[inline]
pub(crate) fn bytesa<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Read exactly `len` bytes into a `Vec`.
#[inline]
pub(crate) fn bytesv<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut b = vec![0u8; len];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Seek to `offset` and read `len` bytes.
pub(crate) fn read_at<R: Read + Seek>(r: &mut R, offset: u64, len: usize) -> Result<Vec<u8>> {
    r.seek(SeekFrom::Start(offset))?;
    bytesv(r, len)
}

/// Little-endian `u16` at `offset` inside a buffer.
#[inline]
pub(crate) fn get_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let b = buf.get(offset..offset + 2).ok_or(Error::InvalidRange)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

/// Little-endian `u32` at `offset` inside a buffer.
#[inline]
pub(crate) fn get_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let b = buf.get(offset..offset + 4).ok_or(Error::InvalidRange)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Store a little-endian `u16` at `offset` inside a buffer.
#[inline]
pub(crate) fn put_u16(buf: &mut [u8], offset: usize, v: u16) -> Result<()> {
    buf.get_mut(offset..offset + 2)
        .ok_or(Error::InvalidRange)?
        .copy_from_slice(&v.to_le_bytes());
    Ok(())
}

/// Store a little-endian `u32` at `offset` inside a buffer.
#[inline]
pub(crate) fn put_u32(buf: &mut [u8], offset: usize, v: u32) -> Result<()> {
    buf.get_mut(offset..offset + 4)
        .ok_or(Error::InvalidRange)?
        .copy_from_slice(&v.to_le_bytes());
    Ok(())
}

/// Round `v` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

/// Write [`FILL`] bytes until the stream position reaches `target`.
///
/// Returns [`Error::Parse`] if the stream is already past `target`.
pub(crate) fn fill_to<W: Write + Seek>(w: &mut W, target: u64) -> Result<()> {
    let pos = w.stream_position()?;
    if pos > target {
        return Err(Error::Parse("section overlaps previously written data"));
    }
    let mut remaining = target - pos;
    let chunk = [FILL; 0x200];
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u64) as usize;
        w.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Pad the stream with [`FILL`] up to the next multiple of `align`.
///
/// Returns the new stream position.
pub(crate) fn pad_to<W: Write + Seek>(w: &mut W, align: u64) -> Result<u64> {
    let pos = w.stream_position()?;
    let target = align_up(pos, align);
    fill_to(w, target)?;
    Ok(target)
}

/// Copy `size` bytes starting at `offset` in `r` to the current position
/// of `w`.
pub(crate) fn copy_range<R: Read + Seek, W: Write>(
    r: &mut R,
    offset: u64,
    size: u64,
    w: &mut W,
) -> Result<()> {
    r.seek(SeekFrom::Start(offset))?;
    let copied = io::copy(&mut r.by_ref().take(size), w)?;
    if copied != size {
        return Err(Error::UnexpectedEof);
    }
    Ok(())
}
