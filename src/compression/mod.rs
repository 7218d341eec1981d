//! Compression helpers.
//!
//! ## Submodules
//!
//! | Module | Algorithm | Typical use in nitrokit |
//! |--------|-----------|-------------------------|
//! | [`blz`] | Bottom-LZ (backwards LZ77) | ARM9 binary and overlays |
//!
//! ARM9 binaries keep their first 0x4000 bytes (the secure area) raw; use
//! [`compress_arm9`] rather than [`blz::compress`] for them.

pub mod blz;

/// Size of the ARM9 head that is never compressed.
pub const ARM9_RAW_HEAD: usize = 0x4000;

/// Compress an ARM9 body, keeping the first [`ARM9_RAW_HEAD`] bytes raw.
///
/// Returns [`None`] when nothing is gained.
pub fn compress_arm9(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() <= ARM9_RAW_HEAD {
        return None;
    }
    let tail = blz::try_compress(&data[ARM9_RAW_HEAD..])?;
    let mut out = Vec::with_capacity(ARM9_RAW_HEAD + tail.len());
    out.extend_from_slice(&data[..ARM9_RAW_HEAD]);
    out.extend_from_slice(&tail);
    Some(out)
}
