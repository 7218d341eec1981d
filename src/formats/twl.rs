//! DSi (TWL) region: hash tables, DSi9/DSi7 payloads and modcrypt.
//!
//! ## Region layout (offsets come from [`TwlHeader`])
//! ```text
//! [rom_size ..]                   NTR region ends, 0xFF up to the tables
//! [sector_hashtable_start]        Sector hash table (20 bytes per sector)
//! [block_hashtable_start]         Block hash table  (20 bytes per block)
//! [digest_twl_start - 0x3000]     Filler, 3 × 0x1000 (untrimmed images only)
//! [arm9i.rom_offset]              DSi9 payload (modcrypt area 1)
//! [arm7i.rom_offset]              DSi7 payload (modcrypt area 2)
//! [total_rom_size]                End of image
//! ```
//!
//! Hashes are always taken over plaintext. Payloads are held decrypted in
//! memory and encrypted again on write when the header asks for it.

use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;

use log::{debug, info, warn};

use super::fnt::VirtualFile;
use super::header::{Header, TwlHeader};
use super::overlay::Processor;
use crate::compression::compress_arm9;
use crate::compression::blz;
use crate::crypto::digest::{DIGEST_LEN, block_hashes, hmac_sha1, master_hash, sector_hashes};
use crate::crypto::modcrypt::{self, Key};
use crate::crypto::secure_area::{
    SECURE_AREA_OFFSET, SECURE_AREA_SIZE, SecureAreaCipher, encrypt_if_decrypted,
};
use crate::utils::{FILL, align_up, fill_to, get_u32, put_u32, read_at};
use crate::{Error, Result};

/// Size of the preserved filler ahead of the TWL digest region.
pub const FILLER_LEN: usize = 0x3000;

/// Imported DSi9/DSi7 payloads are padded to this.
const PAYLOAD_ALIGN: u64 = 0x10;

/// Magic at module params +0x1C (the nitrocode words).
const NITROCODE: u32 = 0xDEC0_0621;
const NITROCODE_SWAPPED: u32 = 0x2106_C0DE;

/// Decoded DSi region state.
#[derive(Debug, Clone)]
pub struct TwlState {
    /// Sector hash table as read.
    pub sector_hashes: Vec<u8>,
    /// Block hash table as read.
    pub block_hashes: Vec<u8>,
    /// DSi9 payload, plaintext.
    pub dsi9: Vec<u8>,
    /// DSi7 payload, plaintext.
    pub dsi7: Vec<u8>,
    /// The three 0x1000 filler blocks, kept opaque.
    pub filler: Option<Vec<u8>>,
    /// HMAC of every ARM9 overlay payload at decode time.
    pub overlay_hmacs: Vec<[u8; DIGEST_LEN]>,
    /// Whether the source stored the payloads encrypted.
    pub encrypted: bool,
}

fn twl_header(header: &Header) -> Result<&TwlHeader> {
    header
        .twl
        .as_ref()
        .ok_or(Error::Crypto("DSi region needs a DSi header"))
}

/// `0xFFFFFFFF` marks an unused modcrypt area.
fn area_size(size: u32) -> u32 {
    if size == u32::MAX { 0 } else { size }
}

/// Byte range of a modcrypt area inside the payload loaded from
/// `rom_offset`.
fn area_range(data_len: usize, rom_offset: u32, start: u32, size: u32) -> Result<Range<usize>> {
    let begin = start.checked_sub(rom_offset).ok_or(Error::InvalidRange)? as usize;
    let end = begin.checked_add(size as usize).ok_or(Error::InvalidRange)?;
    if end > data_len {
        return Err(Error::InvalidRange);
    }
    Ok(begin..end)
}

fn hashtable_entry(table: &[u8], index: usize) -> Result<&[u8]> {
    table
        .get(index * DIGEST_LEN..(index + 1) * DIGEST_LEN)
        .ok_or(Error::Parse("sector hash table too short"))
}

impl TwlState {
    /// Whether the image still carries the filler ahead of the TWL region.
    pub fn is_untrimmed(header: &Header) -> bool {
        header.twl.as_ref().is_some_and(|t| {
            t.digest_twl_start >= FILLER_LEN as u32
                && t.digest_twl_start - FILLER_LEN as u32 >= header.rom_size
        })
    }

    /// Decode the DSi region of an image. `arm9_overlays` are the overlay
    /// files as found in the source image.
    pub fn parse<R: Read + Seek>(
        r: &mut R,
        header: &Header,
        arm9_overlays: &[VirtualFile],
    ) -> Result<Self> {
        let twl = twl_header(header)?;
        if twl.digest_sector_size == 0 || twl.digest_block_sectorcount == 0 {
            return Err(Error::Parse("digest sector geometry is zero"));
        }

        let sector_hashes = read_at(
            r,
            twl.sector_hashtable_start as u64,
            twl.sector_hashtable_size as usize,
        )?;
        let block_hashes = read_at(
            r,
            twl.block_hashtable_start as u64,
            twl.block_hashtable_size as usize,
        )?;

        let dsi9_len = area_size(twl.modcrypt1_size).max(twl.arm9i.size);
        let dsi7_len = area_size(twl.modcrypt2_size).max(twl.arm7i.size);
        let mut dsi9 = read_at(r, twl.arm9i.rom_offset as u64, dsi9_len as usize)?;
        let mut dsi7 = read_at(r, twl.arm7i.rom_offset as u64, dsi7_len as usize)?;

        let filler = if Self::is_untrimmed(header) {
            let start = twl.digest_twl_start as u64 - FILLER_LEN as u64;
            Some(read_at(r, start, FILLER_LEN)?)
        } else {
            None
        };

        let mut overlay_hmacs = Vec::with_capacity(arm9_overlays.len());
        for f in arm9_overlays {
            overlay_hmacs.push(hmac_sha1(&f.read_contents(r)?)?);
        }

        let encrypted = Self::detect_encryption(r, twl, &sector_hashes)?;
        if encrypted {
            let key = modcrypt::derive_key(header)?;
            crypt_areas(&key, twl, &mut dsi9, &mut dsi7)?;
            debug!("decrypted modcrypt areas");
        }

        info!(
            "DSi region: {} sector hashes, DSi9 {:#x} bytes, DSi7 {:#x} bytes{}",
            sector_hashes.len() / DIGEST_LEN,
            dsi9.len(),
            dsi7.len(),
            if encrypted { ", encrypted" } else { "" }
        );

        Ok(Self {
            sector_hashes,
            block_hashes,
            dsi9,
            dsi7,
            filler,
            overlay_hmacs,
            encrypted,
        })
    }

    /// Re-hash the first sector of modcrypt area 1. A mismatch against the
    /// stored table means the area is stored encrypted.
    fn detect_encryption<R: Read + Seek>(
        r: &mut R,
        twl: &TwlHeader,
        sector_hashes: &[u8],
    ) -> Result<bool> {
        let start = twl.modcrypt1_start;
        if start < twl.digest_twl_start || start == u32::MAX || area_size(twl.modcrypt1_size) == 0
        {
            return Ok(false);
        }
        let sector = twl.digest_sector_size;
        let index = (start - twl.digest_twl_start) / sector;
        let data = read_at(
            r,
            twl.digest_twl_start as u64 + (index * sector) as u64,
            sector as usize,
        )?;
        let first_twl_entry = (twl.digest_ntr_size / sector) as usize;
        let stored = hashtable_entry(sector_hashes, first_twl_entry + index as usize)?;
        Ok(hmac_sha1(&data)?[..] != *stored)
    }

    /// Write the DSi region at the current position of `w`, which must be
    /// the end of the NTR region, and rebuild the hash tree.
    ///
    /// Returns the new master hash for header offset 0x328. The stream is
    /// left positioned at the end of the image.
    pub fn write<W: Read + Write + Seek>(
        &self,
        w: &mut W,
        header: &Header,
        cipher: Option<&dyn SecureAreaCipher>,
    ) -> Result<[u8; DIGEST_LEN]> {
        let twl = twl_header(header)?;
        let ntr_end = w.stream_position()?;
        if ntr_end > twl.sector_hashtable_start as u64 {
            return Err(Error::Parse("NTR region runs into the DSi hash tables"));
        }

        // Tables are placeholders until the payloads are down.
        fill_to(w, twl.sector_hashtable_start as u64)?;
        w.write_all(&vec![0u8; twl.sector_hashtable_size as usize])?;
        fill_to(w, twl.block_hashtable_start as u64)?;
        w.write_all(&vec![0u8; twl.block_hashtable_size as usize])?;
        if let Some(filler) = &self.filler {
            fill_to(w, twl.digest_twl_start as u64 - FILLER_LEN as u64)?;
            w.write_all(filler)?;
        }
        fill_to(w, twl.arm9i.rom_offset as u64)?;
        w.write_all(&self.dsi9)?;
        fill_to(w, twl.arm7i.rom_offset as u64)?;
        w.write_all(&self.dsi7)?;
        if w.stream_position()? < twl.total_rom_size as u64 {
            fill_to(w, twl.total_rom_size as u64)?;
        }
        let end = w.stream_position()?;

        let sector = twl.digest_sector_size as usize;
        if sector == 0 || twl.digest_block_sectorcount == 0 {
            return Err(Error::Parse("digest sector geometry is zero"));
        }

        let mut hashes = Vec::new();
        let mut area = read_at(w, twl.digest_ntr_start as u64, SECURE_AREA_SIZE)?;
        if twl.digest_ntr_start as u64 == SECURE_AREA_OFFSET {
            encrypt_if_decrypted(&mut area, &header.game_code, cipher)?;
        }
        hashes.extend(sector_hashes(&area, sector)?);

        let ntr_rest = twl.digest_ntr_size.saturating_sub(SECURE_AREA_SIZE as u32) as u64;
        let ntr = read_at(
            w,
            twl.digest_ntr_start as u64 + SECURE_AREA_SIZE as u64,
            align_up(ntr_rest, sector as u64) as usize,
        )?;
        hashes.extend(sector_hashes(&ntr, sector)?);

        let twl_region = read_at(
            w,
            twl.digest_twl_start as u64,
            align_up(twl.digest_twl_size as u64, sector as u64) as usize,
        )?;
        hashes.extend(sector_hashes(&twl_region, sector)?);

        let mut sector_table = vec![0u8; twl.sector_hashtable_size as usize];
        store_hashes(&mut sector_table, &hashes, "sector hash table too small")?;
        w.seek(SeekFrom::Start(twl.sector_hashtable_start as u64))?;
        w.write_all(&sector_table)?;

        let blocks = block_hashes(&sector_table, twl.digest_block_sectorcount as usize)?;
        let mut block_table = vec![0u8; twl.block_hashtable_size as usize];
        store_hashes(&mut block_table, &blocks, "block hash table too small")?;
        w.seek(SeekFrom::Start(twl.block_hashtable_start as u64))?;
        w.write_all(&block_table)?;

        let master = master_hash(&block_table)?;
        debug!(
            "DSi hash tree: {} sectors, {} blocks",
            hashes.len(),
            blocks.len()
        );

        if header.twl_flags & 0x02 != 0 {
            let key = modcrypt::derive_key(header)?;
            let mut dsi9 = self.dsi9.clone();
            let mut dsi7 = self.dsi7.clone();
            crypt_areas(&key, twl, &mut dsi9, &mut dsi7)?;
            w.seek(SeekFrom::Start(twl.arm9i.rom_offset as u64))?;
            w.write_all(&dsi9)?;
            w.seek(SeekFrom::Start(twl.arm7i.rom_offset as u64))?;
            w.write_all(&dsi7)?;
            debug!("re-encrypted modcrypt areas");
        }

        w.seek(SeekFrom::Start(end))?;
        Ok(master)
    }

    /// Replace the DSi9 (`Arm9`) or DSi7 (`Arm7`) payload.
    ///
    /// The payload is padded to 0x10 with `0xFF` and the header size field
    /// takes the padded length. It must fit before the next payload (DSi9)
    /// or the end of the image (DSi7). A modcrypt area reaching past the
    /// new payload is cut back to its end.
    pub fn import(
        &mut self,
        header: &mut Header,
        processor: Processor,
        mut data: Vec<u8>,
    ) -> Result<()> {
        let twl = header
            .twl
            .as_mut()
            .ok_or(Error::Crypto("DSi region needs a DSi header"))?;
        data.resize(align_up(data.len() as u64, PAYLOAD_ALIGN) as usize, FILL);
        let size = u32::try_from(data.len()).map_err(|_| Error::InvalidRange)?;

        let (binary, slot_end, area_start, area) = match processor {
            Processor::Arm9 => {
                let next = twl.arm7i.rom_offset;
                let end = if next > twl.arm9i.rom_offset { next } else { twl.total_rom_size };
                (&mut twl.arm9i, end, twl.modcrypt1_start, &mut twl.modcrypt1_size)
            }
            Processor::Arm7 => (
                &mut twl.arm7i,
                twl.total_rom_size,
                twl.modcrypt2_start,
                &mut twl.modcrypt2_size,
            ),
        };
        let end = binary.rom_offset as u64 + size as u64;
        if end > slot_end as u64 {
            return Err(Error::InvalidRange);
        }
        if area_size(*area) > 0 && area_start >= binary.rom_offset {
            let limit = (end as u32).saturating_sub(area_start);
            if *area > limit {
                debug!("modcrypt area at {area_start:#x} cut back to {limit:#x} bytes");
                *area = limit;
            }
        }
        binary.size = size;

        match processor {
            Processor::Arm9 => self.dsi9 = data,
            Processor::Arm7 => self.dsi7 = data,
        }
        info!("imported {processor:?}i payload, {size:#x} bytes");
        Ok(())
    }

    /// Whether any ARM9 overlay changed since decode.
    pub fn overlays_changed(&self, overlays: &[Vec<u8>]) -> Result<bool> {
        if overlays.len() != self.overlay_hmacs.len() {
            return Ok(true);
        }
        for (o, h) in overlays.iter().zip(&self.overlay_hmacs) {
            if hmac_sha1(o)? != *h {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Bring the overlay HMAC table inside the ARM9 binary up to date.
    ///
    /// Returns the new ARM9 binary, or [`None`] when nothing changed or the
    /// table could not be located.
    pub fn refresh_overlay_hmacs(
        &self,
        arm9: &[u8],
        header: &Header,
        overlays: &[Vec<u8>],
    ) -> Result<Option<Vec<u8>>> {
        if self.overlay_hmacs.is_empty() || !self.overlays_changed(overlays)? {
            return Ok(None);
        }
        let Some(params) = module_params(arm9, header) else {
            warn!("ARM9 overlays changed but the module params were not found");
            return Ok(None);
        };

        let ram = header.arm9.ram_address;
        let footer = nitrocode_footer_len(arm9);
        let body_len = arm9.len() - footer;
        let static_end = get_u32(arm9, params + 0x14)?;
        let compressed = static_end > ram && (static_end - ram) as usize + footer >= arm9.len();
        let post_size = if compressed {
            arm9.len().saturating_sub((static_end - ram) as usize)
        } else {
            0
        };

        let mut data = if compressed {
            blz::decompress(&arm9[..body_len])?
        } else {
            arm9[..body_len].to_vec()
        };

        let autoload = get_u32(&data, params + 0x08)?;
        let end = autoload.checked_sub(ram).ok_or(Error::InvalidRange)? as usize;
        let table_len = DIGEST_LEN * self.overlay_hmacs.len();
        if data.len() < table_len {
            return Err(Error::InvalidRange);
        }
        let old = &self.overlay_hmacs[0];
        let found = end.checked_sub(table_len).and_then(|last| {
            (0..=last.min(data.len().saturating_sub(DIGEST_LEN)))
                .rev()
                .find(|&i| data[i..i + DIGEST_LEN] == old[..])
        });
        let Some(offset) = found.filter(|&o| o > 0 && o + table_len <= data.len()) else {
            warn!("ARM9 overlays changed but their HMAC table was not found in arm9.bin");
            return Ok(None);
        };

        for (i, o) in overlays.iter().enumerate() {
            let at = offset + i * DIGEST_LEN;
            data[at..at + DIGEST_LEN].copy_from_slice(&hmac_sha1(o)?);
        }
        info!("refreshed {} overlay HMACs at arm9.bin+{offset:#x}", overlays.len());

        let footer_bytes = &arm9[body_len..];
        let out = match compressed.then(|| compress_arm9(&data)).flatten() {
            Some(mut packed) => {
                packed.extend_from_slice(footer_bytes);
                let static_end = packed.len().saturating_sub(post_size) as u32 + ram;
                put_u32(&mut packed, params + 0x14, static_end)?;
                packed
            }
            None => {
                if compressed {
                    put_u32(&mut data, params + 0x14, 0)?;
                }
                data.extend_from_slice(footer_bytes);
                data
            }
        };
        Ok(Some(out))
    }
}

fn store_hashes(table: &mut [u8], hashes: &[[u8; DIGEST_LEN]], overflow: &'static str) -> Result<()> {
    if hashes.len() * DIGEST_LEN > table.len() {
        return Err(Error::Parse(overflow));
    }
    for (slot, h) in table.chunks_exact_mut(DIGEST_LEN).zip(hashes) {
        slot.copy_from_slice(h);
    }
    Ok(())
}

fn crypt_areas(key: &Key, twl: &TwlHeader, dsi9: &mut [u8], dsi7: &mut [u8]) -> Result<()> {
    let size1 = area_size(twl.modcrypt1_size);
    if size1 > 0 {
        let range = area_range(dsi9.len(), twl.arm9i.rom_offset, twl.modcrypt1_start, size1)?;
        modcrypt::crypt(key, &modcrypt::counter(&twl.hmac_arm9), &mut dsi9[range]);
    }
    let size2 = area_size(twl.modcrypt2_size);
    if size2 > 0 {
        let range = area_range(dsi7.len(), twl.arm7i.rom_offset, twl.modcrypt2_start, size2)?;
        modcrypt::crypt(key, &modcrypt::counter(&twl.hmac_arm7), &mut dsi7[range]);
    }
    Ok(())
}

/// 12 when `arm9` ends in a nitrocode footer.
pub(crate) fn nitrocode_footer_len(arm9: &[u8]) -> usize {
    match arm9.len().checked_sub(12).map(|at| get_u32(arm9, at)) {
        Some(Ok(NITROCODE)) => 12,
        _ => 0,
    }
}

/// Offset of the module params inside `arm9`: from the header when set,
/// otherwise located by their nitrocode words.
fn module_params(arm9: &[u8], header: &Header) -> Option<usize> {
    let from_header = header.module_params_offset() as usize;
    if from_header != 0 {
        return Some(from_header);
    }
    (0x1C..arm9.len().saturating_sub(8))
        .step_by(4)
        .find(|&p| {
            get_u32(arm9, p).ok() == Some(NITROCODE)
                && get_u32(arm9, p + 4).ok() == Some(NITROCODE_SWAPPED)
        })
        .map(|p| p - 0x1C)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::header::TWL_HEADER_SIZE;

    const RAM: u32 = 0x0200_0000;
    const PARAMS: usize = 0x800;

    fn header() -> Header {
        let mut raw = vec![0u8; TWL_HEADER_SIZE];
        raw[0x12] = 0x02;
        raw[0x1C] = 0x01;
        put_u32(&mut raw, 0x28, RAM).unwrap();
        put_u32(&mut raw, 0x84, TWL_HEADER_SIZE as u32).unwrap();
        Header::from_bytes(raw).unwrap()
    }

    /// An uncompressed ARM9 with module params and a two-entry HMAC table
    /// ending right before the autoload start.
    fn arm9(hmacs: &[[u8; DIGEST_LEN]]) -> Vec<u8> {
        let mut a = vec![0u8; 0x5000];
        let table_at = 0x4800;
        put_u32(&mut a, PARAMS + 0x08, RAM + (table_at + hmacs.len() * DIGEST_LEN) as u32).unwrap();
        put_u32(&mut a, PARAMS + 0x1C, NITROCODE).unwrap();
        put_u32(&mut a, PARAMS + 0x20, NITROCODE_SWAPPED).unwrap();
        for (i, h) in hmacs.iter().enumerate() {
            a[table_at + i * DIGEST_LEN..][..DIGEST_LEN].copy_from_slice(h);
        }
        a
    }

    fn state(overlays: &[Vec<u8>]) -> TwlState {
        TwlState {
            sector_hashes: Vec::new(),
            block_hashes: Vec::new(),
            dsi9: Vec::new(),
            dsi7: Vec::new(),
            filler: None,
            overlay_hmacs: overlays.iter().map(|o| hmac_sha1(o).unwrap()).collect(),
            encrypted: false,
        }
    }

    #[test]
    fn test_unchanged_overlays_leave_arm9_alone() {
        let overlays = vec![vec![1u8; 0x40], vec![2u8; 0x40]];
        let s = state(&overlays);
        let a = arm9(&s.overlay_hmacs);
        assert!(s.refresh_overlay_hmacs(&a, &header(), &overlays).unwrap().is_none());
    }

    #[test]
    fn test_refresh_rewrites_table() {
        let old = vec![vec![1u8; 0x40], vec![2u8; 0x40]];
        let s = state(&old);
        let a = arm9(&s.overlay_hmacs);

        let new = vec![vec![1u8; 0x40], vec![3u8; 0x44]];
        let out = s.refresh_overlay_hmacs(&a, &header(), &new).unwrap().unwrap();
        assert_eq!(out.len(), a.len());
        assert_eq!(&out[0x4800..0x4814], &hmac_sha1(&new[0]).unwrap());
        assert_eq!(&out[0x4814..0x4828], &hmac_sha1(&new[1]).unwrap());
        assert_eq!(&out[..0x4800], &a[..0x4800]);
    }

    #[test]
    fn test_refresh_recompresses_compressed_arm9() {
        let old = vec![vec![1u8; 0x40]];
        let s = state(&old);
        let mut plain = arm9(&s.overlay_hmacs);
        // Compressible tail after the raw head.
        for (i, b) in plain[0x4900..].iter_mut().enumerate() {
            *b = (i % 7) as u8;
        }
        let mut packed = compress_arm9(&plain).unwrap();
        let static_end = packed.len() as u32 + RAM;
        put_u32(&mut packed, PARAMS + 0x14, static_end).unwrap();

        let new = vec![vec![9u8; 0x40]];
        let out = s.refresh_overlay_hmacs(&packed, &header(), &new).unwrap().unwrap();
        assert_eq!(get_u32(&out, PARAMS + 0x14).unwrap(), out.len() as u32 + RAM);
        let unpacked = blz::decompress(&out).unwrap();
        assert_eq!(&unpacked[0x4800..0x4814], &hmac_sha1(&new[0]).unwrap());
    }

    #[test]
    fn test_missing_table_is_not_fatal() {
        let old = vec![vec![1u8; 0x40]];
        let s = state(&old);
        let a = arm9(&[[0xAA; DIGEST_LEN]]);
        let new = vec![vec![5u8; 0x40]];
        assert!(s.refresh_overlay_hmacs(&a, &header(), &new).unwrap().is_none());
    }

    #[test]
    fn test_arm9_shorter_than_table_is_rejected() {
        let mut raw = header().raw;
        put_u32(&mut raw, 0x88, 0x04).unwrap();
        let header = Header::from_bytes(raw).unwrap();

        // 16 bytes of body, then the footer. The autoload start lies past it.
        let mut a = vec![0u8; 0x1C];
        put_u32(&mut a, 0x04 + 0x08, RAM + 0x40).unwrap();
        put_u32(&mut a, 0x10, NITROCODE).unwrap();

        let s = state(&[vec![1u8; 0x40]]);
        let err = s.refresh_overlay_hmacs(&a, &header, &[vec![2u8; 0x40]]);
        assert!(matches!(err, Err(Error::InvalidRange)));
    }

    #[test]
    fn test_area_range_bounds() {
        assert_eq!(area_range(0x100, 0x1000, 0x1010, 0x20).unwrap(), 0x10..0x30);
        assert!(matches!(area_range(0x100, 0x1000, 0xFF0, 0x20), Err(Error::InvalidRange)));
        assert!(matches!(area_range(0x100, 0x1000, 0x10F0, 0x20), Err(Error::InvalidRange)));
    }

    #[test]
    fn test_nitrocode_footer() {
        let mut a = vec![0u8; 0x20];
        assert_eq!(nitrocode_footer_len(&a), 0);
        put_u32(&mut a, 0x14, NITROCODE).unwrap();
        assert_eq!(nitrocode_footer_len(&a), 12);
        assert_eq!(nitrocode_footer_len(&[0u8; 4]), 0);
    }
}
