//! Rebuilding an image from a decoded [`NdsRom`].
//!
//! Every section offset is planned before the first byte is written, so the
//! allocation table can be encoded up front and the header written once,
//! last. Files are taken from their redirected source when one is set and
//! copied from the source image otherwise.
//!
//! ## Write order
//! ```text
//! header placeholder   0xFF up to the first section
//! arm9.bin             (overlay HMACs refreshed on DSi images)
//! overarm9.bin + ARM9 overlays, at their planned FAT offsets
//! arm7.bin
//! overarm7.bin + ARM7 overlays
//! fnt.bin, FAT, banner
//! files                in allocation order, not padded after the last slot
//! DSi region           or the multiboot signature
//! 0xFF                 up to the device capacity (NTR + DSi region)
//! header               with CRCs, master hash and signature
//! ```

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};
use rsa::RsaPrivateKey;

use super::banner::Banner;
use super::fat::{AllocationEntry, FILE_ALIGN, FatLayout, banner_space};
use super::fnt::{VirtualFile, find_file};
use super::header::Header;
use super::nds::{NITROCODE_FOOTER_LEN, NdsRom};
use super::overlay::{OverlayTable, Processor};
use crate::crypto::digest::DIGEST_LEN;
use crate::crypto::secure_area::{
    SECURE_AREA_OFFSET, SECURE_AREA_SIZE, SecureAreaCipher, secure_area_crc,
};
use crate::crypto::signature::{self, SIGNATURE_LEN, SignatureOutcome};
use crate::utils::{align_up, fill_to, pad_to, read_at};
use crate::{Error, Result};

/// Smallest image a rebuild produces.
pub const MIN_IMAGE_SIZE: u64 = 0x20000;

/// Knobs for [`NdsRom::rebuild`].
#[derive(Default)]
pub struct RebuildOptions<'a> {
    /// KEY1 encryption for images whose secure area is stored decrypted.
    pub secure_area_cipher: Option<&'a dyn SecureAreaCipher>,
    /// Key used to re-sign a DSi header whose signature no longer verifies.
    pub signing_key: Option<RsaPrivateKey>,
    /// Keep a stale DSi signature instead of writing the unsigned sentinel.
    pub keep_original_signature: bool,
}

/// Start offset of every section in the rebuilt image. Overlay fields are
/// zero when the image has no such overlays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionPlan {
    pub arm9: u32,
    pub arm9_overlay_table: u32,
    pub arm9_overlays: u32,
    pub arm7: u32,
    pub arm7_overlay_table: u32,
    pub arm7_overlays: u32,
    pub fnt: u32,
    pub fat: u32,
    pub banner: u32,
    pub files: u32,
}

/// What a rebuild did.
#[derive(Debug, Clone)]
pub struct RebuildReport {
    pub plan: SectionPlan,
    /// Allocation ids with no file behind them; their entries were zeroed.
    pub fat_holes: usize,
    /// End of the NTR region.
    pub rom_size: u32,
    /// Total bytes written.
    pub image_size: u64,
    /// New digest master hash, for DSi images.
    pub master_hash: Option<[u8; DIGEST_LEN]>,
    /// How the DSi header signature was handled.
    pub signature: Option<SignatureOutcome>,
}

/// An overlay table with the files it links, in table order.
struct OverlaySection {
    table: OverlayTable,
    files: Vec<VirtualFile>,
}

impl OverlaySection {
    fn ids(&self) -> HashSet<u16> {
        self.files.iter().map(|f| f.id).collect()
    }

    /// Bytes the payloads take, each padded to [`FILE_ALIGN`].
    fn payload_span(&self) -> u64 {
        self.files
            .iter()
            .map(|f| align_up(f.size as u64, FILE_ALIGN))
            .sum()
    }
}

impl NdsRom {
    fn system_file(&self, name: &str) -> Result<&VirtualFile> {
        self.root
            .files
            .iter()
            .find(|f| f.name == name)
            .ok_or(Error::Parse("system file missing from the tree"))
    }

    fn overlay_section<R: Read + Seek>(
        &self,
        src: &mut R,
        processor: Processor,
    ) -> Result<Option<OverlaySection>> {
        let (name, original) = match processor {
            Processor::Arm9 => ("overarm9.bin", &self.arm9_overlays),
            Processor::Arm7 => ("overarm7.bin", &self.arm7_overlays),
        };
        let Some(table_file) = self.root.files.iter().find(|f| f.name == name) else {
            return Ok(None);
        };
        let mut table = if table_file.is_redirected() {
            OverlayTable::from_bytes(processor, &table_file.read_contents(src)?)?
        } else {
            original.clone()
        };

        let dir = self.overlay_dir();
        let mut files = Vec::with_capacity(table.entries.len());
        for entry in &mut table.entries {
            let id = u16::try_from(entry.file_id).map_err(|_| Error::FileId(entry.file_id))?;
            let file = dir
                .and_then(|d| d.files.iter().find(|f| f.id == id))
                .ok_or(Error::FileId(entry.file_id))?;
            if self.fat.get(id).is_some_and(|a| a.size != file.size) {
                entry.patch_size(file.size);
            }
            files.push(file.clone());
        }
        Ok(Some(OverlaySection { table, files }))
    }

    /// Write a new image to `out`, reading unchanged data from `src`.
    ///
    /// `src` must be the image this `NdsRom` was decoded from. `out` should
    /// be empty; it is read back for checksums and hashes.
    pub fn rebuild<R, W>(
        &self,
        src: &mut R,
        out: &mut W,
        opts: &RebuildOptions<'_>,
    ) -> Result<RebuildReport>
    where
        R: Read + Seek,
        W: Read + Write + Seek,
    {
        let mut header = self.header.clone();
        let header_file = self.system_file("header.bin")?;
        if header_file.is_redirected() {
            let replacement = Header::from_bytes(header_file.read_contents(src)?)?;
            header.title = replacement.title;
            header.game_code = replacement.game_code;
            debug!("header.bin redirected, title now {}", header.game_title());
        }
        info!("rebuilding {} ({})", header.game_title(), header.game_code_str());

        let ov9 = self.overlay_section(src, Processor::Arm9)?;
        let ov7 = self.overlay_section(src, Processor::Arm7)?;

        let mut arm9 = self.system_file("arm9.bin")?.read_contents(src)?;
        if let (Some(twl), Some(section)) = (self.twl.state(), &ov9) {
            let contents = section
                .files
                .iter()
                .map(|f| f.read_contents(src))
                .collect::<Result<Vec<_>>>()?;
            if let Some(updated) = twl.refresh_overlay_hmacs(&arm9, &header, &contents)? {
                arm9 = updated;
            }
        }
        let arm7 = self.system_file("arm7.bin")?;
        let fnt = self.system_file("fnt.bin")?;

        let banner_file = self.system_file("banner.bin")?;
        let mut banner = if banner_file.is_redirected() {
            Some(Banner::from_bytes(banner_file.read_contents(src)?)?)
        } else {
            self.banner.clone()
        };
        if let Some(b) = &mut banner {
            b.update_crcs()?;
        }
        let banner_len = banner.as_ref().map_or(0, |b| b.len() as u32);

        // Plan.
        let start = align_up(
            (header.header_size as u64).max(header.raw.len() as u64),
            FILE_ALIGN,
        );
        let mut plan = SectionPlan::default();
        let mut pos = start;
        let mut take = |len: u64| {
            let at = pos;
            pos = align_up(pos + len, FILE_ALIGN);
            at as u32
        };
        plan.arm9 = take(arm9.len() as u64);
        if let Some(s) = &ov9 {
            plan.arm9_overlay_table = take(s.table.byte_len() as u64);
            plan.arm9_overlays = take(s.payload_span());
        }
        plan.arm7 = take(arm7.size as u64);
        if let Some(s) = &ov7 {
            plan.arm7_overlay_table = take(s.table.byte_len() as u64);
            plan.arm7_overlays = take(s.payload_span());
        }
        plan.fnt = take(fnt.size as u64);
        plan.fat = take(self.fat.len() as u64 * 8);
        plan.banner = take(0);
        plan.files = plan.banner + banner_space(banner_len) as u32;

        let layout = FatLayout {
            fat_offset: plan.fat,
            banner_size: banner_len,
            arm9_overlay_base: plan.arm9_overlays,
            arm7_overlay_base: plan.arm7_overlays,
            arm9_overlays: ov9.as_ref().map(OverlaySection::ids).unwrap_or_default(),
            arm7_overlays: ov7.as_ref().map(OverlaySection::ids).unwrap_or_default(),
        };
        let fat = self.fat.encode(&self.root, &layout);
        debug!("section plan: {plan:x?}");

        // Write.
        out.seek(SeekFrom::Start(0))?;
        fill_to(out, plan.arm9 as u64)?;
        out.write_all(&arm9)?;
        pad_to(out, FILE_ALIGN)?;
        let footer = if self.nitrocode && arm9.len() >= NITROCODE_FOOTER_LEN as usize {
            NITROCODE_FOOTER_LEN
        } else {
            0
        };
        header.arm9.rom_offset = plan.arm9;
        header.arm9.size = arm9.len() as u32 - footer;

        header.arm9_overlay_offset = 0;
        if let Some(s) = &ov9 {
            header.arm9_overlay_offset = plan.arm9_overlay_table;
            header.arm9_overlay_size = self.write_overlays(src, out, s, &fat.entries, plan.arm7)?;
        }

        fill_to(out, plan.arm7 as u64)?;
        arm7.write_to(src, out)?;
        pad_to(out, FILE_ALIGN)?;
        header.arm7.rom_offset = plan.arm7;
        header.arm7.size = arm7.size;

        header.arm7_overlay_offset = 0;
        if let Some(s) = &ov7 {
            header.arm7_overlay_offset = plan.arm7_overlay_table;
            header.arm7_overlay_size = self.write_overlays(src, out, s, &fat.entries, plan.fnt)?;
        }

        fill_to(out, plan.fnt as u64)?;
        fnt.write_to(src, out)?;
        pad_to(out, FILE_ALIGN)?;
        header.fnt_offset = plan.fnt;
        header.fnt_size = fnt.size;

        fill_to(out, plan.fat as u64)?;
        out.write_all(&fat.bytes)?;
        pad_to(out, FILE_ALIGN)?;
        header.fat_offset = plan.fat;
        header.fat_size = fat.bytes.len() as u32;

        fill_to(out, plan.banner as u64)?;
        header.banner_offset = match &banner {
            Some(b) => {
                out.write_all(&b.data)?;
                plan.banner
            }
            None => 0,
        };

        // Every file but the one holding the last allocation slot is padded,
        // even when that slot belongs to an overlay.
        let overlay_count = self.overlay_count();
        let last = self.fat.sorted_ids.len().saturating_sub(1);
        let mut written = 0usize;
        for (i, &id) in self.fat.sorted_ids.iter().enumerate() {
            if (id as usize) < overlay_count {
                continue;
            }
            let Some(file) = find_file(id, &self.root) else {
                continue;
            };
            let planned = fat.entries[id as usize].offset as u64;
            if out.stream_position()? > planned {
                return Err(Error::Parse("file does not land at its planned offset"));
            }
            fill_to(out, planned)?;
            file.write_to(src, out)?;
            if i < last {
                pad_to(out, FILE_ALIGN)?;
            }
            written += 1;
        }
        debug!("wrote {written} files from {:#x}", plan.files);

        let ntr_end = out.stream_position()?;
        header.rom_size = u32::try_from(ntr_end).map_err(|_| Error::InvalidRange)?;

        let mut master_hash = None;
        if let Some(twl) = self.twl.state().filter(|_| header.has_twl_region()) {
            let hash = twl.write(out, &header, opts.secure_area_cipher)?;
            if let Some(t) = header.twl.as_mut() {
                t.hmac_digest_master = hash;
            }
            master_hash = Some(hash);
        } else if let Some(sig) = &self.multiboot_signature {
            out.write_all(sig)?;
        }

        // Capacity is sized from the NTR and DSi regions only. A multiboot
        // signature crossing it is kept past the padding.
        let end = out.stream_position()?;
        let used = if master_hash.is_some() { end } else { ntr_end };
        let capacity = used.next_power_of_two().max(MIN_IMAGE_SIZE);
        if end < capacity {
            fill_to(out, capacity)?;
        }
        let image_size = end.max(capacity);
        header.capacity = (capacity.trailing_zeros() - MIN_IMAGE_SIZE.trailing_zeros()) as u8;

        let area = read_at(out, SECURE_AREA_OFFSET, SECURE_AREA_SIZE)?;
        header.secure_area_crc =
            secure_area_crc(&area, &header.game_code, opts.secure_area_cipher)?;

        let mut outcome = None;
        if let Some(hash) = master_hash {
            let signed = header.signed_bytes(&hash)?;
            let current = header
                .twl
                .as_ref()
                .map_or([0u8; SIGNATURE_LEN], |t| t.rsa_signature);
            let (sig, how) = signature::resolve(
                &signed,
                &current,
                opts.signing_key.as_ref(),
                opts.keep_original_signature,
            )?;
            if let Some(t) = header.twl.as_mut() {
                t.rsa_signature = sig;
            }
            debug!("header signature: {how:?}");
            outcome = Some(how);
        }

        let header_bytes = header.to_bytes()?;
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&header_bytes)?;
        out.seek(SeekFrom::Start(image_size))?;

        info!(
            "rebuilt image: rom size {:#x}, image {:#x}, {} FAT holes",
            header.rom_size, image_size, fat.holes
        );
        Ok(RebuildReport {
            plan,
            fat_holes: fat.holes,
            rom_size: header.rom_size,
            image_size,
            master_hash,
            signature: outcome,
        })
    }

    /// Write an overlay table and its payloads, ending at `next`. Returns the
    /// table length for the header.
    fn write_overlays<R: Read + Seek, W: Write + Seek>(
        &self,
        src: &mut R,
        out: &mut W,
        section: &OverlaySection,
        planned: &[AllocationEntry],
        next: u32,
    ) -> Result<u32> {
        let table_len = section.table.write(out)?;
        for &id in &self.fat.sorted_ids {
            let Some(file) = section.files.iter().find(|f| f.id == id) else {
                continue;
            };
            fill_to(out, planned[id as usize].offset as u64)?;
            file.write_to(src, out)?;
        }
        fill_to(out, next as u64)?;
        Ok(table_len)
    }

    /// Rebuild the image at `src` into a new file at `dest`.
    pub fn save_as(
        &self,
        src: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        opts: &RebuildOptions<'_>,
    ) -> Result<RebuildReport> {
        let src = src.as_ref();
        let dest = dest.as_ref();
        let input = File::open(src).map_err(|e| Error::Open(src.to_path_buf(), e))?;
        let mut output = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)
            .map_err(|e| Error::Open(dest.to_path_buf(), e))?;
        self.rebuild(&mut BufReader::new(input), &mut output, opts)
    }
}
