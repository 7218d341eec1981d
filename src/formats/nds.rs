//! NDS/DSi cartridge image, decoded into a virtual file tree.
//!
//! ## Image layout (as produced by [`NdsRom::rebuild`])
//! ```text
//! [0x0000]  Header                  (HeaderSize bytes, usually 0x4000)
//! [..]      ARM9 binary             (+ 12-byte nitrocode footer)
//! [..]      ARM9 overlay table, ARM9 overlays
//! [..]      ARM7 binary
//! [..]      ARM7 overlay table, ARM7 overlays
//! [..]      FNT
//! [..]      FAT
//! [..]      Banner
//! [..]      Files, in allocation order
//! [RomSize] Multiboot signature (0x88 bytes, optional) or the DSi region
//! [..]      0xFF up to the device capacity
//! ```
//! Every section starts on a 0x200 boundary.
//!
//! ## Tree
//! ```text
//! root/
//!   header.bin banner.bin fnt.bin fat.bin arm9.bin arm7.bin
//!   overarm9.bin overarm7.bin          (when the tables are non-empty)
//!   data/                              (the name table's root)
//!   overlay/overlay_NNNN.bin overlay7_NNNN.bin
//! ```
//! Synthetic files carry id `0xFFFF` and address the source image directly.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Take};
use std::ops::Index;
use std::path::Path;

use log::{info, warn};

use super::banner::Banner;
use super::fat::AllocationTable;
use super::fnt::{NameTable, VirtualDirectory, VirtualFile};
use super::header::Header;
use super::overlay::{OverlayTable, Processor};
use super::twl::TwlState;
use crate::checksum::crc16;
use crate::crypto::secure_area::{SECURE_AREA_OFFSET, SECURE_AREA_SIZE, is_decrypted};
use crate::crypto::signature::{self, SIGNED_LEN};
use crate::utils::read_at;
use crate::{Error, Result};

/// Size of the wireless multiboot signature after the NTR region.
pub const MULTIBOOT_SIGNATURE_LEN: usize = 0x88;
/// Length of the footer that follows some ARM9 binaries.
pub const NITROCODE_FOOTER_LEN: u32 = 12;

const NITROCODE_MAGIC: u32 = 0xDEC0_0621;

/// Outcome of decoding the DSi region.
#[derive(Debug)]
pub enum TwlSupport {
    /// Not a DSi-enhanced image.
    Absent,
    /// DSi region decoded.
    Present(Box<TwlState>),
    /// DSi-flagged, but the region could not be decoded. The image is
    /// handled as NTR-only.
    Unsupported(Error),
}

impl TwlSupport {
    pub fn state(&self) -> Option<&TwlState> {
        match self {
            Self::Present(s) => Some(s),
            _ => None,
        }
    }

    pub fn state_mut(&mut self) -> Option<&mut TwlState> {
        match self {
            Self::Present(s) => Some(s),
            _ => None,
        }
    }
}

/// Checksums and signature as found in the source image. Mismatches never
/// stop decoding.
#[derive(Debug, Clone, Default)]
pub struct Integrity {
    pub header_crc: bool,
    pub logo_crc: bool,
    /// [`None`] when the secure area is stored decrypted or missing.
    pub secure_area_crc: Option<bool>,
    /// One flag per banner CRC field.
    pub banner_crcs: Vec<bool>,
    /// [`None`] for images without a DSi header.
    pub rsa_signature: Option<bool>,
}

/// A decoded cartridge image.
#[derive(Debug)]
pub struct NdsRom {
    pub header: Header,
    pub banner: Option<Banner>,
    pub fat: AllocationTable,
    pub fnt: NameTable,
    pub arm9_overlays: OverlayTable,
    pub arm7_overlays: OverlayTable,
    /// File tree. Redirect files here before calling [`NdsRom::rebuild`].
    pub root: VirtualDirectory,
    pub twl: TwlSupport,
    pub integrity: Integrity,
    /// A nitrocode footer follows the ARM9 binary.
    pub nitrocode: bool,
    /// The secure area is stored decrypted.
    pub secure_area_decrypted: bool,
    /// Multiboot signature found right after the NTR region.
    pub multiboot_signature: Option<Vec<u8>>,
}

impl NdsRom {
    /// Decode an image.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let header = Header::parse(r)?;
        info!(
            "decoding {} ({}), header {:#x} bytes",
            header.game_title(),
            header.game_code_str(),
            header.header_size
        );

        let banner = if header.banner_offset != 0 {
            let twl_banner_size = header.twl.as_ref().map(|t| t.banner_size);
            Some(Banner::parse(r, header.banner_offset as u64, twl_banner_size)?)
        } else {
            None
        };

        let fat = AllocationTable::parse(r, header.fat_offset as u64, header.fat_size)?;
        let fnt = NameTable::parse(r, header.fnt_offset as u64, fat.len())?;
        let arm9_overlays = OverlayTable::parse(
            r,
            Processor::Arm9,
            header.arm9_overlay_offset as u64,
            header.arm9_overlay_size,
        )?;
        let arm7_overlays = OverlayTable::parse(
            r,
            Processor::Arm7,
            header.arm7_overlay_offset as u64,
            header.arm7_overlay_size,
        )?;

        let mut root = fnt.to_tree(&fat.entries)?;
        let ov9_files = arm9_overlays.to_files(&fat)?;
        let mut overlay = VirtualDirectory::named("overlay");
        overlay.files.extend(ov9_files.iter().cloned());
        overlay.files.extend(arm7_overlays.to_files(&fat)?);
        root.dirs.push(overlay);

        let nitrocode = read_at(r, header.arm9.rom_offset as u64 + header.arm9.size as u64, 4)
            .ok()
            .is_some_and(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) == NITROCODE_MAGIC);

        let mut system = vec![
            VirtualFile::synthetic("header.bin", 0, header.header_size),
            VirtualFile::synthetic(
                "banner.bin",
                header.banner_offset,
                banner.as_ref().map_or(0, |b| b.len() as u32),
            ),
            VirtualFile::synthetic("fnt.bin", header.fnt_offset, header.fnt_size),
            VirtualFile::synthetic("fat.bin", header.fat_offset, header.fat_size),
            VirtualFile::synthetic(
                "arm9.bin",
                header.arm9.rom_offset,
                header.arm9.size + if nitrocode { NITROCODE_FOOTER_LEN } else { 0 },
            ),
            VirtualFile::synthetic("arm7.bin", header.arm7.rom_offset, header.arm7.size),
        ];
        if header.arm9_overlay_size != 0 {
            system.push(VirtualFile::synthetic(
                "overarm9.bin",
                header.arm9_overlay_offset,
                header.arm9_overlay_size,
            ));
        }
        if header.arm7_overlay_size != 0 {
            system.push(VirtualFile::synthetic(
                "overarm7.bin",
                header.arm7_overlay_offset,
                header.arm7_overlay_size,
            ));
        }
        root.files.extend(system);

        let secure_area = read_at(r, SECURE_AREA_OFFSET, SECURE_AREA_SIZE).ok();
        let secure_area_decrypted = secure_area.as_deref().is_some_and(is_decrypted);
        let multiboot_signature = read_at(r, header.rom_size as u64, MULTIBOOT_SIGNATURE_LEN)
            .ok()
            .filter(|s| s.starts_with(b"ac"));

        let twl = if header.has_twl_region()
            && header.twl.as_ref().is_some_and(|t| t.title_id_valid())
        {
            match TwlState::parse(r, &header, &ov9_files) {
                Ok(state) => TwlSupport::Present(Box::new(state)),
                Err(e) => {
                    warn!("DSi region could not be decoded, continuing as NTR-only: {e}");
                    TwlSupport::Unsupported(e)
                }
            }
        } else {
            TwlSupport::Absent
        };

        let integrity = Integrity {
            header_crc: header.header_crc_ok(),
            logo_crc: header.logo_crc_ok(),
            secure_area_crc: secure_area
                .filter(|a| !is_decrypted(a))
                .map(|a| crc16(&a) == header.secure_area_crc),
            banner_crcs: banner.as_ref().map(Banner::verify).unwrap_or_default(),
            rsa_signature: header.twl.as_ref().and_then(|t| {
                let signed = header.raw.get(..SIGNED_LEN)?;
                signature::verify(signed, &t.rsa_signature).ok()
            }),
        };
        if !integrity.header_crc {
            warn!("header CRC mismatch");
        }

        info!(
            "decoded {} files, {} ARM9 and {} ARM7 overlays",
            fat.len(),
            arm9_overlays.entries.len(),
            arm7_overlays.entries.len()
        );

        Ok(Self {
            header,
            banner,
            fat,
            fnt,
            arm9_overlays,
            arm7_overlays,
            root,
            twl,
            integrity,
            nitrocode,
            secure_area_decrypted,
            multiboot_signature,
        })
    }

    /// Open and decode an image on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| Error::Open(path.to_path_buf(), e))?;
        Self::parse(&mut BufReader::new(f))
    }

    /// Look up a file by `/`-separated path, e.g. `"data/sound/bgm.sdat"`.
    pub fn file(&self, path: &str) -> Option<&VirtualFile> {
        self.root.file(path)
    }

    /// Mutable lookup, for redirecting a file before a rebuild.
    pub fn file_mut(&mut self, path: &str) -> Option<&mut VirtualFile> {
        self.root.file_mut(path)
    }

    /// The "overlay" folder.
    pub fn overlay_dir(&self) -> Option<&VirtualDirectory> {
        self.root.dir("overlay")
    }

    /// Number of files in the "overlay" folder.
    pub fn overlay_count(&self) -> usize {
        self.overlay_dir().map_or(0, |d| d.files.len())
    }

    /// Every file in the tree, synthetic ones included.
    pub fn files(&self) -> Vec<&VirtualFile> {
        self.root.walk()
    }

    /// Replace the ARM9i binary of a decoded DSi region. See
    /// [`TwlState::import`].
    pub fn replace_arm9i(&mut self, data: Vec<u8>) -> Result<()> {
        self.import_twl_binary(Processor::Arm9, data)
    }

    /// Replace the ARM7i binary of a decoded DSi region.
    pub fn replace_arm7i(&mut self, data: Vec<u8>) -> Result<()> {
        self.import_twl_binary(Processor::Arm7, data)
    }

    fn import_twl_binary(&mut self, processor: Processor, data: Vec<u8>) -> Result<()> {
        let state = self
            .twl
            .state_mut()
            .ok_or(Error::Parse("image has no decoded DSi region"))?;
        state.import(&mut self.header, processor, data)
    }
}

/// Streaming reader over a decoded image.
///
/// Hands out bounded readers over the source image; redirected files still
/// read their original bytes here.
pub struct NdsReader<R> {
    inner: R,
    /// Decoded image.
    pub rom: NdsRom,
}

impl<R: Read + Seek> NdsReader<R> {
    /// Decode `reader` and keep it for data access.
    pub fn new(mut reader: R) -> Result<Self> {
        let rom = NdsRom::parse(&mut reader)?;
        Ok(Self { inner: reader, rom })
    }

    /// Seek to `file` and return a reader limited to its bytes.
    pub fn read_file(&mut self, file: &VirtualFile) -> Result<Take<&mut R>> {
        self.inner.seek(SeekFrom::Start(file.offset as u64))?;
        Ok(self.inner.by_ref().take(file.size as u64))
    }

    /// Read a whole file by path.
    pub fn read_path(&mut self, path: &str) -> Result<Vec<u8>> {
        let file = self.rom.file(path).ok_or(Error::Parse("no such file"))?.clone();
        file.read_contents(&mut self.inner)
    }

    /// Consume the reader, returning the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Index<&str> for NdsReader<R> {
    type Output = VirtualFile;

    /// Index by path.
    ///
    /// # Panics
    /// Panics if the path does not exist in the tree.
    fn index(&self, index: &str) -> &Self::Output {
        self.rom
            .file(index)
            .unwrap_or_else(|| panic!("no file '{index}' in image"))
    }
}
