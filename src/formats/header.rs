//! Cartridge header.
//!
//! ## NTR Layout (common to every DS image)
//! ```text
//! [0x000] GameTitle                (12 bytes, ASCII, NUL padded)
//! [0x00C] GameCode                 (4 bytes)
//! [0x010] MakerCode                (2 bytes)
//! [0x012] UnitCode                 (u8; bit1 = DSi-enhanced)
//! [0x013] EncryptionSeedSelect     (u8)
//! [0x014] DeviceCapacity           (u8; image size = 128 KiB << n)
//! [0x015] Reserved                 (9 bytes; 0x1C = TWL internal flags)
//! [0x01E] RomVersion               (u8)
//! [0x01F] Autostart                (u8)
//! [0x020] Arm9 RomOffset/Entry/RamAddress/Size   (4 × u32 LE)
//! [0x030] Arm7 RomOffset/Entry/RamAddress/Size   (4 × u32 LE)
//! [0x040] FntOffset, FntSize                     (2 × u32 LE)
//! [0x048] FatOffset, FatSize                     (2 × u32 LE)
//! [0x050] Arm9OverlayOffset, Arm9OverlaySize     (2 × u32 LE)
//! [0x058] Arm7OverlayOffset, Arm7OverlaySize     (2 × u32 LE)
//! [0x060] CardControl normal / KEY1              (2 × u32 LE)
//! [0x068] BannerOffset             (u32 LE)
//! [0x06C] SecureAreaCrc            (u16 LE; CRC16 of 0x4000..0x8000)
//! [0x06E] SecureAreaDelay          (u16 LE)
//! [0x070] Arm9 / Arm7 autoload callbacks         (2 × u32 LE)
//! [0x078] SecureAreaDisable        (u64 LE)
//! [0x080] RomSize                  (u32 LE; end of the NTR region)
//! [0x084] HeaderSize               (u32 LE)
//! [0x088] Arm9ModuleParamsOffset   (u32 LE; low 14 bits used)
//! [0x0C0] NintendoLogo             (0x9C bytes)
//! [0x15C] LogoCrc                  (u16 LE; CRC16 of 0xC0..0x15C)
//! [0x15E] HeaderCrc                (u16 LE; CRC16 of 0x000..0x15E)
//! [0x160] Debug rom offset / size / ram address  (3 × u32 LE)
//! ```
//!
//! ## TWL extension (unit code bit1 set, header ≥ 0x1000 bytes)
//! ```text
//! [0x1BC] AppFlags                 (4 bytes)
//! [0x1C0] Arm9i RomOffset, _, RamAddress, Size   (4 × u32 LE)
//! [0x1D0] Arm7i RomOffset, _, RamAddress, Size   (4 × u32 LE)
//! [0x1E0] DigestNtr Start, Size    (2 × u32 LE)
//! [0x1E8] DigestTwl Start, Size    (2 × u32 LE)
//! [0x1F0] SectorHashtable Start, Size            (2 × u32 LE)
//! [0x1F8] BlockHashtable Start, Size             (2 × u32 LE)
//! [0x200] DigestSectorSize         (u32 LE)
//! [0x204] DigestBlockSectorCount   (u32 LE)
//! [0x208] BannerSize               (u32 LE)
//! [0x210] TotalRomSize             (u32 LE)
//! [0x220] Modcrypt1 Start, Size    (2 × u32 LE)
//! [0x228] Modcrypt2 Start, Size    (2 × u32 LE)
//! [0x230] TitleId low, high        (2 × u32 LE)
//! [0x300] Arm9 HMAC (with secure area)           (20 bytes)
//! [0x314] Arm7 HMAC                (20 bytes)
//! [0x328] Digest master HMAC       (20 bytes)
//! [0x33C] Banner HMAC              (20 bytes)
//! [0x350] Arm9i HMAC               (20 bytes)
//! [0x364] Arm7i HMAC               (20 bytes)
//! [0x3A0] Arm9 HMAC (without secure area)        (20 bytes)
//! [0xF80] RSA-1024 signature over 0x000..0xE00   (0x80 bytes)
//! ```
//!
//! Only the fields the container rebuild touches are typed. Everything else
//! is carried through [`Header::raw`] untouched.

use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::checksum::crc16;
use crate::crypto::signature::{SIGNATURE_LEN, SIGNED_LEN};
use crate::utils::{bytesa, bytesv, get_u32, le_u16, le_u32, put_u16, put_u32, u8};
use crate::{Error, Result};

/// Minimum header size handled; shorter headers are zero-extended.
pub const MIN_HEADER_SIZE: usize = 0x200;
/// Header bytes covered by the header CRC.
pub const HEADER_CRC_LEN: usize = 0x15E;
/// Offset of the Nintendo logo.
pub const LOGO_OFFSET: usize = 0xC0;
/// Size of the Nintendo logo.
pub const LOGO_LEN: usize = 0x9C;
/// Smallest header that can carry the TWL extension.
pub const TWL_HEADER_SIZE: usize = 0x1000;
/// Offset of the digest master hash inside the header.
pub const MASTER_HASH_OFFSET: usize = 0x328;
/// Offset of the RSA signature inside the header.
pub const SIGNATURE_OFFSET: usize = 0xF80;

const MAX_HEADER_SIZE: u32 = 0x10000;

/// Location of one boot binary (ARM9, ARM7, ARM9i or ARM7i).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryInfo {
    /// Absolute offset in the image.
    pub rom_offset: u32,
    /// Entry point (zero for the TWL binaries).
    pub entry_address: u32,
    /// Load address.
    pub ram_address: u32,
    /// Size in bytes.
    pub size: u32,
}

/// DSi header extension.
#[derive(Debug, Clone)]
pub struct TwlHeader {
    pub app_flags: [u8; 4],
    pub arm9i: BinaryInfo,
    pub arm7i: BinaryInfo,
    pub digest_ntr_start: u32,
    pub digest_ntr_size: u32,
    pub digest_twl_start: u32,
    pub digest_twl_size: u32,
    pub sector_hashtable_start: u32,
    pub sector_hashtable_size: u32,
    pub block_hashtable_start: u32,
    pub block_hashtable_size: u32,
    pub digest_sector_size: u32,
    pub digest_block_sectorcount: u32,
    /// Size of the DSi banner (zero on some titles; see
    /// [`crate::formats::banner`]).
    pub banner_size: u32,
    pub total_rom_size: u32,
    pub modcrypt1_start: u32,
    pub modcrypt1_size: u32,
    pub modcrypt2_start: u32,
    pub modcrypt2_size: u32,
    pub title_id_low: u32,
    pub title_id_high: u32,
    pub hmac_arm9: [u8; 20],
    pub hmac_arm7: [u8; 20],
    pub hmac_digest_master: [u8; 20],
    pub hmac_banner: [u8; 20],
    pub hmac_arm9i: [u8; 20],
    pub hmac_arm7i: [u8; 20],
    pub hmac_arm9_no_secure: [u8; 20],
    pub rsa_signature: [u8; SIGNATURE_LEN],
}

impl Default for TwlHeader {
    fn default() -> Self {
        Self {
            app_flags: Default::default(),
            arm9i: Default::default(),
            arm7i: Default::default(),
            digest_ntr_start: Default::default(),
            digest_ntr_size: Default::default(),
            digest_twl_start: Default::default(),
            digest_twl_size: Default::default(),
            sector_hashtable_start: Default::default(),
            sector_hashtable_size: Default::default(),
            block_hashtable_start: Default::default(),
            block_hashtable_size: Default::default(),
            digest_sector_size: Default::default(),
            digest_block_sectorcount: Default::default(),
            banner_size: Default::default(),
            total_rom_size: Default::default(),
            modcrypt1_start: Default::default(),
            modcrypt1_size: Default::default(),
            modcrypt2_start: Default::default(),
            modcrypt2_size: Default::default(),
            title_id_low: Default::default(),
            title_id_high: Default::default(),
            hmac_arm9: Default::default(),
            hmac_arm7: Default::default(),
            hmac_digest_master: Default::default(),
            hmac_banner: Default::default(),
            hmac_arm9i: Default::default(),
            hmac_arm7i: Default::default(),
            hmac_arm9_no_secure: Default::default(),
            rsa_signature: [0; SIGNATURE_LEN],
        }
    }
}

impl TwlHeader {
    fn parse(raw: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(raw);
        r.seek(SeekFrom::Start(0x1BC))?;

        let app_flags = bytesa::<4>(&mut r)?;
        let arm9i = read_binary(&mut r)?;
        let arm7i = read_binary(&mut r)?;
        let digest_ntr_start = le_u32(&mut r)?;
        let digest_ntr_size = le_u32(&mut r)?;
        let digest_twl_start = le_u32(&mut r)?;
        let digest_twl_size = le_u32(&mut r)?;
        let sector_hashtable_start = le_u32(&mut r)?;
        let sector_hashtable_size = le_u32(&mut r)?;
        let block_hashtable_start = le_u32(&mut r)?;
        let block_hashtable_size = le_u32(&mut r)?;
        let digest_sector_size = le_u32(&mut r)?;
        let digest_block_sectorcount = le_u32(&mut r)?;
        let banner_size = le_u32(&mut r)?;
        // 0x20C: reserved
        let _ = le_u32(&mut r)?;
        let total_rom_size = le_u32(&mut r)?;

        r.seek(SeekFrom::Start(0x220))?;
        let modcrypt1_start = le_u32(&mut r)?;
        let modcrypt1_size = le_u32(&mut r)?;
        let modcrypt2_start = le_u32(&mut r)?;
        let modcrypt2_size = le_u32(&mut r)?;
        let title_id_low = le_u32(&mut r)?;
        let title_id_high = le_u32(&mut r)?;

        r.seek(SeekFrom::Start(0x300))?;
        let hmac_arm9 = bytesa::<20>(&mut r)?;
        let hmac_arm7 = bytesa::<20>(&mut r)?;
        let hmac_digest_master = bytesa::<20>(&mut r)?;
        let hmac_banner = bytesa::<20>(&mut r)?;
        let hmac_arm9i = bytesa::<20>(&mut r)?;
        let hmac_arm7i = bytesa::<20>(&mut r)?;

        r.seek(SeekFrom::Start(0x3A0))?;
        let hmac_arm9_no_secure = bytesa::<20>(&mut r)?;

        r.seek(SeekFrom::Start(SIGNATURE_OFFSET as u64))?;
        let rsa_signature = bytesa::<SIGNATURE_LEN>(&mut r)?;

        Ok(Self {
            app_flags,
            arm9i,
            arm7i,
            digest_ntr_start,
            digest_ntr_size,
            digest_twl_start,
            digest_twl_size,
            sector_hashtable_start,
            sector_hashtable_size,
            block_hashtable_start,
            block_hashtable_size,
            digest_sector_size,
            digest_block_sectorcount,
            banner_size,
            total_rom_size,
            modcrypt1_start,
            modcrypt1_size,
            modcrypt2_start,
            modcrypt2_size,
            title_id_low,
            title_id_high,
            hmac_arm9,
            hmac_arm7,
            hmac_digest_master,
            hmac_banner,
            hmac_arm9i,
            hmac_arm7i,
            hmac_arm9_no_secure,
            rsa_signature,
        })
    }

    fn write(&self, raw: &mut [u8]) -> Result<()> {
        raw[0x1BC..0x1C0].copy_from_slice(&self.app_flags);
        write_binary(raw, 0x1C0, &self.arm9i)?;
        write_binary(raw, 0x1D0, &self.arm7i)?;
        let words = [
            (0x1E0, self.digest_ntr_start),
            (0x1E4, self.digest_ntr_size),
            (0x1E8, self.digest_twl_start),
            (0x1EC, self.digest_twl_size),
            (0x1F0, self.sector_hashtable_start),
            (0x1F4, self.sector_hashtable_size),
            (0x1F8, self.block_hashtable_start),
            (0x1FC, self.block_hashtable_size),
            (0x200, self.digest_sector_size),
            (0x204, self.digest_block_sectorcount),
            (0x208, self.banner_size),
            (0x210, self.total_rom_size),
            (0x220, self.modcrypt1_start),
            (0x224, self.modcrypt1_size),
            (0x228, self.modcrypt2_start),
            (0x22C, self.modcrypt2_size),
            (0x230, self.title_id_low),
            (0x234, self.title_id_high),
        ];
        for (offset, v) in words {
            put_u32(raw, offset, v)?;
        }
        let hashes = [
            (0x300, &self.hmac_arm9),
            (0x314, &self.hmac_arm7),
            (MASTER_HASH_OFFSET, &self.hmac_digest_master),
            (0x33C, &self.hmac_banner),
            (0x350, &self.hmac_arm9i),
            (0x364, &self.hmac_arm7i),
            (0x3A0, &self.hmac_arm9_no_secure),
        ];
        for (offset, h) in hashes {
            raw[offset..offset + 20].copy_from_slice(h);
        }
        raw[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_LEN].copy_from_slice(&self.rsa_signature);
        Ok(())
    }

    /// DSi title ids live in the `0x0003xxxx` high word.
    pub fn title_id_valid(&self) -> bool {
        self.title_id_high >> 16 == 0x0003
    }
}

/// Parsed cartridge header.
#[derive(Debug, Clone)]
pub struct Header {
    pub title: [u8; 12],
    pub game_code: [u8; 4],
    pub maker_code: [u8; 2],
    pub unit_code: u8,
    pub encryption_seed: u8,
    /// Device capacity exponent; the image is `128 KiB << capacity`.
    pub capacity: u8,
    /// TWL internal flags (0x1C). Bit0 = TWL region present, bit1 =
    /// modcrypt enabled, bit2 = debug modcrypt key.
    pub twl_flags: u8,
    pub version: u8,
    pub autostart: u8,
    pub arm9: BinaryInfo,
    pub arm7: BinaryInfo,
    pub fnt_offset: u32,
    pub fnt_size: u32,
    pub fat_offset: u32,
    pub fat_size: u32,
    pub arm9_overlay_offset: u32,
    pub arm9_overlay_size: u32,
    pub arm7_overlay_offset: u32,
    pub arm7_overlay_size: u32,
    pub banner_offset: u32,
    pub secure_area_crc: u16,
    /// End of the NTR region ("used ROM size").
    pub rom_size: u32,
    pub header_size: u32,
    pub logo_crc: u16,
    pub header_crc: u16,
    /// DSi extension, present on DSi-enhanced and DSi-exclusive titles.
    pub twl: Option<TwlHeader>,
    /// Header bytes as read; fields not typed above pass through from here.
    pub raw: Vec<u8>,
}

fn read_binary<R: Read>(r: &mut R) -> Result<BinaryInfo> {
    let rom_offset = le_u32(r)?;
    let entry_address = le_u32(r)?;
    let ram_address = le_u32(r)?;
    let size = le_u32(r)?;
    Ok(BinaryInfo {
        rom_offset,
        entry_address,
        ram_address,
        size,
    })
}

fn write_binary(raw: &mut [u8], offset: usize, b: &BinaryInfo) -> Result<()> {
    put_u32(raw, offset, b.rom_offset)?;
    put_u32(raw, offset + 4, b.entry_address)?;
    put_u32(raw, offset + 8, b.ram_address)?;
    put_u32(raw, offset + 12, b.size)
}

impl Header {
    /// Parse the header at the start of `r`.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        r.seek(SeekFrom::Start(0))?;
        let mut raw = bytesv(r, MIN_HEADER_SIZE)?;
        let header_size = get_u32(&raw, 0x84)?;
        if header_size > MAX_HEADER_SIZE {
            return Err(Error::Parse("header size out of range"));
        }
        if header_size as usize > MIN_HEADER_SIZE {
            raw.extend(bytesv(r, header_size as usize - MIN_HEADER_SIZE)?);
        }
        Self::from_bytes(raw)
    }

    /// Build a header from its raw bytes.
    pub fn from_bytes(mut raw: Vec<u8>) -> Result<Self> {
        if raw.len() < MIN_HEADER_SIZE {
            raw.resize(MIN_HEADER_SIZE, 0);
        }
        let mut r = Cursor::new(&raw[..]);

        let title = bytesa::<12>(&mut r)?;
        let game_code = bytesa::<4>(&mut r)?;
        let maker_code = bytesa::<2>(&mut r)?;
        let unit_code = u8(&mut r)?;
        let encryption_seed = u8(&mut r)?;
        let capacity = u8(&mut r)?;
        // 0x15: reserved, 0x1C inside it carries the TWL flags
        let reserved = bytesa::<9>(&mut r)?;
        let twl_flags = reserved[7];
        let version = u8(&mut r)?;
        let autostart = u8(&mut r)?;
        let arm9 = read_binary(&mut r)?;
        let arm7 = read_binary(&mut r)?;
        let fnt_offset = le_u32(&mut r)?;
        let fnt_size = le_u32(&mut r)?;
        let fat_offset = le_u32(&mut r)?;
        let fat_size = le_u32(&mut r)?;
        let arm9_overlay_offset = le_u32(&mut r)?;
        let arm9_overlay_size = le_u32(&mut r)?;
        let arm7_overlay_offset = le_u32(&mut r)?;
        let arm7_overlay_size = le_u32(&mut r)?;
        // 0x60: card control registers
        let _ = bytesa::<8>(&mut r)?;
        let banner_offset = le_u32(&mut r)?;
        let secure_area_crc = le_u16(&mut r)?;

        r.seek(SeekFrom::Start(0x80))?;
        let rom_size = le_u32(&mut r)?;
        let header_size = le_u32(&mut r)?;

        r.seek(SeekFrom::Start(0x15C))?;
        let logo_crc = le_u16(&mut r)?;
        let header_crc = le_u16(&mut r)?;

        let twl = if unit_code & 0x02 != 0 && raw.len() >= TWL_HEADER_SIZE {
            Some(TwlHeader::parse(&raw)?)
        } else {
            None
        };

        Ok(Self {
            title,
            game_code,
            maker_code,
            unit_code,
            encryption_seed,
            capacity,
            twl_flags,
            version,
            autostart,
            arm9,
            arm7,
            fnt_offset,
            fnt_size,
            fat_offset,
            fat_size,
            arm9_overlay_offset,
            arm9_overlay_size,
            arm7_overlay_offset,
            arm7_overlay_size,
            banner_offset,
            secure_area_crc,
            rom_size,
            header_size,
            logo_crc,
            header_crc,
            twl,
            raw,
        })
    }

    /// Serialize with every typed field patched in and both header CRCs
    /// recomputed. `logo_crc` and `header_crc` are updated to match.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut raw = self.raw.clone();

        raw[0x00..0x0C].copy_from_slice(&self.title);
        raw[0x0C..0x10].copy_from_slice(&self.game_code);
        raw[0x10..0x12].copy_from_slice(&self.maker_code);
        raw[0x12] = self.unit_code;
        raw[0x13] = self.encryption_seed;
        raw[0x14] = self.capacity;
        raw[0x1C] = self.twl_flags;
        raw[0x1E] = self.version;
        raw[0x1F] = self.autostart;
        write_binary(&mut raw, 0x20, &self.arm9)?;
        write_binary(&mut raw, 0x30, &self.arm7)?;
        let words = [
            (0x40, self.fnt_offset),
            (0x44, self.fnt_size),
            (0x48, self.fat_offset),
            (0x4C, self.fat_size),
            (0x50, self.arm9_overlay_offset),
            (0x54, self.arm9_overlay_size),
            (0x58, self.arm7_overlay_offset),
            (0x5C, self.arm7_overlay_size),
            (0x68, self.banner_offset),
            (0x80, self.rom_size),
            (0x84, self.header_size),
        ];
        for (offset, v) in words {
            put_u32(&mut raw, offset, v)?;
        }
        put_u16(&mut raw, 0x6C, self.secure_area_crc)?;

        if let Some(twl) = &self.twl {
            twl.write(&mut raw)?;
        }

        self.logo_crc = crc16(&raw[LOGO_OFFSET..LOGO_OFFSET + LOGO_LEN]);
        put_u16(&mut raw, 0x15C, self.logo_crc)?;
        self.header_crc = crc16(&raw[..HEADER_CRC_LEN]);
        put_u16(&mut raw, 0x15E, self.header_crc)?;
        Ok(raw)
    }

    /// Whether the stored header CRC matches the bytes as read.
    pub fn header_crc_ok(&self) -> bool {
        crc16(&self.raw[..HEADER_CRC_LEN]) == self.header_crc
    }

    /// Whether the stored logo CRC matches the bytes as read.
    pub fn logo_crc_ok(&self) -> bool {
        crc16(&self.raw[LOGO_OFFSET..LOGO_OFFSET + LOGO_LEN]) == self.logo_crc
    }

    /// Game title with trailing NULs removed.
    pub fn game_title(&self) -> String {
        let end = self.title.iter().position(|&b| b == 0).unwrap_or(12);
        String::from_utf8_lossy(&self.title[..end]).into_owned()
    }

    /// Four-character game code.
    pub fn game_code_str(&self) -> String {
        String::from_utf8_lossy(&self.game_code).into_owned()
    }

    /// Offset of the ARM9 module parameters inside the ARM9 binary, or 0.
    pub fn module_params_offset(&self) -> u32 {
        get_u32(&self.raw, 0x88).map(|v| v & 0x3FFF).unwrap_or(0)
    }

    /// Unit code flags a DSi-enhanced title and the TWL region bit is set.
    pub fn has_twl_region(&self) -> bool {
        self.unit_code & 0x02 != 0 && self.twl_flags & 0x01 != 0
    }

    /// Header bytes covered by the RSA signature, with `master_hash`
    /// spliced in.
    pub fn signed_bytes(&mut self, master_hash: &[u8; 20]) -> Result<Vec<u8>> {
        let mut raw = self.to_bytes()?;
        if raw.len() < SIGNED_LEN {
            return Err(Error::Crypto("header too short to be signed"));
        }
        raw.truncate(SIGNED_LEN);
        raw[MASTER_HASH_OFFSET..MASTER_HASH_OFFSET + 20].copy_from_slice(master_hash);
        Ok(raw)
    }
}
