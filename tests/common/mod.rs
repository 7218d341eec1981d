//! Synthetic cartridge images for the integration tests.
//!
//! Images are laid out the way a rebuild lays them out, so a rebuild of an
//! unmodified NTR fixture reproduces it byte for byte.

#![allow(dead_code)]

use nitrokit::checksum::crc16;
use nitrokit::crypto::digest::{block_hashes, master_hash, sector_hashes};
use nitrokit::crypto::modcrypt;
use nitrokit::formats::header::Header;

pub const HEADER_SIZE: usize = 0x4000;
pub const ARM9_RAM: u32 = 0x0200_0000;
pub const COMPRESSED_FLAG: u32 = 0x0100_0000;
pub const NITROCODE: u32 = 0xDEC0_0621;

pub const FILE_NAMES: [&str; 3] = ["data/a.bin", "data/b.txt", "data/sub/c.dat"];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn align(v: usize) -> usize {
    (v + 0x1FF) & !0x1FF
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

/// Grow `img` with 0xFF up to `at`, then write `data` there.
fn place(img: &mut Vec<u8>, at: usize, data: &[u8]) {
    assert!(img.len() <= at, "fixture sections overlap");
    img.resize(at, 0xFF);
    img.extend_from_slice(data);
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i * 7) as u8)).collect()
}

/// DSi region description. Offsets are absolute and must clear the NTR
/// region.
#[derive(Debug, Clone)]
pub struct TwlRegion {
    pub modcrypt: bool,
    /// Corrupt the sector geometry so the region cannot be decoded.
    pub broken: bool,
    pub rsa_signature: [u8; 0x80],
}

impl Default for TwlRegion {
    fn default() -> Self {
        Self {
            modcrypt: false,
            broken: false,
            rsa_signature: [0x5A; 0x80],
        }
    }
}

pub const SECTOR_SIZE: u32 = 0x400;
pub const SECTOR_TABLE: usize = 0x8000;
pub const SECTOR_TABLE_SIZE: usize = 20 * 20;
pub const BLOCK_TABLE: usize = 0x8200;
pub const BLOCK_TABLE_SIZE: usize = 20;
pub const FILLER: usize = 0x9000;
pub const DIGEST_TWL: usize = 0xC000;
pub const DSI9: usize = 0xC000;
pub const DSI7: usize = 0xC800;
pub const TOTAL_ROM_SIZE: usize = 0xD000;

/// Builder for a small image: two ARM9 overlays, no ARM7 overlays, a v1
/// banner and three named files.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub arm9: Vec<u8>,
    pub nitrocode: bool,
    /// Payload and `reserved` word per ARM9 overlay.
    pub overlays: Vec<(Vec<u8>, u32)>,
    pub arm7: Vec<u8>,
    /// Contents of [`FILE_NAMES`], in order.
    pub files: [Vec<u8>; 3],
    /// Allocation entries that no name points at.
    pub unnamed_entries: u16,
    pub multiboot: bool,
    pub twl: Option<TwlRegion>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            arm9: pattern(0x10, 0x800),
            nitrocode: false,
            overlays: vec![(pattern(0x20, 0x100), 0), (pattern(0x30, 0x180), 0)],
            arm7: pattern(0x40, 0x400),
            files: [pattern(0x50, 0x30), b"hello, nitrokit\n\0".to_vec(), pattern(0x60, 0x250)],
            unnamed_entries: 0,
            multiboot: false,
            twl: None,
        }
    }
}

/// Offsets of the sections the fixture wrote.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub arm9: usize,
    pub overlay_table: usize,
    pub overlays: Vec<usize>,
    pub arm7: usize,
    pub fnt: usize,
    pub fat: usize,
    pub banner: usize,
    pub files: Vec<usize>,
    pub rom_size: usize,
    pub master_hash: [u8; 20],
}

/// Name table: root holds a.bin and b.txt plus folder "sub" with c.dat.
fn name_table(first_id: u16) -> Vec<u8> {
    let mut sub0 = Vec::new();
    for name in ["a.bin", "b.txt"] {
        sub0.push(name.len() as u8);
        sub0.extend_from_slice(name.as_bytes());
    }
    sub0.push(0x80 + 3);
    sub0.extend_from_slice(b"sub");
    sub0.extend_from_slice(&0xF001u16.to_le_bytes());
    sub0.push(0);

    let mut sub1 = vec![5u8];
    sub1.extend_from_slice(b"c.dat");
    sub1.push(0);

    let mut t = Vec::new();
    t.extend_from_slice(&0x10u32.to_le_bytes());
    t.extend_from_slice(&first_id.to_le_bytes());
    t.extend_from_slice(&2u16.to_le_bytes());
    t.extend_from_slice(&(0x10 + sub0.len() as u32).to_le_bytes());
    t.extend_from_slice(&(first_id + 2).to_le_bytes());
    t.extend_from_slice(&0xF000u16.to_le_bytes());
    t.extend(sub0);
    t.extend(sub1);
    t
}

fn banner() -> Vec<u8> {
    let mut b = vec![0u8; 0x840];
    put_u16(&mut b, 0, 1);
    let title: Vec<u8> = "Nitro Kit\nTest".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    for lang in 0..6 {
        let at = 0x240 + lang * 0x100;
        b[at..at + title.len()].copy_from_slice(&title);
    }
    for (i, px) in b[0x20..0x220].iter_mut().enumerate() {
        *px = (i % 16) as u8 * 0x11;
    }
    let crc = crc16(&b[0x20..0x840]);
    put_u16(&mut b, 2, crc);
    b
}

impl Fixture {
    /// A DSi-enhanced image with a plaintext DSi region.
    pub fn dsi() -> Self {
        Self {
            twl: Some(TwlRegion::default()),
            ..Default::default()
        }
    }

    /// Build the image.
    pub fn build(&self) -> (Vec<u8>, Layout) {
        let mut layout = Layout::default();
        let mut img = vec![0u8; HEADER_SIZE];
        let ov_count = self.overlays.len();
        let fat_len = ov_count + 3 + self.unnamed_entries as usize;
        let mut fat = vec![(0u32, 0u32); fat_len];

        layout.arm9 = HEADER_SIZE;
        let mut arm9 = self.arm9.clone();
        if self.nitrocode {
            arm9.extend_from_slice(&NITROCODE.to_le_bytes());
            arm9.extend_from_slice(&[0u8; 8]);
        }
        place(&mut img, layout.arm9, &arm9);

        layout.overlay_table = align(img.len());
        let mut table = Vec::new();
        for (i, (_, reserved)) in self.overlays.iter().enumerate() {
            let words = [i as u32, 0x0210_0000, 0x100, 0x20, 0, 0, i as u32, *reserved];
            table.extend(words.iter().flat_map(|w| w.to_le_bytes()));
        }
        place(&mut img, layout.overlay_table, &table);
        for (i, (data, _)) in self.overlays.iter().enumerate() {
            let at = align(img.len());
            place(&mut img, at, data);
            layout.overlays.push(at);
            fat[i] = (at as u32, (at + data.len()) as u32);
        }

        layout.arm7 = align(img.len());
        place(&mut img, layout.arm7, &self.arm7);

        let fnt = name_table(ov_count as u16);
        layout.fnt = align(img.len());
        place(&mut img, layout.fnt, &fnt);

        layout.fat = align(img.len());
        let general = align(layout.fat + fat_len * 8) + 0xA00;
        layout.banner = align(layout.fat + fat_len * 8);

        let mut at = general;
        for (i, data) in self.files.iter().enumerate() {
            layout.files.push(at);
            fat[ov_count + i] = (at as u32, (at + data.len()) as u32);
            at = align(at + data.len());
        }
        for i in 0..self.unnamed_entries as usize {
            // Past the named files; never written.
            let bogus = 0x0100_0000 + i as u32 * 0x200;
            fat[ov_count + 3 + i] = (bogus, bogus + 0x10);
        }
        let fat_bytes: Vec<u8> = fat
            .iter()
            .flat_map(|(s, e)| [s.to_le_bytes(), e.to_le_bytes()].concat())
            .collect();
        place(&mut img, layout.fat, &fat_bytes);
        place(&mut img, layout.banner, &banner());
        for (i, data) in self.files.iter().enumerate() {
            place(&mut img, layout.files[i], data);
        }
        layout.rom_size = img.len();

        if self.multiboot && self.twl.is_none() {
            let mut sig = vec![0u8; 0x88];
            sig[..2].copy_from_slice(b"ac");
            for (i, b) in sig[2..].iter_mut().enumerate() {
                *b = i as u8;
            }
            img.extend_from_slice(&sig);
        }

        let mut h = vec![0u8; HEADER_SIZE];
        h[..12].copy_from_slice(b"NITROKIT\0\0\0\0");
        h[0x0C..0x10].copy_from_slice(b"NTKE");
        h[0x10..0x12].copy_from_slice(b"01");
        put_u32(&mut h, 0x20, layout.arm9 as u32);
        put_u32(&mut h, 0x24, ARM9_RAM + 0x800);
        put_u32(&mut h, 0x28, ARM9_RAM);
        put_u32(&mut h, 0x2C, self.arm9.len() as u32);
        put_u32(&mut h, 0x30, layout.arm7 as u32);
        put_u32(&mut h, 0x34, 0x0238_0000);
        put_u32(&mut h, 0x38, 0x0238_0000);
        put_u32(&mut h, 0x3C, self.arm7.len() as u32);
        put_u32(&mut h, 0x40, layout.fnt as u32);
        put_u32(&mut h, 0x44, fnt.len() as u32);
        put_u32(&mut h, 0x48, layout.fat as u32);
        put_u32(&mut h, 0x4C, fat_bytes.len() as u32);
        if ov_count > 0 {
            put_u32(&mut h, 0x50, layout.overlay_table as u32);
            put_u32(&mut h, 0x54, table.len() as u32);
        }
        put_u32(&mut h, 0x68, layout.banner as u32);
        put_u32(&mut h, 0x80, layout.rom_size as u32);
        put_u32(&mut h, 0x84, HEADER_SIZE as u32);
        for (i, b) in h[0xC0..0x15C].iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31);
        }

        if let Some(twl) = &self.twl {
            self.build_twl(&mut img, &mut h, twl, &mut layout);
        }

        // A multiboot signature is not counted towards the capacity.
        let used = if self.twl.is_some() { img.len() } else { layout.rom_size };
        let capacity = used.next_power_of_two().max(0x20000);
        img.resize(capacity.max(img.len()), 0xFF);
        h[0x14] = (capacity.trailing_zeros() - 17) as u8;

        let crc = crc16(&img[0x4000..0x8000]);
        put_u16(&mut h, 0x6C, crc);
        let bytes = Header::from_bytes(h).unwrap().to_bytes().unwrap();
        img[..HEADER_SIZE].copy_from_slice(&bytes);
        (img, layout)
    }

    fn build_twl(&self, img: &mut Vec<u8>, h: &mut [u8], twl: &TwlRegion, layout: &mut Layout) {
        assert!(img.len() <= SECTOR_TABLE);
        h[0x12] = 0x02;
        h[0x1C] = if twl.modcrypt { 0x03 } else { 0x01 };

        put_u32(h, 0x1C0, DSI9 as u32);
        put_u32(h, 0x1C8, 0x02E8_0000);
        put_u32(h, 0x1CC, 0x800);
        put_u32(h, 0x1D0, DSI7 as u32);
        put_u32(h, 0x1D8, 0x02E0_0000);
        put_u32(h, 0x1DC, 0x800);
        put_u32(h, 0x1E0, 0x4000);
        put_u32(h, 0x1E4, 0x4000);
        put_u32(h, 0x1E8, DIGEST_TWL as u32);
        put_u32(h, 0x1EC, (TOTAL_ROM_SIZE - DIGEST_TWL) as u32);
        put_u32(h, 0x1F0, SECTOR_TABLE as u32);
        put_u32(h, 0x1F4, SECTOR_TABLE_SIZE as u32);
        put_u32(h, 0x1F8, BLOCK_TABLE as u32);
        put_u32(h, 0x1FC, BLOCK_TABLE_SIZE as u32);
        put_u32(h, 0x200, if twl.broken { 0 } else { SECTOR_SIZE });
        put_u32(h, 0x204, 0x20);
        put_u32(h, 0x210, TOTAL_ROM_SIZE as u32);
        if twl.modcrypt {
            put_u32(h, 0x220, DSI9 as u32);
            put_u32(h, 0x224, 0x400);
            put_u32(h, 0x228, DSI7 as u32);
            put_u32(h, 0x22C, 0x400);
        }
        put_u32(h, 0x230, 0x4E54_4B45);
        put_u32(h, 0x234, 0x0003_0004);
        for (i, at) in [0x300usize, 0x314, 0x33C, 0x350, 0x364, 0x3A0].into_iter().enumerate() {
            h[at..at + 20].fill(0xA0 + i as u8);
        }
        h[0xF80..0x1000].copy_from_slice(&twl.rsa_signature);

        // Placeholder tables, filler, then the payloads.
        place(img, SECTOR_TABLE, &vec![0u8; SECTOR_TABLE_SIZE]);
        place(img, BLOCK_TABLE, &vec![0u8; BLOCK_TABLE_SIZE]);
        place(img, FILLER, &pattern(0x77, 0x3000));
        place(img, DSI9, &pattern(0x90, 0x800));
        place(img, DSI7, &pattern(0xA0, 0x800));
        assert_eq!(img.len(), TOTAL_ROM_SIZE);

        let mut sectors = sector_hashes(&img[0x4000..0x8000], SECTOR_SIZE as usize).unwrap();
        sectors.extend(sector_hashes(&img[DIGEST_TWL..TOTAL_ROM_SIZE], SECTOR_SIZE as usize).unwrap());
        let table: Vec<u8> = sectors.concat();
        img[SECTOR_TABLE..SECTOR_TABLE + SECTOR_TABLE_SIZE].copy_from_slice(&table);
        let blocks: Vec<u8> = block_hashes(&table, 0x20).unwrap().concat();
        img[BLOCK_TABLE..BLOCK_TABLE + BLOCK_TABLE_SIZE].copy_from_slice(&blocks);
        layout.master_hash = master_hash(&blocks).unwrap();

        if twl.modcrypt {
            let header = Header::from_bytes(h.to_vec()).unwrap();
            let key = modcrypt::derive_key(&header).unwrap();
            let t = header.twl.as_ref().unwrap();
            modcrypt::crypt(&key, &modcrypt::counter(&t.hmac_arm9), &mut img[DSI9..DSI9 + 0x400]);
            modcrypt::crypt(&key, &modcrypt::counter(&t.hmac_arm7), &mut img[DSI7..DSI7 + 0x400]);
        }
    }
}
