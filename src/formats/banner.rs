//! Icon/title banner.
//!
//! ## Layout
//! ```text
//! [0x0000] Version                 (u16 LE; 1, 2, 3 or 0x0103)
//! [0x0002] Crc1  over 0x0020..0x0840   (u16 LE)
//! [0x0004] Crc2  over 0x0020..0x0940   (u16 LE, version ≥ 2)
//! [0x0006] Crc3  over 0x0020..0x0A20   (u16 LE, version ≥ 3)
//! [0x0008] Crc4  over 0x1240..0x23C0   (u16 LE, DSi only)
//! [0x000A] Reserved                (0x16 bytes)
//! [0x0020] Icon bitmap             (0x200 bytes, 4bpp 32×32)
//! [0x0220] Icon palette            (0x20 bytes)
//! [0x0240] Titles                  (6 × 0x100 bytes, UTF-16LE)
//! [0x0840] Chinese title           (0x100 bytes, version ≥ 2)
//! [0x0940] Korean title            (0x100 bytes, version ≥ 3)
//! [0x0A40] Reserved                (0x800 bytes, DSi only)
//! [0x1240] Animated icon bitmaps, palettes and sequence (DSi only)
//! [0x23C0] End
//! ```
//!
//! CRC3 stops 0x20 bytes short of the Korean title's end; that is how the
//! firmware computes it.

use std::io::{Read, Seek, SeekFrom};

use log::debug;

use crate::checksum::crc16;
use crate::utils::{bytesv, get_u16, le_u16, put_u16};
use crate::{Error, Result};

/// Largest banner (DSi with animated icon).
pub const TWL_BANNER_SIZE: u32 = 0x23C0;

/// Banner revision, which decides its size and CRC coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerVersion {
    /// Six titles.
    V1,
    /// Adds a Chinese title.
    V2,
    /// Adds a Korean title.
    V3,
    /// DSi banner with animated icon.
    Twl,
}

impl BannerVersion {
    /// Map the on-disk version word. Unknown values are read as [`V1`].
    ///
    /// [`V1`]: BannerVersion::V1
    pub fn from_raw(v: u16) -> Self {
        match v {
            0x0002 => Self::V2,
            0x0003 => Self::V3,
            0x0103 => Self::Twl,
            0x0001 => Self::V1,
            other => {
                debug!("unknown banner version {other:#06x}, reading as v1");
                Self::V1
            }
        }
    }

    /// Size on disk. `twl_banner_size` is the header's banner size field
    /// and only matters for [`BannerVersion::Twl`].
    pub fn size(self, twl_banner_size: Option<u32>) -> usize {
        match self {
            Self::V1 => 0x840,
            Self::V2 => 0x940,
            Self::V3 => 0xA40,
            Self::Twl => match twl_banner_size {
                Some(n) if n != 0 && n <= TWL_BANNER_SIZE => n as usize,
                _ => TWL_BANNER_SIZE as usize,
            },
        }
    }

    /// `(crc field offset, start, end)` for each CRC the version carries.
    pub fn crc_ranges(self) -> &'static [(usize, usize, usize)] {
        const RANGES: [(usize, usize, usize); 4] = [
            (0x02, 0x20, 0x840),
            (0x04, 0x20, 0x940),
            (0x06, 0x20, 0xA20),
            (0x08, 0x1240, 0x23C0),
        ];
        match self {
            Self::V1 => &RANGES[..1],
            Self::V2 => &RANGES[..2],
            Self::V3 => &RANGES[..3],
            Self::Twl => &RANGES[..],
        }
    }
}

/// Title languages, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Japanese,
    English,
    French,
    German,
    Italian,
    Spanish,
    Chinese,
    Korean,
}

impl Language {
    fn offset(self) -> usize {
        0x240 + self as usize * 0x100
    }
}

/// Parsed banner. The bytes are kept whole; accessors decode on demand.
#[derive(Debug, Clone)]
pub struct Banner {
    pub version: BannerVersion,
    pub data: Vec<u8>,
}

impl Banner {
    /// Parse a banner at `offset`.
    pub fn parse<R: Read + Seek>(
        r: &mut R,
        offset: u64,
        twl_banner_size: Option<u32>,
    ) -> Result<Self> {
        r.seek(SeekFrom::Start(offset))?;
        let version = BannerVersion::from_raw(le_u16(r)?);
        r.seek(SeekFrom::Start(offset))?;
        let data = bytesv(r, version.size(twl_banner_size))?;
        Ok(Self { version, data })
    }

    /// Build a banner from bytes, e.g. a replacement `banner.bin`.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let version = BannerVersion::from_raw(get_u16(&data, 0)?);
        if data.len() < BannerVersion::V1.size(None) {
            return Err(Error::InvalidRange);
        }
        Ok(Self { version, data })
    }

    /// Title for `lang`, or [`None`] if this version has no such slot.
    pub fn title(&self, lang: Language) -> Option<String> {
        let start = lang.offset();
        let bytes = self.data.get(start..start + 0x100)?;
        if start >= self.version.size(Some(self.data.len() as u32)).min(0xA40) {
            return None;
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// For each CRC field: whether the stored value matches the contents.
    /// Ranges past the end of the data are skipped.
    pub fn verify(&self) -> Vec<bool> {
        self.version
            .crc_ranges()
            .iter()
            .filter_map(|&(field, start, end)| {
                let body = self.data.get(start..end)?;
                Some(get_u16(&self.data, field).ok()? == crc16(body))
            })
            .collect()
    }

    /// Recompute every CRC field.
    pub fn update_crcs(&mut self) -> Result<()> {
        for &(field, start, end) in self.version.crc_ranges() {
            if let Some(body) = self.data.get(start..end) {
                let crc = crc16(body);
                put_u16(&mut self.data, field, crc)?;
            }
        }
        Ok(())
    }

    /// Size on disk.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn banner(version: u16, size: usize) -> Banner {
        let mut data = vec![0u8; size];
        data[..2].copy_from_slice(&version.to_le_bytes());
        let title: Vec<u8> = "Nitro".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        data[0x340..0x340 + title.len()].copy_from_slice(&title);
        Banner::from_bytes(data).unwrap()
    }

    #[test]
    fn test_sizes_by_version() {
        assert_eq!(BannerVersion::V1.size(None), 0x840);
        assert_eq!(BannerVersion::V3.size(None), 0xA40);
        assert_eq!(BannerVersion::Twl.size(Some(0)), 0x23C0);
        assert_eq!(BannerVersion::Twl.size(Some(0xFFFF_FFFF)), 0x23C0);
        assert_eq!(BannerVersion::Twl.size(Some(0x23C0)), 0x23C0);
    }

    #[test]
    fn test_titles() {
        let b = banner(1, 0x840);
        assert_eq!(b.title(Language::English).as_deref(), Some("Nitro"));
        assert_eq!(b.title(Language::Japanese).as_deref(), Some(""));
        assert_eq!(b.title(Language::Chinese), None);
    }

    #[test]
    fn test_crc3_scope_ignores_tail_of_korean_title() {
        let mut b = banner(3, 0xA40);
        b.update_crcs().unwrap();
        assert_eq!(b.verify(), vec![true, true, true]);

        // Inside the range: CRC3 breaks, CRC1 does not.
        b.data[0xA1F] ^= 1;
        assert_eq!(b.verify(), vec![true, true, false]);
        b.data[0xA1F] ^= 1;

        // Last 0x20 bytes are outside every range.
        b.data[0xA20] = 0x55;
        b.data[0xA3F] = 0x55;
        assert_eq!(b.verify(), vec![true, true, true]);
    }

    #[test]
    fn test_parse_reads_version_sized_block() {
        let mut img = vec![0xFFu8; 0x3000];
        img[0x200..0x202].copy_from_slice(&2u16.to_le_bytes());
        let b = Banner::parse(&mut Cursor::new(img), 0x200, None).unwrap();
        assert_eq!(b.version, BannerVersion::V2);
        assert_eq!(b.len(), 0x940);
    }
}
