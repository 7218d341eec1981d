//! ARM9/ARM7 overlay tables.
//!
//! ## Entry (0x20 bytes)
//! ```text
//! [0x00] OverlayId          (u32 LE)
//! [0x04] RamAddress         (u32 LE)
//! [0x08] RamSize            (u32 LE)
//! [0x0C] BssSize            (u32 LE)
//! [0x10] StaticInitStart    (u32 LE)
//! [0x14] StaticInitEnd      (u32 LE)
//! [0x18] FileId             (u32 LE; index into the FAT)
//! [0x1C] Reserved           (u32 LE; bits 0..24 compressed size,
//!                            bit 24 compressed flag)
//! ```
//! The entry count is `OverlaySize / 0x20`.

use std::io::{Read, Seek, SeekFrom, Write};

use super::fat::AllocationTable;
use super::fnt::VirtualFile;
use crate::utils::{FILL, align_up, le_u32};
use crate::{Error, Result};

/// Size of one overlay entry.
pub const OVERLAY_ENTRY_SIZE: usize = 0x20;

const COMPRESSED_FLAG: u32 = 0x0100_0000;

/// Which CPU an overlay table or DSi payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Arm9,
    Arm7,
}

impl Processor {
    fn file_name(self, overlay_id: u32) -> String {
        match self {
            Self::Arm9 => format!("overlay_{overlay_id:04}.bin"),
            Self::Arm7 => format!("overlay7_{overlay_id:04}.bin"),
        }
    }
}

/// One overlay table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayEntry {
    pub overlay_id: u32,
    pub ram_address: u32,
    pub ram_size: u32,
    pub bss_size: u32,
    pub static_init_start: u32,
    pub static_init_end: u32,
    pub file_id: u32,
    pub reserved: u32,
}

impl OverlayEntry {
    fn read<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            overlay_id: le_u32(r)?,
            ram_address: le_u32(r)?,
            ram_size: le_u32(r)?,
            bss_size: le_u32(r)?,
            static_init_start: le_u32(r)?,
            static_init_end: le_u32(r)?,
            file_id: le_u32(r)?,
            reserved: le_u32(r)?,
        })
    }

    fn to_bytes(self) -> [u8; OVERLAY_ENTRY_SIZE] {
        let words = [
            self.overlay_id,
            self.ram_address,
            self.ram_size,
            self.bss_size,
            self.static_init_start,
            self.static_init_end,
            self.file_id,
            self.reserved,
        ];
        let mut out = [0u8; OVERLAY_ENTRY_SIZE];
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Whether the overlay payload is BLZ-compressed.
    pub fn is_compressed(&self) -> bool {
        self.reserved & COMPRESSED_FLAG != 0
    }

    /// Record a new payload size in the compressed-size bits. Entries without
    /// the compressed flag are left alone.
    pub fn patch_size(&mut self, new_size: u32) {
        if self.is_compressed() {
            self.reserved = (self.reserved & 0xFF00_0000) | (new_size & 0x00FF_FFFF);
        }
    }
}

/// A parsed overlay table.
#[derive(Debug, Clone)]
pub struct OverlayTable {
    pub processor: Processor,
    pub entries: Vec<OverlayEntry>,
}

impl OverlayTable {
    /// Parse `size` bytes of table at `offset`.
    pub fn parse<R: Read + Seek>(
        r: &mut R,
        processor: Processor,
        offset: u64,
        size: u32,
    ) -> Result<Self> {
        let count = size as usize / OVERLAY_ENTRY_SIZE;
        let mut entries = Vec::with_capacity(count);
        if count > 0 {
            r.seek(SeekFrom::Start(offset))?;
            for _ in 0..count {
                entries.push(OverlayEntry::read(r)?);
            }
        }
        Ok(Self { processor, entries })
    }

    /// Parse a table held in memory, e.g. a replacement `overarm9.bin`.
    pub fn from_bytes(processor: Processor, data: &[u8]) -> Result<Self> {
        let mut r = std::io::Cursor::new(data);
        Self::parse(&mut r, processor, 0, data.len() as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unpadded table length.
    pub fn byte_len(&self) -> u32 {
        (self.entries.len() * OVERLAY_ENTRY_SIZE) as u32
    }

    /// One file per entry, located through the allocation table.
    pub fn to_files(&self, fat: &AllocationTable) -> Result<Vec<VirtualFile>> {
        self.entries
            .iter()
            .map(|e| {
                let id = u16::try_from(e.file_id).map_err(|_| Error::FileId(e.file_id))?;
                let alloc = fat.get(id).ok_or(Error::FileId(e.file_id))?;
                Ok(VirtualFile {
                    name: self.processor.file_name(e.overlay_id),
                    id,
                    offset: alloc.offset,
                    size: alloc.size,
                    source: None,
                })
            })
            .collect()
    }

    /// Write the table followed by `0xFF` up to the next 0x200 boundary.
    /// Returns the unpadded length.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<u32> {
        for e in &self.entries {
            w.write_all(&e.to_bytes())?;
        }
        let len = self.byte_len();
        let padded = align_up(len as u64, 0x200) as usize;
        w.write_all(&vec![FILL; padded - len as usize])?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fat::AllocationEntry;
    use std::io::Cursor;

    fn entry(overlay_id: u32, file_id: u32, reserved: u32) -> OverlayEntry {
        OverlayEntry {
            overlay_id,
            ram_address: 0x0210_0000,
            ram_size: 0x100,
            file_id,
            reserved,
            ..Default::default()
        }
    }

    fn fat() -> AllocationTable {
        AllocationTable::from_entries(vec![
            AllocationEntry { id: 0, offset: 0x4600, size: 0x100 },
            AllocationEntry { id: 1, offset: 0x4800, size: 0x80 },
        ])
    }

    #[test]
    fn test_parse_and_write() {
        let table = OverlayTable {
            processor: Processor::Arm9,
            entries: vec![entry(0, 0, 0), entry(1, 1, 0x0100_0080)],
        };
        let mut out = Vec::new();
        assert_eq!(table.write(&mut out).unwrap(), 0x40);
        assert_eq!(out.len(), 0x200);
        assert!(out[0x40..].iter().all(|&b| b == FILL));

        let back = OverlayTable::parse(&mut Cursor::new(&out), Processor::Arm9, 0, 0x40).unwrap();
        assert_eq!(back.entries, table.entries);
        assert!(back.entries[1].is_compressed());
    }

    #[test]
    fn test_file_names_and_sizes() {
        let ov9 = OverlayTable {
            processor: Processor::Arm9,
            entries: vec![entry(12, 0, 0)],
        };
        let ov7 = OverlayTable {
            processor: Processor::Arm7,
            entries: vec![entry(3, 1, 0)],
        };
        let f9 = ov9.to_files(&fat()).unwrap();
        let f7 = ov7.to_files(&fat()).unwrap();
        assert_eq!(f9[0].name, "overlay_0012.bin");
        assert_eq!((f9[0].offset, f9[0].size), (0x4600, 0x100));
        assert_eq!(f7[0].name, "overlay7_0003.bin");
        assert_eq!(f7[0].size, 0x80);
    }

    #[test]
    fn test_unknown_file_id() {
        let table = OverlayTable {
            processor: Processor::Arm9,
            entries: vec![entry(0, 7, 0)],
        };
        assert!(matches!(table.to_files(&fat()), Err(Error::FileId(7))));
    }

    #[test]
    fn test_patch_size_only_when_flagged() {
        let mut plain = entry(0, 0, 0x0000_1234);
        plain.patch_size(0x999);
        assert_eq!(plain.reserved, 0x0000_1234);

        let mut flagged = entry(0, 0, 0x0300_1234);
        flagged.patch_size(0x0012_3456);
        assert_eq!(flagged.reserved, 0x0312_3456);
    }
}
