//! FAT - file allocation table.
//!
//! ## Layout
//! ```text
//! [id × 8 + 0x00] StartOffset   (u32 LE, absolute)
//! [id × 8 + 0x04] EndOffset     (u32 LE, exclusive)
//! ```
//! The entry count is `FatSize / 8`. Overlay payloads live in the same table
//! as ordinary files; the overlay tables reference them by id.
//!
//! ## Visitation order
//! Files are visited in [`AllocationTable::sorted_ids`] order: ascending start
//! offset, ties broken by ascending id. Both the rebuild writer and
//! [`AllocationTable::encode`] follow it, which keeps files in the order they
//! had in the source image.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

use super::fnt::{VirtualDirectory, find_file};
use crate::utils::{align_up, le_u32};
use crate::{Error, Result};

/// Alignment of every file in the image.
pub const FILE_ALIGN: u64 = 0x200;
/// Space reserved for the banner when its size is unknown.
pub const DEFAULT_BANNER_SPACE: u64 = 0xA00;

/// Space the banner occupies ahead of the general file area.
pub fn banner_space(banner_size: u32) -> u64 {
    match banner_size {
        0 => DEFAULT_BANNER_SPACE,
        n => align_up(n as u64, FILE_ALIGN),
    }
}

/// One allocation entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationEntry {
    pub id: u16,
    pub offset: u32,
    pub size: u32,
}

/// Parsed allocation table.
#[derive(Debug, Clone)]
pub struct AllocationTable {
    /// Entries indexed by file id.
    pub entries: Vec<AllocationEntry>,
    /// File ids in visitation order.
    pub sorted_ids: Vec<u16>,
}

/// Bases and overlay membership for [`AllocationTable::encode`].
#[derive(Debug, Clone, Default)]
pub struct FatLayout {
    /// Where the table itself will be written.
    pub fat_offset: u32,
    /// Size of the banner written after the table; 0 reserves
    /// [`DEFAULT_BANNER_SPACE`].
    pub banner_size: u32,
    /// First ARM9 overlay payload offset.
    pub arm9_overlay_base: u32,
    /// First ARM7 overlay payload offset.
    pub arm7_overlay_base: u32,
    /// File ids listed in the ARM9 overlay table.
    pub arm9_overlays: HashSet<u16>,
    /// File ids listed in the ARM7 overlay table.
    pub arm7_overlays: HashSet<u16>,
}

/// Output of [`AllocationTable::encode`].
#[derive(Debug, Clone)]
pub struct EncodedFat {
    /// Table bytes, `count × 8`, unpadded.
    pub bytes: Vec<u8>,
    /// The planned entries, indexed by id. Holes stay zero.
    pub entries: Vec<AllocationEntry>,
    /// Ids that resolved to no file.
    pub holes: usize,
}

impl AllocationTable {
    /// Parse `size` bytes of table at `offset`.
    pub fn parse<R: Read + Seek>(r: &mut R, offset: u64, size: u32) -> Result<Self> {
        if size % 8 != 0 {
            return Err(Error::FatSize(size));
        }
        let count = (size / 8) as usize;
        if count > u16::MAX as usize {
            return Err(Error::FatSize(size));
        }

        r.seek(SeekFrom::Start(offset))?;
        let mut entries = Vec::with_capacity(count);
        for id in 0..count as u16 {
            let start = le_u32(r)?;
            let end = le_u32(r)?;
            entries.push(AllocationEntry {
                id,
                offset: start,
                size: end.wrapping_sub(start),
            });
        }

        Ok(Self::from_entries(entries))
    }

    /// Wrap entries and compute the visitation order.
    pub fn from_entries(entries: Vec<AllocationEntry>) -> Self {
        let mut order: Vec<&AllocationEntry> = entries.iter().collect();
        order.sort_by_key(|e| (e.offset, e.id));
        let sorted_ids = order.iter().map(|e| e.id).collect();
        Self {
            entries,
            sorted_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u16) -> Option<&AllocationEntry> {
        self.entries.get(id as usize)
    }

    /// Plan new offsets for every id against the files in `root`.
    ///
    /// ARM9 overlays, ARM7 overlays and everything else are packed into
    /// three independent address spaces, each file aligned to
    /// [`FILE_ALIGN`]. The general space starts after the table and the
    /// banner.
    pub fn encode(&self, root: &VirtualDirectory, layout: &FatLayout) -> EncodedFat {
        let count = self.entries.len();
        let mut general = align_up(layout.fat_offset as u64 + count as u64 * 8, FILE_ALIGN)
            + banner_space(layout.banner_size);
        let mut ov9 = layout.arm9_overlay_base as u64;
        let mut ov7 = layout.arm7_overlay_base as u64;

        let mut entries = vec![AllocationEntry::default(); count];
        let mut holes = 0;
        for &id in &self.sorted_ids {
            let Some(file) = find_file(id, root) else {
                holes += 1;
                continue;
            };

            let cursor = if layout.arm9_overlays.contains(&id) {
                &mut ov9
            } else if layout.arm7_overlays.contains(&id) {
                &mut ov7
            } else {
                &mut general
            };
            let start = *cursor;
            let end = start + file.size as u64;
            *cursor = align_up(end, FILE_ALIGN);

            entries[id as usize] = AllocationEntry {
                id,
                offset: start as u32,
                size: file.size,
            };
        }

        let mut bytes = vec![0u8; count * 8];
        for (i, e) in entries.iter().enumerate() {
            if e.offset == 0 && e.size == 0 {
                continue;
            }
            bytes[i * 8..i * 8 + 4].copy_from_slice(&e.offset.to_le_bytes());
            bytes[i * 8 + 4..i * 8 + 8].copy_from_slice(&(e.offset + e.size).to_le_bytes());
        }

        EncodedFat {
            bytes,
            entries,
            holes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fnt::VirtualFile;
    use std::io::Cursor;

    fn raw_table(pairs: &[(u32, u32)]) -> Vec<u8> {
        pairs
            .iter()
            .flat_map(|(s, e)| [s.to_le_bytes(), e.to_le_bytes()].concat())
            .collect()
    }

    fn file(id: u16, size: u32) -> VirtualFile {
        VirtualFile {
            name: format!("f{id}"),
            id,
            offset: 0,
            size,
            source: None,
        }
    }

    #[test]
    fn test_sorted_by_offset_then_id() {
        let t = raw_table(&[(0x800, 0x810), (0x400, 0x400), (0x400, 0x420), (0x200, 0x300)]);
        let fat = AllocationTable::parse(&mut Cursor::new(t), 0, 32).unwrap();
        assert_eq!(fat.sorted_ids, vec![3, 1, 2, 0]);
        assert_eq!(fat.entries[2].size, 0x20);
        assert_eq!(fat.entries[1].size, 0);
        for pair in fat.sorted_ids.windows(2) {
            let (a, b) = (fat.entries[pair[0] as usize], fat.entries[pair[1] as usize]);
            assert!((a.offset, a.id) < (b.offset, b.id));
        }
    }

    #[test]
    fn test_size_must_be_multiple_of_eight() {
        let t = raw_table(&[(0, 0)]);
        assert!(matches!(
            AllocationTable::parse(&mut Cursor::new(t), 0, 12),
            Err(Error::FatSize(12))
        ));
    }

    #[test]
    fn test_encode_three_spaces_and_holes() {
        let fat = AllocationTable::from_entries(vec![
            AllocationEntry { id: 0, offset: 0x4600, size: 0x100 },
            AllocationEntry { id: 1, offset: 0x4A00, size: 0x80 },
            AllocationEntry { id: 2, offset: 0x5C00, size: 0x123 },
            AllocationEntry { id: 3, offset: 0x5E00, size: 0x20 },
            AllocationEntry { id: 4, offset: 0x6000, size: 0x10 },
        ]);

        let mut root = VirtualDirectory::named("root");
        let mut data = VirtualDirectory::named("data");
        data.files = vec![file(2, 0x300), file(4, 0x10)];
        let mut overlay = VirtualDirectory::named("overlay");
        overlay.files = vec![file(0, 0x100), file(1, 0x80)];
        root.dirs = vec![data, overlay];

        let layout = FatLayout {
            fat_offset: 0x5000,
            banner_size: 0,
            arm9_overlay_base: 0x4600,
            arm7_overlay_base: 0x4C00,
            arm9_overlays: HashSet::from([0]),
            arm7_overlays: HashSet::from([1]),
        };
        let enc = fat.encode(&root, &layout);

        assert_eq!(enc.holes, 1);
        assert_eq!(enc.entries[0].offset, 0x4600);
        assert_eq!(enc.entries[1].offset, 0x4C00);
        // General space: FAT end 0x5028 → 0x5200, plus 0xA00 of banner.
        assert_eq!(enc.entries[2].offset, 0x5C00);
        assert_eq!(enc.entries[2].size, 0x300);
        assert_eq!(enc.entries[4].offset, 0x6000);
        assert_eq!(&enc.bytes[24..32], &[0u8; 8]);
        assert_eq!(&enc.bytes[32..40], &[0x00, 0x60, 0, 0, 0x10, 0x60, 0, 0]);
    }

    #[test]
    fn test_encode_uses_banner_size() {
        let fat = AllocationTable::from_entries(vec![AllocationEntry { id: 0, offset: 0, size: 4 }]);
        let mut root = VirtualDirectory::named("root");
        root.files = vec![file(0, 4)];
        let layout = FatLayout {
            fat_offset: 0x1000,
            banner_size: 0x23C0,
            ..Default::default()
        };
        let enc = fat.encode(&root, &layout);
        assert_eq!(enc.entries[0].offset, 0x1200 + 0x2400);
    }
}
