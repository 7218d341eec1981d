//! FNT - file name table, and the in-memory file tree built from it.
//!
//! ## Layout
//! ```text
//! [0x00] Main table     (DirectoryCount × 8 bytes)
//!        +0x00 SubtableOffset   (u32 LE, relative to the FNT start)
//!        +0x04 FirstFileId      (u16 LE)
//!        +0x06 ParentId         (u16 LE; entry 0 holds DirectoryCount)
//! [..]   Subtables      (one per directory, tag-prefixed entries)
//! ```
//!
//! ## Subtable entries
//! ```text
//! 0x00        end of subtable
//! 0x01..0x7F  file;   tag = name length, then the name (Shift-JIS)
//! 0x80        reserved, skipped
//! 0x81..0xFF  folder; tag - 0x80 = name length, then the name and a u16 id
//! ```
//! Files take sequential ids starting at the directory's `FirstFileId`.
//! Folder ids are `0xF000 | index` into the main table.
//!
//! Some retail images declare more directories than the main table holds.
//! A record that would be read past the first subtable is dropped and the
//! declared count shrinks instead of failing.

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use encoding_rs::SHIFT_JIS;
use log::warn;

use super::fat::AllocationEntry;
use crate::utils::{bytesv, copy_range, le_u16, le_u32, u8};
use crate::{Error, Result};

/// Id shared by synthetic files and by the "data" and "overlay" folders.
pub const SENTINEL_ID: u16 = 0xFFFF;

/// Where a file's bytes come from during a rebuild.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// A file on disk; `offset`/`size` address a range inside it.
    Path(PathBuf),
    /// An in-memory buffer; `offset`/`size` address a range inside it.
    Bytes(Vec<u8>),
}

/// One file in the tree.
///
/// Without a [`FileSource`] the bytes are `offset..offset + size` of the
/// source image.
#[derive(Debug, Clone)]
pub struct VirtualFile {
    pub name: String,
    pub id: u16,
    pub offset: u32,
    pub size: u32,
    pub source: Option<FileSource>,
}

impl VirtualFile {
    pub(crate) fn synthetic(name: &str, offset: u32, size: u32) -> Self {
        Self {
            name: name.to_owned(),
            id: SENTINEL_ID,
            offset,
            size,
            source: None,
        }
    }

    /// Replace the contents with a file on disk.
    pub fn redirect_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let len = fs::metadata(&path)
            .map_err(|e| Error::Open(path.clone(), e))?
            .len();
        self.size = u32::try_from(len).map_err(|_| Error::InvalidRange)?;
        self.offset = 0;
        self.source = Some(FileSource::Path(path));
        Ok(())
    }

    /// Replace the contents with an in-memory buffer.
    pub fn redirect_bytes(&mut self, data: Vec<u8>) -> Result<()> {
        self.size = u32::try_from(data.len()).map_err(|_| Error::InvalidRange)?;
        self.offset = 0;
        self.source = Some(FileSource::Bytes(data));
        Ok(())
    }

    /// Whether the contents come from somewhere other than the image.
    pub fn is_redirected(&self) -> bool {
        self.source.is_some()
    }

    /// Copy the contents to `w`. `image` is the source ROM.
    pub fn write_to<R: Read + Seek, W: Write>(&self, image: &mut R, w: &mut W) -> Result<()> {
        let (offset, size) = (self.offset as u64, self.size as u64);
        match &self.source {
            None => copy_range(image, offset, size, w),
            Some(FileSource::Path(p)) => {
                let mut f = File::open(p).map_err(|e| Error::Open(p.clone(), e))?;
                copy_range(&mut f, offset, size, w)
            }
            Some(FileSource::Bytes(b)) => {
                let range = b
                    .get(offset as usize..(offset + size) as usize)
                    .ok_or(Error::InvalidRange)?;
                w.write_all(range)?;
                Ok(())
            }
        }
    }

    /// Read the contents into memory.
    pub fn read_contents<R: Read + Seek>(&self, image: &mut R) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size as usize);
        self.write_to(image, &mut out)?;
        Ok(out)
    }
}

/// One directory in the tree.
#[derive(Debug, Clone, Default)]
pub struct VirtualDirectory {
    pub name: String,
    pub id: u16,
    pub files: Vec<VirtualFile>,
    pub dirs: Vec<VirtualDirectory>,
    pub subtable_offset: u32,
    pub first_file_id: u16,
    pub parent_id: u16,
}

impl VirtualDirectory {
    pub(crate) fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            id: SENTINEL_ID,
            ..Default::default()
        }
    }

    /// Look up a file by `/`-separated path relative to this directory.
    pub fn file(&self, path: &str) -> Option<&VirtualFile> {
        let (dirs, name) = split_path(path);
        let mut dir = self;
        for part in dirs {
            dir = dir.dirs.iter().find(|d| d.name == part)?;
        }
        dir.files.iter().find(|f| f.name == name)
    }

    /// Mutable variant of [`VirtualDirectory::file`].
    pub fn file_mut(&mut self, path: &str) -> Option<&mut VirtualFile> {
        let (dirs, name) = split_path(path);
        let mut dir = self;
        for part in dirs {
            dir = dir.dirs.iter_mut().find(|d| d.name == part)?;
        }
        dir.files.iter_mut().find(|f| f.name == name)
    }

    /// Look up a subdirectory by name.
    pub fn dir(&self, name: &str) -> Option<&VirtualDirectory> {
        self.dirs.iter().find(|d| d.name == name)
    }

    /// Every file below this directory, depth-first.
    pub fn walk(&self) -> Vec<&VirtualFile> {
        let mut out: Vec<&VirtualFile> = self.files.iter().collect();
        for d in &self.dirs {
            out.extend(d.walk());
        }
        out
    }
}

fn split_path(path: &str) -> (Vec<&str>, &str) {
    let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let name = parts.pop().unwrap_or("");
    (parts, name)
}

/// Resolve a file id against a tree.
///
/// A directory whose id matches yields a name-only placeholder. Otherwise
/// the directory's own files are scanned, then subdirectories depth-first;
/// the first hit with a non-empty name wins.
pub fn find_file(id: u16, dir: &VirtualDirectory) -> Option<Cow<'_, VirtualFile>> {
    if dir.id == id {
        return Some(Cow::Owned(VirtualFile {
            name: dir.name.clone(),
            id: dir.id,
            offset: 0,
            size: 0,
            source: None,
        }));
    }
    if let Some(f) = dir.files.iter().find(|f| f.id == id) {
        return Some(Cow::Borrowed(f));
    }
    dir.dirs
        .iter()
        .filter_map(|d| find_file(id, d))
        .find(|f| !f.name.is_empty())
}

/// An entry of a directory subtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtableEntry {
    File { name: String, id: u16 },
    Folder { name: String, id: u16 },
}

/// One main-table record together with its decoded subtable.
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    pub subtable_offset: u32,
    pub first_file_id: u16,
    pub parent_id: u16,
    pub entries: Vec<SubtableEntry>,
}

/// Decoded name table, still flat.
#[derive(Debug, Clone)]
pub struct NameTable {
    pub records: Vec<DirectoryRecord>,
}

fn decode_name(bytes: &[u8]) -> String {
    let (name, _, _) = SHIFT_JIS.decode(bytes);
    name.into_owned()
}

impl NameTable {
    /// Parse the table at `offset`. `fat_len` is the number of allocation
    /// entries; every file id must fall below it.
    pub fn parse<R: Read + Seek>(r: &mut R, offset: u64, fat_len: usize) -> Result<Self> {
        r.seek(SeekFrom::Start(offset + 6))?;
        let mut count = le_u16(r)? as usize;
        if count == 0 {
            return Err(Error::DirectoryCount);
        }

        let mut records: Vec<DirectoryRecord> = Vec::with_capacity(count);
        while records.len() < count {
            let i = records.len();
            let record_end = (i as u64 + 1) * 8;
            if let Some(first) = records.first() {
                if record_end > first.subtable_offset as u64 {
                    count -= 1;
                    continue;
                }
            }

            r.seek(SeekFrom::Start(offset + i as u64 * 8))?;
            let subtable_offset = le_u32(r)?;
            let first_file_id = le_u16(r)?;
            let parent_id = le_u16(r)?;

            r.seek(SeekFrom::Start(offset + subtable_offset as u64))?;
            let entries = Self::parse_subtable(r, first_file_id, fat_len)?;
            records.push(DirectoryRecord {
                subtable_offset,
                first_file_id,
                parent_id,
                entries,
            });
        }

        let declared = records.first().map(|r| r.parent_id as usize).unwrap_or(0);
        if declared != records.len() {
            warn!(
                "name table declares {declared} directories but holds {}",
                records.len()
            );
        }
        Ok(Self { records })
    }

    fn parse_subtable<R: Read>(
        r: &mut R,
        first_file_id: u16,
        fat_len: usize,
    ) -> Result<Vec<SubtableEntry>> {
        let mut entries = Vec::new();
        let mut file_id = first_file_id;
        loop {
            let tag = u8(r)?;
            match tag {
                0x00 => break,
                0x01..=0x7F => {
                    if file_id as usize >= fat_len {
                        return Err(Error::FileId(file_id as u32));
                    }
                    let name = decode_name(&bytesv(r, tag as usize)?);
                    entries.push(SubtableEntry::File { name, id: file_id });
                    file_id = file_id.wrapping_add(1);
                }
                0x80 => {}
                _ => {
                    let name = decode_name(&bytesv(r, (tag - 0x80) as usize)?);
                    let id = le_u16(r)?;
                    entries.push(SubtableEntry::Folder { name, id });
                }
            }
        }
        Ok(entries)
    }

    /// Build the tree. The returned root holds one folder, "data", with the
    /// sentinel id.
    pub fn to_tree(&self, fat: &[AllocationEntry]) -> Result<VirtualDirectory> {
        let mut on_path = vec![false; self.records.len()];
        let mut data = self.build(0, "data", fat, &mut on_path)?;
        data.id = SENTINEL_ID;

        let mut root = VirtualDirectory::named("root");
        root.dirs.push(data);
        Ok(root)
    }

    fn build(
        &self,
        folder_id: u16,
        name: &str,
        fat: &[AllocationEntry],
        on_path: &mut [bool],
    ) -> Result<VirtualDirectory> {
        let index = (folder_id & 0xFFF) as usize;
        let record = self.records.get(index).ok_or(Error::DirectoryCount)?;
        if on_path[index] {
            return Err(Error::Parse("name table folders form a cycle"));
        }
        on_path[index] = true;

        let mut dir = VirtualDirectory {
            name: name.to_owned(),
            id: folder_id,
            subtable_offset: record.subtable_offset,
            first_file_id: record.first_file_id,
            parent_id: record.parent_id,
            ..Default::default()
        };
        for entry in &record.entries {
            match entry {
                SubtableEntry::File { name, id } => {
                    let alloc = fat.get(*id as usize).ok_or(Error::FileId(*id as u32))?;
                    dir.files.push(VirtualFile {
                        name: name.clone(),
                        id: *id,
                        offset: alloc.offset,
                        size: alloc.size,
                        source: None,
                    });
                }
                SubtableEntry::Folder { name, id } => {
                    dir.dirs.push(self.build(*id, name, fat, on_path)?);
                }
            }
        }

        on_path[index] = false;
        Ok(dir)
    }
}
