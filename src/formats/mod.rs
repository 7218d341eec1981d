//! Parsers and writers for the pieces of an NDS/DSi cartridge image.
//!
//! Conventions shared by every submodule:
//!
//! * **Generic over** [`std::io::Read`] + [`std::io::Seek`] - pass a
//!   [`std::fs::File`], a [`std::io::Cursor`], or anything else that
//!   implements both traits. Offsets are absolute within the image.
//! * **Metadata first** - `parse` reads tables and builds an in-memory
//!   description. File contents stay in the image until they are needed;
//!   [`nds::NdsReader`] hands out bounded [`std::io::Take<&mut R>`] readers.
//! * **Rebuild is separate** - [`nds::NdsRom::rebuild`] (in [`build`]) lays
//!   the image out again from the tree, honouring redirected files.
//!
//! ## Overview
//!
//! | Module       | Structure   | Description |
//! |--------------|-------------|-------------|
//! | [`header`]   | Header      | Cartridge header, with the optional DSi extension |
//! | [`banner`]   | Banner      | Icon and titles; four versioned layouts |
//! | [`fat`]      | FAT         | Start/end pairs per file id; the file visitation order |
//! | [`fnt`]      | FNT         | Directory records and name subtables; the virtual tree |
//! | [`overlay`]  | OVT         | ARM9/ARM7 overlay tables |
//! | [`twl`]      | DSi region  | Hash tables, DSi9/DSi7 payloads, modcrypt |
//! | [`nds`]      | Image       | Decodes everything above into [`nds::NdsRom`] |
//! | [`build`]    | Image       | Writes an [`nds::NdsRom`] back out |

pub mod banner;
pub mod build;
pub mod fat;
pub mod fnt;
pub mod header;
pub mod nds;
pub mod overlay;
pub mod twl;
