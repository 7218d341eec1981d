//! **nitrokit** - decode and rebuild Nintendo DS and DSi cartridge images.
//!
//! An image is decoded into an [`NdsRom`]: header, banner, allocation and
//! name tables, overlay tables and a virtual file tree. Files in the tree can
//! be redirected to new contents, and [`NdsRom::rebuild`] lays out a fresh
//! image with every offset, checksum and (for DSi titles) hash and
//! signature brought up to date.
//!
//! # Modules
//! | Module | Contents |
//! |--------|----------|
//! | [`formats`]     | Header, banner, FAT, FNT, overlay tables, DSi region, image decode/rebuild |
//! | [`crypto`]      | DSi hash tree, modcrypt, header signature, secure area |
//! | [`compression`] | Bottom-LZ for ARM9 binaries and overlays |
//! | [`checksum`]    | CRC16 used by the header and banner |
//! | [`keys`]        | Fixed key material |
//!
//! # Example
//! ```no_run
//! use nitrokit::{NdsRom, RebuildOptions};
//!
//! let mut rom = NdsRom::open("game.nds")?;
//! if let Some(f) = rom.file_mut("data/script/intro.bin") {
//!     f.redirect_path("intro_patched.bin")?;
//! }
//! rom.save_as("game.nds", "game_patched.nds", &RebuildOptions::default())?;
//! # Ok::<(), nitrokit::Error>(())
//! ```

pub mod checksum;
pub mod compression;
pub mod crypto;
pub mod error;
pub mod formats;
pub mod keys;
pub mod utils;

pub use error::{Error, Result};
pub use formats::build::{RebuildOptions, RebuildReport};
pub use formats::nds::{NdsReader, NdsRom};
