//! Library-wide error and result types.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result alias used throughout nitrokit.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// Checksum and signature mismatches are not errors; they are recorded on
/// [`crate::formats::nds::Integrity`] and decoding carries on.
#[derive(Debug)]
pub enum Error {
    /// The stream ended before all expected bytes could be read.
    UnexpectedEof,
    /// An offset or size field would read outside the valid region.
    InvalidRange,
    /// A structural constraint was violated (message describes which one).
    Parse(&'static str),
    /// The name table declares no directories, or a folder id points past
    /// the directory records.
    DirectoryCount,
    /// The allocation table size is not a multiple of 8.
    FatSize(u32),
    /// A file id does not index the allocation table.
    FileId(u32),
    /// A DSi cryptographic precondition failed (message describes which one).
    Crypto(&'static str),
    /// A bottom-LZ stream is malformed.
    Blz(&'static str),
    /// A substitution source could not be opened.
    Open(PathBuf, io::Error),
    /// An underlying I/O operation failed.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedEof => write!(f, "unexpected end of file"),
            Error::InvalidRange => write!(f, "invalid offset or size"),
            Error::Parse(s) => write!(f, "parse error: {s}"),
            Error::DirectoryCount => write!(f, "invalid name table directory count"),
            Error::FatSize(n) => write!(f, "allocation table size {n:#x} is not a multiple of 8"),
            Error::FileId(id) => write!(f, "file id {id} is outside the allocation table"),
            Error::Crypto(s) => write!(f, "crypto error: {s}"),
            Error::Blz(s) => write!(f, "blz error: {s}"),
            Error::Open(p, e) => write!(f, "cannot open {}: {e}", p.display()),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::Open(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEof
        } else {
            Error::Io(e)
        }
    }
}
