//! HMAC-SHA1 digests for the DSi hash tree.
//!
//! ## Tree shape
//! ```text
//! sector table : one HMAC per digest_sector_size bytes
//!                (secure area, rest of NTR region, TWL region)
//! block table  : one HMAC per digest_block_sectorcount sector entries
//! master hash  : one HMAC over the whole block table (header 0x328)
//! ```
//!
//! All HMACs use [`crate::keys::DIGEST_HMAC_KEY`].

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::keys::DIGEST_HMAC_KEY;
use crate::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Size of one table entry.
pub const DIGEST_LEN: usize = 20;

/// HMAC-SHA1 of `data` under the digest key.
pub fn hmac_sha1(data: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    let mut mac = HmacSha1::new_from_slice(&DIGEST_HMAC_KEY)
        .map_err(|_| Error::Crypto("digest key rejected"))?;
    mac.update(data);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// One HMAC per `sector_size` chunk of `data`. A trailing short chunk is
/// hashed as-is.
pub fn sector_hashes(data: &[u8], sector_size: usize) -> Result<Vec<[u8; DIGEST_LEN]>> {
    data.chunks(sector_size).map(hmac_sha1).collect()
}

/// One HMAC per group of `sectors_per_block` entries of a sector table.
pub fn block_hashes(
    sector_table: &[u8],
    sectors_per_block: usize,
) -> Result<Vec<[u8; DIGEST_LEN]>> {
    sector_table
        .chunks(sectors_per_block * DIGEST_LEN)
        .map(hmac_sha1)
        .collect()
}

/// The master hash stored in the header.
pub fn master_hash(block_table: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    hmac_sha1(block_table)
}
