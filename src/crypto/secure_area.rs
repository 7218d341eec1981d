//! The ARM9 secure area at 0x4000..0x8000.
//!
//! Retail images store it KEY1-encrypted. Dumps made with some tools store
//! it decrypted, recognisable by the `E7FFDEFF E7FFDEFF` marker at its start.
//! The header CRC and the DSi sector hashes are always computed over the
//! encrypted form, so a decrypted secure area has to be re-encrypted first.
//! KEY1 needs the console BIOS key table and is left to the caller through
//! [`SecureAreaCipher`].

use log::warn;

use crate::Result;
use crate::checksum::crc16;

/// Absolute offset of the secure area.
pub const SECURE_AREA_OFFSET: u64 = 0x4000;
/// Size of the secure area.
pub const SECURE_AREA_SIZE: usize = 0x4000;
/// First eight bytes of a decrypted secure area.
pub const DECRYPTED_MARKER: u64 = 0xE7FF_DEFF_E7FF_DEFF;

/// KEY1 secure-area encryption supplied by the caller.
pub trait SecureAreaCipher {
    /// Encrypt a decrypted secure area in place for `game_code`.
    fn encrypt(&self, game_code: &[u8; 4], area: &mut [u8]) -> Result<()>;
}

/// Whether `area` starts with the decrypted marker.
pub fn is_decrypted(area: &[u8]) -> bool {
    area.get(..8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        == Some(DECRYPTED_MARKER)
}

/// Bring `area` into its stored (encrypted) form.
///
/// Without a cipher the area is left as-is and a warning is logged; callers
/// then get checksums over plaintext.
pub fn encrypt_if_decrypted(
    area: &mut [u8],
    game_code: &[u8; 4],
    cipher: Option<&dyn SecureAreaCipher>,
) -> Result<()> {
    if !is_decrypted(area) {
        return Ok(());
    }
    match cipher {
        Some(c) => c.encrypt(game_code, area),
        None => {
            warn!("secure area is decrypted and no KEY1 cipher was supplied; using plaintext");
            Ok(())
        }
    }
}

/// CRC16 of the secure area in its stored form.
pub fn secure_area_crc(
    area: &[u8],
    game_code: &[u8; 4],
    cipher: Option<&dyn SecureAreaCipher>,
) -> Result<u16> {
    let mut buf = area.to_vec();
    encrypt_if_decrypted(&mut buf, game_code, cipher)?;
    Ok(crc16(&buf))
}
