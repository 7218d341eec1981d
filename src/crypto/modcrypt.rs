//! DSi "modcrypt" - AES-128-CTR over the DSi9/DSi7 payloads.
//!
//! The DSi AES engine works on byte-reversed words, so a plain AES-CTR
//! reproduces it only if the key and initial counter are reversed and each
//! keystream block is reversed before it is XORed in.
//!
//! ## Key selection
//! ```text
//! debug  (twl_flags & 4 or app_flags[3] & 0x80):
//!     key = title[12] || game_code[4]
//! retail:
//!     X   = "Nintendo" || game_code || reverse(game_code)
//!     Y   = hmac_arm9i[0..16]
//!     key = ((X ^ Y) + C) rol 42          (128-bit little-endian)
//! ```
//! The counter for each region is the first 16 bytes of the matching
//! header HMAC (`hmac_arm9` for DSi9, `hmac_arm7` for DSi7).

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};

use crate::formats::header::Header;
use crate::keys::MODCRYPT_CONSTANT;
use crate::{Error, Result};

/// A 16-byte modcrypt key, in header byte order.
pub type Key = [u8; 16];

/// Key scrambler: `((X ^ Y) + C) rol 42` over little-endian `u128`s.
pub fn scramble(key_x: &Key, key_y: &Key) -> Key {
    let x = u128::from_le_bytes(*key_x);
    let y = u128::from_le_bytes(*key_y);
    (x ^ y)
        .wrapping_add(MODCRYPT_CONSTANT)
        .rotate_left(42)
        .to_le_bytes()
}

/// Retail KeyX for a game code.
pub fn key_x(game_code: &[u8; 4]) -> Key {
    let mut x = [0u8; 16];
    x[..8].copy_from_slice(b"Nintendo");
    x[8..12].copy_from_slice(game_code);
    for (i, b) in game_code.iter().rev().enumerate() {
        x[12 + i] = *b;
    }
    x
}

/// Derive the modcrypt key for a DSi-enhanced header.
///
/// Returns [`Error::Crypto`] when the header carries no DSi extension.
pub fn derive_key(header: &Header) -> Result<Key> {
    let twl = header
        .twl
        .as_ref()
        .ok_or(Error::Crypto("modcrypt key needs a DSi header"))?;

    if header.twl_flags & 0x04 != 0 || twl.app_flags[3] & 0x80 != 0 {
        let mut key = [0u8; 16];
        key[..12].copy_from_slice(&header.title);
        key[12..].copy_from_slice(&header.game_code);
        return Ok(key);
    }

    let mut key_y = [0u8; 16];
    key_y.copy_from_slice(&twl.hmac_arm9i[..16]);
    Ok(scramble(&key_x(&header.game_code), &key_y))
}

/// Initial counter for a region: the first 16 bytes of its header HMAC.
pub fn counter(hmac: &[u8; 20]) -> [u8; 16] {
    let mut ctr = [0u8; 16];
    ctr.copy_from_slice(&hmac[..16]);
    ctr
}

fn increment_counter(counter: &mut [u8; 16]) {
    for i in (0..16).rev() {
        counter[i] = counter[i].wrapping_add(1);
        if counter[i] != 0 {
            break;
        }
    }
}

/// Encrypt or decrypt `data` in place.
pub fn crypt(key: &Key, counter: &[u8; 16], data: &mut [u8]) {
    let mut k = *key;
    k.reverse();
    let cipher = Aes128::new((&k).into());
    let mut ctr = *counter;
    ctr.reverse();

    let mut stream = aes::Block::default();
    for chunk in data.chunks_mut(16) {
        stream.copy_from_slice(&ctr);
        cipher.encrypt_block(&mut stream);
        for (d, s) in chunk.iter_mut().zip(stream.iter().rev()) {
            *d ^= s;
        }
        increment_counter(&mut ctr);
    }
}
