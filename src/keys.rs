//! Fixed key material used by DSi-enhanced cartridges.
//!
//! Everything here is public knowledge baked into every DSi console:
//!
//! * **Digest key** - the 64-byte HMAC-SHA1 key used for the sector/block
//!   hash tables, the overlay HMAC table inside ARM9 and the header HMACs.
//! * **Modcrypt constant** - the `C` term of the key scrambler
//!   `normal = ((X ^ Y) + C) rol 42`.
//! * **Cartridge header modulus** - the RSA-1024 public modulus retail
//!   firmware verifies the header signature against (exponent 65537).
//! * **Unsigned signature mask** - the block emulators accept in place of a
//!   real signature; the header SHA-1 is spliced in at
//!   [`SIGNATURE_MASK_HASH_OFFSET`].
//!
//! This module is a plain data container. The operations live in
//! [`crate::crypto`].

/// HMAC-SHA1 key for the DSi digest tables.
pub const DIGEST_HMAC_KEY: [u8; 64] = [
    0x21, 0x06, 0xC0, 0xDE, 0xBA, 0x98, 0xCE, 0x3F, 0xA6, 0x92, 0xE3, 0x9D, 0x46, 0xF2, 0xED, 0x01,
    0x76, 0xE3, 0xCC, 0x08, 0x56, 0x23, 0x63, 0xFA, 0xCA, 0xD4, 0xEC, 0xDF, 0x9A, 0x62, 0x78, 0x34,
    0x8F, 0x6D, 0x63, 0x3C, 0xFE, 0x22, 0xCA, 0x92, 0x20, 0x88, 0x97, 0x23, 0xD2, 0xCF, 0xAE, 0xC2,
    0x32, 0x67, 0x8D, 0xFE, 0xCA, 0x83, 0x64, 0x98, 0xAC, 0xFD, 0x3E, 0x37, 0x87, 0x46, 0x58, 0x24,
];

/// Key scrambler constant, as a little-endian 128-bit integer.
pub const MODCRYPT_CONSTANT: u128 = 0xFFFE_FB4E_2959_0258_2A68_0F5F_1A4F_3E79;

/// Public exponent of the cartridge header key.
pub const HEADER_RSA_EXPONENT: u32 = 65537;

/// Big-endian RSA-1024 modulus of the cartridge header key.
pub const HEADER_RSA_MODULUS: [u8; 128] = [
    0x95, 0x6F, 0x79, 0x0D, 0xF0, 0x8B, 0xB8, 0x5A, 0x76, 0xAA, 0xEF, 0xA2, 0x7F, 0xE8, 0x74, 0x75,
    0x8B, 0xED, 0x9E, 0xDF, 0x9E, 0x9A, 0x67, 0x0C, 0xD8, 0x18, 0xBE, 0xB9, 0xB2, 0x88, 0x52, 0x03,
    0xB3, 0xFA, 0x11, 0xAE, 0xAA, 0x18, 0x65, 0x13, 0xB5, 0xD6, 0xBB, 0x85, 0xA3, 0x84, 0xD0, 0xD0,
    0xEF, 0xB3, 0x66, 0xCB, 0xC6, 0x05, 0x1A, 0xAA, 0x86, 0x82, 0x7A, 0xB7, 0x43, 0x11, 0xF5, 0x9C,
    0x9B, 0xFC, 0x6C, 0x70, 0x79, 0xD5, 0xF1, 0x7B, 0xD0, 0x81, 0x9F, 0x52, 0x20, 0x56, 0x73, 0x8C,
    0x72, 0x1F, 0x40, 0xCF, 0x23, 0x61, 0x93, 0x25, 0x90, 0xA3, 0xC5, 0xDC, 0x94, 0xCF, 0xD1, 0x7A,
    0x8C, 0xBC, 0x95, 0x4A, 0x91, 0x8A, 0xA8, 0x58, 0xF4, 0xD8, 0x04, 0xBA, 0xF7, 0xD3, 0xC1, 0xC4,
    0xD7, 0xB8, 0xF0, 0x77, 0x01, 0x2F, 0xA1, 0x70, 0x26, 0x0B, 0x2C, 0x04, 0x90, 0x56, 0xF3, 0xA5,
];

/// Where the SHA-1 of the signed header goes inside [`signature_mask`].
pub const SIGNATURE_MASK_HASH_OFFSET: usize = 0x80 - 0x14;

/// Build the unsigned-signature block: `00 01`, `FF` padding, a `00`
/// separator at 0x6B, then `CC` filler that the hash later overwrites.
pub const fn signature_mask() -> [u8; 0x80] {
    let mut mask = [0xFFu8; 0x80];
    mask[0] = 0x00;
    mask[1] = 0x01;
    mask[0x6B] = 0x00;
    let mut i = SIGNATURE_MASK_HASH_OFFSET;
    while i < 0x80 {
        mask[i] = 0xCC;
        i += 1;
    }
    mask
}
