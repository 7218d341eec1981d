//! RSA-1024 signature over the DSi cartridge header.
//!
//! The signed message is the first [`SIGNED_LEN`] header bytes with the
//! master hash already patched in at 0x328. The scheme is PKCS#1 v1.5 over
//! SHA-1, checked against [`crate::keys::HEADER_RSA_MODULUS`].

use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::keys::{
    HEADER_RSA_EXPONENT, HEADER_RSA_MODULUS, SIGNATURE_MASK_HASH_OFFSET, signature_mask,
};
use crate::{Error, Result};

/// Number of header bytes covered by the signature.
pub const SIGNED_LEN: usize = 0xE00;

/// Size of the signature block at header offset 0xF80.
pub const SIGNATURE_LEN: usize = 0x80;

/// What happened to the header signature during a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOutcome {
    /// The existing signature still verifies.
    Valid,
    /// The header was re-signed with the supplied private key.
    Resigned,
    /// The stale signature was left in place on request.
    KeptOriginal,
    /// The unsigned sentinel block was written.
    Sentinel,
}

/// The retail cartridge header key.
pub fn header_public_key() -> Result<RsaPublicKey> {
    RsaPublicKey::new(
        BigUint::from_bytes_be(&HEADER_RSA_MODULUS),
        BigUint::from(HEADER_RSA_EXPONENT),
    )
    .map_err(|_| Error::Crypto("invalid header public key"))
}

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&result);
    out
}

/// Check `signature` over `signed` with the retail key.
pub fn verify(signed: &[u8], signature: &[u8]) -> Result<bool> {
    let key = header_public_key()?;
    let hash = sha1(signed);
    Ok(key
        .verify(Pkcs1v15Sign::new::<Sha1>(), &hash, signature)
        .is_ok())
}

/// Sign `signed` with a private key matching the header modulus.
pub fn sign(key: &RsaPrivateKey, signed: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let hash = sha1(signed);
    let sig = key
        .sign(Pkcs1v15Sign::new::<Sha1>(), &hash)
        .map_err(|_| Error::Crypto("header signing failed"))?;
    let sig: [u8; SIGNATURE_LEN] = sig
        .try_into()
        .map_err(|_| Error::Crypto("signing key is not RSA-1024"))?;
    Ok(sig)
}

/// The unsigned sentinel block with the SHA-1 of `signed` spliced in.
pub fn sentinel(signed: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut sig = signature_mask();
    sig[SIGNATURE_MASK_HASH_OFFSET..].copy_from_slice(&sha1(signed));
    sig
}

/// Decide the signature to store after a rebuild.
///
/// A still-valid signature is kept. Otherwise the header is re-signed when
/// a key is available, left alone when `keep_original` is set, or given the
/// sentinel block.
pub fn resolve(
    signed: &[u8],
    current: &[u8; SIGNATURE_LEN],
    signing_key: Option<&RsaPrivateKey>,
    keep_original: bool,
) -> Result<([u8; SIGNATURE_LEN], SignatureOutcome)> {
    if verify(signed, current)? {
        return Ok((*current, SignatureOutcome::Valid));
    }
    if let Some(key) = signing_key {
        return Ok((sign(key, signed)?, SignatureOutcome::Resigned));
    }
    if keep_original {
        return Ok((*current, SignatureOutcome::KeptOriginal));
    }
    Ok((sentinel(signed), SignatureOutcome::Sentinel))
}
