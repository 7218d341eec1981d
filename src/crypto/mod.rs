//! Cryptography for DSi-enhanced cartridges.
//!
//! All functions take already-loaded data; the fixed key material lives in
//! [`crate::keys`]. The implementations are meant for offline image
//! processing and are not hardened against timing side-channels.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`digest`]      | HMAC-SHA1 sector/block/master hash tree |
//! | [`modcrypt`]    | Key scrambler and byte-reversed AES-128-CTR over DSi9/DSi7 |
//! | [`signature`]   | RSA-1024 PKCS#1 v1.5 header signature, verify and re-sign |
//! | [`secure_area`] | Secure-area detection and the caller-supplied KEY1 hook |
//!
//! ## Trust chain (brief)
//!
//! ```text
//! RSA signature (header 0xF80)
//!   └── header[0..0xE00]
//!         └── master hash (0x328) = HMAC(block table)
//!               └── block table = HMAC(sector table groups)
//!                     └── sector table = HMAC(each ROM sector)
//! ```

pub mod digest;
pub mod modcrypt;
pub mod secure_area;
pub mod signature;
