//! Bottom-LZ ("BLZ"), the backwards LZ77 used for ARM9 binaries and
//! overlays.
//!
//! The stream is decoded from the end of the file towards the start so the
//! console can decompress in place. An uncompressed head is kept as-is.
//!
//! ## Layout
//! ```text
//! [0x00]          Head              (copied verbatim)
//! [dec_len]       Compressed data   (stored reversed)
//! [..]            0xFF padding      (to a multiple of 4)
//! [len-8] u24     enc_len           (compressed data + padding + footer)
//! [len-5] u8      hdr_len           (padding + footer, 8..=0xB)
//! [len-4] u32     inc_len           (decompressed size - file size)
//! ```
//! `inc_len == 0` marks an uncompressed file followed by 4 zero bytes.
//!
//! ## Token stream (after reversal)
//! A flag byte precedes every 8 tokens, MSB first. A clear bit is a literal
//! byte. A set bit is a big-endian `u16`: length `(v >> 12) + 3`, distance
//! `(v & 0xFFF) + 3`.

use crate::{Error, Result};

const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 0x12;
const MIN_DIST: usize = 3;
const MAX_DIST: usize = 0x1002;
const HASH_BITS: u32 = 15;
const CHAIN_LIMIT: usize = 256;
const NONE: usize = usize::MAX;

/// Whether `data` ends in a compressed footer (`inc_len != 0`).
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 8 && data[data.len() - 4..] != [0, 0, 0, 0]
}

/// Decompress a BLZ file.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let len = data.len();
    if len < 4 {
        return Err(Error::Blz("stream too short"));
    }
    let inc_len = u32::from_le_bytes([data[len - 4], data[len - 3], data[len - 2], data[len - 1]]);
    if inc_len == 0 {
        return Ok(data[..len - 4].to_vec());
    }
    if len < 8 {
        return Err(Error::Blz("stream too short"));
    }

    let hdr_len = data[len - 5] as usize;
    if !(8..=0xB).contains(&hdr_len) {
        return Err(Error::Blz("bad header length"));
    }
    let enc_len =
        (u32::from_le_bytes([data[len - 8], data[len - 7], data[len - 6], 0]) & 0xFF_FFFF) as usize;
    if enc_len < hdr_len || enc_len > len {
        return Err(Error::Blz("bad encoded length"));
    }
    // A flag byte and eight matches unpack 17 bytes into 144.
    if inc_len as usize > enc_len * 8 {
        return Err(Error::Blz("bad decompressed length"));
    }
    let dec_len = len - enc_len;
    let raw_len = len + inc_len as usize;

    let mut packed: Vec<u8> = data[dec_len..len - hdr_len].to_vec();
    packed.reverse();
    let tail_len = raw_len - dec_len;
    let mut tail = Vec::with_capacity(tail_len);

    let mut pos = 0;
    let mut flags = 0u8;
    let mut mask = 0u8;
    while tail.len() < tail_len {
        mask >>= 1;
        if mask == 0 {
            flags = *packed.get(pos).ok_or(Error::Blz("truncated stream"))?;
            pos += 1;
            mask = 0x80;
        }
        if flags & mask == 0 {
            tail.push(*packed.get(pos).ok_or(Error::Blz("truncated stream"))?);
            pos += 1;
            continue;
        }

        let pair = packed
            .get(pos..pos + 2)
            .ok_or(Error::Blz("truncated stream"))?;
        let v = u16::from_be_bytes([pair[0], pair[1]]) as usize;
        pos += 2;
        let count = ((v >> 12) + MIN_MATCH).min(tail_len - tail.len());
        let dist = (v & 0xFFF) + MIN_DIST;
        if dist > tail.len() {
            return Err(Error::Blz("match before start of output"));
        }
        for _ in 0..count {
            tail.push(tail[tail.len() - dist]);
        }
    }

    tail.reverse();
    let mut out = Vec::with_capacity(raw_len);
    out.extend_from_slice(&data[..dec_len]);
    out.extend_from_slice(&tail);
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
enum Token {
    Literal(u8),
    Match { len: usize, dist: usize },
}

impl Token {
    fn raw_len(self) -> usize {
        match self {
            Token::Literal(_) => 1,
            Token::Match { len, .. } => len,
        }
    }

    fn packed_len(self) -> usize {
        match self {
            Token::Literal(_) => 1,
            Token::Match { .. } => 2,
        }
    }
}

fn hash3(r: &[u8], p: usize) -> usize {
    let v = (r[p] as u32) << 16 | (r[p + 1] as u32) << 8 | r[p + 2] as u32;
    (v.wrapping_mul(2_654_435_761) >> (32 - HASH_BITS)) as usize
}

/// Greedy LZ over the reversed input.
fn tokenize(r: &[u8]) -> Vec<Token> {
    let n = r.len();
    let mut head = vec![NONE; 1 << HASH_BITS];
    let mut prev = vec![NONE; n];

    let mut tokens = Vec::new();
    let mut p = 0;
    while p < n {
        let mut best_len = 0;
        let mut best_dist = 0;
        if p + MIN_MATCH <= n {
            let limit = MAX_MATCH.min(n - p);
            let mut cand = head[hash3(r, p)];
            let mut steps = 0;
            while cand != NONE && p - cand <= MAX_DIST && steps < CHAIN_LIMIT {
                let dist = p - cand;
                if dist >= MIN_DIST {
                    let mut l = 0;
                    while l < limit && r[cand + l] == r[p + l] {
                        l += 1;
                    }
                    if l > best_len {
                        best_len = l;
                        best_dist = dist;
                        if l == limit {
                            break;
                        }
                    }
                }
                cand = prev[cand];
                steps += 1;
            }
        }

        let token = if best_len >= MIN_MATCH {
            Token::Match {
                len: best_len,
                dist: best_dist,
            }
        } else {
            Token::Literal(r[p])
        };
        for q in p..p + token.raw_len() {
            if q + MIN_MATCH <= n {
                let h = hash3(r, q);
                prev[q] = head[h];
                head[h] = q;
            }
        }
        p += token.raw_len();
        tokens.push(token);
    }
    tokens
}

/// Number of leading tokens that maximises `raw bytes - packed bytes`,
/// which keeps in-place decompression from overrunning unread input.
fn safe_cut(tokens: &[Token]) -> (usize, usize, usize) {
    let (mut raw, mut packed) = (0usize, 0usize);
    let (mut best_k, mut best_raw, mut best_packed) = (0, 0, 0);
    let mut best_gain = 0isize;
    for (i, t) in tokens.iter().enumerate() {
        if i % 8 == 0 {
            packed += 1;
        }
        raw += t.raw_len();
        packed += t.packed_len();
        let gain = raw as isize - packed as isize;
        if gain >= best_gain && gain > 0 {
            best_gain = gain;
            best_k = i + 1;
            best_raw = raw;
            best_packed = packed;
        }
    }
    (best_k, best_raw, best_packed)
}

fn encode(tokens: &[Token], packed_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(packed_len);
    let mut flag_pos = 0;
    for (i, t) in tokens.iter().enumerate() {
        if i % 8 == 0 {
            flag_pos = out.len();
            out.push(0);
        }
        match *t {
            Token::Literal(b) => out.push(b),
            Token::Match { len, dist } => {
                out[flag_pos] |= 0x80 >> (i % 8);
                let v = ((len - MIN_MATCH) << 12 | (dist - MIN_DIST)) as u16;
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
    out
}

/// Compress `data`. Returns [`None`] when compression would not shrink it.
pub fn try_compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut r = data.to_vec();
    r.reverse();
    let tokens = tokenize(&r);
    let (k, raw, packed) = safe_cut(&tokens);
    if k == 0 {
        return None;
    }

    let mut stream = encode(&tokens[..k], packed);
    stream.reverse();

    let head = data.len() - raw;
    let pad = (4 - (head + stream.len()) % 4) % 4;
    let hdr_len = 8 + pad;
    let enc_len = stream.len() + hdr_len;
    let file_len = head + enc_len;
    if file_len >= data.len() || enc_len > 0xFF_FFFF {
        return None;
    }

    let mut out = Vec::with_capacity(file_len);
    out.extend_from_slice(&data[..head]);
    out.extend_from_slice(&stream);
    out.resize(out.len() + pad, 0xFF);
    out.extend_from_slice(&(enc_len as u32 | (hdr_len as u32) << 24).to_le_bytes());
    out.extend_from_slice(&((data.len() - file_len) as u32).to_le_bytes());
    Some(out)
}

/// Compress `data`, falling back to the uncompressed form (`data` followed
/// by a zero `inc_len`) when nothing is gained.
pub fn compress(data: &[u8]) -> Vec<u8> {
    try_compress(data).unwrap_or_else(|| {
        let mut out = data.to_vec();
        out.extend_from_slice(&[0; 4]);
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(len);
        let mut x: u32 = 0x1234_5678;
        for i in 0..len {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            // Mostly repetitive with some noise, like ARM code.
            v.push(if i % 7 == 0 { x as u8 } else { (i % 29) as u8 });
        }
        v
    }

    /// Decode the way the console does: backwards, inside one buffer.
    fn decompress_in_place(file: &[u8]) -> Vec<u8> {
        let len = file.len();
        let inc_len = u32::from_le_bytes(file[len - 4..].try_into().unwrap()) as usize;
        let hdr_len = file[len - 5] as usize;
        let enc_len = u32::from_le_bytes([file[len - 8], file[len - 7], file[len - 6], 0]) as usize;
        let dec_len = len - enc_len;

        let mut buf = vec![0u8; len + inc_len];
        buf[..len].copy_from_slice(file);
        let mut rp = len - hdr_len;
        let mut wp = buf.len();
        while wp > dec_len {
            rp -= 1;
            let flags = buf[rp];
            for bit in 0..8 {
                if wp == dec_len {
                    break;
                }
                if flags & (0x80 >> bit) == 0 {
                    rp -= 1;
                    wp -= 1;
                    assert!(wp >= rp, "literal overwrote unread input");
                    buf[wp] = buf[rp];
                } else {
                    let hi = buf[rp - 1] as usize;
                    let lo = buf[rp - 2] as usize;
                    rp -= 2;
                    let v = hi << 8 | lo;
                    let count = ((v >> 12) + 3).min(wp - dec_len);
                    let dist = (v & 0xFFF) + 3;
                    for _ in 0..count {
                        wp -= 1;
                        assert!(wp >= rp, "match overwrote unread input");
                        buf[wp] = buf[wp + dist];
                    }
                }
            }
        }
        buf
    }

    #[test]
    fn test_round_trip() {
        let data = sample(0x3000);
        let packed = compress(&data);
        assert!(packed.len() < data.len());
        assert!(is_compressed(&packed));
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_in_place_decode_is_safe() {
        let data = sample(0x2345);
        let packed = compress(&data);
        assert_eq!(packed.len() % 4, 0);
        assert_eq!(decompress_in_place(&packed), data);
    }

    #[test]
    fn test_incompressible_is_stored() {
        let data: Vec<u8> = (0..64u32).map(|i| (i * 97 % 251) as u8).collect();
        let packed = compress(&data);
        assert!(!is_compressed(&packed));
        assert_eq!(&packed[..data.len()], &data[..]);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_runs_use_overlapping_matches() {
        let data = vec![0xAAu8; 0x400];
        let packed = compress(&data);
        assert!(packed.len() < 0x100);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_rejects_oversized_footer() {
        let mut packed = compress(&vec![0u8; 0x8000]);
        assert_eq!(decompress(&packed).unwrap(), vec![0u8; 0x8000]);

        let n = packed.len();
        packed[n - 4..].copy_from_slice(&0xF000_0000u32.to_le_bytes());
        assert!(matches!(
            decompress(&packed),
            Err(Error::Blz("bad decompressed length"))
        ));
    }

    #[test]
    fn test_rejects_bad_header_length() {
        let mut packed = compress(&vec![0u8; 0x100]);
        let n = packed.len();
        packed[n - 5] = 4;
        assert!(matches!(decompress(&packed), Err(Error::Blz(_))));
    }
}
