//! Bob Jenkins' lookup2 hash, as used for conntrack bucket selection
//!
//! Keys of exactly one, two or three 32-bit words get the dedicated word
//! mixers; everything else goes through the byte-wise variant.

use crate::types::Value;
use super::ConntrackError;

/// Process-wide hash seed
pub const HASH_INITVAL: u32 = 0x5de9_7c2d;

const GOLDEN_RATIO: u32 = 0x9e37_79b9;

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 13);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 8);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 13);
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 12);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 16);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 5);
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 3);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 10);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 15);
}

#[inline]
fn le_word(k: &[u8]) -> u32 {
    u32::from(k[0]) | u32::from(k[1]) << 8 | u32::from(k[2]) << 16 | u32::from(k[3]) << 24
}

/// Hash an arbitrary byte string
pub fn jhash(key: &[u8], initval: u32) -> u32 {
    let mut a = GOLDEN_RATIO;
    let mut b = GOLDEN_RATIO;
    let mut c = initval;

    let mut k = key;
    while k.len() >= 12 {
        a = a.wrapping_add(le_word(&k[0..4]));
        b = b.wrapping_add(le_word(&k[4..8]));
        c = c.wrapping_add(le_word(&k[8..12]));
        mix(&mut a, &mut b, &mut c);
        k = &k[12..];
    }

    c = c.wrapping_add(key.len() as u32);

    // Tail bytes; the lowest byte of c is reserved for the length
    let len = k.len();
    if len >= 11 { c = c.wrapping_add(u32::from(k[10]) << 24); }
    if len >= 10 { c = c.wrapping_add(u32::from(k[9]) << 16); }
    if len >= 9 { c = c.wrapping_add(u32::from(k[8]) << 8); }
    if len >= 8 { b = b.wrapping_add(u32::from(k[7]) << 24); }
    if len >= 7 { b = b.wrapping_add(u32::from(k[6]) << 16); }
    if len >= 6 { b = b.wrapping_add(u32::from(k[5]) << 8); }
    if len >= 5 { b = b.wrapping_add(u32::from(k[4])); }
    if len >= 4 { a = a.wrapping_add(u32::from(k[3]) << 24); }
    if len >= 3 { a = a.wrapping_add(u32::from(k[2]) << 16); }
    if len >= 2 { a = a.wrapping_add(u32::from(k[1]) << 8); }
    if len >= 1 { a = a.wrapping_add(u32::from(k[0])); }

    mix(&mut a, &mut b, &mut c);
    c
}

pub fn jhash_3words(a: u32, b: u32, c: u32, initval: u32) -> u32 {
    let mut a = a.wrapping_add(GOLDEN_RATIO);
    let mut b = b.wrapping_add(GOLDEN_RATIO);
    let mut c = c.wrapping_add(initval);
    mix(&mut a, &mut b, &mut c);
    c
}

pub fn jhash_2words(a: u32, b: u32, initval: u32) -> u32 {
    jhash_3words(a, b, 0, initval)
}

pub fn jhash_1word(a: u32, initval: u32) -> u32 {
    jhash_3words(a, 0, 0, initval)
}

#[inline]
fn ne_word(bytes: &[u8], idx: usize) -> u32 {
    let s = idx * 4;
    u32::from_ne_bytes([bytes[s], bytes[s + 1], bytes[s + 2], bytes[s + 3]])
}

/// Compute the conntrack hash of a forward value, folding in the reverse
/// value when present. `hash(a, Some(b))` and `hash(b, Some(a))` are in
/// general different; the reverse table relies on that asymmetry.
pub fn conntrack_hash(fwd: &Value, rev: Option<&Value>) -> Result<u32, ConntrackError> {
    let fwd_bytes = fwd.canonical_bytes();
    if fwd_bytes.is_empty() {
        return Err(ConntrackError::EmptyKey);
    }

    let Some(rev) = rev else {
        let hash = match fwd_bytes.len() {
            4 => jhash_1word(ne_word(&fwd_bytes, 0), HASH_INITVAL),
            8 => jhash_2words(ne_word(&fwd_bytes, 0), ne_word(&fwd_bytes, 1), HASH_INITVAL),
            12 => jhash_3words(
                ne_word(&fwd_bytes, 0),
                ne_word(&fwd_bytes, 1),
                ne_word(&fwd_bytes, 2),
                HASH_INITVAL,
            ),
            _ => jhash(&fwd_bytes, HASH_INITVAL),
        };
        return Ok(hash);
    };

    let rev_bytes = rev.canonical_bytes();
    if rev_bytes.is_empty() {
        return Err(ConntrackError::EmptyKey);
    }

    let hash = match (fwd_bytes.len(), rev_bytes.len()) {
        (2, 2) => {
            let f = u16::from_ne_bytes([fwd_bytes[0], fwd_bytes[1]]);
            let r = u16::from_ne_bytes([rev_bytes[0], rev_bytes[1]]);
            jhash_1word(u32::from(f) << 16 | u32::from(r), HASH_INITVAL)
        }
        (4, 4) => jhash_2words(ne_word(&fwd_bytes, 0), ne_word(&rev_bytes, 0), HASH_INITVAL),
        _ => {
            let hash_fwd = jhash(&fwd_bytes, HASH_INITVAL);
            jhash(&rev_bytes, hash_fwd)
        }
    };

    Ok(hash)
}
