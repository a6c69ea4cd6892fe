//! Bit-packed base62 for the v0 payload.
//!
//! This is the layout legacy v0 keys were issued with. The input is read six
//! bits at a time from its least significant end, and each group becomes one
//! character of `0-9A-Za-z`. A group of the form `1111x` would index past the
//! alphabet, so it is written as 30 or 31 and consumes only five bits.
//!
//! The output is not fixed width: a 24-byte payload encodes to 32 through
//! 39 characters.

use crate::error::{AccessKeyError, Result};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const COMPACT_MASK: u8 = 0x1e;
const MASK_5_BITS: u8 = 0x1f;

pub(crate) fn encode(src: &[u8]) -> String {
    let mut out = String::with_capacity(src.len() * 8 / 5 + 1);
    let mut pos = src.len() * 8;

    while pos > 0 {
        let start = pos.saturating_sub(6);
        let (i, j, len) = if start == 0 {
            (0, 0, pos)
        } else {
            let i = start / 8;
            (i, start % 8, ((i + 1) * 8 - start).min(6))
        };

        let mut group = (src[i] >> (8 - j - len)) & ((1u8 << len) - 1);
        if len < 6 && start > 0 {
            // The group straddles a byte boundary.
            let rest = 6 - len;
            group = (group << rest) | (src[i + 1] >> (8 - rest));
        }

        let mut next = start;
        if group & COMPACT_MASK == COMPACT_MASK {
            if start > 0 || group > MASK_5_BITS {
                next += 1;
            }
            group &= MASK_5_BITS;
        }
        out.push(char::from(ALPHABET[group as usize]));
        pos = next;
    }
    out
}

pub(crate) fn decode(encoded: &str) -> Result<Vec<u8>> {
    let chars = encoded.as_bytes();
    let mut out = Vec::with_capacity(chars.len() * 6 / 8 + 1);
    let mut acc = 0u32;
    let mut bits = 0u32;

    for (n, &c) in chars.iter().enumerate() {
        let x = digit(c).ok_or(AccessKeyError::InvalidEncoding("base62"))?;
        acc |= u32::from(x) << bits;
        bits += if n + 1 == chars.len() {
            // The last group holds only what was left of the input.
            u8::BITS - x.leading_zeros()
        } else if x & COMPACT_MASK == COMPACT_MASK {
            5
        } else {
            6
        };
        if bits >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push(acc as u8);
    }
    out.reverse();
    Ok(out)
}

fn digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'Z' => Some(c - b'A' + 10),
        b'a'..=b'z' => Some(c - b'a' + 36),
        _ => None,
    }
}
