//! Short deterministic version tags
//!
//! A tag is derived from the compact JSON text of a value: the first five
//! bytes of its MD5 digest are re-packed into symbols of the 32-letter
//! alphabet below. Tags are only ever compared for equality.

use crate::error::Result;
use serde::Serialize;

pub const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz012345";

/// Number of digest bytes folded into the tag
const DIGEST_BYTES: usize = 5;

/// Compute the version tag of any serializable value.
pub fn version<T: Serialize + ?Sized>(key: &T) -> Result<String> {
    let text = serde_json::to_string(key)?;
    Ok(version_of_text(&text))
}

/// Compute the version tag of already-canonical text.
#[must_use]
pub fn version_of_text(text: &str) -> String {
    let digest = md5::compute(text.as_bytes());
    pack(&digest.0[..DIGEST_BYTES])
}

fn pack(bytes: &[u8]) -> String {
    let mut result = String::with_capacity(8);
    let mut residue: u64 = 0;
    let mut pending: u32 = 0;

    for &byte in bytes {
        residue |= u64::from(byte) << pending;
        pending += 8;
        while residue >= 32 {
            result.push(symbol(residue));
            residue >>= 5;
            pending -= 5;
        }
    }
    result.push(symbol(residue));
    result
}

fn symbol(residue: u64) -> char {
    char::from(ALPHABET[(residue % 32) as usize])
}
