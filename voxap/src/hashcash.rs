//! # Hashcash login challenge solver
//!
//! The login service may answer a credential exchange with a proof-of-work
//! challenge: find a 16-byte suffix such that `SHA-1(context || prefix ||
//! suffix)` starts with at least `target_bits` zero bits. The solver walks
//! suffixes by 128-bit big-endian increment from a random starting point,
//! which covers the whole suffix space before repeating.

use std::time::{Duration, Instant};

use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Length of the solution suffix.
pub const SUFFIX_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashcashError {
    #[error("target difficulty must be positive")]
    InvalidTarget,

    #[error("challenge context and prefix must be non-empty")]
    EmptyInput,
}

/// A solved challenge: the suffix plus how long the search took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashcashSolution {
    pub suffix: [u8; SUFFIX_LEN],
    pub duration: Duration,
}

/// Counts leading zero bits of a digest, most significant bit first.
fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Increments a 128-bit big-endian counter in place, wrapping at the top.
fn increment(suffix: &mut [u8; SUFFIX_LEN]) {
    for byte in suffix.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
}

/// Solves a hashcash challenge.
pub fn solve(
    context: &[u8],
    prefix: &[u8],
    target_bits: i32,
) -> Result<HashcashSolution, HashcashError> {
    if target_bits <= 0 {
        return Err(HashcashError::InvalidTarget);
    }
    if context.is_empty() || prefix.is_empty() {
        return Err(HashcashError::EmptyInput);
    }

    let started = Instant::now();
    let mut suffix = [0u8; SUFFIX_LEN];
    rand::rng().fill_bytes(&mut suffix);

    loop {
        let mut hasher = Sha1::new();
        hasher.update(context);
        hasher.update(prefix);
        hasher.update(suffix);
        let digest = hasher.finalize();

        if leading_zero_bits(&digest) >= target_bits as u32 {
            return Ok(HashcashSolution {
                suffix,
                duration: started.elapsed(),
            });
        }
        increment(&mut suffix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solution_satisfies_target() {
        let context = b"login-context";
        let prefix = b"challenge-prefix";
        let target = 10;

        let solution = solve(context, prefix, target).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(context);
        hasher.update(prefix);
        hasher.update(solution.suffix);
        let digest = hasher.finalize();
        assert!(leading_zero_bits(&digest) >= target as u32);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert_eq!(solve(b"c", b"p", 0), Err(HashcashError::InvalidTarget));
        assert_eq!(solve(b"c", b"p", -3), Err(HashcashError::InvalidTarget));
        assert_eq!(solve(b"", b"p", 1), Err(HashcashError::EmptyInput));
        assert_eq!(solve(b"c", b"", 1), Err(HashcashError::EmptyInput));
    }

    #[test]
    fn leading_zero_bits_crosses_bytes() {
        assert_eq!(leading_zero_bits(&[0x80]), 0);
        assert_eq!(leading_zero_bits(&[0x01]), 7);
        assert_eq!(leading_zero_bits(&[0x00, 0x40]), 9);
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
    }

    #[test]
    fn increment_wraps_big_endian() {
        let mut suffix = [0xffu8; SUFFIX_LEN];
        increment(&mut suffix);
        assert_eq!(suffix, [0u8; SUFFIX_LEN]);

        let mut suffix = [0u8; SUFFIX_LEN];
        suffix[SUFFIX_LEN - 1] = 0xff;
        increment(&mut suffix);
        assert_eq!(suffix[SUFFIX_LEN - 2], 1);
        assert_eq!(suffix[SUFFIX_LEN - 1], 0);
    }
}
