//! Payload code of the 4x4 data area: a (16, 10) cyclic code over GF(2).
//!
//! Ten message bits are shifted up by six, the remainder of the division by the
//! generator polynomial fills the low six bits, and the word is XORed with a fixed
//! mask so neither an all-dark nor an all-bright data area is a valid codeword.
//! The code has minimum distance 4: decoding corrects one flipped bit and rejects two.

use crate::error::{OcutagError, Result};
use std::sync::OnceLock;

/// Number of distinct tag ids.
pub const MAX_TAG_ID: u32 = 1024;

/// Bits in a codeword.
pub const CODEWORD_BITS: u32 = 16;

const MESSAGE_BITS: u32 = 10;
const PARITY_BITS: u32 = CODEWORD_BITS - MESSAGE_BITS;

/// x^6 + x^5 + x^3 + x^2 + x + 1
const GENERATOR: u32 = 0b110_1111;

const MASK: u16 = 0b1101_0100_0001_0010;

/// Largest Hamming distance that is still corrected.
const MAX_CORRECTED_BITS: u32 = 1;

fn parity(message: u32) -> u32 {
    let mut remainder = message << PARITY_BITS;
    for bit in (PARITY_BITS..CODEWORD_BITS).rev() {
        if remainder & (1 << bit) != 0 {
            remainder ^= GENERATOR << (bit - PARITY_BITS);
        }
    }
    remainder
}

fn codebook() -> &'static [u16] {
    static CODEBOOK: OnceLock<Vec<u16>> = OnceLock::new();
    CODEBOOK.get_or_init(|| {
        (0..MAX_TAG_ID)
            .map(|id| {
                let word = (id << PARITY_BITS) | parity(id);
                (word as u16) ^ MASK
            })
            .collect()
    })
}

/// Encode a tag id into its 16-bit data matrix.
///
/// # Errors
/// Returns [`OcutagError::TagIdOutOfRange`] for ids of [`MAX_TAG_ID`] and above.
pub fn encode(tag_id: u32) -> Result<u16> {
    codebook()
        .get(tag_id as usize)
        .copied()
        .ok_or(OcutagError::TagIdOutOfRange(tag_id))
}

/// Decode a data matrix, correcting at most one bit error.
///
/// Returns `None` if the nearest codeword is ambiguous or more than one bit away.
#[must_use]
pub fn decode(data_matrix: u16) -> Option<u32> {
    let mut best: Option<u32> = None;
    let mut best_distance = u32::MAX;
    let mut ties = 0usize;

    for (id, &codeword) in codebook().iter().enumerate() {
        let distance = hamming_distance(codeword, data_matrix);
        if distance < best_distance {
            best_distance = distance;
            best = Some(id as u32);
            ties = 0;
        } else if distance == best_distance {
            ties += 1;
        }
    }

    if ties > 0 || best_distance > MAX_CORRECTED_BITS {
        return None;
    }
    best
}

/// Number of differing bits.
#[inline]
#[must_use]
pub fn hamming_distance(a: u16, b: u16) -> u32 {
    (a ^ b).count_ones()
}

/// Smallest Hamming distance between two distinct codewords.
#[must_use]
pub fn minimum_distance() -> u32 {
    let book = codebook();
    let mut min = u32::MAX;
    for (i, &a) in book.iter().enumerate() {
        for &b in &book[i + 1..] {
            min = min.min(hamming_distance(a, b));
        }
    }
    min
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_minimum_distance_is_four() {
        assert_eq!(minimum_distance(), 4);
    }

    #[test]
    fn test_degenerate_words_rejected() {
        assert_eq!(decode(0x0000), None);
        assert_eq!(decode(0xFFFF), None);
        assert!(codebook().iter().all(|&c| c != 0x0000 && c != 0xFFFF));
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(encode(1024), Err(OcutagError::TagIdOutOfRange(1024)));
    }

    proptest! {
        #[test]
        fn prop_single_bit_errors_corrected(id in 0..MAX_TAG_ID, bit in 0..CODEWORD_BITS) {
            let word = encode(id).unwrap();
            prop_assert_eq!(decode(word), Some(id));
            prop_assert_eq!(decode(word ^ (1 << bit)), Some(id));
        }

        #[test]
        fn prop_double_bit_errors_rejected(id in 0..MAX_TAG_ID, a in 0..CODEWORD_BITS, b in 0..CODEWORD_BITS) {
            prop_assume!(a != b);
            let word = encode(id).unwrap() ^ (1 << a) ^ (1 << b);
            prop_assert_eq!(decode(word), None);
        }
    }
}
