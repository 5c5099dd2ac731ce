use crate::qr::{
    ErrorCorrection, alignment_pattern_positions, encode_format, encode_version, modules_per_side,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

/// Module grid of a QR symbol with random data modules.
///
/// Function patterns (finders, separators, timing, alignment, dark module) and both
/// copies of the format and version information are laid out as in a real symbol.
/// The data area is random and not masked, so the result is geometrically valid but
/// carries no payload. Row-major, `1` = dark.
#[must_use]
pub fn qr_symbol_modules(version: u32, error_correction: ErrorCorrection, mask: u8, seed: u64) -> Vec<u8> {
    let size = modules_per_side(version);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut modules: Vec<u8> = (0..size * size).map(|_| u8::from(rng.gen_bool(0.5))).collect();
    let mut set = |x: usize, y: usize, dark: bool| modules[y * size + x] = u8::from(dark);

    // Finders with their separators.
    for (ox, oy) in [(0usize, 0usize), (size - 7, 0), (0, size - 7)] {
        for dy in -1i32..=7 {
            for dx in -1i32..=7 {
                let (x, y) = (ox as i32 + dx, oy as i32 + dy);
                if x < 0 || y < 0 || x >= size as i32 || y >= size as i32 {
                    continue;
                }
                let ring = (dx == 0 || dx == 6 || dy == 0 || dy == 6) && (0..=6).contains(&dx) && (0..=6).contains(&dy);
                let centre = (2..=4).contains(&dx) && (2..=4).contains(&dy);
                set(x as usize, y as usize, ring || centre);
            }
        }
    }

    for i in 8..size - 8 {
        set(i, 6, i % 2 == 0);
        set(6, i, i % 2 == 0);
    }

    for (cx, cy) in alignment_pattern_positions(version) {
        for dy in -2i32..=2 {
            for dx in -2i32..=2 {
                let dark = dx.abs() == 2 || dy.abs() == 2 || (dx == 0 && dy == 0);
                set((cx as i32 + dx) as usize, (cy as i32 + dy) as usize, dark);
            }
        }
    }

    let format = encode_format((error_correction.bits() << 3) | u32::from(mask & 0b111));
    let bit = |i: usize| (format >> i) & 1 == 1;
    for i in 0..15 {
        let first = match i {
            0..=5 => (8, i),
            6 => (8, 7),
            7 => (8, 8),
            8 => (7, 8),
            _ => (14 - i, 8),
        };
        let second = if i < 8 { (size - 1 - i, 8) } else { (8, size - 15 + i) };
        set(first.0, first.1, bit(i));
        set(second.0, second.1, bit(i));
    }
    set(8, size - 8, true);

    if version >= 7 {
        let info = encode_version(version);
        for i in 0..18 {
            let dark = (info >> i) & 1 == 1;
            let (a, b) = (size - 11 + i % 3, i / 3);
            set(a, b, dark);
            set(b, a, dark);
        }
    }

    modules
}
