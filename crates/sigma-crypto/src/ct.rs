//! Constant-time primitives.
//!
//! Every function here touches all of its input regardless of content and
//! routes intermediate results through `black_box` so the optimizer cannot
//! reintroduce an early exit.

use std::hint::black_box;

/// Compare two byte slices. Slices of different length compare unequal; the
/// length itself is not treated as secret.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff = black_box(diff | (x ^ y));
    }
    ct_is_zero_byte(diff)
}

#[must_use]
pub fn ct_eq_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq(a, b)
}

/// `a` when `choice` is true, otherwise `b`.
#[must_use]
pub fn ct_select_u8(choice: bool, a: u8, b: u8) -> u8 {
    let mask = black_box((choice as u8).wrapping_neg());
    (a & mask) | (b & !mask)
}

/// Copy `src` into `dst` when `choice` is true; `dst` is rewritten either way.
///
/// # Panics
/// Panics if the slices differ in length.
pub fn ct_copy_if(choice: bool, dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len(), "ct_copy_if length mismatch");
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = ct_select_u8(choice, *s, *d);
    }
}

/// True when every byte is zero.
#[must_use]
pub fn ct_is_zero(bytes: &[u8]) -> bool {
    let mut acc = 0u8;
    for b in bytes {
        acc = black_box(acc | b);
    }
    ct_is_zero_byte(acc)
}

fn ct_is_zero_byte(x: u8) -> bool {
    // (x | -x) has its top bit set iff x != 0
    let x = x as u16;
    let nonzero = ((x | x.wrapping_neg()) >> 8) & 1;
    black_box(nonzero) == 0
}
