//! Wraparound arithmetic for handled counts.
//!
//! Counts live in `[0, 2^32)`. They are plain `u32` values and every operation
//! wraps, so a count that overflows starts again at zero and the distance from
//! an older count to a newer one stays correct across the wrap.

/// `(n + 1) mod 2^32`
pub fn increment(n: u32) -> u32 {
    n.wrapping_add(1)
}

/// How far `newer` is ahead of `older`, `(newer - older) mod 2^32`.
///
/// Never negative: a `newer` that has wrapped past zero still yields the
/// forward distance.
pub fn distance(newer: u32, older: u32) -> u32 {
    newer.wrapping_sub(older)
}
