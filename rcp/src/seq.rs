//! Arithmetic over the bounded sequence-number ring `Z / MAX_SEQ_NUM`.
//!
//! Sequence and acknowledgment numbers are `u16` but the space is smaller
//! than `u16`: every number lies in `[0, MAX_SEQ_NUM)` and wraps modulo
//! [`MAX_SEQ_NUM`], never modulo 65536.
//!
//! Ordering uses serial-number arithmetic: `b` is ahead of `a` when the
//! forward distance from `a` to `b` is non-zero and less than half the ring.
//!
//! ```text
//!        a            a + HALF
//!  ──────┼──────────────┼──────────────▶ (wraps at MAX_SEQ_NUM)
//!        │<── ahead ───▶│<── behind ──▶
//! ```

/// Size of the sequence space.
pub const MAX_SEQ_NUM: u16 = 30720;

/// Half the ring: the furthest ahead one number may be of another.
pub const HALF: u16 = MAX_SEQ_NUM / 2;

/// `(seq + delta) mod MAX_SEQ_NUM`.
#[inline]
pub fn advance(seq: u16, delta: u16) -> u16 {
    ((u32::from(seq) + u32::from(delta)) % u32::from(MAX_SEQ_NUM)) as u16
}

/// Forward distance from `from` to `to` around the ring.
#[inline]
pub fn distance(from: u16, to: u16) -> u16 {
    let m = u32::from(MAX_SEQ_NUM);
    ((u32::from(to) % m + m - u32::from(from) % m) % m) as u16
}

/// `true` when `a` comes strictly before `b`.
///
/// Well-defined only while the two are less than [`HALF`] apart.
#[inline]
pub fn precedes(a: u16, b: u16) -> bool {
    let d = distance(a, b);
    d != 0 && d < HALF
}

/// `true` when `seq` lies in `[start, start + size)` modulo the ring.
#[inline]
pub fn in_window(seq: u16, start: u16, size: u16) -> bool {
    u32::from(distance(start, seq)) < u32::from(size)
}
