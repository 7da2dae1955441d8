//! Wrapping millisecond ticks.
//!
//! Ticks are 32-bit counters that roll over roughly every 49.7 days. Never
//! compare two ticks with `<`/`>`; use [`diff`] or [`is_after`], which stay
//! correct across the wrap as long as the two ticks are less than 2^31 ms
//! apart.

/// Milliseconds since boot, truncated to 32 bits.
pub type Tick = u32;

/// Signed distance from `b` to `a`: positive when `a` is after `b`.
///
/// `diff(5, 0xFFFF_FFFB) == 10`
/// `diff(0xFFFF_FFFB, 5) == -10`
#[inline]
pub fn diff(a: Tick, b: Tick) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Returns whether `a` is strictly after `b`.
#[inline]
pub fn is_after(a: Tick, b: Tick) -> bool {
    diff(a, b) > 0
}

/// Offsets a tick by a signed millisecond delta.
#[inline]
pub fn add(t: Tick, delta: i32) -> Tick {
    t.wrapping_add(delta as u32)
}

/// Rounds a millisecond span to whole minutes, as shown to residents.
pub fn to_minutes(ms: u32) -> u32 {
    (ms / 1000 + 30) / 60
}
