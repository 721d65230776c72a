//! Wraparound-safe index arithmetic for the timestamp query ring.
//!
//! The query counter grows monotonically and is never reset. It is mapped onto
//! a fixed-size slot array with a modulo, and distances between two counter
//! values are taken in unsigned arithmetic so a counter that wrapped past
//! `u64::MAX` still yields the right (small, non-negative) distance.

/// Slot index of `counter` in a ring of `capacity` slots.
#[inline(always)]
pub fn slot_index(counter: u64, capacity: u32) -> u32 {
    (counter % capacity as u64) as u32
}

/// Number of counter steps from `begin` up to `end`.
/// Both operands are unsigned and of the same width, so overflow of the
/// underlying counter between the two samples is harmless.
#[inline(always)]
pub fn pending_count(begin: u64, end: u64) -> u64 {
    end.wrapping_sub(begin)
}
