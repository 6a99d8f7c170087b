//! Millisecond clock helpers. Wire timestamps are a 32-bit millisecond
//! counter that wraps; differences use the 2^31 half-space convention.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic milliseconds since process start, unwrapped. Used for ordering
/// retransmit deadlines internally.
pub fn now_ms64() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Monotonic milliseconds truncated to 32 bits, as carried on the wire.
pub fn now_ms32() -> u32 {
    now_ms64() as u32
}

/// Milliseconds elapsed since `earlier_ms`, tolerating 32-bit wrap.
pub fn elapsed_since(earlier_ms: u32) -> u32 {
    now_ms32().wrapping_sub(earlier_ms)
}

/// Builds an absolute 32-bit deadline `after_ms` from `now_ms`.
pub fn deadline_after(now_ms: u32, after_ms: u32) -> u32 {
    now_ms.wrapping_add(after_ms)
}

/// Remaining milliseconds until `deadline_ms`, or 0 if it has passed.
/// A difference beyond 2^31 means the deadline is behind us.
pub fn time_to_deadline(now_ms: u32, deadline_ms: u32) -> u32 {
    let delta = deadline_ms.wrapping_sub(now_ms);
    if delta > 0x8000_0000 { 0 } else { delta }
}
