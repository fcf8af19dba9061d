//! Initial segment plan construction.

use super::Segment;

/// Builds a segment plan covering `[0, total_bytes - 1]` with
/// `min(connections, total_bytes)` contiguous, non-overlapping segments.
///
/// The remainder is distributed by giving one extra byte to each of the
/// first `total_bytes % n` segments, so sizes differ by at most one.
/// Returns an empty plan when `total_bytes` is 0.
pub fn calculate(total_bytes: u64, connections: u32) -> Vec<Segment> {
    if total_bytes == 0 {
        return Vec::new();
    }

    let n = u64::from(connections.max(1)).min(total_bytes);
    let base = total_bytes / n;
    let remainder = total_bytes % n;

    let mut out = Vec::with_capacity(n as usize);
    let mut offset = 0u64;
    for index in 0..n {
        let len = base + u64::from(index < remainder);
        out.push(Segment::new(index as u32, offset, offset + len - 1));
        offset += len;
    }
    out
}

/// One segment covering the whole file (empty plan when `total_bytes` is 0).
pub fn single(total_bytes: u64) -> Vec<Segment> {
    calculate(total_bytes, 1)
}
