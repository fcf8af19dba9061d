//! Live re-planning of a partially-downloaded segment plan.

use super::Segment;

/// Rebuilds a plan for `new_connections` workers without losing progress.
///
/// Completed segments are preserved verbatim. A partial segment is split at
/// its current offset: the downloaded prefix becomes a completed segment and
/// the rest joins the remaining-range pool. Remaining ranges are merged
/// where contiguous and redistributed into `max(new_connections,
/// ranges.len())` segments proportionally to range size, each range keeping
/// at least one. The result is sorted by start and re-indexed from 0.
pub fn resegment(old: &[Segment], new_connections: u32) -> Vec<Segment> {
    let mut done: Vec<Segment> = Vec::new();
    let mut pool: Vec<(u64, u64)> = Vec::new();

    for seg in old {
        if seg.is_complete() {
            done.push(*seg);
        } else if seg.downloaded_bytes > 0 {
            let offset = seg.current_offset();
            done.push(Segment {
                index: 0,
                start: seg.start,
                end: offset - 1,
                downloaded_bytes: seg.downloaded_bytes,
            });
            pool.push((offset, seg.end));
        } else {
            pool.push((seg.start, seg.end));
        }
    }

    pool.sort_by_key(|r| r.0);
    let mut merged: Vec<(u64, u64)> = Vec::new();
    for (start, end) in pool {
        match merged.last_mut() {
            Some(last) if last.1 + 1 == start => last.1 = end,
            _ => merged.push((start, end)),
        }
    }

    let mut out = done;
    if !merged.is_empty() {
        let target = (new_connections.max(1) as usize).max(merged.len());
        let slots = allocate_slots(&merged, target);
        for (range, n) in merged.iter().zip(slots) {
            split_range(range.0, range.1, n, &mut out);
        }
    }

    out.sort_by_key(|s| s.start);
    for (i, s) in out.iter_mut().enumerate() {
        s.index = i as u32;
    }
    out
}

/// Distributes `target` worker slots over the merged ranges proportionally
/// to range size, each range getting at least one. The balancing pass adds
/// to the range with the largest bytes-per-slot ratio and removes from the
/// smallest (never below one) until the counts match.
fn allocate_slots(ranges: &[(u64, u64)], target: usize) -> Vec<usize> {
    let sizes: Vec<u64> = ranges.iter().map(|(s, e)| e - s + 1).collect();
    let total: u64 = sizes.iter().sum();

    let mut slots: Vec<usize> = sizes
        .iter()
        .map(|&size| {
            let ideal = (u128::from(size) * target as u128) / u128::from(total.max(1));
            (ideal as usize).max(1)
        })
        .collect();

    loop {
        let sum: usize = slots.iter().sum();
        if sum == target {
            break;
        }
        if sum < target {
            let i = pick_by_ratio(&sizes, &slots, |_| true, true);
            match i {
                Some(i) => slots[i] += 1,
                None => break,
            }
        } else {
            let i = pick_by_ratio(&sizes, &slots, |n| n > 1, false);
            match i {
                Some(i) => slots[i] -= 1,
                None => break,
            }
        }
    }
    slots
}

/// Index of the range with the extreme bytes-per-slot ratio among those
/// passing `eligible`. Ratios are compared by cross-multiplication to avoid
/// float rounding.
fn pick_by_ratio(
    sizes: &[u64],
    slots: &[usize],
    eligible: impl Fn(usize) -> bool,
    largest: bool,
) -> Option<usize> {
    let mut best: Option<usize> = None;
    for i in 0..sizes.len() {
        if !eligible(slots[i]) {
            continue;
        }
        match best {
            None => best = Some(i),
            Some(b) => {
                // size[i]/slots[i] vs size[b]/slots[b]
                let lhs = u128::from(sizes[i]) * slots[b] as u128;
                let rhs = u128::from(sizes[b]) * slots[i] as u128;
                let better = if largest { lhs > rhs } else { lhs < rhs };
                if better {
                    best = Some(i);
                }
            }
        }
    }
    best
}

/// Splits an inclusive range into `n` fresh segments, the first
/// `size % n` one byte longer.
fn split_range(start: u64, end: u64, n: usize, out: &mut Vec<Segment>) {
    let size = end - start + 1;
    let n = (n.max(1) as u64).min(size);
    let base = size / n;
    let remainder = size % n;

    let mut offset = start;
    for piece in 0..n {
        let len = base + u64::from(piece < remainder);
        out.push(Segment::new(0, offset, offset + len - 1));
        offset += len;
    }
}
