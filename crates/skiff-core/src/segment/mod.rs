//! Range math and segment planning.
//!
//! Splits a download into N segments, re-segments a live plan while
//! preserving progress, and models the per-segment byte accounting that is
//! persisted for resume.

mod plan;
mod resegment;

pub use plan::{calculate, single};
pub use resegment::resegment;

use serde::{Deserialize, Serialize};

/// One contiguous inclusive byte range `[start, end]` of the target file,
/// downloaded by a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// 0-based position, stable inside one segment plan.
    pub index: u32,
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (inclusive).
    pub end: u64,
    pub downloaded_bytes: u64,
}

impl Segment {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self { index, start, end, downloaded_bytes: 0 }
    }

    /// Length of this segment in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    /// First byte not yet downloaded.
    pub fn current_offset(&self) -> u64 {
        self.start + self.downloaded_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_bytes >= self.total_bytes()
    }

    /// Range still to fetch, inclusive on both ends.
    pub fn remaining_range(&self) -> (u64, u64) {
        (self.current_offset(), self.end)
    }
}

/// Sum of downloaded bytes across a plan.
pub fn downloaded_total(segments: &[Segment]) -> u64 {
    segments.iter().map(|s| s.downloaded_bytes).sum()
}

/// True once every segment of the plan is complete.
pub fn all_complete(segments: &[Segment]) -> bool {
    segments.iter().all(Segment::is_complete)
}
