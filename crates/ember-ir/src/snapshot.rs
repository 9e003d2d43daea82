//! Guard snapshots.
//!
//! Every guard records the logical interpreter state needed to resume if it fails: one snapshot
//! per frame, chained backward to the caller's. Snapshots carry *which* values are live; the
//! compact per-guard numbering over them is built later by the resume encoder.

use crate::value::Value;

/// Index of a snapshot in its owning trace's snapshot arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub u32);

impl SnapshotId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One frame's worth of resume state.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// The caller frame's snapshot, if any. Walking `prev` links yields frames
    /// innermost-to-outermost.
    pub prev: Option<SnapshotId>,
    /// Interpreter position this frame resumes at.
    pub pc: u32,
    /// Live logical values of this frame, in the interpreter's declared order.
    pub live: Vec<Value>,
}
