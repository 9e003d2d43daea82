//! Error taxonomy of the optimizer.
//!
//! Two families, deliberately kept apart:
//!
//! - [`CompileError`]: the current compilation attempt must be abandoned. The trace is rejected;
//!   the caller falls back to the unoptimized path. Never indicates unsound output: every
//!   failure mode degrades to doing less optimization.
//! - [`VirtualStatesCantMatch`]: a bridge/runtime shape is incompatible with a target's expected
//!   shape. Always locally recoverable: the bridge compiler catches it at the matching boundary
//!   and retraces independently. It is threaded as a `Result` error through the recursive
//!   matcher, never mixed into [`CompileError`].

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The trace is self-contradictory independent of any bridge (e.g. a statically-known
    /// out-of-bounds array read). Rejected, not patched.
    #[error("invalid trace: {0}")]
    InvalidLoop(String),

    /// A value to be resume-encoded does not fit the tag payload. The loop cannot be safely
    /// guarded and must not be installed.
    #[error("resume tag overflow: {value} does not fit in {bits} payload bits")]
    TagOverflow { value: i64, bits: u32 },
}

impl CompileError {
    pub fn invalid(msg: impl Into<String>) -> CompileError {
        CompileError::InvalidLoop(msg.into())
    }
}

/// Why two virtual-state nodes cannot be reconciled by any finite guard sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CantMatchReason {
    /// Node kinds differ in a way guards cannot patch (virtual shape vs. runtime pointer).
    ShapeMismatch,
    /// Both sides name classes, and the classes differ.
    ClassMismatch,
    /// The target requires a specific constant the source cannot be proven to be.
    ConstantMismatch,
    /// The target's integer bound does not contain the source's.
    BoundMismatch,
    /// Field count / descriptor list / array length differs between two virtual shapes.
    LayoutMismatch,
    /// A target position was matched against two different source positions.
    InconsistentPosition,
    /// A guard would be needed, but the caller disallowed guard emission (pure check mode) or
    /// provided no runtime sample to guard on.
    GuardNeeded,
    /// A concrete box was required but the value is still virtual (caller should retry with
    /// forcing, or give up).
    StillVirtual,
}

/// The single exit path for "this bridge cannot jump into this loop as-is".
///
/// Caught at the call boundary around the whole per-state walk; a single node failure aborts the
/// entire match attempt, so no partial guard list is ever observable.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("virtual states cannot match: {reason:?} at state position {target_pos:?}/{source_pos:?}")]
pub struct VirtualStatesCantMatch {
    pub reason: CantMatchReason,
    /// Global position of the offending target node, when known.
    pub target_pos: Option<u32>,
    /// Global position of the offending source node, when known.
    pub source_pos: Option<u32>,
}

impl VirtualStatesCantMatch {
    pub fn new(reason: CantMatchReason) -> VirtualStatesCantMatch {
        VirtualStatesCantMatch {
            reason,
            target_pos: None,
            source_pos: None,
        }
    }

    pub fn at(reason: CantMatchReason, target_pos: u32, source_pos: u32) -> VirtualStatesCantMatch {
        VirtualStatesCantMatch {
            reason,
            target_pos: Some(target_pos),
            source_pos: Some(source_pos),
        }
    }
}
