//! Mid-tier optimizer of a meta-tracing JIT.
//!
//! Consumes a linear recorded trace (`ember-ir`) and produces a provably-equivalent optimized
//! trace plus the metadata that makes compiled code re-enterable and recoverable:
//!
//! - [`opt`]: value forwarding, integer intervals, pure CSE, alias-sensitive heap caching, and
//!   virtual-object tracking, driven by a single forward pass.
//! - [`shortpreamble`]: the minimal op sequence that reconstructs every value a loop body needs
//!   from the label's bare inputs.
//! - [`vstate`]: structural signatures of live values, generalization checks, and bridge guard
//!   synthesis.
//! - [`resume`]: compact per-guard numbering and the guard-failure decoder.
//! - [`compile`]: loop peeling, target tokens, and bridge compilation.

pub mod compile;
pub mod error;
pub mod opt;
pub mod resume;
pub mod shortpreamble;
pub mod stats;
pub mod vstate;

pub use compile::{
    compile_loop, optimize_trace, BridgeCompileData, BridgeInfo, CompiledLoop, OptimizedTrace,
    TargetToken,
};
pub use error::{CantMatchReason, CompileError, VirtualStatesCantMatch};
pub use opt::{OptConfig, Optimizer};
pub use resume::{
    reconstruct_frames, GuardResume, Numbering, ObjectModel, ResumeDataVirtualAdder, ResumeFrame,
    ResumeMemo, ResumeReader, Tag, TagKind, VResumeInfo,
};
pub use stats::OptStats;
pub use vstate::{capture_state, RuntimeSampler, VirtualState};
