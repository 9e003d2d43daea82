//! Operation/value model of the tracing JIT's mid-tier optimizer.
//!
//! This crate defines what a recorded trace *is*: the closed opcode set, the box/constant value
//! model, descriptors (the symbolic view of the host object model), guard snapshots, and the
//! [`Trace`] container with its structural invariants. The optimizer crate (`ember-jit`) consumes
//! and produces these types; it never defines its own op representation.

pub mod descr;
pub mod opcode;
pub mod snapshot;
pub mod trace;
pub mod value;

pub use descr::{
    ArrayDef, ArrayElem, ArrayId, CallDef, CallId, ClassId, EffectFlags, EffectInfo, FieldDef,
    FieldId, SpecialCall, StructDef, StructId, TypeRegistry,
};
pub use opcode::OpKind;
pub use snapshot::{Snapshot, SnapshotId};
pub use trace::{Descr, Trace, TraceBuilder, TraceError, TraceOp};
pub use value::{BoxId, ConstVal, ObjRef, ValType, Value};
