//! The trace container: a flat SSA op sequence plus its box and snapshot arenas.

use thiserror::Error;

use crate::descr::{ArrayId, CallId, ClassId, FieldId, StructId, TypeRegistry};
use crate::opcode::OpKind;
use crate::snapshot::{Snapshot, SnapshotId};
use crate::value::{BoxId, ConstVal, ValType, Value};

/// Descriptor attached to an operation, identifying the field/array/call/class involved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Descr {
    Struct(StructId),
    Field(FieldId),
    Array(ArrayId),
    /// Array-of-structs access: the array plus the field within the element struct.
    Interior(ArrayId, FieldId),
    Call(CallId),
    Class(ClassId),
}

impl Descr {
    pub fn as_field(self) -> Option<FieldId> {
        match self {
            Descr::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_array(self) -> Option<ArrayId> {
        match self {
            Descr::Array(a) | Descr::Interior(a, _) => Some(a),
            _ => None,
        }
    }

    pub fn as_call(self) -> Option<CallId> {
        match self {
            Descr::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class(self) -> Option<ClassId> {
        match self {
            Descr::Class(c) => Some(c),
            _ => None,
        }
    }
}

/// One operation of a trace.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceOp {
    pub opcode: OpKind,
    pub args: Vec<Value>,
    pub descr: Option<Descr>,
    /// The box this op defines, if the opcode produces a result.
    pub result: Option<BoxId>,
    /// Resume snapshot; present iff the opcode is a guard recorded by the front end.
    pub snapshot: Option<SnapshotId>,
}

impl TraceOp {
    pub fn new(opcode: OpKind, args: Vec<Value>) -> TraceOp {
        TraceOp {
            opcode,
            args,
            descr: None,
            result: None,
            snapshot: None,
        }
    }

    pub fn with_descr(mut self, descr: Descr) -> TraceOp {
        self.descr = Some(descr);
        self
    }

    pub fn with_result(mut self, result: BoxId) -> TraceOp {
        self.result = Some(result);
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotId) -> TraceOp {
        self.snapshot = Some(snapshot);
        self
    }
}

/// A linear recorded trace: input boxes, the op sequence, and the arenas the ops refer to.
///
/// Invariant (checked by [`Trace::validate`]): every box argument of every op is either an input
/// or the result of an earlier op: def-before-use, single static assignment.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    pub inputs: Vec<BoxId>,
    pub ops: Vec<TraceOp>,
    box_types: Vec<ValType>,
    snapshots: Vec<Snapshot>,
}

impl Trace {
    pub fn new() -> Trace {
        Trace::default()
    }

    pub fn box_count(&self) -> usize {
        self.box_types.len()
    }

    pub fn box_type(&self, b: BoxId) -> ValType {
        self.box_types[b.index()]
    }

    pub fn new_box(&mut self, ty: ValType) -> BoxId {
        let id = BoxId(
            u32::try_from(self.box_types.len()).expect("trace box space exhausted"),
        );
        self.box_types.push(ty);
        id
    }

    pub fn add_input(&mut self, ty: ValType) -> BoxId {
        let b = self.new_box(ty);
        self.inputs.push(b);
        b
    }

    pub fn add_snapshot(&mut self, snapshot: Snapshot) -> SnapshotId {
        let id = SnapshotId(
            u32::try_from(self.snapshots.len()).expect("trace snapshot space exhausted"),
        );
        self.snapshots.push(snapshot);
        id
    }

    pub fn snapshot(&self, id: SnapshotId) -> &Snapshot {
        &self.snapshots[id.index()]
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// A new empty trace sharing this trace's box and snapshot arenas. Used by the optimizer to
    /// build an output trace whose values stay commensurable with the input's.
    pub fn fork_arena(&self) -> Trace {
        Trace {
            inputs: Vec::new(),
            ops: Vec::new(),
            box_types: self.box_types.clone(),
            snapshots: self.snapshots.clone(),
        }
    }

    pub fn value_type(&self, v: Value) -> ValType {
        match v {
            Value::Const(c) => c.ty(),
            Value::Box(b) => self.box_type(b),
        }
    }

    /// Checks the structural invariants of the trace: def-before-use, exactly-once definitions,
    /// result/descr/snapshot presence matching the opcode, snapshot references in range.
    pub fn validate(&self, _registry: &TypeRegistry) -> Result<(), TraceError> {
        let mut defined = vec![false; self.box_types.len()];
        for &b in &self.inputs {
            if b.index() >= defined.len() {
                return Err(TraceError::UnknownBox { op: usize::MAX, boxid: b });
            }
            defined[b.index()] = true;
        }

        for (i, op) in self.ops.iter().enumerate() {
            for (a, &arg) in op.args.iter().enumerate() {
                if let Value::Box(b) = arg {
                    if b.index() >= defined.len() {
                        return Err(TraceError::UnknownBox { op: i, boxid: b });
                    }
                    if !defined[b.index()] {
                        return Err(TraceError::UseBeforeDef { op: i, arg: a });
                    }
                }
            }

            match op.result {
                Some(r) => {
                    if !op.opcode.has_result() {
                        return Err(TraceError::UnexpectedResult { op: i });
                    }
                    if r.index() >= defined.len() {
                        return Err(TraceError::UnknownBox { op: i, boxid: r });
                    }
                    if defined[r.index()] {
                        return Err(TraceError::Redefinition { op: i, boxid: r });
                    }
                    defined[r.index()] = true;
                }
                None => {
                    // Calls to void targets legitimately define nothing.
                    if op.opcode.has_result() && !op.opcode.is_call() {
                        return Err(TraceError::MissingResult { op: i });
                    }
                }
            }

            if op.opcode.is_guard() {
                match op.snapshot {
                    Some(s) if s.index() < self.snapshots.len() => {}
                    Some(_) => return Err(TraceError::UnknownSnapshot { op: i }),
                    None => return Err(TraceError::MissingSnapshot { op: i }),
                }
            }
        }

        for (si, snap) in self.snapshots.iter().enumerate() {
            if let Some(prev) = snap.prev {
                // Chains must point backward to an already-recorded snapshot.
                if prev.index() >= si {
                    return Err(TraceError::SnapshotCycle { snapshot: si });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("op {op}: argument {arg} is used before its definition")]
    UseBeforeDef { op: usize, arg: usize },
    #[error("op {op}: references box {boxid:?} outside the trace arena")]
    UnknownBox { op: usize, boxid: BoxId },
    #[error("op {op}: box {boxid:?} is defined more than once")]
    Redefinition { op: usize, boxid: BoxId },
    #[error("op {op}: opcode produces a result but none is recorded")]
    MissingResult { op: usize },
    #[error("op {op}: opcode produces no result but one is recorded")]
    UnexpectedResult { op: usize },
    #[error("guard op {op} has no resume snapshot")]
    MissingSnapshot { op: usize },
    #[error("op {op}: snapshot reference out of range")]
    UnknownSnapshot { op: usize },
    #[error("snapshot {snapshot}: prev link does not point backward")]
    SnapshotCycle { snapshot: usize },
}

/// Convenience builder used by the recorder boundary and by tests.
#[derive(Debug, Default)]
pub struct TraceBuilder {
    trace: Trace,
}

impl TraceBuilder {
    pub fn new() -> TraceBuilder {
        TraceBuilder::default()
    }

    pub fn input(&mut self, ty: ValType) -> BoxId {
        self.trace.add_input(ty)
    }

    pub fn snapshot(&mut self, prev: Option<SnapshotId>, pc: u32, live: Vec<Value>) -> SnapshotId {
        self.trace.add_snapshot(Snapshot { prev, pc, live })
    }

    /// Emits an op that produces a result of type `ty`.
    pub fn emit(
        &mut self,
        opcode: OpKind,
        args: Vec<Value>,
        descr: Option<Descr>,
        ty: ValType,
    ) -> Value {
        assert!(opcode.has_result(), "emit: {opcode:?} produces no result");
        let result = self.trace.new_box(ty);
        self.trace.ops.push(TraceOp {
            opcode,
            args,
            descr,
            result: Some(result),
            snapshot: None,
        });
        Value::Box(result)
    }

    /// Emits a result-less op (heap write, control).
    pub fn emit_effect(&mut self, opcode: OpKind, args: Vec<Value>, descr: Option<Descr>) {
        assert!(!opcode.has_result(), "emit_effect: {opcode:?} produces a result");
        assert!(!opcode.is_guard(), "guards go through TraceBuilder::guard");
        self.trace.ops.push(TraceOp {
            opcode,
            args,
            descr,
            result: None,
            snapshot: None,
        });
    }

    pub fn guard(
        &mut self,
        opcode: OpKind,
        args: Vec<Value>,
        descr: Option<Descr>,
        snapshot: SnapshotId,
    ) {
        assert!(opcode.is_guard(), "guard: {opcode:?} is not a guard");
        self.trace.ops.push(TraceOp {
            opcode,
            args,
            descr,
            result: None,
            snapshot: Some(snapshot),
        });
    }

    // Typed shorthands for the common opcodes.

    pub fn int_op(&mut self, opcode: OpKind, lhs: Value, rhs: Value) -> Value {
        self.emit(opcode, vec![lhs, rhs], None, ValType::Int)
    }

    pub fn new_struct(&mut self, s: StructId) -> Value {
        self.emit(OpKind::New, Vec::new(), Some(Descr::Struct(s)), ValType::Ref)
    }

    pub fn new_array(&mut self, a: ArrayId, len: Value) -> Value {
        self.emit(OpKind::NewArray, vec![len], Some(Descr::Array(a)), ValType::Ref)
    }

    pub fn getfield(&mut self, base: Value, f: FieldId, ty: ValType) -> Value {
        self.emit(OpKind::GetField, vec![base], Some(Descr::Field(f)), ty)
    }

    pub fn setfield(&mut self, base: Value, f: FieldId, v: Value) {
        self.emit_effect(OpKind::SetField, vec![base, v], Some(Descr::Field(f)));
    }

    pub fn getarrayitem(&mut self, base: Value, a: ArrayId, index: Value, ty: ValType) -> Value {
        self.emit(OpKind::GetArrayItem, vec![base, index], Some(Descr::Array(a)), ty)
    }

    pub fn setarrayitem(&mut self, base: Value, a: ArrayId, index: Value, v: Value) {
        self.emit_effect(OpKind::SetArrayItem, vec![base, index, v], Some(Descr::Array(a)));
    }

    pub fn arraylen(&mut self, base: Value, a: ArrayId) -> Value {
        self.emit(OpKind::ArrayLen, vec![base], Some(Descr::Array(a)), ValType::Int)
    }

    pub fn call(&mut self, c: CallId, args: Vec<Value>, registry: &TypeRegistry) -> Option<Value> {
        let def = registry.call(c);
        match def.result {
            Some(ty) => Some(self.emit(OpKind::Call, args, Some(Descr::Call(c)), ty)),
            None => {
                self.trace.ops.push(TraceOp {
                    opcode: OpKind::Call,
                    args,
                    descr: Some(Descr::Call(c)),
                    result: None,
                    snapshot: None,
                });
                None
            }
        }
    }

    pub fn guard_true(&mut self, v: Value, snapshot: SnapshotId) {
        self.guard(OpKind::GuardTrue, vec![v], None, snapshot);
    }

    pub fn guard_value(&mut self, v: Value, expected: ConstVal, snapshot: SnapshotId) {
        self.guard(
            OpKind::GuardValue,
            vec![v, Value::Const(expected)],
            None,
            snapshot,
        );
    }

    pub fn guard_class(&mut self, v: Value, class: ClassId, snapshot: SnapshotId) {
        self.guard(OpKind::GuardClass, vec![v], Some(Descr::Class(class)), snapshot);
    }

    pub fn label(&mut self, args: Vec<Value>) {
        self.emit_effect(OpKind::Label, args, None);
    }

    pub fn jump(&mut self, args: Vec<Value>) {
        self.emit_effect(OpKind::Jump, args, None);
    }

    pub fn finish(&mut self, args: Vec<Value>) {
        self.emit_effect(OpKind::Finish, args, None);
    }

    pub fn build(self) -> Trace {
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ValType, Value};

    #[test]
    fn builder_output_validates() {
        let registry = TypeRegistry::new();
        let mut b = TraceBuilder::new();
        let i0 = b.input(ValType::Int);
        let snap = b.snapshot(None, 0, vec![Value::Box(i0)]);
        let s = b.int_op(OpKind::IntAdd, Value::Box(i0), Value::int(1));
        b.guard(OpKind::GuardTrue, vec![s], None, snap);
        b.jump(vec![s]);
        assert_eq!(b.build().validate(&registry), Ok(()));
    }

    #[test]
    fn use_before_def_is_rejected() {
        let registry = TypeRegistry::new();
        let mut trace = Trace::new();
        let late = trace.new_box(ValType::Int);
        let result = trace.new_box(ValType::Int);
        trace.ops.push(
            TraceOp::new(OpKind::IntIsZero, vec![Value::Box(late)])
                .with_result(result),
        );
        assert!(matches!(
            trace.validate(&registry),
            Err(TraceError::UseBeforeDef { op: 0, arg: 0 })
        ));
    }

    #[test]
    fn double_definition_is_rejected() {
        let registry = TypeRegistry::new();
        let mut trace = Trace::new();
        let b0 = trace.add_input(ValType::Int);
        trace.ops.push(
            TraceOp::new(OpKind::IntAdd, vec![Value::Box(b0), Value::int(1)]).with_result(b0),
        );
        assert!(matches!(
            trace.validate(&registry),
            Err(TraceError::Redefinition { op: 0, .. })
        ));
    }

    #[test]
    fn guards_must_carry_snapshots() {
        let registry = TypeRegistry::new();
        let mut trace = Trace::new();
        let b0 = trace.add_input(ValType::Int);
        trace
            .ops
            .push(TraceOp::new(OpKind::GuardTrue, vec![Value::Box(b0)]));
        assert!(matches!(
            trace.validate(&registry),
            Err(TraceError::MissingSnapshot { op: 0 })
        ));
    }
}
