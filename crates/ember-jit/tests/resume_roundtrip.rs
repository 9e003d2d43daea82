use std::collections::HashMap;
use std::rc::Rc;

use ember_ir::{
    ArrayId, ClassId, ConstVal, FieldId, ObjRef, OpKind, StructId, TraceBuilder, TypeRegistry,
    ValType, Value,
};
use ember_jit::resume::{reconstruct_frames, ObjectModel, Tag, TagKind};
use ember_jit::{optimize_trace, CompileError, OptConfig};

#[derive(Default)]
struct MockHeap {
    next: u64,
    classes: HashMap<ObjRef, ClassId>,
    fields: HashMap<(ObjRef, FieldId), ConstVal>,
    items: HashMap<(ObjRef, usize), ConstVal>,
}

impl MockHeap {
    fn fresh(&mut self) -> ObjRef {
        self.next += 1;
        ObjRef(self.next)
    }
}

impl ObjectModel for MockHeap {
    fn alloc_struct(&mut self, s: StructId) -> ObjRef {
        let r = self.fresh();
        self.classes.insert(r, ClassId(s.0));
        r
    }

    fn alloc_array(&mut self, _a: ArrayId, _len: usize) -> ObjRef {
        self.fresh()
    }

    fn alloc_array_struct(&mut self, _a: ArrayId, _len: usize) -> ObjRef {
        self.fresh()
    }

    fn set_field(&mut self, obj: ObjRef, f: FieldId, v: ConstVal) {
        self.fields.insert((obj, f), v);
    }

    fn set_array_item(&mut self, obj: ObjRef, _a: ArrayId, index: usize, v: ConstVal) {
        self.items.insert((obj, index), v);
    }

    fn set_interior_field(&mut self, _o: ObjRef, _a: ArrayId, _i: usize, _f: FieldId, _v: ConstVal) {
        unimplemented!("not used by these tests")
    }

    fn class_of(&self, obj: ObjRef) -> Option<ClassId> {
        self.classes.get(&obj).copied()
    }
}

/// Pair { val: Int, next: Ref } plus a trace whose guard snapshot holds a self-referential
/// virtual twice, a plain box, and a constant too large to inline.
fn cyclic_trace() -> (TypeRegistry, ember_ir::Trace, FieldId, FieldId) {
    let mut registry = TypeRegistry::new();
    let pair = registry.define_struct("Pair");
    let val = registry.add_field(pair, "val", ValType::Int);
    let next = registry.add_field(pair, "next", ValType::Ref);

    let mut b = TraceBuilder::new();
    let i0 = b.input(ValType::Int);
    let i1 = b.input(ValType::Int);
    let p = b.new_struct(pair);
    b.setfield(p, val, Value::Box(i0));
    b.setfield(p, next, p);
    let c = b.int_op(OpKind::IntLt, Value::Box(i0), Value::Box(i1));
    let snap = b.snapshot(
        None,
        3,
        vec![p, p, Value::Box(i0), Value::Const(ConstVal::Int(1_000_000))],
    );
    b.guard_true(c, snap);
    b.finish(vec![Value::Box(i0)]);
    (registry, b.build(), val, next)
}

#[test]
fn cyclic_virtual_roundtrips_with_preserved_aliasing() {
    let (registry, trace, val, next) = cyclic_trace();
    let out = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();

    // ops: [IntLt, GuardTrue, Finish]; the guard's resume data is keyed by its op index.
    let resume = &out.resume[&1];
    assert_eq!(resume.liveboxes.len(), 1);
    assert_eq!(resume.virtuals.len(), 1);

    let mut heap = MockHeap::default();
    let frame_values = [ConstVal::Int(5)];
    let frames = reconstruct_frames(resume, &out.consts, &frame_values, &mut heap);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].pc, 3);
    let values = &frames[0].values;
    assert_eq!(values.len(), 4);

    // Both tags that pointed at "the same" virtual decode to the identical object.
    let obj = match values[0] {
        ConstVal::Ref(r) => r,
        other => panic!("expected a reference, got {other:?}"),
    };
    assert_eq!(values[1], ConstVal::Ref(obj));
    assert_eq!(values[2], ConstVal::Int(5));
    assert_eq!(values[3], ConstVal::Int(1_000_000));

    // The reallocated object carries the captured field value and its own cycle.
    assert_eq!(heap.fields[&(obj, val)], ConstVal::Int(5));
    assert_eq!(heap.fields[&(obj, next)], ConstVal::Ref(obj));
}

#[test]
fn encoding_the_same_trace_twice_is_deterministic()  {
    let (registry, trace, _, _) = cyclic_trace();
    let a = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();
    let b = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();

    assert_eq!(a.resume[&1].numbering.tags, b.resume[&1].numbering.tags);
    assert_eq!(a.resume[&1].virtuals, b.resume[&1].virtuals);
    assert_eq!(a.consts, b.consts);
}

#[test]
fn structurally_identical_snapshots_share_one_numbering_buffer() {
    let registry = TypeRegistry::new();
    let mut b = TraceBuilder::new();
    let i0 = b.input(ValType::Int);
    let i1 = b.input(ValType::Int);
    let snap = b.snapshot(None, 0, vec![Value::Box(i0)]);
    let c1 = b.int_op(OpKind::IntLt, Value::Box(i0), Value::Box(i1));
    b.guard_true(c1, snap);
    let c2 = b.int_op(OpKind::IntGt, Value::Box(i0), Value::Box(i1));
    b.guard_true(c2, snap);
    b.finish(vec![]);

    let out = optimize_trace(&b.build(), &registry, OptConfig::default()).unwrap();
    // ops: [IntLt, GuardTrue, IntGt, GuardTrue, Finish]
    let first = &out.resume[&1];
    let second = &out.resume[&3];
    assert!(Rc::ptr_eq(&first.numbering, &second.numbering));
}

#[test]
fn snapshot_chains_decode_innermost_first() {
    let registry = TypeRegistry::new();
    let mut b = TraceBuilder::new();
    let i0 = b.input(ValType::Int);
    let i1 = b.input(ValType::Int);
    let outer = b.snapshot(None, 10, vec![Value::Box(i1)]);
    let inner = b.snapshot(Some(outer), 20, vec![Value::Box(i0), Value::int(3)]);
    let c = b.int_op(OpKind::IntLt, Value::Box(i0), Value::Box(i1));
    b.guard_true(c, inner);
    b.finish(vec![]);

    let out = optimize_trace(&b.build(), &registry, OptConfig::default()).unwrap();
    let resume = &out.resume[&1];
    // Innermost frame's values claim the first live slots.
    assert_eq!(resume.liveboxes, vec![i0, i1]);

    let mut heap = MockHeap::default();
    let frames = reconstruct_frames(resume, &out.consts, &[ConstVal::Int(7), ConstVal::Int(9)], &mut heap);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].pc, 20);
    assert_eq!(frames[0].values, vec![ConstVal::Int(7), ConstVal::Int(3)]);
    assert_eq!(frames[1].pc, 10);
    assert_eq!(frames[1].values, vec![ConstVal::Int(9)]);
}

#[test]
fn delayed_stores_replay_as_pending_fields() {
    let mut registry = TypeRegistry::new();
    let s = registry.define_struct("S");
    let x = registry.add_field(s, "x", ValType::Int);

    let mut b = TraceBuilder::new();
    let r0 = b.input(ValType::Ref);
    let i0 = b.input(ValType::Int);
    let i1 = b.input(ValType::Int);
    b.setfield(Value::Box(r0), x, Value::Box(i0));
    let snap = b.snapshot(None, 0, vec![Value::Box(r0), Value::Box(i0)]);
    let c = b.int_op(OpKind::IntLt, Value::Box(i0), Value::Box(i1));
    b.guard_true(c, snap);
    b.finish(vec![]);

    let out = optimize_trace(&b.build(), &registry, OptConfig::default()).unwrap();
    // The store is delayed past the guard (it reappears before Finish), so the guard carries a
    // pending field.
    let guard_idx = out
        .trace
        .ops
        .iter()
        .position(|o| o.opcode == OpKind::GuardTrue)
        .unwrap();
    let store_idx = out
        .trace
        .ops
        .iter()
        .position(|o| o.opcode == OpKind::SetField)
        .unwrap();
    assert!(guard_idx < store_idx);

    let resume = &out.resume[&guard_idx];
    assert_eq!(resume.pending.len(), 1);
    assert_eq!(resume.pending[0].field, x);

    let target = ObjRef(77);
    let mut heap = MockHeap::default();
    let frames = reconstruct_frames(
        resume,
        &out.consts,
        &[ConstVal::Ref(target), ConstVal::Int(41)],
        &mut heap,
    );
    assert_eq!(frames[0].values, vec![ConstVal::Ref(target), ConstVal::Int(41)]);
    // The delayed store was applied to the reconstructed heap.
    assert_eq!(heap.fields[&(target, x)], ConstVal::Int(41));
}

#[test]
fn tag_payloads_overflow_loudly() {
    assert!(Tag::new(100, TagKind::Box).is_ok());
    let err = Tag::new(9_000, TagKind::Box).unwrap_err();
    assert!(matches!(err, CompileError::TagOverflow { value: 9_000, .. }));
    let err = Tag::new(-9_000, TagKind::Int).unwrap_err();
    assert!(matches!(err, CompileError::TagOverflow { .. }));

    let t = Tag::new(-42, TagKind::Int).unwrap();
    assert_eq!(t.kind(), TagKind::Int);
    assert_eq!(t.payload(), -42);
}
