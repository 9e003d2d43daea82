use std::collections::HashMap;

use ember_ir::{
    ClassId, ConstVal, ObjRef, OpKind, TraceBuilder, TypeRegistry, ValType, Value,
};
use ember_jit::vstate::RuntimeSampler;
use ember_jit::{compile_loop, BridgeCompileData, CompiledLoop, OptConfig};

struct Sampler {
    samples: Vec<Option<ConstVal>>,
    classes: HashMap<ObjRef, ClassId>,
}

impl RuntimeSampler for Sampler {
    fn sample(&self, root: usize) -> Option<ConstVal> {
        self.samples.get(root).copied().flatten()
    }

    fn class_of(&self, obj: ObjRef) -> Option<ClassId> {
        self.classes.get(&obj).copied()
    }
}

fn count_ops(trace: &ember_ir::Trace, opcode: OpKind) -> usize {
    trace.ops.iter().filter(|o| o.opcode == opcode).count()
}

/// A loop accumulating an invariant field of a known-class node:
/// `while ...: s += p.val`.
fn invariant_field_loop() -> (TypeRegistry, ember_ir::Trace, ClassId) {
    let mut registry = TypeRegistry::new();
    let node = registry.define_struct("Node");
    let val = registry.add_field(node, "val", ValType::Int);
    let class = registry.class_of_struct(node);

    let mut b = TraceBuilder::new();
    let p0 = b.input(ValType::Ref);
    let s0 = b.input(ValType::Int);
    let snap = b.snapshot(None, 0, vec![Value::Box(p0), Value::Box(s0)]);
    b.guard(
        OpKind::GuardNonnullClass,
        vec![Value::Box(p0)],
        Some(ember_ir::Descr::Class(class)),
        snap,
    );
    let v = b.getfield(Value::Box(p0), val, ValType::Int);
    let s1 = b.int_op(OpKind::IntAdd, Value::Box(s0), v);
    b.jump(vec![Value::Box(p0), s1]);
    (registry, b.build(), class)
}

fn compile_invariant_loop() -> (TypeRegistry, CompiledLoop, ClassId) {
    let (registry, trace, class) = invariant_field_loop();
    let compiled = compile_loop(&trace, &registry, OptConfig::default()).unwrap();
    (registry, compiled, class)
}

#[test]
fn invariant_heap_read_moves_into_the_short_preamble() {
    let (_registry, compiled, class) = compile_invariant_loop();

    // The preamble still performs the read; the steady-state body does not.
    assert_eq!(count_ops(&compiled.preamble, OpKind::GetField), 1);
    assert_eq!(count_ops(&compiled.body, OpKind::GetField), 0);
    assert_eq!(count_ops(&compiled.body, OpKind::GuardNonnullClass), 0);
    assert_eq!(count_ops(&compiled.body, OpKind::IntAdd), 1);

    // The short preamble re-derives the read, re-asserting the class it depends on.
    let short = &compiled.token.short_preamble;
    assert!(short.iter().any(|o| o.opcode == OpKind::GetField));
    let guard = short
        .iter()
        .find(|o| o.opcode == OpKind::GuardClass)
        .expect("class obligation must be re-asserted");
    assert_eq!(guard.descr, Some(ember_ir::Descr::Class(class)));

    // Label and back edge grew by exactly the short-box value.
    assert_eq!(compiled.token.reduced_args.len(), 2);
    assert_eq!(compiled.token.extra_args.len(), 1);
    let label = &compiled.body.ops[0];
    assert_eq!(label.opcode, OpKind::Label);
    assert_eq!(label.args.len(), 3);
    let jump = compiled.body.ops.last().unwrap();
    assert_eq!(jump.opcode, OpKind::Jump);
    assert_eq!(jump.args.len(), 3);
}

#[test]
fn matching_bridge_inlines_the_short_preamble() {
    let (registry, compiled, class) = compile_invariant_loop();

    let mut b = TraceBuilder::new();
    let q0 = b.input(ValType::Ref);
    let j0 = b.input(ValType::Int);
    b.jump(vec![Value::Box(q0), Value::Box(j0)]);
    let bridge = b.build();

    let sampler = Sampler {
        samples: vec![Some(ConstVal::Ref(ObjRef(7))), Some(ConstVal::Int(1))],
        classes: HashMap::from([(ObjRef(7), class)]),
    };
    let data = BridgeCompileData {
        token: &compiled.token,
    };
    let (info, out) = data
        .optimize_trace(&bridge, &sampler, &registry, OptConfig::default())
        .unwrap();

    assert!(info.is_final());
    // Exactly one synthesized entry guard, plus the short preamble's own ops.
    assert_eq!(count_ops(&out.trace, OpKind::GuardNonnullClass), 1);
    assert_eq!(count_ops(&out.trace, OpKind::GetField), 1);
    // The bridge now jumps with the extended label arity.
    assert_eq!(info.inputargs.len(), 3);
    let jump = out.trace.ops.last().unwrap();
    assert_eq!(jump.opcode, OpKind::Jump);
    assert_eq!(jump.args, info.inputargs);
}

#[test]
fn bridge_with_wrong_class_falls_back_to_retracing() {
    let (registry, compiled, _class) = compile_invariant_loop();
    let stranger = ClassId(999);

    let mut b = TraceBuilder::new();
    let q0 = b.input(ValType::Ref);
    let j0 = b.input(ValType::Int);
    b.jump(vec![Value::Box(q0), Value::Box(j0)]);
    let bridge = b.build();

    let sampler = Sampler {
        samples: vec![Some(ConstVal::Ref(ObjRef(7))), Some(ConstVal::Int(1))],
        classes: HashMap::from([(ObjRef(7), stranger)]),
    };
    let data = BridgeCompileData {
        token: &compiled.token,
    };
    let (info, out) = data
        .optimize_trace(&bridge, &sampler, &registry, OptConfig::default())
        .unwrap();

    assert!(!info.is_final());
    // No guards synthesized, no short preamble inlined; the bridge keeps its own arity.
    assert_eq!(count_ops(&out.trace, OpKind::GuardNonnullClass), 0);
    assert_eq!(count_ops(&out.trace, OpKind::GetField), 0);
    assert_eq!(info.inputargs.len(), 2);
}

#[test]
fn virtual_survives_around_the_peeled_loop() {
    let mut registry = TypeRegistry::new();
    let node = registry.define_struct("Node");
    let val = registry.add_field(node, "val", ValType::Int);

    // Each iteration reads the carried node's field and re-wraps it in a fresh node.
    let mut b = TraceBuilder::new();
    let p0 = b.input(ValType::Ref);
    let snap = b.snapshot(None, 0, vec![Value::Box(p0)]);
    b.guard(
        OpKind::GuardNonnullClass,
        vec![Value::Box(p0)],
        Some(ember_ir::Descr::Class(registry.class_of_struct(node))),
        snap,
    );
    let v = b.getfield(Value::Box(p0), val, ValType::Int);
    let v1 = b.int_op(OpKind::IntAdd, v, Value::int(1));
    let q = b.new_struct(node);
    b.setfield(q, val, v1);
    b.jump(vec![q]);
    let trace = b.build();

    let compiled = compile_loop(&trace, &registry, OptConfig::default()).unwrap();

    // In the steady state the node exists only symbolically: no allocation, no field traffic.
    assert_eq!(count_ops(&compiled.body, OpKind::New), 0);
    assert_eq!(count_ops(&compiled.body, OpKind::GetField), 0);
    assert_eq!(count_ops(&compiled.body, OpKind::SetField), 0);
    assert_eq!(count_ops(&compiled.body, OpKind::IntAdd), 1);

    // The label carries the field value, not the pointer.
    assert_eq!(compiled.token.virtual_state.num_not_virtuals(), 1);
    let label = &compiled.body.ops[0];
    assert_eq!(label.args.len(), 1);
    assert_eq!(compiled.body.value_type(label.args[0]), ValType::Int);
}
