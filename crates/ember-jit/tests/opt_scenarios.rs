use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use ember_ir::{
    ConstVal, EffectInfo, OpKind, TraceBuilder, TypeRegistry, ValType, Value,
};
use ember_jit::opt::intbound::IntBound;
use ember_jit::{optimize_trace, OptConfig};

fn count_ops(trace: &ember_ir::Trace, opcode: OpKind) -> usize {
    trace.ops.iter().filter(|o| o.opcode == opcode).count()
}

#[test]
fn guard_value_promotes_jump_argument_to_constant() {
    let registry = TypeRegistry::new();
    let mut b = TraceBuilder::new();
    let i0 = b.input(ValType::Int);
    let snap = b.snapshot(None, 0, vec![Value::Box(i0)]);
    let i1 = b.int_op(OpKind::IntSub, Value::Box(i0), Value::int(1));
    b.guard_value(i1, ConstVal::Int(0), snap);
    b.jump(vec![i1]);
    let trace = b.build();

    let out = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();
    let jump = out.trace.ops.last().unwrap();
    assert_eq!(jump.opcode, OpKind::Jump);
    assert_eq!(jump.args, vec![Value::int(0)]);
    assert_eq!(count_ops(&out.trace, OpKind::GuardValue), 1);
}

#[test]
fn virtual_struct_never_escapes_and_is_erased() {
    let mut registry = TypeRegistry::new();
    let node = registry.define_struct("Node");
    let val = registry.add_field(node, "val", ValType::Int);

    let mut b = TraceBuilder::new();
    let i0 = b.input(ValType::Int);
    let p = b.new_struct(node);
    b.setfield(p, val, Value::Box(i0));
    let v = b.getfield(p, val, ValType::Int);
    b.jump(vec![v]);
    let trace = b.build();

    let out = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();
    assert_eq!(count_ops(&out.trace, OpKind::New), 0);
    assert_eq!(count_ops(&out.trace, OpKind::SetField), 0);
    assert_eq!(count_ops(&out.trace, OpKind::GetField), 0);
    assert_eq!(out.trace.ops.len(), 1);
    assert_eq!(out.trace.ops[0].opcode, OpKind::Jump);
    assert_eq!(out.trace.ops[0].args, vec![Value::Box(i0)]);
}

#[test]
fn field_reads_dedup_across_call_with_empty_write_set() {
    let mut registry = TypeRegistry::new();
    let s = registry.define_struct("S");
    let x = registry.add_field(s, "x", ValType::Int);
    let observe = registry.define_call("observe", None, EffectInfo::none());

    let mut b = TraceBuilder::new();
    let r0 = b.input(ValType::Ref);
    let v1 = b.getfield(Value::Box(r0), x, ValType::Int);
    b.call(observe, vec![], &registry);
    let v2 = b.getfield(Value::Box(r0), x, ValType::Int);
    b.finish(vec![v2]);
    let trace = b.build();

    let out = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();
    assert_eq!(count_ops(&out.trace, OpKind::GetField), 1);
    // The second read resolves to the first's result.
    let finish = out.trace.ops.last().unwrap();
    assert_eq!(finish.args, vec![v1]);
}

#[test]
fn field_reads_stay_live_across_call_that_writes_the_field() {
    let mut registry = TypeRegistry::new();
    let s = registry.define_struct("S");
    let x = registry.add_field(s, "x", ValType::Int);
    let mut effect = EffectInfo::none();
    effect.write_fields.push(x);
    let clobber = registry.define_call("clobber", None, effect);

    let mut b = TraceBuilder::new();
    let r0 = b.input(ValType::Ref);
    let _v1 = b.getfield(Value::Box(r0), x, ValType::Int);
    b.call(clobber, vec![], &registry);
    let v2 = b.getfield(Value::Box(r0), x, ValType::Int);
    b.finish(vec![v2]);
    let trace = b.build();

    let out = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();
    assert_eq!(count_ops(&out.trace, OpKind::GetField), 2);
}

#[test]
fn repeated_stores_to_one_slot_keep_only_the_last() {
    let mut registry = TypeRegistry::new();
    let s = registry.define_struct("S");
    let x = registry.add_field(s, "x", ValType::Int);

    let mut b = TraceBuilder::new();
    let r0 = b.input(ValType::Ref);
    let i0 = b.input(ValType::Int);
    b.setfield(Value::Box(r0), x, Value::Box(i0));
    b.setfield(Value::Box(r0), x, Value::int(5));
    b.finish(vec![]);
    let trace = b.build();

    let out = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();
    assert_eq!(count_ops(&out.trace, OpKind::SetField), 1);
    let store = out
        .trace
        .ops
        .iter()
        .find(|o| o.opcode == OpKind::SetField)
        .unwrap();
    assert_eq!(store.args[1], Value::int(5));
    assert_eq!(out.stats.dead_stores_elided, 1);
}

#[test]
fn proven_bounds_elide_overflow_checks() {
    let registry = TypeRegistry::new();
    let mut b = TraceBuilder::new();
    let i0 = b.input(ValType::Int);
    let snap = b.snapshot(None, 0, vec![Value::Box(i0)]);
    let below = b.int_op(OpKind::IntLt, Value::Box(i0), Value::int(100));
    b.guard_true(below, snap);
    let above = b.int_op(OpKind::IntGt, Value::Box(i0), Value::int(0));
    b.guard_true(above, snap);
    let s = b.emit(
        OpKind::IntAddOvf,
        vec![Value::Box(i0), Value::int(1)],
        None,
        ValType::Int,
    );
    b.guard(OpKind::GuardNoOverflow, vec![], None, snap);
    b.jump(vec![s]);
    let trace = b.build();

    let out = optimize_trace(&trace, &registry, OptConfig::default()).unwrap();
    assert_eq!(count_ops(&out.trace, OpKind::IntAddOvf), 0);
    assert_eq!(count_ops(&out.trace, OpKind::GuardNoOverflow), 0);
    assert_eq!(count_ops(&out.trace, OpKind::IntAdd), 1);
}

#[test]
fn decided_comparisons_fold_and_contradictions_reject_the_trace() {
    let registry = TypeRegistry::new();

    // i0 < 10 proven, then i0 < 100 is decided true and folds away.
    let mut b = TraceBuilder::new();
    let i0 = b.input(ValType::Int);
    let snap = b.snapshot(None, 0, vec![Value::Box(i0)]);
    let lt10 = b.int_op(OpKind::IntLt, Value::Box(i0), Value::int(10));
    b.guard_true(lt10, snap);
    let lt100 = b.int_op(OpKind::IntLt, Value::Box(i0), Value::int(100));
    b.guard_true(lt100, snap);
    b.finish(vec![]);
    let out = optimize_trace(&b.build(), &registry, OptConfig::default()).unwrap();
    assert_eq!(count_ops(&out.trace, OpKind::IntLt), 1);
    assert_eq!(count_ops(&out.trace, OpKind::GuardTrue), 1);

    // A guard that must fail makes the whole trace invalid.
    let mut b = TraceBuilder::new();
    let i0 = b.input(ValType::Int);
    let snap = b.snapshot(None, 0, vec![Value::Box(i0)]);
    let lt10 = b.int_op(OpKind::IntLt, Value::Box(i0), Value::int(10));
    b.guard_true(lt10, snap);
    let ge10 = b.int_op(OpKind::IntGe, Value::Box(i0), Value::int(10));
    b.guard_true(ge10, snap);
    b.finish(vec![]);
    assert!(optimize_trace(&b.build(), &registry, OptConfig::default()).is_err());
}

#[test]
fn statically_out_of_bounds_read_rejects_the_trace() {
    let mut registry = TypeRegistry::new();
    let arr = registry.define_array("ints", ember_ir::ArrayElem::Int);

    let mut b = TraceBuilder::new();
    let a = b.new_array(arr, Value::int(3));
    let _v = b.getarrayitem(a, arr, Value::int(7), ValType::Int);
    b.finish(vec![]);
    assert!(optimize_trace(&b.build(), &registry, OptConfig::default()).is_err());
}

#[test]
fn random_interval_arithmetic_is_sound() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    for _ in 0..2_000 {
        let (a, xa) = random_bound(&mut rng);
        let (b, xb) = random_bound(&mut rng);

        assert!(a.add_bound(&b).contains(xa + xb));
        assert!(a.sub_bound(&b).contains(xa - xb));
        assert!(a.mul_bound(&b).contains(xa * xb));
        if a.known_lt(&b) {
            assert!(xa < xb);
        }
        if a.known_ge(&b) {
            assert!(xa >= xb);
        }

        let mut tightened = a;
        tightened.intersect(&b);
        if b.contains(xa) {
            assert!(tightened.contains(xa));
        }
    }
}

fn random_bound(rng: &mut ChaCha8Rng) -> (IntBound, i64) {
    let lo = rng.gen_range(-1_000_000i64..1_000_000);
    let hi = rng.gen_range(lo..=1_000_000);
    let sample = rng.gen_range(lo..=hi);
    let bound = match rng.gen_range(0..4u32) {
        0 => IntBound::new(lo, hi),
        1 => IntBound::at_least(lo),
        2 => IntBound::at_most(hi),
        _ => IntBound::unbounded(),
    };
    (bound, sample)
}
