use std::collections::HashMap;

use ember_ir::{BoxId, ClassId, ConstVal, Descr, ObjRef, OpKind, TypeRegistry, ValType, Value};
use ember_jit::error::CantMatchReason;
use ember_jit::opt::info::{Info, InfoView, PtrInfo, PtrLevel};
use ember_jit::opt::intbound::IntBound;
use ember_jit::vstate::{capture_state, BoxSource, MatchParams, RuntimeSampler, VirtualState};

/// Minimal info view over hand-assigned box facts.
#[derive(Default)]
struct View {
    infos: HashMap<BoxId, Info>,
    tys: HashMap<BoxId, ValType>,
}

impl View {
    fn boxed(&mut self, id: u32, ty: ValType, info: Option<Info>) -> Value {
        let b = BoxId(id);
        self.tys.insert(b, ty);
        if let Some(i) = info {
            self.infos.insert(b, i);
        }
        Value::Box(b)
    }
}

impl InfoView for View {
    fn resolve(&self, v: Value) -> Value {
        v
    }

    fn info_value(&self, v: Value) -> Option<&Info> {
        v.as_box().and_then(|b| self.infos.get(&b))
    }

    fn ty_of(&self, v: Value) -> ValType {
        match v {
            Value::Const(c) => c.ty(),
            Value::Box(b) => self.tys[&b],
        }
    }
}

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

struct Alloc(u32);

impl BoxSource for Alloc {
    fn fresh_box(&mut self, _ty: ValType) -> BoxId {
        self.0 += 1;
        BoxId(self.0)
    }
}

fn ref_state(registry: &TypeRegistry, info: Option<Info>) -> VirtualState {
    let mut view = View::default();
    let v = view.boxed(0, ValType::Ref, info);
    capture_state(&[v], &view, registry)
}

fn int_state(registry: &TypeRegistry, bound: IntBound) -> VirtualState {
    let mut view = View::default();
    let v = view.boxed(0, ValType::Int, Some(Info::Int(bound)));
    capture_state(&[v], &view, registry)
}

#[test]
fn level_ladder_is_a_preorder() {
    let registry = TypeRegistry::new();
    let node = ClassId(0);

    let unknown = ref_state(&registry, None);
    let nonnull = ref_state(&registry, Some(Info::Ptr(PtrInfo::nonnull())));
    let known = ref_state(&registry, Some(Info::Ptr(PtrInfo::with_class(node))));
    let constant = ref_state(
        &registry,
        Some(Info::Ptr(PtrInfo {
            level: PtrLevel::Constant,
            class: Some(node),
            constant: Some(ConstVal::Ref(ObjRef(5))),
            length: None,
        })),
    );

    let chain = [&unknown, &nonnull, &known, &constant];
    for (i, weaker) in chain.iter().enumerate() {
        for (j, stronger) in chain.iter().enumerate() {
            let expected = i <= j;
            assert_eq!(
                weaker.generalization_of(stronger, &registry),
                expected,
                "chain position {i} vs {j}"
            );
        }
    }
}

#[test]
fn interval_containment_drives_int_generalization() {
    let registry = TypeRegistry::new();
    let wide = int_state(&registry, IntBound::new(0, 10));
    let narrow = int_state(&registry, IntBound::new(2, 5));
    let free = int_state(&registry, IntBound::unbounded());

    assert!(wide.generalization_of(&narrow, &registry));
    assert!(!narrow.generalization_of(&wide, &registry));
    assert!(free.generalization_of(&wide, &registry));
    assert!(!wide.generalization_of(&free, &registry));
    assert!(narrow.generalization_of(&narrow, &registry));
}

#[test]
fn unknown_pointer_with_matching_sample_gets_one_nonnull_class_guard() {
    let registry = TypeRegistry::new();
    let node = ClassId(0);

    let target = ref_state(&registry, Some(Info::Ptr(PtrInfo::with_class(node))));
    let source = ref_state(&registry, None);

    let sampler = Sampler {
        samples: vec![Some(ConstVal::Ref(ObjRef(9)))],
        classes: HashMap::from([(ObjRef(9), node)]),
    };
    let params = MatchParams {
        registry: &registry,
        force_mode: false,
    };
    let mut alloc = Alloc(100);
    let runtime_value = Value::Box(BoxId(0));
    let guards = target
        .generate_guards(&source, &[runtime_value], &sampler, &params, &mut alloc)
        .unwrap();

    assert_eq!(guards.len(), 1);
    assert_eq!(guards[0].opcode, OpKind::GuardNonnullClass);
    assert_eq!(guards[0].args, vec![runtime_value]);
    assert_eq!(guards[0].descr, Some(Descr::Class(node)));
}

#[test]
fn wrong_runtime_class_cannot_be_guarded_into_matching() {
    let registry = TypeRegistry::new();
    let node = ClassId(0);
    let other = ClassId(1);

    let target = ref_state(&registry, Some(Info::Ptr(PtrInfo::with_class(node))));
    let source = ref_state(&registry, None);

    let sampler = Sampler {
        samples: vec![Some(ConstVal::Ref(ObjRef(9)))],
        classes: HashMap::from([(ObjRef(9), other)]),
    };
    let params = MatchParams {
        registry: &registry,
        force_mode: false,
    };
    let mut alloc = Alloc(100);
    let err = target
        .generate_guards(&source, &[Value::Box(BoxId(0))], &sampler, &params, &mut alloc)
        .unwrap_err();
    assert_eq!(err.reason, CantMatchReason::ClassMismatch);
}

#[test]
fn in_range_sample_tightens_with_comparison_guards() {
    let registry = TypeRegistry::new();
    let target = int_state(&registry, IntBound::new(0, 100));
    let source = int_state(&registry, IntBound::unbounded());

    assert!(!target.generalization_of(&source, &registry));

    let sampler = Sampler {
        samples: vec![Some(ConstVal::Int(7))],
        classes: HashMap::new(),
    };
    let params = MatchParams {
        registry: &registry,
        force_mode: false,
    };
    let mut alloc = Alloc(100);
    let guards = target
        .generate_guards(&source, &[Value::Box(BoxId(0))], &sampler, &params, &mut alloc)
        .unwrap();

    // One comparison + guard pair per declared side of the bound.
    let cmps = guards.iter().filter(|g| g.opcode == OpKind::IntLe).count();
    let checks = guards
        .iter()
        .filter(|g| g.opcode == OpKind::GuardTrue)
        .count();
    assert_eq!(cmps, 2);
    assert_eq!(checks, 2);

    // An out-of-range sample cannot be patched.
    let bad = Sampler {
        samples: vec![Some(ConstVal::Int(500))],
        classes: HashMap::new(),
    };
    let err = target
        .generate_guards(&source, &[Value::Box(BoxId(0))], &bad, &params, &mut alloc)
        .unwrap_err();
    assert_eq!(err.reason, CantMatchReason::BoundMismatch);
}

#[test]
fn shared_positions_must_stay_shared_in_the_source() {
    let registry = TypeRegistry::new();

    // Target: both roots are the same underlying value.
    let mut view = View::default();
    let v = view.boxed(0, ValType::Ref, None);
    let target = capture_state(&[v, v], &view, &registry);

    // Source with two distinct values cannot satisfy the identity requirement.
    let mut view2 = View::default();
    let a = view2.boxed(0, ValType::Ref, None);
    let b = view2.boxed(1, ValType::Ref, None);
    let split = capture_state(&[a, b], &view2, &registry);
    assert!(!target.generalization_of(&split, &registry));

    // A source that shares the same way matches.
    let mut view3 = View::default();
    let c = view3.boxed(0, ValType::Ref, None);
    let shared = capture_state(&[c, c], &view3, &registry);
    assert!(target.generalization_of(&shared, &registry));
}

#[test]
fn virtual_shapes_match_structurally_or_not_at_all() {
    let mut registry = TypeRegistry::new();
    let node = registry.define_struct("Node");
    let val = registry.add_field(node, "val", ValType::Int);
    let other = registry.define_struct("Other");
    let oval = registry.add_field(other, "val", ValType::Int);
    let _ = (val, oval);

    let vstruct = |view: &mut View, id: u32, sid| {
        let info = Info::VStruct(ember_jit::opt::info::VStructInfo {
            struct_id: sid,
            class: registry.class_of_struct(sid),
            fields: vec![Some(Value::int(1))],
        });
        view.boxed(id, ValType::Ref, Some(info))
    };

    let mut view_a = View::default();
    let a = vstruct(&mut view_a, 0, node);
    let state_a = capture_state(&[a], &view_a, &registry);

    let mut view_b = View::default();
    let b = vstruct(&mut view_b, 0, node);
    let state_b = capture_state(&[b], &view_b, &registry);

    let mut view_c = View::default();
    let c = vstruct(&mut view_c, 0, other);
    let state_c = capture_state(&[c], &view_c, &registry);

    assert!(state_a.generalization_of(&state_b, &registry));
    // Different struct layouts are never reconcilable by guards.
    assert!(!state_a.generalization_of(&state_c, &registry));

    // A virtual target never accepts a concrete runtime pointer outside force mode.
    let mut view_d = View::default();
    let d = view_d.boxed(
        0,
        ValType::Ref,
        Some(Info::Ptr(PtrInfo::with_class(registry.class_of_struct(node)))),
    );
    let state_d = capture_state(&[d], &view_d, &registry);
    assert!(!state_a.generalization_of(&state_d, &registry));
}
