use ember_ir::{BoxId, ClassId, Descr, FieldId, OpKind, TraceOp, Value};
use ember_jit::shortpreamble::{
    create_short_boxes, heap_read_key, Obligations, PotentialKind, PotentialShortOps,
    ShortPreambleBuilder,
};

fn getfield(base: u32, field: u32, result: u32) -> TraceOp {
    TraceOp::new(OpKind::GetField, vec![Value::Box(BoxId(base))])
        .with_descr(Descr::Field(FieldId(field)))
        .with_result(BoxId(result))
}

fn add(lhs: u32, rhs: i64, result: u32) -> TraceOp {
    TraceOp::new(OpKind::IntAdd, vec![Value::Box(BoxId(lhs)), Value::int(rhs)])
        .with_result(BoxId(result))
}

#[test]
fn non_heap_producers_win_over_heap_reads() {
    // Box 2 is producible both by a heap read off box 0 and by pure arithmetic on box 1; the
    // heap read registered first but must lose.
    let mut potentials = PotentialShortOps::new();
    potentials.register(PotentialKind::HeapRead, getfield(0, 0, 2));
    potentials.register(PotentialKind::Pure, add(1, 1, 2));

    let label_args = [Value::Box(BoxId(0)), Value::Box(BoxId(1))];
    let boxes = create_short_boxes(&potentials, &label_args);

    let canonical = boxes.producer(BoxId(2)).unwrap();
    assert!(!canonical.invented);
    assert_eq!(canonical.kind, PotentialKind::Pure);
    assert_eq!(canonical.op.opcode, OpKind::IntAdd);

    // The losing candidate is still resolvable through its key, as an invented redirect.
    let key = heap_read_key(&getfield(0, 0, 2));
    assert_eq!(boxes.lookup_heap(&key), Some(BoxId(2)));
    let invented = boxes
        .all()
        .iter()
        .filter(|p| p.invented)
        .collect::<Vec<_>>();
    assert_eq!(invented.len(), 1);
    assert_eq!(invented[0].op.opcode, OpKind::SameAs);
}

#[test]
fn construction_is_idempotent() {
    let mut potentials = PotentialShortOps::new();
    potentials.register(PotentialKind::HeapRead, getfield(0, 0, 2));
    potentials.register(PotentialKind::Pure, add(1, 1, 2));
    potentials.register(PotentialKind::Pure, add(2, 7, 3));

    let label_args = [Value::Box(BoxId(0)), Value::Box(BoxId(1))];
    let first = create_short_boxes(&potentials, &label_args);
    let second = create_short_boxes(&potentials, &label_args);
    assert_eq!(first.all(), second.all());
}

#[test]
fn unresolvable_dependencies_drop_the_candidate_only() {
    let mut potentials = PotentialShortOps::new();
    // Box 9 is not a label arg and nothing produces it: this candidate is dropped.
    potentials.register(PotentialKind::Pure, add(9, 1, 2));
    // Independent candidate stays resolvable.
    potentials.register(PotentialKind::Pure, add(0, 5, 3));

    let boxes = create_short_boxes(&potentials, &[Value::Box(BoxId(0))]);
    assert!(boxes.producer(BoxId(2)).is_none());
    assert!(boxes.producer(BoxId(3)).is_some());
}

#[test]
fn chained_candidates_resolve_through_each_other() {
    let mut potentials = PotentialShortOps::new();
    potentials.register(PotentialKind::HeapRead, getfield(0, 0, 2));
    potentials.register(PotentialKind::Pure, add(2, 1, 3));

    let boxes = create_short_boxes(&potentials, &[Value::Box(BoxId(0))]);
    // Box 3 depends on box 2, whose only producer is the heap read; with no non-heap
    // alternative the heap read is canonical.
    assert_eq!(
        boxes.producer(BoxId(2)).unwrap().kind,
        PotentialKind::HeapRead
    );
    assert!(boxes.producer(BoxId(3)).is_some());
}

#[test]
fn use_box_reasserts_obligations_before_the_producer() {
    let node = ClassId(3);
    let mut potentials = PotentialShortOps::new();
    potentials.register(PotentialKind::HeapRead, getfield(0, 0, 2));

    let boxes = create_short_boxes(&potentials, &[Value::Box(BoxId(0))]);
    let mut obligations = Obligations::new();
    obligations.insert(BoxId(0), node);

    let mut builder = ShortPreambleBuilder::new(boxes, obligations, 16);
    assert!(builder.use_box(BoxId(2)));

    let ops = builder.ops();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].opcode, OpKind::GuardClass);
    assert_eq!(ops[0].args, vec![Value::Box(BoxId(0))]);
    assert_eq!(ops[0].descr, Some(Descr::Class(node)));
    assert_eq!(ops[1].opcode, OpKind::GetField);

    // Idempotent: a second use adds nothing.
    assert!(builder.use_box(BoxId(2)));
    assert_eq!(builder.ops().len(), 2);
}

#[test]
fn overflowable_producers_get_their_guard_back() {
    let mut potentials = PotentialShortOps::new();
    potentials.register(
        PotentialKind::Pure,
        TraceOp::new(
            OpKind::IntAddOvf,
            vec![Value::Box(BoxId(0)), Value::int(1)],
        )
        .with_result(BoxId(1)),
    );
    let boxes = create_short_boxes(&potentials, &[Value::Box(BoxId(0))]);
    let mut builder = ShortPreambleBuilder::new(boxes, Obligations::new(), 16);
    assert!(builder.use_box(BoxId(1)));

    let ops = builder.ops();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].opcode, OpKind::IntAddOvf);
    assert_eq!(ops[1].opcode, OpKind::GuardNoOverflow);
}

#[test]
fn exhausted_budget_rolls_back_and_poisons_the_builder() {
    let mut potentials = PotentialShortOps::new();
    potentials.register(PotentialKind::HeapRead, getfield(0, 0, 2));
    potentials.register(PotentialKind::Pure, add(2, 1, 3));

    let boxes = create_short_boxes(&potentials, &[Value::Box(BoxId(0))]);
    let mut builder = ShortPreambleBuilder::new(boxes, Obligations::new(), 1);
    assert!(!builder.use_box(BoxId(3)));
    assert!(builder.ops().is_empty());
    // Once exhausted, even a cheap request is refused.
    assert!(!builder.use_box(BoxId(2)));
}
