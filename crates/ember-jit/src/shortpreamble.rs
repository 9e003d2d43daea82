//! Short-preamble construction.
//!
//! After the preamble pass, the optimizer knows many ways to *recompute* values from the loop
//! label's bare input arguments: pure ops, heap reads still valid at the label, loop-invariant
//! call results, and the inputs themselves. This module turns that bookkeeping into a concrete
//! operation list that re-establishes every value (and every proof obligation) the optimized
//! loop body relies on, so a bridge can jump straight into the loop.

use std::collections::{HashMap, HashSet};

use ember_ir::{BoxId, ClassId, Descr, OpKind, TraceOp, Value};

use crate::opt::pure::PureKey;

/// Where a potential short op comes from. The discriminant doubles as the canonicalization
/// priority: heap reads lose to every non-heap alternative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PotentialKind {
    /// A loop-label input argument; available by definition, never emitted.
    Input,
    Pure,
    LoopInvariant,
    HeapRead,
}

impl PotentialKind {
    fn is_heap(self) -> bool {
        matches!(self, PotentialKind::HeapRead)
    }
}

/// One candidate way to reproduce a value, in preamble-box terms.
#[derive(Clone, Debug)]
pub struct PotentialOp {
    pub kind: PotentialKind,
    pub op: TraceOp,
}

/// Candidates collected during the preamble pass, in deterministic registration order.
///
/// Registration order is the emission order of the preamble pass, which makes the whole
/// short-box construction idempotent for a fixed input.
#[derive(Debug, Default)]
pub struct PotentialShortOps {
    ops: Vec<PotentialOp>,
}

impl PotentialShortOps {
    pub fn new() -> PotentialShortOps {
        PotentialShortOps::default()
    }

    pub fn register(&mut self, kind: PotentialKind, op: TraceOp) {
        debug_assert!(op.result.is_some(), "potential short op must produce a value");
        self.ops.push(PotentialOp { kind, op });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Key of a heap-read candidate: opcode, base, optional constant index, descriptor.
pub type HeapReadKey = (OpKind, Value, Option<Value>, Descr);

pub fn heap_read_key(op: &TraceOp) -> HeapReadKey {
    let descr = op.descr.expect("heap read without descriptor");
    (op.opcode, op.args[0], op.args.get(1).copied(), descr)
}

/// A resolved short op. `invented` entries are `SameAs` redirects for non-canonical producers:
/// they keep every recorded dependency resolvable but are never emitted.
#[derive(Clone, Debug, PartialEq)]
pub struct ProducedShortOp {
    pub kind: PotentialKind,
    pub op: TraceOp,
    pub invented: bool,
}

/// The final producer table: one canonical operation per reproducible preamble value, plus
/// lookup indexes by computation key.
#[derive(Debug, Default)]
pub struct ShortBoxes {
    list: Vec<ProducedShortOp>,
    canonical: HashMap<BoxId, usize>,
    by_pure: HashMap<PureKey, BoxId>,
    by_heap: HashMap<HeapReadKey, BoxId>,
    by_loopinv: HashMap<Value, BoxId>,
}

impl ShortBoxes {
    pub fn producer(&self, b: BoxId) -> Option<&ProducedShortOp> {
        self.canonical.get(&b).map(|&i| &self.list[i])
    }

    pub fn lookup_pure(&self, key: &PureKey) -> Option<BoxId> {
        self.by_pure.get(key).copied()
    }

    pub fn lookup_heap(&self, key: &HeapReadKey) -> Option<BoxId> {
        self.by_heap.get(key).copied()
    }

    pub fn lookup_loopinvariant(&self, key: Value) -> Option<BoxId> {
        self.by_loopinv.get(&key).copied()
    }

    pub fn all(&self) -> &[ProducedShortOp] {
        &self.list
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Resolution {
    InProgress,
    Chosen(usize),
    Failed,
}

/// Builds the producer table from the registered candidates.
///
/// For each label arg an identity input-passthrough candidate is registered first. Candidates
/// whose dependency chain cannot be resolved are dropped (not an error); when several candidates
/// would produce the same value, the canonical one is chosen by priority (non-heap beats heap,
/// first-registered wins among equals) and the losers become invented `SameAs` redirects.
pub fn create_short_boxes(potentials: &PotentialShortOps, label_args: &[Value]) -> ShortBoxes {
    let mut ordered: Vec<PotentialOp> = Vec::with_capacity(potentials.ops.len() + label_args.len());
    for &arg in label_args {
        if let Value::Box(b) = arg {
            ordered.push(PotentialOp {
                kind: PotentialKind::Input,
                op: TraceOp::new(OpKind::SameAs, vec![Value::Box(b)]).with_result(b),
            });
        }
    }
    ordered.extend(potentials.ops.iter().cloned());

    // Candidate indices per result box, in registration order.
    let mut by_result: HashMap<BoxId, Vec<usize>> = HashMap::new();
    let mut result_order: Vec<BoxId> = Vec::new();
    for (i, p) in ordered.iter().enumerate() {
        let r = p.op.result.expect("potential short op must produce a value");
        let entry = by_result.entry(r).or_default();
        if entry.is_empty() {
            result_order.push(r);
        }
        entry.push(i);
    }

    let mut resolution: HashMap<BoxId, Resolution> = HashMap::new();
    for &r in &result_order {
        resolve(r, &ordered, &by_result, &mut resolution);
    }

    let mut boxes = ShortBoxes::default();
    for &r in &result_order {
        let chosen = match resolution.get(&r) {
            Some(&Resolution::Chosen(i)) => i,
            _ => continue, // dropped candidate: expected, handled by omission
        };
        let canon = &ordered[chosen];
        boxes.canonical.insert(r, boxes.list.len());
        index_candidate(&mut boxes, canon, r);
        boxes.list.push(ProducedShortOp {
            kind: canon.kind,
            op: canon.op.clone(),
            invented: false,
        });

        for &i in &by_result[&r] {
            if i == chosen {
                continue;
            }
            // Losers redirect to the canonical producer so recorded dependencies against this
            // specific candidate still resolve. They are bookkeeping only, never emitted.
            index_candidate(&mut boxes, &ordered[i], r);
            boxes.list.push(ProducedShortOp {
                kind: ordered[i].kind,
                op: TraceOp::new(OpKind::SameAs, vec![Value::Box(r)]).with_result(r),
                invented: true,
            });
        }
    }
    boxes
}

fn index_candidate(boxes: &mut ShortBoxes, p: &PotentialOp, r: BoxId) {
    match p.kind {
        PotentialKind::Input => {}
        PotentialKind::Pure => {
            let key = (p.op.opcode, p.op.args.clone(), p.op.descr);
            boxes.by_pure.entry(key).or_insert(r);
        }
        PotentialKind::LoopInvariant => {
            boxes.by_loopinv.entry(p.op.args[0]).or_insert(r);
        }
        PotentialKind::HeapRead => {
            boxes.by_heap.entry(heap_read_key(&p.op)).or_insert(r);
        }
    }
}

fn resolve(
    b: BoxId,
    ordered: &[PotentialOp],
    by_result: &HashMap<BoxId, Vec<usize>>,
    resolution: &mut HashMap<BoxId, Resolution>,
) -> bool {
    match resolution.get(&b) {
        Some(Resolution::Chosen(_)) => return true,
        Some(Resolution::Failed) => return false,
        // Short-preamble candidates can only depend on earlier-numbered boxes by construction.
        Some(Resolution::InProgress) => {
            panic!("cyclic dependency among short-preamble candidates at {b:?}")
        }
        None => {}
    }
    let Some(candidates) = by_result.get(&b) else {
        resolution.insert(b, Resolution::Failed);
        return false;
    };
    resolution.insert(b, Resolution::InProgress);

    // Priority: any non-heap candidate beats any heap read; ties go to registration order.
    let mut chosen = None;
    for pass in 0..2 {
        for &i in candidates {
            let p = &ordered[i];
            if p.kind.is_heap() != (pass == 1) {
                continue;
            }
            if p.kind == PotentialKind::Input || deps_resolve(p, b, ordered, by_result, resolution) {
                chosen = Some(i);
                break;
            }
        }
        if chosen.is_some() {
            break;
        }
    }

    match chosen {
        Some(i) => {
            resolution.insert(b, Resolution::Chosen(i));
            true
        }
        None => {
            resolution.insert(b, Resolution::Failed);
            false
        }
    }
}

fn deps_resolve(
    p: &PotentialOp,
    result: BoxId,
    ordered: &[PotentialOp],
    by_result: &HashMap<BoxId, Vec<usize>>,
    resolution: &mut HashMap<BoxId, Resolution>,
) -> bool {
    p.op.args.iter().all(|&arg| match arg {
        Value::Const(_) => true,
        Value::Box(a) => a != result && resolve(a, ordered, by_result, resolution),
    })
}

/// Residual proof obligations of preamble values: classes the optimizer proved and the loop body
/// relies on. The short preamble re-derives values independently of the main loop's own guards,
/// so these must be re-asserted.
pub type Obligations = HashMap<BoxId, ClassId>;

/// Assembles the short-preamble op list as the loop body pass demands values.
#[derive(Debug)]
pub struct ShortPreambleBuilder {
    boxes: ShortBoxes,
    obligations: Obligations,
    used: HashSet<BoxId>,
    guarded: HashSet<BoxId>,
    ops: Vec<TraceOp>,
    max_ops: usize,
    exhausted: bool,
}

impl ShortPreambleBuilder {
    pub fn new(boxes: ShortBoxes, obligations: Obligations, max_ops: usize) -> ShortPreambleBuilder {
        ShortPreambleBuilder {
            boxes,
            obligations,
            used: HashSet::new(),
            guarded: HashSet::new(),
            ops: Vec::new(),
            max_ops,
            exhausted: false,
        }
    }

    pub fn boxes(&self) -> &ShortBoxes {
        &self.boxes
    }

    pub fn ops(&self) -> &[TraceOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<TraceOp> {
        self.ops
    }

    /// Pulls `b` into the short preamble: recursively materializes argument producers and their
    /// residual guard obligations, then the producing op, then the op's own overflow guard and
    /// the guards implied by the result's info.
    ///
    /// Returns `false` when the op budget is exhausted; the builder rolls the attempt back and
    /// refuses further work, and the caller must compute the value inside the loop body instead.
    #[must_use]
    pub fn use_box(&mut self, b: BoxId) -> bool {
        if self.exhausted {
            return false;
        }
        let rollback = self.ops.len();
        let used_snapshot = self.used.clone();
        let guarded_snapshot = self.guarded.clone();
        if self.use_box_inner(b) {
            true
        } else {
            self.ops.truncate(rollback);
            self.used = used_snapshot;
            self.guarded = guarded_snapshot;
            self.exhausted = true;
            false
        }
    }

    fn use_box_inner(&mut self, b: BoxId) -> bool {
        if self.used.contains(&b) {
            return true;
        }
        let produced = self
            .boxes
            .producer(b)
            .unwrap_or_else(|| panic!("use_box on a value with no short producer: {b:?}"))
            .clone();
        self.used.insert(b);

        if produced.kind == PotentialKind::Input {
            // Label inputs are available by definition; only their obligations may need
            // re-asserting.
            return self.assert_obligation(b);
        }

        for &arg in &produced.op.args {
            if let Value::Box(a) = arg {
                if self.boxes.producer(a).is_some() && !self.use_box_inner(a) {
                    return false;
                }
                if !self.assert_obligation(a) {
                    return false;
                }
            }
        }

        if !self.push(produced.op.clone()) {
            return false;
        }
        if produced.op.opcode.can_overflow() {
            if !self.push(TraceOp::new(OpKind::GuardNoOverflow, Vec::new())) {
                return false;
            }
        }
        self.assert_obligation(b)
    }

    fn assert_obligation(&mut self, b: BoxId) -> bool {
        if self.guarded.contains(&b) {
            return true;
        }
        if let Some(&class) = self.obligations.get(&b) {
            self.guarded.insert(b);
            return self.push(
                TraceOp::new(OpKind::GuardClass, vec![Value::Box(b)])
                    .with_descr(Descr::Class(class)),
            );
        }
        true
    }

    fn push(&mut self, op: TraceOp) -> bool {
        if self.ops.len() >= self.max_ops {
            return false;
        }
        self.ops.push(op);
        true
    }
}
