//! The single-forward optimizer pass.
//!
//! One [`Optimizer`] consumes a trace's op sequence and emits the optimized sequence into a
//! fresh output trace that shares the input's box arena. All transient knowledge (forwarding,
//! infos, caches) lives on the pass and dies with it; what must outlive the pass (virtual
//! states, short preambles, resume numberings) is extracted explicitly before the pass is
//! dropped.

use std::collections::HashMap;

use ember_ir::{
    ArrayElem, BoxId, ConstVal, Descr, EffectFlags, OpKind, SnapshotId, Trace, TraceOp,
    TypeRegistry, ValType, Value,
};

use crate::error::CompileError;
use crate::resume::{GuardResume, ResumeDataVirtualAdder, ResumeMemo};
use crate::shortpreamble::{PotentialKind, PotentialShortOps, ShortPreambleBuilder};
use crate::stats::OptStats;
use crate::vstate::BoxSource;

use super::heap::HeapCache;
use super::info::{Forwarded, Info, InfoId, InfoView, PtrInfo, PtrLevel, VArrayInfo, VArrayStructInfo, VStructInfo};
use super::intbound::IntBound;
use super::pure::{LoopInvariantCache, PureCache, PureKey};

/// Tuning knobs of one compilation.
#[derive(Clone, Copy, Debug)]
pub struct OptConfig {
    pub enable_heap_cache: bool,
    pub enable_int_bounds: bool,
    pub enable_virtuals: bool,
    /// Peel loops into preamble + steady state. Off, loops compile in one pass with a trivial
    /// re-entry state.
    pub enable_peeling: bool,
    /// Budget for one loop's short preamble; exceeding it stops pulling values out of the
    /// preamble rather than failing the compilation.
    pub max_short_preamble_ops: usize,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            enable_heap_cache: true,
            enable_int_bounds: true,
            enable_virtuals: true,
            enable_peeling: true,
            max_short_preamble_ops: 64,
        }
    }
}

/// Bookkeeping of the peeled (loop body) pass: the in-progress short preamble plus the renaming
/// between preamble-space and body-space boxes.
pub struct ShortState {
    pub builder: ShortPreambleBuilder,
    pub pre_to_body: HashMap<BoxId, Value>,
    pub body_to_pre: HashMap<Value, Value>,
    /// Short-box results the body demanded: `(preamble box, body box)` pairs, appended to the
    /// loop label/jump arguments.
    pub extra_args: Vec<(BoxId, BoxId)>,
}

impl ShortState {
    pub fn new(builder: ShortPreambleBuilder) -> ShortState {
        ShortState {
            builder,
            pre_to_body: HashMap::new(),
            body_to_pre: HashMap::new(),
            extra_args: Vec::new(),
        }
    }

    /// Registers the correspondence `preamble value == body value` for one label slot.
    pub fn map_label_arg(&mut self, pre: Value, body: Value) {
        if let Value::Box(b) = pre {
            self.pre_to_body.insert(b, body);
        }
        self.body_to_pre.insert(body, pre);
    }

    fn translate_to_pre(&self, v: Value) -> Option<Value> {
        match v {
            Value::Const(_) => Some(v),
            Value::Box(_) => self.body_to_pre.get(&v).copied(),
        }
    }
}

/// The jump terminating the optimized sequence, handed back unemitted so the caller can decide
/// between closing a plain loop, peeling, or bridging into an existing target.
#[derive(Debug)]
pub struct PendingJump {
    pub args: Vec<Value>,
}

pub struct Optimizer<'a> {
    pub registry: &'a TypeRegistry,
    pub cfg: OptConfig,
    pub out: Trace,
    forwarding: Vec<Forwarded>,
    infos: Vec<Info>,
    pure_cache: PureCache,
    loopinv_cache: LoopInvariantCache,
    heap: HeapCache,
    /// Defining (opcode, resolved args) of emitted pure results, for guard-implication
    /// propagation.
    producer: HashMap<BoxId, (OpKind, Vec<Value>)>,
    /// Set when the immediately preceding overflow-checked op was proven overflow-free, so the
    /// recorded `GuardNoOverflow` that follows it is dropped.
    last_ovf_elided: bool,
    /// Most recent live snapshot, borrowed by guards the optimizer synthesizes itself.
    pub last_snapshot: Option<SnapshotId>,
    /// Shared resume-encoding state of this compilation (constant pool, numbering intern table).
    pub resume_memo: ResumeMemo,
    /// Resume data per emitted guard, keyed by the guard's index in `out.ops`. Encoded at
    /// emission time: fail values must only reference boxes defined before the guard, and a
    /// value's virtualness at the guard is what matters, not its final state.
    pub guard_resume: HashMap<usize, GuardResume>,
    pub stats: OptStats,
    pub potential: PotentialShortOps,
    collect_potentials: bool,
    pub short: Option<ShortState>,
}

impl<'a> Optimizer<'a> {
    /// `arena` must share the box space of the ops that will be fed to [`run`](Self::run)
    /// (typically `input.fork_arena()` with the inputs copied over).
    pub fn new(
        registry: &'a TypeRegistry,
        cfg: OptConfig,
        arena: Trace,
        collect_potentials: bool,
    ) -> Optimizer<'a> {
        let forwarding = vec![Forwarded::None; arena.box_count()];
        Optimizer {
            registry,
            cfg,
            out: arena,
            forwarding,
            infos: Vec::new(),
            pure_cache: PureCache::default(),
            loopinv_cache: LoopInvariantCache::default(),
            heap: HeapCache::new(),
            producer: HashMap::new(),
            last_ovf_elided: false,
            last_snapshot: None,
            resume_memo: ResumeMemo::default(),
            guard_resume: HashMap::new(),
            stats: OptStats::default(),
            potential: PotentialShortOps::new(),
            collect_potentials,
            short: None,
        }
    }

    // ---- Value plumbing ----

    pub fn new_box(&mut self, ty: ValType) -> BoxId {
        let b = self.out.new_box(ty);
        self.forwarding.resize(self.out.box_count(), Forwarded::None);
        b
    }

    /// Collapses the alias chain of `v`.
    pub fn get_value(&self, v: Value) -> Value {
        let mut cur = v;
        loop {
            let Value::Box(b) = cur else { return cur };
            match self.forwarding[b.index()] {
                Forwarded::Alias(next) => cur = next,
                _ => return cur,
            }
        }
    }

    fn resolved_args(&self, op: &TraceOp) -> Vec<Value> {
        op.args.iter().map(|&a| self.get_value(a)).collect()
    }

    pub fn make_alias(&mut self, b: BoxId, to: Value) {
        let target = self.get_value(to);
        debug_assert!(
            target.as_box() != Some(b),
            "box must not alias itself: {b:?}"
        );
        self.forwarding[b.index()] = Forwarded::Alias(target);
    }

    pub fn info_of(&self, v: Value) -> Option<&Info> {
        let Value::Box(b) = self.get_value(v) else {
            return None;
        };
        match self.forwarding[b.index()] {
            Forwarded::Info(id) => Some(&self.infos[id.index()]),
            _ => None,
        }
    }

    pub fn set_info(&mut self, b: BoxId, info: Info) {
        match self.forwarding[b.index()] {
            Forwarded::Info(id) => self.infos[id.index()] = info,
            Forwarded::None => {
                let id = InfoId(self.infos.len() as u32);
                self.infos.push(info);
                self.forwarding[b.index()] = Forwarded::Info(id);
            }
            Forwarded::Alias(_) => panic!("set_info on an aliased box: {b:?}"),
        }
    }

    fn info_of_box_mut(&mut self, b: BoxId) -> Option<&mut Info> {
        match self.forwarding[b.index()] {
            Forwarded::Info(id) => Some(&mut self.infos[id.index()]),
            _ => None,
        }
    }

    pub fn is_virtual(&self, v: Value) -> bool {
        self.info_of(v).is_some_and(Info::is_virtual)
    }

    pub fn int_bound(&self, v: Value) -> IntBound {
        match self.get_value(v) {
            Value::Const(ConstVal::Int(i)) => IntBound::from_const(i),
            v => self
                .info_of(v)
                .and_then(Info::as_int)
                .copied()
                .unwrap_or_default(),
        }
    }

    fn tighten_int(&mut self, v: Value, f: impl FnOnce(&mut IntBound) -> bool) {
        if !self.cfg.enable_int_bounds {
            return;
        }
        let Value::Box(b) = self.get_value(v) else { return };
        if self.out.box_type(b) != ValType::Int {
            return;
        }
        match self.info_of_box_mut(b) {
            Some(Info::Int(bound)) => {
                f(bound);
            }
            Some(_) => {}
            None => {
                let mut bound = IntBound::unbounded();
                f(&mut bound);
                self.set_info(b, Info::Int(bound));
            }
        }
    }

    fn set_result_bound(&mut self, result: Value, bound: IntBound) {
        if bound == IntBound::unbounded() {
            return;
        }
        self.tighten_int(result, |b| b.intersect(&bound));
    }

    fn ptr_info_mut(&mut self, b: BoxId) -> &mut PtrInfo {
        if !matches!(self.forwarding[b.index()], Forwarded::Info(_)) {
            self.set_info(b, Info::Ptr(PtrInfo::default()));
        }
        match self.info_of_box_mut(b) {
            Some(Info::Ptr(p)) => p,
            Some(other) => panic!("expected pointer info on {b:?}, found {other:?}"),
            None => unreachable!(),
        }
    }

    pub fn known_class(&self, v: Value) -> Option<ember_ir::ClassId> {
        self.info_of(v).and_then(Info::known_class)
    }

    // ---- Emission ----

    pub(crate) fn emit_op(&mut self, op: TraceOp) {
        self.stats.ops_emitted += 1;
        if op.opcode.is_guard() {
            self.stats.guards_emitted += 1;
            if op.snapshot.is_some() {
                self.last_snapshot = op.snapshot;
            }
        }
        if let Some(r) = op.result {
            if op.opcode.is_always_pure() || op.opcode == OpKind::CallPure {
                self.producer.insert(r, (op.opcode, op.args.clone()));
            }
        }
        if self.collect_potentials && op.result.is_some() {
            // Overflow-checked ops qualify as pure candidates; re-deriving one in a short
            // preamble re-asserts its no-overflow guard.
            if op.opcode.is_always_pure() || op.opcode == OpKind::CallPure || op.opcode.can_overflow()
            {
                self.potential.register(PotentialKind::Pure, op.clone());
            } else if op.opcode.is_heap_read() {
                self.potential.register(PotentialKind::HeapRead, op.clone());
            } else if op.opcode == OpKind::CallLoopInvariant {
                self.potential
                    .register(PotentialKind::LoopInvariant, op.clone());
            }
        }
        self.out.ops.push(op);
    }

    fn emit_lazy_stores(&mut self, stores: Vec<super::heap::LazySetField>) {
        for s in stores {
            self.emit_op(
                TraceOp::new(OpKind::SetField, vec![s.base, s.value]).with_descr(Descr::Field(s.field)),
            );
        }
    }

    /// Flushes every delayed store and drops all heap caches (trace boundary).
    pub fn flush_heap(&mut self) {
        let stores = self.heap.flush_all();
        self.emit_lazy_stores(stores);
    }

    // ---- Driver ----

    /// Optimizes `ops` into `self.out`. A terminating `Jump` is *not* emitted; its resolved
    /// arguments are returned so the caller can close the loop, peel, or bridge.
    pub fn run(&mut self, ops: &[TraceOp]) -> Result<Option<PendingJump>, CompileError> {
        for op in ops {
            self.stats.ops_in += 1;
            if !op.opcode.can_overflow() && op.opcode != OpKind::GuardNoOverflow {
                self.last_ovf_elided = false;
            }
            match op.opcode {
                OpKind::Jump => {
                    let args = self.resolved_args(op);
                    self.flush_heap();
                    return Ok(Some(PendingJump { args }));
                }
                OpKind::Finish => {
                    let args: Vec<Value> =
                        self.resolved_args(op).into_iter().map(|a| self.force_value(a)).collect();
                    self.flush_heap();
                    self.emit_op(TraceOp::new(OpKind::Finish, args));
                    return Ok(None);
                }
                OpKind::Label => {
                    let args: Vec<Value> =
                        self.resolved_args(op).into_iter().map(|a| self.force_value(a)).collect();
                    self.flush_heap();
                    self.emit_op(TraceOp::new(OpKind::Label, args));
                }
                OpKind::SameAs => {
                    let arg = self.get_value(op.args[0]);
                    let r = op.result.expect("same_as without result");
                    self.make_alias(r, arg);
                }
                _ if op.opcode.is_guard() => self.opt_guard(op)?,
                _ if op.opcode.can_overflow() => self.opt_ovf(op)?,
                OpKind::New | OpKind::NewArray | OpKind::NewArrayStruct => self.opt_new(op)?,
                OpKind::NewStr => self.opt_newstr(op),
                OpKind::GetField => self.opt_getfield(op),
                OpKind::SetField => self.opt_setfield(op),
                OpKind::GetArrayItem | OpKind::GetInteriorField => self.opt_get_array(op)?,
                OpKind::SetArrayItem | OpKind::SetInteriorField => self.opt_set_array(op)?,
                OpKind::ArrayLen | OpKind::StrLen => self.opt_length(op),
                OpKind::StrGetItem | OpKind::StrSetItem => {
                    let args = self.resolved_args(op);
                    let mut emitted = op.clone();
                    emitted.args = args;
                    self.emit_op(emitted);
                }
                _ if op.opcode.is_call() => self.opt_call(op)?,
                _ if op.opcode.is_always_pure() => self.opt_pure(op)?,
                _ => {
                    let args = self.resolved_args(op);
                    let mut emitted = op.clone();
                    emitted.args = args;
                    self.emit_op(emitted);
                }
            }
        }
        Ok(None)
    }

    // ---- Pure ops, folding, CSE ----

    fn opt_pure(&mut self, op: &TraceOp) -> Result<(), CompileError> {
        let args = self.resolved_args(op);
        let r = op.result.expect("pure op without result");

        if let Some(c) = fold_constant(op.opcode, &args) {
            self.stats.constants_folded += 1;
            self.make_alias(r, Value::Const(c));
            return Ok(());
        }
        if let Some(v) = self.algebraic_rewrite(op.opcode, &args) {
            self.stats.constants_folded += 1;
            self.make_alias(r, v);
            return Ok(());
        }
        if self.cfg.enable_int_bounds && op.opcode.is_comparison() {
            if let Some(truth) = self.fold_comparison(op.opcode, &args) {
                self.stats.constants_folded += 1;
                self.make_alias(r, Value::int(truth as i64));
                return Ok(());
            }
        }

        let key: PureKey = (op.opcode, args.clone(), op.descr);
        if let Some(prev) = self.pure_cache.lookup(&key) {
            self.stats.pure_cse_hits += 1;
            self.make_alias(r, prev);
            return Ok(());
        }
        if let Some(v) = self.try_short_pure(op.opcode, &args, op.descr) {
            self.stats.pure_cse_hits += 1;
            self.make_alias(r, v);
            return Ok(());
        }

        let mut emitted = op.clone();
        emitted.args = args;
        self.emit_op(emitted);
        self.pure_cache.remember(key, Value::Box(r));
        if self.cfg.enable_int_bounds {
            let bound = self.arith_result_bound(op.opcode, &op.args);
            self.set_result_bound(Value::Box(r), bound);
            if op.opcode.is_comparison() {
                self.set_result_bound(Value::Box(r), IntBound::new(0, 1));
            }
        }
        Ok(())
    }

    fn arith_result_bound(&self, opcode: OpKind, args: &[Value]) -> IntBound {
        let b = |i: usize| self.int_bound(args[i]);
        match opcode {
            OpKind::IntAdd => b(0).add_bound(&b(1)),
            OpKind::IntSub => b(0).sub_bound(&b(1)),
            OpKind::IntMul => b(0).mul_bound(&b(1)),
            OpKind::IntAnd => b(0).and_bound(&b(1)),
            OpKind::IntLshift => b(0).lshift_bound(&b(1)),
            OpKind::IntRshift => b(0).rshift_bound(&b(1)),
            _ => IntBound::unbounded(),
        }
    }

    fn algebraic_rewrite(&self, opcode: OpKind, args: &[Value]) -> Option<Value> {
        let c = |v: Value| v.as_const().and_then(ConstVal::as_int);
        match opcode {
            OpKind::IntAdd => match (c(args[0]), c(args[1])) {
                (Some(0), _) => Some(args[1]),
                (_, Some(0)) => Some(args[0]),
                _ => None,
            },
            OpKind::IntSub => {
                if c(args[1]) == Some(0) {
                    Some(args[0])
                } else if args[0] == args[1] {
                    Some(Value::ZERO)
                } else {
                    None
                }
            }
            OpKind::IntMul => match (c(args[0]), c(args[1])) {
                (Some(1), _) => Some(args[1]),
                (_, Some(1)) => Some(args[0]),
                (Some(0), _) | (_, Some(0)) => Some(Value::ZERO),
                _ => None,
            },
            OpKind::IntAnd | OpKind::IntOr if args[0] == args[1] => Some(args[0]),
            OpKind::IntXor if args[0] == args[1] => Some(Value::ZERO),
            OpKind::IntLshift | OpKind::IntRshift if c(args[1]) == Some(0) => Some(args[0]),
            _ => None,
        }
    }

    fn fold_comparison(&self, opcode: OpKind, args: &[Value]) -> Option<bool> {
        match opcode {
            OpKind::IntLt | OpKind::IntLe | OpKind::IntGt | OpKind::IntGe => {
                let a = self.int_bound(args[0]);
                let b = self.int_bound(args[1]);
                match opcode {
                    OpKind::IntLt if a.known_lt(&b) => Some(true),
                    OpKind::IntLt if a.known_ge(&b) => Some(false),
                    OpKind::IntLe if a.known_le(&b) => Some(true),
                    OpKind::IntLe if a.known_gt(&b) => Some(false),
                    OpKind::IntGt if a.known_gt(&b) => Some(true),
                    OpKind::IntGt if a.known_le(&b) => Some(false),
                    OpKind::IntGe if a.known_ge(&b) => Some(true),
                    OpKind::IntGe if a.known_lt(&b) => Some(false),
                    _ => None,
                }
            }
            OpKind::IntEq | OpKind::IntNe => {
                if args[0] == args[1] {
                    return Some(opcode == OpKind::IntEq);
                }
                let a = self.int_bound(args[0]);
                let b = self.int_bound(args[1]);
                if a.known_lt(&b) || a.known_gt(&b) {
                    return Some(opcode == OpKind::IntNe);
                }
                None
            }
            OpKind::IntIsZero | OpKind::IntIsTrue => {
                let b = self.int_bound(args[0]);
                let nonzero = !b.contains(0);
                if nonzero {
                    Some(opcode == OpKind::IntIsTrue)
                } else if b.constant() == Some(0) {
                    Some(opcode == OpKind::IntIsZero)
                } else {
                    None
                }
            }
            OpKind::PtrEq | OpKind::PtrNe => {
                if args[0] == args[1] {
                    return Some(opcode == OpKind::PtrEq);
                }
                // null vs. known-nonnull is decidable without runtime help.
                let null0 = args[0].as_const().is_some_and(ConstVal::is_null_ref);
                let null1 = args[1].as_const().is_some_and(ConstVal::is_null_ref);
                let nonnull = |v: Value| {
                    self.is_virtual(v)
                        || self
                            .info_of(v)
                            .and_then(Info::as_ptr)
                            .is_some_and(PtrInfo::is_nonnull)
                };
                if (null0 && nonnull(args[1])) || (null1 && nonnull(args[0])) {
                    return Some(opcode == OpKind::PtrNe);
                }
                None
            }
            _ => None,
        }
    }

    // ---- Overflow-checked arithmetic ----

    fn opt_ovf(&mut self, op: &TraceOp) -> Result<(), CompileError> {
        let args = self.resolved_args(op);
        let r = op.result.expect("ovf op without result");
        let plain = op.opcode.ovf_to_plain().expect("not an ovf opcode");

        if let (Some(ConstVal::Int(a)), Some(ConstVal::Int(b))) =
            (args[0].as_const(), args[1].as_const())
        {
            let folded = match plain {
                OpKind::IntAdd => a.checked_add(b),
                OpKind::IntSub => a.checked_sub(b),
                OpKind::IntMul => a.checked_mul(b),
                _ => unreachable!(),
            };
            return match folded {
                Some(v) => {
                    self.stats.constants_folded += 1;
                    self.make_alias(r, Value::int(v));
                    self.last_ovf_elided = true;
                    Ok(())
                }
                // The recorded trace took the no-overflow path; constant operands that overflow
                // contradict it.
                None => Err(CompileError::invalid(
                    "overflow-checked op on constants overflows",
                )),
            };
        }

        let ba = self.int_bound(args[0]);
        let bb = self.int_bound(args[1]);
        let cannot_overflow = self.cfg.enable_int_bounds
            && match plain {
                OpKind::IntAdd => ba.add_cannot_overflow(&bb),
                OpKind::IntSub => ba.sub_cannot_overflow(&bb),
                OpKind::IntMul => ba.mul_cannot_overflow(&bb),
                _ => unreachable!(),
            };

        if cannot_overflow {
            // Route through the pure path so the reduced op still folds and CSEs.
            let mut reduced = op.clone();
            reduced.opcode = plain;
            self.opt_pure(&reduced)?;
            self.last_ovf_elided = true;
            return Ok(());
        }

        if let Some(v) = self.try_short_pure(op.opcode, &args, op.descr) {
            self.stats.pure_cse_hits += 1;
            self.make_alias(r, v);
            // The short preamble replays the no-overflow check itself.
            self.last_ovf_elided = true;
            return Ok(());
        }

        let mut emitted = op.clone();
        emitted.args = args.clone();
        self.emit_op(emitted);
        self.last_ovf_elided = false;
        // Sound under the following no-overflow guard.
        let bound = match plain {
            OpKind::IntAdd => ba.add_bound(&bb),
            OpKind::IntSub => ba.sub_bound(&bb),
            OpKind::IntMul => ba.mul_bound(&bb),
            _ => unreachable!(),
        };
        self.set_result_bound(Value::Box(r), bound);
        Ok(())
    }

    // ---- Guards ----

    fn opt_guard(&mut self, op: &TraceOp) -> Result<(), CompileError> {
        match op.opcode {
            OpKind::GuardNoOverflow => {
                if self.last_ovf_elided {
                    self.stats.guards_elided += 1;
                    self.last_ovf_elided = false;
                } else {
                    self.emit_guard(op, self.resolved_args(op))?;
                }
                Ok(())
            }
            OpKind::GuardTrue | OpKind::GuardFalse => {
                let cond = self.get_value(op.args[0]);
                let want = op.opcode == OpKind::GuardTrue;
                if let Some(ConstVal::Int(i)) = cond.as_const() {
                    return if (i != 0) == want {
                        self.stats.guards_elided += 1;
                        Ok(())
                    } else {
                        Err(CompileError::invalid("guard on constant condition fails"))
                    };
                }
                if let Some(truth) = self.fold_comparison_of_box(cond) {
                    if truth == want {
                        self.stats.guards_elided += 1;
                        self.make_alias(cond.as_box().expect("const handled"), Value::int(truth as i64));
                        return Ok(());
                    }
                    return Err(CompileError::invalid("guard on decided condition fails"));
                }
                self.emit_guard(op, vec![cond])?;
                if let Value::Box(b) = cond {
                    // The guard proves the condition; the box is the constant from here on.
                    self.propagate_cond(b, want);
                    self.make_alias(b, Value::int(want as i64));
                }
                Ok(())
            }
            OpKind::GuardValue => {
                let v = self.get_value(op.args[0]);
                let expected = op.args[1]
                    .as_const()
                    .ok_or_else(|| CompileError::invalid("guard_value needs a constant"))?;
                if let Some(c) = v.as_const() {
                    return if c == expected {
                        self.stats.guards_elided += 1;
                        Ok(())
                    } else {
                        Err(CompileError::invalid("guard_value on differing constant"))
                    };
                }
                self.emit_guard(op, vec![v, Value::Const(expected)])?;
                if let Value::Box(b) = v {
                    self.make_alias(b, Value::Const(expected));
                }
                Ok(())
            }
            OpKind::GuardNonnull => {
                let v = self.get_value(op.args[0]);
                if let Some(c) = v.as_const() {
                    return if c.is_null_ref() {
                        Err(CompileError::invalid("guard_nonnull on null constant"))
                    } else {
                        self.stats.guards_elided += 1;
                        Ok(())
                    };
                }
                if self.is_virtual(v)
                    || self
                        .info_of(v)
                        .and_then(Info::as_ptr)
                        .is_some_and(PtrInfo::is_nonnull)
                {
                    self.stats.guards_elided += 1;
                    return Ok(());
                }
                self.emit_guard(op, vec![v])?;
                if let Value::Box(b) = v {
                    self.ptr_info_mut(b).escalate(PtrLevel::NonNull, None);
                }
                Ok(())
            }
            OpKind::GuardClass | OpKind::GuardNonnullClass => {
                let v = self.get_value(op.args[0]);
                let expected = op
                    .descr
                    .and_then(Descr::as_class)
                    .ok_or_else(|| CompileError::invalid("class guard without class descr"))?;
                match self.known_class(v) {
                    Some(c) if c == expected => {
                        self.stats.guards_elided += 1;
                        return Ok(());
                    }
                    Some(_) => {
                        return Err(CompileError::invalid("class guard contradicts known class"))
                    }
                    None => {}
                }
                let nonnull = self
                    .info_of(v)
                    .and_then(Info::as_ptr)
                    .is_some_and(PtrInfo::is_nonnull);
                let mut emitted = op.clone();
                emitted.args = vec![v];
                if op.opcode == OpKind::GuardNonnullClass && nonnull {
                    // Strengthened: nullness is already proven, check only the class.
                    emitted.opcode = OpKind::GuardClass;
                }
                self.emit_guard(&emitted, emitted.args.clone())?;
                if let Value::Box(b) = v {
                    self.ptr_info_mut(b)
                        .escalate(PtrLevel::KnownClass, Some(expected));
                }
                Ok(())
            }
            _ => unreachable!("non-guard opcode in opt_guard"),
        }
    }

    pub(crate) fn emit_guard(&mut self, op: &TraceOp, args: Vec<Value>) -> Result<(), CompileError> {
        let mut emitted = op.clone();
        emitted.args = args;
        if emitted.snapshot.is_none() {
            emitted.snapshot = self.last_snapshot;
        }
        self.encode_resume_for(&emitted)?;
        self.emit_op(emitted);
        Ok(())
    }

    /// Encodes the guard's resume data against the *current* pass state (virtualness as of this
    /// point in the trace, delayed stores outstanding right now).
    fn encode_resume_for(&mut self, op: &TraceOp) -> Result<(), CompileError> {
        let Some(snap) = op.snapshot else {
            return Ok(());
        };
        let pending = self.heap.outstanding_lazy_stores();
        let mut memo = std::mem::take(&mut self.resume_memo);
        let result = {
            let adder = ResumeDataVirtualAdder::new(&mut memo, self, self.registry);
            adder.encode(&self.out, snap, &pending)
        };
        self.resume_memo = memo;
        self.guard_resume.insert(self.out.ops.len(), result?);
        Ok(())
    }

    fn fold_comparison_of_box(&self, cond: Value) -> Option<bool> {
        let b = cond.as_box()?;
        let (opcode, args) = self.producer.get(&b)?.clone();
        if !opcode.is_comparison() {
            return None;
        }
        self.fold_comparison(opcode, &args)
    }

    /// Propagates the truth of an emitted comparison guard back into operand bounds.
    fn propagate_cond(&mut self, cond: BoxId, truth: bool) {
        if !self.cfg.enable_int_bounds {
            return;
        }
        let Some((opcode, args)) = self.producer.get(&cond).cloned() else {
            return;
        };
        // Normalize to `a < b` / `a <= b` facts.
        let (lt, a, b) = match (opcode, truth) {
            (OpKind::IntLt, true) | (OpKind::IntGe, false) => (true, args[0], args[1]),
            (OpKind::IntGt, true) | (OpKind::IntLe, false) => (true, args[1], args[0]),
            (OpKind::IntLe, true) | (OpKind::IntGt, false) => (false, args[0], args[1]),
            (OpKind::IntGe, true) | (OpKind::IntLt, false) => (false, args[1], args[0]),
            (OpKind::IntEq, true) | (OpKind::IntNe, false) => {
                self.propagate_int_eq(args[0], args[1]);
                return;
            }
            (OpKind::IntIsZero, true) | (OpKind::IntIsTrue, false) => {
                self.propagate_int_eq(args[0], Value::ZERO);
                return;
            }
            (OpKind::IntIsTrue, true) | (OpKind::IntIsZero, false) => return,
            (OpKind::PtrEq, true) | (OpKind::PtrNe, false) => {
                self.propagate_ptr_eq(args[0], args[1]);
                return;
            }
            (OpKind::PtrEq, false) | (OpKind::PtrNe, true) => {
                self.propagate_ptr_ne(args[0], args[1]);
                return;
            }
            _ => return,
        };
        let ba = self.int_bound(a);
        let bb = self.int_bound(b);
        if lt {
            if bb.has_upper {
                self.tighten_int(a, |x| x.make_lt(bb.upper));
            }
            if ba.has_lower {
                self.tighten_int(b, |x| x.make_gt(ba.lower));
            }
        } else {
            if bb.has_upper {
                self.tighten_int(a, |x| x.make_le(bb.upper));
            }
            if ba.has_lower {
                self.tighten_int(b, |x| x.make_ge(ba.lower));
            }
        }
    }

    fn propagate_int_eq(&mut self, a: Value, b: Value) {
        match (self.get_value(a), self.get_value(b)) {
            (Value::Box(x), c @ Value::Const(_)) | (c @ Value::Const(_), Value::Box(x)) => {
                self.make_alias(x, c);
            }
            (Value::Box(x), Value::Box(y)) => {
                let bx = self.int_bound(Value::Box(x));
                let by = self.int_bound(Value::Box(y));
                self.tighten_int(Value::Box(x), |v| v.intersect(&by));
                self.tighten_int(Value::Box(y), |v| v.intersect(&bx));
            }
            _ => {}
        }
    }

    fn propagate_ptr_eq(&mut self, a: Value, b: Value) {
        match (self.get_value(a), self.get_value(b)) {
            (Value::Box(x), c @ Value::Const(_)) | (c @ Value::Const(_), Value::Box(x)) => {
                self.make_alias(x, c);
            }
            _ => {}
        }
    }

    fn propagate_ptr_ne(&mut self, a: Value, b: Value) {
        let (va, vb) = (self.get_value(a), self.get_value(b));
        for (v, other) in [(va, vb), (vb, va)] {
            if other.as_const().is_some_and(ConstVal::is_null_ref) {
                if let Value::Box(x) = v {
                    self.ptr_info_mut(x).escalate(PtrLevel::NonNull, None);
                }
            }
        }
    }

    // ---- Allocation and virtuals ----

    fn opt_new(&mut self, op: &TraceOp) -> Result<(), CompileError> {
        let r = op.result.expect("allocation without result");
        match op.opcode {
            OpKind::New => {
                let sid = match op.descr {
                    Some(Descr::Struct(s)) => s,
                    _ => return Err(CompileError::invalid("new without struct descr")),
                };
                if !self.cfg.enable_virtuals {
                    let mut emitted = op.clone();
                    emitted.args = Vec::new();
                    self.emit_op(emitted);
                    let class = self.registry.class_of_struct(sid);
                    self.set_info(r, Info::Ptr(PtrInfo::with_class(class)));
                    return Ok(());
                }
                let nfields = self.registry.struct_def(sid).fields.len();
                self.stats.virtuals_created += 1;
                self.set_info(
                    r,
                    Info::VStruct(VStructInfo {
                        struct_id: sid,
                        class: self.registry.class_of_struct(sid),
                        fields: vec![None; nfields],
                    }),
                );
                Ok(())
            }
            OpKind::NewArray | OpKind::NewArrayStruct => {
                let aid = match op.descr {
                    Some(Descr::Array(a)) => a,
                    _ => return Err(CompileError::invalid("new_array without array descr")),
                };
                let len = self.get_value(op.args[0]);
                match len.as_const().and_then(ConstVal::as_int) {
                    Some(n) if n < 0 => {
                        Err(CompileError::invalid("array allocated with negative length"))
                    }
                    Some(n) if self.cfg.enable_virtuals => {
                        self.stats.virtuals_created += 1;
                        if op.opcode == OpKind::NewArrayStruct {
                            let es = match self.registry.array(aid).elem {
                                ArrayElem::Struct(s) => s,
                                _ => {
                                    return Err(CompileError::invalid(
                                        "new_array_struct on a plain array descr",
                                    ))
                                }
                            };
                            let nfields = self.registry.struct_def(es).fields.len();
                            self.set_info(
                                r,
                                Info::VArrayStruct(VArrayStructInfo {
                                    array_id: aid,
                                    elem_struct: es,
                                    slots: vec![vec![None; nfields]; n as usize],
                                }),
                            );
                        } else {
                            self.set_info(
                                r,
                                Info::VArray(VArrayInfo {
                                    array_id: aid,
                                    items: vec![None; n as usize],
                                }),
                            );
                        }
                        Ok(())
                    }
                    _ => {
                        let mut emitted = op.clone();
                        emitted.args = vec![len];
                        self.emit_op(emitted);
                        let len_bound = {
                            let mut b = self.int_bound(len);
                            b.make_ge(0);
                            b
                        };
                        let p = self.ptr_info_mut(r);
                        p.level = PtrLevel::NonNull;
                        p.length = Some(len_bound);
                        Ok(())
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    fn opt_newstr(&mut self, op: &TraceOp) {
        let r = op.result.expect("newstr without result");
        let len = self.get_value(op.args[0]);
        let mut emitted = op.clone();
        emitted.args = vec![len];
        self.emit_op(emitted);
        let len_bound = {
            let mut b = self.int_bound(len);
            b.make_ge(0);
            b
        };
        let p = self.ptr_info_mut(r);
        p.level = PtrLevel::NonNull;
        p.length = Some(len_bound);
    }

    // ---- Heap access ----

    fn opt_getfield(&mut self, op: &TraceOp) {
        let base = self.get_value(op.args[0]);
        let f = op.descr.and_then(Descr::as_field).expect("getfield descr");
        let r = op.result.expect("getfield without result");

        let virtual_slot = match self.info_of(base) {
            Some(Info::VStruct(vs)) => Some(vs.fields[self.registry.field_index(f) as usize]),
            _ => None,
        };
        if let Some(slot) = virtual_slot {
            let v = slot.unwrap_or(Value::Const(ConstVal::default_of(self.registry.field_ty(f))));
            self.stats.heap_reads_elided += 1;
            self.make_alias(r, v);
            return;
        }

        if self.cfg.enable_heap_cache {
            if let Some(v) = self.heap.read_field(f, base) {
                self.stats.heap_reads_elided += 1;
                self.make_alias(r, v);
                return;
            }
            if let Some(v) = self.try_short_heap(op.opcode, base, None, Descr::Field(f)) {
                self.stats.heap_reads_elided += 1;
                self.make_alias(r, v);
                return;
            }
            if let Some(flush) = self.heap.before_field_read(f, base) {
                self.emit_lazy_stores(vec![flush]);
            }
        }
        let mut emitted = op.clone();
        emitted.args = vec![base];
        self.emit_op(emitted);
        if self.cfg.enable_heap_cache {
            self.heap.remember_field_read(f, base, Value::Box(r));
        }
    }

    fn opt_setfield(&mut self, op: &TraceOp) {
        let base = self.get_value(op.args[0]);
        let value = self.get_value(op.args[1]);
        let f = op.descr.and_then(Descr::as_field).expect("setfield descr");

        if let Some(Info::VStruct(_)) = self.info_of(base) {
            let idx = self.registry.field_index(f) as usize;
            let b = base.as_box().expect("virtual must be a box");
            match self.info_of_box_mut(b) {
                Some(Info::VStruct(vs)) => vs.fields[idx] = Some(value),
                _ => unreachable!(),
            }
            return;
        }

        // The stored value escapes into the real heap.
        let value = self.force_value(value);
        if !self.cfg.enable_heap_cache {
            self.emit_op(
                TraceOp::new(OpKind::SetField, vec![base, value]).with_descr(Descr::Field(f)),
            );
            return;
        }
        if self.heap.has_lazy(f, base) {
            self.stats.dead_stores_elided += 1;
        }
        if let Some(flush) = self.heap.write_field(f, base, value) {
            self.emit_lazy_stores(vec![flush]);
        }
    }

    fn opt_get_array(&mut self, op: &TraceOp) -> Result<(), CompileError> {
        let base = self.get_value(op.args[0]);
        let index = self.get_value(op.args[1]);
        let r = op.result.expect("array read without result");
        let idx_const = index.as_const().and_then(ConstVal::as_int);

        let vinfo = self.info_of(base).filter(|i| i.is_virtual()).cloned();
        match (op.opcode, vinfo) {
            (OpKind::GetArrayItem, Some(Info::VArray(va))) => {
                let Some(i) = idx_const else {
                    // Reading a virtual array at an unknown index forces it.
                    let forced = self.force_value(base);
                    return self.emit_array_read(op, forced, index, r);
                };
                if i < 0 || i as usize >= va.items.len() {
                    return Err(CompileError::invalid("array read out of bounds"));
                }
                let v = va.items[i as usize].unwrap_or(Value::Const(ConstVal::default_of(
                    self.registry.elem_ty(va.array_id).unwrap_or(ValType::Int),
                )));
                self.stats.heap_reads_elided += 1;
                self.make_alias(r, v);
                Ok(())
            }
            (OpKind::GetInteriorField, Some(Info::VArrayStruct(vas))) => {
                let f = op
                    .descr
                    .and_then(|d| match d {
                        Descr::Interior(_, f) => Some(f),
                        _ => None,
                    })
                    .ok_or_else(|| CompileError::invalid("interior read without field descr"))?;
                let Some(i) = idx_const else {
                    let forced = self.force_value(base);
                    return self.emit_array_read(op, forced, index, r);
                };
                if i < 0 || i as usize >= vas.slots.len() {
                    return Err(CompileError::invalid("interior read out of bounds"));
                }
                let fidx = self.registry.field_index(f) as usize;
                let v = vas.slots[i as usize][fidx]
                    .unwrap_or(Value::Const(ConstVal::default_of(self.registry.field_ty(f))));
                self.stats.heap_reads_elided += 1;
                self.make_alias(r, v);
                Ok(())
            }
            _ => self.emit_array_read(op, base, index, r),
        }
    }

    fn emit_array_read(
        &mut self,
        op: &TraceOp,
        base: Value,
        index: Value,
        r: BoxId,
    ) -> Result<(), CompileError> {
        let aid = op.descr.and_then(Descr::as_array).expect("array descr");
        let idx_const = index.as_const().and_then(ConstVal::as_int);
        if self.cfg.enable_heap_cache && op.opcode == OpKind::GetArrayItem {
            if let Some(i) = idx_const {
                if let Some(v) = self.heap.read_array_item(aid, base, i) {
                    self.stats.heap_reads_elided += 1;
                    self.make_alias(r, v);
                    return Ok(());
                }
            }
            if let Some(v) = self.try_short_heap(op.opcode, base, Some(index), Descr::Array(aid)) {
                self.stats.heap_reads_elided += 1;
                self.make_alias(r, v);
                return Ok(());
            }
        }
        let mut emitted = op.clone();
        emitted.args = vec![base, index];
        self.emit_op(emitted);
        if self.cfg.enable_heap_cache && op.opcode == OpKind::GetArrayItem {
            if let Some(i) = idx_const {
                self.heap.remember_array_read(aid, base, i, Value::Box(r));
            }
        }
        Ok(())
    }

    fn opt_set_array(&mut self, op: &TraceOp) -> Result<(), CompileError> {
        let base = self.get_value(op.args[0]);
        let index = self.get_value(op.args[1]);
        let value = self.get_value(op.args[2]);
        let idx_const = index.as_const().and_then(ConstVal::as_int);

        let vlen = match self.info_of(base) {
            Some(Info::VArray(va)) if op.opcode == OpKind::SetArrayItem => Some(va.items.len()),
            Some(Info::VArrayStruct(vas)) if op.opcode == OpKind::SetInteriorField => {
                Some(vas.slots.len())
            }
            _ => None,
        };
        let Some(len) = vlen else {
            return self.emit_array_write(op, base, index, value);
        };

        let Some(i) = idx_const else {
            // Writing a virtual array at an unknown index forces it.
            let forced = self.force_value(base);
            return self.emit_array_write(op, forced, index, value);
        };
        if i < 0 || i as usize >= len {
            return Err(CompileError::invalid("array write out of bounds"));
        }
        let b = base.as_box().expect("virtual must be a box");
        match op.opcode {
            OpKind::SetArrayItem => match self.info_of_box_mut(b) {
                Some(Info::VArray(va)) => va.items[i as usize] = Some(value),
                _ => unreachable!(),
            },
            OpKind::SetInteriorField => {
                let f = op
                    .descr
                    .and_then(|d| match d {
                        Descr::Interior(_, f) => Some(f),
                        _ => None,
                    })
                    .ok_or_else(|| CompileError::invalid("interior write without field descr"))?;
                let fidx = self.registry.field_index(f) as usize;
                match self.info_of_box_mut(b) {
                    Some(Info::VArrayStruct(vas)) => vas.slots[i as usize][fidx] = Some(value),
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn emit_array_write(
        &mut self,
        op: &TraceOp,
        base: Value,
        index: Value,
        value: Value,
    ) -> Result<(), CompileError> {
        let value = self.force_value(value);
        let mut emitted = op.clone();
        emitted.args = vec![base, index, value];
        self.emit_op(emitted);
        if self.cfg.enable_heap_cache && op.opcode == OpKind::SetArrayItem {
            let aid = op.descr.and_then(Descr::as_array).expect("array descr");
            let idx_const = index.as_const().and_then(ConstVal::as_int);
            self.heap.write_array_item(aid, base, idx_const, value);
        }
        Ok(())
    }

    fn opt_length(&mut self, op: &TraceOp) {
        let base = self.get_value(op.args[0]);
        let r = op.result.expect("length op without result");

        let virtual_len = match self.info_of(base) {
            Some(Info::VArray(va)) => Some(va.items.len() as i64),
            Some(Info::VArrayStruct(vas)) => Some(vas.slots.len() as i64),
            _ => None,
        };
        if let Some(n) = virtual_len {
            self.stats.heap_reads_elided += 1;
            self.make_alias(r, Value::int(n));
            return;
        }
        let known = self
            .info_of(base)
            .and_then(Info::as_ptr)
            .and_then(|p| p.length.as_ref())
            .copied();
        if let Some(bound) = known {
            if let Some(n) = bound.constant() {
                self.stats.heap_reads_elided += 1;
                self.make_alias(r, Value::int(n));
                return;
            }
        }

        // Lengths are immutable, so the generic pure machinery (CSE, short boxes) applies.
        let mut as_pure = op.clone();
        as_pure.args = vec![base];
        if self.opt_pure(&as_pure).is_err() {
            unreachable!("length ops cannot fail the pure path");
        }
        let mut bound = known.unwrap_or_else(IntBound::nonnegative);
        bound.make_ge(0);
        self.set_result_bound(Value::Box(r), bound);
        if let Value::Box(b) = base {
            if !self.is_virtual(base) {
                self.ptr_info_mut(b).length = Some(bound);
            }
        }
    }

    // ---- Calls ----

    fn opt_call(&mut self, op: &TraceOp) -> Result<(), CompileError> {
        let cid = op
            .descr
            .and_then(Descr::as_call)
            .ok_or_else(|| CompileError::invalid("call without call descr"))?;
        let args = self.resolved_args(op);

        let elidable =
            op.opcode == OpKind::CallPure || self.registry.call_is_always_pure(cid);
        if elidable {
            // An elidable call whose result is unused has no observable effect at all.
            let Some(r) = op.result else {
                self.stats.pure_cse_hits += 1;
                return Ok(());
            };
            let key: PureKey = (OpKind::CallPure, args.clone(), op.descr);
            if let Some(prev) = self.pure_cache.lookup(&key) {
                self.stats.pure_cse_hits += 1;
                self.make_alias(r, prev);
                return Ok(());
            }
            if let Some(v) = self.try_short_pure(OpKind::CallPure, &args, op.descr) {
                self.stats.pure_cse_hits += 1;
                self.make_alias(r, v);
                return Ok(());
            }
            let mut emitted = op.clone();
            emitted.opcode = OpKind::CallPure;
            emitted.args = args;
            self.emit_op(emitted);
            self.pure_cache.remember(key, Value::Box(r));
            return Ok(());
        }

        if op.opcode == OpKind::CallLoopInvariant {
            let key = *args.first().ok_or_else(|| {
                CompileError::invalid("loop-invariant call without arguments")
            })?;
            if !key.is_const() {
                return Err(CompileError::invalid(
                    "loop-invariant call must be keyed by a constant first argument",
                ));
            }
            let r = op.result.expect("loop-invariant call without result");
            if let Some(prev) = self.loopinv_cache.lookup(key) {
                self.stats.pure_cse_hits += 1;
                self.make_alias(r, prev);
                return Ok(());
            }
            if let Some(v) = self.try_short_loopinvariant(key) {
                self.stats.pure_cse_hits += 1;
                self.make_alias(r, v);
                return Ok(());
            }
            let mut emitted = op.clone();
            emitted.args = args;
            self.emit_op(emitted);
            self.loopinv_cache.remember(key, Value::Box(r));
            return Ok(());
        }

        // Residual call: reference arguments escape.
        let args: Vec<Value> = args.into_iter().map(|a| self.force_value(a)).collect();
        let effect = self.registry.call(cid).effect.clone();
        if effect.flags.contains(EffectFlags::CAN_FORCE_VIRTUALS) {
            // The callee may reach and force anything still symbolic; drop all heap knowledge.
            self.flush_heap();
        } else {
            let stores = self.heap.before_call(&effect);
            self.emit_lazy_stores(stores);
        }
        let mut emitted = op.clone();
        emitted.args = args;
        self.emit_op(emitted);
        Ok(())
    }

    // ---- Short-box lookups (peeled pass only) ----

    fn try_short_pure(
        &mut self,
        opcode: OpKind,
        args: &[Value],
        descr: Option<Descr>,
    ) -> Option<Value> {
        let short = self.short.as_ref()?;
        let pre_args: Option<Vec<Value>> =
            args.iter().map(|&a| short.translate_to_pre(a)).collect();
        let key: PureKey = (opcode, pre_args?, descr);
        let pre_box = short.builder.boxes().lookup_pure(&key)?;
        self.use_short_box(pre_box)
    }

    fn try_short_heap(
        &mut self,
        opcode: OpKind,
        base: Value,
        index: Option<Value>,
        descr: Descr,
    ) -> Option<Value> {
        let short = self.short.as_ref()?;
        let pre_base = short.translate_to_pre(base)?;
        let pre_index = match index {
            Some(i) => Some(short.translate_to_pre(i)?),
            None => None,
        };
        let key = (opcode, pre_base, pre_index, descr);
        let pre_box = short.builder.boxes().lookup_heap(&key)?;
        self.use_short_box(pre_box)
    }

    fn try_short_loopinvariant(&mut self, key: Value) -> Option<Value> {
        let short = self.short.as_ref()?;
        let pre_box = short.builder.boxes().lookup_loopinvariant(key)?;
        self.use_short_box(pre_box)
    }

    /// Pulls a preamble value into the short preamble and gives it a body-side box.
    fn use_short_box(&mut self, pre_box: BoxId) -> Option<Value> {
        let short = self
            .short
            .as_mut()
            .expect("short-box use outside the peeled pass");
        if let Some(&v) = short.pre_to_body.get(&pre_box) {
            return Some(v);
        }
        if !short.builder.use_box(pre_box) {
            return None;
        }
        let ty = self.out.box_type(pre_box);
        let nb = self.new_box(ty);
        let short = self
            .short
            .as_mut()
            .expect("short-box use outside the peeled pass");
        short.pre_to_body.insert(pre_box, Value::Box(nb));
        short.body_to_pre.insert(Value::Box(nb), Value::Box(pre_box));
        short.extra_args.push((pre_box, nb));
        Some(Value::Box(nb))
    }
}

/// Constant folding of always-pure int/ptr ops.
fn fold_constant(opcode: OpKind, args: &[Value]) -> Option<ConstVal> {
    let int = |i: usize| args[i].as_const().and_then(ConstVal::as_int);
    let bool_c = |b: bool| Some(ConstVal::Int(b as i64));
    match opcode {
        OpKind::IntAdd => Some(ConstVal::Int(int(0)?.wrapping_add(int(1)?))),
        OpKind::IntSub => Some(ConstVal::Int(int(0)?.wrapping_sub(int(1)?))),
        OpKind::IntMul => Some(ConstVal::Int(int(0)?.wrapping_mul(int(1)?))),
        OpKind::IntAnd => Some(ConstVal::Int(int(0)? & int(1)?)),
        OpKind::IntOr => Some(ConstVal::Int(int(0)? | int(1)?)),
        OpKind::IntXor => Some(ConstVal::Int(int(0)? ^ int(1)?)),
        OpKind::IntLshift => {
            let (a, s) = (int(0)?, int(1)?);
            (0..64).contains(&s).then(|| ConstVal::Int(a.wrapping_shl(s as u32)))
        }
        OpKind::IntRshift => {
            let (a, s) = (int(0)?, int(1)?);
            (0..64).contains(&s).then(|| ConstVal::Int(a >> s))
        }
        OpKind::IntLt => bool_c(int(0)? < int(1)?),
        OpKind::IntLe => bool_c(int(0)? <= int(1)?),
        OpKind::IntGt => bool_c(int(0)? > int(1)?),
        OpKind::IntGe => bool_c(int(0)? >= int(1)?),
        OpKind::IntEq => bool_c(int(0)? == int(1)?),
        OpKind::IntNe => bool_c(int(0)? != int(1)?),
        OpKind::IntIsZero => bool_c(int(0)? == 0),
        OpKind::IntIsTrue => bool_c(int(0)? != 0),
        OpKind::PtrEq | OpKind::PtrNe => {
            let (a, b) = (args[0].as_const()?.as_ref()?, args[1].as_const()?.as_ref()?);
            bool_c((a == b) == (opcode == OpKind::PtrEq))
        }
        _ => None,
    }
}

// ---- Trait plumbing ---------------------------------------------------------------------------

impl InfoView for Optimizer<'_> {
    fn resolve(&self, v: Value) -> Value {
        self.get_value(v)
    }

    fn info_value(&self, v: Value) -> Option<&Info> {
        self.info_of(v)
    }

    fn ty_of(&self, v: Value) -> ValType {
        self.out.value_type(v)
    }
}

impl BoxSource for Optimizer<'_> {
    fn fresh_box(&mut self, ty: ValType) -> BoxId {
        self.new_box(ty)
    }
}
