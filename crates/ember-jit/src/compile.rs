//! Loop compilation (peeling), target tokens, and bridge compilation.
//!
//! A loop trace is optimized twice: the first pass produces the *preamble* and captures the
//! virtual state at its jump; the second pass re-optimizes the same ops as the steady-state
//! *body*, importing the label's proven facts and pulling loop-invariant values out through the
//! short preamble. The label's virtual state, reduced argument list, and short preamble are
//! retained on a [`TargetToken`] for the lifetime of the compiled loop; every later bridge is
//! matched against that token.
//!
//! Convention: a loop trace's terminating `Jump` arguments align positionally with its input
//! boxes (the back edge targets the trace's own head).

use std::collections::HashMap;

use ember_ir::{
    BoxId, ConstVal, OpKind, Trace, TraceOp, TypeRegistry, ValType, Value,
};

use crate::error::{CompileError, VirtualStatesCantMatch};
use crate::opt::info::{Info, PtrLevel, VArrayInfo, VArrayStructInfo, VStructInfo};
use crate::opt::optimizer::{OptConfig, Optimizer, ShortState};
use crate::resume::GuardResume;
use crate::shortpreamble::{create_short_boxes, Obligations, ShortPreambleBuilder};
use crate::stats::OptStats;
use crate::vstate::{capture_state, MatchParams, NodeId, RuntimeSampler, StateNode, VirtualState};

/// What a compiled loop's label retains for future re-entry attempts.
#[derive(Debug)]
pub struct TargetToken {
    /// Structural signature at the loop label, in preamble box terms.
    pub virtual_state: VirtualState,
    /// Reduced label arguments (not-virtual slots only), preamble terms.
    pub reduced_args: Vec<Value>,
    /// Short-box results appended to the label by the body pass, preamble terms.
    pub extra_args: Vec<BoxId>,
    /// Operation list that reconstructs the extra args (and their proof obligations) from the
    /// reduced args. Preamble terms; inlined by every matching bridge.
    pub short_preamble: Vec<TraceOp>,
    /// Result types of the short preamble's ops. Bridges replay those ops in their own box
    /// space, so the preamble arena is not available to them.
    short_result_types: HashMap<BoxId, ValType>,
}

impl TargetToken {
    fn short_result_type(&self, b: BoxId) -> ValType {
        *self
            .short_result_types
            .get(&b)
            .unwrap_or_else(|| panic!("BROKEN short preamble: untyped result {b:?}"))
    }
}

/// A compiled loop: warm-up preamble, steady-state body, and the retained token.
#[derive(Debug)]
pub struct CompiledLoop {
    pub preamble: Trace,
    pub body: Trace,
    pub token: TargetToken,
    /// Resume data per guard, keyed by op index, for preamble and body respectively.
    pub preamble_resume: HashMap<usize, GuardResume>,
    pub body_resume: HashMap<usize, GuardResume>,
    /// Shared constant pool referenced by the resume numberings.
    pub consts: Vec<ConstVal>,
    pub preamble_stats: OptStats,
    pub body_stats: OptStats,
}

/// Result of one plain (non-peeling) optimization, also used for bridges.
#[derive(Debug)]
pub struct OptimizedTrace {
    pub trace: Trace,
    pub resume: HashMap<usize, GuardResume>,
    pub consts: Vec<ConstVal>,
    pub stats: OptStats,
}

/// Optimizes a straight-line or loop trace in a single pass, without peeling. Loop back-edge
/// arguments are forced to concrete values.
pub fn optimize_trace(
    trace: &Trace,
    registry: &TypeRegistry,
    cfg: OptConfig,
) -> Result<OptimizedTrace, CompileError> {
    trace
        .validate(registry)
        .map_err(|e| CompileError::invalid(e.to_string()))?;
    let mut arena = trace.fork_arena();
    arena.inputs = trace.inputs.clone();
    let mut opt = Optimizer::new(registry, cfg, arena, false);
    if let Some(jump) = opt.run(&trace.ops)? {
        let args: Vec<Value> = jump.args.into_iter().map(|a| opt.force_value(a)).collect();
        opt.emit_op(TraceOp::new(OpKind::Jump, args));
    }
    opt.stats.log_summary("trace");
    Ok(OptimizedTrace {
        trace: opt.out,
        resume: opt.guard_resume,
        consts: opt.resume_memo.consts,
        stats: opt.stats,
    })
}

/// Compiles a loop trace into preamble + peeled body with a re-entry token.
pub fn compile_loop(
    trace: &Trace,
    registry: &TypeRegistry,
    cfg: OptConfig,
) -> Result<CompiledLoop, CompileError> {
    trace
        .validate(registry)
        .map_err(|e| CompileError::invalid(e.to_string()))?;
    if cfg.enable_peeling {
        if let Some(compiled) = compile_peeled(trace, registry, cfg)? {
            return Ok(compiled);
        }
        tracing::debug!(target: "ember_jit::compile", "peeling failed to close the loop, compiling unpeeled");
    }
    compile_simple(trace, registry, cfg)
}

fn compile_peeled(
    trace: &Trace,
    registry: &TypeRegistry,
    cfg: OptConfig,
) -> Result<Option<CompiledLoop>, CompileError> {
    // Pass 1: the preamble. Collects short-op candidates as it emits.
    let mut arena = trace.fork_arena();
    arena.inputs = trace.inputs.clone();
    let mut pre = Optimizer::new(registry, cfg, arena, true);
    let Some(jump) = pre.run(&trace.ops)? else {
        return Err(CompileError::invalid("loop trace does not end in a jump"));
    };
    if jump.args.len() != trace.inputs.len() {
        return Err(CompileError::invalid(
            "loop back edge arity differs from trace inputs",
        ));
    }

    let label_values = jump.args;
    let virtual_state = capture_state(&label_values, &pre, registry);
    let reduced_args = virtual_state
        .make_inputargs(&label_values, &mut pre, false)
        .expect("preamble state disagrees with its own values");
    pre.emit_op(TraceOp::new(OpKind::Label, reduced_args.clone()));

    let short_boxes = create_short_boxes(&pre.potential, &reduced_args);
    let obligations = collect_obligations(&pre, &short_boxes, &reduced_args);

    // Pass 2: the steady-state body. Fresh boxes for the label slots, preamble knowledge
    // imported from the virtual state, short boxes on tap.
    let mut body_arena = pre.out.fork_arena();
    body_arena.inputs = Vec::new();
    let mut body = Optimizer::new(registry, cfg, body_arena, false);
    body.resume_memo = std::mem::take(&mut pre.resume_memo);

    let mut body_inputs: Vec<Value> = Vec::with_capacity(reduced_args.len());
    for &arg in &reduced_args {
        match arg {
            Value::Box(b) => {
                let ty = pre.out.box_type(b);
                let nb = body.new_box(ty);
                body.out.inputs.push(nb);
                body_inputs.push(Value::Box(nb));
            }
            Value::Const(c) => body_inputs.push(Value::Const(c)),
        }
    }

    let mut short = ShortState::new(ShortPreambleBuilder::new(
        short_boxes,
        obligations,
        cfg.max_short_preamble_ops,
    ));
    for (&pre_v, &body_v) in reduced_args.iter().zip(body_inputs.iter()) {
        short.map_label_arg(pre_v, body_v);
    }
    body.short = Some(short);

    let body_roots = import_state(&mut body, &virtual_state, &body_inputs);
    for (i, &input) in trace.inputs.iter().enumerate() {
        body.make_alias(input, body_roots[i]);
    }

    let Some(body_jump) = body.run(&trace.ops)? else {
        return Err(CompileError::invalid("peeled iteration lost the back edge"));
    };

    // The peeled iteration must reach a state the label accepts; forcing is allowed. If it
    // cannot, the peeling attempt is abandoned (the loop still compiles, just unpeeled).
    let closing = match virtual_state.make_inputargs(&body_jump.args, &mut body, true) {
        Ok(args) => args,
        Err(_) => return Ok(None),
    };

    let short = body.short.take().expect("short state installed above");
    let extra_pre: Vec<BoxId> = short.extra_args.iter().map(|&(p, _)| p).collect();
    let extra_body: Vec<Value> = short
        .extra_args
        .iter()
        .map(|&(_, b)| Value::Box(b))
        .collect();

    // Extended label: reduced slots plus every short-box value the body demanded. Short-box
    // values are loop-invariant, so the back edge passes them through unchanged.
    for v in &extra_body {
        if let Value::Box(b) = v {
            body.out.inputs.push(*b);
        }
    }
    let mut label_args = body_inputs.clone();
    label_args.extend(extra_body.iter().copied());
    let mut jump_args = closing;
    jump_args.extend(extra_body.iter().copied());

    body.out.ops.insert(0, TraceOp::new(OpKind::Label, label_args));
    body.out.ops.push(TraceOp::new(OpKind::Jump, jump_args));

    let short_preamble = short.builder.into_ops();
    let short_result_types = short_preamble
        .iter()
        .filter_map(|op| op.result.map(|r| (r, pre.out.box_type(r))))
        .collect();
    let token = TargetToken {
        virtual_state,
        reduced_args,
        extra_args: extra_pre,
        short_preamble,
        short_result_types,
    };

    pre.stats.log_summary("preamble");
    body.stats.log_summary("loop body");
    tracing::debug!(
        target: "ember_jit::compile",
        short_ops = token.short_preamble.len(),
        label_arity = token.reduced_args.len() + token.extra_args.len(),
        "loop compiled"
    );

    // Guard indices in the body shift by one for the prepended label.
    let body_resume = body
        .guard_resume
        .into_iter()
        .map(|(i, r)| (i + 1, r))
        .collect();

    Ok(Some(CompiledLoop {
        preamble: pre.out,
        body: body.out,
        token,
        preamble_resume: pre.guard_resume,
        body_resume,
        consts: body.resume_memo.consts,
        preamble_stats: pre.stats,
        body_stats: body.stats,
    }))
}

/// Unpeeled fallback: one pass, trivial re-entry state (every label slot unknown).
fn compile_simple(
    trace: &Trace,
    registry: &TypeRegistry,
    cfg: OptConfig,
) -> Result<CompiledLoop, CompileError> {
    let mut arena = trace.fork_arena();
    arena.inputs = trace.inputs.clone();
    let mut opt = Optimizer::new(registry, cfg, arena, false);
    let jump = opt.run(&trace.ops)?;
    let input_values: Vec<Value> = trace.inputs.iter().map(|&b| Value::Box(b)).collect();
    if let Some(jump) = jump {
        let args: Vec<Value> = jump.args.into_iter().map(|a| opt.force_value(a)).collect();
        opt.emit_op(TraceOp::new(OpKind::Jump, args));
    }

    // The re-entry state is captured at trace entry, where nothing is known yet.
    let entry_view = EmptyView { trace };
    let virtual_state = capture_state(&input_values, &entry_view, registry);

    opt.stats.log_summary("loop (unpeeled)");
    Ok(CompiledLoop {
        preamble: Trace::new(),
        body: opt.out,
        token: TargetToken {
            virtual_state,
            reduced_args: input_values,
            extra_args: Vec::new(),
            short_preamble: Vec::new(),
            short_result_types: HashMap::new(),
        },
        preamble_resume: HashMap::new(),
        body_resume: opt.guard_resume,
        consts: opt.resume_memo.consts,
        preamble_stats: OptStats::default(),
        body_stats: opt.stats,
    })
}

/// Info view of a trace entry: no facts about anything.
struct EmptyView<'a> {
    trace: &'a Trace,
}

impl crate::opt::info::InfoView for EmptyView<'_> {
    fn resolve(&self, v: Value) -> Value {
        v
    }

    fn info_value(&self, _v: Value) -> Option<&Info> {
        None
    }

    fn ty_of(&self, v: Value) -> ValType {
        self.trace.value_type(v)
    }
}

/// Residual class obligations of every box a short preamble might touch.
fn collect_obligations(
    pre: &Optimizer<'_>,
    boxes: &crate::shortpreamble::ShortBoxes,
    reduced_args: &[Value],
) -> Obligations {
    let mut obligations = Obligations::new();
    let mut note = |opt: &Optimizer<'_>, v: Value, obligations: &mut Obligations| {
        if let Value::Box(b) = opt.get_value(v) {
            if let Some(class) = opt.known_class(Value::Box(b)) {
                obligations.insert(b, class);
            }
        }
    };
    for &arg in reduced_args {
        note(pre, arg, &mut obligations);
    }
    for p in boxes.all() {
        if let Some(r) = p.op.result {
            note(pre, Value::Box(r), &mut obligations);
        }
        for &a in &p.op.args {
            note(pre, a, &mut obligations);
        }
    }
    obligations
}

/// Rebuilds the label's knowledge on the body side: not-virtual slots consume the fresh body
/// inputs in position order; virtual slots are recreated as body-side virtuals (DAG- and
/// cycle-safe via per-position memoization).
fn import_state(
    body: &mut Optimizer<'_>,
    state: &VirtualState,
    body_inputs: &[Value],
) -> Vec<Value> {
    let mut memo: HashMap<u32, Value> = HashMap::new();
    let mut next_input = 0usize;
    state
        .roots()
        .iter()
        .map(|&r| import_node(body, state, r, body_inputs, &mut next_input, &mut memo))
        .collect()
}

fn import_node(
    body: &mut Optimizer<'_>,
    state: &VirtualState,
    id: NodeId,
    body_inputs: &[Value],
    next_input: &mut usize,
    memo: &mut HashMap<u32, Value>,
) -> Value {
    let pos = state.position(id);
    if let Some(&v) = memo.get(&pos) {
        return v;
    }
    match state.node(id).clone() {
        StateNode::NotVirtual(n) => {
            let v = body_inputs[*next_input];
            *next_input += 1;
            memo.insert(pos, v);
            if let Value::Box(b) = v {
                match n.ty {
                    ValType::Int => {
                        if n.intbound != crate::opt::intbound::IntBound::unbounded() {
                            body.set_info(b, Info::Int(n.intbound));
                        }
                    }
                    ValType::Ref => {
                        if n.level > PtrLevel::Unknown {
                            let mut p = crate::opt::info::PtrInfo::default();
                            p.level = n.level.min(PtrLevel::KnownClass);
                            p.class = n.class;
                            p.length = n.length;
                            body.set_info(b, Info::Ptr(p));
                        }
                    }
                    ValType::Float => {}
                }
            }
            v
        }
        StateNode::VStruct {
            struct_id,
            class,
            children,
            ..
        } => {
            let nb = body.new_box(ValType::Ref);
            memo.insert(pos, Value::Box(nb));
            let child_values: Vec<Value> = children
                .iter()
                .map(|&c| import_node(body, state, c, body_inputs, next_input, memo))
                .collect();
            body.set_info(
                nb,
                Info::VStruct(VStructInfo {
                    struct_id,
                    class,
                    fields: child_values.into_iter().map(Some).collect(),
                }),
            );
            Value::Box(nb)
        }
        StateNode::VArray { array_id, children } => {
            let nb = body.new_box(ValType::Ref);
            memo.insert(pos, Value::Box(nb));
            let items: Vec<Option<Value>> = children
                .iter()
                .map(|&c| Some(import_node(body, state, c, body_inputs, next_input, memo)))
                .collect();
            body.set_info(nb, Info::VArray(VArrayInfo { array_id, items }));
            Value::Box(nb)
        }
        StateNode::VArrayStruct {
            array_id,
            elem_struct,
            slots,
            ..
        } => {
            let nb = body.new_box(ValType::Ref);
            memo.insert(pos, Value::Box(nb));
            let slot_values: Vec<Vec<Option<Value>>> = slots
                .iter()
                .map(|slot| {
                    slot.iter()
                        .map(|&c| Some(import_node(body, state, c, body_inputs, next_input, memo)))
                        .collect()
                })
                .collect();
            body.set_info(
                nb,
                Info::VArrayStruct(VArrayStructInfo {
                    array_id,
                    elem_struct,
                    slots: slot_values,
                }),
            );
            Value::Box(nb)
        }
    }
}

// ---- Bridges ----------------------------------------------------------------------------------

/// Whether a bridge reached an existing compiled target or must be retraced independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BridgeOutcome {
    Inlined,
    Retrace,
}

/// Arity/order contract the caller must jump with, plus the match outcome.
#[derive(Debug)]
pub struct BridgeInfo {
    pub inputargs: Vec<Value>,
    outcome: BridgeOutcome,
}

impl BridgeInfo {
    /// `true` iff the bridge matched the existing target (its short preamble was inlined);
    /// `false` means the bridge must become an independent retrace target.
    pub fn is_final(&self) -> bool {
        self.outcome == BridgeOutcome::Inlined
    }
}

/// Compilation of a trace that starts where a compiled guard failed, against the failed loop's
/// retained token.
pub struct BridgeCompileData<'a> {
    pub token: &'a TargetToken,
}

impl BridgeCompileData<'_> {
    /// Optimizes the bridge and tries to wire its end into the token's label: either an
    /// exact/generalizable match (guards synthesized, short preamble inlined, reduced jump) or
    /// [`VirtualStatesCantMatch`] (caught here, never propagated) and the bridge keeps its own
    /// forced arguments for independent retracing.
    pub fn optimize_trace(
        &self,
        bridge: &Trace,
        sampler: &dyn RuntimeSampler,
        registry: &TypeRegistry,
        cfg: OptConfig,
    ) -> Result<(BridgeInfo, OptimizedTrace), CompileError> {
        bridge
            .validate(registry)
            .map_err(|e| CompileError::invalid(e.to_string()))?;
        let mut arena = bridge.fork_arena();
        arena.inputs = bridge.inputs.clone();
        let mut opt = Optimizer::new(registry, cfg, arena, false);
        let Some(jump) = opt.run(&bridge.ops)? else {
            return Err(CompileError::invalid("bridge does not end in a jump"));
        };

        let outcome = match self.try_attach(&jump.args, &mut opt, sampler, registry)? {
            Ok(jump_args) => {
                opt.emit_op(TraceOp::new(OpKind::Jump, jump_args.clone()));
                BridgeInfo {
                    inputargs: jump_args,
                    outcome: BridgeOutcome::Inlined,
                }
            }
            Err(e) => {
                tracing::debug!(
                    target: "ember_jit::compile",
                    reason = ?e.reason,
                    "bridge does not match loop target, retracing"
                );
                let args: Vec<Value> =
                    jump.args.into_iter().map(|a| opt.force_value(a)).collect();
                opt.emit_op(TraceOp::new(OpKind::Jump, args.clone()));
                BridgeInfo {
                    inputargs: args,
                    outcome: BridgeOutcome::Retrace,
                }
            }
        };

        opt.stats.log_summary("bridge");
        let optimized = OptimizedTrace {
            trace: opt.out,
            resume: opt.guard_resume,
            consts: opt.resume_memo.consts,
            stats: opt.stats,
        };
        Ok((outcome, optimized))
    }

    /// Outer error: fatal compile failure (e.g. resume tag overflow). Inner error: the match is
    /// impossible, recoverable by retracing.
    fn try_attach(
        &self,
        end_values: &[Value],
        opt: &mut Optimizer<'_>,
        sampler: &dyn RuntimeSampler,
        registry: &TypeRegistry,
    ) -> Result<Result<Vec<Value>, VirtualStatesCantMatch>, CompileError> {
        let source = capture_state(end_values, opt, registry);
        let params = MatchParams {
            registry,
            force_mode: false,
        };
        let guards = match self
            .token
            .virtual_state
            .generate_guards(&source, end_values, sampler, &params, opt)
        {
            Ok(g) => g,
            Err(e) => return Ok(Err(e)),
        };
        for g in &guards {
            opt.emit_guard(g, g.args.clone())?;
        }

        let mut reduced = match self.token.virtual_state.make_inputargs(end_values, opt, true) {
            Ok(r) => r,
            Err(e) => return Ok(Err(e)),
        };

        // Replay the short preamble in bridge terms: its free inputs are the reduced label args.
        let mut rename: HashMap<BoxId, Value> = HashMap::new();
        for (&pre_v, &bridge_v) in self.token.reduced_args.iter().zip(reduced.iter()) {
            if let Value::Box(pb) = pre_v {
                rename.insert(pb, bridge_v);
            }
        }
        for op in &self.token.short_preamble {
            let args: Vec<Value> = op
                .args
                .iter()
                .map(|&a| match a {
                    Value::Const(_) => a,
                    Value::Box(pb) => *rename
                        .get(&pb)
                        .unwrap_or_else(|| panic!("BROKEN short preamble: unbound box {pb:?}")),
                })
                .collect();
            let mut replayed = op.clone();
            replayed.args = args;
            if let Some(pr) = op.result {
                let nb = opt.new_box(self.token.short_result_type(pr));
                rename.insert(pr, Value::Box(nb));
                replayed.result = Some(nb);
            }
            if replayed.opcode.is_guard() {
                opt.emit_guard(&replayed, replayed.args.clone())?;
            } else {
                opt.emit_op(replayed);
            }
        }

        for &pre_extra in &self.token.extra_args {
            reduced.push(*rename.get(&pre_extra).unwrap_or_else(|| {
                panic!("BROKEN short preamble: extra arg {pre_extra:?} never produced")
            }));
        }
        Ok(Ok(reduced))
    }
}
