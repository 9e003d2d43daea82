//! Virtual states: structural signatures of live values at a program point.
//!
//! A virtual state records *shape* only (virtualness, class knowledge, bounds), never runtime
//! values, so one state can be matched against arbitrarily many later traces. It is captured at
//! a loop label when the loop is compiled, retained on the target token, and consulted by every
//! bridge that wants to jump back into the loop: either the bridge's own state is compatible
//! (possibly after a synthesized guard sequence), or matching fails with
//! [`VirtualStatesCantMatch`] and the bridge is compiled as an independent target.

use std::collections::{HashMap, HashSet};

use ember_ir::{
    ArrayId, BoxId, ClassId, ConstVal, Descr, FieldId, ObjRef, OpKind, StructId, TraceOp,
    TypeRegistry, ValType, Value,
};

use crate::error::{CantMatchReason, VirtualStatesCantMatch};
use crate::opt::info::{Info, InfoView, PtrLevel};
use crate::opt::intbound::IntBound;

/// Index into a state's node arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Shape knowledge about one not-virtual slot.
#[derive(Clone, Debug, PartialEq)]
pub struct NotVirtualNode {
    pub ty: ValType,
    pub level: PtrLevel,
    pub class: Option<ClassId>,
    pub constant: Option<ConstVal>,
    pub intbound: IntBound,
    /// Known bound on the array/string length behind a reference slot.
    pub length: Option<IntBound>,
}

impl NotVirtualNode {
    fn unknown(ty: ValType) -> NotVirtualNode {
        NotVirtualNode {
            ty,
            level: PtrLevel::Unknown,
            class: None,
            constant: None,
            intbound: IntBound::unbounded(),
            length: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StateNode {
    NotVirtual(NotVirtualNode),
    VStruct {
        struct_id: StructId,
        class: ClassId,
        fields: Vec<FieldId>,
        children: Vec<NodeId>,
    },
    VArray {
        array_id: ArrayId,
        children: Vec<NodeId>,
    },
    VArrayStruct {
        array_id: ArrayId,
        elem_struct: StructId,
        fields: Vec<FieldId>,
        slots: Vec<Vec<NodeId>>,
    },
}

impl StateNode {
    pub fn is_virtual(&self) -> bool {
        !matches!(self, StateNode::NotVirtual(_))
    }
}

/// A complete structural signature: one root per live value, nodes deduplicated across shared
/// sub-objects, every node assigned one global position.
#[derive(Clone, Debug)]
pub struct VirtualState {
    nodes: Vec<StateNode>,
    roots: Vec<NodeId>,
    /// Global numbering in first-reach order; a node reachable via multiple paths keeps its
    /// first-assigned position.
    positions: Vec<u32>,
    num_not_virtuals: usize,
}

impl VirtualState {
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id.index()]
    }

    pub fn position(&self, id: NodeId) -> u32 {
        self.positions[id.index()]
    }

    pub fn num_not_virtuals(&self) -> usize {
        self.num_not_virtuals
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

// ---- Construction -----------------------------------------------------------------------------

/// Captures the virtual state of `values` under the current pass's knowledge.
///
/// Recursion is memoized by box identity, so DAG-shaped virtual graphs are visited once; a
/// placeholder is inserted before recursing into children, so objects that transitively contain
/// themselves terminate.
pub fn capture_state(
    values: &[Value],
    view: &dyn InfoView,
    registry: &TypeRegistry,
) -> VirtualState {
    let mut ctor = StateConstructor {
        view,
        registry,
        nodes: Vec::new(),
        memo: HashMap::new(),
    };
    let roots: Vec<NodeId> = values.iter().map(|&v| ctor.visit(v)).collect();

    let mut state = VirtualState {
        positions: vec![u32::MAX; ctor.nodes.len()],
        nodes: ctor.nodes,
        roots,
        num_not_virtuals: 0,
    };
    let mut next = 0u32;
    for i in 0..state.roots.len() {
        let root = state.roots[i];
        number_node(&mut state, root, &mut next);
    }
    state
}

fn number_node(state: &mut VirtualState, id: NodeId, next: &mut u32) {
    if state.positions[id.index()] != u32::MAX {
        return;
    }
    state.positions[id.index()] = *next;
    *next += 1;
    match state.nodes[id.index()].clone() {
        StateNode::NotVirtual(_) => state.num_not_virtuals += 1,
        StateNode::VStruct { children, .. } | StateNode::VArray { children, .. } => {
            for c in children {
                number_node(state, c, next);
            }
        }
        StateNode::VArrayStruct { slots, .. } => {
            for slot in slots {
                for c in slot {
                    number_node(state, c, next);
                }
            }
        }
    }
}

struct StateConstructor<'a> {
    view: &'a dyn InfoView,
    registry: &'a TypeRegistry,
    nodes: Vec<StateNode>,
    memo: HashMap<BoxId, NodeId>,
}

impl StateConstructor<'_> {
    fn add(&mut self, node: StateNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn visit(&mut self, v: Value) -> NodeId {
        let v = self.view.resolve(v);
        let b = match v {
            Value::Const(c) => {
                let mut node = NotVirtualNode::unknown(c.ty());
                node.constant = Some(c);
                match c {
                    ConstVal::Int(i) => node.intbound = IntBound::from_const(i),
                    ConstVal::Ref(_) => node.level = PtrLevel::Constant,
                    ConstVal::Float(_) => {}
                }
                return self.add(StateNode::NotVirtual(node));
            }
            Value::Box(b) => b,
        };

        if let Some(&id) = self.memo.get(&b) {
            return id;
        }

        match self.view.info_value(v).cloned() {
            Some(Info::VStruct(vs)) => {
                // Reserve the slot before recursing so cyclic virtuals terminate.
                let id = self.add(StateNode::NotVirtual(NotVirtualNode::unknown(ValType::Ref)));
                self.memo.insert(b, id);
                let fields = self.registry.struct_def(vs.struct_id).fields.clone();
                let children: Vec<NodeId> = fields
                    .iter()
                    .enumerate()
                    .map(|(i, &f)| {
                        let child = vs.fields[i].unwrap_or(Value::Const(ConstVal::default_of(
                            self.registry.field_ty(f),
                        )));
                        self.visit(child)
                    })
                    .collect();
                self.nodes[id.index()] = StateNode::VStruct {
                    struct_id: vs.struct_id,
                    class: vs.class,
                    fields,
                    children,
                };
                id
            }
            Some(Info::VArray(va)) => {
                let id = self.add(StateNode::NotVirtual(NotVirtualNode::unknown(ValType::Ref)));
                self.memo.insert(b, id);
                let default = ConstVal::default_of(
                    self.registry.elem_ty(va.array_id).unwrap_or(ValType::Int),
                );
                let children: Vec<NodeId> = va
                    .items
                    .iter()
                    .map(|item| self.visit(item.unwrap_or(Value::Const(default))))
                    .collect();
                self.nodes[id.index()] = StateNode::VArray {
                    array_id: va.array_id,
                    children,
                };
                id
            }
            Some(Info::VArrayStruct(vas)) => {
                let id = self.add(StateNode::NotVirtual(NotVirtualNode::unknown(ValType::Ref)));
                self.memo.insert(b, id);
                let fields = self.registry.struct_def(vas.elem_struct).fields.clone();
                let slots: Vec<Vec<NodeId>> = vas
                    .slots
                    .iter()
                    .map(|slot| {
                        fields
                            .iter()
                            .enumerate()
                            .map(|(i, &f)| {
                                let child = slot[i].unwrap_or(Value::Const(ConstVal::default_of(
                                    self.registry.field_ty(f),
                                )));
                                self.visit(child)
                            })
                            .collect()
                    })
                    .collect();
                self.nodes[id.index()] = StateNode::VArrayStruct {
                    array_id: vas.array_id,
                    elem_struct: vas.elem_struct,
                    fields,
                    slots,
                };
                id
            }
            Some(Info::Ptr(p)) => {
                let mut node = NotVirtualNode::unknown(ValType::Ref);
                node.level = p.level;
                node.class = p.class;
                node.constant = p.constant;
                node.length = p.length;
                let id = self.add(StateNode::NotVirtual(node));
                self.memo.insert(b, id);
                id
            }
            Some(Info::Int(bound)) => {
                let mut node = NotVirtualNode::unknown(ValType::Int);
                node.intbound = bound;
                node.constant = bound.constant().map(ConstVal::Int);
                let id = self.add(StateNode::NotVirtual(node));
                self.memo.insert(b, id);
                id
            }
            None => {
                let id = self.add(StateNode::NotVirtual(NotVirtualNode::unknown(
                    self.view.ty_of(v),
                )));
                self.memo.insert(b, id);
                id
            }
        }
    }
}

// ---- Matching ---------------------------------------------------------------------------------

/// Runtime observations available while synthesizing bridge guards: one concrete sample per root
/// position, plus class lookup through the object model.
pub trait RuntimeSampler {
    fn sample(&self, root: usize) -> Option<ConstVal>;
    fn class_of(&self, obj: ObjRef) -> Option<ClassId>;
}

/// Source of fresh boxes for synthesized comparison results.
pub trait BoxSource {
    fn fresh_box(&mut self, ty: ValType) -> BoxId;
}

/// Options for one `generate_guards` walk.
pub struct MatchParams<'a> {
    pub registry: &'a TypeRegistry,
    /// Permit matching a realized (non-virtual) runtime object against a virtual-shape target,
    /// checked by known class only.
    pub force_mode: bool,
}

struct MatchCtx<'a, 'b> {
    params: &'a MatchParams<'a>,
    target: &'a VirtualState,
    source: &'a VirtualState,
    /// `(target position) -> (source position)`; a target position must map consistently to one
    /// underlying value.
    renum: HashMap<u32, u32>,
    sampler: Option<&'a dyn RuntimeSampler>,
    emit: Option<(&'b mut Vec<TraceOp>, &'b mut dyn BoxSource)>,
}

impl VirtualState {
    /// `true` iff every concrete instantiation compatible with `other` is compatible with
    /// `self`: `self` is weaker or equal in its requirements. Free of side effects; no guards
    /// are ever emitted.
    pub fn generalization_of(&self, other: &VirtualState, registry: &TypeRegistry) -> bool {
        let params = MatchParams {
            registry,
            force_mode: false,
        };
        let mut ctx = MatchCtx {
            params: &params,
            target: self,
            source: other,
            renum: HashMap::new(),
            sampler: None,
            emit: None,
        };
        self.walk_roots(other, &[], &mut ctx).is_ok()
    }

    /// Synthesizes the minimal ordered guard sequence that adapts `other` (with the concrete
    /// `values` at its roots, and `sampler`'s runtime observations) to `self`'s shape.
    ///
    /// Fails with [`VirtualStatesCantMatch`] when no finite guard sequence can reconcile the
    /// two; a single node failure aborts the entire walk, so no partial guard list is
    /// observable.
    pub fn generate_guards(
        &self,
        other: &VirtualState,
        values: &[Value],
        sampler: &dyn RuntimeSampler,
        params: &MatchParams<'_>,
        boxes: &mut dyn BoxSource,
    ) -> Result<Vec<TraceOp>, VirtualStatesCantMatch> {
        let mut ops = Vec::new();
        let mut ctx = MatchCtx {
            params,
            target: self,
            source: other,
            renum: HashMap::new(),
            sampler: Some(sampler),
            emit: Some((&mut ops, boxes)),
        };
        self.walk_roots(other, values, &mut ctx)?;
        Ok(ops)
    }

    fn walk_roots(
        &self,
        other: &VirtualState,
        values: &[Value],
        ctx: &mut MatchCtx<'_, '_>,
    ) -> Result<(), VirtualStatesCantMatch> {
        if self.roots.len() != other.roots.len() {
            return Err(VirtualStatesCantMatch::new(CantMatchReason::LayoutMismatch));
        }
        for i in 0..self.roots.len() {
            let value = values.get(i).copied();
            let sample = ctx.sampler.and_then(|s| s.sample(i));
            match_nodes(self.roots[i], other.roots[i], value, sample, ctx)?;
        }
        Ok(())
    }
}

fn match_nodes(
    t_id: NodeId,
    s_id: NodeId,
    value: Option<Value>,
    sample: Option<ConstVal>,
    ctx: &mut MatchCtx<'_, '_>,
) -> Result<(), VirtualStatesCantMatch> {
    let t_pos = ctx.target.position(t_id);
    let s_pos = ctx.source.position(s_id);
    match ctx.renum.get(&t_pos) {
        Some(&prev) if prev != s_pos => {
            // One target position matched against two different source values: the state slots
            // do not share object identity the way the target requires.
            return Err(VirtualStatesCantMatch::at(
                CantMatchReason::InconsistentPosition,
                t_pos,
                s_pos,
            ));
        }
        Some(_) => return Ok(()),
        None => {
            ctx.renum.insert(t_pos, s_pos);
        }
    }

    let target = ctx.target.node(t_id).clone();
    let source = ctx.source.node(s_id).clone();
    match (&target, &source) {
        (StateNode::NotVirtual(t), StateNode::NotVirtual(s)) => {
            match_not_virtual(t, s, value, sample, ctx, t_pos, s_pos)
        }
        (StateNode::NotVirtual(t), _) => {
            // Virtual source: definitely a non-null reference of a known class; acceptable
            // wherever the target's requirements don't exceed that knowledge.
            match t.level {
                PtrLevel::Unknown | PtrLevel::NonNull => Ok(()),
                PtrLevel::KnownClass => {
                    let s_class = source_virtual_class(&source);
                    if t.class.is_some() && t.class == s_class {
                        Ok(())
                    } else {
                        Err(VirtualStatesCantMatch::at(
                            CantMatchReason::ClassMismatch,
                            t_pos,
                            s_pos,
                        ))
                    }
                }
                PtrLevel::Constant => Err(VirtualStatesCantMatch::at(
                    CantMatchReason::ConstantMismatch,
                    t_pos,
                    s_pos,
                )),
            }
        }
        (_, StateNode::NotVirtual(s)) => {
            // Virtual target vs. realized object: only permitted in force mode, and only via
            // known-class equality, since virtualness itself is not guard-checkable.
            if !ctx.params.force_mode {
                return Err(VirtualStatesCantMatch::at(
                    CantMatchReason::ShapeMismatch,
                    t_pos,
                    s_pos,
                ));
            }
            let t_class = source_virtual_class(&target);
            if s.level < PtrLevel::KnownClass || s.class.is_none() || s.class != t_class {
                return Err(VirtualStatesCantMatch::at(
                    CantMatchReason::ClassMismatch,
                    t_pos,
                    s_pos,
                ));
            }
            // Stricter than the class floor: when both sides declare a static length, they must
            // agree.
            if let (StateNode::VArray { children, .. }, Some(len)) = (&target, s.length.as_ref()) {
                if !len.contains(children.len() as i64) {
                    return Err(VirtualStatesCantMatch::at(
                        CantMatchReason::LayoutMismatch,
                        t_pos,
                        s_pos,
                    ));
                }
            }
            Ok(())
        }
        (
            StateNode::VStruct {
                struct_id: t_sid,
                class: t_class,
                fields: t_fields,
                children: t_children,
            },
            StateNode::VStruct {
                struct_id: s_sid,
                class: s_class,
                fields: s_fields,
                children: s_children,
            },
        ) => {
            if t_sid != s_sid || t_class != s_class || t_fields != s_fields {
                return Err(VirtualStatesCantMatch::at(
                    CantMatchReason::LayoutMismatch,
                    t_pos,
                    s_pos,
                ));
            }
            for (&tc, &sc) in t_children.iter().zip(s_children.iter()) {
                match_nodes(tc, sc, None, None, ctx)?;
            }
            Ok(())
        }
        (
            StateNode::VArray {
                array_id: t_aid,
                children: t_children,
            },
            StateNode::VArray {
                array_id: s_aid,
                children: s_children,
            },
        ) => {
            if t_aid != s_aid || t_children.len() != s_children.len() {
                return Err(VirtualStatesCantMatch::at(
                    CantMatchReason::LayoutMismatch,
                    t_pos,
                    s_pos,
                ));
            }
            for (&tc, &sc) in t_children.iter().zip(s_children.iter()) {
                match_nodes(tc, sc, None, None, ctx)?;
            }
            Ok(())
        }
        (
            StateNode::VArrayStruct {
                array_id: t_aid,
                elem_struct: t_es,
                fields: t_fields,
                slots: t_slots,
            },
            StateNode::VArrayStruct {
                array_id: s_aid,
                elem_struct: s_es,
                fields: s_fields,
                slots: s_slots,
            },
        ) => {
            if t_aid != s_aid || t_es != s_es || t_fields != s_fields || t_slots.len() != s_slots.len()
            {
                return Err(VirtualStatesCantMatch::at(
                    CantMatchReason::LayoutMismatch,
                    t_pos,
                    s_pos,
                ));
            }
            for (ts, ss) in t_slots.iter().zip(s_slots.iter()) {
                for (&tc, &sc) in ts.iter().zip(ss.iter()) {
                    match_nodes(tc, sc, None, None, ctx)?;
                }
            }
            Ok(())
        }
        // Two virtual nodes of different shape-kinds (e.g. struct vs. array) can never describe
        // the same object; a shape mismatch is an immediate hard fail with no guard possible.
        _ => Err(VirtualStatesCantMatch::at(
            CantMatchReason::ShapeMismatch,
            t_pos,
            s_pos,
        )),
    }
}

fn source_virtual_class(node: &StateNode) -> Option<ClassId> {
    match node {
        StateNode::VStruct { class, .. } => Some(*class),
        _ => None,
    }
}

fn match_not_virtual(
    t: &NotVirtualNode,
    s: &NotVirtualNode,
    value: Option<Value>,
    sample: Option<ConstVal>,
    ctx: &mut MatchCtx<'_, '_>,
    t_pos: u32,
    s_pos: u32,
) -> Result<(), VirtualStatesCantMatch> {
    if t.ty != s.ty {
        return Err(VirtualStatesCantMatch::at(
            CantMatchReason::ShapeMismatch,
            t_pos,
            s_pos,
        ));
    }
    match t.ty {
        ValType::Int => match_int(t, s, value, sample, ctx, t_pos, s_pos),
        ValType::Ref => match_ref(t, s, value, sample, ctx, t_pos, s_pos),
        ValType::Float => {
            let Some(c) = t.constant else { return Ok(()) };
            if s.constant == Some(c) {
                return Ok(());
            }
            if sample == Some(c) {
                return emit_guard_value(value, c, ctx, t_pos, s_pos);
            }
            Err(VirtualStatesCantMatch::at(
                CantMatchReason::ConstantMismatch,
                t_pos,
                s_pos,
            ))
        }
    }
}

fn match_int(
    t: &NotVirtualNode,
    s: &NotVirtualNode,
    value: Option<Value>,
    sample: Option<ConstVal>,
    ctx: &mut MatchCtx<'_, '_>,
    t_pos: u32,
    s_pos: u32,
) -> Result<(), VirtualStatesCantMatch> {
    // A constant target escalates straight to `GuardValue`.
    if let Some(expected) = t.intbound.constant() {
        if s.intbound.constant() == Some(expected) {
            return Ok(());
        }
        if sample == Some(ConstVal::Int(expected)) {
            return emit_guard_value(value, ConstVal::Int(expected), ctx, t_pos, s_pos);
        }
        return Err(VirtualStatesCantMatch::at(
            CantMatchReason::ConstantMismatch,
            t_pos,
            s_pos,
        ));
    }

    if t.intbound.contains_bound(&s.intbound) {
        return Ok(());
    }
    // The static bound does not prove it, but the runtime sample is in range: tighten with
    // explicit comparison guards.
    if let Some(ConstVal::Int(i)) = sample {
        if t.intbound.contains(i) {
            return emit_bound_guards(value, &t.intbound, ctx, t_pos, s_pos);
        }
    }
    Err(VirtualStatesCantMatch::at(
        CantMatchReason::BoundMismatch,
        t_pos,
        s_pos,
    ))
}

fn match_ref(
    t: &NotVirtualNode,
    s: &NotVirtualNode,
    value: Option<Value>,
    sample: Option<ConstVal>,
    ctx: &mut MatchCtx<'_, '_>,
    t_pos: u32,
    s_pos: u32,
) -> Result<(), VirtualStatesCantMatch> {
    match t.level {
        // Widening from knowing more to knowing less is always free.
        PtrLevel::Unknown => Ok(()),
        PtrLevel::NonNull => {
            if s.level >= PtrLevel::NonNull && !matches!(s.constant, Some(c) if c.is_null_ref()) {
                return Ok(());
            }
            if s.level == PtrLevel::Unknown {
                if let Some(ConstVal::Ref(r)) = sample {
                    if !r.is_null() {
                        return emit_guard(
                            OpKind::GuardNonnull,
                            value,
                            None,
                            ctx,
                            t_pos,
                            s_pos,
                        );
                    }
                }
            }
            Err(VirtualStatesCantMatch::at(
                CantMatchReason::GuardNeeded,
                t_pos,
                s_pos,
            ))
        }
        PtrLevel::KnownClass => {
            let expected = t.class.ok_or_else(|| {
                VirtualStatesCantMatch::at(CantMatchReason::ShapeMismatch, t_pos, s_pos)
            })?;
            match s.level {
                PtrLevel::KnownClass | PtrLevel::Constant => {
                    let s_class = s.class.or_else(|| {
                        s.constant
                            .and_then(ConstVal::as_ref)
                            .filter(|r| !r.is_null())
                            .and_then(|r| ctx.sampler.and_then(|smp| smp.class_of(r)))
                    });
                    // Mismatched classes are always a hard fail; guards never escalate across
                    // incompatible classes.
                    if s_class == Some(expected) {
                        Ok(())
                    } else {
                        Err(VirtualStatesCantMatch::at(
                            CantMatchReason::ClassMismatch,
                            t_pos,
                            s_pos,
                        ))
                    }
                }
                PtrLevel::NonNull => {
                    if sample_class_matches(sample, expected, ctx)? {
                        emit_guard(
                            OpKind::GuardClass,
                            value,
                            Some(Descr::Class(expected)),
                            ctx,
                            t_pos,
                            s_pos,
                        )
                    } else {
                        Err(VirtualStatesCantMatch::at(
                            CantMatchReason::ClassMismatch,
                            t_pos,
                            s_pos,
                        ))
                    }
                }
                PtrLevel::Unknown => {
                    if sample_class_matches(sample, expected, ctx)? {
                        emit_guard(
                            OpKind::GuardNonnullClass,
                            value,
                            Some(Descr::Class(expected)),
                            ctx,
                            t_pos,
                            s_pos,
                        )
                    } else {
                        Err(VirtualStatesCantMatch::at(
                            CantMatchReason::ClassMismatch,
                            t_pos,
                            s_pos,
                        ))
                    }
                }
            }
        }
        PtrLevel::Constant => {
            let expected = t.constant.ok_or_else(|| {
                VirtualStatesCantMatch::at(CantMatchReason::ShapeMismatch, t_pos, s_pos)
            })?;
            if s.level == PtrLevel::Constant && s.constant == Some(expected) {
                return Ok(());
            }
            if s.level == PtrLevel::Unknown && sample == Some(expected) {
                return emit_guard_value(value, expected, ctx, t_pos, s_pos);
            }
            Err(VirtualStatesCantMatch::at(
                CantMatchReason::ConstantMismatch,
                t_pos,
                s_pos,
            ))
        }
    }
}

fn sample_class_matches(
    sample: Option<ConstVal>,
    expected: ClassId,
    ctx: &MatchCtx<'_, '_>,
) -> Result<bool, VirtualStatesCantMatch> {
    let Some(sampler) = ctx.sampler else {
        return Ok(false);
    };
    match sample {
        Some(ConstVal::Ref(r)) if !r.is_null() => Ok(sampler.class_of(r) == Some(expected)),
        _ => Ok(false),
    }
}

fn emit_guard(
    opcode: OpKind,
    value: Option<Value>,
    descr: Option<Descr>,
    ctx: &mut MatchCtx<'_, '_>,
    t_pos: u32,
    s_pos: u32,
) -> Result<(), VirtualStatesCantMatch> {
    let (Some(value), Some((ops, _))) = (value, ctx.emit.as_mut()) else {
        return Err(VirtualStatesCantMatch::at(
            CantMatchReason::GuardNeeded,
            t_pos,
            s_pos,
        ));
    };
    let mut op = TraceOp::new(opcode, vec![value]);
    op.descr = descr;
    ops.push(op);
    Ok(())
}

fn emit_guard_value(
    value: Option<Value>,
    expected: ConstVal,
    ctx: &mut MatchCtx<'_, '_>,
    t_pos: u32,
    s_pos: u32,
) -> Result<(), VirtualStatesCantMatch> {
    let (Some(value), Some((ops, _))) = (value, ctx.emit.as_mut()) else {
        return Err(VirtualStatesCantMatch::at(
            CantMatchReason::GuardNeeded,
            t_pos,
            s_pos,
        ));
    };
    ops.push(TraceOp::new(
        OpKind::GuardValue,
        vec![value, Value::Const(expected)],
    ));
    Ok(())
}

fn emit_bound_guards(
    value: Option<Value>,
    bound: &IntBound,
    ctx: &mut MatchCtx<'_, '_>,
    t_pos: u32,
    s_pos: u32,
) -> Result<(), VirtualStatesCantMatch> {
    let (Some(value), Some((ops, boxes))) = (value, ctx.emit.as_mut()) else {
        return Err(VirtualStatesCantMatch::at(
            CantMatchReason::GuardNeeded,
            t_pos,
            s_pos,
        ));
    };
    if bound.has_lower {
        let res = boxes.fresh_box(ValType::Int);
        ops.push(
            TraceOp::new(
                OpKind::IntLe,
                vec![Value::int(bound.lower), value],
            )
            .with_result(res),
        );
        ops.push(TraceOp::new(OpKind::GuardTrue, vec![Value::Box(res)]));
    }
    if bound.has_upper {
        let res = boxes.fresh_box(ValType::Int);
        ops.push(
            TraceOp::new(
                OpKind::IntLe,
                vec![value, Value::int(bound.upper)],
            )
            .with_result(res),
        );
        ops.push(TraceOp::new(OpKind::GuardTrue, vec![Value::Box(res)]));
    }
    Ok(())
}

// ---- Input-argument extraction ----------------------------------------------------------------

/// Concrete-value operations `make_inputargs` needs from the running pass.
pub trait StateValues {
    fn resolve(&self, v: Value) -> Value;
    fn is_still_virtual(&self, v: Value) -> bool;
    /// Child values of a virtual, flattened in shape order (struct: field order; array: index
    /// order; array-of-structs: slot-major, field-minor). `None` if the value is not virtual.
    fn virtual_children_of(&self, v: Value) -> Option<Vec<Value>>;
    /// Materializes a still-virtual value, emitting allocation ops as a side effect.
    fn force(&mut self, v: Value) -> Value;
}

impl VirtualState {
    /// Reduces concrete `values` (one per root) to the jump-argument list: only not-virtual
    /// slots survive, in position order; virtual slots vanish, their contents reconstructed by
    /// the short preamble.
    ///
    /// With `force_boxes`, a slot that should be concrete but still holds a virtual is forced
    /// first; without it, that situation fails with [`VirtualStatesCantMatch`] so the caller can
    /// retry on the forcing path or give up.
    pub fn make_inputargs(
        &self,
        values: &[Value],
        forcer: &mut dyn StateValues,
        force_boxes: bool,
    ) -> Result<Vec<Value>, VirtualStatesCantMatch> {
        assert_eq!(
            values.len(),
            self.roots.len(),
            "make_inputargs: value count does not match state arity"
        );
        let mut out = Vec::with_capacity(self.num_not_virtuals);
        let mut seen: HashSet<u32> = HashSet::new();
        for (i, &root) in self.roots.iter().enumerate() {
            self.extract(root, values[i], forcer, force_boxes, &mut seen, &mut out)?;
        }
        assert_eq!(
            out.len(),
            self.num_not_virtuals,
            "make_inputargs: extracted arity disagrees with numbering"
        );
        Ok(out)
    }

    fn extract(
        &self,
        id: NodeId,
        value: Value,
        forcer: &mut dyn StateValues,
        force_boxes: bool,
        seen: &mut HashSet<u32>,
        out: &mut Vec<Value>,
    ) -> Result<(), VirtualStatesCantMatch> {
        let pos = self.position(id);
        if !seen.insert(pos) {
            return Ok(());
        }
        let value = forcer.resolve(value);
        match self.node(id) {
            StateNode::NotVirtual(_) => {
                let v = if forcer.is_still_virtual(value) {
                    if !force_boxes {
                        return Err(VirtualStatesCantMatch::new(CantMatchReason::StillVirtual));
                    }
                    forcer.force(value)
                } else {
                    value
                };
                out.push(v);
                Ok(())
            }
            StateNode::VStruct { children, .. } | StateNode::VArray { children, .. } => {
                let child_values = forcer
                    .virtual_children_of(value)
                    .ok_or_else(|| VirtualStatesCantMatch::new(CantMatchReason::ShapeMismatch))?;
                if child_values.len() != children.len() {
                    return Err(VirtualStatesCantMatch::new(CantMatchReason::LayoutMismatch));
                }
                for (&c, v) in children.iter().zip(child_values) {
                    self.extract(c, v, forcer, force_boxes, seen, out)?;
                }
                Ok(())
            }
            StateNode::VArrayStruct { slots, .. } => {
                let child_values = forcer
                    .virtual_children_of(value)
                    .ok_or_else(|| VirtualStatesCantMatch::new(CantMatchReason::ShapeMismatch))?;
                let flat: Vec<NodeId> = slots.iter().flatten().copied().collect();
                if child_values.len() != flat.len() {
                    return Err(VirtualStatesCantMatch::new(CantMatchReason::LayoutMismatch));
                }
                for (&c, v) in flat.iter().zip(child_values) {
                    self.extract(c, v, forcer, force_boxes, seen, out)?;
                }
                Ok(())
            }
        }
    }
}
