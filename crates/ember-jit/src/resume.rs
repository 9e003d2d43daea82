//! Resume data: the compact per-guard numbering and its guard-failure decoder.
//!
//! Every guard must be able to reconstruct, bit-exactly, all logical values the interpreter
//! would have had, including recursively-virtual objects that were never materialized. Live
//! values are assigned small signed tags; snapshot chains share structurally identical
//! numbering buffers; virtual objects are described by shape descriptors that the decoder
//! replays against the external object model.

use std::collections::HashMap;
use std::rc::Rc;

use ember_ir::{
    ArrayId, BoxId, ClassId, ConstVal, FieldId, ObjRef, SnapshotId, StructId, Trace,
    TypeRegistry, ValType, Value,
};

use crate::error::CompileError;
use crate::opt::heap::LazySetField;
use crate::opt::info::{Info, InfoView};

// ---- Tags -------------------------------------------------------------------------------------

/// Number of bits reserved for the kind selector.
pub const TAG_SHIFT: u32 = 2;
/// Signed payload width of a tag.
pub const PAYLOAD_BITS: u32 = 16 - TAG_SHIFT;
pub const MAX_PAYLOAD: i32 = (1 << (PAYLOAD_BITS - 1)) - 1;
pub const MIN_PAYLOAD: i32 = -(1 << (PAYLOAD_BITS - 1));

/// Constant-pool payloads are biased above the small inline-integer window, so a payload can
/// never be read as both a plausible pool index and a plausible inline integer.
pub const CONST_INDEX_BIAS: i32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// Payload indexes the guard's captured live-value array.
    Box = 0,
    /// Payload (minus [`CONST_INDEX_BIAS`]) indexes the shared constant pool.
    Const = 1,
    /// Payload is the integer value itself.
    Int = 2,
    /// Payload indexes the guard's virtual-info table.
    Virtual = 3,
}

/// A fixed-width signed tag: 2-bit kind selector in the low bits, signed payload above.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag(i16);

impl Tag {
    /// Encoding fails loudly rather than silently truncating: a payload that does not fit is a
    /// hard correctness boundary.
    pub fn new(payload: i32, kind: TagKind) -> Result<Tag, CompileError> {
        if !(MIN_PAYLOAD..=MAX_PAYLOAD).contains(&payload) {
            return Err(CompileError::TagOverflow {
                value: payload as i64,
                bits: PAYLOAD_BITS,
            });
        }
        Ok(Tag(((payload << TAG_SHIFT) | kind as i32) as i16))
    }

    pub fn kind(self) -> TagKind {
        match self.0 & 0b11 {
            0 => TagKind::Box,
            1 => TagKind::Const,
            2 => TagKind::Int,
            _ => TagKind::Virtual,
        }
    }

    /// Sign-preserving payload extraction.
    pub fn payload(self) -> i32 {
        (self.0 >> TAG_SHIFT) as i32
    }
}

// ---- Numbering --------------------------------------------------------------------------------

/// One frame's encoded numbering; `prev` points at the caller frame's buffer.
///
/// Buffers are interned per loop: structurally identical snapshots share the same `Rc`, which is
/// what keeps guard-dense loops cheap.
#[derive(Debug, PartialEq, Eq)]
pub struct Numbering {
    pub prev: Option<Rc<Numbering>>,
    pub pc: u32,
    pub tags: Vec<Tag>,
}

/// How to reallocate one virtual object at guard failure.
#[derive(Clone, Debug, PartialEq)]
pub enum VResumeInfo {
    Struct {
        struct_id: StructId,
        class: ClassId,
        fields: Vec<(FieldId, Tag)>,
    },
    Array {
        array_id: ArrayId,
        items: Vec<Tag>,
    },
    ArrayStruct {
        array_id: ArrayId,
        slots: Vec<Vec<(FieldId, Tag)>>,
    },
}

/// A field store that was delayed past this guard: applied by the decoder after all virtuals of
/// the snapshot exist, in original order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingField {
    pub target: Tag,
    pub field: FieldId,
    pub value: Tag,
}

/// Everything one guard needs for reconstruction.
#[derive(Clone, Debug)]
pub struct GuardResume {
    pub numbering: Rc<Numbering>,
    /// Boxes the backend must capture at this guard, in `Box`-payload order.
    pub liveboxes: Vec<BoxId>,
    pub virtuals: Vec<VResumeInfo>,
    pub pending: Vec<PendingField>,
}

/// Per-loop shared encoding state: the constant pool and the numbering intern table. Append-only;
/// retained for the lifetime of the compiled code.
#[derive(Debug, Default)]
pub struct ResumeMemo {
    pub consts: Vec<ConstVal>,
    const_index: HashMap<ConstVal, usize>,
    interned: HashMap<(usize, u32, Vec<Tag>), Rc<Numbering>>,
}

impl ResumeMemo {
    fn intern_const(&mut self, c: ConstVal) -> usize {
        if let Some(&i) = self.const_index.get(&c) {
            return i;
        }
        let i = self.consts.len();
        self.consts.push(c);
        self.const_index.insert(c, i);
        i
    }

    fn intern_numbering(
        &mut self,
        prev: Option<Rc<Numbering>>,
        pc: u32,
        tags: Vec<Tag>,
    ) -> Rc<Numbering> {
        let prev_key = prev.as_ref().map_or(0usize, |p| Rc::as_ptr(p) as usize);
        self.interned
            .entry((prev_key, pc, tags.clone()))
            .or_insert_with(|| Rc::new(Numbering { prev, pc, tags }))
            .clone()
    }
}

// ---- Encoding ---------------------------------------------------------------------------------

/// Per-guard encoder. Walks the guard's snapshot chain from the innermost frame outward,
/// assigning tags: plain boxes are deduplicated across frames, constants go through the shared
/// pool, and virtuals are registered depth-first with their slot reserved *before* the children
/// are visited, so reference cycles resolve to the already-assigned tag.
pub struct ResumeDataVirtualAdder<'a> {
    memo: &'a mut ResumeMemo,
    view: &'a dyn InfoView,
    registry: &'a TypeRegistry,
    liveboxes: Vec<BoxId>,
    box_tags: HashMap<BoxId, Tag>,
    virtuals: Vec<Option<VResumeInfo>>,
}

impl<'a> ResumeDataVirtualAdder<'a> {
    pub fn new(
        memo: &'a mut ResumeMemo,
        view: &'a dyn InfoView,
        registry: &'a TypeRegistry,
    ) -> ResumeDataVirtualAdder<'a> {
        ResumeDataVirtualAdder {
            memo,
            view,
            registry,
            liveboxes: Vec::new(),
            box_tags: HashMap::new(),
            virtuals: Vec::new(),
        }
    }

    pub fn encode(
        mut self,
        trace: &Trace,
        top: SnapshotId,
        pending: &[LazySetField],
    ) -> Result<GuardResume, CompileError> {
        let numbering = self.number_chain(trace, top)?;
        let pending = pending
            .iter()
            .map(|s| {
                Ok(PendingField {
                    target: self.tag_of(s.base)?,
                    field: s.field,
                    value: self.tag_of(s.value)?,
                })
            })
            .collect::<Result<Vec<_>, CompileError>>()?;
        let virtuals = self
            .virtuals
            .into_iter()
            .map(|v| v.expect("virtual info slot left unfilled"))
            .collect();
        Ok(GuardResume {
            numbering,
            liveboxes: self.liveboxes,
            virtuals,
            pending,
        })
    }

    fn number_chain(
        &mut self,
        trace: &Trace,
        id: SnapshotId,
    ) -> Result<Rc<Numbering>, CompileError> {
        let (pc, prev_id, live) = {
            let s = trace.snapshot(id);
            (s.pc, s.prev, s.live.clone())
        };
        // Innermost frame first: its live values take the lowest box indices.
        let tags = live
            .iter()
            .map(|&v| self.tag_of(v))
            .collect::<Result<Vec<_>, CompileError>>()?;
        let prev = match prev_id {
            Some(p) => Some(self.number_chain(trace, p)?),
            None => None,
        };
        Ok(self.memo.intern_numbering(prev, pc, tags))
    }

    fn tag_of(&mut self, v: Value) -> Result<Tag, CompileError> {
        match self.view.resolve(v) {
            Value::Const(c) => self.tag_of_const(c),
            Value::Box(b) => self.tag_of_box(b),
        }
    }

    fn tag_of_const(&mut self, c: ConstVal) -> Result<Tag, CompileError> {
        if let ConstVal::Int(i) = c {
            if i >= MIN_PAYLOAD as i64 && i <= MAX_PAYLOAD as i64 {
                return Tag::new(i as i32, TagKind::Int);
            }
        }
        let idx = self.memo.intern_const(c);
        let payload = i32::try_from(idx)
            .ok()
            .and_then(|i| i.checked_add(CONST_INDEX_BIAS))
            .ok_or(CompileError::TagOverflow {
                value: idx as i64,
                bits: PAYLOAD_BITS,
            })?;
        Tag::new(payload, TagKind::Const)
    }

    fn tag_of_box(&mut self, b: BoxId) -> Result<Tag, CompileError> {
        if let Some(&t) = self.box_tags.get(&b) {
            return Ok(t);
        }
        let info = self
            .view
            .info_value(Value::Box(b))
            .filter(|i| i.is_virtual())
            .cloned();
        let Some(info) = info else {
            let idx = self.liveboxes.len();
            let t = Tag::new(idx as i32, TagKind::Box)?;
            self.liveboxes.push(b);
            self.box_tags.insert(b, t);
            return Ok(t);
        };

        // Reserve the tag before visiting children: a child pointing back at its own parent
        // resolves to the reserved tag instead of recursing forever.
        let idx = self.virtuals.len();
        let t = Tag::new(idx as i32, TagKind::Virtual)?;
        self.virtuals.push(None);
        self.box_tags.insert(b, t);

        let vinfo = match info {
            Info::VStruct(vs) => {
                let field_ids = self.registry.struct_def(vs.struct_id).fields.clone();
                let mut fields = Vec::with_capacity(field_ids.len());
                for (i, &f) in field_ids.iter().enumerate() {
                    let val = vs.fields[i].unwrap_or(Value::Const(ConstVal::default_of(
                        self.registry.field_ty(f),
                    )));
                    fields.push((f, self.tag_of(val)?));
                }
                VResumeInfo::Struct {
                    struct_id: vs.struct_id,
                    class: vs.class,
                    fields,
                }
            }
            Info::VArray(va) => {
                let default = ConstVal::default_of(
                    self.registry.elem_ty(va.array_id).unwrap_or(ValType::Int),
                );
                let mut items = Vec::with_capacity(va.items.len());
                for slot in &va.items {
                    items.push(self.tag_of(slot.unwrap_or(Value::Const(default)))?);
                }
                VResumeInfo::Array {
                    array_id: va.array_id,
                    items,
                }
            }
            Info::VArrayStruct(vas) => {
                let field_ids = self.registry.struct_def(vas.elem_struct).fields.clone();
                let mut slots = Vec::with_capacity(vas.slots.len());
                for slot in &vas.slots {
                    let mut fields = Vec::with_capacity(field_ids.len());
                    for (i, &f) in field_ids.iter().enumerate() {
                        let val = slot[i].unwrap_or(Value::Const(ConstVal::default_of(
                            self.registry.field_ty(f),
                        )));
                        fields.push((f, self.tag_of(val)?));
                    }
                    slots.push(fields);
                }
                VResumeInfo::ArrayStruct {
                    array_id: vas.array_id,
                    slots,
                }
            }
            Info::Ptr(_) | Info::Int(_) => unreachable!("filtered to virtual infos"),
        };
        self.virtuals[idx] = Some(vinfo);
        Ok(t)
    }
}

// ---- Decoding ---------------------------------------------------------------------------------

/// Allocation and mutation primitives of the external object model, used to reallocate virtuals
/// during replay. `class_of` also serves bridge-time guard synthesis.
pub trait ObjectModel {
    fn alloc_struct(&mut self, s: StructId) -> ObjRef;
    fn alloc_array(&mut self, a: ArrayId, len: usize) -> ObjRef;
    fn alloc_array_struct(&mut self, a: ArrayId, len: usize) -> ObjRef;
    fn set_field(&mut self, obj: ObjRef, f: FieldId, v: ConstVal);
    fn set_array_item(&mut self, obj: ObjRef, a: ArrayId, index: usize, v: ConstVal);
    fn set_interior_field(&mut self, obj: ObjRef, a: ArrayId, index: usize, f: FieldId, v: ConstVal);
    fn class_of(&self, obj: ObjRef) -> Option<ClassId>;
}

/// One reconstructed frame, innermost first in [`reconstruct_frames`]' output.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeFrame {
    pub pc: u32,
    pub values: Vec<ConstVal>,
}

/// Per-guard-failure reader. The virtual instance cache is essential for aliasing: two tags that
/// pointed at the same virtual during encoding decode to the identical reallocated object.
pub struct ResumeReader<'a, M: ObjectModel> {
    data: &'a GuardResume,
    consts: &'a [ConstVal],
    /// Live-value array captured by the backend at the moment of failure, indexed by `Box`
    /// payloads.
    frame_values: &'a [ConstVal],
    model: &'a mut M,
    cache: Vec<Option<ObjRef>>,
}

impl<'a, M: ObjectModel> ResumeReader<'a, M> {
    pub fn new(
        data: &'a GuardResume,
        consts: &'a [ConstVal],
        frame_values: &'a [ConstVal],
        model: &'a mut M,
    ) -> ResumeReader<'a, M> {
        ResumeReader {
            cache: vec![None; data.virtuals.len()],
            data,
            consts,
            frame_values,
            model,
        }
    }

    /// Reconstructs one frame's logical values in declared order.
    pub fn consume_boxes(&mut self, numbering: &Numbering) -> Vec<ConstVal> {
        numbering.tags.iter().map(|&t| self.decode(t)).collect()
    }

    fn decode(&mut self, t: Tag) -> ConstVal {
        match t.kind() {
            TagKind::Int => ConstVal::Int(t.payload() as i64),
            TagKind::Const => {
                let idx = (t.payload() - CONST_INDEX_BIAS) as usize;
                *self
                    .consts
                    .get(idx)
                    .unwrap_or_else(|| panic!("BROKEN resume data: const index {idx} out of range"))
            }
            TagKind::Box => {
                let idx = t.payload() as usize;
                *self.frame_values.get(idx).unwrap_or_else(|| {
                    panic!("BROKEN resume data: live slot {idx} out of range")
                })
            }
            TagKind::Virtual => ConstVal::Ref(self.force_virtual(t.payload() as usize)),
        }
    }

    /// Reallocates virtual `idx`, reusing the instance if this replay already allocated it.
    fn force_virtual(&mut self, idx: usize) -> ObjRef {
        if let Some(obj) = self.cache.get(idx).copied().flatten() {
            return obj;
        }
        let info = self
            .data
            .virtuals
            .get(idx)
            .unwrap_or_else(|| panic!("BROKEN resume data: virtual index {idx} out of range"))
            .clone();
        match info {
            VResumeInfo::Struct {
                struct_id, fields, ..
            } => {
                let obj = self.model.alloc_struct(struct_id);
                // Cache before filling: cyclic structures must find the shell.
                self.cache[idx] = Some(obj);
                for (f, tag) in fields {
                    let v = self.decode(tag);
                    self.model.set_field(obj, f, v);
                }
                obj
            }
            VResumeInfo::Array { array_id, items } => {
                let obj = self.model.alloc_array(array_id, items.len());
                self.cache[idx] = Some(obj);
                for (i, tag) in items.into_iter().enumerate() {
                    let v = self.decode(tag);
                    self.model.set_array_item(obj, array_id, i, v);
                }
                obj
            }
            VResumeInfo::ArrayStruct { array_id, slots } => {
                let obj = self.model.alloc_array_struct(array_id, slots.len());
                self.cache[idx] = Some(obj);
                for (i, slot) in slots.into_iter().enumerate() {
                    for (f, tag) in slot {
                        let v = self.decode(tag);
                        self.model.set_interior_field(obj, array_id, i, f, v);
                    }
                }
                obj
            }
        }
    }

    /// Allocates every virtual of the snapshot, whether or not a frame referenced it yet.
    pub fn force_all_virtuals(&mut self) {
        for i in 0..self.data.virtuals.len() {
            self.force_virtual(i);
        }
    }

    /// Applies the delayed field stores, in their original relative order. Must run after the
    /// frames (or `force_all_virtuals`) so every referenced virtual exists.
    pub fn apply_pending_fields(&mut self) {
        for p in self.data.pending.clone() {
            let target = match self.decode(p.target) {
                ConstVal::Ref(r) => r,
                other => panic!("BROKEN resume data: pending field target is {other:?}"),
            };
            let value = self.decode(p.value);
            self.model.set_field(target, p.field, value);
        }
    }
}

/// Full reconstruction at a guard failure: all frames innermost-first, then pending stores.
pub fn reconstruct_frames<M: ObjectModel>(
    data: &GuardResume,
    consts: &[ConstVal],
    frame_values: &[ConstVal],
    model: &mut M,
) -> Vec<ResumeFrame> {
    let mut reader = ResumeReader::new(data, consts, frame_values, model);
    let mut frames = Vec::new();
    let mut cur: Option<&Numbering> = Some(data.numbering.as_ref());
    while let Some(n) = cur {
        frames.push(ResumeFrame {
            pc: n.pc,
            values: reader.consume_boxes(n),
        });
        cur = n.prev.as_deref();
    }
    reader.force_all_virtuals();
    reader.apply_pending_fields();
    frames
}
