//! Transient per-pass value information and the forwarding table.
//!
//! During one optimization pass every box may be *forwarded* to exactly one of: another value
//! (rename/alias chain, collapsed eagerly on lookup) or an [`Info`] record (terminal, never
//! itself forwarded). The whole table belongs to the pass and is dropped with it; nothing here
//! survives into the emitted trace except through [`TargetToken`](crate::compile::TargetToken)
//! conversion into a virtual state.

use ember_ir::{ArrayId, ClassId, ConstVal, StructId, ValType, Value};

use super::intbound::IntBound;

/// Index into the pass-local info arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InfoId(pub u32);

impl InfoId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Forwarding state of one box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Forwarded {
    #[default]
    None,
    /// The box is a pure rename of another value.
    Alias(Value),
    /// The box carries analysis facts.
    Info(InfoId),
}

/// How much is known about a reference that really lives on the heap.
///
/// The ladder is strictly ordered: each level implies everything below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PtrLevel {
    Unknown,
    NonNull,
    KnownClass,
    Constant,
}

/// Facts about a non-virtual reference.
#[derive(Clone, Debug, PartialEq)]
pub struct PtrInfo {
    pub level: PtrLevel,
    pub class: Option<ClassId>,
    pub constant: Option<ConstVal>,
    /// Known bound on the array/string length behind this reference, if any.
    pub length: Option<IntBound>,
}

impl Default for PtrInfo {
    fn default() -> PtrInfo {
        PtrInfo {
            level: PtrLevel::Unknown,
            class: None,
            constant: None,
            length: None,
        }
    }
}

impl PtrInfo {
    pub fn nonnull() -> PtrInfo {
        PtrInfo {
            level: PtrLevel::NonNull,
            ..PtrInfo::default()
        }
    }

    pub fn with_class(class: ClassId) -> PtrInfo {
        PtrInfo {
            level: PtrLevel::KnownClass,
            class: Some(class),
            constant: None,
            length: None,
        }
    }

    pub fn is_nonnull(&self) -> bool {
        self.level >= PtrLevel::NonNull
    }

    /// Raises the level, keeping the stronger of the two class facts. Levels only go up;
    /// widening back down never happens inside one pass.
    pub fn escalate(&mut self, level: PtrLevel, class: Option<ClassId>) {
        if level > self.level {
            self.level = level;
        }
        if self.class.is_none() {
            self.class = class;
        }
    }
}

/// A virtual struct: an allocation proven not to escape, tracked symbolically.
#[derive(Clone, Debug, PartialEq)]
pub struct VStructInfo {
    pub struct_id: StructId,
    pub class: ClassId,
    /// Child values indexed by field position within the struct layout. `None` means the field
    /// still holds its allocation default.
    pub fields: Vec<Option<Value>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VArrayInfo {
    pub array_id: ArrayId,
    /// One slot per element; length is fixed at allocation.
    pub items: Vec<Option<Value>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VArrayStructInfo {
    pub array_id: ArrayId,
    pub elem_struct: StructId,
    /// `slots[i][f]` is field `f` of element `i`.
    pub slots: Vec<Vec<Option<Value>>>,
}

/// Terminal per-value analysis record.
#[derive(Clone, Debug, PartialEq)]
pub enum Info {
    Ptr(PtrInfo),
    Int(IntBound),
    VStruct(VStructInfo),
    VArray(VArrayInfo),
    VArrayStruct(VArrayStructInfo),
}

impl Info {
    pub fn is_virtual(&self) -> bool {
        matches!(self, Info::VStruct(_) | Info::VArray(_) | Info::VArrayStruct(_))
    }

    pub fn as_ptr(&self) -> Option<&PtrInfo> {
        match self {
            Info::Ptr(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&IntBound> {
        match self {
            Info::Int(b) => Some(b),
            _ => None,
        }
    }

    /// Class tag of the value, virtual or not.
    pub fn known_class(&self) -> Option<ClassId> {
        match self {
            Info::Ptr(p) => p.class.filter(|_| p.level >= PtrLevel::KnownClass),
            Info::VStruct(v) => Some(v.class),
            _ => None,
        }
    }
}

/// Read-only view over one pass's forwarding table and info arena.
///
/// Virtual-state capture and resume encoding run against this view while the pass is still
/// alive; nothing behind it survives the pass.
pub trait InfoView {
    /// Collapses the alias chain of `v`.
    fn resolve(&self, v: Value) -> Value;
    /// Info attached to the (resolved) value, if any.
    fn info_value(&self, v: Value) -> Option<&Info>;
    fn ty_of(&self, v: Value) -> ValType;
}
