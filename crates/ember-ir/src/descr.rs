//! Descriptors: the symbolic view of the host object model.
//!
//! Structs, fields, arrays and call targets are registered once in a [`TypeRegistry`] and referred
//! to everywhere else by index. The optimizer never sees real object layout; a descriptor is just
//! enough shape information to model field access symbolically and to reallocate objects during
//! resume decoding.

use bitflags::bitflags;

use crate::value::ValType;

/// Runtime class tag of a heap object. Checked by `GuardClass`/`GuardNonnullClass`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StructId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArrayId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId(pub u32);

#[derive(Clone, Debug)]
pub struct StructDef {
    pub name: String,
    pub class: ClassId,
    pub fields: Vec<FieldId>,
}

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub owner: StructId,
    /// Position of the field within its owner's layout.
    pub index: u32,
    pub ty: ValType,
}

/// Element kind of an array descriptor. `Struct` elements make the array an array-of-structs,
/// accessed through `GetInteriorField`/`SetInteriorField`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayElem {
    Int,
    Ref,
    Float,
    Struct(StructId),
}

#[derive(Clone, Debug)]
pub struct ArrayDef {
    pub name: String,
    pub elem: ArrayElem,
}

bitflags! {
    /// Effect summary flags of a call descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EffectFlags: u8 {
        const CAN_RAISE = 1 << 0;
        const CAN_FORCE_VIRTUALS = 1 << 1;
        /// The call is elidable (pure for identical arguments); it reads no mutable state.
        const ELIDABLE = 1 << 2;
    }
}

/// Tag for recognized library idioms, so the optimizer can special-case them without knowing the
/// callee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialCall {
    None,
    StrConcat,
    StrSlice,
    StrEquals,
}

/// What a call may read and write, as declared by the front end.
///
/// An empty write set means heap caches survive the call unchanged.
#[derive(Clone, Debug)]
pub struct EffectInfo {
    pub read_fields: Vec<FieldId>,
    pub write_fields: Vec<FieldId>,
    pub read_arrays: Vec<ArrayId>,
    pub write_arrays: Vec<ArrayId>,
    pub flags: EffectFlags,
    pub special: SpecialCall,
}

impl EffectInfo {
    /// An effect summary that touches nothing.
    pub fn none() -> EffectInfo {
        EffectInfo {
            read_fields: Vec::new(),
            write_fields: Vec::new(),
            read_arrays: Vec::new(),
            write_arrays: Vec::new(),
            flags: EffectFlags::empty(),
            special: SpecialCall::None,
        }
    }

    pub fn writes_nothing(&self) -> bool {
        self.write_fields.is_empty() && self.write_arrays.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct CallDef {
    pub name: String,
    pub result: Option<ValType>,
    pub effect: EffectInfo,
}

/// Registry of every descriptor a trace may reference.
///
/// Append-only; ids are stable for the lifetime of the registry.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    structs: Vec<StructDef>,
    fields: Vec<FieldDef>,
    arrays: Vec<ArrayDef>,
    calls: Vec<CallDef>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    /// Defines a struct type. The class tag is derived from the struct index, so class identity
    /// and struct identity coincide.
    pub fn define_struct(&mut self, name: &str) -> StructId {
        let id = StructId(self.structs.len() as u32);
        self.structs.push(StructDef {
            name: name.to_owned(),
            class: ClassId(id.0),
            fields: Vec::new(),
        });
        id
    }

    pub fn add_field(&mut self, owner: StructId, name: &str, ty: ValType) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        let index = self.structs[owner.0 as usize].fields.len() as u32;
        self.fields.push(FieldDef {
            name: name.to_owned(),
            owner,
            index,
            ty,
        });
        self.structs[owner.0 as usize].fields.push(id);
        id
    }

    pub fn define_array(&mut self, name: &str, elem: ArrayElem) -> ArrayId {
        let id = ArrayId(self.arrays.len() as u32);
        self.arrays.push(ArrayDef {
            name: name.to_owned(),
            elem,
        });
        id
    }

    pub fn define_call(&mut self, name: &str, result: Option<ValType>, effect: EffectInfo) -> CallId {
        let id = CallId(self.calls.len() as u32);
        self.calls.push(CallDef {
            name: name.to_owned(),
            result,
            effect,
        });
        id
    }

    pub fn struct_def(&self, id: StructId) -> &StructDef {
        &self.structs[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn array(&self, id: ArrayId) -> &ArrayDef {
        &self.arrays[id.0 as usize]
    }

    pub fn call(&self, id: CallId) -> &CallDef {
        &self.calls[id.0 as usize]
    }

    pub fn class_of_struct(&self, id: StructId) -> ClassId {
        self.structs[id.0 as usize].class
    }

    pub fn struct_of_class(&self, class: ClassId) -> Option<StructId> {
        ((class.0 as usize) < self.structs.len()).then_some(StructId(class.0))
    }

    /// Index of a field within its owner's layout (`get_index()` of the opaque descriptor
    /// interface).
    pub fn field_index(&self, id: FieldId) -> u32 {
        self.field(id).index
    }

    pub fn field_ty(&self, id: FieldId) -> ValType {
        self.field(id).ty
    }

    pub fn elem_ty(&self, id: ArrayId) -> Option<ValType> {
        match self.array(id).elem {
            ArrayElem::Int => Some(ValType::Int),
            ArrayElem::Ref => Some(ValType::Ref),
            ArrayElem::Float => Some(ValType::Float),
            ArrayElem::Struct(_) => None,
        }
    }

    pub fn is_array_of_pointers(&self, id: ArrayId) -> bool {
        matches!(self.array(id).elem, ArrayElem::Ref)
    }

    pub fn is_array_of_floats(&self, id: ArrayId) -> bool {
        matches!(self.array(id).elem, ArrayElem::Float)
    }

    pub fn is_array_of_structs(&self, id: ArrayId) -> bool {
        matches!(self.array(id).elem, ArrayElem::Struct(_))
    }

    /// Whether a call descriptor is elidable (`is_always_pure()` of the opaque descriptor
    /// interface).
    pub fn call_is_always_pure(&self, id: CallId) -> bool {
        self.call(id).effect.flags.contains(EffectFlags::ELIDABLE)
    }
}
