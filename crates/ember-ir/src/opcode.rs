//! The closed opcode enumeration.
//!
//! Opcodes are drawn from a versioned, closed set shared with the trace recorder. Classification
//! predicates live here so the optimizer dispatches on capability (`is_guard`, `is_always_pure`)
//! rather than matching opcode lists all over the tree.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    // Integer arithmetic. Plain variants wrap; `*Ovf` variants must be followed by a
    // `GuardNoOverflow` in a recorded trace.
    IntAdd,
    IntSub,
    IntMul,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    IntAddOvf,
    IntSubOvf,
    IntMulOvf,

    // Comparisons produce an int box that is 0 or 1.
    IntLt,
    IntLe,
    IntGt,
    IntGe,
    IntEq,
    IntNe,
    IntIsZero,
    IntIsTrue,
    PtrEq,
    PtrNe,

    /// Identity: result is the single argument. Used for short-preamble redirects.
    SameAs,

    // Heap allocation.
    New,
    NewArray,
    NewArrayStruct,
    NewStr,

    // Heap access.
    GetField,
    SetField,
    GetArrayItem,
    SetArrayItem,
    ArrayLen,
    GetInteriorField,
    SetInteriorField,
    StrLen,
    StrGetItem,
    StrSetItem,

    // Calls carry a `CallId` descriptor with an effect summary.
    Call,
    CallPure,
    CallLoopInvariant,

    // Guards: conditional bail-out to the recorded snapshot.
    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardClass,
    GuardNonnull,
    GuardNonnullClass,
    GuardNoOverflow,

    // Control. The only control flow a trace has is the LABEL/JUMP back-edge.
    Label,
    Jump,
    Finish,
}

impl OpKind {
    pub fn is_guard(self) -> bool {
        matches!(
            self,
            OpKind::GuardTrue
                | OpKind::GuardFalse
                | OpKind::GuardValue
                | OpKind::GuardClass
                | OpKind::GuardNonnull
                | OpKind::GuardNonnullClass
                | OpKind::GuardNoOverflow
        )
    }

    /// Pure given identical arguments, independent of heap state.
    ///
    /// `ArrayLen`/`StrLen` qualify because lengths are fixed at allocation. Heap reads do not:
    /// their redundancy is decided by the alias-sensitive heap cache instead.
    pub fn is_always_pure(self) -> bool {
        matches!(
            self,
            OpKind::IntAdd
                | OpKind::IntSub
                | OpKind::IntMul
                | OpKind::IntAnd
                | OpKind::IntOr
                | OpKind::IntXor
                | OpKind::IntLshift
                | OpKind::IntRshift
                | OpKind::IntLt
                | OpKind::IntLe
                | OpKind::IntGt
                | OpKind::IntGe
                | OpKind::IntEq
                | OpKind::IntNe
                | OpKind::IntIsZero
                | OpKind::IntIsTrue
                | OpKind::PtrEq
                | OpKind::PtrNe
                | OpKind::SameAs
                | OpKind::ArrayLen
                | OpKind::StrLen
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            OpKind::IntLt
                | OpKind::IntLe
                | OpKind::IntGt
                | OpKind::IntGe
                | OpKind::IntEq
                | OpKind::IntNe
                | OpKind::IntIsZero
                | OpKind::IntIsTrue
                | OpKind::PtrEq
                | OpKind::PtrNe
        )
    }

    pub fn can_overflow(self) -> bool {
        matches!(self, OpKind::IntAddOvf | OpKind::IntSubOvf | OpKind::IntMulOvf)
    }

    /// The wrapping twin of an overflow-checked opcode.
    pub fn ovf_to_plain(self) -> Option<OpKind> {
        match self {
            OpKind::IntAddOvf => Some(OpKind::IntAdd),
            OpKind::IntSubOvf => Some(OpKind::IntSub),
            OpKind::IntMulOvf => Some(OpKind::IntMul),
            _ => None,
        }
    }

    pub fn is_call(self) -> bool {
        matches!(self, OpKind::Call | OpKind::CallPure | OpKind::CallLoopInvariant)
    }

    pub fn is_allocation(self) -> bool {
        matches!(
            self,
            OpKind::New | OpKind::NewArray | OpKind::NewArrayStruct | OpKind::NewStr
        )
    }

    pub fn is_heap_read(self) -> bool {
        matches!(
            self,
            OpKind::GetField | OpKind::GetArrayItem | OpKind::GetInteriorField | OpKind::StrGetItem
        )
    }

    pub fn is_heap_write(self) -> bool {
        matches!(
            self,
            OpKind::SetField | OpKind::SetArrayItem | OpKind::SetInteriorField | OpKind::StrSetItem
        )
    }

    /// Whether the op mutates state observable outside the trace. `Call` is conservatively a
    /// side effect; its descriptor's effect summary refines that at the use site.
    pub fn has_side_effect(self) -> bool {
        self.is_heap_write() || matches!(self, OpKind::Call)
    }

    pub fn has_result(self) -> bool {
        !(self.is_guard()
            || self.is_heap_write()
            || matches!(self, OpKind::Label | OpKind::Jump | OpKind::Finish))
    }

    pub fn is_terminator(self) -> bool {
        matches!(self, OpKind::Jump | OpKind::Finish)
    }
}
