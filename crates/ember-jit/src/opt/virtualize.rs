//! Materialization of virtual objects.
//!
//! A virtual escapes when it is stored into the real heap, passed to a residual call, or needed
//! as a concrete jump argument. Forcing is one-way: the box is redirected to the allocation's
//! result *before* children are visited, so cyclic virtual graphs terminate and end up pointing
//! at the materialized object.

use ember_ir::{Descr, OpKind, TraceOp, Value};

use super::info::{Info, PtrInfo, VArrayInfo, VArrayStructInfo, VStructInfo};
use super::optimizer::Optimizer;
use crate::vstate::StateValues;

impl Optimizer<'_> {
    /// Returns a non-virtual stand-in for `v`, emitting allocation and initialization ops if the
    /// value was still virtual.
    pub fn force_value(&mut self, v: Value) -> Value {
        let v = self.get_value(v);
        let Value::Box(b) = v else { return v };
        let Some(info) = self.info_of(v).filter(|i| i.is_virtual()).cloned() else {
            return v;
        };
        self.stats.virtuals_forced += 1;

        match info {
            Info::VStruct(VStructInfo {
                struct_id,
                class,
                fields,
            }) => {
                let nb = self.new_box(ember_ir::ValType::Ref);
                // Redirect before visiting children: a field reaching back here must see the
                // materialized object, not recurse forever.
                self.make_alias(b, Value::Box(nb));
                self.set_info(nb, Info::Ptr(PtrInfo::with_class(class)));
                self.emit_op(
                    TraceOp::new(OpKind::New, Vec::new())
                        .with_descr(Descr::Struct(struct_id))
                        .with_result(nb),
                );
                let field_ids = self.registry.struct_def(struct_id).fields.clone();
                for (i, slot) in fields.into_iter().enumerate() {
                    if let Some(val) = slot {
                        let val = self.force_value(val);
                        self.emit_op(
                            TraceOp::new(OpKind::SetField, vec![Value::Box(nb), val])
                                .with_descr(Descr::Field(field_ids[i])),
                        );
                    }
                }
                Value::Box(nb)
            }
            Info::VArray(VArrayInfo { array_id, items }) => {
                let nb = self.new_box(ember_ir::ValType::Ref);
                self.make_alias(b, Value::Box(nb));
                self.set_info(nb, Info::Ptr(PtrInfo::nonnull()));
                self.emit_op(
                    TraceOp::new(OpKind::NewArray, vec![Value::int(items.len() as i64)])
                        .with_descr(Descr::Array(array_id))
                        .with_result(nb),
                );
                for (i, slot) in items.into_iter().enumerate() {
                    if let Some(val) = slot {
                        let val = self.force_value(val);
                        self.emit_op(
                            TraceOp::new(
                                OpKind::SetArrayItem,
                                vec![Value::Box(nb), Value::int(i as i64), val],
                            )
                            .with_descr(Descr::Array(array_id)),
                        );
                    }
                }
                Value::Box(nb)
            }
            Info::VArrayStruct(VArrayStructInfo {
                array_id,
                elem_struct,
                slots,
            }) => {
                let nb = self.new_box(ember_ir::ValType::Ref);
                self.make_alias(b, Value::Box(nb));
                self.set_info(nb, Info::Ptr(PtrInfo::nonnull()));
                self.emit_op(
                    TraceOp::new(OpKind::NewArrayStruct, vec![Value::int(slots.len() as i64)])
                        .with_descr(Descr::Array(array_id))
                        .with_result(nb),
                );
                let field_ids = self.registry.struct_def(elem_struct).fields.clone();
                for (i, slot) in slots.into_iter().enumerate() {
                    for (fi, fslot) in slot.into_iter().enumerate() {
                        if let Some(val) = fslot {
                            let val = self.force_value(val);
                            self.emit_op(
                                TraceOp::new(
                                    OpKind::SetInteriorField,
                                    vec![Value::Box(nb), Value::int(i as i64), val],
                                )
                                .with_descr(Descr::Interior(array_id, field_ids[fi])),
                            );
                        }
                    }
                }
                Value::Box(nb)
            }
            Info::Ptr(_) | Info::Int(_) => unreachable!("filtered to virtual infos"),
        }
    }
}

impl StateValues for Optimizer<'_> {
    fn resolve(&self, v: Value) -> Value {
        self.get_value(v)
    }

    fn is_still_virtual(&self, v: Value) -> bool {
        self.is_virtual(v)
    }

    fn virtual_children_of(&self, v: Value) -> Option<Vec<Value>> {
        let info = self.info_of(v)?;
        match info {
            Info::VStruct(vs) => Some(
                vs.fields
                    .iter()
                    .enumerate()
                    .map(|(i, slot)| {
                        slot.unwrap_or_else(|| {
                            let f = self.registry.struct_def(vs.struct_id).fields[i];
                            Value::Const(ember_ir::ConstVal::default_of(self.registry.field_ty(f)))
                        })
                    })
                    .collect(),
            ),
            Info::VArray(va) => {
                let default = ember_ir::ConstVal::default_of(
                    self.registry
                        .elem_ty(va.array_id)
                        .unwrap_or(ember_ir::ValType::Int),
                );
                Some(
                    va.items
                        .iter()
                        .map(|slot| slot.unwrap_or(Value::Const(default)))
                        .collect(),
                )
            }
            Info::VArrayStruct(vas) => {
                let field_ids = &self.registry.struct_def(vas.elem_struct).fields;
                Some(
                    vas.slots
                        .iter()
                        .flat_map(|slot| {
                            slot.iter().enumerate().map(|(i, s)| {
                                s.unwrap_or_else(|| {
                                    Value::Const(ember_ir::ConstVal::default_of(
                                        self.registry.field_ty(field_ids[i]),
                                    ))
                                })
                            })
                        })
                        .collect(),
                )
            }
            Info::Ptr(_) | Info::Int(_) => None,
        }
    }

    fn force(&mut self, v: Value) -> Value {
        self.force_value(v)
    }
}
