//! Alias-sensitive heap value caching: redundant load/store elimination.
//!
//! Reads are cached per `(descriptor, base)`; a second read of the same slot reuses the first's
//! result unless an aliasing write or a call that may write the descriptor intervened. Field
//! stores are additionally *delayed*: the newest store per field descriptor is held back so a
//! later store to the same slot makes the earlier one dead. Delayed stores survive guards (the
//! resume encoder registers them as pending fields) but must be flushed before anything that
//! could observe the heap: an aliasing read or write, a call whose effect summary mentions the
//! field, or the end of the trace.

use std::collections::HashMap;

use ember_ir::{ArrayId, EffectInfo, FieldId, Value};

/// A field store that has not been emitted yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LazySetField {
    pub field: FieldId,
    pub base: Value,
    pub value: Value,
}

#[derive(Debug, Default)]
struct FieldCache {
    /// Known current content per base. Entries for bases other than the one just written are
    /// dropped on a write, since distinct boxes may alias.
    cached: HashMap<Value, Value>,
    lazy: Option<LazySetField>,
}

#[derive(Debug, Default)]
struct ArrayCache {
    /// Known content per `(base, constant index)`.
    cached: HashMap<(Value, i64), Value>,
}

#[derive(Debug, Default)]
pub struct HeapCache {
    fields: HashMap<FieldId, FieldCache>,
    arrays: HashMap<ArrayId, ArrayCache>,
}

impl HeapCache {
    pub fn new() -> HeapCache {
        HeapCache::default()
    }

    /// Current known content of `base.field`, if any.
    pub fn read_field(&self, field: FieldId, base: Value) -> Option<Value> {
        let entry = self.fields.get(&field)?;
        if let Some(lazy) = entry.lazy {
            if lazy.base == base {
                return Some(lazy.value);
            }
        }
        entry.cached.get(&base).copied()
    }

    /// A read of `base.field` is about to be emitted. Returns a delayed store that must be
    /// emitted first (the read's base may alias the delayed store's).
    pub fn before_field_read(&mut self, field: FieldId, base: Value) -> Option<LazySetField> {
        let entry = self.fields.get_mut(&field)?;
        match entry.lazy {
            Some(lazy) if lazy.base != base => {
                entry.lazy = None;
                entry.cached.insert(lazy.base, lazy.value);
                Some(lazy)
            }
            _ => None,
        }
    }

    /// Record that `base.field` was read (or re-derived) as `value`.
    pub fn remember_field_read(&mut self, field: FieldId, base: Value, value: Value) {
        self.fields
            .entry(field)
            .or_default()
            .cached
            .insert(base, value);
    }

    /// Whether a delayed store to exactly this slot is outstanding (the next write makes it
    /// dead).
    pub fn has_lazy(&self, field: FieldId, base: Value) -> bool {
        self.fields
            .get(&field)
            .and_then(|e| e.lazy)
            .is_some_and(|l| l.base == base)
    }

    /// Record a store. The store is *not* emitted; it becomes the field's delayed store.
    /// Returns a previously delayed store to a different base, which must be emitted first to
    /// preserve ordering of possibly-aliasing writes.
    pub fn write_field(&mut self, field: FieldId, base: Value, value: Value) -> Option<LazySetField> {
        let entry = self.fields.entry(field).or_default();

        let flushed = match entry.lazy {
            // Same slot: the previous delayed store is dead, drop it silently.
            Some(lazy) if lazy.base == base => None,
            Some(lazy) => Some(lazy),
            None => None,
        };
        if let Some(f) = flushed {
            entry.cached.insert(f.base, f.value);
        }

        // Any other base may alias this one.
        entry.cached.retain(|&b, _| b == base);
        entry.cached.insert(base, value);
        entry.lazy = Some(LazySetField { field, base, value });
        flushed
    }

    pub fn read_array_item(&self, array: ArrayId, base: Value, index: i64) -> Option<Value> {
        self.arrays
            .get(&array)?
            .cached
            .get(&(base, index))
            .copied()
    }

    pub fn remember_array_read(&mut self, array: ArrayId, base: Value, index: i64, value: Value) {
        self.arrays
            .entry(array)
            .or_default()
            .cached
            .insert((base, index), value);
    }

    /// A store to `base[index]` happened (it is emitted by the caller; array stores are not
    /// delayed). Constant-index stores keep the written slot; everything else in the descriptor
    /// is invalidated.
    pub fn write_array_item(&mut self, array: ArrayId, base: Value, index: Option<i64>, value: Value) {
        let entry = self.arrays.entry(array).or_default();
        match index {
            Some(i) => {
                // A slot with a different constant index cannot be the written one, whatever the
                // base aliases to. Same index through another base may be the same object.
                entry.cached.retain(|&(b, idx), _| idx != i || b == base);
                entry.cached.insert((base, i), value);
            }
            None => entry.cached.clear(),
        }
    }

    /// Delayed stores that must be emitted before a call with this effect summary, in
    /// registration order. Caches for written descriptors are invalidated.
    pub fn before_call(&mut self, effect: &EffectInfo) -> Vec<LazySetField> {
        let mut flush = Vec::new();
        for (field, entry) in self.fields.iter_mut() {
            let touched = effect.read_fields.contains(field) || effect.write_fields.contains(field);
            if touched {
                if let Some(lazy) = entry.lazy.take() {
                    flush.push(lazy);
                }
            }
            if effect.write_fields.contains(field) {
                entry.cached.clear();
            }
        }
        for array in &effect.write_arrays {
            if let Some(entry) = self.arrays.get_mut(array) {
                entry.cached.clear();
            }
        }
        flush.sort_by_key(|l| l.field.0);
        flush
    }

    /// Flush everything: delayed stores are returned for emission and all caches are dropped.
    /// Used before calls with unknown effects and at trace boundaries.
    pub fn flush_all(&mut self) -> Vec<LazySetField> {
        let mut flush: Vec<LazySetField> = self
            .fields
            .values_mut()
            .filter_map(|entry| entry.lazy.take())
            .collect();
        flush.sort_by_key(|l| l.field.0);
        self.fields.clear();
        self.arrays.clear();
        flush
    }

    /// The delayed stores currently outstanding, for resume pending-field registration.
    /// Registration order is the field-descriptor order, matching `before_call`/`flush_all`.
    pub fn outstanding_lazy_stores(&self) -> Vec<LazySetField> {
        let mut out: Vec<LazySetField> = self
            .fields
            .values()
            .filter_map(|entry| entry.lazy)
            .collect();
        out.sort_by_key(|l| l.field.0);
        out
    }
}
