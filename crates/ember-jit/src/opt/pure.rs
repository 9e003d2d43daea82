//! Caches for operations whose result depends only on their arguments.

use std::collections::HashMap;

use ember_ir::{Descr, OpKind, Value};

/// Key of a pure computation: opcode + resolved arguments + descriptor.
pub type PureKey = (OpKind, Vec<Value>, Option<Descr>);

/// CSE table for always-pure ops and elidable calls.
#[derive(Debug, Default)]
pub struct PureCache {
    map: HashMap<PureKey, Value>,
}

impl PureCache {
    pub fn lookup(&self, key: &PureKey) -> Option<Value> {
        self.map.get(key).copied()
    }

    pub fn remember(&mut self, key: PureKey, result: Value) {
        self.map.insert(key, result);
    }
}

/// Results of loop-invariant calls, keyed by the call's first (constant) argument.
///
/// One entry per callee: a loop-invariant call promises the same result for the whole loop
/// execution, so the arguments past the key do not participate.
#[derive(Debug, Default)]
pub struct LoopInvariantCache {
    map: HashMap<Value, Value>,
}

impl LoopInvariantCache {
    pub fn lookup(&self, key: Value) -> Option<Value> {
        self.map.get(&key).copied()
    }

    pub fn remember(&mut self, key: Value, result: Value) {
        self.map.insert(key, result);
    }
}
