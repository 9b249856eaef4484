//! Script modules: named containers of globals.

use ahash::AHashMap;

use crate::{pool::PoolId, value::Value};

#[derive(Debug)]
pub(crate) struct Module {
    pub name: String,
    pub globals: AHashMap<String, Value>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            globals: AHashMap::new(),
        }
    }

    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        for v in self.globals.values() {
            v.push_ref(out);
        }
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        for (_, v) in self.globals.drain() {
            v.push_ref(dec);
        }
    }
}
