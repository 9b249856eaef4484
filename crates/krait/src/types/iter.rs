//! Sequence iterators.
//!
//! An `Iter` walks an ordered sequence (list, tuple, string) by index.
//! Mappings iterate over a materialised tuple of their keys, built at
//! `GET_ITER` time. Advancing lives in the dispatcher, which has the
//! pool access needed to clone out elements.

use crate::{pool::PoolId, value::Value};

#[derive(Debug)]
pub(crate) struct Iter {
    /// The sequence being walked; owns one reference.
    pub of: Value,
    /// Next element index.
    pub index: usize,
}

impl Iter {
    pub fn new(of: Value) -> Self {
        Self { of, index: 0 }
    }

    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        self.of.push_ref(out);
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        std::mem::replace(&mut self.of, Value::None).push_ref(dec);
    }
}
