//! Script callables: functions, bound methods, classes and instances.

use ahash::AHashMap;

use crate::{
    pool::PoolId,
    value::Value,
};

/// A function defined by script code via `MAKE_FUNCTION`/`MAKE_CLOSURE`.
#[derive(Debug)]
pub(crate) struct Function {
    /// The code object to execute.
    pub code: PoolId,
    /// Module the function was defined in, for global lookups.
    pub module: PoolId,
    /// Default values for trailing formals, in declaration order.
    pub defaults: Vec<Value>,
    /// Captured cells for the code's free variables.
    pub cells: Vec<PoolId>,
}

impl Function {
    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        out.push(self.code);
        out.push(self.module);
        for d in &self.defaults {
            d.push_ref(out);
        }
        out.extend_from_slice(&self.cells);
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        for d in self.defaults.drain(..) {
            d.push_ref(dec);
        }
        dec.append(&mut self.cells);
    }
}

/// A method: a callable paired with a receiver.
///
/// A `None` receiver marks an unbound method (as stored in a class dict
/// for native methods); binding produces a copy with the instance filled
/// in. Bound methods on instances create the classic reference cycle the
/// state-clearer exists to break.
#[derive(Debug)]
pub(crate) struct Method {
    pub func: Value,
    pub receiver: Value,
}

impl Method {
    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        self.func.push_ref(out);
        self.receiver.push_ref(out);
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        std::mem::replace(&mut self.func, Value::None).push_ref(dec);
        std::mem::replace(&mut self.receiver, Value::None).push_ref(dec);
    }
}

/// A class: name, at most one base, and a dict of methods/attributes.
///
/// Classes wrapping a native type additionally carry the registered
/// native constructor.
#[derive(Debug)]
pub(crate) struct Class {
    pub name: String,
    pub base: Option<PoolId>,
    /// StrDict of methods and class attributes. `None` once cleared.
    pub dict: Option<PoolId>,
    /// CCtor pool object for host-registered classes.
    pub native_ctor: Option<PoolId>,
    /// True for classes created through the native bridge; their
    /// instances carry a native payload.
    pub is_native: bool,
}

impl Class {
    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        if let Some(base) = self.base {
            out.push(base);
        }
        if let Some(dict) = self.dict {
            out.push(dict);
        }
        if let Some(ctor) = self.native_ctor {
            out.push(ctor);
        }
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        if let Some(base) = self.base.take() {
            dec.push(base);
        }
        if let Some(dict) = self.dict.take() {
            dec.push(dict);
        }
        if let Some(ctor) = self.native_ctor.take() {
            dec.push(ctor);
        }
    }
}

/// An instance of a script class.
#[derive(Debug)]
pub(crate) struct Instance {
    pub class: PoolId,
    pub dict: AHashMap<String, Value>,
    /// CInst payload when the class wraps a native type.
    pub native: Option<PoolId>,
}

impl Instance {
    pub fn new(class: PoolId) -> Self {
        Self {
            class,
            dict: AHashMap::new(),
            native: None,
        }
    }

    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        out.push(self.class);
        for v in self.dict.values() {
            v.push_ref(out);
        }
        if let Some(native) = self.native {
            out.push(native);
        }
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        for (_, v) in self.dict.drain() {
            v.push_ref(dec);
        }
        if let Some(native) = self.native.take() {
            dec.push(native);
        }
    }
}

/// Transient binder of a primitive receiver to a named method, produced
/// by `LOAD_ATTR` on strings, lists, dicts and generators.
#[derive(Debug)]
pub(crate) struct PrimitiveAdapter {
    pub obj: Value,
    pub name: String,
}
