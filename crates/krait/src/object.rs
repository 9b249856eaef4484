//! Host-facing values.
//!
//! Hosts never see the internal `Value` type: arguments and results
//! cross the boundary as owned [`Object`]s, with [`Handle`]s standing in
//! for values that have no owned mapping (instances, generators,
//! functions). A handle stays rooted in the VM until dropped.

use crate::{
    exception::RunResult,
    pool::PoolData,
    types::{Dict, HKey, List, Str, Tuple, UStr},
    value::Value,
    vm::{Handle, Vm},
};

/// A script value that can be passed to or returned from the VM. Owns
/// all its data.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A text string (maps to the byte-string type).
    Str(String),
    /// A byte string that is not valid UTF-8.
    Bytes(Vec<u8>),
    /// A wide string that is not valid UTF-16.
    WideBytes(Vec<u16>),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    /// Mapping as key/value pairs.
    Dict(Vec<(Object, Object)>),
    /// A rooted reference to a value with no owned mapping.
    Handle(Handle),
}

impl From<i64> for Object {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Object {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Object {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Object {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Object {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Object {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Converts a host object into an owned script value.
pub(crate) fn to_value(vm: &mut Vm, obj: Object) -> RunResult<Value> {
    Ok(match obj {
        Object::None => Value::None,
        Object::Bool(b) => Value::Bool(b),
        Object::Int(i) => Value::Int(i),
        Object::Float(f) => Value::Float(f),
        Object::Str(s) => vm.alloc(PoolData::Str(Str::from_str(&s))),
        Object::Bytes(b) => vm.alloc(PoolData::Str(Str::from_bytes(b))),
        Object::WideBytes(u) => vm.alloc(PoolData::UStr(UStr::from_units(u))),
        Object::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(to_value(vm, item)?);
            }
            vm.alloc(PoolData::List(List::new(values)))
        }
        Object::Tuple(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(to_value(vm, item)?);
            }
            vm.alloc(PoolData::Tuple(Tuple::new(values)))
        }
        Object::Dict(pairs) => {
            let mut dict = Dict::with_capacity(pairs.len());
            for (k, v) in pairs {
                let key = to_value(vm, k)?;
                let value = to_value(vm, v)?;
                let hkey = match HKey::project(&key, &vm.pool) {
                    Ok(h) => h,
                    Err(e) => {
                        key.release(&mut vm.pool);
                        value.release(&mut vm.pool);
                        // the partially-built dict is dropped with its refs
                        let mut dec = Vec::new();
                        dict.clear_refs(&mut dec);
                        for id in dec {
                            vm.pool.dec_ref(id);
                        }
                        return Err(e);
                    }
                };
                if let Some((old_k, old_v)) = dict.insert(hkey, key, value) {
                    old_k.release(&mut vm.pool);
                    old_v.release(&mut vm.pool);
                }
            }
            vm.alloc(PoolData::Dict(dict))
        }
        Object::Handle(h) => vm.handle_value(h)?,
    })
}

/// Converts an owned script value to a host object, consuming the
/// value. Values with no owned mapping move into the handle table and
/// set `made_handle`.
pub(crate) fn from_value(vm: &mut Vm, v: Value, made_handle: &mut bool) -> Object {
    match &v {
        Value::None => Object::None,
        Value::Bool(b) => Object::Bool(*b),
        Value::Int(i) => Object::Int(*i),
        Value::Float(f) => Object::Float(*f),
        Value::Builtin(_) => {
            *made_handle = true;
            Object::Handle(vm.make_handle(v))
        }
        Value::Ref(id) => {
            let id = *id;
            enum Plan {
                Str(Vec<u8>),
                Wide(Vec<u16>),
                Seq(Vec<Value>, bool),
                Pairs(Vec<(Value, Value)>),
                NamedPairs(Vec<(String, Value)>),
                Root,
            }
            let plan = match vm.pool.get(id) {
                PoolData::Str(s) => Plan::Str(s.bytes().to_vec()),
                PoolData::UStr(u) => Plan::Wide(u.chars().to_vec()),
                PoolData::List(l) => {
                    Plan::Seq(l.items.iter().map(Value::shallow).collect(), true)
                }
                PoolData::Tuple(t) => {
                    Plan::Seq(t.items.iter().map(Value::shallow).collect(), false)
                }
                PoolData::Dict(d) => Plan::Pairs(
                    d.iter_entries()
                        .map(|(k, v)| (k.shallow(), v.shallow()))
                        .collect(),
                ),
                PoolData::StrDict(d) => Plan::NamedPairs(
                    d.map.iter().map(|(k, v)| (k.clone(), v.shallow())).collect(),
                ),
                _ => Plan::Root,
            };
            match plan {
                Plan::Str(bytes) => {
                    v.release(&mut vm.pool);
                    match String::from_utf8(bytes) {
                        Ok(text) => Object::Str(text),
                        Err(e) => Object::Bytes(e.into_bytes()),
                    }
                }
                Plan::Wide(units) => {
                    v.release(&mut vm.pool);
                    match String::from_utf16(&units) {
                        Ok(text) => Object::Str(text),
                        Err(_) => Object::WideBytes(units),
                    }
                }
                Plan::Seq(items, is_list) => {
                    let converted = items
                        .into_iter()
                        .map(|item| {
                            if let Value::Ref(iid) = item {
                                vm.pool.inc_ref(iid);
                            }
                            from_value(vm, item, made_handle)
                        })
                        .collect();
                    v.release(&mut vm.pool);
                    if is_list {
                        Object::List(converted)
                    } else {
                        Object::Tuple(converted)
                    }
                }
                Plan::Pairs(pairs) => {
                    let converted = pairs
                        .into_iter()
                        .map(|(k, val)| {
                            if let Value::Ref(kid) = k {
                                vm.pool.inc_ref(kid);
                            }
                            if let Value::Ref(vid) = val {
                                vm.pool.inc_ref(vid);
                            }
                            (
                                from_value(vm, k, made_handle),
                                from_value(vm, val, made_handle),
                            )
                        })
                        .collect();
                    v.release(&mut vm.pool);
                    Object::Dict(converted)
                }
                Plan::NamedPairs(pairs) => {
                    let converted = pairs
                        .into_iter()
                        .map(|(k, val)| {
                            if let Value::Ref(vid) = val {
                                vm.pool.inc_ref(vid);
                            }
                            (Object::Str(k), from_value(vm, val, made_handle))
                        })
                        .collect();
                    v.release(&mut vm.pool);
                    Object::Dict(converted)
                }
                Plan::Root => {
                    *made_handle = true;
                    Object::Handle(vm.make_handle(v))
                }
            }
        }
    }
}
