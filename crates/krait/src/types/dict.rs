//! Mapping types: the general dict and the string-keyed dict.
//!
//! The general [`Dict`] accepts any hashable value as a key and resolves
//! hash collisions by equality probing: a `HashTable<usize>` maps key
//! hashes to indices in a dense entry vector, and candidates with the
//! same hash are compared by projected key. Keys are projected into
//! [`HKey`] once, at the boundary, so probing never needs pool access
//! and numeric equivalence (`1`, `1.0`, `True`) falls out of the
//! projection.
//!
//! [`StrDict`] is the string-keyed structure used for globals, class
//! dicts, instance dicts and keyword arguments. It is insertion-unordered.

use ahash::AHashMap;
use hashbrown::HashTable;

use crate::{
    exception::{ExcKind, RunResult},
    pool::{Pool, PoolData, PoolId},
    py_hash,
    value::Value,
};

/// Hashable projection of a key value.
///
/// Numeric keys normalise: bools and integral floats become `Int`, so all
/// numerically-equal keys share one projection. Non-integral floats keep
/// their bit pattern, which preserves the hash/eq contract because two
/// such floats are equal exactly when their bits are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum HKey {
    None,
    Int(i64),
    FloatBits(u64),
    Str(Vec<u8>),
    UStr(Vec<u16>),
    Builtin(i64),
    Tuple(Vec<HKey>),
}

impl HKey {
    /// Projects a value into its hashable form, or TypeError for
    /// unhashable variants (lists, dicts, instances, ...).
    pub fn project(v: &Value, pool: &Pool) -> RunResult<Self> {
        match v {
            Value::None => Ok(Self::None),
            Value::Bool(b) => Ok(Self::Int(i64::from(*b))),
            Value::Int(i) => Ok(Self::Int(*i)),
            Value::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Ok(Self::Int(*f as i64))
                } else {
                    Ok(Self::FloatBits(f.to_bits()))
                }
            }
            Value::Builtin(b) => Ok(Self::Builtin(b.ordinal())),
            Value::Ref(id) => match pool.get(*id) {
                PoolData::Str(s) => Ok(Self::Str(s.bytes().to_vec())),
                PoolData::UStr(u) => Ok(Self::UStr(u.chars().to_vec())),
                PoolData::Tuple(t) => {
                    let mut keys = Vec::with_capacity(t.items.len());
                    for item in &t.items {
                        keys.push(Self::project(item, pool)?);
                    }
                    Ok(Self::Tuple(keys))
                }
                other => Err(ExcKind::TypeError
                    .err(format!("unhashable type: '{}'", other.variant_name()))),
            },
        }
    }

    /// CPython-compatible hash of the projection.
    #[must_use]
    pub fn hash(&self) -> u64 {
        match self {
            Self::None => 0x2b6e_9d3f,
            Self::Int(i) => py_hash::hash_int(*i),
            Self::FloatBits(bits) => py_hash::hash_float(f64::from_bits(*bits)),
            Self::Str(bytes) => py_hash::hash_bytes(bytes),
            Self::UStr(units) => py_hash::hash_wide(units),
            Self::Builtin(ord) => py_hash::hash_int(*ord),
            Self::Tuple(keys) => py_hash::hash_tuple(keys.iter().map(Self::hash)),
        }
    }
}

#[derive(Debug)]
pub(crate) struct DictEntry {
    hkey: HKey,
    hash: u64,
    pub key: Value,
    pub value: Value,
}

/// General mapping keyed by any hashable value, with full collision
/// handling.
#[derive(Debug, Default)]
pub(crate) struct Dict {
    /// Maps entry hashes to indices into `entries`.
    indices: HashTable<usize>,
    /// Dense entry storage. Removal swaps the last entry in, so iteration
    /// order is not insertion order (Python 2 dicts are unordered).
    entries: Vec<DictEntry>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            indices: HashTable::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn find_index(&self, hkey: &HKey, hash: u64) -> Option<usize> {
        self.indices
            .find(hash, |&i| self.entries[i].hkey == *hkey)
            .copied()
    }

    /// Looks up a value by projected key.
    pub fn get(&self, hkey: &HKey) -> Option<&Value> {
        let hash = hkey.hash();
        self.find_index(hkey, hash).map(|i| &self.entries[i].value)
    }

    pub fn contains(&self, hkey: &HKey) -> bool {
        let hash = hkey.hash();
        self.find_index(hkey, hash).is_some()
    }

    /// Inserts a key/value pair, taking ownership of both. Returns the
    /// replaced pair when the key was already present so the caller can
    /// release it.
    pub fn insert(&mut self, hkey: HKey, key: Value, value: Value) -> Option<(Value, Value)> {
        let hash = hkey.hash();
        if let Some(i) = self.find_index(&hkey, hash) {
            let entry = &mut self.entries[i];
            let old_key = std::mem::replace(&mut entry.key, key);
            let old_value = std::mem::replace(&mut entry.value, value);
            return Some((old_key, old_value));
        }
        let index = self.entries.len();
        self.entries.push(DictEntry {
            hkey,
            hash,
            key,
            value,
        });
        self.indices
            .insert_unique(hash, index, |&i| self.entries[i].hash);
        None
    }

    /// Removes an entry, returning the owned key/value pair.
    pub fn remove(&mut self, hkey: &HKey) -> Option<(Value, Value)> {
        let hash = hkey.hash();
        let index = self.find_index(hkey, hash)?;
        match self.indices.find_entry(hash, |&i| i == index) {
            Ok(occupied) => {
                let _ = occupied.remove();
            }
            Err(_) => unreachable!("index table out of sync with entries"),
        }
        let entry = self.entries.swap_remove(index);
        // The former last entry moved into `index`; repoint its slot.
        if index < self.entries.len() {
            let moved_hash = self.entries[index].hash;
            let last = self.entries.len();
            if let Some(slot) = self.indices.find_mut(moved_hash, |&i| i == last) {
                *slot = index;
            }
        }
        Some((entry.key, entry.value))
    }

    pub fn iter_entries(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|e| (&e.key, &e.value))
    }

    /// Equality against another dict: same size and every entry present
    /// with an equal value.
    pub fn entries_eq(&self, other: &Self, pool: &Pool, _depth: usize) -> bool {
        self.len() == other.len()
            && self.entries.iter().all(|e| {
                other
                    .find_index(&e.hkey, e.hash)
                    .is_some_and(|i| e.value.py_eq(&other.entries[i].value, pool))
            })
    }

    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        for entry in &self.entries {
            entry.key.push_ref(out);
            entry.value.push_ref(out);
        }
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        self.indices.clear();
        for entry in self.entries.drain(..) {
            entry.key.push_ref(dec);
            entry.value.push_ref(dec);
        }
    }
}

/// String-keyed dict: globals, class dicts, instance dicts, kwargs.
#[derive(Debug, Default)]
pub(crate) struct StrDict {
    pub map: AHashMap<String, Value>,
}

impl StrDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        for value in self.map.values() {
            value.push_ref(out);
        }
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        for (_, value) in self.map.drain() {
            value.push_ref(dec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_keys_collapse() {
        let pool = Pool::new();
        let k_int = HKey::project(&Value::Int(1), &pool).unwrap();
        let k_float = HKey::project(&Value::Float(1.0), &pool).unwrap();
        let k_bool = HKey::project(&Value::Bool(true), &pool).unwrap();
        assert_eq!(k_int, k_float);
        assert_eq!(k_int, k_bool);
        assert_eq!(k_int.hash(), k_float.hash());
    }

    #[test]
    fn insert_get_remove_with_collisions() {
        let mut dict = Dict::new();
        // Many keys; any hash collisions must be resolved by probing.
        for i in 0..512 {
            let hkey = HKey::Int(i);
            assert!(dict.insert(hkey, Value::Int(i), Value::Int(i * 2)).is_none());
        }
        assert_eq!(dict.len(), 512);
        for i in 0..512 {
            match dict.get(&HKey::Int(i)) {
                Some(Value::Int(v)) => assert_eq!(*v, i * 2),
                other => panic!("missing key {i}: {other:?}"),
            }
        }
        for i in (0..512).step_by(2) {
            assert!(dict.remove(&HKey::Int(i)).is_some());
        }
        assert_eq!(dict.len(), 256);
        assert!(dict.get(&HKey::Int(0)).is_none());
        assert!(dict.get(&HKey::Int(1)).is_some());
    }

    #[test]
    fn replacing_returns_old_pair() {
        let mut dict = Dict::new();
        let hkey = HKey::Str(b"k".to_vec());
        assert!(dict.insert(hkey.clone(), Value::Int(0), Value::Int(1)).is_none());
        let old = dict.insert(hkey, Value::Int(0), Value::Int(2));
        assert!(matches!(old, Some((Value::Int(0), Value::Int(1)))));
        assert!(matches!(dict.get(&HKey::Str(b"k".to_vec())), Some(Value::Int(2))));
    }

    #[test]
    fn unhashable_key_is_type_error() {
        let mut pool = Pool::new();
        let list = pool.add(PoolData::List(crate::types::List::new(Vec::new())));
        let err = HKey::project(&Value::Ref(list), &pool).unwrap_err();
        let crate::exception::ExcPayload::Simple(exc) = err.payload else {
            panic!("expected simple exception");
        };
        assert_eq!(exc.kind, ExcKind::TypeError);
        pool.dec_ref(list);
    }
}

/// Dispatches a method call on a Dict or StrDict receiver.
pub(crate) fn call_method(
    vm: &mut crate::vm::Vm,
    id: PoolId,
    name: &str,
    args: crate::vm::CallArgs,
) -> RunResult<Value> {
    match name {
        "get" => {
            let (key, default) = if args.pos_len() == 2 {
                let (k, d) = args.expect_two(name, &mut vm.pool)?;
                (k, Some(d))
            } else {
                (args.expect_one(name, &mut vm.pool)?, None)
            };
            let found = dict_lookup(vm, id, &key)?;
            key.release(&mut vm.pool);
            match found {
                Some(v) => {
                    if let Some(d) = default {
                        d.release(&mut vm.pool);
                    }
                    Ok(v)
                }
                None => Ok(default.unwrap_or(Value::None)),
            }
        }
        "has_key" => {
            let key = args.expect_one(name, &mut vm.pool)?;
            let found = dict_lookup(vm, id, &key)?;
            key.release(&mut vm.pool);
            match found {
                Some(v) => {
                    v.release(&mut vm.pool);
                    Ok(Value::Bool(true))
                }
                None => Ok(Value::Bool(false)),
            }
        }
        "keys" | "values" | "items" => {
            args.expect_zero(name, &mut vm.pool)?;
            dict_views(vm, id, name)
        }
        "pop" => {
            let (key, default) = if args.pos_len() == 2 {
                let (k, d) = args.expect_two(name, &mut vm.pool)?;
                (k, Some(d))
            } else {
                (args.expect_one(name, &mut vm.pool)?, None)
            };
            let removed = dict_take(vm, id, &key);
            let repr = key.py_repr(&vm.pool);
            key.release(&mut vm.pool);
            match removed? {
                Some(v) => {
                    if let Some(d) = default {
                        d.release(&mut vm.pool);
                    }
                    Ok(v)
                }
                None => default.ok_or_else(|| ExcKind::KeyError.err(repr)),
            }
        }
        "setdefault" => {
            let (key, default) = if args.pos_len() == 2 {
                let (k, d) = args.expect_two(name, &mut vm.pool)?;
                (k, d)
            } else {
                (args.expect_one(name, &mut vm.pool)?, Value::None)
            };
            let found = dict_lookup(vm, id, &key)?;
            match found {
                Some(v) => {
                    key.release(&mut vm.pool);
                    default.release(&mut vm.pool);
                    Ok(v)
                }
                None => {
                    let result = default.clone_with(&mut vm.pool);
                    crate::vm::collections::subscr_set(vm, &Value::Ref(id), &key, default)?;
                    key.release(&mut vm.pool);
                    Ok(result)
                }
            }
        }
        "update" => {
            let other = args.expect_one(name, &mut vm.pool)?;
            let pairs: Vec<(Value, Value)> = match &other {
                Value::Ref(oid) => match vm.pool.get(*oid) {
                    PoolData::Dict(d) => d
                        .iter_entries()
                        .map(|(k, v)| (k.shallow(), v.shallow()))
                        .collect(),
                    PoolData::StrDict(d) => {
                        let names: Vec<(String, Value)> = d
                            .map
                            .iter()
                            .map(|(k, v)| (k.clone(), v.shallow()))
                            .collect();
                        let mut pairs = Vec::with_capacity(names.len());
                        for (k, v) in names {
                            pairs.push((vm.alloc_str(&k), v));
                        }
                        pairs
                    }
                    _ => {
                        other.release(&mut vm.pool);
                        return Err(ExcKind::TypeError.err("update() expected a dict"));
                    }
                },
                _ => {
                    other.release(&mut vm.pool);
                    return Err(ExcKind::TypeError.err("update() expected a dict"));
                }
            };
            for (k, v) in pairs {
                if let Value::Ref(vid) = v {
                    vm.pool.inc_ref(vid);
                }
                let result = crate::vm::collections::subscr_set(vm, &Value::Ref(id), &k, v);
                k.release(&mut vm.pool);
                result?;
            }
            other.release(&mut vm.pool);
            Ok(Value::None)
        }
        "clear" => {
            args.expect_zero(name, &mut vm.pool)?;
            let mut dec = Vec::new();
            match vm.pool.get_mut(id) {
                PoolData::Dict(d) => d.clear_refs(&mut dec),
                PoolData::StrDict(d) => d.clear_refs(&mut dec),
                _ => unreachable!("adapter checked the receiver"),
            }
            for cid in dec {
                vm.pool.dec_ref(cid);
            }
            Ok(Value::None)
        }
        _ => {
            args.release(&mut vm.pool);
            Err(ExcKind::AttributeError
                .err(format!("'dict' object has no attribute '{name}'")))
        }
    }
}

/// Cloned lookup in either dict flavour.
fn dict_lookup(vm: &mut crate::vm::Vm, id: PoolId, key: &Value) -> RunResult<Option<Value>> {
    let found = match vm.pool.get(id) {
        PoolData::Dict(d) => {
            let hkey = HKey::project(key, &vm.pool)?;
            d.get(&hkey).map(Value::shallow)
        }
        PoolData::StrDict(d) => match key {
            Value::Ref(kid) => match vm.pool.get(*kid) {
                PoolData::Str(s) => d.map.get(s.text()?).map(Value::shallow),
                _ => None,
            },
            _ => None,
        },
        _ => unreachable!("adapter checked the receiver"),
    };
    Ok(found.map(|v| {
        if let Value::Ref(vid) = v {
            vm.pool.inc_ref(vid);
        }
        v
    }))
}

/// Removes a key from either dict flavour, returning the owned value.
fn dict_take(vm: &mut crate::vm::Vm, id: PoolId, key: &Value) -> RunResult<Option<Value>> {
    match vm.pool.get(id) {
        PoolData::Dict(_) => {
            let hkey = HKey::project(key, &vm.pool)?;
            let removed = match vm.pool.get_mut(id) {
                PoolData::Dict(d) => d.remove(&hkey),
                _ => unreachable!("variant checked"),
            };
            Ok(removed.map(|(k, v)| {
                k.release(&mut vm.pool);
                v
            }))
        }
        PoolData::StrDict(_) => {
            let name = match key {
                Value::Ref(kid) => match vm.pool.get(*kid) {
                    PoolData::Str(s) => Some(s.text()?.to_owned()),
                    _ => None,
                },
                _ => None,
            };
            let Some(name) = name else {
                return Ok(None);
            };
            let removed = match vm.pool.get_mut(id) {
                PoolData::StrDict(d) => d.map.remove(&name),
                _ => unreachable!("variant checked"),
            };
            Ok(removed)
        }
        _ => unreachable!("adapter checked the receiver"),
    }
}

/// `keys()` / `values()` / `items()` materialised as lists.
fn dict_views(vm: &mut crate::vm::Vm, id: PoolId, which: &str) -> RunResult<Value> {
    use crate::types::{List, Tuple};

    enum Snapshot {
        Pairs(Vec<(Value, Value)>),
        Named(Vec<(String, Value)>),
    }
    let snapshot = match vm.pool.get(id) {
        PoolData::Dict(d) => Snapshot::Pairs(
            d.iter_entries()
                .map(|(k, v)| (k.shallow(), v.shallow()))
                .collect(),
        ),
        PoolData::StrDict(d) => Snapshot::Named(
            d.map
                .iter()
                .map(|(k, v)| (k.clone(), v.shallow()))
                .collect(),
        ),
        _ => unreachable!("adapter checked the receiver"),
    };
    let pairs: Vec<(Value, Value)> = match snapshot {
        Snapshot::Pairs(pairs) => pairs
            .into_iter()
            .map(|(k, v)| {
                if let Value::Ref(kid) = k {
                    vm.pool.inc_ref(kid);
                }
                (k, v)
            })
            .collect(),
        Snapshot::Named(named) => named
            .into_iter()
            .map(|(k, v)| (vm.alloc_str(&k), v))
            .collect(),
    };

    let items: Vec<Value> = match which {
        "keys" => pairs
            .into_iter()
            .map(|(k, v)| {
                let _ = v;
                k
            })
            .collect(),
        "values" => pairs
            .into_iter()
            .map(|(k, v)| {
                k.release(&mut vm.pool);
                if let Value::Ref(vid) = v {
                    vm.pool.inc_ref(vid);
                }
                v
            })
            .collect(),
        _ => pairs
            .into_iter()
            .map(|(k, v)| {
                if let Value::Ref(vid) = v {
                    vm.pool.inc_ref(vid);
                }
                vm.alloc(PoolData::Tuple(Tuple::new(vec![k, v])))
            })
            .collect(),
    };
    Ok(vm.alloc(PoolData::List(List::new(items))))
}
