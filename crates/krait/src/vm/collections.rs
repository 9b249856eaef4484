//! Sequence and mapping plumbing: iteration, subscripts, slices,
//! unpacking.

use crate::{
    exception::{ExcKind, RunResult},
    frame::{Frame, LocalsSlot},
    opcode::Opcode,
    pool::{PoolData, PoolId},
    types::{HKey, Iter, List, Slice, Str, Tuple, UStr},
    value::Value,
    vm::{Vm, call},
};

/// `GET_ITER`: replaces a value with its iterator. Consumes `v`.
pub(crate) fn get_iter(vm: &mut Vm, v: Value) -> RunResult<Value> {
    match &v {
        Value::Ref(id) => {
            let id = *id;
            match vm.pool.get(id) {
                PoolData::List(_) | PoolData::Tuple(_) | PoolData::Str(_) | PoolData::UStr(_) => {
                    Ok(vm.alloc(PoolData::Iter(Iter::new(v))))
                }
                // Mappings iterate a snapshot of their keys.
                PoolData::Dict(d) => {
                    let keys: Vec<Value> = d.iter_entries().map(|(k, _)| k.shallow()).collect();
                    for k in &keys {
                        if let Value::Ref(kid) = k {
                            vm.pool.inc_ref(*kid);
                        }
                    }
                    v.release(&mut vm.pool);
                    let tuple = vm.alloc(PoolData::Tuple(Tuple::new(keys)));
                    Ok(vm.alloc(PoolData::Iter(Iter::new(tuple))))
                }
                PoolData::StrDict(d) => {
                    let names: Vec<String> = d.map.keys().cloned().collect();
                    v.release(&mut vm.pool);
                    let keys = names
                        .into_iter()
                        .map(|name| vm.alloc_str(&name))
                        .collect();
                    let tuple = vm.alloc(PoolData::Tuple(Tuple::new(keys)));
                    Ok(vm.alloc(PoolData::Iter(Iter::new(tuple))))
                }
                // Ranges, generators and iterators are their own iterator.
                PoolData::XRange(_) | PoolData::Generator(_) | PoolData::Iter(_) => Ok(v),
                other => {
                    let name = other.variant_name();
                    v.release(&mut vm.pool);
                    Err(ExcKind::TypeError.err(format!("'{name}' object is not iterable")))
                }
            }
        }
        other => {
            let name = other.type_name(&vm.pool);
            v.release(&mut vm.pool);
            Err(ExcKind::TypeError.err(format!("'{name}' object is not iterable")))
        }
    }
}

/// Advances an iterator value; `Ok(None)` signals exhaustion.
pub(crate) fn iter_next(vm: &mut Vm, iter: &Value) -> RunResult<Option<Value>> {
    let Value::Ref(id) = iter else {
        return Err(ExcKind::TypeError.err("not an iterator"));
    };
    let id = *id;
    enum Kind {
        Generator,
        Seq { of: Value, index: usize },
    }
    let kind = match vm.pool.get_mut(id) {
        PoolData::XRange(r) => return Ok(r.next_value().map(Value::Int)),
        PoolData::Generator(_) => Kind::Generator,
        PoolData::Iter(it) => {
            let of = it.of.shallow();
            let index = it.index;
            it.index += 1;
            Kind::Seq { of, index }
        }
        _ => return Err(ExcKind::TypeError.err("not an iterator")),
    };
    match kind {
        Kind::Generator => call::resume_generator(vm, id),
        Kind::Seq { of, index } => element_at(vm, &of, index),
    }
}

/// Element of an ordered sequence by absolute index, cloned out.
fn element_at(vm: &mut Vm, seq: &Value, index: usize) -> RunResult<Option<Value>> {
    let Value::Ref(id) = seq else {
        return Err(ExcKind::TypeError.err("not a sequence"));
    };
    let picked = match vm.pool.get(*id) {
        PoolData::List(l) => l.items.get(index).map(Value::shallow).map(Ok),
        PoolData::Tuple(t) => t.items.get(index).map(Value::shallow).map(Ok),
        PoolData::Str(s) => s
            .bytes()
            .get(index)
            .map(|&b| Err(PoolData::Str(Str::from_bytes(vec![b])))),
        PoolData::UStr(u) => u
            .chars()
            .get(index)
            .map(|&c| Err(PoolData::UStr(UStr::from_units(vec![c])))),
        _ => return Err(ExcKind::TypeError.err("not a sequence")),
    };
    match picked {
        None => Ok(None),
        Some(Ok(v)) => {
            if let Value::Ref(vid) = v {
                vm.pool.inc_ref(vid);
            }
            Ok(Some(v))
        }
        Some(Err(data)) => Ok(Some(vm.alloc(data))),
    }
}

/// Materialises any iterable into a vector of owned values.
pub(crate) fn collect_iterable(vm: &mut Vm, v: &Value) -> RunResult<Vec<Value>> {
    match v {
        Value::Ref(id) => {
            let id = *id;
            match vm.pool.get(id) {
                PoolData::List(l) => {
                    let items: Vec<Value> = l.items.iter().map(Value::shallow).collect();
                    for item in &items {
                        if let Value::Ref(iid) = item {
                            vm.pool.inc_ref(*iid);
                        }
                    }
                    Ok(items)
                }
                PoolData::Tuple(t) => {
                    let items: Vec<Value> = t.items.iter().map(Value::shallow).collect();
                    for item in &items {
                        if let Value::Ref(iid) = item {
                            vm.pool.inc_ref(*iid);
                        }
                    }
                    Ok(items)
                }
                PoolData::Str(s) => {
                    let bytes = s.bytes().to_vec();
                    Ok(bytes
                        .into_iter()
                        .map(|b| vm.alloc(PoolData::Str(Str::from_bytes(vec![b]))))
                        .collect())
                }
                PoolData::UStr(u) => {
                    let chars = u.chars().to_vec();
                    Ok(chars
                        .into_iter()
                        .map(|c| vm.alloc(PoolData::UStr(UStr::from_units(vec![c]))))
                        .collect())
                }
                PoolData::XRange(r) => {
                    // Iterate a copy so collecting does not consume the range.
                    let mut probe = crate::types::XRange::new(r.start, r.stop, r.step);
                    let mut items = Vec::with_capacity(probe.len());
                    while let Some(n) = probe.next_value() {
                        items.push(Value::Int(n));
                    }
                    Ok(items)
                }
                PoolData::Dict(d) => {
                    let keys: Vec<Value> = d.iter_entries().map(|(k, _)| k.shallow()).collect();
                    for k in &keys {
                        if let Value::Ref(kid) = k {
                            vm.pool.inc_ref(*kid);
                        }
                    }
                    Ok(keys)
                }
                PoolData::StrDict(d) => {
                    let names: Vec<String> = d.map.keys().cloned().collect();
                    Ok(names.into_iter().map(|n| vm.alloc_str(&n)).collect())
                }
                PoolData::Generator(_) | PoolData::Iter(_) => {
                    let mut items = Vec::new();
                    loop {
                        let probe = Value::Ref(id);
                        match iter_next(vm, &probe)? {
                            Some(v) => items.push(v),
                            None => break,
                        }
                    }
                    Ok(items)
                }
                other => Err(ExcKind::TypeError
                    .err(format!("'{}' object is not iterable", other.variant_name()))),
            }
        }
        other => Err(ExcKind::TypeError
            .err(format!("'{}' object is not iterable", other.type_name(&vm.pool)))),
    }
}

/// Resolved integer index into a sequence of `len`, with negative
/// offsets mirrored from the end.
fn resolve_index(key: i64, len: usize, what: &str) -> RunResult<usize> {
    let len = len as i64;
    let idx = if key < 0 { key + len } else { key };
    if idx < 0 || idx >= len {
        return Err(ExcKind::IndexError.err(format!("{what} index out of range")));
    }
    Ok(usize::try_from(idx).expect("checked non-negative"))
}

/// `container[key]`.
pub(crate) fn subscr_get(vm: &mut Vm, container: &Value, key: &Value) -> RunResult<Value> {
    let Value::Ref(id) = container else {
        return Err(ExcKind::TypeError.err(format!(
            "'{}' object is not subscriptable",
            container.type_name(&vm.pool)
        )));
    };
    let id = *id;

    // Slice keys produce a new sequence.
    if let Value::Ref(kid) = key
        && let PoolData::Slice(slice) = vm.pool.get(*kid)
    {
        let slice = *slice;
        return slice_of(vm, id, slice);
    }

    match vm.pool.get(id) {
        PoolData::List(l) => {
            let n = key
                .as_int()
                .ok_or_else(|| ExcKind::TypeError.err("list indices must be integers"))?;
            let i = resolve_index(n, l.items.len(), "list")?;
            let v = l.items[i].shallow();
            if let Value::Ref(vid) = v {
                vm.pool.inc_ref(vid);
            }
            Ok(v)
        }
        PoolData::Tuple(t) => {
            let n = key
                .as_int()
                .ok_or_else(|| ExcKind::TypeError.err("tuple indices must be integers"))?;
            let i = resolve_index(n, t.items.len(), "tuple")?;
            let v = t.items[i].shallow();
            if let Value::Ref(vid) = v {
                vm.pool.inc_ref(vid);
            }
            Ok(v)
        }
        PoolData::Str(s) => {
            let n = key
                .as_int()
                .ok_or_else(|| ExcKind::TypeError.err("string indices must be integers"))?;
            let i = resolve_index(n, s.len(), "string")?;
            let b = s.bytes()[i];
            Ok(vm.alloc(PoolData::Str(Str::from_bytes(vec![b]))))
        }
        PoolData::UStr(u) => {
            let n = key
                .as_int()
                .ok_or_else(|| ExcKind::TypeError.err("string indices must be integers"))?;
            let i = resolve_index(n, u.len(), "string")?;
            let c = u.chars()[i];
            Ok(vm.alloc(PoolData::UStr(UStr::from_units(vec![c]))))
        }
        PoolData::Dict(d) => {
            let hkey = HKey::project(key, &vm.pool)?;
            match d.get(&hkey) {
                Some(v) => {
                    let v = v.shallow();
                    if let Value::Ref(vid) = v {
                        vm.pool.inc_ref(vid);
                    }
                    Ok(v)
                }
                None => Err(ExcKind::KeyError.err(key.py_repr(&vm.pool))),
            }
        }
        PoolData::StrDict(d) => {
            let name = str_key(vm, key)?;
            match d.map.get(&name) {
                Some(v) => {
                    let v = v.shallow();
                    if let Value::Ref(vid) = v {
                        vm.pool.inc_ref(vid);
                    }
                    Ok(v)
                }
                None => Err(ExcKind::KeyError.err(key.py_repr(&vm.pool))),
            }
        }
        other => Err(ExcKind::TypeError.err(format!(
            "'{}' object is not subscriptable",
            other.variant_name()
        ))),
    }
}

fn str_key(vm: &Vm, key: &Value) -> RunResult<String> {
    match key {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Str(s) => Ok(s.text()?.to_owned()),
            PoolData::UStr(u) => String::from_utf16(u.chars())
                .map_err(|_| ExcKind::ValueError.err("surrogates not allowed")),
            other => Err(ExcKind::TypeError
                .err(format!("keys of this dict must be strings, not '{}'", other.variant_name()))),
        },
        other => Err(ExcKind::TypeError.err(format!(
            "keys of this dict must be strings, not '{}'",
            other.type_name(&vm.pool)
        ))),
    }
}

/// `container[key] = value`. Consumes `value`.
pub(crate) fn subscr_set(
    vm: &mut Vm,
    container: &Value,
    key: &Value,
    value: Value,
) -> RunResult<()> {
    let Value::Ref(id) = container else {
        value.release(&mut vm.pool);
        return Err(ExcKind::TypeError.err(format!(
            "'{}' object does not support item assignment",
            container.type_name(&vm.pool)
        )));
    };
    let id = *id;

    if let Value::Ref(kid) = key
        && let PoolData::Slice(slice) = vm.pool.get(*kid)
    {
        let slice = *slice;
        return slice_assign(vm, id, slice, value);
    }

    match vm.pool.get(id) {
        PoolData::List(l) => {
            let n = key
                .as_int()
                .ok_or_else(|| ExcKind::TypeError.err("list indices must be integers"));
            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    value.release(&mut vm.pool);
                    return Err(e);
                }
            };
            let i = match resolve_index(n, l.items.len(), "list") {
                Ok(i) => i,
                Err(e) => {
                    value.release(&mut vm.pool);
                    return Err(e);
                }
            };
            let old = match vm.pool.get_mut(id) {
                PoolData::List(l) => std::mem::replace(&mut l.items[i], value),
                _ => unreachable!("variant checked"),
            };
            old.release(&mut vm.pool);
            Ok(())
        }
        PoolData::Dict(_) => {
            let hkey = match HKey::project(key, &vm.pool) {
                Ok(h) => h,
                Err(e) => {
                    value.release(&mut vm.pool);
                    return Err(e);
                }
            };
            let key_owned = key.clone_with(&mut vm.pool);
            let old = match vm.pool.get_mut(id) {
                PoolData::Dict(d) => d.insert(hkey, key_owned, value),
                _ => unreachable!("variant checked"),
            };
            if let Some((k, v)) = old {
                k.release(&mut vm.pool);
                v.release(&mut vm.pool);
            }
            Ok(())
        }
        PoolData::StrDict(_) => {
            let name = match str_key(vm, key) {
                Ok(n) => n,
                Err(e) => {
                    value.release(&mut vm.pool);
                    return Err(e);
                }
            };
            let old = match vm.pool.get_mut(id) {
                PoolData::StrDict(d) => d.map.insert(name, value),
                _ => unreachable!("variant checked"),
            };
            if let Some(v) = old {
                v.release(&mut vm.pool);
            }
            Ok(())
        }
        other => {
            let name = other.variant_name();
            value.release(&mut vm.pool);
            Err(ExcKind::TypeError
                .err(format!("'{name}' object does not support item assignment")))
        }
    }
}

/// `del container[key]`.
pub(crate) fn subscr_del(vm: &mut Vm, container: &Value, key: &Value) -> RunResult<()> {
    let Value::Ref(id) = container else {
        return Err(ExcKind::TypeError.err(format!(
            "'{}' object does not support item deletion",
            container.type_name(&vm.pool)
        )));
    };
    let id = *id;

    if let Value::Ref(kid) = key
        && let PoolData::Slice(slice) = vm.pool.get(*kid)
    {
        let slice = *slice;
        return slice_remove(vm, id, slice);
    }

    match vm.pool.get(id) {
        PoolData::List(l) => {
            let n = key
                .as_int()
                .ok_or_else(|| ExcKind::TypeError.err("list indices must be integers"))?;
            let i = resolve_index(n, l.items.len(), "list")?;
            let old = match vm.pool.get_mut(id) {
                PoolData::List(l) => l.items.remove(i),
                _ => unreachable!("variant checked"),
            };
            old.release(&mut vm.pool);
            Ok(())
        }
        PoolData::Dict(_) => {
            let hkey = HKey::project(key, &vm.pool)?;
            let removed = match vm.pool.get_mut(id) {
                PoolData::Dict(d) => d.remove(&hkey),
                _ => unreachable!("variant checked"),
            };
            match removed {
                Some((k, v)) => {
                    k.release(&mut vm.pool);
                    v.release(&mut vm.pool);
                    Ok(())
                }
                None => Err(ExcKind::KeyError.err(key.py_repr(&vm.pool))),
            }
        }
        PoolData::StrDict(_) => {
            let name = str_key(vm, key)?;
            let removed = match vm.pool.get_mut(id) {
                PoolData::StrDict(d) => d.map.remove(&name),
                _ => unreachable!("variant checked"),
            };
            match removed {
                Some(v) => {
                    v.release(&mut vm.pool);
                    Ok(())
                }
                None => Err(ExcKind::KeyError.err(key.py_repr(&vm.pool))),
            }
        }
        other => Err(ExcKind::TypeError.err(format!(
            "'{}' object does not support item deletion",
            other.variant_name()
        ))),
    }
}

/// Slicing an ordered sequence into a fresh one of the same type.
fn slice_of(vm: &mut Vm, id: PoolId, slice: Slice) -> RunResult<Value> {
    enum Kind {
        List(Vec<Value>),
        Tuple(Vec<Value>),
        Str(Vec<u8>),
        UStr(Vec<u16>),
    }
    let kind = match vm.pool.get(id) {
        PoolData::List(l) => {
            let resolved = slice.resolve(l.items.len())?;
            Kind::List(resolved.indices().map(|i| l.items[i].shallow()).collect())
        }
        PoolData::Tuple(t) => {
            let resolved = slice.resolve(t.items.len())?;
            Kind::Tuple(resolved.indices().map(|i| t.items[i].shallow()).collect())
        }
        PoolData::Str(s) => {
            let resolved = slice.resolve(s.len())?;
            Kind::Str(resolved.indices().map(|i| s.bytes()[i]).collect())
        }
        PoolData::UStr(u) => {
            let resolved = slice.resolve(u.len())?;
            Kind::UStr(resolved.indices().map(|i| u.chars()[i]).collect())
        }
        other => {
            return Err(ExcKind::TypeError
                .err(format!("'{}' object cannot be sliced", other.variant_name())));
        }
    };
    Ok(match kind {
        Kind::List(items) => {
            for v in &items {
                if let Value::Ref(vid) = v {
                    vm.pool.inc_ref(*vid);
                }
            }
            vm.alloc(PoolData::List(List::new(items)))
        }
        Kind::Tuple(items) => {
            for v in &items {
                if let Value::Ref(vid) = v {
                    vm.pool.inc_ref(*vid);
                }
            }
            vm.alloc(PoolData::Tuple(Tuple::new(items)))
        }
        Kind::Str(bytes) => vm.alloc(PoolData::Str(Str::from_bytes(bytes))),
        Kind::UStr(chars) => vm.alloc(PoolData::UStr(UStr::from_units(chars))),
    })
}

/// Slice assignment on lists. Step-1 slices splice; stepped slices
/// require an exact length match.
fn slice_assign(vm: &mut Vm, id: PoolId, slice: Slice, value: Value) -> RunResult<()> {
    let replacement = collect_iterable(vm, &value);
    value.release(&mut vm.pool);
    let replacement = replacement?;

    let len = match vm.pool.get(id) {
        PoolData::List(l) => l.items.len(),
        other => {
            let name = other.variant_name();
            for v in replacement {
                v.release(&mut vm.pool);
            }
            return Err(ExcKind::TypeError
                .err(format!("'{name}' object does not support slice assignment")));
        }
    };
    let resolved = slice.resolve(len)?;

    if slice.step.unwrap_or(1) == 1 {
        let start = usize::try_from(resolved.start).expect("resolved start in range");
        let removed: Vec<Value> = match vm.pool.get_mut(id) {
            PoolData::List(l) => l
                .items
                .splice(start..start + resolved.len, replacement)
                .collect(),
            _ => unreachable!("variant checked"),
        };
        for v in removed {
            v.release(&mut vm.pool);
        }
        return Ok(());
    }

    if replacement.len() != resolved.len {
        let (need, got) = (resolved.len, replacement.len());
        for v in replacement {
            v.release(&mut vm.pool);
        }
        return Err(ExcKind::ValueError.err(format!(
            "attempt to assign sequence of size {got} to extended slice of size {need}"
        )));
    }
    let indices: Vec<usize> = resolved.indices().collect();
    for (i, v) in indices.into_iter().zip(replacement) {
        let old = match vm.pool.get_mut(id) {
            PoolData::List(l) => std::mem::replace(&mut l.items[i], v),
            _ => unreachable!("variant checked"),
        };
        old.release(&mut vm.pool);
    }
    Ok(())
}

fn slice_remove(vm: &mut Vm, id: PoolId, slice: Slice) -> RunResult<()> {
    let len = match vm.pool.get(id) {
        PoolData::List(l) => l.items.len(),
        other => {
            return Err(ExcKind::TypeError
                .err(format!("'{}' object does not support slice deletion", other.variant_name())));
        }
    };
    let resolved = slice.resolve(len)?;
    let mut doomed: Vec<usize> = resolved.indices().collect();
    doomed.sort_unstable();
    for i in doomed.into_iter().rev() {
        let old = match vm.pool.get_mut(id) {
            PoolData::List(l) => l.items.remove(i),
            _ => unreachable!("variant checked"),
        };
        old.release(&mut vm.pool);
    }
    Ok(())
}

/// The Python 2 `SLICE+n` opcodes: `obj[:]`, `obj[a:]`, `obj[:b]`,
/// `obj[a:b]`.
pub(crate) fn slice_get(vm: &mut Vm, frame: &mut Frame, op: Opcode) -> RunResult<()> {
    let (start, stop) = pop_slice_bounds(vm, frame, op)?;
    let obj = frame.pop()?;
    let result = match &obj {
        Value::Ref(id) => slice_of(vm, *id, Slice::new(start, stop, None)),
        other => Err(ExcKind::TypeError
            .err(format!("'{}' object cannot be sliced", other.type_name(&vm.pool)))),
    };
    obj.release(&mut vm.pool);
    frame.push(result?);
    Ok(())
}

pub(crate) fn slice_store(vm: &mut Vm, frame: &mut Frame, op: Opcode) -> RunResult<()> {
    let (start, stop) = pop_store_slice_bounds(vm, frame, op)?;
    let obj = frame.pop()?;
    let value = frame.pop()?;
    let result = match &obj {
        Value::Ref(id) => slice_assign(vm, *id, Slice::new(start, stop, None), value),
        other => {
            let name = other.type_name(&vm.pool);
            value.release(&mut vm.pool);
            Err(ExcKind::TypeError.err(format!("'{name}' object does not support slice assignment")))
        }
    };
    obj.release(&mut vm.pool);
    result
}

pub(crate) fn slice_delete(vm: &mut Vm, frame: &mut Frame, op: Opcode) -> RunResult<()> {
    let (start, stop) = pop_delete_slice_bounds(vm, frame, op)?;
    let obj = frame.pop()?;
    let result = match &obj {
        Value::Ref(id) => slice_remove(vm, *id, Slice::new(start, stop, None)),
        other => Err(ExcKind::TypeError
            .err(format!("'{}' object does not support slice deletion", other.type_name(&vm.pool)))),
    };
    obj.release(&mut vm.pool);
    result
}

fn pop_bound(vm: &mut Vm, frame: &mut Frame) -> RunResult<Option<i64>> {
    let v = frame.pop()?;
    let n = v
        .as_int()
        .ok_or_else(|| ExcKind::TypeError.err("slice indices must be integers"));
    v.release(&mut vm.pool);
    n.map(Some)
}

fn pop_slice_bounds(
    vm: &mut Vm,
    frame: &mut Frame,
    op: Opcode,
) -> RunResult<(Option<i64>, Option<i64>)> {
    Ok(match op {
        Opcode::SliceNone => (None, None),
        Opcode::SliceLeft => (pop_bound(vm, frame)?, None),
        Opcode::SliceRight => (None, pop_bound(vm, frame)?),
        Opcode::SliceBoth => {
            let stop = pop_bound(vm, frame)?;
            let start = pop_bound(vm, frame)?;
            (start, stop)
        }
        other => unreachable!("not a slice opcode: {other:?}"),
    })
}

fn pop_store_slice_bounds(
    vm: &mut Vm,
    frame: &mut Frame,
    op: Opcode,
) -> RunResult<(Option<i64>, Option<i64>)> {
    Ok(match op {
        Opcode::StoreSliceNone => (None, None),
        Opcode::StoreSliceLeft => (pop_bound(vm, frame)?, None),
        Opcode::StoreSliceRight => (None, pop_bound(vm, frame)?),
        Opcode::StoreSliceBoth => {
            let stop = pop_bound(vm, frame)?;
            let start = pop_bound(vm, frame)?;
            (start, stop)
        }
        other => unreachable!("not a slice opcode: {other:?}"),
    })
}

fn pop_delete_slice_bounds(
    vm: &mut Vm,
    frame: &mut Frame,
    op: Opcode,
) -> RunResult<(Option<i64>, Option<i64>)> {
    Ok(match op {
        Opcode::DeleteSliceNone => (None, None),
        Opcode::DeleteSliceLeft => (pop_bound(vm, frame)?, None),
        Opcode::DeleteSliceRight => (None, pop_bound(vm, frame)?),
        Opcode::DeleteSliceBoth => {
            let stop = pop_bound(vm, frame)?;
            let start = pop_bound(vm, frame)?;
            (start, stop)
        }
        other => unreachable!("not a slice opcode: {other:?}"),
    })
}

/// `UNPACK_SEQUENCE n`: exact-length unpack pushed in reverse so the
/// first element ends up on top.
pub(crate) fn unpack_sequence(vm: &mut Vm, frame: &mut Frame, n: usize) -> RunResult<()> {
    let seq = frame.pop()?;
    let items = collect_iterable(vm, &seq);
    seq.release(&mut vm.pool);
    let items = items?;
    if items.len() != n {
        let got = items.len();
        for v in items {
            v.release(&mut vm.pool);
        }
        return Err(ExcKind::ValueError.err(if got > n {
            "too many values to unpack".to_owned()
        } else {
            format!("need more than {got} values to unpack")
        }));
    }
    for v in items.into_iter().rev() {
        frame.push(v);
    }
    Ok(())
}

/// `LIST_APPEND` for comprehensions.
pub(crate) fn list_append(vm: &mut Vm, list: &Value, v: Value) -> RunResult<()> {
    match list {
        Value::Ref(id) => match vm.pool.get_mut(*id) {
            PoolData::List(l) => {
                l.items.push(v);
                Ok(())
            }
            _ => {
                v.release(&mut vm.pool);
                Err(ExcKind::TypeError.err("LIST_APPEND target is not a list"))
            }
        },
        _ => {
            v.release(&mut vm.pool);
            Err(ExcKind::TypeError.err("LIST_APPEND target is not a list"))
        }
    }
}

/// `IMPORT_STAR`: copies the module's public globals into the frame's
/// namespace.
pub(crate) fn import_star(vm: &mut Vm, frame: &Frame, module: &Value) -> RunResult<()> {
    let Value::Ref(id) = module else {
        return Err(ExcKind::TypeError.err("import * from a non-module"));
    };
    let pairs: Vec<(String, Value)> = match vm.pool.get(*id) {
        PoolData::Module(m) => m
            .globals
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .map(|(name, v)| (name.clone(), v.shallow()))
            .collect(),
        _ => return Err(ExcKind::TypeError.err("import * from a non-module")),
    };
    for (name, v) in pairs {
        if let Value::Ref(vid) = v {
            vm.pool.inc_ref(vid);
        }
        let old = match &frame.locals {
            LocalsSlot::Dict(did) => match vm.pool.get_mut(*did) {
                PoolData::StrDict(d) => d.map.insert(name, v),
                _ => None,
            },
            LocalsSlot::Globals | LocalsSlot::Fast => match vm.pool.get_mut(frame.module) {
                PoolData::Module(m) => m.globals.insert(name, v),
                _ => None,
            },
        };
        if let Some(old) = old {
            old.release(&mut vm.pool);
        }
    }
    Ok(())
}
