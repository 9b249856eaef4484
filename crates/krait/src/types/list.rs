//! Mutable lists and immutable tuples.
//!
//! Structurally the two are the same ordered sequence of values; the
//! dispatcher enforces tuple immutability by refusing the mutating
//! entry points on the tuple variant.

use crate::{pool::PoolId, value::Value};

#[derive(Debug, Default)]
pub(crate) struct List {
    pub items: Vec<Value>,
}

impl List {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        for item in &self.items {
            item.push_ref(out);
        }
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        for item in self.items.drain(..) {
            item.push_ref(dec);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Tuple {
    pub items: Vec<Value>,
}

impl Tuple {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    pub fn collect_refs(&self, out: &mut Vec<PoolId>) {
        for item in &self.items {
            item.push_ref(out);
        }
    }

    pub fn clear_refs(&mut self, dec: &mut Vec<PoolId>) {
        for item in self.items.drain(..) {
            item.push_ref(dec);
        }
    }
}

use crate::exception::{ExcKind, RunResult};
use crate::vm::{CallArgs, Vm};

/// Dispatches a method call on a list receiver.
pub(crate) fn call_method(
    vm: &mut Vm,
    id: PoolId,
    name: &str,
    args: CallArgs,
) -> RunResult<Value> {
    use crate::pool::PoolData;

    match name {
        "append" => {
            let v = args.expect_one(name, &mut vm.pool)?;
            match vm.pool.get_mut(id) {
                PoolData::List(l) => l.items.push(v),
                _ => unreachable!("adapter checked the receiver"),
            }
            Ok(Value::None)
        }
        "extend" => {
            let seq = args.expect_one(name, &mut vm.pool)?;
            let extra = crate::vm::collections::collect_iterable(vm, &seq);
            seq.release(&mut vm.pool);
            let extra = extra?;
            match vm.pool.get_mut(id) {
                PoolData::List(l) => l.items.extend(extra),
                _ => unreachable!("adapter checked the receiver"),
            }
            Ok(Value::None)
        }
        "insert" => {
            let (index, v) = args.expect_two(name, &mut vm.pool)?;
            let n = index.as_int();
            index.release(&mut vm.pool);
            let Some(n) = n else {
                v.release(&mut vm.pool);
                return Err(ExcKind::TypeError.err("an integer is required"));
            };
            match vm.pool.get_mut(id) {
                PoolData::List(l) => {
                    let len = l.items.len() as i64;
                    let at = n.clamp(-len, len);
                    let at = if at < 0 { at + len } else { at };
                    l.items
                        .insert(usize::try_from(at).expect("clamped in range"), v);
                }
                _ => unreachable!("adapter checked the receiver"),
            }
            Ok(Value::None)
        }
        "pop" => {
            let index = args.expect_zero_or_one(name, &mut vm.pool)?;
            let n = match &index {
                Some(v) => v.as_int(),
                None => Some(-1),
            };
            if let Some(index) = index {
                index.release(&mut vm.pool);
            }
            let Some(n) = n else {
                return Err(ExcKind::TypeError.err("an integer is required"));
            };
            match vm.pool.get_mut(id) {
                PoolData::List(l) => {
                    let len = l.items.len() as i64;
                    let at = if n < 0 { n + len } else { n };
                    if at < 0 || at >= len {
                        Err(ExcKind::IndexError.err("pop index out of range"))
                    } else {
                        Ok(l.items.remove(usize::try_from(at).expect("checked")))
                    }
                }
                _ => unreachable!("adapter checked the receiver"),
            }
        }
        "remove" => {
            let needle = args.expect_one(name, &mut vm.pool)?;
            let found = match vm.pool.get(id) {
                PoolData::List(l) => l.items.iter().position(|v| v.py_eq(&needle, &vm.pool)),
                _ => unreachable!("adapter checked the receiver"),
            };
            needle.release(&mut vm.pool);
            match found {
                Some(i) => {
                    let old = match vm.pool.get_mut(id) {
                        PoolData::List(l) => l.items.remove(i),
                        _ => unreachable!("adapter checked the receiver"),
                    };
                    old.release(&mut vm.pool);
                    Ok(Value::None)
                }
                None => Err(ExcKind::ValueError.err("list.remove(x): x not in list")),
            }
        }
        "index" => {
            let needle = args.expect_one(name, &mut vm.pool)?;
            let found = match vm.pool.get(id) {
                PoolData::List(l) => l.items.iter().position(|v| v.py_eq(&needle, &vm.pool)),
                _ => unreachable!("adapter checked the receiver"),
            };
            needle.release(&mut vm.pool);
            found
                .map(|i| Value::Int(i64::try_from(i).expect("index fits")))
                .ok_or_else(|| ExcKind::ValueError.err("list.index(x): x not in list"))
        }
        "count" => {
            let needle = args.expect_one(name, &mut vm.pool)?;
            let n = match vm.pool.get(id) {
                PoolData::List(l) => {
                    l.items.iter().filter(|v| v.py_eq(&needle, &vm.pool)).count()
                }
                _ => unreachable!("adapter checked the receiver"),
            };
            needle.release(&mut vm.pool);
            Ok(Value::Int(i64::try_from(n).expect("count fits")))
        }
        "reverse" => {
            args.expect_zero(name, &mut vm.pool)?;
            match vm.pool.get_mut(id) {
                PoolData::List(l) => l.items.reverse(),
                _ => unreachable!("adapter checked the receiver"),
            }
            Ok(Value::None)
        }
        "sort" => {
            args.expect_zero(name, &mut vm.pool)?;
            let mut items = match vm.pool.get_mut(id) {
                PoolData::List(l) => std::mem::take(&mut l.items),
                _ => unreachable!("adapter checked the receiver"),
            };
            // Incomparable pairs keep their relative order, like the
            // original's permissive compare.
            items.sort_by(|a, b| {
                a.py_cmp(b, &vm.pool).unwrap_or(std::cmp::Ordering::Equal)
            });
            match vm.pool.get_mut(id) {
                PoolData::List(l) => l.items = items,
                _ => unreachable!("adapter checked the receiver"),
            }
            Ok(Value::None)
        }
        _ => {
            args.release(&mut vm.pool);
            Err(ExcKind::AttributeError
                .err(format!("'list' object has no attribute '{name}'")))
        }
    }
}
