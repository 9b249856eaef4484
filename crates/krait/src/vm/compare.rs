//! `COMPARE_OP`: orderings, membership, identity and handler matching.

use std::cmp::Ordering;

use crate::{
    exception::{ExcKind, RunResult},
    frame::Frame,
    opcode::CompareKind,
    pool::PoolData,
    types::HKey,
    value::Value,
    vm::{Vm, exceptions},
};

pub(crate) fn compare_op(vm: &mut Vm, frame: &mut Frame, kind: CompareKind) -> RunResult<()> {
    let rhs = frame.pop()?;
    let lhs = frame.pop()?;
    let result = apply(vm, kind, &lhs, &rhs);
    lhs.release(&mut vm.pool);
    rhs.release(&mut vm.pool);
    frame.push(Value::Bool(result?));
    Ok(())
}

fn apply(vm: &mut Vm, kind: CompareKind, lhs: &Value, rhs: &Value) -> RunResult<bool> {
    match kind {
        CompareKind::Is => Ok(lhs.is_same(rhs)),
        CompareKind::IsNot => Ok(!lhs.is_same(rhs)),
        CompareKind::Eq => Ok(lhs.py_eq(rhs, &vm.pool)),
        CompareKind::Ne => Ok(!lhs.py_eq(rhs, &vm.pool)),
        CompareKind::Lt | CompareKind::Le | CompareKind::Gt | CompareKind::Ge => {
            let ord = lhs.py_cmp(rhs, &vm.pool).ok_or_else(|| {
                ExcKind::TypeError.err(format!(
                    "cannot compare '{}' and '{}'",
                    lhs.type_name(&vm.pool),
                    rhs.type_name(&vm.pool)
                ))
            })?;
            Ok(match kind {
                CompareKind::Lt => ord == Ordering::Less,
                CompareKind::Le => ord != Ordering::Greater,
                CompareKind::Gt => ord == Ordering::Greater,
                CompareKind::Ge => ord != Ordering::Less,
                _ => unreachable!("outer match filtered"),
            })
        }
        CompareKind::In => contains(vm, lhs, rhs),
        CompareKind::NotIn => contains(vm, lhs, rhs).map(|b| !b),
        CompareKind::ExcMatch => Ok(exceptions::exc_match(vm, lhs, rhs)),
    }
}

/// The `in` operator: `item in container`.
fn contains(vm: &mut Vm, item: &Value, container: &Value) -> RunResult<bool> {
    match container {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Str(hay) => match item {
                Value::Ref(nid) => match vm.pool.get(*nid) {
                    PoolData::Str(needle) => {
                        let (hay, needle) = (hay.bytes(), needle.bytes());
                        Ok(needle.is_empty()
                            || (needle.len() <= hay.len()
                                && hay.windows(needle.len()).any(|w| w == needle)))
                    }
                    _ => Err(ExcKind::TypeError
                        .err("'in <string>' requires string as left operand")),
                },
                _ => Err(ExcKind::TypeError.err("'in <string>' requires string as left operand")),
            },
            PoolData::List(l) => {
                Ok(l.items.iter().any(|v| v.py_eq(item, &vm.pool)))
            }
            PoolData::Tuple(t) => {
                Ok(t.items.iter().any(|v| v.py_eq(item, &vm.pool)))
            }
            PoolData::Dict(d) => {
                let hkey = HKey::project(item, &vm.pool)?;
                Ok(d.contains(&hkey))
            }
            PoolData::StrDict(d) => match item {
                Value::Ref(nid) => match vm.pool.get(*nid) {
                    PoolData::Str(s) => Ok(d.map.contains_key(s.text()?)),
                    _ => Ok(false),
                },
                _ => Ok(false),
            },
            PoolData::XRange(r) => Ok(item.as_int().is_some_and(|n| {
                let mut probe = *r;
                std::iter::from_fn(move || probe.next_value()).any(|v| v == n)
            })),
            other => Err(ExcKind::TypeError.err(format!(
                "argument of type '{}' is not iterable",
                other.variant_name()
            ))),
        },
        other => Err(ExcKind::TypeError.err(format!(
            "argument of type '{}' is not iterable",
            other.type_name(&vm.pool)
        ))),
    }
}
