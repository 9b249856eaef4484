//! Attribute access: instance/class lookup chains, module attributes,
//! and the transient adapters that give primitive values their methods.

use crate::{
    builtins::Builtin,
    exception::{ExcKind, RunResult},
    pool::{PoolData, PoolId},
    types::{Method, PrimitiveAdapter, dict, list, str as str_type},
    value::Value,
    vm::{CallArgs, Vm, call},
};

/// Reads `obj.name`, following the per-variant attribute protocol.
pub(crate) fn load_attr(vm: &mut Vm, obj: &Value, name: &str) -> RunResult<Value> {
    match obj {
        Value::Ref(id) => {
            let id = *id;
            match vm.pool.get(id) {
                PoolData::Instance(_) => instance_attr(vm, id, name),
                PoolData::Class(_) => match class_chain_lookup(vm, id, name) {
                    Some(v) => {
                        if let Value::Ref(vid) = v {
                            vm.pool.inc_ref(vid);
                        }
                        Ok(v)
                    }
                    None => Err(attr_error(vm, obj, name)),
                },
                PoolData::Module(m) => {
                    let found = m.globals.get(name).map(Value::shallow);
                    match found {
                        Some(v) => {
                            if let Value::Ref(vid) = v {
                                vm.pool.inc_ref(vid);
                            }
                            Ok(v)
                        }
                        None => Err(attr_error(vm, obj, name)),
                    }
                }
                PoolData::Str(_)
                | PoolData::UStr(_)
                | PoolData::List(_)
                | PoolData::Dict(_)
                | PoolData::StrDict(_)
                | PoolData::Generator(_) => {
                    let adapter = PrimitiveAdapter {
                        obj: obj.clone_with(&mut vm.pool),
                        name: name.to_owned(),
                    };
                    Ok(vm.alloc(PoolData::PrimitiveAdapter(adapter)))
                }
                _ => Err(attr_error(vm, obj, name)),
            }
        }
        _ => Err(attr_error(vm, obj, name)),
    }
}

fn attr_error(vm: &Vm, obj: &Value, name: &str) -> crate::exception::RunError {
    ExcKind::AttributeError.err(format!(
        "'{}' object has no attribute '{name}'",
        obj.type_name(&vm.pool)
    ))
}

/// Instance attribute: own dict, then the class chain (binding callables
/// into methods), then the class `__getattr__` hook.
fn instance_attr(vm: &mut Vm, inst_id: PoolId, name: &str) -> RunResult<Value> {
    let (class_id, own) = match vm.pool.get(inst_id) {
        PoolData::Instance(i) => (i.class, i.dict.get(name).map(Value::shallow)),
        _ => unreachable!("caller checked the variant"),
    };
    if let Some(v) = own {
        if let Value::Ref(id) = v {
            vm.pool.inc_ref(id);
        }
        return Ok(v);
    }

    if let Some(found) = class_chain_lookup(vm, class_id, name) {
        return Ok(bind_if_callable(vm, found, inst_id));
    }

    // __getattr__ runs only after normal lookup fails.
    if let Some(hook) = class_chain_lookup(vm, class_id, "__getattr__") {
        let bound = bind_if_callable(vm, hook, inst_id);
        let mut args = CallArgs::new();
        args.pos.push(vm.alloc_str(name));
        return call::call_value(vm, bound, args);
    }

    let obj = Value::Ref(inst_id);
    let err = attr_error(vm, &obj, name);
    Err(err)
}

/// Wraps class-path callables into a method bound to the instance.
fn bind_if_callable(vm: &mut Vm, found: Value, inst_id: PoolId) -> Value {
    let needs_binding = match &found {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Function(_) | PoolData::CFunc(_) => true,
            PoolData::Method(m) => m.receiver.is_none(),
            _ => false,
        },
        _ => false,
    };
    if !needs_binding {
        if let Value::Ref(id) = found {
            vm.pool.inc_ref(id);
        }
        return found;
    }
    // Unbound methods re-bind their inner callable to the new receiver.
    let func = match &found {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Method(m) => m.func.shallow(),
            _ => found.shallow(),
        },
        _ => found.shallow(),
    };
    if let Value::Ref(fid) = func {
        vm.pool.inc_ref(fid);
    }
    vm.pool.inc_ref(inst_id);
    vm.alloc(PoolData::Method(Method {
        func,
        receiver: Value::Ref(inst_id),
    }))
}

/// Depth-first walk of `class -> base -> ...` for a named entry.
/// Returns a shallow value; the caller owns the follow-up `inc_ref`.
pub(crate) fn class_chain_lookup(vm: &Vm, class_id: PoolId, name: &str) -> Option<Value> {
    let mut cursor = Some(class_id);
    while let Some(id) = cursor {
        let class = match vm.pool.get(id) {
            PoolData::Class(c) => c,
            _ => return None,
        };
        if let Some(dict_id) = class.dict
            && let PoolData::StrDict(d) = vm.pool.get(dict_id)
            && let Some(v) = d.map.get(name)
        {
            return Some(v.shallow());
        }
        cursor = class.base;
    }
    None
}

/// Writes `obj.name = value`, consuming `value`.
pub(crate) fn store_attr(vm: &mut Vm, obj: &Value, name: &str, value: Value) -> RunResult<()> {
    enum Target {
        Instance(PoolId),
        Module(PoolId),
        ClassDict(PoolId),
        Cleared,
        ReadOnly(&'static str),
    }
    let target = match obj {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Instance(_) => Target::Instance(*id),
            PoolData::Module(_) => Target::Module(*id),
            PoolData::Class(c) => match c.dict {
                Some(dict_id) => Target::ClassDict(dict_id),
                None => Target::Cleared,
            },
            other => Target::ReadOnly(other.variant_name()),
        },
        other => Target::ReadOnly(other.type_name(&vm.pool)),
    };
    let old = match target {
        Target::Instance(id) => match vm.pool.get_mut(id) {
            PoolData::Instance(i) => i.dict.insert(name.to_owned(), value),
            _ => unreachable!("target checked above"),
        },
        Target::Module(id) => match vm.pool.get_mut(id) {
            PoolData::Module(m) => m.globals.insert(name.to_owned(), value),
            _ => unreachable!("target checked above"),
        },
        Target::ClassDict(dict_id) => match vm.pool.get_mut(dict_id) {
            PoolData::StrDict(d) => d.map.insert(name.to_owned(), value),
            _ => {
                value.release(&mut vm.pool);
                return Err(ExcKind::TypeError.err("class dict slot is corrupt"));
            }
        },
        Target::Cleared => {
            value.release(&mut vm.pool);
            return Err(ExcKind::AttributeError.err("class has been cleared"));
        }
        Target::ReadOnly(type_name) => {
            value.release(&mut vm.pool);
            return Err(ExcKind::AttributeError
                .err(format!("'{type_name}' object attributes are read-only")));
        }
    };
    if let Some(old) = old {
        old.release(&mut vm.pool);
    }
    Ok(())
}

pub(crate) fn delete_attr(vm: &mut Vm, obj: &Value, name: &str) -> RunResult<()> {
    match obj {
        Value::Ref(id) => {
            let removed = match vm.pool.get_mut(*id) {
                PoolData::Instance(i) => i.dict.remove(name),
                PoolData::Module(m) => m.globals.remove(name),
                _ => None,
            };
            match removed {
                Some(v) => {
                    v.release(&mut vm.pool);
                    Ok(())
                }
                None => Err(attr_error(vm, obj, name)),
            }
        }
        _ => Err(attr_error(vm, obj, name)),
    }
}

/// `isinstance` over the class chain and the builtin type callables.
pub(crate) fn isinstance(vm: &mut Vm, obj: &Value, class: &Value) -> RunResult<bool> {
    match class {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Class(_) => {
                let Some(obj_class) = (match obj {
                    Value::Ref(oid) => match vm.pool.get(*oid) {
                        PoolData::Instance(i) => Some(i.class),
                        _ => None,
                    },
                    _ => None,
                }) else {
                    return Ok(false);
                };
                let mut cursor = Some(obj_class);
                while let Some(cid) = cursor {
                    if cid == *id {
                        return Ok(true);
                    }
                    cursor = match vm.pool.get(cid) {
                        PoolData::Class(c) => c.base,
                        _ => None,
                    };
                }
                Ok(false)
            }
            PoolData::Tuple(t) => {
                let candidates: Vec<Value> = t.items.iter().map(Value::shallow).collect();
                for candidate in candidates {
                    if isinstance(vm, obj, &candidate)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(ExcKind::TypeError
                .err("isinstance() arg 2 must be a class, type, or tuple of classes and types")),
        },
        Value::Builtin(Builtin::Exc(kind)) => Ok(match obj {
            Value::Ref(oid) => match vm.pool.get(*oid) {
                PoolData::Exception(e) => e.kind.is_subclass_of(*kind),
                _ => false,
            },
            _ => false,
        }),
        Value::Builtin(Builtin::Func(f)) => {
            use crate::builtins::BuiltinFn;
            Ok(match f {
                BuiltinFn::Int => matches!(obj, Value::Int(_)),
                BuiltinFn::Float => matches!(obj, Value::Float(_)),
                BuiltinFn::Bool => matches!(obj, Value::Bool(_)),
                BuiltinFn::Str => {
                    matches!(obj, Value::Ref(id) if matches!(vm.pool.get(*id), PoolData::Str(_)))
                }
                BuiltinFn::Unicode => {
                    matches!(obj, Value::Ref(id) if matches!(vm.pool.get(*id), PoolData::UStr(_)))
                }
                _ => {
                    return Err(ExcKind::TypeError.err(
                        "isinstance() arg 2 must be a class, type, or tuple of classes and types",
                    ));
                }
            })
        }
        _ => Err(ExcKind::TypeError
            .err("isinstance() arg 2 must be a class, type, or tuple of classes and types")),
    }
}

/// Dispatches a method call on a primitive receiver.
pub(crate) fn call_primitive_method(
    vm: &mut Vm,
    obj: &Value,
    name: &str,
    args: CallArgs,
) -> RunResult<Value> {
    let Value::Ref(id) = obj else {
        args.release(&mut vm.pool);
        return Err(ExcKind::TypeError.err("primitive method on a non-object"));
    };
    let id = *id;
    match vm.pool.get(id) {
        PoolData::Str(_) | PoolData::UStr(_) => str_type::call_method(vm, id, name, args),
        PoolData::List(_) => list::call_method(vm, id, name, args),
        PoolData::Dict(_) | PoolData::StrDict(_) => dict::call_method(vm, id, name, args),
        PoolData::Generator(_) => {
            if name == "next" {
                args.expect_zero("next", &mut vm.pool)?;
                match call::resume_generator(vm, id)? {
                    Some(v) => Ok(v),
                    None => Err(ExcKind::StopIteration.err("")),
                }
            } else {
                args.release(&mut vm.pool);
                Err(ExcKind::AttributeError
                    .err(format!("'generator' object has no attribute '{name}'")))
            }
        }
        other => {
            let type_name = other.variant_name();
            args.release(&mut vm.pool);
            Err(ExcKind::AttributeError
                .err(format!("'{type_name}' object has no attribute '{name}'")))
        }
    }
}
