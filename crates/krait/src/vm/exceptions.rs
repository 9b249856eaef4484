//! Raising, unwinding, block protocol and with-statement cleanup.
//!
//! Unwinding pushes the classic `(traceback, value, type)` triple before
//! transferring to a handler, and `END_FINALLY` re-raises whatever a
//! finally block intercepted. Returns and breaks route through finally
//! handlers with the interpreter's `WHY_*` markers on the stack.

use crate::{
    builtins::Builtin,
    exception::{ExcKind, ExcPayload, RunError, RunResult, SimpleException},
    frame::{BlockKind, Frame},
    pool::PoolData,
    value::Value,
    vm::{CallArgs, Flow, Vm, attr, call},
};

/// Unwind markers, value-compatible with CPython's internal codes.
const WHY_RETURN: i64 = 0x08;
const WHY_BREAK: i64 = 0x10;
const WHY_CONTINUE: i64 = 0x20;

/// Faults that script handlers must never swallow.
fn is_fatal(err: &RunError) -> bool {
    matches!(
        &err.payload,
        ExcPayload::Simple(SimpleException {
            kind: ExcKind::OpcodeError | ExcKind::DeserializeError,
            ..
        })
    )
}

/// Dispatches a fault raised during one instruction: transfers to the
/// nearest handler in this frame or propagates with a traceback entry.
pub(crate) fn unwind(vm: &mut Vm, frame: &mut Frame, err: RunError) -> RunResult<()> {
    if !is_fatal(&err) {
        while let Some(block) = frame.blocks.last().copied() {
            frame.blocks.pop();
            frame.truncate_stack(block.stack_depth, &mut vm.pool);
            match block.kind {
                BlockKind::Loop => {}
                BlockKind::Except | BlockKind::Finally | BlockKind::With => {
                    let (inst, class) = materialize(vm, err);
                    // Remember the triple for bare `raise`.
                    set_last_raised(vm, &inst, &class);
                    frame.push(Value::None); // traceback slot
                    frame.push(inst);
                    frame.push(class);
                    frame.ip = block.handler;
                    return Ok(());
                }
            }
        }
    }
    let mut err = err;
    err.push_frame(&frame.body.filename, frame.current_line(), &frame.body.name);
    Err(err)
}

/// Converts an error payload into the (instance, class) value pair the
/// handler protocol pushes.
fn materialize(vm: &mut Vm, err: RunError) -> (Value, Value) {
    match err.payload {
        ExcPayload::Raised(raised) => (raised.inst, raised.class),
        ExcPayload::Simple(exc) => {
            let kind = exc.kind;
            let inst = vm.alloc(PoolData::Exception(exc));
            (inst, Value::Builtin(Builtin::Exc(kind)))
        }
    }
}

fn set_last_raised(vm: &mut Vm, inst: &Value, class: &Value) {
    let pair = (inst.clone_with(&mut vm.pool), class.clone_with(&mut vm.pool));
    if let Some((old_inst, old_class)) = vm.last_raised.replace(pair) {
        old_inst.release(&mut vm.pool);
        old_class.release(&mut vm.pool);
    }
}

/// `RAISE_VARARGS n`.
pub(crate) fn do_raise(vm: &mut Vm, frame: &mut Frame, argc: u32) -> RunResult<Flow> {
    if argc == 0 {
        // Bare raise: re-throw the exception being handled.
        let Some((inst, class)) = vm.last_raised.take() else {
            return Err(ExcKind::TypeError.err("exceptions must be old-style classes or derived from BaseException, not NoneType"));
        };
        let reinst = inst.clone_with(&mut vm.pool);
        let reclass = class.clone_with(&mut vm.pool);
        vm.last_raised = Some((inst, class));
        return Err(RunError::raised(reinst, reclass));
    }

    let traceback = if argc >= 3 { Some(frame.pop()?) } else { None };
    let arg = if argc >= 2 { Some(frame.pop()?) } else { None };
    let exc = frame.pop()?;
    if let Some(tb) = traceback {
        tb.release(&mut vm.pool);
    }

    let (inst, class) = raise_pair(vm, exc, arg)?;
    Err(RunError::raised(inst, class))
}

/// Normalises `raise X` / `raise X, arg` into an (instance, class) pair.
fn raise_pair(vm: &mut Vm, exc: Value, arg: Option<Value>) -> RunResult<(Value, Value)> {
    match &exc {
        // raise ValueError / raise ValueError, "message"
        Value::Builtin(Builtin::Exc(kind)) => {
            let kind = *kind;
            let message = arg.as_ref().map_or_else(String::new, |a| a.py_str(&vm.pool));
            if let Some(arg) = arg {
                arg.release(&mut vm.pool);
            }
            let inst = vm.alloc(PoolData::Exception(SimpleException::new(kind, message)));
            Ok((inst, exc))
        }
        Value::Ref(id) => {
            let id = *id;
            match vm.pool.get(id) {
                // raise already-constructed exception instance
                PoolData::Exception(e) => {
                    let kind = e.kind;
                    if let Some(arg) = arg {
                        arg.release(&mut vm.pool);
                    }
                    Ok((exc, Value::Builtin(Builtin::Exc(kind))))
                }
                // raise SomeClass / raise SomeClass, arg
                PoolData::Class(_) => {
                    let mut args = CallArgs::new();
                    if let Some(arg) = arg {
                        args.pos.push(arg);
                    }
                    vm.pool.inc_ref(id);
                    let inst = call::call_value(vm, Value::Ref(id), args)?;
                    Ok((inst, exc))
                }
                // raise instance_of_user_class
                PoolData::Instance(i) => {
                    let class_id = i.class;
                    vm.pool.inc_ref(class_id);
                    if let Some(arg) = arg {
                        arg.release(&mut vm.pool);
                    }
                    Ok((exc, Value::Ref(class_id)))
                }
                other => {
                    let name = other.variant_name();
                    if let Some(arg) = arg {
                        arg.release(&mut vm.pool);
                    }
                    exc.release(&mut vm.pool);
                    Err(ExcKind::TypeError
                        .err(format!("exceptions must be classes or instances, not {name}")))
                }
            }
        }
        other => {
            let name = other.type_name(&vm.pool);
            if let Some(arg) = arg {
                arg.release(&mut vm.pool);
            }
            exc.release(&mut vm.pool);
            Err(ExcKind::TypeError
                .err(format!("exceptions must be classes or instances, not {name}")))
        }
    }
}

/// The `exc_match` comparison: does the raised class match the handler
/// class (or any member of a handler tuple)?
pub(crate) fn exc_match(vm: &Vm, raised: &Value, handler: &Value) -> bool {
    match handler {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Tuple(t) => t.items.iter().any(|h| exc_match(vm, raised, h)),
            PoolData::Class(_) => match raised {
                Value::Ref(rid) => {
                    // user-class hierarchy walk
                    let mut cursor = match vm.pool.get(*rid) {
                        PoolData::Class(_) => Some(*rid),
                        PoolData::Instance(i) => Some(i.class),
                        _ => None,
                    };
                    while let Some(cid) = cursor {
                        if cid == *id {
                            return true;
                        }
                        cursor = match vm.pool.get(cid) {
                            PoolData::Class(c) => c.base,
                            _ => None,
                        };
                    }
                    false
                }
                _ => false,
            },
            _ => false,
        },
        Value::Builtin(Builtin::Exc(handler_kind)) => {
            let raised_kind = match raised {
                Value::Builtin(Builtin::Exc(k)) => Some(*k),
                Value::Ref(rid) => match vm.pool.get(*rid) {
                    PoolData::Exception(e) => Some(e.kind),
                    _ => None,
                },
                _ => None,
            };
            raised_kind.is_some_and(|k| k.is_subclass_of(*handler_kind))
        }
        _ => false,
    }
}

/// `END_FINALLY`: continue, re-raise, or resume a routed return/break.
pub(crate) fn end_finally(vm: &mut Vm, frame: &mut Frame) -> RunResult<Option<Flow>> {
    let status = frame.pop()?;
    match &status {
        Value::None => Ok(None),
        Value::Int(why) => match *why {
            WHY_RETURN => {
                let retval = frame.pop()?;
                do_return(vm, frame, retval).map(Some)
            }
            WHY_BREAK => {
                do_break(vm, frame)?;
                Ok(None)
            }
            WHY_CONTINUE => {
                let target = frame.pop()?;
                let ip = target
                    .as_int()
                    .ok_or_else(|| ExcKind::OpcodeError.err("corrupt continue target"))?;
                target.release(&mut vm.pool);
                frame.ip = usize::try_from(ip)
                    .map_err(|_| ExcKind::OpcodeError.err("corrupt continue target"))?;
                Ok(None)
            }
            _ => Err(ExcKind::OpcodeError.err("corrupt END_FINALLY status")),
        },
        _ => {
            // The status is an exception class; value and traceback are
            // below it. Re-raise the triple.
            let value = frame.pop()?;
            let tb = frame.pop()?;
            tb.release(&mut vm.pool);
            Err(RunError::raised(value, status))
        }
    }
}

/// `RETURN_VALUE` with finally blocks on the stack routes through them.
pub(crate) fn do_return(vm: &mut Vm, frame: &mut Frame, retval: Value) -> RunResult<Flow> {
    while let Some(block) = frame.blocks.last().copied() {
        match block.kind {
            BlockKind::Loop | BlockKind::Except => {
                frame.blocks.pop();
                frame.truncate_stack(block.stack_depth, &mut vm.pool);
            }
            BlockKind::Finally | BlockKind::With => {
                frame.blocks.pop();
                frame.truncate_stack(block.stack_depth, &mut vm.pool);
                frame.push(retval);
                frame.push(Value::Int(WHY_RETURN));
                frame.ip = block.handler;
                return Ok(Flow::Continue);
            }
        }
    }
    Ok(Flow::Return(retval))
}

/// `BREAK_LOOP`: exit the nearest loop, routing through finallys.
pub(crate) fn do_break(vm: &mut Vm, frame: &mut Frame) -> RunResult<()> {
    while let Some(block) = frame.blocks.last().copied() {
        frame.blocks.pop();
        frame.truncate_stack(block.stack_depth, &mut vm.pool);
        match block.kind {
            BlockKind::Loop => {
                frame.ip = block.handler;
                return Ok(());
            }
            BlockKind::Except => {}
            BlockKind::Finally | BlockKind::With => {
                frame.push(Value::Int(WHY_BREAK));
                frame.ip = block.handler;
                return Ok(());
            }
        }
    }
    Err(ExcKind::OpcodeError.err("break outside a loop"))
}

/// `CONTINUE_LOOP target`: jump to the loop head, routing through
/// finallys between here and the loop block.
pub(crate) fn do_continue(vm: &mut Vm, frame: &mut Frame, target: usize) -> RunResult<()> {
    // Find the innermost loop; any finally block above it intercepts.
    for i in (0..frame.blocks.len()).rev() {
        match frame.blocks[i].kind {
            BlockKind::Loop => {
                frame.ip = target;
                return Ok(());
            }
            BlockKind::Finally | BlockKind::With => {
                let block = frame.blocks.remove(i);
                frame.truncate_stack(block.stack_depth, &mut vm.pool);
                frame.push(Value::Int(
                    i64::try_from(target).expect("jump targets fit in i64"),
                ));
                frame.push(Value::Int(WHY_CONTINUE));
                frame.ip = block.handler;
                return Ok(());
            }
            BlockKind::Except => {}
        }
    }
    Err(ExcKind::OpcodeError.err("continue outside a loop"))
}

/// `SETUP_WITH delta`: binds `__exit__` below a finally-style block and
/// pushes the `__enter__` result.
pub(crate) fn setup_with(vm: &mut Vm, frame: &mut Frame, delta: usize) -> RunResult<()> {
    let mgr = frame.pop()?;
    let exit = attr::load_attr(vm, &mgr, "__exit__");
    let exit = match exit {
        Ok(exit) => exit,
        Err(e) => {
            mgr.release(&mut vm.pool);
            return Err(e);
        }
    };
    let enter = attr::load_attr(vm, &mgr, "__enter__");
    mgr.release(&mut vm.pool);
    let enter = match enter {
        Ok(enter) => enter,
        Err(e) => {
            exit.release(&mut vm.pool);
            return Err(e);
        }
    };
    let entered = call::call_value(vm, enter, CallArgs::new());
    let entered = match entered {
        Ok(v) => v,
        Err(e) => {
            exit.release(&mut vm.pool);
            return Err(e);
        }
    };
    frame.push(exit);
    frame.push_block(BlockKind::With, frame.ip + delta);
    frame.push(entered);
    Ok(())
}

/// `WITH_CLEANUP`: calls `__exit__` with the pending exception triple
/// (or Nones) and optionally swallows the exception.
pub(crate) fn with_cleanup(vm: &mut Vm, frame: &mut Frame) -> RunResult<()> {
    let status = frame.pop()?;
    match &status {
        Value::None => {
            let exit = frame.pop()?;
            let mut args = CallArgs::new();
            args.pos.push(Value::None);
            args.pos.push(Value::None);
            args.pos.push(Value::None);
            let result = call::call_value(vm, exit, args)?;
            result.release(&mut vm.pool);
            frame.push(Value::None);
            Ok(())
        }
        Value::Int(why) => {
            // A routed return/continue carries one value below the
            // marker; a break carries none. The exit callable sits
            // underneath.
            let routed = match *why {
                WHY_RETURN | WHY_CONTINUE => Some(frame.pop()?),
                _ => None,
            };
            let exit = frame.pop()?;
            let mut args = CallArgs::new();
            args.pos.push(Value::None);
            args.pos.push(Value::None);
            args.pos.push(Value::None);
            let result = call::call_value(vm, exit, args)?;
            result.release(&mut vm.pool);
            if let Some(v) = routed {
                frame.push(v);
            }
            frame.push(status);
            Ok(())
        }
        _ => {
            // Exception triple: status is the class, below it the value
            // and traceback, and the exit callable underneath.
            let value = frame.pop()?;
            let tb = frame.pop()?;
            let exit = frame.pop()?;
            let mut args = CallArgs::new();
            args.pos.push(status.clone_with(&mut vm.pool));
            args.pos.push(value.clone_with(&mut vm.pool));
            args.pos.push(tb.clone_with(&mut vm.pool));
            let swallow = call::call_value(vm, exit, args)?;
            let swallow_truthy = swallow.truthy(&vm.pool);
            swallow.release(&mut vm.pool);
            tb.release(&mut vm.pool);
            if swallow_truthy {
                status.release(&mut vm.pool);
                value.release(&mut vm.pool);
                frame.push(Value::None);
                Ok(())
            } else {
                Err(RunError::raised(value, status))
            }
        }
    }
}
