//! Call protocol: argument gathering, callable dispatch, formal binding,
//! class construction and generators.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    builtins,
    exception::{ExcKind, RunResult},
    frame::{Frame, LocalsSlot, RetSlot},
    pool::{Pool, PoolData, PoolId},
    types::{
        CO_GENERATOR, CO_NEWLOCALS, CO_VARARGS, CO_VARKEYWORDS, Class, CodeBody, Function,
        GenState, Generator, Instance, StrDict, Tuple,
    },
    value::Value,
    vm::{Flow, Vm, attr},
};

/// Arguments of one call: positionals in natural order plus keyword
/// pairs. Owns every contained value.
#[derive(Debug, Default)]
pub(crate) struct CallArgs {
    pub pos: SmallVec<[Value; 4]>,
    pub kw: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pos_len(&self) -> usize {
        self.pos.len()
    }

    pub fn kw_is_empty(&self) -> bool {
        self.kw.is_empty()
    }

    pub fn peek_pos(&self, i: usize) -> &Value {
        &self.pos[i]
    }

    pub fn prepend(&mut self, v: Value) {
        self.pos.insert(0, v);
    }

    /// Consumes the arguments, returning the positionals. The keyword
    /// list must already be empty.
    pub fn take_pos(self) -> Vec<Value> {
        debug_assert!(self.kw.is_empty(), "keywords dropped by take_pos");
        self.pos.into_vec()
    }

    pub fn release(self, pool: &mut Pool) {
        for v in self.pos {
            v.release(pool);
        }
        for (_, v) in self.kw {
            v.release(pool);
        }
    }

    fn arity_error(self, name: &str, expected: &str, pool: &mut Pool) -> crate::exception::RunError {
        let got = self.pos_len();
        self.release(pool);
        ExcKind::TypeError.err(format!("{name}() takes {expected} arguments ({got} given)"))
    }

    pub fn expect_zero(self, name: &str, pool: &mut Pool) -> RunResult<()> {
        if self.pos.is_empty() && self.kw.is_empty() {
            Ok(())
        } else {
            Err(self.arity_error(name, "no", pool))
        }
    }

    pub fn expect_one(mut self, name: &str, pool: &mut Pool) -> RunResult<Value> {
        if self.pos.len() == 1 && self.kw.is_empty() {
            Ok(self.pos.remove(0))
        } else {
            Err(self.arity_error(name, "exactly 1", pool))
        }
    }

    pub fn expect_two(mut self, name: &str, pool: &mut Pool) -> RunResult<(Value, Value)> {
        if self.pos.len() == 2 && self.kw.is_empty() {
            let b = self.pos.remove(1);
            let a = self.pos.remove(0);
            Ok((a, b))
        } else {
            Err(self.arity_error(name, "exactly 2", pool))
        }
    }

    pub fn expect_three(mut self, name: &str, pool: &mut Pool) -> RunResult<(Value, Value, Value)> {
        if self.pos.len() == 3 && self.kw.is_empty() {
            let c = self.pos.remove(2);
            let b = self.pos.remove(1);
            let a = self.pos.remove(0);
            Ok((a, b, c))
        } else {
            Err(self.arity_error(name, "exactly 3", pool))
        }
    }

    pub fn expect_zero_or_one(mut self, name: &str, pool: &mut Pool) -> RunResult<Option<Value>> {
        if self.kw.is_empty() && self.pos.len() <= 1 {
            Ok(self.pos.pop())
        } else {
            Err(self.arity_error(name, "at most 1", pool))
        }
    }

    pub fn expect_one_to_three(
        mut self,
        name: &str,
        pool: &mut Pool,
    ) -> RunResult<(Value, Option<Value>, Option<Value>)> {
        if self.kw.is_empty() && (1..=3).contains(&self.pos.len()) {
            let c = if self.pos.len() > 2 { Some(self.pos.remove(2)) } else { None };
            let b = if self.pos.len() > 1 { Some(self.pos.remove(1)) } else { None };
            Ok((self.pos.remove(0), b, c))
        } else {
            Err(self.arity_error(name, "1 to 3", pool))
        }
    }
}

/// `CALL_FUNCTION` and its VAR/KW variants: gathers arguments off the
/// frame stack and pushes the call result.
pub(crate) fn call_from_stack(
    vm: &mut Vm,
    frame: &mut Frame,
    arg: u32,
    var_flag: bool,
    kw_flag: bool,
) -> RunResult<()> {
    let pos_count = (arg & 0xff) as usize;
    let kw_count = ((arg >> 8) & 0xff) as usize;

    // Extras sit above the regular arguments: the *args sequence, then
    // the **kwargs dict on top of it.
    let kw_dict = if kw_flag { Some(frame.pop()?) } else { None };
    let var_seq = if var_flag { Some(frame.pop()?) } else { None };

    let mut args = CallArgs::new();
    for _ in 0..kw_count {
        let value = frame.pop()?;
        let key = frame.pop()?;
        let name = builtins::string_arg(vm, &key, "keyword")?;
        key.release(&mut vm.pool);
        args.kw.push((name, value));
    }
    args.kw.reverse();
    for _ in 0..pos_count {
        let v = frame.pop()?;
        args.pos.push(v);
    }
    args.pos.reverse();
    let callable = frame.pop()?;

    if let Some(seq) = var_seq {
        let extra = super::collections::collect_iterable(vm, &seq);
        seq.release(&mut vm.pool);
        args.pos.extend(extra?);
    }
    if let Some(dict) = kw_dict {
        merge_kw_dict(vm, &mut args, &dict)?;
        dict.release(&mut vm.pool);
    }

    let result = call_value(vm, callable, args)?;
    frame.push(result);
    Ok(())
}

fn merge_kw_dict(vm: &mut Vm, args: &mut CallArgs, dict: &Value) -> RunResult<()> {
    let pairs: Vec<(String, Value)> = match dict {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::StrDict(d) => d
                .map
                .iter()
                .map(|(k, v)| (k.clone(), v.shallow()))
                .collect(),
            PoolData::Dict(d) => {
                let mut pairs = Vec::with_capacity(d.len());
                for (k, v) in d.iter_entries() {
                    let name = match k {
                        Value::Ref(kid) => match vm.pool.get(*kid) {
                            PoolData::Str(s) => s.text()?.to_owned(),
                            _ => return Err(ExcKind::TypeError.err("keywords must be strings")),
                        },
                        _ => return Err(ExcKind::TypeError.err("keywords must be strings")),
                    };
                    pairs.push((name, v.shallow()));
                }
                pairs
            }
            _ => {
                return Err(ExcKind::TypeError.err("argument after ** must be a mapping"));
            }
        },
        _ => return Err(ExcKind::TypeError.err("argument after ** must be a mapping")),
    };
    for (name, v) in pairs {
        if let Value::Ref(id) = v {
            vm.pool.inc_ref(id);
        }
        args.kw.push((name, v));
    }
    Ok(())
}

/// Calls any callable value with the given arguments. Consumes both.
pub(crate) fn call_value(vm: &mut Vm, callable: Value, args: CallArgs) -> RunResult<Value> {
    match callable {
        Value::Builtin(b) => builtins::call_builtin(vm, b, args),
        Value::Ref(id) => {
            let result = call_pool_value(vm, id, args);
            vm.pool.dec_ref(id);
            result
        }
        other => {
            let name = other.type_name(&vm.pool);
            args.release(&mut vm.pool);
            Err(ExcKind::TypeError.err(format!("'{name}' object is not callable")))
        }
    }
}

fn call_pool_value(vm: &mut Vm, id: PoolId, mut args: CallArgs) -> RunResult<Value> {
    enum Target {
        Function,
        Method { func: Value, receiver: Value },
        Class,
        CFunc(crate::bridge::NativeFnPtr),
        Adapter { obj: Value, name: String },
        NotCallable(&'static str),
    }

    let target = match vm.pool.get(id) {
        PoolData::Function(_) => Target::Function,
        PoolData::Method(m) => Target::Method {
            func: m.func.shallow(),
            receiver: m.receiver.shallow(),
        },
        PoolData::Class(_) => Target::Class,
        PoolData::CFunc(f) => Target::CFunc(Rc::clone(&f.f)),
        PoolData::PrimitiveAdapter(p) => Target::Adapter {
            obj: p.obj.shallow(),
            name: p.name.clone(),
        },
        other => Target::NotCallable(other.variant_name()),
    };

    match target {
        Target::Function => call_function(vm, id, args),
        Target::Method { func, receiver } => {
            if let Value::Ref(fid) = func {
                vm.pool.inc_ref(fid);
            }
            let receiver = match receiver {
                Value::None => {
                    // Unbound method: the receiver is the first argument
                    // and must be an instance.
                    if args.pos_len() == 0
                        || !matches!(
                            args.peek_pos(0),
                            Value::Ref(rid) if matches!(vm.pool.get(*rid), PoolData::Instance(_))
                        )
                    {
                        func.release(&mut vm.pool);
                        args.release(&mut vm.pool);
                        return Err(ExcKind::TypeError.err(
                            "unbound method must be called with an instance as first argument",
                        ));
                    }
                    None
                }
                other => {
                    if let Value::Ref(rid) = other {
                        vm.pool.inc_ref(rid);
                    }
                    Some(other)
                }
            };
            if let Some(receiver) = receiver {
                args.prepend(receiver);
            }
            call_value(vm, func, args)
        }
        Target::Class => call_class(vm, id, args),
        Target::CFunc(f) => f(vm, args),
        Target::Adapter { obj, name } => {
            if let Value::Ref(oid) = obj {
                vm.pool.inc_ref(oid);
            }
            let result = attr::call_primitive_method(vm, &obj, &name, args);
            obj.release(&mut vm.pool);
            result
        }
        Target::NotCallable(type_name) => {
            args.release(&mut vm.pool);
            Err(ExcKind::TypeError.err(format!("'{type_name}' object is not callable")))
        }
    }
}

/// Calls a script function: binds arguments into a fresh frame and runs
/// it, or wraps the frame into a generator when the code asks for one.
fn call_function(vm: &mut Vm, func_id: PoolId, args: CallArgs) -> RunResult<Value> {
    let (code_id, module_id, defaults_len, free_cells) = match vm.pool.get(func_id) {
        PoolData::Function(f) => (f.code, f.module, f.defaults.len(), f.cells.clone()),
        _ => unreachable!("caller checked the variant"),
    };
    let body = match vm.pool.get(code_id) {
        PoolData::Code(c) => Rc::clone(&c.body),
        _ => return Err(ExcKind::TypeError.err("function code slot holds a non-code")),
    };

    // Cells: fresh ones for cellvars, then the captured freevar cells.
    let mut cells = Vec::with_capacity(body.cellvars.len() + free_cells.len());
    for _ in &body.cellvars {
        cells.push(vm.pool.add(PoolData::Cell(Value::None)));
    }
    for &cell in &free_cells {
        vm.pool.inc_ref(cell);
        cells.push(cell);
    }

    vm.pool.inc_ref(code_id);
    vm.pool.inc_ref(module_id);
    let locals = if body.has_flag(CO_NEWLOCALS) {
        LocalsSlot::Fast
    } else {
        LocalsSlot::Dict(vm.pool.add(PoolData::StrDict(StrDict::new())))
    };
    let mut frame = Frame::new(code_id, Rc::clone(&body), module_id, locals, cells);

    if let Err(e) = bind_args(vm, &mut frame, &body, func_id, defaults_len, args) {
        frame.dispose(&mut vm.pool);
        return Err(e);
    }

    if body.has_flag(CO_GENERATOR) {
        let name = body.name.clone();
        return Ok(vm.alloc(PoolData::Generator(Generator::new(frame, name))));
    }

    let result = vm.run_frame(&mut frame);
    frame.dispose(&mut vm.pool);
    result
}

/// Binds call arguments to the callee frame's fast locals, following the
/// classic rules: positionals first, keywords by name, defaults for the
/// rest, varargs/varkw collecting the overflow.
fn bind_args(
    vm: &mut Vm,
    frame: &mut Frame,
    body: &CodeBody,
    func_id: PoolId,
    defaults_len: usize,
    args: CallArgs,
) -> RunResult<()> {
    let argcount = body.argcount as usize;
    let has_varargs = body.has_flag(CO_VARARGS);
    let has_varkw = body.has_flag(CO_VARKEYWORDS);
    let needed = argcount + usize::from(has_varargs) + usize::from(has_varkw);
    if frame.fast.len() < needed || body.varnames.len() < argcount {
        args.release(&mut vm.pool);
        return Err(
            ExcKind::DeserializeError.err("code object locals do not cover its arguments")
        );
    }
    let CallArgs { mut pos, kw } = args;

    let extra_pos: Vec<Value> = if pos.len() > argcount {
        pos.drain(argcount..).collect()
    } else {
        Vec::new()
    };
    if !extra_pos.is_empty() && !has_varargs {
        let got = pos.len() + extra_pos.len();
        for v in pos {
            v.release(&mut vm.pool);
        }
        for v in extra_pos {
            v.release(&mut vm.pool);
        }
        for (_, v) in kw {
            v.release(&mut vm.pool);
        }
        return Err(ExcKind::TypeError.err(format!(
            "{}() takes exactly {argcount} arguments ({got} given)",
            body.name
        )));
    }

    for (i, v) in pos.into_iter().enumerate() {
        frame.fast[i] = Some(v);
    }

    let mut varkw = if has_varkw { Some(StrDict::new()) } else { None };
    for (name, v) in kw {
        let formal = body.varnames[..argcount].iter().position(|n| n == &name);
        match formal {
            Some(i) => {
                if frame.fast[i].is_some() {
                    v.release(&mut vm.pool);
                    if let Some(varkw) = varkw.take() {
                        release_strdict(vm, varkw);
                    }
                    return Err(ExcKind::TypeError.err(format!(
                        "{}() got multiple values for keyword argument '{name}'",
                        body.name
                    )));
                }
                frame.fast[i] = Some(v);
            }
            None => match &mut varkw {
                Some(d) => {
                    if let Some(old) = d.map.insert(name, v) {
                        old.release(&mut vm.pool);
                    }
                }
                None => {
                    v.release(&mut vm.pool);
                    return Err(ExcKind::TypeError.err(format!(
                        "{}() got an unexpected keyword argument '{name}'",
                        body.name
                    )));
                }
            },
        }
    }

    // Defaults fill trailing formals that are still empty.
    let first_default = argcount - defaults_len.min(argcount);
    for i in 0..argcount {
        if frame.fast[i].is_none() {
            if i >= first_default {
                let v = match vm.pool.get(func_id) {
                    PoolData::Function(f) => f.defaults[i - first_default].shallow(),
                    _ => unreachable!("caller checked the variant"),
                };
                if let Value::Ref(id) = v {
                    vm.pool.inc_ref(id);
                }
                frame.fast[i] = Some(v);
            } else {
                if let Some(varkw) = varkw.take() {
                    release_strdict(vm, varkw);
                }
                return Err(ExcKind::TypeError.err(format!(
                    "{}() takes exactly {argcount} arguments ({i} given)",
                    body.name
                )));
            }
        }
    }

    let mut next_slot = argcount;
    if has_varargs {
        let v = vm.alloc(PoolData::Tuple(Tuple::new(extra_pos)));
        frame.fast[next_slot] = Some(v);
        next_slot += 1;
    }
    if let Some(d) = varkw {
        let v = vm.alloc(PoolData::StrDict(d));
        frame.fast[next_slot] = Some(v);
    }

    // Arguments that are also cellvars move into their cells.
    for (cell_index, cell_name) in body.cellvars.iter().enumerate() {
        if let Some(slot) = body.varnames[..argcount.min(body.varnames.len())]
            .iter()
            .position(|n| n == cell_name)
            && let Some(v) = frame.fast[slot].take()
        {
            let cell_id = frame.cells[cell_index];
            let old = match vm.pool.get_mut(cell_id) {
                PoolData::Cell(c) => std::mem::replace(c, v),
                _ => unreachable!("cells vector holds cells"),
            };
            old.release(&mut vm.pool);
        }
    }
    Ok(())
}

fn release_strdict(vm: &mut Vm, mut d: StrDict) {
    let mut dec = Vec::new();
    d.clear_refs(&mut dec);
    for id in dec {
        vm.pool.dec_ref(id);
    }
}

/// Resumes a generator: `Ok(None)` when it is exhausted.
pub(crate) fn resume_generator(vm: &mut Vm, gen_id: PoolId) -> RunResult<Option<Value>> {
    let (mut frame, started) = match vm.pool.get_mut(gen_id) {
        PoolData::Generator(g) => match g.state {
            GenState::Finished => return Ok(None),
            GenState::Running => {
                return Err(ExcKind::ValueError.err("generator already executing"));
            }
            state => {
                let frame = g
                    .frame
                    .take()
                    .ok_or_else(|| ExcKind::ValueError.err("generator frame is gone"))?;
                g.state = GenState::Running;
                (frame, state == GenState::Suspended)
            }
        },
        _ => return Err(ExcKind::TypeError.err("not a generator")),
    };

    if started {
        // Value of the yield expression on resume; no send API, so None.
        frame.push(Value::None);
    }
    let result = vm.run_frame(&mut frame);
    match result {
        Ok(v) => {
            if frame.retslot == RetSlot::Yield {
                match vm.pool.get_mut(gen_id) {
                    PoolData::Generator(g) => {
                        g.state = GenState::Suspended;
                        g.frame = Some(frame);
                    }
                    _ => unreachable!("generator slot changed variant"),
                }
                Ok(Some(v))
            } else {
                frame.dispose(&mut vm.pool);
                v.release(&mut vm.pool);
                if let PoolData::Generator(g) = vm.pool.get_mut(gen_id) {
                    g.state = GenState::Finished;
                }
                Ok(None)
            }
        }
        Err(e) => {
            frame.dispose(&mut vm.pool);
            if let PoolData::Generator(g) = vm.pool.get_mut(gen_id) {
                g.state = GenState::Finished;
            }
            Err(e)
        }
    }
}

/// Calls a class: allocates an instance, runs the native constructor or
/// `__init__`, returns the instance.
fn call_class(vm: &mut Vm, class_id: PoolId, args: CallArgs) -> RunResult<Value> {
    let (is_native, native_ctor) = match vm.pool.get(class_id) {
        PoolData::Class(c) => (c.is_native, c.native_ctor),
        _ => unreachable!("caller checked the variant"),
    };

    vm.pool.inc_ref(class_id);
    let inst_id = vm.pool.add(PoolData::Instance(Instance::new(class_id)));

    if is_native {
        if let Some(ctor_id) = native_ctor {
            let ctor = match vm.pool.get(ctor_id) {
                PoolData::CCtor(c) => Rc::clone(&c.f),
                _ => {
                    args.release(&mut vm.pool);
                    vm.pool.dec_ref(inst_id);
                    return Err(ExcKind::TypeError.err("native constructor slot is corrupt"));
                }
            };
            let cinst = match ctor(vm, args) {
                Ok(cinst) => cinst,
                Err(e) => {
                    vm.pool.dec_ref(inst_id);
                    return Err(e);
                }
            };
            let cinst_id = vm.pool.add(PoolData::CInst(cinst));
            match vm.pool.get_mut(inst_id) {
                PoolData::Instance(i) => i.native = Some(cinst_id),
                _ => unreachable!("instance slot changed variant"),
            }
        } else {
            args.release(&mut vm.pool);
        }
        return Ok(Value::Ref(inst_id));
    }

    match attr::class_chain_lookup(vm, class_id, "__init__") {
        Some(init) => {
            if let Value::Ref(fid) = init {
                vm.pool.inc_ref(fid);
            }
            let mut init_args = args;
            vm.pool.inc_ref(inst_id);
            init_args.prepend(Value::Ref(inst_id));
            match call_value(vm, init, init_args) {
                Ok(v) => v.release(&mut vm.pool),
                Err(e) => {
                    vm.pool.dec_ref(inst_id);
                    return Err(e);
                }
            }
        }
        None => {
            if args.pos_len() != 0 || !args.kw_is_empty() {
                args.release(&mut vm.pool);
                vm.pool.dec_ref(inst_id);
                return Err(
                    ExcKind::TypeError.err("this constructor takes no arguments")
                );
            }
            args.release(&mut vm.pool);
        }
    }
    Ok(Value::Ref(inst_id))
}

/// `MAKE_FUNCTION` / `MAKE_CLOSURE`: builds a function from the code
/// object on top of the stack, `argc` default values below it (and the
/// cells tuple in between for closures).
pub(crate) fn make_function(
    vm: &mut Vm,
    frame: &mut Frame,
    argc: usize,
    closure: bool,
) -> RunResult<()> {
    let code = frame.pop()?;
    let code_id = match &code {
        Value::Ref(id) if matches!(vm.pool.get(*id), PoolData::Code(_)) => *id,
        _ => {
            code.release(&mut vm.pool);
            return Err(ExcKind::TypeError.err("MAKE_FUNCTION expects a code object"));
        }
    };

    let mut cells = Vec::new();
    if closure {
        let cell_tuple = frame.pop()?;
        match &cell_tuple {
            Value::Ref(tid) => {
                let ids: Option<Vec<PoolId>> = match vm.pool.get(*tid) {
                    PoolData::Tuple(t) => t
                        .items
                        .iter()
                        .map(|v| match v {
                            Value::Ref(cid) => Some(*cid),
                            _ => None,
                        })
                        .collect(),
                    _ => None,
                };
                match ids {
                    Some(ids) => {
                        for &cid in &ids {
                            vm.pool.inc_ref(cid);
                        }
                        cells = ids;
                        cell_tuple.release(&mut vm.pool);
                    }
                    None => {
                        cell_tuple.release(&mut vm.pool);
                        code.release(&mut vm.pool);
                        return Err(
                            ExcKind::TypeError.err("MAKE_CLOSURE expects a tuple of cells")
                        );
                    }
                }
            }
            _ => {
                cell_tuple.release(&mut vm.pool);
                code.release(&mut vm.pool);
                return Err(ExcKind::TypeError.err("MAKE_CLOSURE expects a tuple of cells"));
            }
        }
    }

    let mut defaults = Vec::with_capacity(argc);
    for _ in 0..argc {
        defaults.push(frame.pop()?);
    }
    defaults.reverse();

    vm.pool.inc_ref(frame.module);
    let function = Function {
        code: code_id,
        module: frame.module,
        defaults,
        cells,
    };
    // The code reference moves from the stack value into the function.
    let v = vm.alloc(PoolData::Function(function));
    frame.push(v);
    Ok(())
}

/// `BUILD_CLASS`: pops the methods dict, the bases tuple and the class
/// name, honouring a `__metaclass__` hook in the methods dict.
pub(crate) fn build_class(vm: &mut Vm, frame: &mut Frame) -> RunResult<()> {
    let methods = frame.pop()?;
    let bases = frame.pop()?;
    let name = frame.pop()?;

    let class_name = builtins::string_arg(vm, &name, "class name")?;
    name.release(&mut vm.pool);

    let methods_id = match &methods {
        Value::Ref(id) if matches!(vm.pool.get(*id), PoolData::StrDict(_)) => *id,
        _ => {
            methods.release(&mut vm.pool);
            bases.release(&mut vm.pool);
            return Err(ExcKind::TypeError.err("BUILD_CLASS expects a methods dict"));
        }
    };

    // Metaclass hook: its result becomes the class, whatever it is.
    let metaclass = match vm.pool.get(methods_id) {
        PoolData::StrDict(d) => d.map.get("__metaclass__").map(Value::shallow),
        _ => None,
    };
    if let Some(metaclass) = metaclass {
        if let Value::Ref(id) = metaclass {
            vm.pool.inc_ref(id);
        }
        let mut args = CallArgs::new();
        let name_v = vm.alloc_str(&class_name);
        args.pos.push(name_v);
        args.pos.push(bases);
        args.pos.push(methods);
        let result = call_value(vm, metaclass, args)?;
        frame.push(result);
        return Ok(());
    }

    let base = match &bases {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Tuple(t) => {
                if t.items.len() > 1 {
                    methods.release(&mut vm.pool);
                    bases.release(&mut vm.pool);
                    return Err(
                        ExcKind::TypeError.err("more than one base class not supported")
                    );
                }
                match t.items.first() {
                    Some(Value::Ref(bid))
                        if matches!(vm.pool.get(*bid), PoolData::Class(_)) =>
                    {
                        Some(*bid)
                    }
                    Some(_) => {
                        methods.release(&mut vm.pool);
                        bases.release(&mut vm.pool);
                        return Err(ExcKind::TypeError.err("base is not a class"));
                    }
                    None => None,
                }
            }
            _ => None,
        },
        _ => None,
    };
    if let Some(bid) = base {
        vm.pool.inc_ref(bid);
    }
    // Native classes propagate their payload factory down the chain.
    let base_is_native = base
        .is_some_and(|bid| matches!(vm.pool.get(bid), PoolData::Class(c) if c.is_native));
    bases.release(&mut vm.pool);

    // The methods reference moves from the stack into the class.
    let class = Class {
        name: class_name,
        base,
        dict: Some(methods_id),
        native_ctor: None,
        is_native: base_is_native,
    };
    let v = vm.alloc(PoolData::Class(class));
    frame.push(v);
    Ok(())
}
