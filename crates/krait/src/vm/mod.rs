//! The virtual machine: module registry, host API and opcode dispatch.
//!
//! A [`Vm`] owns the object pool, the module registry and the builtins
//! dict. Execution is recursive: a call instruction builds the callee
//! frame and runs it to completion on the native stack, so native and
//! script frames interleave naturally.

pub(crate) mod attr;
pub(crate) mod binary;
pub(crate) mod call;
pub(crate) mod collections;
pub(crate) mod compare;
pub(crate) mod exceptions;

use std::borrow::Cow;
use std::io::Read;
use std::path::Path;
use std::rc::Rc;

use ahash::AHashMap;

pub(crate) use call::CallArgs;

use crate::{
    builtins::Builtin,
    exception::{ExcKind, Exception, RunResult},
    frame::{BlockKind, Frame, LocalsSlot, RetSlot},
    io::{PrintWriter, StdPrint},
    marshal,
    object::{self, Object},
    opcode::{CompareKind, Opcode},
    pool::{Pool, PoolData, PoolId, PoolStats},
    resource::ResourceLimits,
    tracer::{NoopTracer, VmTracer},
    types::{Dict, List, Module, Slice, Str, Tuple},
    value::Value,
};

/// Callback invoked when a script imports a module the VM does not know:
/// returns the raw `.pyc` image and whether it still carries its header.
pub type ImportCallback = Box<dyn FnMut(&str) -> Option<(Vec<u8>, bool)>>;

/// A rooted reference to a script value, held alive by the VM until
/// [`Vm::drop_handle`] or teardown. Returned for call results that have
/// no owned [`Object`] mapping (instances, generators, functions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

/// What the dispatcher should do after one instruction.
pub(crate) enum Flow {
    Continue,
    Return(Value),
    Yield(Value),
}

pub struct Vm {
    pub(crate) pool: Pool,
    /// sys.modules: name to module pool object, one reference each.
    pub(crate) modules: AHashMap<String, PoolId>,
    /// Builtins dict; `LOAD_GLOBAL`/`LOAD_NAME` fall back here.
    pub(crate) builtins: AHashMap<String, Value>,
    main_module: PoolId,
    import_callback: Option<ImportCallback>,
    pub(crate) stdout: Box<dyn PrintWriter>,
    pub(crate) tracer: Box<dyn VmTracer>,
    limits: ResourceLimits,
    /// Current script frame nesting depth.
    pub(crate) depth: usize,
    /// Instructions executed since the current host call started.
    executed: u64,
    /// Rooted values handed out to the host.
    handles: Vec<Option<Value>>,
    /// Exception currently being handled, for bare `raise`.
    pub(crate) last_raised: Option<(Value, Value)>,
    /// Pending space separator for the `print` statement.
    softspace: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        let mut pool = Pool::new();
        let main_module = pool.add(PoolData::Module(Module::new("__main__")));
        let mut modules = AHashMap::new();
        modules.insert("__main__".to_owned(), main_module);
        let mut builtins = AHashMap::new();
        for (name, builtin) in Builtin::all() {
            builtins.insert(name.to_owned(), Value::Builtin(builtin));
        }
        Self {
            pool,
            modules,
            builtins,
            main_module,
            import_callback: None,
            stdout: Box::new(StdPrint),
            tracer: Box::new(NoopTracer),
            limits: ResourceLimits::default(),
            depth: 0,
            executed: 0,
            handles: Vec::new(),
            last_raised: None,
            softspace: false,
        }
    }

    /// Redirects `print` output.
    pub fn set_stdout(&mut self, writer: impl PrintWriter + 'static) {
        self.stdout = Box::new(writer);
    }

    pub fn set_tracer(&mut self, tracer: impl VmTracer + 'static) {
        self.tracer = Box::new(tracer);
    }

    pub fn set_limits(&mut self, limits: ResourceLimits) {
        self.limits = limits;
    }

    pub fn set_import_callback(&mut self, callback: ImportCallback) {
        self.import_callback = Some(callback);
    }

    /// Name of the module host calls resolve against by default.
    #[must_use]
    pub fn main_module(&self) -> &'static str {
        "__main__"
    }

    #[must_use]
    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// A rooted handle to a registered module, for attribute access and
    /// method calls from the host.
    pub fn get_module(&mut self, name: &str) -> Option<Handle> {
        let id = *self.modules.get(name)?;
        self.pool.inc_ref(id);
        Some(self.make_handle(Value::Ref(id)))
    }

    /// Registers an empty module, for hosts that populate modules with
    /// native functions before any script runs.
    pub fn add_empty_module(&mut self, name: &str) {
        if self.modules.contains_key(name) {
            return;
        }
        let id = self.pool.add(PoolData::Module(Module::new(name)));
        self.modules.insert(name.to_owned(), id);
    }

    /// Loads a `.pyc` image from a file; the module is registered under
    /// the file stem and its top-level code is executed.
    pub fn import_pyc_file(&mut self, path: impl AsRef<Path>) -> Result<String, Exception> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| Exception {
            kind: ExcKind::ImportError,
            message: format!("cannot read {}: {e}", path.display()),
            traceback: Vec::new(),
        })?;
        let name = path
            .file_stem()
            .map_or_else(|| "module".to_owned(), |s| s.to_string_lossy().into_owned());
        self.import_pyc_buf(&name, &bytes, true)?;
        Ok(name)
    }

    /// Loads a `.pyc` image from a reader, naming the module after the
    /// path's file stem.
    pub fn import_pyc_reader(
        &mut self,
        mut reader: impl Read,
        path: &str,
        has_header: bool,
    ) -> Result<String, Exception> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).map_err(|e| Exception {
            kind: ExcKind::ImportError,
            message: format!("cannot read {path}: {e}"),
            traceback: Vec::new(),
        })?;
        let name = Path::new(path)
            .file_stem()
            .map_or_else(|| "module".to_owned(), |s| s.to_string_lossy().into_owned());
        self.import_pyc_buf(&name, &bytes, has_header)?;
        Ok(name)
    }

    /// Loads a `.pyc` image from memory and registers it under `name`.
    pub fn import_pyc_buf(
        &mut self,
        name: &str,
        bytes: &[u8],
        has_header: bool,
    ) -> Result<(), Exception> {
        self.import_pyc_internal(name, bytes, has_header)
            .map(|_| ())
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))
    }

    fn import_pyc_internal(
        &mut self,
        name: &str,
        bytes: &[u8],
        has_header: bool,
    ) -> RunResult<PoolId> {
        // A failed parse leaves an unreachable partial graph; throw it
        // away wholesale.
        let parse_mark = self.pool.mark();
        let code_id = match marshal::parse_pyc(&mut self.pool, bytes, has_header) {
            Ok(id) => {
                self.pool.forget_mark(parse_mark);
                id
            }
            Err(e) => {
                self.pool.reclaim_to(parse_mark);
                return Err(e);
            }
        };

        let module_id = self.pool.add(PoolData::Module(Module::new(name)));
        let old = self.modules.insert(name.to_owned(), module_id);
        if let Some(old) = old {
            self.pool.dec_ref(old);
        }

        let exec_mark = self.pool.mark();
        let result = self.exec_module_body(code_id, module_id);
        self.pool.dec_ref(code_id);
        match result {
            Ok(()) => {
                self.pool.forget_mark(exec_mark);
                Ok(module_id)
            }
            Err(e) => {
                // Unregister the half-initialised module, then break any
                // cycles its body created.
                if self.modules.get(name) == Some(&module_id) {
                    self.modules.remove(name);
                    self.pool.dec_ref(module_id);
                }
                let outcome = self.pool.sweep_to(exec_mark);
                self.tracer.sweep(outcome.cleared, outcome.overran);
                Err(e)
            }
        }
    }

    /// Runs a code object as the body of `module_id`.
    fn exec_module_body(&mut self, code_id: PoolId, module_id: PoolId) -> RunResult<()> {
        let body = match self.pool.get(code_id) {
            PoolData::Code(c) => Rc::clone(&c.body),
            other => {
                return Err(ExcKind::TypeError
                    .err(format!("cannot execute a {} as a module", other.variant_name())));
            }
        };
        self.pool.inc_ref(code_id);
        self.pool.inc_ref(module_id);
        let mut frame = Frame::new(code_id, body, module_id, LocalsSlot::Globals, Vec::new());
        let result = self.run_frame(&mut frame);
        frame.dispose(&mut self.pool);
        result?.release(&mut self.pool);
        Ok(())
    }

    /// Imports a module by name: registry first, then the host import
    /// callback.
    pub(crate) fn import_module(&mut self, name: &str) -> RunResult<Value> {
        if let Some(&id) = self.modules.get(name) {
            self.pool.inc_ref(id);
            return Ok(Value::Ref(id));
        }
        let mut callback = self
            .import_callback
            .take()
            .ok_or_else(|| ExcKind::ImportError.err(format!("No module named {name}")))?;
        let fetched = callback(name);
        self.import_callback = Some(callback);
        let (bytes, has_header) =
            fetched.ok_or_else(|| ExcKind::ImportError.err(format!("No module named {name}")))?;
        let id = self.import_pyc_internal(name, &bytes, has_header)?;
        self.pool.inc_ref(id);
        Ok(Value::Ref(id))
    }

    // ----- host call surface -----

    /// Calls a script callable by qualified name (`"func"` resolves in
    /// `__main__` then builtins, `"module.func"` in that module).
    pub fn call(&mut self, target: &str, args: Vec<Object>) -> Result<Object, Exception> {
        let callable = self
            .lookup_qual(target)
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        self.call_rooted(callable, args)
    }

    /// Calls a value previously handed out as a handle.
    pub fn call_handle(&mut self, handle: Handle, args: Vec<Object>) -> Result<Object, Exception> {
        let callable = self
            .handle_value(handle)
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        self.call_rooted(callable, args)
    }

    /// Calls a named method on a handle's value.
    pub fn call_method(
        &mut self,
        handle: Handle,
        name: &str,
        args: Vec<Object>,
    ) -> Result<Object, Exception> {
        let receiver = self
            .handle_value(handle)
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        let method = attr::load_attr(self, &receiver, name);
        receiver.release(&mut self.pool);
        let method = method.map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        self.call_rooted(method, args)
    }

    /// Reads an attribute of a handle's value.
    pub fn get_attr(&mut self, handle: Handle, name: &str) -> Result<Object, Exception> {
        let receiver = self
            .handle_value(handle)
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        let value = attr::load_attr(self, &receiver, name);
        receiver.release(&mut self.pool);
        let value = value.map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        Ok(self.value_to_object(value))
    }

    /// Writes an attribute of a handle's value.
    pub fn set_attr(&mut self, handle: Handle, name: &str, value: Object) -> Result<(), Exception> {
        let receiver = self
            .handle_value(handle)
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        let v = object::to_value(self, value);
        let result = match v {
            Ok(v) => attr::store_attr(self, &receiver, name, v),
            Err(e) => Err(e),
        };
        receiver.release(&mut self.pool);
        result.map_err(|e| Exception::from_run_error(e, &mut self.pool))
    }

    /// Advances an iterable handle (typically a generator): `Ok(None)`
    /// signals exhaustion.
    pub fn iter_next(&mut self, handle: Handle) -> Result<Option<Object>, Exception> {
        let iter = self
            .handle_value(handle)
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        let next = collections::iter_next(self, &iter);
        iter.release(&mut self.pool);
        match next {
            Ok(Some(v)) => Ok(Some(self.value_to_object(v))),
            Ok(None) => Ok(None),
            Err(e) => Err(Exception::from_run_error(e, &mut self.pool)),
        }
    }

    /// Reads a global by qualified name as a host object.
    pub fn get_global(&mut self, target: &str) -> Result<Object, Exception> {
        let v = self
            .lookup_qual(target)
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        Ok(self.value_to_object(v))
    }

    /// Exposes a value globally to all scripts.
    pub fn add_builtin(&mut self, name: &str, value: Object) -> Result<(), Exception> {
        let v = object::to_value(self, value)
            .map_err(|e| Exception::from_run_error(e, &mut self.pool))?;
        if let Some(old) = self.builtins.insert(name.to_owned(), v) {
            old.release(&mut self.pool);
        }
        Ok(())
    }

    /// Releases a rooted handle.
    pub fn drop_handle(&mut self, handle: Handle) {
        if let Some(slot) = self.handles.get_mut(handle.0 as usize)
            && let Some(v) = slot.take()
        {
            v.release(&mut self.pool);
        }
    }

    /// Pool diagnostics.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Number of live pool objects, the original memory-introspection
    /// surface.
    #[must_use]
    pub fn count_objects(&self) -> usize {
        self.pool.size()
    }

    /// Writes one line per live object to `out`, newest first.
    pub fn mem_dump(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        let mut result = Ok(());
        self.pool.for_each(|id, data| {
            if result.is_ok() {
                result = writeln!(out, "{id:?}: {}", data.variant_name());
            }
        });
        result
    }

    fn call_rooted(&mut self, callable: Value, args: Vec<Object>) -> Result<Object, Exception> {
        let mark = self.pool.mark();
        self.executed = 0;
        let mut call_args = CallArgs::new();
        for arg in args {
            match object::to_value(self, arg) {
                Ok(v) => call_args.pos.push(v),
                Err(e) => {
                    call_args.release(&mut self.pool);
                    callable.release(&mut self.pool);
                    self.pool.forget_mark(mark);
                    return Err(Exception::from_run_error(e, &mut self.pool));
                }
            }
        }
        match call::call_value(self, callable, call_args) {
            Ok(v) => {
                let mut made_handle = false;
                let obj = object::from_value(self, v, &mut made_handle);
                if made_handle {
                    // A handle escaped the scope; clearing now would gut it.
                    self.pool.forget_mark(mark);
                } else {
                    let outcome = self.pool.sweep_to(mark);
                    self.tracer.sweep(outcome.cleared, outcome.overran);
                }
                Ok(obj)
            }
            Err(e) => {
                let exc = Exception::from_run_error(e, &mut self.pool);
                let outcome = self.pool.sweep_to(mark);
                self.tracer.sweep(outcome.cleared, outcome.overran);
                Err(exc)
            }
        }
    }

    /// Converts an owned value to a host object, rooting a handle when
    /// there is no plain mapping.
    pub(crate) fn value_to_object(&mut self, v: Value) -> Object {
        let mut made_handle = false;
        object::from_value(self, v, &mut made_handle)
    }

    pub(crate) fn make_handle(&mut self, v: Value) -> Handle {
        for (i, slot) in self.handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(v);
                return Handle(u32::try_from(i).expect("handle index overflow"));
            }
        }
        self.handles.push(Some(v));
        Handle(u32::try_from(self.handles.len() - 1).expect("handle index overflow"))
    }

    pub(crate) fn handle_value(&mut self, handle: Handle) -> RunResult<Value> {
        let v = self
            .handles
            .get(handle.0 as usize)
            .and_then(|slot| slot.as_ref())
            .map(Value::shallow)
            .ok_or_else(|| ExcKind::ValueError.err("stale handle"))?;
        if let Value::Ref(id) = v {
            self.pool.inc_ref(id);
        }
        Ok(v)
    }

    /// Resolves `"name"` or `"module.name"` to a value, cloning it.
    pub(crate) fn lookup_qual(&mut self, target: &str) -> RunResult<Value> {
        let (module_name, name) = match target.split_once('.') {
            Some((m, n)) => (Some(m), n),
            None => (None, target),
        };
        let module_id = match module_name {
            Some(m) => *self
                .modules
                .get(m)
                .ok_or_else(|| ExcKind::ImportError.err(format!("No module named {m}")))?,
            None => self.main_module,
        };
        let found = match self.pool.get(module_id) {
            PoolData::Module(module) => module.globals.get(name).map(Value::shallow),
            _ => None,
        };
        if let Some(v) = found {
            if let Value::Ref(id) = v {
                self.pool.inc_ref(id);
            }
            return Ok(v);
        }
        if module_name.is_none()
            && let Some(v) = self.builtins.get(name)
        {
            let v = v.shallow();
            if let Value::Ref(id) = v {
                self.pool.inc_ref(id);
            }
            return Ok(v);
        }
        Err(ExcKind::NameError.err(format!("name '{target}' is not defined")))
    }

    // ----- allocation and lookup helpers -----

    pub(crate) fn alloc(&mut self, data: PoolData) -> Value {
        Value::Ref(self.pool.add(data))
    }

    pub(crate) fn alloc_str(&mut self, s: &str) -> Value {
        self.alloc(PoolData::Str(Str::from_str(s)))
    }

    /// Length of a value, `None` when it has no length.
    pub(crate) fn value_len(&self, v: &Value) -> Option<usize> {
        match v {
            Value::Ref(id) => match self.pool.get(*id) {
                PoolData::Str(s) => Some(s.len()),
                PoolData::UStr(u) => Some(u.len()),
                PoolData::List(l) => Some(l.items.len()),
                PoolData::Tuple(t) => Some(t.items.len()),
                PoolData::Dict(d) => Some(d.len()),
                PoolData::StrDict(d) => Some(d.map.len()),
                PoolData::XRange(r) => Some(r.len()),
                _ => None,
            },
            _ => None,
        }
    }

    // ----- dispatcher -----

    /// Runs a frame to its next exit: return, yield, or unhandled fault.
    pub(crate) fn run_frame(&mut self, frame: &mut Frame) -> RunResult<Value> {
        self.depth += 1;
        if self.depth > self.limits.max_recursion_depth {
            self.depth -= 1;
            return Err(ExcKind::RuntimeError.err("maximum recursion depth exceeded"));
        }
        self.tracer.frame_enter(&frame.body.name);
        let result = self.run_frame_inner(frame);
        self.tracer.frame_exit(&frame.body.name);
        self.depth -= 1;
        result
    }

    fn run_frame_inner(&mut self, frame: &mut Frame) -> RunResult<Value> {
        let mut ext_arg: u32 = 0;
        loop {
            if let Some(budget) = self.limits.max_instructions {
                self.executed += 1;
                if self.executed > budget {
                    return Err(ExcKind::RuntimeError.err("instruction budget exhausted"));
                }
            }
            let op_offset = frame.ip;
            let Some(&raw) = frame.body.code.get(frame.ip) else {
                return Err(ExcKind::OpcodeError.err("instruction pointer ran off the code"));
            };
            frame.ip += 1;
            let Ok(op) = Opcode::try_from(raw) else {
                return Err(ExcKind::OpcodeError.err(format!("unknown opcode {raw}")));
            };
            let arg = if op.has_arg() {
                let lo = frame.body.code.get(frame.ip).copied();
                let hi = frame.body.code.get(frame.ip + 1).copied();
                let (Some(lo), Some(hi)) = (lo, hi) else {
                    return Err(ExcKind::OpcodeError.err("truncated operand"));
                };
                frame.ip += 2;
                let value = ext_arg | u32::from(u16::from_le_bytes([lo, hi]));
                ext_arg = 0;
                value
            } else {
                0
            };
            if op == Opcode::ExtendedArg {
                ext_arg = arg << 16;
                continue;
            }
            self.tracer.op(&frame.body.name, op_offset, op);
            let flow = match self.step(frame, op, arg) {
                Ok(flow) => flow,
                Err(e) => {
                    exceptions::unwind(self, frame, e)?;
                    continue;
                }
            };
            match flow {
                Flow::Continue => {}
                Flow::Return(v) => {
                    frame.retslot = RetSlot::Return;
                    frame.truncate_stack(0, &mut self.pool);
                    return Ok(v);
                }
                Flow::Yield(v) => {
                    frame.retslot = RetSlot::Yield;
                    return Ok(v);
                }
            }
        }
    }

    #[expect(clippy::cast_possible_truncation, reason = "operand widths are fixed by the format")]
    fn step(&mut self, frame: &mut Frame, op: Opcode, arg: u32) -> RunResult<Flow> {
        match op {
            Opcode::StopCode | Opcode::ExecStmt | Opcode::BuildSet | Opcode::SetAdd => {
                return Err(ExcKind::OpcodeError.err(format!("unsupported opcode {op:?}")));
            }
            Opcode::Nop => {}
            Opcode::PopTop => {
                frame.pop()?.release(&mut self.pool);
            }
            Opcode::RotTwo => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a);
                frame.push(b);
            }
            Opcode::RotThree => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                let c = frame.pop()?;
                frame.push(a);
                frame.push(c);
                frame.push(b);
            }
            Opcode::RotFour => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                let c = frame.pop()?;
                let d = frame.pop()?;
                frame.push(a);
                frame.push(d);
                frame.push(c);
                frame.push(b);
            }
            Opcode::DupTop => {
                let v = frame.top()?.clone_with(&mut self.pool);
                frame.push(v);
            }
            Opcode::DupTopx => {
                let n = arg as usize;
                let mut copies = Vec::with_capacity(n);
                for i in (0..n).rev() {
                    copies.push(frame.peek(i)?.shallow());
                }
                for v in copies {
                    if let Value::Ref(id) = v {
                        self.pool.inc_ref(id);
                    }
                    frame.push(v);
                }
            }
            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryConvert
            | Opcode::UnaryInvert => binary::unary_op(self, frame, op)?,
            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr => binary::binary_op(self, frame, op, false)?,
            Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceDivide
            | Opcode::InplaceModulo
            | Opcode::InplacePower
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr => binary::binary_op(self, frame, op, true)?,
            Opcode::BinarySubscr => {
                let key = frame.pop()?;
                let container = frame.pop()?;
                let result = collections::subscr_get(self, &container, &key);
                key.release(&mut self.pool);
                container.release(&mut self.pool);
                frame.push(result?);
            }
            Opcode::StoreSubscr => {
                let key = frame.pop()?;
                let container = frame.pop()?;
                let value = frame.pop()?;
                let result = collections::subscr_set(self, &container, &key, value);
                key.release(&mut self.pool);
                container.release(&mut self.pool);
                result?;
            }
            Opcode::DeleteSubscr => {
                let key = frame.pop()?;
                let container = frame.pop()?;
                let result = collections::subscr_del(self, &container, &key);
                key.release(&mut self.pool);
                container.release(&mut self.pool);
                result?;
            }
            Opcode::SliceNone | Opcode::SliceLeft | Opcode::SliceRight | Opcode::SliceBoth => {
                collections::slice_get(self, frame, op)?;
            }
            Opcode::StoreSliceNone
            | Opcode::StoreSliceLeft
            | Opcode::StoreSliceRight
            | Opcode::StoreSliceBoth => collections::slice_store(self, frame, op)?,
            Opcode::DeleteSliceNone
            | Opcode::DeleteSliceLeft
            | Opcode::DeleteSliceRight
            | Opcode::DeleteSliceBoth => collections::slice_delete(self, frame, op)?,
            Opcode::StoreMap => {
                let key = frame.pop()?;
                let value = frame.pop()?;
                let dict = frame.top()?.shallow();
                let result = collections::subscr_set(self, &dict, &key, value);
                key.release(&mut self.pool);
                result?;
            }
            Opcode::MapAdd => {
                let key = frame.pop()?;
                let value = frame.pop()?;
                let dict = frame.peek(arg as usize - 1)?.shallow();
                let result = collections::subscr_set(self, &dict, &key, value);
                key.release(&mut self.pool);
                result?;
            }
            Opcode::GetIter => {
                let v = frame.pop()?;
                let iter = collections::get_iter(self, v)?;
                frame.push(iter);
            }
            Opcode::ForIter => {
                let iter = frame.top()?.shallow();
                match collections::iter_next(self, &iter)? {
                    Some(v) => frame.push(v),
                    None => {
                        frame.pop()?.release(&mut self.pool);
                        frame.ip += arg as usize;
                    }
                }
            }
            Opcode::PrintExpr => {
                let v = frame.pop()?;
                let text = v.py_repr(&self.pool);
                v.release(&mut self.pool);
                self.stdout.stdout_write(Cow::Owned(text));
                self.stdout.stdout_push('\n');
            }
            Opcode::PrintItem | Opcode::PrintItemTo => {
                if op == Opcode::PrintItemTo {
                    // the stream operand is not modelled; output goes to
                    // the configured writer
                    frame.pop()?.release(&mut self.pool);
                }
                let v = frame.pop()?;
                let text = v.py_str(&self.pool);
                v.release(&mut self.pool);
                if self.softspace {
                    self.stdout.stdout_push(' ');
                }
                self.stdout.stdout_write(Cow::Owned(text));
                self.softspace = true;
            }
            Opcode::PrintNewline | Opcode::PrintNewlineTo => {
                if op == Opcode::PrintNewlineTo {
                    frame.pop()?.release(&mut self.pool);
                }
                self.stdout.stdout_push('\n');
                self.softspace = false;
            }
            Opcode::BreakLoop => exceptions::do_break(self, frame)?,
            Opcode::ContinueLoop => exceptions::do_continue(self, frame, arg as usize)?,
            Opcode::WithCleanup => exceptions::with_cleanup(self, frame)?,
            Opcode::SetupWith => exceptions::setup_with(self, frame, arg as usize)?,
            Opcode::LoadLocals => match &frame.locals {
                LocalsSlot::Dict(id) => {
                    let id = *id;
                    self.pool.inc_ref(id);
                    frame.push(Value::Ref(id));
                }
                _ => {
                    return Err(ExcKind::OpcodeError.err("LOAD_LOCALS outside a class body"));
                }
            },
            Opcode::ReturnValue => {
                let v = frame.pop()?;
                return exceptions::do_return(self, frame, v);
            }
            Opcode::YieldValue => {
                let v = frame.pop()?;
                return Ok(Flow::Yield(v));
            }
            Opcode::ImportStar => {
                let module = frame.pop()?;
                let result = collections::import_star(self, frame, &module);
                module.release(&mut self.pool);
                result?;
            }
            Opcode::ImportName => {
                let name = frame.body.names[arg as usize].clone();
                let fromlist = frame.pop()?;
                let level = frame.pop()?;
                fromlist.release(&mut self.pool);
                level.release(&mut self.pool);
                let module = self.import_module(&name)?;
                frame.push(module);
            }
            Opcode::ImportFrom => {
                let name = &frame.body.names[arg as usize];
                let module = frame.top()?.shallow();
                let value = match &module {
                    Value::Ref(id) => match self.pool.get(*id) {
                        PoolData::Module(m) => m.globals.get(name).map(Value::shallow),
                        _ => None,
                    },
                    _ => None,
                };
                let v = value.ok_or_else(|| {
                    ExcKind::ImportError.err(format!("cannot import name {name}"))
                })?;
                if let Value::Ref(id) = v {
                    self.pool.inc_ref(id);
                }
                frame.push(v);
            }
            Opcode::PopBlock => {
                frame.pop_block(&mut self.pool)?;
            }
            Opcode::EndFinally => {
                if let Some(flow) = exceptions::end_finally(self, frame)? {
                    return Ok(flow);
                }
            }
            Opcode::SetupLoop => frame.push_block(BlockKind::Loop, frame.ip + arg as usize),
            Opcode::SetupExcept => frame.push_block(BlockKind::Except, frame.ip + arg as usize),
            Opcode::SetupFinally => frame.push_block(BlockKind::Finally, frame.ip + arg as usize),
            Opcode::RaiseVarargs => return exceptions::do_raise(self, frame, arg),
            Opcode::BuildClass => call::build_class(self, frame)?,
            Opcode::LoadConst => {
                let v = match self.pool.get(frame.code_id) {
                    PoolData::Code(c) => c.consts.get(arg as usize).map(Value::shallow),
                    _ => None,
                };
                let v =
                    v.ok_or_else(|| ExcKind::OpcodeError.err("constant index out of range"))?;
                if let Value::Ref(id) = v {
                    self.pool.inc_ref(id);
                }
                frame.push(v);
            }
            Opcode::LoadName => {
                let name = &frame.body.names[arg as usize];
                let v = self.load_name(frame, name)?;
                frame.push(v);
            }
            Opcode::StoreName => {
                let name = frame.body.names[arg as usize].clone();
                let v = frame.pop()?;
                self.store_name(frame, &name, v)?;
            }
            Opcode::DeleteName => {
                let name = frame.body.names[arg as usize].clone();
                self.delete_name(frame, &name)?;
            }
            Opcode::LoadGlobal => {
                let name = &frame.body.names[arg as usize];
                let v = self.load_global(frame.module, name)?;
                frame.push(v);
            }
            Opcode::StoreGlobal => {
                let name = frame.body.names[arg as usize].clone();
                let v = frame.pop()?;
                let old = match self.pool.get_mut(frame.module) {
                    PoolData::Module(m) => m.globals.insert(name, v),
                    _ => None,
                };
                if let Some(old) = old {
                    old.release(&mut self.pool);
                }
            }
            Opcode::DeleteGlobal => {
                let name = &frame.body.names[arg as usize];
                let removed = match self.pool.get_mut(frame.module) {
                    PoolData::Module(m) => m.globals.remove(name),
                    _ => None,
                };
                match removed {
                    Some(v) => v.release(&mut self.pool),
                    None => {
                        return Err(
                            ExcKind::NameError.err(format!("name '{name}' is not defined"))
                        );
                    }
                }
            }
            Opcode::LoadFast => {
                let v = frame
                    .fast
                    .get(arg as usize)
                    .and_then(|slot| slot.as_ref())
                    .map(Value::shallow)
                    .ok_or_else(|| {
                        let name = frame
                            .body
                            .varnames
                            .get(arg as usize)
                            .map_or("?", String::as_str);
                        ExcKind::NameError
                            .err(format!("local variable '{name}' referenced before assignment"))
                    })?;
                if let Value::Ref(id) = v {
                    self.pool.inc_ref(id);
                }
                frame.push(v);
            }
            Opcode::StoreFast => {
                let v = frame.pop()?;
                let slot = frame
                    .fast
                    .get_mut(arg as usize)
                    .ok_or_else(|| ExcKind::OpcodeError.err("fast-local index out of range"))?;
                if let Some(old) = slot.replace(v) {
                    old.release(&mut self.pool);
                }
            }
            Opcode::DeleteFast => {
                let slot = frame
                    .fast
                    .get_mut(arg as usize)
                    .ok_or_else(|| ExcKind::OpcodeError.err("fast-local index out of range"))?;
                match slot.take() {
                    Some(v) => v.release(&mut self.pool),
                    None => {
                        let name = frame
                            .body
                            .varnames
                            .get(arg as usize)
                            .map_or("?", String::as_str);
                        return Err(ExcKind::NameError
                            .err(format!("local variable '{name}' referenced before assignment")));
                    }
                }
            }
            Opcode::LoadClosure => {
                let id = *frame
                    .cells
                    .get(arg as usize)
                    .ok_or_else(|| ExcKind::OpcodeError.err("cell index out of range"))?;
                self.pool.inc_ref(id);
                frame.push(Value::Ref(id));
            }
            Opcode::LoadDeref => {
                let id = *frame
                    .cells
                    .get(arg as usize)
                    .ok_or_else(|| ExcKind::OpcodeError.err("cell index out of range"))?;
                let v = match self.pool.get(id) {
                    PoolData::Cell(v) => v.shallow(),
                    _ => return Err(ExcKind::OpcodeError.err("cell slot holds a non-cell")),
                };
                if let Value::Ref(rid) = v {
                    self.pool.inc_ref(rid);
                }
                frame.push(v);
            }
            Opcode::StoreDeref => {
                let v = frame.pop()?;
                let id = *frame
                    .cells
                    .get(arg as usize)
                    .ok_or_else(|| ExcKind::OpcodeError.err("cell index out of range"))?;
                let old = match self.pool.get_mut(id) {
                    PoolData::Cell(slot) => std::mem::replace(slot, v),
                    _ => return Err(ExcKind::OpcodeError.err("cell slot holds a non-cell")),
                };
                old.release(&mut self.pool);
            }
            Opcode::BuildTuple | Opcode::BuildList => {
                let n = arg as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(frame.pop()?);
                }
                items.reverse();
                let v = if op == Opcode::BuildTuple {
                    self.alloc(PoolData::Tuple(Tuple::new(items)))
                } else {
                    self.alloc(PoolData::List(List::new(items)))
                };
                frame.push(v);
            }
            Opcode::BuildMap => {
                let v = self.alloc(PoolData::Dict(Dict::with_capacity(arg as usize)));
                frame.push(v);
            }
            Opcode::BuildSlice => {
                let count = arg as usize;
                let step = if count == 3 { Some(frame.pop()?) } else { None };
                let stop = frame.pop()?;
                let start = frame.pop()?;
                let bound = |v: &Value| match v {
                    Value::None => Ok(None),
                    other => other.as_int().map(Some).ok_or_else(|| {
                        ExcKind::TypeError.err("slice indices must be integers or None")
                    }),
                };
                let slice = Slice::new(
                    bound(&start)?,
                    bound(&stop)?,
                    step.as_ref().map(&bound).transpose()?.flatten(),
                );
                start.release(&mut self.pool);
                stop.release(&mut self.pool);
                if let Some(s) = step {
                    s.release(&mut self.pool);
                }
                let v = self.alloc(PoolData::Slice(slice));
                frame.push(v);
            }
            Opcode::UnpackSequence => collections::unpack_sequence(self, frame, arg as usize)?,
            Opcode::ListAppend => {
                let v = frame.pop()?;
                let list = frame.peek(arg as usize - 1)?.shallow();
                collections::list_append(self, &list, v)?;
            }
            Opcode::LoadAttr => {
                let name = frame.body.names[arg as usize].clone();
                let obj = frame.pop()?;
                let result = attr::load_attr(self, &obj, &name);
                obj.release(&mut self.pool);
                frame.push(result?);
            }
            Opcode::StoreAttr => {
                let name = frame.body.names[arg as usize].clone();
                let obj = frame.pop()?;
                let value = frame.pop()?;
                let result = attr::store_attr(self, &obj, &name, value);
                obj.release(&mut self.pool);
                result?;
            }
            Opcode::DeleteAttr => {
                let name = frame.body.names[arg as usize].clone();
                let obj = frame.pop()?;
                let result = attr::delete_attr(self, &obj, &name);
                obj.release(&mut self.pool);
                result?;
            }
            Opcode::CompareOp => {
                let kind = CompareKind::try_from(arg as u8)
                    .map_err(|_| ExcKind::OpcodeError.err("bad comparison operand"))?;
                compare::compare_op(self, frame, kind)?;
            }
            Opcode::JumpForward => frame.ip += arg as usize,
            Opcode::JumpAbsolute => frame.ip = arg as usize,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let v = frame.pop()?;
                let truth = v.truthy(&self.pool);
                v.release(&mut self.pool);
                if truth == (op == Opcode::PopJumpIfTrue) {
                    frame.ip = arg as usize;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let truth = frame.top()?.truthy(&self.pool);
                if truth == (op == Opcode::JumpIfTrueOrPop) {
                    frame.ip = arg as usize;
                } else {
                    frame.pop()?.release(&mut self.pool);
                }
            }
            Opcode::MakeFunction => call::make_function(self, frame, arg as usize, false)?,
            Opcode::MakeClosure => call::make_function(self, frame, arg as usize, true)?,
            Opcode::CallFunction => {
                call::call_from_stack(self, frame, arg, false, false)?;
            }
            Opcode::CallFunctionVar => {
                call::call_from_stack(self, frame, arg, true, false)?;
            }
            Opcode::CallFunctionKw => {
                call::call_from_stack(self, frame, arg, false, true)?;
            }
            Opcode::CallFunctionVarKw => {
                call::call_from_stack(self, frame, arg, true, true)?;
            }
            Opcode::ExtendedArg => unreachable!("handled by the fetch loop"),
        }
        Ok(Flow::Continue)
    }

    /// `LOAD_NAME`: locals, then globals, then builtins.
    fn load_name(&mut self, frame: &Frame, name: &str) -> RunResult<Value> {
        let local = match &frame.locals {
            LocalsSlot::Dict(id) => match self.pool.get(*id) {
                PoolData::StrDict(d) => d.map.get(name).map(Value::shallow),
                _ => None,
            },
            LocalsSlot::Globals | LocalsSlot::Fast => None,
        };
        if let Some(v) = local {
            if let Value::Ref(id) = v {
                self.pool.inc_ref(id);
            }
            return Ok(v);
        }
        self.load_global(frame.module, name)
    }

    /// `LOAD_GLOBAL`: module globals with fallback to builtins.
    pub(crate) fn load_global(&mut self, module: PoolId, name: &str) -> RunResult<Value> {
        let found = match self.pool.get(module) {
            PoolData::Module(m) => m.globals.get(name).map(Value::shallow),
            _ => None,
        };
        let found = found.or_else(|| self.builtins.get(name).map(Value::shallow));
        let v = found.ok_or_else(|| ExcKind::NameError.err(format!("name '{name}' is not defined")))?;
        if let Value::Ref(id) = v {
            self.pool.inc_ref(id);
        }
        Ok(v)
    }

    fn store_name(&mut self, frame: &Frame, name: &str, v: Value) -> RunResult<()> {
        let old = match &frame.locals {
            LocalsSlot::Dict(id) => match self.pool.get_mut(*id) {
                PoolData::StrDict(d) => d.map.insert(name.to_owned(), v),
                _ => return Err(ExcKind::OpcodeError.err("locals slot holds a non-dict")),
            },
            LocalsSlot::Globals | LocalsSlot::Fast => match self.pool.get_mut(frame.module) {
                PoolData::Module(m) => m.globals.insert(name.to_owned(), v),
                _ => return Err(ExcKind::OpcodeError.err("module slot holds a non-module")),
            },
        };
        if let Some(old) = old {
            old.release(&mut self.pool);
        }
        Ok(())
    }

    fn delete_name(&mut self, frame: &Frame, name: &str) -> RunResult<()> {
        let removed = match &frame.locals {
            LocalsSlot::Dict(id) => match self.pool.get_mut(*id) {
                PoolData::StrDict(d) => d.map.remove(name),
                _ => None,
            },
            LocalsSlot::Globals | LocalsSlot::Fast => match self.pool.get_mut(frame.module) {
                PoolData::Module(m) => m.globals.remove(name),
                _ => None,
            },
        };
        match removed {
            Some(v) => {
                v.release(&mut self.pool);
                Ok(())
            }
            None => Err(ExcKind::NameError.err(format!("name '{name}' is not defined"))),
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // The pool owns all object data; drop it wholesale.
        self.pool.clear_all();
    }
}
