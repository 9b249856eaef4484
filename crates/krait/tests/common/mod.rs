//! Test support: builds `.pyc` images in-process.
//!
//! A small assembler emits CPython 2.7 bytecode (patch-up helpers for
//! forward jumps, constant/name pools, a line-number table) and the
//! marshal writer serialises the finished code objects exactly the way
//! CPython 2.7 would, so the loader sees authentic images.

#![expect(dead_code, reason = "each test binary drives its own subset of the fixture kit")]

use krait::{Exception, Vm};

/// CPython 2.7 opcode numbers used by the fixtures.
pub mod op {
    pub const POP_TOP: u8 = 1;
    pub const ROT_TWO: u8 = 2;
    pub const DUP_TOP: u8 = 4;
    pub const UNARY_NEGATIVE: u8 = 11;
    pub const BINARY_MULTIPLY: u8 = 20;
    pub const BINARY_DIVIDE: u8 = 21;
    pub const BINARY_MODULO: u8 = 22;
    pub const BINARY_ADD: u8 = 23;
    pub const BINARY_SUBTRACT: u8 = 24;
    pub const BINARY_SUBSCR: u8 = 25;
    pub const SLICE_NONE: u8 = 30;
    pub const SLICE_LEFT: u8 = 31;
    pub const SLICE_RIGHT: u8 = 32;
    pub const SLICE_BOTH: u8 = 33;
    pub const STORE_SUBSCR: u8 = 60;
    pub const INPLACE_ADD: u8 = 55;
    pub const GET_ITER: u8 = 68;
    pub const PRINT_ITEM: u8 = 71;
    pub const PRINT_NEWLINE: u8 = 72;
    pub const BREAK_LOOP: u8 = 80;
    pub const WITH_CLEANUP: u8 = 81;
    pub const LOAD_LOCALS: u8 = 82;
    pub const RETURN_VALUE: u8 = 83;
    pub const YIELD_VALUE: u8 = 86;
    pub const POP_BLOCK: u8 = 87;
    pub const END_FINALLY: u8 = 88;
    pub const BUILD_CLASS: u8 = 89;
    pub const STORE_NAME: u8 = 90;
    pub const STORE_GLOBAL: u8 = 97;
    pub const UNPACK_SEQUENCE: u8 = 92;
    pub const FOR_ITER: u8 = 93;
    pub const STORE_ATTR: u8 = 95;
    pub const LOAD_CONST: u8 = 100;
    pub const LOAD_NAME: u8 = 101;
    pub const BUILD_TUPLE: u8 = 102;
    pub const BUILD_LIST: u8 = 103;
    pub const BUILD_MAP: u8 = 105;
    pub const LOAD_ATTR: u8 = 106;
    pub const COMPARE_OP: u8 = 107;
    pub const IMPORT_NAME: u8 = 108;
    pub const IMPORT_FROM: u8 = 109;
    pub const JUMP_FORWARD: u8 = 110;
    pub const JUMP_ABSOLUTE: u8 = 113;
    pub const POP_JUMP_IF_FALSE: u8 = 114;
    pub const POP_JUMP_IF_TRUE: u8 = 115;
    pub const LOAD_GLOBAL: u8 = 116;
    pub const SETUP_LOOP: u8 = 120;
    pub const SETUP_EXCEPT: u8 = 121;
    pub const SETUP_FINALLY: u8 = 122;
    pub const LOAD_FAST: u8 = 124;
    pub const STORE_FAST: u8 = 125;
    pub const RAISE_VARARGS: u8 = 130;
    pub const CALL_FUNCTION: u8 = 131;
    pub const MAKE_FUNCTION: u8 = 132;
    pub const BUILD_SLICE: u8 = 133;
    pub const MAKE_CLOSURE: u8 = 134;
    pub const LOAD_CLOSURE: u8 = 135;
    pub const LOAD_DEREF: u8 = 136;
    pub const CALL_FUNCTION_VAR: u8 = 140;
    pub const CALL_FUNCTION_KW: u8 = 141;
    pub const SETUP_WITH: u8 = 143;
}

pub const CO_NEWLOCALS: u32 = 0x0002;
pub const CO_VARARGS: u32 = 0x0004;
pub const CO_VARKEYWORDS: u32 = 0x0008;
pub const CO_GENERATOR: u32 = 0x0020;

/// A constant in a code object's pool.
#[derive(Debug, Clone)]
pub enum K {
    None,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<K>),
    Code(Code),
}

impl K {
    pub fn s(text: &str) -> Self {
        Self::Str(text.to_owned())
    }
}

/// A finished code object ready to marshal.
#[derive(Debug, Clone)]
pub struct Code {
    pub name: String,
    pub argcount: u32,
    pub nlocals: u32,
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    pub names: Vec<String>,
    pub consts: Vec<K>,
    pub code: Vec<u8>,
    pub filename: String,
    pub firstlineno: u32,
    pub lnotab: Vec<u8>,
    pub stacksize: u32,
    pub flags: u32,
}

/// Bytecode assembler in emit/patch style.
#[derive(Debug)]
pub struct Asm {
    code: Code,
    last_line_offset: usize,
    last_line: u32,
}

impl Asm {
    /// A function body: fast locals, the named arguments pre-declared.
    pub fn function(name: &str, args: &[&str]) -> Self {
        Self {
            code: Code {
                name: name.to_owned(),
                argcount: args.len() as u32,
                nlocals: args.len() as u32,
                varnames: args.iter().map(|&a| a.to_owned()).collect(),
                cellvars: Vec::new(),
                freevars: Vec::new(),
                names: Vec::new(),
                consts: Vec::new(),
                code: Vec::new(),
                filename: "m.py".to_owned(),
                firstlineno: 1,
                lnotab: Vec::new(),
                stacksize: 16,
                flags: CO_NEWLOCALS,
            },
            last_line_offset: 0,
            last_line: 1,
        }
    }

    /// A module or class body: name stores go through the locals dict.
    pub fn body(name: &str, filename: &str) -> Self {
        let mut asm = Self::function(name, &[]);
        asm.code.flags = 0;
        asm.code.filename = filename.to_owned();
        asm
    }

    pub fn generator(name: &str, args: &[&str]) -> Self {
        let mut asm = Self::function(name, args);
        asm.code.flags |= CO_GENERATOR;
        asm
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.code.flags |= flags;
        self
    }

    pub fn first_line(mut self, line: u32) -> Self {
        self.code.firstlineno = line;
        self.last_line = line;
        self
    }

    /// Records that the next instruction starts `line`.
    pub fn line(&mut self, line: u32) {
        let byte_delta = self.code.code.len() - self.last_line_offset;
        let line_delta = line - self.last_line;
        self.code.lnotab.push(byte_delta as u8);
        self.code.lnotab.push(line_delta as u8);
        self.last_line_offset = self.code.code.len();
        self.last_line = line;
    }

    pub fn konst(&mut self, k: K) -> u16 {
        self.code.consts.push(k);
        (self.code.consts.len() - 1) as u16
    }

    pub fn name_idx(&mut self, name: &str) -> u16 {
        if let Some(i) = self.code.names.iter().position(|n| n == name) {
            return i as u16;
        }
        self.code.names.push(name.to_owned());
        (self.code.names.len() - 1) as u16
    }

    pub fn var_idx(&mut self, name: &str) -> u16 {
        if let Some(i) = self.code.varnames.iter().position(|n| n == name) {
            return i as u16;
        }
        self.code.varnames.push(name.to_owned());
        self.code.nlocals += 1;
        (self.code.varnames.len() - 1) as u16
    }

    pub fn cell(&mut self, name: &str) -> u16 {
        self.code.cellvars.push(name.to_owned());
        (self.code.cellvars.len() - 1) as u16
    }

    pub fn freevar(&mut self, name: &str) -> u16 {
        self.code.freevars.push(name.to_owned());
        (self.code.cellvars.len() + self.code.freevars.len() - 1) as u16
    }

    pub fn emit(&mut self, opcode: u8) {
        self.code.code.push(opcode);
    }

    pub fn emit_arg(&mut self, opcode: u8, arg: u16) {
        self.code.code.push(opcode);
        self.code.code.extend_from_slice(&arg.to_le_bytes());
    }

    pub fn here(&self) -> usize {
        self.code.code.len()
    }

    /// Emits a jump with a placeholder operand; patch with
    /// [`Asm::patch_rel`] or [`Asm::patch_abs`].
    pub fn jump(&mut self, opcode: u8) -> usize {
        let at = self.here();
        self.emit_arg(opcode, 0xffff);
        at
    }

    /// Points a relative jump emitted at `at` to the current position.
    pub fn patch_rel(&mut self, at: usize) {
        let delta = (self.here() - (at + 3)) as u16;
        self.code.code[at + 1..at + 3].copy_from_slice(&delta.to_le_bytes());
    }

    /// Points an absolute jump emitted at `at` to the current position.
    pub fn patch_abs(&mut self, at: usize) {
        let target = self.here() as u16;
        self.code.code[at + 1..at + 3].copy_from_slice(&target.to_le_bytes());
    }

    // --- sugar ---

    pub fn load_const(&mut self, k: K) {
        let i = self.konst(k);
        self.emit_arg(op::LOAD_CONST, i);
    }

    pub fn load_fast(&mut self, name: &str) {
        let i = self.var_idx(name);
        self.emit_arg(op::LOAD_FAST, i);
    }

    pub fn store_fast(&mut self, name: &str) {
        let i = self.var_idx(name);
        self.emit_arg(op::STORE_FAST, i);
    }

    pub fn load_name(&mut self, name: &str) {
        let i = self.name_idx(name);
        self.emit_arg(op::LOAD_NAME, i);
    }

    pub fn store_name(&mut self, name: &str) {
        let i = self.name_idx(name);
        self.emit_arg(op::STORE_NAME, i);
    }

    pub fn load_global(&mut self, name: &str) {
        let i = self.name_idx(name);
        self.emit_arg(op::LOAD_GLOBAL, i);
    }

    pub fn load_attr(&mut self, name: &str) {
        let i = self.name_idx(name);
        self.emit_arg(op::LOAD_ATTR, i);
    }

    pub fn store_attr(&mut self, name: &str) {
        let i = self.name_idx(name);
        self.emit_arg(op::STORE_ATTR, i);
    }

    pub fn call(&mut self, positional: u8) {
        self.emit_arg(op::CALL_FUNCTION, u16::from(positional));
    }

    pub fn ret(&mut self) {
        self.emit(op::RETURN_VALUE);
    }

    pub fn ret_none(&mut self) {
        self.load_const(K::None);
        self.ret();
    }

    /// Emits `def <name>` boilerplate: the code constant, MAKE_FUNCTION,
    /// and a name store.
    pub fn def(&mut self, func: Code) {
        let fname = func.name.clone();
        self.load_const(K::Code(func));
        self.emit_arg(op::MAKE_FUNCTION, 0);
        self.store_name(&fname);
    }

    pub fn finish(self) -> Code {
        self.code
    }
}

// --- marshal writer ---

fn w_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w_str(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    out.push(tag);
    w_i32(out, bytes.len() as i32);
    out.extend_from_slice(bytes);
}

fn w_const(out: &mut Vec<u8>, k: &K) {
    match k {
        K::None => out.push(b'N'),
        K::True => out.push(b'T'),
        K::False => out.push(b'F'),
        K::Int(v) => {
            if let Ok(small) = i32::try_from(*v) {
                out.push(b'i');
                w_i32(out, small);
            } else {
                out.push(b'I');
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        K::Float(v) => {
            out.push(b'g');
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        K::Str(s) => w_str(out, b's', s.as_bytes()),
        K::Tuple(items) => {
            out.push(b'(');
            w_i32(out, items.len() as i32);
            for item in items {
                w_const(out, item);
            }
        }
        K::Code(code) => w_code(out, code),
    }
}

fn w_name_tuple(out: &mut Vec<u8>, names: &[String]) {
    out.push(b'(');
    w_i32(out, names.len() as i32);
    for name in names {
        // intern tags exercise the loader's back-reference table lightly
        w_str(out, b't', name.as_bytes());
    }
}

fn w_code(out: &mut Vec<u8>, code: &Code) {
    out.push(b'c');
    w_i32(out, code.argcount as i32);
    w_i32(out, code.nlocals as i32);
    w_i32(out, code.stacksize as i32);
    w_i32(out, code.flags as i32);
    w_str(out, b's', &code.code);
    out.push(b'(');
    w_i32(out, code.consts.len() as i32);
    for k in &code.consts {
        w_const(out, k);
    }
    w_name_tuple(out, &code.names);
    w_name_tuple(out, &code.varnames);
    w_name_tuple(out, &code.freevars);
    w_name_tuple(out, &code.cellvars);
    w_str(out, b's', code.filename.as_bytes());
    w_str(out, b's', code.name.as_bytes());
    w_i32(out, code.firstlineno as i32);
    w_str(out, b's', &code.lnotab);
}

/// Serialises a module code object into a `.pyc` image.
pub fn marshal_pyc(module: &Code, with_header: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if with_header {
        out.extend_from_slice(&[0x03, 0xf3, 0x0d, 0x0a]); // 2.7 magic
        out.extend_from_slice(&[0, 0, 0, 0]); // timestamp
    }
    w_code(&mut out, module);
    out
}

/// A VM with `module` imported under `name`.
pub fn vm_with_module(name: &str, module: &Code) -> Vm {
    let mut vm = Vm::new();
    import_into(&mut vm, name, module).expect("fixture module must load");
    vm
}

pub fn import_into(vm: &mut Vm, name: &str, module: &Code) -> Result<(), Exception> {
    vm.import_pyc_buf(name, &marshal_pyc(module, true), true)
}
