#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing mirrors the 2.7 runtime")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors CPython")]
#![expect(clippy::float_cmp, reason = "value equality requires exact float comparison")]
#![expect(clippy::unreadable_literal, reason = "hash constants keep canonical forms")]

mod bridge;
mod builtins;
mod exception;
mod frame;
mod io;
mod marshal;
mod object;
mod opcode;
mod pool;
mod py_hash;
mod resource;
mod tracer;
mod types;
mod value;
mod vm;

pub use crate::{
    bridge::{
        Bytes, CFunc, FromPy, IntoNativeFn, IntoNativeMethod, IntoPy, Kwargs, NativeClass, Rest,
        Shared, Variadic, WideString, WithKwargs,
    },
    exception::{ExcKind, Exception, StackFrame},
    io::{CollectStringPrint, PrintWriter, StdPrint},
    object::Object,
    opcode::Opcode,
    pool::PoolStats,
    resource::{DEFAULT_MAX_RECURSION_DEPTH, ResourceLimits},
    tracer::{NoopTracer, StderrTracer, VmTracer},
    vm::{Handle, ImportCallback, Vm},
};
