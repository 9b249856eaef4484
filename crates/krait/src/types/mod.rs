//! Runtime type implementations backing the pool variants.

pub(crate) mod class;
pub(crate) mod code;
pub(crate) mod dict;
pub(crate) mod iter;
pub(crate) mod list;
pub(crate) mod module;
pub(crate) mod range;
pub(crate) mod slice;
pub(crate) mod str;

mod generator;

pub(crate) use class::{Class, Function, Instance, Method, PrimitiveAdapter};
pub(crate) use code::{CO_GENERATOR, CO_NEWLOCALS, CO_VARARGS, CO_VARKEYWORDS, Code, CodeBody};
pub(crate) use dict::{Dict, HKey, StrDict};
pub(crate) use generator::{GenState, Generator};
pub(crate) use iter::Iter;
pub(crate) use list::{List, Tuple};
pub(crate) use module::Module;
pub(crate) use range::XRange;
pub(crate) use slice::Slice;
pub(crate) use str::{Str, UStr, str_repr_into};
