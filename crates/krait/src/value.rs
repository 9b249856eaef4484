//! Primary value type representing script objects at runtime.
//!
//! This enum uses a hybrid design: small immediate values (None, Bool, Int,
//! Float and builtin callables) are stored inline, while everything else
//! lives in the object pool and is referenced via `Ref(PoolId)`.
//!
//! NOTE: `Clone` is intentionally NOT derived. Use [`Value::clone_with`] so
//! the pool reference count stays correct, and [`Value::release`] when a
//! value is discarded. A plain bit copy is available as [`Value::shallow`]
//! for the two-phase borrow dance inside pool-managed operations; callers
//! of `shallow` own the follow-up `inc_ref`.

use std::cmp::Ordering;
use std::fmt::Write;

use crate::{
    builtins::Builtin,
    pool::{Pool, PoolData, PoolId},
    types::str_repr_into,
};

/// Cap on recursion through nested containers for repr/eq; self-referential
/// structures fall back to identity beyond it.
const MAX_DATA_DEPTH: usize = 64;

#[derive(Debug)]
pub(crate) enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A builtin function or exception type. Immediate so that builtins can
    /// be looked up without touching the pool.
    Builtin(Builtin),
    /// A pool-allocated object.
    Ref(PoolId),
}

impl Value {
    /// Copies the value, incrementing the pool reference count for refs.
    #[must_use]
    pub fn clone_with(&self, pool: &mut Pool) -> Self {
        if let Self::Ref(id) = self {
            pool.inc_ref(*id);
        }
        self.shallow()
    }

    /// Bit copy without touching reference counts. The caller is
    /// responsible for pairing it with an `inc_ref` (or treating the copy
    /// as a borrow that never outlives the original).
    #[must_use]
    pub fn shallow(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(i) => Self::Int(*i),
            Self::Float(f) => Self::Float(*f),
            Self::Builtin(b) => Self::Builtin(*b),
            Self::Ref(id) => Self::Ref(*id),
        }
    }

    /// Discards the value, releasing its pool reference if it holds one.
    pub fn release(self, pool: &mut Pool) {
        if let Self::Ref(id) = self {
            pool.dec_ref(id);
        }
    }

    /// Appends this value's pool reference (if any) to `out`.
    pub fn push_ref(&self, out: &mut Vec<PoolId>) {
        if let Self::Ref(id) = self {
            out.push(*id);
        }
    }

    #[inline]
    pub fn id(&self) -> Option<PoolId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Identity comparison, the `is` operator. Immediates compare by value
    /// (the singletons None/True/False are each unique by construction),
    /// refs by pool slot.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// Runtime type name, matching CPython 2 spellings where it has one.
    #[must_use]
    pub fn type_name(&self, pool: &Pool) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Builtin(b) => b.type_name(),
            Self::Ref(id) => pool.get(*id).variant_name(),
        }
    }

    /// Numeric view for arithmetic promotion: ints and bools as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Float view: accepts Int, Bool, and Float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Truth value, Python semantics: zero, empty and None are false.
    #[must_use]
    pub fn truthy(&self, pool: &Pool) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Builtin(_) => true,
            Self::Ref(id) => match pool.get(*id) {
                PoolData::Str(s) => !s.is_empty(),
                PoolData::UStr(u) => !u.is_empty(),
                PoolData::List(l) => !l.items.is_empty(),
                PoolData::Tuple(t) => !t.items.is_empty(),
                PoolData::Dict(d) => d.len() != 0,
                PoolData::StrDict(d) => !d.map.is_empty(),
                PoolData::XRange(r) => !r.is_empty(),
                _ => true,
            },
        }
    }

    /// Value equality, the `==` operator. Numbers compare across Int/Bool/
    /// Float; narrow and wide strings compare by widening; sequences
    /// compare elementwise within their own type.
    #[must_use]
    pub fn py_eq(&self, other: &Self, pool: &Pool) -> bool {
        eq_at_depth(self, other, pool, 0)
    }

    /// Ordering for `<`/`<=`/`>`/`>=`. `None` when the variants are not
    /// order-comparable.
    #[must_use]
    pub fn py_cmp(&self, other: &Self, pool: &Pool) -> Option<Ordering> {
        cmp_at_depth(self, other, pool, 0)
    }

    /// `repr()` of the value.
    #[must_use]
    pub fn py_repr(&self, pool: &Pool) -> String {
        let mut out = String::new();
        fmt_value(self, pool, &mut out, true, 0);
        out
    }

    /// `str()` of the value. Differs from repr only for strings, which
    /// render without quotes, and for exception instances.
    #[must_use]
    pub fn py_str(&self, pool: &Pool) -> String {
        let mut out = String::new();
        fmt_value(self, pool, &mut out, false, 0);
        out
    }
}

fn eq_at_depth(a: &Value, b: &Value, pool: &Pool, depth: usize) -> bool {
    if depth > MAX_DATA_DEPTH {
        return a.is_same(b);
    }
    if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
        return x == y;
    }
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Ref(x), Value::Ref(y)) => {
            if x == y {
                return true;
            }
            match (pool.get(*x), pool.get(*y)) {
                (PoolData::Str(s), PoolData::Str(t)) => s.bytes() == t.bytes(),
                (PoolData::UStr(s), PoolData::UStr(t)) => s.chars() == t.chars(),
                (PoolData::Str(s), PoolData::UStr(t)) | (PoolData::UStr(t), PoolData::Str(s)) => {
                    s.bytes().len() == t.chars().len()
                        && s.bytes()
                            .iter()
                            .zip(t.chars())
                            .all(|(&b, &w)| u16::from(b) == w)
                }
                (PoolData::List(s), PoolData::List(t)) => {
                    seq_eq(&s.items, &t.items, pool, depth)
                }
                (PoolData::Tuple(s), PoolData::Tuple(t)) => {
                    seq_eq(&s.items, &t.items, pool, depth)
                }
                (PoolData::Dict(s), PoolData::Dict(t)) => s.entries_eq(t, pool, depth),
                (PoolData::StrDict(s), PoolData::StrDict(t)) => {
                    s.map.len() == t.map.len()
                        && s.map.iter().all(|(k, v)| {
                            t.map.get(k).is_some_and(|w| eq_at_depth(v, w, pool, depth + 1))
                        })
                }
                _ => false,
            }
        }
        _ => false,
    }
}

fn seq_eq(a: &[Value], b: &[Value], pool: &Pool, depth: usize) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| eq_at_depth(x, y, pool, depth + 1))
}

fn cmp_at_depth(a: &Value, b: &Value, pool: &Pool, depth: usize) -> Option<Ordering> {
    if depth > MAX_DATA_DEPTH {
        return None;
    }
    if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::Ref(x), Value::Ref(y)) => match (pool.get(*x), pool.get(*y)) {
            (PoolData::Str(s), PoolData::Str(t)) => Some(s.bytes().cmp(t.bytes())),
            (PoolData::UStr(s), PoolData::UStr(t)) => Some(s.chars().cmp(t.chars())),
            (PoolData::List(s), PoolData::List(t)) => seq_cmp(&s.items, &t.items, pool, depth),
            (PoolData::Tuple(s), PoolData::Tuple(t)) => seq_cmp(&s.items, &t.items, pool, depth),
            _ => None,
        },
        _ => None,
    }
}

fn seq_cmp(a: &[Value], b: &[Value], pool: &Pool, depth: usize) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if eq_at_depth(x, y, pool, depth + 1) {
            continue;
        }
        return cmp_at_depth(x, y, pool, depth + 1);
    }
    Some(a.len().cmp(&b.len()))
}

/// Formats a float the way Python prints it: integral values keep a
/// trailing `.0`, everything else uses the shortest round-tripping form.
pub(crate) fn fmt_float(f: f64, out: &mut String) {
    if f.is_nan() {
        out.push_str("nan");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "inf" } else { "-inf" });
    } else {
        let mut buf = ryu::Buffer::new();
        out.push_str(buf.format(f));
    }
}

fn fmt_value(v: &Value, pool: &Pool, out: &mut String, repr: bool, depth: usize) {
    if depth > MAX_DATA_DEPTH {
        out.push_str("...");
        return;
    }
    match v {
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => fmt_float(*f, out),
        Value::Builtin(b) => {
            let _ = write!(out, "<built-in {}>", b.name());
        }
        Value::Ref(id) => fmt_pool_value(*id, pool, out, repr, depth),
    }
}

fn fmt_pool_value(id: PoolId, pool: &Pool, out: &mut String, repr: bool, depth: usize) {
    match pool.get(id) {
        PoolData::Str(s) => {
            if repr {
                str_repr_into(s.bytes(), out);
            } else {
                out.push_str(&String::from_utf8_lossy(s.bytes()));
            }
        }
        PoolData::UStr(u) => {
            if repr {
                out.push('u');
                let narrowed: Vec<u8> =
                    u.chars().iter().map(|&c| u8::try_from(c).unwrap_or(b'?')).collect();
                str_repr_into(&narrowed, out);
            } else {
                out.push_str(&String::from_utf16_lossy(u.chars()));
            }
        }
        PoolData::List(l) => {
            out.push('[');
            for (i, item) in l.items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                fmt_value(item, pool, out, true, depth + 1);
            }
            out.push(']');
        }
        PoolData::Tuple(t) => {
            out.push('(');
            for (i, item) in t.items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                fmt_value(item, pool, out, true, depth + 1);
            }
            if t.items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        PoolData::Dict(d) => {
            out.push('{');
            for (i, (k, v)) in d.iter_entries().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                fmt_value(k, pool, out, true, depth + 1);
                out.push_str(": ");
                fmt_value(v, pool, out, true, depth + 1);
            }
            out.push('}');
        }
        PoolData::StrDict(d) => {
            out.push('{');
            for (i, (k, v)) in d.map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                str_repr_into(k.as_bytes(), out);
                out.push_str(": ");
                fmt_value(v, pool, out, true, depth + 1);
            }
            out.push('}');
        }
        PoolData::Slice(s) => {
            let _ = write!(out, "{s}");
        }
        PoolData::Code(c) => {
            let _ = write!(out, "<code object {}>", c.body.name);
        }
        PoolData::Function(f) => {
            let name = match pool.get(f.code) {
                PoolData::Code(c) => c.body.name.as_str(),
                _ => "?",
            };
            let _ = write!(out, "<function {name}>");
        }
        PoolData::Method(_) => out.push_str("<bound method>"),
        PoolData::Class(c) => {
            let _ = write!(out, "<class {}>", c.name);
        }
        PoolData::Instance(i) => {
            let class_name = match pool.get(i.class) {
                PoolData::Class(c) => c.name.as_str(),
                _ => "?",
            };
            let _ = write!(out, "<{class_name} instance>");
        }
        PoolData::Module(m) => {
            let _ = write!(out, "<module '{}'>", m.name);
        }
        PoolData::Generator(_) => out.push_str("<generator object>"),
        PoolData::XRange(r) => {
            let _ = write!(out, "{r}");
        }
        PoolData::Iter(_) => out.push_str("<iterator>"),
        PoolData::Cell(_) => out.push_str("<cell>"),
        PoolData::Exception(e) => {
            if repr {
                let _ = write!(out, "{}({:?})", e.kind, e.message);
            } else {
                out.push_str(&e.message);
            }
        }
        PoolData::CFunc(f) => {
            let _ = write!(out, "<built-in function {}>", f.name);
        }
        PoolData::CInst(_) => out.push_str("<native instance>"),
        PoolData::CCtor(_) => out.push_str("<native constructor>"),
        PoolData::PrimitiveAdapter(p) => {
            let _ = write!(out, "<built-in method {}>", p.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{List, Str, Tuple};

    #[test]
    fn numeric_cross_type_equality() {
        let pool = Pool::new();
        assert!(Value::Int(1).py_eq(&Value::Float(1.0), &pool));
        assert!(Value::Bool(true).py_eq(&Value::Int(1), &pool));
        assert!(!Value::Int(1).py_eq(&Value::Float(1.5), &pool));
        assert!(!Value::None.py_eq(&Value::Int(0), &pool));
    }

    #[test]
    fn singleton_identity() {
        assert!(Value::None.is_same(&Value::None));
        assert!(Value::Bool(true).is_same(&Value::Bool(true)));
        assert!(!Value::Bool(true).is_same(&Value::Bool(false)));
        assert!(!Value::None.is_same(&Value::Bool(false)));
    }

    #[test]
    fn repr_of_containers() {
        let mut pool = Pool::new();
        let s = pool.add(PoolData::Str(Str::from_bytes(b"hi".to_vec())));
        let t = pool.add(PoolData::Tuple(Tuple::new(vec![Value::Int(1)])));
        let l = pool.add(PoolData::List(List::new(vec![
            Value::Int(3),
            Value::Ref(s),
            Value::Ref(t),
        ])));
        assert_eq!(Value::Ref(l).py_repr(&pool), "[3, 'hi', (1,)]");
        pool.dec_ref(l);
    }

    #[test]
    fn float_str_keeps_point() {
        let pool = Pool::new();
        assert_eq!(Value::Float(3.0).py_str(&pool), "3.0");
        assert_eq!(Value::Float(0.5).py_str(&pool), "0.5");
    }
}
