//! Builtin functions and exception types.
//!
//! Builtins are immediate values: a [`Builtin`] is either a builtin
//! function or an exception type, both callable. The VM seeds its
//! builtins dict with every variant at construction, and `LOAD_GLOBAL`
//! falls back to that dict when a name is not in module globals.

use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    exception::{ExcKind, RunResult, SimpleException},
    pool::PoolData,
    types::{List, Str, UStr, XRange},
    value::Value,
    vm::{CallArgs, Vm},
};

/// Builtin functions exposed to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum BuiltinFn {
    Len,
    Range,
    Xrange,
    Str,
    Unicode,
    Int,
    Float,
    Bool,
    Abs,
    Min,
    Max,
    Ord,
    Chr,
    Repr,
    Isinstance,
    Hasattr,
    Getattr,
    Setattr,
    Iter,
    Type,
}

/// A builtin callable: function or exception type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Func(BuiltinFn),
    Exc(ExcKind),
}

impl Builtin {
    /// Script-visible name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Func(f) => f.into(),
            Self::Exc(k) => k.into(),
        }
    }

    /// Type name of the builtin value itself.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Func(_) => "builtin_function_or_method",
            Self::Exc(_) => "type",
        }
    }

    /// Stable small integer for identity hashing.
    #[must_use]
    pub fn ordinal(self) -> i64 {
        match self {
            Self::Func(f) => f as i64,
            Self::Exc(k) => 1000 + k as i64,
        }
    }

    /// Every builtin paired with its name, for seeding the builtins dict.
    pub fn all() -> impl Iterator<Item = (&'static str, Self)> {
        let funcs = BuiltinFn::iter().map(|f| (f.into(), Self::Func(f)));
        let excs = ExcKind::iter()
            .filter(|k| !matches!(k, ExcKind::DeserializeError | ExcKind::OpcodeError))
            .map(|k| (k.into(), Self::Exc(k)));
        funcs.chain(excs)
    }
}

/// Calls a builtin with the given arguments.
pub(crate) fn call_builtin(vm: &mut Vm, builtin: Builtin, args: CallArgs) -> RunResult<Value> {
    match builtin {
        Builtin::Exc(kind) => call_exc_type(vm, kind, args),
        Builtin::Func(f) => call_builtin_fn(vm, f, args),
    }
}

/// Calling an exception type constructs an exception instance.
fn call_exc_type(vm: &mut Vm, kind: ExcKind, args: CallArgs) -> RunResult<Value> {
    let message = match args.pos_len() {
        0 => String::new(),
        _ => args.peek_pos(0).py_str(&vm.pool),
    };
    args.release(&mut vm.pool);
    Ok(vm.alloc(PoolData::Exception(SimpleException::new(kind, message))))
}

fn call_builtin_fn(vm: &mut Vm, f: BuiltinFn, args: CallArgs) -> RunResult<Value> {
    let name: &'static str = f.into();
    match f {
        BuiltinFn::Len => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let len = vm.value_len(&v);
            let type_name = v.type_name(&vm.pool);
            v.release(&mut vm.pool);
            len.map(|n| Value::Int(n as i64)).ok_or_else(|| {
                ExcKind::TypeError.err(format!("object of type '{type_name}' has no len()"))
            })
        }
        BuiltinFn::Range | BuiltinFn::Xrange => {
            let (start, stop, step) = range_args(vm, name, args)?;
            if step == 0 {
                return Err(ExcKind::ValueError.err(format!("{name}() arg 3 must not be zero")));
            }
            if f == BuiltinFn::Xrange {
                Ok(vm.alloc(PoolData::XRange(XRange::new(start, stop, step))))
            } else {
                let mut r = XRange::new(start, stop, step);
                let mut items = Vec::with_capacity(r.len());
                while let Some(i) = r.next_value() {
                    items.push(Value::Int(i));
                }
                Ok(vm.alloc(PoolData::List(List::new(items))))
            }
        }
        BuiltinFn::Str => {
            let v = args.expect_zero_or_one(name, &mut vm.pool)?;
            let text = v.as_ref().map_or_else(String::new, |v| v.py_str(&vm.pool));
            if let Some(v) = v {
                v.release(&mut vm.pool);
            }
            Ok(vm.alloc(PoolData::Str(Str::from_str(&text))))
        }
        BuiltinFn::Repr => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let text = v.py_repr(&vm.pool);
            v.release(&mut vm.pool);
            Ok(vm.alloc(PoolData::Str(Str::from_str(&text))))
        }
        BuiltinFn::Unicode => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let units = match &v {
                Value::Ref(id) => match vm.pool.get(*id) {
                    PoolData::Str(s) => s.decode_utf8(),
                    PoolData::UStr(u) => Ok(u.chars().to_vec()),
                    _ => Ok(v.py_str(&vm.pool).encode_utf16().collect()),
                },
                _ => Ok(v.py_str(&vm.pool).encode_utf16().collect()),
            };
            v.release(&mut vm.pool);
            Ok(vm.alloc(PoolData::UStr(UStr::from_units(units?))))
        }
        BuiltinFn::Int => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let result = int_of(vm, &v);
            v.release(&mut vm.pool);
            result.map(Value::Int)
        }
        BuiltinFn::Float => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let result = float_of(vm, &v);
            v.release(&mut vm.pool);
            result.map(Value::Float)
        }
        BuiltinFn::Bool => {
            let v = args.expect_zero_or_one(name, &mut vm.pool)?;
            let truth = v.as_ref().is_some_and(|v| v.truthy(&vm.pool));
            if let Some(v) = v {
                v.release(&mut vm.pool);
            }
            Ok(Value::Bool(truth))
        }
        BuiltinFn::Abs => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let result = match &v {
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
                Value::Float(x) => Ok(Value::Float(x.abs())),
                other => Err(ExcKind::TypeError.err(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name(&vm.pool)
                ))),
            };
            v.release(&mut vm.pool);
            result
        }
        BuiltinFn::Min | BuiltinFn::Max => min_max(vm, f == BuiltinFn::Max, name, args),
        BuiltinFn::Ord => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let result = match &v {
                Value::Ref(id) => match vm.pool.get(*id) {
                    PoolData::Str(s) if s.len() == 1 => Ok(Value::Int(i64::from(s.bytes()[0]))),
                    PoolData::UStr(u) if u.len() == 1 => Ok(Value::Int(i64::from(u.chars()[0]))),
                    _ => Err(ExcKind::TypeError.err("ord() expected a character")),
                },
                _ => Err(ExcKind::TypeError.err("ord() expected a character")),
            };
            v.release(&mut vm.pool);
            result
        }
        BuiltinFn::Chr => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let i = v.as_int();
            v.release(&mut vm.pool);
            let i = i.ok_or_else(|| ExcKind::TypeError.err("an integer is required"))?;
            let byte = u8::try_from(i)
                .map_err(|_| ExcKind::ValueError.err("chr() arg not in range(256)"))?;
            Ok(vm.alloc(PoolData::Str(Str::from_bytes(vec![byte]))))
        }
        BuiltinFn::Isinstance => {
            let (obj, class) = args.expect_two(name, &mut vm.pool)?;
            let result = crate::vm::attr::isinstance(vm, &obj, &class);
            obj.release(&mut vm.pool);
            class.release(&mut vm.pool);
            result.map(Value::Bool)
        }
        BuiltinFn::Hasattr => {
            let (obj, attr) = args.expect_two(name, &mut vm.pool)?;
            let attr_name = string_arg(vm, &attr, "hasattr")?;
            let found = match crate::vm::attr::load_attr(vm, &obj, &attr_name) {
                Ok(v) => {
                    v.release(&mut vm.pool);
                    true
                }
                Err(_) => false,
            };
            obj.release(&mut vm.pool);
            attr.release(&mut vm.pool);
            Ok(Value::Bool(found))
        }
        BuiltinFn::Getattr => {
            let (obj, attr) = args.expect_two(name, &mut vm.pool)?;
            let attr_name = string_arg(vm, &attr, "getattr")?;
            let result = crate::vm::attr::load_attr(vm, &obj, &attr_name);
            obj.release(&mut vm.pool);
            attr.release(&mut vm.pool);
            result
        }
        BuiltinFn::Setattr => {
            let (obj, attr, value) = args.expect_three(name, &mut vm.pool)?;
            let attr_name = string_arg(vm, &attr, "setattr")?;
            let result = crate::vm::attr::store_attr(vm, &obj, &attr_name, value);
            obj.release(&mut vm.pool);
            attr.release(&mut vm.pool);
            result.map(|()| Value::None)
        }
        BuiltinFn::Iter => {
            let v = args.expect_one(name, &mut vm.pool)?;
            crate::vm::collections::get_iter(vm, v)
        }
        BuiltinFn::Type => {
            let v = args.expect_one(name, &mut vm.pool)?;
            let type_name = v.type_name(&vm.pool);
            v.release(&mut vm.pool);
            Ok(vm.alloc(PoolData::Str(Str::from_str(type_name))))
        }
    }
}

fn range_args(vm: &mut Vm, name: &str, args: CallArgs) -> RunResult<(i64, i64, i64)> {
    let (a, b, c) = args.expect_one_to_three(name, &mut vm.pool)?;
    let int_arg = |v: &Value| {
        v.as_int()
            .ok_or_else(|| ExcKind::TypeError.err(format!("{name}() integer argument expected")))
    };
    let result = match (&a, &b, &c) {
        (a, None, None) => int_arg(a).map(|stop| (0, stop, 1)),
        (a, Some(b), None) => Ok((int_arg(a)?, int_arg(b)?, 1)),
        (a, Some(b), Some(c)) => Ok((int_arg(a)?, int_arg(b)?, int_arg(c)?)),
        (.., None, Some(_)) => unreachable!("expect_one_to_three fills in order"),
    };
    a.release(&mut vm.pool);
    if let Some(b) = b {
        b.release(&mut vm.pool);
    }
    if let Some(c) = c {
        c.release(&mut vm.pool);
    }
    result
}

fn min_max(vm: &mut Vm, want_max: bool, name: &str, mut args: CallArgs) -> RunResult<Value> {
    if !args.kw_is_empty() {
        args.release(&mut vm.pool);
        return Err(ExcKind::TypeError.err(format!("{name}() got an unexpected keyword argument")));
    }
    let candidates = if args.pos_len() == 1 {
        let v = args.expect_one(name, &mut vm.pool)?;
        let items = crate::vm::collections::collect_iterable(vm, &v);
        v.release(&mut vm.pool);
        items?
    } else if args.pos_len() == 0 {
        args.release(&mut vm.pool);
        return Err(ExcKind::TypeError.err(format!("{name}() expected at least 1 argument")));
    } else {
        args.take_pos()
    };
    if candidates.is_empty() {
        return Err(ExcKind::ValueError.err(format!("{name}() arg is an empty sequence")));
    }
    let mut best = 0;
    for i in 1..candidates.len() {
        let ord = candidates[i]
            .py_cmp(&candidates[best], &vm.pool)
            .ok_or_else(|| ExcKind::TypeError.err("cannot compare values"));
        match ord {
            Ok(std::cmp::Ordering::Greater) if want_max => best = i,
            Ok(std::cmp::Ordering::Less) if !want_max => best = i,
            Ok(_) => {}
            Err(e) => {
                for v in candidates {
                    v.release(&mut vm.pool);
                }
                return Err(e);
            }
        }
    }
    let mut winner = Value::None;
    for (i, v) in candidates.into_iter().enumerate() {
        if i == best {
            winner = v;
        } else {
            v.release(&mut vm.pool);
        }
    }
    Ok(winner)
}

fn int_of(vm: &Vm, v: &Value) -> RunResult<i64> {
    match v {
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Int(i) => Ok(*i),
        Value::Float(f) => Ok(*f as i64),
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Str(s) => {
                let text = s.text()?;
                text.trim().parse::<i64>().map_err(|_| {
                    ExcKind::ValueError
                        .err(format!("invalid literal for int() with base 10: '{text}'"))
                })
            }
            other => Err(ExcKind::TypeError.err(format!(
                "int() argument must be a string or a number, not '{}'",
                other.variant_name()
            ))),
        },
        Value::None | Value::Builtin(_) => {
            Err(ExcKind::TypeError.err("int() argument must be a string or a number"))
        }
    }
}

fn float_of(vm: &Vm, v: &Value) -> RunResult<f64> {
    match v {
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Str(s) => {
                let text = s.text()?;
                text.trim()
                    .parse::<f64>()
                    .map_err(|_| ExcKind::ValueError.err(format!("could not convert string to float: {text}")))
            }
            other => Err(ExcKind::TypeError.err(format!(
                "float() argument must be a string or a number, not '{}'",
                other.variant_name()
            ))),
        },
        Value::None | Value::Builtin(_) => {
            Err(ExcKind::TypeError.err("float() argument must be a string or a number"))
        }
    }
}

/// Extracts a Rust string from a Str/UStr argument.
pub(crate) fn string_arg(vm: &Vm, v: &Value, context: &str) -> RunResult<String> {
    match v {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Str(s) => Ok(s.text()?.to_owned()),
            PoolData::UStr(u) => String::from_utf16(u.chars())
                .map_err(|_| ExcKind::ValueError.err("surrogates not allowed")),
            other => Err(ExcKind::TypeError.err(format!(
                "{context}: attribute name must be string, not '{}'",
                other.variant_name()
            ))),
        },
        other => Err(ExcKind::TypeError.err(format!(
            "{context}: attribute name must be string, not '{}'",
            other.type_name(&vm.pool)
        ))),
    }
}
