//! Binary and unary operators: numeric promotion, sequence algebra,
//! string interpolation.

use crate::{
    exception::{ExcKind, RunError, RunResult},
    frame::Frame,
    opcode::Opcode,
    pool::{PoolData, PoolId},
    types::{List, Str, Tuple, UStr, str::widen},
    value::{Value, fmt_float},
    vm::Vm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    TrueDiv,
    Mod,
    Pow,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
}

impl BinOp {
    fn from_opcode(op: Opcode) -> Self {
        match op {
            Opcode::BinaryAdd | Opcode::InplaceAdd => Self::Add,
            Opcode::BinarySubtract | Opcode::InplaceSubtract => Self::Sub,
            Opcode::BinaryMultiply | Opcode::InplaceMultiply => Self::Mul,
            Opcode::BinaryDivide | Opcode::InplaceDivide => Self::Div,
            Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => Self::FloorDiv,
            Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => Self::TrueDiv,
            Opcode::BinaryModulo | Opcode::InplaceModulo => Self::Mod,
            Opcode::BinaryPower | Opcode::InplacePower => Self::Pow,
            Opcode::BinaryLshift | Opcode::InplaceLshift => Self::Lshift,
            Opcode::BinaryRshift | Opcode::InplaceRshift => Self::Rshift,
            Opcode::BinaryAnd | Opcode::InplaceAnd => Self::And,
            Opcode::BinaryXor | Opcode::InplaceXor => Self::Xor,
            Opcode::BinaryOr | Opcode::InplaceOr => Self::Or,
            other => unreachable!("not a binary opcode: {other:?}"),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div | Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::Lshift => "<<",
            Self::Rshift => ">>",
            Self::And => "&",
            Self::Xor => "^",
            Self::Or => "|",
        }
    }
}

/// Pops rhs then lhs, applies the operator with the type-promotion
/// table, pushes the result. In-place variants mutate a mutable lhs
/// where possible and otherwise behave as the pure operator.
pub(crate) fn binary_op(
    vm: &mut Vm,
    frame: &mut Frame,
    opcode: Opcode,
    inplace: bool,
) -> RunResult<()> {
    let op = BinOp::from_opcode(opcode);
    let rhs = frame.pop()?;
    let lhs = frame.pop()?;

    // Int op Int stays exact; Bool coerces to Int.
    if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
        let v = int_op(op, a, b)?;
        lhs.release(&mut vm.pool);
        rhs.release(&mut vm.pool);
        frame.push(v);
        return Ok(());
    }
    // Mixed numeric promotes to float.
    if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
        let v = float_op(op, a, b)?;
        lhs.release(&mut vm.pool);
        rhs.release(&mut vm.pool);
        frame.push(Value::Float(v));
        return Ok(());
    }

    let result = pool_op(vm, op, inplace, &lhs, &rhs);
    match result {
        Ok(Some(v)) => {
            lhs.release(&mut vm.pool);
            rhs.release(&mut vm.pool);
            frame.push(v);
            Ok(())
        }
        Ok(None) => {
            // In-place mutation succeeded: the lhs goes back unchanged.
            rhs.release(&mut vm.pool);
            frame.push(lhs);
            Ok(())
        }
        Err(e) => {
            lhs.release(&mut vm.pool);
            rhs.release(&mut vm.pool);
            Err(e)
        }
    }
}

fn type_error(vm: &Vm, op: BinOp, lhs: &Value, rhs: &Value) -> RunError {
    ExcKind::TypeError.err(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        lhs.type_name(&vm.pool),
        rhs.type_name(&vm.pool)
    ))
}

fn int_op(op: BinOp, a: i64, b: i64) -> RunResult<Value> {
    let div_guard = |b: i64| {
        if b == 0 {
            Err(ExcKind::ZeroDivisionError.err("integer division or modulo by zero"))
        } else {
            Ok(())
        }
    };
    Ok(match op {
        BinOp::Add => Value::Int(a.wrapping_add(b)),
        BinOp::Sub => Value::Int(a.wrapping_sub(b)),
        BinOp::Mul => Value::Int(a.wrapping_mul(b)),
        // Division truncates toward zero; modulo keeps the dividend sign.
        BinOp::Div | BinOp::FloorDiv => {
            div_guard(b)?;
            Value::Int(a.wrapping_div(b))
        }
        BinOp::TrueDiv => {
            div_guard(b)?;
            Value::Float(a as f64 / b as f64)
        }
        BinOp::Mod => {
            div_guard(b)?;
            Value::Int(a.wrapping_rem(b))
        }
        BinOp::Pow => {
            if b < 0 {
                Value::Float((a as f64).powi(i32::try_from(b).unwrap_or(i32::MIN)))
            } else {
                let exp = u32::try_from(b)
                    .map_err(|_| ExcKind::OverflowError.err("exponent too large"))?;
                Value::Int(a.wrapping_pow(exp))
            }
        }
        BinOp::Lshift => Value::Int(a.wrapping_shl(u32::try_from(b & 0x3f).expect("masked"))),
        BinOp::Rshift => Value::Int(a.wrapping_shr(u32::try_from(b & 0x3f).expect("masked"))),
        BinOp::And => Value::Int(a & b),
        BinOp::Xor => Value::Int(a ^ b),
        BinOp::Or => Value::Int(a | b),
    })
}

fn float_op(op: BinOp, a: f64, b: f64) -> RunResult<f64> {
    let div_guard = |b: f64| {
        if b == 0.0 {
            Err(ExcKind::ZeroDivisionError.err("float division by zero"))
        } else {
            Ok(())
        }
    };
    Ok(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::TrueDiv => {
            div_guard(b)?;
            a / b
        }
        BinOp::FloorDiv => {
            div_guard(b)?;
            (a / b).trunc()
        }
        BinOp::Mod => {
            div_guard(b)?;
            a % b
        }
        BinOp::Pow => a.powf(b),
        BinOp::Lshift | BinOp::Rshift | BinOp::And | BinOp::Xor | BinOp::Or => {
            return Err(
                ExcKind::TypeError.err("unsupported operand type(s) for bitwise op: 'float'")
            );
        }
    })
}

/// Operators over pool values. `Ok(None)` means an in-place mutation
/// already updated the lhs.
fn pool_op(
    vm: &mut Vm,
    op: BinOp,
    inplace: bool,
    lhs: &Value,
    rhs: &Value,
) -> RunResult<Option<Value>> {
    // Str % args works for every rhs, so handle it before pairing.
    if op == BinOp::Mod
        && let Value::Ref(lid) = lhs
        && matches!(vm.pool.get(*lid), PoolData::Str(_))
    {
        let fmt = match vm.pool.get(*lid) {
            PoolData::Str(s) => s.bytes().to_vec(),
            _ => unreachable!("checked above"),
        };
        let out = format_str(vm, &fmt, rhs)?;
        return Ok(Some(vm.alloc(PoolData::Str(Str::from_bytes(out)))));
    }

    let (Value::Ref(lid), rid) = (lhs, rhs.id()) else {
        // Int * sequence repetition has the number on the left.
        if let (Some(n), Some(rid)) = (lhs.as_int(), rhs.id())
            && op == BinOp::Mul
            && let Some(v) = repeat_value(vm, rid, n)?
        {
            return Ok(Some(v));
        }
        return Err(type_error(vm, op, lhs, rhs));
    };
    let lid = *lid;

    match op {
        BinOp::Add => {
            let Some(rid) = rid else {
                return Err(type_error(vm, op, lhs, rhs));
            };
            match (vm.pool.get(lid), vm.pool.get(rid)) {
                (PoolData::Str(a), PoolData::Str(b)) => {
                    let mut bytes = a.bytes().to_vec();
                    bytes.extend_from_slice(b.bytes());
                    Ok(Some(vm.alloc(PoolData::Str(Str::from_bytes(bytes)))))
                }
                (PoolData::UStr(a), PoolData::UStr(b)) => {
                    let mut chars = a.chars().to_vec();
                    chars.extend_from_slice(b.chars());
                    Ok(Some(vm.alloc(PoolData::UStr(UStr::from_units(chars)))))
                }
                (PoolData::UStr(a), PoolData::Str(b)) => {
                    let mut chars = a.chars().to_vec();
                    chars.extend(widen(b.bytes()));
                    Ok(Some(vm.alloc(PoolData::UStr(UStr::from_units(chars)))))
                }
                (PoolData::Str(a), PoolData::UStr(b)) => {
                    let mut chars = widen(a.bytes());
                    chars.extend_from_slice(b.chars());
                    Ok(Some(vm.alloc(PoolData::UStr(UStr::from_units(chars)))))
                }
                (PoolData::List(_), PoolData::List(_)) => {
                    let extra: Vec<Value> = match vm.pool.get(rid) {
                        PoolData::List(b) => b.items.iter().map(Value::shallow).collect(),
                        _ => unreachable!("matched above"),
                    };
                    for v in &extra {
                        if let Value::Ref(id) = v {
                            vm.pool.inc_ref(*id);
                        }
                    }
                    if inplace {
                        match vm.pool.get_mut(lid) {
                            PoolData::List(a) => a.items.extend(extra),
                            _ => unreachable!("matched above"),
                        }
                        Ok(None)
                    } else {
                        let mut items: Vec<Value> = match vm.pool.get(lid) {
                            PoolData::List(a) => a.items.iter().map(Value::shallow).collect(),
                            _ => unreachable!("matched above"),
                        };
                        for v in &items {
                            if let Value::Ref(id) = v {
                                vm.pool.inc_ref(*id);
                            }
                        }
                        items.extend(extra);
                        Ok(Some(vm.alloc(PoolData::List(List::new(items)))))
                    }
                }
                (PoolData::Tuple(_), PoolData::Tuple(_)) => {
                    let mut items: Vec<Value> = match vm.pool.get(lid) {
                        PoolData::Tuple(a) => a.items.iter().map(Value::shallow).collect(),
                        _ => unreachable!("matched above"),
                    };
                    let extra: Vec<Value> = match vm.pool.get(rid) {
                        PoolData::Tuple(b) => b.items.iter().map(Value::shallow).collect(),
                        _ => unreachable!("matched above"),
                    };
                    items.extend(extra);
                    for v in &items {
                        if let Value::Ref(id) = v {
                            vm.pool.inc_ref(*id);
                        }
                    }
                    Ok(Some(vm.alloc(PoolData::Tuple(Tuple::new(items)))))
                }
                _ => Err(type_error(vm, op, lhs, rhs)),
            }
        }
        BinOp::Mul => {
            let n = rhs
                .as_int()
                .ok_or_else(|| type_error(vm, op, lhs, rhs))?;
            repeat_value(vm, lid, n)?
                .map(Some)
                .ok_or_else(|| type_error(vm, op, lhs, rhs))
        }
        _ => Err(type_error(vm, op, lhs, rhs)),
    }
}

/// Sequence repetition; `Ok(None)` when the value is not a sequence.
fn repeat_value(vm: &mut Vm, id: PoolId, n: i64) -> RunResult<Option<Value>> {
    let n = usize::try_from(n.max(0)).expect("clamped to non-negative");
    match vm.pool.get(id) {
        PoolData::Str(s) => {
            let bytes = s.bytes().repeat(n);
            Ok(Some(vm.alloc(PoolData::Str(Str::from_bytes(bytes)))))
        }
        PoolData::UStr(u) => {
            let chars = u.chars().repeat(n);
            Ok(Some(vm.alloc(PoolData::UStr(UStr::from_units(chars)))))
        }
        PoolData::List(_) | PoolData::Tuple(_) => {
            let (base, is_list): (Vec<Value>, bool) = match vm.pool.get(id) {
                PoolData::List(l) => (l.items.iter().map(Value::shallow).collect(), true),
                PoolData::Tuple(t) => (t.items.iter().map(Value::shallow).collect(), false),
                _ => unreachable!("matched above"),
            };
            let mut items = Vec::with_capacity(base.len() * n);
            for _ in 0..n {
                for v in &base {
                    if let Value::Ref(vid) = v {
                        vm.pool.inc_ref(*vid);
                    }
                    items.push(v.shallow());
                }
            }
            Ok(Some(if is_list {
                vm.alloc(PoolData::List(List::new(items)))
            } else {
                vm.alloc(PoolData::Tuple(Tuple::new(items)))
            }))
        }
        _ => Ok(None),
    }
}

pub(crate) fn unary_op(vm: &mut Vm, frame: &mut Frame, op: Opcode) -> RunResult<()> {
    let v = frame.pop()?;
    let result = match op {
        Opcode::UnaryPositive => match v.as_int() {
            Some(i) => Ok(Value::Int(i)),
            None => match &v {
                Value::Float(f) => Ok(Value::Float(*f)),
                other => Err(ExcKind::TypeError.err(format!(
                    "bad operand type for unary +: '{}'",
                    other.type_name(&vm.pool)
                ))),
            },
        },
        Opcode::UnaryNegative => match v.as_int() {
            Some(i) => Ok(Value::Int(i.wrapping_neg())),
            None => match &v {
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(ExcKind::TypeError.err(format!(
                    "bad operand type for unary -: '{}'",
                    other.type_name(&vm.pool)
                ))),
            },
        },
        Opcode::UnaryNot => Ok(Value::Bool(!v.truthy(&vm.pool))),
        Opcode::UnaryInvert => match v.as_int() {
            Some(i) => Ok(Value::Int(!i)),
            None => Err(ExcKind::TypeError.err(format!(
                "bad operand type for unary ~: '{}'",
                v.type_name(&vm.pool)
            ))),
        },
        Opcode::UnaryConvert => {
            let text = v.py_repr(&vm.pool);
            Ok(vm.alloc(PoolData::Str(Str::from_str(&text))))
        }
        other => unreachable!("not a unary opcode: {other:?}"),
    };
    v.release(&mut vm.pool);
    frame.push(result?);
    Ok(())
}

/// `fmt % args`: the classic conversion specifiers with optional width
/// and precision.
pub(crate) fn format_str(vm: &Vm, fmt: &[u8], args: &Value) -> RunResult<Vec<u8>> {
    let items: Vec<Value> = match args {
        Value::Ref(id) => match vm.pool.get(*id) {
            PoolData::Tuple(t) => t.items.iter().map(Value::shallow).collect(),
            _ => vec![args.shallow()],
        },
        other => vec![other.shallow()],
    };
    let mut next = 0usize;
    let mut take = || -> RunResult<Value> {
        let v = items
            .get(next)
            .map(Value::shallow)
            .ok_or_else(|| ExcKind::TypeError.err("not enough arguments for format string"))?;
        next += 1;
        Ok(v)
    };

    let mut out = Vec::with_capacity(fmt.len());
    let mut i = 0;
    while i < fmt.len() {
        let b = fmt[i];
        if b != b'%' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        if i >= fmt.len() {
            return Err(ExcKind::ValueError.err("incomplete format"));
        }
        // flags and width / precision
        let mut zero_pad = false;
        let mut left = false;
        while i < fmt.len() && (fmt[i] == b'0' || fmt[i] == b'-') {
            if fmt[i] == b'0' {
                zero_pad = true;
            } else {
                left = true;
            }
            i += 1;
        }
        let mut width = 0usize;
        while i < fmt.len() && fmt[i].is_ascii_digit() {
            width = width * 10 + usize::from(fmt[i] - b'0');
            i += 1;
        }
        let mut precision: Option<usize> = None;
        if i < fmt.len() && fmt[i] == b'.' {
            i += 1;
            let mut p = 0usize;
            while i < fmt.len() && fmt[i].is_ascii_digit() {
                p = p * 10 + usize::from(fmt[i] - b'0');
                i += 1;
            }
            precision = Some(p);
        }
        let Some(&conv) = fmt.get(i) else {
            return Err(ExcKind::ValueError.err("incomplete format"));
        };
        i += 1;

        let piece: String = match conv {
            b'%' => "%".to_owned(),
            b's' | b'r' => {
                let v = take()?;
                let text = if conv == b's' {
                    v.py_str(&vm.pool)
                } else {
                    v.py_repr(&vm.pool)
                };
                match precision {
                    Some(p) => text.chars().take(p).collect(),
                    None => text,
                }
            }
            b'd' | b'i' => {
                let v = take()?;
                let n = v
                    .as_int()
                    .or_else(|| v.as_float().map(|f| f as i64))
                    .ok_or_else(|| {
                        ExcKind::TypeError.err("%d format: a number is required")
                    })?;
                n.to_string()
            }
            b'x' => {
                let v = take()?;
                let n = v
                    .as_int()
                    .ok_or_else(|| ExcKind::TypeError.err("%x format: an integer is required"))?;
                format!("{n:x}")
            }
            b'X' => {
                let v = take()?;
                let n = v
                    .as_int()
                    .ok_or_else(|| ExcKind::TypeError.err("%X format: an integer is required"))?;
                format!("{n:X}")
            }
            b'f' | b'g' => {
                let v = take()?;
                let f = v
                    .as_float()
                    .ok_or_else(|| ExcKind::TypeError.err("a float is required"))?;
                if conv == b'f' {
                    format!("{f:.*}", precision.unwrap_or(6))
                } else {
                    let mut s = String::new();
                    fmt_float(f, &mut s);
                    s
                }
            }
            other => {
                return Err(ExcKind::ValueError.err(format!(
                    "unsupported format character '{}'",
                    other as char
                )));
            }
        };

        let mut padded = String::new();
        if piece.len() < width {
            let pad = width - piece.len();
            if left {
                padded.push_str(&piece);
                for _ in 0..pad {
                    padded.push(' ');
                }
            } else {
                let fill = if zero_pad { '0' } else { ' ' };
                // keep a leading sign ahead of zero padding
                if zero_pad && (piece.starts_with('-')) {
                    padded.push('-');
                    for _ in 0..pad {
                        padded.push('0');
                    }
                    padded.push_str(&piece[1..]);
                } else {
                    for _ in 0..pad {
                        padded.push(fill);
                    }
                    padded.push_str(&piece);
                }
            }
        } else {
            padded = piece;
        }
        out.extend_from_slice(padded.as_bytes());
    }

    if next < items.len() {
        return Err(ExcKind::TypeError.err("not all arguments converted during string formatting"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int2(op: BinOp, a: i64, b: i64) -> i64 {
        match int_op(op, a, b) {
            Ok(Value::Int(v)) => v,
            other => panic!("expected an int result, got {other:?}"),
        }
    }

    #[test]
    fn addition_round_trips_within_range() {
        for (a, b) in [(3, 4), (-7, 12), (1 << 40, 1 << 20), (-(1 << 50), 9)] {
            assert_eq!(int2(BinOp::Sub, int2(BinOp::Add, a, b), b), a);
        }
    }

    #[test]
    fn division_truncates_toward_zero() {
        assert_eq!(int2(BinOp::Div, 7, 2), 3);
        assert_eq!(int2(BinOp::Div, -7, 2), -3);
        assert_eq!(int2(BinOp::Div, 7, -2), -3);
    }

    #[test]
    fn modulo_follows_the_dividend_sign() {
        assert_eq!(int2(BinOp::Mod, 7, 3), 1);
        assert_eq!(int2(BinOp::Mod, -7, 3), -1);
        assert_eq!(int2(BinOp::Mod, 7, -3), 1);
    }

    #[test]
    fn zero_division_raises() {
        assert!(int_op(BinOp::Div, 1, 0).is_err());
        assert!(int_op(BinOp::Mod, 1, 0).is_err());
        assert!(float_op(BinOp::Div, 1.0, 0.0).is_err());
    }

    #[test]
    fn float_identities_hold_modulo_ulp() {
        for (a, b) in [(0.5, 3.25), (-7.75, 0.125)] {
            let sum = float_op(BinOp::Add, a, b).unwrap();
            let back = float_op(BinOp::Sub, sum, b).unwrap();
            assert!((back - a).abs() <= f64::EPSILON * a.abs().max(1.0));
        }
    }
}
