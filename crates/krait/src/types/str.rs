//! Byte strings and wide strings.
//!
//! `Str` is the workhorse string: an immutable byte sequence with caches
//! for its lower-case and wide-character transcodings, built on first
//! request. `UStr` is a sequence of wide characters; widening a `Str`
//! maps each byte to the same code unit, which is lossless for ASCII and
//! matches the original's ANSI widening.

use crate::{
    exception::{ExcKind, RunResult},
    value::Value,
};

/// An immutable byte string with lazily-built transcoding caches.
#[derive(Debug, Default)]
pub(crate) struct Str {
    bytes: Vec<u8>,
    /// Lower-case cache (ASCII lowering, byte for byte).
    lower: Option<Vec<u8>>,
    /// Wide-character cache (byte-to-unit widening).
    wide: Option<Vec<u16>>,
}

impl Str {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            lower: None,
            wide: None,
        }
    }

    pub fn from_str(s: &str) -> Self {
        Self::from_bytes(s.as_bytes().to_vec())
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// UTF-8 view of the bytes, for name and key contexts.
    pub fn text(&self) -> RunResult<&str> {
        std::str::from_utf8(&self.bytes)
            .map_err(|_| ExcKind::ValueError.err("string is not valid UTF-8"))
    }

    /// Lower-case version, cached after the first request.
    pub fn lower(&mut self) -> &[u8] {
        if self.lower.is_none() {
            self.lower = Some(self.bytes.to_ascii_lowercase());
        }
        self.lower.as_deref().expect("lower cache just built")
    }

    /// Wide transcoding, cached after the first request.
    pub fn wide(&mut self) -> &[u16] {
        if self.wide.is_none() {
            self.wide = Some(widen(&self.bytes));
        }
        self.wide.as_deref().expect("wide cache just built")
    }

    /// Decodes the bytes as UTF-8 into wide units, failing deterministically
    /// on malformed input.
    pub fn decode_utf8(&self) -> RunResult<Vec<u16>> {
        let text = std::str::from_utf8(&self.bytes)
            .map_err(|_| ExcKind::ValueError.err("invalid UTF-8 sequence"))?;
        Ok(text.encode_utf16().collect())
    }
}

/// Widens bytes to wide units one-to-one.
pub(crate) fn widen(bytes: &[u8]) -> Vec<u16> {
    bytes.iter().map(|&b| u16::from(b)).collect()
}

/// A wide-character string.
#[derive(Debug, Default)]
pub(crate) struct UStr {
    chars: Vec<u16>,
    lower: Option<Vec<u16>>,
}

impl UStr {
    pub fn from_units(chars: Vec<u16>) -> Self {
        Self { chars, lower: None }
    }

    pub fn from_str(s: &str) -> Self {
        Self::from_units(s.encode_utf16().collect())
    }

    #[inline]
    pub fn chars(&self) -> &[u16] {
        &self.chars
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn lower(&mut self) -> &[u16] {
        if self.lower.is_none() {
            self.lower = Some(
                self.chars
                    .iter()
                    .map(|&c| {
                        if c < 128 {
                            u16::from((c as u8).to_ascii_lowercase())
                        } else {
                            c
                        }
                    })
                    .collect(),
            );
        }
        self.lower.as_deref().expect("lower cache just built")
    }

    /// Encodes to UTF-8 bytes.
    pub fn encode_utf8(&self) -> RunResult<Vec<u8>> {
        String::from_utf16(&self.chars)
            .map(String::into_bytes)
            .map_err(|_| ExcKind::ValueError.err("surrogates not allowed"))
    }
}

/// Writes the Python 2 repr of a byte string: single-quoted with escapes.
pub(crate) fn str_repr_into(bytes: &[u8], out: &mut String) {
    out.push('\'');
    for &b in bytes {
        match b {
            b'\'' => out.push_str("\\'"),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                out.push_str("\\x");
                out.push(char::from_digit(u32::from(b >> 4), 16).expect("nibble"));
                out.push(char::from_digit(u32::from(b & 0xf), 16).expect("nibble"));
            }
        }
    }
    out.push('\'');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_build_once() {
        let mut s = Str::from_str("AbC");
        assert_eq!(s.lower(), b"abc");
        assert_eq!(s.wide(), &[u16::from(b'A'), u16::from(b'b'), u16::from(b'C')]);
        // second call hits the cache
        assert_eq!(s.lower(), b"abc");
    }

    #[test]
    fn utf8_decode_is_deterministic() {
        let good = Str::from_bytes("héllo".as_bytes().to_vec());
        assert_eq!(good.decode_utf8().unwrap().len(), 5);
        let bad = Str::from_bytes(vec![0xff, 0xfe]);
        assert!(bad.decode_utf8().is_err());
    }

    #[test]
    fn repr_escapes() {
        let mut out = String::new();
        str_repr_into(b"a'b\n\x01", &mut out);
        assert_eq!(out, "'a\\'b\\n\\x01'");
    }
}

/// Dispatches a method call on a Str or UStr receiver.
///
/// Wide receivers run the same byte-level algorithms on their widened
/// form and produce wide results.
pub(crate) fn call_method(
    vm: &mut crate::vm::Vm,
    id: crate::pool::PoolId,
    name: &str,
    args: crate::vm::CallArgs,
) -> RunResult<Value> {
    use crate::pool::PoolData;
    use crate::types::{List, UStr as UStrTy};

    let wide_recv = matches!(vm.pool.get(id), PoolData::UStr(_));
    // Work on wide units for both receivers; narrow results narrow back.
    let units: Vec<u16> = match vm.pool.get_mut(id) {
        PoolData::Str(s) => s.wide().to_vec(),
        PoolData::UStr(u) => u.chars().to_vec(),
        other => {
            let type_name = other.variant_name();
            args.release(&mut vm.pool);
            return Err(ExcKind::AttributeError
                .err(format!("'{type_name}' object has no attribute '{name}'")));
        }
    };

    let rebuild = |vm: &mut crate::vm::Vm, units: Vec<u16>| -> Value {
        if wide_recv {
            vm.alloc(PoolData::UStr(UStrTy::from_units(units)))
        } else {
            let bytes = units.iter().map(|&c| u8::try_from(c).unwrap_or(b'?')).collect();
            vm.alloc(PoolData::Str(Str::from_bytes(bytes)))
        }
    };

    match name {
        "lower" => {
            args.expect_zero(name, &mut vm.pool)?;
            // served from the receiver's lower-case cache
            let data = match vm.pool.get_mut(id) {
                PoolData::Str(s) => PoolData::Str(Str::from_bytes(s.lower().to_vec())),
                PoolData::UStr(u) => PoolData::UStr(UStrTy::from_units(u.lower().to_vec())),
                _ => unreachable!("receiver variant checked on entry"),
            };
            Ok(vm.alloc(data))
        }
        "upper" => {
            args.expect_zero(name, &mut vm.pool)?;
            let mapped = units
                .iter()
                .map(|&c| {
                    if c < 128 {
                        u16::from((c as u8).to_ascii_uppercase())
                    } else {
                        c
                    }
                })
                .collect();
            Ok(rebuild(vm, mapped))
        }
        "strip" | "lstrip" | "rstrip" => {
            args.expect_zero(name, &mut vm.pool)?;
            let is_space = |c: &u16| matches!(*c, 9 | 10 | 11 | 12 | 13 | 32);
            let start = if name == "rstrip" {
                0
            } else {
                units.iter().take_while(|c| is_space(c)).count()
            };
            let end = if name == "lstrip" {
                units.len()
            } else {
                units.len() - units[start..].iter().rev().take_while(|c| is_space(c)).count()
            };
            Ok(rebuild(vm, units[start..end].to_vec()))
        }
        "split" => {
            let sep = args.expect_zero_or_one(name, &mut vm.pool)?;
            let parts: RunResult<Vec<Vec<u16>>> = match &sep {
                None => Ok(units
                    .split(|c| matches!(*c, 9 | 10 | 11 | 12 | 13 | 32))
                    .filter(|p| !p.is_empty())
                    .map(<[u16]>::to_vec)
                    .collect()),
                Some(v) => wide_arg(vm, v, name).and_then(|needle| {
                    if needle.is_empty() {
                        Err(ExcKind::ValueError.err("empty separator"))
                    } else {
                        Ok(split_units(&units, &needle))
                    }
                }),
            };
            if let Some(sep) = sep {
                sep.release(&mut vm.pool);
            }
            let items = parts?.into_iter().map(|p| rebuild(vm, p)).collect();
            Ok(vm.alloc(PoolData::List(List::new(items))))
        }
        "join" => {
            let seq = args.expect_one(name, &mut vm.pool)?;
            let pieces = crate::vm::collections::collect_iterable(vm, &seq);
            seq.release(&mut vm.pool);
            let pieces = pieces?;
            let mut joined: Vec<u16> = Vec::new();
            let mut failed = None;
            for (i, piece) in pieces.iter().enumerate() {
                if failed.is_none() {
                    match wide_arg(vm, piece, name) {
                        Ok(part) => {
                            if i > 0 {
                                joined.extend_from_slice(&units);
                            }
                            joined.extend(part);
                        }
                        Err(e) => failed = Some(e),
                    }
                }
            }
            for piece in pieces {
                piece.release(&mut vm.pool);
            }
            if let Some(e) = failed {
                return Err(e);
            }
            Ok(rebuild(vm, joined))
        }
        "replace" => {
            let (old, new) = args.expect_two(name, &mut vm.pool)?;
            let result = match (wide_arg(vm, &old, name), wide_arg(vm, &new, name)) {
                (Ok(old_u), Ok(new_u)) => {
                    if old_u.is_empty() {
                        Err(ExcKind::ValueError.err("empty pattern"))
                    } else {
                        let mut out = Vec::with_capacity(units.len());
                        let mut i = 0;
                        while i < units.len() {
                            if units[i..].starts_with(&old_u) {
                                out.extend_from_slice(&new_u);
                                i += old_u.len();
                            } else {
                                out.push(units[i]);
                                i += 1;
                            }
                        }
                        Ok(out)
                    }
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            };
            old.release(&mut vm.pool);
            new.release(&mut vm.pool);
            Ok(rebuild(vm, result?))
        }
        "find" => {
            let needle_v = args.expect_one(name, &mut vm.pool)?;
            let needle = wide_arg(vm, &needle_v, name);
            needle_v.release(&mut vm.pool);
            let needle = needle?;
            let found = if needle.is_empty() {
                0
            } else {
                (0..=units.len().saturating_sub(needle.len()))
                    .find(|&i| units[i..].starts_with(&needle))
                    .map_or(-1, |i| i64::try_from(i).expect("index fits"))
            };
            Ok(Value::Int(found))
        }
        "startswith" | "endswith" => {
            let needle_v = args.expect_one(name, &mut vm.pool)?;
            let needle = wide_arg(vm, &needle_v, name);
            needle_v.release(&mut vm.pool);
            let needle = needle?;
            let hit = if name == "startswith" {
                units.starts_with(&needle)
            } else {
                units.ends_with(&needle)
            };
            Ok(Value::Bool(hit))
        }
        "count" => {
            let needle_v = args.expect_one(name, &mut vm.pool)?;
            let needle = wide_arg(vm, &needle_v, name);
            needle_v.release(&mut vm.pool);
            let needle = needle?;
            if needle.is_empty() {
                return Ok(Value::Int(i64::try_from(units.len() + 1).expect("fits")));
            }
            let mut n = 0i64;
            let mut i = 0;
            while i + needle.len() <= units.len() {
                if units[i..].starts_with(&needle) {
                    n += 1;
                    i += needle.len();
                } else {
                    i += 1;
                }
            }
            Ok(Value::Int(n))
        }
        "decode" => {
            // s.decode('utf8') -> unicode; the codec argument is advisory.
            let codec = args.expect_zero_or_one(name, &mut vm.pool)?;
            if let Some(codec) = codec {
                codec.release(&mut vm.pool);
            }
            let decoded = match vm.pool.get(id) {
                PoolData::Str(s) => s.decode_utf8()?,
                PoolData::UStr(u) => u.chars().to_vec(),
                _ => unreachable!("receiver variant checked on entry"),
            };
            Ok(vm.alloc(PoolData::UStr(UStrTy::from_units(decoded))))
        }
        "encode" => {
            let codec = args.expect_zero_or_one(name, &mut vm.pool)?;
            if let Some(codec) = codec {
                codec.release(&mut vm.pool);
            }
            let bytes = match vm.pool.get(id) {
                PoolData::Str(s) => s.bytes().to_vec(),
                PoolData::UStr(u) => u.encode_utf8()?,
                _ => unreachable!("receiver variant checked on entry"),
            };
            Ok(vm.alloc(PoolData::Str(Str::from_bytes(bytes))))
        }
        _ => {
            args.release(&mut vm.pool);
            let type_name = if wide_recv { "unicode" } else { "str" };
            Err(ExcKind::AttributeError
                .err(format!("'{type_name}' object has no attribute '{name}'")))
        }
    }
}

/// Extracts the wide form of a Str/UStr argument.
fn wide_arg(vm: &mut crate::vm::Vm, v: &Value, context: &str) -> RunResult<Vec<u16>> {
    use crate::pool::PoolData;
    match v {
        Value::Ref(id) => {
            let id = *id;
            match vm.pool.get_mut(id) {
                PoolData::Str(s) => Ok(s.wide().to_vec()),
                PoolData::UStr(u) => Ok(u.chars().to_vec()),
                other => Err(ExcKind::TypeError.err(format!(
                    "{context}() expected a string, got '{}'",
                    other.variant_name()
                ))),
            }
        }
        other => Err(ExcKind::TypeError.err(format!(
            "{context}() expected a string, got '{}'",
            other.type_name(&vm.pool)
        ))),
    }
}

fn split_units(units: &[u16], needle: &[u16]) -> Vec<Vec<u16>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + needle.len() <= units.len() {
        if units[i..].starts_with(needle) {
            parts.push(units[start..i].to_vec());
            i += needle.len();
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(units[start..].to_vec());
    parts
}
