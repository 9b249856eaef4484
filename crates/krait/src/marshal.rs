//! `.pyc` image loader: CPython 2.7 marshal format.
//!
//! The body of a `.pyc` is a self-describing value graph with single-byte
//! type tags. Interned strings (`t`) are recorded in a per-stream table
//! that back-references (`R`) resolve by index. Code objects recurse.
//!
//! Every malformed input fails with a `DeserializeError`; the loader
//! never panics on bad bytes.

use std::rc::Rc;

use crate::{
    exception::{ExcKind, RunError, RunResult},
    pool::{Pool, PoolData, PoolId},
    types::{Code, CodeBody, Dict, HKey, List, Str, Tuple, UStr},
    value::Value,
};

/// Size of the optional image header: 4-byte magic plus 4-byte timestamp.
pub(crate) const PYC_HEADER_LEN: usize = 8;

fn bad(msg: impl Into<String>) -> RunError {
    ExcKind::DeserializeError.err(msg)
}

/// Parses a `.pyc` image into a code object.
///
/// With `has_header`, the 8-byte magic/timestamp prefix is checked for
/// length and discarded. The root marshalled object must be a code
/// object.
pub(crate) fn parse_pyc(pool: &mut Pool, buf: &[u8], has_header: bool) -> RunResult<PoolId> {
    let body = if has_header {
        if buf.len() < PYC_HEADER_LEN {
            return Err(bad("image shorter than its header"));
        }
        &buf[PYC_HEADER_LEN..]
    } else {
        buf
    };
    let mut reader = MarshalReader::new(body);
    let value = reader.read_value(pool)?;
    match &value {
        Value::Ref(id) if matches!(pool.get(*id), PoolData::Code(_)) => Ok(*id),
        other => {
            let name = other.type_name(pool).to_owned();
            value.release(pool);
            Err(bad(format!("expected a code object at top level, got {name}")))
        }
    }
}

struct MarshalReader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Interned strings seen so far, for `R` back-references.
    interned: Vec<Vec<u8>>,
}

impl<'a> MarshalReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            interned: Vec::new(),
        }
    }

    fn take(&mut self, n: usize) -> RunResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| bad("truncated stream"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> RunResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> RunResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u32(&mut self) -> RunResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> RunResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f64(&mut self) -> RunResult<f64> {
        self.read_i64().map(|bits| f64::from_bits(bits.cast_unsigned()))
    }

    fn read_len(&mut self) -> RunResult<usize> {
        let n = self.read_i32()?;
        usize::try_from(n).map_err(|_| bad("negative length"))
    }

    fn read_bytes(&mut self) -> RunResult<Vec<u8>> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    fn read_value(&mut self, pool: &mut Pool) -> RunResult<Value> {
        let tag = self.read_u8()?;
        match tag {
            b'N' => Ok(Value::None),
            b'T' => Ok(Value::Bool(true)),
            b'F' => Ok(Value::Bool(false)),
            b'i' => Ok(Value::Int(i64::from(self.read_i32()?))),
            b'I' => Ok(Value::Int(self.read_i64()?)),
            b'l' => self.read_long().map(Value::Int),
            b'g' => Ok(Value::Float(self.read_f64()?)),
            b'f' => {
                let len = usize::from(self.read_u8()?);
                let text = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| bad("non-ASCII float literal"))?;
                text.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| bad(format!("bad float literal {text:?}")))
            }
            b's' => {
                let bytes = self.read_bytes()?;
                Ok(Value::Ref(pool.add(PoolData::Str(Str::from_bytes(bytes)))))
            }
            b't' => {
                let bytes = self.read_bytes()?;
                self.interned.push(bytes.clone());
                Ok(Value::Ref(pool.add(PoolData::Str(Str::from_bytes(bytes)))))
            }
            b'R' => {
                let index = self.read_u32()? as usize;
                let bytes = self
                    .interned
                    .get(index)
                    .ok_or_else(|| bad(format!("string back-reference {index} out of range")))?
                    .clone();
                Ok(Value::Ref(pool.add(PoolData::Str(Str::from_bytes(bytes)))))
            }
            b'u' => {
                let bytes = self.read_bytes()?;
                let text =
                    std::str::from_utf8(&bytes).map_err(|_| bad("unicode string is not UTF-8"))?;
                Ok(Value::Ref(pool.add(PoolData::UStr(UStr::from_str(text)))))
            }
            b'(' => {
                let items = self.read_seq(pool)?;
                Ok(Value::Ref(pool.add(PoolData::Tuple(Tuple::new(items)))))
            }
            b'[' => {
                let items = self.read_seq(pool)?;
                Ok(Value::Ref(pool.add(PoolData::List(List::new(items)))))
            }
            b'{' => self.read_dict(pool),
            b'c' => self.read_code(pool),
            other => Err(bad(format!("unknown marshal tag {:?}", other as char))),
        }
    }

    /// CPython long: a count of 15-bit digits with the sign on the count.
    /// Values beyond 64 bits are out of scope and rejected.
    fn read_long(&mut self) -> RunResult<i64> {
        let n = self.read_i32()?;
        let negative = n < 0;
        let count = n.unsigned_abs() as usize;
        let mut value: i128 = 0;
        for i in 0..count {
            let b = self.take(2)?;
            let digit = i128::from(u16::from_le_bytes([b[0], b[1]]));
            value |= digit << (15 * i);
        }
        if negative {
            value = -value;
        }
        i64::try_from(value).map_err(|_| bad("long literal exceeds 64 bits"))
    }

    fn read_seq(&mut self, pool: &mut Pool) -> RunResult<Vec<Value>> {
        let count = self.read_len()?;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(self.read_value(pool)?);
        }
        Ok(items)
    }

    fn read_dict(&mut self, pool: &mut Pool) -> RunResult<Value> {
        let mut dict = Dict::new();
        loop {
            let tag = self.read_u8()?;
            if tag == b'0' {
                break;
            }
            self.pos -= 1;
            let key = self.read_value(pool)?;
            let value = self.read_value(pool)?;
            let hkey = HKey::project(&key, pool)?;
            if let Some((old_key, old_value)) = dict.insert(hkey, key, value) {
                old_key.release(pool);
                old_value.release(pool);
            }
        }
        Ok(Value::Ref(pool.add(PoolData::Dict(dict))))
    }

    fn read_code(&mut self, pool: &mut Pool) -> RunResult<Value> {
        let argcount = self.read_code_count("argcount")?;
        let nlocals = self.read_code_count("nlocals")?;
        let stacksize = self.read_code_count("stacksize")?;
        let flags = self.read_u32()?;
        let code = self.read_str_field(pool, "code")?;
        let consts = self.read_tuple_field(pool, "consts")?;
        let names = self.read_name_tuple(pool, "names")?;
        let varnames = self.read_name_tuple(pool, "varnames")?;
        let freevars = self.read_name_tuple(pool, "freevars")?;
        let cellvars = self.read_name_tuple(pool, "cellvars")?;
        let filename = self.read_text_field(pool, "filename")?;
        let name = self.read_text_field(pool, "name")?;
        let firstlineno = self.read_code_count("firstlineno")?;
        let lnotab = self.read_str_field(pool, "lnotab")?;

        let body = CodeBody {
            name,
            argcount,
            nlocals,
            varnames,
            cellvars,
            freevars,
            names,
            code,
            filename,
            firstlineno,
            lnotab,
            stacksize,
            flags,
        };
        Ok(Value::Ref(pool.add(PoolData::Code(Code {
            body: Rc::new(body),
            consts,
        }))))
    }

    fn read_code_count(&mut self, field: &str) -> RunResult<u32> {
        let n = self.read_i32()?;
        u32::try_from(n).map_err(|_| bad(format!("negative {field} in code object")))
    }

    /// A field marshalled as a byte string; the transient pool object is
    /// released once its bytes are taken.
    fn read_str_field(&mut self, pool: &mut Pool, field: &str) -> RunResult<Vec<u8>> {
        let v = self.read_value(pool)?;
        match &v {
            Value::Ref(id) => {
                if let PoolData::Str(s) = pool.get(*id) {
                    let bytes = s.bytes().to_vec();
                    v.release(pool);
                    return Ok(bytes);
                }
                v.release(pool);
                Err(bad(format!("code field {field} is not a string")))
            }
            _ => {
                v.release(pool);
                Err(bad(format!("code field {field} is not a string")))
            }
        }
    }

    fn read_text_field(&mut self, pool: &mut Pool, field: &str) -> RunResult<String> {
        let bytes = self.read_str_field(pool, field)?;
        String::from_utf8(bytes).map_err(|_| bad(format!("code field {field} is not UTF-8")))
    }

    fn read_tuple_field(&mut self, pool: &mut Pool, field: &str) -> RunResult<Vec<Value>> {
        let v = self.read_value(pool)?;
        let Value::Ref(id) = v else {
            v.release(pool);
            return Err(bad(format!("code field {field} is not a tuple")));
        };
        if !matches!(pool.get(id), PoolData::Tuple(_)) {
            v.release(pool);
            return Err(bad(format!("code field {field} is not a tuple")));
        }
        // Move the items out and release the now-empty tuple shell.
        let items = match pool.get_mut(id) {
            PoolData::Tuple(t) => std::mem::take(&mut t.items),
            _ => unreachable!("checked above"),
        };
        pool.dec_ref(id);
        Ok(items)
    }

    fn read_name_tuple(&mut self, pool: &mut Pool, field: &str) -> RunResult<Vec<String>> {
        let items = self.read_tuple_field(pool, field)?;
        let mut names = Vec::with_capacity(items.len());
        let mut failed = false;
        for item in items {
            if !failed {
                match &item {
                    Value::Ref(id) => match pool.get(*id) {
                        PoolData::Str(s) => match s.text() {
                            Ok(text) => names.push(text.to_owned()),
                            Err(_) => failed = true,
                        },
                        PoolData::UStr(u) => match String::from_utf16(u.chars()) {
                            Ok(text) => names.push(text),
                            Err(_) => failed = true,
                        },
                        _ => failed = true,
                    },
                    _ => failed = true,
                }
            }
            item.release(pool);
        }
        if failed {
            return Err(bad(format!("code field {field} holds a non-string name")));
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(bytes: &[u8]) -> (Pool, RunResult<Value>) {
        let mut pool = Pool::new();
        let mut reader = MarshalReader::new(bytes);
        let result = reader.read_value(&mut pool);
        (pool, result)
    }

    #[test]
    fn scalars() {
        let (_, v) = parse_one(b"N");
        assert!(matches!(v.unwrap(), Value::None));
        let (_, v) = parse_one(b"T");
        assert!(matches!(v.unwrap(), Value::Bool(true)));
        let (_, v) = parse_one(&[b'i', 0x2a, 0, 0, 0]);
        assert!(matches!(v.unwrap(), Value::Int(42)));
        let (_, v) = parse_one(&[b'I', 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(v.unwrap(), Value::Int(-1)));
        let mut g = vec![b'g'];
        g.extend_from_slice(&2.5f64.to_bits().to_le_bytes());
        let (_, v) = parse_one(&g);
        assert!(matches!(v.unwrap(), Value::Float(f) if f == 2.5));
    }

    #[test]
    fn interned_back_references() {
        // t"ab" followed by R0 inside a tuple
        let mut bytes = vec![b'(', 2, 0, 0, 0];
        bytes.extend_from_slice(&[b't', 2, 0, 0, 0]);
        bytes.extend_from_slice(b"ab");
        bytes.extend_from_slice(&[b'R', 0, 0, 0, 0]);
        let (pool, v) = parse_one(&bytes);
        let v = v.unwrap();
        let Value::Ref(id) = v else { panic!("tuple") };
        let PoolData::Tuple(t) = pool.get(id) else {
            panic!("tuple")
        };
        assert_eq!(t.items.len(), 2);
        assert!(t.items[0].py_eq(&t.items[1], &pool));
    }

    #[test]
    fn long_within_range() {
        // 2**40 = digits [0, 0, 1024] in 15-bit chunks
        let mut bytes = vec![b'l', 3, 0, 0, 0];
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&1024u16.to_le_bytes());
        let (_, v) = parse_one(&bytes);
        assert!(matches!(v.unwrap(), Value::Int(v) if v == 1 << 40));
    }

    #[test]
    fn truncated_stream_fails() {
        let (_, v) = parse_one(&[b'i', 1, 2]);
        let err = v.unwrap_err();
        let crate::exception::ExcPayload::Simple(exc) = err.payload else {
            panic!("simple error expected")
        };
        assert_eq!(exc.kind, ExcKind::DeserializeError);
    }

    #[test]
    fn unknown_tag_fails() {
        let (_, v) = parse_one(&[b'Z']);
        assert!(v.is_err());
    }
}
