//! Reader and writer for CPython's `marshal` serialization, restricted to
//! the value kinds the compiler stores in pyc files.
//!
//! The wire format is the one shared by the 3.8 and 3.9 interpreters
//! (marshal version 4): a one-byte type code, optionally flagged with
//! `FLAG_REF`, followed by a type-specific payload. Flagged objects join a
//! reference table in the order their type byte appears, and `r` records
//! index back into it.

use num_enum::TryFromPrimitive;
use std::{error, fmt};

use crate::bytes::{self, Cursor};
use crate::code::{CodeFlags, CodeObject, PyObject};

/// Marshal reader errors
#[derive(Debug, Clone)]
pub enum Error {
    UnsupportedType(u8),
    BadReference(u32),
    IntOutOfRange,
    InvalidString,
    OddBytecode(usize),
    UnexpectedObject(&'static str),
    Truncated(bytes::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedType(code) => {
                write!(f, "unsupported marshal type code: 0x{code:02x}")
            }
            Self::BadReference(index) => write!(f, "reference to unread object `{index}`"),
            Self::IntOutOfRange => write!(f, "integer does not fit in 64 bits"),
            Self::InvalidString => write!(f, "string is not valid UTF-8"),
            Self::OddBytecode(len) => write!(f, "bytecode has odd length `{len}`"),
            Self::UnexpectedObject(expected) => {
                write!(f, "code object field is not {expected}")
            }
            Self::Truncated(err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {}

impl From<bytes::Error> for Error {
    fn from(err: bytes::Error) -> Self {
        Self::Truncated(err)
    }
}

/// High bit of the type byte: the object joins the reference table
const FLAG_REF: u8 = 0x80;

/// Marshal type codes, from CPython's `Python/marshal.c`.
///
/// Codes the byte compiler never emits into a pyc (lists, dicts, sets,
/// `StopIteration`, complex numbers) are omitted; encountering one is a
/// reader error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum TypeCode {
    None = b'N',
    False = b'F',
    True = b'T',
    Ellipsis = b'.',
    Int = b'i',
    Long = b'l',
    BinaryFloat = b'g',
    Bytes = b's',
    Interned = b't',
    Ref = b'r',
    Tuple = b'(',
    Code = b'c',
    Unicode = b'u',
    Ascii = b'a',
    AsciiInterned = b'A',
    SmallTuple = b')',
    ShortAscii = b'z',
    ShortAsciiInterned = b'Z',
    FrozenSet = b'>',
}

/// Deserialize one marshaled object from `data`.
pub fn load(data: &[u8]) -> Result<PyObject, Error> {
    Reader::new(data).read_object()
}

struct Reader<'input> {
    cursor: Cursor<'input>,
    refs: Vec<PyObject>,
}

impl<'input> Reader<'input> {
    fn new(data: &'input [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
            refs: Vec::new(),
        }
    }

    fn read_object(&mut self) -> Result<PyObject, Error> {
        let byte = self.cursor.read_u8()?;
        let code = TypeCode::try_from(byte & !FLAG_REF)
            .map_err(|_| Error::UnsupportedType(byte & !FLAG_REF))?;

        // Reference indices are assigned in the order the type bytes are
        // read, so a container's slot must be reserved before its elements.
        let slot = if byte & FLAG_REF != 0 && code != TypeCode::Ref {
            self.refs.push(PyObject::None);
            Some(self.refs.len() - 1)
        } else {
            None
        };

        let object = match code {
            TypeCode::None => PyObject::None,
            TypeCode::False => PyObject::Bool(false),
            TypeCode::True => PyObject::Bool(true),
            TypeCode::Ellipsis => PyObject::Ellipsis,
            TypeCode::Int => PyObject::Int(i64::from(self.cursor.read_i32()?)),
            TypeCode::Long => self.read_long()?,
            TypeCode::BinaryFloat => PyObject::Float(self.cursor.read_f64()?),
            TypeCode::Bytes => {
                let length = self.cursor.read_u32()? as usize;
                PyObject::Bytes(self.cursor.read_bytes(length)?.to_vec())
            }
            TypeCode::Unicode | TypeCode::Interned | TypeCode::Ascii | TypeCode::AsciiInterned => {
                let length = self.cursor.read_u32()? as usize;
                self.read_str(length)?
            }
            TypeCode::ShortAscii | TypeCode::ShortAsciiInterned => {
                let length = self.cursor.read_u8()? as usize;
                self.read_str(length)?
            }
            TypeCode::Tuple => {
                let length = self.cursor.read_u32()? as usize;
                PyObject::Tuple(self.read_elements(length)?)
            }
            TypeCode::SmallTuple => {
                let length = self.cursor.read_u8()? as usize;
                PyObject::Tuple(self.read_elements(length)?)
            }
            TypeCode::FrozenSet => {
                let length = self.cursor.read_u32()? as usize;
                PyObject::FrozenSet(self.read_elements(length)?)
            }
            TypeCode::Code => PyObject::Code(Box::new(self.read_code()?)),
            TypeCode::Ref => {
                let index = self.cursor.read_u32()?;
                return self
                    .refs
                    .get(index as usize)
                    .cloned()
                    .ok_or(Error::BadReference(index));
            }
        };

        if let Some(slot) = slot {
            self.refs[slot] = object.clone();
        }
        Ok(object)
    }

    /// `l`: signed digit count, then 15-bit digits little-endian.
    fn read_long(&mut self) -> Result<PyObject, Error> {
        let count = self.cursor.read_i32()?;
        let ndigits = count.unsigned_abs();
        // 5 digits cover 75 bits, already past what Int can hold
        if ndigits > 5 {
            return Err(Error::IntOutOfRange);
        }
        let mut value = 0i128;
        for shift in 0..ndigits {
            value += i128::from(self.cursor.read_u16()?) << (15 * shift);
        }
        if count < 0 {
            value = -value;
        }
        value
            .try_into()
            .map(PyObject::Int)
            .map_err(|_| Error::IntOutOfRange)
    }

    fn read_str(&mut self, length: usize) -> Result<PyObject, Error> {
        let bytes = self.cursor.read_bytes(length)?;
        std::str::from_utf8(bytes)
            .map(|s| PyObject::Str(s.to_owned()))
            .map_err(|_| Error::InvalidString)
    }

    fn read_elements(&mut self, count: usize) -> Result<Vec<PyObject>, Error> {
        let mut elements = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            elements.push(self.read_object()?);
        }
        Ok(elements)
    }

    /// `c`: the 3.8/3.9 code-object record.
    fn read_code(&mut self) -> Result<CodeObject, Error> {
        let arg_count = self.cursor.read_u32()?;
        let pos_only_arg_count = self.cursor.read_u32()?;
        let kw_only_arg_count = self.cursor.read_u32()?;
        let n_locals = self.cursor.read_u32()?;
        let stack_size = self.cursor.read_u32()?;
        let flags = CodeFlags::from_bits_retain(self.cursor.read_u32()?);
        let bytecode = self.expect_bytes()?;
        if bytecode.len() % 2 != 0 {
            return Err(Error::OddBytecode(bytecode.len()));
        }
        let consts = self.expect_tuple()?;
        let names = self.expect_str_tuple()?;
        let varnames = self.expect_str_tuple()?;
        let freevars = self.expect_str_tuple()?;
        let cellvars = self.expect_str_tuple()?;
        let filename = self.expect_str()?;
        let name = self.expect_str()?;
        let first_line_no = self.cursor.read_u32()?;
        let lnotab = self.expect_bytes()?;
        Ok(CodeObject {
            arg_count,
            pos_only_arg_count,
            kw_only_arg_count,
            n_locals,
            stack_size,
            flags,
            bytecode,
            consts,
            names,
            varnames,
            freevars,
            cellvars,
            filename,
            name,
            first_line_no,
            lnotab,
        })
    }

    fn expect_bytes(&mut self) -> Result<Vec<u8>, Error> {
        match self.read_object()? {
            PyObject::Bytes(bytes) => Ok(bytes),
            _ => Err(Error::UnexpectedObject("a bytes object")),
        }
    }

    fn expect_str(&mut self) -> Result<String, Error> {
        match self.read_object()? {
            PyObject::Str(s) => Ok(s),
            _ => Err(Error::UnexpectedObject("a string")),
        }
    }

    fn expect_tuple(&mut self) -> Result<Vec<PyObject>, Error> {
        match self.read_object()? {
            PyObject::Tuple(items) => Ok(items),
            _ => Err(Error::UnexpectedObject("a tuple")),
        }
    }

    fn expect_str_tuple(&mut self) -> Result<Vec<String>, Error> {
        self.expect_tuple()?
            .into_iter()
            .map(|item| match item {
                PyObject::Str(s) => Ok(s),
                _ => Err(Error::UnexpectedObject("a tuple of strings")),
            })
            .collect()
    }
}

/// Serialize one object.
///
/// The writer never sets `FLAG_REF`, which is the always-valid degenerate
/// form of the reference protocol: every reader accepts it, the file is just
/// marginally larger than what `marshal.dumps` would produce.
#[must_use]
pub fn dump(object: &PyObject) -> Vec<u8> {
    let mut out = Vec::new();
    write_object(&mut out, object);
    out
}

/// Serialize a code object (the top-level record of a pyc body).
#[must_use]
pub fn dump_code(code: &CodeObject) -> Vec<u8> {
    let mut out = Vec::new();
    write_code(&mut out, code);
    out
}

fn write_object(out: &mut Vec<u8>, object: &PyObject) {
    match object {
        PyObject::None => out.push(TypeCode::None as u8),
        PyObject::Bool(false) => out.push(TypeCode::False as u8),
        PyObject::Bool(true) => out.push(TypeCode::True as u8),
        PyObject::Ellipsis => out.push(TypeCode::Ellipsis as u8),
        PyObject::Int(value) => match i32::try_from(*value) {
            Ok(small) => {
                out.push(TypeCode::Int as u8);
                out.extend_from_slice(&small.to_le_bytes());
            }
            Err(_) => write_long(out, *value),
        },
        PyObject::Float(value) => {
            out.push(TypeCode::BinaryFloat as u8);
            out.extend_from_slice(&value.to_le_bytes());
        }
        PyObject::Str(value) => write_str(out, value),
        PyObject::Bytes(value) => {
            out.push(TypeCode::Bytes as u8);
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        PyObject::Tuple(items) => {
            write_tuple_header(out, items.len());
            for item in items {
                write_object(out, item);
            }
        }
        PyObject::FrozenSet(items) => {
            out.push(TypeCode::FrozenSet as u8);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                write_object(out, item);
            }
        }
        PyObject::Code(code) => write_code(out, code),
    }
}

fn write_long(out: &mut Vec<u8>, value: i64) {
    out.push(TypeCode::Long as u8);
    let mut magnitude = value.unsigned_abs();
    let mut digits: Vec<u16> = Vec::new();
    while magnitude != 0 {
        digits.push((magnitude & 0x7fff) as u16);
        magnitude >>= 15;
    }
    let count = digits.len() as i32;
    out.extend_from_slice(&(if value < 0 { -count } else { count }).to_le_bytes());
    for digit in digits {
        out.extend_from_slice(&digit.to_le_bytes());
    }
}

fn write_str(out: &mut Vec<u8>, value: &str) {
    if value.is_ascii() && value.len() < 256 {
        out.push(TypeCode::ShortAscii as u8);
        out.push(value.len() as u8);
    } else if value.is_ascii() {
        out.push(TypeCode::Ascii as u8);
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    } else {
        out.push(TypeCode::Unicode as u8);
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(value.as_bytes());
}

fn write_tuple_header(out: &mut Vec<u8>, length: usize) {
    if length < 256 {
        out.push(TypeCode::SmallTuple as u8);
        out.push(length as u8);
    } else {
        out.push(TypeCode::Tuple as u8);
        out.extend_from_slice(&(length as u32).to_le_bytes());
    }
}

fn write_str_tuple(out: &mut Vec<u8>, strings: &[String]) {
    write_tuple_header(out, strings.len());
    for s in strings {
        write_str(out, s);
    }
}

fn write_code(out: &mut Vec<u8>, code: &CodeObject) {
    out.push(TypeCode::Code as u8);
    out.extend_from_slice(&code.arg_count.to_le_bytes());
    out.extend_from_slice(&code.pos_only_arg_count.to_le_bytes());
    out.extend_from_slice(&code.kw_only_arg_count.to_le_bytes());
    out.extend_from_slice(&code.n_locals.to_le_bytes());
    out.extend_from_slice(&code.stack_size.to_le_bytes());
    out.extend_from_slice(&code.flags.bits().to_le_bytes());
    write_object(out, &PyObject::Bytes(code.bytecode.clone()));
    write_tuple_header(out, code.consts.len());
    for item in &code.consts {
        write_object(out, item);
    }
    write_str_tuple(out, &code.names);
    write_str_tuple(out, &code.varnames);
    write_str_tuple(out, &code.freevars);
    write_str_tuple(out, &code.cellvars);
    write_str(out, &code.filename);
    write_str(out, &code.name);
    out.extend_from_slice(&code.first_line_no.to_le_bytes());
    write_object(out, &PyObject::Bytes(code.lnotab.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(object: PyObject) {
        assert_eq!(object, load(&dump(&object)).unwrap());
    }

    #[test]
    fn test_scalar_roundtrip() {
        roundtrip(PyObject::None);
        roundtrip(PyObject::Bool(true));
        roundtrip(PyObject::Bool(false));
        roundtrip(PyObject::Ellipsis);
        roundtrip(PyObject::Int(0));
        roundtrip(PyObject::Int(-1));
        roundtrip(PyObject::Int(i64::from(i32::MAX)));
        roundtrip(PyObject::Float(2.5));
        roundtrip(PyObject::Str("hello".to_owned()));
        roundtrip(PyObject::Str("héllo".to_owned()));
        roundtrip(PyObject::Bytes(vec![0, 1, 2]));
    }

    #[test]
    fn test_long_roundtrip() {
        roundtrip(PyObject::Int(1 << 32));
        roundtrip(PyObject::Int(-(1 << 32)));
        roundtrip(PyObject::Int(i64::MAX));
        roundtrip(PyObject::Int(i64::MIN + 1));
    }

    #[test]
    fn test_container_roundtrip() {
        roundtrip(PyObject::Tuple(vec![]));
        roundtrip(PyObject::Tuple(vec![
            PyObject::Int(1),
            PyObject::Str("x".to_owned()),
            PyObject::Tuple(vec![PyObject::None]),
        ]));
        roundtrip(PyObject::FrozenSet(vec![
            PyObject::Int(1),
            PyObject::Int(2),
        ]));
    }

    #[test]
    fn test_int_encodings() {
        // 32-bit values use `i`, wider ones the 15-bit-digit `l` format
        assert_eq!(b'i', dump(&PyObject::Int(7))[0]);
        assert_eq!(b'l', dump(&PyObject::Int(1 << 40))[0]);
        // 2^32 = 4 * 2^30: digits [0, 0, 4]
        assert_eq!(
            vec![b'l', 3, 0, 0, 0, 0, 0, 0, 0, 4, 0],
            dump(&PyObject::Int(1 << 32))
        );
    }

    #[test]
    fn test_reads_references() {
        // ('ab', 'ab') written by CPython: the interned string is flagged
        // and the second element is a back-reference to table slot 1
        // (slot 0 being the flagged tuple itself).
        let data = [
            b')' | FLAG_REF,
            2,
            b'Z' | FLAG_REF,
            2,
            b'a',
            b'b',
            b'r',
            1,
            0,
            0,
            0,
        ];
        let expected = PyObject::Tuple(vec![
            PyObject::Str("ab".to_owned()),
            PyObject::Str("ab".to_owned()),
        ]);
        assert_eq!(expected, load(&data).unwrap());
    }

    #[test]
    fn test_reader_errors() {
        assert!(matches!(load(&[]), Err(Error::Truncated(_))));
        assert!(matches!(load(&[b'i', 1]), Err(Error::Truncated(_))));
        // dict type code: the compiler never stores one in a pyc
        assert!(matches!(
            load(&[b'{']),
            Err(Error::UnsupportedType(b'{'))
        ));
        assert!(matches!(
            load(&[b'r', 0, 0, 0, 0]),
            Err(Error::BadReference(0))
        ));
    }
}
