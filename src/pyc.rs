//! The pyc container: a 16-byte header in front of a marshaled module code
//! object.
//!
//! Header layout: 4 magic bytes, a 32-bit flags word (bit 0 clear means the
//! file is validated by timestamp, set means by source hash), then either
//! timestamp + source size or the 64-bit source hash, all little-endian.

use log::debug;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{error, fmt, fs, io};

use crate::code::{CodeObject, PyObject};
use crate::marshal;
use crate::schema::magics;

/// pyc reader and writer errors
#[derive(Debug)]
pub enum Error {
    /// Input is shorter than a pyc header
    Truncated,
    /// Magic word does not belong to any known interpreter
    UnknownMagic(u16),
    /// Input is a valid pyc, but not one compiled by 3.9
    UnsupportedVersion { found: (u8, u8) },
    /// Marshaled body does not deserialize to a code object
    NotCode,
    Marshal(marshal::Error),
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "file is too short to hold a pyc header"),
            Self::UnknownMagic(magic) => write!(f, "unrecognized pyc magic word `{magic}`"),
            Self::UnsupportedVersion { found: (major, minor) } => {
                write!(
                    f,
                    "only Python 3.9 files are supported, found {major}.{minor}"
                )
            }
            Self::NotCode => write!(f, "pyc body is not a code object"),
            Self::Marshal(err) => err.fmt(f),
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {}

impl From<marshal::Error> for Error {
    fn from(err: marshal::Error) -> Self {
        Self::Marshal(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// A parsed pyc file of any recognized interpreter version.
#[derive(Debug, Clone)]
pub struct CompiledFile {
    pub version: (u8, u8),
    pub magic: u16,
    pub flags: u32,
    /// Modification time of the source, or half of its hash when bit 0 of
    /// `flags` is set
    pub timestamp: u32,
    pub source_size: u32,
    pub code: CodeObject,
}

impl CompiledFile {
    /// Parse a pyc file from bytes.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let Some((header, body)) = data.split_first_chunk::<16>() else {
            return Err(Error::Truncated);
        };
        let magic = u16::from_le_bytes([header[0], header[1]]);
        if [header[2], header[3]] != magics::SUFFIX {
            return Err(Error::UnknownMagic(magic));
        }
        let version = magics::version_for_magic(magic).ok_or(Error::UnknownMagic(magic))?;
        let flags = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let timestamp = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let source_size = u32::from_le_bytes(header[12..16].try_into().unwrap());
        debug!(
            "pyc magic {magic} = {}.{}, flags {flags:#x}",
            version.0, version.1
        );

        match marshal::load(body)? {
            PyObject::Code(code) => Ok(Self {
                version,
                magic,
                flags,
                timestamp,
                source_size,
                code: *code,
            }),
            _ => Err(Error::NotCode),
        }
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::parse(&fs::read(path)?)
    }
}

/// Load the module code of a 3.9-compiled pyc file.
pub fn read_py39(path: &Path) -> Result<CodeObject, Error> {
    let file = CompiledFile::open(path)?;
    if file.version != (3, 9) {
        return Err(Error::UnsupportedVersion {
            found: file.version,
        });
    }
    Ok(file.code)
}

/// Write `code` to `sink` as a 3.8 pyc file.
///
/// The file is stamped timestamp-validated with `timestamp` (current
/// wall-clock second if `None`) and a source size of zero, since the source
/// the code came from is not at hand.
pub fn write_py38<W: Write>(
    code: &CodeObject,
    sink: &mut W,
    timestamp: Option<u32>,
) -> Result<(), Error> {
    let timestamp = timestamp.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or(0)
    });
    sink.write_all(&magics::magic_word(magics::PY38))?;
    sink.write_all(&0u32.to_le_bytes())?;
    sink.write_all(&timestamp.to_le_bytes())?;
    sink.write_all(&0u32.to_le_bytes())?;
    sink.write_all(&marshal::dump_code(code))?;
    Ok(())
}
