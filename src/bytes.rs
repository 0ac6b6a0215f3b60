use std::{error, fmt};

#[derive(Debug, Clone)]
pub enum Error {
    UnexpectedEof,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UnexpectedEof => "unexpected end of input",
        })
    }
}

impl error::Error for Error {}

/// Little-endian byte reader over a borrowed buffer.
#[derive(Clone)]
pub struct Cursor<'input> {
    buffer: &'input [u8],
    offset: usize,
}

impl<'input> Cursor<'input> {
    #[must_use]
    pub fn new(buffer: &'input [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let byte = *self.buffer.get(self.offset).ok_or(Error::UnexpectedEof)?;
        self.offset += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn read_f64(&mut self) -> Result<f64, Error> {
        let bytes = self.read_bytes(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, length: usize) -> Result<&'input [u8], Error> {
        let end = self
            .offset
            .checked_add(length)
            .ok_or(Error::UnexpectedEof)?;
        let bytes = self
            .buffer
            .get(self.offset..end)
            .ok_or(Error::UnexpectedEof)?;
        self.offset = end;
        Ok(bytes)
    }
}

impl fmt::Debug for Cursor<'_> {
    /// Debug-print only the unread part of the internal buffer
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unread = self.buffer.get(self.offset..).unwrap_or_default();
        f.write_str("Cursor [0x")?;
        for &b in unread.iter().take(200) {
            write!(f, "{b:02x}")?;
        }
        if unread.len() > 200 {
            f.write_str("...")?;
        }
        write!(f, "; {} @ {}]", unread.len(), self.offset)
    }
}

#[test]
fn test_cursor_scalars() {
    let mut c = Cursor::new(&[1, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xff]);
    assert_eq!(1, c.read_u8().unwrap());
    assert_eq!(0x1234, c.read_u16().unwrap());
    assert_eq!(0x1234_5678, c.read_u32().unwrap());
    assert_eq!(0xff, c.read_u8().unwrap());
    assert!(c.read_u8().is_err());

    let mut c = Cursor::new(&[0xff, 0xff, 0xff, 0xff]);
    assert_eq!(-1, c.read_i32().unwrap());

    let encoded = 1.5f64.to_le_bytes();
    let mut c = Cursor::new(&encoded);
    assert_eq!(1.5, c.read_f64().unwrap());
}

#[test]
fn test_cursor_bytes() {
    let mut c = Cursor::new(&[0, 1, 2, 3, 4]);
    assert_eq!([0, 1, 2], c.read_bytes(3).unwrap());
    assert!(c.read_bytes(3).is_err());
    assert_eq!([3, 4], c.read_bytes(2).unwrap());
    assert!(c.read_u8().is_err());
}
