use crate::error::WireError;
use crate::name::Name;

/// Byte-stream writer for the replication protocol.
///
/// All integers are LEB128 varints unless a fixed width is called out; names
/// and strings are length-prefixed UTF-8. Records are byte-aligned, including
/// the leading full-vs-delta envelope flag.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u32v(&mut self, value: u32) {
        // Writing into a Vec cannot fail.
        leb128::write::unsigned(&mut self.buf, u64::from(value)).unwrap();
    }

    pub fn write_u64v(&mut self, value: u64) {
        leb128::write::unsigned(&mut self.buf, value).unwrap();
    }

    pub fn write_i64v(&mut self, value: i64) {
        leb128::write::signed(&mut self.buf, value).unwrap();
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32v(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_name(&mut self, name: &Name) {
        self.write_bytes(name.as_str().as_bytes());
    }

    pub fn write_str(&mut self, text: &str) {
        self.write_bytes(text.as_bytes());
    }
}

/// Byte-stream reader mirroring [`WireWriter`].
///
/// The cursor only advances on success, so a failed field read leaves the
/// position at a known boundary for the defer-and-retry contract.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        let byte = *self.buf.get(self.pos).ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u64v(&mut self) -> Result<u64, WireError> {
        let mut slice = &self.buf[self.pos..];
        let before = slice.len();
        let value = leb128::read::unsigned(&mut slice).map_err(map_leb128_error)?;
        self.pos += before - slice.len();
        Ok(value)
    }

    pub fn read_u32v(&mut self) -> Result<u32, WireError> {
        let value = self.read_u64v()?;
        u32::try_from(value).map_err(|_| WireError::VarintOverflow)
    }

    pub fn read_i64v(&mut self) -> Result<i64, WireError> {
        let mut slice = &self.buf[self.pos..];
        let before = slice.len();
        let value = leb128::read::signed(&mut slice).map_err(map_leb128_error)?;
        self.pos += before - slice.len();
        Ok(value)
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        let bytes = self.read_exact(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32v()? as usize;
        self.read_exact(len)
    }

    pub fn read_name(&mut self) -> Result<Name, WireError> {
        let bytes = self.read_bytes()?;
        let text = std::str::from_utf8(bytes).map_err(|_| WireError::NonUtf8Name)?;
        Ok(Name::new(text))
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        let text = std::str::from_utf8(bytes).map_err(|_| WireError::NonUtf8Name)?;
        Ok(text.to_owned())
    }
}

fn map_leb128_error(error: leb128::read::Error) -> WireError {
    match error {
        leb128::read::Error::IoError(_) => WireError::UnexpectedEof,
        leb128::read::Error::Overflow => WireError::VarintOverflow,
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
