use crate::error::{AbiError, Result};

/// Cursor over a little-endian binary payload.
pub struct AbiReader<'a> {
    data: &'a [u8],
    pos: usize,
}

macro_rules! read_le {
    ($fn_name:ident, $ty:ty) => {
        pub fn $fn_name(&mut self) -> Result<$ty> {
            const SIZE: usize = std::mem::size_of::<$ty>();
            let mut buf = [0u8; SIZE];
            buf.copy_from_slice(self.read_bytes(SIZE)?);
            Ok(<$ty>::from_le_bytes(buf))
        }
    };
}

impl<'a> AbiReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes already consumed between two positions.
    pub fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        &self.data[start.min(end)..end.min(self.pos)]
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(AbiError::UnexpectedEof {
                offset: self.pos,
                needed: len,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    read_le!(read_u8, u8);
    read_le!(read_i8, i8);
    read_le!(read_u16, u16);
    read_le!(read_i16, i16);
    read_le!(read_u32, u32);
    read_le!(read_i32, i32);
    read_le!(read_u64, u64);
    read_le!(read_i64, i64);
    read_le!(read_u128, u128);
    read_le!(read_i128, i128);
    read_le!(read_f32, f32);
    read_le!(read_f64, f64);

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(AbiError::invalid("bool", format!("unexpected byte {other}"))),
        }
    }

    pub fn read_varuint32(&mut self) -> Result<u32> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 35 {
                return Err(AbiError::invalid("varuint32", "value does not fit in 32 bits"));
            }
        }
        u32::try_from(result)
            .map_err(|_| AbiError::invalid("varuint32", "value does not fit in 32 bits"))
    }

    pub fn read_varint32(&mut self) -> Result<i32> {
        let raw = self.read_varuint32()?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }

    pub fn read_byte_vec(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varuint32()? as usize;
        self.read_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_byte_vec()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| AbiError::invalid("string", err.to_string()))
    }
}

#[derive(Default)]
pub struct AbiWriter {
    buf: Vec<u8>,
}

macro_rules! write_le {
    ($fn_name:ident, $ty:ty) => {
        pub fn $fn_name(&mut self, value: $ty) {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
    };
}

impl AbiWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    write_le!(write_u8, u8);
    write_le!(write_i8, i8);
    write_le!(write_u16, u16);
    write_le!(write_i16, i16);
    write_le!(write_u32, u32);
    write_le!(write_i32, i32);
    write_le!(write_u64, u64);
    write_le!(write_i64, i64);
    write_le!(write_u128, u128);
    write_le!(write_i128, i128);
    write_le!(write_f32, f32);
    write_le!(write_f64, f64);

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_varuint32(&mut self, mut value: u32) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value > 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    pub fn write_varint32(&mut self, value: i32) {
        self.write_varuint32(((value << 1) ^ (value >> 31)) as u32);
    }

    pub fn write_byte_vec(&mut self, bytes: &[u8]) {
        self.write_varuint32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_byte_vec(value.as_bytes());
    }
}
