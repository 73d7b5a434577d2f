// Binary codec shared by blocks, transactions and wire messages

use crate::core::Hash256;
use std::io::{self, Cursor, Read};

/// Largest length prefix accepted for a byte string
pub const MAX_VAR_BYTES: usize = 1 << 20;

/// Trait for types with a canonical binary encoding.
/// Writers append to a `Vec<u8>` and cannot fail; readers consume a stream.
pub trait Serializable: Sized {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode<R: Read>(reader: &mut R) -> Result<Self, String>;

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decode a complete value; trailing bytes are an error
    fn deserialize(data: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor::new(data);
        let value = Self::decode(&mut cursor)?;
        let consumed = cursor.position() as usize;
        if consumed != data.len() {
            return Err(format!("{} trailing bytes after value", data.len() - consumed));
        }
        Ok(value)
    }
}

/// Write a variable-length integer (VarInt)
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffffffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Read a variable-length integer (VarInt)
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let first = read_array::<R, 1>(reader)?[0];
    match first {
        0..=0xfc => Ok(first as u64),
        0xfd => Ok(u16::from_le_bytes(read_array(reader)?) as u64),
        0xfe => Ok(u32::from_le_bytes(read_array(reader)?) as u64),
        0xff => Ok(u64::from_le_bytes(read_array(reader)?)),
    }
}

/// Write bytes with a VarInt length prefix
pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read length-prefixed bytes, refusing prefixes above `max`
pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R, max: usize) -> io::Result<Vec<u8>> {
    let len = read_length(reader, max)?;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

/// Read a VarInt used as an element count or byte length
pub fn read_length<R: Read + ?Sized>(reader: &mut R, max: usize) -> io::Result<usize> {
    let len = read_varint(reader)?;
    if len > max as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("length {} exceeds limit {}", len, max),
        ));
    }
    Ok(len as usize)
}

pub fn read_array<R: Read + ?Sized, const N: usize>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

pub fn read_hash<R: Read + ?Sized>(reader: &mut R) -> io::Result<Hash256> {
    Ok(Hash256::new(read_array(reader)?))
}
