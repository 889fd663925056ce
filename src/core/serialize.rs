// Canonical binary encoding for ledger data structures

use crate::core::Hash256;
use crate::error::{NodeError, Result};
use std::io::{Cursor, Read};

/// Upper bound on any length-prefixed byte string or element count
pub const MAX_VAR_LEN: u64 = 4 * 1024 * 1024;

/// Trait for types with a canonical byte encoding
pub trait Serializable: Sized {
    /// Append the canonical encoding to `buf`
    fn write_to(&self, buf: &mut Vec<u8>);

    /// Decode one value from a reader
    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self>;

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    /// Decode a value that must span the whole buffer
    fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let value = Self::read_from(&mut cursor)?;
        if cursor.position() as usize != data.len() {
            return Err(NodeError::malformed(format!(
                "{} trailing bytes",
                data.len() - cursor.position() as usize
            )));
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

/// Read a variable-length integer (VarInt), rejecting non-minimal encodings
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let first = read_array::<R, 1>(reader)?[0];

    let (value, min) = match first {
        0..=0xfc => return Ok(first as u64),
        0xfd => (u16::from_le_bytes(read_array(reader)?) as u64, 0xfd),
        0xfe => (u32::from_le_bytes(read_array(reader)?) as u64, 0x10000),
        0xff => (u64::from_le_bytes(read_array(reader)?), 0x1_0000_0000),
    };

    if value < min {
        return Err(NodeError::malformed("non-canonical varint"));
    }
    Ok(value)
}

/// Read an element count bounded by `MAX_VAR_LEN`
pub fn read_count<R: Read + ?Sized>(reader: &mut R) -> Result<usize> {
    let count = read_varint(reader)?;
    if count > MAX_VAR_LEN {
        return Err(NodeError::malformed(format!("length prefix too large: {}", count)));
    }
    Ok(count as usize)
}

/// Write bytes with length prefix (VarInt length + data)
pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read bytes with length prefix
pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_count(reader)?;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

pub fn read_array<R: Read + ?Sized, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

pub fn read_hash<R: Read + ?Sized>(reader: &mut R) -> Result<Hash256> {
    Ok(Hash256::new(read_array(reader)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_small() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 100);
        assert_eq!(buf, vec![100]);

        let mut cursor = Cursor::new(buf);
        let value = read_varint(&mut cursor).unwrap();
        assert_eq!(value, 100);
    }

    #[test]
    fn test_varint_medium() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 1000);
        assert_eq!(buf.len(), 3); // 0xfd + 2 bytes

        let mut cursor = Cursor::new(buf);
        let value = read_varint(&mut cursor).unwrap();
        assert_eq!(value, 1000);
    }

    #[test]
    fn test_varint_large() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 100000);
        assert_eq!(buf.len(), 5); // 0xfe + 4 bytes

        let mut cursor = Cursor::new(buf);
        let value = read_varint(&mut cursor).unwrap();
        assert_eq!(value, 100000);
    }

    #[test]
    fn test_varint_rejects_non_minimal() {
        // 5 encoded with the 0xfd prefix
        let mut cursor = Cursor::new(vec![0xfd, 0x05, 0x00]);
        assert!(read_varint(&mut cursor).is_err());
    }

    #[test]
    fn test_var_bytes() {
        let data = b"hello world";
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, data);

        let mut cursor = Cursor::new(buf);
        let decoded = read_var_bytes(&mut cursor).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_var_bytes_truncated() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 10);
        buf.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_var_bytes(&mut cursor), Err(NodeError::Malformed(_))));
    }

    #[test]
    fn test_oversized_length_prefix() {
        let mut buf = Vec::new();
        write_varint(&mut buf, MAX_VAR_LEN + 1);
        let mut cursor = Cursor::new(buf);
        assert!(read_count(&mut cursor).is_err());
    }
}
