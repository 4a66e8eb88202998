use crate::common::{Result, StoreError};

/// Logical type of one component of an index key, persisted with the index
/// so that reopening with a different key layout is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    Integer = 1,
    Long = 2,
    String = 3,
    Binary = 4,
    Link = 5,
}

impl KeyType {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(KeyType::Integer),
            2 => Some(KeyType::Long),
            3 => Some(KeyType::String),
            4 => Some(KeyType::Binary),
            5 => Some(KeyType::Link),
            _ => None,
        }
    }
}

/// Converts values to and from the bytes stored in index pages.
pub trait BinarySerializer<T>: Send + Sync {
    fn serialized_size(&self, value: &T) -> usize;

    fn serialize(&self, value: &T, out: &mut Vec<u8>);

    fn deserialize(&self, bytes: &[u8]) -> Result<T>;

    fn to_bytes(&self, value: &T) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size(value));
        self.serialize(value, &mut out);
        out
    }
}

fn fixed<const N: usize>(bytes: &[u8], type_name: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        StoreError::Serialization(format!(
            "{} needs {} bytes, got {}",
            type_name,
            N,
            bytes.len()
        ))
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serializer;

impl BinarySerializer<u64> for U64Serializer {
    fn serialized_size(&self, _value: &u64) -> usize {
        8
    }

    fn serialize(&self, value: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<u64> {
        Ok(u64::from_le_bytes(fixed(bytes, "u64")?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct I64Serializer;

impl BinarySerializer<i64> for I64Serializer {
    fn serialized_size(&self, _value: &i64) -> usize {
        8
    }

    fn serialize(&self, value: &i64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<i64> {
        Ok(i64::from_le_bytes(fixed(bytes, "i64")?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct I32Serializer;

impl BinarySerializer<i32> for I32Serializer {
    fn serialized_size(&self, _value: &i32) -> usize {
        4
    }

    fn serialize(&self, value: &i32, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<i32> {
        Ok(i32::from_le_bytes(fixed(bytes, "i32")?))
    }
}

/// UTF-8 bytes, no length prefix: the page layout records lengths.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl BinarySerializer<String> for StringSerializer {
    fn serialized_size(&self, value: &String) -> usize {
        value.len()
    }

    fn serialize(&self, value: &String, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StoreError::Serialization(format!("invalid UTF-8 key: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl BinarySerializer<Vec<u8>> for BytesSerializer {
    fn serialized_size(&self, value: &Vec<u8>) -> usize {
        value.len()
    }

    fn serialize(&self, value: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
