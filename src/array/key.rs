//! # Encryption Keys
//!
//! An [`EncryptionKey`] travels with every open, load, and store call.
//! The storage manager never encrypts anything itself (tile encoding is
//! the codec layer's business); what it enforces is *agreement*: all
//! concurrent opens of one array must present the same key, and a blob's
//! recorded encryption type must match the key used to read it.

use eyre::Result;
use std::fmt;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    NoEncryption,
    Aes256Gcm,
}

impl EncryptionType {
    pub fn to_u8(self) -> u8 {
        match self {
            EncryptionType::NoEncryption => 0,
            EncryptionType::Aes256Gcm => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EncryptionType::NoEncryption),
            1 => Some(EncryptionType::Aes256Gcm),
            _ => None,
        }
    }

    /// Required key length in bytes.
    pub fn key_length(self) -> usize {
        match self {
            EncryptionType::NoEncryption => 0,
            EncryptionType::Aes256Gcm => 32,
        }
    }
}

/// Two keys match iff both the type and the byte content are equal.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    encryption_type: EncryptionType,
    bytes: Vec<u8>,
}

impl EncryptionKey {
    pub fn new(encryption_type: EncryptionType, bytes: Vec<u8>) -> Result<Self> {
        let expected = encryption_type.key_length();
        if bytes.len() != expected {
            return Err(StorageError::Internal(format!(
                "invalid key length {} for {:?}; expected {}",
                bytes.len(),
                encryption_type,
                expected
            ))
            .into());
        }
        Ok(Self {
            encryption_type,
            bytes,
        })
    }

    pub fn no_encryption() -> Self {
        Self {
            encryption_type: EncryptionType::NoEncryption,
            bytes: Vec::new(),
        }
    }

    pub fn aes_256_gcm(bytes: Vec<u8>) -> Result<Self> {
        Self::new(EncryptionType::Aes256Gcm, bytes)
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }
}

impl fmt::Debug for EncryptionKey {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("encryption_type", &self.encryption_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_validation() {
        assert!(EncryptionKey::new(EncryptionType::NoEncryption, vec![]).is_ok());
        assert!(EncryptionKey::new(EncryptionType::NoEncryption, vec![1]).is_err());
        assert!(EncryptionKey::aes_256_gcm(vec![0; 32]).is_ok());
        assert!(EncryptionKey::aes_256_gcm(vec![0; 16]).is_err());
    }

    #[test]
    fn equality_is_type_and_bytes() {
        let a = EncryptionKey::aes_256_gcm(vec![1; 32]).unwrap();
        let b = EncryptionKey::aes_256_gcm(vec![1; 32]).unwrap();
        let c = EncryptionKey::aes_256_gcm(vec![2; 32]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, EncryptionKey::no_encryption());
    }

    #[test]
    fn debug_hides_key_material() {
        let key = EncryptionKey::aes_256_gcm(vec![0xAB; 32]).unwrap();
        let printed = format!("{key:?}");
        assert!(!printed.contains("171"));
        assert!(!printed.to_lowercase().contains("ab, ab"));
    }
}
