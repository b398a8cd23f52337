//! # Array Metadata
//!
//! Types describing what lives inside an array directory: the schema
//! ([`ArraySchema`]), per-fragment metadata ([`FragmentMetadata`],
//! [`FragmentInfo`]), the interned registry entry ([`OpenArray`]), and
//! encryption keys.
//!
//! ## Generic Blob Format
//!
//! Schema and fragment-metadata files share one envelope:
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Magic: "TSRTILE\0"
//! 8       4     Format version (LE)
//! 12      1     Encryption type
//! 13      8     Body length (LE)
//! 21      n     Body
//! 21+n    8     CRC64-ECMA over the body (LE)
//! ```
//!
//! The header is readable without the key, which is how
//! `array_get_encryption` reports the encryption type of an array
//! nobody has opened. Body encoding is plain little-endian with
//! length-prefixed strings.

mod fragment;
mod key;
mod open_array;
mod schema;

pub use fragment::{AttributeSizes, FragmentInfo, FragmentMetadata};
pub use key::{EncryptionKey, EncryptionType};
pub use open_array::OpenArray;
pub use schema::{
    range_from_i64, ArraySchema, ArrayType, Attribute, Datatype, Domain, CELL_VAR_OFFSET_SIZE,
    VAR_NUM,
};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::Result;

use crate::config::STORAGE_FORMAT_VERSION;
use crate::error::StorageError;
use crate::uri::Uri;
use crate::vfs::Vfs;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const GENERIC_BLOB_MAGIC: &[u8; 8] = b"TSRTILE\0";
pub const GENERIC_BLOB_HEADER_SIZE: u64 = 21;

#[derive(Debug, Clone, Copy)]
pub struct GenericBlobHeader {
    pub version: u32,
    pub encryption_type: EncryptionType,
    pub body_len: u64,
}

/// Writes `body` to `uri` in the generic envelope, replacing any
/// existing file.
pub(crate) fn write_generic_blob(
    vfs: &Vfs,
    uri: &Uri,
    body: &[u8],
    key: &EncryptionKey,
) -> Result<()> {
    let mut out = Vec::with_capacity(GENERIC_BLOB_HEADER_SIZE as usize + body.len() + 8);
    out.extend_from_slice(GENERIC_BLOB_MAGIC);
    put_u32(&mut out, STORAGE_FORMAT_VERSION);
    out.push(key.encryption_type().to_u8());
    put_u64(&mut out, body.len() as u64);
    out.extend_from_slice(body);
    put_u64(&mut out, CRC64.checksum(body));

    if vfs.is_file(uri)? {
        vfs.remove_file(uri)?;
    }
    vfs.write(uri, &out)?;
    vfs.close_file(uri)?;
    Ok(())
}

/// Reads and validates just the envelope header.
pub(crate) fn read_generic_blob_header(vfs: &Vfs, uri: &Uri) -> Result<GenericBlobHeader> {
    let raw = vfs.read(uri, 0, GENERIC_BLOB_HEADER_SIZE)?;
    parse_header(&raw, uri)
}

/// Reads the envelope, checks magic, version, CRC, and key agreement,
/// and returns the body.
pub(crate) fn read_generic_blob(vfs: &Vfs, uri: &Uri, key: &EncryptionKey) -> Result<Vec<u8>> {
    let raw = vfs.read_all(uri)?;
    if raw.len() < GENERIC_BLOB_HEADER_SIZE as usize + 8 {
        return Err(blob_error(uri, "file truncated").into());
    }
    let header = parse_header(&raw[..GENERIC_BLOB_HEADER_SIZE as usize], uri)?;

    if header.encryption_type != key.encryption_type() {
        return Err(StorageError::EncryptionMismatch(uri.to_string()).into());
    }

    let body_start = GENERIC_BLOB_HEADER_SIZE as usize;
    let body_end = body_start + header.body_len as usize;
    if raw.len() < body_end + 8 {
        return Err(blob_error(uri, "body truncated").into());
    }
    let body = &raw[body_start..body_end];

    let mut crc_bytes = [0u8; 8];
    crc_bytes.copy_from_slice(&raw[body_end..body_end + 8]);
    if CRC64.checksum(body) != u64::from_le_bytes(crc_bytes) {
        return Err(blob_error(uri, "checksum mismatch").into());
    }

    Ok(body.to_vec())
}

fn parse_header(raw: &[u8], uri: &Uri) -> Result<GenericBlobHeader> {
    if raw.len() < GENERIC_BLOB_HEADER_SIZE as usize {
        return Err(blob_error(uri, "header truncated").into());
    }
    if &raw[..8] != GENERIC_BLOB_MAGIC {
        return Err(blob_error(uri, "bad magic").into());
    }
    let version = u32::from_le_bytes(raw[8..12].try_into().unwrap());
    if version != STORAGE_FORMAT_VERSION {
        return Err(blob_error(uri, format!("unsupported version {version}")).into());
    }
    let encryption_type = EncryptionType::from_u8(raw[12])
        .ok_or_else(|| blob_error(uri, format!("unknown encryption type {}", raw[12])))?;
    let body_len = u64::from_le_bytes(raw[13..21].try_into().unwrap());

    Ok(GenericBlobHeader {
        version,
        encryption_type,
        body_len,
    })
}

fn blob_error(uri: &Uri, reason: impl AsRef<str>) -> StorageError {
    StorageError::Internal(format!("malformed blob at '{uri}': {}", reason.as_ref()))
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// Cursor over a little-endian body.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(StorageError::Internal(format!(
                "decode overrun: need {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len() - self.pos
            ))
            .into());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| StorageError::Internal("non-utf8 string in blob body".into()).into())
    }

    pub fn finished(&self) -> bool {
        self.pos == self.buf.len()
    }
}
