use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

pub mod bans;
pub mod enforcer;
pub mod exemptions;

/// Size of the store file header : 4 byte magic + schema version byte.
pub(crate) const HEADER_LEN: u64 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Not a store file : bad magic")]
    BadMagic,
    #[error("Unsupported schema version : {0}")]
    UnsupportedSchema(u8),
    #[error("No entry at position {0}")]
    UnknownPosition(usize),
}

pub(crate) fn check_header(data: &[u8], magic: &[u8; 4], current: u8) -> Result<u8, StoreError> {
    if data.len() < HEADER_LEN as usize || &data[..4] != magic {
        return Err(StoreError::BadMagic);
    }
    let schema = data[4];
    if schema == 0 || schema > current {
        return Err(StoreError::UnsupportedSchema(schema));
    }
    Ok(schema)
}

pub(crate) fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String, StoreError> {
    let len = cur.read_u16::<LittleEndian>()? as usize;
    let start = cur.position() as usize;
    let data = *cur.get_ref();
    let end = start + len;
    if end > data.len() {
        return Err(StoreError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)));
    }
    cur.set_position(end as u64);
    Ok(String::from_utf8_lossy(&data[start..end]).into_owned())
}

pub(crate) fn write_string(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_le_bytes());
    buf.extend_from_slice(&bytes[..len]);
}
