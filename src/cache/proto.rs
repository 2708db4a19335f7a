//! Cache wire protocol
//!
//! Every message is one frame: a little-endian `u32` payload length followed
//! by a zstd-compressed bincode encoding of the message. A connection opens
//! with a [`Hello`] naming its role, answered by [`Response::Ok`].

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::memory::modules::ModuleId;

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted, compressed or not
pub const MAX_FRAME: usize = 64 << 20;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Pushes freshly compiled blocks
    Publish,
    /// Answers lookups through the router
    Lookup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub role: Role,
}

/// Content address of a cached block
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    pub module: ModuleId,
    /// Guest address relative to the module
    pub addr: u64,
    /// Guest byte length
    pub size: u64,
    /// SHA-256 of the guest bytes
    pub sign: [u8; 32],
}

/// One cached block as returned by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBlock {
    /// Module-relative guest address
    pub addr: u64,
    pub size: u64,
    pub sign: [u8; 32],
    pub meta: Vec<u8>,
    pub code: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Register modules on this channel
    Attach { modules: Vec<ModuleId> },
    /// Push one compiled block to the store
    Sync { key: BlockKey, meta: Vec<u8>, code: Vec<u8> },
    Lookup { key: BlockKey },
    /// Every cached block of a module
    Enumerate { module: ModuleId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    /// The router has not indexed the module yet, try again later
    NotIndexed,
    Found { meta: Vec<u8>, code: Vec<u8> },
    NotFound,
    /// Lookup for a module this channel never attached
    ModuleNotAttached,
    Blocks(Vec<CachedBlock>),
    Error(String),
}

pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), TransportError> {
    let raw = bincode::serialize(msg)?;
    let payload = zstd::stream::encode_all(&raw[..], ZSTD_LEVEL)?;
    if payload.len() > MAX_FRAME {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T, TransportError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    let raw = zstd::bulk::decompress(&payload, MAX_FRAME)?;
    Ok(bincode::deserialize(&raw)?)
}
