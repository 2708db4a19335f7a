//! Error types
//!
//! Compile aborts are not errors: they are reported through
//! [`crate::dynarec::AbortReason`] and end in "no block". The
//! types here cover the cases a caller has to act on.

use std::io;

use thiserror::Error;

use crate::memory::modules::ModuleId;

/// Errors raised by the translation core itself
#[derive(Debug, Error)]
pub enum DynarecError {
    /// The host refused to map executable memory
    #[error("failed to map {size} bytes of executable memory: {source}")]
    ExecAlloc { size: usize, source: io::Error },

    /// Switching a region to read+execute failed
    #[error("failed to seal executable region at {addr:#x}: {source}")]
    Protect { addr: usize, source: io::Error },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Invalid configuration value
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Errors of the distributed cache client
#[derive(Debug, Error)]
pub enum CacheError {
    /// Could not reach the cache server at start-up
    #[error("cannot connect to cache server {addr}: {source}")]
    Connect { addr: String, source: TransportError },

    /// Publish-side attach failed; nothing can be published without it
    #[error("publish channel refused module attach: {0}")]
    Attach(TransportError),

    /// Lookup channel still reports the module unknown after an on-demand attach
    #[error("module {0} is not attached on the lookup channel")]
    NotAttached(ModuleId),

    /// Metadata blob does not have the fixed layout size
    #[error("cache metadata is {actual} bytes, expected {expected}")]
    MetaSize { expected: usize, actual: usize },

    /// Metadata asks for a region that cannot be a real block
    #[error("cache metadata out of bounds: native {native_size}, table64 {table64_size}, size map {insts_rsize}")]
    MetaBounds {
        native_size: u64,
        table64_size: u64,
        insts_rsize: u64,
    },

    /// Native code blob disagrees with its metadata
    #[error("cached code is {actual} bytes, metadata says {expected}")]
    CodeSize { expected: usize, actual: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures on a single cache channel
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("encoding: {0}")]
    Encode(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Router has not finished indexing the module yet
    #[error("module not indexed yet")]
    NotIndexed,

    /// Publish channel was used for a module it never attached
    #[error("module {0} not attached")]
    NotAttached(ModuleId),

    #[error("server error: {0}")]
    Remote(String),
}

impl TransportError {
    /// Whether a later attempt on the same channel may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::NotIndexed | TransportError::Io(_))
    }
}

/// Decoder could not make sense of guest bytes
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Fault(#[from] GuestFault),

    #[error("undecodable instruction {raw:#010x} at {addr:#x}")]
    Invalid { addr: u64, raw: u32 },
}

/// Access to unmapped guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest fault at {addr:#x}")]
pub struct GuestFault {
    pub addr: u64,
}
