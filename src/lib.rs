//! cs2dynarec
//!
//! Block manager of a dynamic binary translator, with a content-addressed
//! code cache shared between processes. Translated blocks are found through
//! a lock-free jump directory, validated against guest writes by hash, and
//! reused across processes whenever the guest bytes are identical.

pub mod cache;
pub mod config;
pub mod cpu;
pub mod dynarec;
pub mod error;
pub mod memory;

use std::io::{self, Read};

pub use cache::{CacheClient, CacheServer, MemoryStore};
pub use config::DynarecConfig;
pub use dynarec::{AbortReason, DynaBlock, Dynarec, DynarecBuilder, ExecContext, JumpEntry, NativeExits};
pub use error::{CacheError, DynarecError};
pub use memory::modules::{ModuleId, ModuleMap};
pub use memory::{FlatMemory, GuestMemory};

/// zstd frame magic
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
/// gzip member magic
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decompress zstd-compressed data
pub fn decompress_zstd(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::stream::decode_all(data)
}

/// Decompress gzip-compressed data
pub fn decompress_gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)?;
    Ok(result)
}

/// Guest image bytes, decompressed when they carry a zstd or gzip header
pub fn load_image(data: &[u8]) -> io::Result<Vec<u8>> {
    if data.starts_with(&ZSTD_MAGIC) {
        decompress_zstd(data)
    } else if data.starts_with(&GZIP_MAGIC) {
        decompress_gzip(data)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_image_formats() {
        let raw = vec![0x13, 0, 0, 0, 0x67, 0x80, 0, 0];
        assert_eq!(load_image(&raw).unwrap(), raw);

        let zst = zstd::stream::encode_all(&raw[..], 3).unwrap();
        assert_eq!(load_image(&zst).unwrap(), raw);

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&raw).unwrap();
        assert_eq!(load_image(&gz.finish().unwrap()).unwrap(), raw);
    }

    #[test]
    fn test_truncated_zstd_is_an_error() {
        assert!(load_image(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]).is_err());
    }
}
