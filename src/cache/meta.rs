//! Fixed-layout block metadata stored next to the cached native bytes

use crate::dynarec::block::{round8, BlockLayout, PTR};
use crate::error::CacheError;

use super::proto::MAX_FRAME;

/// Encoded size of [`CacheMeta`]
pub const META_SIZE: usize = 32;

/// Largest region a cached block may ask for
pub const MAX_REGION: usize = MAX_FRAME;

/// What a hit needs to rebuild a block region without compiling:
///
/// ```text
/// 0   native_size   u64   rounded native code bytes
/// 8   table64_size  u64   table64 entries
/// 16  insts_rsize   u64   size map bytes
/// 24  isize         u32   guest instructions
/// 28  alternate     u8
/// 29  always_test   u8
/// 30  dirty         u8
/// 31  reserved      u8
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMeta {
    pub native_size: u64,
    pub table64_size: u64,
    pub insts_rsize: u64,
    pub isize: u32,
    pub alternate: bool,
    pub always_test: bool,
    pub dirty: bool,
}

impl CacheMeta {
    pub fn to_bytes(&self) -> [u8; META_SIZE] {
        let mut out = [0u8; META_SIZE];
        out[0..8].copy_from_slice(&self.native_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.table64_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.insts_rsize.to_le_bytes());
        out[24..28].copy_from_slice(&self.isize.to_le_bytes());
        out[28] = self.alternate as u8;
        out[29] = self.always_test as u8;
        out[30] = self.dirty as u8;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        let bytes: &[u8; META_SIZE] = bytes.try_into().map_err(|_| CacheError::MetaSize {
            expected: META_SIZE,
            actual: bytes.len(),
        })?;
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[off..off + 8]);
            u64::from_le_bytes(b)
        };
        Ok(Self {
            native_size: u64_at(0),
            table64_size: u64_at(8),
            insts_rsize: u64_at(16),
            isize: u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            alternate: bytes[28] != 0,
            always_test: bytes[29] != 0,
            dirty: bytes[30] != 0,
        })
    }

    pub fn from_layout(layout: &BlockLayout, isize: u32, alternate: bool, always_test: bool, dirty: bool) -> Self {
        Self {
            native_size: layout.native_size as u64,
            table64_size: layout.table64_size as u64,
            insts_rsize: layout.insts_rsize as u64,
            isize,
            alternate,
            always_test,
            dirty,
        }
    }

    /// Region layout the metadata describes
    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(
            self.native_size as usize,
            self.table64_size as usize,
            self.insts_rsize as usize,
        )
    }

    /// Region size the metadata asks for, if the sections are well formed
    /// and the total stays under [`MAX_REGION`]
    pub fn region_size(&self) -> Option<usize> {
        let native = usize::try_from(self.native_size).ok()?;
        let table = usize::try_from(self.table64_size).ok()?.checked_mul(8)?;
        let insts = usize::try_from(self.insts_rsize).ok()?;
        if native != round8(native) || insts != round8(insts) {
            return None;
        }
        let total = (5 * PTR).checked_add(native)?.checked_add(table)?.checked_add(insts)?;
        (total <= MAX_REGION).then_some(total)
    }

    /// Check a code blob against the metadata
    pub fn check_code(&self, code: &[u8]) -> Result<(), CacheError> {
        if self.region_size().is_none() {
            return Err(CacheError::MetaBounds {
                native_size: self.native_size,
                table64_size: self.table64_size,
                insts_rsize: self.insts_rsize,
            });
        }
        if code.len() as u64 != self.native_size {
            return Err(CacheError::CodeSize {
                expected: self.native_size as usize,
                actual: code.len(),
            });
        }
        Ok(())
    }
}
