//! Guest code signatures
//!
//! Two digests over the exact guest bytes of a block:
//! - the X31 hash, cheap enough to recompute at every block entry that
//!   needs testing, detects self-modifying code;
//! - the [`CodeSign`] SHA-256 digest is part of the shared cache key, so a
//!   cached block is only reused for byte-identical guest code.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GuestFault;
use crate::memory::GuestMemory;

/// X31 string hash (`h = h * 31 + byte`), zero for an empty range
pub fn x31_hash(bytes: &[u8]) -> u32 {
    let Some((&first, rest)) = bytes.split_first() else {
        return 0;
    };
    let mut h = first as i32;
    for &b in rest {
        h = (h << 5).wrapping_sub(h).wrapping_add(b as i32);
    }
    h as u32
}

/// X31 hash of guest bytes `[addr, addr+size)`
pub fn hash_guest(mem: &dyn GuestMemory, addr: u64, size: u64) -> Result<u32, GuestFault> {
    Ok(x31_hash(&mem.read_vec(addr, size as usize)?))
}

/// Content digest of guest code
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeSign(pub [u8; 32]);

impl CodeSign {
    pub fn compute(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn of_guest(mem: &dyn GuestMemory, addr: u64, size: u64) -> Result<Self, GuestFault> {
        Ok(Self::compute(&mem.read_vec(addr, size as usize)?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for CodeSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeSign(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}
