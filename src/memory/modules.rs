//! Module registry
//!
//! Cache keys are module relative: a block compiled at `load + off` in one
//! process is found again at `load' + off` in another. The resolver answers
//! which module owns an address and how far it was relocated.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Stable identity of a guest module (typically its path)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Owning module of an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: ModuleId,
    /// Current load address minus link-time address
    pub delta: u64,
}

pub trait ModuleResolver: Send + Sync {
    fn module_of(&self, addr: u64) -> Option<ModuleInfo>;

    /// Mark the module owning `addr` as preloaded. Returns the previous
    /// state; addresses outside any module report `true` so nothing is preloaded.
    fn test_and_set_preloaded(&self, addr: u64) -> bool;
}

struct Mapping {
    end: u64,
    id: ModuleId,
    delta: u64,
    preloaded: bool,
}

/// Address-range module table
#[derive(Default)]
pub struct ModuleMap {
    ranges: RwLock<BTreeMap<u64, Mapping>>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `[start, start+size)` as module `id` relocated by `delta`
    pub fn insert(&self, id: ModuleId, start: u64, size: u64, delta: u64) {
        self.ranges.write().insert(
            start,
            Mapping {
                end: start + size,
                id,
                delta,
                preloaded: false,
            },
        );
    }
}

impl ModuleResolver for ModuleMap {
    fn module_of(&self, addr: u64) -> Option<ModuleInfo> {
        let ranges = self.ranges.read();
        let (_, m) = ranges.range(..=addr).next_back()?;
        (addr < m.end).then(|| ModuleInfo {
            id: m.id.clone(),
            delta: m.delta,
        })
    }

    fn test_and_set_preloaded(&self, addr: u64) -> bool {
        let mut ranges = self.ranges.write();
        match ranges.range_mut(..=addr).next_back() {
            Some((_, m)) if addr < m.end => std::mem::replace(&mut m.preloaded, true),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_lookup() {
        let map = ModuleMap::new();
        map.insert("libc".into(), 0x1000, 0x1000, 0x800);
        map.insert("app".into(), 0x4000, 0x100, 0);

        let info = map.module_of(0x1fff).unwrap();
        assert_eq!(info.id.as_str(), "libc");
        assert_eq!(info.delta, 0x800);
        assert!(map.module_of(0x2000).is_none());
        assert!(map.module_of(0x0fff).is_none());
        assert_eq!(map.module_of(0x4000).unwrap().id, ModuleId::new("app"));
    }

    #[test]
    fn test_preloaded_flag() {
        let map = ModuleMap::new();
        map.insert("m".into(), 0x1000, 0x100, 0);
        assert!(!map.test_and_set_preloaded(0x1010));
        assert!(map.test_and_set_preloaded(0x1020));
        // unmapped addresses never preload
        assert!(map.test_and_set_preloaded(0x9000));
    }
}
