//! In-process block store
//!
//! Backs both channels with one shared map. Handles keep their own set of
//! attached modules the way separate server connections would. The router
//! side can be told to lag, answering "not indexed" to a number of attach
//! requests first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::proto::{BlockKey, CachedBlock};
use super::transport::{LookupChannel, LookupReply, PublishChannel};
use crate::error::TransportError;
use crate::memory::modules::ModuleId;

type Entry = (u64, u64, [u8; 32]);

#[derive(Default)]
pub struct MemoryStore {
    blocks: RwLock<HashMap<ModuleId, BTreeMap<Entry, (Vec<u8>, Vec<u8>)>>>,
    index_lag: AtomicU32,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next `n` router attaches with "not indexed"
    pub fn set_index_lag(&self, n: u32) {
        self.index_lag.store(n, Ordering::Release);
    }

    /// Fail every channel operation with an I/O error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn publisher(self: &Arc<Self>) -> MemoryPublisher {
        MemoryPublisher {
            store: Arc::clone(self),
            attached: Mutex::new(HashSet::new()),
        }
    }

    pub fn router(self: &Arc<Self>) -> MemoryRouter {
        MemoryRouter {
            store: Arc::clone(self),
            attached: Mutex::new(HashSet::new()),
        }
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &BlockKey) -> Option<(Vec<u8>, Vec<u8>)> {
        self.blocks
            .read()
            .get(&key.module)?
            .get(&(key.addr, key.size, key.sign))
            .cloned()
    }

    fn insert(&self, key: &BlockKey, meta: &[u8], code: &[u8]) {
        self.blocks
            .write()
            .entry(key.module.clone())
            .or_default()
            .insert((key.addr, key.size, key.sign), (meta.to_vec(), code.to_vec()));
    }

    fn blocks_of(&self, module: &ModuleId) -> Vec<CachedBlock> {
        self.blocks
            .read()
            .get(module)
            .map(|m| {
                m.iter()
                    .map(|(&(addr, size, sign), (meta, code))| CachedBlock {
                        addr,
                        size,
                        sign,
                        meta: meta.clone(),
                        code: code.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "store offline").into());
        }
        Ok(())
    }
}

pub struct MemoryPublisher {
    store: Arc<MemoryStore>,
    attached: Mutex<HashSet<ModuleId>>,
}

impl PublishChannel for MemoryPublisher {
    fn attach(&self, modules: &[ModuleId]) -> Result<(), TransportError> {
        self.store.check_online()?;
        self.attached.lock().extend(modules.iter().cloned());
        Ok(())
    }

    fn publish(&self, key: &BlockKey, meta: &[u8], code: &[u8]) -> Result<(), TransportError> {
        self.store.check_online()?;
        if !self.attached.lock().contains(&key.module) {
            return Err(TransportError::NotAttached(key.module.clone()));
        }
        self.store.insert(key, meta, code);
        Ok(())
    }
}

pub struct MemoryRouter {
    store: Arc<MemoryStore>,
    attached: Mutex<HashSet<ModuleId>>,
}

impl LookupChannel for MemoryRouter {
    fn attach(&self, modules: &[ModuleId]) -> Result<(), TransportError> {
        self.store.check_online()?;
        let lagging = self
            .store
            .index_lag
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if lagging {
            return Err(TransportError::NotIndexed);
        }
        self.attached.lock().extend(modules.iter().cloned());
        Ok(())
    }

    fn lookup(&self, key: &BlockKey) -> Result<LookupReply, TransportError> {
        self.store.check_online()?;
        if !self.attached.lock().contains(&key.module) {
            return Ok(LookupReply::ModuleNotAttached);
        }
        Ok(match self.store.get(key) {
            Some((meta, code)) => LookupReply::Found { meta, code },
            None => LookupReply::NotFound,
        })
    }

    fn enumerate(&self, module: &ModuleId) -> Result<Vec<CachedBlock>, TransportError> {
        self.store.check_online()?;
        if !self.attached.lock().contains(module) {
            return Err(TransportError::NotAttached(module.clone()));
        }
        Ok(self.store.blocks_of(module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sign: u8) -> BlockKey {
        BlockKey {
            module: ModuleId::from("m"),
            addr: 0x1000,
            size: 16,
            sign: [sign; 32],
        }
    }

    #[test]
    fn test_publish_requires_attach() {
        let store = MemoryStore::new();
        let p = store.publisher();
        assert!(matches!(p.publish(&key(1), b"m", b"c"), Err(TransportError::NotAttached(_))));
        p.attach(&[ModuleId::from("m")]).unwrap();
        p.publish(&key(1), b"m", b"c").unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_router_reports_unattached_module() {
        let store = MemoryStore::new();
        let p = store.publisher();
        p.attach(&[ModuleId::from("m")]).unwrap();
        p.publish(&key(1), b"m", b"c").unwrap();

        let r = store.router();
        assert_eq!(r.lookup(&key(1)).unwrap(), LookupReply::ModuleNotAttached);
        r.attach(&[ModuleId::from("m")]).unwrap();
        assert!(matches!(r.lookup(&key(1)).unwrap(), LookupReply::Found { .. }));
        assert_eq!(r.lookup(&key(2)).unwrap(), LookupReply::NotFound);
        assert_eq!(r.enumerate(&ModuleId::from("m")).unwrap().len(), 1);
    }

    #[test]
    fn test_index_lag_and_offline() {
        let store = MemoryStore::new();
        store.set_index_lag(2);
        let r = store.router();
        let m = [ModuleId::from("m")];
        assert!(matches!(r.attach(&m), Err(TransportError::NotIndexed)));
        assert!(matches!(r.attach(&m), Err(TransportError::NotIndexed)));
        assert!(r.attach(&m).is_ok());

        store.set_offline(true);
        assert!(matches!(r.lookup(&key(1)), Err(TransportError::Io(_))));
    }
}
