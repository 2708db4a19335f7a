//! Distributed code cache client
//!
//! Blocks are keyed by `(module, module-relative address, guest length,
//! SHA-256 of the guest bytes)`, so a block compiled by one process is
//! reused by any other process running byte-identical code, wherever the
//! module is loaded.

pub mod memory;
pub mod meta;
pub mod proto;
pub mod server;
pub mod transport;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::dynarec::hash::CodeSign;
use crate::error::{CacheError, TransportError};
use crate::memory::modules::ModuleId;

pub use memory::MemoryStore;
pub use meta::{CacheMeta, META_SIZE};
pub use proto::{BlockKey, CachedBlock};
pub use server::CacheServer;
pub use transport::{LookupChannel, LookupReply, PublishChannel, TcpLookup, TcpPublish};

/// Attach attempts made from inside a lookup before giving up on the cache
const ON_DEMAND_ATTACH_ATTEMPTS: u32 = 3;

/// Native bytes of a cache hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCode {
    pub meta: CacheMeta,
    pub code: Vec<u8>,
}

/// A decoded enumeration entry handed to the preload visitor
#[derive(Debug, Clone)]
pub struct PreloadEntry {
    /// Module-relative guest address
    pub addr: u64,
    pub size: u64,
    pub sign: CodeSign,
    pub cached: CachedCode,
}

pub struct CacheClient {
    publish: Box<dyn PublishChannel>,
    lookup: Box<dyn LookupChannel>,
    backoff: Duration,
}

impl CacheClient {
    pub fn new(publish: Box<dyn PublishChannel>, lookup: Box<dyn LookupChannel>) -> Self {
        Self {
            publish,
            lookup,
            backoff: Duration::from_millis(1000),
        }
    }

    /// Client over an in-process store
    pub fn in_memory(store: &Arc<MemoryStore>) -> Self {
        Self::new(Box::new(store.publisher()), Box::new(store.router()))
    }

    /// Open both channels to a TCP server
    pub fn connect(addr: &str) -> Result<Self, CacheError> {
        let connect_err = |source| CacheError::Connect {
            addr: addr.to_string(),
            source,
        };
        let publish = TcpPublish::connect(addr).map_err(connect_err)?;
        let lookup = TcpLookup::connect(addr).map_err(connect_err)?;
        Ok(Self::new(Box::new(publish), Box::new(lookup)))
    }

    /// Delay between lookup-side attach attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Register modules on both channels. The publish side must accept them;
    /// the lookup side is retried while the router has not indexed them yet.
    pub fn attach(&self, modules: &[ModuleId]) -> Result<(), CacheError> {
        self.publish.attach(modules).map_err(CacheError::Attach)?;
        self.attach_lookup(modules, None)?;
        Ok(())
    }

    /// Lookup-side attach. Retryable failures sleep the back-off and try
    /// again, at most `limit` attempts in total when a limit is given.
    fn attach_lookup(&self, modules: &[ModuleId], limit: Option<u32>) -> Result<(), TransportError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.lookup.attach(modules) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && limit.map_or(true, |n| attempts < n) => {
                    debug!(error = %e, attempts, "lookup attach pending");
                    thread::sleep(self.backoff);
                }
                Err(e) => {
                    warn!(error = %e, attempts, "lookup attach failed");
                    return Err(e);
                }
            }
        }
    }

    /// Look a block up. A reply saying the module is unknown triggers one
    /// attach and one retry.
    pub fn lookup(&self, module: &ModuleId, addr: u64, size: u64, sign: &CodeSign) -> Result<Option<CachedCode>, CacheError> {
        let key = BlockKey {
            module: module.clone(),
            addr,
            size,
            sign: sign.0,
        };
        let mut reply = self.lookup.lookup(&key)?;
        if reply == LookupReply::ModuleNotAttached {
            debug!(%module, "attaching module on demand");
            self.attach_lookup(std::slice::from_ref(module), Some(ON_DEMAND_ATTACH_ATTEMPTS))?;
            reply = self.lookup.lookup(&key)?;
        }
        match reply {
            LookupReply::Found { meta, code } => Ok(Some(decode(&meta, code)?)),
            LookupReply::NotFound => Ok(None),
            LookupReply::ModuleNotAttached => Err(CacheError::NotAttached(module.clone())),
        }
    }

    /// Push a compiled block. Failures are logged and swallowed.
    pub fn publish(&self, module: &ModuleId, addr: u64, size: u64, sign: &CodeSign, meta: &CacheMeta, code: &[u8]) {
        let key = BlockKey {
            module: module.clone(),
            addr,
            size,
            sign: sign.0,
        };
        let meta = meta.to_bytes();
        let mut res = self.publish.publish(&key, &meta, code);
        if let Err(TransportError::NotAttached(_)) = res {
            res = self
                .publish
                .attach(std::slice::from_ref(module))
                .and_then(|()| self.publish.publish(&key, &meta, code));
        }
        if let Err(e) = res {
            warn!(%module, addr = format_args!("{addr:#x}"), error = %e, "publish failed");
        }
    }

    /// Walk every cached block of `module`. Entries with broken metadata are
    /// skipped. Returns the number of entries handed to `visit`.
    pub fn preload(&self, module: &ModuleId, mut visit: impl FnMut(PreloadEntry)) -> Result<usize, CacheError> {
        let blocks = match self.lookup.enumerate(module) {
            Err(TransportError::NotAttached(_)) => {
                self.attach_lookup(std::slice::from_ref(module), Some(ON_DEMAND_ATTACH_ATTEMPTS))?;
                self.lookup.enumerate(module)?
            }
            other => other?,
        };
        let mut count = 0;
        for b in blocks {
            match decode(&b.meta, b.code) {
                Ok(cached) => {
                    visit(PreloadEntry {
                        addr: b.addr,
                        size: b.size,
                        sign: CodeSign(b.sign),
                        cached,
                    });
                    count += 1;
                }
                Err(e) => warn!(%module, addr = format_args!("{:#x}", b.addr), error = %e, "skipping cached block"),
            }
        }
        Ok(count)
    }
}

fn decode(meta: &[u8], code: Vec<u8>) -> Result<CachedCode, CacheError> {
    let meta = CacheMeta::from_bytes(meta)?;
    meta.check_code(&code)?;
    Ok(CachedCode { meta, code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn meta(native: u64) -> CacheMeta {
        CacheMeta {
            native_size: native,
            table64_size: 1,
            insts_rsize: 8,
            isize: 4,
            ..Default::default()
        }
    }

    fn client(store: &Arc<MemoryStore>) -> CacheClient {
        CacheClient::in_memory(store).with_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_publish_then_lookup() {
        let store = MemoryStore::new();
        let c = client(&store);
        let m = ModuleId::from("m");
        c.attach(std::slice::from_ref(&m)).unwrap();
        let s1 = CodeSign::compute(b"one");
        let s2 = CodeSign::compute(b"two");
        c.publish(&m, 0x1000, 16, &s1, &meta(8), &[0xab; 8]);

        let hit = c.lookup(&m, 0x1000, 16, &s1).unwrap().unwrap();
        assert_eq!(hit.meta, meta(8));
        assert_eq!(hit.code, vec![0xab; 8]);
        assert!(c.lookup(&m, 0x1000, 16, &s2).unwrap().is_none());
        assert!(c.lookup(&m, 0x1000, 12, &s1).unwrap().is_none());
    }

    #[test]
    fn test_lookup_attaches_on_demand() {
        let store = MemoryStore::new();
        let writer = client(&store);
        let m = ModuleId::from("m");
        writer.attach(std::slice::from_ref(&m)).unwrap();
        let s = CodeSign::compute(b"x");
        writer.publish(&m, 0, 4, &s, &meta(8), &[1; 8]);

        // fresh client, never attached
        let reader = client(&store);
        assert!(reader.lookup(&m, 0, 4, &s).unwrap().is_some());
    }

    #[test]
    fn test_attach_waits_for_index() {
        let store = MemoryStore::new();
        store.set_index_lag(3);
        let c = client(&store);
        c.attach(&[ModuleId::from("m")]).unwrap();
        assert!(c.lookup(&ModuleId::from("m"), 0, 4, &CodeSign::compute(b"")).unwrap().is_none());
    }

    #[test]
    fn test_publish_errors_are_swallowed() {
        let store = MemoryStore::new();
        let c = client(&store);
        store.set_offline(true);
        c.publish(&ModuleId::from("m"), 0, 4, &CodeSign::compute(b""), &meta(8), &[0; 8]);
        assert!(store.is_empty());
        assert!(c.attach(&[ModuleId::from("m")]).is_err());
    }

    #[test]
    fn test_code_length_checked_on_hit() {
        let store = MemoryStore::new();
        let c = client(&store);
        let m = ModuleId::from("m");
        c.attach(std::slice::from_ref(&m)).unwrap();
        let s = CodeSign::compute(b"y");
        c.publish(&m, 0, 4, &s, &meta(16), &[0; 8]);
        assert!(matches!(c.lookup(&m, 0, 4, &s), Err(CacheError::CodeSize { expected: 16, actual: 8 })));
    }

    #[test]
    fn test_preload_enumerates_module() {
        let store = MemoryStore::new();
        let c = client(&store);
        let m = ModuleId::from("m");
        c.attach(std::slice::from_ref(&m)).unwrap();
        for i in 0..3u64 {
            c.publish(&m, i * 0x10, 4, &CodeSign::compute(&[i as u8]), &meta(8), &[0; 8]);
        }
        let mut seen = Vec::new();
        let n = c.preload(&m, |e| seen.push(e.addr)).unwrap();
        assert_eq!(n, 3);
        assert_eq!(seen, vec![0, 0x10, 0x20]);
    }

    /// Router that never knows any module and fails every attach with `fail`
    struct StuckRouter {
        attaches: Arc<AtomicU32>,
        fail: fn() -> TransportError,
    }

    impl LookupChannel for StuckRouter {
        fn attach(&self, _modules: &[ModuleId]) -> Result<(), TransportError> {
            self.attaches.fetch_add(1, Ordering::Relaxed);
            Err((self.fail)())
        }

        fn lookup(&self, _key: &BlockKey) -> Result<LookupReply, TransportError> {
            Ok(LookupReply::ModuleNotAttached)
        }

        fn enumerate(&self, module: &ModuleId) -> Result<Vec<CachedBlock>, TransportError> {
            Err(TransportError::NotAttached(module.clone()))
        }
    }

    fn stuck(store: &Arc<MemoryStore>, fail: fn() -> TransportError) -> (CacheClient, Arc<AtomicU32>) {
        let attaches = Arc::new(AtomicU32::new(0));
        let router = StuckRouter {
            attaches: Arc::clone(&attaches),
            fail,
        };
        let c = CacheClient::new(Box::new(store.publisher()), Box::new(router)).with_backoff(Duration::from_millis(1));
        (c, attaches)
    }

    #[test]
    fn test_broken_router_fails_lookup_at_once() {
        let store = MemoryStore::new();
        let (c, attaches) = stuck(&store, || TransportError::Remote("router broken".into()));
        let m = ModuleId::from("m");
        let res = c.lookup(&m, 0, 4, &CodeSign::compute(b"z"));
        assert!(matches!(res, Err(CacheError::Transport(TransportError::Remote(_)))));
        assert_eq!(attaches.load(Ordering::Relaxed), 1);
        assert!(c.preload(&m, |_| {}).is_err());
        assert!(c.attach(std::slice::from_ref(&m)).is_err());
    }

    #[test]
    fn test_on_demand_attach_gives_up_after_retries() {
        let store = MemoryStore::new();
        let (c, attaches) = stuck(&store, || TransportError::NotIndexed);
        let res = c.lookup(&ModuleId::from("m"), 0, 4, &CodeSign::compute(b"z"));
        assert!(matches!(res, Err(CacheError::Transport(TransportError::NotIndexed))));
        assert_eq!(attaches.load(Ordering::Relaxed), ON_DEMAND_ATTACH_ATTEMPTS);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TransportError::NotIndexed.is_retryable());
        assert!(TransportError::Io(std::io::ErrorKind::ConnectionReset.into()).is_retryable());
        assert!(!TransportError::Remote(String::new()).is_retryable());
        assert!(!TransportError::Protocol(String::new()).is_retryable());
    }
}
