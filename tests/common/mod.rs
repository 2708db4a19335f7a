#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cs2dynarec::cpu::rv32::asm::assemble;
use cs2dynarec::error::GuestFault;
use cs2dynarec::memory::modules::ModuleResolver;
use cs2dynarec::{CacheClient, Dynarec, DynarecConfig, FlatMemory, GuestMemory, MemoryStore, ModuleMap};

/// Guest image of `words` at `base`
pub fn image(base: u64, words: &[u32]) -> Arc<FlatMemory> {
    Arc::new(FlatMemory::new(base, assemble(words)))
}

pub fn plain(mem: &Arc<FlatMemory>) -> Dynarec {
    Dynarec::builder(mem.clone()).build().unwrap()
}

/// Dynarec with module `name` covering the whole image, loaded `delta`
/// bytes away from where it was linked, and a client on `store`
pub fn cached(mem: &Arc<FlatMemory>, name: &str, delta: u64, store: &Arc<MemoryStore>, config: DynarecConfig) -> Dynarec {
    let modules = Arc::new(ModuleMap::new());
    modules.insert(name.into(), mem.base(), mem.len() as u64, delta);
    let client = CacheClient::in_memory(store).with_backoff(Duration::from_millis(1));
    Dynarec::builder(mem.clone())
        .modules(modules as Arc<dyn ModuleResolver>)
        .cache(client)
        .config(DynarecConfig { cs2c: true, ..config })
        .build()
        .unwrap()
}

/// Guest memory whose first read parks the reading thread. The thread
/// reports on `entered` and resumes once `release` fires, so a test can act
/// while a compile sits inside the mutation lock.
pub struct GatedMemory {
    inner: Arc<FlatMemory>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl GatedMemory {
    /// Returns the memory, the `entered` receiver and the `release` sender
    pub fn new(inner: Arc<FlatMemory>) -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let mem = Arc::new(Self {
            inner,
            gate: Mutex::new(Some((entered_tx, release_rx))),
        });
        (mem, entered_rx, release_tx)
    }
}

impl GuestMemory for GatedMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), GuestFault> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
        self.inner.read(addr, buf)
    }

    fn is_mapped(&self, addr: u64, len: u64) -> bool {
        self.inner.is_mapped(addr, len)
    }

    fn protect(&self, addr: u64, size: u64) {
        self.inner.protect(addr, size)
    }

    fn is_protected(&self, addr: u64, size: u64) -> bool {
        self.inner.is_protected(addr, size)
    }

    fn need_test(&self, addr: u64) -> bool {
        self.inner.need_test(addr)
    }

    fn never_clean(&self, addr: u64) -> bool {
        self.inner.never_clean(addr)
    }

    fn has_alternate(&self, addr: u64) -> bool {
        self.inner.has_alternate(addr)
    }

    fn is_hot_page(&self, addr: u64) -> bool {
        self.inner.is_hot_page(addr)
    }
}
