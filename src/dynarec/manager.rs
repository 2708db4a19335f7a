//! Block lifecycle
//!
//! [`Dynarec`] owns the jump directory, the registry of live blocks and the
//! mutation lock. Lookups through the directory never lock; creating,
//! invalidating and retiring blocks happen under the lock, whose guarded
//! `DumpState` is passed down as proof that it is held.
//!
//! Blocks are shared as `Arc`. Freeing a block unregisters it; its native
//! code is unmapped when the last thread still holding it lets go.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::CacheClient;
use crate::config::DynarecConfig;
use crate::cpu::rv32::Rv32Decoder;
use crate::cpu::Decoder;
use crate::error::DynarecError;
use crate::memory::exec::flush_icache_ranges;
use crate::memory::modules::{ModuleMap, ModuleResolver};
use crate::memory::GuestMemory;

use super::block::DynaBlock;
use super::emit::{Emitter, ThreadedEmitter};
use super::hash::{hash_guest, CodeSign};
use super::helper::{CancelToken, CompileSlot};
use super::jumptable::{JumpEntry, JumpTable};
use super::pipeline::{FillOutcome, NativeExits, Translator};
use super::sizes::SizeHistogram;
use super::stats::{DynarecStats, StatsSnapshot};

/// Per-thread execution state touched by block lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecContext {
    /// The dispatcher may run the block it just looked up
    pub ready: bool,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self { ready: true }
    }
}

/// State guarded by the mutation lock
#[derive(Debug, Default)]
struct DumpState {
    sizes: SizeHistogram,
}

extern "C" fn dispatch_next() {}

extern "C" fn dispatch_epilog() {}

impl Default for NativeExits {
    fn default() -> Self {
        Self {
            next: dispatch_next as usize,
            epilog: dispatch_epilog as usize,
        }
    }
}

/// Bulk hydration bookkeeping
#[derive(Debug, Default)]
struct PreloadStats {
    count: usize,
    /// Lowest and highest native byte touched
    span: Option<(usize, usize)>,
    /// Regions sealed without an icache flush
    pending: Vec<(usize, usize)>,
}

impl PreloadStats {
    fn touch(&mut self, start: usize, end: usize) {
        self.count += 1;
        self.span = Some(match self.span {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
        self.pending.push((start, end));
    }
}

pub struct Dynarec {
    config: DynarecConfig,
    mem: Arc<dyn GuestMemory>,
    modules: Arc<dyn ModuleResolver>,
    decoder: Arc<dyn Decoder>,
    emitter: Arc<dyn Emitter>,
    cache: Option<CacheClient>,
    exits: NativeExits,
    jumps: JumpTable,
    dump: Mutex<DumpState>,
    /// Live and not yet freed blocks, keyed by region base
    blocks: RwLock<BTreeMap<usize, Arc<DynaBlock>>>,
    max_db_size: AtomicU64,
    cancel: CancelToken,
    slot: CompileSlot,
    stats: DynarecStats,
}

pub struct DynarecBuilder {
    mem: Arc<dyn GuestMemory>,
    config: DynarecConfig,
    modules: Option<Arc<dyn ModuleResolver>>,
    decoder: Option<Arc<dyn Decoder>>,
    emitter: Option<Arc<dyn Emitter>>,
    cache: Option<CacheClient>,
    exits: NativeExits,
}

impl DynarecBuilder {
    pub fn config(mut self, config: DynarecConfig) -> Self {
        self.config = config;
        self
    }

    pub fn modules(mut self, modules: Arc<dyn ModuleResolver>) -> Self {
        self.modules = Some(modules);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Use this cache client instead of connecting to `cs2c_server`
    pub fn cache(mut self, cache: CacheClient) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn exits(mut self, exits: NativeExits) -> Self {
        self.exits = exits;
        self
    }

    pub fn build(self) -> Result<Dynarec, DynarecError> {
        let cache = match (self.cache, &self.config.cs2c_server) {
            (Some(cache), _) => Some(cache),
            (None, Some(addr)) if self.config.cs2c => {
                info!(addr = %addr, "connecting to code cache");
                let backoff = Duration::from_millis(self.config.attach_backoff_ms);
                Some(CacheClient::connect(addr)?.with_backoff(backoff))
            }
            (None, _) => {
                if self.config.cs2c {
                    warn!("code cache enabled without a server, running uncached");
                }
                None
            }
        };
        Ok(Dynarec {
            mem: self.mem,
            modules: self.modules.unwrap_or_else(|| Arc::new(ModuleMap::new())),
            decoder: self.decoder.unwrap_or_else(|| Arc::new(Rv32Decoder)),
            emitter: self.emitter.unwrap_or_else(|| Arc::new(ThreadedEmitter)),
            cache,
            exits: self.exits,
            jumps: JumpTable::new(),
            dump: Mutex::new(DumpState::default()),
            blocks: RwLock::new(BTreeMap::new()),
            max_db_size: AtomicU64::new(0),
            cancel: CancelToken::default(),
            slot: CompileSlot::default(),
            stats: DynarecStats::default(),
            config: self.config,
        })
    }
}

impl Dynarec {
    pub fn builder(mem: Arc<dyn GuestMemory>) -> DynarecBuilder {
        DynarecBuilder {
            mem,
            config: DynarecConfig::default(),
            modules: None,
            decoder: None,
            emitter: None,
            cache: None,
            exits: NativeExits::default(),
        }
    }

    pub fn config(&self) -> &DynarecConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&CacheClient> {
        self.cache.as_ref()
    }

    pub fn jump_table(&self) -> &JumpTable {
        &self.jumps
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Largest guest size among live blocks
    pub fn max_db_size(&self) -> u64 {
        self.max_db_size.load(Ordering::Acquire)
    }

    /// Registered blocks, gone ones included until they are freed
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blocks of `size` guest bytes in the live size histogram
    pub fn live_count(&self, size: u64) -> u32 {
        self.dump.lock().sizes.count(size)
    }

    /// Abort the compile in flight, if any. Called from the fault path.
    pub fn cancel_fill(&self) {
        self.cancel.cancel();
    }

    fn translator(&self) -> Translator<'_> {
        Translator {
            config: &self.config,
            mem: &*self.mem,
            modules: &*self.modules,
            decoder: &*self.decoder,
            emitter: &*self.emitter,
            cache: self.cache.as_ref(),
            exits: self.exits,
            cancel: &self.cancel,
            slot: &self.slot,
            stats: &self.stats,
        }
    }

    /// Run `f` on the locked state, locking only if the caller does not hold it
    fn with_dump<R>(&self, held: Option<&mut DumpState>, f: impl FnOnce(&mut DumpState) -> R) -> R {
        match held {
            Some(dump) => f(dump),
            None => f(&mut self.dump.lock()),
        }
    }

    /// Block owning the native address `pc`
    pub fn block_at_native(&self, pc: usize) -> Option<Arc<DynaBlock>> {
        let blocks = self.blocks.read();
        let (_, block) = blocks.range(..=pc).next_back()?;
        block.region().contains(pc).then(|| Arc::clone(block))
    }

    /// Block the directory currently serves for `addr`
    pub fn get_db(&self, addr: u64) -> Option<Arc<DynaBlock>> {
        let native = self.jumps.get(addr).native()?;
        self.block_at_native(native).filter(|b| b.guest_addr() == addr)
    }

    fn register(&self, block: &Arc<DynaBlock>) {
        self.blocks.write().insert(block.region().base(), Arc::clone(block));
        DynarecStats::bump(&self.stats.created);
    }

    fn raise_max(&self, size: u64) {
        let prev = self.max_db_size.fetch_max(size, Ordering::AcqRel);
        if size > prev {
            info!(max_db = size, "higher max block size");
        }
    }

    /// Mark an inserted block done and account for it
    fn commit(&self, block: &DynaBlock, dump: &mut DumpState) {
        let size = block.guest_size();
        if size == 0 {
            // empty blocks stay not-done so they are never validated
            return;
        }
        self.raise_max(size);
        block.set_done(true);
        dump.sizes.add(size);
    }

    fn directory_entry(block: &DynaBlock) -> JumpEntry {
        if block.dirty() {
            JumpEntry::Validating(block.jmpnext())
        } else {
            JumpEntry::Direct(block.entry())
        }
    }

    /// Take a live block out of service; false if it already was
    fn retire_locked(&self, block: &DynaBlock, dump: &mut DumpState) -> bool {
        if !block.retire() {
            return false;
        }
        let size = block.guest_size();
        if size > 0 && dump.sizes.remove(size) && size == self.max_db_size() {
            let max = dump.sizes.max();
            self.max_db_size.store(max, Ordering::Release);
            info!(max_db = max, "lower max block size");
        }
        DynarecStats::bump(&self.stats.invalidated);
        true
    }

    fn invalidate_locked(&self, block: &DynaBlock, dump: &mut DumpState) -> bool {
        if block.is_gone() {
            return false;
        }
        debug!(block = ?block, "invalidating block");
        self.jumps.set_default(block.guest_addr());
        self.retire_locked(block, dump)
    }

    /// Clear the directory entry and retire the block. Idempotent.
    pub fn invalidate(&self, block: &Arc<DynaBlock>) -> bool {
        self.invalidate_locked(block, &mut self.dump.lock())
    }

    /// Release a gone block and its chain of superseded blocks
    pub fn free(&self, block: &Arc<DynaBlock>) {
        if !block.is_gone() || !block.mark_freed() {
            return;
        }
        debug!(block = ?block, "freeing block");
        self.blocks.write().remove(&block.region().base());
        DynarecStats::bump(&self.stats.freed);
        if let Some(prev) = block.take_previous() {
            self.free(&prev);
        }
    }

    /// Invalidate then free
    pub fn destroy(&self, block: &Arc<DynaBlock>) {
        self.invalidate(block);
        self.free(block);
    }

    /// A freshly built block lost the directory race: drop it without
    /// touching the winner's entry
    fn discard(&self, block: &Arc<DynaBlock>) {
        block.retire();
        self.free(block);
    }

    fn mark_dirty_locked(&self, block: &Arc<DynaBlock>, held: Option<&mut DumpState>) {
        debug!(block = ?block, "marking block dirty");
        let addr = block.guest_addr();
        if self
            .jumps
            .set_if_ref(addr, JumpEntry::Validating(block.jmpnext()), JumpEntry::Direct(block.entry()))
        {
            return;
        }
        let current = self.get_db(addr);
        if block.is_gone() || current.as_ref().is_some_and(|c| Arc::ptr_eq(c, block)) {
            return;
        }
        info!(
            addr = format_args!("{addr:#x}"),
            "could not mark block dirty, another block owns the address"
        );
        self.with_dump(held, |dump| self.retire_locked(block, dump));
        match current {
            Some(owner) if owner.previous().is_none() => {
                owner.set_previous(Some(Arc::clone(block)));
            }
            _ => self.free(block),
        }
    }

    /// Switch the directory entry to the validating trampoline so the next
    /// entry re-checks the guest bytes
    pub fn mark_dirty(&self, block: &Arc<DynaBlock>) {
        self.mark_dirty_locked(block, None);
    }

    /// Destroy `block` if it overlaps `[addr, addr+size)`. Returns true if it did.
    pub fn range_invalidate(&self, block: &Arc<DynaBlock>, addr: u64, size: u64) -> bool {
        if !block.overlaps(addr, size) {
            return false;
        }
        self.destroy(block);
        true
    }

    /// Mark `block` dirty if it overlaps `[addr, addr+size)`
    pub fn range_mark(&self, block: &Arc<DynaBlock>, addr: u64, size: u64) {
        if block.overlaps(addr, size) {
            self.mark_dirty(block);
        }
    }

    /// Mark or destroy every block overlapping `[addr, addr+size)`.
    /// Returns the number of blocks touched.
    pub fn clean_range(&self, addr: u64, size: u64, destroy: bool) -> usize {
        let start = addr.saturating_sub(self.max_db_size());
        let end = addr.saturating_add(size);
        let mut hits: Vec<Arc<DynaBlock>> = Vec::new();
        for a in start..end {
            if let Some(b) = self.get_db(a) {
                if b.overlaps(addr, size) && !hits.iter().any(|h| Arc::ptr_eq(h, &b)) {
                    hits.push(b);
                }
            }
        }
        debug!(
            addr = format_args!("{addr:#x}"),
            size,
            destroy,
            blocks = hits.len(),
            "cleaning range"
        );
        for b in &hits {
            if destroy {
                self.destroy(b);
            } else {
                self.mark_dirty(b);
            }
        }
        hits.len()
    }

    /// Block for `addr`, compiled when missing and `create` is set
    pub fn get_or_create(&self, addr: u64, fill_addr: u64, create: bool, is32: bool) -> Option<Arc<DynaBlock>> {
        self.internal_get(addr, fill_addr, create, None, is32)
    }

    fn internal_get(
        &self,
        addr: u64,
        fill_addr: u64,
        create: bool,
        mut held: Option<&mut DumpState>,
        is32: bool,
    ) -> Option<Arc<DynaBlock>> {
        loop {
            if self.mem.has_alternate(addr) {
                return None;
            }
            let block = self.get_db(addr);
            if block.is_some() || !create {
                return block;
            }
            let step = match held.as_deref_mut() {
                Some(dump) => self.fill_locked(addr, fill_addr, dump, is32),
                None => {
                    let mut guard = if self.config.wait {
                        self.dump.lock()
                    } else {
                        self.dump.try_lock()?
                    };
                    self.fill_locked(addr, fill_addr, &mut guard, is32)
                }
            };
            match step {
                Some(result) => return result,
                // module preloaded, look again
                None => continue,
            }
        }
    }

    /// Compile and insert under the lock. `None` asks the caller to restart.
    fn fill_locked(&self, addr: u64, fill_addr: u64, dump: &mut DumpState, is32: bool) -> Option<Option<Arc<DynaBlock>>> {
        if let Some(block) = self.get_db(addr) {
            return Some(Some(block));
        }
        if self.cache.is_some()
            && self.config.cs2c
            && self.config.cs2c_preload
            && !self.modules.test_and_set_preloaded(addr)
        {
            self.preload_module(addr, is32, dump);
            return None;
        }

        let translator = self.translator();
        let alternate = addr != fill_addr;
        let mut use_cache = true;
        let parts = loop {
            match translator.fill(fill_addr, alternate, is32, use_cache) {
                FillOutcome::Block(parts) => break parts,
                FillOutcome::RetryWithoutCache => {
                    debug!(addr = format_args!("{addr:#x}"), "retrying without cache");
                    use_cache = false;
                }
                FillOutcome::Aborted(reason) => {
                    debug!(addr = format_args!("{addr:#x}"), %reason, "fill block returned an error");
                    return Some(None);
                }
            }
        };
        let block = match DynaBlock::assemble(parts, true) {
            Ok(block) => block,
            Err(e) => {
                warn!(addr = format_args!("{addr:#x}"), error = %e, "cannot seal block");
                return Some(None);
            }
        };
        self.register(&block);

        if !self.jumps.add_if_default(block.guest_addr(), Self::directory_entry(&block)) {
            self.discard(&block);
            let winner = self.get_db(block.guest_addr());
            if let Some(w) = &winner {
                self.mark_dirty_locked(w, Some(&mut *dump));
            }
            return Some(winner);
        }
        self.commit(&block, dump);
        debug!(
            addr = format_args!("{addr:#x}"),
            entry = format_args!("{:#x}", block.entry()),
            size = block.size(),
            guest = block.guest_size(),
            "block created"
        );
        Some(Some(block))
    }

    /// Hydrate every cached block of the module owning `addr`
    fn preload_module(&self, addr: u64, is32: bool, dump: &mut DumpState) {
        let (Some(cache), Some(module)) = (&self.cache, self.modules.module_of(addr)) else {
            return;
        };
        let translator = self.translator();
        let mut ctx = PreloadStats::default();
        let res = cache.preload(&module.id, |entry| {
            let addr = entry.addr.wrapping_add(module.delta);
            if self.config.is_nodynarec(addr) || self.mem.has_alternate(addr) || self.get_db(addr).is_some() {
                return;
            }
            if entry.size == 0 || !self.mem.is_mapped(addr, entry.size) {
                debug!(addr = format_args!("{addr:#x}"), size = entry.size, "cached block outside guest memory");
                return;
            }
            match CodeSign::of_guest(&*self.mem, addr, entry.size) {
                Ok(sign) if sign == entry.sign => {}
                _ => return,
            }
            let parts = match translator.preload_fill(addr, &entry, is32) {
                Ok(parts) => parts,
                Err(reason) => {
                    debug!(addr = format_args!("{addr:#x}"), %reason, "skipping cached block");
                    return;
                }
            };
            let block = match DynaBlock::assemble(parts, false) {
                Ok(block) => block,
                Err(e) => {
                    warn!(addr = format_args!("{addr:#x}"), error = %e, "cannot seal block");
                    return;
                }
            };
            self.register(&block);
            ctx.touch(block.region().base(), block.region().end());
            if !self.jumps.add_if_default(addr, Self::directory_entry(&block)) {
                self.discard(&block);
                if let Some(current) = self.get_db(addr) {
                    self.mark_dirty_locked(&current, Some(&mut *dump));
                }
                return;
            }
            self.commit(&block, dump);
            DynarecStats::bump(&self.stats.preloaded);
        });
        flush_icache_ranges(&ctx.pending);
        match res {
            Ok(_) => {
                if let Some((lo, hi)) = ctx.span {
                    info!(
                        count = ctx.count,
                        module = %module.id,
                        native = format_args!("{lo:#x}..{hi:#x}"),
                        "preloaded blocks"
                    );
                }
            }
            Err(e) => warn!(module = %module.id, error = %e, "preload failed"),
        }
    }

    /// Re-check a done block whose page saw writes
    fn validate(
        &self,
        block: Option<Arc<DynaBlock>>,
        addr: u64,
        fill_addr: u64,
        create: bool,
        is32: bool,
    ) -> Option<Arc<DynaBlock>> {
        let db = block?;
        if !db.is_done() || !self.mem.need_test(fill_addr) {
            return Some(db);
        }
        if db.always_test() {
            thread::yield_now();
        }
        let hash = hash_guest(&*self.mem, db.guest_addr(), db.guest_size()).ok();
        let mut guard = self.dump.try_lock();
        if hash != Some(db.hash()) {
            debug!(
                block = ?db,
                hash = ?hash,
                addr = format_args!("{addr:#x}"),
                "hash mismatch, rebuilding block"
            );
            let invalidated = self.with_dump(guard.as_deref_mut(), |dump| self.invalidate_locked(&db, dump));
            let old = invalidated.then(|| Arc::clone(&db));
            let fresh = self.internal_get(addr, fill_addr, create, guard.as_deref_mut(), is32);
            match &fresh {
                Some(f) => {
                    if let Some(stale) = f.set_previous(old) {
                        self.free(&stale);
                    }
                }
                None => {
                    if let Some(old) = old {
                        self.free(&old);
                    }
                }
            }
            fresh
        } else {
            debug!(block = ?db, addr = format_args!("{addr:#x}"), "block validated");
            self.mem.protect(db.guest_addr(), db.guest_size());
            if !db.always_test() {
                self.jumps.set_if_ref(
                    db.guest_addr(),
                    JumpEntry::Direct(db.entry()),
                    JumpEntry::Validating(db.jmpnext()),
                );
            }
            Some(db)
        }
    }

    /// Dispatcher lookup: find or build the block for `addr` and re-validate
    /// it when its code page was written
    pub fn db_get_block(&self, exec: &mut ExecContext, addr: u64, create: bool, is32: bool) -> Option<Arc<DynaBlock>> {
        let db = if self.mem.is_hot_page(addr) {
            None
        } else {
            let db = self.internal_get(addr, addr, create, None, is32);
            self.validate(db, addr, addr, create, is32)
        };
        if !db.as_ref().is_some_and(|b| b.is_done()) {
            exec.ready = false;
        }
        db
    }

    /// Block entered at `addr` but translated from `fill_addr`
    pub fn alternate_block(&self, exec: &mut ExecContext, addr: u64, fill_addr: u64, is32: bool) -> Option<Arc<DynaBlock>> {
        debug!(
            addr = format_args!("{addr:#x}"),
            fill_addr = format_args!("{fill_addr:#x}"),
            is32,
            "creating alternate block"
        );
        let db = self.internal_get(addr, fill_addr, true, None, is32);
        let db = self.validate(db, addr, fill_addr, true, is32);
        if !db.as_ref().is_some_and(|b| b.is_done()) {
            exec.ready = false;
        }
        db
    }

    /// Hydrate the module owning `addr` from the cache now. Returns false if
    /// it was already preloaded or no cache is configured.
    pub fn preload(&self, addr: u64, is32: bool) -> bool {
        if self.cache.is_none() || self.modules.test_and_set_preloaded(addr) {
            return false;
        }
        self.preload_module(addr, is32, &mut self.dump.lock());
        true
    }

    /// Destroy every block. Returns how many were registered.
    pub fn shutdown(&self) -> usize {
        let blocks: Vec<_> = self.blocks.read().values().cloned().collect();
        for b in &blocks {
            self.destroy(b);
        }
        info!(blocks = blocks.len(), stats = %self.stats(), "dynarec shut down");
        blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::rv32::asm::*;
    use crate::memory::FlatMemory;

    fn setup(words: &[u32]) -> (Arc<FlatMemory>, Dynarec) {
        let mem = Arc::new(FlatMemory::new(0x1000, assemble(words)));
        let dynarec = Dynarec::builder(mem.clone()).build().unwrap();
        (mem, dynarec)
    }

    #[test]
    fn test_create_and_lookup() {
        let (_mem, d) = setup(&[addi(1, 1, 1), ret()]);
        assert!(d.get_or_create(0x1000, 0x1000, false, true).is_none());
        let b = d.get_or_create(0x1000, 0x1000, true, true).unwrap();
        assert!(b.is_done());
        assert_eq!(d.jump_table().get(0x1000), JumpEntry::Direct(b.entry()));
        assert!(Arc::ptr_eq(&d.get_or_create(0x1000, 0x1000, false, true).unwrap(), &b));
        assert!(Arc::ptr_eq(&d.block_at_native(b.entry() + 4).unwrap(), &b));
        assert_eq!(d.max_db_size(), 8);
        assert_eq!(d.live_count(8), 1);
        assert_eq!(d.stats().created, 1);
    }

    #[test]
    fn test_invalidate_and_free_are_idempotent() {
        let (_mem, d) = setup(&[addi(1, 1, 1), ret()]);
        let b = d.get_or_create(0x1000, 0x1000, true, true).unwrap();
        // not gone yet: free does nothing
        d.free(&b);
        assert_eq!(d.len(), 1);
        assert!(d.invalidate(&b));
        assert!(!d.invalidate(&b));
        assert_eq!(d.jump_table().get(0x1000), JumpEntry::Empty);
        assert_eq!(d.live_count(8), 0);
        assert_eq!(d.max_db_size(), 0);
        d.free(&b);
        d.free(&b);
        assert!(b.is_freed());
        assert!(d.is_empty());
        assert_eq!(d.stats().freed, 1);
    }

    #[test]
    fn test_mark_dirty_switches_to_trampoline() {
        let (_mem, d) = setup(&[addi(1, 1, 1), ret()]);
        let b = d.get_or_create(0x1000, 0x1000, true, true).unwrap();
        d.mark_dirty(&b);
        assert_eq!(d.jump_table().get(0x1000), JumpEntry::Validating(b.jmpnext()));
        // still served by the same block
        assert!(Arc::ptr_eq(&d.get_db(0x1000).unwrap(), &b));
        d.mark_dirty(&b);
        assert!(!b.is_gone());
    }

    #[test]
    fn test_mark_dirty_of_replaced_block_links_previous() {
        let (_mem, d) = setup(&[addi(1, 1, 1), ret()]);
        let a = d.get_or_create(0x1000, 0x1000, true, true).unwrap();
        // pull the entry from under `a` and let a new block take it
        d.jump_table().set_default(0x1000);
        let b = d.get_or_create(0x1000, 0x1000, true, true).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        d.mark_dirty(&a);
        assert!(a.is_gone());
        assert!(Arc::ptr_eq(&b.previous().unwrap(), &a));
        assert_eq!(d.live_count(8), 1);

        d.destroy(&b);
        assert!(a.is_freed() && b.is_freed());
        assert!(d.is_empty());
    }

    #[test]
    fn test_nodynarec_range_gives_empty_block() {
        let mem = Arc::new(FlatMemory::new(0x1000, assemble(&[ret()])));
        let config = DynarecConfig {
            nodynarec: Some((0x1000, 0x1004)),
            ..Default::default()
        };
        let d = Dynarec::builder(mem).config(config).build().unwrap();
        let mut exec = ExecContext::default();
        let b = d.db_get_block(&mut exec, 0x1000, true, true).unwrap();
        assert!(b.is_empty_block() && !b.is_done());
        assert!(!exec.ready);
        assert_eq!(d.max_db_size(), 0);
        assert_eq!(d.jump_table().get(0x1000), JumpEntry::Direct(b.entry()));
    }

    #[test]
    fn test_abort_returns_none() {
        // runs off the end of the image
        let (_mem, d) = setup(&[addi(1, 1, 1)]);
        let mut exec = ExecContext::default();
        assert!(d.db_get_block(&mut exec, 0x1000, true, true).is_none());
        assert!(!exec.ready);
        assert!(d.is_empty());
        assert_eq!(d.stats().aborted, 1);
    }

    #[test]
    fn test_hot_page_is_skipped() {
        let (mem, d) = setup(&[addi(1, 1, 1), ret()]);
        mem.set_hot(0x1000, true);
        let mut exec = ExecContext::default();
        assert!(d.db_get_block(&mut exec, 0x1000, true, true).is_none());
        assert!(d.is_empty());
    }

    #[test]
    fn test_validation_reprotects_unchanged_code() {
        let (mem, d) = setup(&[addi(1, 1, 1), ret()]);
        let mut exec = ExecContext::default();
        let b = d.db_get_block(&mut exec, 0x1000, true, true).unwrap();
        assert!(exec.ready);
        // same bytes written back
        mem.write_u32(0x1000, addi(1, 1, 1)).unwrap();
        d.mark_dirty(&b);
        assert!(mem.need_test(0x1000));
        let again = d.db_get_block(&mut exec, 0x1000, true, true).unwrap();
        assert!(Arc::ptr_eq(&again, &b));
        assert!(mem.is_protected(0x1000, 8));
        assert_eq!(d.jump_table().get(0x1000), JumpEntry::Direct(b.entry()));
    }

    #[test]
    fn test_clean_range_uses_max_size_lookback() {
        let (_mem, d) = setup(&[addi(1, 1, 1), addi(2, 2, 2), addi(3, 3, 3), ret(), addi(1, 1, 1), ret()]);
        let long = d.get_or_create(0x1000, 0x1000, true, true).unwrap();
        let short = d.get_or_create(0x1010, 0x1010, true, true).unwrap();
        assert_eq!(d.max_db_size(), 16);
        assert_eq!(d.clean_range(0x100c, 4, false), 1);
        assert_eq!(d.jump_table().get(0x1000), JumpEntry::Validating(long.jmpnext()));
        assert_eq!(d.clean_range(0x100c, 8, true), 2);
        assert!(long.is_freed() && short.is_freed());
    }

    #[test]
    fn test_cancelled_fill() {
        let (_mem, d) = setup(&[addi(1, 1, 1), ret()]);
        d.cancel_fill();
        // the token is reset when a compile starts, so this one still succeeds
        assert!(d.get_or_create(0x1000, 0x1000, true, true).is_some());
    }

    #[test]
    fn test_shutdown_frees_everything() {
        let (_mem, d) = setup(&[addi(1, 1, 1), ret(), ret()]);
        let a = d.get_or_create(0x1000, 0x1000, true, true).unwrap();
        let b = d.get_or_create(0x1008, 0x1008, true, true).unwrap();
        assert_eq!(d.shutdown(), 2);
        assert!(a.is_freed() && b.is_freed());
        assert!(d.is_empty());
        assert_eq!(d.jump_table().get(0x1000), JumpEntry::Empty);
    }
}
