//! Block translation
//!
//! Drives one compile from a guest address to a filled block region:
//! discovery, analysis, the dry emitter passes, then either rehydration of a
//! cache hit or sizing plus emission. Nothing here touches the jump
//! directory; the manager publishes the result.

use tracing::{debug, error, info, warn};

use crate::cache::{CacheClient, CacheMeta, CachedCode, PreloadEntry};
use crate::config::DynarecConfig;
use crate::cpu::Decoder;
use crate::memory::exec::ExecRegion;
use crate::memory::modules::{ModuleInfo, ModuleResolver};
use crate::memory::{page_of, GuestMemory};

use super::analysis;
use super::block::{insts_rsize, round8, BlockLayout, BlockParts, EMPTY_BLOCK_SIZE, JMPNEXT_CODE, PTR};
use super::discovery::Discovery;
use super::emit::{run_pass, EmitContext, Emitter, Pass, PassSummary};
use super::hash::{hash_guest, CodeSign};
use super::helper::{AbortReason, CancelToken, CompileHelper, CompileSlot};
use super::stats::DynarecStats;

/// Shared native code a block exits to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeExits {
    /// Dispatcher entry taken when a block falls off its end
    pub next: usize,
    /// Return to the caller of the translated code
    pub epilog: usize,
}

/// Result of one fill attempt
#[derive(Debug)]
pub(crate) enum FillOutcome {
    Block(BlockParts),
    Aborted(AbortReason),
    /// A cache hit did not replay; compile again without the cache
    RetryWithoutCache,
}

/// Block after discovery and analysis
struct Analyzed {
    helper: CompileHelper,
    /// One past the last discovered guest byte
    end: u64,
    hash: u32,
}

enum Prepared {
    Ready(Analyzed),
    /// Nothing live to translate
    Empty,
}

/// Cache identity of the block being compiled
struct CacheTarget {
    module: ModuleInfo,
    rel_addr: u64,
    sign: CodeSign,
}

pub(crate) struct Translator<'a> {
    pub config: &'a DynarecConfig,
    pub mem: &'a dyn GuestMemory,
    pub modules: &'a dyn ModuleResolver,
    pub decoder: &'a dyn Decoder,
    pub emitter: &'a dyn Emitter,
    pub cache: Option<&'a CacheClient>,
    pub exits: NativeExits,
    pub cancel: &'a CancelToken,
    pub slot: &'a CompileSlot,
    pub stats: &'a DynarecStats,
}

impl Translator<'_> {
    /// Compile the block at `addr`
    pub fn fill(&self, addr: u64, alternate: bool, is32: bool, use_cache: bool) -> FillOutcome {
        if self.config.is_nodynarec(addr) {
            info!(addr = format_args!("{addr:#x}"), "empty block in no-dynarec zone");
            return self.empty_block(addr);
        }
        let Some(_guard) = self.slot.try_enter() else {
            debug!(addr = format_args!("{addr:#x}"), "another compile is going on");
            return self.aborted(addr, AbortReason::Busy);
        };
        self.cancel.reset();

        let mut a = match self.prepare(addr, alternate, is32) {
            Ok(Prepared::Ready(a)) => a,
            Ok(Prepared::Empty) => return self.empty_block(addr),
            Err(reason) => return self.aborted(addr, reason),
        };
        let guest_size = a.end - addr;

        let target = if use_cache { self.cache_target(addr, guest_size) } else { None };
        let mut hit = None;
        if let (Some(t), Some(cache)) = (&target, self.cache) {
            match cache.lookup(&t.module.id, t.rel_addr, guest_size, &t.sign) {
                Ok(Some(cached)) => {
                    DynarecStats::bump(&self.stats.cache_hits);
                    debug!(addr = format_args!("{addr:#x}"), "cache hit");
                    // verification replays on a copy, the fresh compile below needs the untouched helper
                    let replayed = if self.config.cs2c_test {
                        self.rehydrate(&mut a.helper.clone(), addr, guest_size, a.hash, &cached, alternate)
                    } else {
                        self.rehydrate(&mut a.helper, addr, guest_size, a.hash, &cached, alternate)
                    };
                    match replayed {
                        Ok(parts) if self.config.cs2c_test => hit = Some((parts, cached.meta)),
                        Ok(parts) => return FillOutcome::Block(parts),
                        Err(AbortReason::Cancelled) => return self.aborted(addr, AbortReason::Cancelled),
                        Err(reason) => {
                            warn!(addr = format_args!("{addr:#x}"), %reason, "cached block unusable, compiling locally");
                            return FillOutcome::RetryWithoutCache;
                        }
                    }
                }
                Ok(None) => DynarecStats::bump(&self.stats.cache_misses),
                Err(e) => warn!(addr = format_args!("{addr:#x}"), error = %e, "cache lookup failed"),
            }
        }

        let (parts, meta) = match self.emit(&mut a, addr, guest_size, alternate) {
            Ok(done) => done,
            Err(reason) => return self.aborted(addr, reason),
        };

        if let Some((hit_parts, hit_meta)) = &hit {
            if diff_blocks(addr, hit_parts, hit_meta, &parts, &meta) {
                DynarecStats::bump(&self.stats.cache_diffs);
            }
        }
        if let (Some(t), Some(cache), None) = (&target, self.cache, &hit) {
            let code = &parts.region.bytes()[PTR..PTR + meta.native_size as usize];
            cache.publish(&t.module.id, t.rel_addr, guest_size, &t.sign, &meta, code);
            DynarecStats::bump(&self.stats.published);
        }
        FillOutcome::Block(parts)
    }

    /// Rebuild a block of a preloaded module from its cached code
    pub fn preload_fill(&self, addr: u64, entry: &PreloadEntry, is32: bool) -> Result<BlockParts, AbortReason> {
        let Some(_guard) = self.slot.try_enter() else {
            return Err(AbortReason::Busy);
        };
        self.cancel.reset();
        let alternate = entry.cached.meta.alternate;
        let mut a = match self.prepare(addr, alternate, is32)? {
            Prepared::Ready(a) => a,
            Prepared::Empty => return Err(AbortReason::CacheMismatch),
        };
        let guest_size = a.end - addr;
        if guest_size != entry.size {
            debug!(addr = format_args!("{addr:#x}"), guest_size, cached = entry.size, "preload size mismatch");
            return Err(AbortReason::CacheMismatch);
        }
        self.rehydrate(&mut a.helper, addr, guest_size, a.hash, &entry.cached, alternate)
    }

    /// Discovery, analysis and pass 1
    fn prepare(&self, addr: u64, alternate: bool, is32: bool) -> Result<Prepared, AbortReason> {
        self.mem.protect(addr, 1);
        let mut helper = CompileHelper::new(addr, is32, alternate);
        let end = Discovery {
            mem: self.mem,
            decoder: self.decoder,
            cancel: self.cancel,
            bigblock: self.config.bigblock,
            max_insts: self.config.max_insts,
        }
        .run(&mut helper);
        if let Some(reason) = helper.abort.take() {
            return Err(reason);
        }
        if helper.is_empty() {
            info!(addr = format_args!("{addr:#x}"), "null-sized block");
            return Ok(Prepared::Empty);
        }
        if !self.mem.is_protected(addr, 1) {
            info!(addr = format_args!("{addr:#x}"), "write on first page during discovery");
            return Err(AbortReason::RacingWrite);
        }
        if page_of(addr) != page_of(end) {
            self.mem.protect(addr, end - addr);
        }
        let hash = hash_guest(self.mem, addr, end - addr).map_err(|f| AbortReason::Fault { addr: f.addr })?;

        analysis::resolve_jumps(&mut helper, end);
        analysis::compute_predecessors(&mut helper);
        analysis::propagate_flags(&mut helper);
        analysis::reset_unreachable_float(&mut helper);
        if analysis::trim_dead_tail(&mut helper) {
            info!(addr = format_args!("{addr:#x}"), "null-sized block after trimming dead code");
            return Ok(Prepared::Empty);
        }
        analysis::propagate_float(&mut helper);

        let mut ctx = EmitContext::dry(Pass::Float, self.mem);
        run_pass(self.emitter, &mut helper, &mut ctx, self.cancel)?;
        Ok(Prepared::Ready(Analyzed { helper, end, hash }))
    }

    fn cache_target(&self, addr: u64, guest_size: u64) -> Option<CacheTarget> {
        if !self.config.cs2c || self.cache.is_none() || guest_size <= self.config.cs2c_mark {
            return None;
        }
        let module = self.modules.module_of(addr)?;
        match CodeSign::of_guest(self.mem, addr, guest_size) {
            Ok(sign) => Some(CacheTarget {
                rel_addr: addr.wrapping_sub(module.delta),
                module,
                sign,
            }),
            Err(e) => {
                warn!(addr = format_args!("{addr:#x}"), error = %e, "cannot sign block");
                None
            }
        }
    }

    /// Pass 4: rebuild a region around cached native bytes
    fn rehydrate(
        &self,
        helper: &mut CompileHelper,
        addr: u64,
        guest_size: u64,
        hash: u32,
        cached: &CachedCode,
        alternate: bool,
    ) -> Result<BlockParts, AbortReason> {
        let meta = &cached.meta;
        let layout = meta.layout();
        let mut region = ExecRegion::alloc(layout.total()).map_err(|e| {
            info!(size = layout.total(), error = %e, "executable allocation failed");
            AbortReason::Alloc
        })?;
        let base = region.base();
        let bytes = region.bytes_mut().ok_or(AbortReason::Alloc)?;
        if cached.code.len() > layout.native_size {
            return Err(AbortReason::CacheMismatch);
        }
        bytes[PTR..PTR + cached.code.len()].copy_from_slice(&cached.code);

        let mut ctx = EmitContext::in_region(Pass::Rehydrate, self.mem, bytes, &layout).ok_or(AbortReason::Alloc)?;
        run_pass(self.emitter, helper, &mut ctx, self.cancel)?;
        let replay = ctx.finish();
        if round8(replay.native_size) != layout.native_size {
            debug!(
                addr = format_args!("{addr:#x}"),
                replayed = round8(replay.native_size),
                cached = layout.native_size,
                "cached native size mismatch"
            );
            return Err(AbortReason::CacheMismatch);
        }
        if replay.table64.len() != layout.table64_size || replay.overflow {
            debug!(
                addr = format_args!("{addr:#x}"),
                replayed = replay.table64.len(),
                cached = layout.table64_size,
                "cached table64 mismatch"
            );
            return Err(AbortReason::CacheMismatch);
        }
        self.wire_jmp_next(bytes, &layout, base);

        Ok(BlockParts {
            guest_addr: addr,
            guest_size,
            hash,
            isize: meta.isize,
            always_test: meta.always_test,
            dirty: meta.dirty,
            alternate,
            layout: Some(layout),
            region,
            jump_targets: exit_targets(helper),
        })
    }

    /// Passes 2 and 3
    fn emit(
        &self,
        a: &mut Analyzed,
        addr: u64,
        guest_size: u64,
        alternate: bool,
    ) -> Result<(BlockParts, CacheMeta), AbortReason> {
        let helper = &mut a.helper;
        let mut ctx = EmitContext::dry(Pass::Size, self.mem);
        run_pass(self.emitter, helper, &mut ctx, self.cancel)?;
        let sized = ctx.finish();

        let layout = BlockLayout::new(sized.native_size, sized.table64.len(), insts_rsize(sized.size_entries));
        let mut region = ExecRegion::alloc(layout.total()).map_err(|e| {
            info!(size = layout.total(), error = %e, "executable allocation failed");
            AbortReason::Alloc
        })?;
        let base = region.base();
        let bytes = region.bytes_mut().ok_or(AbortReason::Alloc)?;
        if self.config.dump {
            info!(
                addr = format_args!("{addr:#x}"),
                native = sized.native_size,
                guest = helper.isize,
                emitter = self.emitter.name(),
                "emitting block"
            );
        }
        let mut ctx = EmitContext::in_region(Pass::Emit, self.mem, bytes, &layout).ok_or(AbortReason::Alloc)?;
        run_pass(self.emitter, helper, &mut ctx, self.cancel)?;
        let emitted = ctx.finish();
        self.wire_jmp_next(bytes, &layout, base);

        let hash = hash_guest(self.mem, addr, guest_size).map_err(|f| AbortReason::Fault { addr: f.addr })?;
        if hash != a.hash {
            debug!(
                addr = format_args!("{addr:#x}"),
                size = guest_size,
                hash = format_args!("{hash:#x}"),
                expected = format_args!("{:#x}", a.hash),
                "block changed while being processed"
            );
            return Err(AbortReason::GuestChanged);
        }
        if emitted.native_size != sized.native_size || emitted.table64.len() > sized.table64.len() || emitted.overflow {
            dump_size_mismatch(self.mem, helper, &sized, &emitted);
            return Err(AbortReason::SizeMismatch);
        }

        let mut always_test = helper.always_test;
        let mut dirty = always_test;
        if !self.mem.is_protected(addr, guest_size) {
            debug!(addr = format_args!("{addr:#x}"), size = guest_size, "block unprotected while being processed");
            dirty = true;
        }
        if self.mem.never_clean(addr) {
            dirty = true;
            always_test = true;
        }
        if always_test {
            debug!(addr = format_args!("{addr:#x}"), size = guest_size, "block always tested");
        }
        if self.config.dump {
            dump_block(helper, "emitted");
        }

        let isize = helper.len() as u32;
        let meta = CacheMeta::from_layout(&layout, isize, alternate, always_test, dirty);
        let parts = BlockParts {
            guest_addr: addr,
            guest_size,
            hash: a.hash,
            isize,
            always_test,
            dirty,
            alternate,
            layout: Some(layout),
            region,
            jump_targets: exit_targets(helper),
        };
        Ok((parts, meta))
    }

    /// Point the jump-next slot at the dispatcher and write the trampoline
    fn wire_jmp_next(&self, bytes: &mut [u8], layout: &BlockLayout, base: usize) {
        let jn = layout.jmpnext_offset();
        let slot = layout.jmpnext_slot_offset();
        bytes[slot..slot + PTR].copy_from_slice(&(self.exits.next as u64).to_le_bytes());
        self.emitter
            .write_jmp_next(&mut bytes[jn..jn + JMPNEXT_CODE], base + jn, base + slot);
    }

    /// Back-pointer plus a trampoline to the epilog
    fn empty_block(&self, addr: u64) -> FillOutcome {
        let mut region = match ExecRegion::alloc(EMPTY_BLOCK_SIZE) {
            Ok(r) => r,
            Err(e) => {
                info!(addr = format_args!("{addr:#x}"), error = %e, "executable allocation failed");
                return self.aborted(addr, AbortReason::Alloc);
            }
        };
        let base = region.base();
        let Some(bytes) = region.bytes_mut() else {
            return self.aborted(addr, AbortReason::Alloc);
        };
        let slot = PTR + JMPNEXT_CODE;
        bytes[slot..slot + PTR].copy_from_slice(&(self.exits.epilog as u64).to_le_bytes());
        self.emitter
            .write_jmp_next(&mut bytes[PTR..PTR + JMPNEXT_CODE], base + PTR, base + slot);
        DynarecStats::bump(&self.stats.empty);
        FillOutcome::Block(BlockParts {
            guest_addr: addr,
            guest_size: 0,
            hash: 0,
            isize: 0,
            always_test: false,
            dirty: false,
            alternate: false,
            layout: None,
            region,
            jump_targets: Vec::new(),
        })
    }

    fn aborted(&self, addr: u64, reason: AbortReason) -> FillOutcome {
        debug!(addr = format_args!("{addr:#x}"), %reason, "abort dynablock");
        DynarecStats::bump(&self.stats.aborted);
        FillOutcome::Aborted(reason)
    }
}

/// Static targets through which execution leaves the block
fn exit_targets(helper: &CompileHelper) -> Vec<u64> {
    let mut out: Vec<u64> = helper
        .insts
        .iter()
        .filter(|i| i.alive && i.jmp_insts.is_none())
        .filter_map(|i| i.guest.jmp())
        .collect();
    if let Some(last) = helper.insts.last() {
        if last.has_next {
            out.push(last.addr + last.guest.size as u64);
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

fn dump_block(helper: &CompileHelper, label: &str) {
    info!(start = format_args!("{:#x}", helper.start), insts = helper.len(), "{label}");
    for (i, inst) in helper.insts.iter().enumerate() {
        info!(
            "{i:4} {:#x} guest={} native@{}+{} flags={:#04x}/{:#04x} ymm0={:#x}->{:#x} purge={:#x}",
            inst.addr,
            inst.guest.size,
            inst.native_offset,
            inst.native_size,
            inst.need_before,
            inst.need_after,
            inst.ymm0_in,
            inst.ymm0_out,
            inst.purge_ymm,
        );
    }
}

fn dump_size_mismatch(mem: &dyn GuestMemory, helper: &CompileHelper, sized: &PassSummary, emitted: &PassSummary) {
    error!(
        start = format_args!("{:#x}", helper.start),
        pass2 = sized.native_size + sized.table64.len() * 8,
        pass3 = emitted.native_size + emitted.table64.len() * 8,
        insts = helper.len(),
        "size difference in block between pass2 and pass3"
    );
    for inst in &helper.insts {
        let bytes = mem.read_vec(inst.addr, inst.guest.size as usize).unwrap_or_default();
        let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02X}")).collect();
        error!(
            "{}{:#x}: {}\t{} -> {}",
            if inst.size_pass2 != inst.native_size { "=====> " } else { "" },
            inst.addr,
            hex.join(" "),
            inst.size_pass2,
            inst.native_size,
        );
    }
    error!("table64 {} -> {}", sized.table64.len() * 8, emitted.table64.len() * 8);
}

/// Compare a replayed cache hit with a fresh compile; logs every difference.
/// Returns true if anything differs.
fn diff_blocks(addr: u64, hit: &BlockParts, hit_meta: &CacheMeta, fresh: &BlockParts, fresh_meta: &CacheMeta) -> bool {
    let mut differs = false;
    let mut report = |what: &str, fresh: String, cached: String| {
        differs = true;
        error!(addr = format_args!("{addr:#x}"), "cached block {what} mismatch: {fresh} vs {cached}");
    };
    macro_rules! field {
        ($name:literal, $a:expr, $b:expr) => {
            if $a != $b {
                report($name, format!("{:?}", $a), format!("{:?}", $b));
            }
        };
    }
    field!("guest size", fresh.guest_size, hit.guest_size);
    field!("hash", fresh.hash, hit.hash);
    field!("region size", fresh.region.len(), hit.region.len());
    field!("native size", fresh_meta.native_size, hit_meta.native_size);
    field!("table64 size", fresh_meta.table64_size, hit_meta.table64_size);
    field!("size map length", fresh_meta.insts_rsize, hit_meta.insts_rsize);
    field!("isize", fresh_meta.isize, hit_meta.isize);
    field!("always_test", fresh_meta.always_test, hit_meta.always_test);
    field!("dirty", fresh_meta.dirty, hit_meta.dirty);

    if let (Some(fl), Some(hl)) = (&fresh.layout, &hit.layout) {
        let (f, h) = (fresh.region.bytes(), hit.region.bytes());
        let code = fl.native_size.min(hl.native_size);
        for off in (0..code).step_by(4) {
            let a = &f[PTR + off..PTR + off + 4];
            let b = &h[PTR + off..PTR + off + 4];
            if a != b {
                report("code", format!("{off}: {a:02x?}"), format!("{b:02x?}"));
            }
        }
        for i in 0..fl.table64_size.min(hl.table64_size) {
            let a = &f[fl.table_offset() + i * 8..fl.table_offset() + i * 8 + 8];
            let b = &h[hl.table_offset() + i * 8..hl.table_offset() + i * 8 + 8];
            if a != b {
                report("table64", format!("{i}: {a:02x?}"), format!("{b:02x?}"));
            }
        }
        for i in 0..fl.insts_rsize.min(hl.insts_rsize) {
            let a = f[fl.insts_offset() + i];
            let b = h[hl.insts_offset() + i];
            if a != b {
                report("size map", format!("{i}: {a:#04x}"), format!("{b:#04x}"));
            }
        }
    }
    differs
}
