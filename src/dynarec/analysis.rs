//! Liveness, flag-need and float-width analysis
//!
//! Runs between discovery and the first emitter pass:
//! 1. resolve static jumps to in-block instructions,
//! 2. mark live instructions and build predecessor lists,
//! 3. propagate the flags each instruction must produce, backward,
//! 4. drop float state of unreachable code and trim the dead tail,
//! 5. forward fixpoint of the float upper-lane state.

use crate::cpu::flags::{
    BARRIER_FLAGS, BARRIER_FLOAT, BARRIER_FULL, SF_PENDING, SF_SET, SF_SET_NODF, SF_SUBSET, SF_SUBSET_PENDING,
    X_ALL, X_PEND,
};

use super::helper::CompileHelper;

/// Resolve every static jump. `end` is the block end found by discovery.
pub fn resolve_jumps(helper: &mut CompileHelper, end: u64) {
    let start = helper.start;
    let jmps = std::mem::take(&mut helper.jmps);
    for &i in &jmps {
        let Some(target) = helper.insts[i].guest.jmp() else {
            continue;
        };
        let here = helper.insts[i].addr;
        helper.insts[i].jmp_insts = None;
        if target < start || target >= end || target == here {
            // a jump on itself must re-check the code every time
            if target == here {
                helper.always_test = true;
            }
            helper.insts[i].need_after |= X_PEND;
        } else if let Ok(k) = helper.insts.binary_search_by_key(&target, |s| s.addr) {
            if !helper.insts[i].guest.barrier_maybe {
                helper.insts[k].barrier |= BARRIER_FULL;
            }
            helper.insts[i].jmp_insts = Some(k);
        }
    }
    helper.jmps = jmps;
}

fn mark_alive(helper: &mut CompileHelper) {
    let n = helper.len();
    if n == 0 {
        return;
    }
    let mut stack = vec![0usize];
    while let Some(i) = stack.pop() {
        let inst = &mut helper.insts[i];
        if inst.alive {
            continue;
        }
        inst.alive = true;
        if i + 1 < n && inst.has_next {
            stack.push(i + 1);
        }
        if let Some(k) = inst.jmp_insts {
            stack.push(k);
        }
    }
}

/// Mark live code and fill the predecessor lists
pub fn compute_predecessors(helper: &mut CompileHelper) {
    mark_alive(helper);
    let n = helper.len();
    // no fall-through into dead code
    for i in 0..n.saturating_sub(1) {
        if helper.insts[i].has_next && !helper.insts[i + 1].alive {
            helper.insts[i].has_next = false;
        }
    }
    for inst in &mut helper.insts {
        inst.pred.clear();
    }
    for i in 0..n {
        if !helper.insts[i].alive {
            continue;
        }
        if i + 1 != n && helper.insts[i].has_next {
            helper.insts[i + 1].pred.push(i);
        }
        if let Some(k) = helper.insts[i].jmp_insts {
            helper.insts[k].pred.push(i);
        }
    }
}

/// Backward flag-need propagation from `ninst` with `need` flags required
/// after it. Returns the next instruction the caller still has to visit.
fn update_need(helper: &mut CompileHelper, mut ninst: isize, mut need: u8) -> isize {
    while ninst >= 0 {
        let i = ninst as usize;
        let inst = &mut helper.insts[i];
        let set_flags = inst.guest.set_flags;
        let state_flags = inst.guest.state_flags;

        need |= inst.need_after;
        // pending flags reaching an instruction that fully sets them become concrete
        if need & X_PEND != 0 && matches!(state_flags, SF_SUBSET | SF_SET | SF_SET_NODF) {
            need &= !X_PEND;
            need |= X_ALL;
        }
        if need & X_PEND != 0 && state_flags == SF_SUBSET_PENDING {
            need |= X_ALL & !set_flags;
        }
        inst.gen_flags = need & set_flags;
        if need & X_PEND != 0 && state_flags & SF_PENDING != 0 {
            inst.gen_flags |= X_PEND;
        }
        inst.need_after = need;
        need = inst.need_after & !inst.gen_flags;
        if inst.guest.may_set {
            need |= inst.gen_flags;
        } else if need & X_PEND != 0 && state_flags & SF_PENDING != 0 {
            need &= !X_PEND;
        }
        need |= inst.guest.use_flags;
        if inst.need_before == need {
            return ninst - 1;
        }
        inst.need_before = need;
        if inst.barrier & BARRIER_FLAGS != 0 {
            need = if need != 0 { X_PEND } else { 0 };
        }

        let preds = inst.pred.clone();
        let mut falls_in = false;
        for p in preds {
            if p + 1 == i {
                falls_in = true;
            } else {
                update_need(helper, p as isize, need);
            }
        }
        ninst -= 1;
        if !falls_in {
            return ninst;
        }
    }
    ninst
}

/// Compute `need_before`, `need_after` and `gen_flags` for the whole block
pub fn propagate_flags(helper: &mut CompileHelper) {
    let mut pos = helper.len() as isize - 1;
    while pos >= 0 {
        pos = update_need(helper, pos, 0);
    }
}

/// Instructions nothing jumps or falls into carry no float state
pub fn reset_unreachable_float(helper: &mut CompileHelper) {
    let n = helper.len();
    let mut i = 1;
    while i + 1 < n {
        if helper.insts[i].pred.is_empty() {
            let mut ii = i;
            while ii < n && helper.insts[ii].pred.is_empty() {
                let inst = &mut helper.insts[ii];
                inst.ymm0_in = 0;
                inst.ymm0_out = 0;
                inst.purge_ymm = 0;
                inst.guest.ymm0_add = 0;
                inst.guest.ymm0_sub = 0;
                ii += 1;
            }
            i = ii;
        }
        i += 1;
    }
}

/// Drop trailing dead instructions. Returns true if the block became empty.
pub fn trim_dead_tail(helper: &mut CompileHelper) -> bool {
    while let Some(last) = helper.insts.last() {
        if last.alive {
            break;
        }
        helper.isize -= last.guest.size as u64;
        helper.insts.pop();
    }
    helper.jmps.retain(|&j| j < helper.insts.len());
    helper.is_empty()
}

/// Forward fixpoint of the float upper-lane state, starting at `ninst`.
/// `max_reached` is the first instruction not yet visited by the top-level walk.
fn update_ymm0s(helper: &mut CompileHelper, mut ninst: usize, mut max_reached: usize) {
    let top_level = ninst == max_reached;
    let mut ok = true;
    while ok && ninst < helper.len() {
        let inst = &helper.insts[ninst];
        if !inst.pred.is_empty() && inst.alive {
            // the entry has a virtual predecessor with nothing live, float barriers reset too
            let mut union = 0u16;
            let mut inter = if ninst != 0 && inst.barrier & BARRIER_FLOAT == 0 {
                u16::MAX
            } else {
                0
            };
            for &p in &inst.pred {
                if p >= max_reached {
                    continue;
                }
                let pred = &helper.insts[p];
                let out = if pred.guest.has_callret() { 0 } else { pred.ymm0_out };
                union |= out;
                inter &= out;
            }
            let purge = union & !inter;
            let ymm_in = inter;
            let ymm_out = (inter | inst.guest.ymm0_add) & !inst.guest.ymm0_sub;
            let jmp = inst.jmp_insts;
            let changed = inst.purge_ymm != purge || inst.ymm0_in != ymm_in || inst.ymm0_out != ymm_out;
            let stop_here = !inst.has_next || inst.guest.has_callret();

            if changed {
                let inst = &mut helper.insts[ninst];
                inst.purge_ymm = purge;
                inst.ymm0_in = ymm_in;
                inst.ymm0_out = ymm_out;
                if top_level {
                    max_reached += 1;
                } else {
                    ok = max_reached - 1 != ninst && !stop_here;
                }
                if let Some(j) = jmp.filter(|&j| j < max_reached) {
                    update_ymm0s(helper, j, max_reached);
                }
            } else if top_level {
                max_reached += 1;
                if let Some(j) = jmp.filter(|&j| j < max_reached) {
                    update_ymm0s(helper, j, max_reached);
                }
            } else {
                ok = false;
            }
        } else if top_level {
            max_reached += 1;
        } else {
            ok = false;
        }
        ninst += 1;
    }
}

pub fn propagate_float(helper: &mut CompileHelper) {
    update_ymm0s(helper, 0, 0);
}
