/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Thread component (spec §4.7), the largest single piece of the core:
//! scheduling state, the invocation stack, the register save area, and the
//! scheduler-parent/notification protocol.
//!
//! Two kinds of field live on a [`Thd`]: a handful kept as top-level atomics
//! because another core legitimately races on them (`local`, the bound-CPU
//! slot CAS-claimed at bind time; `sched_ref`, fetch-added by a child's
//! bind/free), and everything else behind a [`crate::sync::NullLock`],
//! because spec §5 states scheduling state and run-queues are "mutated only
//! by its owning CPU" — the same reasoning [`crate::cpu::Core::rq`] already
//! rests on.

use crate::atomics::cas_usize;
use crate::config::{MAX_THD, MAX_TIME, NIL, SCHED_EVENT_QUEUE_DEPTH};
use crate::cpu::Core;
use crate::error::{KResult, PthError};
use crate::hal::{Hal, RegisterSet};
use crate::invocation::{InvArena, InvocationStack};
use crate::kobj::Arena;
use crate::kot::Kot;
use crate::signal::SigArena;
use core::sync::atomic::{AtomicUsize, Ordering};

const THD_BASE: usize = 0x5000_0000;
const THD_STRIDE: usize = 512;

pub type ThdArena<H> = Arena<Thd<H>, MAX_THD, THD_BASE, THD_STRIDE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThdState {
    Running,
    Ready,
    Blocked,
    Timeout,
    ExcPend,
}

/// One pending scheduler notification: a child's TID plus whether it is
/// reporting a timeout or an unhandled exception (spec §3 "notification
/// list links", §4.10 "adds to parent's event list").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub tid: usize,
    pub fault: bool,
}

/// Fixed-capacity FIFO of a scheduler thread's pending notifications.
pub struct EventQueue {
    events: [Option<Event>; SCHED_EVENT_QUEUE_DEPTH],
    len: usize,
}

impl EventQueue {
    fn new() -> Self {
        EventQueue {
            events: core::array::from_fn(|_| None),
            len: 0,
        }
    }

    fn contains(&self, tid: usize) -> bool {
        self.events[..self.len].iter().any(|e| e.map(|e| e.tid) == Some(tid))
    }

    /// Add an event unless one for the same `tid` is already pending (spec
    /// §4.10: "adds to parent's event list unless already present").
    fn push(&mut self, ev: Event) {
        if self.contains(ev.tid) || self.len >= SCHED_EVENT_QUEUE_DEPTH {
            return;
        }
        self.events[self.len] = Some(ev);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Event> {
        if self.len == 0 {
            return None;
        }
        let ev = self.events[0];
        for i in 1..self.len {
            self.events[i - 1] = self.events[i];
        }
        self.len -= 1;
        ev
    }
}

struct ThdInner<H: Hal> {
    state: ThdState,
    prio: usize,
    slice: usize,
    process: usize,
    sched_parent: usize,
    sched_sig: usize,
    tid: usize,
    haddr: usize,
    /// Signal endpoint this thread is currently blocked on, or [`NIL`]
    /// (spec §4.8: lets `Thd_Sched_Free`/wake paths find and release the
    /// other half of the blocking relationship without scanning every
    /// endpoint).
    blocked_on: usize,
    invocation_stack: InvocationStack,
    regs: H::Regs,
    coproc: H::CoProc,
    events: EventQueue,
}

/// A thread (spec §3 "Thread"). `max_prio` and `is_init`/`is_hyp` are fixed
/// at creation; everything that moves afterwards is either a top-level
/// atomic or behind `inner`.
pub struct Thd<H: Hal> {
    max_prio: usize,
    is_init: bool,
    is_hyp: bool,
    local: AtomicUsize,
    sched_ref: AtomicUsize,
    inner: crate::sync::NullLock<ThdInner<H>>,
}

impl<H: Hal> Thd<H> {
    pub fn max_prio(&self) -> usize {
        self.max_prio
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_hyp(&self) -> bool {
        self.is_hyp
    }

    /// Bound CPU, or `None` if the thread is still Free (spec §3: "A
    /// thread's bound CPU is either Free or equal to one specific CPU").
    pub fn local(&self) -> Option<usize> {
        let v = self.local.load(Ordering::Acquire);
        if v == NIL {
            None
        } else {
            Some(v)
        }
    }

    pub fn sched_ref(&self) -> usize {
        self.sched_ref.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ThdState {
        self.inner.lock(|i| i.state)
    }

    pub fn prio(&self) -> usize {
        self.inner.lock(|i| i.prio)
    }

    pub fn slice(&self) -> usize {
        self.inner.lock(|i| i.slice)
    }

    pub fn process(&self) -> usize {
        self.inner.lock(|i| i.process)
    }

    pub fn tid(&self) -> usize {
        self.inner.lock(|i| i.tid)
    }
}

/// `Thd_Crt`: reserve a thread, `Free` and `Timeout`, with zero slice and an
/// empty invocation stack (spec §4.7 "Create").
pub fn thd_crt<H: Hal>(
    thds: &ThdArena<H>,
    kot: &Kot,
    process: usize,
    creator_max_prio: usize,
    max_prio: usize,
    is_hyp: bool,
    is_init: bool,
) -> KResult<usize> {
    if max_prio > creator_max_prio {
        return Err(PthError::Prio.into());
    }
    thds.alloc_with(kot, |_| Thd {
        max_prio,
        is_init,
        is_hyp,
        local: AtomicUsize::new(NIL),
        sched_ref: AtomicUsize::new(0),
        inner: crate::sync::NullLock::new(ThdInner {
            state: ThdState::Timeout,
            prio: 0,
            slice: if is_init { crate::config::INIT_TIME } else { 0 },
            process,
            sched_parent: NIL,
            sched_sig: NIL,
            tid: NIL,
            haddr: NIL,
            blocked_on: NIL,
            invocation_stack: InvocationStack::new(),
            regs: H::Regs::default(),
            coproc: H::CoProc::default(),
            events: EventQueue::new(),
        }),
    })
}

/// `Thd_Del`: release a `Free`, unreferenced thread, first releasing any
/// invocation frames it still holds (spec §4.9 invariant: "deletion of a
/// thread with non-empty invocation stack releases every frame and resets
/// each to inactive").
pub fn thd_del<H: Hal>(thds: &ThdArena<H>, invs: &InvArena<H>, kot: &Kot, idx: usize) -> KResult<()> {
    if thds.with(idx, Thd::local).ok_or(PthError::InvState)?.is_some() {
        return Err(PthError::InvState.into());
    }
    if thds.with(idx, Thd::sched_ref).ok_or(PthError::InvState)? != 0 {
        return Err(PthError::Refcnt.into());
    }
    thds.with(idx, |t| t.inner.lock(|i| i.invocation_stack.drain_release(invs)));
    thds.free(kot, idx).map_err(Into::into)
}

fn haddr_in_region(haddr: usize) -> bool {
    use crate::config::{HYPERVISOR_REGION_BASE, HYPERVISOR_REGION_LEN, WORD_BITS};
    let word_bytes = WORD_BITS / 8;
    haddr % word_bytes == 0
        && haddr >= HYPERVISOR_REGION_BASE
        && haddr < HYPERVISOR_REGION_BASE.wrapping_add(HYPERVISOR_REGION_LEN)
        && haddr.checked_add(word_bytes).is_some()
}

/// `Thd_Sched_Bind`: bind a `Free` thread to the calling core under
/// `parent_idx`, at `prio`, with TID `tid` and an optional scheduler signal
/// endpoint (spec §4.7).
#[allow(clippy::too_many_arguments)]
pub fn thd_sched_bind<H: Hal>(
    thds: &ThdArena<H>,
    sigs: &SigArena,
    core: &Core,
    thread_idx: usize,
    parent_idx: usize,
    sig_idx: Option<usize>,
    tid: usize,
    prio: usize,
    haddr: usize,
) -> KResult<()> {
    if thread_idx == parent_idx {
        return Err(PthError::InvState.into());
    }
    let parent_local = thds.with(parent_idx, Thd::local).ok_or(PthError::InvState)?;
    if parent_local != Some(core.local.cpu_id) {
        return Err(PthError::InvState.into());
    }
    let parent_max_prio = thds.with(parent_idx, Thd::max_prio).ok_or(PthError::InvState)?;
    if prio > parent_max_prio {
        return Err(PthError::Prio.into());
    }
    let is_hyp = thds.with(thread_idx, Thd::is_hyp).ok_or(PthError::InvState)?;
    if is_hyp {
        if !haddr_in_region(haddr) {
            return Err(PthError::Haddr.into());
        }
    } else if haddr != NIL {
        return Err(PthError::Haddr.into());
    }

    // Claim the Free -> bound-CPU transition directly through the arena
    // closure so the CAS target never outlives the borrow.
    let claimed = thds
        .with(thread_idx, |t| cas_usize(&t.local, NIL, core.local.cpu_id))
        .ok_or(PthError::InvState)?;
    claimed.map_err(|_| PthError::InvState)?;

    thds.with(parent_idx, |p| p.sched_ref.fetch_add(1, Ordering::AcqRel));

    thds.with(thread_idx, |t| {
        t.inner.lock(|i| {
            i.prio = prio;
            i.tid = tid;
            i.sched_parent = parent_idx;
            i.sched_sig = sig_idx.unwrap_or(NIL);
            i.haddr = haddr;
        });
    });

    if let Some(idx) = sig_idx {
        crate::signal::sig_bump_notif_ref(sigs, idx);
    }
    crate::trace::record(crate::trace::Event::ThdBound {
        thd_idx: thread_idx,
        cpu: core.local.cpu_id,
    });
    Ok(())
}

/// `Thd_Sched_Prio`: update the priority of up to [`crate::config::MAX_THD`]
/// threads in one call (spec §4.7 names "up to 3"; the syscall ABI caps the
/// argument count, this routine just takes whatever slice it is handed).
/// Returns the threads' prior priorities, read *before* any mutation (spec:
/// "Return value is saved first, so partial reordering is safe").
pub fn thd_sched_prio<H: Hal>(
    thds: &ThdArena<H>,
    core: &Core,
    updates: &[(usize, usize)],
) -> KResult<[usize; 3]> {
    if updates.len() > 3 {
        return Err(PthError::InvState.into());
    }
    let mut old = [0usize; 3];
    for (slot, &(idx, new_prio)) in updates.iter().enumerate() {
        let local = thds.with(idx, Thd::local).ok_or(PthError::InvState)?;
        if local != Some(core.local.cpu_id) {
            return Err(PthError::InvState.into());
        }
        let max_prio = thds.with(idx, Thd::max_prio).ok_or(PthError::InvState)?;
        if new_prio > max_prio {
            return Err(PthError::Prio.into());
        }
        old[slot] = thds.with(idx, Thd::prio).ok_or(PthError::InvState)?;
    }
    for &(idx, new_prio) in updates {
        let state = thds.with(idx, Thd::state).ok_or(PthError::InvState)?;
        let old_prio = thds.with(idx, Thd::prio).ok_or(PthError::InvState)?;
        if matches!(state, ThdState::Ready) {
            core.rq.lock(|rq| rq.remove(old_prio, idx));
        }
        thds.with(idx, |t| t.inner.lock(|i| i.prio = new_prio));
        if matches!(state, ThdState::Ready) {
            core.rq.lock(|rq| rq.insert(new_prio, idx));
        }
    }
    schedule_highest(thds, core);
    Ok(old)
}

/// `Thd_Sched_Free`: release a bound thread back to `Free` (spec §4.7).
/// Forbidden on init threads (glossary: "cannot be freed").
pub fn thd_sched_free<H: Hal>(thds: &ThdArena<H>, sigs: &SigArena, core: &Core, thread_idx: usize) -> KResult<()> {
    if thds.with(thread_idx, Thd::is_init).ok_or(PthError::InvState)? {
        return Err(PthError::InvState.into());
    }
    let local = thds.with(thread_idx, Thd::local).ok_or(PthError::InvState)?;
    if local != Some(core.local.cpu_id) {
        return Err(PthError::InvState.into());
    }
    if thds.with(thread_idx, Thd::sched_ref).ok_or(PthError::InvState)? != 0 {
        return Err(PthError::Refcnt.into());
    }

    let (parent_idx, sched_sig, state, prio) = thds
        .with(thread_idx, |t| {
            t.inner.lock(|i| (i.sched_parent, i.sched_sig, i.state, i.prio))
        })
        .ok_or(PthError::InvState)?;

    if parent_idx != NIL {
        thds.with(parent_idx, |p| p.sched_ref.fetch_sub(1, Ordering::AcqRel));
    }
    if sched_sig != NIL {
        crate::signal::sig_drop_notif_ref(sigs, sched_sig);
    }

    if state == ThdState::Blocked {
        crate::signal::sig_release_blocked(sigs, thds, thread_idx);
    }
    if state == ThdState::Ready {
        core.rq.lock(|rq| rq.remove(prio, thread_idx));
    }
    let was_current = core.local.current() == Some(thread_idx);
    if was_current {
        core.local.set_current(None);
    }

    thds.with(thread_idx, |t| {
        t.inner.lock(|i| {
            i.state = ThdState::Timeout;
            i.sched_parent = NIL;
            i.sched_sig = NIL;
            i.tid = NIL;
        })
    });

    if was_current {
        schedule_highest(thds, core);
    }

    // Release-stored last: once this is visible, the thread may be bound
    // to a (possibly different) core again (spec §4.7 invariant order).
    thds.with(thread_idx, |t| t.local.store(NIL, Ordering::Release));
    Ok(())
}

/// `Thd_Sched_Rcv`: pop one pending notification from `thread_idx`'s event
/// list. Caller's CPU must be the thread's bound CPU.
pub fn thd_sched_rcv<H: Hal>(thds: &ThdArena<H>, core: &Core, thread_idx: usize) -> KResult<Event> {
    let local = thds.with(thread_idx, Thd::local).ok_or(PthError::InvState)?;
    if local != Some(core.local.cpu_id) {
        return Err(PthError::InvState.into());
    }
    thds.with(thread_idx, |t| t.inner.lock(|i| i.events.pop()))
        .ok_or(PthError::InvState)?
        .ok_or(PthError::Notif.into())
}

/// Overflow guard shared by every time-budget mutation (spec §4.7,
/// supplemented feature "`RME_TIME_CHECK`-style overflow guard").
pub fn check_time_budget(current: usize, delta: usize) -> KResult<usize> {
    let sum = current.checked_add(delta).ok_or(PthError::Overflow)?;
    if sum > MAX_TIME {
        return Err(PthError::Overflow.into());
    }
    Ok(sum)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeXferPolicy {
    Normal(usize),
    Infinite,
    Revoke,
}

/// `Thd_Time_Xfer`: move time budget from `src_idx` to `dst_idx`, both on
/// the calling core (spec §4.7).
pub fn thd_time_xfer<H: Hal>(
    thds: &ThdArena<H>,
    sigs: &SigArena,
    core: &Core,
    dst_idx: usize,
    src_idx: usize,
    policy: TimeXferPolicy,
) -> KResult<()> {
    let dst_local = thds.with(dst_idx, Thd::local).ok_or(PthError::InvState)?;
    let src_local = thds.with(src_idx, Thd::local).ok_or(PthError::InvState)?;
    if dst_local != Some(core.local.cpu_id) || src_local != Some(core.local.cpu_id) {
        return Err(PthError::InvState.into());
    }
    let dst_is_init = thds.with(dst_idx, Thd::is_init).ok_or(PthError::InvState)?;
    if !dst_is_init {
        let dst_max = thds.with(dst_idx, Thd::max_prio).ok_or(PthError::InvState)?;
        let src_max = thds.with(src_idx, Thd::max_prio).ok_or(PthError::InvState)?;
        if dst_max > src_max {
            return Err(PthError::Prio.into());
        }
    }
    let dst_state = thds.with(dst_idx, Thd::state).ok_or(PthError::InvState)?;
    if dst_state == ThdState::ExcPend {
        return Err(PthError::Exc.into());
    }

    let src_is_init = thds.with(src_idx, Thd::is_init).ok_or(PthError::InvState)?;

    match policy {
        TimeXferPolicy::Normal(amount) => {
            let dst_slice = thds.with(dst_idx, Thd::slice).ok_or(PthError::InvState)?;
            let src_slice = thds.with(src_idx, Thd::slice).ok_or(PthError::InvState)?;
            if amount > src_slice {
                return Err(PthError::Overflow.into());
            }
            let new_dst = check_time_budget(dst_slice, amount)?;
            thds.with(dst_idx, |t| t.inner.lock(|i| i.slice = new_dst));
            thds.with(src_idx, |t| t.inner.lock(|i| i.slice = src_slice - amount));
        }
        TimeXferPolicy::Infinite => {
            if !src_is_init {
                thds.with(dst_idx, |t| t.inner.lock(|i| i.slice = crate::config::INF_TIME));
            }
        }
        TimeXferPolicy::Revoke => {
            let amount = crate::config::INIT_TIME;
            let dst_slice = thds.with(dst_idx, Thd::slice).ok_or(PthError::InvState)?;
            let new_dst = check_time_budget(dst_slice, amount)?;
            thds.with(dst_idx, |t| t.inner.lock(|i| i.slice = new_dst));
            thds.with(src_idx, |t| t.inner.lock(|i| i.slice = 0));
        }
    }

    let src_out_of_budget = thds.with(src_idx, Thd::slice).ok_or(PthError::InvState)? == 0 && !src_is_init;
    if src_out_of_budget {
        let (state, prio) = thds
            .with(src_idx, |t| t.inner.lock(|i| (i.state, i.prio)))
            .ok_or(PthError::InvState)?;
        if matches!(state, ThdState::Ready) {
            core.rq.lock(|rq| rq.remove(prio, src_idx));
        }
        thds.with(src_idx, |t| t.inner.lock(|i| i.state = ThdState::Timeout));
        notify_parent(thds, sigs, core, src_idx, false);
    }

    let dst_was_timeout = thds.with(dst_idx, Thd::state).ok_or(PthError::InvState)? == ThdState::Timeout
        && thds.with(dst_idx, Thd::slice).ok_or(PthError::InvState)? > 0;
    if dst_was_timeout {
        let prio = thds.with(dst_idx, Thd::prio).ok_or(PthError::InvState)?;
        thds.with(dst_idx, |t| t.inner.lock(|i| i.state = ThdState::Ready));
        core.rq.lock(|rq| rq.insert(prio, dst_idx));
    }

    schedule_highest(thds, core);
    Ok(())
}

/// `Thd_Swt`: switch directly to `target` if given, or to the highest
/// runnable thread otherwise (spec §4.7).
pub fn thd_swt<H: Hal>(
    thds: &ThdArena<H>,
    sigs: &SigArena,
    core: &Core,
    target: Option<usize>,
    do_yield: bool,
) -> KResult<()> {
    if let Some(cur_idx) = core.local.current() {
        if do_yield {
            let slice = thds.with(cur_idx, Thd::slice).ok_or(PthError::InvState)?;
            if slice != crate::config::INF_TIME && slice != crate::config::INIT_TIME {
                thds.with(cur_idx, |t| t.inner.lock(|i| i.slice = 0));
                thds.with(cur_idx, |t| t.inner.lock(|i| i.state = ThdState::Timeout));
                notify_parent(thds, sigs, core, cur_idx, false);
                core.local.set_current(None);
            }
        }
    }

    if let Some(target_idx) = target {
        let local = thds.with(target_idx, Thd::local).ok_or(PthError::InvState)?;
        if local != Some(core.local.cpu_id) {
            return Err(PthError::InvState.into());
        }
        let cur_prio = core.local.current().and_then(|c| thds.with(c, Thd::prio));
        let target_prio = thds.with(target_idx, Thd::prio).ok_or(PthError::InvState)?;
        if let Some(cp) = cur_prio {
            if target_prio != cp {
                return Err(PthError::Prio.into());
            }
        }
        let state = thds.with(target_idx, Thd::state).ok_or(PthError::InvState)?;
        if !matches!(state, ThdState::Ready | ThdState::Running) {
            return Err(PthError::InvState.into());
        }
        if state == ThdState::ExcPend {
            return Err(PthError::Exc.into());
        }
        if matches!(state, ThdState::Ready) {
            core.rq.lock(|rq| rq.remove(target_prio, target_idx));
        }
        if let Some(cur_idx) = core.local.current() {
            thds.with(cur_idx, |t| t.inner.lock(|i| i.state = ThdState::Ready));
            let p = thds.with(cur_idx, Thd::prio).unwrap_or(0);
            core.rq.lock(|rq| rq.insert(p, cur_idx));
        }
        thds.with(target_idx, |t| t.inner.lock(|i| i.state = ThdState::Running));
        core.local.set_current(Some(target_idx));
        Ok(())
    } else {
        schedule_highest(thds, core);
        Ok(())
    }
}

/// `Thd_Hyp_Set` (supplemented feature): rebind the external register-save
/// address of an already-bound hypervisor thread.
pub fn thd_hyp_set<H: Hal>(thds: &ThdArena<H>, thread_idx: usize, haddr: usize) -> KResult<()> {
    if !thds.with(thread_idx, Thd::is_hyp).ok_or(PthError::InvState)? {
        return Err(PthError::Haddr.into());
    }
    if thds.with(thread_idx, Thd::local).ok_or(PthError::InvState)?.is_none() {
        return Err(PthError::InvState.into());
    }
    if !haddr_in_region(haddr) {
        return Err(PthError::Haddr.into());
    }
    thds.with(thread_idx, |t| t.inner.lock(|i| i.haddr = haddr));
    Ok(())
}

/// `Thd_Exec_Set`: clear `ExcPend`, re-point the register set at a fresh
/// entry/stack/param (spec §4.10: "cleared only by an `Exec_Set` from a
/// scheduler, which also resets entry/stack/param").
pub fn thd_exec_set<H: Hal>(thds: &ThdArena<H>, thread_idx: usize, entry: usize, stack: usize, param: usize) -> KResult<()> {
    let state = thds.with(thread_idx, Thd::state).ok_or(PthError::InvState)?;
    if state != ThdState::ExcPend {
        return Err(PthError::InvState.into());
    }
    thds.with(thread_idx, |t| {
        t.inner.lock(|i| {
            i.regs.set_pc(entry);
            i.regs.set_sp(stack);
            i.regs.set_entry_arg(param);
            i.state = ThdState::Timeout;
        })
    });
    Ok(())
}

/// Pick the highest-priority Ready thread on `core` and make it Running,
/// demoting the previous current thread back to Ready if it still has one
/// (spec §4.11 "schedule highest": "switches only if the high thread has
/// strictly higher priority").
pub fn schedule_highest<H: Hal>(thds: &ThdArena<H>, core: &Core) {
    let current = core.local.current();
    let current_prio = current.and_then(|idx| {
        thds.with(idx, |t| t.inner.lock(|i| (i.state == ThdState::Running).then_some(i.prio)))
            .flatten()
    });
    let highest = core.rq.lock(|rq| rq.highest_prio());
    let switch = match (current_prio, highest) {
        (Some(cp), Some(hp)) => hp > cp,
        (None, Some(_)) => true,
        _ => false,
    };
    if !switch {
        return;
    }
    if let (Some(cur_idx), Some(prio)) = (current, current_prio) {
        thds.with(cur_idx, |t| t.inner.lock(|i| i.state = ThdState::Ready));
        core.rq.lock(|rq| rq.insert(prio, cur_idx));
    }
    if let Some((_, next_idx)) = core.rq.lock(|rq| rq.pop_highest()) {
        thds.with(next_idx, |t| t.inner.lock(|i| i.state = ThdState::Running));
        core.local.set_current(Some(next_idx));
    }
}

/// Add a Timeout/ExcPend notification to `thd_idx`'s scheduler parent and
/// kernel-send its scheduler signal endpoint, if any (spec §4.10, §4.11;
/// supplemented feature folding `Kern_High`/`Run_Notif`, see DESIGN.md).
pub fn notify_parent<H: Hal>(thds: &ThdArena<H>, sigs: &SigArena, core: &Core, thd_idx: usize, fault: bool) {
    let (parent_idx, tid) = thds
        .with(thd_idx, |t| t.inner.lock(|i| (i.sched_parent, i.tid)))
        .unwrap_or((NIL, NIL));
    if parent_idx == NIL {
        return;
    }
    thds.with(parent_idx, |p| p.inner.lock(|i| i.events.push(Event { tid, fault })));
    let sig_idx = thds
        .with(parent_idx, |p| p.inner.lock(|i| i.sched_sig))
        .unwrap_or(NIL);
    if sig_idx != NIL {
        crate::signal::sig_snd_kernel(sigs, thds, core, sig_idx);
    }
}

// -- Narrow accessors `signal.rs`'s send/receive protocol needs, kept here
// -- rather than making every `ThdInner` field `pub` (spec §4.8).

pub fn set_retval<H: Hal>(thds: &ThdArena<H>, idx: usize, v: isize) {
    thds.with(idx, |t| t.inner.lock(|i| i.regs.set_retval(v)));
}

pub fn has_slice<H: Hal>(thds: &ThdArena<H>, idx: usize) -> bool {
    thds.with(idx, |t| t.inner.lock(|i| i.slice > 0)).unwrap_or(false)
}

pub fn reinsert_ready<H: Hal>(thds: &ThdArena<H>, core: &Core, idx: usize) {
    let prio = thds.with(idx, Thd::prio).unwrap_or(0);
    thds.with(idx, |t| t.inner.lock(|i| i.state = ThdState::Ready));
    core.rq.lock(|rq| rq.insert(prio, idx));
}

pub fn set_timeout<H: Hal>(thds: &ThdArena<H>, idx: usize) {
    thds.with(idx, |t| t.inner.lock(|i| i.state = ThdState::Timeout));
    crate::trace::record(crate::trace::Event::ThdTimeout { thd_idx: idx });
}

pub fn remove_from_runqueue<H: Hal>(thds: &ThdArena<H>, core: &Core, idx: usize) -> bool {
    let (state, prio) = thds
        .with(idx, |t| t.inner.lock(|i| (i.state, i.prio)))
        .unwrap_or((ThdState::Timeout, 0));
    if matches!(state, ThdState::Ready) {
        core.rq.lock(|rq| rq.remove(prio, idx))
    } else {
        false
    }
}

pub fn set_blocked<H: Hal>(thds: &ThdArena<H>, idx: usize) {
    thds.with(idx, |t| t.inner.lock(|i| i.state = ThdState::Blocked));
}

/// Records which signal endpoint a thread is parked on (spec §4.8).
pub fn set_blocked_on<H: Hal>(thds: &ThdArena<H>, idx: usize, sig_idx: usize) {
    thds.with(idx, |t| t.inner.lock(|i| i.blocked_on = sig_idx));
}

pub fn clear_blocked_on<H: Hal>(thds: &ThdArena<H>, idx: usize) {
    thds.with(idx, |t| t.inner.lock(|i| i.blocked_on = NIL));
}

/// Which signal endpoint `idx` is currently parked on, if any (spec §4.8,
/// used by `Thd_Sched_Free`'s cancellation path to find the other half of
/// the blocking relationship without scanning every endpoint).
pub fn blocked_on<H: Hal>(thds: &ThdArena<H>, idx: usize) -> Option<usize> {
    let v = thds.with(idx, |t| t.inner.lock(|i| i.blocked_on)).unwrap_or(NIL);
    if v == NIL {
        None
    } else {
        Some(v)
    }
}

/// Overwrite the time slice directly; used by the timer tick (spec §4.11).
pub fn set_slice<H: Hal>(thds: &ThdArena<H>, idx: usize, v: usize) {
    thds.with(idx, |t| t.inner.lock(|i| i.slice = v));
}

/// Transition to `ExcPend` from the fault path (spec §4.10).
pub fn set_exc_pend<H: Hal>(thds: &ThdArena<H>, idx: usize) {
    thds.with(idx, |t| t.inner.lock(|i| i.state = ThdState::ExcPend));
}

/// Run `f` with exclusive access to a thread's saved registers and
/// invocation stack, both normally private to this module (spec §4.9,
/// §4.10: the invocation-return and fault paths need both at once).
pub fn with_regs_and_stack<H: Hal, R>(
    thds: &ThdArena<H>,
    idx: usize,
    f: impl FnOnce(&mut H::Regs, &mut InvocationStack) -> R,
) -> Option<R> {
    thds.with(idx, |t| t.inner.lock(|i| f(&mut i.regs, &mut i.invocation_stack)))
}

/// Run `f` with exclusive access to a thread's saved registers alone (spec
/// §4.12: the syscall dispatcher decodes arguments and writes the return
/// value through here).
pub fn with_regs<H: Hal, R>(thds: &ThdArena<H>, idx: usize, f: impl FnOnce(&mut H::Regs) -> R) -> Option<R> {
    thds.with(idx, |t| t.inner.lock(|i| f(&mut i.regs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeHal;
    use crate::signal::SigArena;

    type TestThdArena = ThdArena<FakeHal>;

    fn boot_core() -> Core {
        Core::new(0)
    }

    #[test]
    fn crt_rejects_priority_above_creator() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        assert!(thd_crt(&thds, &kot, 0, 4, 5, false, false).is_err());
    }

    #[test]
    fn bind_claims_free_thread_and_bumps_parent_sched_ref() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let parent = thd_crt(&thds, &kot, 0, 10, 10, false, true).unwrap();
        thds.with(parent, |t| t.local.store(0, Ordering::Release));

        let child = thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thd_sched_bind(&thds, &sigs, &core, child, parent, None, 42, 5, NIL).unwrap();

        assert_eq!(thds.with(child, Thd::local).unwrap(), Some(0));
        assert_eq!(thds.with(parent, Thd::sched_ref).unwrap(), 1);
        assert_eq!(thds.with(child, Thd::tid).unwrap(), 42);
    }

    #[test]
    fn bind_rejects_priority_above_parent_max() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let parent = thd_crt(&thds, &kot, 0, 10, 4, false, true).unwrap();
        thds.with(parent, |t| t.local.store(0, Ordering::Release));
        let child = thd_crt(&thds, &kot, 0, 10, 10, false, false).unwrap();

        assert!(thd_sched_bind(&thds, &sigs, &core, child, parent, None, 1, 5, NIL).is_err());
    }

    #[test]
    fn time_xfer_normal_moves_budget_between_threads() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let a = thd_crt(&thds, &kot, 0, 10, 10, false, false).unwrap();
        let b = thd_crt(&thds, &kot, 0, 10, 10, false, false).unwrap();
        thds.with(a, |t| t.local.store(0, Ordering::Release));
        thds.with(b, |t| t.local.store(0, Ordering::Release));
        thds.with(b, |t| t.inner.lock(|i| i.slice = 20));

        thd_time_xfer(&thds, &sigs, &core, a, b, TimeXferPolicy::Normal(10)).unwrap();
        assert_eq!(thds.with(a, Thd::slice).unwrap(), 10);
        assert_eq!(thds.with(b, Thd::slice).unwrap(), 10);
    }

    #[test]
    fn time_xfer_overflow_leaves_both_threads_unchanged() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let a = thd_crt(&thds, &kot, 0, 10, 10, false, false).unwrap();
        let b = thd_crt(&thds, &kot, 0, 10, 10, false, false).unwrap();
        thds.with(a, |t| t.local.store(0, Ordering::Release));
        thds.with(b, |t| t.local.store(0, Ordering::Release));
        thds.with(a, |t| t.inner.lock(|i| i.slice = crate::config::MAX_TIME - 1));
        thds.with(b, |t| t.inner.lock(|i| i.slice = 20));

        let err = thd_time_xfer(&thds, &sigs, &core, a, b, TimeXferPolicy::Normal(10));
        assert!(err.is_err());
        assert_eq!(thds.with(a, Thd::slice).unwrap(), crate::config::MAX_TIME - 1);
        assert_eq!(thds.with(b, Thd::slice).unwrap(), 20);
    }

    #[test]
    fn schedule_highest_promotes_ready_thread_over_lower_priority_current() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let core = boot_core();

        let low = thd_crt(&thds, &kot, 0, 10, 3, false, false).unwrap();
        thds.with(low, |t| t.local.store(0, Ordering::Release));
        thds.with(low, |t| t.inner.lock(|i| i.state = ThdState::Running));
        core.local.set_current(Some(low));

        let high = thd_crt(&thds, &kot, 0, 10, 8, false, false).unwrap();
        thds.with(high, |t| t.local.store(0, Ordering::Release));
        reinsert_ready(&thds, &core, high);

        schedule_highest(&thds, &core);
        assert_eq!(core.local.current(), Some(high));
        assert_eq!(thds.with(low, Thd::state).unwrap(), ThdState::Ready);
    }

    #[test]
    fn exec_set_clears_exc_pend_and_rewrites_entry() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let t = thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thds.with(t, |t| t.inner.lock(|i| i.state = ThdState::ExcPend));

        thd_exec_set(&thds, t, 0x1000, 0x2000, 7).unwrap();
        assert_eq!(thds.with(t, Thd::state).unwrap(), ThdState::Timeout);
    }

    #[test]
    fn del_frees_a_free_unreferenced_thread() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let invs = crate::invocation::InvArena::<FakeHal>::new();
        let t = thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();

        thd_del(&thds, &invs, &kot, t).unwrap();
        assert!(!thds.is_live(t));
    }

    #[test]
    fn del_refuses_a_bound_thread() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let invs = crate::invocation::InvArena::<FakeHal>::new();
        let t = thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thds.with(t, |t| t.local.store(0, Ordering::Release));

        assert!(thd_del(&thds, &invs, &kot, t).is_err());
    }
}
