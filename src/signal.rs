/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Signal endpoint component (spec §4.8): a saturating counter paired with
//! at most one blocked receiver, the kernel's only wakeup primitive.
//!
//! §3 states the invariant this whole module exists to preserve: `thd` and
//! `counter > 0` are mutually exclusive. A send either wakes the blocked
//! thread directly (if one is parked and reachable from the sending core)
//! or bumps the counter; a receive either drains the counter or parks.

use crate::atomics::cas_usize;
use crate::config::{MAX_SIG, MAX_SIG_NUM, NIL};
use crate::cpu::Core;
use crate::error::{KResult, SivError};
use crate::hal::Hal;
use crate::kobj::Arena;
use crate::kot::Kot;
use crate::thread::{self, Thd, ThdArena};
use core::sync::atomic::{AtomicUsize, Ordering};

const SIG_BASE: usize = 0x6000_0000;
const SIG_STRIDE: usize = 64;

pub type SigArena = Arena<Sig, MAX_SIG, SIG_BASE, SIG_STRIDE>;

/// A signal endpoint (spec §3 "Signal"). `notif_ref` is a separate count
/// from a capability's own `root_ref`: it tracks how many bound threads
/// currently name this endpoint as their scheduler signal (spec §4.7
/// `Thd_Sched_Bind`/`Thd_Sched_Free`), not how many capabilities point at
/// the object.
pub struct Sig {
    counter: AtomicUsize,
    thd: AtomicUsize,
    notif_ref: AtomicUsize,
}

impl Sig {
    fn new() -> Self {
        Sig {
            counter: AtomicUsize::new(0),
            thd: AtomicUsize::new(NIL),
            notif_ref: AtomicUsize::new(0),
        }
    }

    fn blocked_thd(&self) -> Option<usize> {
        let v = self.thd.load(Ordering::Acquire);
        if v == NIL {
            None
        } else {
            Some(v)
        }
    }

    fn try_block(&self, thd_idx: usize) -> Result<(), usize> {
        cas_usize(&self.thd, NIL, thd_idx)
    }

    fn try_unblock(&self, expected: usize) -> Result<(), usize> {
        cas_usize(&self.thd, expected, NIL)
    }

    fn bump_counter(&self) -> KResult<()> {
        let prev = self.counter.fetch_add(1, Ordering::AcqRel);
        if prev >= MAX_SIG_NUM {
            self.counter.fetch_sub(1, Ordering::AcqRel);
            return Err(SivError::Full.into());
        }
        Ok(())
    }

    /// Consume one unit, if any.
    fn drain_one(&self) -> Option<usize> {
        loop {
            let cur = self.counter.load(Ordering::Acquire);
            if cur == 0 {
                return None;
            }
            if cas_usize(&self.counter, cur, cur - 1).is_ok() {
                return Some(1);
            }
        }
    }

    /// Consume everything pending, returning how much there was.
    fn drain_all(&self) -> usize {
        self.counter.swap(0, Ordering::AcqRel)
    }

    fn is_deletable(&self) -> bool {
        self.notif_ref.load(Ordering::Acquire) == 0 && self.blocked_thd().is_none()
    }
}

/// `Sig_Crt`: allocate a fresh, empty signal endpoint.
pub fn sig_crt(sigs: &SigArena, kot: &Kot) -> KResult<usize> {
    sigs.alloc(kot, Sig::new())
}

/// `Sig_Del`: free a signal endpoint. Refused while any thread still names
/// it as a scheduler signal or is parked on it.
pub fn sig_del(sigs: &SigArena, kot: &Kot, idx: usize) -> KResult<()> {
    let deletable = sigs.with(idx, Sig::is_deletable).ok_or(SivError::Empty)?;
    if !deletable {
        return Err(SivError::Act.into());
    }
    sigs.free(kot, idx).map_err(Into::into)
}

pub fn sig_bump_notif_ref(sigs: &SigArena, idx: usize) {
    sigs.with(idx, |s| s.notif_ref.fetch_add(1, Ordering::AcqRel));
}

pub fn sig_drop_notif_ref(sigs: &SigArena, idx: usize) {
    sigs.with(idx, |s| s.notif_ref.fetch_sub(1, Ordering::AcqRel));
}

/// Shared body of `Sig_Snd`/the kernel-send helper (spec §4.8 "Send").
/// `from_user` gates whether a directly-woken higher-priority thread
/// preempts the caller; ISR/kernel-originated sends never do (the caller
/// isn't a schedulable context to preempt).
fn sig_snd_inner<H: Hal>(sigs: &SigArena, thds: &ThdArena<H>, core: &Core, idx: usize, from_user: bool) -> KResult<()> {
    loop {
        let blocked = sigs.with(idx, Sig::blocked_thd).ok_or(SivError::Empty)?;
        if let Some(t) = blocked {
            let same_cpu = thds
                .with(t, Thd::local)
                .ok_or(SivError::Empty)?
                .map_or(false, |c| c == core.local.cpu_id);
            if same_cpu {
                let unblocked = sigs.with(idx, |s| s.try_unblock(t)).ok_or(SivError::Empty)?;
                if unblocked.is_ok() {
                    thread::clear_blocked_on(thds, t);
                    thread::set_retval(thds, t, 1);
                    if thread::has_slice(thds, t) {
                        thread::reinsert_ready(thds, core, t);
                    } else {
                        thread::set_timeout(thds, t);
                    }
                    if from_user {
                        let target_prio = thds.with(t, Thd::prio).unwrap_or(0);
                        let caller_prio = core.local.current().and_then(|c| thds.with(c, Thd::prio));
                        if caller_prio.map_or(true, |cp| target_prio > cp) {
                            thread::schedule_highest(thds, core);
                        }
                    }
                    crate::trace::record(crate::trace::Event::SigSent { sig_idx: idx });
                    return Ok(());
                }
                // Lost the race against a concurrent send on another core;
                // re-read and retry rather than falling through to the
                // counter path on stale state.
                continue;
            }
        }
        let result = sigs.with(idx, Sig::bump_counter).ok_or(SivError::Empty)?;
        if result.is_ok() {
            crate::trace::record(crate::trace::Event::SigSent { sig_idx: idx });
        }
        return result;
    }
}

/// `Sig_Snd`: user-originated send. May preempt the caller if it wakes a
/// strictly higher-priority thread on this core (spec §4.8).
pub fn sig_snd<H: Hal>(sigs: &SigArena, thds: &ThdArena<H>, core: &Core, idx: usize) -> KResult<()> {
    sig_snd_inner(sigs, thds, core, idx, true)
}

/// Kernel/ISR-originated send (spec §4.10, §4.11: the tick and
/// notify-parent paths). Never preempts on its own; the caller is expected
/// to invoke [`thread::schedule_highest`] itself afterward. Overflow is
/// swallowed: there is no syscall caller to report `SIV_FULL` to.
pub fn sig_snd_kernel<H: Hal>(sigs: &SigArena, thds: &ThdArena<H>, core: &Core, idx: usize) {
    let _ = sig_snd_inner(sigs, thds, core, idx, false);
}

/// Receive mode (spec §4.8): Blocking-Single/Multi consume one or all
/// pending units and park the caller if none are pending; Non-blocking
/// variants never park.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcvMode {
    BlockSingle,
    BlockMulti,
    NonBlockSingle,
    NonBlockMulti,
}

/// Outcome of [`sig_rcv`]: either an immediate count, or the caller has
/// been descheduled and parked (the dispatcher must not write a return
/// value in that case — the eventual wakeup writes it for them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcvOutcome {
    Received(usize),
    Blocked,
}

fn drain(sigs: &SigArena, idx: usize, multi: bool) -> KResult<Option<usize>> {
    if multi {
        let n = sigs.with(idx, Sig::drain_all).ok_or(SivError::Empty)?;
        Ok(if n == 0 { None } else { Some(n) })
    } else {
        sigs.with(idx, Sig::drain_one).ok_or(SivError::Empty.into())
    }
}

/// `Sig_Rcv`: receive from `idx` as the calling core's current thread
/// (spec §4.8). Init threads are forbidden to block (`SIV_BOOT`).
pub fn sig_rcv<H: Hal>(sigs: &SigArena, thds: &ThdArena<H>, core: &Core, idx: usize, mode: RcvMode) -> KResult<RcvOutcome> {
    use crate::error::PthError;

    let caller = core.local.current().ok_or(PthError::InvState)?;
    let multi = matches!(mode, RcvMode::BlockMulti | RcvMode::NonBlockMulti);
    let blocking = matches!(mode, RcvMode::BlockSingle | RcvMode::BlockMulti);

    if let Some(n) = drain(sigs, idx, multi)? {
        return Ok(RcvOutcome::Received(n));
    }
    if !blocking {
        return Err(SivError::Empty.into());
    }
    if thds.with(caller, Thd::is_init).ok_or(PthError::InvState)? {
        return Err(SivError::Boot.into());
    }

    let claimed = sigs.with(idx, |s| s.try_block(caller)).ok_or(SivError::Empty)?;
    claimed.map_err(|_| SivError::Conflict)?;

    // Close the window between the drain attempt above and claiming `thd`:
    // a send may have bumped the counter in between. Re-check under the
    // same mode before actually parking (spec §3 invariant: `thd != null`
    // and `counter > 0` are mutually exclusive).
    if let Some(n) = drain(sigs, idx, multi)? {
        let _ = sigs.with(idx, |s| s.try_unblock(caller));
        return Ok(RcvOutcome::Received(n));
    }

    thread::set_blocked_on(thds, caller, idx);
    thread::set_blocked(thds, caller);
    core.local.set_current(None);
    thread::schedule_highest(thds, core);
    crate::trace::record(crate::trace::Event::SigBlocked {
        sig_idx: idx,
        thd_idx: caller,
    });
    Ok(RcvOutcome::Blocked)
}

/// Cancellation path for `Thd_Sched_Free` (spec §4.7): release a thread
/// that was parked on a signal endpoint, delivering `SIV_FREE` instead of
/// the normal wakeup value.
pub fn sig_release_blocked<H: Hal>(sigs: &SigArena, thds: &ThdArena<H>, thd_idx: usize) {
    if let Some(sig_idx) = thread::blocked_on(thds, thd_idx) {
        sigs.with(sig_idx, |s| {
            let _ = s.try_unblock(thd_idx);
        });
        thread::clear_blocked_on(thds, thd_idx);
    }
    let code: isize = crate::error::KError::from(SivError::Free).into();
    thread::set_retval(thds, thd_idx, code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeHal;
    use core::sync::atomic::Ordering as O;

    type TestThdArena = ThdArena<FakeHal>;

    fn boot_core() -> Core {
        Core::new(0)
    }

    #[test]
    fn send_without_receiver_bumps_counter() {
        let kot = Kot::new();
        let sigs = SigArena::new();
        let thds = TestThdArena::new();
        let core = boot_core();
        let idx = sig_crt(&sigs, &kot).unwrap();

        sig_snd(&sigs, &thds, &core, idx).unwrap();
        sig_snd(&sigs, &thds, &core, idx).unwrap();
        assert_eq!(sigs.with(idx, |s| s.counter.load(O::Relaxed)).unwrap(), 2);
    }

    #[test]
    fn counter_saturates_and_reports_full() {
        let kot = Kot::new();
        let sigs = SigArena::new();
        let thds = TestThdArena::new();
        let core = boot_core();
        let idx = sig_crt(&sigs, &kot).unwrap();

        sigs.with(idx, |s| s.counter.store(MAX_SIG_NUM as usize, O::Relaxed));
        let err = sig_snd(&sigs, &thds, &core, idx);
        assert!(err.is_err());
        assert_eq!(sigs.with(idx, |s| s.counter.load(O::Relaxed)).unwrap(), MAX_SIG_NUM);
    }

    #[test]
    fn blocking_receive_parks_then_wakes_on_send() {
        let kot = Kot::new();
        let sigs = SigArena::new();
        let thds = TestThdArena::new();
        let core = boot_core();
        let idx = sig_crt(&sigs, &kot).unwrap();

        let receiver = crate::thread::thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thds.with(receiver, |t| t.local.store(0, O::Release));
        core.local.set_current(Some(receiver));

        let outcome = sig_rcv(&sigs, &thds, &core, idx, RcvMode::BlockSingle).unwrap();
        assert_eq!(outcome, RcvOutcome::Blocked);
        assert_eq!(thds.with(receiver, crate::thread::Thd::state).unwrap(), crate::thread::ThdState::Blocked);
        assert_eq!(core.local.current(), None);

        sig_snd(&sigs, &thds, &core, idx).unwrap();
        assert_eq!(thread::blocked_on(&thds, receiver), None);
    }

    #[test]
    fn non_blocking_receive_on_empty_endpoint_fails() {
        let kot = Kot::new();
        let sigs = SigArena::new();
        let thds = TestThdArena::new();
        let core = boot_core();
        let idx = sig_crt(&sigs, &kot).unwrap();
        let receiver = crate::thread::thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        core.local.set_current(Some(receiver));

        assert!(sig_rcv(&sigs, &thds, &core, idx, RcvMode::NonBlockSingle).is_err());
    }

    #[test]
    fn init_thread_cannot_block() {
        let kot = Kot::new();
        let sigs = SigArena::new();
        let thds = TestThdArena::new();
        let core = boot_core();
        let idx = sig_crt(&sigs, &kot).unwrap();
        let init = crate::thread::thd_crt(&thds, &kot, 0, 10, 10, false, true).unwrap();
        core.local.set_current(Some(init));

        let err = sig_rcv(&sigs, &thds, &core, idx, RcvMode::BlockSingle);
        assert_eq!(err, Err(SivError::Boot.into()));
    }

    #[test]
    fn multi_receive_drains_entire_counter() {
        let kot = Kot::new();
        let sigs = SigArena::new();
        let thds = TestThdArena::new();
        let core = boot_core();
        let idx = sig_crt(&sigs, &kot).unwrap();
        let receiver = crate::thread::thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        core.local.set_current(Some(receiver));

        sigs.with(idx, |s| s.counter.store(5, O::Relaxed));
        let outcome = sig_rcv(&sigs, &thds, &core, idx, RcvMode::NonBlockMulti).unwrap();
        assert_eq!(outcome, RcvOutcome::Received(5));
        assert_eq!(sigs.with(idx, |s| s.counter.load(O::Relaxed)).unwrap(), 0);
    }

    #[test]
    fn del_refused_while_notif_ref_held() {
        let kot = Kot::new();
        let sigs = SigArena::new();
        let idx = sig_crt(&sigs, &kot).unwrap();
        sig_bump_notif_ref(&sigs, idx);
        assert!(sig_del(&sigs, &kot, idx).is_err());
        sig_drop_notif_ref(&sigs, idx);
        assert!(sig_del(&sigs, &kot, idx).is_ok());
    }
}
