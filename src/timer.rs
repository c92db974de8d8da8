/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Timer tick and notification (spec §4.11).
//!
//! Every periodic tick decrements the running thread's time slice (unless
//! it runs with [`crate::config::INF_TIME`] or is an init thread), times it
//! out on exhaustion, unconditionally kernel-sends the core's tick signal
//! endpoint, then reschedules. [`elapse`] is the variant syscall exit/entry
//! bookkeeping uses: it floors the slice at one so "a caller of a syscall
//! is still the current thread on syscall exit" (spec §4.11) always holds.

use crate::config::INF_TIME;
use crate::cpu::Core;
use crate::hal::Hal;
use crate::signal::SigArena;
use crate::thread::{self, ThdArena};

/// Full periodic tick (spec §4.11).
pub fn tick<H: Hal>(thds: &ThdArena<H>, sigs: &SigArena, core: &Core) {
    decrement_slice(thds, sigs, core, true);
    if let Some(tick_sig) = core.local.tick_sig() {
        crate::signal::sig_snd_kernel(sigs, thds, core, tick_sig);
    }
    thread::schedule_highest(thds, core);
}

/// Accounting-only variant that never lets the current thread's slice
/// reach zero (spec §4.11).
pub fn elapse<H: Hal>(thds: &ThdArena<H>, sigs: &SigArena, core: &Core) {
    decrement_slice(thds, sigs, core, false);
}

fn decrement_slice<H: Hal>(thds: &ThdArena<H>, sigs: &SigArena, core: &Core, allow_timeout: bool) {
    let Some(cur_idx) = core.local.current() else {
        return;
    };
    let (slice, is_init) = match thds.with(cur_idx, |t| (t.slice(), t.is_init())) {
        Some(v) => v,
        None => return,
    };
    if is_init || slice == INF_TIME {
        return;
    }
    let floor = if allow_timeout { 0 } else { 1 };
    if slice <= floor {
        return;
    }
    let new_slice = slice - 1;
    thread::set_slice(thds, cur_idx, new_slice);
    if new_slice == 0 {
        thread::set_timeout(thds, cur_idx);
        core.local.set_current(None);
        thread::notify_parent(thds, sigs, core, cur_idx, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeHal;
    use crate::kot::Kot;
    use core::sync::atomic::Ordering;

    type TestThdArena = ThdArena<FakeHal>;

    fn boot_core() -> Core {
        Core::new(0)
    }

    #[test]
    fn tick_decrements_current_threads_slice() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let t = thread::thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thds.with(t, |t| t.local.store(0, Ordering::Release));
        thread::set_slice(&thds, t, 10);
        core.local.set_current(Some(t));

        tick(&thds, &sigs, &core);
        assert_eq!(thds.with(t, crate::thread::Thd::slice).unwrap(), 9);
    }

    #[test]
    fn tick_times_out_thread_on_exhaustion_and_notifies_parent() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let parent = thread::thd_crt(&thds, &kot, 0, 10, 10, false, true).unwrap();
        thds.with(parent, |t| t.local.store(0, Ordering::Release));
        let child = thread::thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thread::thd_sched_bind(&thds, &sigs, &core, child, parent, None, 3, 5, crate::config::NIL).unwrap();
        thread::set_slice(&thds, child, 1);
        core.local.set_current(Some(child));

        tick(&thds, &sigs, &core);
        assert_eq!(
            thds.with(child, crate::thread::Thd::state).unwrap(),
            crate::thread::ThdState::Timeout
        );
        assert_eq!(core.local.current(), None);
        let event = thread::thd_sched_rcv(&thds, &core, parent).unwrap();
        assert_eq!(event.tid, 3);
        assert!(!event.fault);
    }

    #[test]
    fn elapse_never_exhausts_the_current_threads_slice() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let t = thread::thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thds.with(t, |t| t.local.store(0, Ordering::Release));
        thread::set_slice(&thds, t, 1);
        core.local.set_current(Some(t));

        elapse(&thds, &sigs, &core);
        assert_eq!(thds.with(t, crate::thread::Thd::slice).unwrap(), 1);
    }

    #[test]
    fn tick_with_infinite_slice_is_a_no_op() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let t = thread::thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thds.with(t, |t| t.local.store(0, Ordering::Release));
        thread::set_slice(&thds, t, INF_TIME);
        core.local.set_current(Some(t));

        tick(&thds, &sigs, &core);
        assert_eq!(thds.with(t, crate::thread::Thd::slice).unwrap(), INF_TIME);
    }
}
