/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Fault path (spec §4.10): what the kernel does with a thread that just
//! took an architectural fault (MMU, undefined instruction, ...).
//!
//! Mirrors spec §8 scenario 6: try an invocation return first (a thread
//! running behind a fault-tolerant port just resumes its caller); only
//! kill the thread if that is declined or there was no active invocation
//! to return through.

use crate::cpu::Core;
use crate::error::{KResult, PthError};
use crate::hal::Hal;
use crate::invocation::{self, InvArena};
use crate::signal::SigArena;
use crate::thread::{self, Thd, ThdArena};

/// Entry point the HAL's fault trampoline calls after saving the faulting
/// thread's registers (spec §4.10).
pub fn handle_fault<H: Hal>(
    thds: &ThdArena<H>,
    invs: &InvArena<H>,
    sigs: &SigArena,
    core: &Core,
    thd_idx: usize,
) -> KResult<()> {
    let returned = thread::with_regs_and_stack(thds, thd_idx, |regs, stack| {
        if stack.is_empty() {
            false
        } else {
            invocation::inv_ret::<H>(invs, regs, stack, -1, true).is_ok()
        }
    })
    .ok_or(PthError::InvState)?;

    if returned {
        crate::trace::record(crate::trace::Event::Fault {
            thd_idx,
            killed: false,
        });
        return Ok(());
    }

    if thds.with(thd_idx, Thd::is_init).ok_or(PthError::InvState)? {
        panic!("fault on an init thread");
    }

    thread::remove_from_runqueue(thds, core, thd_idx);
    thread::set_slice(thds, thd_idx, 0);
    thread::set_exc_pend(thds, thd_idx);
    if core.local.current() == Some(thd_idx) {
        core.local.set_current(None);
    }
    thread::notify_parent(thds, sigs, core, thd_idx, true);
    thread::schedule_highest(thds, core);
    crate::trace::record(crate::trace::Event::Fault {
        thd_idx,
        killed: true,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeHal;
    use crate::kot::Kot;

    type TestThdArena = ThdArena<FakeHal>;
    type TestInvArena = InvArena<FakeHal>;

    fn boot_core() -> Core {
        Core::new(0)
    }

    #[test]
    fn fault_with_no_invocation_kills_thread_and_notifies_parent() {
        let kot = Kot::new();
        let thds = TestThdArena::new();
        let invs = TestInvArena::new();
        let sigs = SigArena::new();
        let core = boot_core();

        let parent = thread::thd_crt(&thds, &kot, 0, 10, 10, false, true).unwrap();
        thds.with(parent, |t| t.local.store(0, core::sync::atomic::Ordering::Release));

        let child = thread::thd_crt(&thds, &kot, 0, 10, 5, false, false).unwrap();
        thread::thd_sched_bind(&thds, &sigs, &core, child, parent, None, 9, 5, crate::config::NIL).unwrap();
        core.local.set_current(Some(child));

        handle_fault(&thds, &invs, &sigs, &core, child).unwrap();
        assert_eq!(
            thds.with(child, Thd::state).unwrap(),
            crate::thread::ThdState::ExcPend
        );
        let event = thread::thd_sched_rcv(&thds, &core, parent).unwrap();
        assert_eq!(event.tid, 9);
        assert!(event.fault);
    }
}
