/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Synchronous invocation (spec §4.9): a per-port call gate, activated by
//! one thread at a time, and the per-thread stack of pending returns it
//! pushes onto.
//!
//! The spec's data model (§3) lists a "saved return-register snapshot" as
//! a field of the port itself; its component design (§4.9) separately
//! describes a frame pushed onto the *thread's* invocation stack holding
//! "return instruction pointer, return stack pointer". Since a port is
//! active on at most one thread at a time (`thd_act` is CAS-guarded), the
//! two describe the same piece of state from two angles. This port keeps
//! no `saved_regs` field of its own; the single source of truth is the
//! frame on the calling thread's stack (see DESIGN.md).

use crate::atomics::cas_usize;
use crate::config::{INVOCATION_STACK_DEPTH, MAX_INV, NIL};
use crate::error::{KResult, SivError};
use crate::hal::{Hal, RegisterSet};
use crate::kobj::Arena;
use crate::kot::Kot;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const INV_BASE: usize = 0x4000_0000;
const INV_STRIDE: usize = 256;

pub type InvArena<H> = Arena<Inv<H>, MAX_INV, INV_BASE, INV_STRIDE>;

/// One invocation port (spec §3 "Invocation port"). `entry`/`stack`/
/// `is_exc_ret` are only ever rewritten while the port is inactive (see
/// [`inv_set`]), but are kept as atomics rather than gated behind a lock
/// so a reader never has to take one just to read the entry point.
pub struct Inv<H: Hal> {
    pub process: usize,
    entry: AtomicUsize,
    stack: AtomicUsize,
    is_exc_ret: AtomicBool,
    thd_act: AtomicUsize,
    _hal: core::marker::PhantomData<H>,
}

impl<H: Hal> Inv<H> {
    pub fn thd_act(&self) -> Option<usize> {
        let v = self.thd_act.load(Ordering::Acquire);
        if v == NIL {
            None
        } else {
            Some(v)
        }
    }

    pub fn entry(&self) -> usize {
        self.entry.load(Ordering::Acquire)
    }

    pub fn stack(&self) -> usize {
        self.stack.load(Ordering::Acquire)
    }

    pub fn is_exc_ret(&self) -> bool {
        self.is_exc_ret.load(Ordering::Acquire)
    }

    /// `null -> thread` (spec §4.9: "flips `thd_act` via CAS from null to
    /// the caller thread"). `Err` means the port is busy (`SIV_ACT`).
    fn try_activate(&self, thread_idx: usize) -> Result<(), ()> {
        cas_usize(&self.thd_act, NIL, thread_idx).map_err(|_| ())
    }

    /// `thread -> null` (release-ordered: spec §4.9 invariant "`thd_act`
    /// transitions null → thread → null").
    fn deactivate(&self) {
        self.thd_act.store(NIL, Ordering::Release);
    }
}

/// One pending return on a thread's invocation stack (spec §4.9: "the
/// frame captures return instruction pointer, return stack pointer").
pub struct Frame {
    pub ret_pc: usize,
    pub ret_sp: usize,
    pub port_idx: usize,
}

/// A thread's LIFO stack of active invocation frames (spec §3 Thread:
/// "head = most recent").
pub struct InvocationStack {
    frames: [Option<Frame>; INVOCATION_STACK_DEPTH],
    len: usize,
}

impl InvocationStack {
    pub fn new() -> Self {
        InvocationStack {
            frames: core::array::from_fn(|_| None),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, frame: Frame) -> Result<(), ()> {
        if self.len >= INVOCATION_STACK_DEPTH {
            return Err(());
        }
        self.frames[self.len] = Some(frame);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<Frame> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        self.frames[self.len].take()
    }

    /// The port named by the new top frame after a pop, i.e. the
    /// invocation the thread is now nested inside (spec §4.9: "Page table
    /// is reset to ... the next invocation frame's process").
    pub fn top_port(&self) -> Option<usize> {
        if self.len == 0 {
            None
        } else {
            self.frames[self.len - 1].as_ref().map(|f| f.port_idx)
        }
    }

    /// Release every frame, resetting each port it names to inactive
    /// (spec §4.9: "deletion of a thread with non-empty invocation stack
    /// releases every frame and resets each to inactive").
    pub fn drain_release<H: Hal>(&mut self, invs: &InvArena<H>) {
        while let Some(frame) = self.pop() {
            invs.with(frame.port_idx, Inv::deactivate);
        }
    }
}

impl Default for InvocationStack {
    fn default() -> Self {
        Self::new()
    }
}

/// `Inv_Crt`: create a new invocation port bound to `process`.
pub fn inv_crt<H: Hal>(
    invs: &InvArena<H>,
    kot: &Kot,
    process: usize,
    entry: usize,
    stack: usize,
    is_exc_ret: bool,
) -> KResult<usize> {
    invs.alloc_with(kot, |_| Inv {
        process,
        entry: AtomicUsize::new(entry),
        stack: AtomicUsize::new(stack),
        is_exc_ret: AtomicBool::new(is_exc_ret),
        thd_act: AtomicUsize::new(NIL),
        _hal: core::marker::PhantomData,
    })
}

/// `Inv_Del`: release a port, refusing while it is active on a thread
/// (spec §4.9: "deletion of an invocation port requires `thd_act ==
/// null`").
pub fn inv_del<H: Hal>(invs: &InvArena<H>, kot: &Kot, idx: usize) -> KResult<()> {
    let active = invs
        .with(idx, Inv::thd_act)
        .expect("capability resolution guarantees a live port");
    if active.is_some() {
        return Err(SivError::Act.into());
    }
    invs.free(kot, idx).map_err(Into::into)
}

/// `Inv_Set`: rebind an inactive port's entry/stack/exception-return
/// policy (named in the syscall ABI table, spec §6.1: "invocation
/// Crt/Del/Set/Act/Ret").
pub fn inv_set<H: Hal>(invs: &InvArena<H>, idx: usize, entry: usize, stack: usize, is_exc_ret: bool) -> KResult<()> {
    invs.with(idx, |inv| {
        if inv.thd_act().is_some() {
            return Err(SivError::Act.into());
        }
        inv.entry.store(entry, Ordering::Release);
        inv.stack.store(stack, Ordering::Release);
        inv.is_exc_ret.store(is_exc_ret, Ordering::Release);
        Ok(())
    })
    .expect("capability resolution guarantees a live port")
}

/// `Inv_Act`: activate `port_idx` on behalf of the calling thread, pushing
/// a return frame and re-pointing `regs` at the port's entry (spec §4.9).
///
/// Returns the port's owning process index so the caller can switch page
/// tables. Zeroing the syscall-retval register on success is the caller's
/// job (spec §4.9: "The return instruction sets the syscall retval zero").
pub fn inv_act<H: Hal>(
    invs: &InvArena<H>,
    port_idx: usize,
    caller_idx: usize,
    regs: &mut H::Regs,
    stack: &mut InvocationStack,
    param: usize,
) -> KResult<usize> {
    let (entry, port_stack, process) = invs
        .with(port_idx, |inv| {
            inv.try_activate(caller_idx)
                .map(|()| (inv.entry(), inv.stack(), inv.process))
                .map_err(|_| SivError::Act)
        })
        .expect("capability resolution guarantees a live port")?;

    let frame = Frame {
        ret_pc: regs.pc(),
        ret_sp: regs.sp(),
        port_idx,
    };
    if stack.push(frame).is_err() {
        // Roll back the activation: no room on the caller's own frame
        // stack, the call never happened from the port's point of view.
        invs.with(port_idx, Inv::deactivate);
        return Err(SivError::Act.into());
    }

    regs.set_pc(entry);
    regs.set_sp(port_stack);
    regs.set_entry_arg(param);
    crate::trace::record(crate::trace::Event::InvActivated {
        inv_idx: port_idx,
        thd_idx: caller_idx,
    });
    Ok(process)
}

/// `Inv_Ret`: pop the top frame, restore the caller's saved registers,
/// stamp `retval` into them, and release the port (spec §4.9 "Return").
///
/// `fault` marks a forced return from the kernel fault path, which must be
/// declined (`SIV_FAULT`) unless the port was created with `is_exc_ret`.
/// Returns the process index execution continues in: the next frame's
/// port's process, or `None` if the stack is now empty (caller falls back
/// to the thread's own owning process).
pub fn inv_ret<H: Hal>(
    invs: &InvArena<H>,
    regs: &mut H::Regs,
    stack: &mut InvocationStack,
    retval: isize,
    fault: bool,
) -> KResult<Option<usize>> {
    let top_port = stack.top_port().ok_or(SivError::Act)?;
    if fault {
        let declined = invs
            .with(top_port, |inv| !inv.is_exc_ret())
            .expect("capability resolution guarantees a live port");
        if declined {
            return Err(SivError::Fault.into());
        }
    }

    let frame = stack.pop().expect("top_port just confirmed a frame exists");
    invs.with(frame.port_idx, Inv::deactivate);

    regs.set_pc(frame.ret_pc);
    regs.set_sp(frame.ret_sp);
    regs.set_retval(retval);

    crate::trace::record(crate::trace::Event::InvReturned { inv_idx: frame.port_idx });
    Ok(stack.top_port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::{FakeHal, FakeRegs};

    type TestArena = InvArena<FakeHal>;

    #[test]
    fn act_then_ret_restores_caller_registers() {
        let kot = Kot::new();
        let invs = TestArena::new();
        let port = inv_crt(&invs, &kot, 7, 0x8000, 0x9000, false).unwrap();

        let mut regs = FakeRegs {
            pc: 0x1000,
            sp: 0x2000,
            ..Default::default()
        };
        let mut stack = InvocationStack::new();

        let process = inv_act(&invs, port, 1, &mut regs, &mut stack, 42).unwrap();
        assert_eq!(process, 7);
        assert_eq!(regs.pc, 0x8000);
        assert_eq!(regs.sp, 0x9000);
        assert_eq!(regs.entry_arg, 42);
        assert_eq!(invs.with(port, Inv::thd_act).unwrap(), Some(1));

        let next = inv_ret::<FakeHal>(&invs, &mut regs, &mut stack, 7, false).unwrap();
        assert_eq!(next, None);
        assert_eq!(regs.pc, 0x1000);
        assert_eq!(regs.sp, 0x2000);
        assert_eq!(regs.retval, 7);
        assert_eq!(invs.with(port, Inv::thd_act).unwrap(), None);
    }

    #[test]
    fn act_twice_on_same_port_is_rejected() {
        let kot = Kot::new();
        let invs = TestArena::new();
        let port = inv_crt(&invs, &kot, 0, 0x8000, 0x9000, false).unwrap();
        let mut regs = FakeRegs::default();
        let mut stack = InvocationStack::new();
        inv_act(&invs, port, 1, &mut regs, &mut stack, 0).unwrap();

        let mut regs2 = FakeRegs::default();
        let mut stack2 = InvocationStack::new();
        let err = inv_act(&invs, port, 2, &mut regs2, &mut stack2, 0);
        assert!(err.is_err());
    }

    #[test]
    fn fault_return_declined_without_is_exc_ret() {
        let kot = Kot::new();
        let invs = TestArena::new();
        let port = inv_crt(&invs, &kot, 0, 0x8000, 0x9000, false).unwrap();
        let mut regs = FakeRegs::default();
        let mut stack = InvocationStack::new();
        inv_act(&invs, port, 1, &mut regs, &mut stack, 0).unwrap();

        let err = inv_ret::<FakeHal>(&invs, &mut regs, &mut stack, 0, true);
        assert!(err.is_err());
        // the activation is left intact; the kernel fault path falls back
        // to killing the thread instead (spec §4.10 scenario 6)
        assert_eq!(invs.with(port, Inv::thd_act).unwrap(), Some(1));
    }

    #[test]
    fn fault_return_allowed_with_is_exc_ret() {
        let kot = Kot::new();
        let invs = TestArena::new();
        let port = inv_crt(&invs, &kot, 0, 0x8000, 0x9000, true).unwrap();
        let mut regs = FakeRegs::default();
        let mut stack = InvocationStack::new();
        inv_act(&invs, port, 1, &mut regs, &mut stack, 0).unwrap();

        inv_ret::<FakeHal>(&invs, &mut regs, &mut stack, -1, true).unwrap();
        assert_eq!(invs.with(port, Inv::thd_act).unwrap(), None);
    }

    #[test]
    fn ret_with_empty_stack_fails() {
        let invs = TestArena::new();
        let mut regs = FakeRegs::default();
        let mut stack = InvocationStack::new();
        assert!(inv_ret::<FakeHal>(&invs, &mut regs, &mut stack, 0, false).is_err());
    }
}
