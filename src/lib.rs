/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! `rme` — a capability-based microkernel core: the capability lifecycle
//! engine, the kernel object allocation bitmap, the multi-priority
//! run-queue scheduler, synchronous invocation, signal endpoints and the
//! page-table/process binding model (spec §1).
//!
//! This crate is the portable core only. Per-architecture register
//! layout, page-table leaf encoding, atomic primitives, context-switch
//! assembly and board bring-up are an external collaborator named by the
//! [`hal::Hal`] trait (spec §6.2); a concrete target selects its own `Hal`
//! implementation at build time the way the teacher's `arch` module is
//! chosen by `cfg_if!`, with [`hal::fake`] standing in for host-side tests.
//!
//! `#![no_std]` except under `cargo test`, so the host test-suite can run
//! against `std` while the shipped kernel never links it.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod atomics;
pub mod cap;
pub mod captable;
pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod hal;
pub mod invocation;
pub mod kfn;
pub mod kobj;
pub mod kot;
pub mod pgtbl;
pub mod process;
pub mod signal;
pub mod sync;
pub mod thread;
pub mod timer;
pub mod trace;

/// All per-component storage a running kernel image needs, parameterized
/// over a concrete [`hal::Hal`] (spec §2: every component's arena, plus the
/// [`kot::Kot`] bitmap backing every one of them and the per-CPU blocks the
/// scheduler and timer mutate).
///
/// A boot sequence builds one of these as a `static`, populates the boot
/// capability table and boot threads through the component constructors in
/// [`captable`]/[`pgtbl`]/[`process`]/[`thread`]/[`signal`]/[`invocation`],
/// then starts handing syscalls and faults to [`dispatch::dispatch`] and
/// [`fault::handle_fault`] (spec §9 "Global state": "the CPU-local block is
/// process-wide per core").
pub struct Kernel<H: hal::Hal> {
    pub kot: kot::Kot,
    pub cpts: captable::CptArena,
    pub pgts: pgtbl::PgtArena<H>,
    pub prcs: process::PrcArena<H>,
    pub thds: thread::ThdArena<H>,
    pub sigs: signal::SigArena,
    pub invs: invocation::InvArena<H>,
    pub cpus: cpu::Cpus,
}

impl<H: hal::Hal> Kernel<H> {
    pub const fn new() -> Self {
        Kernel {
            kot: kot::Kot::new(),
            cpts: captable::CptArena::new(),
            pgts: pgtbl::PgtArena::<H>::new(),
            prcs: process::PrcArena::<H>::new(),
            thds: thread::ThdArena::<H>::new(),
            sigs: signal::SigArena::new(),
            invs: invocation::InvArena::<H>::new(),
            cpus: cpu::Cpus::new(),
        }
    }

    /// Build a [`dispatch::Dispatch`] borrowing every arena plus the
    /// calling core's context, ready to hand a trapped syscall to
    /// [`dispatch::dispatch`].
    pub fn dispatch_on<'a>(&'a self, core: &'a cpu::Core, now: atomics::Timestamp) -> dispatch::Dispatch<'a, H> {
        dispatch::Dispatch {
            kot: &self.kot,
            cpts: &self.cpts,
            pgts: &self.pgts,
            prcs: &self.prcs,
            thds: &self.thds,
            sigs: &self.sigs,
            invs: &self.invs,
            core,
            now,
        }
    }
}

impl<H: hal::Hal> Default for Kernel<H> {
    fn default() -> Self {
        Self::new()
    }
}
