/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Hardware Abstraction Layer contract (spec §6.2).
//!
//! The HAL is an external collaborator, not a kernel component: this
//! module only names the trait boundary the portable core calls through.
//! A real target implements [`Hal`] the way the teacher's `arch::aarch64`
//! module backs `nucleus`; [`fake`] supplies a host-runnable mock so the
//! rest of the crate can be exercised with plain `#[test]`s.
//!
//! Bound statically (an associated-type parameter on the kernel, not a
//! trait object) so there is no vtable indirection on any hot path, the
//! same choice the teacher makes by selecting its `arch` module with
//! `cfg_if!` rather than dynamic dispatch.

use crate::error::{KResult, PgtError};

/// Permission/attribute bits attached to a single page mapping. Kept
/// narrow and portable; a real HAL maps these onto its own PTE format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFlags {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
}

/// One saved general-purpose/PC/SP register context, opaque to the core.
pub trait RegisterSet: Default + Clone {
    /// Program counter of the saved context.
    fn pc(&self) -> usize;
    fn set_pc(&mut self, pc: usize);
    /// Stack pointer of the saved context.
    fn sp(&self) -> usize;
    fn set_sp(&mut self, sp: usize);
    /// Syscall/fault return value slot.
    fn set_retval(&mut self, v: isize);
    /// Raw syscall argument registers, in ABI order.
    fn args(&self) -> [usize; 6];
    /// Single argument register a newly-activated invocation port's entry
    /// point receives (spec §4.9 `Inv_Act`: "the user parameter").
    fn set_entry_arg(&mut self, v: usize);
}

/// Co-processor context (e.g. FPU) saved/restored independently from the
/// general register set, per [`crate::config::COPROCESSOR_COUNT`].
pub trait CoProcessor: Default {
    fn save(&mut self);
    fn restore(&self);
}

/// Page-table manipulation primitives a concrete architecture must supply.
/// The portable [`crate::pgtbl`] component calls through this trait;
/// it never encodes a PTE format itself.
pub trait PageTableOps {
    /// Opaque physical page-table root handle.
    type Table: Copy;

    /// Allocate (from already KOT-marked memory) an empty table rooted at
    /// `phys_addr` of `size_order` entries.
    fn new_table(phys_addr: usize, size_order: usize) -> KResult<Self::Table>;

    /// Map one page. `RME_ERR_PGT_OPFAIL` surfaces as [`PgtError::Opfail`].
    fn map(table: Self::Table, va: usize, pa: usize, flags: MapFlags) -> KResult<()>;

    /// Remove one mapping.
    fn unmap(table: Self::Table, va: usize) -> KResult<()>;

    /// Link a child table into a parent's slot (construction, spec §4.6 `Con`).
    fn construct(parent: Self::Table, index: usize, child: Self::Table) -> KResult<()>;

    /// Undo [`PageTableOps::construct`] (spec §4.6 `Des`).
    fn destruct(parent: Self::Table, index: usize) -> KResult<()>;

    /// Activate `table` as the running address space on the calling core.
    fn switch_to(table: Self::Table);
}

/// The hardware abstraction boundary itself (spec §6.2).
pub trait Hal {
    type Regs: RegisterSet;
    type CoProc: CoProcessor;
    type Pgt: PageTableOps;

    /// Index of the calling logical CPU, `0..MAX_CPU`.
    fn cpu_id() -> usize;

    /// Program the periodic tick interrupt to fire every `period_ticks`.
    fn timer_init(period_ticks: u64);

    /// Emit one byte to the platform's debug console.
    fn putchar(c: u8);

    /// Install the kernel's fault entry point. Called once at boot.
    fn set_fault_handler(handler: fn(cpu: usize, regs: &mut Self::Regs));

    /// Install the kernel's external-interrupt entry point. Called once at boot.
    fn set_interrupt_handler(handler: fn(cpu: usize, irq: usize));

    /// Invoke board-defined kernel function `func` with three scalar
    /// arguments (spec §2 component table "Kfn": "guarded pass-through to
    /// HAL-defined ops"). The portable [`crate::kfn`] component only
    /// enforces the capability's function-id range; what `func` actually
    /// does is entirely up to the concrete HAL.
    fn kern_func(func: usize, a0: usize, a1: usize, a2: usize) -> KResult<isize>;
}

/// Best-effort debug console over [`Hal::putchar`], generalizing the
/// teacher's `CONSOLE`/`print!`/`println!` idiom (`nucleus/src/macros.rs`,
/// `machine/src/devices/console.rs`) to a crate with no single fixed `Hal`
/// impl: rather than a global `Console` static naming one concrete output
/// device, [`Writer`] is a zero-sized `core::fmt::Write` adapter generic
/// over `H`, and [`crate::print!`]/[`crate::println!`] take the `Hal` type
/// as their first argument so the same macro works for any target.
///
/// [`crate::sync::NullLock`] only serializes interleaved bytes from
/// concurrent callers on the same core; cross-core serialization of the
/// physical UART, if the device needs it, is the concrete `Hal`'s problem.
pub struct Writer<H: Hal>(core::marker::PhantomData<H>);

impl<H: Hal> Writer<H> {
    pub fn new() -> Self {
        Writer(core::marker::PhantomData)
    }
}

impl<H: Hal> core::fmt::Write for Writer<H> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            H::putchar(b);
        }
        Ok(())
    }
}

static CONSOLE_LOCK: crate::sync::NullLock<()> = crate::sync::NullLock::new(());

#[doc(hidden)]
pub fn _print<H: Hal>(args: core::fmt::Arguments) {
    use core::fmt::Write;
    CONSOLE_LOCK.lock(|_| {
        Writer::<H>::new().write_fmt(args).ok();
    });
}

/// Print formatted text to `H`'s debug console (spec §6.2 `putchar`),
/// without a trailing newline. The `Hal` type is always the first
/// argument: `print!(FakeHal, "cpu {}", id)`.
#[macro_export]
macro_rules! print {
    ($hal:ty, $($arg:tt)*) => ($crate::hal::_print::<$hal>(format_args!($($arg)*)));
}

/// Same as [`print!`] with a trailing newline.
#[macro_export]
macro_rules! println {
    ($hal:ty) => ($crate::print!($hal, "\n"));
    ($hal:ty, $($arg:tt)*) => ({
        $crate::hal::_print::<$hal>(format_args!($($arg)*));
        $crate::hal::_print::<$hal>(format_args!("\n"));
    });
}

/// Host-runnable mock HAL used by the test-suite in place of a real target
/// backend, in the spirit of a simulator arch backend used for host-driven
/// kernel tests.
pub mod fake {
    use super::*;

    #[derive(Debug, Clone, Default)]
    pub struct FakeRegs {
        pub pc: usize,
        pub sp: usize,
        pub retval: isize,
        pub args: [usize; 6],
        pub entry_arg: usize,
    }

    impl RegisterSet for FakeRegs {
        fn pc(&self) -> usize {
            self.pc
        }
        fn set_pc(&mut self, pc: usize) {
            self.pc = pc;
        }
        fn sp(&self) -> usize {
            self.sp
        }
        fn set_sp(&mut self, sp: usize) {
            self.sp = sp;
        }
        fn set_retval(&mut self, v: isize) {
            self.retval = v;
        }
        fn args(&self) -> [usize; 6] {
            self.args
        }
        fn set_entry_arg(&mut self, v: usize) {
            self.entry_arg = v;
        }
    }

    #[derive(Default)]
    pub struct FakeCoProc;

    impl CoProcessor for FakeCoProc {
        fn save(&mut self) {}
        fn restore(&self) {}
    }

    /// A page table that only tracks which (va -> pa) mappings and which
    /// construction links are present, with no real MMU behind it.
    pub struct FakePgt;

    impl PageTableOps for FakePgt {
        type Table = usize; // opaque id, unused beyond equality in tests

        fn new_table(phys_addr: usize, _size_order: usize) -> KResult<Self::Table> {
            Ok(phys_addr)
        }

        fn map(_table: Self::Table, _va: usize, _pa: usize, _flags: MapFlags) -> KResult<()> {
            Ok(())
        }

        fn unmap(_table: Self::Table, _va: usize) -> KResult<()> {
            Ok(())
        }

        fn construct(_parent: Self::Table, _index: usize, _child: Self::Table) -> KResult<()> {
            Ok(())
        }

        fn destruct(_parent: Self::Table, _index: usize) -> KResult<()> {
            Ok(())
        }

        fn switch_to(_table: Self::Table) {}
    }

    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Single process-wide cell standing in for a per-core id register;
    /// `no_std` has no `std::thread_local!`, and the fake backend only
    /// ever drives one simulated core at a time in host tests.
    static CPU_ID: AtomicUsize = AtomicUsize::new(0);

    /// Lets a test pretend to run on a different core.
    pub fn set_cpu_id(id: usize) {
        CPU_ID.store(id, Ordering::Relaxed);
    }

    pub struct FakeHal;

    impl Hal for FakeHal {
        type Regs = FakeRegs;
        type CoProc = FakeCoProc;
        type Pgt = FakePgt;

        fn cpu_id() -> usize {
            CPU_ID.load(Ordering::Relaxed)
        }

        fn timer_init(_period_ticks: u64) {}

        fn putchar(_c: u8) {}

        fn set_fault_handler(_handler: fn(usize, &mut Self::Regs)) {}

        fn set_interrupt_handler(_handler: fn(usize, usize)) {}

        fn kern_func(func: usize, a0: usize, _a1: usize, _a2: usize) -> KResult<isize> {
            Ok((func + a0) as isize)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn fake_cpu_id_defaults_to_zero() {
            assert_eq!(FakeHal::cpu_id(), 0);
        }

        #[test]
        fn fake_pgt_operations_are_infallible() {
            let t = FakePgt::new_table(0x1000, 12).unwrap();
            FakePgt::map(t, 0x2000, 0x3000, MapFlags { readable: true, writable: false, executable: false, user: true }).unwrap();
            FakePgt::unmap(t, 0x2000).unwrap();
        }

        #[test]
        fn println_macro_runs_over_the_fake_console() {
            crate::println!(FakeHal, "cpu {} booted", FakeHal::cpu_id());
            crate::print!(FakeHal, "no newline");
        }
    }
}
