/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Per-CPU local block (spec §3 "Per-CPU local block") and the run-queue
//! it owns (spec §2 component table: "Per-CPU run-queue").
//!
//! The teacher exposes its equivalent through a `CPU_LOCAL()` accessor
//! bound to "the HAL's current-core block" (see the design note in spec
//! §9); we keep that shape as a fixed-size array indexed by
//! [`crate::hal::Hal::cpu_id`] rather than a thread-local, since `no_std`
//! has no thread-locals and every "CPU" here is just whichever call stack
//! is currently asking.

use crate::config::{MAX_CPU, NIL};
use core::sync::atomic::{AtomicUsize, Ordering};

pub mod runqueue;

pub use runqueue::RunQueue;

/// One core's scheduling context: which thread (if any) is `Running` on
/// it, and the signal endpoints it kernel-sends to on tick/IRQ (spec §3).
pub struct CpuLocal {
    pub cpu_id: usize,
    current: AtomicUsize,
    tick_sig: AtomicUsize,
    irq_sig: AtomicUsize,
}

impl CpuLocal {
    pub const fn new(cpu_id: usize) -> Self {
        CpuLocal {
            cpu_id,
            current: AtomicUsize::new(NIL),
            tick_sig: AtomicUsize::new(NIL),
            irq_sig: AtomicUsize::new(NIL),
        }
    }

    pub fn current(&self) -> Option<usize> {
        let v = self.current.load(Ordering::Acquire);
        if v == NIL {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_current(&self, thd_idx: Option<usize>) {
        self.current.store(thd_idx.unwrap_or(NIL), Ordering::Release);
    }

    pub fn tick_sig(&self) -> Option<usize> {
        let v = self.tick_sig.load(Ordering::Acquire);
        if v == NIL {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_tick_sig(&self, sig_idx: usize) {
        self.tick_sig.store(sig_idx, Ordering::Release);
    }

    pub fn irq_sig(&self) -> Option<usize> {
        let v = self.irq_sig.load(Ordering::Acquire);
        if v == NIL {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_irq_sig(&self, sig_idx: usize) {
        self.irq_sig.store(sig_idx, Ordering::Release);
    }
}

/// One array slot plus its run-queue, owned entirely by that core (spec
/// §5: "the per-CPU run-queue which is mutated only by its owning CPU").
pub struct Core {
    pub local: CpuLocal,
    pub rq: crate::sync::NullLock<RunQueue>,
}

impl Core {
    pub const fn new(cpu_id: usize) -> Self {
        Core {
            local: CpuLocal::new(cpu_id),
            rq: crate::sync::NullLock::new(RunQueue::new()),
        }
    }
}

/// All cores this build is configured for (spec §6.4 `MAX_CPU`).
pub struct Cpus {
    cores: [Core; MAX_CPU],
}

impl Cpus {
    pub const fn new() -> Self {
        // `MAX_CPU` is pinned at 4 by this array literal; a board config
        // wanting a different core count changes both together.
        static_assertions::const_assert_eq!(MAX_CPU, 4);
        Cpus {
            cores: [Core::new(0), Core::new(1), Core::new(2), Core::new(3)],
        }
    }

    pub fn get(&self, cpu_id: usize) -> &Core {
        &self.cores[cpu_id]
    }

    pub fn current<H: crate::hal::Hal>(&self) -> &Core {
        &self.cores[H::cpu_id()]
    }
}
