/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Compile-time kernel configuration (spec §6.4).
//!
//! Every value here is a `const`: the core never branches on board
//! identity at runtime, it is all baked in at build time the way the
//! teacher's `cfg_if!`-selected board constants are.

/// Number of bits in one machine word. Drives priority-bitmap word count,
/// flag sub-range packing and KOT word granularity.
pub const WORD_BITS: usize = usize::BITS as usize;

/// Maximum number of capability slots a single capability table may hold.
/// `Cpt_Crt` rejects any request for `0` or more than this.
///
/// This is also the bound used to cap `Cpt_Del`'s empty-slot scan (spec §9
/// Open Questions: "`CPT_ENTRY_MAX` vs `RME_CID_2L`" — resolved as bounded).
pub const CPT_ENTRY_MAX: usize = 1 << (WORD_BITS / 2);

/// Number of distinct preemptive scheduling priorities. Must be a multiple
/// of [`WORD_BITS`] so the run-queue bitmap packs evenly into words.
pub const MAX_PREEMPT_PRIO: usize = 64;

/// Number of bitmap words needed to cover [`MAX_PREEMPT_PRIO`] priorities.
pub const PRIO_WORD_NUM: usize = MAX_PREEMPT_PRIO / WORD_BITS;

/// log2 of the minimum allocation granule tracked by the Kernel Object
/// Table. Every kernel object's backing memory is a multiple of this.
pub const KMEM_SLOT_ORDER: usize = 4; // 16 bytes

/// Total number of machine words backing the KOT bitmap.
pub const KOT_WORD_NUM: usize = 512;

/// Number of hardware co-processor contexts the kernel is built to save
/// (e.g. one FPU). `0` means no co-processor state is ever switched.
pub const COPROCESSOR_COUNT: usize = 1;

/// Number of logical CPUs this build is configured for.
pub const MAX_CPU: usize = 4;

/// When set, page tables name a raw user-supplied physical address instead
/// of a kernel-managed entry tree (spec §3 Page table: "a compile-time
/// mode").
pub const PGTBL_RAW_USER_MODE: bool = false;

/// When set, virtual and physical addresses are identical and the HAL's
/// `Pgdir_Map`/`Page_Map` degenerate to accounting only.
pub const VIRT_EQUALS_PHYS: bool = false;

/// Base address and length of the region reserved for hypervisor-visible
/// external register-save contexts (spec §4.7, HYP threads).
pub const HYPERVISOR_REGION_BASE: usize = 0xF000_0000;
pub const HYPERVISOR_REGION_LEN: usize = 0x0100_0000;

/// Maximum signal counter value (spec §3, §8 scenario 2): the top bit of a
/// machine word is reserved so the value never aliases a negative error
/// code when threaded through the same register width.
pub const MAX_SIG_NUM: usize = usize::MAX >> 1;

/// Sentinel time-slice value meaning "never runs out" for ordinary threads.
pub const INF_TIME: usize = MAX_SIG_NUM - 1;

/// Sentinel time-slice value pinned on boot (init) threads. Init threads
/// are additionally forbidden from blocking, being freed, or being killed.
pub const INIT_TIME: usize = MAX_SIG_NUM;

/// Upper bound for any single time-slice value or transfer amount.
pub const MAX_TIME: usize = INF_TIME;

/// Timestamp distance (in ticks) that must elapse between a capability's
/// freeze and its delete before delete is permitted (spec §4.1, §5).
pub const QUIE_TIME: u64 = 64;

// --- Object arena sizing -----------------------------------------------
//
// The original kernel carves every object's backing memory straight out of
// physically-addressed untyped memory, so a capability table's size is
// bounded only by how much memory the caller hands it (up to the
// theoretical `CPT_ENTRY_MAX` above). A host-testable `no_std` port with no
// global allocator needs a compile-time bound on every array it owns, so
// each kernel object type below gets its own small fixed-capacity arena;
// `Cpt_Crt`/`Pgt_Crt`/... still validate against these just like the
// original validates against the memory handed to it, they just fail
// with `CPT_KOT`/`PGT_HW`-equivalent codes sooner. See DESIGN.md.

/// Maximum live [`crate::captable::Cpt`] objects.
pub const MAX_CPT: usize = 64;
/// Maximum slots a single [`crate::captable::Cpt`] table may hold.
pub const CPT_SLOT_CAPACITY: usize = 64;

/// Maximum live [`crate::pgtbl::Pgt`] objects.
pub const MAX_PGT: usize = 64;
/// Maximum entries a single [`crate::pgtbl::Pgt`] table may hold.
pub const PGT_SLOT_CAPACITY: usize = 64;

/// Maximum live [`crate::process::Prc`] objects.
pub const MAX_PRC: usize = 32;

/// Maximum live [`crate::thread::Thd`] objects.
pub const MAX_THD: usize = 64;
/// Depth of a single thread's invocation frame stack.
pub const INVOCATION_STACK_DEPTH: usize = 8;
/// Depth of a scheduler thread's pending-notification event queue.
pub const SCHED_EVENT_QUEUE_DEPTH: usize = 16;

/// Maximum live [`crate::signal::Sig`] objects.
pub const MAX_SIG: usize = 64;

/// Maximum live [`crate::invocation::Inv`] objects.
pub const MAX_INV: usize = 32;

/// Sentinel meaning "no arena index" / "no thread" wherever an index is
/// kept in an atomic word and can't be a plain `Option` (spec §3: `Free`,
/// signal's absent `thd`, invocation's absent `thd_act`).
pub const NIL: usize = usize::MAX;

/// Number of entries kept in the ambient-stack kernel [`crate::trace`]
/// ring before the oldest entry is overwritten.
pub const TRACE_CAPACITY: usize = 128;
