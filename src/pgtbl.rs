/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Page table component (spec §4.5): `Crt`/`Del`/`Add`/`Rem`/`Con`/`Des`,
//! HAL-backed.
//!
//! A [`Pgt`] is immutable after creation in its shape
//! (`base`, `is_top`, `size_order`, `num_order`); only its parent/child
//! link counters move, and only via `fetch_add`/`fetch_sub` (spec §5:
//! "Page tables: ... parent/child counters use fetch-add").

use crate::config::{MAX_PGT, WORD_BITS};
use crate::error::{KResult, PgtError};
use crate::hal::{Hal, MapFlags, PageTableOps};
use crate::kobj::Arena;
use crate::kot::Kot;
use core::sync::atomic::{AtomicUsize, Ordering};

const PGT_BASE: usize = 0x2000_0000;
const PGT_STRIDE: usize = 4096;

pub type PgtArena<H> = Arena<Pgt<H>, MAX_PGT, PGT_BASE, PGT_STRIDE>;

/// The HAL's opaque physical page-table handle, re-derived through an
/// alias so it can be named in a field position without writing the
/// two-hop associated-type path out every time.
type Handle<H> = <<H as Hal>::Pgt as PageTableOps>::Table;

/// One page table object (spec §3 "Page table"): immutable shape plus the
/// construction-link counters that move under `fetch_add`/`fetch_sub`.
pub struct Pgt<H: Hal> {
    pub base: usize,
    pub is_top: bool,
    pub size_order: usize,
    pub num_order: usize,
    parent_count: AtomicUsize,
    child_count: AtomicUsize,
    proc_ref: AtomicUsize,
    table: Handle<H>,
}

impl<H: Hal> Pgt<H> {
    pub fn parent_count(&self) -> usize {
        self.parent_count.load(Ordering::Acquire)
    }

    pub fn child_count(&self) -> usize {
        self.child_count.load(Ordering::Acquire)
    }

    /// Number of processes currently naming this table as their root (spec
    /// §4.6 "Prc_Cpt and Prc_Pgt replace either by CAS ... then increment
    /// new / decrement old refcnt"); `Pgt` has no embedded `Slot` array of
    /// its own to borrow a cell from the way `Cpt` does, so this is a
    /// dedicated counter.
    pub fn proc_ref(&self) -> usize {
        self.proc_ref.load(Ordering::Acquire)
    }

    pub(crate) fn bump_proc_ref(&self) {
        self.proc_ref.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_proc_ref(&self) {
        self.proc_ref.fetch_sub(1, Ordering::AcqRel);
    }

    /// `Del_Check` equivalent: both link counts and the process refcount
    /// must be zero (spec §4.5 "deletion requires both counts = 0").
    pub fn deletable(&self) -> bool {
        self.parent_count() == 0 && self.child_count() == 0 && self.proc_ref() == 0
    }
}

/// `Pgt_Crt`: allocate a new page table object of the given shape.
pub fn pgt_crt<H: Hal>(
    pgts: &PgtArena<H>,
    kot: &Kot,
    base: usize,
    is_top: bool,
    size_order: usize,
    num_order: usize,
) -> KResult<usize> {
    if size_order + num_order > WORD_BITS {
        return Err(PgtError::Addr.into());
    }
    let span = 1usize << (size_order + num_order);
    if base % span != 0 {
        return Err(PgtError::Addr.into());
    }
    pgts.alloc_with(kot, |_| {
        let table = H::Pgt::new_table(base, size_order).expect("validated above");
        Pgt {
            base,
            is_top,
            size_order,
            num_order,
            parent_count: AtomicUsize::new(0),
            child_count: AtomicUsize::new(0),
            proc_ref: AtomicUsize::new(0),
            table,
        }
    })
}

/// `Pgt_Del`: release a page table, refusing while it is still linked to
/// any parent or child (spec §4.5 "deletion requires both counts = 0").
pub fn pgt_del<H: Hal>(pgts: &PgtArena<H>, kot: &Kot, idx: usize) -> KResult<()> {
    let deletable = pgts.with(idx, Pgt::deletable).ok_or(PgtError::Addr)?;
    if !deletable {
        return Err(PgtError::Map.into());
    }
    pgts.free(kot, idx).map_err(Into::into)
}

/// `Pgt_Add`: map a physical sub-frame from `table` into `table`'s own
/// managed entries with `flags` (spec §4.5 "Add maps a physical sub-frame
/// ... with narrowable permissions").
pub fn pgt_add<H: Hal>(pgts: &PgtArena<H>, idx: usize, va: usize, pa: usize, flags: MapFlags) -> KResult<()> {
    pgts.with(idx, |pgt| H::Pgt::map(pgt.table, va, pa, flags))
        .ok_or(PgtError::Addr)?
}

/// `Pgt_Rem`: undo [`pgt_add`].
pub fn pgt_rem<H: Hal>(pgts: &PgtArena<H>, idx: usize, va: usize) -> KResult<()> {
    pgts.with(idx, |pgt| H::Pgt::unmap(pgt.table, va))
        .ok_or(PgtError::Addr)?
}

/// `Pgt_Con`: nest `child` into `parent`'s slot `index`, bumping both
/// tables' link counters (spec §4.5 "Refcount discipline: Con/Des
/// increment/decrement *both* parent and child table root refcnts").
///
/// `equal_va` selects the HAL's addressing discipline: when the platform
/// enforces equal-virtual-address nesting the child's base must fall
/// within the parent slot's window; otherwise full size-order equality is
/// required (spec §4.5 "no path compression").
pub fn pgt_con<H: Hal>(
    pgts: &PgtArena<H>,
    parent_idx: usize,
    index: usize,
    child_idx: usize,
    equal_va: bool,
) -> KResult<()> {
    if parent_idx == child_idx {
        return Err(PgtError::Addr.into());
    }
    let (parent_table, parent_shape) = pgts
        .with(parent_idx, |p| (p.table, (p.base, p.size_order, p.num_order)))
        .ok_or(PgtError::Addr)?;
    let (child_table, child_base, child_size_order) = pgts
        .with(child_idx, |c| (c.table, c.base, c.size_order))
        .ok_or(PgtError::Addr)?;

    let (parent_base, parent_size_order, _parent_num_order) = parent_shape;
    if equal_va {
        let slot_span = 1usize << parent_size_order;
        let slot_base = parent_base + index * slot_span;
        if child_base < slot_base || child_base >= slot_base + slot_span {
            return Err(PgtError::Addr.into());
        }
    } else if child_size_order != parent_size_order {
        return Err(PgtError::Addr.into());
    }

    H::Pgt::construct(parent_table, index, child_table)?;

    pgts.with(parent_idx, |p| p.child_count.fetch_add(1, Ordering::AcqRel));
    pgts.with(child_idx, |c| c.parent_count.fetch_add(1, Ordering::AcqRel));
    Ok(())
}

/// `Pgt_Des`: undo [`pgt_con`].
pub fn pgt_des<H: Hal>(pgts: &PgtArena<H>, parent_idx: usize, index: usize, child_idx: usize) -> KResult<()> {
    let parent_table = pgts.with(parent_idx, |p| p.table).ok_or(PgtError::Addr)?;
    H::Pgt::destruct(parent_table, index)?;
    pgts.with(parent_idx, |p| p.child_count.fetch_sub(1, Ordering::AcqRel));
    pgts.with(child_idx, |c| c.parent_count.fetch_sub(1, Ordering::AcqRel));
    Ok(())
}

/// `Pgt_Set`/`switch_to`: activate `idx` as the running address space on
/// the calling core.
pub fn pgt_switch_to<H: Hal>(pgts: &PgtArena<H>, idx: usize) {
    if let Some(table) = pgts.with(idx, |p| p.table) {
        H::Pgt::switch_to(table);
    }
}
