/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Kernel function component (spec §2 component table "Kfn": "guarded
//! pass-through to HAL-defined ops").
//!
//! A Kfn capability has no backing kernel object (spec §4.3: "exempt from
//! refcounting"); it names a contiguous `[lo, hi]` range of HAL-defined
//! function ids a holder may invoke through `Kfn_Act`. Spec §4.3 also
//! describes range narrowing on delegation for range-typed caps (Pgt, Kfn);
//! this port does not carry a dedicated sub-range field through `Cpt_Add`
//! (see DESIGN.md) — the range is fixed at creation and copied verbatim on
//! delegation, with the guard enforced here, at invocation time, instead.

use crate::cap::slot::{CapFlags, CapType, Slot};
use crate::error::{CptError, KResult};
use crate::hal::Hal;

/// Pack a `[lo, hi]` function-id range into the slot's object field, the
/// same field a real backing-object address would occupy.
fn pack_range(lo: u32, hi: u32) -> usize {
    ((lo as usize) << 32) | hi as usize
}

fn unpack_range(object: usize) -> (u32, u32) {
    ((object >> 32) as u32, (object & 0xFFFF_FFFF) as u32)
}

/// `Kfn_Crt`: publish a root Kfn capability over `[lo, hi]` directly into
/// `dst`, reserved beforehand by the caller via [`Slot::begin_create`].
pub fn kfn_crt(dst: &Slot, lo: u32, hi: u32, flags: CapFlags) -> KResult<()> {
    if lo > hi {
        return Err(CptError::Range.into());
    }
    dst.publish_root(CapType::Kfn, flags, pack_range(lo, hi));
    Ok(())
}

/// `Kfn_Act`: invoke HAL function `func` with three arguments through a
/// resolved Kfn capability slot, refusing if `func` falls outside the
/// capability's range.
pub fn kfn_act<H: Hal>(slot: &Slot, func: usize, a0: usize, a1: usize, a2: usize) -> KResult<isize> {
    let header = slot.load_header();
    if header.cap_type != CapType::Kfn {
        return Err(CptError::Flag.into());
    }
    let (lo, hi) = unpack_range(slot.object());
    if func < lo as usize || func > hi as usize {
        return Err(CptError::Range.into());
    }
    H::kern_func(func, a0, a1, a2)
}
