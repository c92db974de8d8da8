/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Process component (spec §4.6): binds one capability table and one page
//! table, reference-counting both.

use crate::atomics::cas_usize;
use crate::cap::Slot;
use crate::captable::CptArena;
use crate::config::MAX_PRC;
use crate::error::{KResult, PthError};
use crate::hal::Hal;
use crate::kobj::Arena;
use crate::kot::Kot;
use crate::pgtbl::PgtArena;
use core::sync::atomic::{AtomicUsize, Ordering};

const PRC_BASE: usize = 0x3000_0000;
const PRC_STRIDE: usize = 256;

pub type PrcArena<H> = Arena<Prc<H>, MAX_PRC, PRC_BASE, PRC_STRIDE>;

/// A process: the (capability table, page table) pair a thread's
/// invocation stack names to know which address space/rights it runs
/// with (spec §3 "Process").
pub struct Prc<H: crate::hal::Hal> {
    cpt_idx: AtomicUsize,
    pgt_idx: AtomicUsize,
    _hal: core::marker::PhantomData<H>,
}

impl<H: Hal> Prc<H> {
    pub fn cpt(&self) -> usize {
        self.cpt_idx.load(Ordering::Acquire)
    }

    pub fn pgt(&self) -> usize {
        self.pgt_idx.load(Ordering::Acquire)
    }
}

/// `Prc_Crt`: create a process bound to `cpt_idx`/`pgt_idx`, incrementing
/// both root caps' refcounts (spec §4.6 "increments refcnts of both").
pub fn prc_crt<H: Hal>(
    prcs: &PrcArena<H>,
    kot: &Kot,
    cpt_root_slot: &Slot,
    pgt_root_slot: &Slot,
    cpt_idx: usize,
    pgt_idx: usize,
) -> KResult<usize> {
    let idx = prcs.alloc_with(kot, |_| Prc {
        cpt_idx: AtomicUsize::new(cpt_idx),
        pgt_idx: AtomicUsize::new(pgt_idx),
        _hal: core::marker::PhantomData,
    })?;
    cpt_root_slot.bump_ref();
    pgt_root_slot.bump_ref();
    Ok(idx)
}

/// `Prc_Del`: release a process, decrementing both refcounts.
pub fn prc_del<H: Hal>(
    prcs: &PrcArena<H>,
    kot: &Kot,
    cpt_root_slot: &Slot,
    pgt_root_slot: &Slot,
    idx: usize,
) -> KResult<()> {
    prcs.free(kot, idx)?;
    cpt_root_slot.drop_ref();
    pgt_root_slot.drop_ref();
    Ok(())
}

/// `Prc_Cpt`: CAS-swap a process's capability table for `new_idx`,
/// bumping the new root's refcount and dropping the old one's only on
/// success (spec §4.6 "Concurrent swap losers get `PTH_CONFLICT`").
pub fn prc_cpt<H: Hal>(
    prcs: &PrcArena<H>,
    cpts: &CptArena,
    prc_idx: usize,
    new_cpt_idx: usize,
) -> KResult<()> {
    if !cpts.is_live(new_cpt_idx) {
        return Err(PthError::InvState.into());
    }
    let old = prcs.with(prc_idx, |p| p.cpt()).ok_or(PthError::InvState)?;
    // Bump the new root before publishing the swap so a concurrent delete
    // of the new table can never observe a zero refcount mid-swap.
    cpts.with(new_cpt_idx, |cpt| cpt.slots()[0].bump_ref());
    let swapped = prcs
        .with(prc_idx, |p| cas_usize(&p.cpt_idx, old, new_cpt_idx))
        .ok_or(PthError::InvState)?;
    match swapped {
        Ok(()) => {
            cpts.with(old, |cpt| cpt.slots()[0].drop_ref());
            Ok(())
        }
        Err(_) => {
            cpts.with(new_cpt_idx, |cpt| cpt.slots()[0].drop_ref());
            Err(PthError::Conflict.into())
        }
    }
}

/// `Prc_Pgt`: same swap protocol as [`prc_cpt`] but for the page table
/// (spec §4.6 "Prc_Cpt and Prc_Pgt replace either by CAS on the Process's
/// pointer, then increment new / decrement old refcnt").
pub fn prc_pgt<H: Hal>(
    prcs: &PrcArena<H>,
    pgts: &PgtArena<H>,
    prc_idx: usize,
    new_pgt_idx: usize,
) -> KResult<()> {
    if !pgts.is_live(new_pgt_idx) {
        return Err(PthError::InvState.into());
    }
    let old = prcs.with(prc_idx, |p| p.pgt()).ok_or(PthError::InvState)?;
    // Bump the new root before publishing the swap so a concurrent delete
    // of the new table can never observe a zero refcount mid-swap.
    pgts.with(new_pgt_idx, |pgt| pgt.bump_proc_ref());
    let swapped = prcs
        .with(prc_idx, |p| cas_usize(&p.pgt_idx, old, new_pgt_idx))
        .ok_or(PthError::InvState)?;
    match swapped {
        Ok(()) => {
            pgts.with(old, |pgt| pgt.drop_proc_ref());
            Ok(())
        }
        Err(_) => {
            pgts.with(new_pgt_idx, |pgt| pgt.drop_proc_ref());
            Err(PthError::Conflict.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::CapId;
    use crate::captable::{cpt_crt, Cpt};
    use crate::hal::fake::FakeHal;
    use crate::pgtbl::{pgt_crt, Pgt};

    type TestPrcArena = PrcArena<FakeHal>;

    #[test]
    fn crt_bumps_both_root_refcounts() {
        let kot = Kot::new();
        let cpts = CptArena::new();
        let pgts = PgtArena::<FakeHal>::new();
        let prcs = TestPrcArena::new();

        let boot_cpt = cpts.alloc(&kot, Cpt::new_boot(16).unwrap()).unwrap();
        cpt_crt(&cpts, &kot, boot_cpt, CapId::first_level(0), 4).unwrap();
        let (cpt_table_idx, _) =
            crate::captable::lookup_table_index(&cpts, boot_cpt, CapId::first_level(0)).unwrap();
        let pgt_idx = pgt_crt(&pgts, &kot, 0x2000_0000, true, 12, 9).unwrap();

        cpts.with(boot_cpt, |cpt| {
            let prc_idx = prc_crt(
                &prcs,
                &kot,
                &cpt.slots()[0],
                &cpt.slots()[0], // stand-in pgt root slot for this unit test
                cpt_table_idx,
                pgt_idx,
            )
            .unwrap();
            assert_eq!(prcs.with(prc_idx, |p| p.cpt()).unwrap(), cpt_table_idx);
            assert_eq!(prcs.with(prc_idx, |p| p.pgt()).unwrap(), pgt_idx);
        });
        let refcount = cpts.with(boot_cpt, |cpt| cpt.slots()[0].ref_count()).unwrap();
        assert_eq!(refcount, 2);
    }

    #[test]
    fn cpt_swap_updates_pointer() {
        let kot = Kot::new();
        let cpts = CptArena::new();
        let prcs = TestPrcArena::new();
        let boot_cpt = cpts.alloc(&kot, Cpt::new_boot(16).unwrap()).unwrap();
        cpt_crt(&cpts, &kot, boot_cpt, CapId::first_level(0), 4).unwrap();
        cpt_crt(&cpts, &kot, boot_cpt, CapId::first_level(1), 4).unwrap();
        let (first, _) =
            crate::captable::lookup_table_index(&cpts, boot_cpt, CapId::first_level(0)).unwrap();
        let (second, _) =
            crate::captable::lookup_table_index(&cpts, boot_cpt, CapId::first_level(1)).unwrap();

        let prc_idx = cpts
            .with(boot_cpt, |cpt| {
                prc_crt(&prcs, &kot, &cpt.slots()[0], &cpt.slots()[0], first, first).unwrap()
            })
            .unwrap();

        prc_cpt(&prcs, &cpts, prc_idx, second).unwrap();
        assert_eq!(prcs.with(prc_idx, |p| p.cpt()).unwrap(), second);
    }

    fn two_pgts_and_bound_process() -> (TestPrcArena, PgtArena<FakeHal>, usize, usize, usize) {
        let kot = Kot::new();
        let cpts = CptArena::new();
        let pgts = PgtArena::<FakeHal>::new();
        let prcs = TestPrcArena::new();
        let boot_cpt = cpts.alloc(&kot, Cpt::new_boot(16).unwrap()).unwrap();
        cpt_crt(&cpts, &kot, boot_cpt, CapId::first_level(0), 4).unwrap();
        let (cpt_table_idx, _) =
            crate::captable::lookup_table_index(&cpts, boot_cpt, CapId::first_level(0)).unwrap();

        let first = pgt_crt(&pgts, &kot, 0x2000_0000, true, 12, 9).unwrap();
        let second = pgt_crt(&pgts, &kot, 0x2100_0000, true, 12, 9).unwrap();
        let prc_idx = cpts
            .with(boot_cpt, |cpt| {
                prc_crt(&prcs, &kot, &cpt.slots()[0], &cpt.slots()[0], cpt_table_idx, first).unwrap()
            })
            .unwrap();
        (prcs, pgts, prc_idx, first, second)
    }

    #[test]
    fn pgt_swap_updates_pointer_and_bumps_refcounts() {
        let (prcs, pgts, prc_idx, first, second) = two_pgts_and_bound_process();
        assert_eq!(pgts.with(first, Pgt::proc_ref).unwrap(), 0);

        prc_pgt(&prcs, &pgts, prc_idx, second).unwrap();

        assert_eq!(prcs.with(prc_idx, |p| p.pgt()).unwrap(), second);
        assert_eq!(pgts.with(first, Pgt::proc_ref).unwrap(), 0);
        assert_eq!(pgts.with(second, Pgt::proc_ref).unwrap(), 1);
    }

    #[test]
    fn pgt_swap_conflict_drops_only_the_new_refcount() {
        // `prc_pgt` reads the process's current pointer as `old` and CASes
        // against that same value within one call, so losing the CAS
        // single-threaded can't be driven through the public function --
        // there is no window between its read and its own CAS to land a
        // second writer in. Exercise the CAS failure branch directly
        // instead, with the exact bump/match/drop shape `prc_pgt` uses, to
        // pin down that a loser unwinds only its own bump and never
        // touches the winner's refcount.
        let (prcs, pgts, prc_idx, first, second) = two_pgts_and_bound_process();
        let kot = Kot::new();
        let third = pgt_crt(&pgts, &kot, 0x2200_0000, true, 12, 9).unwrap();

        pgts.with(third, |pgt| pgt.bump_proc_ref());
        let swapped = prcs
            .with(prc_idx, |p| cas_usize(&p.pgt_idx, second, third))
            .unwrap();
        let result = match swapped {
            Ok(()) => {
                pgts.with(first, |pgt| pgt.drop_proc_ref());
                Ok(())
            }
            Err(_) => {
                pgts.with(third, |pgt| pgt.drop_proc_ref());
                Err(PthError::Conflict)
            }
        };

        assert_eq!(result, Err(PthError::Conflict));
        assert_eq!(pgts.with(third, Pgt::proc_ref).unwrap(), 0);
        assert_eq!(prcs.with(prc_idx, |p| p.pgt()).unwrap(), first);
    }
}
