/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

//! Syscall dispatcher and wire ABI (spec §4.12, §6.1).
//!
//! Entered with the faulting/trapping thread's register set already saved.
//! Decodes the packed syscall word, resolves whatever capability the
//! syscall names, invokes the matching component function and stores the
//! result. Per spec §4.12 the hottest two syscalls (`Inv_Ret`, `Inv_Act`)
//! are handled before any generic capability-table walk; the remaining
//! syscalls are split into a switching group (may reschedule the calling
//! core before returning to user space) and a non-switching group,
//! mirroring the "two switches" shape the spec describes.
//!
//! A handler always writes its retval through [`thread::set_retval`] or
//! [`thread::with_regs`] addressed at the *calling* thread's own arena
//! index, never at "whatever is current when the handler returns" — since
//! that storage lives in the thread object itself rather than in the core,
//! the usual worry about writing a value after a context switch already
//! moved the current thread away does not apply here (see DESIGN.md).

use crate::atomics::Timestamp;
use crate::cap::{CapFlags, CapId, CapType};
use crate::captable::{self, Cpt, CptArena};
use crate::cpu::Core;
use crate::error::{CptError, KError, KResult};
use crate::hal::{Hal, MapFlags, RegisterSet};
use crate::invocation::{self, InvArena};
use crate::kot::Kot;
use crate::pgtbl::{self, PgtArena};
use crate::process::{self, PrcArena};
use crate::signal::{self, RcvMode, RcvOutcome, SigArena};
use crate::thread::{self, ThdArena, TimeXferPolicy};

/// Everything a single dispatch call needs: every component's storage plus
/// the calling core and the monotonic tick count quiescence checks are
/// measured against.
pub struct Dispatch<'a, H: Hal> {
    pub kot: &'a Kot,
    pub cpts: &'a CptArena,
    pub pgts: &'a PgtArena<H>,
    pub prcs: &'a PrcArena<H>,
    pub thds: &'a ThdArena<H>,
    pub sigs: &'a SigArena,
    pub invs: &'a InvArena<H>,
    pub core: &'a Core,
    pub now: Timestamp,
}

/// Stable syscall numbers (spec §6.1: "Syscall numbers must remain stable
/// across reboots"). Grouped by component in the same order as §6.1 lists
/// them; gaps are intentionally not left since nothing in the spec asks
/// for ABI compatibility with a prior numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Syscall {
    CptCrt = 0,
    CptDel = 1,
    CptFrz = 2,
    CptAdd = 3,
    CptRem = 4,
    PgtCrt = 5,
    PgtDel = 6,
    PgtAdd = 7,
    PgtRem = 8,
    PgtCon = 9,
    PgtDes = 10,
    PrcCrt = 11,
    PrcDel = 12,
    PrcCpt = 13,
    PrcPgt = 14,
    ThdCrt = 15,
    ThdDel = 16,
    ThdExecSet = 17,
    ThdSchedBind = 18,
    ThdSchedRcv = 19,
    ThdSchedPrio = 20,
    ThdSchedFree = 21,
    ThdTimeXfer = 22,
    ThdSwt = 23,
    SigCrt = 24,
    SigDel = 25,
    SigSnd = 26,
    SigRcv = 27,
    InvCrt = 28,
    InvDel = 29,
    InvSet = 30,
    InvAct = 31,
    InvRet = 32,
    KfnAct = 33,
}

impl Syscall {
    fn from_u8(n: u8) -> Option<Self> {
        use Syscall::*;
        const TABLE: [Syscall; 34] = [
            CptCrt, CptDel, CptFrz, CptAdd, CptRem, PgtCrt, PgtDel, PgtAdd, PgtRem, PgtCon, PgtDes, PrcCrt, PrcDel,
            PrcCpt, PrcPgt, ThdCrt, ThdDel, ThdExecSet, ThdSchedBind, ThdSchedRcv, ThdSchedPrio, ThdSchedFree,
            ThdTimeXfer, ThdSwt, SigCrt, SigDel, SigSnd, SigRcv, InvCrt, InvDel, InvSet, InvAct, InvRet, KfnAct,
        ];
        TABLE.get(n as usize).copied()
    }
}

/// Packed syscall word layout (spec §6.1): bits `0..6` are the syscall
/// number, the rest names the primary capability. `args()[1]` carries a
/// second packed [`CapId`] for syscalls needing two (delegation
/// destination, construction child, bind target...); `args()[2..5]` are
/// the three general-purpose parameters.
struct Decoded {
    svc: Syscall,
    primary: CapId,
    secondary: CapId,
    params: [usize; 3],
}

fn unpack_cap_id(word: usize) -> CapId {
    CapId::two_level((word & 0xFFFF) as u16, ((word >> 16) & 0xFFFF) as u16)
}

fn decode(args: [usize; 6]) -> KResult<Decoded> {
    let word0 = args[0];
    let svc_num = (word0 & 0x3F) as u8;
    let svc = Syscall::from_u8(svc_num).ok_or(CptError::Range)?;
    let primary = unpack_cap_id(word0 >> 6);
    Ok(Decoded {
        svc,
        primary,
        secondary: unpack_cap_id(args[1]),
        params: [args[2], args[3], args[4]],
    })
}

/// Resolve `id` against the calling thread's own capability table down to
/// the backing object's arena index, checking type and flags (spec §4.1
/// `GETCAP`, as every non-`Cpt`-family syscall must do before touching its
/// object).
fn resolve<H: Hal>(d: &Dispatch<H>, root_idx: usize, id: CapId, want_type: CapType, want_flags: CapFlags) -> KResult<usize> {
    let (table_idx, slot_idx) = captable::lookup_table_index(d.cpts, root_idx, id)?;
    d.cpts
        .with(table_idx, |cpt| {
            let resolved = crate::cap::get_cap(cpt.slots(), CapId::first_level(slot_idx as u16), want_type, want_flags)?;
            Ok::<usize, KError>(resolved.slot.object())
        })
        .ok_or(CptError::Null)?
}

/// Resolve the calling thread's own capability-table root index (spec §3:
/// "a thread's process names the capability table its syscalls resolve
/// against").
fn caller_root<H: Hal>(d: &Dispatch<H>, caller: usize) -> KResult<usize> {
    let process = d.thds.with(caller, thread::Thd::process).ok_or(crate::error::PthError::InvState)?;
    d.prcs.with(process, process::Prc::cpt).ok_or(crate::error::PthError::InvState.into())
}

/// Create-then-publish a new root capability into `dst`, generalizing the
/// pattern [`captable::cpt_crt`] inlines for its own type (spec §4.1: every
/// capability, regardless of backing component, goes through the same
/// `begin_create` -> publish/rollback protocol).
fn install<H: Hal>(
    d: &Dispatch<H>,
    root_idx: usize,
    dst: CapId,
    cap_type: CapType,
    flags: CapFlags,
    make: impl FnOnce() -> KResult<usize>,
) -> KResult<usize> {
    let (table_idx, slot_idx) = captable::lookup_table_index(d.cpts, root_idx, dst)?;
    d.cpts
        .with(table_idx, |cpt| {
            let slot = cpt.slots().get(slot_idx).ok_or(CptError::Range)?;
            slot.begin_create().map_err(|_| CptError::Exist.into())
        })
        .ok_or(CptError::Null)??;

    let obj_idx = match make() {
        Ok(i) => i,
        Err(e) => {
            d.cpts.with(table_idx, |cpt| cpt.slots()[slot_idx].rollback_create());
            return Err(e);
        }
    };

    d.cpts.with(table_idx, |cpt| {
        cpt.slots()[slot_idx].publish_root(cap_type, flags, obj_idx);
    });
    Ok(obj_idx)
}

/// Verify and freeze-consume a root capability slot, then hand its backing
/// object index to `destroy` before finalizing the slot's own deletion
/// (generalizes [`captable::cpt_del`]'s body across every component).
fn uninstall<H: Hal>(
    d: &Dispatch<H>,
    root_idx: usize,
    target: CapId,
    cap_type: CapType,
    destroy: impl FnOnce(usize) -> KResult<()>,
) -> KResult<()> {
    use crate::cap::SlotStatus;

    let (table_idx, slot_idx) = captable::lookup_table_index(d.cpts, root_idx, target)?;
    let obj_idx = d
        .cpts
        .with(table_idx, |cpt| {
            let slot = cpt.slots().get(slot_idx).ok_or(CptError::Range)?;
            let header = slot.load_header();
            if header.cap_type != cap_type {
                return Err(CptError::Null.into());
            }
            if header.status != SlotStatus::Frozen {
                return Err(CptError::Frozen.into());
            }
            if !slot.is_root() {
                return Err(CptError::Flag.into());
            }
            if slot.ref_count() != 0 {
                return Err(CptError::Refcnt.into());
            }
            Ok::<usize, KError>(slot.object())
        })
        .ok_or(CptError::Null)??;

    destroy(obj_idx)?;

    d.cpts
        .with(table_idx, |cpt| cpt.slots()[slot_idx].finalize_delete(d.now, crate::config::QUIE_TIME))
        .ok_or(CptError::Null)?
        .map_err(|_| CptError::Quie.into())
}

fn store_result(thds: &ThdArena<impl Hal>, caller: usize, result: KResult<isize>) {
    let v = match result {
        Ok(v) => v,
        Err(e) => e.code(),
    };
    thread::set_retval(thds, caller, v);
}

fn ok0() -> KResult<isize> {
    Ok(0)
}

/// Entry point: decode the caller's pending syscall and dispatch it. The
/// caller's retval register is always written by the time this returns
/// (the one exception, `Sig_Rcv` parking, deliberately leaves it untouched
/// — the eventual wakeup writes it).
pub fn dispatch<H: Hal>(d: &Dispatch<H>, caller: usize) {
    let args = match thread::with_regs(d.thds, caller, |regs| regs.args()) {
        Some(a) => a,
        None => return,
    };
    let decoded = match decode(args) {
        Ok(v) => v,
        Err(e) => {
            thread::set_retval(d.thds, caller, e.code());
            return;
        }
    };

    // Hot path: these two never resolve a capability at all, only the
    // caller's own invocation stack (spec §4.12).
    match decoded.svc {
        Syscall::InvRet => {
            let retval = decoded.params[0] as isize;
            let next = thread::with_regs_and_stack(d.thds, caller, |regs, stack| {
                invocation::inv_ret::<H>(d.invs, regs, stack, retval, false)
            });
            match next {
                Some(Ok(_)) => {}
                Some(Err(e)) => thread::set_retval(d.thds, caller, e.code()),
                None => {}
            }
            return;
        }
        Syscall::InvAct => {
            let root = match caller_root(d, caller) {
                Ok(r) => r,
                Err(e) => return thread::set_retval(d.thds, caller, e.code()),
            };
            let port_idx = match resolve(d, root, decoded.primary, CapType::Inv, CapFlags::EXECUTE) {
                Ok(i) => i,
                Err(e) => return thread::set_retval(d.thds, caller, e.code()),
            };
            let param = decoded.params[0];
            let result = thread::with_regs_and_stack(d.thds, caller, |regs, stack| {
                invocation::inv_act(d.invs, port_idx, caller, regs, stack, param)
            });
            if let Some(Err(e)) = result {
                thread::set_retval(d.thds, caller, e.code());
            }
            // Success leaves the syscall-retval write to the eventual
            // `Inv_Ret` (spec §4.9: "The return instruction sets the
            // syscall retval zero").
            return;
        }
        _ => {}
    }

    let root_idx = match caller_root(d, caller) {
        Ok(r) => r,
        Err(e) => return thread::set_retval(d.thds, caller, e.code()),
    };

    // Switching group: each handler owns its own retval write, since the
    // operation may reschedule the calling core before returning.
    match decoded.svc {
        Syscall::SigSnd => {
            let result = resolve(d, root_idx, decoded.primary, CapType::Sig, CapFlags::WRITE)
                .and_then(|idx| signal::sig_snd(d.sigs, d.thds, d.core, idx))
                .and_then(|()| ok0());
            return store_result(d.thds, caller, result);
        }
        Syscall::SigRcv => {
            let mode = match decoded.params[0] {
                0 => RcvMode::BlockSingle,
                1 => RcvMode::BlockMulti,
                2 => RcvMode::NonBlockSingle,
                _ => RcvMode::NonBlockMulti,
            };
            let result = resolve(d, root_idx, decoded.primary, CapType::Sig, CapFlags::READ)
                .and_then(|idx| signal::sig_rcv(d.sigs, d.thds, d.core, idx, mode));
            match result {
                Ok(RcvOutcome::Received(n)) => thread::set_retval(d.thds, caller, n as isize),
                Ok(RcvOutcome::Blocked) => {}
                Err(e) => thread::set_retval(d.thds, caller, e.code()),
            }
            return;
        }
        Syscall::KfnAct => {
            // `Kfn` capabilities carry their range packed into the slot's
            // object field rather than a backing arena object, so the
            // invocation goes through the slot directly (see kfn.rs).
            let result = (|| -> KResult<isize> {
                let (table_idx, slot_idx) = captable::lookup_table_index(d.cpts, root_idx, decoded.primary)?;
                d.cpts
                    .with(table_idx, |cpt| {
                        let slot = &cpt.slots()[slot_idx];
                        crate::kfn::kfn_act::<H>(slot, decoded.params[0], decoded.params[1], decoded.params[2], 0)
                    })
                    .ok_or(CptError::Null)?
            })();
            return store_result(d.thds, caller, result);
        }
        Syscall::ThdSchedPrio => {
            let updates = [(decoded.primary, decoded.params[0])];
            let mut resolved = [(0usize, 0usize); 3];
            let mut count = 0;
            let mut err = None;
            for (id, prio) in updates.iter() {
                match resolve(d, root_idx, *id, CapType::Thd, CapFlags::WRITE) {
                    Ok(idx) => {
                        resolved[count] = (idx, *prio);
                        count += 1;
                    }
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                }
            }
            let result = if let Some(e) = err {
                Err(e)
            } else {
                thread::thd_sched_prio(d.thds, d.core, &resolved[..count]).map(|old| old[0] as isize)
            };
            return store_result(d.thds, caller, result);
        }
        Syscall::ThdSchedFree => {
            let result = resolve(d, root_idx, decoded.primary, CapType::Thd, CapFlags::WRITE)
                .and_then(|idx| thread::thd_sched_free(d.thds, d.sigs, d.core, idx))
                .and_then(|()| ok0());
            return store_result(d.thds, caller, result);
        }
        Syscall::ThdTimeXfer => {
            let policy = match decoded.params[1] {
                0 => TimeXferPolicy::Normal(decoded.params[2]),
                1 => TimeXferPolicy::Infinite,
                _ => TimeXferPolicy::Revoke,
            };
            let result = (|| -> KResult<isize> {
                let dst = resolve(d, root_idx, decoded.primary, CapType::Thd, CapFlags::WRITE)?;
                let src = resolve(d, root_idx, decoded.secondary, CapType::Thd, CapFlags::WRITE)?;
                thread::thd_time_xfer(d.thds, d.sigs, d.core, dst, src, policy)?;
                Ok(0)
            })();
            return store_result(d.thds, caller, result);
        }
        Syscall::ThdSwt => {
            let target = if decoded.params[0] != 0 {
                match resolve(d, root_idx, decoded.primary, CapType::Thd, CapFlags::EXECUTE) {
                    Ok(i) => Some(i),
                    Err(e) => return store_result(d.thds, caller, Err(e)),
                }
            } else {
                None
            };
            let result = thread::thd_swt(d.thds, d.sigs, d.core, target, decoded.params[1] != 0).and_then(|()| ok0());
            return store_result(d.thds, caller, result);
        }
        _ => {}
    }

    // Non-switching group: a plain request/response, retval written here.
    let result: KResult<isize> = match decoded.svc {
        Syscall::CptCrt => captable::cpt_crt(d.cpts, d.kot, root_idx, decoded.primary, decoded.params[0]).map(|()| 0),
        Syscall::CptDel => captable::cpt_del(d.cpts, d.kot, root_idx, decoded.primary, d.now).map(|()| 0),
        Syscall::CptFrz => captable::cpt_frz(d.cpts, root_idx, decoded.primary, d.now).map(|()| 0),
        Syscall::CptAdd => {
            let flags = CapFlags::from_bits_truncate(decoded.params[0] as u32);
            captable::cpt_add(d.cpts, root_idx, decoded.primary, decoded.secondary, flags).map(|()| 0)
        }
        Syscall::CptRem => captable::cpt_rem(d.cpts, root_idx, decoded.primary).map(|()| 0),

        Syscall::PgtCrt => {
            let is_top = decoded.params[1] != 0;
            install(d, root_idx, decoded.primary, CapType::Pgt, CapFlags::all(), || {
                pgtbl::pgt_crt::<H>(d.pgts, d.kot, decoded.params[0], is_top, decoded.params[2] >> 8, decoded.params[2] & 0xFF)
            })
            .map(|i| i as isize)
        }
        Syscall::PgtDel => uninstall(d, root_idx, decoded.primary, CapType::Pgt, |idx| pgtbl::pgt_del::<H>(d.pgts, d.kot, idx)).map(|()| 0),
        Syscall::PgtAdd => {
            let flags = unpack_map_flags(decoded.params[2]);
            resolve(d, root_idx, decoded.primary, CapType::Pgt, CapFlags::WRITE)
                .and_then(|idx| pgtbl::pgt_add::<H>(d.pgts, idx, decoded.params[0], decoded.params[1], flags))
                .map(|()| 0)
        }
        Syscall::PgtRem => resolve(d, root_idx, decoded.primary, CapType::Pgt, CapFlags::WRITE)
            .and_then(|idx| pgtbl::pgt_rem::<H>(d.pgts, idx, decoded.params[0]))
            .map(|()| 0),
        Syscall::PgtCon => {
            let equal_va = decoded.params[1] != 0;
            (|| -> KResult<isize> {
                let parent = resolve(d, root_idx, decoded.primary, CapType::Pgt, CapFlags::WRITE)?;
                let child = resolve(d, root_idx, decoded.secondary, CapType::Pgt, CapFlags::WRITE)?;
                pgtbl::pgt_con::<H>(d.pgts, parent, decoded.params[0], child, equal_va)?;
                Ok(0)
            })()
        }
        Syscall::PgtDes => (|| -> KResult<isize> {
            let parent = resolve(d, root_idx, decoded.primary, CapType::Pgt, CapFlags::WRITE)?;
            let child = resolve(d, root_idx, decoded.secondary, CapType::Pgt, CapFlags::WRITE)?;
            pgtbl::pgt_des::<H>(d.pgts, parent, decoded.params[0], child)?;
            Ok(0)
        })(),

        Syscall::PrcCrt => (|| -> KResult<isize> {
            let cpt_idx = resolve(d, root_idx, decoded.primary, CapType::Cpt, CapFlags::GRANT)?;
            let pgt_idx = resolve(d, root_idx, decoded.secondary, CapType::Pgt, CapFlags::GRANT)?;
            let (cpt_table, cpt_slot) = captable::lookup_table_index(d.cpts, root_idx, decoded.primary)?;
            let (pgt_table, pgt_slot) = captable::lookup_table_index(d.cpts, root_idx, decoded.secondary)?;
            let idx = d
                .cpts
                .with(cpt_table, |cpt_cpt| {
                    d.cpts
                        .with(pgt_table, |pgt_cpt| {
                            process::prc_crt::<H>(d.prcs, d.kot, &cpt_cpt.slots()[cpt_slot], &pgt_cpt.slots()[pgt_slot], cpt_idx, pgt_idx)
                        })
                        .ok_or(CptError::Null)
                })
                .ok_or(CptError::Null)???;
            Ok(idx as isize)
        })(),
        Syscall::PrcDel => (|| -> KResult<isize> {
            let (cpt_table, cpt_slot) = captable::lookup_table_index(d.cpts, root_idx, decoded.primary)?;
            let (pgt_table, pgt_slot) = captable::lookup_table_index(d.cpts, root_idx, decoded.secondary)?;
            let prc_idx = decoded.params[0];
            d.cpts
                .with(cpt_table, |cpt_cpt| {
                    d.cpts
                        .with(pgt_table, |pgt_cpt| {
                            process::prc_del::<H>(d.prcs, d.kot, &cpt_cpt.slots()[cpt_slot], &pgt_cpt.slots()[pgt_slot], prc_idx)
                        })
                        .ok_or(CptError::Null)
                })
                .ok_or(CptError::Null)???;
            Ok(0)
        })(),
        Syscall::PrcCpt => (|| -> KResult<isize> {
            let prc_idx = resolve(d, root_idx, decoded.primary, CapType::Prc, CapFlags::WRITE)?;
            let new_cpt = resolve(d, root_idx, decoded.secondary, CapType::Cpt, CapFlags::GRANT)?;
            process::prc_cpt::<H>(d.prcs, d.cpts, prc_idx, new_cpt)?;
            Ok(0)
        })(),
        Syscall::PrcPgt => (|| -> KResult<isize> {
            let prc_idx = resolve(d, root_idx, decoded.primary, CapType::Prc, CapFlags::WRITE)?;
            let new_pgt = resolve(d, root_idx, decoded.secondary, CapType::Pgt, CapFlags::GRANT)?;
            process::prc_pgt::<H>(d.prcs, d.pgts, prc_idx, new_pgt)?;
            Ok(0)
        })(),

        Syscall::ThdCrt => {
            let process = decoded.params[0];
            let creator_max = thread::with_regs(d.thds, caller, |_| ())
                .and(d.thds.with(caller, thread::Thd::max_prio))
                .unwrap_or(0);
            install(d, root_idx, decoded.primary, CapType::Thd, CapFlags::all(), || {
                thread::thd_crt::<H>(d.thds, d.kot, process, creator_max, decoded.params[1], decoded.params[2] != 0, false)
            })
            .map(|i| i as isize)
        }
        Syscall::ThdDel => uninstall(d, root_idx, decoded.primary, CapType::Thd, |idx| thread::thd_del::<H>(d.thds, d.invs, d.kot, idx)).map(|()| 0),
        Syscall::ThdExecSet => resolve(d, root_idx, decoded.primary, CapType::Thd, CapFlags::WRITE)
            .and_then(|idx| thread::thd_exec_set::<H>(d.thds, idx, decoded.params[0], decoded.params[1], decoded.params[2]))
            .map(|()| 0),
        Syscall::ThdSchedBind => (|| -> KResult<isize> {
            let thread_idx = resolve(d, root_idx, decoded.primary, CapType::Thd, CapFlags::WRITE)?;
            let sig_idx = if decoded.params[2] != 0 {
                Some(resolve(d, root_idx, decoded.secondary, CapType::Sig, CapFlags::WRITE)?)
            } else {
                None
            };
            thread::thd_sched_bind::<H>(d.thds, d.sigs, d.core, thread_idx, caller, sig_idx, decoded.params[0], decoded.params[1], crate::config::NIL)?;
            Ok(0)
        })(),
        Syscall::ThdSchedRcv => thread::thd_sched_rcv::<H>(d.thds, d.core, caller).map(|ev| if ev.fault { -(ev.tid as isize) } else { ev.tid as isize }),

        Syscall::SigCrt => install(d, root_idx, decoded.primary, CapType::Sig, CapFlags::all(), || signal::sig_crt(d.sigs, d.kot)).map(|i| i as isize),
        Syscall::SigDel => uninstall(d, root_idx, decoded.primary, CapType::Sig, |idx| signal::sig_del(d.sigs, d.kot, idx)).map(|()| 0),

        Syscall::InvCrt => {
            let process = decoded.params[2];
            install(d, root_idx, decoded.primary, CapType::Inv, CapFlags::all(), || {
                invocation::inv_crt::<H>(d.invs, d.kot, process, decoded.params[0], decoded.params[1], false)
            })
            .map(|i| i as isize)
        }
        Syscall::InvDel => uninstall(d, root_idx, decoded.primary, CapType::Inv, |idx| invocation::inv_del::<H>(d.invs, d.kot, idx)).map(|()| 0),
        Syscall::InvSet => {
            let is_exc_ret = decoded.params[2] != 0;
            resolve(d, root_idx, decoded.primary, CapType::Inv, CapFlags::WRITE)
                .and_then(|idx| invocation::inv_set::<H>(d.invs, idx, decoded.params[0], decoded.params[1], is_exc_ret))
                .map(|()| 0)
        }

        // Handled above; unreachable here.
        Syscall::InvAct | Syscall::InvRet | Syscall::SigSnd | Syscall::SigRcv | Syscall::KfnAct | Syscall::ThdSchedPrio
        | Syscall::ThdSchedFree | Syscall::ThdTimeXfer | Syscall::ThdSwt => Ok(0),
    };

    store_result(d.thds, caller, result);
}

fn unpack_map_flags(word: usize) -> MapFlags {
    MapFlags {
        readable: word & 0b0001 != 0,
        writable: word & 0b0010 != 0,
        executable: word & 0b0100 != 0,
        user: word & 0b1000 != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeHal;
    use crate::pgtbl::pgt_crt;
    use crate::process::prc_crt;
    use crate::thread::thd_crt;

    /// One process with a single thread bound to it, set up the way the
    /// capability/process/thread unit tests do (a plain `Cpt` standing in
    /// for its own root, one `Slot` doing double duty as both the cpt's and
    /// pgt's root reference) rather than a full boot sequence — dispatch
    /// only cares that `caller`'s process resolves to a live `Cpt`.
    struct Fixture {
        kot: Kot,
        cpts: CptArena,
        pgts: PgtArena<FakeHal>,
        prcs: PrcArena<FakeHal>,
        thds: ThdArena<FakeHal>,
        sigs: SigArena,
        invs: InvArena<FakeHal>,
        core: Core,
        root_idx: usize,
        caller: usize,
    }

    impl Fixture {
        fn new() -> Self {
            let kot = Kot::new();
            let cpts = CptArena::new();
            let pgts = PgtArena::<FakeHal>::new();
            let prcs = PrcArena::<FakeHal>::new();
            let thds = ThdArena::<FakeHal>::new();
            let sigs = SigArena::new();
            let invs = InvArena::<FakeHal>::new();
            let core = Core::new(0);

            let own_cpt = cpts.alloc(&kot, Cpt::new_boot(8).unwrap()).unwrap();
            let pgt_idx = pgt_crt::<FakeHal>(&pgts, &kot, 0x2000_0000, true, 12, 9).unwrap();
            let prc_idx = cpts
                .with(own_cpt, |cpt| prc_crt::<FakeHal>(&prcs, &kot, &cpt.slots()[0], &cpt.slots()[0], own_cpt, pgt_idx).unwrap())
                .unwrap();
            let caller = thd_crt(&thds, &kot, prc_idx, 10, 10, false, false).unwrap();

            Fixture {
                kot,
                cpts,
                pgts,
                prcs,
                thds,
                sigs,
                invs,
                core,
                root_idx: own_cpt,
                caller,
            }
        }

        fn d(&self, now: Timestamp) -> Dispatch<FakeHal> {
            Dispatch {
                kot: &self.kot,
                cpts: &self.cpts,
                pgts: &self.pgts,
                prcs: &self.prcs,
                thds: &self.thds,
                sigs: &self.sigs,
                invs: &self.invs,
                core: &self.core,
                now,
            }
        }

        fn set_args(&self, args: [usize; 6]) {
            thread::with_regs(&self.thds, self.caller, |r| r.args = args).unwrap();
        }

        fn retval(&self) -> isize {
            thread::with_regs(&self.thds, self.caller, |r| r.retval).unwrap()
        }
    }

    fn word(slot: u16, svc: Syscall) -> usize {
        ((slot as usize) << 6) | (svc as u8 as usize)
    }

    #[test]
    fn cpt_crt_installs_a_root_capability_in_the_callers_own_table() {
        let f = Fixture::new();
        f.set_args([word(1, Syscall::CptCrt), 0, 4, 0, 0, 0]);

        dispatch(&f.d(Timestamp(0)), f.caller);

        assert_eq!(f.retval(), 0);
        let (table_idx, _) = captable::lookup_table_index(&f.cpts, f.root_idx, CapId::first_level(1)).unwrap();
        assert!(f.cpts.is_live(table_idx));
    }

    #[test]
    fn cpt_crt_then_frz_then_del_round_trips_through_dispatch() {
        let f = Fixture::new();
        f.set_args([word(1, Syscall::CptCrt), 0, 4, 0, 0, 0]);
        dispatch(&f.d(Timestamp(0)), f.caller);
        assert_eq!(f.retval(), 0);

        f.set_args([word(1, Syscall::CptFrz), 0, 0, 0, 0, 0]);
        dispatch(&f.d(Timestamp(0)), f.caller);
        assert_eq!(f.retval(), 0);

        f.set_args([word(1, Syscall::CptDel), 0, 0, 0, 0, 0]);
        dispatch(&f.d(Timestamp(crate::config::QUIE_TIME)), f.caller);
        assert_eq!(f.retval(), 0);

        let status = f.cpts.with(f.root_idx, |cpt| cpt.slots()[1].load_header().status).unwrap();
        assert_eq!(status, crate::cap::SlotStatus::Empty);
    }

    #[test]
    fn cpt_del_before_quiescence_elapsed_is_refused() {
        let f = Fixture::new();
        f.set_args([word(1, Syscall::CptCrt), 0, 4, 0, 0, 0]);
        dispatch(&f.d(Timestamp(0)), f.caller);
        f.set_args([word(1, Syscall::CptFrz), 0, 0, 0, 0, 0]);
        dispatch(&f.d(Timestamp(0)), f.caller);

        f.set_args([word(1, Syscall::CptDel), 0, 0, 0, 0, 0]);
        dispatch(&f.d(Timestamp(1)), f.caller);

        assert_eq!(f.retval(), KError::from(CptError::Quie).code());
    }

    #[test]
    fn sig_snd_then_rcv_round_trips_through_dispatch() {
        let f = Fixture::new();
        f.set_args([word(2, Syscall::SigCrt), 0, 0, 0, 0, 0]);
        dispatch(&f.d(Timestamp(0)), f.caller);
        assert_eq!(f.retval(), 0);

        f.set_args([word(2, Syscall::SigSnd), 0, 0, 0, 0, 0]);
        dispatch(&f.d(Timestamp(0)), f.caller);
        assert_eq!(f.retval(), 0);

        f.core.local.set_current(Some(f.caller));
        f.set_args([word(2, Syscall::SigRcv), 0, 2, 0, 0, 0]); // NonBlockSingle
        dispatch(&f.d(Timestamp(0)), f.caller);
        assert_eq!(f.retval(), 1);
    }

    #[test]
    fn sig_rcv_on_empty_endpoint_non_blocking_reports_empty() {
        let f = Fixture::new();
        f.set_args([word(2, Syscall::SigCrt), 0, 0, 0, 0, 0]);
        dispatch(&f.d(Timestamp(0)), f.caller);

        f.core.local.set_current(Some(f.caller));
        f.set_args([word(2, Syscall::SigRcv), 0, 2, 0, 0, 0]); // NonBlockSingle
        dispatch(&f.d(Timestamp(0)), f.caller);

        assert_eq!(f.retval(), KError::from(crate::error::SivError::Empty).code());
    }

    #[test]
    fn unknown_syscall_number_reports_range_error() {
        let f = Fixture::new();
        f.set_args([0x3F, 0, 0, 0, 0, 0]); // svc bits all set, 63 is out of Syscall's range
        dispatch(&f.d(Timestamp(0)), f.caller);
        assert_eq!(f.retval(), KError::from(CptError::Range).code());
    }

    #[test]
    fn decode_splits_packed_syscall_word_into_number_and_capability() {
        let decoded = decode([word(5, Syscall::SigSnd), 0, 9, 0, 0, 0]).unwrap();
        assert_eq!(decoded.svc, Syscall::SigSnd);
        assert_eq!(decoded.primary, CapId::first_level(5));
        assert_eq!(decoded.params[0], 9);
    }
}
