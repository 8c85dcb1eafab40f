//! Random-Access Scheduler
//!
//! Translates PRACH detections into RAR downlink grants within the
//! configured window and schedules the matching Msg3 uplink grants
//! MSG3_DELAY_MS later. Pending RARs form a FIFO keyed by RA-RNTI, so the
//! head always carries the oldest PRACH TTI.

use super::sf_sched::{PendingMsg3, SfSched};
use super::ue::UeDb;
use super::{CarrierParams, DlSchedResult, RarInfo, SchedError, MAX_RAR_PER_RNTI};
use crate::phy::ra::type2_from_riv;
use common::types::{Rnti, Tti};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Aggregation index used for RAR DCIs
const RAR_AGGR_IDX: u32 = 2;

/// Subframes between a PRACH occasion and the start of its RAR window
const RAR_WINDOW_START_DELAY: u32 = 3;

/// Pending random-access response: all preambles detected on one
/// (PRACH TTI, RA-RNTI) occasion
#[derive(Debug, Clone)]
pub struct PendingRar {
    pub ra_rnti: Rnti,
    pub prach_tti: Tti,
    /// One entry per detected preamble, capped at MAX_RAR_PER_RNTI
    pub grants: Vec<RarInfo>,
}

/// Random-access scheduler for one carrier
pub struct RaSched {
    params: Arc<CarrierParams>,
    pending_rars: VecDeque<PendingRar>,
}

impl RaSched {
    pub fn new(params: Arc<CarrierParams>) -> Self {
        Self {
            params,
            pending_rars: VecDeque::new(),
        }
    }

    /// Record a PRACH detection. Preambles sharing one (PRACH TTI,
    /// RA-RNTI) occasion coalesce into a single pending RAR.
    pub fn dl_rach_info(&mut self, rar_info: RarInfo) -> Result<(), SchedError> {
        info!(
            "New PRACH tti={}, preamble={}, temp_crnti=0x{:x}, ta_cmd={}, msg3_size={}",
            rar_info.prach_tti,
            rar_info.preamble_idx,
            rar_info.temp_crnti,
            rar_info.ta_cmd,
            rar_info.msg3_size
        );
        // RA-RNTI = 1 + t_id (+ 10 * f_id, with f_id = 0 for FDD)
        let ra_rnti = Rnti::new(1 + (rar_info.prach_tti.value() % 10) as u16);

        if let Some(rar) = self
            .pending_rars
            .iter_mut()
            .find(|rar| rar.prach_tti == rar_info.prach_tti && rar.ra_rnti == ra_rnti)
        {
            if rar.grants.len() >= MAX_RAR_PER_RNTI {
                return Err(SchedError::RachBufferFull(ra_rnti));
            }
            rar.grants.push(rar_info);
            return Ok(());
        }

        self.pending_rars.push_back(PendingRar {
            ra_rnti,
            prach_tti: rar_info.prach_tti,
            grants: vec![rar_info],
        });
        Ok(())
    }

    /// Schedule pending RARs into the slot, oldest first. Entries whose
    /// window passed are dropped; entries whose window has not opened stop
    /// the scan (later entries cannot be earlier).
    pub fn dl_sched(&mut self, slot: &mut SfSched) {
        let tti_tx_dl = slot.tti_tx_dl();
        let window = self.params.cell.prach_rar_window;

        let mut idx = 0;
        while idx < self.pending_rars.len() {
            let rar = &mut self.pending_rars[idx];
            let since_prach = tti_tx_dl.since(rar.prach_tti);

            if since_prach < RAR_WINDOW_START_DELAY {
                // Window not yet open; the FIFO is ordered by PRACH TTI
                return;
            }
            if since_prach >= RAR_WINDOW_START_DELAY + window {
                error!(
                    "Could not transmit RAR within the window (RA TTI={}, Window={}, Now={})",
                    rar.prach_tti, window, tti_tx_dl
                );
                self.pending_rars.remove(idx);
                continue;
            }

            match slot.alloc_rar(RAR_AGGR_IDX, rar) {
                Ok(granted) if granted as usize == rar.grants.len() => {
                    self.pending_rars.remove(idx);
                }
                Ok(granted) => {
                    // Keep the grants that were not scheduled for the next TTI
                    rar.grants.drain(..granted as usize);
                    return;
                }
                Err(super::AllocFailure::RbCollision) => {
                    // No room for RAR or Msg3 left in this TTI
                    return;
                }
                Err(err) => {
                    // The obstacle is specific to this RAR's DCI shape; a
                    // different RA-RNTI may still fit this TTI
                    debug!(
                        "Could not allocate RAR for ra_rnti=0x{:x} at tti_tx_dl={}: {}",
                        rar.ra_rnti, tti_tx_dl, err
                    );
                    idx += 1;
                }
            }
        }
    }

    /// Drain the slot's pending Msg3 queue into uplink allocations.
    /// Msg3 is one-shot: any failure drops the entry and recovery is left
    /// to the preamble retransmission at the UE.
    pub fn ul_sched(&mut self, slot: &mut SfSched, ue_db: &mut UeDb) {
        while let Some(msg3) = slot.pop_pending_msg3() {
            let Some(ue) = ue_db.get_mut(&msg3.rnti) else {
                warn!(
                    "Msg3 allocated for user rnti=0x{:x} that no longer exists",
                    msg3.rnti
                );
                continue;
            };
            if let Err(err) = slot.alloc_ul(
                ue,
                (msg3.n_prb, msg3.l),
                super::UlAllocKind::Msg3,
                msg3.mcs,
            ) {
                warn!(
                    "Could not allocate Msg3 for rnti=0x{:x} within ({},{}): {}",
                    msg3.rnti,
                    msg3.n_prb,
                    msg3.n_prb + msg3.l,
                    err
                );
            }
        }
    }

    /// Pre-allocate the Msg3 of every RAR grant just emitted into the
    /// subframe slot whose uplink TTI is MSG3_DELAY_MS later
    pub fn sched_msg3(&self, sf_msg3_sched: &mut SfSched, dl_sched_result: &DlSchedResult) {
        let nof_prb_ul = self.params.cell.nof_prb_ul;
        for rar in &dl_sched_result.rar {
            for grant in &rar.msg3_grants {
                let (l, n_prb) = type2_from_riv(grant.rba, nof_prb_ul);
                let msg3 = PendingMsg3 {
                    rnti: grant.data.temp_crnti,
                    n_prb,
                    l,
                    mcs: grant.trunc_mcs,
                };
                if sf_msg3_sched.alloc_msg3(msg3).is_err() {
                    error!(
                        "Failed to allocate Msg3 for rnti=0x{:x} at tti={}",
                        msg3.rnti,
                        sf_msg3_sched.tti_tx_ul()
                    );
                } else {
                    debug!(
                        "Queueing Msg3 for rnti=0x{:x} at tti={}",
                        msg3.rnti,
                        sf_msg3_sched.tti_tx_ul()
                    );
                }
            }
        }
    }

    /// Drop every pending RAR
    pub fn reset(&mut self) {
        self.pending_rars.clear();
    }

    /// Number of RA occasions awaiting a RAR
    pub fn nof_pending_rars(&self) -> usize {
        self.pending_rars.len()
    }
}
