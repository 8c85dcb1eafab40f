//! Data-Plane Scheduling Metrics
//!
//! Capability objects that fill the resource grid left over after
//! broadcast and random access. A metric must respect the masks already
//! present in the slot; beyond that the policy is interchangeable without
//! touching the carrier scheduler.

use super::sf_sched::{DL_DATA_BYTES_PER_PRB, UL_BYTES_PER_PRB};
use super::ue::UeDb;
use super::{AllocFailure, CarrierParams, SfSched, UlAllocKind};
use common::types::Rnti;
use common::utils::ceil_div;
use std::sync::Arc;
use tracing::trace;

/// MCS used for uplink new transmissions until link adaptation kicks in
const DEFAULT_UL_MCS: u32 = 6;

/// Downlink data metric
pub trait DlMetric: Send {
    fn set_params(&mut self, params: &Arc<CarrierParams>, cc_idx: u32);

    /// Fill the remaining downlink RBGs with user data grants
    fn sched_users(&mut self, ue_db: &mut UeDb, slot: &mut SfSched);
}

/// Uplink data metric
pub trait UlMetric: Send {
    fn set_params(&mut self, params: &Arc<CarrierParams>, cc_idx: u32);

    /// Fill the remaining uplink PRBs with PUSCH grants
    fn sched_users(&mut self, ue_db: &mut UeDb, slot: &mut SfSched);
}

/// Round-robin downlink filler
#[derive(Default)]
pub struct DlMetricRr {
    params: Option<Arc<CarrierParams>>,
    cc_idx: u32,
}

impl DlMetric for DlMetricRr {
    fn set_params(&mut self, params: &Arc<CarrierParams>, cc_idx: u32) {
        self.params = Some(params.clone());
        self.cc_idx = cc_idx;
    }

    fn sched_users(&mut self, ue_db: &mut UeDb, slot: &mut SfSched) {
        let Some(params) = self.params.clone() else {
            return;
        };
        if ue_db.is_empty() {
            return;
        }
        let rntis: Vec<Rnti> = ue_db.keys().copied().collect();
        let start = slot.tti_tx_dl().value() as usize % rntis.len();

        for k in 0..rntis.len() {
            let rnti = rntis[(start + k) % rntis.len()];
            let Some(ue) = ue_db.get_mut(&rnti) else {
                continue;
            };
            if ue.get_cell_index(self.cc_idx).is_none() || ue.dl_buffer() == 0 {
                continue;
            }

            let wanted_prbs = ceil_div(ue.dl_buffer(), DL_DATA_BYTES_PER_PRB).max(1);
            let mut rbg_len = ceil_div(wanted_prbs, params.cell.rbg_size()) as usize;
            let alloc = loop {
                if rbg_len == 0 {
                    break None;
                }
                if let Some(rbg_start) = slot.dl_mask().find_clear_run(rbg_len) {
                    break Some((rbg_start, rbg_len));
                }
                rbg_len -= 1;
            };
            let Some((rbg_start, rbg_len)) = alloc else {
                // Downlink grid is full
                return;
            };

            match slot.alloc_dl_data(rnti, rbg_start, rbg_len) {
                Ok(tbs) => {
                    trace!("DL grant rnti=0x{:x} rbgs=[{},{})", rnti, rbg_start, rbg_start + rbg_len);
                    ue.consume_dl_buffer(tbs);
                }
                Err(AllocFailure::DciCollision) => return,
                Err(_) => return,
            }
        }
    }
}

/// Round-robin uplink filler. Serves pending retransmissions before new
/// transmissions.
#[derive(Default)]
pub struct UlMetricRr {
    params: Option<Arc<CarrierParams>>,
    cc_idx: u32,
}

impl UlMetric for UlMetricRr {
    fn set_params(&mut self, params: &Arc<CarrierParams>, cc_idx: u32) {
        self.params = Some(params.clone());
        self.cc_idx = cc_idx;
    }

    fn sched_users(&mut self, ue_db: &mut UeDb, slot: &mut SfSched) {
        if self.params.is_none() || ue_db.is_empty() {
            return;
        }
        let rntis: Vec<Rnti> = ue_db.keys().copied().collect();
        let start = slot.tti_tx_ul().value() as usize % rntis.len();
        let tti_tx_ul = slot.tti_tx_ul();

        for k in 0..rntis.len() {
            let rnti = rntis[(start + k) % rntis.len()];
            let Some(ue) = ue_db.get_mut(&rnti) else {
                continue;
            };
            if ue.get_cell_index(self.cc_idx).is_none() {
                continue;
            }

            let (has_retx, retx_prbs, retx_mcs) = {
                let harq = ue.get_ul_harq(tti_tx_ul, 0);
                (harq.has_pending_retx(), harq.nof_prb(), harq.mcs())
            };
            if has_retx && retx_prbs > 0 {
                if let Some(prb_start) = slot.ul_mask().find_clear_run(retx_prbs as usize) {
                    let _ = slot.alloc_ul(
                        ue,
                        (prb_start as u32, retx_prbs),
                        UlAllocKind::Retx,
                        retx_mcs,
                    );
                }
                continue;
            }

            if ue.ul_buffer() == 0 {
                continue;
            }
            let mut nof_prb = ceil_div(ue.ul_buffer(), UL_BYTES_PER_PRB).max(1);
            let alloc = loop {
                if nof_prb == 0 {
                    break None;
                }
                if let Some(prb_start) = slot.ul_mask().find_clear_run(nof_prb as usize) {
                    break Some((prb_start as u32, nof_prb));
                }
                nof_prb -= 1;
            };
            let Some((prb_start, nof_prb)) = alloc else {
                // Uplink grid is full
                return;
            };

            match slot.alloc_ul(ue, (prb_start, nof_prb), UlAllocKind::NewTx, DEFAULT_UL_MCS) {
                Ok(()) => ue.consume_ul_buffer(nof_prb * UL_BYTES_PER_PRB),
                Err(AllocFailure::DciCollision) => return,
                Err(_) => return,
            }
        }
    }
}
