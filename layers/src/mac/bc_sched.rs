//! Broadcast Scheduler
//!
//! Owns the SIB-window state and retransmission counters, queries RRC for
//! paging opportunities and emits broadcast grants into the subframe slot.
//! SIB1 follows a fixed 80 ms cycle of four transmissions (even SFN,
//! subframe 5); the other SIBs are periodic, each with a disjoint offset,
//! and fire on subframe 9 to stay off the SIB1 subframe and the paging
//! occasions.

use super::sf_sched::SfSched;
use super::CarrierParams;
use crate::rrc::RrcSchedInterface;
use common::types::Tti;
use common::utils::ceil_div;
use std::sync::Arc;
use tracing::debug;

/// Aggregation index used for all broadcast DCIs
const BC_AGGR_IDX: u32 = 2;

/// SIB1 repetitions per 80 ms cycle
const SIB1_NOF_TX: u32 = 4;

/// Per-SIB window state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SibState {
    Idle,
    InWindow { start: Tti, n_tx: u32 },
}

/// Broadcast (SIB + paging) scheduler for one carrier
pub struct BcSched {
    params: Arc<CarrierParams>,
    rrc: Arc<dyn RrcSchedInterface>,
    pending_sibs: Vec<SibState>,
}

impl BcSched {
    pub fn new(params: Arc<CarrierParams>, rrc: Arc<dyn RrcSchedInterface>) -> Self {
        let pending_sibs = vec![SibState::Idle; params.cell.sibs.len()];
        Self {
            params,
            rrc,
            pending_sibs,
        }
    }

    /// Per-TTI broadcast scheduling: window update, SIB allocation, paging
    pub fn dl_sched(&mut self, slot: &mut SfSched) {
        self.update_si_windows(slot);
        self.alloc_sibs(slot);
        self.alloc_paging(slot);
    }

    /// Open windows whose periodic opportunity is hit and expire the ones
    /// that passed
    fn update_si_windows(&mut self, slot: &SfSched) {
        let tti_tx_dl = slot.tti_tx_dl();
        let sfn = tti_tx_dl.sfn();
        let sf_idx = tti_tx_dl.sf_idx();
        let cell = &self.params.cell;

        for (i, state) in self.pending_sibs.iter_mut().enumerate() {
            let sib = &cell.sibs[i];
            if sib.len == 0 {
                continue;
            }

            match state {
                SibState::Idle => {
                    let opens = if i == 0 {
                        // SIB1 window opens on every even SFN at subframe 5
                        sfn % 2 == 0 && sf_idx == 5
                    } else {
                        let x = (i as u32 - 1) * cell.si_window_ms;
                        sfn % sib.period_rf == x / 10 && sf_idx == x % 10
                    };
                    if opens {
                        *state = SibState::InWindow {
                            start: tti_tx_dl,
                            n_tx: 0,
                        };
                    }
                }
                SibState::InWindow { start, n_tx } => {
                    if i > 0 {
                        if tti_tx_dl.since(*start) > cell.si_window_ms {
                            // The SI window has passed; missing the
                            // remaining repetitions is acceptable
                            *state = SibState::Idle;
                        }
                    } else if *n_tx == SIB1_NOF_TX {
                        // SIB1 is always in window; start the next 80 ms cycle
                        *n_tx = 0;
                    }
                }
            }
        }
    }

    /// Allocate every SIB due in this TTI
    fn alloc_sibs(&mut self, slot: &mut SfSched) {
        let tti_tx_dl = slot.tti_tx_dl();
        let sfn = tti_tx_dl.sfn();
        let sf_idx = tti_tx_dl.sf_idx();
        let si_window_ms = self.params.cell.si_window_ms;

        for i in 0..self.pending_sibs.len() {
            if self.params.cell.sibs[i].len == 0 {
                continue;
            }
            let SibState::InWindow { start, n_tx } = self.pending_sibs[i] else {
                continue;
            };
            if n_tx >= SIB1_NOF_TX {
                continue;
            }

            let fire = if i == 0 {
                sfn % 2 == 0 && sf_idx == 5
            } else {
                let nof_tx = ceil_div(si_window_ms, 10).min(SIB1_NOF_TX);
                let n_sf = tti_tx_dl.since(start);
                n_sf >= (si_window_ms / nof_tx) * n_tx && sf_idx == 9
            };
            if !fire {
                continue;
            }

            if let Err(err) = slot.alloc_bc(BC_AGGR_IDX, i, n_tx) {
                debug!(
                    "Could not allocate SIB idx={} n_tx={} at tti_tx_dl={}: {}",
                    i, n_tx, tti_tx_dl, err
                );
            }
            if let SibState::InWindow { n_tx, .. } = &mut self.pending_sibs[i] {
                *n_tx += 1;
            }
        }
    }

    /// Query RRC and allocate the paging record if one is due
    fn alloc_paging(&mut self, slot: &mut SfSched) {
        let tti_tx_dl = slot.tti_tx_dl();
        if let Some(payload) = self.rrc.is_paging_opportunity(tti_tx_dl) {
            if payload > 0 {
                if let Err(err) = slot.alloc_paging(BC_AGGR_IDX, payload) {
                    debug!(
                        "Could not allocate paging of {} bytes at tti_tx_dl={}: {}",
                        payload, tti_tx_dl, err
                    );
                }
            }
        }
    }

    /// Clear all SIB windows
    pub fn reset(&mut self) {
        for state in &mut self.pending_sibs {
            *state = SibState::Idle;
        }
    }
}
