//! Per-TTI Subframe Slot
//!
//! Working buffer for one TTI: the downlink RBG mask, the uplink PRB
//! mask, the PDCCH candidate set and the accumulated grant list. The
//! sub-schedulers fill it through typed allocation primitives; once the
//! TTI is composed, `generate_dcis` freezes it into the result
//! descriptors the PHY consumes.

use super::ra_sched::PendingRar;
use super::ue::SchedUe;
use super::{
    BcGrant, BcType, CarrierParams, DciLocation, DlDataGrant, DlSchedResult, PhichElem,
    PhichValue, RarGrant, RarMsg3Grant, TtiParams, TtiResult, UlAllocKind, UlGrant,
    UlSchedResult,
};
use crate::phy::ra::type2_to_riv;
use bytes::{BufMut, Bytes, BytesMut};
use common::mask::RbMask;
use common::types::{Rnti, Tti};
use common::utils::ceil_div;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Conservative payload capacity per PRB for broadcast-class transports
/// (SIB, paging, RAR): QPSK at a low coderate
pub(crate) const BC_BYTES_PER_PRB: u32 = 3;

/// Payload capacity per PRB for downlink data grants
pub(crate) const DL_DATA_BYTES_PER_PRB: u32 = 8;

/// Payload capacity per PRB for uplink grants at the low MCS range
pub(crate) const UL_BYTES_PER_PRB: u32 = 4;

/// MCS signalled in RAR grants for Msg3
pub(crate) const MSG3_MCS: u32 = 0;

/// Size of one RAR in the MAC PDU: E/T/RAPID subheader plus the 48-bit
/// payload (TS 36.321 sections 6.1.5 and 6.2.3)
const RAR_GRANT_BYTES: u32 = 7;

/// Upper bound on Msg3s pre-allocated into one uplink TTI
const MAX_PENDING_MSG3: usize = 16;

/// Typed allocation failure of the subframe-slot primitives
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFailure {
    /// No PDCCH candidate combination covers the request
    #[error("PDCCH candidates exhausted")]
    DciCollision,

    /// The requested resource blocks collide with an earlier allocation
    #[error("resource block collision")]
    RbCollision,

    /// The payload cannot be carried even by the whole bandwidth
    #[error("payload exceeds the maximum coderate")]
    InvalidCoderate,

    /// The slot is not open for allocations, or an internal queue is full
    #[error("allocation error")]
    Error,
}

/// Result of the allocation primitives
pub type AllocResult = Result<(), AllocFailure>;

/// Msg3 pre-allocation, derived 1:1 from a transmitted RAR grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMsg3 {
    pub rnti: Rnti,
    pub n_prb: u32,
    pub l: u32,
    pub mcs: u32,
}

/// Search space a DCI is monitored in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchSpace {
    /// Common search space: SI-RNTI, P-RNTI, RA-RNTI
    Common,
    /// UE-specific search space, hashed from the C-RNTI
    Ue(Rnti),
}

#[derive(Debug, Clone, Copy)]
struct PdcchRequest {
    ss: SearchSpace,
    aggr_idx: u32,
}

/// PDCCH candidate allocator for one TTI.
///
/// Keeps every accepted request and re-solves the complete candidate
/// assignment (escalating the CFI up to 3) whenever a new request does
/// not fit the current one. A request is only accepted if an assignment
/// covering all accepted requests exists, so finalisation never drops a
/// grant that was reported as placed.
struct PdcchSched {
    nof_prb: u32,
    sf_idx: u32,
    cfi: u32,
    requests: Vec<PdcchRequest>,
    positions: Vec<u32>,
}

impl PdcchSched {
    fn new(nof_prb: u32) -> Self {
        Self {
            nof_prb,
            sf_idx: 0,
            cfi: 1,
            requests: Vec::new(),
            positions: Vec::new(),
        }
    }

    fn new_tti(&mut self, sf_idx: u32, start_cfi: u32) {
        self.sf_idx = sf_idx;
        self.cfi = start_cfi.clamp(1, 3);
        self.requests.clear();
        self.positions.clear();
    }

    fn cfi(&self) -> u32 {
        self.cfi
    }

    /// Control-region capacity in CCEs: REGs of the first `cfi` symbols
    /// minus PCFICH and PHICH overhead, 9 REGs per CCE
    fn nof_cces(&self, cfi: u32) -> u32 {
        let regs = self.nof_prb * (2 + 3 * (cfi - 1));
        let phich_groups = ceil_div(self.nof_prb, 48);
        let overhead = 4 + 3 * phich_groups;
        regs.saturating_sub(overhead) / 9
    }

    /// Candidate start CCEs for a request (TS 36.213 section 9.1.1)
    fn candidates(&self, ss: SearchSpace, aggr_idx: u32, nof_cce: u32) -> Vec<u32> {
        let l = 1u32 << aggr_idx;
        match ss {
            SearchSpace::Common => {
                let region = nof_cce.min(16);
                (0..region)
                    .step_by(l as usize)
                    .filter(|start| start + l <= region)
                    .collect()
            }
            SearchSpace::Ue(rnti) => {
                let slots = nof_cce / l;
                if slots == 0 {
                    return Vec::new();
                }
                let nof_candidates: u32 = match l {
                    1 | 2 => 6,
                    _ => 2,
                };
                let mut y: u64 = u64::from(rnti.value());
                for _ in 0..=self.sf_idx {
                    y = (39827 * y) % 65537;
                }
                let mut out = Vec::new();
                for m in 0..nof_candidates.min(slots) {
                    let pos = ((y as u32 + m) % slots) * l;
                    if !out.contains(&pos) {
                        out.push(pos);
                    }
                }
                out
            }
        }
    }

    fn try_alloc(&mut self, ss: SearchSpace, aggr_idx: u32) -> Result<usize, AllocFailure> {
        self.requests.push(PdcchRequest { ss, aggr_idx });
        for cfi in self.cfi..=3 {
            if let Some(positions) = self.assign(cfi) {
                self.cfi = cfi;
                self.positions = positions;
                return Ok(self.requests.len() - 1);
            }
        }
        self.requests.pop();
        Err(AllocFailure::DciCollision)
    }

    fn assign(&self, cfi: u32) -> Option<Vec<u32>> {
        let nof_cce = self.nof_cces(cfi);
        if nof_cce == 0 {
            return None;
        }
        let mut positions = vec![0u32; self.requests.len()];
        let used = RbMask::new(nof_cce as usize);
        if self.place(0, nof_cce, &used, &mut positions) {
            Some(positions)
        } else {
            None
        }
    }

    fn place(&self, idx: usize, nof_cce: u32, used: &RbMask, positions: &mut Vec<u32>) -> bool {
        if idx == self.requests.len() {
            return true;
        }
        let req = &self.requests[idx];
        let l = 1u32 << req.aggr_idx;
        for cand in self.candidates(req.ss, req.aggr_idx, nof_cce) {
            if (cand..cand + l).any(|cce| used.test(cce as usize)) {
                continue;
            }
            let mut next = used.clone();
            next.fill(cand as usize, (cand + l) as usize);
            positions[idx] = cand;
            if self.place(idx + 1, nof_cce, &next, positions) {
                return true;
            }
        }
        false
    }

    fn location_of(&self, idx: usize) -> DciLocation {
        DciLocation {
            ncce: self.positions[idx],
            aggr_idx: self.requests[idx].aggr_idx,
        }
    }
}

/// Slot lifecycle: allocation primitives are only valid in `Open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Open,
    Finalised,
}

struct BcAllocInfo {
    bc_type: BcType,
    pdcch_idx: usize,
    rbg_start: usize,
    rbg_len: usize,
    tbs: u32,
}

struct RarAllocInfo {
    ra_rnti: Rnti,
    pdcch_idx: usize,
    rbg_start: usize,
    rbg_len: usize,
    tbs: u32,
    msg3_grants: Vec<RarMsg3Grant>,
    pdu: Bytes,
}

struct DlDataInfo {
    rnti: Rnti,
    pdcch_idx: usize,
    rbg_start: usize,
    rbg_len: usize,
    tbs: u32,
}

struct UlAllocInfo {
    rnti: Rnti,
    kind: UlAllocKind,
    prb_start: u32,
    nof_prb: u32,
    mcs: u32,
    tbs: u32,
    pdcch_idx: Option<usize>,
}

/// Working buffer for one TTI
pub struct SfSched {
    params: Arc<CarrierParams>,
    tti_params: TtiParams,
    state: SlotState,
    dl_mask: RbMask,
    ul_mask: RbMask,
    pdcch: PdcchSched,
    bc_allocs: Vec<BcAllocInfo>,
    rar_allocs: Vec<RarAllocInfo>,
    data_allocs: Vec<DlDataInfo>,
    ul_allocs: Vec<UlAllocInfo>,
    pending_msg3: VecDeque<PendingMsg3>,
    dl_sched_result: DlSchedResult,
    ul_sched_result: UlSchedResult,
}

impl SfSched {
    pub fn new(params: Arc<CarrierParams>) -> Self {
        let nof_rbgs = params.cell.nof_rbgs();
        let nof_prb_ul = params.cell.nof_prb_ul as usize;
        let nof_prb_dl = params.cell.nof_prb_dl;
        Self {
            params,
            tti_params: TtiParams::new(Tti::new(0)),
            state: SlotState::Idle,
            dl_mask: RbMask::new(nof_rbgs),
            ul_mask: RbMask::new(nof_prb_ul),
            pdcch: PdcchSched::new(nof_prb_dl),
            bc_allocs: Vec::new(),
            rar_allocs: Vec::new(),
            data_allocs: Vec::new(),
            ul_allocs: Vec::new(),
            pending_msg3: VecDeque::new(),
            dl_sched_result: DlSchedResult::default(),
            ul_sched_result: UlSchedResult::default(),
        }
    }

    /// Rebind the slot to a new TTI and zero its working state.
    /// Msg3s pre-allocated for this TTI by an earlier one are preserved.
    pub fn new_tti(&mut self, tti_rx: Tti, start_cfi: u32) {
        self.tti_params = TtiParams::new(tti_rx);
        self.state = SlotState::Open;
        self.dl_mask.reset();
        self.ul_mask.reset();
        self.pdcch.new_tti(self.tti_params.tti_tx_dl.sf_idx(), start_cfi);
        self.bc_allocs.clear();
        self.rar_allocs.clear();
        self.data_allocs.clear();
        self.ul_allocs.clear();
        self.dl_sched_result = DlSchedResult::default();
        self.ul_sched_result = UlSchedResult::default();
    }

    pub fn tti_params(&self) -> &TtiParams {
        &self.tti_params
    }

    pub fn tti_rx(&self) -> Tti {
        self.tti_params.tti_rx
    }

    pub fn tti_tx_dl(&self) -> Tti {
        self.tti_params.tti_tx_dl
    }

    pub fn tti_tx_ul(&self) -> Tti {
        self.tti_params.tti_tx_ul
    }

    pub fn dl_mask(&self) -> &RbMask {
        &self.dl_mask
    }

    pub fn ul_mask(&self) -> &RbMask {
        &self.ul_mask
    }

    pub fn dl_sched_result(&self) -> &DlSchedResult {
        &self.dl_sched_result
    }

    pub fn ul_sched_result(&self) -> &UlSchedResult {
        &self.ul_sched_result
    }

    /// True when this slot already carries the finalised result for `tti_rx`
    pub fn is_generated_for(&self, tti_rx: Tti) -> bool {
        self.state == SlotState::Finalised && self.tti_params.tti_rx == tti_rx
    }

    fn check_open(&self) -> AllocResult {
        if self.state == SlotState::Open {
            Ok(())
        } else {
            Err(AllocFailure::Error)
        }
    }

    /// PRBs actually covered by an RBG range (the last group may be short)
    fn prbs_in_rbg_range(&self, rbg_start: usize, rbg_len: usize) -> u32 {
        let p = self.params.cell.rbg_size();
        let nof_prb = self.params.cell.nof_prb_dl;
        (rbg_start..rbg_start + rbg_len)
            .map(|g| p.min(nof_prb.saturating_sub(g as u32 * p)))
            .sum()
    }

    fn rbg_range_mask(&self, rbg_start: usize, rbg_len: usize) -> RbMask {
        let mut mask = RbMask::new(self.dl_mask.len());
        mask.fill(rbg_start, rbg_start + rbg_len);
        mask
    }

    /// Find RBGs for a broadcast-class payload without committing them
    fn find_dl_ctrl_rbgs(&self, payload_bytes: u32) -> Result<(usize, usize, u32), AllocFailure> {
        let cell = &self.params.cell;
        let prbs = ceil_div(payload_bytes, BC_BYTES_PER_PRB).max(1);
        if prbs > cell.nof_prb_dl {
            return Err(AllocFailure::InvalidCoderate);
        }
        let rbgs = ceil_div(prbs, cell.rbg_size()) as usize;
        let start = self
            .dl_mask
            .find_clear_run(rbgs)
            .ok_or(AllocFailure::RbCollision)?;
        let tbs = self.prbs_in_rbg_range(start, rbgs) * BC_BYTES_PER_PRB;
        Ok((start, rbgs, tbs))
    }

    /// Reserve PDCCH and RBGs for a SIB transmission and append the
    /// broadcast grant
    pub fn alloc_bc(&mut self, aggr_idx: u32, sib_idx: usize, n_tx: u32) -> AllocResult {
        self.check_open()?;
        let len = self
            .params
            .cell
            .sibs
            .get(sib_idx)
            .map(|s| s.len)
            .unwrap_or(0);
        if len == 0 {
            return Err(AllocFailure::Error);
        }
        let (rbg_start, rbg_len, tbs) = self.find_dl_ctrl_rbgs(len)?;
        let pdcch_idx = self.pdcch.try_alloc(SearchSpace::Common, aggr_idx)?;
        self.dl_mask.fill(rbg_start, rbg_start + rbg_len);
        self.bc_allocs.push(BcAllocInfo {
            bc_type: BcType::Bcch { sib_idx, n_tx },
            pdcch_idx,
            rbg_start,
            rbg_len,
            tbs,
        });
        trace!(
            "Allocated SIB idx={} n_tx={} rbgs=[{},{}) at tti_tx_dl={}",
            sib_idx,
            n_tx,
            rbg_start,
            rbg_start + rbg_len,
            self.tti_params.tti_tx_dl
        );
        Ok(())
    }

    /// Reserve PDCCH and RBGs sufficient to carry a paging record
    pub fn alloc_paging(&mut self, aggr_idx: u32, payload_bytes: u32) -> AllocResult {
        self.check_open()?;
        if payload_bytes == 0 {
            return Err(AllocFailure::Error);
        }
        let (rbg_start, rbg_len, tbs) = self.find_dl_ctrl_rbgs(payload_bytes)?;
        let pdcch_idx = self.pdcch.try_alloc(SearchSpace::Common, aggr_idx)?;
        self.dl_mask.fill(rbg_start, rbg_start + rbg_len);
        self.bc_allocs.push(BcAllocInfo {
            bc_type: BcType::Pcch,
            pdcch_idx,
            rbg_start,
            rbg_len,
            tbs,
        });
        trace!(
            "Allocated paging of {} bytes at tti_tx_dl={}",
            payload_bytes,
            self.tti_params.tti_tx_dl
        );
        Ok(())
    }

    /// Try to fit as many Msg3 grants of the pending RAR as PDCCH, the
    /// downlink grid and the uplink Msg3 region allow. Returns how many
    /// were placed.
    pub fn alloc_rar(&mut self, aggr_idx: u32, rar: &PendingRar) -> Result<u32, AllocFailure> {
        if self.state != SlotState::Open {
            return Err(AllocFailure::Error);
        }
        let cell = &self.params.cell;
        let msg3_region_end = cell.nof_prb_ul - cell.nrb_pucch;

        for n in (1..=rar.grants.len()).rev() {
            // Uplink Msg3 layout: consecutive ranges above the PUCCH region
            let mut msg3_grants = Vec::with_capacity(n);
            let mut next_prb = cell.nrb_pucch;
            let mut fits = true;
            for info in rar.grants.iter().take(n) {
                let l = ceil_div(info.msg3_size.max(1), UL_BYTES_PER_PRB).max(1);
                if next_prb + l > msg3_region_end {
                    fits = false;
                    break;
                }
                msg3_grants.push(RarMsg3Grant {
                    data: *info,
                    rba: type2_to_riv(l, next_prb, cell.nof_prb_ul),
                    trunc_mcs: MSG3_MCS,
                });
                next_prb += l;
            }
            if !fits {
                continue;
            }

            // Downlink RBGs for the RAR PDU; a PDU too large for the grid
            // or the coderate shrinks to fewer grants
            let (rbg_start, rbg_len, tbs) =
                match self.find_dl_ctrl_rbgs(RAR_GRANT_BYTES * n as u32) {
                    Ok(alloc) => alloc,
                    Err(_) => continue,
                };

            let pdcch_idx = self.pdcch.try_alloc(SearchSpace::Common, aggr_idx)?;
            self.dl_mask.fill(rbg_start, rbg_start + rbg_len);
            let pdu = build_rar_pdu(&msg3_grants);
            self.rar_allocs.push(RarAllocInfo {
                ra_rnti: rar.ra_rnti,
                pdcch_idx,
                rbg_start,
                rbg_len,
                tbs,
                msg3_grants,
                pdu,
            });
            debug!(
                "Allocated RAR for ra_rnti=0x{:x} with {}/{} grants at tti_tx_dl={}",
                rar.ra_rnti,
                n,
                rar.grants.len(),
                self.tti_params.tti_tx_dl
            );
            return Ok(n as u32);
        }
        Err(AllocFailure::RbCollision)
    }

    /// Reserve a contiguous uplink PRB range and register the UL HARQ
    pub fn alloc_ul(
        &mut self,
        ue: &mut SchedUe,
        alloc: (u32, u32),
        kind: UlAllocKind,
        mcs: u32,
    ) -> AllocResult {
        self.check_open()?;
        let (prb_start, nof_prb) = alloc;
        if nof_prb == 0 || prb_start + nof_prb > self.params.cell.nof_prb_ul {
            return Err(AllocFailure::Error);
        }
        let range = prb_start as usize..(prb_start + nof_prb) as usize;
        if range.clone().any(|prb| self.ul_mask.test(prb)) {
            return Err(AllocFailure::RbCollision);
        }

        // Msg3 is granted by the RAR and non-adaptive retransmissions ride
        // on PHICH; only a new transmission needs a DCI format 0
        let pdcch_idx = match kind {
            UlAllocKind::NewTx => {
                Some(self.pdcch.try_alloc(SearchSpace::Ue(ue.rnti()), 2)?)
            }
            UlAllocKind::Msg3 | UlAllocKind::Retx => None,
        };

        self.ul_mask.fill(range.start, range.end);
        let tti_tx_ul = self.tti_params.tti_tx_ul;
        let harq = ue.get_ul_harq(tti_tx_ul, 0);
        match kind {
            UlAllocKind::Retx => harq.new_retx(tti_tx_ul, prb_start, nof_prb),
            _ => harq.new_tx(tti_tx_ul, prb_start, nof_prb, mcs),
        }
        self.ul_allocs.push(UlAllocInfo {
            rnti: ue.rnti(),
            kind,
            prb_start,
            nof_prb,
            mcs,
            tbs: nof_prb * UL_BYTES_PER_PRB,
            pdcch_idx,
        });
        trace!(
            "Allocated UL {:?} for rnti=0x{:x} prbs=[{},{}) at tti_tx_ul={}",
            kind,
            ue.rnti(),
            prb_start,
            prb_start + nof_prb,
            tti_tx_ul
        );
        Ok(())
    }

    /// Reserve a downlink RBG range for user data. Returns the TBS the
    /// grant carries.
    pub fn alloc_dl_data(
        &mut self,
        rnti: Rnti,
        rbg_start: usize,
        rbg_len: usize,
    ) -> Result<u32, AllocFailure> {
        self.check_open()?;
        if rbg_len == 0 || rbg_start + rbg_len > self.dl_mask.len() {
            return Err(AllocFailure::Error);
        }
        if (rbg_start..rbg_start + rbg_len).any(|g| self.dl_mask.test(g)) {
            return Err(AllocFailure::RbCollision);
        }
        let pdcch_idx = self.pdcch.try_alloc(SearchSpace::Ue(rnti), 2)?;
        self.dl_mask.fill(rbg_start, rbg_start + rbg_len);
        let tbs = self.prbs_in_rbg_range(rbg_start, rbg_len) * DL_DATA_BYTES_PER_PRB;
        self.data_allocs.push(DlDataInfo {
            rnti,
            pdcch_idx,
            rbg_start,
            rbg_len,
            tbs,
        });
        Ok(tbs)
    }

    /// Append a Msg3 pre-allocation. Valid in any slot state: the target
    /// slot is bound to a future TTI and opens later.
    pub fn alloc_msg3(&mut self, msg3: PendingMsg3) -> AllocResult {
        if self.pending_msg3.len() >= MAX_PENDING_MSG3 {
            return Err(AllocFailure::Error);
        }
        self.pending_msg3.push_back(msg3);
        Ok(())
    }

    /// Take the next pending Msg3 for this TTI
    pub fn pop_pending_msg3(&mut self) -> Option<PendingMsg3> {
        self.pending_msg3.pop_front()
    }

    pub fn nof_pending_msg3(&self) -> usize {
        self.pending_msg3.len()
    }

    /// Emit one PHICH element
    pub fn add_phich(&mut self, rnti: Rnti, value: PhichValue) {
        self.ul_sched_result.phich.push(PhichElem { rnti, value });
    }

    /// Mark the whole downlink grid as taken (narrow-band PRACH guard)
    pub fn block_dl(&mut self) {
        self.dl_mask.fill_all();
    }

    /// Initialise the uplink mask with the PRACH reservation
    pub fn reserve_prach(&mut self, prach_mask: &RbMask) {
        self.ul_mask |= prach_mask;
        self.ul_sched_result.prach = true;
    }

    /// Fold a reservation into the uplink mask
    pub fn or_ul_mask(&mut self, mask: &RbMask) {
        self.ul_mask |= mask;
    }

    #[cfg(test)]
    pub(crate) fn fill_dl_mask(&mut self, begin: usize, end: usize) {
        self.dl_mask.fill(begin, end);
    }

    /// Freeze the slot: fix the PDCCH candidate combination and fill the
    /// result descriptors
    pub fn generate_dcis(&mut self) {
        if self.state != SlotState::Open {
            warn!(
                "generate_dcis on a slot that is not open (tti_rx={})",
                self.tti_params.tti_rx
            );
            return;
        }
        let bc: Vec<BcGrant> = self
            .bc_allocs
            .iter()
            .map(|alloc| BcGrant {
                bc_type: alloc.bc_type,
                dci: self.pdcch.location_of(alloc.pdcch_idx),
                rbg_mask: self.rbg_range_mask(alloc.rbg_start, alloc.rbg_len),
                tbs: alloc.tbs,
            })
            .collect();
        let rar: Vec<RarGrant> = self
            .rar_allocs
            .iter()
            .map(|alloc| RarGrant {
                ra_rnti: alloc.ra_rnti,
                dci: self.pdcch.location_of(alloc.pdcch_idx),
                rbg_mask: self.rbg_range_mask(alloc.rbg_start, alloc.rbg_len),
                tbs: alloc.tbs,
                msg3_grants: alloc.msg3_grants.clone(),
                pdu: alloc.pdu.clone(),
            })
            .collect();
        let data: Vec<DlDataGrant> = self
            .data_allocs
            .iter()
            .map(|alloc| DlDataGrant {
                rnti: alloc.rnti,
                dci: self.pdcch.location_of(alloc.pdcch_idx),
                rbg_mask: self.rbg_range_mask(alloc.rbg_start, alloc.rbg_len),
                tbs: alloc.tbs,
            })
            .collect();
        let pusch: Vec<UlGrant> = self
            .ul_allocs
            .iter()
            .map(|alloc| UlGrant {
                rnti: alloc.rnti,
                kind: alloc.kind,
                prb_start: alloc.prb_start,
                nof_prb: alloc.nof_prb,
                rba: type2_to_riv(alloc.nof_prb, alloc.prb_start, self.params.cell.nof_prb_ul),
                mcs: alloc.mcs,
                tbs: alloc.tbs,
                dci: alloc.pdcch_idx.map(|idx| self.pdcch.location_of(idx)),
            })
            .collect();

        self.dl_sched_result.cfi = self.pdcch.cfi();
        self.dl_sched_result.bc = bc;
        self.dl_sched_result.rar = rar;
        self.dl_sched_result.data = data;
        self.ul_sched_result.pusch = pusch;
        self.state = SlotState::Finalised;
    }

    /// Clone the finalised TTI into a caller-owned snapshot
    pub fn snapshot(&self) -> TtiResult {
        TtiResult {
            tti_params: self.tti_params,
            dl: self.dl_sched_result.clone(),
            ul: self.ul_sched_result.clone(),
            dl_mask: self.dl_mask.clone(),
            ul_mask: self.ul_mask.clone(),
        }
    }
}

/// Pack the MAC RAR PDU: one E/T/RAPID subheader per RAR followed by the
/// 48-bit payloads (TS 36.321 sections 6.1.5 and 6.2.3)
fn build_rar_pdu(grants: &[RarMsg3Grant]) -> Bytes {
    let mut buf = BytesMut::with_capacity(grants.len() * RAR_GRANT_BYTES as usize);
    for (i, grant) in grants.iter().enumerate() {
        // Subheaders chain with the extension bit; T=1 marks a RAPID entry
        let mut subheader = 0x40 | (grant.data.preamble_idx as u8 & 0x3F);
        if i + 1 < grants.len() {
            subheader |= 0x80;
        }
        buf.put_u8(subheader);

        // R + 11-bit timing advance
        let ta = grant.data.ta_cmd.min(0x7FF);
        // 20-bit UL grant: hopping | rba(10) | trunc_mcs(4) | tpc(3) | ul_delay | cqi_req
        let ul_grant: u32 =
            ((grant.rba & 0x3FF) << 9) | ((grant.trunc_mcs & 0xF) << 5) | (0b001 << 2);
        buf.put_u8(((ta >> 4) & 0x7F) as u8);
        buf.put_u8((((ta & 0xF) << 4) as u8) | (((ul_grant >> 16) & 0xF) as u8));
        buf.put_u8((ul_grant >> 8) as u8);
        buf.put_u8(ul_grant as u8);
        buf.put_u16(grant.data.temp_crnti.value());
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_params;
    use super::super::RarInfo;
    use super::*;

    fn open_slot(tti_rx: u32) -> SfSched {
        let mut slot = SfSched::new(Arc::new(test_params()));
        slot.new_tti(Tti::new(tti_rx), 1);
        slot
    }

    fn rar_info(prach_tti: u32, preamble_idx: u32, temp_crnti: u16) -> RarInfo {
        RarInfo {
            prach_tti: Tti::new(prach_tti),
            preamble_idx,
            ta_cmd: 2,
            temp_crnti: Rnti(temp_crnti),
            msg3_size: 7,
        }
    }

    #[test]
    fn test_alloc_requires_open_slot() {
        let mut slot = SfSched::new(Arc::new(test_params()));
        assert_eq!(slot.alloc_bc(2, 0, 0), Err(AllocFailure::Error));
        assert_eq!(slot.alloc_paging(2, 10), Err(AllocFailure::Error));

        slot.new_tti(Tti::new(0), 1);
        assert!(slot.alloc_bc(2, 0, 0).is_ok());
    }

    #[test]
    fn test_alloc_bc_reserves_rbgs_and_pdcch() {
        let mut slot = open_slot(1);
        // SIB1 of 18 bytes -> 6 PRBs -> 3 RBGs on a 25-PRB cell
        assert!(slot.alloc_bc(2, 0, 0).is_ok());
        assert_eq!(slot.dl_mask().count(), 3);

        slot.generate_dcis();
        let result = slot.dl_sched_result();
        assert_eq!(result.bc.len(), 1);
        assert_eq!(
            result.bc[0].bc_type,
            BcType::Bcch {
                sib_idx: 0,
                n_tx: 0
            }
        );
        assert!(result.bc[0].tbs >= 18);
    }

    #[test]
    fn test_alloc_bc_invalid_coderate() {
        let mut slot = open_slot(1);
        // 25 PRBs x 3 bytes = 75 bytes is the broadcast ceiling
        assert_eq!(slot.alloc_paging(2, 400), Err(AllocFailure::InvalidCoderate));
    }

    #[test]
    fn test_alloc_bc_rb_collision() {
        let mut slot = open_slot(1);
        slot.dl_mask.fill_all();
        assert_eq!(slot.alloc_bc(2, 0, 0), Err(AllocFailure::RbCollision));
    }

    #[test]
    fn test_pdcch_cfi_escalation() {
        let mut slot = open_slot(1);
        // CFI 1 on 25 PRBs leaves 4 CCEs: a single L=4 common candidate
        assert!(slot.alloc_bc(2, 0, 0).is_ok());
        assert_eq!(slot.pdcch.cfi(), 1);
        // The second common DCI forces CFI escalation
        assert!(slot.alloc_paging(2, 10).is_ok());
        assert!(slot.pdcch.cfi() > 1);
    }

    #[test]
    fn test_pdcch_exhaustion() {
        let mut slot = open_slot(1);
        // The common search space holds at most four L=4 DCIs
        let mut placed = 0;
        for sib_idx in 0..2 {
            if slot.alloc_bc(2, sib_idx, 0).is_ok() {
                placed += 1;
            }
        }
        for _ in 0..4 {
            if slot.alloc_paging(2, 3).is_ok() {
                placed += 1;
            }
        }
        assert_eq!(placed, 4);
        assert_eq!(slot.alloc_paging(2, 3), Err(AllocFailure::DciCollision));
    }

    #[test]
    fn test_alloc_ul_masks_and_harq() {
        let mut slot = open_slot(2);
        let mut ue = SchedUe::new(Rnti(0x46), vec![0]);

        assert!(slot.alloc_ul(&mut ue, (4, 3), UlAllocKind::NewTx, 6).is_ok());
        assert_eq!(slot.ul_mask().count(), 3);
        assert!(slot.ul_mask().test(4) && slot.ul_mask().test(6));

        // Overlap is rejected
        let mut other = SchedUe::new(Rnti(0x47), vec![0]);
        assert_eq!(
            slot.alloc_ul(&mut other, (6, 2), UlAllocKind::NewTx, 6),
            Err(AllocFailure::RbCollision)
        );

        // The HARQ now carries the allocation
        let harq = ue.get_ul_harq(slot.tti_tx_ul(), 0);
        assert_eq!(harq.nof_prb(), 3);

        slot.generate_dcis();
        let pusch = &slot.ul_sched_result().pusch;
        assert_eq!(pusch.len(), 1);
        assert!(pusch[0].dci.is_some());
        assert_eq!(pusch[0].rba, type2_to_riv(3, 4, 25));
    }

    #[test]
    fn test_msg3_needs_no_pdcch() {
        let mut slot = open_slot(2);
        let mut ue = SchedUe::new(Rnti(0x46), vec![0]);
        assert!(slot.alloc_ul(&mut ue, (2, 2), UlAllocKind::Msg3, 0).is_ok());

        slot.generate_dcis();
        assert!(slot.ul_sched_result().pusch[0].dci.is_none());
    }

    #[test]
    fn test_alloc_rar_full_grant() {
        let mut slot = open_slot(3);
        let rar = PendingRar {
            ra_rnti: Rnti(2),
            prach_tti: Tti::new(1),
            grants: vec![rar_info(1, 3, 0x46), rar_info(1, 9, 0x47)],
        };
        assert_eq!(slot.alloc_rar(2, &rar), Ok(2));

        slot.generate_dcis();
        let rar_grant = &slot.dl_sched_result().rar[0];
        assert_eq!(rar_grant.msg3_grants.len(), 2);
        // 2 grants x 7 bytes -> 5 PRBs -> 3 RBGs
        assert_eq!(rar_grant.rbg_mask.count(), 3);
        assert_eq!(rar_grant.pdu.len(), 14);
        // Second subheader is the last one: extension bit clear
        assert_eq!(rar_grant.pdu[0] & 0x80, 0x80);
        assert_eq!(rar_grant.pdu[7] & 0x80, 0);

        // Msg3 ranges are consecutive above the PUCCH region
        let (l0, s0) =
            crate::phy::ra::type2_from_riv(rar_grant.msg3_grants[0].rba, 25);
        let (l1, s1) =
            crate::phy::ra::type2_from_riv(rar_grant.msg3_grants[1].rba, 25);
        assert_eq!(s0, 2);
        assert_eq!(s1, s0 + l0);
        assert_eq!(l1, 2);
    }

    #[test]
    fn test_alloc_rar_partial_grant() {
        let mut slot = open_slot(3);
        // Leave three RBGs (6 PRBs, 18 bytes): fits two RARs, not three
        slot.dl_mask.fill(3, slot.dl_mask.len());
        let rar = PendingRar {
            ra_rnti: Rnti(2),
            prach_tti: Tti::new(1),
            grants: vec![
                rar_info(1, 3, 0x46),
                rar_info(1, 9, 0x47),
                rar_info(1, 11, 0x48),
            ],
        };
        assert_eq!(slot.alloc_rar(2, &rar), Ok(2));
    }

    #[test]
    fn test_alloc_rar_rb_collision() {
        let mut slot = open_slot(3);
        slot.dl_mask.fill_all();
        let rar = PendingRar {
            ra_rnti: Rnti(2),
            prach_tti: Tti::new(1),
            grants: vec![rar_info(1, 3, 0x46)],
        };
        assert_eq!(slot.alloc_rar(2, &rar), Err(AllocFailure::RbCollision));
    }

    #[test]
    fn test_msg3_queue_survives_new_tti() {
        let mut slot = open_slot(4);
        let msg3 = PendingMsg3 {
            rnti: Rnti(0x46),
            n_prb: 2,
            l: 2,
            mcs: 0,
        };
        assert!(slot.alloc_msg3(msg3).is_ok());

        slot.new_tti(Tti::new(14), 1);
        assert_eq!(slot.pop_pending_msg3(), Some(msg3));
        assert_eq!(slot.pop_pending_msg3(), None);
    }

    #[test]
    fn test_rar_pdu_ul_grant_fields() {
        let grants = vec![RarMsg3Grant {
            data: rar_info(1, 5, 0x46),
            rba: type2_to_riv(2, 2, 25),
            trunc_mcs: MSG3_MCS,
        }];
        let pdu = build_rar_pdu(&grants);
        assert_eq!(pdu.len(), 7);
        assert_eq!(pdu[0], 0x40 | 5);
        // TC-RNTI in the trailing two bytes
        assert_eq!(u16::from_be_bytes([pdu[5], pdu[6]]), 0x46);
    }
}
