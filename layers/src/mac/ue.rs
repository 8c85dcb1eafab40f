//! Scheduler-Side UE State
//!
//! The UE database is shared between the carrier scheduler, RRC and the
//! data-plane metrics. The carrier scheduler reads it for PHICH emission
//! and hands it to the metrics; it never inserts or removes entries.

use super::TtiParams;
use common::types::{Rnti, Tti};
use std::collections::BTreeMap;

/// Number of uplink HARQ processes per UE (FDD)
pub const NOF_UL_HARQ: usize = 8;

/// Mapping from RNTI to scheduler UE state, iterated in RNTI order
pub type UeDb = BTreeMap<Rnti, SchedUe>;

/// One uplink HARQ process
#[derive(Debug, Clone, Copy, Default)]
pub struct UlHarq {
    tti: Option<Tti>,
    prb_start: u32,
    nof_prb: u32,
    mcs: u32,
    nof_retx: u32,
    pending_ack: Option<bool>,
    pending_retx: bool,
}

impl UlHarq {
    /// True when the process holds an acknowledgement not yet sent on PHICH
    pub fn has_pending_ack(&self) -> bool {
        self.pending_ack.is_some()
    }

    /// Acknowledgement value; only meaningful when `has_pending_ack()`
    pub fn get_pending_ack(&self) -> bool {
        self.pending_ack == Some(true)
    }

    /// True when the last transmission failed and awaits a retransmission
    pub fn has_pending_retx(&self) -> bool {
        self.pending_retx
    }

    /// PRB count of the last allocation, used to size a retransmission
    pub fn nof_prb(&self) -> u32 {
        self.nof_prb
    }

    /// MCS of the last allocation
    pub fn mcs(&self) -> u32 {
        self.mcs
    }

    /// Number of retransmissions of the current transport block
    pub fn nof_retx(&self) -> u32 {
        self.nof_retx
    }

    pub(crate) fn new_tx(&mut self, tti: Tti, prb_start: u32, nof_prb: u32, mcs: u32) {
        self.tti = Some(tti);
        self.prb_start = prb_start;
        self.nof_prb = nof_prb;
        self.mcs = mcs;
        self.nof_retx = 0;
        self.pending_retx = false;
    }

    pub(crate) fn new_retx(&mut self, tti: Tti, prb_start: u32, nof_prb: u32) {
        self.tti = Some(tti);
        self.prb_start = prb_start;
        self.nof_prb = nof_prb;
        self.nof_retx += 1;
        self.pending_retx = false;
    }

    pub(crate) fn set_crc(&mut self, ok: bool) {
        self.pending_ack = Some(ok);
        self.pending_retx = !ok;
    }

    pub(crate) fn reset_pending_ack(&mut self) {
        self.pending_ack = None;
    }
}

/// Per-UE scheduler state for one carrier
#[derive(Debug)]
pub struct SchedUe {
    rnti: Rnti,
    /// Carrier indices this UE is attached on
    supported_ccs: Vec<u32>,
    ul_harqs: [UlHarq; NOF_UL_HARQ],
    dl_buffer: u32,
    ul_buffer: u32,
}

impl SchedUe {
    pub fn new(rnti: Rnti, supported_ccs: Vec<u32>) -> Self {
        Self {
            rnti,
            supported_ccs,
            ul_harqs: [UlHarq::default(); NOF_UL_HARQ],
            dl_buffer: 0,
            ul_buffer: 0,
        }
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    /// Position of the given carrier in this UE's configuration, or `None`
    /// if the UE is not attached on it
    pub fn get_cell_index(&self, cc_idx: u32) -> Option<usize> {
        self.supported_ccs.iter().position(|cc| *cc == cc_idx)
    }

    /// Uplink HARQ process serving the given TTI
    pub fn get_ul_harq(&mut self, tti: Tti, _cell_index: usize) -> &mut UlHarq {
        &mut self.ul_harqs[tti.value() as usize % NOF_UL_HARQ]
    }

    /// Per-TTI tick: releases the acknowledgement whose PHICH window
    /// closed with this TTI
    pub fn finish_tti(&mut self, tti_params: &TtiParams, cc_idx: u32) {
        if self.get_cell_index(cc_idx).is_none() {
            return;
        }
        self.ul_harqs[tti_params.tti_rx.value() as usize % NOF_UL_HARQ].reset_pending_ack();
    }

    /// Record the decode outcome of the uplink transmission at `tti`
    pub fn set_ul_crc(&mut self, tti: Tti, ok: bool) {
        self.ul_harqs[tti.value() as usize % NOF_UL_HARQ].set_crc(ok);
    }

    /// Replace the downlink buffer occupancy
    pub fn dl_buffer_state(&mut self, bytes: u32) {
        self.dl_buffer = bytes;
    }

    /// Process a buffer status report
    pub fn ul_bsr(&mut self, bytes: u32) {
        self.ul_buffer = bytes;
    }

    pub fn dl_buffer(&self) -> u32 {
        self.dl_buffer
    }

    pub fn ul_buffer(&self) -> u32 {
        self.ul_buffer
    }

    pub(crate) fn consume_dl_buffer(&mut self, bytes: u32) {
        self.dl_buffer = self.dl_buffer.saturating_sub(bytes);
    }

    pub(crate) fn consume_ul_buffer(&mut self, bytes: u32) {
        self.ul_buffer = self.ul_buffer.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_index_lookup() {
        let ue = SchedUe::new(Rnti(0x46), vec![0]);
        assert_eq!(ue.get_cell_index(0), Some(0));
        assert_eq!(ue.get_cell_index(1), None);
    }

    #[test]
    fn test_harq_crc_lifecycle() {
        let mut ue = SchedUe::new(Rnti(0x46), vec![0]);
        let tti = Tti::new(12);

        ue.get_ul_harq(tti, 0).new_tx(tti, 5, 4, 6);
        assert!(!ue.get_ul_harq(tti, 0).has_pending_ack());

        ue.set_ul_crc(tti, false);
        let harq = ue.get_ul_harq(tti, 0);
        assert!(harq.has_pending_ack());
        assert!(!harq.get_pending_ack());
        assert!(harq.has_pending_retx());

        // The tick after PHICH emission clears the acknowledgement
        ue.finish_tti(&TtiParams::new(tti), 0);
        let harq = ue.get_ul_harq(tti, 0);
        assert!(!harq.has_pending_ack());
        assert!(harq.has_pending_retx());
    }

    #[test]
    fn test_retx_counting() {
        let mut harq = UlHarq::default();
        harq.new_tx(Tti::new(4), 2, 3, 6);
        assert_eq!(harq.nof_retx(), 0);

        harq.set_crc(false);
        harq.new_retx(Tti::new(12), 2, 3);
        assert_eq!(harq.nof_retx(), 1);
        assert!(!harq.has_pending_retx());
    }
}
