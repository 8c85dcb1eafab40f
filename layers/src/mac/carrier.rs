//! Per-Carrier Scheduler
//!
//! Owns the ring of in-flight subframe slots and coordinates the
//! broadcast scheduler, the random-access scheduler and the data metrics
//! in a fixed order every TTI: PHICH, broadcast, RAR, the UL/DL PDCCH
//! round-robin, DCI finalisation, Msg3 pre-allocation and the per-UE
//! tick. All mutating entry points serialise on the carrier mutex.

use super::bc_sched::BcSched;
use super::metric::{DlMetric, DlMetricRr, UlMetric, UlMetricRr};
use super::ra_sched::RaSched;
use super::sf_sched::SfSched;
use super::ue::UeDb;
use super::{
    write_lock, CarrierParams, PhichValue, RarInfo, SchedError, TtiParams, TtiResult,
    MSG3_DELAY_MS, TTI_RING_LEN,
};
use crate::phy::prach::prach_tti_opportunity_fdd;
use crate::rrc::RrcSchedInterface;
use crate::LayerError;
use common::mask::RbMask;
use common::types::Tti;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

struct CarrierInner {
    bc: BcSched,
    ra: RaSched,
    dl_metric: Box<dyn DlMetric>,
    ul_metric: Box<dyn UlMetric>,
    /// DL blackout vector indexed by `tti_tx_dl mod len`; zero means DL
    /// is permitted
    sf_dl_mask: Vec<u8>,
    slots: Vec<SfSched>,
}

/// Scheduler for one carrier. Single writer: the MAC calls
/// `generate_tti_result` once per TTI from its real-time thread.
pub struct CarrierSched {
    params: Arc<CarrierParams>,
    cc_idx: u32,
    ue_db: Arc<RwLock<UeDb>>,
    /// Leftmost and rightmost `nrb_pucch` PRBs of the uplink band
    pucch_mask: RbMask,
    /// The 6 PRBs starting at `prach_freq_offset`
    prach_mask: RbMask,
    inner: Mutex<CarrierInner>,
}

impl CarrierSched {
    /// Configure the carrier: build the sub-schedulers, wire the default
    /// round-robin metrics, precompute the PUCCH/PRACH masks and
    /// initialise the subframe-slot ring.
    pub fn new(
        params: CarrierParams,
        rrc: Arc<dyn RrcSchedInterface>,
        ue_db: Arc<RwLock<UeDb>>,
        cc_idx: u32,
    ) -> Result<Self, LayerError> {
        params.validate()?;
        let params = Arc::new(params);
        let cell = &params.cell;

        let mut pucch_mask = RbMask::new(cell.nof_prb_ul as usize);
        if cell.nrb_pucch > 0 {
            pucch_mask.fill(0, cell.nrb_pucch as usize);
            pucch_mask.fill(
                (cell.nof_prb_ul - cell.nrb_pucch) as usize,
                cell.nof_prb_ul as usize,
            );
        }
        let mut prach_mask = RbMask::new(cell.nof_prb_ul as usize);
        prach_mask.fill(
            cell.prach_freq_offset as usize,
            (cell.prach_freq_offset + 6) as usize,
        );

        let mut dl_metric: Box<dyn DlMetric> = Box::<DlMetricRr>::default();
        dl_metric.set_params(&params, cc_idx);
        let mut ul_metric: Box<dyn UlMetric> = Box::<UlMetricRr>::default();
        ul_metric.set_params(&params, cc_idx);

        let slots = (0..TTI_RING_LEN)
            .map(|_| SfSched::new(params.clone()))
            .collect();

        info!(
            "Configured carrier cc_idx={} cell_id={} dl={} ul={} PRBs",
            cc_idx, cell.cell_id.0, cell.nof_prb_dl, cell.nof_prb_ul
        );
        Ok(Self {
            params: params.clone(),
            cc_idx,
            ue_db,
            pucch_mask,
            prach_mask,
            inner: Mutex::new(CarrierInner {
                bc: BcSched::new(params.clone(), rrc),
                ra: RaSched::new(params),
                dl_metric,
                ul_metric,
                sf_dl_mask: vec![0],
                slots,
            }),
        })
    }

    /// Replace the data metric plugins
    pub fn set_metrics(&self, mut dl: Box<dyn DlMetric>, mut ul: Box<dyn UlMetric>) {
        dl.set_params(&self.params, self.cc_idx);
        ul.set_params(&self.params, self.cc_idx);
        let mut inner = self.lock_inner();
        inner.dl_metric = dl;
        inner.ul_metric = ul;
    }

    /// Clear broadcast and random-access state
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        inner.bc.reset();
        inner.ra.reset();
    }

    /// Replace the DL blackout vector; a zero entry means DL is permitted
    /// for `tti_tx_dl mod len`
    pub fn set_dl_tti_mask(&self, mask: &[u8]) {
        if mask.is_empty() {
            warn!("Ignoring empty DL TTI mask");
            return;
        }
        self.lock_inner().sf_dl_mask = mask.to_vec();
    }

    /// Forward a PRACH detection to the random-access scheduler
    pub fn dl_rach_info(&self, rar_info: RarInfo) -> Result<(), SchedError> {
        self.lock_inner().ra.dl_rach_info(rar_info)
    }

    /// Number of RA occasions awaiting a RAR
    pub fn nof_pending_rars(&self) -> usize {
        self.lock_inner().ra.nof_pending_rars()
    }

    /// Run the scheduler for one TTI. Idempotent: a second call with the
    /// same `tti_rx` returns the memoised slot without mutating state.
    pub fn generate_tti_result(&self, tti_rx: Tti) -> TtiResult {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let idx = tti_rx.value() as usize % TTI_RING_LEN;

        if inner.slots[idx].is_generated_for(tti_rx) {
            return inner.slots[idx].snapshot();
        }

        let tti_params = TtiParams::new(tti_rx);
        let dl_active =
            inner.sf_dl_mask[tti_params.tti_tx_dl.value() as usize % inner.sf_dl_mask.len()] == 0;
        inner.slots[idx].new_tti(tti_rx, self.params.sched.nof_ctrl_symbols);

        let mut ue_db = write_lock(&self.ue_db);

        // PHICH first: a DL blackout does not suppress acknowledgements,
        // the UE expects a definitive ACK/NACK
        self.generate_phich(&mut ue_db, &mut inner.slots[idx]);

        if dl_active {
            inner.bc.dl_sched(&mut inner.slots[idx]);
            inner.ra.dl_sched(&mut inner.slots[idx]);
        }

        // Alternate the PDCCH priority between UL and DL data so neither
        // direction starves under PDCCH pressure
        if tti_rx.value() % 2 == 0 {
            self.alloc_ul_users(
                &mut inner.ra,
                inner.ul_metric.as_mut(),
                &mut ue_db,
                &mut inner.slots[idx],
            );
        }
        self.alloc_dl_users(
            inner.dl_metric.as_mut(),
            &inner.sf_dl_mask,
            &mut ue_db,
            &mut inner.slots[idx],
        );
        if tti_rx.value() % 2 == 1 {
            self.alloc_ul_users(
                &mut inner.ra,
                inner.ul_metric.as_mut(),
                &mut ue_db,
                &mut inner.slots[idx],
            );
        }

        // Fix the winning PDCCH candidate combination
        inner.slots[idx].generate_dcis();

        // Pre-allocate the Msg3s of the RARs that just went out
        if dl_active {
            let msg3_idx = (tti_rx.value() as usize + MSG3_DELAY_MS as usize) % TTI_RING_LEN;
            let dl_result = inner.slots[idx].dl_sched_result().clone();
            inner.ra.sched_msg3(&mut inner.slots[msg3_idx], &dl_result);
        }

        // Unblock HARQ pids whose windows closed with this TTI
        for ue in ue_db.values_mut() {
            ue.finish_tti(&tti_params, self.cc_idx);
        }

        inner.slots[idx].snapshot()
    }

    fn generate_phich(&self, ue_db: &mut UeDb, slot: &mut SfSched) {
        let tti_rx = slot.tti_rx();
        for (rnti, ue) in ue_db.iter_mut() {
            let Some(cell_index) = ue.get_cell_index(self.cc_idx) else {
                continue;
            };
            let harq = ue.get_ul_harq(tti_rx, cell_index);
            if harq.has_pending_ack() {
                let value = if harq.get_pending_ack() {
                    PhichValue::Ack
                } else {
                    PhichValue::Nack
                };
                slot.add_phich(*rnti, value);
                debug!("Allocated PHICH for rnti=0x{:x}, value={:?}", rnti, value);
            }
        }
    }

    fn alloc_dl_users(
        &self,
        dl_metric: &mut dyn DlMetric,
        sf_dl_mask: &[u8],
        ue_db: &mut UeDb,
        slot: &mut SfSched,
    ) {
        if sf_dl_mask[slot.tti_tx_dl().value() as usize % sf_dl_mask.len()] != 0 {
            return;
        }

        // On 6-PRB cells the whole band overlaps PRACH: block DL whose
        // acknowledgement subframe would collide with a PRACH occasion
        if self.params.cell.nof_prb_dl == 6
            && prach_tti_opportunity_fdd(
                self.params.cell.prach_config,
                slot.tti_params().tti_rx_ack(),
            )
        {
            slot.block_dl();
        }

        dl_metric.sched_users(ue_db, slot);
    }

    fn alloc_ul_users(
        &self,
        ra: &mut RaSched,
        ul_metric: &mut dyn UlMetric,
        ue_db: &mut UeDb,
        slot: &mut SfSched,
    ) {
        let tti_tx_ul = slot.tti_tx_ul();

        if prach_tti_opportunity_fdd(self.params.cell.prach_config, tti_tx_ul) {
            slot.reserve_prach(&self.prach_mask);
            debug!(
                "Allocated PRACH RBs at tti_tx_ul={}. Mask: 0x{}",
                tti_tx_ul,
                self.prach_mask.to_hex()
            );
        }

        ra.ul_sched(slot, ue_db);

        if self.params.cell.nof_prb_ul != 6 && slot.ul_mask().intersects(&self.pucch_mask) {
            error!(
                "PUCCH collision detected. current mask=0x{}, pucch_mask=0x{}",
                slot.ul_mask().to_hex(),
                self.pucch_mask.to_hex()
            );
        }
        slot.or_ul_mask(&self.pucch_mask);

        ul_metric.sched_users(ue_db, slot);
    }

    fn lock_inner(&self) -> MutexGuard<'_, CarrierInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_cell_cfg, test_params};
    use super::super::ue::SchedUe;
    use super::super::{BcType, SchedCfg, SibCfg, UlAllocKind};
    use super::*;
    use crate::rrc::NoPaging;
    use common::types::Rnti;

    fn new_carrier(params: CarrierParams) -> CarrierSched {
        let ue_db = Arc::new(RwLock::new(UeDb::new()));
        CarrierSched::new(params, Arc::new(NoPaging), ue_db, 0).unwrap()
    }

    fn carrier_with_ue(params: CarrierParams, rnti: Rnti) -> CarrierSched {
        let carrier = new_carrier(params);
        write_lock(&carrier.ue_db).insert(rnti, SchedUe::new(rnti, vec![0]));
        carrier
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
    fn test_sib1_cadence() {
        let mut params = test_params();
        params.cell.sibs = vec![SibCfg { len: 18, period_rf: 8 }];
        let carrier = new_carrier(params);

        let mut bc_ttis = Vec::new();
        for tti_rx in 0..160u32 {
            let result = carrier.generate_tti_result(Tti::new(tti_rx));
            for grant in &result.dl.bc {
                assert!(matches!(grant.bc_type, BcType::Bcch { sib_idx: 0, .. }));
                bc_ttis.push(result.tti_params.tti_tx_dl);
            }
        }
        // Exactly one broadcast per even SFN at subframe 5, none elsewhere
        let coords: Vec<(u32, u32)> = bc_ttis.iter().map(|t| (t.sfn(), t.sf_idx())).collect();
        assert_eq!(
            coords,
            vec![(0, 5), (2, 5), (4, 5), (6, 5), (8, 5), (10, 5), (12, 5), (14, 5)]
        );
    }

    #[test]
    fn test_rar_within_window_and_msg3_delay() {
        let carrier = carrier_with_ue(test_params(), Rnti(0x46));
        carrier.dl_rach_info(rar_info(100, 3, 0x46)).unwrap();

        let mut rar_tx_dl = None;
        let mut msg3_tx_ul = None;
        for tti_rx in 97..114u32 {
            let result = carrier.generate_tti_result(Tti::new(tti_rx));
            if !result.dl.rar.is_empty() && rar_tx_dl.is_none() {
                rar_tx_dl = Some(result.tti_params.tti_tx_dl.value());
            }
            for grant in &result.ul.pusch {
                if grant.kind == UlAllocKind::Msg3 && grant.rnti == Rnti(0x46) {
                    msg3_tx_ul = Some(result.tti_params.tti_tx_ul.value());
                }
            }
        }

        let rar_tx_dl = rar_tx_dl.expect("RAR was never transmitted");
        assert!((103..113).contains(&rar_tx_dl), "rar at {}", rar_tx_dl);
        assert_eq!(msg3_tx_ul, Some(rar_tx_dl + super::MSG3_DELAY_MS));
        assert_eq!(carrier.nof_pending_rars(), 0);
    }

    #[test]
    fn test_rar_window_overflow_drops_pending() {
        let carrier = carrier_with_ue(test_params(), Rnti(0x46));
        carrier.dl_rach_info(rar_info(100, 3, 0x46)).unwrap();

        // First serviced TTI is already past the window end (tx_dl = 114)
        let result = carrier.generate_tti_result(Tti::new(110));
        assert!(result.dl.rar.is_empty());
        assert_eq!(carrier.nof_pending_rars(), 0);
    }

    #[test]
    fn test_rar_coalescing() {
        let carrier = carrier_with_ue(test_params(), Rnti(0x46));
        carrier.dl_rach_info(rar_info(200, 3, 0x46)).unwrap();
        carrier.dl_rach_info(rar_info(200, 9, 0x47)).unwrap();
        assert_eq!(carrier.nof_pending_rars(), 1);

        let result = carrier.generate_tti_result(Tti::new(199));
        assert_eq!(result.dl.rar.len(), 1);
        assert_eq!(result.dl.rar[0].msg3_grants.len(), 2);
        assert_eq!(result.dl.rar[0].ra_rnti, Rnti(1));
    }

    struct OrderLog(Arc<Mutex<Vec<&'static str>>>);

    impl DlMetric for OrderLog {
        fn set_params(&mut self, _params: &Arc<CarrierParams>, _cc_idx: u32) {}
        fn sched_users(&mut self, _ue_db: &mut UeDb, _slot: &mut SfSched) {
            self.0.lock().unwrap().push("dl");
        }
    }

    impl UlMetric for OrderLog {
        fn set_params(&mut self, _params: &Arc<CarrierParams>, _cc_idx: u32) {}
        fn sched_users(&mut self, _ue_db: &mut UeDb, _slot: &mut SfSched) {
            self.0.lock().unwrap().push("ul");
        }
    }

    #[test]
    fn test_pdcch_round_robin_order() {
        let carrier = new_carrier(test_params());
        let log = Arc::new(Mutex::new(Vec::new()));
        carrier.set_metrics(
            Box::new(OrderLog(log.clone())),
            Box::new(OrderLog(log.clone())),
        );

        carrier.generate_tti_result(Tti::new(20));
        assert_eq!(*log.lock().unwrap(), vec!["ul", "dl"]);

        log.lock().unwrap().clear();
        carrier.generate_tti_result(Tti::new(21));
        assert_eq!(*log.lock().unwrap(), vec!["dl", "ul"]);
    }

    #[test]
    fn test_pucch_reservation() {
        let carrier = carrier_with_ue(test_params(), Rnti(0x46));
        // Backlogged uplink data must not displace the PUCCH reservation
        write_lock(&carrier.ue_db)
            .get_mut(&Rnti(0x46))
            .unwrap()
            .ul_bsr(100);

        let result = carrier.generate_tti_result(Tti::new(40));
        for prb in [0usize, 1, 23, 24] {
            assert!(result.ul_mask.test(prb), "PRB {} not reserved", prb);
        }
        for grant in &result.ul.pusch {
            assert!(grant.prb_start >= 2);
            assert!(grant.prb_start + grant.nof_prb <= 23);
        }
    }

    #[test]
    fn test_prach_reservation_on_opportunity() {
        // PRACH config 3: subframe 1 of every frame; tti_tx_ul = 41
        let carrier = new_carrier(test_params());
        let result = carrier.generate_tti_result(Tti::new(37));
        assert!(result.ul.prach);
        for prb in 4..10 {
            assert!(result.ul_mask.test(prb));
        }

        let result = carrier.generate_tti_result(Tti::new(38));
        assert!(!result.ul.prach);
    }

    #[test]
    fn test_phich_emitted_even_on_dl_blackout() {
        let carrier = carrier_with_ue(test_params(), Rnti(0x46));
        carrier.set_dl_tti_mask(&[1]);

        let tti = Tti::new(45);
        {
            let mut ue_db = write_lock(&carrier.ue_db);
            let ue = ue_db.get_mut(&Rnti(0x46)).unwrap();
            ue.get_ul_harq(tti, 0).new_tx(tti, 5, 4, 6);
            ue.set_ul_crc(tti, true);
        }

        let result = carrier.generate_tti_result(tti);
        assert_eq!(result.ul.phich.len(), 1);
        assert_eq!(result.ul.phich[0].rnti, Rnti(0x46));
        assert_eq!(result.ul.phich[0].value, PhichValue::Ack);
        // Blackout: no broadcast, no RAR
        assert!(result.dl.bc.is_empty());
        assert!(result.dl.rar.is_empty());

        // The tick consumed the acknowledgement; the next TTI carries none
        let result = carrier.generate_tti_result(Tti::new(46));
        assert!(result.ul.phich.is_empty());
    }

    #[test]
    fn test_generate_is_idempotent() {
        let carrier = new_carrier(test_params());
        // A TTI that fires SIB1 (tti_tx_dl = 5)
        let first = carrier.generate_tti_result(Tti::new(1));
        let again = carrier.generate_tti_result(Tti::new(1));

        assert_eq!(first.dl.bc.len(), again.dl.bc.len());
        assert_eq!(first.dl.cfi, again.dl.cfi);
        assert!(first.dl_mask == again.dl_mask);
        assert!(first.ul_mask == again.ul_mask);

        // The repeat did not advance the SIB1 counter: the next firing TTI
        // still carries n_tx = 1
        let next = carrier.generate_tti_result(Tti::new(21));
        assert!(matches!(
            next.dl.bc[0].bc_type,
            BcType::Bcch { sib_idx: 0, n_tx: 1 }
        ));
    }

    #[test]
    fn test_narrowband_dl_blocked_on_prach_collision() {
        let mut params = CarrierParams {
            cell: test_cell_cfg(),
            sched: SchedCfg::default(),
        };
        params.cell.nof_prb_dl = common::types::Bandwidth::Bw1_4.nof_prb();
        params.cell.nof_prb_ul = common::types::Bandwidth::Bw1_4.nof_prb();
        params.cell.nrb_pucch = 1;
        params.cell.prach_freq_offset = 0;
        params.cell.sibs = vec![];

        let carrier = carrier_with_ue(params, Rnti(0x46));
        write_lock(&carrier.ue_db)
            .get_mut(&Rnti(0x46))
            .unwrap()
            .dl_buffer_state(50);

        // PRACH config 3 hits subframe 1: tti_rx = 3 acks at subframe 1
        let result = carrier.generate_tti_result(Tti::new(3));
        assert_eq!(result.dl_mask.count(), result.dl_mask.len());
        assert!(result.dl.data.is_empty());

        // A TTI whose ack subframe carries no PRACH schedules normally
        let result = carrier.generate_tti_result(Tti::new(4));
        assert!(!result.dl.data.is_empty());
    }

    #[test]
    fn test_reset_drops_pending_rars() {
        let carrier = new_carrier(test_params());
        carrier.dl_rach_info(rar_info(300, 3, 0x46)).unwrap();
        assert_eq!(carrier.nof_pending_rars(), 1);

        carrier.reset();
        assert_eq!(carrier.nof_pending_rars(), 0);
    }
}
