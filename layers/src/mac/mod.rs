//! Medium Access Control (MAC) Layer Implementation
//!
//! Implements the LTE per-carrier MAC scheduler according to 3GPP TS 36.321,
//! with the physical-layer procedures of TS 36.211/36.213 behind it. Every
//! 1 ms TTI the carrier scheduler decides which physical resource blocks
//! carry system information, paging, random-access responses, uplink
//! grants and data, and emits a bit-exact allocation descriptor for the PHY.

pub mod bc_sched;
pub mod carrier;
pub mod metric;
pub mod ra_sched;
pub mod sf_sched;
pub mod ue;

pub use carrier::CarrierSched;
pub use metric::{DlMetric, DlMetricRr, UlMetric, UlMetricRr};
pub use ra_sched::{PendingRar, RaSched};
pub use sf_sched::{AllocFailure, PendingMsg3, SfSched};
pub use ue::{SchedUe, UeDb, UlHarq};

use crate::rrc::RrcSchedInterface;
use crate::LayerError;
use async_trait::async_trait;
use common::mask::RbMask;
use common::types::{CellId, DuplexMode, Pci, Rnti, Tti};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

/// Subframes between receiving a TTI indication and the downlink
/// transmission it schedules
pub const FDD_TX_DELAY: u32 = 4;

/// Subframes between receiving a TTI indication and the uplink
/// transmission it grants
pub const FDD_UL_DELAY: u32 = 4;

/// Additional lead from a transmitted RAR to its Msg3 uplink grant
pub const MSG3_DELAY_MS: u32 = 6;

/// Number of subframe slots kept in flight. Must exceed
/// max(FDD_TX_DELAY, MSG3_DELAY_MS) + 1 so a slot is never re-bound
/// before the PHY consumes it or its pre-allocated Msg3s are drained.
pub const TTI_RING_LEN: usize = 10;

/// Maximum number of SIBs a cell can broadcast
pub const MAX_SIBS: usize = 8;

/// Maximum number of preambles that may share one RA-RNTI
pub const MAX_RAR_PER_RNTI: usize = 16;

/// Timing parameters of one scheduled TTI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtiParams {
    /// TTI indication received from the PHY
    pub tti_rx: Tti,
    /// TTI the downlink result is transmitted in
    pub tti_tx_dl: Tti,
    /// TTI the uplink grants apply to
    pub tti_tx_ul: Tti,
}

impl TtiParams {
    /// Derive the transmit TTIs for a received TTI indication
    pub fn new(tti_rx: Tti) -> Self {
        Self {
            tti_rx,
            tti_tx_dl: tti_rx.add(FDD_TX_DELAY),
            tti_tx_ul: tti_rx.add(FDD_UL_DELAY),
        }
    }

    /// Uplink TTI whose HARQ acknowledgement lands on this TTI
    pub fn tti_rx_ack(&self) -> Tti {
        self.tti_tx_ul.add(FDD_TX_DELAY)
    }
}

/// One entry of the cell's SIB table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SibCfg {
    /// SIB payload length in bytes; zero disables the entry
    pub len: u32,
    /// Broadcast period in radio frames
    pub period_rf: u32,
}

/// Cell configuration, read-only after carrier setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellCfg {
    pub cell_id: CellId,
    pub pci: Pci,
    pub duplex: DuplexMode,
    /// Downlink bandwidth in PRBs
    pub nof_prb_dl: u32,
    /// Uplink bandwidth in PRBs
    pub nof_prb_ul: u32,
    /// SIB table; index 0 is SIB1
    pub sibs: Vec<SibCfg>,
    /// System-information window length in subframes
    pub si_window_ms: u32,
    /// PRBs reserved for PUCCH at each band edge
    pub nrb_pucch: u32,
    /// FDD PRACH configuration index (TS 36.211 Table 5.7.1-2)
    pub prach_config: u32,
    /// First PRB of the 6-PRB PRACH region
    pub prach_freq_offset: u32,
    /// RAR window length in subframes
    pub prach_rar_window: u32,
}

impl CellCfg {
    /// Resource-block-group size for the downlink bandwidth
    /// (TS 36.213 Table 7.1.6.1-1)
    pub fn rbg_size(&self) -> u32 {
        match self.nof_prb_dl {
            0..=10 => 1,
            11..=26 => 2,
            27..=63 => 3,
            _ => 4,
        }
    }

    /// Number of resource-block groups in the downlink grid
    pub fn nof_rbgs(&self) -> usize {
        self.nof_prb_dl.div_ceil(self.rbg_size()) as usize
    }
}

/// Scheduler tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedCfg {
    /// CFI the PDCCH allocator starts from (1..=3)
    pub nof_ctrl_symbols: u32,
}

impl Default for SchedCfg {
    fn default() -> Self {
        Self {
            nof_ctrl_symbols: 2,
        }
    }
}

/// Per-carrier scheduler parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierParams {
    pub cell: CellCfg,
    pub sched: SchedCfg,
}

impl CarrierParams {
    /// Validate the configuration before the carrier scheduler is built
    pub fn validate(&self) -> Result<(), LayerError> {
        let cell = &self.cell;
        if cell.duplex != DuplexMode::Fdd {
            return Err(LayerError::InvalidConfiguration(
                "only FDD carriers are supported".into(),
            ));
        }
        if !(6..=100).contains(&cell.nof_prb_dl) || !(6..=100).contains(&cell.nof_prb_ul) {
            return Err(LayerError::InvalidConfiguration(format!(
                "invalid bandwidth: dl={} ul={} PRBs",
                cell.nof_prb_dl, cell.nof_prb_ul
            )));
        }
        if cell.sibs.len() > MAX_SIBS {
            return Err(LayerError::InvalidConfiguration(format!(
                "too many SIBs configured: {}",
                cell.sibs.len()
            )));
        }
        if cell.sibs.iter().any(|s| s.len > 0 && s.period_rf == 0) {
            return Err(LayerError::InvalidConfiguration(
                "configured SIB with zero period".into(),
            ));
        }
        if cell.si_window_ms == 0 {
            return Err(LayerError::InvalidConfiguration(
                "si_window_ms must be at least one subframe".into(),
            ));
        }
        if cell.prach_config > crate::phy::prach::MAX_PRACH_CONFIG_FDD {
            return Err(LayerError::InvalidConfiguration(format!(
                "unsupported PRACH configuration index {}",
                cell.prach_config
            )));
        }
        if cell.prach_freq_offset + 6 > cell.nof_prb_ul {
            return Err(LayerError::InvalidConfiguration(
                "PRACH region exceeds the uplink bandwidth".into(),
            ));
        }
        if 2 * cell.nrb_pucch >= cell.nof_prb_ul {
            return Err(LayerError::InvalidConfiguration(
                "PUCCH reservation leaves no PUSCH PRBs".into(),
            ));
        }
        if !(1..=3).contains(&self.sched.nof_ctrl_symbols) {
            return Err(LayerError::InvalidConfiguration(format!(
                "invalid number of control symbols: {}",
                self.sched.nof_ctrl_symbols
            )));
        }
        Ok(())
    }
}

/// PRACH detection report delivered by the PHY
#[derive(Debug, Clone, Copy)]
pub struct RarInfo {
    /// TTI the preamble was received in
    pub prach_tti: Tti,
    /// Detected preamble index
    pub preamble_idx: u32,
    /// Timing-advance command for the RAR
    pub ta_cmd: u32,
    /// Temporary C-RNTI assigned to the UE
    pub temp_crnti: Rnti,
    /// Msg3 size the UE will need, in bytes
    pub msg3_size: u32,
}

/// PHICH acknowledgement value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhichValue {
    Ack,
    Nack,
}

/// One PHICH element of the uplink result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhichElem {
    pub rnti: Rnti,
    pub value: PhichValue,
}

/// PDCCH position of a DCI. The aggregation index encodes L = 1 << aggr_idx
/// consecutive CCEs starting at `ncce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DciLocation {
    pub ncce: u32,
    pub aggr_idx: u32,
}

/// Broadcast transport carried by a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcType {
    /// System information, with the SIB index and retransmission number
    Bcch { sib_idx: usize, n_tx: u32 },
    /// Paging
    Pcch,
}

/// Broadcast grant (SIB or paging)
#[derive(Debug, Clone)]
pub struct BcGrant {
    pub bc_type: BcType,
    pub dci: DciLocation,
    pub rbg_mask: RbMask,
    pub tbs: u32,
}

/// One Msg3 grant inside a RAR
#[derive(Debug, Clone)]
pub struct RarMsg3Grant {
    /// The PRACH detection this grant answers
    pub data: RarInfo,
    /// Type-2 RIV of the Msg3 PRB allocation
    pub rba: u32,
    /// Truncated MCS signalled in the 20-bit UL grant
    pub trunc_mcs: u32,
}

/// Random-access response grant
#[derive(Debug, Clone)]
pub struct RarGrant {
    pub ra_rnti: Rnti,
    pub dci: DciLocation,
    pub rbg_mask: RbMask,
    pub tbs: u32,
    pub msg3_grants: Vec<RarMsg3Grant>,
    /// Packed MAC RAR PDU (TS 36.321 section 6.1.5)
    pub pdu: bytes::Bytes,
}

/// Downlink data grant for an attached UE
#[derive(Debug, Clone)]
pub struct DlDataGrant {
    pub rnti: Rnti,
    pub dci: DciLocation,
    pub rbg_mask: RbMask,
    pub tbs: u32,
}

/// Uplink grant class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlAllocKind {
    /// First uplink transmission after random access; granted by the RAR,
    /// no PDCCH needed
    Msg3,
    /// New transmission, signalled with a DCI format 0
    NewTx,
    /// Non-adaptive HARQ retransmission, signalled on PHICH only
    Retx,
}

/// PUSCH grant of the uplink result
#[derive(Debug, Clone)]
pub struct UlGrant {
    pub rnti: Rnti,
    pub kind: UlAllocKind,
    pub prb_start: u32,
    pub nof_prb: u32,
    /// Type-2 RIV of the PRB range
    pub rba: u32,
    pub mcs: u32,
    pub tbs: u32,
    /// PDCCH position when the grant needs a DCI format 0
    pub dci: Option<DciLocation>,
}

/// Downlink allocation descriptor for one TTI, consumed by the PHY
#[derive(Debug, Clone, Default)]
pub struct DlSchedResult {
    pub cfi: u32,
    pub bc: Vec<BcGrant>,
    pub rar: Vec<RarGrant>,
    pub data: Vec<DlDataGrant>,
}

/// Uplink allocation descriptor for one TTI, consumed by the PHY
#[derive(Debug, Clone, Default)]
pub struct UlSchedResult {
    pub phich: Vec<PhichElem>,
    pub pusch: Vec<UlGrant>,
    /// True when the TTI carries a PRACH occasion and its PRBs are reserved
    pub prach: bool,
}

/// Snapshot of one generated TTI, returned to the caller
#[derive(Debug, Clone)]
pub struct TtiResult {
    pub tti_params: TtiParams,
    pub dl: DlSchedResult,
    pub ul: UlSchedResult,
    /// Final downlink RBG occupancy
    pub dl_mask: RbMask,
    /// Final uplink PRB occupancy
    pub ul_mask: RbMask,
}

/// Scheduler operation errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    #[error("RACH buffer full for ra_rnti=0x{0:x}")]
    RachBufferFull(Rnti),

    #[error("unknown rnti=0x{0:x}")]
    UnknownRnti(Rnti),
}

impl From<SchedError> for LayerError {
    fn from(err: SchedError) -> Self {
        match err {
            SchedError::RachBufferFull(_) => LayerError::ResourceUnavailable,
            SchedError::UnknownRnti(rnti) => {
                LayerError::InvalidState(format!("unknown rnti=0x{:x}", rnti))
            }
        }
    }
}

/// MAC-PHY interface of the scheduler
#[async_trait]
pub trait SchedPhyInterface: Send + Sync {
    /// Produce (or return the memoised) allocation result for a TTI
    async fn get_tti_result(&self, tti_rx: Tti) -> Result<TtiResult, LayerError>;

    /// Report a PRACH detection from the PHY
    async fn report_prach(&self, info: RarInfo) -> Result<(), LayerError>;
}

/// MAC scheduler front: owns the carrier scheduler and the shared UE
/// database, and exposes the control-plane operations RRC and the MAC
/// data path use.
pub struct MacSched {
    carrier: CarrierSched,
    ue_db: Arc<RwLock<UeDb>>,
}

impl MacSched {
    /// Build a scheduler for one carrier
    pub fn new(
        params: CarrierParams,
        rrc: Arc<dyn RrcSchedInterface>,
    ) -> Result<Self, LayerError> {
        let ue_db = Arc::new(RwLock::new(UeDb::new()));
        let carrier = CarrierSched::new(params, rrc, ue_db.clone(), 0)?;
        info!("MAC scheduler initialized");
        Ok(Self { carrier, ue_db })
    }

    /// Attach a UE to the carrier (or reset its scheduler state)
    pub fn ue_cfg(&self, rnti: Rnti) {
        let mut ue_db = write_lock(&self.ue_db);
        ue_db.insert(rnti, SchedUe::new(rnti, vec![0]));
        info!("Configured UE rnti=0x{:x}", rnti);
    }

    /// Detach a UE
    pub fn ue_rem(&self, rnti: Rnti) {
        let mut ue_db = write_lock(&self.ue_db);
        if ue_db.remove(&rnti).is_none() {
            warn!("Removing unknown UE rnti=0x{:x}", rnti);
        }
    }

    /// Update the downlink buffer state for a UE
    pub fn dl_buffer_state(&self, rnti: Rnti, bytes: u32) -> Result<(), SchedError> {
        let mut ue_db = write_lock(&self.ue_db);
        let ue = ue_db.get_mut(&rnti).ok_or(SchedError::UnknownRnti(rnti))?;
        ue.dl_buffer_state(bytes);
        Ok(())
    }

    /// Process an uplink buffer status report
    pub fn ul_bsr(&self, rnti: Rnti, bytes: u32) -> Result<(), SchedError> {
        let mut ue_db = write_lock(&self.ue_db);
        let ue = ue_db.get_mut(&rnti).ok_or(SchedError::UnknownRnti(rnti))?;
        ue.ul_bsr(bytes);
        Ok(())
    }

    /// Report the decode outcome of an uplink transmission; feeds PHICH
    pub fn ul_crc_info(&self, tti: Tti, rnti: Rnti, ok: bool) -> Result<(), SchedError> {
        let mut ue_db = write_lock(&self.ue_db);
        let ue = ue_db.get_mut(&rnti).ok_or(SchedError::UnknownRnti(rnti))?;
        ue.set_ul_crc(tti, ok);
        Ok(())
    }

    /// Forward a PRACH detection to the random-access scheduler
    pub fn dl_rach_info(&self, info: RarInfo) -> Result<(), SchedError> {
        self.carrier.dl_rach_info(info)
    }

    /// Replace the downlink blackout vector
    pub fn set_dl_tti_mask(&self, mask: &[u8]) {
        self.carrier.set_dl_tti_mask(mask);
    }

    /// Run the carrier scheduler for one TTI
    pub fn generate_tti_result(&self, tti_rx: Tti) -> TtiResult {
        self.carrier.generate_tti_result(tti_rx)
    }

    /// Clear broadcast and random-access state
    pub fn reset(&self) {
        self.carrier.reset();
    }
}

#[async_trait]
impl SchedPhyInterface for MacSched {
    async fn get_tti_result(&self, tti_rx: Tti) -> Result<TtiResult, LayerError> {
        Ok(self.carrier.generate_tti_result(tti_rx))
    }

    async fn report_prach(&self, info: RarInfo) -> Result<(), LayerError> {
        self.carrier.dl_rach_info(info)?;
        Ok(())
    }
}

/// Acquire a write lock, recovering the guard if a holder panicked
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rrc::NoPaging;
    use common::types::Bandwidth;

    pub(crate) fn test_cell_cfg() -> CellCfg {
        CellCfg {
            cell_id: CellId(1),
            pci: Pci(1),
            duplex: DuplexMode::Fdd,
            nof_prb_dl: Bandwidth::Bw5.nof_prb(),
            nof_prb_ul: Bandwidth::Bw5.nof_prb(),
            sibs: vec![
                SibCfg { len: 18, period_rf: 8 },
                SibCfg { len: 41, period_rf: 16 },
            ],
            si_window_ms: 40,
            nrb_pucch: 2,
            prach_config: 3,
            prach_freq_offset: 4,
            prach_rar_window: 10,
        }
    }

    pub(crate) fn test_params() -> CarrierParams {
        CarrierParams {
            cell: test_cell_cfg(),
            sched: SchedCfg::default(),
        }
    }

    #[test]
    fn test_params_validation() {
        assert!(test_params().validate().is_ok());

        let mut bad = test_params();
        bad.cell.duplex = DuplexMode::Tdd;
        assert!(bad.validate().is_err());

        let mut bad = test_params();
        bad.cell.prach_freq_offset = 22;
        assert!(bad.validate().is_err());

        let mut bad = test_params();
        bad.cell.nrb_pucch = 13;
        assert!(bad.validate().is_err());

        let mut bad = test_params();
        bad.sched.nof_ctrl_symbols = 4;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_tti_params_delays() {
        let params = TtiParams::new(Tti::new(100));
        assert_eq!(params.tti_tx_dl.value(), 104);
        assert_eq!(params.tti_tx_ul.value(), 104);
        assert_eq!(params.tti_rx_ack().value(), 108);
    }

    #[tokio::test]
    async fn test_phy_interface() {
        let mac = MacSched::new(test_params(), Arc::new(NoPaging)).unwrap();

        let result = mac.get_tti_result(Tti::new(0)).await.unwrap();
        assert_eq!(result.tti_params.tti_rx.value(), 0);
        assert_eq!(result.tti_params.tti_tx_dl.value(), 4);

        let info = RarInfo {
            prach_tti: Tti::new(1),
            preamble_idx: 7,
            ta_cmd: 12,
            temp_crnti: Rnti(0x46),
            msg3_size: 7,
        };
        mac.report_prach(info).await.unwrap();
    }
}
