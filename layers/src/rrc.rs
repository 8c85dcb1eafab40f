//! Radio Resource Control (RRC) Interface
//!
//! Implements the RRC-facing seam of the MAC scheduler according to 3GPP TS 36.331.
//! The scheduler only consults RRC for paging occasions; paging record
//! assembly itself lives in the RRC entity.

use common::types::Tti;

/// Interface the MAC scheduler uses to query the RRC entity.
///
/// Implementations must be non-blocking and side-effect free: the query
/// runs inside the real-time scheduling path once per TTI.
pub trait RrcSchedInterface: Send + Sync {
    /// Returns the paging payload size in bytes if a paging record is due
    /// at `tti`
    fn is_paging_opportunity(&self, tti: Tti) -> Option<u32>;
}

/// Null RRC: no paging load. Used by cells without paging configuration
/// and as a test stand-in.
pub struct NoPaging;

impl RrcSchedInterface for NoPaging {
    fn is_paging_opportunity(&self, _tti: Tti) -> Option<u32> {
        None
    }
}
