//! Uplink Resource Allocation Type 2
//!
//! Encodes and decodes the resource indication value (RIV) that compacts
//! a contiguous PRB range into a single field, according to 3GPP TS 36.213
//! section 8.1. RAR grants carry RIVs produced here; the Msg3 scheduler
//! decodes them with the matching routine.

/// Encode a contiguous allocation of `l_crb` PRBs starting at `rb_start`
/// into a RIV for a carrier of `nof_prb` PRBs.
///
/// `l_crb` must be at least 1 and the range must fit the carrier.
pub fn type2_to_riv(l_crb: u32, rb_start: u32, nof_prb: u32) -> u32 {
    debug_assert!(l_crb >= 1 && rb_start + l_crb <= nof_prb);
    if (l_crb - 1) <= nof_prb / 2 {
        nof_prb * (l_crb - 1) + rb_start
    } else {
        nof_prb * (nof_prb - l_crb + 1) + (nof_prb - 1 - rb_start)
    }
}

/// Decode a RIV into `(l_crb, rb_start)` for a carrier of `nof_prb` PRBs
pub fn type2_from_riv(riv: u32, nof_prb: u32) -> (u32, u32) {
    let mut l_crb = riv / nof_prb + 1;
    let mut rb_start = riv % nof_prb;
    if l_crb + rb_start > nof_prb {
        l_crb = nof_prb - l_crb + 2;
        rb_start = nof_prb - 1 - rb_start;
    }
    (l_crb, rb_start)
}
