//! PRACH (Physical Random Access Channel) Occasion Lookup
//!
//! Implements the FDD PRACH occasion pattern according to 3GPP TS 36.211
//! Table 5.7.1-2. The MAC scheduler uses it to reserve uplink PRBs on
//! PRACH subframes and to keep narrow-band downlink off colliding TTIs.

use common::types::Tti;

/// Highest preamble-format-0 FDD configuration index covered by the table
pub const MAX_PRACH_CONFIG_FDD: u32 = 15;

/// System-frame constraint of a PRACH configuration
#[derive(Debug, Clone, Copy, PartialEq)]
enum SfnPattern {
    Any,
    Even,
}

/// One row of TS 36.211 Table 5.7.1-2 (preamble format 0)
struct PrachConfigRow {
    sfn: SfnPattern,
    subframes: &'static [u32],
}

/// PRACH configuration rows for FDD, indices 0..=15
fn prach_config_fdd(config_idx: u32) -> Option<PrachConfigRow> {
    let row = match config_idx {
        0 => PrachConfigRow { sfn: SfnPattern::Even, subframes: &[1] },
        1 => PrachConfigRow { sfn: SfnPattern::Even, subframes: &[4] },
        2 => PrachConfigRow { sfn: SfnPattern::Even, subframes: &[7] },
        3 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[1] },
        4 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[4] },
        5 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[7] },
        6 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[1, 6] },
        7 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[2, 7] },
        8 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[3, 8] },
        9 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[1, 4, 7] },
        10 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[2, 5, 8] },
        11 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[3, 6, 9] },
        12 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[0, 2, 4, 6, 8] },
        13 => PrachConfigRow { sfn: SfnPattern::Any, subframes: &[1, 3, 5, 7, 9] },
        14 => PrachConfigRow {
            sfn: SfnPattern::Any,
            subframes: &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
        },
        15 => PrachConfigRow { sfn: SfnPattern::Even, subframes: &[9] },
        _ => return None,
    };
    Some(row)
}

/// Check whether `tti` carries a PRACH occasion for the given FDD
/// configuration index. Unknown indices never match.
pub fn prach_tti_opportunity_fdd(config_idx: u32, tti: Tti) -> bool {
    let Some(row) = prach_config_fdd(config_idx) else {
        return false;
    };
    if row.sfn == SfnPattern::Even && tti.sfn() % 2 != 0 {
        return false;
    }
    row.subframes.contains(&tti.sf_idx())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_sfn_configs() {
        // Config 0: even SFN, subframe 1
        assert!(prach_tti_opportunity_fdd(0, Tti::new(1)));
        assert!(!prach_tti_opportunity_fdd(0, Tti::new(11)));
        assert!(prach_tti_opportunity_fdd(0, Tti::new(21)));
        assert!(!prach_tti_opportunity_fdd(0, Tti::new(2)));
    }

    #[test]
    fn test_every_frame_configs() {
        // Config 3: every SFN, subframe 1
        assert!(prach_tti_opportunity_fdd(3, Tti::new(1)));
        assert!(prach_tti_opportunity_fdd(3, Tti::new(11)));
        assert!(!prach_tti_opportunity_fdd(3, Tti::new(12)));

        // Config 12: every even subframe
        for sf in [0u32, 2, 4, 6, 8] {
            assert!(prach_tti_opportunity_fdd(12, Tti::new(30 + sf)));
        }
        assert!(!prach_tti_opportunity_fdd(12, Tti::new(33)));
    }

    #[test]
    fn test_unknown_config_never_matches() {
        assert!(!prach_tti_opportunity_fdd(16, Tti::new(1)));
        assert!(!prach_tti_opportunity_fdd(63, Tti::new(9)));
    }
}
