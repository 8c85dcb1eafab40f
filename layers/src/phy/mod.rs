//! Physical Layer (PHY) Procedure Helpers
//!
//! This module contains the LTE physical-layer lookups the MAC scheduler
//! depends on, according to 3GPP TS 36.211 and TS 36.213.

pub mod prach;
pub mod ra;

// Re-export commonly used items
pub use prach::prach_tti_opportunity_fdd;
pub use ra::{type2_from_riv, type2_to_riv};
