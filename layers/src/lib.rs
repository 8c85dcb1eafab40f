//! Protocol Stack Layers Library
//!
//! This crate implements the LTE eNodeB stack layers according to 3GPP Release 10:
//! the per-carrier MAC scheduler and the PHY procedure helpers it relies on.

pub mod mac;
pub mod phy;
pub mod rrc;

use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource unavailable")]
    ResourceUnavailable,
}
