//! Common Types for the LTE eNodeB
//!
//! Defines fundamental types used throughout the protocol stack

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl std::fmt::LowerHex for Rnti {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-503 for LTE)
    pub const MAX: u16 = 503;

    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }
}

/// Transmission time interval counter.
///
/// A TTI is one 1 ms subframe. The counter wraps at 10240 (1024 radio
/// frames of 10 subframes), so all arithmetic is modular.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tti(u32);

impl Tti {
    /// Number of TTIs before the counter wraps (1024 SFNs x 10 subframes)
    pub const PERIOD: u32 = 10240;

    /// Create a TTI, reducing the value modulo the wrap period
    pub fn new(value: u32) -> Self {
        Self(value % Self::PERIOD)
    }

    /// Get the raw counter value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// System frame number this TTI falls in (0..1024)
    pub fn sfn(&self) -> u32 {
        self.0 / 10
    }

    /// Subframe index within the radio frame (0..10)
    pub fn sf_idx(&self) -> u32 {
        self.0 % 10
    }

    /// Advance by a number of subframes, wrapping at the period
    pub fn add(self, subframes: u32) -> Self {
        Self::new(self.0 + subframes)
    }

    /// Number of subframes elapsed since `earlier`, assuming `earlier`
    /// is in the past (modular distance, 0..PERIOD)
    pub fn since(self, earlier: Tti) -> u32 {
        (self.0 + Self::PERIOD - earlier.0) % Self::PERIOD
    }
}

impl std::fmt::Display for Tti {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel bandwidth options for LTE carriers.
///
/// Discriminants are the bandwidth in units of 100 kHz so the enum can be
/// mapped from numeric configuration values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
pub enum Bandwidth {
    /// 1.4 MHz
    Bw1_4 = 14,
    /// 3 MHz
    Bw3 = 30,
    /// 5 MHz
    Bw5 = 50,
    /// 10 MHz
    Bw10 = 100,
    /// 15 MHz
    Bw15 = 150,
    /// 20 MHz
    Bw20 = 200,
}

impl Bandwidth {
    /// Get bandwidth in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            Bandwidth::Bw1_4 => 1_400_000,
            Bandwidth::Bw3 => 3_000_000,
            Bandwidth::Bw5 => 5_000_000,
            Bandwidth::Bw10 => 10_000_000,
            Bandwidth::Bw15 => 15_000_000,
            Bandwidth::Bw20 => 20_000_000,
        }
    }

    /// Number of physical resource blocks in this bandwidth
    pub fn nof_prb(&self) -> u32 {
        match self {
            Bandwidth::Bw1_4 => 6,
            Bandwidth::Bw3 => 15,
            Bandwidth::Bw5 => 25,
            Bandwidth::Bw10 => 50,
            Bandwidth::Bw15 => 75,
            Bandwidth::Bw20 => 100,
        }
    }
}

/// Duplex mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplexMode {
    /// Frequency Division Duplex
    Fdd,
    /// Time Division Duplex
    Tdd,
}
