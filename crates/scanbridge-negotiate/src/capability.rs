//! Device capability model
//!
//! Negotiation talks to hardware only through [`CapabilityDevice`]: set a
//! capability, read it back, reset everything.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Native value of a capability
pub type CapValue = i32;

/// Stand-in for task values with no native mapping; no device accepts it
pub const INVALID_VALUE: CapValue = -999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AutomaticSenseMedium,
    DuplexEnabled,
    FeederEnabled,
    /// Read-only: paper present in the feeder
    FeederLoaded,
    PixelType,
    XResolution,
    YResolution,
    Compression,
    XferCount,
    AutomaticBorderDetection,
    AutomaticDeskew,
    Brightness,
    Contrast,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::AutomaticSenseMedium => "CAP_AUTOMATICSENSEMEDIUM",
            Capability::DuplexEnabled => "CAP_DUPLEXENABLED",
            Capability::FeederEnabled => "CAP_FEEDERENABLED",
            Capability::FeederLoaded => "CAP_FEEDERLOADED",
            Capability::PixelType => "ICAP_PIXELTYPE",
            Capability::XResolution => "ICAP_XRESOLUTION",
            Capability::YResolution => "ICAP_YRESOLUTION",
            Capability::Compression => "ICAP_COMPRESSION",
            Capability::XferCount => "CAP_XFERCOUNT",
            Capability::AutomaticBorderDetection => "ICAP_AUTOMATICBORDERDETECTION",
            Capability::AutomaticDeskew => "ICAP_AUTOMATICDESKEW",
            Capability::Brightness => "ICAP_BRIGHTNESS",
            Capability::Contrast => "ICAP_CONTRAST",
        }
    }

    /// Setting that must follow this one on devices with coupled axes
    pub fn companion(self) -> Option<Capability> {
        match self {
            Capability::XResolution => Some(Capability::YResolution),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Capability {0} is not supported")]
    Unsupported(Capability),
    #[error("Capability {0} is read-only")]
    ReadOnly(Capability),
    #[error("Capability {cap} rejected value {value}")]
    Rejected { cap: Capability, value: CapValue },
}

/// Seam to a scanner's native capability model
pub trait CapabilityDevice {
    fn is_supported(&self, cap: Capability) -> bool;

    /// Current value, if the capability is supported
    fn get(&self, cap: Capability) -> Option<CapValue>;

    fn set(&mut self, cap: Capability, value: CapValue) -> Result<(), CapabilityError>;

    /// Return every capability to its power-on default
    fn reset_all(&mut self);
}
