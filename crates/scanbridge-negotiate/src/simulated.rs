//! Simulated scanner capability model
//!
//! Stands in for a native driver bridge. The profile decides which surfaces
//! and settings exist; anything outside it is rejected the way a real driver
//! would reject it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::capability::{CapValue, Capability, CapabilityDevice, CapabilityError};
use crate::mapping::{compression, pixel_type};

/// What the simulated hardware supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub feeder: bool,
    pub flatbed: bool,
    pub duplex: bool,
    pub automatic_sense_medium: bool,
    /// Paper is sitting in the feeder
    pub feeder_loaded: bool,
    pub pixel_formats: Vec<String>,
    pub resolutions: Vec<u32>,
    pub compressions: Vec<String>,
    pub autocrop: bool,
    pub autodeskew: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            feeder: true,
            flatbed: true,
            duplex: true,
            automatic_sense_medium: false,
            feeder_loaded: true,
            pixel_formats: vec!["bw1".to_string(), "gray8".to_string(), "rgb24".to_string()],
            resolutions: vec![100, 150, 200, 300, 600],
            compressions: vec!["none".to_string(), "group4".to_string(), "jpeg".to_string()],
            autocrop: true,
            autodeskew: true,
        }
    }
}

#[derive(Debug, Clone)]
enum Allowed {
    Values(Vec<CapValue>),
    Range(CapValue, CapValue),
    ReadOnly,
}

impl Allowed {
    fn permits(&self, value: CapValue) -> bool {
        match self {
            Allowed::Values(values) => values.contains(&value),
            Allowed::Range(lo, hi) => (*lo..=*hi).contains(&value),
            Allowed::ReadOnly => false,
        }
    }
}

/// One `set` call, kept for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetAttempt {
    pub cap: Capability,
    pub value: CapValue,
    pub accepted: bool,
}

/// In-memory capability device driven by a [`DeviceProfile`]
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    profile: DeviceProfile,
    allowed: HashMap<Capability, Allowed>,
    defaults: HashMap<Capability, CapValue>,
    current: HashMap<Capability, CapValue>,
    attempts: Vec<SetAttempt>,
}

impl SimulatedDevice {
    pub fn new(profile: DeviceProfile) -> Self {
        let mut allowed = HashMap::new();
        let mut defaults = HashMap::new();

        let mut surfaces = Vec::new();
        if profile.feeder {
            surfaces.push(1);
        }
        if profile.flatbed {
            surfaces.push(0);
        }
        defaults.insert(Capability::FeederEnabled, if profile.feeder { 1 } else { 0 });
        allowed.insert(Capability::FeederEnabled, Allowed::Values(surfaces));

        let duplex = if profile.duplex && profile.feeder { vec![0, 1] } else { vec![0] };
        allowed.insert(Capability::DuplexEnabled, Allowed::Values(duplex));
        defaults.insert(Capability::DuplexEnabled, 0);

        if profile.automatic_sense_medium {
            allowed.insert(Capability::AutomaticSenseMedium, Allowed::Values(vec![0, 1]));
            defaults.insert(Capability::AutomaticSenseMedium, 0);
        }

        allowed.insert(Capability::FeederLoaded, Allowed::ReadOnly);
        defaults.insert(
            Capability::FeederLoaded,
            CapValue::from(profile.feeder && profile.feeder_loaded),
        );

        let pixel_types: Vec<CapValue> =
            profile.pixel_formats.iter().filter_map(|n| pixel_type(n)).collect();
        if let Some(&default) = pixel_types.last() {
            defaults.insert(Capability::PixelType, default);
        }
        allowed.insert(Capability::PixelType, Allowed::Values(pixel_types));

        let resolutions: Vec<CapValue> = profile
            .resolutions
            .iter()
            .filter_map(|r| CapValue::try_from(*r).ok())
            .collect();
        let default_resolution = if resolutions.contains(&200) {
            Some(200)
        } else {
            resolutions.first().copied()
        };
        for cap in [Capability::XResolution, Capability::YResolution] {
            allowed.insert(cap, Allowed::Values(resolutions.clone()));
            if let Some(default) = default_resolution {
                defaults.insert(cap, default);
            }
        }

        let compressions: Vec<CapValue> =
            profile.compressions.iter().filter_map(|n| compression(n)).collect();
        if let Some(&default) = compressions.first() {
            defaults.insert(Capability::Compression, default);
        }
        allowed.insert(Capability::Compression, Allowed::Values(compressions));

        allowed.insert(Capability::XferCount, Allowed::Range(-1, i32::from(i16::MAX)));
        defaults.insert(Capability::XferCount, -1);

        for (cap, supported) in [
            (Capability::AutomaticBorderDetection, profile.autocrop),
            (Capability::AutomaticDeskew, profile.autodeskew),
        ] {
            if supported {
                allowed.insert(cap, Allowed::Values(vec![0, 1]));
                defaults.insert(cap, 0);
            }
        }

        for cap in [Capability::Brightness, Capability::Contrast] {
            allowed.insert(cap, Allowed::Range(-1000, 1000));
            defaults.insert(cap, 0);
        }

        Self {
            profile,
            current: defaults.clone(),
            allowed,
            defaults,
            attempts: Vec::new(),
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Every `set` call since the last [`clear_attempts`](Self::clear_attempts)
    pub fn attempts(&self) -> &[SetAttempt] {
        &self.attempts
    }

    pub fn clear_attempts(&mut self) {
        self.attempts.clear();
    }

    /// Simulate loading or emptying the feeder
    pub fn set_feeder_loaded(&mut self, loaded: bool) {
        self.current
            .insert(Capability::FeederLoaded, CapValue::from(loaded));
    }
}

impl CapabilityDevice for SimulatedDevice {
    fn is_supported(&self, cap: Capability) -> bool {
        self.allowed.contains_key(&cap)
    }

    fn get(&self, cap: Capability) -> Option<CapValue> {
        self.current.get(&cap).copied()
    }

    fn set(&mut self, cap: Capability, value: CapValue) -> Result<(), CapabilityError> {
        let result = match self.allowed.get(&cap) {
            None => Err(CapabilityError::Unsupported(cap)),
            Some(Allowed::ReadOnly) => Err(CapabilityError::ReadOnly(cap)),
            Some(allowed) if allowed.permits(value) => Ok(()),
            Some(_) => Err(CapabilityError::Rejected { cap, value }),
        };

        self.attempts.push(SetAttempt {
            cap,
            value,
            accepted: result.is_ok(),
        });

        match &result {
            Ok(()) => {
                trace!(cap = %cap, value = value, "Capability set");
                self.current.insert(cap, value);
            }
            Err(e) => trace!(cap = %cap, value = value, error = %e, "Capability rejected"),
        }
        result
    }

    fn reset_all(&mut self) {
        debug!("Resetting all capabilities");
        let loaded = self.current.get(&Capability::FeederLoaded).copied();
        self.current = self.defaults.clone();
        // Paper in the feeder is physical state, not a setting
        if let Some(loaded) = loaded {
            self.current.insert(Capability::FeederLoaded, loaded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_limits() {
        let mut device = SimulatedDevice::new(DeviceProfile {
            feeder: false,
            ..DeviceProfile::default()
        });

        assert!(device.set(Capability::FeederEnabled, 0).is_ok());
        assert!(matches!(
            device.set(Capability::FeederEnabled, 1),
            Err(CapabilityError::Rejected { .. })
        ));
        assert!(device.set(Capability::DuplexEnabled, 1).is_err());
        assert!(matches!(
            device.set(Capability::AutomaticSenseMedium, 1),
            Err(CapabilityError::Unsupported(_))
        ));
        assert!(matches!(
            device.set(Capability::FeederLoaded, 1),
            Err(CapabilityError::ReadOnly(_))
        ));
        assert_eq!(device.get(Capability::FeederLoaded), Some(0));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut device = SimulatedDevice::new(DeviceProfile::default());
        device.set(Capability::XResolution, 600).unwrap();
        device.set(Capability::PixelType, 0).unwrap();
        device.set_feeder_loaded(false);

        device.reset_all();
        assert_eq!(device.get(Capability::XResolution), Some(200));
        assert_eq!(device.get(Capability::PixelType), Some(2));
        assert_eq!(device.get(Capability::FeederLoaded), Some(0));
        assert_eq!(device.attempts().len(), 2);
    }
}
