//! Scanbridge Negotiate - turns tasks into scanner capability settings
//!
//! Provides:
//! - A capability model and the [`CapabilityDevice`] seam to hardware
//! - A simulated device for tests and the in-process scanner
//! - Candidate resolution with per-node failure policy
//! - Stream / source / pixel format selection and action dispatch

pub mod capability;
pub mod engine;
pub mod mapping;
pub mod resolver;
pub mod selector;
pub mod simulated;

pub use capability::{CapValue, Capability, CapabilityDevice, CapabilityError};
pub use engine::{NegotiationEngine, TaskFailure, TaskOutcome};
pub use resolver::{resolve, Candidate, Resolution};
pub use selector::{select_stream, Negotiated, Selection};
pub use simulated::{DeviceProfile, SimulatedDevice};
