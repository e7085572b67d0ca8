//! Vendor ownership of task nodes
//!
//! Every task node may carry a `vendor` GUID. Nodes tagged with a GUID that is
//! neither the standard vocabulary nor the scanner's own are foreign and get
//! skipped during negotiation.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// GUID of the standard TWAIN Direct vocabulary
pub const TWAIN_DIRECT_VENDOR: Uuid = Uuid::from_u128(0x211a1e90_11e1_11e5_9493_1697f925ec7b);

/// Who a task node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Owner {
    /// Standard vocabulary (no vendor, or the TWAIN Direct GUID)
    Standard,
    /// The scanner we are talking to
    Scanner,
    /// Some other vendor, or a GUID we could not parse
    Foreign,
}

impl Owner {
    pub fn is_foreign(self) -> bool {
        matches!(self, Owner::Foreign)
    }
}

/// Identity of the active scanner vendor, used to classify vendor tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorIdentity {
    scanner: Uuid,
}

impl VendorIdentity {
    pub fn new(scanner: Uuid) -> Self {
        Self { scanner }
    }

    pub fn scanner(&self) -> Uuid {
        self.scanner
    }

    /// Classify a raw vendor tag
    pub fn owner_of(&self, tag: Option<&str>) -> Owner {
        let tag = match tag.map(str::trim) {
            None | Some("") => return Owner::Standard,
            Some(tag) => tag,
        };

        match Uuid::parse_str(tag) {
            Ok(guid) if guid == TWAIN_DIRECT_VENDOR => Owner::Standard,
            Ok(guid) if guid == self.scanner => Owner::Scanner,
            Ok(_) => Owner::Foreign,
            Err(e) => {
                debug!(vendor = tag, error = %e, "Unparseable vendor GUID, treating as foreign");
                Owner::Foreign
            }
        }
    }
}

impl Default for VendorIdentity {
    fn default() -> Self {
        Self::new(Uuid::nil())
    }
}
