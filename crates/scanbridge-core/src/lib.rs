//! Scanbridge Core - task model, session bookkeeping and error taxonomy
//!
//! This crate provides the foundational types for scanbridge:
//! - Task tree parsing with vendor ownership and exception inheritance
//! - Typed task replies reflecting what the device accepted
//! - Facility-tagged error taxonomy
//! - Session state machine and image-block bookkeeping
//! - Image-block metadata and the file-backed block store

pub mod error;
pub mod metadata;
pub mod reply;
pub mod session;
pub mod store;
pub mod task;
pub mod vendor;

pub use error::{ApiError, ApiStatus, Facility, SessionError, TaskError};
pub use metadata::{ImageAddress, ImageBlockMetadata, ImageInfo, ImageSource, MoreParts};
pub use reply::TaskReply;
pub use session::{Detected, DeviceStatus, Session, SessionSnapshot, SessionState};
pub use store::{ImageBlockStore, StoreError};
pub use task::{Exception, Task, TaskBuilder};
pub use vendor::{Owner, VendorIdentity, TWAIN_DIRECT_VENDOR};
