//! Ad-platform seam for server-side conversion delivery.
//!
//! The pipeline never knows which network it is talking to: every platform
//! client implements [`PlatformService`] and is looked up through the
//! [`PlatformRegistry`] by its [`Platform`] key.

pub mod error;
pub mod registry;
pub mod service;
pub mod types;

pub use error::RegistryError;
pub use registry::PlatformRegistry;
pub use service::PlatformService;
pub use types::{
    ConversionData, CredentialValidation, Credentials, LineItem, Platform, PlatformError,
    PlatformErrorKind, SendResult,
};
