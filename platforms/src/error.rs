use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("no service registered for platform {0}")]
    NotRegistered(String),
}
