use platforms::Credentials;

use crate::jobs::model::PixelConfig;

/// Turns a pixel config's stored ciphertext into usable credentials.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, config: &PixelConfig) -> anyhow::Result<Credentials>;
}
