use async_trait::async_trait;
use serde_json::Value;

use crate::types::{ConversionData, CredentialValidation, Credentials, Platform, SendResult};

/// Uniform interface over one ad platform's conversions API.
///
/// Implementations own their HTTP client, payload mapping and timeouts.
/// A business failure (rejected event, bad token) is an `Ok(SendResult)` with
/// `success == false`; `Err` is reserved for failures the client could not
/// classify at all.
#[async_trait]
pub trait PlatformService: Send + Sync + 'static {
    fn platform(&self) -> Platform;

    async fn send_conversion(
        &self,
        credentials: &Credentials,
        data: &ConversionData,
        event_id: &str,
    ) -> anyhow::Result<SendResult>;

    fn validate_credentials(&self, raw: &Value) -> CredentialValidation;
}
