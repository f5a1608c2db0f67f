use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RegistryError;

/// Ad platforms that can receive server-side conversions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Meta,
    Google,
    Tiktok,
    Pinterest,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Meta,
        Platform::Google,
        Platform::Tiktok,
        Platform::Pinterest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Meta => "meta",
            Platform::Google => "google",
            Platform::Tiktok => "tiktok",
            Platform::Pinterest => "pinterest",
        }
    }

    /// Whether the platform is an advertising (marketing) destination by default.
    ///
    /// Google receives purchase events as analytics unless the shop opts to
    /// treat it as marketing.
    pub fn is_marketing(&self) -> bool {
        !matches!(self, Platform::Google)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meta" | "facebook" => Ok(Platform::Meta),
            "google" => Ok(Platform::Google),
            "tiktok" => Ok(Platform::Tiktok),
            "pinterest" => Ok(Platform::Pinterest),
            other => Err(RegistryError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Decrypted platform credentials.
///
/// The shape is platform specific, so it stays opaque JSON. `Debug` never
/// prints the contents.
#[derive(Clone)]
pub struct Credentials(Value);

impl Credentials {
    pub fn new(raw: Value) -> Self {
        Self(raw)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    #[serde(default)]
    pub variant_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub quantity: u32,
    pub price: f64,
}

/// Platform-agnostic purchase payload. Carries no personal data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionData {
    pub order_id: String,
    pub order_number: Option<String>,
    pub value: f64,
    pub currency: String,
    pub line_items: Vec<LineItem>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformErrorKind {
    InvalidCredentials,
    RateLimited,
    Validation,
    Network,
    Server,
    Unknown,
}

/// Normalized failure reported by a platform client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformError {
    #[serde(rename = "type")]
    pub kind: PlatformErrorKind,
    pub message: String,
    pub is_retryable: bool,
    /// Seconds the platform asked us to wait, when it said so.
    #[serde(default)]
    pub retry_after: Option<u64>,
}

impl PlatformError {
    pub fn new(kind: PlatformErrorKind, message: impl Into<String>, is_retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            is_retryable,
            retry_after: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<PlatformError>,
}

impl SendResult {
    pub fn sent(response: Option<Value>) -> Self {
        Self {
            success: true,
            response,
            error: None,
        }
    }

    pub fn failed(error: PlatformError) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl CredentialValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}
