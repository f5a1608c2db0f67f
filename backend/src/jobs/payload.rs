//! Typed schemas for the JSON columns on `conversion_jobs`.
//!
//! Each struct keeps unrecognised keys in `extra` so a row written by a newer
//! deploy round-trips through this worker without losing data.

use platforms::LineItem;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collaborators::trust::{ConsentState, ConsentStrategy, TrustLevel};

pub const DEFAULT_EVENT_TYPE: &str = "purchase";

/// Order payload captured at ingestion time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapiInput {
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub checkout_token: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub event_time_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CapiInput {
    pub fn event_type(&self) -> &str {
        self.event_type.as_deref().unwrap_or(DEFAULT_EVENT_TYPE)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustMetadata {
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub receipt_matched: bool,
    #[serde(default)]
    pub receipt_event_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Audit record of the consent inputs used for a delivery decision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentEvidence {
    #[serde(default)]
    pub strategy: ConsentStrategy,
    #[serde(default)]
    pub consent_state: ConsentState,
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub receipt_matched: bool,
    #[serde(default)]
    pub evaluated_at_ms: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decodes an optional JSON text column, treating NULL and empty as default.
pub fn decode_column<T: DeserializeOwned + Default>(raw: Option<&str>) -> serde_json::Result<T> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(T::default()),
        Some(s) => serde_json::from_str(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capi_input_keeps_unknown_fields() {
        let raw = json!({
            "lineItems": [{ "productId": "p1", "quantity": 2, "price": 10.5 }],
            "checkoutToken": "tok",
            "utmSource": "newsletter"
        })
        .to_string();

        let input: CapiInput = decode_column(Some(&raw)).unwrap();
        assert_eq!(input.line_items.len(), 1);
        assert_eq!(input.checkout_token.as_deref(), Some("tok"));
        assert_eq!(input.event_type(), "purchase");

        let back = serde_json::to_value(&input).unwrap();
        assert_eq!(back["utmSource"], "newsletter");
    }

    #[test]
    fn null_and_empty_columns_decode_to_default() {
        let a: TrustMetadata = decode_column(None).unwrap();
        let b: TrustMetadata = decode_column(Some("  ")).unwrap();
        let c: TrustMetadata = decode_column(Some("null")).unwrap();

        assert_eq!(a, TrustMetadata::default());
        assert_eq!(b, a);
        assert_eq!(c, a);
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let out: serde_json::Result<CapiInput> = decode_column(Some("[1,2,3]"));
        assert!(out.is_err());
    }
}
