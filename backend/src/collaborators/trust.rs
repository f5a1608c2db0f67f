use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use platforms::Platform;
use serde::{Deserialize, Serialize};

use crate::dispatch::eligibility::check_consent_eligibility;
use crate::jobs::payload::{ConsentEvidence, TrustMetadata};

/// Confidence that a client-observed event is genuine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Trusted,
    #[default]
    Partial,
    Untrusted,
}

/// Shop-level policy for sends made without explicit consent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStrategy {
    Strict,
    #[default]
    Balanced,
    Weak,
}

impl FromStr for ConsentStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ConsentStrategy::Strict),
            "balanced" => Ok(ConsentStrategy::Balanced),
            "weak" => Ok(ConsentStrategy::Weak),
            other => Err(format!("unknown consent strategy: {other}")),
        }
    }
}

impl fmt::Display for ConsentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConsentStrategy::Strict => "strict",
            ConsentStrategy::Balanced => "balanced",
            ConsentStrategy::Weak => "weak",
        })
    }
}

/// Visitor consent as reported by the storefront. `None` means unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentState {
    #[serde(default)]
    pub marketing: Option<bool>,
    #[serde(default)]
    pub analytics: Option<bool>,
    #[serde(default)]
    pub sale_of_data: Option<bool>,
}

/// Client-side pixel receipt matched to an order.
#[derive(Clone, Debug, PartialEq)]
pub struct Receipt {
    pub shop_id: String,
    pub order_id: String,
    pub checkout_token: Option<String>,
    /// Event id the browser pixel already used; server sends reuse it for dedup.
    pub event_id: Option<String>,
    pub consent: Option<ConsentState>,
    pub received_at_ms: u64,
}

/// Lookup input for one job in [`TrustEvaluator::batch_fetch_receipts`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiptKey {
    pub shop_id: String,
    pub order_id: String,
    pub checkout_token: Option<String>,
    pub created_at_ms: u64,
}

/// Receipts keyed by `(shop_id, order_id)`.
pub type ReceiptMap = HashMap<(String, String), Receipt>;

#[derive(Clone, Debug)]
pub struct ShopContext {
    pub shop_id: String,
    pub shop_domain: String,
    pub consent_strategy: ConsentStrategy,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrustEvaluation {
    pub trust_level: TrustLevel,
    pub trust_metadata: TrustMetadata,
    pub consent_state: ConsentState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformEligibility {
    pub allowed: bool,
    pub skip_reason: Option<String>,
}

impl PlatformEligibility {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            skip_reason: None,
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            skip_reason: Some(reason.into()),
        }
    }
}

/// Consent and trust decisioning for delivery.
///
/// Receipt matching and trust scoring live with the implementor; the
/// per-platform consent rule has a default so every evaluator applies the
/// same policy unless it deliberately overrides it.
#[async_trait]
pub trait TrustEvaluator: Send + Sync {
    /// Resolves receipts for a whole batch in one lookup.
    async fn batch_fetch_receipts(&self, keys: &[ReceiptKey]) -> anyhow::Result<ReceiptMap>;

    fn evaluate_trust(
        &self,
        receipt: Option<&Receipt>,
        checkout_token: Option<&str>,
        shop: &ShopContext,
    ) -> TrustEvaluation;

    fn check_platform_eligibility(
        &self,
        platform: Platform,
        trust_level: TrustLevel,
        consent: &ConsentState,
        strategy: ConsentStrategy,
        treat_as_marketing: bool,
    ) -> PlatformEligibility {
        check_consent_eligibility(platform, trust_level, consent, strategy, treat_as_marketing)
    }

    fn build_consent_evidence(
        &self,
        receipt: Option<&Receipt>,
        evaluation: &TrustEvaluation,
        strategy: ConsentStrategy,
        now_ms: u64,
    ) -> ConsentEvidence {
        ConsentEvidence {
            strategy,
            consent_state: evaluation.consent_state,
            trust_level: evaluation.trust_level,
            receipt_matched: receipt.is_some(),
            evaluated_at_ms: now_ms,
            extra: Default::default(),
        }
    }
}
