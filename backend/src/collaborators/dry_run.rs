//! Stand-ins used by the worker binary until real collaborators are wired.
//!
//! They never reach a network: platform sends are logged and reported as
//! sent, billing is unmetered, credentials are read as plaintext JSON.

use anyhow::Context;
use async_trait::async_trait;
use platforms::{
    ConversionData, CredentialValidation, Credentials, Platform, PlatformService, SendResult,
};
use serde_json::Value;
use tracing::info;

use crate::collaborators::billing::{BillingGate, BillingReservation};
use crate::collaborators::credentials::CredentialDecryptor;
use crate::collaborators::trust::{
    Receipt, ReceiptKey, ReceiptMap, ShopContext, TrustEvaluation, TrustEvaluator, TrustLevel,
};
use crate::jobs::model::PixelConfig;
use crate::jobs::payload::TrustMetadata;

pub struct DryRunPlatform(pub Platform);

#[async_trait]
impl PlatformService for DryRunPlatform {
    fn platform(&self) -> Platform {
        self.0
    }

    async fn send_conversion(
        &self,
        _credentials: &Credentials,
        data: &ConversionData,
        event_id: &str,
    ) -> anyhow::Result<SendResult> {
        info!(
            platform = %self.0,
            order_id = %data.order_id,
            %event_id,
            value = data.value,
            currency = %data.currency,
            "dry-run conversion send"
        );
        Ok(SendResult::sent(None))
    }

    fn validate_credentials(&self, raw: &Value) -> CredentialValidation {
        if raw.is_object() {
            CredentialValidation::ok()
        } else {
            CredentialValidation::invalid(vec!["credentials must be a JSON object".into()])
        }
    }
}

/// Trust evaluator with no receipt source: every event is `partial` with unknown consent.
pub struct NoReceiptTrust;

#[async_trait]
impl TrustEvaluator for NoReceiptTrust {
    async fn batch_fetch_receipts(&self, _keys: &[ReceiptKey]) -> anyhow::Result<ReceiptMap> {
        Ok(ReceiptMap::new())
    }

    fn evaluate_trust(
        &self,
        receipt: Option<&Receipt>,
        _checkout_token: Option<&str>,
        _shop: &ShopContext,
    ) -> TrustEvaluation {
        TrustEvaluation {
            trust_level: TrustLevel::Partial,
            trust_metadata: TrustMetadata {
                trust_level: TrustLevel::Partial,
                reason: Some("no_receipt_source".into()),
                receipt_matched: receipt.is_some(),
                ..Default::default()
            },
            consent_state: receipt.and_then(|r| r.consent).unwrap_or_default(),
        }
    }
}

pub struct UnmeteredBilling;

#[async_trait]
impl BillingGate for UnmeteredBilling {
    async fn check_and_reserve_billing_slot(
        &self,
        _shop_id: &str,
        _plan: &str,
        _order_id: &str,
    ) -> anyhow::Result<BillingReservation> {
        Ok(BillingReservation {
            success: true,
            current: 0,
            limit: u64::MAX,
            already_counted: false,
        })
    }

    async fn release_billing_slot(&self, _shop_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct PlaintextCredentials;

impl CredentialDecryptor for PlaintextCredentials {
    fn decrypt(&self, config: &PixelConfig) -> anyhow::Result<Credentials> {
        let raw: Value = serde_json::from_str(&config.credentials_encrypted)
            .with_context(|| format!("pixel config {} holds non-JSON credentials", config.id))?;
        Ok(Credentials::new(raw))
    }
}
