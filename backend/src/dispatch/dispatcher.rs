//! Parallel fan-out of one job to its configured ad platforms.
//!
//! Guarantees:
//! - a platform whose prior result is `sent` is never called again
//! - every eligible platform is sent concurrently; none waits on another
//! - an error or panic inside one platform call becomes that platform's
//!   `failed:<reason>` and never affects its siblings
//!
//! This module NEVER:
//! - touches the database
//! - decides the job's next status (the finalizer does)

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use platforms::{ConversionData, PlatformRegistry};
use tracing::{Instrument, debug, info_span, warn};

use crate::collaborators::credentials::CredentialDecryptor;
use crate::collaborators::event_id::{
    EVENT_ID_VERSION, EventIdGenerator, EventIdInput, normalize_line_items,
};
use crate::collaborators::trust::{Receipt, TrustEvaluation, TrustEvaluator};
use crate::dispatch::eligibility::{GateDecision, decide};
use crate::dispatch::types::{DispatchOutcome, PlatformAttempt};
use crate::jobs::model::{LoadedJob, PixelConfig};
use crate::jobs::results::{PlatformOutcome, truncate_reason};
use crate::metrics::counters::{Counters, bump};

/// Stored failure reasons are cut to this many characters.
pub const FAILURE_REASON_MAX: usize = 160;

pub struct Dispatcher {
    registry: PlatformRegistry,
    trust: Arc<dyn TrustEvaluator>,
    decryptor: Arc<dyn CredentialDecryptor>,
    event_ids: Arc<dyn EventIdGenerator>,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(
        registry: PlatformRegistry,
        trust: Arc<dyn TrustEvaluator>,
        decryptor: Arc<dyn CredentialDecryptor>,
        event_ids: Arc<dyn EventIdGenerator>,
        counters: Counters,
    ) -> Self {
        Self {
            registry,
            trust,
            decryptor,
            event_ids,
            counters,
        }
    }

    pub fn trust(&self) -> &Arc<dyn TrustEvaluator> {
        &self.trust
    }

    /// Gates and sends every pixel config of `loaded`.
    pub async fn dispatch(
        &self,
        loaded: &LoadedJob,
        evaluation: &TrustEvaluation,
        receipt: Option<&Receipt>,
    ) -> DispatchOutcome {
        let job = &loaded.job;
        let mut attempts = Vec::with_capacity(loaded.pixel_configs.len());
        let mut to_send: Vec<&PixelConfig> = Vec::new();

        for config in &loaded.pixel_configs {
            match decide(
                self.trust.as_ref(),
                config,
                &job.platform_results,
                evaluation,
                loaded.shop.consent_strategy,
            ) {
                GateDecision::AlreadySent => {
                    bump(&self.counters.platform_short_circuited);
                    debug!(platform = %config.platform, "already sent; skipping network call");
                    attempts.push(PlatformAttempt::already_sent(config.platform));
                }
                GateDecision::Skip(reason) => {
                    bump(&self.counters.platform_skipped);
                    debug!(platform = %config.platform, %reason, "platform not eligible");
                    attempts.push(PlatformAttempt::skipped(config.platform, reason));
                }
                GateDecision::Send => to_send.push(config),
            }
        }

        if to_send.is_empty() {
            return DispatchOutcome { attempts };
        }

        let data = conversion_data(loaded);
        let event_id = self.event_id_for(loaded, receipt);

        let sends = to_send.into_iter().map(|config| {
            let span = info_span!("platform_send", platform = %config.platform);
            let data = &data;
            let event_id = event_id.as_str();
            async move {
                match AssertUnwindSafe(self.send_one(config, data, event_id))
                    .catch_unwind()
                    .await
                {
                    Ok(attempt) => attempt,
                    Err(panic) => {
                        let msg = panic_message(&*panic);
                        warn!(error = %msg, "platform send panicked");
                        failed_attempt(config, event_id, format!("panic: {msg}"), None)
                    }
                }
            }
            .instrument(span)
        });

        for attempt in join_all(sends).await {
            if attempt.outcome.is_sent() {
                bump(&self.counters.platform_sent);
            } else {
                bump(&self.counters.platform_failed);
            }
            attempts.push(attempt);
        }

        DispatchOutcome { attempts }
    }

    async fn send_one(
        &self,
        config: &PixelConfig,
        data: &ConversionData,
        event_id: &str,
    ) -> PlatformAttempt {
        let credentials = match self.decryptor.decrypt(config) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "credential decryption failed");
                return failed_attempt(config, event_id, format!("credentials: {e}"), Some(false));
            }
        };

        let Some(service) = self.registry.get(config.platform) else {
            warn!("no platform service registered");
            return failed_attempt(config, event_id, "no platform service registered".into(), Some(false));
        };

        match service.send_conversion(&credentials, data, event_id).await {
            Ok(res) if res.success => PlatformAttempt {
                platform: config.platform,
                outcome: PlatformOutcome::Sent,
                event_id: Some(event_id.to_string()),
                retryable: None,
                network_call: true,
            },
            Ok(res) => {
                let (message, retryable) = match res.error {
                    Some(err) => (format!("{:?}: {}", err.kind, err.message), Some(err.is_retryable)),
                    None => ("platform reported failure without detail".to_string(), None),
                };
                debug!(%message, ?retryable, "platform rejected conversion");
                failed_attempt(config, event_id, message, retryable)
            }
            Err(e) => {
                warn!(error = %e, "platform send errored");
                failed_attempt(config, event_id, e.to_string(), None)
            }
        }
    }

    /// Prefers the event id the browser pixel already used so both paths dedupe.
    fn event_id_for(&self, loaded: &LoadedJob, receipt: Option<&Receipt>) -> String {
        if let Some(id) = receipt.and_then(|r| r.event_id.as_deref()).filter(|id| !id.is_empty()) {
            return id.to_string();
        }

        let job = &loaded.job;
        let items = normalize_line_items(job.line_items());
        self.event_ids.generate_canonical_event_id(&EventIdInput {
            order_id: &job.order_id,
            checkout_token: job.checkout_token(),
            event_type: job.capi_input.event_type(),
            shop_domain: &loaded.shop.shop_domain,
            line_items: &items,
            version: EVENT_ID_VERSION,
            nonce: None,
        })
    }
}

/// Platform-agnostic payload; carries no personal data.
pub fn conversion_data(loaded: &LoadedJob) -> ConversionData {
    let job = &loaded.job;
    ConversionData {
        order_id: job.order_id.clone(),
        order_number: job.order_number.clone(),
        value: job.order_value,
        currency: job.currency.clone(),
        line_items: job.line_items().to_vec(),
    }
}

fn failed_attempt(
    config: &PixelConfig,
    event_id: &str,
    reason: String,
    retryable: Option<bool>,
) -> PlatformAttempt {
    PlatformAttempt {
        platform: config.platform,
        outcome: PlatformOutcome::failed(truncate_reason(&reason, FAILURE_REASON_MAX)),
        event_id: Some(event_id.to_string()),
        retryable,
        network_call: true,
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
