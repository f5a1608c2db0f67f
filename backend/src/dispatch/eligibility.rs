//! Per-platform allow/skip decision for one job.
//
//  This module is deliberately pure: no async, no IO.

use platforms::Platform;

use crate::collaborators::trust::{
    ConsentState, ConsentStrategy, PlatformEligibility, TrustEvaluation, TrustEvaluator,
    TrustLevel,
};
use crate::jobs::model::PixelConfig;
use crate::jobs::results::PlatformResults;

pub const SKIP_SALE_OF_DATA: &str = "sale_of_data_opt_out";
pub const SKIP_UNTRUSTED: &str = "untrusted_event";
pub const SKIP_NO_MARKETING_CONSENT: &str = "no_marketing_consent";
pub const SKIP_NO_ANALYTICS_CONSENT: &str = "no_analytics_consent";
pub const SKIP_MARKETING_DENIED: &str = "marketing_consent_denied";
pub const SKIP_ANALYTICS_DENIED: &str = "analytics_consent_denied";

/// What the dispatcher should do with one configured platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// A previous attempt already delivered it; never send again.
    AlreadySent,
    Skip(String),
    Send,
}

/// Decide for one pixel config, short-circuiting on a prior `sent`.
pub fn decide(
    trust: &dyn TrustEvaluator,
    config: &PixelConfig,
    prior: &PlatformResults,
    evaluation: &TrustEvaluation,
    strategy: ConsentStrategy,
) -> GateDecision {
    if prior.is_sent(config.platform) {
        return GateDecision::AlreadySent;
    }

    let eligibility = trust.check_platform_eligibility(
        config.platform,
        evaluation.trust_level,
        &evaluation.consent_state,
        strategy,
        config.client_config.treat_as_marketing,
    );

    if eligibility.allowed {
        GateDecision::Send
    } else {
        GateDecision::Skip(
            eligibility
                .skip_reason
                .unwrap_or_else(|| "not_eligible".to_string()),
        )
    }
}

/// Default consent policy.
///
/// Sale-of-data opt-out blocks marketing everywhere. Beyond that:
///   - strict: untrusted events are dropped; each category needs explicit consent
///   - balanced: marketing needs explicit consent, analytics only must not be denied
///   - weak: anything not explicitly denied is sent
pub fn check_consent_eligibility(
    platform: Platform,
    trust_level: TrustLevel,
    consent: &ConsentState,
    strategy: ConsentStrategy,
    treat_as_marketing: bool,
) -> PlatformEligibility {
    let marketing = treat_as_marketing || platform.is_marketing();

    if marketing && consent.sale_of_data == Some(false) {
        return PlatformEligibility::skip(SKIP_SALE_OF_DATA);
    }

    let granted = if marketing {
        consent.marketing
    } else {
        consent.analytics
    };

    match strategy {
        ConsentStrategy::Strict => {
            if trust_level == TrustLevel::Untrusted {
                return PlatformEligibility::skip(SKIP_UNTRUSTED);
            }
            if granted != Some(true) {
                return PlatformEligibility::skip(missing_reason(marketing));
            }
        }
        ConsentStrategy::Balanced => {
            if marketing && granted != Some(true) {
                return PlatformEligibility::skip(SKIP_NO_MARKETING_CONSENT);
            }
            if !marketing && granted == Some(false) {
                return PlatformEligibility::skip(SKIP_ANALYTICS_DENIED);
            }
        }
        ConsentStrategy::Weak => {
            if granted == Some(false) {
                return PlatformEligibility::skip(denied_reason(marketing));
            }
        }
    }

    PlatformEligibility::allow()
}

fn missing_reason(marketing: bool) -> &'static str {
    if marketing {
        SKIP_NO_MARKETING_CONSENT
    } else {
        SKIP_NO_ANALYTICS_CONSENT
    }
}

fn denied_reason(marketing: bool) -> &'static str {
    if marketing {
        SKIP_MARKETING_DENIED
    } else {
        SKIP_ANALYTICS_DENIED
    }
}
