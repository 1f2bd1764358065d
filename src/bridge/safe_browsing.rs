//! Safe-browsing interstitial decisions.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::bridge::handle::SafeBrowsingDecision;
use crate::bridge::parse_response;
use crate::bridge::session::SessionContext;
use crate::channel::{ChannelOutcome, CorrelatedCall, MessageChannel};

pub const METHOD_SAFE_BROWSING_HIT: &str = "onSafeBrowsingHit";

/// Threat category reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatType {
    Unknown,
    Malware,
    Phishing,
    UnwantedSoftware,
    Billing,
}

impl ThreatType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Malware,
            2 => Self::Phishing,
            3 => Self::UnwantedSoftware,
            4 => Self::Billing,
            _ => Self::Unknown,
        }
    }
}

/// Authority answer to a safe-browsing hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeBrowsingAction {
    BackToSafety { report: bool },
    Proceed { report: bool },
    ShowInterstitial { report: bool },
}

impl Default for SafeBrowsingAction {
    fn default() -> Self {
        Self::ShowInterstitial { report: true }
    }
}

#[derive(Deserialize)]
struct SafeBrowsingResponse {
    action: Option<i64>,
    report: Option<bool>,
}

impl SafeBrowsingAction {
    pub fn from_response(response: Option<&Value>) -> Self {
        let Some(response) = parse_response::<SafeBrowsingResponse>(response) else {
            return Self::default();
        };
        let report = response.report.unwrap_or(true);
        match response.action {
            Some(0) => Self::BackToSafety { report },
            Some(1) => Self::Proceed { report },
            Some(_) => Self::ShowInterstitial { report },
            None => Self::default(),
        }
    }

    pub fn from_outcome(outcome: ChannelOutcome) -> Self {
        match outcome {
            ChannelOutcome::Success(response) => Self::from_response(response.as_ref()),
            ChannelOutcome::Error { code, message, .. } => {
                error!("Safe browsing decision failed: {}, {}", code, message);
                Self::default()
            }
            ChannelOutcome::NotImplemented => Self::default(),
        }
    }
}

pub struct SafeBrowsingCoordinator {
    channel: Arc<dyn MessageChannel>,
}

impl SafeBrowsingCoordinator {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }

    /// Asks the authority how to handle a flagged `url`. The decision token
    /// is resolved when the answer arrives; nothing blocks here.
    pub fn on_safe_browsing_hit(
        &self,
        session: &SessionContext,
        url: &str,
        threat_type: i32,
        decision: SafeBrowsingDecision,
    ) -> Arc<CorrelatedCall> {
        let mut payload = session.base_payload();
        payload.insert("url".into(), Value::from(url));
        payload.insert("threatType".into(), Value::from(threat_type));

        debug!("Safe browsing hit on {} ({:?})", url, ThreatType::from_code(threat_type));

        CorrelatedCall::issue(
            self.channel.as_ref(),
            METHOD_SAFE_BROWSING_HIT,
            payload,
            move |outcome| match SafeBrowsingAction::from_outcome(outcome) {
                SafeBrowsingAction::BackToSafety { report } => decision.back_to_safety(report),
                SafeBrowsingAction::Proceed { report } => decision.proceed(report),
                SafeBrowsingAction::ShowInterstitial { report } => decision.show_interstitial(report),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_proceed_without_report() {
        assert_eq!(
            SafeBrowsingAction::from_response(Some(&json!({"action": 1, "report": false}))),
            SafeBrowsingAction::Proceed { report: false }
        );
    }

    #[test]
    fn test_report_defaults_to_true() {
        assert_eq!(
            SafeBrowsingAction::from_response(Some(&json!({"action": 0}))),
            SafeBrowsingAction::BackToSafety { report: true }
        );
    }

    #[test]
    fn test_malformed_shows_interstitial() {
        let fallback = SafeBrowsingAction::ShowInterstitial { report: true };
        assert_eq!(SafeBrowsingAction::from_response(None), fallback);
        assert_eq!(SafeBrowsingAction::from_response(Some(&json!({"report": false}))), fallback);
        assert_eq!(SafeBrowsingAction::from_response(Some(&json!({"action": "x"}))), fallback);
        assert_eq!(SafeBrowsingAction::from_outcome(ChannelOutcome::NotImplemented), fallback);
        assert_eq!(
            SafeBrowsingAction::from_outcome(ChannelOutcome::error("e", "m")),
            fallback
        );
    }

    #[test]
    fn test_explicit_interstitial_keeps_report_flag() {
        assert_eq!(
            SafeBrowsingAction::from_response(Some(&json!({"action": 2, "report": false}))),
            SafeBrowsingAction::ShowInterstitial { report: false }
        );
    }

    #[test]
    fn test_threat_type_codes() {
        assert_eq!(ThreatType::from_code(2), ThreatType::Phishing);
        assert_eq!(ThreatType::from_code(99), ThreatType::Unknown);
    }
}
