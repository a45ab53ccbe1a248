//! Relay routing — the action side of the gateway.
//!
//! Routing is idempotent per email id: upstream retries after a failed
//! invocation are expected, and a repeat call for an already-routed email
//! replays the recorded outcome without touching the relay again.

use crate::error::RelayError;
use crate::evidence::Verdict;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What happened to the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RelayOutcome {
    Delivered,
    Quarantined { reason: String },
}

impl RelayOutcome {
    fn action_name(&self) -> &'static str {
        match self {
            RelayOutcome::Delivered => "deliver",
            RelayOutcome::Quarantined { .. } => "quarantine",
        }
    }
}

/// Only malicious verdicts quarantine; suspicious mail is delivered and
/// stays visible through storage and statistics.
pub fn action_for(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Malicious => "quarantine",
        Verdict::Benign | Verdict::Suspicious => "deliver",
    }
}

#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Deliver or quarantine based on the verdict. Must be idempotent for
    /// the same email id.
    async fn route(
        &self,
        email_id: &str,
        verdict: Verdict,
        reason: &str,
    ) -> Result<RelayOutcome, RelayError>;
}

/// Records one outcome per email id and answers repeats from the record.
/// A repeat with a different action is refused rather than double-routed.
#[derive(Default)]
struct RouteLedger {
    routed: Mutex<HashMap<String, RelayOutcome>>,
}

impl RouteLedger {
    /// Returns the previously recorded outcome, or None when the action
    /// still has to be performed.
    fn check(&self, email_id: &str, action: &str) -> Result<Option<RelayOutcome>, RelayError> {
        let routed = self.routed.lock().unwrap_or_else(|e| e.into_inner());
        match routed.get(email_id) {
            None => Ok(None),
            Some(previous) if previous.action_name() == action => {
                log::debug!("email {email_id} already routed ({action}), replaying outcome");
                Ok(Some(previous.clone()))
            }
            Some(previous) => Err(RelayError::Conflict {
                email_id: email_id.to_string(),
                previous: previous.action_name().to_string(),
            }),
        }
    }

    fn record(&self, email_id: &str, outcome: RelayOutcome) {
        self.routed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(email_id.to_string(), outcome);
    }
}

/// Production client posting to the mail relay's admin endpoint.
pub struct HttpRelayClient {
    client: Client,
    endpoint: String,
    ledger: RouteLedger,
}

#[derive(Serialize)]
struct RouteRequest<'a> {
    email_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

impl HttpRelayClient {
    pub fn new(endpoint: &str, timeout_seconds: u64) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent(concat!("GuardIA/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            ledger: RouteLedger::default(),
        })
    }

    async fn post_action(
        &self,
        action: &str,
        email_id: &str,
        reason: Option<&str>,
    ) -> Result<(), RelayError> {
        let url = format!("{}/{action}", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&RouteRequest { email_id, reason })
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn route(
        &self,
        email_id: &str,
        verdict: Verdict,
        reason: &str,
    ) -> Result<RelayOutcome, RelayError> {
        let action = action_for(verdict);
        if let Some(previous) = self.ledger.check(email_id, action)? {
            return Ok(previous);
        }

        let outcome = match action {
            "quarantine" => {
                self.post_action("quarantine", email_id, Some(reason)).await?;
                log::info!("quarantined {email_id}: {reason}");
                RelayOutcome::Quarantined {
                    reason: reason.to_string(),
                }
            }
            _ => {
                self.post_action("deliver", email_id, None).await?;
                log::info!("delivered {email_id}");
                RelayOutcome::Delivered
            }
        };

        self.ledger.record(email_id, outcome.clone());
        Ok(outcome)
    }
}

/// Log-only relay used when no endpoint is configured (test rigs, dry
/// runs). Shares the ledger semantics with the HTTP client.
#[derive(Default)]
pub struct LogRelayClient {
    ledger: RouteLedger,
    actions_taken: AtomicUsize,
}

impl LogRelayClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actions actually performed (repeat routes excluded).
    pub fn actions_taken(&self) -> usize {
        self.actions_taken.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayClient for LogRelayClient {
    async fn route(
        &self,
        email_id: &str,
        verdict: Verdict,
        reason: &str,
    ) -> Result<RelayOutcome, RelayError> {
        let action = action_for(verdict);
        if let Some(previous) = self.ledger.check(email_id, action)? {
            return Ok(previous);
        }

        let outcome = match action {
            "quarantine" => {
                log::info!("dry-run quarantine {email_id}: {reason}");
                RelayOutcome::Quarantined {
                    reason: reason.to_string(),
                }
            }
            _ => {
                log::info!("dry-run deliver {email_id}");
                RelayOutcome::Delivered
            }
        };

        self.actions_taken.fetch_add(1, Ordering::SeqCst);
        self.ledger.record(email_id, outcome.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_is_idempotent() {
        let relay = LogRelayClient::new();

        let first = relay
            .route("msg-1", Verdict::Malicious, "spoofed sender")
            .await
            .unwrap();
        let second = relay
            .route("msg-1", Verdict::Malicious, "spoofed sender")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(relay.actions_taken(), 1);
    }

    #[tokio::test]
    async fn test_verdicts_map_to_actions() {
        let relay = LogRelayClient::new();

        let benign = relay.route("b", Verdict::Benign, "").await.unwrap();
        assert_eq!(benign, RelayOutcome::Delivered);

        let suspicious = relay.route("s", Verdict::Suspicious, "").await.unwrap();
        assert_eq!(suspicious, RelayOutcome::Delivered);

        let malicious = relay
            .route("m", Verdict::Malicious, "bad link")
            .await
            .unwrap();
        assert_eq!(
            malicious,
            RelayOutcome::Quarantined {
                reason: "bad link".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_conflicting_reroute_is_refused() {
        let relay = LogRelayClient::new();

        relay.route("msg-2", Verdict::Benign, "").await.unwrap();
        let err = relay
            .route("msg-2", Verdict::Malicious, "changed mind")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Conflict { .. }));
        assert_eq!(relay.actions_taken(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_relay_surfaces_transport_error() {
        // Reserved TEST-NET address, nothing listens there.
        let relay = HttpRelayClient::new("http://192.0.2.1:9/relay", 1).unwrap();
        let err = relay
            .route("msg-3", Verdict::Benign, "")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
