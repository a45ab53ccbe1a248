//! Top-level composition: Parser → Orchestrator → (Storage, Relay).
//!
//! `handle` is the single entry point invoked per inbound email. Routing
//! correctness takes precedence over bookkeeping: a persistence failure
//! after a successful verdict degrades the outcome but never blocks the
//! relay action.

use crate::classifier::get_classifier;
use crate::config::Config;
use crate::email::EmailParser;
use crate::error::{GuardError, LAYER_LLM, LAYER_ML};
use crate::evidence::{Severity, Stage, Verdict};
use crate::explainer::LlmExplainer;
use crate::heuristics::HeuristicEngine;
use crate::pipeline::{PipelineOrchestrator, PipelineResult};
use crate::relay::{HttpRelayClient, LogRelayClient, RelayClient, RelayOutcome};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::storage::{EmailStorage, MemoryStorage, SqliteStorage};
use serde::Serialize;
use std::sync::Arc;

/// What the API/CRUD layers get back for one processed email.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerOutcome {
    pub verdict: Verdict,
    pub stage_reached: Stage,
    /// Absent when persistence degraded.
    pub record_id: Option<String>,
    pub relay: RelayOutcome,
    /// True when the verdict was routed but could not be recorded.
    pub persistence_degraded: bool,
}

pub struct GuardIAHandler {
    parser: EmailParser,
    orchestrator: PipelineOrchestrator,
    storage: Arc<dyn EmailStorage>,
    relay: Arc<dyn RelayClient>,
    stats: Option<Arc<StatisticsCollector>>,
}

impl GuardIAHandler {
    pub fn new(
        orchestrator: PipelineOrchestrator,
        storage: Arc<dyn EmailStorage>,
        relay: Arc<dyn RelayClient>,
        stats: Option<Arc<StatisticsCollector>>,
    ) -> Self {
        Self {
            parser: EmailParser::new(),
            orchestrator,
            storage,
            relay,
            stats,
        }
    }

    /// Wire up the production stack from configuration. The classifier
    /// singleton loads here; a missing model is fatal at startup, not at
    /// first email.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let classifier = get_classifier(&config.classifier)?;
        let explainer = LlmExplainer::from_config(&config.explainer)?;
        let orchestrator = PipelineOrchestrator::new(
            HeuristicEngine::from_config(config),
            Box::new(classifier),
            Box::new(explainer),
            config.pipeline.clone(),
        );

        let storage: Arc<dyn EmailStorage> =
            Arc::new(SqliteStorage::open(&config.storage.database_path)?);

        let relay: Arc<dyn RelayClient> = if config.relay.endpoint.is_empty() {
            log::warn!("no relay endpoint configured, routing actions are log-only");
            Arc::new(LogRelayClient::new())
        } else {
            Arc::new(HttpRelayClient::new(
                &config.relay.endpoint,
                config.relay.timeout_seconds,
            )?)
        };

        let stats = match &config.statistics {
            Some(stats_config) if stats_config.enabled => Some(Arc::new(StatisticsCollector::new(
                stats_config.database_path.clone(),
                stats_config.flush_interval_seconds.unwrap_or(60),
            )?)),
            _ => None,
        };

        Ok(Self::new(orchestrator, storage, relay, stats))
    }

    /// In-memory stack for the `--test-email` flow: full pipeline, no side
    /// effects beyond logging.
    pub fn dry_run(config: &Config) -> anyhow::Result<Self> {
        let classifier = get_classifier(&config.classifier)?;
        let explainer = LlmExplainer::from_config(&config.explainer)?;
        let orchestrator = PipelineOrchestrator::new(
            HeuristicEngine::from_config(config),
            Box::new(classifier),
            Box::new(explainer),
            config.pipeline.clone(),
        );
        Ok(Self::new(
            orchestrator,
            Arc::new(MemoryStorage::new()),
            Arc::new(LogRelayClient::new()),
            None,
        ))
    }

    /// Process one raw transmission end to end.
    pub async fn handle(&self, raw: &[u8]) -> Result<HandlerOutcome, GuardError> {
        let email = self.parser.parse(raw)?;
        log::info!(
            "processing {} from {}",
            email.message_id,
            if email.sender.is_empty() {
                "<unknown>"
            } else {
                email.sender.as_str()
            }
        );

        let result = self.orchestrator.run(&email).await;

        let (record_id, persistence_degraded) =
            match self.storage.persist(&email, &result).await {
                Ok(id) => (Some(id), false),
                Err(e) => {
                    log::error!("failed to persist case for {}: {e}", email.message_id);
                    self.record(StatEvent::PersistFailed);
                    (None, true)
                }
            };

        let reason = quarantine_reason(&result);
        let relay_outcome = self
            .relay
            .route(&email.message_id, result.final_verdict, &reason)
            .await?;

        self.record(StatEvent::Processed {
            verdict: result.final_verdict,
            stage: result.stage_reached,
            elapsed_ms: result.total_elapsed_ms,
        });
        for evidence in &result.evidences {
            if evidence.kind == "layer_unavailable" {
                let layer = if evidence.description.contains(LAYER_LLM) {
                    LAYER_LLM
                } else {
                    LAYER_ML
                };
                self.record(StatEvent::LayerDegraded { layer });
            }
        }

        Ok(HandlerOutcome {
            verdict: result.final_verdict,
            stage_reached: result.stage_reached,
            record_id,
            relay: relay_outcome,
            persistence_degraded,
        })
    }

    fn record(&self, event: StatEvent) {
        if let Some(stats) = &self.stats {
            stats.record(event);
        }
    }
}

/// Human-readable quarantine reason built from the strongest evidence.
fn quarantine_reason(result: &PipelineResult) -> String {
    let mut descriptions: Vec<&str> = result
        .evidences
        .iter()
        .filter(|e| e.severity >= Severity::Medium)
        .take(3)
        .map(|e| e.description.as_str())
        .collect();
    if descriptions.is_empty() {
        descriptions = result
            .evidences
            .iter()
            .take(2)
            .map(|e| e.description.as_str())
            .collect();
    }
    if descriptions.is_empty() {
        return format!("aggregate threat score {:.2}", result.final_score);
    }
    descriptions.join("; ")
}
