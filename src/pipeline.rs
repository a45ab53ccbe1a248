//! Pipeline orchestration — sequences the three layers under the gating
//! policy and aggregates their outputs into one immutable result.
//!
//! The orchestrator owns all timeout/failure handling: layers 2 and 3 are
//! the only suspension points, each issued with its own timeout, and a
//! timed-out layer is treated exactly like a failed one. Degradation is a
//! value (`LayerOutcome::Unavailable`), not control flow.

use crate::classifier::{MlResult, TextClassifier};
use crate::config::PipelineConfig;
use crate::email::ParsedEmail;
use crate::error::{LayerError, LAYER_LLM, LAYER_ML};
use crate::evidence::{EvidenceItem, Severity, Stage, Verdict};
use crate::explainer::{LlmExplainer, LlmResult};
use crate::heuristics::{HeuristicEngine, HeuristicResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seam for Layer 2 so the orchestrator can be exercised against doubles.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, email: &ParsedEmail) -> Result<MlResult, LayerError>;
}

/// Seam for Layer 3.
#[async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(
        &self,
        email: &ParsedEmail,
        heuristic: &HeuristicResult,
        ml: &MlResult,
    ) -> Result<LlmResult, LayerError>;
}

#[async_trait]
impl Classifier for Arc<TextClassifier> {
    async fn classify(&self, email: &ParsedEmail) -> Result<MlResult, LayerError> {
        // Inference is CPU-bound; run it off the reactor so the caller's
        // timeout can abandon it without blocking shutdown.
        let this = Arc::clone(self);
        let email = email.clone();
        match tokio::task::spawn_blocking(move || TextClassifier::classify(&this, &email)).await {
            Ok(result) => result,
            Err(e) => Err(LayerError::failed(
                LAYER_ML,
                format!("inference task aborted: {e}"),
            )),
        }
    }
}

#[async_trait]
impl Explainer for LlmExplainer {
    async fn explain(
        &self,
        email: &ParsedEmail,
        heuristic: &HeuristicResult,
        ml: &MlResult,
    ) -> Result<LlmResult, LayerError> {
        LlmExplainer::explain(self, email, heuristic, ml).await
    }
}

/// Aggregated outcome of one pipeline invocation. Immutable once returned;
/// storage and relay only read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub stage_reached: Stage,
    pub heuristic: HeuristicResult,
    pub ml: Option<MlResult>,
    pub llm: Option<LlmResult>,
    pub final_score: f64,
    pub final_verdict: Verdict,
    pub evidences: Vec<EvidenceItem>,
    pub total_elapsed_ms: u64,
}

enum LayerOutcome<T> {
    Ran(T),
    Unavailable(LayerError),
}

async fn bounded<T, F>(timeout_ms: u64, layer: &'static str, fut: F) -> LayerOutcome<T>
where
    F: Future<Output = Result<T, LayerError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(Ok(value)) => LayerOutcome::Ran(value),
        Ok(Err(e)) => {
            log::warn!("{layer} degraded: {e}");
            LayerOutcome::Unavailable(e)
        }
        Err(_) => {
            log::warn!("{layer} timed out after {timeout_ms}ms");
            LayerOutcome::Unavailable(LayerError::Timeout { layer, timeout_ms })
        }
    }
}

pub struct PipelineOrchestrator {
    heuristics: HeuristicEngine,
    classifier: Box<dyn Classifier>,
    explainer: Box<dyn Explainer>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        heuristics: HeuristicEngine,
        classifier: Box<dyn Classifier>,
        explainer: Box<dyn Explainer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            heuristics,
            classifier,
            explainer,
            config,
        }
    }

    /// Run the staged analysis for one email.
    ///
    /// Layer 1 always runs. Layer 2 runs unless the heuristic score is
    /// already past a confident-exit threshold in either direction. Layer 3
    /// runs only when the combined heuristic+ML signal lands in the
    /// ambiguous band. Every processed email yields a verdict, whatever the
    /// backends are doing.
    pub async fn run(&self, email: &ParsedEmail) -> PipelineResult {
        let start = Instant::now();
        let cfg = &self.config;

        let heuristic = self.heuristics.analyze(email);
        let mut evidences = heuristic.matched_rules.clone();

        if heuristic.score <= cfg.benign_exit || heuristic.score >= cfg.malicious_exit {
            log::debug!(
                "heuristic score {:.2} past confident-exit gate, skipping layers 2-3",
                heuristic.score
            );
            return self.finalize(start, heuristic, None, None, evidences, Stage::HeuristicOnly);
        }

        let ml = match bounded(
            cfg.ml_timeout_ms,
            LAYER_ML,
            self.classifier.classify(email),
        )
        .await
        {
            LayerOutcome::Ran(ml) => {
                evidences.push(
                    EvidenceItem::new(
                        "ml_probability",
                        Severity::Low,
                        format!(
                            "classifier phishing probability {:.3} ({:?})",
                            ml.probability, ml.label
                        ),
                    )
                    .with_raw(serde_json::json!({ "probability": ml.probability })),
                );
                ml
            }
            LayerOutcome::Unavailable(e) => {
                evidences.push(unavailable_evidence(&e));
                return self.finalize(
                    start,
                    heuristic,
                    None,
                    None,
                    evidences,
                    Stage::HeuristicOnly,
                );
            }
        };

        let combined = (1.0 - cfg.ml_blend_weight) * heuristic.score
            + cfg.ml_blend_weight * ml.probability;

        if combined < cfg.ambiguous_low || combined > cfg.ambiguous_high {
            log::debug!("combined score {combined:.2} outside ambiguous band, skipping layer 3");
            return self.finalize(start, heuristic, Some(ml), None, evidences, Stage::MlScored);
        }

        match bounded(
            cfg.llm_timeout_ms,
            LAYER_LLM,
            self.explainer.explain(email, &heuristic, &ml),
        )
        .await
        {
            LayerOutcome::Ran(llm) => {
                evidences.push(EvidenceItem::new(
                    "llm_verdict",
                    Severity::Low,
                    format!(
                        "reasoning service verdict {} (confidence {:.2})",
                        llm.verdict, llm.confidence
                    ),
                ));
                self.finalize(
                    start,
                    heuristic,
                    Some(ml),
                    Some(llm),
                    evidences,
                    Stage::LlmExplained,
                )
            }
            LayerOutcome::Unavailable(e) => {
                evidences.push(unavailable_evidence(&e));
                self.finalize(start, heuristic, Some(ml), None, evidences, Stage::MlScored)
            }
        }
    }

    /// Most specific available layer dominates: the LLM verdict when it ran,
    /// otherwise the classifier probability, otherwise the heuristic score.
    /// Non-dominating layers stay on the evidence trail only.
    fn finalize(
        &self,
        start: Instant,
        heuristic: HeuristicResult,
        ml: Option<MlResult>,
        llm: Option<LlmResult>,
        evidences: Vec<EvidenceItem>,
        stage_reached: Stage,
    ) -> PipelineResult {
        let (final_score, final_verdict) = if let Some(llm) = &llm {
            (threat_score_for(llm), llm.verdict)
        } else {
            let score = ml
                .as_ref()
                .map(|m| m.probability)
                .unwrap_or(heuristic.score);
            (score, self.verdict_from_score(score))
        };

        let result = PipelineResult {
            stage_reached,
            heuristic,
            ml,
            llm,
            final_score,
            final_verdict,
            evidences,
            total_elapsed_ms: start.elapsed().as_millis() as u64,
        };
        log::info!(
            "pipeline verdict {} (score {:.2}, stage {}) in {}ms",
            result.final_verdict,
            result.final_score,
            result.stage_reached,
            result.total_elapsed_ms
        );
        debug_assert!(stage_ok(&result));
        result
    }

    fn verdict_from_score(&self, score: f64) -> Verdict {
        if score >= self.config.malicious_threshold {
            Verdict::Malicious
        } else if score >= self.config.suspicious_threshold {
            Verdict::Suspicious
        } else {
            Verdict::Benign
        }
    }
}

/// LLM verdicts map onto the 0..1 threat scale around the midpoint so the
/// stored score stays comparable with the other layers.
fn threat_score_for(llm: &LlmResult) -> f64 {
    match llm.verdict {
        Verdict::Malicious => 0.5 + 0.5 * llm.confidence,
        Verdict::Suspicious => 0.5,
        Verdict::Benign => 0.5 - 0.5 * llm.confidence,
    }
}

fn unavailable_evidence(e: &LayerError) -> EvidenceItem {
    EvidenceItem::new("layer_unavailable", Severity::Low, e.to_string())
}

// stage_reached must reflect exactly the fields present.
fn stage_ok(result: &PipelineResult) -> bool {
    match result.stage_reached {
        Stage::HeuristicOnly => result.ml.is_none() && result.llm.is_none(),
        Stage::MlScored => result.ml.is_some() && result.llm.is_none(),
        Stage::LlmExplained => result.ml.is_some() && result.llm.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::MlLabel;
    use crate::config::Config;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockClassifier {
        calls: Arc<AtomicUsize>,
        behavior: MlBehavior,
    }

    #[derive(Clone, Copy)]
    enum MlBehavior {
        Probability(f64),
        Fail,
        Hang,
    }

    #[async_trait]
    impl Classifier for MockClassifier {
        async fn classify(&self, _email: &ParsedEmail) -> Result<MlResult, LayerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                MlBehavior::Probability(p) => Ok(MlResult {
                    probability: p,
                    label: if p >= 0.5 {
                        MlLabel::Phishing
                    } else {
                        MlLabel::Legitimate
                    },
                    elapsed_ms: 1,
                }),
                MlBehavior::Fail => Err(LayerError::failed(LAYER_ML, "backend down")),
                MlBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    struct MockExplainer {
        calls: Arc<AtomicUsize>,
        behavior: LlmBehavior,
    }

    #[derive(Clone, Copy)]
    enum LlmBehavior {
        Verdict(Verdict, f64),
        Fail,
        Hang,
    }

    #[async_trait]
    impl Explainer for MockExplainer {
        async fn explain(
            &self,
            _email: &ParsedEmail,
            _heuristic: &HeuristicResult,
            _ml: &MlResult,
        ) -> Result<LlmResult, LayerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                LlmBehavior::Verdict(verdict, confidence) => Ok(LlmResult {
                    verdict,
                    confidence,
                    explanation: "mock rationale".to_string(),
                    elapsed_ms: 5,
                }),
                LlmBehavior::Fail => Err(LayerError::failed(LAYER_LLM, "service down")),
                LlmBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    struct Rig {
        orchestrator: PipelineOrchestrator,
        ml_calls: Arc<AtomicUsize>,
        llm_calls: Arc<AtomicUsize>,
    }

    fn rig(ml: MlBehavior, llm: LlmBehavior) -> Rig {
        let config = Config::default();
        let ml_calls = Arc::new(AtomicUsize::new(0));
        let llm_calls = Arc::new(AtomicUsize::new(0));
        let orchestrator = PipelineOrchestrator::new(
            HeuristicEngine::from_config(&config),
            Box::new(MockClassifier {
                calls: Arc::clone(&ml_calls),
                behavior: ml,
            }),
            Box::new(MockExplainer {
                calls: Arc::clone(&llm_calls),
                behavior: llm,
            }),
            config.pipeline,
        );
        Rig {
            orchestrator,
            ml_calls,
            llm_calls,
        }
    }

    fn email(subject: &str, body: &str) -> ParsedEmail {
        ParsedEmail {
            message_id: "m1@example.com".to_string(),
            sender: "sender@example.com".to_string(),
            display_name: Some("Sender".to_string()),
            reply_to: None,
            recipients: vec!["rcpt@example.com".to_string()],
            subject: subject.to_string(),
            body_text: body.to_string(),
            body_html: None,
            urls: Vec::new(),
            attachments: Vec::new(),
            headers: HashMap::new(),
        }
    }

    /// No suspicious indicators at all.
    fn clean_email() -> ParsedEmail {
        email("Lunch on Friday?", "Does noon still work for you?")
    }

    /// Mid-band heuristic score: urgency phrasing (0.15) plus the
    /// credential-bait subject (0.25) without any hard indicators.
    fn mild_email() -> ParsedEmail {
        email(
            "Please verify your account details",
            "We noticed unusual activity. Let us know if this was you.",
        )
    }

    /// Multiple high-severity hits push the score past the malicious exit.
    fn blatant_email() -> ParsedEmail {
        let mut e = email(
            "Verify your account within 24 hours",
            "Unusual activity detected. Act now at https://bit.ly/3xy or your \
             account will be suspended.",
        );
        e.display_name = Some("PayPal Security".to_string());
        e.sender = "alerts@paypa1-secure.tk".to_string();
        e.reply_to = Some("recovery@gmail.com".to_string());
        e.urls = vec!["https://bit.ly/3xy".to_string()];
        e
    }

    #[tokio::test]
    async fn test_scenario_a_clean_email_short_circuits_benign() {
        let rig = rig(
            MlBehavior::Probability(0.5),
            LlmBehavior::Verdict(Verdict::Benign, 0.9),
        );
        let result = rig.orchestrator.run(&clean_email()).await;

        assert_eq!(result.stage_reached, Stage::HeuristicOnly);
        assert_eq!(result.final_verdict, Verdict::Benign);
        assert!(result.final_score < 0.05);
        assert!(result.ml.is_none() && result.llm.is_none());
        assert_eq!(rig.ml_calls.load(Ordering::SeqCst), 0);
        assert_eq!(rig.llm_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scenario_b_blatant_email_short_circuits_malicious() {
        let rig = rig(
            MlBehavior::Probability(0.5),
            LlmBehavior::Verdict(Verdict::Benign, 0.9),
        );
        let result = rig.orchestrator.run(&blatant_email()).await;

        assert_eq!(result.stage_reached, Stage::HeuristicOnly);
        assert_eq!(result.final_verdict, Verdict::Malicious);
        assert_eq!(rig.ml_calls.load(Ordering::SeqCst), 0);
        assert_eq!(rig.llm_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scenario_c_ambiguous_case_reaches_llm_once() {
        let rig = rig(
            MlBehavior::Probability(0.5),
            LlmBehavior::Verdict(Verdict::Malicious, 0.85),
        );
        let result = rig.orchestrator.run(&mild_email()).await;

        assert_eq!(result.stage_reached, Stage::LlmExplained);
        assert_eq!(result.final_verdict, Verdict::Malicious);
        let llm = result.llm.as_ref().unwrap();
        assert!(!llm.explanation.is_empty());
        assert_eq!(rig.llm_calls.load(Ordering::SeqCst), 1);
        // LLM dominates; its confidence maps above the ML probability.
        assert!(result.final_score > 0.9);
    }

    #[tokio::test]
    async fn test_confident_ml_skips_llm() {
        let rig = rig(
            MlBehavior::Probability(0.95),
            LlmBehavior::Verdict(Verdict::Benign, 0.9),
        );
        let result = rig.orchestrator.run(&mild_email()).await;

        assert_eq!(result.stage_reached, Stage::MlScored);
        assert_eq!(result.final_verdict, Verdict::Malicious);
        assert_eq!(result.final_score, 0.95);
        assert_eq!(rig.llm_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ml_failure_degrades_to_heuristic_only() {
        let rig = rig(MlBehavior::Fail, LlmBehavior::Verdict(Verdict::Benign, 0.9));
        let result = rig.orchestrator.run(&mild_email()).await;

        assert_eq!(result.stage_reached, Stage::HeuristicOnly);
        assert!(result.ml.is_none());
        assert_eq!(result.final_verdict, Verdict::Suspicious);
        assert_eq!(rig.llm_calls.load(Ordering::SeqCst), 0);
        assert!(result
            .evidences
            .iter()
            .any(|e| e.kind == "layer_unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ml_timeout_treated_as_failure() {
        let rig = rig(MlBehavior::Hang, LlmBehavior::Verdict(Verdict::Benign, 0.9));
        let result = rig.orchestrator.run(&mild_email()).await;

        assert_eq!(result.stage_reached, Stage::HeuristicOnly);
        assert!(result.ml.is_none());
        assert!(result
            .evidences
            .iter()
            .any(|e| e.description.contains("timed out")));
    }

    #[tokio::test]
    async fn test_scenario_d_llm_failure_falls_back_to_ml() {
        let rig = rig(MlBehavior::Probability(0.5), LlmBehavior::Fail);
        let result = rig.orchestrator.run(&mild_email()).await;

        assert_eq!(result.stage_reached, Stage::MlScored);
        assert!(result.llm.is_none());
        assert_eq!(result.final_score, 0.5);
        assert_eq!(result.final_verdict, Verdict::Suspicious);
        assert_eq!(rig.llm_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_timeout_falls_back_to_ml() {
        let rig = rig(MlBehavior::Probability(0.6), LlmBehavior::Hang);
        let result = rig.orchestrator.run(&mild_email()).await;

        assert_eq!(result.stage_reached, Stage::MlScored);
        assert!(result.llm.is_none());
        assert_eq!(result.final_score, 0.6);
    }

    #[tokio::test]
    async fn test_evidence_trail_orders_layers() {
        let rig = rig(
            MlBehavior::Probability(0.5),
            LlmBehavior::Verdict(Verdict::Suspicious, 0.6),
        );
        let result = rig.orchestrator.run(&mild_email()).await;

        let ml_pos = result
            .evidences
            .iter()
            .position(|e| e.kind == "ml_probability")
            .unwrap();
        let llm_pos = result
            .evidences
            .iter()
            .position(|e| e.kind == "llm_verdict")
            .unwrap();
        // Heuristic evidence first, then ML, then LLM.
        assert!(result.evidences[..ml_pos]
            .iter()
            .all(|e| e.kind != "llm_verdict"));
        assert!(ml_pos < llm_pos);
    }
}
