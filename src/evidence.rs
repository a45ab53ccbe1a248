use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorical outcome attached to an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Benign,
    Suspicious,
    Malicious,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Benign => "benign",
            Verdict::Suspicious => "suspicious",
            Verdict::Malicious => "malicious",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One discrete signal found by any layer of the pipeline.
///
/// Layers append evidence in discovery order; items are never mutated once
/// recorded, so the trail reads as a chronological account of the analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub kind: String,
    pub severity: Severity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<serde_json::Value>,
}

impl EvidenceItem {
    pub fn new(kind: &str, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            severity,
            description: description.into(),
            raw_data: None,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw_data = Some(raw);
        self
    }
}

/// Highest pipeline layer that actually executed for an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    HeuristicOnly,
    MlScored,
    LlmExplained,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::HeuristicOnly => "heuristic_only",
            Stage::MlScored => "ml_scored",
            Stage::LlmExplained => "llm_explained",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::HeuristicOnly < Stage::MlScored);
        assert!(Stage::MlScored < Stage::LlmExplained);
    }

    #[test]
    fn test_verdict_serialization() {
        assert_eq!(
            serde_json::to_string(&Verdict::Malicious).unwrap(),
            "\"malicious\""
        );
        let v: Verdict = serde_json::from_str("\"benign\"").unwrap();
        assert_eq!(v, Verdict::Benign);
    }

    #[test]
    fn test_evidence_raw_data_skipped_when_absent() {
        let item = EvidenceItem::new("suspicious_link", Severity::High, "shortener in body");
        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("raw_data"));
    }
}
