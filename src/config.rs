use crate::evidence::Severity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub classifier: ClassifierConfig,
    pub explainer: ExplainerConfig,
    pub relay: RelayConfig,
    pub storage: StorageConfig,
    pub statistics: Option<StatisticsConfig>,
    pub rules: Vec<HeuristicRule>,
}

/// Gating thresholds and per-layer timeouts for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Heuristic score at or below which the email is confidently benign
    /// and the pipeline stops after Layer 1.
    #[serde(default = "default_benign_exit")]
    pub benign_exit: f64,
    /// Heuristic score at or above which the email is confidently malicious
    /// and the pipeline stops after Layer 1.
    #[serde(default = "default_malicious_exit")]
    pub malicious_exit: f64,
    /// Combined heuristic+ML score range that gates Layer 3.
    #[serde(default = "default_ambiguous_low")]
    pub ambiguous_low: f64,
    #[serde(default = "default_ambiguous_high")]
    pub ambiguous_high: f64,
    /// Weight of the classifier probability in the combined gating signal.
    #[serde(default = "default_ml_blend_weight")]
    pub ml_blend_weight: f64,
    /// Verdict bands for score-derived verdicts.
    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_threshold: f64,
    #[serde(default = "default_malicious_threshold")]
    pub malicious_threshold: f64,
    #[serde(default = "default_ml_timeout_ms")]
    pub ml_timeout_ms: u64,
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,
}

fn default_benign_exit() -> f64 {
    0.15
}
fn default_malicious_exit() -> f64 {
    0.75
}
fn default_ambiguous_low() -> f64 {
    0.35
}
fn default_ambiguous_high() -> f64 {
    0.65
}
fn default_ml_blend_weight() -> f64 {
    0.6
}
fn default_suspicious_threshold() -> f64 {
    0.4
}
fn default_malicious_threshold() -> f64 {
    0.75
}
fn default_ml_timeout_ms() -> u64 {
    800
}
fn default_llm_timeout_ms() -> u64 {
    4000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            benign_exit: default_benign_exit(),
            malicious_exit: default_malicious_exit(),
            ambiguous_low: default_ambiguous_low(),
            ambiguous_high: default_ambiguous_high(),
            ml_blend_weight: default_ml_blend_weight(),
            suspicious_threshold: default_suspicious_threshold(),
            malicious_threshold: default_malicious_threshold(),
            ml_timeout_ms: default_ml_timeout_ms(),
            llm_timeout_ms: default_llm_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub model_path: String,
    pub vocab_path: String,
    /// Token window the model was exported with; input is truncated or
    /// padded to exactly this length.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Phishing-class probability at or above which the label is phishing.
    #[serde(default = "default_decision_threshold")]
    pub decision_threshold: f64,
}

fn default_max_tokens() -> usize {
    256
}
fn default_decision_threshold() -> f64 {
    0.5
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: "/var/lib/guardia/model.onnx".to_string(),
            vocab_path: "/var/lib/guardia/vocab.json".to_string(),
            max_tokens: default_max_tokens(),
            decision_threshold: default_decision_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainerConfig {
    /// OpenAI-compatible chat completions endpoint. Empty disables Layer 3.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never lives in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "GUARDIA_LLM_API_KEY".to_string()
}
fn default_llm_http_timeout() -> u64 {
    10
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            http_timeout_seconds: default_llm_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Admin endpoint of the mail relay. Empty selects the log-only relay
    /// (useful for test rigs and dry runs).
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_relay_timeout")]
    pub timeout_seconds: u64,
}

fn default_relay_timeout() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_seconds: default_relay_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "/var/lib/guardia/cases.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub database_path: String,
    pub flush_interval_seconds: Option<u64>,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: "/var/lib/guardia/stats.db".to_string(),
            flush_interval_seconds: Some(60),
        }
    }
}

/// One data-declared heuristic rule: a check variant plus the weight and
/// severity it contributes when triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeuristicRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub severity: Severity,
    pub weight: f64,
    pub check: RuleCheck,
}

fn default_enabled() -> bool {
    true
}

/// Closed set of heuristic checks evaluated uniformly by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum RuleCheck {
    /// From display name claims a trusted brand while the sender domain is
    /// unrelated to that brand.
    SenderSpoofing { trusted_domains: Vec<String> },
    /// Reply-To domain differs from the sender domain.
    ReplyToMismatch { allow_subdomains: Option<bool> },
    /// Reply-To points at a free mail provider the sender domain does not use.
    FreeMailReplyTo {
        free_mail_domains: Option<Vec<String>>,
    },
    /// Link targets using shorteners, risky TLDs, raw IP hosts, or custom
    /// suspicious patterns.
    SuspiciousLinks {
        check_shorteners: Option<bool>,
        check_risky_tlds: Option<bool>,
        check_ip_urls: Option<bool>,
        extra_patterns: Option<Vec<String>>,
    },
    /// Urgency/panic phrasing in subject or body.
    UrgencyLanguage { patterns: Option<Vec<String>> },
    SubjectPattern { pattern: String },
    BodyPattern { pattern: String },
    /// Attachments with executable or script extensions.
    DangerousAttachment { extensions: Option<Vec<String>> },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pipeline: PipelineConfig::default(),
            classifier: ClassifierConfig::default(),
            explainer: ExplainerConfig::default(),
            relay: RelayConfig::default(),
            storage: StorageConfig::default(),
            statistics: Some(StatisticsConfig::default()),
            rules: default_rules(),
        }
    }
}

fn default_rules() -> Vec<HeuristicRule> {
    vec![
        HeuristicRule {
            name: "Display-name brand spoofing".to_string(),
            enabled: true,
            severity: Severity::High,
            weight: 0.45,
            check: RuleCheck::SenderSpoofing {
                trusted_domains: vec![
                    "paypal.com".to_string(),
                    "microsoft.com".to_string(),
                    "apple.com".to_string(),
                    "amazon.com".to_string(),
                    "google.com".to_string(),
                    "docusign.com".to_string(),
                ],
            },
        },
        HeuristicRule {
            name: "Reply-To domain mismatch".to_string(),
            enabled: true,
            severity: Severity::Medium,
            weight: 0.25,
            check: RuleCheck::ReplyToMismatch {
                allow_subdomains: Some(true),
            },
        },
        HeuristicRule {
            name: "Free-mail Reply-To".to_string(),
            enabled: true,
            severity: Severity::Medium,
            weight: 0.2,
            check: RuleCheck::FreeMailReplyTo {
                free_mail_domains: None,
            },
        },
        HeuristicRule {
            name: "Suspicious links".to_string(),
            enabled: true,
            severity: Severity::High,
            weight: 0.35,
            check: RuleCheck::SuspiciousLinks {
                check_shorteners: Some(true),
                check_risky_tlds: Some(true),
                check_ip_urls: Some(true),
                extra_patterns: None,
            },
        },
        HeuristicRule {
            name: "Urgency language".to_string(),
            enabled: true,
            severity: Severity::Low,
            weight: 0.15,
            check: RuleCheck::UrgencyLanguage { patterns: None },
        },
        HeuristicRule {
            name: "Credential-bait subject".to_string(),
            enabled: true,
            severity: Severity::Medium,
            weight: 0.25,
            check: RuleCheck::SubjectPattern {
                pattern: r"(?i)(verify|suspend|locked|confirm|reset).{0,40}(account|password|identity|access)".to_string(),
            },
        },
        HeuristicRule {
            name: "Dangerous attachment".to_string(),
            enabled: true,
            severity: Severity::High,
            weight: 0.4,
            check: RuleCheck::DangerousAttachment { extensions: None },
        },
    ]
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.pipeline;
        anyhow::ensure!(
            p.benign_exit < p.malicious_exit,
            "benign_exit must be below malicious_exit"
        );
        anyhow::ensure!(
            p.ambiguous_low <= p.ambiguous_high,
            "ambiguous_low must not exceed ambiguous_high"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&p.ml_blend_weight),
            "ml_blend_weight must be within 0..1"
        );
        anyhow::ensure!(
            p.suspicious_threshold < p.malicious_threshold,
            "suspicious_threshold must be below malicious_threshold"
        );
        for rule in &self.rules {
            anyhow::ensure!(
                rule.weight >= 0.0 && rule.weight <= 1.0,
                "rule '{}' weight must be within 0..1",
                rule.name
            );
        }
        Ok(())
    }
}
