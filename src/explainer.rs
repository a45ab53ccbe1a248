//! Layer 3 — natural-language rationale for ambiguous cases.
//!
//! Invoked only when the gating policy lands in the ambiguous band. Builds a
//! prompt from the parsed record and prior-layer evidence, calls an
//! OpenAI-compatible chat endpoint, and parses the reply into a verdict,
//! confidence and explanation. The orchestrator owns the timeout; failures
//! here always degrade, never abort.

use crate::classifier::MlResult;
use crate::config::ExplainerConfig;
use crate::email::ParsedEmail;
use crate::error::{LayerError, LAYER_LLM};
use crate::evidence::Verdict;
use crate::heuristics::HeuristicResult;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Outcome of Layer 3 for one email. Present only when the layer executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResult {
    pub verdict: Verdict,
    pub confidence: f64,
    pub explanation: String,
    pub elapsed_ms: u64,
}

pub struct LlmExplainer {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    content: String,
}

/// The JSON object the model is instructed to answer with.
#[derive(Deserialize)]
struct AnalystReply {
    verdict: String,
    confidence: f64,
    explanation: String,
}

const SYSTEM_PROMPT: &str = "You are an email security analyst. You receive a \
summary of one email plus the signals produced by a rule engine and a text \
classifier. Decide whether the email is phishing. Respond with exactly one \
JSON object: {\"verdict\": \"benign\"|\"suspicious\"|\"malicious\", \
\"confidence\": <0..1>, \"explanation\": \"<one short paragraph>\"}.";

impl LlmExplainer {
    pub fn from_config(config: &ExplainerConfig) -> Result<Self, LayerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .user_agent(concat!("GuardIA/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LayerError::failed(LAYER_LLM, format!("http client: {e}")))?;

        let api_key = std::env::var(&config.api_key_env).ok();
        if !config.endpoint.is_empty() && api_key.is_none() {
            log::warn!(
                "reasoning service configured but {} is not set",
                config.api_key_env
            );
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }

    pub async fn explain(
        &self,
        email: &ParsedEmail,
        heuristic: &HeuristicResult,
        ml: &MlResult,
    ) -> Result<LlmResult, LayerError> {
        if self.endpoint.is_empty() {
            return Err(LayerError::NotConfigured { layer: LAYER_LLM });
        }

        let start = Instant::now();
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: build_prompt(email, heuristic, ml),
                },
            ],
            temperature: 0.0,
        };

        let mut req = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| LayerError::failed(LAYER_LLM, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LayerError::failed(
                LAYER_LLM,
                format!("reasoning service returned HTTP {status}"),
            ));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LayerError::failed(LAYER_LLM, format!("invalid response body: {e}")))?;

        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| LayerError::failed(LAYER_LLM, "response has no choices"))?;

        let (verdict, confidence, explanation) = parse_reply(content)?;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        log::debug!("explainer: {verdict} ({confidence:.2}) in {elapsed_ms}ms");

        Ok(LlmResult {
            verdict,
            confidence,
            explanation,
            elapsed_ms,
        })
    }
}

fn build_prompt(email: &ParsedEmail, heuristic: &HeuristicResult, ml: &MlResult) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Sender: {} (display name: {})\n",
        email.sender,
        email.display_name.as_deref().unwrap_or("none")
    ));
    if let Some(reply_to) = &email.reply_to {
        prompt.push_str(&format!("Reply-To: {reply_to}\n"));
    }
    prompt.push_str(&format!("Subject: {}\n", email.subject));
    if !email.urls.is_empty() {
        prompt.push_str(&format!("Links: {}\n", email.urls.join(", ")));
    }
    if !email.attachments.is_empty() {
        let names: Vec<&str> = email
            .attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect();
        prompt.push_str(&format!("Attachments: {}\n", names.join(", ")));
    }

    let body: String = email.body_text.chars().take(2000).collect();
    prompt.push_str(&format!("\nBody:\n{body}\n"));

    prompt.push_str(&format!(
        "\nRule engine score: {:.2} ({} rule(s) matched)\n",
        heuristic.score,
        heuristic.matched_rules.len()
    ));
    for item in &heuristic.matched_rules {
        prompt.push_str(&format!("- [{:?}] {}\n", item.severity, item.description));
    }
    prompt.push_str(&format!(
        "Classifier phishing probability: {:.3}\n",
        ml.probability
    ));

    prompt
}

/// Parse the analyst JSON out of the reply, tolerating markdown code fences.
fn parse_reply(content: &str) -> Result<(Verdict, f64, String), LayerError> {
    let trimmed = strip_code_fence(content);

    let reply: AnalystReply = serde_json::from_str(trimmed)
        .map_err(|e| LayerError::failed(LAYER_LLM, format!("unparseable analyst reply: {e}")))?;

    let verdict = match reply.verdict.to_lowercase().as_str() {
        "benign" => Verdict::Benign,
        "suspicious" => Verdict::Suspicious,
        "malicious" | "phishing" => Verdict::Malicious,
        other => {
            return Err(LayerError::failed(
                LAYER_LLM,
                format!("unknown verdict '{other}'"),
            ))
        }
    };

    if reply.explanation.trim().is_empty() {
        return Err(LayerError::failed(LAYER_LLM, "empty explanation"));
    }

    Ok((
        verdict,
        reply.confidence.clamp(0.0, 1.0),
        reply.explanation,
    ))
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
