//! Layer 2 — pretrained binary text classifier.
//!
//! The model is an ONNX export taking a single `input_ids` tensor of shape
//! `[1, max_tokens]` and returning phishing/legitimate logits. It is loaded
//! exactly once per process: `get_classifier` guards the first load with a
//! `OnceCell`, so concurrent first use cannot trigger duplicate loads, and a
//! load failure is fatal at acquisition time rather than silently skipped.

use crate::config::ClassifierConfig;
use crate::email::ParsedEmail;
use crate::error::{LayerError, LAYER_ML};
use crate::evidence::Verdict;
use ndarray::Array2;
use once_cell::sync::OnceCell;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

static CLASSIFIER: OnceCell<Arc<TextClassifier>> = OnceCell::new();

/// Process-wide classifier handle, lazily initialized on first use.
pub fn get_classifier(config: &ClassifierConfig) -> Result<Arc<TextClassifier>, LayerError> {
    CLASSIFIER
        .get_or_try_init(|| TextClassifier::load(config).map(Arc::new))
        .map(Arc::clone)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MlLabel {
    Phishing,
    Legitimate,
}

/// Outcome of Layer 2 for one email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlResult {
    /// Phishing-class confidence, 0..1.
    pub probability: f64,
    pub label: MlLabel,
    pub elapsed_ms: u64,
}

impl MlResult {
    pub fn verdict_hint(&self, suspicious_threshold: f64, malicious_threshold: f64) -> Verdict {
        if self.probability >= malicious_threshold {
            Verdict::Malicious
        } else if self.probability >= suspicious_threshold {
            Verdict::Suspicious
        } else {
            Verdict::Benign
        }
    }
}

/// Vocabulary tokenizer matching the training-time preprocessing: lowercase,
/// split on non-alphanumeric runs, fixed window with truncation and padding.
pub struct Tokenizer {
    vocab: HashMap<String, i64>,
    pad_id: i64,
    unk_id: i64,
    cls_id: Option<i64>,
    sep_id: Option<i64>,
    max_tokens: usize,
}

impl Tokenizer {
    pub fn from_vocab(vocab: HashMap<String, i64>, max_tokens: usize) -> Self {
        let pad_id = vocab.get("[PAD]").copied().unwrap_or(0);
        let unk_id = vocab.get("[UNK]").copied().unwrap_or(1);
        let cls_id = vocab.get("[CLS]").copied();
        let sep_id = vocab.get("[SEP]").copied();
        Self {
            vocab,
            pad_id,
            unk_id,
            cls_id,
            sep_id,
            max_tokens,
        }
    }

    pub fn load(path: &str, max_tokens: usize) -> Result<Self, LayerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LayerError::failed(LAYER_ML, format!("vocab read failed: {e}")))?;
        let vocab: HashMap<String, i64> = serde_json::from_str(&content)
            .map_err(|e| LayerError::failed(LAYER_ML, format!("vocab parse failed: {e}")))?;
        if vocab.is_empty() {
            return Err(LayerError::failed(LAYER_ML, "vocabulary is empty"));
        }
        Ok(Self::from_vocab(vocab, max_tokens))
    }

    /// Encode text to exactly `max_tokens` ids.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let lowered = text.to_lowercase();
        let mut ids = Vec::with_capacity(self.max_tokens);

        if let Some(cls) = self.cls_id {
            ids.push(cls);
        }

        let body_budget = self.max_tokens - usize::from(self.sep_id.is_some());
        for word in lowered.split(|c: char| !c.is_alphanumeric()) {
            if ids.len() >= body_budget {
                break;
            }
            if word.is_empty() {
                continue;
            }
            ids.push(self.vocab.get(word).copied().unwrap_or(self.unk_id));
        }

        if let Some(sep) = self.sep_id {
            ids.push(sep);
        }
        ids.resize(self.max_tokens, self.pad_id);
        ids
    }
}

pub struct TextClassifier {
    // ort sessions take &mut to run; inference calls serialize here.
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    decision_threshold: f64,
}

impl TextClassifier {
    pub fn load(config: &ClassifierConfig) -> Result<Self, LayerError> {
        log::info!("loading classifier model from {}", config.model_path);

        if !Path::new(&config.model_path).exists() {
            return Err(LayerError::failed(
                LAYER_ML,
                format!("model not found: {}", config.model_path),
            ));
        }

        let session = Session::builder()
            .map_err(|e| LayerError::failed(LAYER_ML, format!("session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| LayerError::failed(LAYER_ML, format!("optimization level: {e}")))?
            .commit_from_file(&config.model_path)
            .map_err(|e| LayerError::failed(LAYER_ML, format!("model load: {e}")))?;

        let tokenizer = Tokenizer::load(&config.vocab_path, config.max_tokens)?;

        log::info!("classifier model loaded");
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            decision_threshold: config.decision_threshold,
        })
    }

    /// Run one inference. A failure here is a degraded outcome for the
    /// orchestrator to handle, never a crash of the pipeline.
    pub fn classify(&self, email: &ParsedEmail) -> Result<MlResult, LayerError> {
        let start = Instant::now();

        let ids = self.tokenizer.encode(&email.text_content());
        let input = Array2::<i64>::from_shape_vec((1, ids.len()), ids)
            .map_err(|e| LayerError::failed(LAYER_ML, format!("input shape: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| LayerError::failed(LAYER_ML, "session lock poisoned"))?;

        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .ok_or_else(|| LayerError::failed(LAYER_ML, "model has no outputs"))?;

        let input_tensor = Value::from_array(input)
            .map_err(|e| LayerError::failed(LAYER_ML, format!("input tensor: {e}")))?;

        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| LayerError::failed(LAYER_ML, format!("inference failed: {e}")))?;

        let output = outputs
            .get(&output_name)
            .ok_or_else(|| LayerError::failed(LAYER_ML, "model produced no output"))?;

        let (_, logits) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| LayerError::failed(LAYER_ML, format!("output extract: {e}")))?;

        let probability = phishing_probability(logits)
            .ok_or_else(|| LayerError::failed(LAYER_ML, "model output is empty"))?;

        let label = if probability >= self.decision_threshold {
            MlLabel::Phishing
        } else {
            MlLabel::Legitimate
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        log::debug!("classifier: p={probability:.3} label={label:?} in {elapsed_ms}ms");

        Ok(MlResult {
            probability,
            label,
            elapsed_ms,
        })
    }
}

/// Map raw model output to the phishing-class probability. Two logits are
/// softmaxed (class 1 = phishing); a single value is treated as an already
/// sigmoid-activated score.
fn phishing_probability(logits: &[f32]) -> Option<f64> {
    match logits {
        [] => None,
        [single] => Some((*single as f64).clamp(0.0, 1.0)),
        [benign, phishing, ..] => {
            let (b, p) = (*benign as f64, *phishing as f64);
            let max = b.max(p);
            let eb = (b - max).exp();
            let ep = (p - max).exp();
            Some(ep / (eb + ep))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tokenizer() -> Tokenizer {
        let mut vocab = HashMap::new();
        vocab.insert("[PAD]".to_string(), 0);
        vocab.insert("[UNK]".to_string(), 1);
        vocab.insert("[CLS]".to_string(), 2);
        vocab.insert("[SEP]".to_string(), 3);
        vocab.insert("verify".to_string(), 10);
        vocab.insert("your".to_string(), 11);
        vocab.insert("account".to_string(), 12);
        Tokenizer::from_vocab(vocab, 8)
    }

    #[test]
    fn test_encode_known_and_unknown_tokens() {
        let ids = test_tokenizer().encode("Verify your ACCOUNT quickly");
        // [CLS] verify your account [UNK] [SEP] [PAD] [PAD]
        assert_eq!(ids, vec![2, 10, 11, 12, 1, 3, 0, 0]);
    }

    #[test]
    fn test_encode_truncates_to_window() {
        let ids = test_tokenizer().encode("verify your account verify your account verify your");
        assert_eq!(ids.len(), 8);
        // Truncated body keeps the trailing [SEP].
        assert_eq!(*ids.last().unwrap(), 3);
    }

    #[test]
    fn test_encode_pads_empty_input() {
        let ids = test_tokenizer().encode("");
        assert_eq!(ids.len(), 8);
        assert_eq!(ids[0], 2);
        assert_eq!(ids[1], 3);
        assert!(ids[2..].iter().all(|&id| id == 0));
    }

    #[test]
    fn test_phishing_probability_softmax() {
        let p = phishing_probability(&[0.0, 0.0]).unwrap();
        assert!((p - 0.5).abs() < 1e-9);

        let p = phishing_probability(&[-2.0, 2.0]).unwrap();
        assert!(p > 0.95);

        let p = phishing_probability(&[3.0, -3.0]).unwrap();
        assert!(p < 0.05);
    }

    #[test]
    fn test_phishing_probability_sigmoid_passthrough() {
        assert_eq!(phishing_probability(&[0.73]), Some(0.73f32 as f64));
        assert_eq!(phishing_probability(&[]), None);
    }

    #[test]
    fn test_label_thresholds() {
        let result = MlResult {
            probability: 0.8,
            label: MlLabel::Phishing,
            elapsed_ms: 1,
        };
        assert_eq!(result.verdict_hint(0.4, 0.75), Verdict::Malicious);

        let result = MlResult {
            probability: 0.5,
            label: MlLabel::Phishing,
            elapsed_ms: 1,
        };
        assert_eq!(result.verdict_hint(0.4, 0.75), Verdict::Suspicious);
    }
}
