//! Layer 1 — deterministic rule evaluation over the parsed record.
//!
//! No I/O and no blocking calls are permitted here; the whole layer runs in
//! single-digit milliseconds. A rule that cannot be built from its config
//! (bad pattern) is logged and skipped at construction, so one broken rule
//! never aborts the pipeline.

use crate::config::{Config, HeuristicRule, RuleCheck};
use crate::domain::DomainUtils;
use crate::email::ParsedEmail;
use crate::evidence::{EvidenceItem, Severity, Verdict};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use url::Url;

const URL_SHORTENERS: &[&str] = &[
    "bit.ly",
    "tinyurl.com",
    "t.co",
    "goo.gl",
    "ow.ly",
    "is.gd",
    "v.gd",
    "tiny.cc",
    "rb.gy",
    "cutt.ly",
    "shorturl.at",
];

const RISKY_TLDS: &[&str] = &[
    "tk", "ml", "ga", "cf", "gq", "top", "xyz", "icu", "click", "loan", "work",
];

const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "yahoo.com",
    "outlook.com",
    "hotmail.com",
    "aol.com",
    "mail.com",
    "protonmail.com",
    "gmx.com",
];

const URGENCY_PHRASES: &[&str] = &[
    "urgent action required",
    "immediate action",
    "act now",
    "within 24 hours",
    "account will be suspended",
    "account has been suspended",
    "unusual activity",
    "verify your account",
    "confirm your identity",
    "your payment was declined",
    "final notice",
    "last warning",
];

const DANGEROUS_EXTENSIONS: &[&str] = &[
    ".exe", ".scr", ".bat", ".cmd", ".com", ".pif", ".vbs", ".js", ".jar", ".msi", ".iso", ".hta",
];

/// Outcome of Layer 1 for one email. Deterministic for identical input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicResult {
    /// Weighted sum of triggered rules, clamped to 0..1.
    pub score: f64,
    pub matched_rules: Vec<EvidenceItem>,
    pub verdict_hint: Verdict,
    pub elapsed_ms: u64,
}

/// A rule whose patterns survived compilation, ready for evaluation.
struct CompiledRule {
    name: String,
    severity: Severity,
    weight: f64,
    check: CompiledCheck,
}

enum CompiledCheck {
    SenderSpoofing {
        trusted_domains: Vec<String>,
    },
    ReplyToMismatch {
        allow_subdomains: bool,
    },
    FreeMailReplyTo {
        free_mail_domains: Vec<String>,
    },
    SuspiciousLinks {
        check_shorteners: bool,
        check_risky_tlds: bool,
        check_ip_urls: bool,
        extra_patterns: Vec<Regex>,
    },
    UrgencyLanguage {
        phrases: Vec<String>,
    },
    SubjectPattern {
        pattern: Regex,
    },
    BodyPattern {
        pattern: Regex,
    },
    DangerousAttachment {
        extensions: Vec<String>,
    },
}

pub struct HeuristicEngine {
    rules: Vec<CompiledRule>,
    suspicious_threshold: f64,
    malicious_threshold: f64,
}

impl HeuristicEngine {
    pub fn from_config(config: &Config) -> Self {
        let mut rules = Vec::new();
        for rule in &config.rules {
            if !rule.enabled {
                log::debug!("heuristic rule '{}' disabled, skipping", rule.name);
                continue;
            }
            match compile_rule(rule) {
                Ok(compiled) => rules.push(compiled),
                Err(e) => {
                    // Per-rule isolation: a broken rule contributes zero.
                    log::warn!("heuristic rule '{}' skipped: {e}", rule.name);
                }
            }
        }
        log::info!("heuristic engine ready with {} rules", rules.len());
        Self {
            rules,
            suspicious_threshold: config.pipeline.suspicious_threshold,
            malicious_threshold: config.pipeline.malicious_threshold,
        }
    }

    /// Evaluate every rule against the record. Always succeeds.
    pub fn analyze(&self, email: &ParsedEmail) -> HeuristicResult {
        let start = Instant::now();
        let mut matched_rules = Vec::new();
        let mut score = 0.0;

        for rule in &self.rules {
            if let Some(evidence) = evaluate(rule, email) {
                log::debug!(
                    "rule '{}' matched (+{:.2}): {}",
                    rule.name,
                    rule.weight,
                    evidence.description
                );
                score += rule.weight;
                matched_rules.push(evidence);
            }
        }

        let score = score.clamp(0.0, 1.0);
        let verdict_hint = if score >= self.malicious_threshold {
            Verdict::Malicious
        } else if score >= self.suspicious_threshold {
            Verdict::Suspicious
        } else {
            Verdict::Benign
        };

        HeuristicResult {
            score,
            matched_rules,
            verdict_hint,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    #[cfg(test)]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn compile_rule(rule: &HeuristicRule) -> Result<CompiledRule, regex::Error> {
    let check = match &rule.check {
        RuleCheck::SenderSpoofing { trusted_domains } => CompiledCheck::SenderSpoofing {
            trusted_domains: trusted_domains.iter().map(|d| d.to_lowercase()).collect(),
        },
        RuleCheck::ReplyToMismatch { allow_subdomains } => CompiledCheck::ReplyToMismatch {
            allow_subdomains: allow_subdomains.unwrap_or(true),
        },
        RuleCheck::FreeMailReplyTo { free_mail_domains } => CompiledCheck::FreeMailReplyTo {
            free_mail_domains: free_mail_domains.clone().unwrap_or_else(|| {
                FREE_MAIL_DOMAINS.iter().map(|d| d.to_string()).collect()
            }),
        },
        RuleCheck::SuspiciousLinks {
            check_shorteners,
            check_risky_tlds,
            check_ip_urls,
            extra_patterns,
        } => CompiledCheck::SuspiciousLinks {
            check_shorteners: check_shorteners.unwrap_or(true),
            check_risky_tlds: check_risky_tlds.unwrap_or(true),
            check_ip_urls: check_ip_urls.unwrap_or(true),
            extra_patterns: extra_patterns
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()?,
        },
        RuleCheck::UrgencyLanguage { patterns } => CompiledCheck::UrgencyLanguage {
            phrases: patterns
                .clone()
                .unwrap_or_else(|| URGENCY_PHRASES.iter().map(|p| p.to_string()).collect())
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
        },
        RuleCheck::SubjectPattern { pattern } => CompiledCheck::SubjectPattern {
            pattern: Regex::new(pattern)?,
        },
        RuleCheck::BodyPattern { pattern } => CompiledCheck::BodyPattern {
            pattern: Regex::new(pattern)?,
        },
        RuleCheck::DangerousAttachment { extensions } => CompiledCheck::DangerousAttachment {
            extensions: extensions.clone().unwrap_or_else(|| {
                DANGEROUS_EXTENSIONS.iter().map(|e| e.to_string()).collect()
            }),
        },
    };

    Ok(CompiledRule {
        name: rule.name.clone(),
        severity: rule.severity,
        weight: rule.weight,
        check,
    })
}

fn evaluate(rule: &CompiledRule, email: &ParsedEmail) -> Option<EvidenceItem> {
    match &rule.check {
        CompiledCheck::SenderSpoofing { trusted_domains } => {
            check_sender_spoofing(email, trusted_domains)
        }
        CompiledCheck::ReplyToMismatch { allow_subdomains } => {
            check_reply_to_mismatch(email, *allow_subdomains)
        }
        CompiledCheck::FreeMailReplyTo { free_mail_domains } => {
            check_free_mail_reply_to(email, free_mail_domains)
        }
        CompiledCheck::SuspiciousLinks {
            check_shorteners,
            check_risky_tlds,
            check_ip_urls,
            extra_patterns,
        } => check_suspicious_links(
            email,
            *check_shorteners,
            *check_risky_tlds,
            *check_ip_urls,
            extra_patterns,
        ),
        CompiledCheck::UrgencyLanguage { phrases } => check_urgency(email, phrases),
        CompiledCheck::SubjectPattern { pattern } => pattern.is_match(&email.subject).then(|| {
            EvidenceItem::new(
                "subject_pattern",
                rule.severity,
                format!("subject matches pattern for rule '{}'", rule.name),
            )
        }),
        CompiledCheck::BodyPattern { pattern } => pattern.is_match(&email.body_text).then(|| {
            EvidenceItem::new(
                "body_pattern",
                rule.severity,
                format!("body matches pattern for rule '{}'", rule.name),
            )
        }),
        CompiledCheck::DangerousAttachment { extensions } => {
            check_dangerous_attachment(email, extensions)
        }
    }
    .map(|mut evidence| {
        evidence.severity = rule.severity;
        evidence
    })
}

fn check_sender_spoofing(email: &ParsedEmail, trusted_domains: &[String]) -> Option<EvidenceItem> {
    let display = email.display_name.as_deref()?.to_lowercase();
    let sender_domain = email.sender_domain()?;

    for trusted in trusted_domains {
        let brand = trusted.split('.').next().unwrap_or(trusted);
        let claims_brand = display.contains(brand) || display.contains(trusted.as_str());
        if claims_brand && !DomainUtils::is_same_or_subdomain(&sender_domain, trusted) {
            return Some(
                EvidenceItem::new(
                    "sender_spoofing",
                    Severity::High,
                    format!(
                        "display name claims '{brand}' but sender domain is {sender_domain}"
                    ),
                )
                .with_raw(serde_json::json!({
                    "display_name": email.display_name,
                    "sender_domain": sender_domain,
                    "claimed_domain": trusted,
                })),
            );
        }
    }
    None
}

fn check_reply_to_mismatch(email: &ParsedEmail, allow_subdomains: bool) -> Option<EvidenceItem> {
    let reply_domain = email.reply_to_domain()?;
    let sender_domain = email.sender_domain()?;

    let matches = if allow_subdomains {
        DomainUtils::is_same_or_subdomain(&reply_domain, &sender_domain)
            || DomainUtils::is_same_or_subdomain(&sender_domain, &reply_domain)
    } else {
        reply_domain == sender_domain
    };

    (!matches).then(|| {
        EvidenceItem::new(
            "reply_to_mismatch",
            Severity::Medium,
            format!("Reply-To domain {reply_domain} differs from sender domain {sender_domain}"),
        )
    })
}

fn check_free_mail_reply_to(
    email: &ParsedEmail,
    free_mail_domains: &[String],
) -> Option<EvidenceItem> {
    let reply_domain = email.reply_to_domain()?;
    let sender_domain = email.sender_domain()?;

    let reply_is_free = DomainUtils::matches_domain_list(&reply_domain, free_mail_domains);
    let same_domain = DomainUtils::is_same_or_subdomain(&reply_domain, &sender_domain);

    (reply_is_free && !same_domain).then(|| {
        EvidenceItem::new(
            "free_mail_reply_to",
            Severity::Medium,
            format!(
                "Reply-To routes to free provider {reply_domain} while sender is {sender_domain}"
            ),
        )
    })
}

fn check_suspicious_links(
    email: &ParsedEmail,
    check_shorteners: bool,
    check_risky_tlds: bool,
    check_ip_urls: bool,
    extra_patterns: &[Regex],
) -> Option<EvidenceItem> {
    let mut flagged = Vec::new();

    for raw_url in &email.urls {
        let Ok(parsed) = Url::parse(raw_url) else {
            continue;
        };
        let Some(host) = parsed.host_str() else {
            continue;
        };
        let host = host.to_lowercase();

        if check_ip_urls && host.parse::<std::net::IpAddr>().is_ok() {
            flagged.push((raw_url.clone(), "raw IP host"));
            continue;
        }
        if check_shorteners && URL_SHORTENERS.iter().any(|s| host == *s) {
            flagged.push((raw_url.clone(), "URL shortener"));
            continue;
        }
        if check_risky_tlds {
            if let Some(tld) = DomainUtils::tld(&host) {
                if RISKY_TLDS.contains(&tld.as_str()) {
                    flagged.push((raw_url.clone(), "high-abuse TLD"));
                    continue;
                }
            }
        }
        if extra_patterns.iter().any(|p| p.is_match(raw_url)) {
            flagged.push((raw_url.clone(), "configured pattern"));
        }
    }

    if flagged.is_empty() {
        return None;
    }

    let summary = flagged
        .iter()
        .take(3)
        .map(|(url, reason)| format!("{url} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ");

    Some(
        EvidenceItem::new(
            "suspicious_link",
            Severity::High,
            format!("{} suspicious link(s): {summary}", flagged.len()),
        )
        .with_raw(serde_json::json!({
            "urls": flagged.iter().map(|(u, _)| u.clone()).collect::<Vec<_>>(),
        })),
    )
}

fn check_urgency(email: &ParsedEmail, phrases: &[String]) -> Option<EvidenceItem> {
    let text = format!("{} {}", email.subject, email.body_text).to_lowercase();
    let hits: Vec<&String> = phrases.iter().filter(|p| text.contains(p.as_str())).collect();

    if hits.is_empty() {
        return None;
    }

    Some(EvidenceItem::new(
        "urgency_language",
        Severity::Low,
        format!(
            "urgency phrasing: {}",
            hits.iter()
                .take(3)
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        ),
    ))
}

fn check_dangerous_attachment(email: &ParsedEmail, extensions: &[String]) -> Option<EvidenceItem> {
    for attachment in &email.attachments {
        let name = attachment.filename.to_lowercase();
        if let Some(ext) = extensions.iter().find(|ext| name.ends_with(ext.as_str())) {
            return Some(
                EvidenceItem::new(
                    "dangerous_attachment",
                    Severity::High,
                    format!("attachment '{}' has extension {ext}", attachment.filename),
                )
                .with_raw(serde_json::json!({
                    "filename": attachment.filename,
                    "content_type": attachment.content_type,
                    "size": attachment.size,
                })),
            );
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::email::AttachmentMeta;
    use std::collections::HashMap;

    fn engine() -> HeuristicEngine {
        HeuristicEngine::from_config(&Config::default())
    }

    fn clean_email() -> ParsedEmail {
        ParsedEmail {
            message_id: "m1@corp.example".to_string(),
            sender: "alice@corp.example".to_string(),
            display_name: Some("Alice Smith".to_string()),
            reply_to: None,
            recipients: vec!["bob@corp.example".to_string()],
            subject: "Meeting notes from Tuesday".to_string(),
            body_text: "Attached are the notes. See https://corp.example/wiki for context."
                .to_string(),
            body_html: None,
            urls: vec!["https://corp.example/wiki".to_string()],
            attachments: Vec::new(),
            headers: HashMap::new(),
        }
    }

    fn phishing_email() -> ParsedEmail {
        ParsedEmail {
            message_id: "m2@paypa1-secure.tk".to_string(),
            sender: "alerts@paypa1-secure.tk".to_string(),
            display_name: Some("PayPal Security".to_string()),
            reply_to: Some("recovery@gmail.com".to_string()),
            recipients: vec!["victim@example.com".to_string()],
            subject: "Verify your account within 24 hours".to_string(),
            body_text: "Unusual activity detected. Verify your account at https://bit.ly/3xy \
                        or your account will be suspended."
                .to_string(),
            body_html: None,
            urls: vec!["https://bit.ly/3xy".to_string()],
            attachments: Vec::new(),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_clean_email_scores_near_zero() {
        let result = engine().analyze(&clean_email());
        assert!(result.score < 0.05, "score was {}", result.score);
        assert!(result.matched_rules.is_empty());
        assert_eq!(result.verdict_hint, Verdict::Benign);
    }

    #[test]
    fn test_phishing_email_scores_malicious() {
        let result = engine().analyze(&phishing_email());
        // Spoofed display name, free-mail reply-to, mismatch, shortener,
        // urgency and credential-bait subject all trigger.
        assert!(result.score >= 0.75, "score was {}", result.score);
        assert_eq!(result.verdict_hint, Verdict::Malicious);
        assert!(result.matched_rules.len() >= 4);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let email = phishing_email();
        let eng = engine();
        let a = eng.analyze(&email);
        let b = eng.analyze(&email);
        assert_eq!(a.score, b.score);
        assert_eq!(a.matched_rules.len(), b.matched_rules.len());
    }

    #[test]
    fn test_score_clamped_to_one() {
        let mut config = Config::default();
        for rule in &mut config.rules {
            rule.weight = 1.0;
        }
        let result = HeuristicEngine::from_config(&config).analyze(&phishing_email());
        assert!(result.score <= 1.0);
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let mut config = Config::default();
        for rule in &mut config.rules {
            rule.enabled = false;
        }
        let eng = HeuristicEngine::from_config(&config);
        assert_eq!(eng.rule_count(), 0);
        let result = eng.analyze(&phishing_email());
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_invalid_pattern_does_not_poison_engine() {
        let mut config = Config::default();
        config.rules.push(crate::config::HeuristicRule {
            name: "broken".to_string(),
            enabled: true,
            severity: Severity::Low,
            weight: 0.5,
            check: RuleCheck::SubjectPattern {
                pattern: "([unclosed".to_string(),
            },
        });
        let eng = HeuristicEngine::from_config(&config);
        // Broken rule dropped, the rest still evaluate.
        assert_eq!(eng.rule_count(), Config::default().rules.len());
        let result = eng.analyze(&phishing_email());
        assert!(result.score > 0.0);
    }

    #[test]
    fn test_dangerous_attachment_detected() {
        let mut email = clean_email();
        email.attachments.push(AttachmentMeta {
            filename: "invoice.pdf.exe".to_string(),
            content_type: "application/octet-stream".to_string(),
            size: 120_000,
        });
        let result = engine().analyze(&email);
        assert!(result
            .matched_rules
            .iter()
            .any(|e| e.kind == "dangerous_attachment"));
    }

    #[test]
    fn test_ip_url_flagged() {
        let mut email = clean_email();
        email.urls = vec!["http://203.0.113.9/login".to_string()];
        let result = engine().analyze(&email);
        assert!(result
            .matched_rules
            .iter()
            .any(|e| e.kind == "suspicious_link"));
    }

    #[test]
    fn test_subdomain_reply_to_allowed() {
        let mut email = clean_email();
        email.reply_to = Some("help@support.corp.example".to_string());
        let result = engine().analyze(&email);
        assert!(!result
            .matched_rules
            .iter()
            .any(|e| e.kind == "reply_to_mismatch"));
    }
}
