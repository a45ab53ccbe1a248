use crate::domain::DomainUtils;
use crate::error::ParseError;
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Attachment metadata kept on the parsed record. Contents stay with the
/// message store upstream; the pipeline only reasons about names and types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

/// Canonical structured form of one inbound transmission. Immutable once
/// produced; every analysis layer reads the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedEmail {
    pub message_id: String,
    pub sender: String,
    pub display_name: Option<String>,
    pub reply_to: Option<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub urls: Vec<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub headers: HashMap<String, String>,
}

impl ParsedEmail {
    pub fn sender_domain(&self) -> Option<String> {
        DomainUtils::extract_domain(&self.sender)
    }

    pub fn reply_to_domain(&self) -> Option<String> {
        self.reply_to
            .as_deref()
            .and_then(DomainUtils::extract_domain)
    }

    /// Textual content fed to the classifier and the explainer.
    pub fn text_content(&self) -> String {
        format!("{}\n{}", self.subject, self.body_text)
    }
}

/// Best-effort MIME normalizer. Unparseable sections degrade to empty
/// fields; only a transmission the MIME parser cannot make sense of at all
/// fails the invocation.
pub struct EmailParser {
    href_regex: Regex,
    url_regex: Regex,
}

impl Default for EmailParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailParser {
    pub fn new() -> Self {
        Self {
            href_regex: Regex::new(r#"(?is)<a[^>]*href\s*=\s*["']([^"']+)["']"#).unwrap(),
            url_regex: Regex::new(r#"(?i)\bhttps?://[^\s<>"')\]]+"#).unwrap(),
        }
    }

    pub fn parse(&self, raw: &[u8]) -> Result<ParsedEmail, ParseError> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::Empty);
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ParseError::Malformed("not a MIME message".to_string()))?;

        let (sender, display_name) = message
            .from()
            .and_then(|addr| addr.first())
            .map(|a| {
                (
                    a.address.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                    a.name.as_ref().map(|n| n.to_string()),
                )
            })
            .unwrap_or((String::new(), None));

        let reply_to = message
            .reply_to()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address.as_ref())
            .map(|s| s.to_string());

        let mut recipients = extract_addresses(message.to());
        recipients.extend(extract_addresses(message.cc()));

        let subject = message.subject().unwrap_or_default().to_string();
        let body_text = message
            .body_text(0)
            .map(|t| t.to_string())
            .unwrap_or_default();
        let body_html = message.body_html(0).map(|t| t.to_string());

        let message_id = message
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("gen-{}", uuid::Uuid::new_v4()));

        let mut headers = HashMap::new();
        for header in message.headers() {
            if let Some(value) = header.value.as_text() {
                headers.insert(header.name.as_str().to_string(), value.to_string());
            }
        }

        let urls = self.extract_urls(&body_text, body_html.as_deref());

        let attachments = message
            .attachments()
            .map(|part| AttachmentMeta {
                filename: part
                    .attachment_name()
                    .unwrap_or("unnamed")
                    .to_string(),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: part.contents().len(),
            })
            .collect();

        Ok(ParsedEmail {
            message_id,
            sender,
            display_name,
            reply_to,
            recipients,
            subject,
            body_text,
            body_html,
            urls,
            attachments,
            headers,
        })
    }

    /// Collect link targets from the plain body and from HTML hrefs,
    /// deduplicated in discovery order. Anything `Url` cannot parse is
    /// dropped rather than failing the parse.
    fn extract_urls(&self, body_text: &str, body_html: Option<&str>) -> Vec<String> {
        let mut seen = Vec::new();

        let mut push = |candidate: &str| {
            let trimmed = candidate.trim_end_matches(['.', ',', ';', '!', '?']);
            if Url::parse(trimmed).is_ok() && !seen.iter().any(|u| u == trimmed) {
                seen.push(trimmed.to_string());
            }
        };

        if let Some(html) = body_html {
            for cap in self.href_regex.captures_iter(html) {
                if let Some(href) = cap.get(1) {
                    push(href.as_str());
                }
            }
        }
        for m in self.url_regex.find_iter(body_text) {
            push(m.as_str());
        }

        seen
    }
}

fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_email() -> &'static [u8] {
        b"From: \"PayPal Support\" <alerts@paypa1-secure.tk>\r\n\
          Reply-To: recovery@gmail.com\r\n\
          To: victim@example.com\r\n\
          Subject: Verify your account now\r\n\
          Message-ID: <abc123@paypa1-secure.tk>\r\n\
          Content-Type: text/plain; charset=utf-8\r\n\
          \r\n\
          Your account is suspended. Visit https://bit.ly/3xy immediately.\r\n"
    }

    #[test]
    fn test_parse_extracts_core_fields() {
        let parser = EmailParser::new();
        let email = parser.parse(sample_email()).unwrap();

        assert_eq!(email.sender, "alerts@paypa1-secure.tk");
        assert_eq!(email.display_name.as_deref(), Some("PayPal Support"));
        assert_eq!(email.reply_to.as_deref(), Some("recovery@gmail.com"));
        assert_eq!(email.recipients, vec!["victim@example.com".to_string()]);
        assert_eq!(email.subject, "Verify your account now");
        assert_eq!(email.message_id, "abc123@paypa1-secure.tk");
        assert!(email.body_text.contains("suspended"));
        assert_eq!(email.urls, vec!["https://bit.ly/3xy".to_string()]);
    }

    #[test]
    fn test_parse_html_links() {
        let raw = b"From: a@b.com\r\n\
                    Subject: hi\r\n\
                    Content-Type: text/html; charset=utf-8\r\n\
                    \r\n\
                    <html><body><a href=\"http://203.0.113.9/login\">click</a></body></html>\r\n";
        let parser = EmailParser::new();
        let email = parser.parse(raw).unwrap();
        assert_eq!(email.urls, vec!["http://203.0.113.9/login".to_string()]);
    }

    #[test]
    fn test_empty_input_is_parse_error() {
        let parser = EmailParser::new();
        assert!(matches!(parser.parse(b"   "), Err(ParseError::Empty)));
        assert!(matches!(parser.parse(b""), Err(ParseError::Empty)));
    }

    #[test]
    fn test_headerless_garbage_degrades_not_panics() {
        // mail-parser treats a bare text blob as a body; the record comes
        // back with empty sender/subject rather than an error.
        let parser = EmailParser::new();
        if let Ok(email) = parser.parse(b"just some text, not an email") {
            assert!(email.sender.is_empty());
            assert!(email.subject.is_empty());
        }
    }

    #[test]
    fn test_sender_domain_helpers() {
        let parser = EmailParser::new();
        let email = parser.parse(sample_email()).unwrap();
        assert_eq!(email.sender_domain().as_deref(), Some("paypa1-secure.tk"));
        assert_eq!(email.reply_to_domain().as_deref(), Some("gmail.com"));
    }
}
