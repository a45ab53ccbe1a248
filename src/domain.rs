/// Domain helpers shared by the parser and the heuristic rules.
pub struct DomainUtils;

impl DomainUtils {
    /// Extract the domain part of an email address, lowercased.
    pub fn extract_domain(address: &str) -> Option<String> {
        let trimmed = address.trim().trim_matches(|c| c == '<' || c == '>');
        let domain = trimmed.split('@').nth(1)?;
        if domain.is_empty() {
            return None;
        }
        Some(domain.to_lowercase())
    }

    /// Check whether `domain` equals `parent` or is one of its subdomains.
    pub fn is_same_or_subdomain(domain: &str, parent: &str) -> bool {
        let domain = domain.to_lowercase();
        let parent = parent.to_lowercase();
        domain == parent || domain.ends_with(&format!(".{parent}"))
    }

    /// Check if domain matches any entry in the list (subdomains included).
    pub fn matches_domain_list(domain: &str, domain_list: &[String]) -> bool {
        domain_list
            .iter()
            .any(|entry| Self::is_same_or_subdomain(domain, entry))
    }

    /// The TLD label of a domain, if it has one.
    pub fn tld(domain: &str) -> Option<String> {
        let domain = domain.to_lowercase();
        let tld = domain.rsplit('.').next()?;
        if tld.is_empty() || tld == domain {
            return None;
        }
        Some(tld.to_string())
    }
}
