use std::collections::HashSet;

/// Sender-domain allow list. Matching is exact and case-insensitive; a
/// subdomain of a listed domain is not whitelisted.
#[derive(Debug, Clone, Default)]
pub struct WhitelistChecker {
    domains: HashSet<String>,
}

impl WhitelistChecker {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains: HashSet<String> = domains
            .into_iter()
            .map(|d| d.as_ref().trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        if !domains.is_empty() {
            let mut listed: Vec<&str> = domains.iter().map(String::as_str).collect();
            listed.sort_unstable();
            log::info!("Initialized whitelist checker domains={}", listed.join(","));
        }

        WhitelistChecker { domains }
    }

    pub fn is_whitelisted(&self, address: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }

        let Some(domain) = Self::extract_domain(address) else {
            return false;
        };

        let listed = self.domains.contains(&domain);
        if listed {
            log::debug!("Domain is whitelisted domain={} email={}", domain, address);
        }
        listed
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Domain after the single `@`; `None` when there are zero or several.
    fn extract_domain(address: &str) -> Option<String> {
        let mut parts = address.split('@');
        let _local = parts.next()?;
        let domain = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(domain.trim().to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_domain_match() {
        let checker = WhitelistChecker::new(["Example.com ", "trusted.org"]);
        assert!(checker.is_whitelisted("foo@example.com"));
        assert!(checker.is_whitelisted("foo@EXAMPLE.COM"));
        assert!(checker.is_whitelisted("bar@trusted.org"));
        assert!(!checker.is_whitelisted("foo@mail.example.com"));
        assert!(!checker.is_whitelisted("foo@example.com.evil.net"));
    }

    #[test]
    fn test_malformed_addresses_never_match() {
        let checker = WhitelistChecker::new(["example.com"]);
        assert!(!checker.is_whitelisted("example.com"));
        assert!(!checker.is_whitelisted(""));
        assert!(!checker.is_whitelisted("a@b@example.com"));
        assert!(!checker.is_whitelisted("@@example.com"));
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let checker = WhitelistChecker::new(Vec::<String>::new());
        assert!(checker.is_empty());
        assert!(!checker.is_whitelisted("foo@example.com"));
    }

    #[test]
    fn test_blank_entries_are_dropped() {
        let checker = WhitelistChecker::new(["", "  ", "a.com"]);
        assert_eq!(checker.len(), 1);
        assert!(!checker.is_whitelisted("foo@"));
    }
}
