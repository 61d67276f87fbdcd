//! Host allow-list for sandboxes in `restricted` network mode

use crate::config::NetworkPolicyConfig;

/// Allowed hosts: exact names or `*.suffix` wildcards
#[derive(Debug, Clone)]
pub struct NetworkPolicy {
    allowed_domains: Vec<String>,
}

impl NetworkPolicy {
    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self { allowed_domains }
    }

    pub fn from_config(config: &NetworkPolicyConfig) -> Self {
        Self::new(config.allowed_domains.clone())
    }

    pub fn allows_host(&self, host: &str) -> bool {
        self.allowed_domains.iter().any(|p| domain_matches(p, host))
    }

    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self::from_config(&NetworkPolicyConfig::default())
    }
}

/// Exact match, or `*.example.com` matching `example.com` and any subdomain
fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(base) => host == base || host.ends_with(&format!(".{}", base)),
        None => host == pattern,
    }
}

/// Split a URL into (scheme, host); bare hosts are treated as https
pub(crate) fn parse_url(url: &str) -> Option<(String, String)> {
    let url = url.trim();
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("https".to_string(), url),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = if let Some(v6) = host_port.strip_prefix('[') {
        v6.split(']').next().unwrap_or_default()
    } else {
        host_port.split(':').next().unwrap_or_default()
    };
    if host.is_empty() {
        return None;
    }
    Some((scheme, host.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_exact_match() {
        assert!(domain_matches("pypi.org", "pypi.org"));
        assert!(domain_matches("pypi.org", "PyPI.org"));
        assert!(!domain_matches("pypi.org", "evil-pypi.org"));
    }

    #[test]
    fn test_domain_wildcard_match() {
        assert!(domain_matches("*.githubusercontent.com", "raw.githubusercontent.com"));
        assert!(domain_matches("*.githubusercontent.com", "githubusercontent.com"));
        assert!(!domain_matches("*.githubusercontent.com", "evilgithubusercontent.com"));
    }

    #[test]
    fn test_parse_url() {
        assert_eq!(
            parse_url("https://user@API.github.com:443/repos?x=1"),
            Some(("https".to_string(), "api.github.com".to_string()))
        );
        assert_eq!(
            parse_url("crates.io/api/v1"),
            Some(("https".to_string(), "crates.io".to_string()))
        );
        assert_eq!(parse_url("http://[::1]:8080/"), Some(("http".to_string(), "::1".to_string())));
        assert_eq!(parse_url("https://"), None);
    }

    #[test]
    fn test_default_policy() {
        let policy = NetworkPolicy::default();
        assert!(policy.allows_host("api.github.com"));
        assert!(!policy.allows_host("example.com"));
    }
}
