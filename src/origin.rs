//! Browser origin and host policy
//!
//! Decides whether a browser peer's `Origin` is allowed to talk to the
//! gateway. Besides the configured allow-list there is a runtime allow-set
//! which the tunnel supervisor populates with the tunnel's public origin for
//! the lifetime of the tunnel.

use dashmap::DashSet;
use std::collections::HashSet;
use std::net::IpAddr;
use url::Url;

/// Outcome of an origin check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginDecision {
    Allow,
    Deny(&'static str),
}

impl OriginDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, OriginDecision::Allow)
    }

    /// Human-readable reason for a deny, empty for allow
    pub fn reason(&self) -> &'static str {
        match self {
            OriginDecision::Allow => "",
            OriginDecision::Deny(r) => r,
        }
    }
}

/// Origin allow/deny policy with a runtime-mutable allow-set
pub struct OriginPolicy {
    /// Configured origins, normalized at construction
    allowed: HashSet<String>,
    /// Origins granted at runtime (tunnel public origin), normalized on insert
    runtime: DashSet<String>,
}

impl OriginPolicy {
    pub fn new(allowed_origins: &[String]) -> Self {
        let allowed = allowed_origins
            .iter()
            .filter_map(|o| normalize_origin(o))
            .collect();
        Self {
            allowed,
            runtime: DashSet::new(),
        }
    }

    /// Check a request's origin against the policy.
    ///
    /// `request_host` is the value of the `Host` header. Rules fire in order:
    /// configured allow-list, runtime allow-set, same-host, loopback-to-loopback.
    pub fn check(&self, request_host: &str, origin: Option<&str>) -> OriginDecision {
        let raw = match origin {
            Some(o) if !o.trim().is_empty() && o.trim() != "null" => o.trim(),
            _ => return OriginDecision::Deny("origin missing or invalid"),
        };

        let Some(normalized) = normalize_origin(raw) else {
            return OriginDecision::Deny("origin missing or invalid");
        };

        if self.allowed.contains(&normalized) {
            return OriginDecision::Allow;
        }

        if self.runtime.contains(&normalized) {
            return OriginDecision::Allow;
        }

        let origin_authority = authority_of(&normalized);
        let request_host = normalize_host(request_host);
        if !origin_authority.is_empty() && origin_authority == request_host {
            return OriginDecision::Allow;
        }

        let origin_hostname = hostname_of(&origin_authority);
        let request_hostname = hostname_of(&request_host);
        if is_loopback_host(&origin_hostname) && is_loopback_host(&request_hostname) {
            return OriginDecision::Allow;
        }

        OriginDecision::Deny("origin not allowed")
    }

    /// Grant an origin for the lifetime of the process (or until removed)
    pub fn allow_runtime(&self, origin: &str) {
        if let Some(normalized) = normalize_origin(origin) {
            self.runtime.insert(normalized);
        }
    }

    pub fn remove_runtime(&self, origin: &str) {
        if let Some(normalized) = normalize_origin(origin) {
            self.runtime.remove(&normalized);
        }
    }

    pub fn clear_runtime(&self) {
        self.runtime.clear();
    }
}

/// Normalize an origin to lowercase scheme + authority.
///
/// Default ports are dropped, so `HTTPS://A.COM:443` and `https://a.com`
/// normalize identically.
fn normalize_origin(origin: &str) -> Option<String> {
    let url = Url::parse(origin.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_string();
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}

/// Authority (host[:port]) of a normalized origin
fn authority_of(normalized_origin: &str) -> String {
    normalized_origin
        .split_once("://")
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_default()
}

/// Lowercase a Host header value and strip any trailing dot on the hostname
fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    match split_host_port(&host) {
        (name, Some(port)) => format!("{}:{}", name.trim_end_matches('.'), port),
        (name, None) => name.trim_end_matches('.').to_string(),
    }
}

/// Hostname portion of an authority, with IPv6 brackets stripped
fn hostname_of(authority: &str) -> String {
    let (name, _) = split_host_port(authority);
    name.trim_start_matches('[').trim_end_matches(']').to_string()
}

fn split_host_port(authority: &str) -> (String, Option<String>) {
    // IPv6 literals keep their brackets: [::1]:8080
    if let Some(end) = authority.rfind(']') {
        let name = authority[..=end].to_string();
        let port = authority[end + 1..].strip_prefix(':').map(|p| p.to_string());
        return (name, port);
    }
    match authority.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (name.to_string(), Some(port.to_string()))
        }
        _ => (authority.to_string(), None),
    }
}

fn is_loopback_host(hostname: &str) -> bool {
    if hostname == "localhost" {
        return true;
    }
    hostname
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(origins: &[&str]) -> OriginPolicy {
        let owned: Vec<String> = origins.iter().map(|s| s.to_string()).collect();
        OriginPolicy::new(&owned)
    }

    #[test]
    fn test_missing_or_invalid_origin_denied() {
        let p = policy(&[]);
        assert_eq!(
            p.check("gateway", None),
            OriginDecision::Deny("origin missing or invalid")
        );
        assert_eq!(
            p.check("gateway", Some("")),
            OriginDecision::Deny("origin missing or invalid")
        );
        assert_eq!(
            p.check("gateway", Some("null")),
            OriginDecision::Deny("origin missing or invalid")
        );
        assert_eq!(
            p.check("gateway", Some("not a url")),
            OriginDecision::Deny("origin missing or invalid")
        );
    }

    #[test]
    fn test_configured_allow_list() {
        let p = policy(&["https://app.example"]);
        assert!(p.check("gateway", Some("https://app.example")).is_allowed());
        assert_eq!(
            p.check("gateway", Some("https://evil.example")),
            OriginDecision::Deny("origin not allowed")
        );
    }

    #[test]
    fn test_case_insensitive() {
        let p = policy(&["https://a.com"]);
        assert!(p.check("gateway", Some("HTTPS://A.COM")).is_allowed());
        assert!(p.check("gateway", Some("https://a.com")).is_allowed());
    }

    #[test]
    fn test_runtime_allow_set() {
        let p = policy(&[]);
        let origin = "https://fuzzy-bear-42.trycloudflare.com";
        assert!(!p.check("gateway", Some(origin)).is_allowed());

        p.allow_runtime(origin);
        assert!(p.check("gateway", Some(origin)).is_allowed());

        p.clear_runtime();
        assert!(!p.check("gateway", Some(origin)).is_allowed());
    }

    #[test]
    fn test_same_host_allowed() {
        let p = policy(&[]);
        assert!(p
            .check("gateway.example:8080", Some("http://gateway.example:8080"))
            .is_allowed());
        assert!(p.check("Gateway.Example", Some("https://gateway.example")).is_allowed());
    }

    #[test]
    fn test_loopback_to_loopback_allowed() {
        let p = policy(&[]);
        assert!(p
            .check("localhost:18789", Some("http://127.0.0.1:3000"))
            .is_allowed());
        assert!(p.check("127.0.0.1:18789", Some("http://[::1]:5173")).is_allowed());
        // Loopback origin against a public host is still denied
        assert_eq!(
            p.check("gateway.example", Some("http://127.0.0.1:3000")),
            OriginDecision::Deny("origin not allowed")
        );
    }

    #[test]
    fn test_deny_reason_string() {
        let p = policy(&["https://app.example"]);
        assert_eq!(
            p.check("gateway", Some("https://evil.example")).reason(),
            "origin not allowed"
        );
    }
}
