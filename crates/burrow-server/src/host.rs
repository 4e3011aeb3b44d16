//! Subdomain extraction from `Host` headers

use std::net::IpAddr;

/// Extracts the tunnel id from a request host
///
/// With configured base domains, only hosts under one of them yield a
/// subdomain. Without any, the last two labels are taken as the base
/// domain (`*.localhost` counts as a one-label base).
#[derive(Debug, Clone, Default)]
pub struct HostResolver {
    /// Lowercase, longest first
    domains: Vec<String>,
}

impl HostResolver {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut domains: Vec<String> = domains
            .into_iter()
            .map(|d| d.as_ref().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        domains.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        domains.dedup();

        Self { domains }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Subdomain part of `host`, `None` for a bare base domain or an IP
    pub fn subdomain(&self, host: &str) -> Option<String> {
        let hostname = normalize(host)?;

        if hostname.parse::<IpAddr>().is_ok() {
            return None;
        }

        if !self.domains.is_empty() {
            // Longest matching base wins, and a bare base has no subdomain
            return self
                .domains
                .iter()
                .find(|domain| {
                    hostname == **domain || strip_base(&hostname, domain).is_some()
                })
                .and_then(|domain| strip_base(&hostname, domain))
                .map(str::to_string);
        }

        let labels: Vec<&str> = hostname.split('.').collect();
        let base_labels = if labels.last() == Some(&"localhost") { 1 } else { 2 };
        if labels.len() <= base_labels || labels.iter().any(|l| l.is_empty()) {
            return None;
        }

        Some(labels[..labels.len() - base_labels].join("."))
    }
}

/// Lowercase hostname without port or trailing dot
fn normalize(host: &str) -> Option<String> {
    let host = host.trim();
    if host.is_empty() || host.starts_with('[') {
        return None;
    }

    let hostname = match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        Some(_) => return None,
        None => host,
    };

    let hostname = hostname.trim_end_matches('.');
    if hostname.is_empty() {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

fn strip_base<'a>(hostname: &'a str, domain: &str) -> Option<&'a str> {
    let prefix = hostname.strip_suffix(domain)?.strip_suffix('.')?;
    (!prefix.is_empty()).then_some(prefix)
}
