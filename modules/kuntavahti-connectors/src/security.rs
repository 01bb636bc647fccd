//! URL validation for SSRF protection.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use kuntavahti_common::{FetchError, FetchResult};
use url::Url;

/// Validates URLs before fetching to keep the crawler off internal services,
/// private ranges, cloud metadata endpoints, and non-HTTP schemes. DNS is
/// resolved exactly once and the resolved addresses are handed back to the
/// caller so the connection goes to the same IPs the validator saw.
#[derive(Debug, Clone)]
pub struct UrlValidator {
    blocked_hosts: HashSet<String>,
    blocked_nets: Vec<ipnet::IpNet>,
    allowed_hosts: HashSet<String>,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlValidator {
    pub fn new() -> Self {
        Self {
            blocked_hosts: [
                "localhost",
                "metadata.google.internal",
                "metadata.gke.internal",
                "instance-data",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_nets: vec![
                "0.0.0.0/8".parse().unwrap(),
                "10.0.0.0/8".parse().unwrap(),
                "100.64.0.0/10".parse().unwrap(),
                "127.0.0.0/8".parse().unwrap(),
                "169.254.0.0/16".parse().unwrap(), // Link-local / cloud metadata
                "172.16.0.0/12".parse().unwrap(),
                "192.168.0.0/16".parse().unwrap(),
                "224.0.0.0/4".parse().unwrap(), // Multicast
                "240.0.0.0/4".parse().unwrap(), // Reserved
                "::/128".parse().unwrap(),
                "::1/128".parse().unwrap(),
                "fc00::/7".parse().unwrap(),
                "fe80::/10".parse().unwrap(),
                "ff00::/8".parse().unwrap(),
            ],
            allowed_hosts: HashSet::new(),
        }
    }

    /// Exempt a host from validation. Test servers on loopback need this.
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into());
        self
    }

    /// Syntactic checks plus literal-IP screening.
    pub fn validate(&self, url: &Url) -> FetchResult<()> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(FetchError::BlockedUrl(format!(
                "disallowed scheme {}",
                url.scheme()
            )));
        }
        if url.fragment().is_some() {
            return Err(FetchError::BlockedUrl(format!(
                "URL carries a fragment: {url}"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::BlockedUrl(format!("URL has no host: {url}")))?;

        if self.allowed_hosts.contains(host) {
            return Ok(());
        }
        if self.blocked_hosts.contains(host) {
            return Err(FetchError::BlockedUrl(format!("blocked host {host}")));
        }
        if let Ok(ip) = strip_brackets(host).parse::<IpAddr>() {
            self.check_ip(ip, host)?;
        }
        Ok(())
    }

    /// Validate and resolve, returning the socket addresses the connection
    /// must be pinned to. Hostnames resolving to any blocked range are
    /// rejected outright.
    pub async fn validate_and_resolve(&self, url: &Url) -> FetchResult<Vec<SocketAddr>> {
        self.validate(url)?;

        let host = url
            .host_str()
            .ok_or_else(|| FetchError::BlockedUrl(format!("URL has no host: {url}")))?;
        let port = url
            .port()
            .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });

        if let Ok(ip) = strip_brackets(host).parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(format!("{host}:{port}"))
            .await
            .map_err(|e| FetchError::DnsFailure {
                host: host.to_string(),
                detail: e.to_string(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(FetchError::DnsFailure {
                host: host.to_string(),
                detail: "no addresses".to_string(),
            });
        }

        if self.allowed_hosts.contains(host) {
            return Ok(addrs);
        }
        for addr in &addrs {
            self.check_ip(addr.ip(), host)?;
        }
        Ok(addrs)
    }

    fn check_ip(&self, ip: IpAddr, host: &str) -> FetchResult<()> {
        for net in &self.blocked_nets {
            if net.contains(&ip) {
                return Err(FetchError::BlockedUrl(format!(
                    "{host} resolves into blocked range ({ip})"
                )));
            }
        }
        Ok(())
    }
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}
