//! Pre-dispatch fetch policy: domain allow/deny lists and private address
//! blocking.
//!
//! Only literal IP hosts and `localhost` are checked against the reserved
//! ranges; DNS answers are not inspected.

use std::net::IpAddr;

use ripfetch_core::{AppConfig, ClassifiedError};
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("domain not in allowlist: {0}")]
    NotAllowed(String),

    #[error("domain is denylisted: {0}")]
    Denied(String),

    #[error("blocked address: {0} (private/reserved)")]
    PrivateAddress(String),
}

impl From<PolicyError> for ClassifiedError {
    fn from(err: PolicyError) -> Self {
        ClassifiedError::policy_blocked(err.to_string())
    }
}

/// Which URLs may be fetched at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchPolicy {
    /// When non-empty, only these domains (and their subdomains) are allowed
    pub allowlist: Vec<String>,
    /// Domains (and their subdomains) that are always refused
    pub denylist: Vec<String>,
    /// Permit loopback, RFC 1918, link-local and similar hosts
    pub allow_private: bool,
}

impl From<&AppConfig> for FetchPolicy {
    fn from(config: &AppConfig) -> Self {
        let normalize = |list: &[String]| list.iter().map(|d| d.trim().trim_matches('.').to_lowercase()).collect::<Vec<String>>();
        Self {
            allowlist: normalize(&config.allowlist_domains),
            denylist: normalize(&config.denylist_domains),
            allow_private: config.allow_private_addresses,
        }
    }
}

impl FetchPolicy {
    /// A policy that lets everything through.
    pub fn permissive() -> Self {
        Self { allow_private: true, ..Default::default() }
    }

    pub fn check(&self, url: &Url) -> Result<(), PolicyError> {
        let host = url.host_str().unwrap_or_default().to_lowercase();

        if self.denylist.iter().any(|d| domain_matches(&host, d)) {
            return Err(PolicyError::Denied(host));
        }
        if !self.allowlist.is_empty() && !self.allowlist.iter().any(|d| domain_matches(&host, d)) {
            return Err(PolicyError::NotAllowed(host));
        }

        if !self.allow_private {
            let private = match url.host() {
                Some(Host::Ipv4(ip)) => is_private_or_reserved(IpAddr::V4(ip)),
                Some(Host::Ipv6(ip)) => is_private_or_reserved(IpAddr::V6(ip)),
                Some(Host::Domain(d)) => d.eq_ignore_ascii_case("localhost") || d.ends_with(".localhost"),
                None => false,
            };
            if private {
                return Err(PolicyError::PrivateAddress(host));
            }
        }

        Ok(())
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    !domain.is_empty()
        && (host == domain || host.strip_suffix(domain).is_some_and(|prefix| prefix.ends_with('.')))
}

/// Loopback, RFC 1918, link-local, multicast, broadcast, unspecified and IPv6
/// unique-local addresses.
pub fn is_private_or_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_or_reserved(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
