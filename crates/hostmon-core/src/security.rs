//! Host-based admission policy for passive connections.
//!
//! Each entry of the allowed hosts list becomes one [`HostPattern`]:
//!
//! | Form | Example |
//! |---|---|
//! | exact address | `192.168.1.10`, `::1` |
//! | CIDR network | `10.0.0.0/8`, `fd00::/8` |
//! | IPv4 wildcard | `192.168.*.*` |
//! | IPv4 last-octet range | `192.168.1.10-20` |
//! | hostname | `monitor.example.com` (resolved once, at construction) |
//!
//! Evaluation is default-deny: a peer is allowed only if some pattern
//! matches it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

use tracing::{debug, warn};

use crate::error::PolicyError;

/// Outcome of evaluating a peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityDecision {
    Allow,
    Deny,
}

impl SecurityDecision {
    pub fn is_allowed(self) -> bool {
        self == SecurityDecision::Allow
    }
}

/// A single address-matching pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// One specific address
    Exact(IpAddr),

    /// A CIDR network
    Network { base: IpAddr, prefix: u8 },

    /// IPv4 octets where `None` matches anything
    Wildcard([Option<u8>; 4]),

    /// IPv4 addresses sharing the first three octets, last octet in range
    Range { network: [u8; 3], first: u8, last: u8 },
}

impl HostPattern {
    /// Parses the literal address forms.
    ///
    /// Returns `Ok(None)` when the entry is not an address form and should
    /// be treated as a hostname.
    pub fn parse(entry: &str) -> Result<Option<Self>, PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidPattern {
            pattern: entry.to_string(),
            reason: reason.to_string(),
        };

        if let Ok(ip) = entry.parse::<IpAddr>() {
            return Ok(Some(HostPattern::Exact(ip.to_canonical())));
        }

        if let Some((base, prefix)) = entry.split_once('/') {
            let base: IpAddr = base
                .parse()
                .map_err(|_| invalid("network base is not an IP address"))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| invalid("prefix length is not a number"))?;
            let max = if base.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(invalid("prefix length too large"));
            }
            // Peers are compared in canonical form, so a mapped base must be too
            return match (base, base.to_canonical()) {
                (IpAddr::V6(_), v4 @ IpAddr::V4(_)) if prefix >= 96 => {
                    Ok(Some(HostPattern::Network {
                        base: v4,
                        prefix: prefix - 96,
                    }))
                }
                (IpAddr::V6(_), IpAddr::V4(_)) => {
                    Err(invalid("IPv4-mapped network needs a prefix of at least 96"))
                }
                _ => Ok(Some(HostPattern::Network { base, prefix })),
            };
        }

        if entry.contains('*') {
            let parts: Vec<&str> = entry.split('.').collect();
            if parts.len() != 4 {
                return Err(invalid("wildcard must have four octets"));
            }
            let mut octets = [None; 4];
            for (slot, part) in octets.iter_mut().zip(parts) {
                if part != "*" {
                    *slot = Some(part.parse().map_err(|_| invalid("bad octet"))?);
                }
            }
            return Ok(Some(HostPattern::Wildcard(octets)));
        }

        if let Some(range) = parse_range(entry) {
            let (network, first, last) = range;
            if first > last {
                return Err(invalid("range start exceeds range end"));
            }
            return Ok(Some(HostPattern::Range { network, first, last }));
        }

        if is_numeric(entry) {
            Err(invalid("malformed IPv4 address"))
        } else if is_hostname(entry) {
            Ok(None)
        } else {
            Err(invalid("not an address, network, wildcard, range or hostname"))
        }
    }

    /// Returns true if `peer` matches this pattern.
    pub fn matches(&self, peer: IpAddr) -> bool {
        let peer = peer.to_canonical();
        match self {
            HostPattern::Exact(ip) => *ip == peer,
            HostPattern::Network { base, prefix } => network_contains(*base, *prefix, peer),
            HostPattern::Wildcard(octets) => match peer {
                IpAddr::V4(v4) => octets
                    .iter()
                    .zip(v4.octets())
                    .all(|(want, got)| want.map_or(true, |w| w == got)),
                IpAddr::V6(_) => false,
            },
            HostPattern::Range { network, first, last } => match peer {
                IpAddr::V4(v4) => {
                    let [a, b, c, d] = v4.octets();
                    [a, b, c] == *network && (*first..=*last).contains(&d)
                }
                IpAddr::V6(_) => false,
            },
        }
    }
}

/// Admission policy built from the allowed hosts list.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    patterns: Vec<HostPattern>,
}

impl SecurityPolicy {
    /// Builds a policy, resolving hostnames with the system resolver.
    pub fn new(entries: &[String]) -> Result<Self, PolicyError> {
        Self::with_resolver(entries, system_resolve)
    }

    /// Builds a policy with a custom hostname resolver.
    ///
    /// Hostnames that fail to resolve are logged and skipped; it is an
    /// error only when no pattern at all remains.
    pub fn with_resolver<F>(entries: &[String], resolve: F) -> Result<Self, PolicyError>
    where
        F: Fn(&str) -> io::Result<Vec<IpAddr>>,
    {
        let mut patterns = Vec::with_capacity(entries.len());

        for entry in entries {
            let entry = entry.trim();
            match HostPattern::parse(entry)? {
                Some(pattern) => patterns.push(pattern),
                None => match resolve(entry) {
                    Ok(addrs) if !addrs.is_empty() => {
                        debug!(host = %entry, addresses = ?addrs, "Resolved allowed host");
                        patterns.extend(
                            addrs
                                .into_iter()
                                .map(|ip| HostPattern::Exact(ip.to_canonical())),
                        );
                    }
                    Ok(_) => warn!(host = %entry, "Allowed host resolved to no addresses"),
                    Err(e) => warn!(host = %entry, error = %e, "Cannot resolve allowed host"),
                },
            }
        }

        if patterns.is_empty() {
            return Err(PolicyError::Empty);
        }
        Ok(Self { patterns })
    }

    /// Decides whether `peer` may be served. Denials are logged here.
    pub fn evaluate(&self, peer: IpAddr) -> SecurityDecision {
        if self.patterns.iter().any(|p| p.matches(peer)) {
            SecurityDecision::Allow
        } else {
            warn!(peer = %peer, "Connection from host not in allowed list");
            SecurityDecision::Deny
        }
    }

    /// Returns the parsed patterns.
    pub fn patterns(&self) -> &[HostPattern] {
        &self.patterns
    }
}

fn system_resolve(host: &str) -> io::Result<Vec<IpAddr>> {
    let mut addrs: Vec<IpAddr> = (host, 0).to_socket_addrs()?.map(|a| a.ip()).collect();
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

/// Parses `a.b.c.x-y`.
fn parse_range(entry: &str) -> Option<([u8; 3], u8, u8)> {
    let (network, last) = entry.rsplit_once('.')?;
    let (first, last) = last.split_once('-')?;
    let network: Ipv4Addr = format!("{network}.0").parse().ok()?;
    let [a, b, c, _] = network.octets();
    Some(([a, b, c], first.parse().ok()?, last.parse().ok()?))
}

/// Digits and dots only: a mistyped address, never a host name.
fn is_numeric(entry: &str) -> bool {
    entry.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn is_hostname(entry: &str) -> bool {
    !entry.is_empty()
        && entry.len() <= 253
        && entry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        && !entry.starts_with('-')
}

fn network_contains(base: IpAddr, prefix: u8, peer: IpAddr) -> bool {
    match (base, peer) {
        (IpAddr::V4(base), IpAddr::V4(peer)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(base) & mask == u32::from(peer) & mask
        }
        (IpAddr::V6(base), IpAddr::V6(peer)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(base) & mask == u128::from(peer) & mask
        }
        _ => false,
    }
}
