//! Endpoint resolution: connection-spec parsing and SRV lookup.
//!
//! An account's connection spec is either an explicit endpoint (`tcp:host`,
//! `tcp:host:port`, `tcp:[v6addr]:port`) or a domain for SRV resolution
//! (`xmpp:domain`). SRV candidates come back sorted by priority/weight
//! (RFC 2782) so the caller can walk them in order, falling through to the
//! next on connection failure.

use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::{Result, XmppError};

/// One candidate socket address for an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// The XMPP domain when `host` is an SRV target. TLS verification and
    /// the stream `to=` attribute use the domain, not the target host
    /// (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl Endpoint {
    /// Hostname for TLS SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

/// A parsed connection spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    /// Explicit host and port; no DNS beyond A/AAAA.
    Direct { host: String, port: u16 },
    /// Domain for `_xmpp-client._tcp` SRV resolution.
    Srv { domain: String },
}

/// Parse an account connection spec.
///
/// Accepted forms:
/// - `xmpp:domain`        → SRV resolution
/// - `tcp:host`           → host:5222
/// - `tcp:host:port`      → explicit port
/// - `tcp:[v6addr]:port`  → bracketed IPv6 literal
///
/// Anything else is a configuration error, reported as a transport failure.
pub fn parse_connection_spec(spec: &str) -> Result<ConnectionSpec> {
    let trimmed = spec.trim();

    if let Some(domain) = trimmed.strip_prefix("xmpp:") {
        if domain.is_empty() {
            return Err(XmppError::transport("empty domain in connection spec"));
        }
        return Ok(ConnectionSpec::Srv {
            domain: domain.to_string(),
        });
    }

    if let Some(rest) = trimmed.strip_prefix("tcp:") {
        if rest.is_empty() {
            return Err(XmppError::transport("empty host in connection spec"));
        }
        // Bracketed IPv6 literal, with or without port.
        if let Some(rest) = rest.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| XmppError::transport("unterminated '[' in connection spec"))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| XmppError::transport(format!("bad port in spec '{trimmed}'")))?,
                None if tail.is_empty() => 5222,
                None => {
                    return Err(XmppError::transport(format!(
                        "trailing garbage in spec '{trimmed}'"
                    )))
                }
            };
            return Ok(ConnectionSpec::Direct {
                host: host.to_string(),
                port,
            });
        }
        if let Some((host, port_str)) = rest.rsplit_once(':') {
            // `tcp:host:port`. A second colon would mean an unbracketed v6
            // literal, which rsplit would mangle, so require digits.
            if let Ok(port) = port_str.parse::<u16>() {
                if host.contains(':') {
                    return Err(XmppError::transport(
                        "IPv6 literals must be bracketed, e.g. tcp:[::1]:5222",
                    ));
                }
                return Ok(ConnectionSpec::Direct {
                    host: host.to_string(),
                    port,
                });
            }
        }
        if rest.contains(':') {
            return Err(XmppError::transport(
                "IPv6 literals must be bracketed, e.g. tcp:[::1]:5222",
            ));
        }
        return Ok(ConnectionSpec::Direct {
            host: rest.to_string(),
            port: 5222,
        });
    }

    Err(XmppError::transport(format!(
        "unsupported connection spec '{trimmed}' (expected tcp: or xmpp:)"
    )))
}

/// Resolve a connection spec into candidate endpoints, best first.
///
/// For SRV specs: `_xmpp-client._tcp.{domain}` records sorted by priority
/// ascending then weight descending, with `domain:5222` as the fallback
/// when no usable record exists. Lookup failures degrade to the fallback
/// rather than erroring; the TCP connect will report the real problem.
pub async fn resolve_endpoints(spec: &str) -> Result<Vec<Endpoint>> {
    match parse_connection_spec(spec)? {
        ConnectionSpec::Direct { host, port } => Ok(vec![Endpoint {
            host,
            port,
            domain: None,
        }]),
        ConnectionSpec::Srv { domain } => Ok(resolve_srv(&domain).await),
    }
}

async fn resolve_srv(domain: &str) -> Vec<Endpoint> {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "system DNS config unavailable, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let srv_name = format!("_xmpp-client._tcp.{domain}");
    let mut endpoints = Vec::new();
    match resolver.srv_lookup(&srv_name).await {
        Ok(lookup) => {
            let mut records: Vec<_> = lookup.iter().collect();
            records.sort_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then(b.weight().cmp(&a.weight()))
            });
            for record in records {
                let target = record.target().to_string();
                let target = target.trim_end_matches('.');
                // RFC 2782: a "." target means the service is explicitly
                // not offered.
                if target.is_empty() {
                    debug!(domain, "SRV target '.', service not offered via this record");
                    continue;
                }
                info!(domain, host = %target, port = record.port(),
                    priority = record.priority(), weight = record.weight(),
                    "SRV candidate");
                endpoints.push(Endpoint {
                    host: target.to_string(),
                    port: record.port(),
                    domain: Some(domain.to_string()),
                });
            }
        }
        Err(e) => {
            debug!(domain, srv = %srv_name, error = %e, "SRV lookup failed");
        }
    }

    if endpoints.is_empty() {
        info!(domain, "no SRV records, falling back to {domain}:5222");
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: 5222,
            domain: None,
        });
    }
    endpoints
}
