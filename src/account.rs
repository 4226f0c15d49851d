//! Account snapshots and per-connection configuration.

use serde::{Deserialize, Serialize};

use crate::jid;
use crate::transport::tls::TlsPolicy;

/// Immutable account snapshot handed to a connection attempt.
///
/// The server may rewrite the effective resource during bind; the rewritten
/// value is only observable through the resulting connection's full JID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Bare JID (`user@domain`).
    pub jid: String,
    /// Plaintext password for SASL.
    pub password: String,
    /// Connection spec: `tcp:host`, `tcp:host:port`, `tcp:[v6]:port` or
    /// `xmpp:domain` (SRV resolution).
    pub connection: String,
    /// Preferred resource. May be empty, letting the server pick one.
    pub resource: String,
}

impl Account {
    /// Build an account that connects via SRV resolution of the JID domain.
    pub fn new(jid: impl Into<String>, password: impl Into<String>, resource: impl Into<String>) -> Self {
        let jid = jid.into();
        let connection = format!("xmpp:{}", jid::domain(&jid));
        Self {
            jid,
            password: password.into(),
            connection,
            resource: resource.into(),
        }
    }

    /// Same account with a different preferred resource. Used by the
    /// scheduler to dodge server-side resource conflicts after repeated
    /// failures.
    pub fn with_resource(&self, resource: impl Into<String>) -> Self {
        let mut account = self.clone();
        account.resource = resource.into();
        account
    }

    pub fn domain(&self) -> &str {
        jid::domain(&self.jid)
    }
}

/// Knobs for a single connection attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// TCP connect timeout, seconds.
    pub connect_timeout_secs: u64,
    /// Timeout for each negotiation read (features, proceed, challenges),
    /// seconds. Prevents `open()` from hanging on a mute server.
    pub negotiation_timeout_secs: u64,
    /// Server certificate trust policy.
    pub tls: TlsPolicy,
    /// Whether to negotiate zlib stream compression when offered.
    pub compression: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            negotiation_timeout_secs: 10,
            tls: TlsPolicy::SystemRoots,
            compression: true,
        }
    }
}
