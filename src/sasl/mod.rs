//! SASL authentication (RFC 6120 §6).
//!
//! Mechanism preference is DIGEST-MD5 over PLAIN; anything else the server
//! offers is ignored. The wire loop exchanges `<auth/>`, `<challenge/>`,
//! `<response/>` and `<success/>`/`<failure/>` elements over an already
//! secured transport. A failure element or any non-SASL element arriving
//! mid-exchange is a SASL error; a dropped or restarted stream is
//! transport or malformed as usual.

pub mod digest_md5;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

use crate::codec::{parse_tree, Frame};
use crate::error::{Result, XmppError};
use crate::transport::Transport;

use digest_md5::DigestMd5;

pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Credential source handed to a mechanism. Connect attempts run in
/// spawned tasks, so implementations must be shareable across threads.
pub trait Credentials: Send + Sync {
    fn username(&self) -> &str;
    fn password(&self) -> &str;
    /// Realm hint, used by DIGEST-MD5 when the server's challenge names
    /// none. For XMPP this is the account domain.
    fn realm(&self) -> &str;
}

/// Account-backed [`Credentials`].
pub struct AccountCredentials {
    username: String,
    password: String,
    realm: String,
}

impl AccountCredentials {
    pub fn new(username: &str, password: &str, realm: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            realm: realm.to_string(),
        }
    }
}

impl Credentials for AccountCredentials {
    fn username(&self) -> &str {
        &self.username
    }

    fn password(&self) -> &str {
        &self.password
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

enum Mechanism {
    Plain { username: String, password: String },
    DigestMd5(DigestMd5),
}

// The password must not leak through error or log output.
impl std::fmt::Debug for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Mechanism {
    fn name(&self) -> &'static str {
        match self {
            Mechanism::Plain { .. } => "PLAIN",
            Mechanism::DigestMd5(_) => "DIGEST-MD5",
        }
    }

    /// Client-first data carried on the `<auth/>` element.
    fn initial_response(&self) -> Option<Vec<u8>> {
        match self {
            Mechanism::Plain { username, password } => {
                let mut data = Vec::with_capacity(username.len() + password.len() + 2);
                data.push(0);
                data.extend_from_slice(username.as_bytes());
                data.push(0);
                data.extend_from_slice(password.as_bytes());
                Some(data)
            }
            Mechanism::DigestMd5(_) => None,
        }
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match self {
            Mechanism::Plain { .. } => Err(XmppError::sasl("unexpected challenge for PLAIN")),
            Mechanism::DigestMd5(m) => m.respond(challenge),
        }
    }

    fn is_complete(&self) -> bool {
        match self {
            Mechanism::Plain { .. } => true,
            Mechanism::DigestMd5(m) => m.is_complete(),
        }
    }

    fn verify_success(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Mechanism::Plain { .. } => Ok(()),
            Mechanism::DigestMd5(m) => m.verify_success(data),
        }
    }
}

fn select_mechanism(offered: &[String], credentials: &dyn Credentials) -> Result<Mechanism> {
    if offered.iter().any(|m| m == "DIGEST-MD5") {
        return Ok(Mechanism::DigestMd5(DigestMd5::new(
            credentials.username(),
            credentials.password(),
            credentials.realm(),
        )));
    }
    if offered.iter().any(|m| m == "PLAIN") {
        return Ok(Mechanism::Plain {
            username: credentials.username().to_string(),
            password: credentials.password().to_string(),
        });
    }
    Err(XmppError::sasl(format!(
        "no usable mechanism offered (server offered: {})",
        offered.join(", ")
    )))
}

/// Run SASL to completion. On success the caller must restart the stream.
pub async fn authenticate(
    transport: &mut Transport,
    credentials: &dyn Credentials,
    offered: &[String],
    timeout: Duration,
) -> Result<()> {
    let mut mechanism = select_mechanism(offered, credentials)?;
    info!(mechanism = mechanism.name(), "authenticating");

    let auth = match mechanism.initial_response() {
        Some(data) => format!(
            "<auth xmlns='{SASL_NS}' mechanism='{}'>{}</auth>",
            mechanism.name(),
            BASE64.encode(data)
        ),
        None => format!("<auth xmlns='{SASL_NS}' mechanism='{}'/>", mechanism.name()),
    };
    transport.send_raw(&auth).await?;

    loop {
        let frame = transport.read_frame_timeout(timeout).await?;
        let xml = match frame {
            Frame::Stanza(xml) => xml,
            Frame::StreamClose => {
                return Err(XmppError::transport("stream closed during authentication"))
            }
            Frame::StreamOpen(_) => {
                return Err(XmppError::malformed("stream restart during authentication"))
            }
        };
        let element = parse_tree(&xml)?;
        if element.namespace != SASL_NS {
            // Anything but a SASL element here aborts the handshake hard;
            // the offending node travels with the error.
            return Err(XmppError::sasl(format!(
                "unexpected <{}> during authentication: {xml}",
                element.name
            )));
        }
        match element.name.as_str() {
            "challenge" => {
                let challenge = decode_b64(&element.text())?;
                let reply = mechanism.respond(&challenge)?;
                debug!(mechanism = mechanism.name(), "answering challenge");
                if reply.is_empty() {
                    transport
                        .send_raw(&format!("<response xmlns='{SASL_NS}'/>"))
                        .await?;
                } else {
                    transport
                        .send_raw(&format!(
                            "<response xmlns='{SASL_NS}'>{}</response>",
                            BASE64.encode(reply)
                        ))
                        .await?;
                }
            }
            "success" => {
                let data = decode_b64(&element.text())?;
                mechanism.verify_success(&data)?;
                info!(mechanism = mechanism.name(), "authenticated");
                return Ok(());
            }
            "failure" => {
                let condition = element
                    .children_named(None, None)
                    .next()
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| "unspecified".to_string());
                return Err(XmppError::sasl(format!("authentication failed: {condition}")));
            }
            other => {
                return Err(XmppError::sasl(format!(
                    "unexpected SASL element <{other}>: {xml}"
                )))
            }
        }
    }
}

fn decode_b64(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    // An empty or "=" payload means no data.
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(trimmed)
        .map_err(|e| XmppError::with_source(crate::error::ErrorKind::Sasl, "bad base64 payload", e))
}
