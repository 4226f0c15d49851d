//! DIGEST-MD5 (RFC 2831) client implementation.
//!
//! Old but still widely deployed on self-hosted servers. Two round trips:
//! the server challenge produces the digest response, then the server's
//! `rspauth` value is verified before the mechanism reports completion.
//! A success without a verified rspauth means the server never proved it
//! knows the shared secret, and is rejected.

use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::{Result, XmppError};

pub struct DigestMd5 {
    username: String,
    password: String,
    digest_uri: String,
    cnonce: String,
    state: State,
}

enum State {
    /// Waiting for the initial challenge.
    Fresh,
    /// Digest sent; the rspauth computed from it must match the server's.
    AwaitingRspauth { expected: String },
    /// rspauth verified.
    Complete,
}

impl DigestMd5 {
    pub fn new(username: impl Into<String>, password: impl Into<String>, domain: &str) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::with_cnonce(username, password, domain, hex::encode(bytes))
    }

    /// Deterministic constructor for tests and the RFC worked example.
    pub fn with_cnonce(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: &str,
        cnonce: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            digest_uri: format!("xmpp/{domain}"),
            cnonce: cnonce.into(),
            state: State::Fresh,
        }
    }

    #[cfg(test)]
    fn with_digest_uri(mut self, digest_uri: impl Into<String>) -> Self {
        self.digest_uri = digest_uri.into();
        self
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// Handle one server challenge. Returns the bytes to send back.
    pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let challenge = std::str::from_utf8(challenge)
            .map_err(|e| XmppError::with_source(crate::error::ErrorKind::Sasl, "non-utf8 challenge", e))?;
        let fields = parse_directives(challenge)?;

        match &self.state {
            State::Fresh => {
                let response = self.initial_response(&fields)?;
                Ok(response.into_bytes())
            }
            State::AwaitingRspauth { expected } => {
                let rspauth = fields
                    .iter()
                    .find(|(k, _)| k == "rspauth")
                    .map(|(_, v)| v.as_str())
                    .ok_or_else(|| XmppError::sasl("second challenge carries no rspauth"))?;
                if rspauth != expected {
                    return Err(XmppError::sasl("server rspauth mismatch"));
                }
                self.state = State::Complete;
                // The final client message is empty.
                Ok(Vec::new())
            }
            State::Complete => Err(XmppError::sasl("challenge after mechanism completion")),
        }
    }

    /// rspauth may also arrive as additional data inside `<success/>`.
    pub fn verify_success(&mut self, data: &[u8]) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Complete) {
            State::Complete => Ok(()),
            State::AwaitingRspauth { expected } if !data.is_empty() => {
                let text = std::str::from_utf8(data).map_err(|e| {
                    XmppError::with_source(crate::error::ErrorKind::Sasl, "non-utf8 success data", e)
                })?;
                let fields = parse_directives(text)?;
                match fields.iter().find(|(k, _)| k == "rspauth") {
                    Some((_, rspauth)) if *rspauth == expected => Ok(()),
                    Some(_) => Err(XmppError::sasl("server rspauth mismatch")),
                    None => Err(XmppError::sasl("success data carries no rspauth")),
                }
            }
            State::AwaitingRspauth { .. } => {
                Err(XmppError::sasl("server finished without proving rspauth"))
            }
            State::Fresh => Err(XmppError::sasl("success before any challenge")),
        }
    }

    fn initial_response(&mut self, fields: &[(String, String)]) -> Result<String> {
        let get = |key: &str| {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let nonce = get("nonce").ok_or_else(|| XmppError::sasl("challenge carries no nonce"))?;
        // Default realm to the domain part of digest-uri when absent.
        let realm = get("realm")
            .map(str::to_string)
            .unwrap_or_else(|| self.digest_uri.split('/').nth(1).unwrap_or("").to_string());
        if let Some(qop) = get("qop") {
            if !qop.split(',').any(|q| q.trim() == "auth") {
                return Err(XmppError::sasl(format!("unsupported qop '{qop}'")));
            }
        }

        let nc = "00000001";
        let a1_hash = {
            let mut start = Md5::new();
            start.update(self.username.as_bytes());
            start.update(b":");
            start.update(realm.as_bytes());
            start.update(b":");
            start.update(self.password.as_bytes());
            let x = start.finalize();
            let mut a1 = Md5::new();
            a1.update(x);
            a1.update(b":");
            a1.update(nonce.as_bytes());
            a1.update(b":");
            a1.update(self.cnonce.as_bytes());
            hex::encode(a1.finalize())
        };
        let response = self.compute_digest(&a1_hash, nonce, nc, "AUTHENTICATE");
        let rspauth = self.compute_digest(&a1_hash, nonce, nc, "");
        self.state = State::AwaitingRspauth { expected: rspauth };

        Ok(format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop=auth,digest-uri=\"{}\",response={},charset=utf-8",
            self.username, realm, nonce, self.cnonce, nc, self.digest_uri, response
        ))
    }

    fn compute_digest(&self, a1_hash: &str, nonce: &str, nc: &str, method: &str) -> String {
        let a2_hash = {
            let mut a2 = Md5::new();
            a2.update(method.as_bytes());
            a2.update(b":");
            a2.update(self.digest_uri.as_bytes());
            hex::encode(a2.finalize())
        };
        let mut kd = Md5::new();
        kd.update(a1_hash.as_bytes());
        kd.update(b":");
        kd.update(nonce.as_bytes());
        kd.update(b":");
        kd.update(nc.as_bytes());
        kd.update(b":");
        kd.update(self.cnonce.as_bytes());
        kd.update(b":auth:");
        kd.update(a2_hash.as_bytes());
        hex::encode(kd.finalize())
    }
}

/// Parse an RFC 2831 directive list: `key=value` pairs separated by
/// commas, values optionally quoted with backslash escapes.
fn parse_directives(input: &str) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        // Skip separators and whitespace.
        while matches!(chars.peek(), Some(',') | Some(' ') | Some('\t')) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(fields);
        }

        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if key.is_empty() {
            return Err(XmppError::sasl("empty directive name in challenge"));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(XmppError::sasl("unterminated quoted value in challenge"));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        fields.push((key.trim().to_string(), value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The worked example from RFC 2831 section 4.
    const RFC_CHALLENGE: &str = "realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",algorithm=md5-sess,charset=utf-8";

    fn rfc_mechanism() -> DigestMd5 {
        DigestMd5::with_cnonce("chris", "secret", "elwood.innosoft.com", "OA6MHXh6VqTrRk")
            .with_digest_uri("imap/elwood.innosoft.com")
    }

    #[test]
    fn rfc2831_worked_example_digest() {
        let mut mechanism = rfc_mechanism();
        let response = mechanism.respond(RFC_CHALLENGE.as_bytes()).unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.contains("response=d388dad90d4bbd760a152321f2143af7"));
        assert!(response.contains("username=\"chris\""));
        assert!(response.contains("realm=\"elwood.innosoft.com\""));
        assert!(response.contains("nc=00000001"));
        assert!(response.contains("digest-uri=\"imap/elwood.innosoft.com\""));
        assert!(!mechanism.is_complete());
    }

    #[test]
    fn rfc2831_worked_example_rspauth() {
        let mut mechanism = rfc_mechanism();
        mechanism.respond(RFC_CHALLENGE.as_bytes()).unwrap();
        let reply = mechanism
            .respond(b"rspauth=ea40f60335c427b5527b84dbabcdfffd")
            .unwrap();
        assert!(reply.is_empty());
        assert!(mechanism.is_complete());
    }

    #[test]
    fn wrong_rspauth_is_rejected() {
        let mut mechanism = rfc_mechanism();
        mechanism.respond(RFC_CHALLENGE.as_bytes()).unwrap();
        let err = mechanism
            .respond(b"rspauth=00000000000000000000000000000000")
            .unwrap_err();
        assert!(err.is_sasl());
    }

    #[test]
    fn rspauth_in_success_data_is_accepted() {
        let mut mechanism = rfc_mechanism();
        mechanism.respond(RFC_CHALLENGE.as_bytes()).unwrap();
        mechanism
            .verify_success(b"rspauth=ea40f60335c427b5527b84dbabcdfffd")
            .unwrap();
        assert!(mechanism.is_complete());
    }

    #[test]
    fn success_without_rspauth_is_rejected() {
        let mut mechanism = rfc_mechanism();
        mechanism.respond(RFC_CHALLENGE.as_bytes()).unwrap();
        assert!(mechanism.verify_success(b"").unwrap_err().is_sasl());
    }

    #[test]
    fn missing_nonce_is_a_sasl_error() {
        let mut mechanism = rfc_mechanism();
        let err = mechanism.respond(b"realm=\"x\",qop=\"auth\"").unwrap_err();
        assert!(err.is_sasl());
    }

    #[test]
    fn unsupported_qop_is_rejected() {
        let mut mechanism = rfc_mechanism();
        let err = mechanism
            .respond(b"nonce=\"abc\",qop=\"auth-conf\"")
            .unwrap_err();
        assert!(err.is_sasl());
    }

    #[test]
    fn missing_realm_defaults_to_domain() {
        let mut mechanism =
            DigestMd5::with_cnonce("romeo", "pw", "example.com", "deadbeef");
        let response = mechanism.respond(b"nonce=\"abc\",qop=\"auth\"").unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.contains("realm=\"example.com\""));
        assert!(response.contains("digest-uri=\"xmpp/example.com\""));
    }

    #[test]
    fn directive_parser_handles_quotes_and_escapes() {
        let fields = parse_directives("a=1, b=\"two, three\", c=\"q\\\"uote\"").unwrap();
        assert_eq!(
            fields,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two, three".to_string()),
                ("c".to_string(), "q\"uote".to_string()),
            ]
        );
    }

    #[test]
    fn directive_parser_rejects_garbage() {
        assert!(parse_directives("=x").is_err());
        assert!(parse_directives("a=\"unterminated").is_err());
    }
}
