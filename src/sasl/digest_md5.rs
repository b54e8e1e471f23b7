//! The DIGEST-MD5 mechanism, client side (RFC 2831).
//!
//! Obsolete (RFC 6331) but still advertised by deployed servers, so it
//! sits between SCRAM-SHA-1 and PLAIN in the preference order. Only
//! `qop=auth` with `md5-sess` is spoken.

use md5::{Digest, Md5};
use rand::Rng;

use crate::error::{Error, Result};
use crate::sasl::{Credentials, Mechanism};

enum State {
    Initial,
    SentResponse { expected_rspauth: String },
    Complete,
}

/// A DIGEST-MD5 exchange in progress.
pub struct DigestMd5 {
    credentials: Credentials,
    cnonce: String,
    state: State,
}

impl DigestMd5 {
    /// Prepare an exchange with a random client nonce.
    pub fn new(credentials: Credentials) -> Self {
        Self::with_cnonce(credentials, generate_cnonce())
    }

    /// Prepare an exchange with a fixed client nonce (test vectors).
    pub fn with_cnonce(credentials: Credentials, cnonce: String) -> Self {
        Self {
            credentials,
            cnonce,
            state: State::Initial,
        }
    }

    fn build_response(&mut self, challenge: &str) -> Result<Vec<u8>> {
        let directives = parse_directives(challenge);
        if directives.iter().any(|(k, _)| k == "rspauth") {
            return Err(Error::auth_failed("rspauth before initial response"));
        }

        let nonce = directive(&directives, "nonce")
            .ok_or_else(|| Error::auth_failed("challenge without nonce"))?;
        let realm = directive(&directives, "realm")
            .unwrap_or_else(|| self.credentials.domain.clone());
        let qop_offered = directive(&directives, "qop").unwrap_or_else(|| "auth".to_string());
        if !qop_offered.split(',').any(|q| q.trim() == "auth") {
            return Err(Error::auth_failed("server does not offer qop=auth"));
        }

        let digest_uri = format!("xmpp/{}", self.credentials.domain);
        let nc = "00000001";

        let response_hex = compute_response(
            &self.credentials.username,
            &realm,
            &self.credentials.password,
            &nonce,
            &self.cnonce,
            nc,
            &digest_uri,
            true,
        );
        let expected_rspauth = compute_response(
            &self.credentials.username,
            &realm,
            &self.credentials.password,
            &nonce,
            &self.cnonce,
            nc,
            &digest_uri,
            false,
        );

        self.state = State::SentResponse { expected_rspauth };

        let response = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},\
             qop=auth,digest-uri=\"{}\",response={},charset=utf-8",
            self.credentials.username, realm, nonce, self.cnonce, nc, digest_uri, response_hex
        );
        Ok(response.into_bytes())
    }

    fn check_rspauth(&mut self, data: &str) -> Result<()> {
        let State::SentResponse { expected_rspauth } =
            std::mem::replace(&mut self.state, State::Complete)
        else {
            return Err(Error::auth_failed("rspauth out of order"));
        };
        let directives = parse_directives(data);
        let rspauth = directive(&directives, "rspauth")
            .ok_or_else(|| Error::auth_failed("final challenge without rspauth"))?;
        if rspauth != expected_rspauth {
            return Err(Error::auth_failed("rspauth mismatch"));
        }
        Ok(())
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        // Server-first mechanism.
        Ok(None)
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(challenge)
            .map_err(|_| Error::auth_failed("challenge is not UTF-8"))?
            .to_string();
        match &self.state {
            State::Initial => self.build_response(&text),
            State::SentResponse { .. } => {
                self.check_rspauth(&text)?;
                Ok(Vec::new())
            }
            State::Complete => Err(Error::auth_failed("unexpected DIGEST-MD5 challenge")),
        }
    }

    fn verify_success(&mut self, data: Option<&[u8]>) -> Result<()> {
        match &self.state {
            State::Complete => Ok(()),
            State::SentResponse { .. } => {
                let Some(data) = data else {
                    return Err(Error::auth_failed("success without rspauth"));
                };
                let text = std::str::from_utf8(data)
                    .map_err(|_| Error::auth_failed("success data is not UTF-8"))?
                    .to_string();
                self.check_rspauth(&text)
            }
            State::Initial => Err(Error::auth_failed("success before response")),
        }
    }
}

/// Compute the hex response value; `with_authenticate` selects the
/// request digest (A2 with `AUTHENTICATE:`) vs. the rspauth digest.
#[allow(clippy::too_many_arguments)]
fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    digest_uri: &str,
    with_authenticate: bool,
) -> String {
    let mut a1_hash = Md5::new();
    a1_hash.update(format!("{username}:{realm}:{password}").as_bytes());
    let a1_prefix = a1_hash.finalize();

    let mut a1 = Vec::with_capacity(16 + nonce.len() + cnonce.len() + 2);
    a1.extend_from_slice(&a1_prefix);
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());

    let a2 = if with_authenticate {
        format!("AUTHENTICATE:{digest_uri}")
    } else {
        format!(":{digest_uri}")
    };

    let ha1 = hex(&Md5::digest(&a1));
    let ha2 = hex(&Md5::digest(a2.as_bytes()));
    hex(&Md5::digest(
        format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}").as_bytes(),
    ))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn generate_cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex(&bytes)
}

/// Parse `key=value,key="quoted value"` directive lists.
fn parse_directives(input: &str) -> Vec<(String, String)> {
    let mut directives = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        directives.push((key, value));
    }
    directives
}

fn directive(directives: &[(String, String)], key: &str) -> Option<String> {
    directives
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}
