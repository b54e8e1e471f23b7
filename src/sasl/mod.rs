//! Client-side SASL mechanisms.
//!
//! Mechanisms work in raw bytes; the connection layer wraps exchanges in
//! `<auth/>`, `<response/>`, `<challenge/>` and `<success/>` elements and
//! handles the base64 framing.
//!
//! Preference order is SCRAM-SHA-1, then DIGEST-MD5, then PLAIN. PLAIN
//! is only selectable on an encrypted channel unless the caller
//! explicitly opts in.

mod digest_md5;
mod plain;
mod scram;

pub use digest_md5::DigestMd5;
pub use plain::Plain;
pub use scram::ScramSha1;

use crate::error::{Error, Result};

/// One SASL exchange in progress.
pub trait Mechanism: Send {
    /// Mechanism name as advertised in stream features.
    fn name(&self) -> &'static str;

    /// The initial response sent inside `<auth/>`, if the mechanism is
    /// client-first.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;

    /// Answer a server `<challenge/>`.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Validate additional data carried in `<success/>`.
    ///
    /// Mechanisms with mutual authentication must reject a success that
    /// lacks a valid server signature.
    fn verify_success(&mut self, data: Option<&[u8]>) -> Result<()>;
}

/// Authentication inputs shared by all mechanisms.
#[derive(Clone)]
pub struct Credentials {
    /// The node part of the account JID.
    pub username: String,
    /// The account password.
    pub password: String,
    /// The server domain (DIGEST-MD5 digest-uri).
    pub domain: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Pick the strongest mutually supported mechanism.
pub fn select(
    offered: &[String],
    credentials: &Credentials,
    encrypted: bool,
    allow_plain_without_tls: bool,
) -> Result<Box<dyn Mechanism>> {
    let offers = |name: &str| offered.iter().any(|m| m == name);

    if offers("SCRAM-SHA-1") {
        return Ok(Box::new(ScramSha1::new(credentials.clone())));
    }
    if offers("DIGEST-MD5") {
        return Ok(Box::new(DigestMd5::new(credentials.clone())));
    }
    if offers("PLAIN") {
        if !encrypted && !allow_plain_without_tls {
            return Err(Error::auth_failed(
                "server offers only PLAIN on an unencrypted channel",
            ));
        }
        return Ok(Box::new(Plain::new(credentials.clone())));
    }

    Err(Error::auth_failed(format!(
        "no usable SASL mechanism among [{}]",
        offered.join(", ")
    )))
}
