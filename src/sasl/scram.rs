//! The SCRAM-SHA-1 mechanism, client side (RFC 5802).
//!
//! Flow:
//!
//! 1. client-first: `n,,n=<user>,r=<cnonce>`
//! 2. server-first: `r=<cnonce+snonce>,s=<salt>,i=<iterations>`
//! 3. client-final: `c=biws,r=<nonce>,p=<proof>`
//! 4. server-final: `v=<server signature>` (in a challenge or inside
//!    `<success/>`)
//!
//! The server signature check is mandatory; a success without a valid
//! `v=` is treated as a failed mutual authentication.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::sasl::{Credentials, Mechanism};

const GS2_HEADER: &str = "n,,";
const NONCE_LENGTH: usize = 24;

type HmacSha1 = Hmac<Sha1>;

enum State {
    Initial,
    SentClientFirst { client_first_bare: String },
    SentClientFinal { server_signature: Vec<u8> },
    Complete,
}

/// A SCRAM-SHA-1 exchange in progress.
pub struct ScramSha1 {
    credentials: Credentials,
    client_nonce: String,
    state: State,
}

impl ScramSha1 {
    /// Prepare an exchange with a random client nonce.
    pub fn new(credentials: Credentials) -> Self {
        Self::with_nonce(credentials, generate_nonce())
    }

    /// Prepare an exchange with a fixed nonce (test vectors).
    pub fn with_nonce(credentials: Credentials, client_nonce: String) -> Self {
        Self {
            credentials,
            client_nonce,
            state: State::Initial,
        }
    }

    fn handle_server_first(&mut self, server_first: &str) -> Result<Vec<u8>> {
        let State::SentClientFirst { client_first_bare } =
            std::mem::replace(&mut self.state, State::Complete)
        else {
            return Err(Error::auth_failed("server-first out of order"));
        };

        let attrs = parse_attributes(server_first)?;
        let nonce = attrs
            .iter()
            .find(|(k, _)| *k == "r")
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| Error::auth_failed("server-first without nonce"))?;
        let salt_b64 = attrs
            .iter()
            .find(|(k, _)| *k == "s")
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| Error::auth_failed("server-first without salt"))?;
        let iterations: u32 = attrs
            .iter()
            .find(|(k, _)| *k == "i")
            .and_then(|(_, v)| v.parse().ok())
            .ok_or_else(|| Error::auth_failed("server-first without iteration count"))?;

        if !nonce.starts_with(self.client_nonce.as_str()) {
            return Err(Error::auth_failed("server nonce does not extend ours"));
        }
        let salt = BASE64_STANDARD
            .decode(salt_b64)
            .map_err(|_| Error::auth_failed("server salt is not base64"))?;

        let mut salted_password = [0u8; 20];
        pbkdf2_hmac::<Sha1>(
            self.credentials.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key);

        let channel_binding = BASE64_STANDARD.encode(GS2_HEADER.as_bytes());
        let client_final_without_proof = format!("c={channel_binding},r={nonce}");
        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");

        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac_sha1(&salted_password, b"Server Key");
        let server_signature = hmac_sha1(&server_key, auth_message.as_bytes());

        self.state = State::SentClientFinal { server_signature };

        let client_final = format!(
            "{client_final_without_proof},p={}",
            BASE64_STANDARD.encode(&proof)
        );
        Ok(client_final.into_bytes())
    }

    fn check_server_final(&mut self, data: &[u8]) -> Result<()> {
        let State::SentClientFinal { server_signature } =
            std::mem::replace(&mut self.state, State::Complete)
        else {
            return Err(Error::auth_failed("server-final out of order"));
        };

        let text = std::str::from_utf8(data)
            .map_err(|_| Error::auth_failed("server-final is not UTF-8"))?;
        let attrs = parse_attributes(text)?;
        let verifier = attrs
            .iter()
            .find(|(k, _)| *k == "v")
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| Error::auth_failed("server-final without verifier"))?;
        let verifier = BASE64_STANDARD
            .decode(verifier)
            .map_err(|_| Error::auth_failed("server verifier is not base64"))?;

        if verifier != server_signature {
            return Err(Error::auth_failed("server signature mismatch"));
        }
        Ok(())
    }
}

impl Mechanism for ScramSha1 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        if !matches!(self.state, State::Initial) {
            return Err(Error::auth_failed("client-first already sent"));
        }
        let client_first_bare = format!(
            "n={},r={}",
            escape_username(&self.credentials.username),
            self.client_nonce
        );
        let message = format!("{GS2_HEADER}{client_first_bare}");
        self.state = State::SentClientFirst { client_first_bare };
        Ok(Some(message.into_bytes()))
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match &self.state {
            State::SentClientFirst { .. } => {
                let text = std::str::from_utf8(challenge)
                    .map_err(|_| Error::auth_failed("challenge is not UTF-8"))?
                    .to_string();
                self.handle_server_first(&text)
            }
            State::SentClientFinal { .. } => {
                // Some servers deliver v= in a final challenge instead of
                // inside <success/>.
                self.check_server_final(challenge)?;
                Ok(Vec::new())
            }
            _ => Err(Error::auth_failed("unexpected SCRAM challenge")),
        }
    }

    fn verify_success(&mut self, data: Option<&[u8]>) -> Result<()> {
        match &self.state {
            State::Complete => Ok(()),
            State::SentClientFinal { .. } => match data {
                Some(data) => self.check_server_final(data),
                None => Err(Error::auth_failed(
                    "success without server signature",
                )),
            },
            _ => Err(Error::auth_failed("success before client-final")),
        }
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill(&mut bytes);
    BASE64_STANDARD.encode(bytes)
}

/// `=` and `,` are reserved in saslname and must be escaped.
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// Split `k=v,k=v` attribute strings; values may contain `=`.
fn parse_attributes(message: &str) -> Result<Vec<(&str, String)>> {
    message
        .split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.split_once('=')
                .map(|(k, v)| (k, v.to_string()))
                .ok_or_else(|| Error::auth_failed(format!("malformed SCRAM attribute '{part}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 5802 §5 example exchange.
    fn rfc_exchange() -> ScramSha1 {
        ScramSha1::with_nonce(
            Credentials {
                username: "user".into(),
                password: "pencil".into(),
                domain: "example.com".into(),
            },
            "fyko+d2lbbFgONRv9qkxdawL".into(),
        )
    }

    #[test]
    fn client_first_matches_rfc_vector() {
        let mut scram = rfc_exchange();
        let initial = scram.initial_response().unwrap().unwrap();
        assert_eq!(initial, b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
    }

    #[test]
    fn client_final_matches_rfc_vector() {
        let mut scram = rfc_exchange();
        scram.initial_response().unwrap();
        let response = scram
            .respond(
                b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
            )
            .unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );
    }

    #[test]
    fn accepts_rfc_server_signature() {
        let mut scram = rfc_exchange();
        scram.initial_response().unwrap();
        scram
            .respond(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        scram
            .verify_success(Some(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ="))
            .unwrap();
    }

    #[test]
    fn rejects_bad_server_signature() {
        let mut scram = rfc_exchange();
        scram.initial_response().unwrap();
        scram
            .respond(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        assert!(scram
            .verify_success(Some(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA="))
            .is_err());
    }

    #[test]
    fn rejects_truncated_server_nonce() {
        let mut scram = rfc_exchange();
        scram.initial_response().unwrap();
        let err = scram.respond(b"r=wrongnonce,s=QSXCR+Q6sek8bf92,i=4096");
        assert!(matches!(err, Err(Error::AuthenticationFailed(_))));
    }

    #[test]
    fn username_escaping() {
        assert_eq!(escape_username("a=b,c"), "a=3Db=2Cc");
    }
}
