//! The PLAIN mechanism (RFC 4616).

use crate::error::{Error, Result};
use crate::sasl::{Credentials, Mechanism};

/// PLAIN sends `\0authcid\0password` in one shot.
pub struct Plain {
    credentials: Credentials,
    sent: bool,
}

impl Plain {
    /// Prepare a PLAIN exchange.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            sent: false,
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>> {
        self.sent = true;
        let mut payload = Vec::new();
        payload.push(0);
        payload.extend_from_slice(self.credentials.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.credentials.password.as_bytes());
        Ok(Some(payload))
    }

    fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::auth_failed("PLAIN does not expect a challenge"))
    }

    fn verify_success(&mut self, _data: Option<&[u8]>) -> Result<()> {
        if self.sent {
            Ok(())
        } else {
            Err(Error::auth_failed("success before credentials were sent"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_nul_separated_credentials() {
        let mut plain = Plain::new(Credentials {
            username: "alice".into(),
            password: "secret".into(),
            domain: "test".into(),
        });
        let initial = plain.initial_response().unwrap().unwrap();
        assert_eq!(initial, b"\0alice\0secret");
        assert!(plain.verify_success(None).is_ok());
    }

    #[test]
    fn challenge_is_a_protocol_error() {
        let mut plain = Plain::new(Credentials {
            username: "a".into(),
            password: "b".into(),
            domain: "test".into(),
        });
        plain.initial_response().unwrap();
        assert!(plain.respond(b"x").is_err());
    }
}
