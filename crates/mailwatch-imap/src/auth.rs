//! Authentication mechanism negotiation.
//!
//! Only static credentials are ever available, so token-based SASL
//! mechanisms advertised by the server are removed before a mechanism is
//! chosen. PLAIN is preferred when offered; otherwise the LOGIN command is
//! used unless the server has disabled it.

use async_imap::imap_proto::{Capability, Response, ResponseCode};

use crate::{Error, Result};

/// SASL mechanisms that need an OAuth token and are never attempted.
pub const DISABLED_MECHANISMS: &[&str] = &["XOAUTH2", "OAUTHBEARER"];

/// How the session authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// `AUTHENTICATE PLAIN` (RFC 4616).
    Plain,
    /// The `LOGIN` command.
    Login,
}

/// Capabilities announced by the server before authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    atoms: Vec<String>,
    mechanisms: Vec<String>,
}

impl ServerCapabilities {
    /// Extracts capabilities from a greeting (`* OK [CAPABILITY ...]`) or an
    /// untagged `CAPABILITY` response.
    #[must_use]
    pub fn from_response(response: &Response<'_>) -> Option<Self> {
        let caps = match response {
            Response::Data {
                code: Some(ResponseCode::Capabilities(caps)),
                ..
            }
            | Response::Capabilities(caps) => caps,
            _ => return None,
        };

        let mut parsed = Self::default();
        for cap in caps {
            match cap {
                Capability::Auth(mechanism) => parsed.mechanisms.push(mechanism.to_uppercase()),
                Capability::Atom(atom) => parsed.atoms.push(atom.to_uppercase()),
                _ => {}
            }
        }
        Some(parsed)
    }

    /// Returns true if the capability atom is present (case-insensitive).
    #[must_use]
    pub fn has(&self, atom: &str) -> bool {
        self.atoms.iter().any(|a| a.eq_ignore_ascii_case(atom))
    }

    /// Advertised SASL mechanisms with the disabled ones removed.
    pub fn usable_mechanisms(&self) -> impl Iterator<Item = &str> {
        self.mechanisms
            .iter()
            .map(String::as_str)
            .filter(|m| !DISABLED_MECHANISMS.contains(m))
    }
}

/// Picks the mechanism for the advertised capabilities.
///
/// Without a capability list the LOGIN command is attempted.
///
/// # Errors
///
/// Returns [`Error::Auth`] when LOGIN is disabled and no usable SASL
/// mechanism remains.
pub fn negotiate(capabilities: Option<&ServerCapabilities>) -> Result<Mechanism> {
    let Some(caps) = capabilities else {
        return Ok(Mechanism::Login);
    };

    if caps.usable_mechanisms().any(|m| m == "PLAIN") {
        return Ok(Mechanism::Plain);
    }
    if caps.has("LOGINDISABLED") {
        return Err(Error::Auth(
            "server disabled LOGIN and offers no password mechanism".to_string(),
        ));
    }
    Ok(Mechanism::Login)
}

/// SASL PLAIN initial response.
pub(crate) struct PlainAuthenticator<'a> {
    pub(crate) username: &'a str,
    pub(crate) password: &'a str,
}

impl async_imap::Authenticator for PlainAuthenticator<'_> {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!("\0{}\0{}", self.username, self.password)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use async_imap::Authenticator;
    use async_imap::imap_proto::parser::parse_response;

    use super::*;

    fn caps(line: &[u8]) -> Option<ServerCapabilities> {
        let (_, response) = parse_response(line).unwrap();
        ServerCapabilities::from_response(&response)
    }

    #[test]
    fn test_greeting_capabilities() {
        let parsed =
            caps(b"* OK [CAPABILITY IMAP4rev1 IDLE AUTH=PLAIN AUTH=XOAUTH2] ready\r\n").unwrap();
        assert!(parsed.has("idle"));
        assert_eq!(parsed.usable_mechanisms().collect::<Vec<_>>(), vec!["PLAIN"]);
    }

    #[test]
    fn test_greeting_without_capabilities() {
        assert!(caps(b"* OK ready\r\n").is_none());
        assert_eq!(negotiate(None).unwrap(), Mechanism::Login);
    }

    #[test]
    fn test_prefers_plain() {
        let parsed = caps(b"* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN AUTH=LOGIN] hi\r\n");
        assert_eq!(negotiate(parsed.as_ref()).unwrap(), Mechanism::Plain);
    }

    #[test]
    fn test_oauth_only_falls_back_to_login() {
        let parsed = caps(b"* OK [CAPABILITY IMAP4rev1 AUTH=XOAUTH2 AUTH=OAUTHBEARER] hi\r\n");
        assert_eq!(negotiate(parsed.as_ref()).unwrap(), Mechanism::Login);
    }

    #[test]
    fn test_login_disabled_without_plain() {
        let parsed = caps(b"* OK [CAPABILITY IMAP4rev1 LOGINDISABLED AUTH=XOAUTH2] hi\r\n");
        assert!(matches!(negotiate(parsed.as_ref()), Err(Error::Auth(_))));
    }

    #[test]
    fn test_plain_response() {
        let mut auth = PlainAuthenticator {
            username: "user@example.com",
            password: "secret",
        };
        assert_eq!(auth.process(b""), "\0user@example.com\0secret");
    }
}
