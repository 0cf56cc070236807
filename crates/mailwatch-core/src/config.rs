//! Server, credential and watch configuration.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Mailbox watched when none is configured.
pub const DEFAULT_MAILBOX: &str = "INBOX";

/// Forced reconnect interval of the watch loop.
pub const DEFAULT_CYCLE: Duration = Duration::from_secs(15 * 60);

/// Longest accepted watch cycle.
pub const MAX_CYCLE: Duration = Duration::from_secs(24 * 60 * 60);

pub use mailwatch_imap::Security;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname.
    pub host: String,
    /// Explicit port; the security mode's default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Transport encryption.
    #[serde(default)]
    pub security: Security,
}

impl ServerConfig {
    /// Implicit TLS on the default port.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            security: Security::Tls,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// The port to dial: the explicit one, else the security mode's default.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.security.default_port())
    }
}

/// Username and password, passed through to the server unchanged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login name, usually the email address.
    pub username: String,
    /// Password or app password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters of the watch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Mailbox to watch.
    pub mailbox: String,
    /// Wall-clock length of one connection cycle.
    pub cycle: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            mailbox: DEFAULT_MAILBOX.to_string(),
            cycle: DEFAULT_CYCLE,
        }
    }
}

/// Everything needed to run a watcher, as stored in a settings file.
///
/// ```json
/// { "host": "imap.example.com", "username": "me@example.com", "password": "...",
///   "security": "tls", "mailbox": "INBOX", "cycle_secs": 900 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Server settings.
    #[serde(flatten)]
    pub server: ServerConfig,
    /// Login.
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Mailbox to watch.
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Cycle length in seconds.
    #[serde(default = "default_cycle_secs")]
    pub cycle_secs: u64,
}

fn default_mailbox() -> String {
    DEFAULT_MAILBOX.to_string()
}

const fn default_cycle_secs() -> u64 {
    DEFAULT_CYCLE.as_secs()
}

impl WatchConfig {
    /// Creates a configuration with the default mailbox and cycle.
    #[must_use]
    pub fn new(server: ServerConfig, credentials: Credentials) -> Self {
        Self {
            server,
            credentials,
            mailbox: default_mailbox(),
            cycle_secs: default_cycle_secs(),
        }
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serde`] on malformed JSON or missing fields.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON settings file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and [`Error::Serde`]
    /// if it is not valid.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let config = Self::from_json(&contents)?;
        tracing::debug!(path = %path.display(), host = %config.server.host, "loaded settings");
        Ok(config)
    }

    /// Watch loop parameters.
    #[must_use]
    pub fn options(&self) -> WatchOptions {
        WatchOptions {
            mailbox: self.mailbox.clone(),
            cycle: Duration::from_secs(self.cycle_secs),
        }
    }

    /// Checks every field; see [`validate_config`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every problem found.
    pub fn validate(&self) -> Result<()> {
        validate_config(self).map_err(|errors| {
            let messages: Vec<&str> = errors.iter().map(ValidationError::message).collect();
            Error::Config(messages.join("; "))
        })
    }
}

/// Validation error for watch configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// Host is empty.
    EmptyHost,
    /// Port is 0.
    InvalidPort,
    /// Username is empty.
    EmptyUsername,
    /// Password is empty.
    EmptyPassword,
    /// Mailbox name is empty.
    EmptyMailbox,
    /// Cycle length is 0.
    ZeroCycle,
    /// Cycle length exceeds [`MAX_CYCLE`].
    CycleTooLong,
}

impl ValidationError {
    /// Get human-readable error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::EmptyHost => "IMAP server is required",
            Self::InvalidPort => "IMAP port must be 1-65535",
            Self::EmptyUsername => "IMAP username is required",
            Self::EmptyPassword => "IMAP password is required",
            Self::EmptyMailbox => "Mailbox name is required",
            Self::ZeroCycle => "Watch cycle must be at least one second",
            Self::CycleTooLong => "Watch cycle must be at most one day",
        }
    }

    /// Get the field name this error relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::EmptyHost => "host",
            Self::InvalidPort => "port",
            Self::EmptyUsername => "username",
            Self::EmptyPassword => "password",
            Self::EmptyMailbox => "mailbox",
            Self::ZeroCycle | Self::CycleTooLong => "cycle_secs",
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating a configuration.
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validates server and credentials.
///
/// # Errors
///
/// Returns every `ValidationError` found.
pub fn validate_connection(server: &ServerConfig, credentials: &Credentials) -> ValidationResult {
    let mut errors = Vec::new();
    if server.host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost);
    }
    if server.port == Some(0) {
        errors.push(ValidationError::InvalidPort);
    }
    if credentials.username.trim().is_empty() {
        errors.push(ValidationError::EmptyUsername);
    }
    if credentials.password.is_empty() {
        errors.push(ValidationError::EmptyPassword);
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Validates a whole watch configuration.
///
/// # Errors
///
/// Returns every `ValidationError` found.
pub fn validate_config(config: &WatchConfig) -> ValidationResult {
    let mut errors = validate_connection(&config.server, &config.credentials)
        .err()
        .unwrap_or_default();
    if config.mailbox.trim().is_empty() {
        errors.push(ValidationError::EmptyMailbox);
    }
    if config.cycle_secs == 0 {
        errors.push(ValidationError::ZeroCycle);
    } else if config.cycle_secs > MAX_CYCLE.as_secs() {
        errors.push(ValidationError::CycleTooLong);
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
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
    use super::*;

    fn config() -> WatchConfig {
        WatchConfig::new(
            ServerConfig::new("imap.example.com"),
            Credentials::new("me@example.com", "hunter2"),
        )
    }

    #[test]
    fn test_defaults() {
        let options = WatchOptions::default();
        assert_eq!(options.mailbox, "INBOX");
        assert_eq!(options.cycle, Duration::from_secs(900));
        assert_eq!(config().options(), options);
    }

    #[test]
    fn test_effective_port() {
        let tls = ServerConfig::new("imap.example.com");
        assert_eq!(tls.security, Security::Tls);
        assert_eq!(tls.effective_port(), 993);

        let starttls = ServerConfig::new("imap.example.com").with_security(Security::StartTls);
        assert_eq!(starttls.effective_port(), 143);

        let custom = starttls.with_port(1143);
        assert_eq!(custom.effective_port(), 1143);
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", Credentials::new("me", "hunter2"));
        assert!(debug.contains("me"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_parse_minimal_json() {
        let parsed = WatchConfig::from_json(
            r#"{"host": "imap.example.com", "username": "me@example.com", "password": "hunter2"}"#,
        )
        .unwrap();
        assert_eq!(parsed, config());
    }

    #[test]
    fn test_parse_full_json() {
        let parsed = WatchConfig::from_json(
            r#"{"host": "mail.local", "port": 1143, "security": "starttls",
                "username": "u", "password": "p", "mailbox": "Alerts", "cycle_secs": 60}"#,
        )
        .unwrap();
        assert_eq!(parsed.server.port, Some(1143));
        assert_eq!(parsed.server.security, Security::StartTls);
        assert_eq!(parsed.options().mailbox, "Alerts");
        assert_eq!(parsed.options().cycle, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_missing_password() {
        let err = WatchConfig::from_json(r#"{"host": "h", "username": "u"}"#).unwrap_err();
        assert!(matches!(err, Error::Serde(_)));
    }

    #[test]
    fn test_validate_ok() {
        assert!(validate_config(&config()).is_ok());
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_field() {
        let mut bad = WatchConfig::new(
            ServerConfig::new("  ").with_port(0),
            Credentials::new("", ""),
        );
        bad.mailbox = String::new();
        bad.cycle_secs = 0;

        let errors = validate_config(&bad).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(ValidationError::field).collect();
        assert_eq!(
            fields,
            vec!["host", "port", "username", "password", "mailbox", "cycle_secs"]
        );
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = WatchConfig::load(Path::new("/nonexistent/mailwatch.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_validate_rejects_oversized_cycle() {
        let parsed = WatchConfig::from_json(
            r#"{"host": "imap.example.com", "username": "u", "password": "p",
                "cycle_secs": 18446744073709551615}"#,
        )
        .unwrap();

        assert_eq!(
            validate_config(&parsed).unwrap_err(),
            vec![ValidationError::CycleTooLong]
        );
        let err = parsed.validate().unwrap_err();
        assert!(err.to_string().contains("at most one day"));
    }

    #[test]
    fn test_validate_cycle_bounds() {
        let mut day = config();
        day.cycle_secs = MAX_CYCLE.as_secs();
        assert!(day.validate().is_ok());

        day.cycle_secs += 1;
        assert!(day.validate().is_err());
    }
}
