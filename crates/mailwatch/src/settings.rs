//! Settings file and environment overrides.

use std::path::PathBuf;

use anyhow::{Context, bail};
use mailwatch_core::{Credentials, ServerConfig, WatchConfig};

/// Overrides the settings file location.
pub const CONFIG_ENV: &str = "MAILWATCH_CONFIG";

const HOST_ENV: &str = "MAILWATCH_HOST";
const USERNAME_ENV: &str = "MAILWATCH_USERNAME";
const PASSWORD_ENV: &str = "MAILWATCH_PASSWORD";

/// `$MAILWATCH_CONFIG`, else `<config dir>/mailwatch/settings.json`.
pub fn settings_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV).map_or_else(
        || {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mailwatch")
                .join("settings.json")
        },
        PathBuf::from,
    )
}

/// Values taken from the environment, winning over the file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Overrides {
    host: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl Overrides {
    /// Reads the `MAILWATCH_*` variables; empty ones are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value: &String| !value.is_empty());
        Self {
            host: get(HOST_ENV),
            username: get(USERNAME_ENV),
            password: get(PASSWORD_ENV),
        }
    }

    /// Merges onto `file`, or builds a configuration from the overrides
    /// alone when there is no file.
    pub fn resolve(self, file: Option<WatchConfig>) -> anyhow::Result<WatchConfig> {
        let mut config = match (file, self.host, self.username, self.password) {
            (Some(mut config), host, username, password) => {
                if let Some(host) = host {
                    config.server.host = host;
                }
                if let Some(username) = username {
                    config.credentials.username = username;
                }
                if let Some(password) = password {
                    config.credentials.password = password;
                }
                config
            }
            (None, Some(host), Some(username), Some(password)) => {
                WatchConfig::new(ServerConfig::new(host), Credentials::new(username, password))
            }
            (None, ..) => bail!(
                "no settings file found; create one or set {HOST_ENV}, {USERNAME_ENV} and {PASSWORD_ENV}"
            ),
        };
        config.server.host = config.server.host.trim().to_string();
        config.validate()?;
        Ok(config)
    }
}

/// Loads the settings file if it exists and applies the environment.
pub async fn load() -> anyhow::Result<WatchConfig> {
    let path = settings_path();
    let file = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        let config = WatchConfig::load(&path)
            .await
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        Some(config)
    } else {
        tracing::debug!(path = %path.display(), "no settings file");
        None
    };
    Overrides::from_env().resolve(file)
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
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn overrides(vars: &[(&str, &str)]) -> Overrides {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Overrides::from_lookup(|key| vars.get(key).cloned())
    }

    fn file() -> WatchConfig {
        WatchConfig::from_json(
            r#"{"host": "imap.example.com", "username": "me@example.com",
                "password": "secret", "cycle_secs": 600}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_file_only() {
        let config = Overrides::default().resolve(Some(file())).unwrap();
        assert_eq!(config.server.host, "imap.example.com");
        assert_eq!(config.options().cycle, Duration::from_secs(600));
        assert_eq!(config.mailbox, "INBOX");
    }

    #[test]
    fn test_env_wins_over_file() {
        let env = overrides(&[(HOST_ENV, " imap.other.com "), (PASSWORD_ENV, "rotated")]);
        let config = env.resolve(Some(file())).unwrap();
        assert_eq!(config.server.host, "imap.other.com");
        assert_eq!(config.credentials.username, "me@example.com");
        assert_eq!(config.credentials.password, "rotated");
    }

    #[test]
    fn test_env_only() {
        let env = overrides(&[
            (HOST_ENV, "imap.example.com"),
            (USERNAME_ENV, "me"),
            (PASSWORD_ENV, "pw"),
        ]);
        let config = env.resolve(None).unwrap();
        assert_eq!(config.credentials.username, "me");
        assert_eq!(config.server.port, None);
    }

    #[test]
    fn test_empty_values_are_ignored() {
        let env = overrides(&[(HOST_ENV, ""), (USERNAME_ENV, "me"), (PASSWORD_ENV, "pw")]);
        let err = env.resolve(None).unwrap_err();
        assert!(err.to_string().contains(HOST_ENV));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut config = file();
        config.credentials.password.clear();
        let err = Overrides::default().resolve(Some(config)).unwrap_err();
        assert!(err.to_string().contains("password is required"));
    }
}
