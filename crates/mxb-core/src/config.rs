use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{errors::Error, Result};

/// Typed configuration, loaded once at startup and immutable afterwards.
///
/// Env key names follow the original deployment where they exist
/// (`HOMESERVER_URL`, `ACCESS_TOKEN`, `BOT_USERNAME`, `BOT_PASSWORD`).
#[derive(Clone, Debug)]
pub struct Config {
    // Server + identity
    pub homeserver_url: String,
    pub access_token: Option<String>,
    pub bot_username: Option<String>,
    pub bot_password: Option<String>,

    // Command matcher
    pub command_prefix: String,
    pub command_reply: String,
    pub autojoin: bool,

    // Sync loop
    pub sync_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub handler_timeout: Duration,
    pub dedup_window: usize,

    // Persistence
    pub state_file: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let homeserver_url = env_str("HOMESERVER_URL")
            .and_then(non_empty)
            .map(|u| u.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                Error::Config("HOMESERVER_URL environment variable is required".to_string())
            })?;

        let access_token = env_str("ACCESS_TOKEN").and_then(non_empty);
        let bot_username = env_str("BOT_USERNAME").and_then(non_empty);
        let bot_password = env_str("BOT_PASSWORD").and_then(non_empty);

        // Either a long-lived token or a full login identity must be present.
        // With both, the token is used first and the login is the refresh path.
        let has_login = bot_username.is_some() && bot_password.is_some();
        if access_token.is_none() && !has_login {
            return Err(Error::Config(
                "either ACCESS_TOKEN or BOT_USERNAME + BOT_PASSWORD is required".to_string(),
            ));
        }

        let command_prefix = env_str("COMMAND_PREFIX")
            .and_then(non_empty)
            .unwrap_or_else(|| "!hello".to_string());
        let command_reply = env_str("COMMAND_REPLY")
            .and_then(non_empty)
            .unwrap_or_else(|| "Hello world!".to_string());
        let autojoin = env_bool("AUTOJOIN").unwrap_or(true);

        let sync_timeout = Duration::from_millis(env_u64("SYNC_TIMEOUT_MS").unwrap_or(30_000));
        let backoff_base = Duration::from_millis(env_u64("BACKOFF_BASE_MS").unwrap_or(1_000));
        let backoff_cap = Duration::from_millis(env_u64("BACKOFF_CAP_MS").unwrap_or(30_000));
        let handler_timeout =
            Duration::from_millis(env_u64("HANDLER_TIMEOUT_MS").unwrap_or(10_000));
        let dedup_window = env_usize("DEDUP_WINDOW").unwrap_or(1024).max(1);

        let state_file =
            PathBuf::from(env_str("STATE_FILE").unwrap_or("mxb-state.json".to_string()));

        Ok(Self {
            homeserver_url,
            access_token,
            bot_username,
            bot_password,
            command_prefix,
            command_reply,
            autojoin,
            sync_timeout,
            backoff_base,
            backoff_cap,
            handler_timeout,
            dedup_window,
            state_file,
        })
    }

    /// True when a password login is available as a refresh path.
    pub fn can_login(&self) -> bool {
        self.bot_username.is_some() && self.bot_password.is_some()
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            homeserver_url: "https://hs.example".into(),
            access_token: Some("tok".into()),
            bot_username: None,
            bot_password: None,
            command_prefix: "!hello".into(),
            command_reply: "Hello world!".into(),
            autojoin: true,
            sync_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(10),
            dedup_window: 1024,
            state_file: PathBuf::from("mxb-state.json"),
        }
    }

    #[test]
    fn can_login_requires_both_halves() {
        let mut cfg = test_config();
        assert!(!cfg.can_login());
        cfg.bot_username = Some("bot".into());
        assert!(!cfg.can_login());
        cfg.bot_password = Some("hunter2".into());
        assert!(cfg.can_login());
    }

    #[test]
    fn non_empty_rejects_whitespace() {
        assert_eq!(non_empty("  ".into()), None);
        assert_eq!(non_empty("x".into()), Some("x".into()));
    }
}
