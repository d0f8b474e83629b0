use actix_web::cookie::Key;

use crate::errors::AppError;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://stockroom.db";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
/// `Key::from` needs at least this many bytes of master key.
pub const MIN_SESSION_KEY_BYTES: usize = 64;

#[derive(Clone)]
pub struct Settings {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    session_key: Vec<u8>,
    pub cookie_secure: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned());
        let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_owned());

        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|e| AppError::ConfigError(format!("PORT {:?} is invalid: {}", raw, e)))?,
            None => DEFAULT_PORT,
        };

        let session_key = lookup("SESSION_KEY")
            .ok_or_else(|| AppError::ConfigError("SESSION_KEY is not set".to_owned()))?
            .into_bytes();
        if session_key.len() < MIN_SESSION_KEY_BYTES {
            return Err(AppError::ConfigError(format!(
                "SESSION_KEY must be at least {} bytes long, got {}",
                MIN_SESSION_KEY_BYTES,
                session_key.len()
            )));
        }

        let cookie_secure = match lookup("COOKIE_SECURE") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                AppError::ConfigError(format!("COOKIE_SECURE {:?} is not a boolean", raw))
            })?,
            None => true,
        };

        Ok(Settings {
            database_url,
            host,
            port,
            session_key,
            cookie_secure,
        })
    }

    pub fn session_key(&self) -> Key {
        Key::from(&self.session_key)
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("database_url", &self.database_url)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("session_key", &"<redacted>")
            .field("cookie_secure", &self.cookie_secure)
            .finish()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn long_key() -> String {
        "k".repeat(MIN_SESSION_KEY_BYTES)
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let key = long_key();
        let settings = Settings::from_lookup(lookup_from(&[("SESSION_KEY", key.as_str())])).unwrap();
        assert_eq!(settings.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert!(settings.cookie_secure);
    }

    #[test]
    fn missing_session_key_is_rejected() {
        let err = Settings::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn short_session_key_is_rejected() {
        let err = Settings::from_lookup(lookup_from(&[("SESSION_KEY", "short")])).unwrap_err();
        assert!(err.to_string().contains("at least 64 bytes"));
    }

    #[test]
    fn overrides_are_parsed() {
        let key = long_key();
        let settings = Settings::from_lookup(lookup_from(&[
            ("SESSION_KEY", key.as_str()),
            ("DATABASE_URL", "sqlite://other.db"),
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("COOKIE_SECURE", "off"),
        ]))
        .unwrap();
        assert_eq!(settings.database_url, "sqlite://other.db");
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.port, 9000);
        assert!(!settings.cookie_secure);
    }

    #[test]
    fn bad_port_is_rejected() {
        let key = long_key();
        let err = Settings::from_lookup(lookup_from(&[("SESSION_KEY", key.as_str()), ("PORT", "http")]))
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
