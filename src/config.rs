use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

/// Runtime settings read from the environment (`.env` is loaded first in
/// debug builds).
#[derive(Clone, Debug)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub media_root: PathBuf,
    /// How long the rendered home page stays cached.
    pub index_cache_ttl: Duration,
    pub enable_hsts: bool,
    pub secure_cookies: bool,
    pub cors_origins: Vec<String>,
    /// Usernames that become staff when they sign up.
    pub bootstrap_admins: Vec<String>,
    /// Snapshot directory for the in-memory store; no persistence when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            media_root: PathBuf::from("media"),
            index_cache_ttl: Duration::from_secs(20),
            enable_hsts: false,
            secure_cookies: false,
            cors_origins: vec!["http://localhost:5173".into(), "http://127.0.0.1:5173".into()],
            bootstrap_admins: Vec::new(),
            data_dir: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(d.host),
            port: parsed_env("PORT", d.port),
            media_root: std::env::var("MEDIA_ROOT").map(PathBuf::from).unwrap_or(d.media_root),
            index_cache_ttl: Duration::from_secs(parsed_env("INDEX_CACHE_TTL", d.index_cache_ttl.as_secs())),
            enable_hsts: flag_env("ENABLE_HSTS"),
            secure_cookies: flag_env("SECURE_COOKIES"),
            cors_origins: list_env("CORS_ORIGINS").unwrap_or(d.cors_origins),
            bootstrap_admins: list_env("BOOTSTRAP_ADMIN_USERNAMES").unwrap_or_default(),
            data_dir: std::env::var("QUILL_DATA_DIR").ok().filter(|v| !v.is_empty()).map(PathBuf::from),
        }
    }

    pub fn is_bootstrap_admin(&self, username: &str) -> bool {
        self.bootstrap_admins.iter().any(|a| a == username)
    }
}

fn parsed_env<T: std::str::FromStr>(name: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("invalid {name} value {raw:?}: {e}; using default");
            default
        }),
        Err(_) => {
            info!("{name} not set, using default");
            default
        }
    }
}

fn flag_env(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn list_env(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|v| {
        v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
    })
}
