//! Global config singleton. Load `<home>/.ccr/config.json` once; the
//! server and client binaries both call `ensure_loaded()` so the first
//! caller does the work and later callers get the same instance.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::RngCore;
use serde::{Deserialize, Serialize};

const CONFIG_DIR: &str = ".ccr";
const CONFIG_FILE: &str = "config.json";

/// Persisted server configuration (`<home>/.ccr/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// 32 random bytes, hex-encoded. Signs and verifies bearer tokens.
    #[serde(rename = "jwtSecret")]
    pub jwt_secret: String,
    /// Optional TLS material. Both must be present to enable TLS.
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
}

fn default_port() -> u16 {
    3100
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            jwt_secret: generate_secret(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// `<home>/.ccr`.
pub fn ccr_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
}

/// `<home>/.ccr/sessions` — the sandbox root for per-session working
/// directories.
pub fn sessions_root() -> PathBuf {
    ccr_home().join("sessions")
}

/// `<home>/.ccr/token` — the persisted bearer token file path.
pub fn token_path() -> PathBuf {
    ccr_home().join("token")
}

/// `<home>/.ccr/server.pid`.
pub fn pid_path() -> PathBuf {
    ccr_home().join("server.pid")
}

/// Ensure config is loaded (idempotent). Loads `<home>/.ccr/config.json`
/// on first call, creating it with generated defaults if absent; returns
/// the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(|| {
        let path = ccr_home().join(CONFIG_FILE);
        match load_from(&path) {
            Some(cfg) => cfg,
            None => {
                let cfg = Config::default();
                if let Err(e) = save_to(&path, &cfg) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist generated config");
                }
                cfg
            }
        }
    })
}

fn load_from(path: &Path) -> Option<Config> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn save_to(path: &Path, cfg: &Config) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(path, &serde_json::to_string_pretty(cfg)?)
}

/// Write `contents` to `path` atomically: write to a sibling `.tmp` file,
/// then rename over the destination.
pub fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_secret_is_32_bytes_hex() {
        let cfg = Config::default();
        assert_eq!(cfg.jwt_secret.len(), 64);
        assert!(hex::decode(&cfg.jwt_secret).is_ok());
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = Config::default();
        save_to(&path, &cfg).unwrap();
        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.port, cfg.port);
        assert_eq!(loaded.jwt_secret, cfg.jwt_secret);
    }
}
