use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::error::{CoreResult, RelayError};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Overall deadline for one attempt, body included (default 300000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Longest gap allowed between two body chunks (default 30000ms)
    #[serde(default = "default_read_stall_timeout_ms")]
    pub read_stall_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    /// Upper bound on bytes read from a non-200 error body
    #[serde(default = "default_error_body_limit")]
    pub error_body_limit: usize,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            read_stall_timeout_ms: default_read_stall_timeout_ms(),
            pool_max_idle_per_host: None,
            error_body_limit: default_error_body_limit(),
        }
    }
}

impl HttpCfg {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn read_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.read_stall_timeout_ms)
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    300_000
}
fn default_read_stall_timeout_ms() -> u64 {
    30_000
}
fn default_error_body_limit() -> usize {
    16 * 1024
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RetryCfg {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff step: the n-th retry waits `n * base_delay_ms`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    2_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FramingCfg {
    /// Pending bytes allowed before the reassembler force-flushes its buffer.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

impl Default for FramingCfg {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

fn default_max_buffer_bytes() -> usize {
    1024
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RelayConfig {
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub retry: RetryCfg,
    #[serde(default)]
    pub framing: FramingCfg,
}

impl RelayConfig {
    /// Load a RelayConfig from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?,
            _ => serde_json::from_str::<Self>(s).or_else(|_| {
                toml::from_str::<Self>(s)
                    .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
            })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make a session unbounded.
    pub fn validate(&self) -> CoreResult<()> {
        if self.http.read_stall_timeout_ms == 0 {
            return Err(RelayError::Config(
                "http.read_stall_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.framing.max_buffer_bytes == 0 {
            return Err(RelayError::Config(
                "framing.max_buffer_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.json");
        let json = r#"{
          "http": {"connect_timeout_ms": 1000, "read_stall_timeout_ms": 7000},
          "retry": {"max_retries": 4}
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = RelayConfig::from_path(&file).unwrap();
        assert_eq!(cfg.http.connect_timeout_ms, 1_000);
        assert_eq!(cfg.http.read_stall_timeout_ms, 7_000);
        assert_eq!(cfg.http.request_timeout_ms, 300_000);
        assert_eq!(cfg.retry.max_retries, 4);
        assert_eq!(cfg.retry.base_delay_ms, 2_000);
        assert_eq!(cfg.framing.max_buffer_bytes, 1024);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.toml");
        let toml = r#"
[http]
request_timeout_ms = 90000
pool_max_idle_per_host = 4

[retry]
base_delay_ms = 500

[framing]
max_buffer_bytes = 4096
"#;
        fs::write(&file, toml).unwrap();
        let cfg = RelayConfig::from_path(&file).unwrap();
        assert_eq!(cfg.http.request_timeout_ms, 90_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, Some(4));
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert_eq!(cfg.framing.max_buffer_bytes, 4096);
    }

    #[test]
    fn empty_document_yields_defaults() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.json");
        fs::write(&file, "{}").unwrap();
        let cfg = RelayConfig::from_path(&file).unwrap();
        assert_eq!(cfg, RelayConfig::default());
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/streamrelay-missing.json");
        let err = RelayConfig::from_path(&missing).unwrap_err();
        match err {
            RelayError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_json_returns_config_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.json");
        fs::write(&file, r#"{ "retry": { "max_retries": "many" }"#).unwrap();
        let err = RelayConfig::from_path(&file).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)), "got: {err:?}");
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("relay.conf");
        fs::write(&json_path, r#"{"retry":{"max_retries":1}}"#).unwrap();
        let cfg = RelayConfig::from_path(&json_path).unwrap();
        assert_eq!(cfg.retry.max_retries, 1);

        let toml_path = dir.path().join("relay2.conf");
        fs::write(&toml_path, "[retry]\nmax_retries = 3\n").unwrap();
        let cfg = RelayConfig::from_path(&toml_path).unwrap();
        assert_eq!(cfg.retry.max_retries, 3);
    }

    #[test]
    fn zero_read_stall_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("relay.json");
        fs::write(&file, r#"{"http":{"read_stall_timeout_ms":0}}"#).unwrap();
        let err = RelayConfig::from_path(&file).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
