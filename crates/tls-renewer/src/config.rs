//! Daemon configuration
//!
//! Loaded once at startup and treated as immutable afterwards. JSON is the
//! primary format; files ending in `.toml` are parsed as TOML instead.
//!
//! ```json
//! {
//!   "vault": {
//!     "address": "https://vault.internal:8200",
//!     "token": "${VAULT_TOKEN}",
//!     "path": "pki/issue/web"
//!   },
//!   "cert": { "common_name": "web.internal", "ttl": "72h" },
//!   "tls": { "cert": "/etc/ssl/web.pem", "key": "/etc/ssl/web.pem" },
//!   "onstart": [{ "command": "systemctl start nginx" }],
//!   "onreplace": [
//!     { "command": "systemctl reload nginx", "onfail": { "retry_every": 5000, "retry_num": 3 } }
//!   ],
//!   "intervals": { "ok": 0.2, "error": 0.05, "default": 30000, "buffer": 0.25 }
//! }
//! ```

use crate::env_expand::{expand_env_vars, EnvExpandError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse JSON config: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse TOML config: {0}")]
    ParseToml(#[from] toml::de::Error),

    #[error("failed to expand environment variable: {0}")]
    EnvExpand(#[from] EnvExpandError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("Config file security: {0}")]
    InsecureConfig(String),
}

/// Vault PKI connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// Base URL, e.g. `https://vault.internal:8200`
    pub address: String,

    /// Token sent as `X-Vault-Token`. Usually `${VAULT_TOKEN}`.
    pub token: String,

    /// Issue endpoint below `/v1/`, e.g. `pki/issue/web`
    pub path: String,

    /// Request timeout in milliseconds (default: 30000)
    #[serde(default = "default_vault_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_vault_timeout_ms() -> u64 {
    30_000
}

impl VaultConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate_and_expand(&mut self) -> Result<(), ConfigError> {
        self.address = expand_env_vars(&self.address)?;
        self.token = expand_env_vars(&self.token)?;
        self.path = expand_env_vars(&self.path)?;

        for (field, value) in [
            ("vault.address", &self.address),
            ("vault.token", &self.token),
            ("vault.path", &self.path),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(field.to_string()));
            }
        }

        if !self.address.starts_with("http://") && !self.address.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "vault.address must be an http(s) URL, got '{}'",
                self.address
            )));
        }

        Ok(())
    }
}

/// Bundle destination and optional CA trust root for the Vault connection
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Extra PEM trust root used when connecting to Vault
    #[serde(default)]
    pub ca: Option<PathBuf>,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsConfig {
    /// The combined certificate + key file
    pub fn bundle_path(&self) -> &Path {
        &self.cert
    }
}

/// Retry policy for a single hook command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OnFail {
    /// Milliseconds to wait between attempts
    #[serde(default = "default_retry_every")]
    pub retry_every: u64,

    /// Total number of attempts
    #[serde(default = "default_retry_num")]
    pub retry_num: u32,
}

fn default_retry_every() -> u64 {
    60_000
}

fn default_retry_num() -> u32 {
    7
}

impl Default for OnFail {
    fn default() -> Self {
        Self {
            retry_every: default_retry_every(),
            retry_num: default_retry_num(),
        }
    }
}

/// One operator command run after a lifecycle event
///
/// # Security Warning
///
/// Hook commands run through `sh -c` with the daemon's privileges. Keep the
/// configuration file owned by root or the service account and not writable
/// by anyone else; `Config::from_file` refuses world-writable files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HookSpec {
    pub command: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub onfail: OnFail,

    /// Per-attempt timeout in milliseconds; unlimited when absent
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl HookSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: None,
            onfail: OnFail::default(),
            timeout: None,
        }
    }

    pub fn with_onfail(mut self, retry_every: u64, retry_num: u32) -> Self {
        self.onfail = OnFail {
            retry_every,
            retry_num,
        };
        self
    }

    /// Name used in log lines
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.command)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.onfail.retry_every)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// Scheduling fractions, applied to a certificate's ttl
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct IntervalsConfig {
    /// Fraction of ttl between cycles while healthy
    #[serde(default = "default_ok")]
    pub ok: f64,

    /// Fraction of ttl between retries while degraded
    #[serde(default = "default_error")]
    pub error: f64,

    /// Fixed delay in milliseconds before the first certificate exists
    #[serde(rename = "default", default = "default_default_ms")]
    pub default_ms: u64,

    /// Fraction of ttl, counted back from expiry, inside which a standby
    /// certificate is installed immediately
    #[serde(default = "default_buffer")]
    pub buffer: f64,
}

fn default_ok() -> f64 {
    0.2
}

fn default_error() -> f64 {
    0.05
}

fn default_default_ms() -> u64 {
    30_000
}

fn default_buffer() -> f64 {
    0.25
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            ok: default_ok(),
            error: default_error(),
            default_ms: default_default_ms(),
            buffer: default_buffer(),
        }
    }
}

impl IntervalsConfig {
    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_range("intervals.ok", self.ok, 0.01, 0.45)?;
        check_range("intervals.error", self.error, 0.01, 0.3)?;
        check_range("intervals.buffer", self.buffer, 0.05, 0.8)?;
        Ok(())
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} must be within [{}, {}], got {}",
            field, min, max, value
        )))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vault: VaultConfig,

    /// Request body passed to the CA verbatim
    #[serde(default = "default_cert_request")]
    pub cert: serde_json::Value,

    pub tls: TlsConfig,

    #[serde(default)]
    pub onstart: Vec<HookSpec>,

    #[serde(default)]
    pub onreplace: Vec<HookSpec>,

    #[serde(default)]
    pub intervals: IntervalsConfig,
}

fn default_cert_request() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Config {
    /// Read, parse and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        // Hook commands execute with daemon privileges
        Self::check_config_permissions(path)?;

        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let mut config = if is_toml {
            Self::from_toml_str(&content)?
        } else {
            Self::from_json_str(&content)?
        };
        config.validate_and_expand()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Expand `${VAR}` references and enforce value ranges
    pub fn validate_and_expand(&mut self) -> Result<(), ConfigError> {
        self.vault.validate_and_expand()?;
        self.intervals.validate()?;

        if !self.cert.is_object() {
            return Err(ConfigError::Invalid(
                "cert must be an object of request parameters".to_string(),
            ));
        }

        if self.tls.cert.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("tls.cert".to_string()));
        }
        if self.tls.cert != self.tls.key {
            return Err(ConfigError::Invalid(format!(
                "tls.cert ({}) and tls.key ({}) must name the same bundle file",
                self.tls.cert.display(),
                self.tls.key.display()
            )));
        }

        for (list, hooks) in [("onstart", &self.onstart), ("onreplace", &self.onreplace)] {
            for (i, hook) in hooks.iter().enumerate() {
                if hook.command.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "{}[{}].command cannot be empty",
                        list, i
                    )));
                }
                if hook.onfail.retry_num == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "{}[{}].onfail.retry_num must be at least 1",
                        list, i
                    )));
                }
            }
        }

        Ok(())
    }

    /// Reject world-writable config files, warn on group-writable ones
    #[cfg(unix)]
    fn check_config_permissions(path: &Path) -> Result<(), ConfigError> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::Read(e));
            }
            Err(_) => {
                warn!(
                    path = %path.display(),
                    "Unable to check config file permissions - ensure file is not world-writable"
                );
                return Ok(());
            }
        };

        let mode = metadata.permissions().mode();

        if mode & 0o002 != 0 {
            return Err(ConfigError::InsecureConfig(format!(
                "Config file '{}' is world-writable (mode {:o}). \
                 It contains hook commands that run with daemon privileges. \
                 Fix with: chmod o-w {}",
                path.display(),
                mode,
                path.display()
            )));
        }

        if mode & 0o020 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{:o}", mode),
                "Config file is group-writable - consider restricting with chmod g-w"
            );
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_config_permissions(_path: &Path) -> Result<(), ConfigError> {
        Ok(())
    }
}
