// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading and validation for the GPU render agent.
//!
//! [`AgentConfig`] is the top-level runtime settings struct, loaded from a
//! TOML file with [`load_config`]. Paths are expanded (`~`, env vars) and
//! canonicalised; the renderer's base URL is derived from either an
//! explicit `api_url`/`base_url` or a `scheme`/`host`/`port` triple, the
//! same precedence the agent has always used. [`validate_config`] returns
//! soft [`ConfigWarning`]s for values that are unusual but not invalid.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound on any configured timeout, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Timeouts above this many seconds produce a [`ConfigWarning::LargeTimeout`].
pub const LARGE_TIMEOUT_THRESHOLD: u64 = 3_600;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file missing: {0}")]
    FileNotFound(PathBuf),
    /// The file could not be read from disk.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The TOML body could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A required section or key was missing.
    #[error("configuration section '{section}' missing required key '{key}'")]
    MissingKey {
        /// Section name, e.g. `"objectstore"`.
        section: &'static str,
        /// Key name, e.g. `"endpoint"`.
        key: &'static str,
    },
    /// A value was present but semantically invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A non-fatal configuration issue surfaced after a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A timeout is configured above [`LARGE_TIMEOUT_THRESHOLD`] seconds.
    LargeTimeout {
        /// Dotted field path, e.g. `"renderer.timeout_seconds"`.
        field: &'static str,
        /// The configured value.
        seconds: u64,
    },
    /// No callback base URL is configured; status/completion/failure
    /// callbacks will be skipped for every job.
    NoCallbackBaseUrl,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LargeTimeout { field, seconds } => {
                write!(f, "{field} is set to {seconds}s, above the {LARGE_TIMEOUT_THRESHOLD}s sanity threshold")
            }
            Self::NoCallbackBaseUrl => {
                write!(f, "callbacks.base_url is unset; job status will not be reported to a controller")
            }
        }
    }
}

/// S3-compatible object-store credentials and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObjectStoreConfig {
    /// Host[:port] or full URL of the endpoint.
    pub endpoint: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Whether to use TLS when talking to the endpoint.
    #[serde(default)]
    pub secure: bool,
    /// Signing region; defaults to a placeholder region most S3-compatible
    /// stores ignore.
    #[serde(default)]
    pub region: Option<String>,
    /// Whether to verify TLS certificates.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

/// Renderer (ComfyUI-compatible) connection and timing settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RendererConfig {
    /// Fully normalised base URL, e.g. `"http://127.0.0.1:8188"`.
    pub api_url: String,
    /// Overall job timeout.
    #[serde(default = "default_renderer_timeout")]
    pub timeout_seconds: u64,
    /// Delay between `/history` polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    /// `client_id` sent with every submit.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// How long the allow-list oracle's `/object_info` result is cached.
    #[serde(default = "default_object_info_cache_seconds")]
    pub object_info_cache_seconds: f64,
    /// Delay after materialising new models before submitting, to let the
    /// renderer's filesystem watcher pick them up.
    #[serde(default = "default_model_refresh_delay")]
    pub model_refresh_delay_seconds: f64,
    /// Per-sampling-step timeout used to derive the dynamic poll deadline.
    #[serde(default = "default_per_step_timeout")]
    pub per_step_timeout_seconds: f64,
    /// Multiplier applied to the per-step timeout for img2img jobs.
    #[serde(default = "default_img2img_multiplier")]
    pub img2img_timeout_multiplier: f64,
}

/// Filesystem roots the agent materialises assets into and reads
/// workflows/writes outputs from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PathConfig {
    /// Checkpoint models directory.
    pub base_models: PathBuf,
    /// LoRA directory.
    pub loras: PathBuf,
    /// Local workflow JSON cache.
    pub workflows: PathBuf,
    /// Renderer output / artifact staging root.
    pub outputs: PathBuf,
    /// Scratch directory for partial downloads.
    pub temp: PathBuf,
}

impl PathConfig {
    /// All roots this config owns, in creation order.
    pub fn all(&self) -> [&Path; 5] {
        [
            &self.base_models,
            &self.loras,
            &self.workflows,
            &self.outputs,
            &self.temp,
        ]
    }
}

/// Controls whether downloaded (non-persistent) assets are deleted after a job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CleanupConfig {
    /// Delete downloaded LoRAs once the job finishes.
    #[serde(default = "default_true")]
    pub delete_downloaded_loras: bool,
    /// Delete downloaded checkpoint models once the job finishes.
    #[serde(default = "default_true")]
    pub delete_downloaded_models: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_downloaded_loras: true,
            delete_downloaded_models: true,
        }
    }
}

/// Controller callback transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CallbackConfig {
    /// Base URL status/completion/failure paths are joined against.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Whether to verify TLS certificates on callback requests.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    /// Per-request timeout.
    #[serde(default = "default_callback_timeout")]
    pub timeout_seconds: u64,
    /// Maximum delivery attempts per callback.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff unit: attempt `i` waits `retry_backoff_seconds * i`.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: f64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            verify_tls: true,
            timeout_seconds: default_callback_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_seconds: default_retry_backoff(),
        }
    }
}

/// Top-level agent configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    /// Object-store connection settings.
    pub objectstore: ObjectStoreConfig,
    /// Renderer connection settings.
    pub renderer: RendererConfig,
    /// Filesystem roots.
    pub paths: PathConfig,
    /// Object-store keys (model or LoRA) that are never deleted by cleanup,
    /// regardless of `cleanup` flags or an asset's own cache strategy.
    #[serde(default)]
    pub persistent_model_keys: Vec<String>,
    /// Asset cleanup policy.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Controller callback settings.
    #[serde(default)]
    pub callbacks: CallbackConfig,
    /// Default workflow parameter values, overridden by envelope parameters.
    #[serde(default)]
    pub workflow_defaults: BTreeMap<String, serde_json::Value>,
}

impl AgentConfig {
    /// Create every directory in [`PathConfig::all`] (and `<outputs>/logs`).
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in self.paths.all() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Read {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let logs = self.paths.outputs.join("logs");
        std::fs::create_dir_all(&logs).map_err(|source| ConfigError::Read {
            path: logs,
            source,
        })?;
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_renderer_timeout() -> u64 {
    900
}
fn default_poll_interval() -> f64 {
    2.0
}
fn default_client_id() -> String {
    "gpu-render-agent".to_string()
}
fn default_object_info_cache_seconds() -> f64 {
    45.0
}
fn default_model_refresh_delay() -> f64 {
    0.75
}
fn default_per_step_timeout() -> f64 {
    6.0
}
fn default_img2img_multiplier() -> f64 {
    1.5
}
fn default_callback_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> f64 {
    1.0
}

/// Normalise a required URL: trims whitespace, strips a trailing `/`,
/// and prefixes `default_scheme://` if no scheme is present.
pub fn normalize_url(value: &str, default_scheme: &str) -> Result<String, ConfigError> {
    let raw = value.trim();
    if raw.is_empty() {
        return Err(ConfigError::Invalid("URL cannot be empty".to_string()));
    }
    let candidate = raw.trim_end_matches('/');
    if candidate.is_empty() {
        return Err(ConfigError::Invalid("URL cannot be empty".to_string()));
    }
    if candidate.starts_with("http://") || candidate.starts_with("https://") {
        return Ok(candidate.to_string());
    }
    Ok(format!("{default_scheme}://{candidate}"))
}

/// Like [`normalize_url`] but returns `None` for an absent or blank value
/// instead of erroring.
pub fn normalize_optional_url(value: Option<&str>, default_scheme: &str) -> Option<String> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    normalize_url(raw, default_scheme).ok()
}

/// Raw `[renderer]` table shape before URL derivation, mirroring the set
/// of keys an operator may legitimately provide.
#[derive(Debug, Default, Deserialize)]
struct RawRendererSection {
    api_url: Option<String>,
    base_url: Option<String>,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    timeout_seconds: Option<u64>,
    poll_interval_seconds: Option<f64>,
    client_id: Option<String>,
    object_info_cache_seconds: Option<f64>,
    model_refresh_delay_seconds: Option<f64>,
    per_step_timeout_seconds: Option<f64>,
    img2img_timeout_multiplier: Option<f64>,
}

/// Derive a renderer base URL from either an explicit `api_url`/`base_url`
/// or a `scheme`/`host`/`port` triple, the host taking a literal scheme
/// prefix as an override.
fn derive_renderer_api_url(section: &RawRendererSection) -> Result<String, ConfigError> {
    if let Some(explicit) = section.api_url.as_deref().or(section.base_url.as_deref()) {
        if !explicit.trim().is_empty() {
            return normalize_url(explicit, "http");
        }
    }

    let scheme = section.scheme.clone().unwrap_or_else(|| "http".to_string());
    let scheme = if scheme.trim().is_empty() {
        "http".to_string()
    } else {
        scheme
    };
    let host = section
        .host
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let host = host.trim();
    if host.is_empty() {
        return Err(ConfigError::Invalid("renderer host cannot be empty".to_string()));
    }
    if host.starts_with("http://") || host.starts_with("https://") {
        return normalize_url(host, &scheme);
    }
    let port = section.port.unwrap_or(8188);
    if host.contains(':') {
        normalize_url(&format!("{scheme}://{host}"), &scheme)
    } else {
        normalize_url(&format!("{scheme}://{host}:{port}"), &scheme)
    }
}

/// Raw deserialisation shape of the whole TOML document, one level up from
/// [`AgentConfig`] so the renderer URL-derivation step can run first.
#[derive(Debug, Deserialize)]
struct RawConfig {
    objectstore: Option<RawObjectStoreSection>,
    renderer: Option<RawRendererSection>,
    paths: Option<RawPathSection>,
    #[serde(default)]
    persistent_model_keys: Vec<String>,
    cleanup: Option<CleanupConfig>,
    callbacks: Option<RawCallbackSection>,
    #[serde(default)]
    workflow_defaults: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawObjectStoreSection {
    endpoint: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    #[serde(default)]
    secure: bool,
    region: Option<String>,
    #[serde(default = "default_true")]
    verify_tls: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawPathSection {
    base_models: Option<String>,
    loras: Option<String>,
    workflows: Option<String>,
    outputs: Option<String>,
    temp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCallbackSection {
    base_url: Option<String>,
    #[serde(default = "default_true")]
    verify_tls: bool,
    #[serde(default = "default_callback_timeout")]
    timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    retry_backoff_seconds: f64,
}

fn require_str(
    section: &str,
    key: &'static str,
    field: Option<&str>,
) -> Result<String, ConfigError> {
    let value = field.map(str::trim).filter(|s| !s.is_empty());
    value
        .map(str::to_string)
        .ok_or_else(|| ConfigError::MissingKey {
            section: leak_section(section),
            key,
        })
}

// Section names are a closed, known set, so leaking a &'static str per call
// site (rather than threading lifetimes through RawConfig) keeps the error
// type simple; this never runs in a hot loop.
fn leak_section(section: &str) -> &'static str {
    match section {
        "objectstore" => "objectstore",
        "paths" => "paths",
        _ => "config",
    }
}

/// Expand a leading `~` to `$HOME` and any `$VAR`/`${VAR}` references, the
/// same expansion `os.path.expanduser`/`os.path.expandvars` perform.
fn resolve_path(value: &str) -> PathBuf {
    let home_expanded = if let Some(rest) = value.strip_prefix("~/") {
        std::env::var("HOME")
            .map(|home| format!("{home}/{rest}"))
            .unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    };
    PathBuf::from(expand_env_vars(&home_expanded))
}

fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if braced {
                if next == '}' {
                    chars.next();
                    break;
                }
            } else if !(next.is_alphanumeric() || next == '_') {
                break;
            }
            name.push(next);
            chars.next();
        }
        match std::env::var(&name) {
            Ok(v) => out.push_str(&v),
            Err(_) => {
                out.push('$');
                if braced {
                    out.push('{');
                }
                out.push_str(&name);
                if braced {
                    out.push('}');
                }
            }
        }
    }
    out
}

/// Load and validate an [`AgentConfig`] from a TOML file on disk.
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_toml(&body)
}

/// Parse and validate an [`AgentConfig`] from an in-memory TOML document.
pub fn parse_toml(body: &str) -> Result<AgentConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(body)?;

    let objectstore_raw = raw.objectstore.unwrap_or_default();
    let objectstore = ObjectStoreConfig {
        endpoint: require_str("objectstore", "endpoint", objectstore_raw.endpoint.as_deref())?,
        access_key: require_str(
            "objectstore",
            "access_key",
            objectstore_raw.access_key.as_deref(),
        )?,
        secret_key: require_str(
            "objectstore",
            "secret_key",
            objectstore_raw.secret_key.as_deref(),
        )?,
        secure: objectstore_raw.secure,
        region: objectstore_raw.region,
        verify_tls: objectstore_raw.verify_tls,
    };

    let renderer_raw = raw.renderer.unwrap_or_default();
    let renderer = RendererConfig {
        api_url: derive_renderer_api_url(&renderer_raw)?,
        timeout_seconds: renderer_raw.timeout_seconds.unwrap_or_else(default_renderer_timeout),
        poll_interval_seconds: renderer_raw
            .poll_interval_seconds
            .unwrap_or_else(default_poll_interval),
        client_id: renderer_raw.client_id.unwrap_or_else(default_client_id),
        object_info_cache_seconds: renderer_raw
            .object_info_cache_seconds
            .unwrap_or_else(default_object_info_cache_seconds),
        model_refresh_delay_seconds: renderer_raw
            .model_refresh_delay_seconds
            .unwrap_or_else(default_model_refresh_delay),
        per_step_timeout_seconds: renderer_raw
            .per_step_timeout_seconds
            .unwrap_or_else(default_per_step_timeout),
        img2img_timeout_multiplier: renderer_raw
            .img2img_timeout_multiplier
            .unwrap_or_else(default_img2img_multiplier),
    };

    let paths_raw = raw.paths.unwrap_or_default();
    let paths = PathConfig {
        base_models: resolve_path(&require_str(
            "paths",
            "base_models",
            paths_raw.base_models.as_deref(),
        )?),
        loras: resolve_path(&require_str("paths", "loras", paths_raw.loras.as_deref())?),
        workflows: resolve_path(&require_str(
            "paths",
            "workflows",
            paths_raw.workflows.as_deref(),
        )?),
        outputs: resolve_path(&require_str(
            "paths",
            "outputs",
            paths_raw.outputs.as_deref(),
        )?),
        temp: resolve_path(&require_str("paths", "temp", paths_raw.temp.as_deref())?),
    };

    let callbacks_raw = raw.callbacks.unwrap_or_default();
    let callbacks = CallbackConfig {
        base_url: normalize_optional_url(callbacks_raw.base_url.as_deref(), "http"),
        verify_tls: callbacks_raw.verify_tls,
        timeout_seconds: callbacks_raw.timeout_seconds,
        max_retries: callbacks_raw.max_retries,
        retry_backoff_seconds: callbacks_raw.retry_backoff_seconds,
    };

    Ok(AgentConfig {
        objectstore,
        renderer,
        paths,
        persistent_model_keys: raw.persistent_model_keys,
        cleanup: raw.cleanup.unwrap_or_default(),
        callbacks,
        workflow_defaults: raw
            .workflow_defaults
            .into_iter()
            .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k, v)))
            .collect(),
    })
}

/// Validate a loaded config, returning soft warnings. Hard errors are
/// caught during [`parse_toml`] itself; this only flags unusual-but-legal
/// values.
pub fn validate_config(config: &AgentConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    if config.renderer.timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "renderer.timeout_seconds must be > 0".to_string(),
        ));
    }
    if config.renderer.timeout_seconds > MAX_TIMEOUT_SECS {
        return Err(ConfigError::Invalid(format!(
            "renderer.timeout_seconds exceeds the maximum of {MAX_TIMEOUT_SECS}s"
        )));
    }

    let mut warnings = Vec::new();
    if config.renderer.timeout_seconds > LARGE_TIMEOUT_THRESHOLD {
        warnings.push(ConfigWarning::LargeTimeout {
            field: "renderer.timeout_seconds",
            seconds: config.renderer.timeout_seconds,
        });
    }
    if config.callbacks.timeout_seconds > LARGE_TIMEOUT_THRESHOLD {
        warnings.push(ConfigWarning::LargeTimeout {
            field: "callbacks.timeout_seconds",
            seconds: config.callbacks.timeout_seconds,
        });
    }
    if config.callbacks.base_url.is_none() {
        warnings.push(ConfigWarning::NoCallbackBaseUrl);
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        [objectstore]
        endpoint = "minio:9000"
        access_key = "key"
        secret_key = "secret"

        [renderer]
        host = "127.0.0.1"
        port = 8188

        [paths]
        base_models = "/data/models"
        loras = "/data/loras"
        workflows = "/data/workflows"
        outputs = "/data/outputs"
        temp = "/data/tmp"
        "#
    }

    #[test]
    fn parses_minimal_document_with_defaults() {
        let cfg = parse_toml(sample_toml()).unwrap();
        assert_eq!(cfg.renderer.api_url, "http://127.0.0.1:8188");
        assert_eq!(cfg.renderer.timeout_seconds, 900);
        assert_eq!(cfg.callbacks.base_url, None);
        assert!(cfg.cleanup.delete_downloaded_loras);
    }

    #[test]
    fn missing_required_key_errors() {
        let bad = r#"
        [objectstore]
        access_key = "key"
        secret_key = "secret"

        [paths]
        base_models = "/a"
        loras = "/b"
        workflows = "/c"
        outputs = "/d"
        temp = "/e"
        "#;
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn explicit_api_url_wins_over_host_port() {
        let toml_body = r#"
        [objectstore]
        endpoint = "e"
        access_key = "a"
        secret_key = "s"

        [renderer]
        api_url = "https://render.internal:9999/"
        host = "ignored"

        [paths]
        base_models = "/a"
        loras = "/b"
        workflows = "/c"
        outputs = "/d"
        temp = "/e"
        "#;
        let cfg = parse_toml(toml_body).unwrap();
        assert_eq!(cfg.renderer.api_url, "https://render.internal:9999");
    }

    #[test]
    fn normalize_url_rejects_blank() {
        assert!(normalize_url("   ", "http").is_err());
    }

    #[test]
    fn normalize_url_preserves_explicit_scheme() {
        assert_eq!(
            normalize_url("https://example.com/", "http").unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn validate_config_flags_large_timeout() {
        let mut cfg = parse_toml(sample_toml()).unwrap();
        cfg.renderer.timeout_seconds = 7200;
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeTimeout { field, .. } if *field == "renderer.timeout_seconds")));
    }

    #[test]
    fn validate_config_rejects_zero_timeout() {
        let mut cfg = parse_toml(sample_toml()).unwrap();
        cfg.renderer.timeout_seconds = 0;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn validate_config_warns_on_missing_callback_base_url() {
        let cfg = parse_toml(sample_toml()).unwrap();
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.contains(&ConfigWarning::NoCallbackBaseUrl));
    }

    #[test]
    fn load_config_missing_file_errors() {
        let err = load_config(Path::new("/nonexistent/agent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn ensure_directories_creates_all_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let cfg = AgentConfig {
            objectstore: ObjectStoreConfig {
                endpoint: "e".into(),
                access_key: "a".into(),
                secret_key: "s".into(),
                secure: false,
                region: None,
                verify_tls: true,
            },
            renderer: RendererConfig {
                api_url: "http://127.0.0.1:8188".into(),
                timeout_seconds: 900,
                poll_interval_seconds: 2.0,
                client_id: "c".into(),
                object_info_cache_seconds: 45.0,
                model_refresh_delay_seconds: 0.75,
                per_step_timeout_seconds: 6.0,
                img2img_timeout_multiplier: 1.5,
            },
            paths: PathConfig {
                base_models: root.join("models"),
                loras: root.join("loras"),
                workflows: root.join("workflows"),
                outputs: root.join("outputs"),
                temp: root.join("tmp"),
            },
            persistent_model_keys: vec![],
            cleanup: CleanupConfig::default(),
            callbacks: CallbackConfig::default(),
            workflow_defaults: BTreeMap::new(),
        };
        cfg.ensure_directories().unwrap();
        for dir in cfg.paths.all() {
            assert!(dir.is_dir());
        }
        assert!(root.join("outputs/logs").is_dir());
    }
}
