use std::collections::BTreeMap;
use std::{fs, path::PathBuf};

use serde_json::Value;

/// Proxy settings, loaded once at startup. The backend catalog is ordered:
/// index 0 is the primary, selection returns the first matching entry.
#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Per-request upstream timeout in seconds.
    pub request_timeout: u64,
    /// Failover retry cycle bound.
    pub max_retries: u32,
    pub max_tokens_limit: Option<MaxTokensLimit>,
    pub min_tokens_limit: Option<MinTokensLimit>,
    /// TLS termination is handled outside the core; the fields are
    /// accepted so one config file serves both deployments.
    pub https_enabled: bool,
    pub ssl_key_file: Option<String>,
    pub ssl_cert_file: Option<String>,
    pub ssl_ca_file: Option<String>,
    /// Client token table, name -> token. Empty table disables auth.
    pub tokens: BTreeMap<String, String>,
    /// Provider descriptors keyed by the provider token of `backend.model`.
    pub provider: BTreeMap<String, ProviderCfg>,
    /// Ordered backend catalog.
    pub backend: Vec<BackendCfg>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            request_timeout: 90,
            max_retries: 10,
            max_tokens_limit: None,
            min_tokens_limit: None,
            https_enabled: false,
            ssl_key_file: None,
            ssl_cert_file: None,
            ssl_ca_file: None,
            tokens: BTreeMap::new(),
            provider: BTreeMap::new(),
            backend: Vec::new(),
        }
    }
}

/// `max_tokens_limit` accepts the keywords "ignore"/"request" or a cap.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MaxTokensLimit {
    Cap(u64),
    Mode(String),
}

/// `min_tokens_limit` accepts "ignore" or a floor.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MinTokensLimit {
    Floor(u64),
    Mode(String),
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ProviderCfg {
    pub api_key: String,
    pub base_url: String,
    /// Presence selects the Azure-style deployment endpoint pattern.
    pub api_version: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct BackendCfg {
    /// `<provider>:<model-id>`; the model id may itself contain colons.
    pub model: String,
    /// Maximum input tokens the backend accepts.
    pub context: Option<u64>,
    pub vision: bool,
    pub thinking: bool,
    /// Glob patterns matched against the requested model id. Empty matches all.
    pub model_match: Vec<String>,
    /// Payload transforms applied before dispatch, delete -> add -> rename.
    pub key_add: serde_json::Map<String, Value>,
    pub key_delete: Vec<String>,
    pub key_rename: BTreeMap<String, String>,
    /// Accepted for config compatibility; quota windows are not enforced here.
    pub max_per_day: Option<u64>,
    pub max_per_hour: Option<u64>,
    pub max_per_5h: Option<u64>,
}

pub const DEFAULT_CONTEXT: u64 = 128_000;

impl BackendCfg {
    /// Everything before the first `:`.
    pub fn provider(&self) -> &str {
        self.model.split_once(':').map(|(p, _)| p).unwrap_or(&self.model)
    }

    /// Everything after the first `:`, further colons included.
    pub fn model_id(&self) -> &str {
        self.model.split_once(':').map(|(_, m)| m).unwrap_or("")
    }

    pub fn context(&self) -> u64 {
        self.context.unwrap_or(DEFAULT_CONTEXT)
    }

    pub fn has_transforms(&self) -> bool {
        !self.key_add.is_empty() || !self.key_delete.is_empty() || !self.key_rename.is_empty()
    }
}

fn default_path() -> PathBuf {
    let mut p = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llmux");
    p.push("config.toml");
    p
}

/// Load settings from `path`, or the platform config dir when absent.
pub fn load(path: Option<&str>) -> Result<Settings, String> {
    let p = path.map(PathBuf::from).unwrap_or_else(default_path);
    let raw = fs::read_to_string(&p)
        .map_err(|e| format!("failed to read config {:?}: {}", p, e))?;
    let settings: Settings =
        toml::from_str(&raw).map_err(|e| format!("failed to parse config {:?}: {}", p, e))?;
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    /// Catalog invariants checked once at startup; the catalog is
    /// read-only afterwards.
    pub fn validate(&self) -> Result<(), String> {
        for backend in &self.backend {
            if !backend.model.contains(':') {
                return Err(format!(
                    "backend model '{}' is missing the '<provider>:' prefix",
                    backend.model
                ));
            }
            if !self.provider.contains_key(backend.provider()) {
                return Err(format!(
                    "backend '{}' references unknown provider '{}'",
                    backend.model,
                    backend.provider()
                ));
            }
        }
        Ok(())
    }

    pub fn provider_for<'a>(&'a self, backend: &BackendCfg) -> Option<&'a ProviderCfg> {
        self.provider.get(backend.provider())
    }

    /// Stable digest of the loaded configuration, reported on `GET /`.
    pub fn digest(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let serialized = toml::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        serialized.hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }
}
