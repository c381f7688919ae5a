use docstash_core::{
    DEFAULT_ALLOWED_TYPES, DEFAULT_LEDGER_FILE, DEFAULT_MAX_UPLOAD_BYTES, Result, StashError,
    UploadPolicy, validate_storage_name,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

/// Where blobs and the ledger live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Ledger file name, resolved inside `root`.
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,
    /// Path prefix used when building catalog URLs.
    #[serde(default = "default_public_prefix")]
    pub public_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            ledger_file: default_ledger_file(),
            public_prefix: default_public_prefix(),
        }
    }
}

impl StorageConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(&self.ledger_file)
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_ledger_file() -> String {
    DEFAULT_LEDGER_FILE.to_string()
}

fn default_public_prefix() -> String {
    "/api/files".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            allowed_types: default_allowed_types(),
        }
    }
}

impl UploadConfig {
    pub fn policy(&self) -> UploadPolicy {
        UploadPolicy::new(self.allowed_types.clone(), self.max_bytes)
    }
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}

fn default_allowed_types() -> Vec<String> {
    DEFAULT_ALLOWED_TYPES.iter().map(|t| t.to_string()).collect()
}

impl Config {
    /// Load from `path` if it exists, then overlay `DOCSTASH__SECTION__KEY`
    /// environment variables.
    pub fn from_file(path: &str) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if Path::new(path).exists() {
            builder = builder.add_source(::config::File::with_name(path));
        } else {
            tracing::warn!("Config file {} not found, using defaults", path);
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("DOCSTASH")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| StashError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| StashError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.bind_addr.parse::<SocketAddr>().map_err(|e| {
            StashError::Config(format!(
                "invalid server.bind_addr '{}': {}",
                self.server.bind_addr, e
            ))
        })?;

        if self.storage.root.as_os_str().is_empty() {
            return Err(StashError::Config("storage.root cannot be empty".to_string()));
        }

        validate_storage_name(&self.storage.ledger_file).map_err(|e| {
            StashError::Config(format!("storage.ledger_file is not a plain file name: {}", e))
        })?;

        if !self.storage.public_prefix.starts_with('/') {
            return Err(StashError::Config(format!(
                "storage.public_prefix must start with '/', got '{}'",
                self.storage.public_prefix
            )));
        }

        if self.upload.max_bytes == 0 {
            return Err(StashError::Config(
                "upload.max_bytes must be greater than zero".to_string(),
            ));
        }

        if self.upload.allowed_types.is_empty() {
            return Err(StashError::Config(
                "upload.allowed_types cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
