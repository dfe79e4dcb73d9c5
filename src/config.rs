use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Directory holding the redb metadata database
    pub data_dir: String,
    pub limits: LimitsConfig,
    pub features: FeatureConfig,
    pub storage: StorageConfig,
    /// Period of the expired-upload sweeper in seconds. 0 disables it.
    pub cleaning_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Maximum size of a single file in bytes
    pub max_file_size: u64,
    pub max_file_per_upload: usize,
    /// TTL applied when a client asks for 0, in seconds
    pub default_ttl: i64,
    /// 0 means no ceiling, -1 additionally permits infinite uploads
    pub max_ttl: i64,
    /// Age after which a file stuck in `uploading` may be uploaded again
    pub uploading_timeout_secs: i64,
}

/// Upload options a client may request. Disabled options are rejected at creation.
#[derive(Debug, Clone)]
pub struct FeatureConfig {
    pub one_shot: bool,
    pub removable: bool,
    pub stream_mode: bool,
    pub protected_by_password: bool,
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Gcs,
    Local,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for local storage backend
    pub local_storage_path: String,
    /// GCS bucket name (required when backend is gcs)
    pub gcs_bucket: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to ADC)
    pub gcs_credentials_file: Option<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * GIB,
            max_file_per_upload: 1000,
            default_ttl: 30 * 24 * 3600,
            max_ttl: 0,
            uploading_timeout_secs: 3600,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            one_shot: true,
            removable: true,
            stream_mode: true,
            protected_by_password: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_storage_path: "./files".to_string(),
            gcs_bucket: None,
            gcs_credentials_file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            data_dir: "./data".to_string(),
            limits: LimitsConfig::default(),
            features: FeatureConfig::default(),
            storage: StorageConfig::default(),
            cleaning_interval_secs: 600,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let bind_address = std::env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address);
        let data_dir = std::env::var("DATA_DIR").unwrap_or(defaults.data_dir);

        let limits = LimitsConfig {
            max_file_size: env_parse("MAX_FILE_SIZE", defaults.limits.max_file_size),
            max_file_per_upload: env_parse(
                "MAX_FILE_PER_UPLOAD",
                defaults.limits.max_file_per_upload,
            ),
            default_ttl: env_parse("DEFAULT_TTL", defaults.limits.default_ttl),
            max_ttl: env_parse("MAX_TTL", defaults.limits.max_ttl),
            uploading_timeout_secs: env_parse(
                "UPLOADING_TIMEOUT",
                defaults.limits.uploading_timeout_secs,
            ),
        };

        let features = FeatureConfig {
            one_shot: env_flag("ONE_SHOT", defaults.features.one_shot),
            removable: env_flag("REMOVABLE", defaults.features.removable),
            stream_mode: env_flag("STREAM_MODE", defaults.features.stream_mode),
            protected_by_password: env_flag(
                "PROTECTED_BY_PASSWORD",
                defaults.features.protected_by_password,
            ),
        };

        let storage_backend = match std::env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "gcs" => StorageBackend::Gcs,
            _ => StorageBackend::Local,
        };

        let local_storage_path = std::env::var("LOCAL_STORAGE_PATH")
            .unwrap_or(defaults.storage.local_storage_path);

        let config = Config {
            bind_address,
            data_dir,
            limits,
            features,
            storage: StorageConfig {
                backend: storage_backend,
                local_storage_path,
                gcs_bucket: std::env::var("GCS_BUCKET").ok(),
                gcs_credentials_file: std::env::var("GCS_CREDENTIALS_FILE").ok(),
            },
            cleaning_interval_secs: env_parse("CLEANING_INTERVAL", defaults.cleaning_interval_secs),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_FILE_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.limits.max_file_per_upload == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_FILE_PER_UPLOAD must be greater than 0".to_string(),
            ));
        }

        match self.limits.default_ttl {
            -1 if self.limits.max_ttl != -1 => {
                return Err(ConfigError::ValidationError(
                    "DEFAULT_TTL=-1 requires MAX_TTL=-1".to_string(),
                ));
            }
            -1 => {}
            ttl if ttl <= 0 => {
                return Err(ConfigError::ValidationError(
                    "DEFAULT_TTL must be positive or -1".to_string(),
                ));
            }
            ttl if self.limits.max_ttl > 0 && ttl > self.limits.max_ttl => {
                return Err(ConfigError::ValidationError(format!(
                    "DEFAULT_TTL ({ttl}) exceeds MAX_TTL ({})",
                    self.limits.max_ttl
                )));
            }
            _ => {}
        }

        if self.limits.max_ttl < -1 {
            return Err(ConfigError::ValidationError(
                "MAX_TTL must be -1, 0 or positive".to_string(),
            ));
        }

        if matches!(self.storage.backend, StorageBackend::Gcs) && self.storage.gcs_bucket.is_none()
        {
            return Err(ConfigError::ValidationError(
                "GCS_BUCKET is required when STORAGE_BACKEND=gcs".to_string(),
            ));
        }

        if self.limits.uploading_timeout_secs <= 0 {
            tracing::warn!(
                "UPLOADING_TIMEOUT is not positive: interrupted uploads can be \
                 restarted immediately, even while still in progress"
            );
        }

        Ok(())
    }

    /// Whether uploads may live forever.
    pub fn allows_infinite_ttl(&self) -> bool {
        self.limits.max_ttl == -1
    }
}
