use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::object_store::{MultipartSettings, MAX_PARTS, MIN_PART_SIZE};
use crate::telegram::DEFAULT_API_URL;
use crate::transfer::RelaySettings;

/// Presigned URLs cannot outlive a week.
const MAX_URL_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    MissingVar(String),
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// A credential that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub telegram: TelegramConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: Secret,
    /// Point this at a self-hosted Bot API server to lift the 20 MB download cap.
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Local,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub access_key: Secret,
    pub secret_key: Secret,
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Required when backend is s3
    pub s3: Option<S3Config>,
    /// Directory for local storage backend
    pub local_storage_path: String,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub download_dir: PathBuf,
    pub max_file_size: u64,
    pub url_expiry: Duration,
    pub multipart: MultipartSettings,
    pub progress_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            max_file_size: 4 * 1024 * 1024 * 1024,
            url_expiry: Duration::from_secs(24 * 60 * 60),
            multipart: MultipartSettings::default(),
            progress_interval: crate::progress::DEFAULT_INTERVAL,
        }
    }
}

/// Environment access, swappable for tests.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// First set variable among `names`.
    fn any(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| self.get(name))
    }

    fn required(&self, names: &[&str]) -> Result<String, ConfigError> {
        self.any(names)
            .ok_or_else(|| ConfigError::MissingVar(names.join(" or ")))
    }

    fn parsed<T: FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("{name} has an invalid value: {raw}"))
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let bind_address = env
            .get("BIND_ADDRESS")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let telegram = TelegramConfig {
            bot_token: Secret::new(env.required(&["BOT_TOKEN"])?),
            api_url: env
                .get("TELEGRAM_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        };

        let backend = match env
            .get("STORAGE_BACKEND")
            .unwrap_or_else(|| "s3".to_string())
            .to_lowercase()
            .as_str()
        {
            "s3" | "wasabi" => StorageBackend::S3,
            "local" => StorageBackend::Local,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "STORAGE_BACKEND must be s3 or local, got {other}"
                )))
            }
        };

        let s3 = if backend == StorageBackend::S3 {
            let region = env
                .any(&["S3_REGION", "WASABI_REGION"])
                .unwrap_or_else(|| "us-east-1".to_string());
            let endpoint = env
                .any(&["S3_ENDPOINT", "WASABI_ENDPOINT"])
                .unwrap_or_else(|| format!("https://s3.{region}.wasabisys.com"));
            Some(S3Config {
                access_key: Secret::new(env.required(&["S3_ACCESS_KEY", "WASABI_ACCESS_KEY"])?),
                secret_key: Secret::new(env.required(&["S3_SECRET_KEY", "WASABI_SECRET_KEY"])?),
                bucket: env.required(&["S3_BUCKET", "WASABI_BUCKET"])?,
                region,
                endpoint,
                force_path_style: env.flag("S3_FORCE_PATH_STYLE"),
            })
        } else {
            None
        };

        let storage = StorageConfig {
            backend,
            s3,
            local_storage_path: env
                .get("LOCAL_STORAGE_PATH")
                .unwrap_or_else(|| "./files".to_string()),
        };

        let defaults = TransferConfig::default();
        let progress_secs: f64 = env.parsed(
            "PROGRESS_UPDATE_INTERVAL",
            defaults.progress_interval.as_secs_f64(),
        )?;
        let progress_interval = Duration::try_from_secs_f64(progress_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                ConfigError::ValidationError(
                    "PROGRESS_UPDATE_INTERVAL must be a positive number of seconds".to_string(),
                )
            })?;

        let transfer = TransferConfig {
            download_dir: env
                .get("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            max_file_size: env.parsed("MAX_FILE_SIZE", defaults.max_file_size)?,
            url_expiry: Duration::from_secs(
                env.parsed("URL_EXPIRY", defaults.url_expiry.as_secs())?,
            ),
            multipart: MultipartSettings {
                threshold: env.parsed("MULTIPART_THRESHOLD", defaults.multipart.threshold)?,
                part_size: env.parsed("MULTIPART_CHUNKSIZE", defaults.multipart.part_size)?,
                max_concurrency: env
                    .parsed("MAX_CONCURRENCY", defaults.multipart.max_concurrency)?,
            },
            progress_interval,
        };

        let config = Config {
            bind_address,
            telegram,
            storage,
            transfer,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let transfer = &self.transfer;

        if transfer.max_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_FILE_SIZE must be greater than zero".to_string(),
            ));
        }

        if transfer.multipart.part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "MULTIPART_CHUNKSIZE must be at least {MIN_PART_SIZE} bytes"
            )));
        }

        if transfer.multipart.part_count(transfer.max_file_size) > MAX_PARTS {
            return Err(ConfigError::ValidationError(format!(
                "MAX_FILE_SIZE needs more than {MAX_PARTS} parts of MULTIPART_CHUNKSIZE bytes"
            )));
        }

        if transfer.multipart.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let expiry = transfer.url_expiry.as_secs();
        if expiry == 0 || expiry > MAX_URL_EXPIRY_SECS {
            return Err(ConfigError::ValidationError(format!(
                "URL_EXPIRY must be between 1 and {MAX_URL_EXPIRY_SECS} seconds"
            )));
        }

        Ok(())
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            staging_dir: self.transfer.download_dir.clone(),
            max_file_size: self.transfer.max_file_size,
            link_ttl: self.transfer.url_expiry,
            multipart: self.transfer.multipart.clone(),
        }
    }
}
