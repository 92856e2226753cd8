use std::path::PathBuf;
use std::time::Duration;

use atelier_pipeline::reconcile::{ReconcileConfig, UploadPolicy};
use atelier_storage::S3Config;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "atelier_worker=debug,atelier_pipeline=debug,atelier_comfyui=info";

const DEFAULT_COMFYUI_API_URL: &str = "http://127.0.0.1:8188";
const DEFAULT_BLOB_DIR: &str = "./blobs";
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Where artifacts are stored.
#[derive(Debug, Clone)]
pub enum BlobBackend {
    Local { dir: PathBuf },
    S3(S3Config),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub comfyui_api_url: String,
    pub comfyui_ws_url: String,
    pub reconcile: ReconcileConfig,
    pub blob_backend: BlobBackend,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                   | Default                                |
    /// |---------------------------|----------------------------------------|
    /// | `DATABASE_URL`            | required                               |
    /// | `COMFYUI_API_URL`         | `http://127.0.0.1:8188`                |
    /// | `COMFYUI_WS_URL`          | API URL with `http` → `ws`             |
    /// | `RECONCILE_INTERVAL_SECS` | `5`                                    |
    /// | `UPLOAD_ATTEMPTS`         | `1`                                    |
    /// | `BLOB_BACKEND`            | `local` (`local` or `s3`)              |
    /// | `BLOB_DIR`                | `./blobs`                              |
    /// | `R2_BUCKET_NAME`          | required for `s3`                      |
    /// | `R2_ENDPOINT`             | required for `s3`                      |
    /// | `R2_ACCESS_KEY_ID`        | required for `s3`                      |
    /// | `R2_SECRET_ACCESS_KEY`    | required for `s3`                      |
    /// | `LOG_FORMAT`              | `text` (`text` or `json`)              |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let database_url = required("DATABASE_URL")?;

        let comfyui_api_url = var("COMFYUI_API_URL")
            .unwrap_or_else(|| DEFAULT_COMFYUI_API_URL.into())
            .trim_end_matches('/')
            .to_string();
        let comfyui_ws_url = match var("COMFYUI_WS_URL") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => ws_url_from_api(&comfyui_api_url)?,
        };

        let interval_secs: u64 = parse_or(
            "RECONCILE_INTERVAL_SECS",
            var("RECONCILE_INTERVAL_SECS"),
            DEFAULT_RECONCILE_INTERVAL_SECS,
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "RECONCILE_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let upload_attempts: u32 = parse_or("UPLOAD_ATTEMPTS", var("UPLOAD_ATTEMPTS"), 1)?;

        let blob_backend = match var("BLOB_BACKEND").as_deref().unwrap_or("local") {
            "local" => BlobBackend::Local {
                dir: var("BLOB_DIR")
                    .unwrap_or_else(|| DEFAULT_BLOB_DIR.into())
                    .into(),
            },
            "s3" | "r2" => BlobBackend::S3(S3Config {
                endpoint: required("R2_ENDPOINT")?,
                bucket: required("R2_BUCKET_NAME")?,
                access_key_id: required("R2_ACCESS_KEY_ID")?,
                secret_access_key: required("R2_SECRET_ACCESS_KEY")?,
                region: "auto".into(),
            }),
            other => {
                return Err(ConfigError::Invalid {
                    name: "BLOB_BACKEND",
                    value: other.into(),
                    reason: "expected `local` or `s3`".into(),
                })
            }
        };

        let log_format = match var("LOG_FORMAT").as_deref().unwrap_or("text") {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    value: other.into(),
                    reason: "expected `text` or `json`".into(),
                })
            }
        };

        Ok(Self {
            database_url,
            comfyui_api_url,
            comfyui_ws_url,
            reconcile: ReconcileConfig {
                interval: Duration::from_secs(interval_secs),
                upload_policy: UploadPolicy::from_attempts(upload_attempts),
            },
            blob_backend,
            log_format,
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

fn ws_url_from_api(api_url: &str) -> Result<String, ConfigError> {
    if let Some(rest) = api_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(ConfigError::Invalid {
            name: "COMFYUI_API_URL",
            value: api_url.into(),
            reason: "expected an http:// or https:// URL".into(),
        })
    }
}
