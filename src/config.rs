use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::ImportError;

pub const DEFAULT_CONFIG_FILE: &str = "ibge-import.json";
pub const DEFAULT_API_BASE_URL: &str = "https://servicodados.ibge.gov.br/api/v1/localidades";
pub const DEFAULT_ARCHIVE_URL: &str =
    "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj/2025-05/Empresas0.zip";
pub const DEFAULT_ARCHIVE_PATH: &str = "empresas_data.zip";
pub const DEFAULT_DATABASE_PATH: &str = "ibge.sqlite3";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 320_000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GEOGRAPHY_BATCH_SIZE: usize = 500;
pub const DEFAULT_COMPANY_BATCH_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub archive_url: Option<String>,
    #[serde(default)]
    pub archive_path: Option<String>,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub geography_batch_size: Option<usize>,
    #[serde(default)]
    pub company_batch_size: Option<usize>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub api_base_url: String,
    pub archive_url: String,
    pub archive_path: Utf8PathBuf,
    pub database_path: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub cache_ttl: Duration,
    pub timeout: Duration,
    pub geography_batch_size: usize,
    pub company_batch_size: usize,
    pub chunk_size: usize,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `ibge-import.json` when present, or falls back to defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ImportError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ImportError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ImportError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ImportError> {
        let api_base_url = config
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if api_base_url.is_empty() {
            return Err(ImportError::Config("api_base_url is empty".to_string()));
        }

        let cache_dir = match config.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_dir()?,
        };

        Ok(ResolvedConfig {
            api_base_url,
            archive_url: config
                .archive_url
                .unwrap_or_else(|| DEFAULT_ARCHIVE_URL.to_string()),
            archive_path: Utf8PathBuf::from(
                config
                    .archive_path
                    .unwrap_or_else(|| DEFAULT_ARCHIVE_PATH.to_string()),
            ),
            database_path: Utf8PathBuf::from(
                config
                    .database_path
                    .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            ),
            cache_dir,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS)),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            geography_batch_size: positive(
                "geography_batch_size",
                config.geography_batch_size,
                DEFAULT_GEOGRAPHY_BATCH_SIZE,
            )?,
            company_batch_size: positive(
                "company_batch_size",
                config.company_batch_size,
                DEFAULT_COMPANY_BATCH_SIZE,
            )?,
            chunk_size: positive("chunk_size", config.chunk_size, DEFAULT_CHUNK_SIZE)?,
        })
    }
}

fn positive(field: &str, value: Option<usize>, default: usize) -> Result<usize, ImportError> {
    match value {
        Some(0) => Err(ImportError::Config(format!("{field} must be greater than zero"))),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

fn default_cache_dir() -> Result<Utf8PathBuf, ImportError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("ibge-importer").join("api"))
                .ok()
        })
        .ok_or_else(|| ImportError::Filesystem("unable to resolve cache directory".to_string()))
}
