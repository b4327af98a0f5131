// sitevault/src/config/mod.rs
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::schema::ConfigOverride;

pub const DEFAULT_ROWS_PER_DOCUMENT: usize = 20_000;
pub const DEFAULT_CHUNK_SIZE_MB: u64 = 8;
/// S3 rejects multipart parts smaller than this (except the last one).
pub const MIN_CHUNK_SIZE_MB: u64 = 5;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub chunk_size_mb: Option<u64>,
    pub max_backups: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonOperator {
    pub id: Option<String>,
    pub username: Option<String>,
    pub fullname: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub dataroot: Option<PathBuf>,
    pub filedir: Option<PathBuf>,
    pub temp_root: Option<PathBuf>,
    pub site_url: Option<String>,
    pub site_version: Option<String>,
    pub restores_allowed: Option<bool>,
    pub api_key: Option<String>,
    pub min_restore_version: Option<String>,
    #[serde(default)]
    pub preserve_columns: Vec<String>,
    pub rows_per_document: Option<usize>,
    #[serde(default)]
    pub config_overrides: Vec<ConfigOverride>,
    pub session_table: Option<String>,
    pub files_table: Option<String>,
    pub operator: Option<JsonOperator>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
    pub chunk_size_bytes: u64,
    pub max_backups: Option<usize>,
}

/// Identity of whoever triggers an operation; recorded in operation details and origin metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Operator {
    pub id: String,
    pub username: String,
    pub fullname: String,
    pub email: String,
}

/// Everything the pipelines need to know about the local site.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub dataroot: PathBuf,
    pub filedir: PathBuf,
    pub temp_root: PathBuf,
    pub site_url: String,
    pub site_version: Decimal,
    pub restores_allowed: bool,
    pub api_key: Option<String>,
    pub min_restore_version: Option<Decimal>,
    pub preserve_columns: Vec<String>,
    pub rows_per_document: usize,
    pub config_overrides: Vec<ConfigOverride>,
    pub session_table: String,
    pub files_table: String,
    pub operator: Operator,
}

impl VaultSettings {
    /// Settings with every optional value at its default, rooted at `dataroot`.
    pub fn for_dataroot(dataroot: &Path) -> Self {
        VaultSettings {
            dataroot: dataroot.to_path_buf(),
            filedir: dataroot.join("filedir"),
            temp_root: dataroot.join("temp").join("vault"),
            site_url: String::new(),
            site_version: Decimal::ZERO,
            restores_allowed: false,
            api_key: None,
            min_restore_version: None,
            preserve_columns: Vec::new(),
            rows_per_document: DEFAULT_ROWS_PER_DOCUMENT,
            config_overrides: Vec::new(),
            session_table: "sessions".to_string(),
            files_table: "files".to_string(),
            operator: Operator::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub settings: VaultSettings,
    pub storage: Option<StorageConfig>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw_json_config: RawJsonConfig) -> Result<Self> {
        let database_url = std::env::var("SITEVAULT_DATABASE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| raw_json_config.database_url.clone())
            .context("database_url must be set in config.json (or SITEVAULT_DATABASE_URL)")?;
        url::Url::parse(&database_url).context("database_url is not a valid URL")?;

        let dataroot = raw_json_config
            .dataroot
            .as_ref()
            .context("dataroot must be set in config.json")?
            .clone();
        if dataroot.to_string_lossy().is_empty() {
            return Err(anyhow::anyhow!("dataroot cannot be empty in config.json."));
        }

        let mut settings = VaultSettings::for_dataroot(&dataroot);
        if let Some(filedir) = &raw_json_config.filedir {
            settings.filedir = filedir.clone();
        }
        if let Some(temp_root) = &raw_json_config.temp_root {
            settings.temp_root = temp_root.clone();
        }
        settings.site_url = raw_json_config.site_url.clone().unwrap_or_default();
        settings.site_version = parse_version(
            raw_json_config
                .site_version
                .as_deref()
                .context("site_version must be set in config.json")?,
        )?;
        settings.min_restore_version = raw_json_config
            .min_restore_version
            .as_deref()
            .map(parse_version)
            .transpose()?;
        settings.restores_allowed = raw_json_config.restores_allowed.unwrap_or(false);
        settings.api_key = raw_json_config.api_key.clone().filter(|s| !s.is_empty());
        settings.preserve_columns = raw_json_config.preserve_columns.clone();
        settings.config_overrides = raw_json_config.config_overrides.clone();
        if let Some(rows) = raw_json_config.rows_per_document {
            if rows == 0 {
                return Err(anyhow::anyhow!("rows_per_document must be greater than zero."));
            }
            settings.rows_per_document = rows;
        }
        if let Some(table) = raw_json_config.session_table.clone().filter(|s| !s.is_empty()) {
            settings.session_table = table;
        }
        if let Some(table) = raw_json_config.files_table.clone().filter(|s| !s.is_empty()) {
            settings.files_table = table;
        }
        if let Some(op) = &raw_json_config.operator {
            settings.operator = Operator {
                id: op.id.clone().unwrap_or_default(),
                username: op.username.clone().unwrap_or_default(),
                fullname: op.fullname.clone().unwrap_or_default(),
                email: op.email.clone().unwrap_or_default(),
            };
        }

        let storage = parse_storage_config(raw_json_config.s3_storage.as_ref())?;

        Ok(AppConfig {
            database_url,
            settings,
            storage,
        })
    }
}

/// Site versions are decimal numbers such as `2022041900.00`.
pub fn parse_version(value: &str) -> Result<Decimal> {
    Decimal::from_str(value.trim()).with_context(|| format!("Invalid version number: {}", value))
}

fn parse_storage_config(s3_raw: Option<&JsonS3StorageConfig>) -> Result<Option<StorageConfig>> {
    let Some(s3_raw) = s3_raw else {
        return Ok(None);
    };
    if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        let chunk_mb = s3_raw.chunk_size_mb.unwrap_or(DEFAULT_CHUNK_SIZE_MB);
        if chunk_mb < MIN_CHUNK_SIZE_MB {
            return Err(anyhow::anyhow!(
                "s3_storage.chunk_size_mb must be at least {} (got {}).",
                MIN_CHUNK_SIZE_MB,
                chunk_mb
            ));
        }
        Ok(Some(StorageConfig {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
            folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
            chunk_size_bytes: chunk_mb * 1024 * 1024,
            max_backups: s3_raw.max_backups,
        }))
    } else {
        // Only warn if some S3 fields were provided but were incomplete/empty
        tracing::warn!(
            "s3_storage is present in config.json but some required fields (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are missing or empty. Remote operations will be disabled."
        );
        Ok(None)
    }
}
