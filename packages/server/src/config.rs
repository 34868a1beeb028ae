use std::path::PathBuf;

use common::RetryPolicy;
use config::{Config, ConfigError, Environment, File};
use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    /// Empty means any origin.
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default = "default_cors_max_age")]
    pub max_age: u64,
}

fn default_cors_max_age() -> u64 {
    3600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: Vec::new(),
            max_age: default_cors_max_age(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `debug` or `release`; release mode uses compact log output without colours.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub cors: CorsConfig,
}

fn default_mode() -> String {
    "debug".into()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Upload root. Blobs live in `files/`, session spools in `chunks/`, archives in `exports/`.
    pub root: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_blocked_extensions")]
    pub blocked_extensions: Vec<String>,
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    [
        // images
        "jpg", "jpeg", "png", "gif", "bmp", "webp", "svg", "tiff", "tif", "ico", "heic",
        // video
        "mp4", "avi", "mov", "wmv", "flv", "mkv", "m4v", "3gp", "webm",
        // audio
        "mp3", "wav", "flac", "aac", "ogg", "wma", "m4a",
        // documents
        "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "rtf", "odt", "ods", "odp",
        // archives
        "zip", "rar", "7z", "tar", "gz", "wmz",
        // design
        "psd", "ai", "cdr", "indd", "idlk",
        // data
        "msg", "shs", "json", "xml", "csv", "bin", "dat",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_blocked_extensions() -> Vec<String> {
    [
        "exe", "bat", "cmd", "com", "scr", "msi", "dll", "php", "asp", "jsp", "js", "vbs", "ps1",
        "sh", "sys", "reg", "inf",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl StorageConfig {
    pub fn blob_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn chunk_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }

    pub fn export_dir(&self) -> PathBuf {
        self.root.join("exports")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Idle time after which an open session is aborted. Default: 24h.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Abort instead of reopening a session whose assembled digest does not match.
    #[serde(default)]
    pub abort_on_integrity_failure: bool,
}

fn default_session_ttl_secs() -> u64 {
    24 * 3600
}
fn default_sweep_interval_secs() -> u64 {
    600
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            abort_on_integrity_failure: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    /// Minimum age of the last reference change before a zero-ref blob is reclaimed.
    #[serde(default = "default_gc_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_gc_batch_size")]
    pub batch_size: u64,
}

fn default_gc_interval_secs() -> u64 {
    600
}
fn default_gc_grace_period_secs() -> u64 {
    3600
}
fn default_gc_batch_size() -> u64 {
    500
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval_secs(),
            grace_period_secs: default_gc_grace_period_secs(),
            batch_size: default_gc_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    /// Number of concurrent export workers. Default: 2.
    #[serde(default = "default_export_workers")]
    pub workers: usize,
    #[serde(default = "default_export_ttl_hours")]
    pub ttl_hours: i64,
    #[serde(default = "default_export_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_progress_every_files")]
    pub progress_every_files: u64,
    #[serde(default = "default_progress_every_bytes")]
    pub progress_every_bytes: u64,
    /// Category backing the `last-sabbath` quick export.
    #[serde(default)]
    pub sabbath_category_id: Option<i32>,
    #[serde(default = "default_recent_limit")]
    pub recent_limit: u64,
    #[serde(default = "default_export_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_export_workers() -> usize {
    2
}
fn default_export_ttl_hours() -> i64 {
    24
}
fn default_export_poll_interval_secs() -> u64 {
    5
}
fn default_progress_every_files() -> u64 {
    10
}
fn default_progress_every_bytes() -> u64 {
    8 * 1024 * 1024
}
fn default_recent_limit() -> u64 {
    100
}
fn default_export_sweep_interval_secs() -> u64 {
    900
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            workers: default_export_workers(),
            ttl_hours: default_export_ttl_hours(),
            poll_interval_secs: default_export_poll_interval_secs(),
            progress_every_files: default_progress_every_files(),
            progress_every_bytes: default_progress_every_bytes(),
            sabbath_category_id: None,
            recent_limit: default_recent_limit(),
            sweep_interval_secs: default_export_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DevConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Skip the gateway header and act as `auto_login_email` (or the root admin).
    #[serde(default)]
    pub bypass_auth: bool,
    #[serde(default)]
    pub auto_login_email: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Trust the `CF-Access-Authenticated-User-Email` header.
    #[serde(default = "default_gateway_enabled")]
    pub gateway_enabled: bool,
    #[serde(default = "random_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: i64,
    #[serde(default = "default_refresh_expiry_hours")]
    pub refresh_expiry_hours: i64,
    /// Static bearer tokens accepted for service-to-service callers.
    #[serde(default)]
    pub service_tokens: Vec<String>,
    #[serde(default)]
    pub dev: DevConfig,
}

fn default_gateway_enabled() -> bool {
    true
}
fn default_token_expiry_hours() -> i64 {
    24
}
fn default_refresh_expiry_hours() -> i64 {
    168
}

fn random_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            gateway_enabled: default_gateway_enabled(),
            jwt_secret: random_secret(),
            token_expiry_hours: default_token_expiry_hours(),
            refresh_expiry_hours: default_refresh_expiry_hours(),
            service_tokens: Vec::new(),
            dev: DevConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default)]
    pub root_email: Option<String>,
    #[serde(default = "default_root_name")]
    pub root_name: String,
}

fn default_root_name() -> String {
    "System Administrator".into()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            root_email: None,
            root_name: default_root_name(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NamespaceConfig {
    /// Root-level folder that receives restored entries whose parent is gone.
    #[serde(default = "default_recovery_folder")]
    pub recovery_folder: String,
}

fn default_recovery_folder() -> String {
    "Recovered Files".into()
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            recovery_folder: default_recovery_folder(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub namespace: NamespaceConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.url", "sqlite://./data/memoryark.db?mode=rwc")?
            .set_default("storage.root", "./uploads")?
            // Load from config/config.toml
            .add_source(File::with_name("config/config").required(false))
            // Override from environment (e.g., MEMORYARK__AUTH__JWT_SECRET)
            .add_source(
                Environment::with_prefix("MEMORYARK")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("auth.service_tokens")
                    .with_list_parse_key("storage.allowed_extensions")
                    .with_list_parse_key("storage.blocked_extensions")
                    .with_list_parse_key("server.cors.allow_origins")
                    .try_parsing(true),
            );

        let s = apply_legacy_env(builder)?.build()?;
        s.try_deserialize()
    }
}

/// Flat variables understood by earlier deployments of the archive.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("PORT", "server.port"),
    ("HOST", "server.host"),
    ("GIN_MODE", "server.mode"),
    ("UPLOAD_PATH", "storage.root"),
    ("MAX_FILE_SIZE", "storage.max_file_size"),
    ("ROOT_ADMIN_EMAIL", "admin.root_email"),
    ("ROOT_ADMIN_NAME", "admin.root_name"),
    ("CLOUDFLARE_ENABLED", "auth.gateway_enabled"),
    ("JWT_SECRET", "auth.jwt_secret"),
    ("TOKEN_EXPIRY", "auth.token_expiry_hours"),
    ("REFRESH_EXPIRY", "auth.refresh_expiry_hours"),
    ("DEV_MODE", "auth.dev.enabled"),
    ("DEV_BYPASS_AUTH", "auth.dev.bypass_auth"),
    ("DEV_AUTO_LOGIN_EMAIL", "auth.dev.auto_login_email"),
];

fn apply_legacy_env(
    mut builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    for (var, key) in LEGACY_ENV {
        builder = builder.set_override_option(*key, non_empty_env(var))?;
    }

    if let Some(path) = non_empty_env("DATABASE_PATH") {
        builder = builder.set_override("database.url", sqlite_url(&path))?;
    }

    if let Some(tokens) = non_empty_env("API_TOKENS") {
        let tokens: Vec<String> = tokens
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        builder = builder.set_override("auth.service_tokens", tokens)?;
    }

    Ok(builder)
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Turn a database file path into a SQLite connection URL that creates the file.
pub fn sqlite_url(path: &str) -> String {
    format!("sqlite://{path}?mode=rwc")
}
