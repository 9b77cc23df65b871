#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};
use tracing::warn;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 10000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_STATIC_DIR: &str = "static";
pub const DEFAULT_YTDLP_PATH: &str = "yt-dlp";
pub const DEFAULT_MAX_BODY_BYTES: usize = 100 * 1024 * 1024;
const DOWNLOAD_SUBDIR: &str = "vidrelay-downloads";

/// Deployment flavour. Production refuses to start without an explicit secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" | "local" => Some(Self::Development),
            _ => None,
        }
    }
}

/// How `/download` delivers the file when the request does not pick a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// Save to the download directory first, then serve and delete.
    Buffered,
    /// Pipe the extractor's stdout straight into the response.
    Streamed,
}

impl DownloadMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "buffered" | "buffer" | "file" => Some(Self::Buffered),
            "streamed" | "stream" | "pipe" => Some(Self::Streamed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buffered => "buffered",
            Self::Streamed => "streamed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub secret_key: String,
    pub download_dir: PathBuf,
    pub static_dir: PathBuf,
    pub yt_dlp_path: PathBuf,
    pub download_mode: DownloadMode,
    pub geo_bypass: bool,
    pub expose_extractor_errors: bool,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub download_dir: Option<PathBuf>,
    pub static_dir: Option<PathBuf>,
    pub yt_dlp_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<Config> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    build_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<Config> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let environment = match lookup("APP_ENV") {
        Some(raw) => Environment::parse(&raw).ok_or_else(|| anyhow!("unknown APP_ENV: {raw}"))?,
        None => Environment::Development,
    };

    let secret_key = match lookup("SECRET_KEY") {
        Some(key) => key,
        None if environment == Environment::Production => {
            bail!("SECRET_KEY must be set when APP_ENV=production")
        }
        None => {
            warn!("SECRET_KEY not set; using a random key for this process");
            uuid::Uuid::new_v4().simple().to_string()
        }
    };

    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup("HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let download_dir = overrides
        .download_dir
        .or_else(|| lookup("DOWNLOAD_DIR").map(PathBuf::from))
        .unwrap_or_else(|| env::temp_dir().join(DOWNLOAD_SUBDIR));
    let static_dir = overrides
        .static_dir
        .or_else(|| lookup("STATIC_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR));
    let yt_dlp_path = overrides
        .yt_dlp_path
        .or_else(|| lookup("YTDLP_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PATH));
    let download_mode = match lookup("DOWNLOAD_MODE") {
        Some(raw) => {
            DownloadMode::parse(&raw).ok_or_else(|| anyhow!("unknown DOWNLOAD_MODE: {raw}"))?
        }
        None => DownloadMode::Buffered,
    };
    let geo_bypass = lookup("GEO_BYPASS")
        .and_then(|value| parse_bool(&value))
        .unwrap_or(true);
    let expose_extractor_errors = lookup("EXPOSE_EXTRACTOR_ERRORS")
        .and_then(|value| parse_bool(&value))
        .unwrap_or(false);
    let max_body_bytes = lookup("MAX_BODY_BYTES")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_BODY_BYTES);

    Ok(Config {
        host,
        port,
        environment,
        secret_key,
        download_dir,
        static_dir,
        yt_dlp_path,
        download_mode,
        geo_bypass,
        expose_extractor_errors,
        max_body_bytes,
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    })
}

/// Parses a dotenv-style file. A missing file is not an error.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
