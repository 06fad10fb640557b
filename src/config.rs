use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Root directory holding the original image assets.
    pub image_dir: PathBuf,
    /// Root directory the thumbnail derivatives are written under.
    pub thumb_dir: PathBuf,
    pub db_path: PathBuf,
    /// Origins allowed to request thumbnails cross-origin (`Origin` header
    /// and `Referer` checks).
    pub allow_origins: Vec<String>,
    /// Origins excluded from the foreign-embed warning log.
    pub referrer_exclusion_origins: Vec<String>,
    pub quality_default: u8,
    /// `Cache-Control` value for derivative responses.
    pub cache_control: String,
    pub api_username: String,
    pub api_password: String,
    pub max_in_flight_requests: usize,
    /// How long a request waits on another request already generating the
    /// same cache entry before giving up and generating itself.
    pub singleflight_wait: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 8080);

        let image_dir = PathBuf::from(
            env::var("IMAGE_DIR").unwrap_or_else(|_| "/var/lib/thumbserve/images".to_string()),
        );
        let thumb_dir = PathBuf::from(
            env::var("THUMBIMAGE_DIR").unwrap_or_else(|_| "/var/cache/thumbserve".to_string()),
        );
        let db_path = PathBuf::from(
            env::var("DB_PATH").unwrap_or_else(|_| "/var/lib/thumbserve/queue.db".to_string()),
        );

        let allow_origins = parse_list_env("ALLOW_ORIGINS").unwrap_or_default();
        let referrer_exclusion_origins =
            parse_list_env("REFERRER_EXCLUSION_ORIGINS").unwrap_or_default();
        for origin in allow_origins.iter().chain(&referrer_exclusion_origins) {
            if origin.ends_with('/') || !origin.contains("://") {
                return Err(anyhow!(
                    "origin entries must be scheme://host[:port] without a trailing slash: {origin}"
                ));
            }
        }

        let quality_default = parse_u8("QUALITY_DEFAULT", 80);
        if !(1..=100).contains(&quality_default) {
            return Err(anyhow!("QUALITY_DEFAULT must be between 1 and 100"));
        }
        let cache_control = env::var("CACHE_CONTROL").unwrap_or_else(|_| "max-age=600".to_string());

        let api_username = env::var("API_USERNAME").unwrap_or_else(|_| "admin".to_string());
        let api_password =
            env::var("API_PASSWORD").context("API_PASSWORD is required for /api access")?;

        let max_in_flight_requests = parse_usize("MAX_IN_FLIGHT_REQUESTS", 512);
        let singleflight_wait =
            Duration::from_secs(parse_u64("SINGLEFLIGHT_WAIT_SECONDS", 30).max(1));

        Ok(Self {
            host,
            port,
            image_dir,
            thumb_dir,
            db_path,
            allow_origins,
            referrer_exclusion_origins,
            quality_default,
            cache_control,
            api_username,
            api_password,
            max_in_flight_requests,
            singleflight_wait,
        })
    }
}

fn parse_u8(key: &str, default: u8) -> u8 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_list_env(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).ok()
    } else {
        let list = raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>();
        if list.is_empty() { None } else { Some(list) }
    }
}
