use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use stockbook_inventory::AttributionSettings;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
    pub attribution: AttributionSettings,
    /// How often the worker sweeps the consumption backlog when no event arrives.
    pub sweep_interval: Duration,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let mut config = Self::worker_from_env()?;
        config.http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());
        Ok(config)
    }

    pub fn worker_from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;

        let defaults = AttributionSettings::default();
        let attribution = AttributionSettings {
            max_retries: setting("ATTRIBUTION_MAX_RETRIES", defaults.max_retries)?,
            backlog_limit: setting("ATTRIBUTION_BACKLOG_LIMIT", defaults.backlog_limit)?,
        };
        let sweep_secs: u64 = setting("ATTRIBUTION_SWEEP_SECS", 60)?;

        Ok(Self {
            database_url,
            redis_url,
            http_addr: String::new(),
            attribution,
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
        })
    }
}

fn setting<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_setting(name, std::env::var(name).ok(), default)
}

fn parse_setting<T>(name: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse()
            .with_context(|| format!("{name} must be a number, got '{value}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_settings_fall_back() {
        assert_eq!(parse_setting("X", None, 3u32).unwrap(), 3);
        assert_eq!(parse_setting("X", Some("  ".to_string()), 3u32).unwrap(), 3);
        assert_eq!(parse_setting("X", Some(" 7 ".to_string()), 3u32).unwrap(), 7);
    }

    #[test]
    fn malformed_settings_name_the_variable() {
        let err = parse_setting("ATTRIBUTION_MAX_RETRIES", Some("lots".to_string()), 3u32)
            .unwrap_err();
        assert!(format!("{err:#}").starts_with("ATTRIBUTION_MAX_RETRIES must be a number"));
    }
}
