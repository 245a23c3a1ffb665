use crate::catalog::CatalogSettings;
use crate::channels::{ChannelDirectory, ChannelError};
use crate::requests::RequestSettings;
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error(transparent)]
    Channels(#[from] ChannelError),
}

/// Настройки из окружения (.env подхватывается в main).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub channels: ChannelDirectory,
    pub admin_ids: Vec<i64>,
    pub buffer_threshold: usize,
    pub cache_ttl: Duration,
    /// None — периодический flush выключен
    pub flush_interval: Option<Duration>,
    pub daily_limit: u32,
    pub lock_timeout: Duration,
    /// None — выданные посты не удаляются
    pub auto_delete: Option<Duration>,
    pub search_session_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(get);
        let public = env.ids("PUBLIC_CHANNELS")?;
        let private = env.ids("PRIVATE_CHANNELS")?;
        Ok(Self {
            data_dir: env.raw("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| "data".into()),
            channels: ChannelDirectory::new(&public, &private)?,
            admin_ids: env.ids("ADMIN_IDS")?,
            buffer_threshold: env.number("CATALOG_BUFFER_SIZE", 50usize)?.max(1),
            cache_ttl: Duration::from_secs(env.number("CATALOG_CACHE_SECS", 300)?),
            flush_interval: env.seconds_or_off("FLUSH_INTERVAL_SECS", 60)?,
            daily_limit: env.number("DAILY_REQUEST_LIMIT", 3)?,
            lock_timeout: Duration::from_millis(env.number("LOCK_TIMEOUT_MS", 5000)?),
            auto_delete: env.seconds_or_off("AUTO_DELETE_SECS", 600)?,
            search_session_ttl: Duration::from_secs(env.number("SEARCH_SESSION_SECS", 900)?),
        })
    }

    pub fn catalog_settings(&self) -> CatalogSettings {
        CatalogSettings {
            buffer_threshold: self.buffer_threshold,
            cache_ttl: self.cache_ttl,
            lock_timeout: self.lock_timeout,
            ..CatalogSettings::in_dir(&self.data_dir)
        }
    }

    pub fn request_settings(&self) -> RequestSettings {
        RequestSettings {
            daily_limit: self.daily_limit,
            lock_timeout: self.lock_timeout,
            ..RequestSettings::in_dir(&self.data_dir)
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn number<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn seconds_or_off(&self, key: &'static str, default: u64) -> Result<Option<Duration>, ConfigError> {
        let secs = self.number(key, default)?;
        Ok((secs > 0).then(|| Duration::from_secs(secs)))
    }

    // "-1001, -1002" → [-1001, -1002]
    fn ids(&self, key: &'static str) -> Result<Vec<i64>, ConfigError> {
        let Some(value) = self.raw(key) else { return Ok(Vec::new()) };
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(|_| ConfigError::Invalid { key, value: value.clone() }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("PUBLIC_CHANNELS", "-1001")]).unwrap();
        assert_eq!(cfg.buffer_threshold, 50);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.daily_limit, 3);
        assert_eq!(cfg.flush_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.data_dir, PathBuf::from("data"));
        assert!(cfg.admin_ids.is_empty());
        assert_eq!(cfg.catalog_settings().ledger_path, PathBuf::from("data/catalog.csv"));
    }

    #[test]
    fn parses_lists_and_switches() {
        let cfg = config(&[
            ("PUBLIC_CHANNELS", "-1001, -1002"),
            ("PRIVATE_CHANNELS", "-2001"),
            ("ADMIN_IDS", "5,6"),
            ("AUTO_DELETE_SECS", "0"),
            ("DAILY_REQUEST_LIMIT", "5"),
        ])
        .unwrap();
        assert_eq!(cfg.channels.len(), 3);
        assert!(cfg.is_admin(6));
        assert!(!cfg.is_admin(7));
        assert_eq!(cfg.auto_delete, None);
        assert_eq!(cfg.request_settings().daily_limit, 5);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[("PUBLIC_CHANNELS", "-1001,abc")]),
            Err(ConfigError::Invalid { key: "PUBLIC_CHANNELS", .. })
        ));
        assert!(matches!(
            config(&[("PUBLIC_CHANNELS", "-1"), ("CATALOG_CACHE_SECS", "soon")]),
            Err(ConfigError::Invalid { key: "CATALOG_CACHE_SECS", .. })
        ));
        assert!(matches!(config(&[]), Err(ConfigError::Channels(ChannelError::Empty))));
    }
}
