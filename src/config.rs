use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use crate::model::{Actor, Role};
use crate::recurrence::RecurrencePolicy;

/// Server settings, read from `RESERVAS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login names that act with the admin role.
    pub admins: HashSet<String>,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub recurrence: RecurrencePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "reservas".into(),
            admins: HashSet::from(["admin".to_string()]),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            recurrence: RecurrencePolicy::default(),
        }
    }
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let parse = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        fn number<T: FromStr>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
            match raw {
                Some(value) => value.trim().parse().map_err(|_| ConfigError { var, value }),
                None => Ok(default),
            }
        }

        let admins = match parse("RESERVAS_ADMINS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.admins,
        };
        let metrics_port = match parse("RESERVAS_METRICS_PORT") {
            Some(value) => Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError { var: "RESERVAS_METRICS_PORT", value })?,
            ),
            None => None,
        };
        let recurrence = RecurrencePolicy {
            default_repeat_count: number(
                "RESERVAS_DEFAULT_REPEAT_COUNT",
                parse("RESERVAS_DEFAULT_REPEAT_COUNT"),
                defaults.recurrence.default_repeat_count,
            )?,
            max_walk_days: number(
                "RESERVAS_MAX_WALK_DAYS",
                parse("RESERVAS_MAX_WALK_DAYS"),
                defaults.recurrence.max_walk_days,
            )?,
            max_occurrences: number(
                "RESERVAS_MAX_OCCURRENCES",
                parse("RESERVAS_MAX_OCCURRENCES"),
                defaults.recurrence.max_occurrences,
            )?,
        };
        if recurrence.default_repeat_count == 0 || recurrence.default_repeat_count > recurrence.max_occurrences {
            return Err(ConfigError {
                var: "RESERVAS_DEFAULT_REPEAT_COUNT",
                value: recurrence.default_repeat_count.to_string(),
            });
        }
        if recurrence.max_occurrences == 0 || recurrence.max_occurrences > crate::limits::MAX_SERIES_LEN {
            return Err(ConfigError {
                var: "RESERVAS_MAX_OCCURRENCES",
                value: recurrence.max_occurrences.to_string(),
            });
        }

        Ok(Self {
            bind: parse("RESERVAS_BIND").unwrap_or(defaults.bind),
            port: number("RESERVAS_PORT", parse("RESERVAS_PORT"), defaults.port)?,
            data_dir: parse("RESERVAS_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: parse("RESERVAS_PASSWORD").unwrap_or(defaults.password),
            admins,
            max_connections: number(
                "RESERVAS_MAX_CONNECTIONS",
                parse("RESERVAS_MAX_CONNECTIONS"),
                defaults.max_connections,
            )?,
            compact_threshold: number(
                "RESERVAS_COMPACT_THRESHOLD",
                parse("RESERVAS_COMPACT_THRESHOLD"),
                defaults.compact_threshold,
            )?,
            metrics_port,
            recurrence,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservas.wal")
    }

    /// The actor a login name acts as.
    pub fn actor_for(&self, user: &str) -> Actor {
        let role = if self.admins.contains(user) { Role::Admin } else { Role::User };
        Actor {
            user: user.to_string(),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(load(&[]).unwrap(), Config::default());
        let config = Config::default();
        assert_eq!(config.recurrence.default_repeat_count, 12);
        assert_eq!(config.recurrence.max_walk_days, 730);
        assert_eq!(config.wal_path(), PathBuf::from("./data/reservas.wal"));
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("RESERVAS_PORT", "6000"),
            ("RESERVAS_BIND", "127.0.0.1"),
            ("RESERVAS_DATA_DIR", "/var/lib/reservas"),
            ("RESERVAS_ADMINS", "root, coordinador ,"),
            ("RESERVAS_METRICS_PORT", "9100"),
            ("RESERVAS_DEFAULT_REPEAT_COUNT", "8"),
            ("RESERVAS_MAX_WALK_DAYS", "365"),
            ("RESERVAS_COMPACT_THRESHOLD", ""),
        ])
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/reservas"));
        assert_eq!(config.admins, HashSet::from(["root".to_string(), "coordinador".to_string()]));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.recurrence.default_repeat_count, 8);
        assert_eq!(config.recurrence.max_walk_days, 365);
        assert_eq!(config.compact_threshold, 1000);
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = load(&[("RESERVAS_PORT", "cinco")]).unwrap_err();
        assert_eq!(err.var, "RESERVAS_PORT");
        assert!(load(&[("RESERVAS_METRICS_PORT", "70000")]).is_err());
        assert!(load(&[("RESERVAS_DEFAULT_REPEAT_COUNT", "0")]).is_err());
        assert!(load(&[("RESERVAS_MAX_OCCURRENCES", "5000")]).is_err());
    }

    #[test]
    fn admins_get_admin_role() {
        let config = Config::default();
        assert!(config.actor_for("admin").is_admin());
        assert!(!config.actor_for("ana").is_admin());
        assert_eq!(config.actor_for("ana").user, "ana");
    }
}
