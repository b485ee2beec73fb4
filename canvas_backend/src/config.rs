//! Process configuration, read from the environment.

use crate::{actor::ActorConfig, hub::HubConfig};
use std::{env, str::FromStr, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend {other:?}, expected redis or memory")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server_address: String,
    pub redis_url: String,
    pub store_backend: StoreBackend,
    pub canvas_key: String,
    pub actor: ActorConfig,
    pub hub: HubConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup. Missing keys fall back to
    /// defaults, present but unparseable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let actor_defaults = ActorConfig::default();
        let hub_defaults = HubConfig::default();

        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let actor = ActorConfig {
            upsert_timeout: millis(&lookup, "UPSERT_TIMEOUT_MS", actor_defaults.upsert_timeout)?,
            painter_read_timeout: secs(
                &lookup,
                "PAINTER_READ_TIMEOUT_SECS",
                actor_defaults.painter_read_timeout,
            )?,
            ping_interval: secs(&lookup, "PING_INTERVAL_SECS", actor_defaults.ping_interval)?,
            write_timeout: secs(&lookup, "WRITE_TIMEOUT_SECS", actor_defaults.write_timeout)?,
            viewer_queue_capacity: parsed(
                &lookup,
                "VIEWER_QUEUE_CAPACITY",
                actor_defaults.viewer_queue_capacity,
            )?,
            max_message_size: parsed(&lookup, "MAX_MESSAGE_SIZE", actor_defaults.max_message_size)?,
        };
        if actor.viewer_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "VIEWER_QUEUE_CAPACITY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if actor.ping_interval >= actor.painter_read_timeout {
            return Err(ConfigError::Invalid {
                key: "PING_INTERVAL_SECS",
                value: actor.ping_interval.as_secs().to_string(),
                reason: format!(
                    "must be shorter than PAINTER_READ_TIMEOUT_SECS ({})",
                    actor.painter_read_timeout.as_secs()
                ),
            });
        }

        let hub = HubConfig {
            snapshot_timeout: millis(&lookup, "SNAPSHOT_TIMEOUT_MS", hub_defaults.snapshot_timeout)?,
            ..hub_defaults
        };

        Ok(Config {
            server_address: text("SERVER_ADDRESS", "0.0.0.0:8080"),
            redis_url: text("REDIS_URL", "redis://127.0.0.1/"),
            store_backend: parsed(&lookup, "PIXEL_STORE", StoreBackend::Redis)?,
            canvas_key: text("CANVAS_KEY", "canvas:pixels"),
            actor,
            hub,
        })
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

// Every timer and deadline in the server needs a non-zero period.
fn non_zero(key: &'static str, duration: Duration) -> Result<Duration, ConfigError> {
    if duration.is_zero() {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(duration)
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let duration = parsed(lookup, key, default.as_secs()).map(Duration::from_secs)?;
    non_zero(key, duration)
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    let duration = parsed(lookup, key, default).map(Duration::from_millis)?;
    non_zero(key, duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server_address, "0.0.0.0:8080");
        assert_eq!(config.store_backend, StoreBackend::Redis);
        assert_eq!(config.canvas_key, "canvas:pixels");
        assert_eq!(config.actor.viewer_queue_capacity, 256);
        assert_eq!(config.actor.upsert_timeout, Duration::from_secs(5));
        assert_eq!(config.actor.ping_interval, Duration::from_secs(54));
        assert_eq!(config.actor.painter_read_timeout, Duration::from_secs(60));
        assert_eq!(config.actor.max_message_size, 512);
        assert_eq!(config.hub.snapshot_timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("PIXEL_STORE", "Memory"),
            ("VIEWER_QUEUE_CAPACITY", "8"),
            ("UPSERT_TIMEOUT_MS", "250"),
            ("SERVER_ADDRESS", "127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.actor.viewer_queue_capacity, 8);
        assert_eq!(config.actor.upsert_timeout, Duration::from_millis(250));
        assert_eq!(config.server_address, "127.0.0.1:9000");
    }

    #[test]
    fn bad_values_are_rejected() {
        for (key, value) in [
            ("VIEWER_QUEUE_CAPACITY", "lots"),
            ("VIEWER_QUEUE_CAPACITY", "0"),
            ("PIXEL_STORE", "mongo"),
            ("PING_INTERVAL_SECS", "-1"),
        ] {
            let err = config_from(&[(key, value)]).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
    }

    #[test]
    fn zero_durations_are_rejected() {
        for key in [
            "PING_INTERVAL_SECS",
            "PAINTER_READ_TIMEOUT_SECS",
            "WRITE_TIMEOUT_SECS",
            "UPSERT_TIMEOUT_MS",
            "SNAPSHOT_TIMEOUT_MS",
        ] {
            let err = config_from(&[(key, "0")]).unwrap_err();
            let message = err.to_string();
            assert!(message.contains(key), "{message}");
            assert!(message.contains("must be greater than zero"), "{message}");
        }
    }

    #[test]
    fn ping_interval_must_undercut_the_read_timeout() {
        for (ping, read) in [("60", "60"), ("90", "60")] {
            let err = config_from(&[
                ("PING_INTERVAL_SECS", ping),
                ("PAINTER_READ_TIMEOUT_SECS", read),
            ])
            .unwrap_err();
            assert!(err.to_string().contains("PING_INTERVAL_SECS"), "{err}");
        }

        let config = config_from(&[
            ("PING_INTERVAL_SECS", "5"),
            ("PAINTER_READ_TIMEOUT_SECS", "6"),
        ])
        .unwrap();
        assert_eq!(config.actor.ping_interval, Duration::from_secs(5));
    }
}
