//! Configuration management for worldsave
//!
//! All settings come from environment variables with sensible defaults.
//! `Config::get` caches the parsed result process-wide.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the storage layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory under which every record kind gets its own subdirectory.
    pub storage_root: PathBuf,
    /// Debounce interval between the first save request for a key and its flush.
    pub save_delay_ms: u64,
    /// Pause between consecutive flushes of the same key.
    pub save_cooldown_ms: u64,
    /// Total rename attempts for the atomic write primitive (minimum 1).
    pub rename_attempts: u32,
    /// Fixed pause between rename attempts.
    pub rename_backoff_ms: u64,
    /// Whether transient rename failures are retried at all.
    pub rename_retry_enabled: bool,
}

pub const DEFAULT_SAVE_DELAY_MS: u64 = 50;
pub const DEFAULT_RENAME_ATTEMPTS: u32 = 3;
pub const DEFAULT_RENAME_BACKOFF_MS: u64 = 100;

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data"),
            save_delay_ms: DEFAULT_SAVE_DELAY_MS,
            save_cooldown_ms: DEFAULT_SAVE_DELAY_MS,
            rename_attempts: DEFAULT_RENAME_ATTEMPTS,
            rename_backoff_ms: DEFAULT_RENAME_BACKOFF_MS,
            // Only Windows releases replaced-file handles lazily enough to matter.
            rename_retry_enabled: cfg!(windows),
        }
    }
}

/// Module-level shared config cache (used by `Config::get` and `Config::reset_cached`).
static CONFIG_CACHE: std::sync::RwLock<Option<Config>> = std::sync::RwLock::new(None);

fn global_config_cache_get() -> Config {
    {
        let guard = CONFIG_CACHE
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(ref c) = *guard {
            return c.clone();
        }
    }
    let mut guard = CONFIG_CACHE
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    guard.get_or_insert_with(Config::from_env).clone()
}

fn global_config_cache_reset() {
    let mut guard = CONFIG_CACHE
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *guard = None;
}

impl Config {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_value("WORLDSAVE_STORAGE_ROOT") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                config.storage_root = PathBuf::from(trimmed);
            }
        }

        config.save_delay_ms = env_u64("WORLDSAVE_SAVE_DELAY_MS", config.save_delay_ms);
        // Cooldown tracks the delay unless set explicitly.
        config.save_cooldown_ms = env_u64("WORLDSAVE_SAVE_COOLDOWN_MS", config.save_delay_ms);

        config.rename_attempts =
            env_u32("WORLDSAVE_RENAME_ATTEMPTS", config.rename_attempts).max(1);
        config.rename_backoff_ms =
            env_u64("WORLDSAVE_RENAME_BACKOFF_MS", config.rename_backoff_ms);
        config.rename_retry_enabled =
            env_bool("WORLDSAVE_RENAME_RETRY", config.rename_retry_enabled);

        config
    }

    /// Cached process-wide configuration.
    ///
    /// On first call, parses environment variables via [`Config::from_env`].
    /// Tests and CLI commands that need a fresh or mutated config should call
    /// `Config::from_env()` directly.
    #[must_use]
    pub fn get() -> Self {
        global_config_cache_get()
    }

    /// Reset the global config cache, forcing the next [`Config::get`] call to
    /// re-parse environment variables.
    pub fn reset_cached() {
        global_config_cache_reset();
    }

    #[must_use]
    pub const fn save_delay(&self) -> Duration {
        Duration::from_millis(self.save_delay_ms)
    }

    #[must_use]
    pub const fn save_cooldown(&self) -> Duration {
        Duration::from_millis(self.save_cooldown_ms)
    }

    #[must_use]
    pub const fn rename_backoff(&self) -> Duration {
        Duration::from_millis(self.rename_backoff_ms)
    }
}

// Helper functions for environment variable parsing

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<std::collections::HashMap<String, String>> =
        std::cell::RefCell::new(std::collections::HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|cell| cell.borrow().get(key).cloned())
}

/// Read a value from the process environment.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    #[cfg(test)]
    if let Some(v) = test_env_override_value(key) {
        return Some(v);
    }
    env::var(key).ok()
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env_value(key).map_or(default, |v| parse_bool(&v, default))
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestEnvOverrideGuard {
        previous: Vec<(String, Option<String>)>,
    }

    impl TestEnvOverrideGuard {
        fn set(vars: &[(&str, &str)]) -> Self {
            let mut previous = Vec::new();
            TEST_ENV_OVERRIDES.with(|cell| {
                let mut map = cell.borrow_mut();
                for (key, value) in vars {
                    let old = map.get(*key).cloned();
                    previous.push(((*key).to_string(), old));
                    map.insert((*key).to_string(), (*value).to_string());
                }
            });
            Self { previous }
        }
    }

    impl Drop for TestEnvOverrideGuard {
        fn drop(&mut self) {
            TEST_ENV_OVERRIDES.with(|cell| {
                let mut map = cell.borrow_mut();
                for (key, value) in self.previous.drain(..) {
                    match value {
                        Some(v) => {
                            map.insert(key, v);
                        }
                        None => {
                            map.remove(&key);
                        }
                    }
                }
            });
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.save_delay(), Duration::from_millis(50));
        assert_eq!(config.save_cooldown(), config.save_delay());
        assert_eq!(config.rename_attempts, 3);
        assert_eq!(config.rename_backoff(), Duration::from_millis(100));
        assert_eq!(config.rename_retry_enabled, cfg!(windows));
    }

    #[test]
    fn test_cooldown_follows_delay_when_unset() {
        let _env = TestEnvOverrideGuard::set(&[("WORLDSAVE_SAVE_DELAY_MS", "250")]);
        let config = Config::from_env();
        assert_eq!(config.save_delay_ms, 250);
        assert_eq!(config.save_cooldown_ms, 250);
    }

    #[test]
    fn test_explicit_values_from_env() {
        let _env = TestEnvOverrideGuard::set(&[
            ("WORLDSAVE_STORAGE_ROOT", " /var/lib/world "),
            ("WORLDSAVE_SAVE_DELAY_MS", "20"),
            ("WORLDSAVE_SAVE_COOLDOWN_MS", "5"),
            ("WORLDSAVE_RENAME_ATTEMPTS", "0"),
            ("WORLDSAVE_RENAME_BACKOFF_MS", "7"),
            ("WORLDSAVE_RENAME_RETRY", "yes"),
        ]);
        let config = Config::from_env();
        assert_eq!(config.storage_root, PathBuf::from("/var/lib/world"));
        assert_eq!(config.save_delay_ms, 20);
        assert_eq!(config.save_cooldown_ms, 5);
        // Zero attempts would never write anything.
        assert_eq!(config.rename_attempts, 1);
        assert_eq!(config.rename_backoff_ms, 7);
        assert!(config.rename_retry_enabled);
    }

    #[test]
    fn test_garbage_values_fall_back_to_defaults() {
        let _env = TestEnvOverrideGuard::set(&[
            ("WORLDSAVE_SAVE_DELAY_MS", "soon"),
            ("WORLDSAVE_RENAME_RETRY", "maybe"),
        ]);
        let config = Config::from_env();
        assert_eq!(config.save_delay_ms, DEFAULT_SAVE_DELAY_MS);
        assert_eq!(config.rename_retry_enabled, cfg!(windows));
    }
}
