// Copyright 2020 Joyent, Inc.

//! Flat, string-keyed configuration.
//!
//! Every component reads its settings from a `Config`.  Locator query
//! parameters are merged with an explicitly supplied map, with explicit values
//! taking precedence.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::iter::FromIterator;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RemotingError, Result};
use crate::locator::Locator;

/// Recognized configuration keys.
pub mod keys {
    pub const SERIALIZATION_TYPE: &str = "serializationType";
    pub const FORCE_REMOTE: &str = "forceRemote";
    pub const BY_VALUE: &str = "byValue";
    pub const TIMEOUT: &str = "timeout";
    pub const CONNECT_TIMEOUT: &str = "connectTimeout";
    pub const NUMBER_OF_RETRIES: &str = "numberOfRetries";

    pub const CLIENT_MAX_POOL_SIZE: &str = "clientMaxPoolSize";
    pub const POOL_EXHAUSTION_POLICY: &str = "poolExhaustionPolicy";
    pub const POOL_WAIT_TIMEOUT: &str = "poolWaitTimeout";
    pub const IDLE_TIMEOUT: &str = "idleTimeout";
    pub const MAX_CONNECTION_AGE: &str = "maxConnectionAge";
    pub const REAPER_PERIOD: &str = "reaperPeriod";

    pub const MAX_POOL_SIZE: &str = "maxPoolSize";
    pub const BACKLOG_SIZE: &str = "backlogSize";
    pub const SERVER_THREADS: &str = "serverThreads";
    pub const MAX_FRAME_SIZE: &str = "maxFrameSize";

    pub const LEASE_PERIOD: &str = "leasePeriod";
    pub const CLIENT_LEASE: &str = "clientLease";
    pub const PING_FREQUENCY: &str = "pingFrequency";

    pub const CALLBACK_MEMORY_THRESHOLD: &str = "callbackMemoryThreshold";
    pub const CALLBACK_RETAINED_CACHE: &str = "callbackRetainedCache";
    pub const CALLBACK_STORE_DIR: &str = "callbackStoreDir";
    pub const CALLBACK_BATCH_SIZE: &str = "callbackBatchSize";
    pub const CALLBACK_POLL_PERIOD: &str = "callbackPollPeriod";
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Builder-style insert.
    pub fn with<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Config {
        self.set(key, value);
        self
    }

    pub fn set<K: Into<String>, V: ToString>(&mut self, key: K, value: V) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.values.iter()
    }

    /// Locator parameters overlaid with `explicit`; explicit entries win.
    pub fn merged(locator: &Locator, explicit: &Config) -> Config {
        let mut values: BTreeMap<String, String> = locator
            .parameters()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in explicit.iter() {
            values.insert(k.clone(), v.clone());
        }
        Config { values }
    }

    /// The subset of entries named by `keys`, used to tell apart configurations
    /// that must not share resources.
    pub fn signature(&self, keys: &[&str]) -> BTreeMap<String, String> {
        keys.iter()
            .filter_map(|k| self.values.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(invalid(key, v)),
            },
        }
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.trim().parse::<T>().map_err(|_| invalid(key, v)),
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        self.get_parsed(key, default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        self.get_parsed(key, default)
    }

    /// Reads a millisecond count as a `Duration`.
    pub fn get_millis(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self
                .get_u64(key, 0)
                .map(Duration::from_millis),
        }
    }
}

fn invalid(key: &str, value: &str) -> RemotingError {
    RemotingError::InvalidConfiguration(format!("invalid value {:?} for {}", value, key))
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Config {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Config {
        let mut config = Config::new();
        for (k, v) in iter {
            config.set(k, v);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_values_override_locator_parameters() {
        let locator = Locator::parse("socket://localhost:4446/?timeout=3000&foo=bar").unwrap();
        let explicit = Config::new().with(keys::TIMEOUT, 7000);
        let merged = Config::merged(&locator, &explicit);
        assert_eq!(merged.get(keys::TIMEOUT), Some("7000"));
        assert_eq!(merged.get("foo"), Some("bar"));
    }

    #[test]
    fn typed_getters() {
        let config = Config::new()
            .with(keys::CLIENT_LEASE, "TRUE")
            .with(keys::TIMEOUT, "250")
            .with(keys::MAX_POOL_SIZE, "many");
        assert!(config.get_bool(keys::CLIENT_LEASE, false).unwrap());
        assert_eq!(
            config.get_millis(keys::TIMEOUT, Duration::from_secs(1)).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            config.get_millis(keys::CONNECT_TIMEOUT, Duration::from_secs(1)).unwrap(),
            Duration::from_secs(1)
        );
        match config.get_usize(keys::MAX_POOL_SIZE, 1) {
            Err(RemotingError::InvalidConfiguration(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn signature_only_names_present_keys() {
        let config = Config::new().with(keys::TIMEOUT, 3000).with("other", 1);
        let sig = config.signature(&[keys::TIMEOUT, keys::CONNECT_TIMEOUT]);
        assert_eq!(sig.len(), 1);
        assert_eq!(sig.get(keys::TIMEOUT).map(String::as_str), Some("3000"));
    }
}
