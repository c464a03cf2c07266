// Copyright 2020 Joyent, Inc.

//! Client connection pooling.
//!
//! Pools are keyed by the remote endpoint plus the subset of configuration
//! that changes connection behaviour, so two invokers pointed at the same
//! address with different timeouts never share connections.  Each pool has
//! its own lock; the registry lock is only taken to find, create or drop a
//! pool.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slog::{debug, info, o, trace, Logger};

use crate::config::{keys, Config};
use crate::error::{RemotingError, Result};
use crate::locator::Locator;
use crate::scheduler::{Scheduler, TaskHandle};

/// Configuration entries that distinguish pools for the same endpoint.
pub const POOL_SIGNATURE_KEYS: &[&str] = &[
    keys::TIMEOUT,
    keys::CONNECT_TIMEOUT,
    keys::CLIENT_MAX_POOL_SIZE,
    keys::POOL_EXHAUSTION_POLICY,
    keys::POOL_WAIT_TIMEOUT,
    keys::IDLE_TIMEOUT,
    keys::MAX_CONNECTION_AGE,
    keys::SERIALIZATION_TYPE,
    keys::MAX_FRAME_SIZE,
];

/// A physical connection the pool can hold.
pub trait Poolable: Send + 'static {
    /// Cheap liveness check run before an idle connection is handed out.
    fn is_open(&mut self) -> bool {
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    endpoint: String,
    signature: BTreeMap<String, String>,
}

impl PoolKey {
    pub fn new(locator: &Locator, config: &Config) -> PoolKey {
        PoolKey {
            endpoint: locator.endpoint(),
            signature: config.signature(POOL_SIGNATURE_KEYS),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.endpoint)?;
        for (k, v) in &self.signature {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Wait up to `wait_timeout` for a connection to be returned.
    Block,
    /// Fail immediately with `PoolExhausted`.
    Fail,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_size: usize,
    pub exhaustion: ExhaustionPolicy,
    pub wait_timeout: Duration,
    /// Zero keeps idle connections indefinitely.
    pub idle_timeout: Duration,
    /// Zero disables age-based culling.
    pub max_age: Duration,
    /// Zero disables the background reaper.
    pub reaper_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_size: 50,
            exhaustion: ExhaustionPolicy::Block,
            wait_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_age: Duration::from_secs(0),
            reaper_period: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Result<PoolConfig> {
        let defaults = PoolConfig::default();
        let exhaustion = match config.get(keys::POOL_EXHAUSTION_POLICY) {
            None => defaults.exhaustion,
            Some(p) if p.eq_ignore_ascii_case("block") => ExhaustionPolicy::Block,
            Some(p) if p.eq_ignore_ascii_case("fail") => ExhaustionPolicy::Fail,
            Some(p) => {
                let msg = format!("invalid value {:?} for {}", p, keys::POOL_EXHAUSTION_POLICY);
                return Err(RemotingError::InvalidConfiguration(msg));
            }
        };
        let max_size = config.get_usize(keys::CLIENT_MAX_POOL_SIZE, defaults.max_size)?;
        if max_size == 0 {
            let msg = format!("{} must be at least 1", keys::CLIENT_MAX_POOL_SIZE);
            return Err(RemotingError::InvalidConfiguration(msg));
        }

        Ok(PoolConfig {
            max_size,
            exhaustion,
            wait_timeout: config.get_millis(keys::POOL_WAIT_TIMEOUT, defaults.wait_timeout)?,
            idle_timeout: config.get_millis(keys::IDLE_TIMEOUT, defaults.idle_timeout)?,
            max_age: config.get_millis(keys::MAX_CONNECTION_AGE, defaults.max_age)?,
            reaper_period: config.get_millis(keys::REAPER_PERIOD, defaults.reaper_period)?,
        })
    }
}

struct Entry<C> {
    conn: C,
    created: Instant,
    last_used: Instant,
}

/// A connection checked out of a pool, owned by the calling thread until it
/// is checked back in or discarded.
pub struct Pooled<C> {
    conn: C,
    created: Instant,
    generation: u64,
}

impl<C> Pooled<C> {
    pub fn conn(&mut self) -> &mut C {
        &mut self.conn
    }
}

struct PoolState<C> {
    idle: VecDeque<Entry<C>>,
    /// Idle plus checked out plus being created.
    live: usize,
    /// Bumped by `clear` so connections checked out before it are discarded
    /// on return.
    generation: u64,
}

pub struct ConnectionPool<C> {
    key: PoolKey,
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
    returned: Condvar,
    log: Logger,
}

impl<C: Poolable> ConnectionPool<C> {
    pub fn new(key: PoolKey, config: PoolConfig, log: &Logger) -> ConnectionPool<C> {
        let log = log.new(o!("pool" => key.to_string()));
        ConnectionPool {
            key,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                generation: 0,
            }),
            returned: Condvar::new(),
            log,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    fn is_stale(&self, created: Instant, last_used: Instant, now: Instant) -> bool {
        let zero = Duration::from_secs(0);
        (self.config.idle_timeout > zero && now.duration_since(last_used) >= self.config.idle_timeout)
            || (self.config.max_age > Duration::from_secs(0)
                && now.duration_since(created) >= self.config.max_age)
    }

    /// Hands out an idle connection, or creates one with `create` when the
    /// pool is under its bound.  When `fresh` is set, idle connections are
    /// closed rather than reused.
    pub fn checkout<F>(&self, fresh: bool, create: F) -> Result<Pooled<C>>
    where
        F: FnOnce() -> Result<C>,
    {
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut state = self.state.lock();
        loop {
            while let Some(mut entry) = state.idle.pop_back() {
                let now = Instant::now();
                if fresh || self.is_stale(entry.created, entry.last_used, now) || !entry.conn.is_open() {
                    state.live -= 1;
                    trace!(self.log, "closing idle connection");
                    continue;
                }
                return Ok(Pooled {
                    conn: entry.conn,
                    created: entry.created,
                    generation: state.generation,
                });
            }

            if state.live < self.config.max_size {
                state.live += 1;
                let generation = state.generation;
                drop(state);
                return match create() {
                    Ok(conn) => {
                        debug!(self.log, "created connection");
                        Ok(Pooled {
                            conn,
                            created: Instant::now(),
                            generation,
                        })
                    }
                    Err(e) => {
                        self.release_slot();
                        Err(e)
                    }
                };
            }

            if self.config.exhaustion == ExhaustionPolicy::Fail {
                return Err(RemotingError::PoolExhausted(self.key.to_string()));
            }
            if self.returned.wait_until(&mut state, deadline).timed_out() && state.idle.is_empty()
                && state.live >= self.config.max_size
            {
                return Err(RemotingError::PoolExhausted(self.key.to_string()));
            }
        }
    }

    /// Returns a connection for reuse, unless it aged out or the pool was
    /// cleared while it was checked out.
    pub fn checkin(&self, pooled: Pooled<C>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if pooled.generation != state.generation || self.is_stale(pooled.created, now, now) {
            state.live -= 1;
        } else {
            state.idle.push_back(Entry {
                conn: pooled.conn,
                created: pooled.created,
                last_used: now,
            });
        }
        drop(state);
        self.returned.notify_one();
    }

    /// Drops a connection that failed or timed out.
    pub fn discard(&self, pooled: Pooled<C>) {
        drop(pooled);
        self.release_slot();
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.live -= 1;
        drop(state);
        self.returned.notify_one();
    }

    /// Closes every idle connection; connections currently checked out are
    /// discarded when they come back.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let closed = state.idle.len();
        state.live -= closed;
        state.idle.clear();
        state.generation += 1;
        drop(state);
        self.returned.notify_all();
        debug!(self.log, "cleared pool"; "closed" => closed);
    }

    /// Closes idle connections past their idle TTL or maximum age.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.idle.len();
        let mut kept = VecDeque::with_capacity(before);
        while let Some(entry) = state.idle.pop_front() {
            if !self.is_stale(entry.created, entry.last_used, now) {
                kept.push_back(entry);
            }
        }
        let evicted = before - kept.len();
        state.idle = kept;
        state.live -= evicted;
        drop(state);
        if evicted > 0 {
            self.returned.notify_all();
            debug!(self.log, "evicted idle connections"; "count" => evicted);
        }
        evicted
    }
}

struct PoolSlot<C> {
    pool: Arc<ConnectionPool<C>>,
    users: usize,
    reaper: Option<TaskHandle>,
}

/// All pools of one connection type, shared by the invokers that use them.
pub struct PoolRegistry<C> {
    pools: Mutex<HashMap<PoolKey, PoolSlot<C>>>,
    log: Logger,
}

impl<C: Poolable> PoolRegistry<C> {
    pub fn new(log: &Logger) -> PoolRegistry<C> {
        PoolRegistry {
            pools: Mutex::new(HashMap::new()),
            log: log.new(o!("component" => "pool-registry")),
        }
    }

    /// Joins (or creates) the pool for `key`.  Every call must be paired with
    /// a `release` of the same key.
    pub fn acquire(
        &self,
        key: PoolKey,
        config: PoolConfig,
        scheduler: Option<&Scheduler>,
    ) -> Arc<ConnectionPool<C>> {
        let mut pools = self.pools.lock();
        if let Some(slot) = pools.get_mut(&key) {
            slot.users += 1;
            return Arc::clone(&slot.pool);
        }

        let reaper_period = config.reaper_period;
        let pool = Arc::new(ConnectionPool::new(key.clone(), config, &self.log));
        let reaper = scheduler.filter(|_| reaper_period > Duration::from_secs(0)).map(|s| {
            let weak: Weak<ConnectionPool<C>> = Arc::downgrade(&pool);
            s.schedule("pool-reaper", reaper_period, move || {
                if let Some(pool) = weak.upgrade() {
                    pool.evict_expired();
                }
            })
        });
        info!(self.log, "created connection pool"; "key" => %key);
        pools.insert(
            key,
            PoolSlot {
                pool: Arc::clone(&pool),
                users: 1,
                reaper,
            },
        );
        pool
    }

    /// Leaves the pool for `key`; the last user closes it.
    pub fn release(&self, key: &PoolKey) {
        let mut pools = self.pools.lock();
        let last = match pools.get_mut(key) {
            Some(slot) => {
                slot.users -= 1;
                slot.users == 0
            }
            None => false,
        };
        if last {
            if let Some(slot) = pools.remove(key) {
                if let Some(reaper) = slot.reaper {
                    reaper.cancel();
                }
                slot.pool.clear();
                info!(self.log, "removed connection pool"; "key" => %key);
            }
        }
    }

    pub fn pool(&self, key: &PoolKey) -> Option<Arc<ConnectionPool<C>>> {
        self.pools.lock().get(key).map(|s| Arc::clone(&s.pool))
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn keys(&self) -> Vec<PoolKey> {
        self.pools.lock().keys().cloned().collect()
    }
}
