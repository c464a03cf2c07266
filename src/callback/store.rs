// Copyright 2020 Joyent, Inc.

//! Pull-mode callback store.
//!
//! Callbacks queue in memory until `memory_threshold` is exceeded.  At that
//! point everything but the oldest `retained` entries is written to the
//! spill directory, and new callbacks keep going to disk until the disk
//! backlog drains.  Memory always holds the oldest entries, so draining
//! memory first and then disk preserves FIFO order.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use slog::{debug, info, o, warn, Logger};
use uuid::Uuid;

use crate::config::{keys, Config};
use crate::error::{RemotingError, Result};
use crate::invocation::{Callback, Metadata};
use crate::marshal::{Marshaller, WireMessage};

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub memory_threshold: usize,
    pub retained: usize,
    pub dir: PathBuf,
    /// Maximum callbacks returned per poll; zero returns everything.
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            memory_threshold: 100,
            retained: 10,
            dir: std::env::temp_dir().join("remoting-callbacks"),
            batch_size: 0,
        }
    }
}

impl StoreConfig {
    pub fn from_config(config: &Config) -> Result<StoreConfig> {
        let defaults = StoreConfig::default();
        let memory_threshold =
            config.get_usize(keys::CALLBACK_MEMORY_THRESHOLD, defaults.memory_threshold)?;
        let retained = config.get_usize(keys::CALLBACK_RETAINED_CACHE, defaults.retained)?;
        if retained > memory_threshold {
            let msg = format!(
                "{} may not exceed {}",
                keys::CALLBACK_RETAINED_CACHE,
                keys::CALLBACK_MEMORY_THRESHOLD
            );
            return Err(RemotingError::InvalidConfiguration(msg));
        }
        Ok(StoreConfig {
            memory_threshold,
            retained,
            dir: config
                .get(keys::CALLBACK_STORE_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            batch_size: config.get_usize(keys::CALLBACK_BATCH_SIZE, defaults.batch_size)?,
        })
    }
}

struct StoreState {
    memory: VecDeque<Bytes>,
    /// Sequence numbers of spilled callbacks still on disk: `head..tail`.
    disk_head: u64,
    disk_tail: u64,
}

impl StoreState {
    fn disk_len(&self) -> usize {
        (self.disk_tail - self.disk_head) as usize
    }
}

pub struct CallbackStore {
    dir: PathBuf,
    config: StoreConfig,
    marshaller: Arc<dyn Marshaller>,
    state: Mutex<StoreState>,
    log: Logger,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

impl CallbackStore {
    pub fn new(
        name: &str,
        config: StoreConfig,
        marshaller: Arc<dyn Marshaller>,
        log: &Logger,
    ) -> CallbackStore {
        let dir = config
            .dir
            .join(format!("{}-{}", sanitize(name), Uuid::new_v4().simple()));
        CallbackStore {
            log: log.new(o!("callback-store" => dir.display().to_string())),
            dir,
            config,
            marshaller,
            state: Mutex::new(StoreState {
                memory: VecDeque::new(),
                disk_head: 0,
                disk_tail: 0,
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{:020}.callback", seq))
    }

    fn encode(&self, callback: &Callback) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.marshaller
            .write(&WireMessage::Callback(callback.clone()), &mut buf)?;
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> Result<Callback> {
        match self.marshaller.read(data, &Metadata::new())? {
            WireMessage::Callback(callback) => Ok(callback),
            _ => Err(RemotingError::Protocol(String::from(
                "callback store entry is not a callback",
            ))),
        }
    }

    fn write_entry(&self, seq: u64, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(seq), data)?;
        Ok(())
    }

    /// Moves everything past the oldest `retained` entries to disk.  Memory
    /// is only trimmed once every write succeeded; a failed spill removes
    /// the files it wrote and leaves memory as it was.
    fn spill(&self, state: &mut StoreState) -> Result<usize> {
        let first = state.disk_tail;
        let mut seq = first;
        for data in state.memory.iter().skip(self.config.retained) {
            if let Err(e) = self.write_entry(seq, data) {
                for written in first..seq {
                    let _ = fs::remove_file(self.path_for(written));
                }
                return Err(e);
            }
            seq += 1;
        }
        state.memory.truncate(self.config.retained);
        state.disk_tail = seq;
        Ok((seq - first) as usize)
    }

    /// Queues `callback`.  The payload is marshalled here, so a callback that
    /// cannot be represented is rejected immediately.
    pub fn enqueue(&self, callback: &Callback) -> Result<()> {
        let encoded = self.encode(callback)?;
        let mut state = self.state.lock();

        if state.disk_len() > 0 {
            let seq = state.disk_tail;
            self.write_entry(seq, &encoded)?;
            state.disk_tail += 1;
            return Ok(());
        }

        state.memory.push_back(encoded);
        if state.memory.len() > self.config.memory_threshold {
            match self.spill(&mut state) {
                Ok(spilled) => {
                    info!(self.log, "spilled callbacks to disk";
                        "spilled" => spilled, "retained" => state.memory.len());
                }
                Err(e) => {
                    // Only the callback being enqueued is refused.
                    state.memory.pop_back();
                    warn!(self.log, "failed to spill callbacks"; "error" => %e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Removes and returns the oldest queued callbacks, up to the configured
    /// batch size.  Never blocks waiting for new callbacks.
    pub fn poll(&self) -> Result<Vec<Callback>> {
        let mut state = self.state.lock();
        let limit = if self.config.batch_size == 0 {
            usize::max_value()
        } else {
            self.config.batch_size
        };

        // An entry leaves the store only once it decoded.  On failure the
        // batch so far is returned and the bad entry stays queued.
        let mut callbacks = Vec::new();
        let mut failure = None;
        while callbacks.len() < limit {
            let decoded = match state.memory.front() {
                Some(data) => self.decode(data),
                None => break,
            };
            match decoded {
                Ok(callback) => {
                    state.memory.pop_front();
                    callbacks.push(callback);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        while failure.is_none() && callbacks.len() < limit && state.disk_len() > 0 {
            let path = self.path_for(state.disk_head);
            match fs::read(&path).map_err(RemotingError::from).and_then(|d| self.decode(&d)) {
                Ok(callback) => {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(self.log, "failed to remove callback file"; "error" => %e);
                    }
                    state.disk_head += 1;
                    callbacks.push(callback);
                }
                Err(e) => failure = Some(e),
            }
        }

        if let Some(e) = failure {
            warn!(self.log, "cannot read queued callback"; "error" => %e);
            if callbacks.is_empty() {
                return Err(e);
            }
        }
        if !callbacks.is_empty() {
            debug!(self.log, "polled callbacks"; "count" => callbacks.len(),
                "remaining" => state.memory.len() + state.disk_len());
        }
        Ok(callbacks)
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.memory.len() + state.disk_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_len(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn disk_len(&self) -> usize {
        self.state.lock().disk_len()
    }

    /// Drops every queued callback and removes the spill directory.
    pub fn purge(&self) {
        let mut state = self.state.lock();
        state.memory.clear();
        state.disk_head = state.disk_tail;
        if self.dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!(self.log, "failed to remove callback store"; "error" => %e);
            }
        }
    }
}

impl Drop for CallbackStore {
    fn drop(&mut self) {
        self.purge();
    }
}
