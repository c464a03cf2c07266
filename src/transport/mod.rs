// Copyright 2020 Joyent, Inc.

//! Transport strategies.
//!
//! A `ClientInvoker` performs invocation attempts against one endpoint; a
//! `ServerTransport` binds a listening resource for a `ServerInvoker` and
//! feeds incoming requests to its dispatcher.  Variants are built through
//! the `InvokerRegistry` factories.

pub mod http;
pub mod local;
pub mod socket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slog::{warn, Logger};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::{keys, Config};
use crate::error::{RemotingError, Result};
use crate::invocation::{InvocationRequest, InvocationResponse};
use crate::locator::Locator;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::server::Dispatcher;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvokerState {
    Unconnected,
    Connected,
    /// Terminal: a disconnected invoker is never reconnected.
    Disconnected,
}

pub trait ClientInvoker: Send + Sync {
    fn locator(&self) -> &Locator;

    fn state(&self) -> InvokerState;

    fn connect(&self) -> Result<()>;

    /// One invocation, including any transport-level retries.
    fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse>;

    fn disconnect(&self);

    fn is_local(&self) -> bool {
        false
    }
}

pub trait ServerTransport: Send + Sync {
    /// Binds `locator`'s address and begins serving on `runtime` until
    /// `shutdown` fires.  Returns the address actually bound.
    fn start(
        &self,
        locator: &Locator,
        runtime: &Handle,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Result<SocketAddr>;
}

/// Client-side settings common to every transport.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retries: u32,
    pub by_value: bool,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            retries: 1,
            by_value: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn from_config(config: &Config) -> Result<ClientConfig> {
        let defaults = ClientConfig::default();
        let timeout = positive_millis(config, keys::TIMEOUT, defaults.timeout)?;
        let connect_timeout =
            positive_millis(config, keys::CONNECT_TIMEOUT, defaults.connect_timeout)?;
        Ok(ClientConfig {
            timeout,
            connect_timeout,
            retries: config.get_parsed(keys::NUMBER_OF_RETRIES, defaults.retries)?,
            by_value: config.get_bool(keys::BY_VALUE, defaults.by_value)?,
            max_frame_size: config.get_usize(keys::MAX_FRAME_SIZE, defaults.max_frame_size)?,
        })
    }
}

/// Socket timeouts of zero mean "no timeout" to std, which is never wanted.
fn positive_millis(config: &Config, key: &str, default: Duration) -> Result<Duration> {
    let value = config.get_millis(key, default)?;
    if value == Duration::from_secs(0) {
        let msg = format!("{} must be greater than zero", key);
        return Err(RemotingError::InvalidConfiguration(msg));
    }
    Ok(value)
}

/// Connect/disconnect bookkeeping shared by the client invokers.
pub(crate) struct Lifecycle {
    state: Mutex<InvokerState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Lifecycle {
        Lifecycle {
            state: Mutex::new(InvokerState::Unconnected),
        }
    }

    pub(crate) fn state(&self) -> InvokerState {
        *self.state.lock()
    }

    pub(crate) fn connect_with<F>(&self, connect: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock();
        match *state {
            InvokerState::Connected => Ok(()),
            InvokerState::Disconnected => Err(RemotingError::InvalidState(String::from(
                "invoker has been disconnected",
            ))),
            InvokerState::Unconnected => {
                connect()?;
                *state = InvokerState::Connected;
                Ok(())
            }
        }
    }

    pub(crate) fn check_connected(&self) -> Result<()> {
        match self.state() {
            InvokerState::Connected => Ok(()),
            InvokerState::Unconnected => Err(RemotingError::InvalidState(String::from(
                "invoker is not connected",
            ))),
            InvokerState::Disconnected => Err(RemotingError::InvalidState(String::from(
                "invoker has been disconnected",
            ))),
        }
    }

    /// Moves to `Disconnected`, running `release` only if resources were held.
    pub(crate) fn disconnect_with<F>(&self, release: F)
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock();
        if *state == InvokerState::Connected {
            release();
        }
        *state = InvokerState::Disconnected;
    }
}

/// Runs `attempt` until it succeeds, fails with a non-transport error, or
/// `retries` extra attempts have been spent.  The attempt number is passed so
/// callers can insist on a fresh connection after the first failure.
pub(crate) fn with_retries<T, F>(retries: u32, log: &Logger, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let mut n = 0;
    loop {
        match attempt(n) {
            Err(e) if e.is_transport() && n < retries => {
                warn!(log, "invocation attempt failed, retrying on a new connection";
                    "attempt" => n, "error" => %e);
                n += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Drain};

    fn log() -> Logger {
        Logger::root(slog_stdlog::StdLog.fuse(), o!())
    }

    #[test]
    fn retries_only_transport_failures() {
        let mut calls = 0;
        let result: Result<()> = with_retries(3, &log(), |_| {
            calls += 1;
            Err(RemotingError::Serialization(String::from("bad")))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut attempts = vec![];
        let result = with_retries(1, &log(), |n| {
            attempts.push(n);
            if n == 0 {
                Err(RemotingError::ConnectionFailed(String::from("reset")))
            } else {
                Ok(n)
            }
        });
        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts, vec![0, 1]);
    }

    #[test]
    fn retries_are_bounded() {
        let mut calls = 0;
        let result: Result<()> = with_retries(2, &log(), |_| {
            calls += 1;
            Err(RemotingError::ConnectionFailed(String::from("reset")))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn lifecycle_is_terminal_after_disconnect() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.check_connected().is_err());
        lifecycle.connect_with(|| Ok(())).unwrap();
        assert!(lifecycle.check_connected().is_ok());
        let mut released = 0;
        lifecycle.disconnect_with(|| released += 1);
        lifecycle.disconnect_with(|| released += 1);
        assert_eq!(released, 1);
        assert!(lifecycle.connect_with(|| Ok(())).is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = Config::new().with(keys::TIMEOUT, 0);
        assert!(ClientConfig::from_config(&config).is_err());
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        let config = Config::new().with(keys::CONNECT_TIMEOUT, 0);
        match ClientConfig::from_config(&config) {
            Err(RemotingError::InvalidConfiguration(msg)) => {
                assert!(msg.contains(keys::CONNECT_TIMEOUT))
            }
            other => panic!("unexpected {:?}", other.map(|c| c.connect_timeout)),
        }
    }
}
