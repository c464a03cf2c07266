// Copyright 2020 Joyent, Inc.

//! fast-remoting: a pluggable remote invocation runtime.
//!
//! Clients reach a service by locator URI, such as
//! `socket://10.0.0.4:5400/?timeout=3000`, and invoke it synchronously.
//! The locator's protocol selects a transport from the `InvokerRegistry`:
//!
//! * `socket` (also `bisocket`, `multiplex`, `rmi`): pooled TCP connections
//!   carrying the framed protocol described in `protocol`.
//!
//! * `http` (also `servlet`): one POST per invocation.
//!
//! * A client whose locator names a server invoker started in the same
//!   `Context` calls it directly unless `forceRemote` is set.
//!
//! Servers register an `InvocationHandler` per subsystem.  Handlers may
//! call back into clients that registered listeners, either by pushing to
//! a callback connector the client hosts or by queueing callbacks the
//! client pulls.  Sessions can be leased so that a server reclaims the
//! callback state of clients that vanish.
//!
//! Everything process-wide (transport table, marshallers, pools, timers)
//! lives in a `Context`, which is created explicitly and shared by `Arc`.

#![allow(missing_docs)]

pub mod callback;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod invocation;
pub mod lease;
pub mod locator;
pub mod marshal;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use crate::callback::InvokerCallbackHandler;
pub use crate::client::{AsyncClient, Client};
pub use crate::config::Config;
pub use crate::context::Context;
pub use crate::error::{RemotingError, Result};
pub use crate::invocation::{ApplicationError, Callback, InvocationRequest, Payload};
pub use crate::lease::ConnectionListener;
pub use crate::locator::Locator;
pub use crate::server::{InvocationHandler, ServerInvoker, ServerState};
