// Copyright 2020 Joyent, Inc.

//! Server-to-client callbacks.
//!
//! When a client registers a listener, the server creates a
//! `ServerInvokerCallbackHandler` for it and hands that to the invocation
//! handler.  The handler calls `handle_callback` whenever it has something to
//! report.  In push mode the callback is sent straight to the client's
//! callback connector; in pull mode it is queued in a `CallbackStore` until
//! the client asks for it.

pub mod store;

use std::sync::Arc;

use serde_json::Value;
use slog::{debug, o, Logger};

use crate::config::Config;
use crate::context::Context;
use crate::error::{RemotingError, Result};
use crate::invocation::{Callback, InternalInvocation, InvocationRequest, Outcome};
use crate::locator::Locator;
use crate::transport::ClientInvoker;

pub use self::store::{CallbackStore, StoreConfig};

/// Receives callbacks.  Implemented by application listeners on the client
/// and by `ServerInvokerCallbackHandler` on the server.
pub trait InvokerCallbackHandler: Send + Sync {
    fn handle_callback(&self, callback: Callback) -> Result<()>;
}

enum Delivery {
    Push(Arc<dyn ClientInvoker>),
    Pull(CallbackStore),
}

/// The server's proxy for one remote listener.
pub struct ServerInvokerCallbackHandler {
    session_id: String,
    listener_id: String,
    server_locator: Locator,
    callback_handle: Option<Value>,
    delivery: Delivery,
    log: Logger,
}

impl ServerInvokerCallbackHandler {
    /// A handler that delivers to the connector at `callback_locator`.
    pub(crate) fn push(
        ctx: &Arc<Context>,
        session_id: &str,
        listener_id: &str,
        server_locator: &Locator,
        callback_locator: &Locator,
        callback_handle: Option<Value>,
    ) -> Result<ServerInvokerCallbackHandler> {
        let invoker = ctx.create_client_invoker(callback_locator, &Config::new())?;
        invoker.connect()?;
        Ok(ServerInvokerCallbackHandler {
            session_id: session_id.to_string(),
            listener_id: listener_id.to_string(),
            server_locator: server_locator.clone(),
            callback_handle,
            delivery: Delivery::Push(invoker),
            log: ctx.log().new(o!("callback" => listener_id.to_string(),
                "connector" => callback_locator.to_string())),
        })
    }

    /// A handler that queues callbacks for the client to poll.
    pub(crate) fn pull(
        session_id: &str,
        listener_id: &str,
        server_locator: &Locator,
        callback_handle: Option<Value>,
        store: CallbackStore,
        log: &Logger,
    ) -> ServerInvokerCallbackHandler {
        ServerInvokerCallbackHandler {
            session_id: session_id.to_string(),
            listener_id: listener_id.to_string(),
            server_locator: server_locator.clone(),
            callback_handle,
            delivery: Delivery::Pull(store),
            log: log.new(o!("callback" => listener_id.to_string())),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn is_push(&self) -> bool {
        match self.delivery {
            Delivery::Push(_) => true,
            Delivery::Pull(_) => false,
        }
    }

    /// Callbacks waiting to be pulled.
    pub fn pending(&self) -> usize {
        match &self.delivery {
            Delivery::Push(_) => 0,
            Delivery::Pull(store) => store.len(),
        }
    }

    /// Drains the next batch of queued callbacks.
    pub fn get_callbacks(&self) -> Result<Vec<Callback>> {
        match &self.delivery {
            Delivery::Pull(store) => store.poll(),
            Delivery::Push(_) => Err(RemotingError::InvalidState(format!(
                "listener {} receives callbacks by push",
                self.listener_id
            ))),
        }
    }

    pub(crate) fn destroy(&self) {
        match &self.delivery {
            Delivery::Push(invoker) => invoker.disconnect(),
            Delivery::Pull(store) => store.purge(),
        }
        debug!(self.log, "callback handler destroyed");
    }
}

impl InvokerCallbackHandler for ServerInvokerCallbackHandler {
    fn handle_callback(&self, mut callback: Callback) -> Result<()> {
        if callback.server_locator.is_none() {
            callback.server_locator = Some(self.server_locator.clone());
        }
        if callback.handle.is_none() {
            callback.handle = self.callback_handle.clone();
        }

        match &self.delivery {
            Delivery::Pull(store) => store.enqueue(&callback),
            Delivery::Push(invoker) => {
                let request = InvocationRequest::internal(
                    &self.session_id,
                    InternalInvocation::HandleCallback {
                        listener_id: self.listener_id.clone(),
                        callback,
                    },
                );
                match invoker.invoke(request)?.outcome {
                    Outcome::Return(_) => Ok(()),
                    Outcome::Application(e) => Err(RemotingError::Application(e)),
                    Outcome::Failure(f) => Err(f.into()),
                }
            }
        }
    }
}
