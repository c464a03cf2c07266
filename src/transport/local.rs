// Copyright 2020 Joyent, Inc.

//! In-process transport: calls a server invoker living in the same context
//! directly, skipping the network and, unless `byValue` is set, the
//! marshaller.

use std::sync::Arc;

use parking_lot::RwLock;
use slog::{debug, o, Logger};

use crate::config::Config;
use crate::context::Context;
use crate::error::{RemotingError, Result};
use crate::invocation::{InvocationRequest, InvocationResponse};
use crate::locator::Locator;
use crate::marshal::{Marshaller, WireMessage};
use crate::server::{ServerInvoker, ServerState};
use crate::transport::{with_retries, ClientConfig, ClientInvoker, InvokerState, Lifecycle};

pub struct LocalClientInvoker {
    ctx: Arc<Context>,
    locator: Locator,
    by_value: bool,
    retries: u32,
    marshaller: Arc<dyn Marshaller>,
    server: RwLock<Arc<ServerInvoker>>,
    lifecycle: Lifecycle,
    log: Logger,
}

impl LocalClientInvoker {
    pub fn new(
        ctx: &Arc<Context>,
        locator: &Locator,
        config: &Config,
        server: &Arc<ServerInvoker>,
    ) -> Result<LocalClientInvoker> {
        let client_config = ClientConfig::from_config(config)?;
        Ok(LocalClientInvoker {
            ctx: Arc::clone(ctx),
            locator: locator.clone(),
            by_value: client_config.by_value,
            retries: client_config.retries,
            marshaller: ctx.marshallers().for_config(config)?,
            server: RwLock::new(Arc::clone(server)),
            lifecycle: Lifecycle::new(),
            log: ctx.log().new(o!("component" => "local-client", "locator" => locator.to_string())),
        })
    }

    /// The server to call.  A server that was stopped and replaced by
    /// another at the same address is swapped out.
    fn server(&self) -> Result<Arc<ServerInvoker>> {
        let current = self.server.read().clone();
        if current.state() == ServerState::Started {
            return Ok(current);
        }
        match self.ctx.registry().find_server(&self.locator) {
            Some(replacement) => {
                debug!(self.log, "switched to restarted server invoker");
                *self.server.write() = Arc::clone(&replacement);
                Ok(replacement)
            }
            None => Err(RemotingError::ConnectionFailed(format!(
                "no started server invoker at {}",
                self.locator
            ))),
        }
    }

    fn copy_request(&self, request: InvocationRequest) -> Result<InvocationRequest> {
        match self.marshaller.copy(&WireMessage::Request(request))? {
            WireMessage::Request(request) => Ok(request),
            _ => Err(RemotingError::Protocol(String::from("copy changed message type"))),
        }
    }

    fn copy_response(&self, response: InvocationResponse) -> Result<InvocationResponse> {
        match self.marshaller.copy(&WireMessage::Response(response))? {
            WireMessage::Response(response) => Ok(response),
            _ => Err(RemotingError::Protocol(String::from("copy changed message type"))),
        }
    }
}

impl ClientInvoker for LocalClientInvoker {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn state(&self) -> InvokerState {
        self.lifecycle.state()
    }

    fn connect(&self) -> Result<()> {
        self.lifecycle.connect_with(|| Ok(()))
    }

    fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        self.lifecycle.check_connected()?;
        let request = if self.by_value {
            self.copy_request(request)?
        } else {
            request
        };
        // A server stopped between lookup and dispatch may already have a
        // replacement; the next attempt looks it up again.
        let response = with_retries(self.retries, &self.log, |_| {
            self.server()?.dispatch_local(request.clone())
        })?;
        if self.by_value {
            self.copy_response(response)
        } else {
            Ok(response)
        }
    }

    fn disconnect(&self) {
        self.lifecycle.disconnect_with(|| ());
    }

    fn is_local(&self) -> bool {
        true
    }
}
