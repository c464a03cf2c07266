// Copyright 2020 Joyent, Inc.

//! Process-wide runtime state.
//!
//! A `Context` owns the state shared by every invoker in a process: the
//! transport registry, the marshaller table, the periodic task scheduler and
//! the socket connection pools.  It is constructed explicitly and shared by
//! `Arc`.  Two contexts never see each other's servers or pools.

use std::sync::Arc;

use slog::{debug, o, Drain, Logger};

use crate::config::{keys, Config};
use crate::error::Result;
use crate::locator::Locator;
use crate::marshal::MarshalRegistry;
use crate::pool::PoolRegistry;
use crate::registry::InvokerRegistry;
use crate::scheduler::Scheduler;
use crate::server::ServerInvoker;
use crate::transport::local::LocalClientInvoker;
use crate::transport::socket::SocketConnection;
use crate::transport::ClientInvoker;

pub struct Context {
    log: Logger,
    registry: InvokerRegistry,
    marshallers: MarshalRegistry,
    scheduler: Scheduler,
    socket_pools: PoolRegistry<SocketConnection>,
}

impl Context {
    pub fn new(log: Option<&Logger>) -> Result<Arc<Context>> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        Ok(Arc::new(Context {
            registry: InvokerRegistry::new(&log),
            marshallers: MarshalRegistry::new(),
            scheduler: Scheduler::new(Some(&log))?,
            socket_pools: PoolRegistry::new(&log),
            log,
        }))
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn registry(&self) -> &InvokerRegistry {
        &self.registry
    }

    pub fn marshallers(&self) -> &MarshalRegistry {
        &self.marshallers
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn socket_pools(&self) -> &PoolRegistry<SocketConnection> {
        &self.socket_pools
    }

    /// Builds the client invoker for `locator`.  A started server invoker
    /// at the same address in this context is called directly unless
    /// `forceRemote` is set.
    pub fn create_client_invoker(
        self: &Arc<Self>,
        locator: &Locator,
        config: &Config,
    ) -> Result<Arc<dyn ClientInvoker>> {
        let config = Config::merged(locator, config);
        if !config.get_bool(keys::FORCE_REMOTE, false)? {
            if let Some(server) = self.registry.find_server(locator) {
                debug!(self.log, "using in-process invoker"; "locator" => %locator);
                let invoker = LocalClientInvoker::new(self, locator, &config, &server)?;
                return Ok(Arc::new(invoker));
            }
        }
        self.registry.create_client_invoker(self, locator, &config)
    }

    /// Builds an unstarted server invoker for `locator`.
    pub fn create_server_invoker(
        self: &Arc<Self>,
        locator: &Locator,
        config: &Config,
    ) -> Result<Arc<ServerInvoker>> {
        let config = Config::merged(locator, config);
        let transport = self.registry.create_server_transport(self, locator, &config)?;
        ServerInvoker::new(self, locator, config, transport)
    }
}
