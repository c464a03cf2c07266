// Copyright 2020 Joyent, Inc.

//! Transport registry.
//!
//! Maps a transport name (the locator protocol) to the factories that build
//! its client invoker and server transport.  The registry also tracks every
//! started server invoker by address, which is how duplicate binds are
//! detected and how in-process clients find a server to call directly.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use slog::{debug, info, o, Logger};

use crate::config::Config;
use crate::context::Context;
use crate::error::{RemotingError, Result};
use crate::locator::Locator;
use crate::server::{ServerInvoker, ServerState};
use crate::transport::{http, socket, ClientInvoker, ServerTransport};

pub type ClientFactory =
    Arc<dyn Fn(&Arc<Context>, &Locator, &Config) -> Result<Arc<dyn ClientInvoker>> + Send + Sync>;

pub type ServerFactory =
    Arc<dyn Fn(&Arc<Context>, &Locator, &Config) -> Result<Box<dyn ServerTransport>> + Send + Sync>;

#[derive(Clone)]
pub struct RegistryEntry {
    pub client: ClientFactory,
    pub server: ServerFactory,
    pub supports_ssl: bool,
}

pub struct InvokerRegistry {
    transports: RwLock<HashMap<String, RegistryEntry>>,
    servers: Mutex<HashMap<String, Weak<ServerInvoker>>>,
    log: Logger,
}

/// Factories for SSL transport names until a TLS-capable transport is
/// registered over them.
fn ssl_unavailable(name: &'static str) -> RegistryEntry {
    let client: ClientFactory = Arc::new(move |_: &Arc<Context>, _: &Locator, _: &Config| {
        Err(RemotingError::InvalidConfiguration(format!(
            "transport '{}' requires a registered TLS provider",
            name
        )))
    });
    let server: ServerFactory = Arc::new(move |_: &Arc<Context>, _: &Locator, _: &Config| {
        Err(RemotingError::InvalidConfiguration(format!(
            "transport '{}' requires a registered TLS provider",
            name
        )))
    });
    RegistryEntry {
        client,
        server,
        supports_ssl: true,
    }
}

fn socket_entry() -> RegistryEntry {
    RegistryEntry {
        client: Arc::new(socket::create_client_invoker),
        server: Arc::new(socket::create_server_transport),
        supports_ssl: false,
    }
}

fn http_entry() -> RegistryEntry {
    RegistryEntry {
        client: Arc::new(http::create_client_invoker),
        server: Arc::new(http::create_server_transport),
        supports_ssl: false,
    }
}

impl InvokerRegistry {
    /// A registry holding the built-in transport table.
    ///
    /// `bisocket`, `multiplex` and `rmi` are served by the socket transport and
    /// `servlet` by the HTTP transport.
    pub fn new(log: &Logger) -> InvokerRegistry {
        let mut transports = HashMap::new();
        for name in &["socket", "bisocket", "multiplex", "rmi"] {
            transports.insert(name.to_string(), socket_entry());
        }
        for name in &["http", "servlet"] {
            transports.insert(name.to_string(), http_entry());
        }
        for name in &["sslsocket", "sslbisocket", "sslmultiplex", "sslrmi", "https", "sslservlet"] {
            transports.insert(name.to_string(), ssl_unavailable(*name));
        }

        InvokerRegistry {
            transports: RwLock::new(transports),
            servers: Mutex::new(HashMap::new()),
            log: log.new(o!("component" => "invoker-registry")),
        }
    }

    pub fn register_invoker(
        &self,
        transport: &str,
        client: ClientFactory,
        server: ServerFactory,
        supports_ssl: bool,
    ) {
        let entry = RegistryEntry {
            client,
            server,
            supports_ssl,
        };
        self.transports
            .write()
            .insert(transport.to_ascii_lowercase(), entry);
        info!(self.log, "registered transport"; "transport" => transport, "ssl" => supports_ssl);
    }

    pub fn unregister_invoker(&self, transport: &str) -> bool {
        self.transports
            .write()
            .remove(&transport.to_ascii_lowercase())
            .is_some()
    }

    pub fn is_registered(&self, transport: &str) -> bool {
        self.transports
            .read()
            .contains_key(&transport.to_ascii_lowercase())
    }

    pub fn is_ssl_supported(&self, transport: &str) -> Result<bool> {
        self.entry(transport).map(|e| e.supports_ssl)
    }

    pub fn transports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transports.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn entry(&self, transport: &str) -> Result<RegistryEntry> {
        self.transports
            .read()
            .get(&transport.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RemotingError::UnknownTransport(transport.to_string()))
    }

    /// Builds the remote client invoker for `locator`'s transport.
    pub fn create_client_invoker(
        &self,
        ctx: &Arc<Context>,
        locator: &Locator,
        config: &Config,
    ) -> Result<Arc<dyn ClientInvoker>> {
        let entry = self.entry(locator.protocol())?;
        debug!(self.log, "creating client invoker"; "locator" => %locator);
        (entry.client)(ctx, locator, config)
    }

    pub fn create_server_transport(
        &self,
        ctx: &Arc<Context>,
        locator: &Locator,
        config: &Config,
    ) -> Result<Box<dyn ServerTransport>> {
        let entry = self.entry(locator.protocol())?;
        (entry.server)(ctx, locator, config)
    }

    /// Claims `locator`'s address for `server`.  Fails if another started
    /// server invoker holds it.
    pub(crate) fn reserve_address(&self, locator: &Locator, server: &Arc<ServerInvoker>) -> Result<()> {
        let key = locator.address();
        let mut servers = self.servers.lock();
        if let Some(existing) = servers.get(&key).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&existing, server) && existing.state() == ServerState::Started {
                return Err(RemotingError::InvalidConfiguration(format!(
                    "address {} is already bound by a started server invoker",
                    key
                )));
            }
        }
        servers.insert(key, Arc::downgrade(server));
        Ok(())
    }

    pub(crate) fn release_address(&self, locator: &Locator, server: &ServerInvoker) {
        let key = locator.address();
        let mut servers = self.servers.lock();
        let owned = match servers.get(&key).and_then(Weak::upgrade) {
            Some(existing) => std::ptr::eq(existing.as_ref(), server),
            None => true,
        };
        if owned {
            servers.remove(&key);
        }
    }

    /// The started server invoker at `locator`'s address and transport, if
    /// one lives in this context.
    pub fn find_server(&self, locator: &Locator) -> Option<Arc<ServerInvoker>> {
        let servers = self.servers.lock();
        servers
            .get(&locator.address())
            .and_then(Weak::upgrade)
            .filter(|s| s.state() == ServerState::Started && s.locator().protocol() == locator.protocol())
    }

    pub fn started_servers(&self) -> usize {
        self.servers
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|s| s.state() == ServerState::Started)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn registry() -> InvokerRegistry {
        InvokerRegistry::new(&Logger::root(slog_stdlog::StdLog.fuse(), o!()))
    }

    #[test]
    fn builtin_table() {
        let registry = registry();
        for name in &["socket", "bisocket", "multiplex", "rmi", "http", "servlet"] {
            assert!(!registry.is_ssl_supported(name).unwrap(), "{}", name);
        }
        for name in &["sslsocket", "sslbisocket", "sslmultiplex", "sslrmi", "https", "sslservlet"] {
            assert!(registry.is_ssl_supported(name).unwrap(), "{}", name);
        }
        assert_eq!(registry.transports().len(), 12);
    }

    #[test]
    fn unknown_transport() {
        match registry().is_ssl_supported("carrier-pigeon") {
            Err(RemotingError::UnknownTransport(name)) => assert_eq!(name, "carrier-pigeon"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn registration_overrides_and_removes() {
        let registry = registry();
        let entry = socket_entry();
        registry.register_invoker("SSLSocket", entry.client, entry.server, true);
        assert!(registry.is_ssl_supported("sslsocket").unwrap());
        assert!(registry.unregister_invoker("sslsocket"));
        assert!(!registry.is_registered("sslsocket"));
    }
}
