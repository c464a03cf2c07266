// Copyright 2020 Joyent, Inc.

//! Client facade.
//!
//! A `Client` turns a locator into a connected client invoker and wraps
//! payloads into invocation requests.  It also manages callback listeners:
//! push listeners get a callback connector (a small server invoker the
//! remote server calls back into) and pull listeners are drained with
//! `get_callbacks` or an optional background poller.
//!
//! A `Client` may be shared between threads; each invocation independently
//! checks a connection out of the invoker's pool.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use slog::{debug, info, o, warn, Logger};
use uuid::Uuid;

use crate::callback::InvokerCallbackHandler;
use crate::config::{keys, Config};
use crate::context::Context;
use crate::error::{RemotingError, Result};
use crate::invocation::{
    Callback, InternalInvocation, Invocation, InvocationRequest, InvocationResponse, Metadata, MethodCall,
    Outcome, Payload,
};
use crate::lease::{self, ConnectionListener, ConnectionListeners, LeaseRenewer};
use crate::locator::Locator;
use crate::scheduler::TaskHandle;
use crate::server::ServerInvoker;
use crate::transport::{ClientConfig, ClientInvoker, InvokerState};

fn into_result(response: InvocationResponse) -> Result<Payload> {
    match response.outcome {
        Outcome::Return(payload) => Ok(payload),
        Outcome::Application(e) => Err(RemotingError::Application(e)),
        Outcome::Failure(f) => Err(f.into()),
    }
}

fn fetch_callbacks(
    invoker: &dyn ClientInvoker,
    session_id: &str,
    subsystem: Option<&str>,
    listener_id: &str,
) -> Result<Vec<Callback>> {
    let request = InvocationRequest::new(
        session_id,
        subsystem,
        Invocation::Internal(InternalInvocation::GetCallbacks {
            listener_id: listener_id.to_string(),
        }),
    );
    match into_result(invoker.invoke(request)?)?.into_value() {
        Some(Value::Null) | None => Ok(vec![]),
        Some(value) => serde_json::from_value(value).map_err(RemotingError::serialization),
    }
}

struct Listener {
    id: String,
    handler: Arc<dyn InvokerCallbackHandler>,
    connector: Option<Arc<ServerInvoker>>,
    owns_connector: bool,
    poller: Option<TaskHandle>,
}

pub struct Client {
    ctx: Arc<Context>,
    locator: Locator,
    config: Config,
    subsystem: Option<String>,
    session_id: String,
    invoker: RwLock<Option<Arc<dyn ClientInvoker>>>,
    lease: Mutex<Option<LeaseRenewer>>,
    listeners: Mutex<Vec<Listener>>,
    connection_listeners: ConnectionListeners,
    log: Logger,
}

impl Client {
    /// Builds an unconnected client.  `config` is merged over the locator's
    /// parameters and validated here.
    pub fn new(ctx: &Arc<Context>, locator: Locator, config: &Config) -> Result<Client> {
        let config = Config::merged(&locator, config);
        ClientConfig::from_config(&config)?;
        ctx.registry().is_ssl_supported(locator.protocol())?;
        let session_id = Uuid::new_v4().to_string();
        let log = ctx.log().new(o!("component" => "client",
            "locator" => locator.to_string(), "session" => session_id.clone()));

        Ok(Client {
            ctx: Arc::clone(ctx),
            locator,
            config,
            subsystem: None,
            session_id,
            invoker: RwLock::new(None),
            lease: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            connection_listeners: ConnectionListeners::default(),
            log,
        })
    }

    pub fn from_uri(ctx: &Arc<Context>, uri: &str, config: &Config) -> Result<Client> {
        Client::new(ctx, Locator::parse(uri)?, config)
    }

    /// Directs invocations to the handler registered under `subsystem`.
    pub fn with_subsystem(mut self, subsystem: &str) -> Client {
        self.subsystem = Some(subsystem.to_string());
        self
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.invoker
            .read()
            .as_ref()
            .map_or(false, |i| i.state() == InvokerState::Connected)
    }

    /// True when invocations are dispatched in-process.
    pub fn is_local(&self) -> bool {
        self.invoker.read().as_ref().map_or(false, |i| i.is_local())
    }

    /// Connects, unless already connected.  A client that was disconnected
    /// connects again with a new invoker.
    pub fn connect(&self) -> Result<()> {
        let mut slot = self.invoker.write();
        if let Some(invoker) = slot.as_ref() {
            if invoker.state() == InvokerState::Connected {
                return Ok(());
            }
        }

        let invoker = self.ctx.create_client_invoker(&self.locator, &self.config)?;
        invoker.connect()?;
        if self.config.get_bool(keys::CLIENT_LEASE, false)? {
            if let Err(e) = self.start_lease(&invoker) {
                invoker.disconnect();
                return Err(e);
            }
        }
        *slot = Some(invoker);
        info!(self.log, "connected");
        Ok(())
    }

    fn start_lease(&self, invoker: &Arc<dyn ClientInvoker>) -> Result<()> {
        let period = match lease::ping(invoker.as_ref(), &self.session_id, true)? {
            Some(period) => period,
            None => {
                warn!(self.log, "server does not grant leases");
                return Ok(());
            }
        };
        let ping_frequency = self.config.get_millis(keys::PING_FREQUENCY, period / 2)?;
        let renewer = LeaseRenewer::start(
            self.ctx.scheduler(),
            Arc::clone(invoker),
            &self.session_id,
            period,
            ping_frequency,
            Arc::clone(&self.connection_listeners),
            &self.log,
        );
        if let Some(old) = self.lease.lock().replace(renewer) {
            old.stop();
        }
        Ok(())
    }

    /// Removes every listener, ends the session on the server and releases
    /// the invoker.  Safe to call more than once.
    pub fn disconnect(&self) {
        let listeners: Vec<Listener> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            if let Err(e) = self.release_listener(listener) {
                debug!(self.log, "listener removal failed"; "error" => %e);
            }
        }
        if let Some(renewer) = self.lease.lock().take() {
            renewer.stop();
        }
        if let Some(invoker) = self.invoker.write().take() {
            if invoker.state() == InvokerState::Connected {
                let request = InvocationRequest::internal(&self.session_id, InternalInvocation::Disconnect);
                if let Err(e) = invoker.invoke(request) {
                    debug!(self.log, "server did not acknowledge disconnect"; "error" => %e);
                }
            }
            invoker.disconnect();
            info!(self.log, "disconnected");
        }
    }

    fn invoker(&self) -> Result<Arc<dyn ClientInvoker>> {
        self.invoker
            .read()
            .clone()
            .ok_or_else(|| RemotingError::InvalidState(String::from("client is not connected")))
    }

    fn call(&self, invocation: Invocation, metadata: Metadata) -> Result<Payload> {
        let mut request = InvocationRequest::new(&self.session_id, self.subsystem(), invocation);
        request.metadata = metadata;
        into_result(self.invoker()?.invoke(request)?)
    }

    /// Sends `payload` to the server's handler and returns its result.
    /// Application errors come back as `RemotingError::Application`.
    pub fn invoke<P: Into<Payload>>(&self, payload: P) -> Result<Payload> {
        self.invoke_with_metadata(payload, Metadata::new())
    }

    pub fn invoke_with_metadata<P: Into<Payload>>(&self, payload: P, metadata: Metadata) -> Result<Payload> {
        self.call(Invocation::Payload(payload.into()), metadata)
    }

    pub fn invoke_method(&self, name: &str, params: Vec<Value>) -> Result<Payload> {
        let method = MethodCall {
            name: name.to_string(),
            params,
            signature: vec![],
        };
        self.call(Invocation::Method(method), Metadata::new())
    }

    fn internal(&self, invocation: InternalInvocation) -> Result<Payload> {
        self.call(Invocation::Internal(invocation), Metadata::new())
    }

    /// Registers `handler` for callbacks from the server.
    ///
    /// With a `callback_locator` the listener is push mode: callbacks are
    /// delivered through a connector at that locator, started here unless a
    /// server invoker is already running there.  Without one the listener is
    /// pull mode and callbacks queue on the server until fetched with
    /// `get_callbacks`, or until the poller configured by
    /// `callbackPollPeriod` collects them.
    pub fn add_listener(
        &self,
        handler: Arc<dyn InvokerCallbackHandler>,
        callback_locator: Option<Locator>,
        callback_handle: Option<Value>,
    ) -> Result<()> {
        let invoker = self.invoker()?;
        if self.listeners.lock().iter().any(|l| Arc::ptr_eq(&l.handler, &handler)) {
            return Ok(());
        }
        let id = Uuid::new_v4().to_string();

        let (connector, owns_connector) = match &callback_locator {
            Some(locator) => {
                let (connector, owned) = self.connector(locator)?;
                connector.register_callback_listener(&id, Arc::clone(&handler));
                (Some(connector), owned)
            }
            None => (None, false),
        };

        let added = self.internal(InternalInvocation::AddListener {
            listener_id: id.clone(),
            callback_locator: connector.as_ref().map(|c| c.locator()),
            callback_handle,
        });
        if let Err(e) = added {
            if let Some(connector) = &connector {
                connector.unregister_callback_listener(&id);
                if owns_connector {
                    if let Err(e) = connector.destroy() {
                        warn!(self.log, "failed to destroy callback connector";
                            "listener" => &id, "error" => %e);
                    }
                }
            }
            return Err(e);
        }

        let poller = match connector {
            Some(_) => None,
            None => self.start_poller(&invoker, &id, &handler)?,
        };
        info!(self.log, "listener added"; "listener" => &id, "push" => connector.is_some());
        self.listeners.lock().push(Listener {
            id,
            handler,
            connector,
            owns_connector,
            poller,
        });
        Ok(())
    }

    fn connector(&self, locator: &Locator) -> Result<(Arc<ServerInvoker>, bool)> {
        if let Some(existing) = self.ctx.registry().find_server(locator) {
            return Ok((existing, false));
        }
        let connector = self.ctx.create_server_invoker(locator, &Config::new())?;
        connector.start()?;
        debug!(self.log, "started callback connector"; "locator" => %connector.locator());
        Ok((connector, true))
    }

    fn start_poller(
        &self,
        invoker: &Arc<dyn ClientInvoker>,
        listener_id: &str,
        handler: &Arc<dyn InvokerCallbackHandler>,
    ) -> Result<Option<TaskHandle>> {
        let period = self
            .config
            .get_millis(keys::CALLBACK_POLL_PERIOD, Duration::from_secs(0))?;
        if period == Duration::from_secs(0) {
            return Ok(None);
        }

        let invoker = Arc::clone(invoker);
        let handler = Arc::clone(handler);
        let session_id = self.session_id.clone();
        let subsystem = self.subsystem.clone();
        let listener_id = listener_id.to_string();
        let log = self.log.new(o!("poller" => listener_id.clone()));
        Ok(Some(self.ctx.scheduler().schedule("callback-poller", period, move || {
            match fetch_callbacks(invoker.as_ref(), &session_id, subsystem.as_deref(), &listener_id) {
                Ok(callbacks) => {
                    for callback in callbacks {
                        if let Err(e) = handler.handle_callback(callback) {
                            warn!(log, "listener rejected callback"; "error" => %e);
                        }
                    }
                }
                Err(e) => warn!(log, "callback poll failed"; "error" => %e),
            }
        })))
    }

    fn release_listener(&self, listener: Listener) -> Result<()> {
        if let Some(poller) = &listener.poller {
            poller.cancel();
        }
        let removed = self.internal(InternalInvocation::RemoveListener {
            listener_id: listener.id.clone(),
        });
        if let Some(connector) = &listener.connector {
            connector.unregister_callback_listener(&listener.id);
            if listener.owns_connector {
                connector.destroy()?;
            }
        }
        debug!(self.log, "listener removed"; "listener" => &listener.id);
        removed.map(|_| ())
    }

    /// Unregisters `handler`.  Other listeners are unaffected.
    pub fn remove_listener(&self, handler: &Arc<dyn InvokerCallbackHandler>) -> Result<()> {
        let listener = {
            let mut listeners = self.listeners.lock();
            match listeners.iter().position(|l| Arc::ptr_eq(&l.handler, handler)) {
                Some(i) => listeners.remove(i),
                None => {
                    return Err(RemotingError::InvalidState(String::from(
                        "listener is not registered",
                    )));
                }
            }
        };
        self.release_listener(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Drains the callbacks queued for a pull listener.  Returns at once,
    /// empty if nothing is waiting.
    pub fn get_callbacks(&self, handler: &Arc<dyn InvokerCallbackHandler>) -> Result<Vec<Callback>> {
        let id = self
            .listeners
            .lock()
            .iter()
            .find(|l| Arc::ptr_eq(&l.handler, handler))
            .map(|l| l.id.clone())
            .ok_or_else(|| RemotingError::InvalidState(String::from("listener is not registered")))?;
        fetch_callbacks(self.invoker()?.as_ref(), &self.session_id, self.subsystem(), &id)
    }

    /// Told when the lease on this client's session cannot be renewed.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.connection_listeners.write().push(listener);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Async wrapper running the blocking client on tokio's blocking pool.
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<Client>,
}

fn join_error(e: tokio::task::JoinError) -> RemotingError {
    RemotingError::InvalidState(format!("client task failed: {}", e))
}

impl AsyncClient {
    pub fn new(client: Client) -> AsyncClient {
        AsyncClient {
            inner: Arc::new(client),
        }
    }

    pub fn client(&self) -> &Client {
        &self.inner
    }

    pub async fn connect(&self) -> Result<()> {
        let client = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || client.connect())
            .await
            .map_err(join_error)?
    }

    pub async fn invoke<P: Into<Payload>>(&self, payload: P) -> Result<Payload> {
        let client = Arc::clone(&self.inner);
        let payload = payload.into();
        tokio::task::spawn_blocking(move || client.invoke(payload))
            .await
            .map_err(join_error)?
    }

    pub async fn invoke_method(&self, name: &str, params: Vec<Value>) -> Result<Payload> {
        let client = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || client.invoke_method(&name, params))
            .await
            .map_err(join_error)?
    }

    pub async fn disconnect(&self) {
        let client = Arc::clone(&self.inner);
        if let Err(e) = tokio::task::spawn_blocking(move || client.disconnect()).await {
            warn!(self.inner.log, "disconnect task failed"; "error" => %e);
        }
    }
}
