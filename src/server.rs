// Copyright 2020 Joyent, Inc.

//! Server invoker.
//!
//! A `ServerInvoker` owns a bound transport and routes decoded invocations to
//! the `InvocationHandler` registered for their subsystem.  Requests from
//! the transports run on a bounded `WorkerPool`; internal invocations (lease
//! pings, listener registration, callback polling) are answered by the
//! `Dispatcher` itself.
//!
//! A server invoker moves `Created -> Started <-> Stopped -> Destroyed`.  Its
//! configuration and handlers survive a stop, so it can be started again on
//! the same locator.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use slog::{debug, error, info, o, warn, Logger};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::callback::{CallbackStore, InvokerCallbackHandler, ServerInvokerCallbackHandler, StoreConfig};
use crate::config::{keys, Config};
use crate::context::Context;
use crate::error::{RemotingError, Result};
use crate::invocation::{
    ApplicationError, Failure, FailureKind, InternalInvocation, Invocation, InvocationRequest,
    InvocationResponse, Metadata, Outcome, Payload,
};
use crate::lease::{ConnectionListener, LeaseTracker};
use crate::locator::Locator;
use crate::marshal::{Marshaller, WireMessage};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::scheduler::TaskHandle;
use crate::transport::ServerTransport;

/// Application code behind a subsystem.
pub trait InvocationHandler: Send + Sync {
    fn invoke(&self, request: &InvocationRequest) -> std::result::Result<Payload, ApplicationError>;

    /// A client registered a listener for this handler's callbacks.
    fn add_listener(&self, _listener: Arc<dyn InvokerCallbackHandler>) {}

    fn remove_listener(&self, _listener: &Arc<dyn InvokerCallbackHandler>) {}

    fn set_invoker(&self, _invoker: Weak<ServerInvoker>) {}

    fn set_management_server(&self, _server: Option<Arc<dyn Any + Send + Sync>>) {}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Requests handled concurrently.
    pub max_pool_size: usize,
    /// Requests allowed to wait for a worker before the server reports busy.
    pub backlog: usize,
    pub server_threads: usize,
    pub lease_period: Duration,
    pub max_frame_size: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_pool_size: 300,
            backlog: 200,
            server_threads: 2,
            lease_period: Duration::from_secs(0),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Result<ServerConfig> {
        let defaults = ServerConfig::default();
        let max_pool_size = config.get_usize(keys::MAX_POOL_SIZE, defaults.max_pool_size)?;
        let server_threads = config.get_usize(keys::SERVER_THREADS, defaults.server_threads)?;
        if max_pool_size == 0 || server_threads == 0 {
            return Err(RemotingError::InvalidConfiguration(format!(
                "{} and {} must be greater than zero",
                keys::MAX_POOL_SIZE,
                keys::SERVER_THREADS
            )));
        }
        Ok(ServerConfig {
            max_pool_size,
            backlog: config.get_usize(keys::BACKLOG_SIZE, defaults.backlog)?,
            server_threads,
            lease_period: config.get_millis(keys::LEASE_PERIOD, defaults.lease_period)?,
            max_frame_size: config.get_usize(keys::MAX_FRAME_SIZE, defaults.max_frame_size)?,
            shutdown_timeout: defaults.shutdown_timeout,
        })
    }
}

struct Waiting(Arc<AtomicUsize>);

impl Drop for Waiting {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded pool of handler workers.  At most `max` requests run at once and
/// at most `backlog` wait for a turn; anything beyond that is refused.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max: usize,
    backlog: usize,
}

impl WorkerPool {
    pub fn new(max: usize, backlog: usize) -> WorkerPool {
        WorkerPool {
            permits: Arc::new(Semaphore::new(max)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max,
            backlog,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Runs `work` on a blocking worker thread once a worker is free.
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                return Err(RemotingError::InvalidState(String::from("worker pool closed")));
            }
            Err(TryAcquireError::NoPermits) => {
                if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.backlog {
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                    return Err(RemotingError::ServerBusy(format!(
                        "{} workers busy and {} requests queued",
                        self.max, self.backlog
                    )));
                }
                let _waiting = Waiting(Arc::clone(&self.waiting));
                Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| RemotingError::InvalidState(String::from("worker pool closed")))?
            }
        };

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| RemotingError::ServerFailure(format!("worker failed: {}", e)))
    }
}

struct CallbackRegistration {
    handler: Arc<dyn InvocationHandler>,
    callback: Arc<ServerInvokerCallbackHandler>,
    listener: Arc<dyn InvokerCallbackHandler>,
}

/// Routes decoded requests to handlers.  Shared by the transports and the
/// in-process invoker.
pub struct Dispatcher {
    ctx: Arc<Context>,
    locator: RwLock<Locator>,
    marshaller: Arc<dyn Marshaller>,
    handlers: RwLock<HashMap<String, Arc<dyn InvocationHandler>>>,
    leases: LeaseTracker,
    /// Callback registrations by session, then listener id.
    sessions: Mutex<HashMap<String, HashMap<String, CallbackRegistration>>>,
    /// Client-side listeners this server delivers pushed callbacks to.
    callback_listeners: RwLock<HashMap<String, Arc<dyn InvokerCallbackHandler>>>,
    store_config: StoreConfig,
    workers: WorkerPool,
    accepting: AtomicBool,
    log: Logger,
}

impl Dispatcher {
    fn new(
        ctx: &Arc<Context>,
        locator: &Locator,
        config: &ServerConfig,
        marshaller: Arc<dyn Marshaller>,
        store_config: StoreConfig,
        log: &Logger,
    ) -> Dispatcher {
        Dispatcher {
            ctx: Arc::clone(ctx),
            locator: RwLock::new(locator.clone()),
            marshaller,
            handlers: RwLock::new(HashMap::new()),
            leases: LeaseTracker::new(config.lease_period, log),
            sessions: Mutex::new(HashMap::new()),
            callback_listeners: RwLock::new(HashMap::new()),
            store_config,
            workers: WorkerPool::new(config.max_pool_size, config.backlog),
            accepting: AtomicBool::new(false),
            log: log.new(o!("component" => "dispatcher")),
        }
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn marshaller(&self) -> &Arc<dyn Marshaller> {
        &self.marshaller
    }

    pub fn locator(&self) -> Locator {
        self.locator.read().clone()
    }

    pub fn leases(&self) -> &LeaseTracker {
        &self.leases
    }

    /// Decodes a request, dispatches it and encodes the response.  Never
    /// fails: decode and encode problems become failure responses.
    pub fn handle_bytes(&self, data: &[u8]) -> Bytes {
        let response = match self.marshaller.read(data, &Metadata::new()) {
            Ok(WireMessage::Request(request)) => self.dispatch(request),
            Ok(_) => InvocationResponse::failure(
                "",
                Failure {
                    kind: FailureKind::Protocol,
                    message: String::from("expected an invocation request"),
                },
            ),
            Err(e) => {
                warn!(self.log, "cannot decode request"; "error" => %e);
                InvocationResponse::failure("", e.to_failure())
            }
        };
        self.encode(response)
    }

    fn encode(&self, response: InvocationResponse) -> Bytes {
        let mut buf = BytesMut::new();
        match self.marshaller.write(&WireMessage::Response(response.clone()), &mut buf) {
            Ok(()) => buf.freeze(),
            Err(e) => {
                warn!(self.log, "cannot encode response"; "error" => %e);
                let failure = InvocationResponse::failure(&response.session_id, e.to_failure());
                let mut buf = BytesMut::new();
                match self.marshaller.write(&WireMessage::Response(failure), &mut buf) {
                    Ok(()) => buf.freeze(),
                    Err(_) => Bytes::new(),
                }
            }
        }
    }

    /// Dispatch for an in-process caller.
    pub fn dispatch_local(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(RemotingError::ConnectionFailed(format!(
                "server invoker at {} is not started",
                self.locator()
            )));
        }
        Ok(self.dispatch(request))
    }

    pub fn dispatch(&self, request: InvocationRequest) -> InvocationResponse {
        let session_id = request.session_id.clone();
        self.leases.touch(&session_id);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.route(request))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                debug!(self.log, "invocation failed"; "session" => &session_id, "error" => %e);
                Outcome::Failure(e.to_failure())
            }
            Err(_) => {
                error!(self.log, "invocation handler panicked"; "session" => &session_id);
                Outcome::Failure(Failure {
                    kind: FailureKind::Internal,
                    message: String::from("invocation handler panicked"),
                })
            }
        };
        InvocationResponse::new(&session_id, outcome)
    }

    fn route(&self, request: InvocationRequest) -> Result<Outcome> {
        if let Invocation::Internal(internal) = &request.invocation {
            let subsystem = request.subsystem.as_deref();
            return self
                .internal(&request.session_id, subsystem, internal.clone())
                .map(|v| Outcome::Return(Payload::Value(v)));
        }
        let handler = self.resolve(request.subsystem.as_deref())?;
        Ok(match handler.invoke(&request) {
            Ok(payload) => Outcome::Return(payload),
            Err(e) => Outcome::Application(e),
        })
    }

    fn resolve(&self, subsystem: Option<&str>) -> Result<Arc<dyn InvocationHandler>> {
        let handlers = self.handlers.read();
        let found = match subsystem {
            Some(name) => handlers.get(name).cloned(),
            // Without a subsystem, a lone handler takes everything.
            None if handlers.len() == 1 => handlers.values().next().cloned(),
            None => None,
        };
        found.ok_or_else(|| RemotingError::NoHandler(subsystem.map(str::to_string)))
    }

    fn internal(&self, session_id: &str, subsystem: Option<&str>, internal: InternalInvocation) -> Result<Value> {
        match internal {
            InternalInvocation::Ping { lease } => {
                if lease {
                    self.leases.renew(session_id);
                }
                Ok(json!({ "leasePeriod": self.leases.period().as_millis() as u64 }))
            }
            InternalInvocation::AddListener {
                listener_id,
                callback_locator,
                callback_handle,
            } => {
                self.add_listener(session_id, subsystem, &listener_id, callback_locator, callback_handle)?;
                Ok(Value::Null)
            }
            InternalInvocation::RemoveListener { listener_id } => {
                Ok(Value::Bool(self.remove_listener(session_id, &listener_id)))
            }
            InternalInvocation::GetCallbacks { listener_id } => {
                let callback = self
                    .sessions
                    .lock()
                    .get(session_id)
                    .and_then(|s| s.get(&listener_id))
                    .map(|r| Arc::clone(&r.callback))
                    .ok_or_else(|| {
                        RemotingError::InvalidState(format!("no listener {} registered", listener_id))
                    })?;
                let callbacks = callback.get_callbacks()?;
                serde_json::to_value(callbacks).map_err(RemotingError::serialization)
            }
            InternalInvocation::HandleCallback { listener_id, callback } => {
                let listener = self
                    .callback_listeners
                    .read()
                    .get(&listener_id)
                    .cloned()
                    .ok_or_else(|| RemotingError::NoHandler(Some(listener_id.clone())))?;
                listener.handle_callback(callback)?;
                Ok(Value::Null)
            }
            InternalInvocation::Disconnect => {
                self.leases.terminate(session_id);
                self.end_session(session_id);
                Ok(Value::Null)
            }
        }
    }

    fn add_listener(
        &self,
        session_id: &str,
        subsystem: Option<&str>,
        listener_id: &str,
        callback_locator: Option<Locator>,
        callback_handle: Option<Value>,
    ) -> Result<()> {
        let handler = self.resolve(subsystem)?;
        let registered = self
            .sessions
            .lock()
            .get(session_id)
            .map_or(false, |s| s.contains_key(listener_id));
        if registered {
            return Ok(());
        }

        let server_locator = self.locator();
        let callback = match callback_locator {
            Some(connector) => ServerInvokerCallbackHandler::push(
                &self.ctx,
                session_id,
                listener_id,
                &server_locator,
                &connector,
                callback_handle,
            )?,
            None => {
                let store = CallbackStore::new(
                    &format!("{}-{}", session_id, listener_id),
                    self.store_config.clone(),
                    Arc::clone(&self.marshaller),
                    &self.log,
                );
                ServerInvokerCallbackHandler::pull(
                    session_id,
                    listener_id,
                    &server_locator,
                    callback_handle,
                    store,
                    &self.log,
                )
            }
        };
        let callback = Arc::new(callback);
        let listener: Arc<dyn InvokerCallbackHandler> = callback.clone();
        handler.add_listener(Arc::clone(&listener));
        info!(self.log, "callback listener added"; "session" => session_id,
            "listener" => listener_id, "push" => callback.is_push());

        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(
                listener_id.to_string(),
                CallbackRegistration {
                    handler,
                    callback,
                    listener,
                },
            );
        Ok(())
    }

    fn remove_listener(&self, session_id: &str, listener_id: &str) -> bool {
        let registration = {
            let mut sessions = self.sessions.lock();
            let registration = sessions.get_mut(session_id).and_then(|s| s.remove(listener_id));
            if sessions.get(session_id).map_or(false, HashMap::is_empty) {
                sessions.remove(session_id);
            }
            registration
        };
        match registration {
            Some(r) => {
                Self::release(r);
                info!(self.log, "callback listener removed"; "session" => session_id,
                    "listener" => listener_id);
                true
            }
            None => false,
        }
    }

    fn release(registration: CallbackRegistration) {
        registration.handler.remove_listener(&registration.listener);
        registration.callback.destroy();
    }

    /// Drops every callback registration held for `session_id`.
    fn end_session(&self, session_id: &str) {
        let registrations = self.sessions.lock().remove(session_id);
        if let Some(registrations) = registrations {
            for (_, registration) in registrations {
                Self::release(registration);
            }
            debug!(self.log, "session ended"; "session" => session_id);
        }
    }

    /// Ends every session whose lease has lapsed.
    pub fn expire_leases(&self) {
        for lease in self.leases.take_expired(Instant::now()) {
            self.end_session(&lease.session_id);
            self.leases.notify_expired(&lease);
        }
    }

    pub fn callback_count(&self, session_id: &str) -> usize {
        self.sessions.lock().get(session_id).map_or(0, HashMap::len)
    }

    fn set_locator(&self, locator: Locator) {
        *self.locator.write() = locator;
    }

    fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    fn destroy(&self) {
        let sessions: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for session_id in sessions {
            self.end_session(&session_id);
        }
        self.leases.clear();
        self.handlers.write().clear();
        self.callback_listeners.write().clear();
    }
}

#[derive(Default)]
struct Running {
    runtime: Option<Runtime>,
    shutdown: Option<CancellationToken>,
    sweep: Option<TaskHandle>,
}

pub struct ServerInvoker {
    ctx: Arc<Context>,
    configured: Locator,
    config: Config,
    server_config: ServerConfig,
    transport: Box<dyn ServerTransport>,
    dispatcher: Arc<Dispatcher>,
    state: RwLock<ServerState>,
    running: Mutex<Running>,
    management: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    me: Weak<ServerInvoker>,
    log: Logger,
}

impl ServerInvoker {
    pub fn new(
        ctx: &Arc<Context>,
        locator: &Locator,
        config: Config,
        transport: Box<dyn ServerTransport>,
    ) -> Result<Arc<ServerInvoker>> {
        let server_config = ServerConfig::from_config(&config)?;
        let store_config = StoreConfig::from_config(&config)?;
        let marshaller = ctx.marshallers().for_config(&config)?;
        let log = ctx
            .log()
            .new(o!("component" => "server-invoker", "locator" => locator.to_string()));
        let dispatcher = Arc::new(Dispatcher::new(
            ctx,
            locator,
            &server_config,
            marshaller,
            store_config,
            &log,
        ));

        Ok(Arc::new_cyclic(|me| ServerInvoker {
            ctx: Arc::clone(ctx),
            configured: locator.clone(),
            config,
            server_config,
            transport,
            dispatcher,
            state: RwLock::new(ServerState::Created),
            running: Mutex::new(Running::default()),
            management: RwLock::new(None),
            me: me.clone(),
            log,
        }))
    }

    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    /// The bound locator once started, with the real port filled in.
    pub fn locator(&self) -> Locator {
        self.dispatcher.locator()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        match self.state() {
            ServerState::Started => return Ok(()),
            ServerState::Destroyed => {
                return Err(RemotingError::InvalidState(String::from(
                    "server invoker has been destroyed",
                )));
            }
            ServerState::Created | ServerState::Stopped => (),
        }
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| RemotingError::InvalidState(String::from("server invoker is being dropped")))?;
        let registry = self.ctx.registry();

        let explicit_port = self.configured.port() != 0;
        if explicit_port {
            registry.reserve_address(&self.configured, &me)?;
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(self.server_config.server_threads)
            .max_blocking_threads(self.server_config.max_pool_size + 1)
            .thread_name("remoting-server")
            .enable_all()
            .build();
        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(e) => {
                if explicit_port {
                    registry.release_address(&self.configured, self);
                }
                return Err(RemotingError::Io(e));
            }
        };

        let shutdown = CancellationToken::new();
        let bound = self.transport.start(
            &self.configured,
            runtime.handle(),
            Arc::clone(&self.dispatcher),
            shutdown.clone(),
        );
        let addr = match bound {
            Ok(addr) => addr,
            Err(e) => {
                if explicit_port {
                    registry.release_address(&self.configured, self);
                }
                runtime.shutdown_background();
                error!(self.log, "failed to start"; "error" => %e);
                return Err(e);
            }
        };

        let locator = self.configured.clone().with_port(addr.port());
        if !explicit_port {
            if let Err(e) = registry.reserve_address(&locator, &me) {
                shutdown.cancel();
                runtime.shutdown_background();
                return Err(e);
            }
        }
        self.dispatcher.set_locator(locator.clone());
        self.dispatcher.set_accepting(true);

        if self.dispatcher.leases.is_enabled() {
            let weak = Arc::downgrade(&self.dispatcher);
            let period = std::cmp::max(self.server_config.lease_period / 2, Duration::from_millis(1));
            running.sweep = Some(self.ctx.scheduler().schedule("lease-sweep", period, move || {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.expire_leases();
                }
            }));
        }

        running.runtime = Some(runtime);
        running.shutdown = Some(shutdown);
        *self.state.write() = ServerState::Started;
        info!(self.log, "server invoker started"; "locator" => %locator);
        Ok(())
    }

    /// Stops serving.  Configuration and handlers are kept; stopping a server
    /// that is not started does nothing.
    pub fn stop(&self) {
        let mut running = self.running.lock();
        if self.state() != ServerState::Started {
            return;
        }
        self.dispatcher.set_accepting(false);
        *self.state.write() = ServerState::Stopped;

        if let Some(sweep) = running.sweep.take() {
            sweep.cancel();
        }
        if let Some(shutdown) = running.shutdown.take() {
            shutdown.cancel();
        }
        if let Some(runtime) = running.runtime.take() {
            // Waiting for shutdown is not allowed on a runtime thread.
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.server_config.shutdown_timeout);
            }
        }
        self.ctx.registry().release_address(&self.locator(), self);
        info!(self.log, "server invoker stopped");
    }

    /// Stops the server and releases every handler and callback registration.
    pub fn destroy(&self) -> Result<()> {
        if self.state() == ServerState::Destroyed {
            return Err(RemotingError::InvalidState(String::from(
                "server invoker already destroyed",
            )));
        }
        self.stop();
        self.dispatcher.destroy();
        *self.state.write() = ServerState::Destroyed;
        info!(self.log, "server invoker destroyed");
        Ok(())
    }

    /// Registers `handler` for `subsystem`, replacing any previous handler.
    pub fn add_invocation_handler(&self, subsystem: &str, handler: Arc<dyn InvocationHandler>) {
        handler.set_invoker(self.me.clone());
        handler.set_management_server(self.management.read().clone());
        let previous = self
            .dispatcher
            .handlers
            .write()
            .insert(subsystem.to_string(), handler);
        if previous.is_some() {
            warn!(self.log, "replaced invocation handler"; "subsystem" => subsystem);
        }
    }

    pub fn remove_invocation_handler(&self, subsystem: &str) -> Option<Arc<dyn InvocationHandler>> {
        self.dispatcher.handlers.write().remove(subsystem)
    }

    pub fn subsystems(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dispatcher.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Hands a management handle to every current and future handler.
    pub fn set_management_server(&self, server: Option<Arc<dyn Any + Send + Sync>>) {
        *self.management.write() = server.clone();
        for handler in self.dispatcher.handlers.read().values() {
            handler.set_management_server(server.clone());
        }
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.dispatcher.leases.add_listener(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.dispatcher.leases.remove_listener(listener)
    }

    /// Routes pushed callbacks for `listener_id` to `handler`.  Used when this
    /// server acts as a client's callback connector.
    pub fn register_callback_listener(&self, listener_id: &str, handler: Arc<dyn InvokerCallbackHandler>) {
        self.dispatcher
            .callback_listeners
            .write()
            .insert(listener_id.to_string(), handler);
    }

    pub fn unregister_callback_listener(&self, listener_id: &str) -> bool {
        self.dispatcher
            .callback_listeners
            .write()
            .remove(listener_id)
            .is_some()
    }

    pub fn callback_listener_count(&self) -> usize {
        self.dispatcher.callback_listeners.read().len()
    }

    /// Callback registrations held for a client session.
    pub fn session_callback_count(&self, session_id: &str) -> usize {
        self.dispatcher.callback_count(session_id)
    }

    pub fn has_lease(&self, session_id: &str) -> bool {
        self.dispatcher.leases.is_active(session_id)
    }

    pub fn dispatch_local(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        self.dispatcher.dispatch_local(request)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl Drop for ServerInvoker {
    fn drop(&mut self) {
        let running = self.running.get_mut();
        if let Some(sweep) = running.sweep.take() {
            sweep.cancel();
        }
        if let Some(shutdown) = running.shutdown.take() {
            shutdown.cancel();
        }
        if let Some(runtime) = running.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Callback;
    use slog::Drain;

    struct Echo;

    impl InvocationHandler for Echo {
        fn invoke(&self, request: &InvocationRequest) -> std::result::Result<Payload, ApplicationError> {
            match request.payload() {
                Some(Payload::Value(Value::String(s))) if s == "fail" => Err(ApplicationError::new("asked to fail")),
                Some(Payload::Value(Value::String(s))) if s == "panic" => panic!("asked to panic"),
                Some(p) => Ok(p.clone()),
                None => Ok(Payload::null()),
            }
        }
    }

    fn context() -> Arc<Context> {
        Context::new(Some(&Logger::root(slog_stdlog::StdLog.fuse(), o!()))).unwrap()
    }

    fn server(ctx: &Arc<Context>, config: Config) -> Arc<ServerInvoker> {
        let locator = Locator::new("socket", "127.0.0.1", 0);
        let server = ctx.create_server_invoker(&locator, &config).unwrap();
        server.add_invocation_handler("echo", Arc::new(Echo));
        server
    }

    fn request(subsystem: Option<&str>, payload: &str) -> InvocationRequest {
        InvocationRequest::new("s1", subsystem, Invocation::Payload(Payload::from(payload)))
    }

    #[test]
    fn routes_by_subsystem() {
        let ctx = context();
        let server = server(&ctx, Config::new());
        let d = server.dispatcher();

        let response = d.dispatch(request(Some("echo"), "hi"));
        assert_eq!(response.outcome, Outcome::Return(Payload::from("hi")));

        // A lone handler also takes requests without a subsystem.
        let response = d.dispatch(request(None, "hi"));
        assert_eq!(response.outcome, Outcome::Return(Payload::from("hi")));

        match d.dispatch(request(Some("nope"), "hi")).outcome {
            Outcome::Failure(f) => assert_eq!(f.kind, FailureKind::NoHandler),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn handler_errors_and_panics() {
        let ctx = context();
        let server = server(&ctx, Config::new());
        let d = server.dispatcher();
        match d.dispatch(request(Some("echo"), "fail")).outcome {
            Outcome::Application(e) => assert_eq!(e.message, "asked to fail"),
            other => panic!("unexpected {:?}", other),
        }
        match d.dispatch(request(Some("echo"), "panic")).outcome {
            Outcome::Failure(f) => assert_eq!(f.kind, FailureKind::Internal),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_bytes_yield_a_failure_response() {
        let ctx = context();
        let server = server(&ctx, Config::new());
        let reply = server.dispatcher().handle_bytes(b"not a request");
        match server.dispatcher().marshaller().read(&reply, &Metadata::new()).unwrap() {
            WireMessage::Response(r) => match r.outcome {
                Outcome::Failure(f) => assert_eq!(f.kind, FailureKind::Serialization),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn lifecycle() {
        let ctx = context();
        let server = server(&ctx, Config::new());
        assert_eq!(server.state(), ServerState::Created);
        assert!(server.dispatch_local(request(None, "x")).is_err());

        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Started);
        assert_ne!(server.locator().port(), 0);
        assert!(ctx.registry().find_server(&server.locator()).is_some());
        server.start().unwrap();

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(ctx.registry().find_server(&server.locator()).is_none());
        server.stop();

        server.start().unwrap();
        assert_eq!(server.subsystems(), vec![String::from("echo")]);
        server.destroy().unwrap();
        assert!(server.destroy().is_err());
        assert!(server.start().is_err());
    }

    #[test]
    fn pull_listeners_follow_the_session() {
        let ctx = context();
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new().with(keys::CALLBACK_STORE_DIR, dir.path().display());
        let server = server(&ctx, config);
        let d = server.dispatcher();

        let add = InternalInvocation::AddListener {
            listener_id: String::from("l1"),
            callback_locator: None,
            callback_handle: Some(json!("h")),
        };
        let mut req = InvocationRequest::internal("s1", add);
        req.subsystem = Some(String::from("echo"));
        d.dispatch(req.clone());
        d.dispatch(req);
        assert_eq!(server.session_callback_count("s1"), 1);

        let registered = d.sessions.lock()["s1"]["l1"].listener.clone();
        registered.handle_callback(Callback::new(json!(1))).unwrap();

        let get = InvocationRequest::internal("s1", InternalInvocation::GetCallbacks {
            listener_id: String::from("l1"),
        });
        let callbacks: Vec<Callback> = match d.dispatch(get).outcome {
            Outcome::Return(p) => serde_json::from_value(p.into_value().unwrap()).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0].handle, Some(json!("h")));
        assert!(callbacks[0].server_locator.is_some());

        d.dispatch(InvocationRequest::internal("s1", InternalInvocation::Disconnect));
        assert_eq!(server.session_callback_count("s1"), 0);
    }

    #[test]
    fn busy_when_backlog_is_full() {
        let pool = Arc::new(WorkerPool::new(1, 0));
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (tx, rx) = std::sync::mpsc::channel::<()>();
            let p = Arc::clone(&pool);
            let first = tokio::spawn(async move { p.run(move || rx.recv().is_ok()).await });
            while pool.available() > 0 {
                tokio::task::yield_now().await;
            }
            match pool.run(|| ()).await {
                Err(RemotingError::ServerBusy(_)) => (),
                other => panic!("unexpected {:?}", other),
            }
            tx.send(()).unwrap();
            assert!(first.await.unwrap().unwrap());
        });
    }
}
