// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use slog::{o, Drain, Level, LevelFilter, Logger};

use fast_remoting::callback::InvokerCallbackHandler;
use fast_remoting::config::Config;
use fast_remoting::invocation::{Invocation, MethodCall};
use fast_remoting::{
    ApplicationError, Callback, Context, InvocationHandler, InvocationRequest, Locator, Payload,
    RemotingError, ServerInvoker,
};

pub fn logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn context() -> Arc<Context> {
    Context::new(Some(&logger())).expect("failed to create context")
}

/// A loopback port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    listener.local_addr().expect("no local address").port()
}

/// Polls `check` until it holds or `timeout` passes.
pub fn wait_for<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// Echoes payloads and implements a handful of test methods.
#[derive(Default)]
pub struct TestHandler {
    listeners: Mutex<Vec<Arc<dyn InvokerCallbackHandler>>>,
}

impl TestHandler {
    fn listeners(&self) -> Vec<Arc<dyn InvokerCallbackHandler>> {
        self.listeners.lock().unwrap().clone()
    }

    fn deliver(&self, payload: Value) -> Result<(), ApplicationError> {
        for listener in self.listeners() {
            listener
                .handle_callback(Callback::new(payload.clone()))
                .map_err(|e| ApplicationError::new(e.to_string()))?;
        }
        Ok(())
    }

    fn method(&self, m: &MethodCall) -> Result<Payload, ApplicationError> {
        let arg = m.params.get(0).cloned().unwrap_or(Value::Null);
        match m.name.as_str() {
            "broadcast" => {
                self.deliver(arg)?;
                Ok(json!(self.listeners().len()).into())
            }
            "emit" => {
                for i in 0..arg.as_u64().unwrap_or(0) {
                    self.deliver(json!(i))?;
                }
                Ok(Payload::null())
            }
            "opaque" => {
                let callback = Callback::new(Payload::opaque(Mutex::new(0u8)));
                let mut outcome = "delivered";
                for listener in self.listeners() {
                    match listener.handle_callback(callback.clone()) {
                        Ok(()) => (),
                        Err(RemotingError::Serialization(_)) => outcome = "serialization",
                        Err(e) => return Err(ApplicationError::new(e.to_string())),
                    }
                }
                Ok(outcome.into())
            }
            "sleep" => {
                thread::sleep(Duration::from_millis(arg.as_u64().unwrap_or(0)));
                Ok(Payload::null())
            }
            "fail" => Err(ApplicationError::with_detail(
                "bad request",
                json!({ "code": 42 }).into(),
            )),
            other => Err(ApplicationError::new(format!("Unsupported function: {}", other))),
        }
    }
}

impl InvocationHandler for TestHandler {
    fn invoke(&self, request: &InvocationRequest) -> Result<Payload, ApplicationError> {
        match &request.invocation {
            Invocation::Payload(p) => Ok(p.clone()),
            Invocation::Method(m) => self.method(m),
            Invocation::Internal(_) => Ok(Payload::null()),
        }
    }

    fn add_listener(&self, listener: Arc<dyn InvokerCallbackHandler>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn InvokerCallbackHandler>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }
}

/// Counts callbacks and remembers the payloads.
#[derive(Default)]
pub struct Recorder {
    pub count: AtomicUsize,
    pub payloads: Mutex<Vec<Payload>>,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl InvokerCallbackHandler for Recorder {
    fn handle_callback(&self, callback: Callback) -> fast_remoting::Result<()> {
        self.payloads.lock().unwrap().push(callback.payload);
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Starts a server with a `TestHandler` on `locator`.
pub fn start_server(ctx: &Arc<Context>, locator: &Locator, config: &Config) -> Arc<ServerInvoker> {
    let server = ctx
        .create_server_invoker(locator, config)
        .expect("failed to create server invoker");
    server.add_invocation_handler("test", Arc::new(TestHandler::default()));
    server.start().expect("failed to start server invoker");
    server
}
