// Copyright 2020 Joyent, Inc.

//! HTTP transport.
//!
//! Every invocation is a POST whose body is the marshalled request; the
//! response body is the marshalled response.  A server with no free worker
//! answers 503.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes as BodyBytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::BytesMut;
use parking_lot::Mutex;
use slog::{debug, error, info, o, Logger};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::Context;
use crate::error::{RemotingError, Result};
use crate::invocation::{InternalInvocation, InvocationRequest, InvocationResponse, Metadata};
use crate::locator::Locator;
use crate::marshal::{Marshaller, WireMessage};
use crate::server::Dispatcher;
use crate::transport::{with_retries, ClientConfig, ClientInvoker, InvokerState, Lifecycle, ServerTransport};

fn transport_error(e: reqwest::Error, timeout: Duration) -> RemotingError {
    if e.is_timeout() {
        RemotingError::Timeout(timeout)
    } else {
        RemotingError::ConnectionFailed(e.to_string())
    }
}

pub struct HttpClientInvoker {
    locator: Locator,
    url: String,
    client_config: ClientConfig,
    marshaller: Arc<dyn Marshaller>,
    lifecycle: Lifecycle,
    client: Mutex<Option<reqwest::blocking::Client>>,
    log: Logger,
}

impl HttpClientInvoker {
    pub fn new(ctx: &Arc<Context>, locator: &Locator, config: &Config) -> Result<HttpClientInvoker> {
        Ok(HttpClientInvoker {
            url: format!("http://{}/{}", locator.address(), locator.path()),
            locator: locator.clone(),
            client_config: ClientConfig::from_config(config)?,
            marshaller: ctx.marshallers().for_config(config)?,
            lifecycle: Lifecycle::new(),
            client: Mutex::new(None),
            log: ctx.log().new(o!("component" => "http-client", "locator" => locator.to_string())),
        })
    }

    fn post(&self, client: &reqwest::blocking::Client, body: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.client_config.timeout;
        let response = client
            .post(&self.url)
            .header(header::CONTENT_TYPE.as_str(), self.marshaller.content_type())
            .body(body.to_vec())
            .send()
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if status.as_u16() == StatusCode::SERVICE_UNAVAILABLE.as_u16() {
            return Err(RemotingError::ServerBusy(self.locator.address()));
        }
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(RemotingError::Protocol(format!("HTTP {}: {}", status, text)));
        }
        let bytes = response.bytes().map_err(|e| transport_error(e, timeout))?;
        Ok(bytes.to_vec())
    }
}

impl HttpClientInvoker {
    /// One ping without lease renewal.  A busy server is still reachable.
    fn check_reachable(&self, client: &reqwest::blocking::Client) -> Result<()> {
        let ping = InvocationRequest::internal("", InternalInvocation::Ping { lease: false });
        let mut buf = BytesMut::new();
        self.marshaller.write(&WireMessage::Request(ping), &mut buf)?;
        match self.post(client, &buf) {
            Ok(_) | Err(RemotingError::ServerBusy(_)) => Ok(()),
            Err(e) => {
                debug!(self.log, "server unreachable"; "url" => &self.url, "error" => %e);
                Err(RemotingError::ConnectionFailed(format!("{}: {}", self.url, e)))
            }
        }
    }
}

impl ClientInvoker for HttpClientInvoker {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn state(&self) -> InvokerState {
        self.lifecycle.state()
    }

    fn connect(&self) -> Result<()> {
        self.lifecycle.connect_with(|| {
            let client = reqwest::blocking::Client::builder()
                .timeout(self.client_config.timeout)
                .connect_timeout(self.client_config.connect_timeout)
                .build()
                .map_err(|e| RemotingError::InvalidConfiguration(e.to_string()))?;
            self.check_reachable(&client)?;
            *self.client.lock() = Some(client);
            debug!(self.log, "connected"; "url" => &self.url);
            Ok(())
        })
    }

    fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        self.lifecycle.check_connected()?;
        let client = self.client.lock().clone().ok_or_else(|| {
            RemotingError::InvalidState(String::from("invoker is not connected"))
        })?;

        let mut buf = BytesMut::new();
        self.marshaller.write(&WireMessage::Request(request), &mut buf)?;
        let reply = with_retries(self.client_config.retries, &self.log, |_| self.post(&client, &buf))?;

        match self.marshaller.read(&reply, &Metadata::new())? {
            WireMessage::Response(response) => Ok(response),
            _ => Err(RemotingError::Protocol(String::from(
                "expected an invocation response",
            ))),
        }
    }

    fn disconnect(&self) {
        self.lifecycle.disconnect_with(|| {
            self.client.lock().take();
        });
    }
}

pub fn create_client_invoker(ctx: &Arc<Context>, locator: &Locator, config: &Config) -> Result<Arc<dyn ClientInvoker>> {
    Ok(Arc::new(HttpClientInvoker::new(ctx, locator, config)?))
}

pub fn create_server_transport(
    ctx: &Arc<Context>,
    locator: &Locator,
    config: &Config,
) -> Result<Box<dyn ServerTransport>> {
    let client = ClientConfig::from_config(config)?;
    Ok(Box::new(HttpServerTransport {
        max_body_size: client.max_frame_size,
        log: ctx.log().new(o!("component" => "http-server", "locator" => locator.to_string())),
    }))
}

pub struct HttpServerTransport {
    max_body_size: usize,
    log: Logger,
}

impl ServerTransport for HttpServerTransport {
    fn start(
        &self,
        locator: &Locator,
        runtime: &Handle,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Result<SocketAddr> {
        let std_listener = std::net::TcpListener::bind(locator.socket_addr()?)?;
        std_listener.set_nonblocking(true)?;
        let addr = std_listener.local_addr()?;

        let _guard = runtime.enter();
        let listener = tokio::net::TcpListener::from_std(std_listener)?;
        let app = Router::new()
            .fallback(serve_invocation)
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .with_state(dispatcher);

        let log = self.log.clone();
        info!(log, "listening for invocations"; "address" => %addr);
        runtime.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(log, "http server failed"; "error" => %e);
            }
            info!(log, "stopped listening"; "address" => %addr);
        });

        Ok(addr)
    }
}

async fn serve_invocation(State(dispatcher): State<Arc<Dispatcher>>, body: BodyBytes) -> Response {
    let content_type = dispatcher.marshaller().content_type().to_string();
    let d = Arc::clone(&dispatcher);
    match dispatcher.workers().run(move || d.handle_bytes(&body)).await {
        Ok(reply) => ([(header::CONTENT_TYPE, content_type)], reply).into_response(),
        Err(RemotingError::ServerBusy(reason)) => (StatusCode::SERVICE_UNAVAILABLE, reason).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
