// Copyright 2020 Joyent, Inc.

//! Socket transport.
//!
//! Each invocation is one request frame and one response frame on a pooled
//! TCP connection, using the framing in `protocol`.  The client side is
//! blocking; the server side runs one tokio task per accepted connection and
//! hands each request to the dispatcher's worker pool.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use slog::{debug, error, info, o, trace, warn, Logger};
use tokio::runtime::Handle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::Context;
use crate::error::{RemotingError, Result};
use crate::invocation::{InvocationRequest, InvocationResponse, Metadata};
use crate::locator::Locator;
use crate::marshal::{Marshaller, WireMessage};
use crate::pool::{ConnectionPool, PoolConfig, PoolKey, Poolable};
use crate::protocol::{self, Frame, FrameKind, FrameStatus, MessageId, RemotingCodec};
use crate::server::Dispatcher;
use crate::transport::{with_retries, ClientConfig, ClientInvoker, InvokerState, Lifecycle, ServerTransport};

/// One pooled client connection.
pub struct SocketConnection {
    stream: TcpStream,
    codec: RemotingCodec,
    read_buf: BytesMut,
    ids: MessageId,
}

impl SocketConnection {
    pub fn connect(addr: &SocketAddr, connect_timeout: Duration, max_frame_size: usize) -> Result<SocketConnection> {
        let stream = TcpStream::connect_timeout(addr, connect_timeout).map_err(|source| {
            RemotingError::CannotConnect {
                locator: addr.to_string(),
                source,
            }
        })?;
        stream.set_nodelay(true)?;
        Ok(SocketConnection {
            stream,
            codec: RemotingCodec::new(max_frame_size),
            read_buf: BytesMut::new(),
            ids: MessageId::new(),
        })
    }

    /// Sends one request and waits up to `timeout` for its response.
    pub fn call(&mut self, data: Bytes, timeout: Duration) -> Result<Frame> {
        let id = self.ids.next_id();
        self.stream.set_write_timeout(Some(timeout))?;
        protocol::send(Frame::request(id, data), &mut self.codec, &mut self.stream)?;
        let frame = protocol::receive(&mut self.stream, &mut self.codec, &mut self.read_buf, timeout)?;
        if frame.id != id || frame.kind != FrameKind::Response {
            return Err(RemotingError::Protocol(format!(
                "expected response to message {}, got {:?} for {}",
                id, frame.kind, frame.id
            )));
        }
        Ok(frame)
    }
}

impl Poolable for SocketConnection {
    /// A connection is reusable when the peer has not closed it and nothing
    /// unsolicited is waiting to be read.
    fn is_open(&mut self) -> bool {
        if !self.read_buf.is_empty() {
            return false;
        }
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0; 1];
        let open = match self.stream.peek(&mut byte) {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
            _ => false,
        };
        self.stream.set_nonblocking(false).is_ok() && open
    }
}

pub struct SocketClientInvoker {
    ctx: Arc<Context>,
    locator: Locator,
    client_config: ClientConfig,
    pool_config: PoolConfig,
    key: PoolKey,
    marshaller: Arc<dyn Marshaller>,
    lifecycle: Lifecycle,
    pool: Mutex<Option<Arc<ConnectionPool<SocketConnection>>>>,
    log: Logger,
}

impl SocketClientInvoker {
    pub fn new(ctx: &Arc<Context>, locator: &Locator, config: &Config) -> Result<SocketClientInvoker> {
        Ok(SocketClientInvoker {
            ctx: Arc::clone(ctx),
            locator: locator.clone(),
            client_config: ClientConfig::from_config(config)?,
            pool_config: PoolConfig::from_config(config)?,
            key: PoolKey::new(locator, config),
            marshaller: ctx.marshallers().for_config(config)?,
            lifecycle: Lifecycle::new(),
            pool: Mutex::new(None),
            log: ctx.log().new(o!("component" => "socket-client", "locator" => locator.to_string())),
        })
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    fn open(&self) -> Result<SocketConnection> {
        let addr = self.locator.socket_addr()?;
        SocketConnection::connect(&addr, self.client_config.connect_timeout, self.client_config.max_frame_size)
    }

    fn attempt(&self, pool: &ConnectionPool<SocketConnection>, data: &Bytes, fresh: bool) -> Result<Bytes> {
        let mut pooled = pool.checkout(fresh, || self.open())?;
        match pooled.conn().call(data.clone(), self.client_config.timeout) {
            Ok(frame) => {
                pool.checkin(pooled);
                match frame.status {
                    FrameStatus::Data => Ok(frame.data),
                    FrameStatus::Busy => Err(RemotingError::ServerBusy(self.locator.address())),
                    FrameStatus::Error => Err(RemotingError::Protocol(
                        String::from_utf8_lossy(&frame.data).into_owned(),
                    )),
                }
            }
            Err(e) => {
                // The stream may hold a late response; never reuse it.
                pool.discard(pooled);
                Err(e)
            }
        }
    }
}

impl ClientInvoker for SocketClientInvoker {
    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn state(&self) -> InvokerState {
        self.lifecycle.state()
    }

    fn connect(&self) -> Result<()> {
        self.lifecycle.connect_with(|| {
            let pools = self.ctx.socket_pools();
            let pool = pools.acquire(self.key.clone(), self.pool_config.clone(), Some(self.ctx.scheduler()));
            match pool.checkout(false, || self.open()) {
                Ok(pooled) => pool.checkin(pooled),
                Err(e) => {
                    pools.release(&self.key);
                    warn!(self.log, "connect failed"; "error" => %e);
                    return Err(RemotingError::ConnectionFailed(format!(
                        "cannot connect to {}: {}",
                        self.locator, e
                    )));
                }
            }
            *self.pool.lock() = Some(pool);
            info!(self.log, "connected"; "pool" => %self.key);
            Ok(())
        })
    }

    fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        self.lifecycle.check_connected()?;
        let pool = self.pool.lock().clone().ok_or_else(|| {
            RemotingError::InvalidState(String::from("invoker is not connected"))
        })?;

        let mut buf = BytesMut::new();
        self.marshaller.write(&WireMessage::Request(request), &mut buf)?;
        let data = buf.freeze();

        let reply = with_retries(self.client_config.retries, &self.log, |attempt| {
            self.attempt(&pool, &data, attempt > 0)
        })?;

        match self.marshaller.read(&reply, &Metadata::new())? {
            WireMessage::Response(response) => Ok(response),
            _ => Err(RemotingError::Protocol(String::from(
                "expected an invocation response",
            ))),
        }
    }

    fn disconnect(&self) {
        self.lifecycle.disconnect_with(|| {
            self.pool.lock().take();
            self.ctx.socket_pools().release(&self.key);
            debug!(self.log, "disconnected");
        });
    }
}

impl Drop for SocketClientInvoker {
    fn drop(&mut self) {
        self.disconnect();
    }
}

pub fn create_client_invoker(ctx: &Arc<Context>, locator: &Locator, config: &Config) -> Result<Arc<dyn ClientInvoker>> {
    Ok(Arc::new(SocketClientInvoker::new(ctx, locator, config)?))
}

pub fn create_server_transport(
    ctx: &Arc<Context>,
    locator: &Locator,
    config: &Config,
) -> Result<Box<dyn ServerTransport>> {
    let client = ClientConfig::from_config(config)?;
    Ok(Box::new(SocketServerTransport {
        max_frame_size: client.max_frame_size,
        log: ctx.log().new(o!("component" => "socket-server", "locator" => locator.to_string())),
    }))
}

pub struct SocketServerTransport {
    max_frame_size: usize,
    log: Logger,
}

impl ServerTransport for SocketServerTransport {
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
        let max_frame_size = self.max_frame_size;
        let log = self.log.clone();
        info!(log, "listening for invocations"; "address" => %addr);

        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let conn_log = log.new(o!("peer" => peer.to_string()));
                            let _ = stream.set_nodelay(true);
                            tokio::spawn(process(
                                stream,
                                max_frame_size,
                                Arc::clone(&dispatcher),
                                shutdown.clone(),
                                conn_log,
                            ));
                        }
                        Err(e) => {
                            error!(log, "accept failed"; "error" => %e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
            info!(log, "stopped listening"; "address" => %addr);
        });

        Ok(addr)
    }
}

/// Serves one connection until the peer closes it or `shutdown` fires.
pub async fn process(
    stream: tokio::net::TcpStream,
    max_frame_size: usize,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    log: Logger,
) {
    let (mut tx, mut rx) = Framed::new(stream, RemotingCodec::new(max_frame_size)).split();
    debug!(log, "accepted connection");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(log, "closing connection after bad frame"; "error" => %e);
                break;
            }
            None => break,
        };
        if frame.kind != FrameKind::Request {
            warn!(log, "ignoring non-request frame"; "msgid" => frame.id);
            continue;
        }
        let response = respond(frame, &dispatcher, &log).await;
        if let Err(e) = tx.send(response).await {
            warn!(log, "failed to write response"; "error" => %e);
            break;
        }
    }
    trace!(log, "connection closed");
}

/// Runs one request frame through the dispatcher and frames the result.
pub async fn respond(frame: Frame, dispatcher: &Arc<Dispatcher>, log: &Logger) -> Frame {
    let id = frame.id;
    let data = frame.data;
    let d = Arc::clone(dispatcher);
    match dispatcher.workers().run(move || d.handle_bytes(&data)).await {
        Ok(reply) => Frame::response(id, reply),
        Err(RemotingError::ServerBusy(reason)) => {
            debug!(log, "rejecting request"; "msgid" => id, "reason" => reason);
            Frame::busy(id)
        }
        Err(e) => {
            error!(log, "request failed"; "msgid" => id, "error" => %e);
            Frame::error(id, &e.to_string())
        }
    }
}
