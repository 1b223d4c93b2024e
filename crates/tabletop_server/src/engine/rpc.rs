//! Bidirectional RPC over a pair of byte streams.
//!
//! An [`RpcEndpoint`] owns a reader task and a writer task on the current
//! `LocalSet`, so every read and write of the underlying streams happens on
//! the thread that created it. Incoming calls are dispatched through a
//! [`HandlerTable`]; outgoing calls are one-way.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::BridgeError;
use crate::protocol::rpc::{RpcCall, RpcCodec, RpcPacket, RpcValue, ONE_WAY};

pub type HandlerFuture = BoxFuture<'static, Result<RpcValue, String>>;
pub type RpcHandler = Arc<dyn Fn(RpcCall) -> HandlerFuture + Send + Sync>;

/// Method name to handler mapping.
///
/// A handler runs its synchronous part as soon as the call is read, in
/// arrival order; only the returned future is awaited concurrently.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, RpcHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(RpcCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcValue, String>> + Send + 'static,
    {
        let handler: RpcHandler =
            Arc::new(move |call: RpcCall| -> HandlerFuture { Box::pin(handler(call)) });
        self.handlers.insert(method.to_string(), handler);
    }

    pub fn get(&self, method: &str) -> Option<RpcHandler> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.handlers.keys().collect();
        methods.sort();
        f.debug_struct("HandlerTable").field("methods", &methods).finish()
    }
}

/// One side of an RPC channel.
pub struct RpcEndpoint {
    outgoing: mpsc::UnboundedSender<RpcPacket>,
    alive: Arc<AtomicBool>,
    closing: CancellationToken,
    lost: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcEndpoint {
    /// Starts the endpoint. Must be called from within a `LocalSet`.
    pub fn spawn<R, W>(reader: R, writer: W, handlers: HandlerTable) -> Self
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let closing = CancellationToken::new();
        let lost = CancellationToken::new();

        let writer = tokio::task::spawn_local(write_loop(
            writer,
            outgoing_rx,
            closing.clone(),
            alive.clone(),
            lost.clone(),
        ));
        let reader = tokio::task::spawn_local(read_loop(
            reader,
            handlers,
            outgoing.clone(),
            alive.clone(),
            lost.clone(),
        ));

        Self {
            outgoing,
            alive,
            closing,
            lost,
            reader,
            writer,
        }
    }

    /// Sends a one-way call.
    pub fn send(&self, method: &str, params: Vec<RpcValue>) -> Result<(), BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::Closed);
        }
        let call = RpcCall {
            id: ONE_WAY,
            method: method.to_string(),
            params,
        };
        self.outgoing
            .send(RpcPacket::Call(call))
            .map_err(|_| BridgeError::Closed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Cancelled when the peer goes away on its own: EOF, a corrupt stream
    /// or a failed write. A local [`RpcEndpoint::close`] does not trigger it.
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Shared liveness flag, readable from other threads.
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// Writes out everything queued so far, closes the write side and stops
    /// reading.
    pub async fn close(self, flush_timeout: Duration) {
        self.closing.cancel();
        if tokio::time::timeout(flush_timeout, self.writer).await.is_err() {
            warn!("RPC writer did not finish within {:?}", flush_timeout);
        }
        self.reader.abort();
        self.alive.store(false, Ordering::Release);
    }
}

async fn read_loop<R>(
    reader: R,
    handlers: HandlerTable,
    outgoing: mpsc::UnboundedSender<RpcPacket>,
    alive: Arc<AtomicBool>,
    lost: CancellationToken,
) where
    R: AsyncRead + Unpin + 'static,
{
    let mut frames = FramedRead::new(reader, RpcCodec::new());

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(RpcPacket::Call(call)) => dispatch(&handlers, call, &outgoing),
            Ok(RpcPacket::Reply { id, .. }) => debug!("Ignoring unsolicited RPC reply {}", id),
            Ok(RpcPacket::Error { id, message }) => {
                warn!("RPC peer reported error for call {}: {}", id, message)
            }
            Err(e) => {
                error!("❌ RPC stream is corrupt: {}", e);
                break;
            }
        }
    }

    debug!("RPC read side closed");
    alive.store(false, Ordering::Release);
    lost.cancel();
}

fn dispatch(handlers: &HandlerTable, call: RpcCall, outgoing: &mpsc::UnboundedSender<RpcPacket>) {
    let id = call.id;
    let Some(handler) = handlers.get(&call.method) else {
        warn!("No RPC handler for method '{}'", call.method);
        if id >= 0 {
            let _ = outgoing.send(RpcPacket::Error {
                id,
                message: format!("unknown method {}", call.method),
            });
        }
        return;
    };

    let method = call.method.clone();
    let pending = handler(call);
    let outgoing = outgoing.clone();
    tokio::task::spawn_local(async move {
        let result = pending.await;
        if id < 0 {
            if let Err(message) = result {
                warn!("RPC handler '{}' failed: {}", method, message);
            }
            return;
        }
        let packet = match result {
            Ok(result) => RpcPacket::Reply { id, result },
            Err(message) => RpcPacket::Error { id, message },
        };
        let _ = outgoing.send(packet);
    });
}

async fn write_loop<W>(
    writer: W,
    mut outgoing: mpsc::UnboundedReceiver<RpcPacket>,
    closing: CancellationToken,
    alive: Arc<AtomicBool>,
    lost: CancellationToken,
) where
    W: AsyncWrite + Unpin + 'static,
{
    let mut sink = FramedWrite::new(writer, RpcCodec::new());

    loop {
        let packet = tokio::select! {
            biased;
            packet = outgoing.recv() => packet,
            _ = closing.cancelled() => {
                while let Ok(packet) = outgoing.try_recv() {
                    if sink.feed(packet).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };

        let Some(packet) = packet else { break };
        if let Err(e) = sink.send(packet).await {
            error!("❌ RPC write failed: {}", e);
            alive.store(false, Ordering::Release);
            lost.cancel();
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("RPC writer close: {}", e);
    }
}
