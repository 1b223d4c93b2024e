//! Client connections.
//!
//! Each accepted socket is split into a reader task and a writer task. The
//! reader feeds raw chunks to a [`RecordCodec`] and forwards decoded records
//! to the main loop as [`ConnectionEvent`]s; the writer drains a queue of
//! encoded frames. Any thread may hold a [`ConnectionHandle`] and send through
//! it, since every write goes through the writer task's queue.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{Record, RecordCodec};

/// Size of one socket read.
pub const READ_CHUNK: usize = 32 * 1024;

/// Identifies a client connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub i32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a connection reports to the main loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    Record(ConnectionId, Record),
    Closed(ConnectionId),
}

enum Outgoing {
    Frame(Bytes),
    Close,
}

/// Sending side of a connection. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues an encoded frame. Returns `false` once the connection is gone.
    pub fn send(&self, frame: Bytes) -> bool {
        self.outgoing.send(Outgoing::Frame(frame)).is_ok()
    }

    /// Flushes frames queued so far, then closes the socket.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Starts the reader and writer tasks for an accepted socket.
///
/// Records are delivered on `events` in receipt order, followed by exactly
/// one [`ConnectionEvent::Closed`].
pub fn spawn_connection(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectionHandle {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    tokio::spawn(write_loop(id, writer, outgoing_rx, cancel.clone()));
    tokio::spawn(read_loop(id, reader, events, cancel));

    ConnectionHandle {
        id,
        peer,
        outgoing: outgoing_tx,
    }
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    let mut codec = RecordCodec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!("🔌 {} closed by peer", id);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("🔌 {} read error: {}", id, e);
                break;
            }
        };

        match codec.feed(&chunk[..n]) {
            Ok(records) => {
                for record in records {
                    if events.send(ConnectionEvent::Record(id, record)).is_err() {
                        cancel.cancel();
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("❌ {} sent malformed data: {}", id, e);
                break;
            }
        }

        if let Some(e) = codec.take_error() {
            warn!("❌ {} sent malformed data: {}", id, e);
            break;
        }
    }

    cancel.cancel();
    let _ = events.send(ConnectionEvent::Closed(id));
}

/// Writes queued frames until `Close`. When the reader stops first, nothing
/// new is accepted but frames already queued are still flushed.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    cancel: CancellationToken,
) {
    let mut draining = false;
    loop {
        let next = tokio::select! {
            next = outgoing.recv() => Some(next),
            _ = cancel.cancelled(), if !draining => None,
        };
        let Some(next) = next else {
            outgoing.close();
            draining = true;
            continue;
        };

        match next {
            Some(Outgoing::Frame(frame)) => {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!("🔌 {} write error: {}", id, e);
                    break;
                }
            }
            Some(Outgoing::Close) | None => break,
        }
    }

    let _ = writer.shutdown().await;
    cancel.cancel();
}
