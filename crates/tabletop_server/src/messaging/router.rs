//! Per-connection request/reply/notification multiplexer.
//!
//! A [`Router`] wraps a [`ConnectionHandle`] and tracks at most one
//! outstanding server-to-client request. Issuing a new request replaces the
//! previous expectation, so callers that need several requests in flight must
//! serialize them; this matches how game rules use it (one pending question
//! per player at a time).

use bytes::Bytes;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::ServerError;
use crate::protocol::packet_type::*;
use crate::protocol::{Record, NOTIFICATION_ID};

/// Request ids wrap back to 1 past this value.
pub const MAX_REQUEST_ID: i32 = 10_000_000;

/// Outcome of [`Router::wait_for_reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The matching reply payload.
    Ready(Bytes),
    /// No reply arrived within the wait.
    NotReady,
    /// The request was aborted or the session cannot receive replies.
    Cancelled,
}

impl Reply {
    /// Wire form used when handing the outcome to the rule engine.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Reply::Ready(payload) => payload,
            Reply::NotReady => Bytes::from_static(b"__notready"),
            Reply::Cancelled => Bytes::from_static(b"__cancel"),
        }
    }
}

/// What an incoming record means to the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    Notification { command: Bytes, payload: Bytes },
    Request { id: i32, command: Bytes, payload: Bytes },
}

#[derive(Debug)]
struct ReplyState {
    expected_id: Option<i32>,
    issued_at: Instant,
    timeout_ms: i32,
    reply: Option<Bytes>,
    accepting: bool,
    aborted: bool,
}

/// Per-connection protocol multiplexer. Shared as `Arc<Router>`.
pub struct Router {
    connection: ConnectionHandle,
    last_id: AtomicI32,
    state: Mutex<ReplyState>,
    reply_ready: Notify,
}

impl Router {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            last_id: AtomicI32::new(0),
            state: Mutex::new(ReplyState {
                expected_id: None,
                issued_at: Instant::now(),
                timeout_ms: -1,
                reply: None,
                accepting: true,
                aborted: false,
            }),
            reply_ready: Notify::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReplyState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, record: &Record) -> Result<(), ServerError> {
        let frame = record.to_bytes()?;
        if self.connection.send(frame) {
            Ok(())
        } else {
            Err(ServerError::Network(format!(
                "{} is closed",
                self.connection.id()
            )))
        }
    }

    /// Sends a one-way server notification.
    pub fn notify(
        &self,
        type_mask: i32,
        command: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<(), ServerError> {
        self.send(&Record::new(NOTIFICATION_ID, type_mask, command, payload))
    }

    /// Notification from the server to the client.
    pub fn notify_client(
        &self,
        command: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<(), ServerError> {
        self.notify(NOTIFICATION | SRC_SERVER | DEST_CLIENT, command, payload)
    }

    fn next_id(&self) -> i32 {
        let mut current = self.last_id.load(Ordering::Relaxed);
        loop {
            let next = if current >= MAX_REQUEST_ID { 1 } else { current + 1 };
            match self.last_id.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Sends a request and starts expecting its reply.
    ///
    /// `timeout_ms < 0` means the reply never expires. A `timestamp_ms` of
    /// `None` stamps the record with the current wall clock time.
    pub fn request(
        &self,
        type_mask: i32,
        command: impl Into<Bytes>,
        payload: impl Into<Bytes>,
        timeout_ms: i32,
        timestamp_ms: Option<i64>,
    ) -> Result<i32, ServerError> {
        let id = self.next_id();
        {
            let mut state = self.lock();
            state.expected_id = Some(id);
            state.issued_at = Instant::now();
            state.timeout_ms = timeout_ms;
            state.reply = None;
            state.aborted = false;
        }

        let timestamp_ms = timestamp_ms.filter(|t| *t > 0).unwrap_or_else(unix_millis);
        let record = Record::new(id, type_mask, command, payload).with_timing(timeout_ms, timestamp_ms);
        self.send(&record)?;
        Ok(id)
    }

    /// Interprets an incoming record.
    ///
    /// Notifications and requests are surfaced to the caller. Replies are
    /// absorbed here: a reply is kept only when it matches the outstanding
    /// request id and arrives before that request's deadline.
    pub fn handle_record(&self, record: Record) -> Option<RouterEvent> {
        if record.has(NOTIFICATION) {
            return Some(RouterEvent::Notification {
                command: record.command,
                payload: record.payload,
            });
        }

        if record.has(REPLY) {
            let mut state = self.lock();
            if !state.accepting || state.expected_id != Some(record.request_id) {
                trace!(
                    "Dropping reply {} on {} (expected {:?})",
                    record.request_id,
                    self.connection.id(),
                    state.expected_id
                );
                return None;
            }
            state.expected_id = None;

            if state.timeout_ms >= 0
                && state.issued_at.elapsed() > Duration::from_millis(state.timeout_ms as u64)
            {
                debug!(
                    "Reply {} on {} arrived after its deadline",
                    record.request_id,
                    self.connection.id()
                );
                return None;
            }

            state.reply = Some(record.payload);
            drop(state);
            self.reply_ready.notify_waiters();
            return None;
        }

        if record.has(REQUEST) {
            return Some(RouterEvent::Request {
                id: record.request_id,
                command: record.command,
                payload: record.payload,
            });
        }

        None
    }

    /// Waits until the outstanding request is answered, aborted, or `timeout`
    /// elapses.
    pub async fn wait_for_reply(&self, timeout: Duration) -> Reply {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.reply_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if !state.accepting || state.aborted {
                    return Reply::Cancelled;
                }
                if let Some(reply) = &state.reply {
                    return Reply::Ready(reply.clone());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Reply::NotReady;
            }
        }
    }

    /// Last stored reply payload, if any.
    pub fn last_reply(&self) -> Option<Bytes> {
        self.lock().reply.clone()
    }

    /// Clears the outstanding expectation and releases any waiter.
    pub fn abort_request(&self) {
        {
            let mut state = self.lock();
            if state.expected_id.take().is_some() {
                state.aborted = true;
            }
        }
        self.reply_ready.notify_waiters();
    }

    /// Enables or disables reply delivery. A disabled router drops every
    /// reply and cancels waits, which is how offline sessions behave.
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
        if !accepting {
            self.abort_request();
        }
    }

    pub fn expected_id(&self) -> Option<i32> {
        self.lock().expected_id
    }
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
