//! Host-side handlers for calls issued by the rule engine.
//!
//! Handlers run on the scheduler thread that owns the engine. Anything that
//! touches players goes through the [`MainHandle`]; effects that need no
//! answer are posted from the synchronous part of the handler so they reach
//! the main loop in the order the engine issued them.

use bytes::Bytes;
use std::future::ready;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionId;
use crate::engine::HandlerTable;
use crate::messaging::Reply;
use crate::protocol::packet_type::*;
use crate::protocol::rpc::{RpcCall, RpcValue};
use crate::scheduler::LoopContext;
use crate::server::MainHandle;

/// Engine to host method names.
pub mod names {
    pub const Q_DEBUG: &str = "qDebug";
    pub const Q_INFO: &str = "qInfo";
    pub const Q_WARNING: &str = "qWarning";
    pub const Q_CRITICAL: &str = "qCritical";
    pub const PRINT: &str = "print";
    pub const PLAYER_DO_NOTIFY: &str = "Player_doNotify";
    pub const PLAYER_DO_REQUEST: &str = "Player_doRequest";
    pub const PLAYER_WAIT_FOR_REPLY: &str = "Player_waitForReply";
    pub const PLAYER_THINKING: &str = "Player_thinking";
    pub const PLAYER_SET_THINKING: &str = "Player_setThinking";
    pub const PLAYER_SET_DIED: &str = "Player_setDied";
    pub const PLAYER_EMIT_KICK: &str = "Player_emitKick";
    pub const ROOM_DELAY: &str = "Room_delay";
    pub const ROOM_SET_REQUEST_TIMER: &str = "Room_setRequestTimer";
    pub const ROOM_DESTROY_REQUEST_TIMER: &str = "Room_destroyRequestTimer";
    pub const SERVER_TEMPORARILY_BAN: &str = "Server_temporarilyBan";
    pub const ROOM_GAME_OVER: &str = "Room_gameOver";
}

use names::*;

type Outcome = Result<RpcValue, String>;

fn param<'a>(call: &'a RpcCall, index: usize) -> Result<&'a RpcValue, String> {
    call.param(index)
        .ok_or_else(|| format!("{}: missing parameter {}", call.method, index + 1))
}

fn int_param(call: &RpcCall, index: usize) -> Result<i64, String> {
    param(call, index)?
        .as_int()
        .ok_or_else(|| format!("{}: parameter {} must be an integer", call.method, index + 1))
}

fn i32_param(call: &RpcCall, index: usize) -> Result<i32, String> {
    i32::try_from(int_param(call, index)?)
        .map_err(|_| format!("{}: parameter {} is out of range", call.method, index + 1))
}

fn connection_param(call: &RpcCall, index: usize) -> Result<ConnectionId, String> {
    i32_param(call, index).map(ConnectionId)
}

fn bytes_param(call: &RpcCall, index: usize) -> Result<Bytes, String> {
    param(call, index)?
        .as_bytes()
        .ok_or_else(|| format!("{}: parameter {} must be a string", call.method, index + 1))
}

fn bool_param(call: &RpcCall, index: usize) -> Result<bool, String> {
    param(call, index)?
        .as_bool()
        .ok_or_else(|| format!("{}: parameter {} must be a boolean", call.method, index + 1))
}

fn log_text(call: &RpcCall) -> String {
    call.params
        .iter()
        .filter_map(RpcValue::as_text)
        .collect::<Vec<_>>()
        .join(" ")
}

fn register_log(handlers: &mut HandlerTable, method: &str, emit: fn(&str)) {
    handlers.register(method, move |call: RpcCall| {
        emit(&log_text(&call));
        ready(Ok(RpcValue::Null))
    });
}

/// Registers `effect` as a handler whose whole work happens at dispatch.
fn register_sync<F>(handlers: &mut HandlerTable, method: &str, main: &MainHandle, effect: F)
where
    F: Fn(&MainHandle, &RpcCall) -> Outcome + Send + Sync + 'static,
{
    let main = main.clone();
    handlers.register(method, move |call: RpcCall| ready(effect(&main, &call)));
}

fn do_notify(main: &MainHandle, call: &RpcCall) -> Outcome {
    let connection = connection_param(call, 0)?;
    let command = bytes_param(call, 1)?;
    let payload = bytes_param(call, 2)?;
    main.post(move |state| {
        if let Some(router) = state.router_for(connection) {
            if let Err(e) = router.notify_client(command, payload) {
                debug!("Notify to {} dropped: {}", connection, e);
            }
        }
    });
    Ok(RpcValue::Null)
}

/// `(connId, command, payload, timeoutMs[, timestampMs])`
fn do_request(main: &MainHandle, call: &RpcCall) -> Outcome {
    let connection = connection_param(call, 0)?;
    let command = bytes_param(call, 1)?;
    let payload = bytes_param(call, 2)?;
    let timeout_ms = i32_param(call, 3)?;
    let timestamp_ms = match call.param(4) {
        None | Some(RpcValue::Null) => None,
        Some(_) => Some(int_param(call, 4)?),
    };
    main.post(move |state| {
        if let Some(router) = state.router_for(connection) {
            let sent = router.request(
                REQUEST | SRC_SERVER | DEST_CLIENT,
                command,
                payload,
                timeout_ms,
                timestamp_ms,
            );
            if let Err(e) = sent {
                debug!("Request to {} dropped: {}", connection, e);
            }
        }
    });
    Ok(RpcValue::Null)
}

fn set_flag(main: &MainHandle, call: &RpcCall, died: bool) -> Outcome {
    let connection = connection_param(call, 0)?;
    let value = bool_param(call, 1)?;
    main.post(move |state| {
        if let Some(session) = state.session_mut(connection) {
            if died {
                session.died = value;
            } else {
                session.thinking = value;
            }
        }
    });
    Ok(RpcValue::Null)
}

fn emit_kick(main: &MainHandle, call: &RpcCall) -> Outcome {
    let connection = connection_param(call, 0)?;
    main.post(move |state| state.kick(connection));
    Ok(RpcValue::Null)
}

fn temporarily_ban(main: &MainHandle, call: &RpcCall) -> Outcome {
    let connection = connection_param(call, 0)?;
    main.post(move |state| state.temporarily_ban(connection));
    Ok(RpcValue::Null)
}

fn loop_context(call: &RpcCall) -> Result<Rc<LoopContext>, String> {
    LoopContext::current().ok_or_else(|| format!("{}: not on a scheduler thread", call.method))
}

/// `(roomId, ms)` with a positive `ms`.
fn room_timer_params(call: &RpcCall) -> Result<(i32, u64), String> {
    let room_id = i32_param(call, 0)?;
    let ms = int_param(call, 1)?;
    if ms <= 0 {
        return Err(format!("{}: delay must be positive, got {}", call.method, ms));
    }
    Ok((room_id, ms as u64))
}

fn room_delay(_main: &MainHandle, call: &RpcCall) -> Outcome {
    let (room_id, ms) = room_timer_params(call)?;
    loop_context(call)?.delay(room_id, ms);
    Ok(RpcValue::Null)
}

fn room_set_request_timer(_main: &MainHandle, call: &RpcCall) -> Outcome {
    let (room_id, ms) = room_timer_params(call)?;
    loop_context(call)?.set_request_timer(room_id, ms);
    Ok(RpcValue::Null)
}

fn room_destroy_request_timer(_main: &MainHandle, call: &RpcCall) -> Outcome {
    let room_id = i32_param(call, 0)?;
    let destroyed = loop_context(call)?.destroy_request_timer(room_id);
    Ok(RpcValue::Bool(destroyed))
}

/// The dispatch table every scheduler's engine talks to.
pub fn host_handlers(main: MainHandle) -> HandlerTable {
    let mut handlers = HandlerTable::new();

    register_log(&mut handlers, Q_DEBUG, |text| debug!(target: "engine", "{}", text));
    register_log(&mut handlers, Q_INFO, |text| info!(target: "engine", "{}", text));
    register_log(&mut handlers, PRINT, |text| info!(target: "engine", "{}", text));
    register_log(&mut handlers, Q_WARNING, |text| warn!(target: "engine", "{}", text));
    register_log(&mut handlers, Q_CRITICAL, |text| error!(target: "engine", "{}", text));

    register_sync(&mut handlers, PLAYER_DO_NOTIFY, &main, do_notify);
    register_sync(&mut handlers, PLAYER_DO_REQUEST, &main, do_request);
    register_sync(&mut handlers, PLAYER_SET_THINKING, &main, |main, call| {
        set_flag(main, call, false)
    });
    register_sync(&mut handlers, PLAYER_SET_DIED, &main, |main, call| {
        set_flag(main, call, true)
    });
    register_sync(&mut handlers, PLAYER_EMIT_KICK, &main, emit_kick);
    register_sync(&mut handlers, SERVER_TEMPORARILY_BAN, &main, temporarily_ban);
    register_sync(&mut handlers, ROOM_DELAY, &main, room_delay);
    register_sync(&mut handlers, ROOM_SET_REQUEST_TIMER, &main, room_set_request_timer);
    register_sync(&mut handlers, ROOM_DESTROY_REQUEST_TIMER, &main, room_destroy_request_timer);

    {
        let main = main.clone();
        handlers.register(PLAYER_WAIT_FOR_REPLY, move |call: RpcCall| {
            let parsed = connection_param(&call, 0).and_then(|connection| {
                let ms = int_param(&call, 1)?;
                u64::try_from(ms)
                    .map(|ms| (connection, Duration::from_millis(ms)))
                    .map_err(|_| format!("{}: timeout must not be negative", call.method))
            });
            let main = main.clone();
            async move {
                let (connection, timeout) = parsed?;
                let router = main
                    .call(move |state| state.router_for(connection))
                    .await
                    .map_err(|e| e.to_string())?;
                let reply = match router {
                    Some(router) => router.wait_for_reply(timeout).await,
                    None => Reply::Cancelled,
                };
                Ok(RpcValue::Bytes(reply.into_bytes()))
            }
        });
    }

    {
        let main = main.clone();
        handlers.register(PLAYER_THINKING, move |call: RpcCall| {
            let parsed = connection_param(&call, 0);
            let main = main.clone();
            async move {
                let connection = parsed?;
                main.call(move |state| state.session(connection).map(|s| s.thinking))
                    .await
                    .map_err(|e| e.to_string())?
                    .map(RpcValue::Bool)
                    .ok_or_else(|| format!("{connection} is not signed in"))
            }
        });
    }

    handlers.register(ROOM_GAME_OVER, move |call: RpcCall| {
        let parsed = i32_param(&call, 0);
        let main = main.clone();
        async move {
            let room_id = parsed?;
            main.call(move |state| state.finish_room(room_id))
                .await
                .and_then(|finished| finished)
                .map_err(|e| e.to_string())?;
            Ok(RpcValue::Null)
        }
    });

    handlers
}
