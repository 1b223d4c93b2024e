//! UDP discovery responder.
//!
//! Clients scanning a LAN send `fkDetectServer` and expect `me` back; a
//! follow-up `fkGetDetail,<token>` returns a JSON array describing the
//! server, echoing the token so the client can match answers to probes.

use serde_json::json;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::handle::MainHandle;

/// Version tag reported in detail replies.
pub const VERSION_TAG: &str = concat!(env!("CARGO_PKG_VERSION"), "-tokio");

const DETECT: &[u8] = b"fkDetectServer";
const DETAIL_PREFIX: &[u8] = b"fkGetDetail,";

/// What a detail reply needs from the main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSummary {
    pub icon_url: String,
    pub description: String,
    pub capacity: usize,
    pub online: usize,
}

/// Kind of probe a datagram carries.
#[derive(Debug, PartialEq, Eq)]
pub enum Probe<'a> {
    Detect,
    Detail(&'a str),
}

pub fn parse_probe(datagram: &[u8]) -> Option<Probe<'_>> {
    if datagram == DETECT {
        return Some(Probe::Detect);
    }
    let token = datagram.strip_prefix(DETAIL_PREFIX)?;
    std::str::from_utf8(token).ok().map(Probe::Detail)
}

pub fn detail_reply(summary: &ServerSummary, token: &str) -> Vec<u8> {
    json!([
        VERSION_TAG,
        summary.icon_url,
        summary.description,
        summary.capacity,
        summary.online,
        token,
    ])
    .to_string()
    .into_bytes()
}

/// Answers probes until shutdown.
pub async fn run_discovery(
    socket: UdpSocket,
    main: MainHandle,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = socket.local_addr() {
        info!("📡 Discovery listening on udp://{}", addr);
    }
    let mut buf = [0u8; 1024];

    loop {
        let (n, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("Discovery receive failed: {}", e);
                    continue;
                }
            },
        };

        let reply = match parse_probe(&buf[..n]) {
            Some(Probe::Detect) => b"me".to_vec(),
            Some(Probe::Detail(token)) => {
                let token = token.to_string();
                match main.call(|state| state.summary()).await {
                    Ok(summary) => detail_reply(&summary, &token),
                    Err(e) => {
                        warn!("Discovery could not read server state: {}", e);
                        continue;
                    }
                }
            }
            None => {
                debug!("Ignoring {} byte datagram from {}", n, peer);
                continue;
            }
        };

        if let Err(e) = socket.send_to(&reply, peer).await {
            debug!("Discovery reply to {} failed: {}", peer, e);
        }
    }
}
