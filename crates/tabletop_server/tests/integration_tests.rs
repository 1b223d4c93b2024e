//! End-to-end tests against a running server.
//!
//! Each test starts a [`GameServer`] on its own fixed local ports, talks to it
//! over real TCP and UDP sockets and shuts it down again. The rule engine is a
//! `/bin/sh` one-liner that greets and then echoes its input.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tabletop_server::protocol::packet_type::*;
use tabletop_server::protocol::payload::{as_i32, as_string, decode_array, encode};
use tabletop_server::protocol::{Record, RecordCodec, NOTIFICATION_ID};
use tabletop_server::server::discovery::VERSION_TAG;
use tabletop_server::{BundleProvider, DirectoryBundle, EngineConfig, GameServer, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct TestServer {
    server: Arc<GameServer>,
    running: JoinHandle<Result<(), tabletop_server::ServerError>>,
    fingerprint: String,
    port: u16,
    _dir: tempfile::TempDir,
}

fn create_test_config(dir: &Path, port: u16) -> ServerConfig {
    ServerConfig {
        bind_address: format!("127.0.0.1:{}", port).parse().unwrap(),
        discovery_address: format!("127.0.0.1:{}", port).parse().unwrap(),
        signup_timeout: Duration::from_secs(5),
        main_call_timeout: Duration::from_secs(2),
        settings_path: dir.join("settings.json"),
        bundle_directory: dir.join("bundle"),
        engine: EngineConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo ready; exec cat".to_string()],
            handshake_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        },
    }
}

async fn start_server(port: u16) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("bundle")).unwrap();
    std::fs::write(dir.path().join("bundle").join("init.lua"), "return {}").unwrap();
    std::fs::write(
        dir.path().join("settings.json"),
        r#"{ "description": "integration", "capacity": 8, "motd": "hi" }"#,
    )
    .unwrap();

    let fingerprint = DirectoryBundle::new(dir.path().join("bundle"))
        .fingerprint()
        .unwrap();
    let server = Arc::new(GameServer::new(create_test_config(dir.path(), port)));
    let running = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    TestServer {
        server,
        running,
        fingerprint,
        port,
        _dir: dir,
    }
}

impl TestServer {
    async fn connect(&self) -> Client {
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", self.port)).await {
                return Client {
                    stream,
                    codec: RecordCodec::new(),
                    queue: VecDeque::new(),
                };
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server never started listening on {}", self.port);
    }

    async fn stop(self) {
        self.server.shutdown();
        timeout(Duration::from_secs(10), self.running)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

struct Client {
    stream: TcpStream,
    codec: RecordCodec,
    queue: VecDeque<Record>,
}

impl Client {
    async fn next(&mut self) -> Record {
        let mut buf = [0u8; 4096];
        while self.queue.is_empty() {
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("no message within 5s")
                .unwrap();
            assert!(n > 0, "connection closed early");
            self.queue.extend(self.codec.feed(&buf[..n]).unwrap());
        }
        self.queue.pop_front().unwrap()
    }

    async fn expect(&mut self, command: &str) -> Record {
        let record = self.next().await;
        assert_eq!(
            String::from_utf8_lossy(&record.command),
            command,
            "unexpected command"
        );
        record
    }

    async fn notify(&mut self, command: &str, payload: bytes::Bytes) {
        let record = Record::new(
            NOTIFICATION_ID,
            NOTIFICATION | SRC_CLIENT | DEST_SERVER,
            command.to_string().into_bytes(),
            payload,
        );
        self.stream
            .write_all(&record.to_bytes().unwrap())
            .await
            .unwrap();
    }

    async fn assert_closed(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("connection stayed open")
                .unwrap_or(0);
            if n == 0 {
                return;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_connection_receives_delay_test() {
    let server = start_server(19611).await;
    let mut client = server.connect().await;

    let greeting = client.expect("NetworkDelayTest").await;
    assert_eq!(greeting.request_id, NOTIFICATION_ID);
    assert!(greeting.has(NOTIFICATION));
    assert!(greeting.has(DEST_CLIENT));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_setup_is_rejected_and_closed() {
    let server = start_server(19612).await;
    let mut client = server.connect().await;
    client.expect("NetworkDelayTest").await;

    client.notify("Setup", encode(&["only", "two"]).unwrap()).await;
    let error = client.expect("ErrorDlg").await;
    assert_eq!(error.payload, encode("INVALID SETUP STRING").unwrap());
    client.assert_closed().await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_bundle_is_rejected() {
    let server = start_server(19613).await;
    let mut client = server.connect().await;
    client.expect("NetworkDelayTest").await;

    let payload = encode(&["carol", "pw", "0000", "0.1.0", "device-9"]).unwrap();
    client.notify("Setup", payload).await;
    let error = client.expect("ErrorDlg").await;
    assert_eq!(error.payload, encode("MD5 check failed!").unwrap());
    client.assert_closed().await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_valid_setup_then_create_room() {
    let server = start_server(19614).await;
    let mut client = server.connect().await;
    client.expect("NetworkDelayTest").await;

    let payload = encode(&["dora", "pw", server.fingerprint.as_str(), "0.1.0", "device-1"]).unwrap();
    client.notify("Setup", payload).await;

    let setup = client.expect("Setup").await;
    let fields = decode_array(&setup.payload).unwrap();
    assert_eq!(as_string(&fields[1]).as_deref(), Some("dora"));
    let settings = client.expect("SetServerSettings").await;
    let fields = decode_array(&settings.payload).unwrap();
    assert_eq!(as_string(&fields[0]).as_deref(), Some("hi"));

    client.notify("CreateRoom", encode(&["table one"]).unwrap()).await;
    let entered = client.expect("EnterRoom").await;
    let fields = decode_array(&entered.payload).unwrap();
    assert_eq!(as_i32(&fields[0]), Some(1));
    assert_eq!(as_string(&fields[1]).as_deref(), Some("table one"));

    let rooms = server
        .server
        .main_handle()
        .call(|state| (state.room_count(), state.scheduler_count()))
        .await
        .unwrap();
    assert_eq!(rooms, (1, 1));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_udp_discovery() {
    let server = start_server(19615).await;
    // wait until the listener (and with it the discovery socket) is up
    let _client = server.connect().await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(("127.0.0.1", server.port)).await.unwrap();
    let mut buf = [0u8; 1024];

    let mut answer = None;
    for _ in 0..20 {
        socket.send(b"fkDetectServer").await.unwrap();
        if let Ok(Ok(n)) = timeout(Duration::from_millis(200), socket.recv(&mut buf)).await {
            answer = Some(buf[..n].to_vec());
            break;
        }
    }
    assert_eq!(answer.as_deref(), Some(&b"me"[..]));

    socket.send(b"fkGetDetail,probe-7").await.unwrap();
    let n = timeout(Duration::from_secs(5), socket.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let detail: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
    assert_eq!(
        detail,
        serde_json::json!([VERSION_TAG, "default", "integration", 8, 0, "probe-7"])
    );

    server.stop().await;
}
