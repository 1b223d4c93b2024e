//! Registries owned by the main loop.
//!
//! [`ServerState`] holds every connection, session, room and scheduler. It is
//! only ever touched from the main loop task; other threads reach it through
//! [`MainHandle`].

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bundle::BundleProvider;
use crate::config::{ServerConfig, ServerSettings};
use crate::connection::{spawn_connection, ConnectionEvent, ConnectionId};
use crate::engine::HandlerTable;
use crate::error::ServerError;
use crate::messaging::router::unix_millis;
use crate::messaging::{Router, RouterEvent};
use crate::player::{PlayerState, Session, LOBBY_ROOM};
use crate::protocol::payload::encode;
use crate::protocol::Record;
use crate::scheduler::{Scheduler, SchedulerPool};
use crate::server::auth::{AuthOutcome, Authenticator, SetupData};
use crate::server::discovery::ServerSummary;
use crate::server::handle::MainHandle;
use crate::server::lobby::Lobby;

/// External collaborators consulted by the server.
#[derive(Clone)]
pub struct Collaborators {
    pub bundle: Arc<dyn BundleProvider>,
    pub authenticator: Arc<dyn Authenticator>,
    pub lobby: Arc<dyn Lobby>,
}

/// A room and the scheduler hosting it for its whole lifetime.
pub struct Room {
    pub id: i32,
    pub name: String,
    pub scheduler: Arc<Scheduler>,
    pub players: Vec<ConnectionId>,
    pub observers: Vec<ConnectionId>,
}

pub struct ServerState {
    config: ServerConfig,
    settings: ServerSettings,
    fingerprint: String,
    collaborators: Collaborators,
    main: MainHandle,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_connection_id: i32,
    /// Connections that have not completed `Setup` yet
    pending: HashMap<ConnectionId, Arc<Router>>,
    sessions: HashMap<ConnectionId, Session>,
    rooms: BTreeMap<i32, Room>,
    next_room_id: i32,
    pool: SchedulerPool,
    /// Addresses refused at sign-up until the stored instant
    temp_bans: HashMap<IpAddr, Instant>,
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

fn error_payload(message: &str) -> Bytes {
    encode(message).unwrap_or_else(|_| Bytes::copy_from_slice(message.as_bytes()))
}

/// Shows `message` in an error dialog and drops the connection.
fn reject(router: &Router, message: &str) {
    let _ = router.notify_client("ErrorDlg", error_payload(message));
    router.connection().close();
}

impl ServerState {
    /// Loads the settings document and fingerprints the bundle. Either
    /// failing aborts startup.
    pub(crate) fn new(
        config: ServerConfig,
        collaborators: Collaborators,
        main: MainHandle,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        handlers: HandlerTable,
    ) -> Result<Self, ServerError> {
        let settings = ServerSettings::load(&config.settings_path)?;
        let fingerprint = collaborators.bundle.fingerprint()?;
        info!(
            "📦 Rule bundle at {} (fingerprint {})",
            collaborators.bundle.directory().display(),
            short(&fingerprint)
        );
        let lost = main.clone();
        let pool = SchedulerPool::new(config.engine.clone(), handlers).with_engine_lost(Arc::new(
            move |scheduler_id| {
                lost.post(move |state| state.scheduler_failed(scheduler_id));
            },
        ));

        Ok(Self {
            config,
            settings,
            fingerprint,
            collaborators,
            main,
            events,
            next_connection_id: 0,
            pending: HashMap::new(),
            sessions: HashMap::new(),
            rooms: BTreeMap::new(),
            next_room_id: 1,
            pool,
            temp_bans: HashMap::new(),
        })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn session(&self, connection: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection)
    }

    pub fn session_mut(&mut self, connection: ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(&connection)
    }

    pub fn router_for(&self, connection: ConnectionId) -> Option<Arc<Router>> {
        self.sessions
            .get(&connection)
            .map(|session| session.router.clone())
    }

    pub fn room(&self, room_id: i32) -> Option<&Room> {
        self.rooms.get(&room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn scheduler_count(&self) -> usize {
        self.pool.len()
    }

    pub fn online_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_online()).count()
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            icon_url: self.settings.icon_url.clone(),
            description: self.settings.description.clone(),
            capacity: self.settings.capacity,
            online: self.online_count(),
        }
    }

    /// Registers a freshly accepted socket, sends the delay test and starts
    /// the sign-up timer.
    pub(crate) fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.next_connection_id = self.next_connection_id.checked_add(1).unwrap_or(1);
        let id = ConnectionId(self.next_connection_id);
        let router = Arc::new(Router::new(spawn_connection(
            id,
            stream,
            peer,
            self.events.clone(),
        )));
        info!("🔗 {} connected from {}", id, peer);

        let public_key = self.collaborators.authenticator.public_key();
        if let Err(e) = router.notify_client("NetworkDelayTest", public_key) {
            debug!("{} left before the delay test: {}", id, e);
        }
        self.pending.insert(id, router);

        let main = self.main.clone();
        let limit = self.config.signup_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            main.post(move |state| state.expire_signup(id));
        });
    }

    fn expire_signup(&mut self, id: ConnectionId) {
        if let Some(router) = self.pending.remove(&id) {
            info!("⏰ {} did not sign up in time", id);
            router.connection().close();
        }
    }

    pub(crate) fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Record(id, record) => {
                if let Some(router) = self.pending.remove(&id) {
                    self.handle_setup(router, record);
                } else {
                    self.route(id, record);
                }
            }
            ConnectionEvent::Closed(id) => self.on_closed(id),
        }
    }

    fn handle_setup(&mut self, router: Arc<Router>, record: Record) {
        let id = router.connection_id();
        let setup = match SetupData::parse(&record) {
            Ok(setup) => setup,
            Err(message) => {
                warn!("❌ {} sent an invalid setup", id);
                return reject(&router, message);
            }
        };

        if let Err(message) = self.admit(&setup, router.connection().peer().ip()) {
            info!("🚫 Refused {} ({}): {}", setup.name, id, message);
            return reject(&router, message);
        }

        match self.collaborators.authenticator.authenticate(&setup) {
            Ok(outcome) => self.sign_up(router, setup, outcome),
            Err(message) => {
                info!("🚫 Refused {} ({}): {}", setup.name, id, message);
                reject(&router, &message);
            }
        }
    }

    fn admit(&mut self, setup: &SetupData, address: IpAddr) -> Result<(), &'static str> {
        let now = Instant::now();
        self.temp_bans.retain(|_, until| *until > now);
        if self.temp_bans.contains_key(&address) {
            return Err("you have been temporarily banned!");
        }
        if self.settings.is_banned_name(&setup.name) {
            return Err("invalid user name");
        }
        if self.sessions.len() >= self.settings.capacity {
            return Err("server is full!");
        }
        let on_device = self
            .sessions
            .values()
            .filter(|session| session.device == setup.uuid)
            .count();
        if on_device >= self.settings.max_players_per_device {
            return Err("cannot register more new users on this device");
        }
        if setup.md5 != self.fingerprint {
            return Err("MD5 check failed!");
        }
        Ok(())
    }

    fn sign_up(&mut self, router: Arc<Router>, setup: SetupData, outcome: AuthOutcome) {
        let id = router.connection_id();
        if self
            .sessions
            .values()
            .any(|session| session.player_id == outcome.player_id)
        {
            info!("🚫 Player {} is already signed in", outcome.player_id);
            return reject(&router, "others logged in with this name");
        }

        let greeted = encode(&(
            outcome.player_id,
            &setup.name,
            &outcome.avatar,
            unix_millis(),
        ))
        .and_then(|payload| router.notify_client("Setup", payload))
        .and_then(|()| {
            encode(&(
                &self.settings.motd,
                &self.settings.hidden_packs,
                self.settings.enable_bots,
            ))
        })
        .and_then(|payload| router.notify_client("SetServerSettings", payload));
        if let Err(e) = greeted {
            warn!("Could not greet {}: {}", id, e);
            router.connection().close();
            return;
        }

        info!(
            "🎮 {} signed up as player {} ({})",
            id, outcome.player_id, setup.name
        );
        self.sessions.insert(
            id,
            Session {
                router,
                player_id: outcome.player_id,
                name: setup.name,
                avatar: outcome.avatar,
                device: setup.uuid,
                state: PlayerState::Online,
                room_id: LOBBY_ROOM,
                observing: None,
                thinking: false,
                died: false,
            },
        );

        let lobby = self.collaborators.lobby.clone();
        let main = self.main.clone();
        tokio::spawn(async move { lobby.on_enter(main, id).await });
    }

    /// Lobby traffic goes to the [`Lobby`]; everything else to the room's
    /// scheduler.
    fn route(&mut self, id: ConnectionId, record: Record) {
        let Some(session) = self.sessions.get(&id) else {
            debug!("Dropping record from unknown {}", id);
            return;
        };
        let (command, payload) = match session.router.handle_record(record) {
            Some(RouterEvent::Notification { command, payload })
            | Some(RouterEvent::Request {
                command, payload, ..
            }) => (command, payload),
            None => return,
        };

        if session.in_lobby() {
            let lobby = self.collaborators.lobby.clone();
            let main = self.main.clone();
            tokio::spawn(async move { lobby.on_message(main, id, command, payload).await });
            return;
        }

        let observing = session.observing;
        let room_id = observing.unwrap_or(session.room_id);
        if observing.is_some() && &command[..] == b"QuitRoom" {
            self.stop_observing(id);
            return;
        }

        match self.rooms.get(&room_id) {
            Some(room) => room.scheduler.push_request(room_id, id.0, command, payload),
            None => warn!("{} talks to missing room {}", id, room_id),
        }
    }

    fn on_closed(&mut self, id: ConnectionId) {
        if self.pending.remove(&id).is_some() {
            debug!("🔌 {} closed before signing up", id);
            return;
        }
        if self
            .sessions
            .get(&id)
            .is_some_and(|session| session.observing.is_some())
        {
            self.stop_observing(id);
        }

        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        info!("👋 {} ({}) disconnected", session.name, id);
        session.router.set_accepting(false);

        let room_id = session.room_id;
        if room_id == LOBBY_ROOM {
            self.sessions.remove(&id);
            return;
        }

        // Seated players stay registered so the game can continue without them.
        session.state = PlayerState::Offline;
        if let Some(room) = self.rooms.get(&room_id) {
            room.scheduler
                .set_player_state(room_id, id.0, PlayerState::Offline);
            room.scheduler.wake_up(room_id, "player_disconnect");
        }
        self.check_abandoned(room_id);
    }

    /// A room whose seated players are all offline is woken with reason
    /// `abandon`. On a stale or dead engine nobody would answer, so the room
    /// is finished right away.
    fn check_abandoned(&mut self, room_id: i32) {
        let Some(room) = self.rooms.get(&room_id) else {
            return;
        };
        let abandoned = room.players.iter().all(|connection| {
            self.sessions
                .get(connection)
                .map_or(true, |session| !session.is_online())
        });
        if !abandoned {
            return;
        }

        let scheduler = room.scheduler.clone();
        if scheduler.is_alive() && !scheduler.is_outdated(&self.fingerprint) {
            info!("🏚️ Room {} abandoned", room_id);
            scheduler.wake_up(room_id, "abandon");
        } else {
            info!("🏚️ Room {} abandoned on scheduler {}, closing it", room_id, scheduler.id());
            let _ = self.finish_room(room_id);
        }
    }

    fn lobby_session(&self, connection: ConnectionId) -> Result<&Session, ServerError> {
        let session = self
            .sessions
            .get(&connection)
            .ok_or_else(|| ServerError::Refused(format!("{connection} has not signed up")))?;
        if !session.in_lobby() {
            return Err(ServerError::Refused(format!(
                "{connection} is already in a room"
            )));
        }
        Ok(session)
    }

    /// Places a new room on a scheduler with spare capacity and seats its
    /// owner.
    pub fn create_room(&mut self, owner: ConnectionId, name: String) -> Result<i32, ServerError> {
        self.lobby_session(owner)?;
        let announcement = encode(&name)?;

        self.pool.sweep(&self.fingerprint);
        let directory = self.collaborators.bundle.directory();
        let (scheduler, fresh) = self.pool.acquire(
            &self.fingerprint,
            &directory,
            self.settings.rooms_per_scheduler(),
        )?;
        if fresh {
            self.watch_startup(scheduler.clone());
        }
        scheduler.increase_ref_count();

        let room_id = self.next_room_id;
        self.next_room_id += 1;
        scheduler.push_request(room_id, -1, Bytes::from_static(b"newroom"), announcement);
        info!(
            "🏠 Room {} '{}' created on scheduler {}",
            room_id,
            name,
            scheduler.id()
        );
        self.rooms.insert(
            room_id,
            Room {
                id: room_id,
                name,
                scheduler,
                players: Vec::new(),
                observers: Vec::new(),
            },
        );

        self.seat_player(owner, room_id)?;
        Ok(room_id)
    }

    fn watch_startup(&self, scheduler: Arc<Scheduler>) {
        let main = self.main.clone();
        let limit = self.pool.engine_config().startup_timeout;
        tokio::spawn(async move {
            if let Err(e) = scheduler.wait_started(limit).await {
                let id = scheduler.id();
                error!("❌ Scheduler {} did not come up: {}", id, e);
                drop(scheduler);
                main.post(move |state| state.scheduler_failed(id));
            }
        });
    }

    pub fn seat_player(&mut self, connection: ConnectionId, room_id: i32) -> Result<(), ServerError> {
        self.lobby_session(connection)?;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| ServerError::Refused(format!("room {room_id} does not exist")))?;
        let session = self
            .sessions
            .get_mut(&connection)
            .ok_or_else(|| ServerError::Internal(format!("{connection} vanished")))?;

        session.room_id = room_id;
        room.players.push(connection);
        room.scheduler.push_request(
            room_id,
            connection.0,
            Bytes::from_static(b"join"),
            Bytes::from(session.describe()),
        );
        if let Err(e) = session
            .router
            .notify_client("EnterRoom", encode(&(room_id, &room.name))?)
        {
            debug!("{} left while entering room {}: {}", connection, room_id, e);
        }
        Ok(())
    }

    pub fn observe_room(&mut self, connection: ConnectionId, room_id: i32) -> Result<(), ServerError> {
        self.lobby_session(connection)?;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| ServerError::Refused(format!("room {room_id} does not exist")))?;
        let session = self
            .sessions
            .get_mut(&connection)
            .ok_or_else(|| ServerError::Internal(format!("{connection} vanished")))?;

        session.observing = Some(room_id);
        room.observers.push(connection);
        room.scheduler.add_observer(room_id, session.describe());
        if let Err(e) = session
            .router
            .notify_client("EnterRoom", encode(&(room_id, &room.name))?)
        {
            debug!("{} left while observing room {}: {}", connection, room_id, e);
        }
        Ok(())
    }

    fn stop_observing(&mut self, connection: ConnectionId) {
        let Some(session) = self.sessions.get_mut(&connection) else {
            return;
        };
        let Some(room_id) = session.observing.take() else {
            return;
        };
        let _ = session.router.notify_client("EnterLobby", Bytes::new());
        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.observers.retain(|observer| *observer != connection);
            room.scheduler.remove_observer(room_id, connection.0);
        }
    }

    /// Ends a room: players go back to the lobby, offline ones are dropped
    /// and the scheduler reference is released.
    pub fn finish_room(&mut self, room_id: i32) -> Result<(), ServerError> {
        let room = self
            .rooms
            .remove(&room_id)
            .ok_or_else(|| ServerError::Refused(format!("room {room_id} does not exist")))?;

        for connection in &room.observers {
            if let Some(session) = self.sessions.get_mut(connection) {
                session.observing = None;
                let _ = session.router.notify_client("EnterLobby", Bytes::new());
            }
        }
        let scheduler = room.scheduler;
        // players who ran from a live game are banned for a while
        let runaway_ban = scheduler.is_alive() && !scheduler.is_outdated(&self.fingerprint);
        for connection in &room.players {
            let Some(session) = self.sessions.get_mut(connection) else {
                continue;
            };
            if session.is_online() {
                session.room_id = LOBBY_ROOM;
                session.thinking = false;
                session.died = false;
                let _ = session.router.notify_client("EnterLobby", Bytes::new());
            } else {
                if runaway_ban {
                    let address = session.router.connection().peer().ip();
                    self.ban_address(address);
                }
                self.sessions.remove(connection);
            }
        }

        scheduler.cancel_delay(room_id);
        scheduler.destroy_request_timer(room_id);
        let left = scheduler.decrease_ref_count();
        info!(
            "🏁 Room {} finished, scheduler {} hosts {} room(s)",
            room_id,
            scheduler.id(),
            left
        );
        if left == 0 && scheduler.is_outdated(&self.fingerprint) {
            self.pool.retire(scheduler.id());
        }
        Ok(())
    }

    /// A scheduler's engine never came up or exited while hosting: its rooms
    /// are closed and it is retired.
    pub(crate) fn scheduler_failed(&mut self, scheduler_id: i32) {
        let rooms: Vec<i32> = self
            .rooms
            .values()
            .filter(|room| room.scheduler.id() == scheduler_id)
            .map(|room| room.id)
            .collect();

        for room_id in rooms {
            if let Some(room) = self.rooms.get(&room_id) {
                for connection in room.players.iter().chain(&room.observers) {
                    self.show_error(*connection, "the game engine is unavailable");
                }
            }
            let _ = self.finish_room(room_id);
        }

        if let Some(scheduler) = self.pool.get(scheduler_id) {
            scheduler.mark_outdated();
        }
        self.pool.retire(scheduler_id);
    }

    /// Re-reads the bundle fingerprint. Idle outdated schedulers retire now;
    /// busy ones get their rooms woken with reason `outdated`.
    pub fn refresh_fingerprint(&mut self) -> Result<(), ServerError> {
        let fingerprint = self.collaborators.bundle.fingerprint()?;
        if fingerprint == self.fingerprint {
            return Ok(());
        }
        info!(
            "📦 Rule bundle changed: {} -> {}",
            short(&self.fingerprint),
            short(&fingerprint)
        );
        self.fingerprint = fingerprint;

        for scheduler in self.pool.sweep(&self.fingerprint) {
            for room in self
                .rooms
                .values()
                .filter(|room| room.scheduler.id() == scheduler.id())
            {
                scheduler.wake_up(room.id, "outdated");
            }
        }
        Ok(())
    }

    pub fn reload_settings(&mut self) -> Result<(), ServerError> {
        self.settings = ServerSettings::load(&self.config.settings_path)?;
        info!("⚙️ Server settings reloaded");
        Ok(())
    }

    /// Drops a client. The usual disconnect handling follows.
    pub fn kick(&mut self, connection: ConnectionId) {
        let router = self
            .sessions
            .get(&connection)
            .map(|session| session.router.clone())
            .or_else(|| self.pending.get(&connection).cloned());
        if let Some(router) = router {
            info!("🦶 Kicking {}", connection);
            router.connection().close();
        }
    }

    /// Kicks the player and refuses sign-ups from their address for
    /// `tempBanTime` minutes. A zero ban time only kicks.
    pub fn temporarily_ban(&mut self, connection: ConnectionId) {
        let address = self
            .sessions
            .get(&connection)
            .map(|session| session.router.connection().peer().ip())
            .or_else(|| {
                self.pending
                    .get(&connection)
                    .map(|router| router.connection().peer().ip())
            });
        if let Some(address) = address {
            self.ban_address(address);
        }
        self.kick(connection);
    }

    fn ban_address(&mut self, address: IpAddr) {
        let minutes = self.settings.temp_ban_time;
        if minutes == 0 {
            return;
        }
        info!("⛔ Banning {} for {} minute(s)", address, minutes);
        let until = Instant::now() + Duration::from_secs(minutes.saturating_mul(60));
        self.temp_bans.insert(address, until);
    }

    pub fn show_error(&self, connection: ConnectionId, message: &str) {
        if let Some(session) = self.sessions.get(&connection) {
            let _ = session
                .router
                .notify_client("ErrorDlg", error_payload(message));
        }
    }

    /// Closes every connection and retires every scheduler.
    pub(crate) async fn shutdown(&mut self) {
        info!(
            "🧹 Closing {} connection(s) and {} scheduler(s)",
            self.pending.len() + self.sessions.len(),
            self.pool.len()
        );
        for router in self
            .pending
            .values()
            .chain(self.sessions.values().map(|session| &session.router))
        {
            router.connection().close();
        }
        self.pending.clear();
        self.sessions.clear();
        self.rooms.clear();
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::DirectoryBundle;
    use crate::config::EngineConfig;
    use crate::engine::dispatchers::{host_handlers, names};
    use crate::engine::methods;
    use crate::protocol::packet_type::*;
    use crate::protocol::rpc::{RpcCall, RpcValue};
    use crate::protocol::payload::{as_i32, as_string, decode_array};
    use crate::protocol::{RecordCodec, NOTIFICATION_ID};
    use crate::server::auth::OpenAuthenticator;
    use crate::server::handle::MainJob;
    use crate::server::lobby::BasicLobby;
    use std::collections::VecDeque;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct Harness {
        state: ServerState,
        jobs: mpsc::UnboundedReceiver<MainJob>,
        _events: mpsc::UnboundedReceiver<ConnectionEvent>,
        bundle_dir: std::path::PathBuf,
        _dir: tempfile::TempDir,
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
                let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0, "connection closed early");
                self.queue.extend(self.codec.feed(&buf[..n]).unwrap());
            }
            self.queue.pop_front().unwrap()
        }

        async fn expect(&mut self, command: &str) -> Record {
            let record = self.next().await;
            assert_eq!(&record.command[..], command.as_bytes());
            record
        }

        async fn assert_closed(&mut self) {
            let mut buf = [0u8; 64];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        }
    }

    fn harness_with(engine: EngineConfig) -> Harness {
        harness_full(engine, HandlerTable::new())
    }

    fn echo_engine() -> EngineConfig {
        sh_engine("echo ready; exec cat")
    }

    fn sh_engine(script: &str) -> EngineConfig {
        EngineConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            handshake_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        }
    }

    fn harness_full(engine: EngineConfig, handlers: HandlerTable) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let bundle_dir = dir.path().join("bundle");
        std::fs::create_dir(&bundle_dir).unwrap();
        std::fs::write(bundle_dir.join("init.lua"), "return 1").unwrap();

        let config = ServerConfig {
            settings_path: dir.path().join("missing.json"),
            bundle_directory: bundle_dir.clone(),
            engine,
            ..ServerConfig::default()
        };
        let collaborators = Collaborators {
            bundle: Arc::new(DirectoryBundle::new(bundle_dir.clone())),
            authenticator: Arc::new(OpenAuthenticator::new()),
            lobby: Arc::new(BasicLobby),
        };
        let (main, jobs) = MainHandle::new(Duration::from_secs(1));
        let (events_tx, events) = mpsc::unbounded_channel();
        let state = ServerState::new(config, collaborators, main, events_tx, handlers).unwrap();

        Harness {
            state,
            jobs,
            _events: events,
            bundle_dir,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(echo_engine())
    }

    impl Harness {
        async fn connect(&mut self) -> (ConnectionId, Client) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
            let (server, peer) = listener.accept().await.unwrap();
            self.state.accept(server, peer);
            let client = Client {
                stream,
                codec: RecordCodec::new(),
                queue: VecDeque::new(),
            };
            (ConnectionId(self.state.next_connection_id), client)
        }

        fn send_setup(&mut self, id: ConnectionId, name: &str, md5: &str) {
            let payload = encode(&[name, "pw", md5, "0.1.0", "device-1"]).unwrap();
            let record = Record::new(
                NOTIFICATION_ID,
                NOTIFICATION | SRC_CLIENT | DEST_SERVER,
                "Setup",
                payload,
            );
            self.state.handle_event(ConnectionEvent::Record(id, record));
        }

        /// Runs the next job posted to the main loop.
        async fn run_next_job(&mut self) {
            let job = tokio::time::timeout(Duration::from_secs(5), self.jobs.recv())
                .await
                .unwrap()
                .unwrap();
            job(&mut self.state);
        }

        /// Connects and signs up a player; returns once the greeting is read.
        async fn sign_up(&mut self, name: &str) -> (ConnectionId, Client) {
            let (id, mut client) = self.connect().await;
            client.expect("NetworkDelayTest").await;
            let md5 = self.state.fingerprint().to_string();
            self.send_setup(id, name, &md5);
            client.expect("Setup").await;
            client.expect("SetServerSettings").await;
            (id, client)
        }
    }

    #[tokio::test]
    async fn test_valid_setup_enters_lobby() {
        let mut h = harness();
        let (id, mut client) = h.connect().await;

        let delay_test = client.expect("NetworkDelayTest").await;
        assert_eq!(delay_test.request_id, NOTIFICATION_ID);

        let md5 = h.state.fingerprint().to_string();
        h.send_setup(id, "alice", &md5);

        let setup = client.expect("Setup").await;
        let fields = decode_array(&setup.payload).unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(as_i32(&fields[0]), Some(1));
        assert_eq!(as_string(&fields[1]).as_deref(), Some("alice"));
        assert_eq!(as_string(&fields[2]).as_deref(), Some("liubei"));

        let settings = client.expect("SetServerSettings").await;
        let fields = decode_array(&settings.payload).unwrap();
        assert_eq!(as_string(&fields[0]).as_deref(), Some("Welcome!"));

        assert_eq!(h.state.online_count(), 1);
        assert!(h.state.session(id).unwrap().in_lobby());
        assert_eq!(h.state.summary().online, 1);
    }

    #[tokio::test]
    async fn test_invalid_setup_string() {
        let mut h = harness();
        let (id, mut client) = h.connect().await;
        client.expect("NetworkDelayTest").await;

        let record = Record::new(NOTIFICATION_ID, NOTIFICATION | SRC_CLIENT | DEST_SERVER, "Setup", "junk");
        h.state.handle_event(ConnectionEvent::Record(id, record));

        let error = client.expect("ErrorDlg").await;
        assert_eq!(error.payload, error_payload("INVALID SETUP STRING"));
        client.assert_closed().await;
        assert!(h.state.session(id).is_none());
    }

    async fn refusal(tweak: impl FnOnce(&mut ServerSettings), correct_md5: bool) -> Bytes {
        let mut h = harness();
        tweak(&mut h.state.settings);
        let (id, mut client) = h.connect().await;
        client.expect("NetworkDelayTest").await;

        let md5 = if correct_md5 {
            h.state.fingerprint().to_string()
        } else {
            "stale".to_string()
        };
        h.send_setup(id, "the_admin", &md5);

        let error = client.expect("ErrorDlg").await;
        client.assert_closed().await;
        assert_eq!(h.state.online_count(), 0);
        error.payload
    }

    #[tokio::test]
    async fn test_setup_refusals() {
        let banned = refusal(|s| s.ban_words = vec!["ADMIN".to_string()], true).await;
        assert_eq!(banned, error_payload("invalid user name"));

        let full = refusal(|s| s.capacity = 0, true).await;
        assert_eq!(full, error_payload("server is full!"));

        let device = refusal(|s| s.max_players_per_device = 0, true).await;
        assert_eq!(device, error_payload("cannot register more new users on this device"));

        let stale = refusal(|_| {}, false).await;
        assert_eq!(stale, error_payload("MD5 check failed!"));
    }

    #[tokio::test]
    async fn test_signup_timer_closes_silent_connection() {
        let mut h = harness();
        h.state.config.signup_timeout = Duration::from_millis(20);
        let (_id, mut client) = h.connect().await;
        client.expect("NetworkDelayTest").await;

        let job = h.jobs.recv().await.unwrap();
        job(&mut h.state);
        client.assert_closed().await;
        assert!(h.state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_lobby_disconnect_forgets_session() {
        let mut h = harness();
        let (id, _client) = h.sign_up("bob").await;
        h.state.handle_event(ConnectionEvent::Closed(id));
        assert!(h.state.session(id).is_none());
        assert_eq!(h.state.online_count(), 0);
    }

    #[tokio::test]
    async fn test_room_lifecycle_reuses_scheduler() {
        let mut h = harness();
        let (alice, mut client) = h.sign_up("alice").await;

        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();
        assert_eq!(room_id, 1);
        client.expect("EnterRoom").await;
        assert_eq!(h.state.session(alice).unwrap().room_id, room_id);
        let scheduler = h.state.room(room_id).unwrap().scheduler.clone();
        assert_eq!(scheduler.ref_count(), 1);

        // seated players cannot open another room
        assert!(matches!(
            h.state.create_room(alice, "second".to_string()),
            Err(ServerError::Refused(_))
        ));

        h.state.finish_room(room_id).unwrap();
        client.expect("EnterLobby").await;
        assert!(h.state.session(alice).unwrap().in_lobby());
        assert_eq!(scheduler.ref_count(), 0);
        assert_eq!(h.state.scheduler_count(), 1);

        let again = h.state.create_room(alice, "rematch".to_string()).unwrap();
        assert_eq!(h.state.room(again).unwrap().scheduler.id(), scheduler.id());

        drop(scheduler);
        h.state.shutdown().await;
        assert_eq!(h.state.scheduler_count(), 0);
    }

    #[tokio::test]
    async fn test_observer_joins_and_quits() {
        let mut h = harness();
        let (alice, _alice_client) = h.sign_up("alice").await;
        let (bob, mut bob_client) = h.sign_up("bob").await;

        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();
        h.state.observe_room(bob, room_id).unwrap();
        bob_client.expect("EnterRoom").await;
        assert_eq!(h.state.room(room_id).unwrap().observers, vec![bob]);

        let quit = Record::new(NOTIFICATION_ID, NOTIFICATION | SRC_CLIENT | DEST_SERVER, "QuitRoom", "");
        h.state.handle_event(ConnectionEvent::Record(bob, quit));
        bob_client.expect("EnterLobby").await;
        assert!(h.state.room(room_id).unwrap().observers.is_empty());
        assert!(h.state.session(bob).unwrap().in_lobby());

        assert!(h.state.observe_room(bob, 99).is_err());
        h.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_player_is_dropped_when_room_ends() {
        let mut h = harness();
        let (alice, _client) = h.sign_up("alice").await;
        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();

        h.state.handle_event(ConnectionEvent::Closed(alice));
        let session = h.state.session(alice).unwrap();
        assert_eq!(session.state, PlayerState::Offline);
        assert_eq!(session.room_id, room_id);
        assert_eq!(h.state.online_count(), 0);

        h.state.finish_room(room_id).unwrap();
        assert!(h.state.session(alice).is_none());
        h.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_bundle_change_retires_scheduler_after_last_room() {
        let mut h = harness();
        let (alice, _client) = h.sign_up("alice").await;
        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();
        let scheduler = h.state.room(room_id).unwrap().scheduler.clone();
        scheduler.wait_started(Duration::from_secs(5)).await.unwrap();
        let pid = scheduler.engine_pid().unwrap();

        std::fs::write(h.bundle_dir.join("init.lua"), "return 2").unwrap();
        h.state.refresh_fingerprint().unwrap();
        // still hosting a room, so it only drains
        assert_eq!(h.state.scheduler_count(), 1);

        h.state.finish_room(room_id).unwrap();
        assert_eq!(h.state.scheduler_count(), 0);
        h.state.pool.wait_retired().await;
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[tokio::test]
    async fn test_failed_engine_closes_its_rooms() {
        let mut h = harness_with(EngineConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 1".to_string()],
            handshake_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        });
        let (alice, mut client) = h.sign_up("alice").await;
        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();
        client.expect("EnterRoom").await;

        let job = h.jobs.recv().await.unwrap();
        job(&mut h.state);

        let error = client.expect("ErrorDlg").await;
        assert_eq!(error.payload, error_payload("the game engine is unavailable"));
        client.expect("EnterLobby").await;
        assert!(h.state.room(room_id).is_none());
        assert_eq!(h.state.scheduler_count(), 0);
        h.state.pool.wait_retired().await;
    }

    fn resume_recorder() -> (HandlerTable, mpsc::UnboundedReceiver<Vec<RpcValue>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handlers = HandlerTable::new();
        handlers.register(methods::RESUME_ROOM, move |call: RpcCall| {
            let _ = tx.send(call.params);
            async { Ok(RpcValue::Null) }
        });
        (handlers, rx)
    }

    async fn next_resume(resumed: &mut mpsc::UnboundedReceiver<Vec<RpcValue>>) -> Vec<RpcValue> {
        tokio::time::timeout(Duration::from_secs(5), resumed.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn resume(room_id: i32, reason: &str) -> Vec<RpcValue> {
        vec![RpcValue::from(room_id), RpcValue::Text(reason.to_string())]
    }

    fn host_call(method: &str, params: Vec<RpcValue>) -> RpcCall {
        RpcCall {
            id: 1,
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_engine_exit_mid_game_closes_its_rooms() {
        let mut h = harness_with(sh_engine("echo ready; sleep 0.3; exit 0"));
        let (alice, mut client) = h.sign_up("alice").await;
        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();
        client.expect("EnterRoom").await;

        // the scheduler reports the dead engine to the main loop
        h.run_next_job().await;

        let error = client.expect("ErrorDlg").await;
        assert_eq!(error.payload, error_payload("the game engine is unavailable"));
        client.expect("EnterLobby").await;
        assert!(h.state.room(room_id).is_none());
        assert!(h.state.session(alice).unwrap().in_lobby());
        assert_eq!(h.state.scheduler_count(), 0);
        h.state.pool.wait_retired().await;
    }

    #[tokio::test]
    async fn test_room_is_abandoned_once_every_seat_is_offline() {
        let (handlers, mut resumed) = resume_recorder();
        let mut h = harness_full(echo_engine(), handlers);
        let (alice, _alice_client) = h.sign_up("alice").await;
        let (bob, _bob_client) = h.sign_up("bob").await;
        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();
        h.state.seat_player(bob, room_id).unwrap();

        h.state.handle_event(ConnectionEvent::Closed(bob));
        assert_eq!(next_resume(&mut resumed).await, resume(room_id, "player_disconnect"));

        h.state.handle_event(ConnectionEvent::Closed(alice));
        // bob leaving alone did not abandon the room
        assert_eq!(next_resume(&mut resumed).await, resume(room_id, "player_disconnect"));
        assert_eq!(next_resume(&mut resumed).await, resume(room_id, "abandon"));
        assert!(h.state.room(room_id).is_some());

        h.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_abandoned_room_on_stale_scheduler_is_closed() {
        let mut h = harness();
        let (alice, _client) = h.sign_up("alice").await;
        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();

        std::fs::write(h.bundle_dir.join("init.lua"), "return 2").unwrap();
        h.state.refresh_fingerprint().unwrap();
        h.state.handle_event(ConnectionEvent::Closed(alice));

        assert!(h.state.room(room_id).is_none());
        assert!(h.state.session(alice).is_none());
        assert_eq!(h.state.scheduler_count(), 0);
        h.state.pool.wait_retired().await;
    }

    #[tokio::test]
    async fn test_temporary_ban_refuses_address_until_expiry() {
        let mut h = harness();
        h.state.settings.temp_ban_time = 5;
        let (alice, mut alice_client) = h.sign_up("alice").await;

        h.state.temporarily_ban(alice);
        alice_client.assert_closed().await;

        let (carol, mut carol_client) = h.connect().await;
        carol_client.expect("NetworkDelayTest").await;
        let md5 = h.state.fingerprint().to_string();
        h.send_setup(carol, "carol", &md5);
        let error = carol_client.expect("ErrorDlg").await;
        assert_eq!(error.payload, error_payload("you have been temporarily banned!"));
        carol_client.assert_closed().await;

        for until in h.state.temp_bans.values_mut() {
            *until = Instant::now();
        }
        let (carol, _client) = h.sign_up("carol").await;
        assert!(h.state.session(carol).is_some());
        assert!(h.state.temp_bans.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ban_time_only_kicks() {
        let mut h = harness();
        let (alice, mut client) = h.sign_up("alice").await;
        h.state.temporarily_ban(alice);
        client.assert_closed().await;
        assert!(h.state.temp_bans.is_empty());
    }

    #[tokio::test]
    async fn test_player_who_ran_from_live_game_is_banned() {
        let mut h = harness();
        h.state.settings.temp_ban_time = 5;
        let (alice, _client) = h.sign_up("alice").await;
        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();

        h.state.handle_event(ConnectionEvent::Closed(alice));
        h.state.finish_room(room_id).unwrap();
        assert!(h.state.session(alice).is_none());
        assert_eq!(h.state.temp_bans.len(), 1);
        h.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_game_over_finishes_room_through_main_loop() {
        let mut h = harness();
        let (alice, mut client) = h.sign_up("alice").await;
        let room_id = h.state.create_room(alice, "table".to_string()).unwrap();
        client.expect("EnterRoom").await;

        let handlers = host_handlers(h.state.main.clone());
        let game_over = handlers.get(names::ROOM_GAME_OVER).unwrap();
        let pending = tokio::spawn(game_over(host_call(
            names::ROOM_GAME_OVER,
            vec![RpcValue::from(room_id)],
        )));

        h.run_next_job().await;
        assert_eq!(pending.await.unwrap(), Ok(RpcValue::Null));
        client.expect("EnterLobby").await;
        assert!(h.state.room(room_id).is_none());
        assert!(h.state.session(alice).unwrap().in_lobby());
        h.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_reply_round_trip() {
        let mut h = harness();
        let (alice, mut client) = h.sign_up("alice").await;
        let handlers = host_handlers(h.state.main.clone());
        let do_request = handlers.get(names::PLAYER_DO_REQUEST).unwrap();
        let wait = handlers.get(names::PLAYER_WAIT_FOR_REPLY).unwrap();
        let ask = || {
            host_call(
                names::PLAYER_DO_REQUEST,
                vec![
                    RpcValue::from(alice.0),
                    "AskForCard".into(),
                    "{}".into(),
                    RpcValue::Int(5_000),
                ],
            )
        };

        do_request(ask()).await.unwrap();
        h.run_next_job().await;
        let request = client.expect("AskForCard").await;
        assert!(request.has(REQUEST));

        let pending = tokio::spawn(wait(host_call(
            names::PLAYER_WAIT_FOR_REPLY,
            vec![RpcValue::from(alice.0), RpcValue::Int(2_000)],
        )));
        h.run_next_job().await;
        let answer = Record::new(
            request.request_id,
            REPLY | SRC_CLIENT | DEST_SERVER,
            "AskForCard",
            "yes",
        );
        h.state.handle_event(ConnectionEvent::Record(alice, answer));
        assert_eq!(
            pending.await.unwrap(),
            Ok(RpcValue::Bytes(Bytes::from_static(b"yes")))
        );

        // a fresh request that nobody answers
        do_request(ask()).await.unwrap();
        h.run_next_job().await;
        client.expect("AskForCard").await;
        let pending = tokio::spawn(wait(host_call(
            names::PLAYER_WAIT_FOR_REPLY,
            vec![RpcValue::from(alice.0), RpcValue::Int(50)],
        )));
        h.run_next_job().await;
        assert_eq!(
            pending.await.unwrap(),
            Ok(RpcValue::Bytes(Bytes::from_static(b"__notready")))
        );
    }
}
