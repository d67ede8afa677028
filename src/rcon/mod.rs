use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::*;

use crate::commands::CommandRouter;
use crate::config::ConnectionConfig;
use crate::rcon::dispatcher::{build_handler_table, HandlerTable};
use crate::rcon::events::{EventSink, GameEvent};
use crate::rcon::sender::Outbound;
use crate::rdns::RdnsHandle;
use crate::store::bans::BanStore;
use crate::store::enforcer::BanSources;
use crate::store::exemptions::ExemptionStore;
use crate::structures::buildings::BuildingTable;
use crate::structures::players::PlayerTable;
use crate::structures::{MatchState, ServerInfo, VoteState};
use crate::AppData;

pub mod codec;
pub mod dispatcher;
pub mod events;
pub mod sender;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unsupported protocol version : {0}")]
    UnsupportedVersion(u32),
    #[error("Malformed version banner : {0}")]
    BadBanner(String),
    #[error("Missing mandatory field {0}")]
    MissingField(usize),
    #[error("Unparseable mandatory field {0} : {1}")]
    BadField(usize, String),
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Connection closed by peer")]
    Closed,
    #[error("Ping timeout")]
    PingTimeout,
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("No address resolved for {0}")]
    NoAddress(String),
    #[error("Connection parameters changed")]
    Rehash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum LinkState {
    Disconnected,
    Connecting,
    AwaitingVersion,
    Handshaking,
    FullyConnected,
}

/// Deferred work queued by the synchronous event handlers and run after the
/// line's state mutation completed.
pub(crate) enum Followup {
    Vet(u32),
    Rdns(u32, Ipv4Addr),
    Command { pid: u32, word: String, args: String },
}

/// Per-connection protocol state. Owned and driven by a single session loop;
/// handlers never block on it.
pub struct Session {
    pub name: String,
    pub state: LinkState,
    pub version: u32,
    pub subscribed: bool,
    pub fully_connected: bool,
    pub ping_outstanding: bool,
    pub match_state: MatchState,
    pub server_info: ServerInfo,
    pub mutators: Vec<String>,
    pub rotation: Vec<String>,
    pub vote: Option<VoteState>,
    pub players: PlayerTable,
    pub buildings: BuildingTable,
    pub format: Option<Vec<String>>,
    pub current_command: Option<String>,
    pub outbound: Outbound,
    pub events: EventSink,
    pub bans: Arc<BanStore>,
    pub exemptions: Arc<ExemptionStore>,
    pub router: Arc<CommandRouter>,
    pub rdns: RdnsHandle,
    pub sources: BanSources,
    pub rdns_enabled: bool,
    pub command_prefix: char,
    pub(crate) password: String,
    pub(crate) subscribe_user: String,
    pub(crate) handlers: Arc<HandlerTable>,
    pub(crate) followups: Vec<Followup>,
    pub(crate) pending_events: Vec<GameEvent>,
}

impl Session {
    pub fn new(
        cfg: &ConnectionConfig,
        bans: Arc<BanStore>,
        exemptions: Arc<ExemptionStore>,
        router: Arc<CommandRouter>,
        events_tx: tokio::sync::broadcast::Sender<(String, GameEvent)>,
    ) -> (Session, mpsc::UnboundedReceiver<String>) {
        let (outbound, out_rx) = Outbound::channel();
        let session = Session {
            name: cfg.name.clone(),
            state: LinkState::Connecting,
            version: 0,
            subscribed: false,
            fully_connected: false,
            ping_outstanding: false,
            match_state: MatchState::Pending,
            server_info: ServerInfo::default(),
            mutators: Vec::new(),
            rotation: Vec::new(),
            vote: None,
            players: PlayerTable::default(),
            buildings: BuildingTable::default(),
            format: None,
            current_command: None,
            outbound,
            events: EventSink::new(&cfg.name, events_tx),
            bans,
            exemptions,
            router,
            rdns: RdnsHandle::new(cfg.rdns),
            sources: cfg.sources(),
            rdns_enabled: cfg.rdns,
            command_prefix: cfg.command_prefix,
            password: cfg.password.clone(),
            subscribe_user: cfg.subscribe_user.clone(),
            handlers: Arc::new(build_handler_table()),
            followups: Vec::new(),
            pending_events: Vec::new(),
        };
        (session, out_rx)
    }

    pub(crate) fn queue_event(&mut self, event: GameEvent) {
        self.pending_events.push(event);
    }

    pub(crate) fn flush_events(&mut self) {
        for event in std::mem::take(&mut self.pending_events) {
            self.events.emit(event);
        }
    }

    /// Periodic housekeeping : applies finished reverse-DNS lookups and any
    /// enforcement work they unlocked.
    pub async fn tick(&mut self) {
        let mut to_vet = Vec::new();
        for (id, result) in self.rdns.drain() {
            if let Some(player) = self.players.get_mut(id) {
                player.rdns_pending = false;
                if let Some(host) = &result {
                    debug!("Resolved player {} to {}", id, host);
                    if !player.bot {
                        //The rdns match mode can only fire once the name is in
                        to_vet.push(id);
                    }
                }
                player.rdns = result;
            }
        }
        for id in to_vet {
            self.followups.push(Followup::Vet(id));
        }
        self.run_followups().await;
        self.flush_events();
    }

    /// Resets all derived state without destroying the session object.
    /// Deletion events fire before the tables are cleared away.
    pub fn wipe_data(&mut self) {
        for player in self.players.drain() {
            self.events.emit(GameEvent::PlayerLeft { id: player.id, name: player.name });
        }
        self.buildings.clear();
        self.mutators.clear();
        self.rotation.clear();
        self.vote = None;
        self.format = None;
        self.current_command = None;
        self.match_state = MatchState::Pending;
        self.server_info = ServerInfo::default();
        self.subscribed = false;
        self.fully_connected = false;
        self.ping_outstanding = false;
        self.version = 0;
        self.state = LinkState::Disconnected;
        self.rdns.detach_all();
        self.followups.clear();
        self.pending_events.clear();
    }
}

/// A rehash only reconnects when one of the transport parameters changed.
pub fn needs_reconnect(old: &ConnectionConfig, new: &ConnectionConfig) -> bool {
    old.host != new.host
        || old.port != new.port
        || old.password != new.password
        || old.bind != new.bind
}

pub async fn run_task(
    mut cfg_rx: watch::Receiver<ConnectionConfig>,
    data: Arc<AppData>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: i64 = 0;
    loop {
        let cfg = cfg_rx.borrow().clone();
        let sink = EventSink::new(&cfg.name, data.events.clone());
        info!("[{}] Connecting to {}:{}", cfg.name, cfg.host, cfg.port);
        match connect(&cfg).await {
            Ok(stream) => {
                attempts = 0;
                info!("[{}] Connected", cfg.name);
                match run_session(stream, &cfg, &data, &mut cfg_rx, &mut shutdown).await {
                    Ok(()) => {
                        info!("[{}] Connection shut down", cfg.name);
                        return;
                    }
                    Err(ConnectionError::Rehash) => {
                        info!("[{}] Reconnecting with new parameters", cfg.name);
                        continue;
                    }
                    Err(err) => warn!("[{}] Session ended : {}", cfg.name, err),
                }
            }
            Err(err) => warn!("[{}] Connect failed : {}", cfg.name, err),
        }
        if *shutdown.borrow() {
            return;
        }
        attempts += 1;
        if cfg.max_attempts >= 0 && attempts >= cfg.max_attempts {
            error!("[{}] Giving up after {} attempt(s)", cfg.name, attempts);
            sink.emit(GameEvent::AdminNotice {
                text: format!("Giving up on {} after {} attempt(s)", cfg.name, attempts),
            });
            return;
        }
        info!(
            "[{}] Reconnecting in {} (attempt {})",
            cfg.name,
            humantime::format_duration(cfg.reconnect_delay),
            attempts
        );
        sink.emit(GameEvent::AdminNotice {
            text: format!("Lost {} , reconnecting (attempt {})", cfg.name, attempts),
        });
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        select! {
            _ = sleep(cfg.reconnect_delay + jitter) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn connect(cfg: &ConnectionConfig) -> Result<TcpStream, ConnectionError> {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let target = tokio::net::lookup_host(addr.as_str())
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| ConnectionError::NoAddress(addr.clone()))?;
    let socket = TcpSocket::new_v4()?;
    if let Some(local) = cfg.bind {
        socket.bind(SocketAddr::new(local, 0))?;
    }
    match timeout(CONNECT_TIMEOUT, socket.connect(target)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(ConnectionError::ConnectTimeout),
    }
}

async fn run_session(
    stream: TcpStream,
    cfg: &ConnectionConfig,
    data: &Arc<AppData>,
    cfg_rx: &mut watch::Receiver<ConnectionConfig>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let (mut session, mut out_rx) = Session::new(
        cfg,
        data.bans.clone(),
        data.exemptions.clone(),
        data.router.clone(),
        data.events.clone(),
    );
    session.state = LinkState::AwaitingVersion;
    debug!("[{}] State : {}", cfg.name, session.state);

    //Update-rate settings may be rehashed in place mid-session
    let mut live = cfg.clone();
    let mut line_buf: Vec<u8> = Vec::new();
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last_read = Instant::now();
    let mut last_send = Instant::now();
    let mut ping_sent: Option<Instant> = None;

    let result = loop {
        select! {
            read = reader.read_until(b'\n', &mut line_buf) => {
                match read {
                    Ok(0) => break Err(ConnectionError::Closed),
                    Ok(_) => {
                        //A partial line stays buffered for the next read
                        if line_buf.last() == Some(&b'\n') {
                            last_read = Instant::now();
                            let line = String::from_utf8_lossy(&line_buf).into_owned();
                            line_buf.clear();
                            if let Err(err) = session.handle_line(&line).await {
                                break Err(err.into());
                            }
                        }
                    }
                    Err(err) => break Err(err.into()),
                }
            }
            Some(command) = out_rx.recv() => {
                let mut bytes = command.into_bytes();
                bytes.push(b'\n');
                if let Err(err) = write_half.write_all(&bytes).await {
                    break Err(err.into());
                }
                last_send = Instant::now();
            }
            _ = interval.tick() => {
                session.tick().await;
                if !session.ping_outstanding {
                    ping_sent = None;
                }
                if let Some(sent) = ping_sent {
                    if sent.elapsed() >= live.ping_timeout {
                        break Err(ConnectionError::PingTimeout);
                    }
                } else if last_read.elapsed() >= live.ping_interval
                    || last_send.elapsed() >= live.ping_interval
                {
                    session.outbound.ping();
                    session.ping_outstanding = true;
                    ping_sent = Some(Instant::now());
                }
            }
            changed = cfg_rx.changed() => {
                match changed {
                    Ok(()) => {
                        let new_cfg = cfg_rx.borrow().clone();
                        if needs_reconnect(cfg, &new_cfg) {
                            break Err(ConnectionError::Rehash);
                        }
                        info!("[{}] Applied configuration in place", cfg.name);
                        live = new_cfg;
                    }
                    //Config channel gone means the process is going down
                    Err(_) => break Ok(()),
                }
            }
            _ = shutdown.changed() => break Ok(()),
        }
    };

    let reason = match &result {
        Ok(()) => "shutdown".to_string(),
        Err(err) => err.to_string(),
    };
    session.wipe_data();
    session.events.emit(GameEvent::Disconnected { reason });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rehash_only_reconnects_on_transport_changes() {
        let old = ConnectionConfig::new("main", "127.0.0.1", 7777, "secret");
        let mut new = old.clone();
        new.ping_interval = Duration::from_secs(5);
        assert!(!needs_reconnect(&old, &new));
        new.port += 1;
        assert!(needs_reconnect(&old, &new));
        let mut new = old.clone();
        new.password = "other".to_string();
        assert!(needs_reconnect(&old, &new));
    }
}
