use serde::Serialize;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;
use tracing::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum KillKind {
    Vehicle,
    Building,
    Defence,
}

/// One event per relevant protocol line, consumed by the chat relay and
/// other front-ends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum GameEvent {
    Connected { version: u32 },
    Disconnected { reason: String },
    PlayerJoined { id: u32, name: String, team: i32, bot: bool },
    PlayerLeft { id: u32, name: String },
    PlayerRenamed { id: u32, name: String, previous: String },
    TeamChanged { id: u32, team: i32 },
    AccessChanged { id: u32, access: i32, admin_type: String },
    Chat { id: u32, name: String, text: String, team_only: bool },
    HostChat { text: String },
    Page { from: String, target: String, text: String },
    Death { victim: String, killer: String, weapon: String },
    Suicide { id: u32, name: String },
    Headshot { killer: String, victim: String },
    ObjectKill { killer: String, target: String, kind: KillKind },
    Captured { id: u32, building: String },
    Steal { id: u32, vehicle: String },
    Beacon { id: u32, placed: bool },
    Proxy { id: u32, placed: bool },
    MatchState { state: String },
    TeamWon { team: i32, reason: String },
    MapLoad { map: String, seamless: bool },
    MapLoaded { map: String },
    RotationMap { map: String },
    BuildingDestroyed { name: String },
    VoteStarted { id: u32, kind: String, target: String },
    VoteCast { id: u32, yes: bool },
    VoteEnded { kind: String, passed: bool },
    Demo { file: String, recording: bool },
    AdminAction { action: String, issuer: String, target: String, detail: String },
    RconCommand { issuer: String, command: String },
    AdminNotice { text: String },
    ServerError { text: String },
    CategoryOther { category: String, sub_header: String },
    Unclassified { line: String },
}

impl GameEvent {
    /// Wire form handed to external front-ends.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            warn!("Could not serialize event : {}", err);
            String::new()
        })
    }

    /// Which relay channel class the event belongs on.
    pub fn channel(&self) -> &'static str {
        match self {
            GameEvent::Connected { .. }
            | GameEvent::Disconnected { .. }
            | GameEvent::AdminAction { .. }
            | GameEvent::RconCommand { .. }
            | GameEvent::AdminNotice { .. }
            | GameEvent::ServerError { .. } => "admin",
            GameEvent::CategoryOther { .. } | GameEvent::Unclassified { .. } => "log",
            _ => "public",
        }
    }
}

/// Broadcast handle tagged with the owning connection's name.
#[derive(Clone)]
pub struct EventSink {
    connection: String,
    tx: broadcast::Sender<(String, GameEvent)>,
}

impl EventSink {
    pub fn new(connection: &str, tx: broadcast::Sender<(String, GameEvent)>) -> EventSink {
        EventSink { connection: connection.to_string(), tx }
    }

    pub fn emit(&self, event: GameEvent) {
        trace!("[{}] {:?}", self.connection, event);
        //No subscriber just means no front-end is attached yet
        let _ = self.tx.send((self.connection.clone(), event));
    }
}
