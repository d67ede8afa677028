use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub mod buildings;
pub mod players;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum MatchState {
    Pending,
    InProgress,
    Over,
    Traveling,
}

impl Default for MatchState {
    fn default() -> Self {
        MatchState::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub map: String,
    pub max_players: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteState {
    pub kind: String,
    pub target: String,
    pub starter: String,
    pub yes: u32,
    pub no: u32,
}
