use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::rcon::codec::PlayerRef;

/// Slots reserved for transient actors (`ai` references). Records in this
/// buffer are never inserted into the table, persisted or ban-checked.
const TRANSIENT_SLOTS: usize = 8;

/// Derives the stable cross-session identity from (steamid, ip, hwid, name).
pub type UuidDeriver = fn(u64, Option<Ipv4Addr>, &str, &str) -> Uuid;

pub fn default_uuid(steamid: u64, ip: Option<Ipv4Addr>, hwid: &str, name: &str) -> Uuid {
    let ip = ip.map(u32::from).unwrap_or_default();
    let seed = format!("{}|{}|{}|{}", steamid, ip, hwid, name.to_lowercase());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes())
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MatchStats {
    pub kills: u32,
    pub deaths: u32,
    pub suicides: u32,
    pub headshots: u32,
    pub vehicle_kills: u32,
    pub building_kills: u32,
    pub defence_kills: u32,
    pub beacons_placed: u32,
    pub beacons_disarmed: u32,
    pub proxies_placed: u32,
    pub proxies_disarmed: u32,
    pub captures: u32,
    pub steals: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Player {
    pub id: u32,
    pub name: String,
    pub team: i32,
    pub bot: bool,
    pub steamid: u64,
    pub hwid: String,
    pub ip: Option<Ipv4Addr>,
    pub rdns: Option<String>,
    pub rdns_pending: bool,
    pub stats: MatchStats,
    pub score: i64,
    pub credits: i64,
    pub access: i32,
    pub admin_type: String,
    pub ban_flags: u16,
    pub exemption_flags: u8,
    pub joined: DateTime<Utc>,
    pub global_rank: u32,
    pub local_rank: u32,
    pub uuid: Uuid,
}

impl Player {
    fn new(id: u32, name: &str, team: i32, bot: bool) -> Player {
        Player {
            id,
            name: name.to_string(),
            team,
            bot,
            steamid: 0,
            hwid: String::new(),
            ip: None,
            rdns: None,
            rdns_pending: false,
            stats: MatchStats::default(),
            score: 0,
            credits: 0,
            access: 0,
            admin_type: String::new(),
            ban_flags: 0,
            exemption_flags: 0,
            joined: Utc::now(),
            global_rank: 0,
            local_rank: 0,
            uuid: Uuid::nil(),
        }
    }

    pub fn ip_string(&self) -> String {
        self.ip.map(|ip| ip.to_string()).unwrap_or_default()
    }

    /// Fills empty identity fields only. A populated steamid/ip/hwid/name is
    /// never replaced by an equal or blanker value. Returns whether an
    /// identity-relevant field actually changed.
    pub fn backfill(&mut self, steamid: u64, ip: Option<Ipv4Addr>, hwid: &str, name: &str) -> bool {
        let mut changed = false;
        if self.steamid == 0 && steamid != 0 {
            self.steamid = steamid;
            changed = true;
        }
        if self.ip.is_none() && ip.is_some() {
            self.ip = ip;
            changed = true;
        }
        if self.hwid.is_empty() && !hwid.is_empty() {
            self.hwid = hwid.to_string();
            changed = true;
        }
        if self.name.is_empty() && !name.is_empty() {
            self.name = name.to_string();
            changed = true;
        }
        changed
    }

    pub fn rename(&mut self, name: &str) -> bool {
        if name.is_empty() || self.name == name {
            return false;
        }
        self.name = name.to_string();
        true
    }

    pub fn reset_match(&mut self) {
        self.stats = MatchStats::default();
        self.score = 0;
        self.credits = 0;
    }
}

pub struct PlayerTable {
    players: HashMap<u32, Player>,
    transient: Vec<Player>,
    next_transient: usize,
    pub bot_count: u32,
    derive_uuid: UuidDeriver,
}

impl Default for PlayerTable {
    fn default() -> Self {
        PlayerTable::new(default_uuid)
    }
}

impl PlayerTable {
    pub fn new(derive_uuid: UuidDeriver) -> PlayerTable {
        PlayerTable {
            players: HashMap::new(),
            transient: Vec::with_capacity(TRANSIENT_SLOTS),
            next_transient: 0,
            bot_count: 0,
            derive_uuid,
        }
    }

    /// Looks up or creates the record a protocol player reference points at.
    /// Transient references are served from the rotating buffer.
    pub fn get_or_create(&mut self, pref: &PlayerRef) -> (&mut Player, bool) {
        if pref.transient {
            let slot = self.next_transient % TRANSIENT_SLOTS;
            self.next_transient = self.next_transient.wrapping_add(1);
            let record = Player::new(0, &pref.name, pref.team, pref.bot);
            if slot < self.transient.len() {
                self.transient[slot] = record;
            } else {
                self.transient.push(record);
            }
            return (&mut self.transient[slot], false);
        }

        let mut created = false;
        let bot_count = &mut self.bot_count;
        let player = self.players.entry(pref.id).or_insert_with(|| {
            created = true;
            if pref.bot {
                *bot_count += 1;
            }
            Player::new(pref.id, &pref.name, pref.team, pref.bot)
        });
        if !created {
            player.team = pref.team;
            player.backfill(0, None, "", &pref.name);
        }
        (player, created)
    }

    pub fn refresh_uuid(&mut self, id: u32) {
        let derive = self.derive_uuid;
        if let Some(p) = self.players.get_mut(&id) {
            p.uuid = derive(p.steamid, p.ip, &p.hwid, &p.name);
        }
    }

    pub fn get(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<Player> {
        let removed = self.players.remove(&id);
        if let Some(p) = &removed {
            if p.bot {
                self.bot_count = self.bot_count.saturating_sub(1);
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Seamless transition: stats are zeroed, identity survives.
    pub fn soft_reset(&mut self) {
        for player in self.players.values_mut() {
            player.reset_match();
        }
    }

    /// Non-seamless transition: the whole roster leaves. The removed records
    /// are handed back so deletion events can be fired for each.
    pub fn drain(&mut self) -> Vec<Player> {
        self.bot_count = 0;
        self.players.drain().map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pref(id: u32, name: &str) -> PlayerRef {
        PlayerRef { team: 0, id, bot: false, transient: id == 0, name: name.to_string() }
    }

    #[test]
    fn creates_then_reuses_records() {
        let mut table = PlayerTable::default();
        let (_, created) = table.get_or_create(&pref(7, "One"));
        assert!(created);
        let (p, created) = table.get_or_create(&pref(7, "One"));
        assert!(!created);
        assert_eq!(p.id, 7);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn transient_records_never_enter_the_table() {
        let mut table = PlayerTable::default();
        for i in 0..20 {
            let (p, created) = table.get_or_create(&PlayerRef {
                team: 2,
                id: 0,
                bot: false,
                transient: true,
                name: format!("turret-{}", i),
            });
            assert_eq!(p.id, 0);
            assert!(!created);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn backfill_never_overwrites_identity() {
        let mut table = PlayerTable::default();
        let (p, _) = table.get_or_create(&pref(3, "Name"));
        assert!(p.backfill(42, Some(Ipv4Addr::new(10, 0, 0, 5)), "hw", "Name"));
        // a second report with blank fields must not erase anything
        assert!(!p.backfill(0, None, "", ""));
        assert_eq!(p.steamid, 42);
        assert_eq!(p.ip_string(), "10.0.0.5");
        // a different value for an already populated field is ignored too
        assert!(!p.backfill(99, None, "other", "Name"));
        assert_eq!(p.steamid, 42);
        assert_eq!(p.hwid, "hw");
    }

    #[test]
    fn soft_reset_keeps_identity_and_zeroes_stats() {
        let mut table = PlayerTable::default();
        let (p, _) = table.get_or_create(&pref(7, "One"));
        p.steamid = 12345;
        p.stats.kills = 3;
        p.score = 100;
        p.credits = 40;
        table.soft_reset();
        let p = table.get(7).unwrap();
        assert_eq!(p.steamid, 12345);
        assert_eq!(p.stats.kills, 0);
        assert_eq!(p.score, 0);
        assert_eq!(p.credits, 0);
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table = PlayerTable::default();
        table.get_or_create(&pref(1, "a"));
        table.get_or_create(&pref(2, "b"));
        let removed = table.drain();
        assert_eq!(removed.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn uuid_derivation_is_stable() {
        let ip = Some(Ipv4Addr::new(1, 2, 3, 4));
        let a = default_uuid(42, ip, "hw", "Name");
        let b = default_uuid(42, ip, "hw", "name");
        assert_eq!(a, b);
        assert_ne!(a, default_uuid(43, ip, "hw", "name"));
    }
}
