use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use tracing::*;

use crate::commands::{CommandContext, Invoker, ReplySink, TriggerOutcome};
use crate::rcon::codec::{self, PlayerRef};
use crate::rcon::events::{GameEvent, KillKind};
use crate::rcon::{Followup, LinkState, ProtocolError, Session};
use crate::store::bans::BAN_VOTE;
use crate::store::enforcer;
use crate::structures::MatchState;

pub(crate) type Handler = fn(&mut Session, &[String]) -> Result<(), ProtocolError>;
pub(crate) type HandlerTable = HashMap<&'static str, HashMap<&'static str, Handler>>;

/// (category, sub-header) dispatch table, built once per connection. An
/// unrecognized sub-header in a known category falls through to a generic
/// category event, an unknown category to an unclassified-line event.
pub(crate) fn build_handler_table() -> HandlerTable {
    let mut game: HashMap<&'static str, Handler> = HashMap::new();
    game.insert("Death;", game_death as Handler);
    game.insert("Suicide;", game_suicide);
    game.insert("Kill;", game_kill);
    game.insert("Headshot;", game_headshot);
    game.insert("Captured;", game_captured);
    game.insert("Steal;", game_steal);
    game.insert("Beacon;", game_beacon);
    game.insert("Proxy;", game_proxy);
    game.insert("Win;", game_win);
    game.insert("Start;", game_start);
    game.insert("Over;", game_over);
    game.insert("Traveling;", game_traveling);

    let mut chat: HashMap<&'static str, Handler> = HashMap::new();
    chat.insert("Say;", chat_say);
    chat.insert("TeamSay;", chat_teamsay);
    chat.insert("HostSay;", chat_hostsay);
    chat.insert("Page;", chat_page);

    let mut player: HashMap<&'static str, Handler> = HashMap::new();
    player.insert("Enter;", player_enter);
    player.insert("Exit;", player_exit);
    player.insert("TeamJoin;", player_teamjoin);
    player.insert("Rename;", player_rename);
    player.insert("Level;", player_level);
    player.insert("Credits;", player_credits);
    player.insert("Score;", player_score);
    player.insert("Rank;", player_rank);

    let mut rcon: HashMap<&'static str, Handler> = HashMap::new();
    rcon.insert("Subscribed;", rcon_subscribed);
    rcon.insert("InitDone;", rcon_initdone);
    rcon.insert("Pong;", rcon_pong);
    rcon.insert("Command;", rcon_command);

    let mut admin: HashMap<&'static str, Handler> = HashMap::new();
    admin.insert("Kick;", admin_kick);
    admin.insert("Ban;", admin_ban);
    admin.insert("Mute;", admin_mute);

    let mut vote: HashMap<&'static str, Handler> = HashMap::new();
    vote.insert("Started;", vote_started);
    vote.insert("Cast;", vote_cast);
    vote.insert("Passed;", vote_passed);
    vote.insert("Failed;", vote_failed);

    let mut map: HashMap<&'static str, Handler> = HashMap::new();
    map.insert("Load;", map_load);
    map.insert("Loaded;", map_loaded);
    map.insert("Rotation;", map_rotation);
    map.insert("Building;", map_building);

    let mut demo: HashMap<&'static str, Handler> = HashMap::new();
    demo.insert("Start;", demo_start);
    demo.insert("Stop;", demo_stop);

    let mut table = HashMap::new();
    table.insert("GAME", game);
    table.insert("CHAT", chat);
    table.insert("PLAYER", player);
    table.insert("RCON", rcon);
    table.insert("ADMIN", admin);
    table.insert("VOTE", vote);
    table.insert("MAP", map);
    table.insert("DEMO", demo);
    table
}

fn field<'a>(fields: &'a [String], index: usize) -> Result<&'a str, ProtocolError> {
    fields.get(index).map(|s| s.as_str()).ok_or(ProtocolError::MissingField(index))
}

fn num<T: FromStr>(fields: &[String], index: usize) -> Result<T, ProtocolError> {
    let raw = field(fields, index)?;
    raw.parse().map_err(|_| ProtocolError::BadField(index, raw.to_string()))
}

fn pref(fields: &[String], index: usize) -> Result<PlayerRef, ProtocolError> {
    let raw = field(fields, index)?;
    PlayerRef::parse(raw).ok_or_else(|| ProtocolError::BadField(index, raw.to_string()))
}

impl Session {
    /// Parses one line of the server stream and applies it. Protocol errors
    /// are fatal to the session; unknown input never is.
    pub async fn handle_line(&mut self, raw: &str) -> Result<(), ProtocolError> {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(());
        }
        //Until the version banner arrives the legacy delimiter applies
        let delimiter = codec::delimiter_for(if self.version == 0 { 3 } else { self.version });
        let fields = codec::tokenize(line, delimiter);

        let first = &fields[0];
        let header = match first.chars().next() {
            Some(h) => h,
            None => return Ok(()),
        };
        let main = &first[header.len_utf8()..];

        match header {
            'v' => self.handle_version(main, &fields)?,
            'a' => self.handle_auth(),
            'r' => self.handle_response_row(main, &fields),
            'l' => self.handle_log(line, main, &fields)?,
            'c' => {
                //Echo of a command this client sent, per-command parse state resets here
                self.current_command =
                    Some(main.split(' ').next().unwrap_or_default().to_string());
                self.format = None;
            }
            'd' => {}
            'e' => {
                warn!("[{}] Server error : {}", self.name, main);
                self.queue_event(GameEvent::ServerError { text: main.to_string() });
            }
            _ => self.queue_event(GameEvent::Unclassified { line: line.to_string() }),
        }

        self.run_followups().await;
        self.flush_events();
        Ok(())
    }

    fn handle_version(&mut self, main: &str, fields: &[String]) -> Result<(), ProtocolError> {
        if main != "Version" {
            return Err(ProtocolError::BadBanner(main.to_string()));
        }
        let raw = fields.get(1).ok_or(ProtocolError::MissingField(1))?;
        let version = raw.parse::<u32>().map_err(|_| ProtocolError::BadBanner(raw.clone()))?;
        if version < 3 {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        self.version = version;
        self.state = LinkState::Handshaking;
        info!("[{}] Server speaks protocol version {}", self.name, version);
        self.outbound.auth(&self.password);
        self.outbound.subscribe(&self.subscribe_user);
        Ok(())
    }

    /// Auth banner : credentials accepted, prime the derived state.
    fn handle_auth(&mut self) {
        self.outbound.server_info();
        self.outbound.game_info();
        self.outbound.mutator_list();
        self.outbound.rotation_list();
        self.outbound.client_var_list(&["id", "name", "team", "score", "credits"]);
        self.outbound.building_list();
        self.outbound.init_done();
    }

    /// Tabular response row. The first row after a command echo carries the
    /// column names; later rows are zipped against that remembered format.
    fn handle_response_row(&mut self, main: &str, fields: &[String]) {
        let mut row = Vec::with_capacity(fields.len());
        row.push(main.to_string());
        row.extend(fields.iter().skip(1).cloned());

        match &self.format {
            None => self.format = Some(row),
            Some(format) => {
                let map: HashMap<String, String> =
                    format.iter().cloned().zip(row.into_iter()).collect();
                self.apply_response(map);
            }
        }
    }

    fn apply_response(&mut self, row: HashMap<String, String>) {
        let command = self.current_command.clone().unwrap_or_default();
        let cell = |name: &str| row.get(name).cloned().unwrap_or_default();
        match command.as_str() {
            "clientvarlist" => {
                let id = cell("id").parse::<u32>().unwrap_or(0);
                if id == 0 {
                    return;
                }
                let team = cell("team").parse::<i32>().unwrap_or(-1);
                let name = cell("name");
                let (player, _) = self.players.get_or_create(&PlayerRef {
                    team,
                    id,
                    bot: false,
                    transient: false,
                    name,
                });
                player.score = cell("score").parse().unwrap_or(player.score);
                player.credits = cell("credits").parse().unwrap_or(player.credits);
            }
            "buildinglist" => {
                let destroyed = self.buildings.report(
                    &cell("building"),
                    cell("team").parse().unwrap_or(-1),
                    cell("health").parse().unwrap_or(0),
                    cell("maxhealth").parse().unwrap_or(0),
                    cell("armor").parse().unwrap_or(0),
                    cell("maxarmor").parse().unwrap_or(0),
                    cell("capturable") == "1",
                );
                if destroyed {
                    self.queue_event(GameEvent::BuildingDestroyed { name: cell("building") });
                }
            }
            "serverinfo" => {
                self.server_info.hostname = cell("hostname");
                self.server_info.map = cell("map");
                self.server_info.max_players = cell("maxplayers").parse().unwrap_or(0);
            }
            "gameinfo" => {
                if let Ok(state) = MatchState::from_str(&cell("state")) {
                    self.match_state = state;
                }
            }
            "mutatorlist" => {
                let mutator = cell("mutator");
                if !mutator.is_empty() && !self.mutators.contains(&mutator) {
                    self.mutators.push(mutator);
                }
            }
            "rotationlist" => {
                let map = cell("map");
                if !map.is_empty() {
                    self.rotation.push(map);
                }
            }
            _ => trace!("[{}] Ignoring response row for {}", self.name, command),
        }
    }

    fn handle_log(
        &mut self,
        line: &str,
        category: &str,
        fields: &[String],
    ) -> Result<(), ProtocolError> {
        let sub = fields.get(1).map(|s| s.as_str()).unwrap_or_default();
        let table = self.handlers.clone();
        match table.get(category) {
            Some(handlers) => match handlers.get(sub) {
                Some(handler) => {
                    let rest = fields.get(2..).unwrap_or(&[]);
                    handler(self, rest)?;
                }
                None => {
                    debug!("[{}] Unhandled {} event : {}", self.name, category, sub);
                    self.queue_event(GameEvent::CategoryOther {
                        category: category.to_string(),
                        sub_header: sub.to_string(),
                    });
                }
            },
            None => {
                debug!("[{}] Unclassified log line : {}", self.name, line);
                self.queue_event(GameEvent::Unclassified { line: line.to_string() });
            }
        }
        Ok(())
    }

    pub(crate) async fn run_followups(&mut self) {
        let followups = std::mem::take(&mut self.followups);
        for followup in followups {
            match followup {
                Followup::Vet(id) => self.vet_player(id).await,
                Followup::Rdns(id, ip) => self.start_rdns(id, ip),
                Followup::Command { pid, word, args } => {
                    self.run_chat_command(pid, &word, &args).await
                }
            }
        }
    }

    /// Exemption lookup then ban enforcement for one (new or changed) player.
    /// Store failures are reported, never fatal to the session.
    async fn vet_player(&mut self, id: u32) {
        let Session { players, bans, exemptions, sources, outbound, events, .. } = self;
        let player = match players.get_mut(id) {
            Some(p) if !p.bot => p,
            _ => return,
        };
        if let Err(err) = enforcer::exemption_check(player, exemptions).await {
            error!("Exemption check failed for {} : {}", id, err);
        }
        if let Err(err) = enforcer::ban_check(player, bans, sources, outbound, events).await {
            error!("Ban check failed for {} : {}", id, err);
        }
    }

    fn start_rdns(&mut self, id: u32, ip: Ipv4Addr) {
        if let Some(player) = self.players.get_mut(id) {
            if !player.rdns_pending {
                player.rdns_pending = self.rdns.spawn(id, ip);
            }
        }
    }

    async fn run_chat_command(&mut self, pid: u32, word: &str, args: &str) {
        let invoker = match self.players.get(pid) {
            Some(p) => Invoker { pid, name: p.name.clone(), access: p.access },
            None => return,
        };
        let ctx = CommandContext {
            selected: self.name.clone(),
            active: self.name.clone(),
            channel: None,
            channel_type: None,
            reply: ReplySink::Ingame { outbound: self.outbound.clone(), pid },
        };
        match self.router.trigger(word, &invoker, args, &ctx).await {
            TriggerOutcome::NotFound => {
                debug!("[{}] No command for trigger {}", self.name, word)
            }
            outcome => trace!("[{}] Command {} : {:?}", self.name, word, outcome),
        }
    }
}

fn game_death(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let victim_ref = pref(f, 0)?;
    let killer_ref = pref(f, 1)?;
    let weapon = f.get(2).cloned().unwrap_or_default();
    {
        let (victim, _) = s.players.get_or_create(&victim_ref);
        victim.stats.deaths += 1;
    }
    {
        let (killer, _) = s.players.get_or_create(&killer_ref);
        killer.stats.kills += 1;
    }
    s.queue_event(GameEvent::Death {
        victim: victim_ref.name,
        killer: killer_ref.name,
        weapon,
    });
    Ok(())
}

fn game_suicide(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let (player, _) = s.players.get_or_create(&r);
    player.stats.suicides += 1;
    player.stats.deaths += 1;
    let id = player.id;
    s.queue_event(GameEvent::Suicide { id, name: r.name });
    Ok(())
}

fn game_kill(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let killer_ref = pref(f, 0)?;
    let target = field(f, 1)?.to_string();
    let kind_raw = field(f, 2)?;
    let kind = KillKind::from_str(kind_raw)
        .map_err(|_| ProtocolError::BadField(2, kind_raw.to_string()))?;
    let (killer, _) = s.players.get_or_create(&killer_ref);
    match kind {
        KillKind::Vehicle => killer.stats.vehicle_kills += 1,
        KillKind::Building => killer.stats.building_kills += 1,
        KillKind::Defence => killer.stats.defence_kills += 1,
    }
    s.queue_event(GameEvent::ObjectKill { killer: killer_ref.name, target, kind });
    Ok(())
}

fn game_headshot(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let killer_ref = pref(f, 0)?;
    let victim_ref = pref(f, 1)?;
    let (killer, _) = s.players.get_or_create(&killer_ref);
    killer.stats.headshots += 1;
    s.queue_event(GameEvent::Headshot { killer: killer_ref.name, victim: victim_ref.name });
    Ok(())
}

fn game_captured(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let building = field(f, 1)?.to_string();
    let (player, _) = s.players.get_or_create(&r);
    player.stats.captures += 1;
    let id = player.id;
    s.buildings.capture(&building, r.team);
    s.queue_event(GameEvent::Captured { id, building });
    Ok(())
}

fn game_steal(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let vehicle = field(f, 1)?.to_string();
    let (player, _) = s.players.get_or_create(&r);
    player.stats.steals += 1;
    let id = player.id;
    s.queue_event(GameEvent::Steal { id, vehicle });
    Ok(())
}

fn game_beacon(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let placed = field(f, 1)? == "placed";
    let (player, _) = s.players.get_or_create(&r);
    if placed {
        player.stats.beacons_placed += 1;
    } else {
        player.stats.beacons_disarmed += 1;
    }
    let id = player.id;
    s.queue_event(GameEvent::Beacon { id, placed });
    Ok(())
}

fn game_proxy(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let placed = field(f, 1)? == "placed";
    let (player, _) = s.players.get_or_create(&r);
    if placed {
        player.stats.proxies_placed += 1;
    } else {
        player.stats.proxies_disarmed += 1;
    }
    let id = player.id;
    s.queue_event(GameEvent::Proxy { id, placed });
    Ok(())
}

fn game_win(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let team: i32 = num(f, 0)?;
    let reason = f.get(1).cloned().unwrap_or_default();
    s.match_state = MatchState::Over;
    s.queue_event(GameEvent::TeamWon { team, reason });
    s.queue_event(GameEvent::MatchState { state: s.match_state.to_string() });
    Ok(())
}

fn game_start(s: &mut Session, _f: &[String]) -> Result<(), ProtocolError> {
    s.match_state = MatchState::InProgress;
    s.queue_event(GameEvent::MatchState { state: s.match_state.to_string() });
    Ok(())
}

fn game_over(s: &mut Session, _f: &[String]) -> Result<(), ProtocolError> {
    s.match_state = MatchState::Over;
    s.queue_event(GameEvent::MatchState { state: s.match_state.to_string() });
    Ok(())
}

fn game_traveling(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let map = f.get(0).cloned().unwrap_or_default();
    s.match_state = MatchState::Traveling;
    s.queue_event(GameEvent::MatchState { state: s.match_state.to_string() });
    s.queue_event(GameEvent::MapLoaded { map });
    Ok(())
}

fn chat_common(s: &mut Session, f: &[String], team_only: bool) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let text = field(f, 1)?.to_string();
    let id;
    let name;
    {
        let (player, _) = s.players.get_or_create(&r);
        id = player.id;
        name = player.name.clone();
    }
    if let Some(rest) = text.strip_prefix(s.command_prefix) {
        let mut parts = rest.splitn(2, ' ');
        if let Some(word) = parts.next() {
            if !word.is_empty() && !r.transient {
                //Command trigger detection runs before the chat event goes out
                s.followups.push(Followup::Command {
                    pid: id,
                    word: word.to_string(),
                    args: parts.next().unwrap_or_default().to_string(),
                });
            }
        }
    }
    s.queue_event(GameEvent::Chat { id, name, text, team_only });
    Ok(())
}

fn chat_say(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    chat_common(s, f, false)
}

fn chat_teamsay(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    chat_common(s, f, true)
}

fn chat_hostsay(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let text = field(f, 0)?.to_string();
    s.queue_event(GameEvent::HostChat { text });
    Ok(())
}

fn chat_page(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let from = field(f, 0)?.to_string();
    let target = field(f, 1)?.to_string();
    let text = field(f, 2)?.to_string();
    s.queue_event(GameEvent::Page { from, target, text });
    Ok(())
}

fn player_enter(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let steamid: u64 = num(f, 1)?;
    let ip_raw = field(f, 2)?;
    let ip = if ip_raw.is_empty() {
        None
    } else {
        Some(
            ip_raw
                .parse::<Ipv4Addr>()
                .map_err(|_| ProtocolError::BadField(2, ip_raw.to_string()))?,
        )
    };
    let hwid = f.get(3).cloned().unwrap_or_default();

    let id;
    let bot;
    let changed;
    let created;
    {
        let (player, was_created) = s.players.get_or_create(&r);
        changed = player.backfill(steamid, ip, &hwid, &r.name);
        id = player.id;
        bot = player.bot;
        created = was_created;
    }
    if r.transient {
        return Ok(());
    }
    if created || changed {
        s.players.refresh_uuid(id);
    }
    s.queue_event(GameEvent::PlayerJoined { id, name: r.name, team: r.team, bot });
    if !bot && (created || changed) {
        s.followups.push(Followup::Vet(id));
        if s.rdns_enabled {
            if let Some(ip) = ip {
                s.followups.push(Followup::Rdns(id, ip));
            }
        }
    }
    Ok(())
}

fn player_exit(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    if let Some(player) = s.players.remove(r.id) {
        s.queue_event(GameEvent::PlayerLeft { id: player.id, name: player.name });
    }
    Ok(())
}

fn player_teamjoin(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let team: i32 = num(f, 1)?;
    let (player, _) = s.players.get_or_create(&r);
    player.team = team;
    let id = player.id;
    s.queue_event(GameEvent::TeamChanged { id, team });
    Ok(())
}

fn player_rename(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let name = field(f, 1)?.to_string();
    let id;
    let previous;
    let renamed;
    {
        let (player, _) = s.players.get_or_create(&r);
        id = player.id;
        previous = player.name.clone();
        renamed = player.rename(&name);
    }
    if renamed && !r.transient {
        //Name feeds the cross-session identity, so the checks run again
        s.players.refresh_uuid(id);
        s.followups.push(Followup::Vet(id));
        s.queue_event(GameEvent::PlayerRenamed { id, name, previous });
    }
    Ok(())
}

fn player_level(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let access: i32 = num(f, 1)?;
    let admin_type = f.get(2).cloned().unwrap_or_default();
    let (player, _) = s.players.get_or_create(&r);
    player.access = access;
    player.admin_type = admin_type.clone();
    let id = player.id;
    s.queue_event(GameEvent::AccessChanged { id, access, admin_type });
    Ok(())
}

fn player_credits(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let credits: i64 = num(f, 1)?;
    let (player, _) = s.players.get_or_create(&r);
    player.credits = credits;
    Ok(())
}

fn player_score(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let score: i64 = num(f, 1)?;
    let (player, _) = s.players.get_or_create(&r);
    player.score = score;
    Ok(())
}

fn player_rank(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let global: u32 = num(f, 1)?;
    let local: u32 = num(f, 2)?;
    let (player, _) = s.players.get_or_create(&r);
    player.global_rank = global;
    player.local_rank = local;
    Ok(())
}

fn rcon_subscribed(s: &mut Session, _f: &[String]) -> Result<(), ProtocolError> {
    s.subscribed = true;
    Ok(())
}

fn rcon_initdone(s: &mut Session, _f: &[String]) -> Result<(), ProtocolError> {
    s.fully_connected = true;
    s.state = LinkState::FullyConnected;
    info!("[{}] Fully connected", s.name);
    s.queue_event(GameEvent::Connected { version: s.version });
    Ok(())
}

fn rcon_pong(s: &mut Session, _f: &[String]) -> Result<(), ProtocolError> {
    s.ping_outstanding = false;
    Ok(())
}

fn rcon_command(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let issuer = field(f, 0)?.to_string();
    let command = field(f, 1)?.to_string();
    s.queue_event(GameEvent::RconCommand { issuer, command });
    Ok(())
}

fn admin_action(s: &mut Session, f: &[String], action: &str) -> Result<(), ProtocolError> {
    let issuer = field(f, 0)?.to_string();
    let target_ref = pref(f, 1)?;
    let detail = f.get(2).cloned().unwrap_or_default();
    s.queue_event(GameEvent::AdminAction {
        action: action.to_string(),
        issuer,
        target: target_ref.name,
        detail,
    });
    Ok(())
}

fn admin_kick(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    admin_action(s, f, "kick")
}

fn admin_ban(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    admin_action(s, f, "ban")
}

fn admin_mute(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    admin_action(s, f, "mute")
}

fn vote_started(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let kind = field(f, 1)?.to_string();
    let target = f.get(2).cloned().unwrap_or_default();
    let id;
    {
        let (player, _) = s.players.get_or_create(&r);
        id = player.id;
    }
    s.vote = Some(crate::structures::VoteState {
        kind: kind.clone(),
        target: target.clone(),
        starter: r.name,
        yes: 0,
        no: 0,
    });
    s.queue_event(GameEvent::VoteStarted { id, kind, target });
    Ok(())
}

fn vote_cast(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let r = pref(f, 0)?;
    let yes = field(f, 1)? == "yes";
    let id;
    let vote_banned;
    {
        let (player, _) = s.players.get_or_create(&r);
        id = player.id;
        vote_banned = player.ban_flags & BAN_VOTE != 0;
    }
    if vote_banned {
        debug!("[{}] Discarding vote from vote-banned player {}", s.name, id);
        return Ok(());
    }
    if let Some(vote) = &mut s.vote {
        if yes {
            vote.yes += 1;
        } else {
            vote.no += 1;
        }
    }
    s.queue_event(GameEvent::VoteCast { id, yes });
    Ok(())
}

fn vote_ended(s: &mut Session, f: &[String], passed: bool) -> Result<(), ProtocolError> {
    let kind = f.get(0).cloned().unwrap_or_default();
    s.vote = None;
    s.queue_event(GameEvent::VoteEnded { kind, passed });
    Ok(())
}

fn vote_passed(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    vote_ended(s, f, true)
}

fn vote_failed(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    vote_ended(s, f, false)
}

fn map_load(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let map = field(f, 0)?.to_string();
    let seamless = field(f, 1)? == "1";
    if seamless {
        s.players.soft_reset();
    } else {
        for player in s.players.drain() {
            s.queue_event(GameEvent::PlayerLeft { id: player.id, name: player.name });
        }
        s.rdns.detach_all();
    }
    s.buildings.clear();
    s.vote = None;
    s.match_state = MatchState::Pending;
    s.queue_event(GameEvent::MapLoad { map, seamless });
    Ok(())
}

fn map_loaded(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let map = field(f, 0)?.to_string();
    s.server_info.map = map.clone();
    s.queue_event(GameEvent::MapLoaded { map });
    Ok(())
}

fn map_rotation(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let map = field(f, 0)?.to_string();
    s.rotation.push(map.clone());
    s.queue_event(GameEvent::RotationMap { map });
    Ok(())
}

fn map_building(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let name = field(f, 0)?.to_string();
    let team: i32 = num(f, 1)?;
    let health: u32 = num(f, 2)?;
    let max_health: u32 = num(f, 3)?;
    let armor: u32 = num(f, 4)?;
    let max_armor: u32 = num(f, 5)?;
    let capturable = f.get(6).map(|v| v == "1").unwrap_or(false);
    let destroyed = s.buildings.report(&name, team, health, max_health, armor, max_armor, capturable);
    if destroyed {
        s.queue_event(GameEvent::BuildingDestroyed { name });
    }
    Ok(())
}

fn demo_start(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let file = field(f, 0)?.to_string();
    s.queue_event(GameEvent::Demo { file, recording: true });
    Ok(())
}

fn demo_stop(s: &mut Session, f: &[String]) -> Result<(), ProtocolError> {
    let file = field(f, 0)?.to_string();
    s.queue_event(GameEvent::Demo { file, recording: false });
    Ok(())
}
