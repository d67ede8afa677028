use chrono::Utc;
use tracing::*;

use crate::rcon::events::{EventSink, GameEvent};
use crate::rcon::sender::Outbound;
use crate::store::bans::{
    BanEntry, BanStore, BAN_ALERT, BAN_BOT, BAN_CATEGORIES, BAN_CHAT, BAN_GAME, BAN_LADDER,
    BAN_MATCH_RDNS, BAN_MINE, BAN_VOTE,
};
use crate::store::exemptions::{ExemptionStore, EXEMPT_BAN, EXEMPT_KICK};
use crate::store::StoreError;
use crate::structures::players::Player;

/// Which local matching modes are enabled for a connection.
#[derive(Debug, Clone)]
pub struct BanSources {
    pub steamid: bool,
    pub ip: bool,
    pub hwid: bool,
    pub rdns: bool,
    pub name: bool,
}

impl Default for BanSources {
    fn default() -> Self {
        BanSources { steamid: true, ip: true, hwid: true, rdns: true, name: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Kick(usize),
    Mute(usize),
    BotNotice(usize),
    VoteNotice(usize),
    MineBan(usize),
    LadderNotice(usize),
    Alert(usize),
}

#[derive(Debug, Clone, Default)]
pub struct EnforcementReport {
    pub exempt: bool,
    pub matched: u16,
    pub actions: Vec<Action>,
}

/// ORs matching exemption category bits into the player's exemption flags.
pub async fn exemption_check(player: &mut Player, store: &ExemptionStore) -> Result<(), StoreError> {
    if player.id == 0 {
        return Ok(());
    }
    let now = Utc::now().timestamp();
    for entry in store.active_pruned(now).await? {
        let matched = (entry.steamid != 0 && player.steamid != 0 && entry.steamid == player.steamid)
            || player.ip.map(|ip| entry.matches_ip(ip)).unwrap_or(false);
        if matched {
            player.exemption_flags |= entry.flags & (EXEMPT_KICK | EXEMPT_BAN);
        }
    }
    Ok(())
}

fn entry_matches(entry: &BanEntry, player: &Player, sources: &BanSources) -> bool {
    if sources.steamid && entry.steamid != 0 && player.steamid != 0 && entry.steamid == player.steamid
    {
        return true;
    }
    if sources.ip {
        if let Some(ip) = player.ip {
            if entry.matches_ip(ip) {
                return true;
            }
        }
    }
    if sources.hwid && !entry.hwid.is_empty() && entry.hwid == player.hwid {
        return true;
    }
    if sources.rdns && entry.flags & BAN_MATCH_RDNS != 0 && !entry.rdns.is_empty() {
        if let Some(rdns) = &player.rdns {
            if rdns.to_lowercase().contains(&entry.rdns.to_lowercase()) {
                return true;
            }
        }
    }
    if sources.name && !entry.name.is_empty() && entry.name.eq_ignore_ascii_case(&player.name) {
        return true;
    }
    false
}

fn remaining(entry: &BanEntry, now: i64) -> String {
    match entry.expiry() {
        None => "permanent".to_string(),
        Some(expiry) => {
            let left = (expiry - now).max(0) as u64;
            humantime::format_duration(std::time::Duration::from_secs(left)).to_string()
        }
    }
}

fn kick_reason(entry: &BanEntry, now: i64) -> String {
    format!("Banned by {} ({}) : {}", entry.banner, remaining(entry, now), entry.reason)
}

const CATEGORY_BITS: [u16; 7] =
    [BAN_GAME, BAN_CHAT, BAN_BOT, BAN_VOTE, BAN_MINE, BAN_LADDER, BAN_ALERT];
const GAME: usize = 0;
const CHAT: usize = 1;
const BOT: usize = 2;
const VOTE: usize = 3;
const MINE: usize = 4;
const LADDER: usize = 5;
const ALERT: usize = 6;

/// Scans the store against one player and applies the strictest matching
/// policy. Expired entries are lazily deactivated during the scan. One
/// enforcement action per matched category, in fixed priority order.
#[instrument(skip(player, bans, sources, outbound, events), fields(player = player.id))]
pub async fn ban_check(
    player: &mut Player,
    bans: &BanStore,
    sources: &BanSources,
    outbound: &Outbound,
    events: &EventSink,
) -> Result<EnforcementReport, StoreError> {
    let mut report = EnforcementReport::default();
    if player.id == 0 {
        return Ok(report);
    }
    if player.exemption_flags & (EXEMPT_KICK | EXEMPT_BAN) != 0 {
        debug!("Player {} is exempt, skipping ban check", player.id);
        report.exempt = true;
        return Ok(report);
    }

    let now = Utc::now().timestamp();
    let mut best: [Option<BanEntry>; 7] = Default::default();
    for entry in bans.active_pruned(now).await? {
        if !entry_matches(&entry, player, sources) {
            continue;
        }
        report.matched |= entry.flags & BAN_CATEGORIES;
        for (slot, bit) in CATEGORY_BITS.iter().enumerate() {
            if entry.flags & bit == 0 {
                continue;
            }
            //Track the single last-to-expire entry per category
            let replace = best[slot].as_ref().map(|cur| entry.outlives(cur)).unwrap_or(true);
            if replace {
                best[slot] = Some(entry.clone());
            }
        }
    }
    player.ban_flags |= report.matched;

    if let Some(entry) = &best[GAME] {
        outbound.kick(player.id, &kick_reason(entry, now));
        events.emit(GameEvent::AdminNotice {
            text: format!("{} force-kicked (ban #{} : {})", player.name, entry.position, entry.reason),
        });
        report.actions.push(Action::Kick(entry.position));
    } else if let Some(entry) = &best[CHAT] {
        outbound.mute(player.id);
        outbound.host_private_say(
            player.id,
            &format!("You are chat-banned ({})", remaining(entry, now)),
        );
        report.actions.push(Action::Mute(entry.position));
    } else if let Some(entry) = &best[BOT] {
        outbound.host_private_say(player.id, "You are banned from using bots");
        report.actions.push(Action::BotNotice(entry.position));
    }

    if let Some(entry) = &best[VOTE] {
        outbound.host_private_say(
            player.id,
            &format!("You are banned from voting ({})", remaining(entry, now)),
        );
        report.actions.push(Action::VoteNotice(entry.position));
    }
    if let Some(entry) = &best[MINE] {
        outbound.mine_ban(player.id);
        outbound.host_private_say(player.id, "You are banned from placing mines");
        report.actions.push(Action::MineBan(entry.position));
    }
    if let Some(entry) = &best[LADDER] {
        outbound.host_private_say(player.id, "Your results are excluded from the ladder");
        report.actions.push(Action::LadderNotice(entry.position));
    }
    if let Some(entry) = &best[ALERT] {
        //Alert never restricts, it only flags the player to the moderators
        events.emit(GameEvent::AdminNotice {
            text: format!(
                "Watch notice : {} matched alert entry #{} ({})",
                player.name, entry.position, entry.reason
            ),
        });
        report.actions.push(Action::Alert(entry.position));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::sync::broadcast;

    use super::*;
    use crate::rcon::codec::PlayerRef;
    use crate::store::exemptions::EXEMPT_ACTIVE;
    use crate::structures::players::PlayerTable;

    fn player(id: u32, steamid: u64, ip: Option<Ipv4Addr>) -> Player {
        let mut table = PlayerTable::default();
        let (p, _) = table.get_or_create(&PlayerRef {
            team: 0,
            id,
            bot: false,
            transient: id == 0,
            name: format!("player-{}", id),
        });
        p.backfill(steamid, ip, "", "");
        p.clone()
    }

    fn sink() -> (EventSink, broadcast::Receiver<(String, GameEvent)>) {
        let (tx, rx) = broadcast::channel(16);
        (EventSink::new("test", tx), rx)
    }

    #[tokio::test]
    async fn game_ban_kicks_on_exact_ip() {
        let dir = tempfile::tempdir().unwrap();
        let bans = BanStore::open(&dir.path().join("bans.dat")).await.unwrap();
        bans.add(BAN_GAME, 0, 0, u32::from(Ipv4Addr::new(10, 0, 0, 5)), 32, "", "", "", "mod", "evasion")
            .await
            .unwrap();
        let (out, mut rx) = Outbound::channel();
        let (events, _keep) = sink();

        let mut banned = player(7, 0, Some(Ipv4Addr::new(10, 0, 0, 5)));
        let report =
            ban_check(&mut banned, &bans, &BanSources::default(), &out, &events).await.unwrap();
        assert_eq!(report.actions, vec![Action::Kick(0)]);
        assert_ne!(banned.ban_flags & BAN_GAME, 0);
        assert!(rx.try_recv().unwrap().starts_with("ckick pid7 "));

        let mut bystander = player(8, 0, Some(Ipv4Addr::new(10, 0, 0, 6)));
        let report =
            ban_check(&mut bystander, &bans, &BanSources::default(), &out, &events).await.unwrap();
        assert!(report.actions.is_empty());
        assert_eq!(bystander.ban_flags, 0);
    }

    #[tokio::test]
    async fn exemption_suppresses_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let bans = BanStore::open(&dir.path().join("bans.dat")).await.unwrap();
        let exemptions = ExemptionStore::open(&dir.path().join("ex.dat")).await.unwrap();
        bans.add(BAN_GAME, 0, 12345, 0, 0, "", "", "", "mod", "x").await.unwrap();
        exemptions.add(EXEMPT_ACTIVE | EXEMPT_BAN, 0, 12345, 0, 0, "root").await.unwrap();

        let mut p = player(7, 12345, None);
        exemption_check(&mut p, &exemptions).await.unwrap();
        assert_ne!(p.exemption_flags & EXEMPT_BAN, 0);

        let (out, mut rx) = Outbound::channel();
        let (events, _keep) = sink();
        let report = ban_check(&mut p, &bans, &BanSources::default(), &out, &events).await.unwrap();
        assert!(report.exempt);
        assert!(report.actions.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn permanent_entry_wins_last_to_expire() {
        let dir = tempfile::tempdir().unwrap();
        let bans = BanStore::open(&dir.path().join("bans.dat")).await.unwrap();
        let dated =
            bans.add(BAN_CHAT, 86_400, 12345, 0, 0, "", "", "", "mod", "dated").await.unwrap();
        let permanent = bans.add(BAN_CHAT, 0, 12345, 0, 0, "", "", "", "mod", "perm").await.unwrap();
        assert_ne!(dated, permanent);

        let (out, _rx) = Outbound::channel();
        let (events, _keep) = sink();
        let mut p = player(3, 12345, None);
        let report = ban_check(&mut p, &bans, &BanSources::default(), &out, &events).await.unwrap();
        assert_eq!(report.actions, vec![Action::Mute(permanent)]);
    }

    #[tokio::test]
    async fn ban_check_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bans = BanStore::open(&dir.path().join("bans.dat")).await.unwrap();
        bans.add(BAN_CHAT | BAN_MINE, 0, 12345, 0, 0, "", "", "", "mod", "x").await.unwrap();

        let (out, mut rx) = Outbound::channel();
        let (events, _keep) = sink();
        let mut p = player(3, 12345, None);
        let first = ban_check(&mut p, &bans, &BanSources::default(), &out, &events).await.unwrap();
        let second = ban_check(&mut p, &bans, &BanSources::default(), &out, &events).await.unwrap();
        assert_eq!(first.matched, second.matched);
        assert_eq!(first.actions, second.actions);
        assert_eq!(p.ban_flags, first.matched);
        //Re-muting an already muted player repeats the same single command
        let sent: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(sent.iter().filter(|l| l.starts_with("cmute")).count(), 2);
        assert_eq!(sent.iter().filter(|l| l.starts_with("cmineban")).count(), 2);
    }

    #[tokio::test]
    async fn alert_notifies_without_restricting() {
        let dir = tempfile::tempdir().unwrap();
        let bans = BanStore::open(&dir.path().join("bans.dat")).await.unwrap();
        bans.add(BAN_ALERT, 0, 12345, 0, 0, "", "", "", "mod", "watch this one").await.unwrap();

        let (out, mut out_rx) = Outbound::channel();
        let (events, mut rx) = sink();
        let mut p = player(3, 12345, None);
        let report = ban_check(&mut p, &bans, &BanSources::default(), &out, &events).await.unwrap();
        assert_eq!(report.actions, vec![Action::Alert(0)]);
        assert!(out_rx.try_recv().is_err());
        let (_, event) = rx.try_recv().unwrap();
        assert!(matches!(event, GameEvent::AdminNotice { .. }));
        assert_eq!(event.channel(), "admin");
    }
}
