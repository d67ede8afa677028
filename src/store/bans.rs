use std::io::{Cursor, SeekFrom};
use std::net::Ipv4Addr;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::*;

use crate::store::{check_header, read_string, write_string, StoreError, HEADER_LEN};

pub const BAN_MAGIC: &[u8; 4] = b"OVBN";
/// Current on-disk schema. v1 carried neither rdns nor hwid, v2 added rdns,
/// v3 added hwid.
pub const BAN_SCHEMA: u8 = 3;

pub const BAN_ACTIVE: u16 = 0x0001;
pub const BAN_MATCH_RDNS: u16 = 0x0002;
pub const BAN_GAME: u16 = 0x0004;
pub const BAN_CHAT: u16 = 0x0008;
pub const BAN_BOT: u16 = 0x0010;
pub const BAN_VOTE: u16 = 0x0020;
pub const BAN_MINE: u16 = 0x0040;
pub const BAN_LADDER: u16 = 0x0080;
pub const BAN_ALERT: u16 = 0x0100;

pub const BAN_CATEGORIES: u16 =
    BAN_GAME | BAN_CHAT | BAN_BOT | BAN_VOTE | BAN_MINE | BAN_LADDER | BAN_ALERT;

#[derive(Debug, Clone)]
pub struct BanEntry {
    pub position: usize,
    pub flags: u16,
    pub created: i64,
    pub duration: u32,
    pub steamid: u64,
    pub ip: u32,
    pub prefix: u8,
    pub hwid: String,
    pub rdns: String,
    pub name: String,
    pub banner: String,
    pub reason: String,
    offset: u64,
}

impl BanEntry {
    pub fn is_active(&self) -> bool {
        self.flags & BAN_ACTIVE != 0
    }

    pub fn is_permanent(&self) -> bool {
        self.duration == 0
    }

    /// Absolute expiry in unix seconds, None for permanent entries.
    pub fn expiry(&self) -> Option<i64> {
        (self.duration > 0).then(|| self.created + self.duration as i64)
    }

    pub fn expired(&self, now: i64) -> bool {
        self.expiry().map(|e| e <= now).unwrap_or(false)
    }

    pub fn matches_ip(&self, ip: Ipv4Addr) -> bool {
        if self.ip == 0 || self.prefix == 0 {
            return false;
        }
        let prefix = self.prefix.min(32) as u32;
        let mask = u32::MAX << (32 - prefix);
        (u32::from(ip) & mask) == (self.ip & mask)
    }

    /// Whether this restriction outlives `other`. Permanent entries win ties;
    /// among dated entries the later absolute expiry wins.
    pub fn outlives(&self, other: &BanEntry) -> bool {
        match (self.expiry(), other.expiry()) {
            (None, None) => false,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a > b,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.created.to_le_bytes());
        buf.extend_from_slice(&self.duration.to_le_bytes());
        buf.extend_from_slice(&self.steamid.to_le_bytes());
        buf.extend_from_slice(&self.ip.to_le_bytes());
        buf.push(self.prefix);
        write_string(&mut buf, &self.hwid);
        write_string(&mut buf, &self.rdns);
        write_string(&mut buf, &self.name);
        write_string(&mut buf, &self.banner);
        write_string(&mut buf, &self.reason);
        buf
    }

    fn decode(
        cur: &mut Cursor<&[u8]>,
        schema: u8,
        position: usize,
        offset: u64,
    ) -> Result<BanEntry, StoreError> {
        let flags = cur.read_u16::<LittleEndian>()?;
        let created = cur.read_i64::<LittleEndian>()?;
        let duration = cur.read_u32::<LittleEndian>()?;
        let steamid = cur.read_u64::<LittleEndian>()?;
        let ip = cur.read_u32::<LittleEndian>()?;
        let prefix = cur.read_u8()?;
        let hwid = if schema >= 3 { read_string(cur)? } else { String::new() };
        let rdns = if schema >= 2 { read_string(cur)? } else { String::new() };
        let name = read_string(cur)?;
        let banner = read_string(cur)?;
        let reason = read_string(cur)?;
        Ok(BanEntry {
            position,
            flags,
            created,
            duration,
            steamid,
            ip,
            prefix,
            hwid,
            rdns,
            name,
            banner,
            reason,
            offset,
        })
    }
}

pub struct BanStore {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: Vec<BanEntry>,
    file: File,
}

impl BanStore {
    #[instrument(name = "ban_store_open")]
    pub async fn open(path: &Path) -> Result<BanStore, StoreError> {
        let entries = match tokio::fs::read(path).await {
            Ok(data) => {
                let schema = check_header(&data, BAN_MAGIC, BAN_SCHEMA)?;
                let mut entries = decode_all(&data, schema)?;
                if schema < BAN_SCHEMA {
                    info!("Upgrading ban store from schema {} to {}", schema, BAN_SCHEMA);
                    rewrite(path, &mut entries).await?;
                }
                entries
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut header = BAN_MAGIC.to_vec();
                header.push(BAN_SCHEMA);
                tokio::fs::write(path, header).await?;
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        info!("Loaded {} ban entries", entries.len());
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        Ok(BanStore { inner: Mutex::new(Inner { entries, file }) })
    }

    /// Appends a new entry and returns its position. The entry is on disk
    /// before the position is handed back.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, hwid, rdns, name, banner, reason), level = "debug")]
    pub async fn add(
        &self,
        flags: u16,
        duration: u32,
        steamid: u64,
        ip: u32,
        prefix: u8,
        hwid: &str,
        rdns: &str,
        name: &str,
        banner: &str,
        reason: &str,
    ) -> Result<usize, StoreError> {
        let mut guard = self.inner.lock().await;
        let Inner { entries, file } = &mut *guard;
        let position = entries.len();
        let mut entry = BanEntry {
            position,
            flags: flags | BAN_ACTIVE,
            created: Utc::now().timestamp(),
            duration,
            steamid,
            ip,
            prefix,
            hwid: hwid.to_string(),
            rdns: rdns.to_string(),
            name: name.to_string(),
            banner: banner.to_string(),
            reason: reason.to_string(),
            offset: 0,
        };
        entry.offset = file.seek(SeekFrom::End(0)).await?;
        file.write_all(&entry.encode()).await?;
        file.sync_data().await?;
        entries.push(entry);
        Ok(position)
    }

    /// Clears the active bit in place. Returns whether the entry had been
    /// active; the record itself is never deleted.
    #[instrument(skip(self), level = "debug")]
    pub async fn deactivate(&self, position: usize) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        let Inner { entries, file } = &mut *guard;
        let entry = entries.get_mut(position).ok_or(StoreError::UnknownPosition(position))?;
        if entry.flags & BAN_ACTIVE == 0 {
            return Ok(false);
        }
        entry.flags &= !BAN_ACTIVE;
        file.seek(SeekFrom::Start(entry.offset)).await?;
        file.write_all(&entry.flags.to_le_bytes()).await?;
        file.sync_data().await?;
        Ok(true)
    }

    /// Snapshot of the still-active entries. Entries whose expiry has passed
    /// are deactivated on the way through, persisting the flag rewrite.
    pub async fn active_pruned(&self, now: i64) -> Result<Vec<BanEntry>, StoreError> {
        let mut guard = self.inner.lock().await;
        let Inner { entries, file } = &mut *guard;
        let mut active = Vec::new();
        for entry in entries.iter_mut() {
            if entry.flags & BAN_ACTIVE == 0 {
                continue;
            }
            if entry.expired(now) {
                debug!("Ban {} expired, deactivating", entry.position);
                entry.flags &= !BAN_ACTIVE;
                file.seek(SeekFrom::Start(entry.offset)).await?;
                file.write_all(&entry.flags.to_le_bytes()).await?;
                file.sync_data().await?;
                continue;
            }
            active.push(entry.clone());
        }
        Ok(active)
    }

    pub async fn entry(&self, position: usize) -> Option<BanEntry> {
        self.inner.lock().await.entries.get(position).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

fn decode_all(data: &[u8], schema: u8) -> Result<Vec<BanEntry>, StoreError> {
    let mut cur = Cursor::new(data);
    cur.set_position(HEADER_LEN);
    let mut entries = Vec::new();
    while (cur.position() as usize) < data.len() {
        let offset = cur.position();
        entries.push(BanEntry::decode(&mut cur, schema, entries.len(), offset)?);
    }
    Ok(entries)
}

/// Rewrites the whole file in the current layout, preserving record order and
/// positions. Used once on load when an older schema is found.
async fn rewrite(path: &Path, entries: &mut [BanEntry]) -> Result<(), StoreError> {
    let mut buf = BAN_MAGIC.to_vec();
    buf.push(BAN_SCHEMA);
    for entry in entries.iter_mut() {
        entry.offset = buf.len() as u64;
        buf.extend_from_slice(&entry.encode());
    }
    tokio::fs::write(path, buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("bans.dat")
    }

    async fn add_simple(store: &BanStore, flags: u16, duration: u32) -> usize {
        store
            .add(flags, duration, 12345, 0, 0, "", "", "Player", "admin", "testing")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn add_assigns_sequential_positions() {
        let dir = tempfile::tempdir().unwrap();
        let store = BanStore::open(&temp_store_path(&dir)).await.unwrap();
        assert_eq!(add_simple(&store, BAN_GAME, 0).await, 0);
        assert_eq!(add_simple(&store, BAN_CHAT, 60).await, 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BanStore::open(&temp_store_path(&dir)).await.unwrap();
        let pos = add_simple(&store, BAN_GAME, 0).await;
        assert!(store.deactivate(pos).await.unwrap());
        assert!(!store.deactivate(pos).await.unwrap());
        assert!(!store.entry(pos).await.unwrap().is_active());
        assert!(matches!(store.deactivate(99).await, Err(StoreError::UnknownPosition(99))));
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);
        {
            let store = BanStore::open(&path).await.unwrap();
            let pos = store
                .add(BAN_GAME | BAN_ALERT, 3600, 7777, u32::from(Ipv4Addr::new(10, 0, 0, 5)), 32, "hw-1", "host.example", "Cheater", "mod", "aimbot")
                .await
                .unwrap();
            store.deactivate(pos).await.unwrap();
            store.add(BAN_CHAT, 0, 0, 0, 0, "", "", "Loud", "mod", "spam").await.unwrap();
        }
        let store = BanStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);
        let first = store.entry(0).await.unwrap();
        assert!(!first.is_active());
        assert_eq!(first.steamid, 7777);
        assert_eq!(first.hwid, "hw-1");
        assert_eq!(first.rdns, "host.example");
        let second = store.entry(1).await.unwrap();
        assert!(second.is_active());
        assert!(second.is_permanent());
        assert_eq!(second.reason, "spam");
    }

    #[tokio::test]
    async fn lazy_expiry_deactivates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);
        let store = BanStore::open(&path).await.unwrap();
        let expired = add_simple(&store, BAN_GAME, 10).await;
        let permanent = add_simple(&store, BAN_GAME, 0).await;

        let now = Utc::now().timestamp() + 3600;
        let active = store.active_pruned(now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].position, permanent);
        assert!(!store.entry(expired).await.unwrap().is_active());

        drop(store);
        let store = BanStore::open(&path).await.unwrap();
        assert!(!store.entry(expired).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn upgrades_legacy_schemas_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store_path(&dir);

        // handcrafted v1 file : no hwid, no rdns
        let mut data = BAN_MAGIC.to_vec();
        data.push(1);
        data.extend_from_slice(&(BAN_ACTIVE | BAN_GAME).to_le_bytes());
        data.extend_from_slice(&1_600_000_000_i64.to_le_bytes());
        data.extend_from_slice(&0_u32.to_le_bytes());
        data.extend_from_slice(&4242_u64.to_le_bytes());
        data.extend_from_slice(&u32::from(Ipv4Addr::new(192, 0, 2, 1)).to_le_bytes());
        data.push(24);
        for s in ["Old Name", "old-admin", "legacy reason"] {
            data.extend_from_slice(&(s.len() as u16).to_le_bytes());
            data.extend_from_slice(s.as_bytes());
        }
        std::fs::write(&path, data).unwrap();

        let store = BanStore::open(&path).await.unwrap();
        let entry = store.entry(0).await.unwrap();
        assert_eq!(entry.steamid, 4242);
        assert_eq!(entry.name, "Old Name");
        assert_eq!(entry.hwid, "");
        assert_eq!(entry.rdns, "");
        assert!(entry.is_active());

        // on-disk schema byte is now current and the file reloads cleanly
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw[4], BAN_SCHEMA);
        drop(store);
        let store = BanStore::open(&path).await.unwrap();
        assert_eq!(store.entry(0).await.unwrap().name, "Old Name");
    }

    #[test]
    fn ip_prefix_matching() {
        let entry = BanEntry {
            position: 0,
            flags: BAN_ACTIVE | BAN_GAME,
            created: 0,
            duration: 0,
            steamid: 0,
            ip: u32::from(Ipv4Addr::new(10, 0, 0, 5)),
            prefix: 32,
            hwid: String::new(),
            rdns: String::new(),
            name: String::new(),
            banner: String::new(),
            reason: String::new(),
            offset: 0,
        };
        assert!(entry.matches_ip(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!entry.matches_ip(Ipv4Addr::new(10, 0, 0, 6)));

        let subnet = BanEntry { prefix: 24, ..entry.clone() };
        assert!(subnet.matches_ip(Ipv4Addr::new(10, 0, 0, 6)));
        assert!(!subnet.matches_ip(Ipv4Addr::new(10, 0, 1, 6)));
    }

    #[test]
    fn permanent_outlives_dated() {
        let dated = BanEntry {
            position: 0,
            flags: BAN_ACTIVE,
            created: 1000,
            duration: 10_000,
            steamid: 0,
            ip: 0,
            prefix: 0,
            hwid: String::new(),
            rdns: String::new(),
            name: String::new(),
            banner: String::new(),
            reason: String::new(),
            offset: 0,
        };
        let permanent = BanEntry { duration: 0, ..dated.clone() };
        let later = BanEntry { duration: 20_000, ..dated.clone() };
        assert!(permanent.outlives(&dated));
        assert!(!dated.outlives(&permanent));
        assert!(later.outlives(&dated));
        assert!(!permanent.outlives(&permanent.clone()));
    }
}
