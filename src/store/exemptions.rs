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

pub const EXEMPTION_MAGIC: &[u8; 4] = b"OVEX";
/// Current on-disk schema. v1 had no ip/prefix fields.
pub const EXEMPTION_SCHEMA: u8 = 2;

pub const EXEMPT_ACTIVE: u8 = 0x01;
pub const EXEMPT_MATCH_IP: u8 = 0x02;
pub const EXEMPT_KICK: u8 = 0x04;
pub const EXEMPT_BAN: u8 = 0x08;

#[derive(Debug, Clone)]
pub struct ExemptionEntry {
    pub position: usize,
    pub flags: u8,
    pub created: i64,
    pub duration: u32,
    pub steamid: u64,
    pub ip: u32,
    pub prefix: u8,
    pub setter: String,
    offset: u64,
}

impl ExemptionEntry {
    pub fn is_active(&self) -> bool {
        self.flags & EXEMPT_ACTIVE != 0
    }

    pub fn expiry(&self) -> Option<i64> {
        (self.duration > 0).then(|| self.created + self.duration as i64)
    }

    pub fn expired(&self, now: i64) -> bool {
        self.expiry().map(|e| e <= now).unwrap_or(false)
    }

    pub fn matches_ip(&self, ip: Ipv4Addr) -> bool {
        if self.flags & EXEMPT_MATCH_IP == 0 || self.ip == 0 || self.prefix == 0 {
            return false;
        }
        let prefix = self.prefix.min(32) as u32;
        let mask = u32::MAX << (32 - prefix);
        (u32::from(ip) & mask) == (self.ip & mask)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(self.flags);
        buf.extend_from_slice(&self.created.to_le_bytes());
        buf.extend_from_slice(&self.duration.to_le_bytes());
        buf.extend_from_slice(&self.steamid.to_le_bytes());
        buf.extend_from_slice(&self.ip.to_le_bytes());
        buf.push(self.prefix);
        write_string(&mut buf, &self.setter);
        buf
    }

    fn decode(
        cur: &mut Cursor<&[u8]>,
        schema: u8,
        position: usize,
        offset: u64,
    ) -> Result<ExemptionEntry, StoreError> {
        let flags = cur.read_u8()?;
        let created = cur.read_i64::<LittleEndian>()?;
        let duration = cur.read_u32::<LittleEndian>()?;
        let steamid = cur.read_u64::<LittleEndian>()?;
        let (ip, prefix) = if schema >= 2 {
            (cur.read_u32::<LittleEndian>()?, cur.read_u8()?)
        } else {
            (0, 0)
        };
        let setter = read_string(cur)?;
        Ok(ExemptionEntry { position, flags, created, duration, steamid, ip, prefix, setter, offset })
    }
}

pub struct ExemptionStore {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: Vec<ExemptionEntry>,
    file: File,
}

impl ExemptionStore {
    #[instrument(name = "exemption_store_open")]
    pub async fn open(path: &Path) -> Result<ExemptionStore, StoreError> {
        let entries = match tokio::fs::read(path).await {
            Ok(data) => {
                let schema = check_header(&data, EXEMPTION_MAGIC, EXEMPTION_SCHEMA)?;
                let mut entries = decode_all(&data, schema)?;
                if schema < EXEMPTION_SCHEMA {
                    info!("Upgrading exemption store from schema {} to {}", schema, EXEMPTION_SCHEMA);
                    rewrite(path, &mut entries).await?;
                }
                entries
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut header = EXEMPTION_MAGIC.to_vec();
                header.push(EXEMPTION_SCHEMA);
                tokio::fs::write(path, header).await?;
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        info!("Loaded {} exemption entries", entries.len());
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        Ok(ExemptionStore { inner: Mutex::new(Inner { entries, file }) })
    }

    #[instrument(skip(self, setter), level = "debug")]
    pub async fn add(
        &self,
        flags: u8,
        duration: u32,
        steamid: u64,
        ip: u32,
        prefix: u8,
        setter: &str,
    ) -> Result<usize, StoreError> {
        let mut guard = self.inner.lock().await;
        let Inner { entries, file } = &mut *guard;
        let position = entries.len();
        let mut entry = ExemptionEntry {
            position,
            flags: flags | EXEMPT_ACTIVE,
            created: Utc::now().timestamp(),
            duration,
            steamid,
            ip,
            prefix,
            setter: setter.to_string(),
            offset: 0,
        };
        entry.offset = file.seek(SeekFrom::End(0)).await?;
        file.write_all(&entry.encode()).await?;
        file.sync_data().await?;
        entries.push(entry);
        Ok(position)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn deactivate(&self, position: usize) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        let Inner { entries, file } = &mut *guard;
        let entry = entries.get_mut(position).ok_or(StoreError::UnknownPosition(position))?;
        if entry.flags & EXEMPT_ACTIVE == 0 {
            return Ok(false);
        }
        entry.flags &= !EXEMPT_ACTIVE;
        file.seek(SeekFrom::Start(entry.offset)).await?;
        file.write_all(&[entry.flags]).await?;
        file.sync_data().await?;
        Ok(true)
    }

    pub async fn active_pruned(&self, now: i64) -> Result<Vec<ExemptionEntry>, StoreError> {
        let mut guard = self.inner.lock().await;
        let Inner { entries, file } = &mut *guard;
        let mut active = Vec::new();
        for entry in entries.iter_mut() {
            if entry.flags & EXEMPT_ACTIVE == 0 {
                continue;
            }
            if entry.expired(now) {
                debug!("Exemption {} expired, deactivating", entry.position);
                entry.flags &= !EXEMPT_ACTIVE;
                file.seek(SeekFrom::Start(entry.offset)).await?;
                file.write_all(&[entry.flags]).await?;
                file.sync_data().await?;
                continue;
            }
            active.push(entry.clone());
        }
        Ok(active)
    }

    pub async fn entry(&self, position: usize) -> Option<ExemptionEntry> {
        self.inner.lock().await.entries.get(position).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

fn decode_all(data: &[u8], schema: u8) -> Result<Vec<ExemptionEntry>, StoreError> {
    let mut cur = Cursor::new(data);
    cur.set_position(HEADER_LEN);
    let mut entries = Vec::new();
    while (cur.position() as usize) < data.len() {
        let offset = cur.position();
        entries.push(ExemptionEntry::decode(&mut cur, schema, entries.len(), offset)?);
    }
    Ok(entries)
}

async fn rewrite(path: &Path, entries: &mut [ExemptionEntry]) -> Result<(), StoreError> {
    let mut buf = EXEMPTION_MAGIC.to_vec();
    buf.push(EXEMPTION_SCHEMA);
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

    #[tokio::test]
    async fn add_deactivate_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exemptions.dat");
        {
            let store = ExemptionStore::open(&path).await.unwrap();
            let pos = store.add(EXEMPT_KICK | EXEMPT_BAN, 0, 555, 0, 0, "admin").await.unwrap();
            assert_eq!(pos, 0);
            assert!(store.deactivate(pos).await.unwrap());
            assert!(!store.deactivate(pos).await.unwrap());
            store
                .add(
                    EXEMPT_KICK | EXEMPT_MATCH_IP,
                    0,
                    0,
                    u32::from(Ipv4Addr::new(10, 1, 2, 3)),
                    32,
                    "admin",
                )
                .await
                .unwrap();
        }
        let store = ExemptionStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert!(!store.entry(0).await.unwrap().is_active());
        let second = store.entry(1).await.unwrap();
        assert!(second.is_active());
        assert!(second.matches_ip(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!second.matches_ip(Ipv4Addr::new(10, 1, 2, 4)));
    }

    #[tokio::test]
    async fn upgrades_v1_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exemptions.dat");

        // v1 layout : flags, created, duration, steamid, setter
        let mut data = EXEMPTION_MAGIC.to_vec();
        data.push(1);
        data.push(EXEMPT_ACTIVE | EXEMPT_BAN);
        data.extend_from_slice(&1_500_000_000_i64.to_le_bytes());
        data.extend_from_slice(&0_u32.to_le_bytes());
        data.extend_from_slice(&31337_u64.to_le_bytes());
        data.extend_from_slice(&5_u16.to_le_bytes());
        data.extend_from_slice(b"oldop");
        std::fs::write(&path, data).unwrap();

        let store = ExemptionStore::open(&path).await.unwrap();
        let entry = store.entry(0).await.unwrap();
        assert_eq!(entry.steamid, 31337);
        assert_eq!(entry.setter, "oldop");
        assert_eq!((entry.ip, entry.prefix), (0, 0));
        assert_eq!(std::fs::read(&path).unwrap()[4], EXEMPTION_SCHEMA);
    }
}
