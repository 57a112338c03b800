//! SQLite implementation of the PeerStore trait.
//!
//! Uses rusqlite with bundled SQLite. Queries run on the blocking pool via
//! `tokio::task::spawn_blocking` so the router's tasks never stall on disk.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use braid_core::{PeerAddress, PeerId, PeerStatus};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{PeerRecord, PeerStore};

/// SQLite-based peer store.
pub struct SqlitePeerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePeerStore {
    /// Open a SQLite database at the given path, creating and migrating it
    /// as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn peer_id_from_blob(blob: Vec<u8>) -> Result<PeerId> {
    let arr: [u8; 20] = blob
        .try_into()
        .map_err(|_| StoreError::InvalidData("peer id must be 20 bytes".into()))?;
    Ok(PeerId::from_bytes(arr))
}

fn load_addresses(conn: &Connection, id: &PeerId) -> Result<Vec<PeerAddress>> {
    let mut stmt =
        conn.prepare("SELECT address FROM peer_addresses WHERE peer_id = ?1 ORDER BY address")?;
    let rows = stmt.query_map(params![id.as_bytes().as_slice()], |row| row.get::<_, String>(0))?;

    let mut addresses = Vec::new();
    for row in rows {
        let raw = row?;
        let address = PeerAddress::parse(&raw)
            .map_err(|e| StoreError::InvalidData(format!("address {:?}: {}", raw, e)))?;
        addresses.push(address);
    }
    Ok(addresses)
}

struct PeerRow {
    id: Vec<u8>,
    status: u8,
    priority: u8,
    persistent: bool,
    last_connected: Option<i64>,
}

fn read_peer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerRow> {
    Ok(PeerRow {
        id: row.get("peer_id")?,
        status: row.get("status")?,
        priority: row.get("priority")?,
        persistent: row.get("persistent")?,
        last_connected: row.get("last_connected")?,
    })
}

fn into_record(conn: &Connection, row: PeerRow) -> Result<PeerRecord> {
    let id = peer_id_from_blob(row.id)?;
    let status = PeerStatus::from_u8(row.status)
        .ok_or_else(|| StoreError::InvalidData(format!("unknown peer status {}", row.status)))?;
    Ok(PeerRecord {
        id,
        addresses: load_addresses(conn, &id)?,
        status,
        priority: row.priority,
        persistent: row.persistent,
        last_connected: row.last_connected,
    })
}

const SELECT_PEER: &str =
    "SELECT peer_id, status, priority, persistent, last_connected FROM peers";

#[async_trait]
impl PeerStore for SqlitePeerStore {
    async fn load_peers(&self) -> Result<Vec<PeerRecord>> {
        self.blocking(|conn| {
            let conn: &Connection = conn;
            let rows: Vec<PeerRow> = {
                let mut stmt = conn.prepare(&format!("{} ORDER BY peer_id", SELECT_PEER))?;
                let iter = stmt.query_map([], read_peer_row)?;
                iter.collect::<rusqlite::Result<_>>()?
            };
            rows.into_iter().map(|row| into_record(conn, row)).collect()
        })
        .await
    }

    async fn get_peer(&self, id: &PeerId) -> Result<Option<PeerRecord>> {
        let id = *id;
        self.blocking(move |conn| {
            let conn: &Connection = conn;
            let row = conn
                .query_row(
                    &format!("{} WHERE peer_id = ?1", SELECT_PEER),
                    params![id.as_bytes().as_slice()],
                    read_peer_row,
                )
                .optional()?;
            row.map(|row| into_record(conn, row)).transpose()
        })
        .await
    }

    async fn upsert_peer(&self, record: &PeerRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let id = record.id.as_bytes().as_slice().to_vec();

            tx.execute(
                "INSERT INTO peers (peer_id, status, priority, persistent, last_connected, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(peer_id) DO UPDATE SET
                    status = excluded.status,
                    priority = excluded.priority,
                    persistent = excluded.persistent,
                    last_connected = excluded.last_connected,
                    updated_at = excluded.updated_at",
                params![
                    id,
                    record.status.to_u8(),
                    record.priority,
                    record.persistent,
                    record.last_connected,
                    now_millis(),
                ],
            )?;

            tx.execute("DELETE FROM peer_addresses WHERE peer_id = ?1", params![id])?;
            for address in &record.addresses {
                tx.execute(
                    "INSERT OR IGNORE INTO peer_addresses (peer_id, address) VALUES (?1, ?2)",
                    params![id, address.to_string()],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove_peer(&self, id: &PeerId) -> Result<bool> {
        let id = *id;
        self.blocking(move |conn| {
            let changed = conn.execute(
                "DELETE FROM peers WHERE peer_id = ?1",
                params![id.as_bytes().as_slice()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn banned_peers(&self) -> Result<Vec<PeerId>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT peer_id FROM peers WHERE status = ?1")?;
            let rows = stmt.query_map(params![PeerStatus::Banned.to_u8()], |row| {
                row.get::<_, Vec<u8>>(0)
            })?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(peer_id_from_blob(row?)?);
            }
            Ok(ids)
        })
        .await
    }
}
