// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The daemon-wide store: neighbors, outbox, seen-packets, routing table,
//! local-user registry and the offline mailbox.

use std::{
    path::Path,
    sync::Mutex,
    time::Duration,
};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

/// Sentinel next-hop marking a route that terminates at a local user on
/// this node. A LOCAL row is never displaced by remote learning.
pub const LOCAL_HOP: &str = "LOCAL";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS neighbors (
    user_id   TEXT PRIMARY KEY,
    address   TEXT,
    last_seen TEXT
);
CREATE TABLE IF NOT EXISTS outbox (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    packet_id    TEXT,
    next_hop_id  TEXT,
    packet_json  TEXT,
    exclude_peer TEXT,
    created_at   TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS seen_packets (
    packet_id   TEXT PRIMARY KEY,
    received_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS local_users (
    user_id TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS offline_mailbox (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id   TEXT,
    packet_json TEXT,
    received_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS routing_table (
    route_id       TEXT,
    next_hop_id    TEXT,
    metric         INTEGER,
    is_local       INTEGER DEFAULT 0,
    remote_user_id TEXT,
    expires_at     INTEGER,
    PRIMARY KEY (route_id, next_hop_id)
);
";

/// One row of the routing table.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub route_id: String,
    pub next_hop_id: String,
    pub metric: i64,
    pub is_local: bool,
    pub remote_user_id: Option<String>,
    pub expires_at: i64,
}

/// One queued transmission. `next_hop_id = None` means flood to every live
/// neighbor except `exclude_peer`.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub packet_id: String,
    pub next_hop_id: Option<String>,
    pub packet_json: String,
    pub exclude_peer: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub user_id: String,
    pub address: String,
    pub last_seen: String,
}

pub struct SystemStore {
    conn: Mutex<Connection>,
}

impl SystemStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Deduplication ────────────────────────────────────────────────────────

    /// Record a packet id. Returns `true` only on first insertion — the
    /// primary-key conflict is the deduplication test.
    pub fn mark_packet_seen(&self, packet_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO seen_packets (packet_id) VALUES (?1)",
            params![packet_id],
        )?;
        Ok(inserted > 0)
    }

    /// When the packet was first seen, if ever.
    pub fn packet_seen_at(&self, packet_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT received_at FROM seen_packets WHERE packet_id = ?1",
                params![packet_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ── Routing table ────────────────────────────────────────────────────────

    /// Insert or refresh a route. A LOCAL row for the same
    /// `(route_id, next_hop_id)` key wins over any remote insertion.
    pub fn add_route(
        &self,
        route_id: &str,
        next_hop_id: &str,
        metric: i64,
        is_local: bool,
        remote_user_id: Option<&str>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        if !is_local {
            let existing_local: Option<bool> = conn
                .query_row(
                    "SELECT is_local FROM routing_table
                     WHERE route_id = ?1 AND next_hop_id = ?2",
                    params![route_id, next_hop_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing_local == Some(true) {
                return Ok(());
            }
        }
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        conn.execute(
            "INSERT OR REPLACE INTO routing_table
             (route_id, next_hop_id, metric, is_local, remote_user_id, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![route_id, next_hop_id, metric, is_local, remote_user_id, expires_at],
        )?;
        Ok(())
    }

    /// Best live route for a channel: lowest metric, freshest insertion on
    /// ties. The REPLACE above re-inserts with a new rowid, so rowid order
    /// is insertion recency.
    pub fn best_route(&self, route_id: &str) -> Result<Option<RouteEntry>, StoreError> {
        Ok(self.routes_for(route_id)?.into_iter().next())
    }

    /// All live routes for a channel, best first.
    pub fn routes_for(&self, route_id: &str) -> Result<Vec<RouteEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT route_id, next_hop_id, metric, is_local, remote_user_id, expires_at
             FROM routing_table
             WHERE route_id = ?1 AND expires_at > ?2
             ORDER BY metric ASC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![route_id, Utc::now().timestamp()], row_to_route)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every non-expired route, for the debug surface.
    pub fn live_routes(&self) -> Result<Vec<RouteEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT route_id, next_hop_id, metric, is_local, remote_user_id, expires_at
             FROM routing_table WHERE expires_at > ?1",
        )?;
        let rows = stmt.query_map(params![Utc::now().timestamp()], row_to_route)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Outbox ───────────────────────────────────────────────────────────────

    pub fn enqueue(
        &self,
        packet_id: &str,
        next_hop_id: Option<&str>,
        packet_json: &str,
        exclude_peer: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO outbox (packet_id, next_hop_id, packet_json, exclude_peer)
             VALUES (?1, ?2, ?3, ?4)",
            params![packet_id, next_hop_id, packet_json, exclude_peer],
        )?;
        Ok(())
    }

    /// The oldest `limit` outbox rows, FIFO by insertion time.
    pub fn outbox_head(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, packet_id, next_hop_id, packet_json, exclude_peer, created_at
             FROM outbox ORDER BY created_at ASC, id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_outbox)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_outbox(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn outbox_all(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, packet_id, next_hop_id, packet_json, exclude_peer, created_at
             FROM outbox ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_outbox)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn outbox_count(&self, packet_id: &str) -> Result<i64, StoreError> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE packet_id = ?1",
            params![packet_id],
            |row| row.get(0),
        )?)
    }

    // ── Neighbors ────────────────────────────────────────────────────────────

    pub fn upsert_neighbor(&self, user_id: &str, address: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO neighbors (user_id, address, last_seen) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET address=excluded.address,
                                               last_seen=excluded.last_seen",
            params![user_id, address, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Refresh `last_seen` for a neighbor we already know.
    pub fn touch_neighbor(&self, user_id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE neighbors SET last_seen = ?2 WHERE user_id = ?1",
            params![user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn neighbors(&self) -> Result<Vec<Neighbor>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT user_id, address, last_seen FROM neighbors")?;
        let rows = stmt.query_map([], |row| {
            Ok(Neighbor {
                user_id: row.get(0)?,
                address: row.get(1)?,
                last_seen: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Local users / offline mailbox ────────────────────────────────────────

    pub fn register_local_user(&self, user_id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO local_users (user_id) VALUES (?1)",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn is_local_user(&self, user_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM local_users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn local_users(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT user_id FROM local_users")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn save_to_mailbox(&self, target_id: &str, packet_json: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO offline_mailbox (target_id, packet_json) VALUES (?1, ?2)",
            params![target_id, packet_json],
        )?;
        Ok(())
    }

    /// Return and atomically clear all queued packets for `user_id`.
    pub fn fetch_mailbox(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let packets = {
            let mut stmt = tx.prepare(
                "SELECT packet_json FROM offline_mailbox
                 WHERE target_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "DELETE FROM offline_mailbox WHERE target_id = ?1",
            params![user_id],
        )?;
        tx.commit()?;
        Ok(packets)
    }

    pub fn mailbox_len(&self, user_id: &str) -> Result<i64, StoreError> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM offline_mailbox WHERE target_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn row_to_route(row: &rusqlite::Row<'_>) -> rusqlite::Result<RouteEntry> {
    Ok(RouteEntry {
        route_id: row.get(0)?,
        next_hop_id: row.get(1)?,
        metric: row.get(2)?,
        is_local: row.get(3)?,
        remote_user_id: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        id: row.get(0)?,
        packet_id: row.get(1)?,
        next_hop_id: row.get(2)?,
        packet_json: row.get(3)?,
        exclude_peer: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(1800);

    fn store() -> (tempfile::TempDir, SystemStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = SystemStore::open(&dir.path().join("system.db")).unwrap();
        (dir, s)
    }

    #[test]
    fn packet_seen_only_once() {
        let (_d, s) = store();
        assert!(s.mark_packet_seen("pkt-1").unwrap());
        assert!(!s.mark_packet_seen("pkt-1").unwrap());
        assert!(s.mark_packet_seen("pkt-2").unwrap());
    }

    #[test]
    fn seen_at_is_recorded() {
        let (_d, s) = store();
        assert!(s.packet_seen_at("nope").unwrap().is_none());
        s.mark_packet_seen("pkt").unwrap();
        assert!(s.packet_seen_at("pkt").unwrap().is_some());
    }

    #[test]
    fn local_route_survives_remote_insert() {
        let (_d, s) = store();
        s.add_route("r1", LOCAL_HOP, 0, true, Some("alice"), TTL).unwrap();
        s.add_route("r1", LOCAL_HOP, 5, false, None, TTL).unwrap();
        let best = s.best_route("r1").unwrap().unwrap();
        assert!(best.is_local);
        assert_eq!(best.metric, 0);
        assert_eq!(best.remote_user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn best_route_prefers_lower_metric() {
        let (_d, s) = store();
        s.add_route("r1", "hop-far", 4, false, None, TTL).unwrap();
        s.add_route("r1", "hop-near", 1, false, None, TTL).unwrap();
        assert_eq!(s.best_route("r1").unwrap().unwrap().next_hop_id, "hop-near");
    }

    #[test]
    fn metric_tie_prefers_fresher_row() {
        let (_d, s) = store();
        s.add_route("r1", "hop-old", 2, false, None, TTL).unwrap();
        s.add_route("r1", "hop-new", 2, false, None, TTL).unwrap();
        assert_eq!(s.best_route("r1").unwrap().unwrap().next_hop_id, "hop-new");
    }

    #[test]
    fn expired_route_is_invisible() {
        let (_d, s) = store();
        s.add_route("r1", "hop", 1, false, None, Duration::ZERO).unwrap();
        assert!(s.best_route("r1").unwrap().is_none());
        assert!(s.routes_for("r1").unwrap().is_empty());
    }

    #[test]
    fn routes_for_orders_all_alternatives() {
        let (_d, s) = store();
        s.add_route("r1", "b", 3, false, None, TTL).unwrap();
        s.add_route("r1", "a", 1, false, None, TTL).unwrap();
        s.add_route("r1", "c", 2, false, None, TTL).unwrap();
        let hops: Vec<_> = s
            .routes_for("r1")
            .unwrap()
            .into_iter()
            .map(|r| r.next_hop_id)
            .collect();
        assert_eq!(hops, vec!["a", "c", "b"]);
    }

    #[test]
    fn outbox_is_fifo() {
        let (_d, s) = store();
        s.enqueue("p1", None, "{}", None).unwrap();
        s.enqueue("p2", Some("hop"), "{}", None).unwrap();
        s.enqueue("p3", None, "{}", Some("peer")).unwrap();
        let head = s.outbox_head(2).unwrap();
        assert_eq!(head.len(), 2);
        assert_eq!(head[0].packet_id, "p1");
        assert_eq!(head[1].packet_id, "p2");
        s.delete_outbox(head[0].id).unwrap();
        assert_eq!(s.outbox_head(5).unwrap()[0].packet_id, "p2");
    }

    #[test]
    fn outbox_count_by_packet() {
        let (_d, s) = store();
        s.enqueue("p1", None, "{}", None).unwrap();
        s.enqueue("p1", Some("x"), "{}", None).unwrap();
        assert_eq!(s.outbox_count("p1").unwrap(), 2);
        assert_eq!(s.outbox_count("p2").unwrap(), 0);
    }

    #[test]
    fn mailbox_fetch_clears() {
        let (_d, s) = store();
        s.save_to_mailbox("bob", "{\"a\":1}").unwrap();
        s.save_to_mailbox("bob", "{\"b\":2}").unwrap();
        s.save_to_mailbox("carol", "{\"c\":3}").unwrap();
        let got = s.fetch_mailbox("bob").unwrap();
        assert_eq!(got.len(), 2);
        assert!(s.fetch_mailbox("bob").unwrap().is_empty());
        assert_eq!(s.mailbox_len("carol").unwrap(), 1);
    }

    #[test]
    fn local_user_registry() {
        let (_d, s) = store();
        assert!(!s.is_local_user("alice").unwrap());
        s.register_local_user("alice").unwrap();
        s.register_local_user("alice").unwrap();
        assert!(s.is_local_user("alice").unwrap());
        assert_eq!(s.local_users().unwrap(), vec!["alice".to_string()]);
    }

    #[test]
    fn neighbor_upsert_refreshes() {
        let (_d, s) = store();
        s.upsert_neighbor("peer", "10.0.0.2:9000").unwrap();
        s.upsert_neighbor("peer", "incoming").unwrap();
        let n = s.neighbors().unwrap();
        assert_eq!(n.len(), 1);
        assert_eq!(n[0].address, "incoming");
    }
}
