// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The per-user message store. `content` and `nickname` arrive here
//! already vault-encrypted; the `packet_id` uniqueness constraint gives
//! at-most-once delivery for any packet id.

use std::{path::Path, sync::Mutex};

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    packet_id   TEXT UNIQUE,
    chat_id     TEXT,
    sender_id   TEXT,
    content     TEXT,
    timestamp   TEXT,
    is_outgoing INTEGER,
    is_read     INTEGER DEFAULT 0
);
CREATE TABLE IF NOT EXISTS contacts (
    user_id   TEXT PRIMARY KEY,
    nickname  TEXT,
    last_seen TEXT
);
";

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub packet_id: String,
    pub chat_id: String,
    pub sender_id: String,
    /// Vault ciphertext.
    pub content: String,
    pub timestamp: String,
    pub is_outgoing: bool,
    pub is_read: bool,
}

#[derive(Debug, Clone)]
pub struct ContactRow {
    pub user_id: String,
    /// Vault ciphertext, when set.
    pub nickname: Option<String>,
    pub last_seen: String,
    pub unread: i64,
}

pub struct UserStore {
    conn: Mutex<Connection>,
}

impl UserStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Store one message. Returns `false` when this packet id was already
    /// delivered — the UNIQUE constraint is the dedup.
    pub fn insert_message(
        &self,
        packet_id: &str,
        chat_id: &str,
        sender_id: &str,
        content_ct: &str,
        is_outgoing: bool,
        is_read: bool,
    ) -> Result<bool, StoreError> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages
             (packet_id, chat_id, sender_id, content, timestamp, is_outgoing, is_read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                packet_id,
                chat_id,
                sender_id,
                content_ct,
                Utc::now().to_rfc3339(),
                is_outgoing,
                is_read
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Full history of one chat, oldest first. Content stays encrypted.
    pub fn history(&self, chat_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT packet_id, chat_id, sender_id, content, timestamp, is_outgoing, is_read
             FROM messages WHERE chat_id = ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok(MessageRow {
                packet_id: row.get(0)?,
                chat_id: row.get(1)?,
                sender_id: row.get(2)?,
                content: row.get(3)?,
                timestamp: row.get(4)?,
                is_outgoing: row.get(5)?,
                is_read: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Mark every incoming message of a chat as read.
    pub fn mark_read(&self, chat_id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE messages SET is_read = 1 WHERE chat_id = ?1 AND is_outgoing = 0",
            params![chat_id],
        )?;
        Ok(())
    }

    /// Refresh a contact's `last_seen`, creating the row if needed.
    pub fn touch_contact(&self, user_id: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO contacts (user_id, last_seen) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_seen=excluded.last_seen",
            params![user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Set or clear a contact's nickname (already vault-encrypted).
    pub fn rename_contact(
        &self,
        user_id: &str,
        nickname_ct: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO contacts (user_id, nickname, last_seen) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET nickname=excluded.nickname",
            params![user_id, nickname_ct, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// All contacts with their unread incoming-message counts.
    pub fn contacts(&self) -> Result<Vec<ContactRow>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT c.user_id, c.nickname, c.last_seen,
                    (SELECT COUNT(id) FROM messages
                     WHERE chat_id = c.user_id AND is_read = 0 AND is_outgoing = 0)
             FROM contacts c",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ContactRow {
                user_id: row.get(0)?,
                nickname: row.get(1)?,
                last_seen: row.get(2)?,
                unread: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = UserStore::open(&dir.path().join("user.db")).unwrap();
        (dir, s)
    }

    #[test]
    fn duplicate_packet_id_is_rejected() {
        let (_d, s) = store();
        assert!(s.insert_message("p1", "alice", "alice", "ct", false, false).unwrap());
        assert!(!s.insert_message("p1", "alice", "alice", "ct", false, false).unwrap());
        assert_eq!(s.history("alice").unwrap().len(), 1);
    }

    #[test]
    fn history_is_per_chat_and_ordered() {
        let (_d, s) = store();
        s.insert_message("p1", "alice", "alice", "one", false, false).unwrap();
        s.insert_message("p2", "bob", "me", "other", true, true).unwrap();
        s.insert_message("p3", "alice", "me", "two", true, true).unwrap();
        let h = s.history("alice").unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h[0].packet_id, "p1");
        assert_eq!(h[1].packet_id, "p3");
        assert!(h[1].is_outgoing);
    }

    #[test]
    fn unread_counts_only_incoming() {
        let (_d, s) = store();
        s.touch_contact("alice").unwrap();
        s.insert_message("p1", "alice", "alice", "ct", false, false).unwrap();
        s.insert_message("p2", "alice", "alice", "ct", false, false).unwrap();
        s.insert_message("p3", "alice", "me", "ct", true, true).unwrap();
        let c = s.contacts().unwrap();
        assert_eq!(c[0].unread, 2);
        s.mark_read("alice").unwrap();
        assert_eq!(s.contacts().unwrap()[0].unread, 0);
    }

    #[test]
    fn rename_keeps_last_seen_semantics() {
        let (_d, s) = store();
        s.rename_contact("alice", Some("ct-nick")).unwrap();
        let c = s.contacts().unwrap();
        assert_eq!(c[0].nickname.as_deref(), Some("ct-nick"));
        s.rename_contact("alice", None).unwrap();
        assert_eq!(s.contacts().unwrap()[0].nickname, None);
    }
}
