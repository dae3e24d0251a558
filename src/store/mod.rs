//! Metadata Store Adapter (spec.md §4.1) — typed CRUD over a SQLite-backed
//! relational store standing in for the original datalog database. Queries
//! read a snapshot at entry; every mutation below is a single transaction,
//! matching the teacher's `database::migrations` connection-pool pattern.

pub mod schema;

use crate::error::StoreError;
use crate::model::{Attachment, Flag, FlagSet, Folder, FolderState, Message};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// How to look a single message up within a folder (spec.md §4.1
/// `read_message`).
pub enum MessageLookup {
    Uid(u64),
    MessageId(String),
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Opens (creating if absent) the SQLite database at `path` and brings
    /// its schema up to date.
    #[instrument(skip(path))]
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        schema::run_migrations(&pool).await.map_err(|e| match e {
            sqlx::Error::Migrate(m) => StoreError::Migration(*m),
            other => StoreError::Database(other),
        })?;
        info!("metadata store opened at {}", path.display());
        Ok(Self { pool })
    }

    /// In-memory store, for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::Database)?.foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        schema::run_migrations(&pool).await.map_err(|e| match e {
            sqlx::Error::Migrate(m) => StoreError::Migration(*m),
            other => StoreError::Database(other),
        })?;
        Ok(Self { pool })
    }

    /// Bumps and returns the store's logical transaction counter. The
    /// Composite Versioning layer uses the returned value as the metadata
    /// store's half of a composite snapshot id (spec.md §9: a reader can
    /// locate the index generation corresponding to a given transaction).
    pub async fn bump_and_get_tx_id(&self) -> Result<i64, StoreError> {
        let value: i64 = sqlx::query_scalar("UPDATE tx_counter SET value = value + 1 WHERE id = 0 RETURNING value")
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn ensure_account(&self, account_id: &str, email: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO accounts (id, email) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET email = excluded.email")
            .bind(account_id)
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_or_create_folder(&self, account_id: &str, name: &str) -> Result<i64, StoreError> {
        if let Some(row) = sqlx::query("SELECT eid FROM folders WHERE account_id = ? AND name = ?")
            .bind(account_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.get::<i64, _>("eid"));
        }

        let eid = sqlx::query("INSERT INTO folders (account_id, name) VALUES (?, ?)")
            .bind(account_id)
            .bind(name)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        debug!("created folder {}/{} -> {}", account_id, name, eid);
        Ok(eid)
    }

    pub async fn get_folder_sync_state(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<(FolderState, Option<DateTime<Utc>>)>, StoreError> {
        let row = sqlx::query("SELECT uidvalidity, uidnext, last_sync FROM folders WHERE account_id = ? AND name = ?")
            .bind(account_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };

        let uidvalidity: i64 = row.get("uidvalidity");
        let uidnext: i64 = row.get("uidnext");
        if uidvalidity == 0 && uidnext == 0 {
            // Folder row exists (created by get_or_create_folder) but has
            // never been synced: treat as "no local state" per spec.md §4.4.
            let last_sync: Option<String> = row.get("last_sync");
            if last_sync.is_none() {
                return Ok(None);
            }
        }
        let last_sync: Option<String> = row.get("last_sync");
        let last_sync = last_sync.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc));

        Ok(Some((
            FolderState { uidvalidity: uidvalidity as u64, uidnext: uidnext as u64 },
            last_sync,
        )))
    }

    /// Writes `{uidvalidity, uidnext}` and stamps `last_sync = now()`.
    pub async fn update_folder_sync_state(&self, folder_eid: i64, state: FolderState) -> Result<(), StoreError> {
        sqlx::query("UPDATE folders SET uidvalidity = ?, uidnext = ?, last_sync = ? WHERE eid = ?")
            .bind(state.uidvalidity as i64)
            .bind(state.uidnext as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(folder_eid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transacts a batch of messages (with attachments) into the folder.
    /// Re-running with the same (folder, uid) is idempotent: an existing
    /// message row is replaced rather than duplicated.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn store_messages_with_attachments(&self, folder_eid: i64, messages: &[Message]) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for message in messages {
            let refs_json = serde_json::to_string(&message.references)?;
            let eid = sqlx::query(
                r#"
                INSERT INTO messages
                    (folder_eid, uid, message_id, subject, from_addr, to_addr, cc_addr,
                     date, size, in_reply_to, refs_json, eml_path, has_attachments)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (folder_eid, uid) DO UPDATE SET
                    message_id = excluded.message_id,
                    subject = excluded.subject,
                    from_addr = excluded.from_addr,
                    to_addr = excluded.to_addr,
                    cc_addr = excluded.cc_addr,
                    date = excluded.date,
                    size = excluded.size,
                    in_reply_to = excluded.in_reply_to,
                    refs_json = excluded.refs_json,
                    eml_path = excluded.eml_path,
                    has_attachments = excluded.has_attachments
                RETURNING eid
                "#,
            )
            .bind(folder_eid)
            .bind(message.uid as i64)
            .bind(&message.message_id)
            .bind(&message.subject)
            .bind(&message.from)
            .bind(&message.to)
            .bind(&message.cc)
            .bind(message.date.to_rfc3339())
            .bind(message.size as i64)
            .bind(&message.in_reply_to)
            .bind(refs_json)
            .bind(&message.eml_path)
            .bind(message.has_attachments as i64)
            .fetch_one(&mut *tx)
            .await?
            .get::<i64, _>("eid");

            sqlx::query("DELETE FROM message_flags WHERE message_eid = ?").bind(eid).execute(&mut *tx).await?;
            for flag in &message.flags {
                sqlx::query("INSERT INTO message_flags (message_eid, flag) VALUES (?, ?)")
                    .bind(eid)
                    .bind(flag.as_str())
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("DELETE FROM attachments WHERE message_eid = ?").bind(eid).execute(&mut *tx).await?;
            for attachment in &message.attachments {
                sqlx::query(
                    "INSERT INTO attachments (message_eid, filename, content_type, size, path) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(eid)
                .bind(&attachment.filename)
                .bind(&attachment.content_type)
                .bind(attachment.size)
                .bind(&attachment.path)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Retracts the given UIDs (and, via `ON DELETE CASCADE`, their
    /// attachments and flags) from the folder. Returns the number of
    /// messages removed.
    pub async fn retract_messages(&self, folder_eid: i64, uids: &[u64]) -> Result<u64, StoreError> {
        if uids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for uid in uids {
            let result = sqlx::query("DELETE FROM messages WHERE folder_eid = ? AND uid = ?")
                .bind(folder_eid)
                .bind(*uid as i64)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Retracts every message (and attachments) in the folder. Used ahead
    /// of a full resync on UIDVALIDITY change (invariant 3).
    pub async fn retract_folder_messages(&self, folder_eid: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE folder_eid = ?").bind(folder_eid).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn get_local_uids(&self, folder_eid: i64) -> Result<HashSet<u64>, StoreError> {
        let rows = sqlx::query("SELECT uid FROM messages WHERE folder_eid = ?")
            .bind(folder_eid)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<i64, _>("uid") as u64).collect())
    }

    pub async fn get_local_flags(&self, folder_eid: i64) -> Result<HashMap<u64, FlagSet>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT m.uid as uid, f.flag as flag
            FROM messages m
            LEFT JOIN message_flags f ON f.message_eid = m.eid
            WHERE m.folder_eid = ?
            "#,
        )
        .bind(folder_eid)
        .fetch_all(&self.pool)
        .await?;

        let mut result: HashMap<u64, FlagSet> = HashMap::new();
        for row in rows {
            let uid = row.get::<i64, _>("uid") as u64;
            let entry = result.entry(uid).or_default();
            let flag: Option<String> = row.get("flag");
            if let Some(flag) = flag.and_then(|f| Flag::from_str(&f)) {
                entry.insert(flag);
            }
        }
        Ok(result)
    }

    /// Performs a minimal retract/add diff per message against the stored
    /// flags. Returns the number of messages whose flag set actually
    /// changed.
    pub async fn update_flags(&self, folder_eid: i64, flags: &HashMap<u64, FlagSet>) -> Result<usize, StoreError> {
        let current = self.get_local_flags(folder_eid).await?;
        let mut tx = self.pool.begin().await?;
        let mut changed = 0usize;

        for (uid, new_flags) in flags {
            let old_flags = current.get(uid).cloned().unwrap_or_default();
            if &old_flags == new_flags {
                continue;
            }
            changed += 1;

            let eid: Option<i64> = sqlx::query_scalar("SELECT eid FROM messages WHERE folder_eid = ? AND uid = ?")
                .bind(folder_eid)
                .bind(*uid as i64)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(eid) = eid else { continue };

            for removed in old_flags.difference(new_flags) {
                sqlx::query("DELETE FROM message_flags WHERE message_eid = ? AND flag = ?")
                    .bind(eid)
                    .bind(removed.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
            for added in new_flags.difference(&old_flags) {
                sqlx::query("INSERT OR IGNORE INTO message_flags (message_eid, flag) VALUES (?, ?)")
                    .bind(eid)
                    .bind(added.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(changed)
    }

    pub async fn list_messages(&self, folder_eid: i64, limit: Option<u32>) -> Result<Vec<Message>, StoreError> {
        let limit = limit.unwrap_or(u32::MAX) as i64;
        let rows = sqlx::query(
            "SELECT eid, uid, message_id, subject, from_addr, to_addr, cc_addr, date, size, \
             in_reply_to, refs_json, eml_path, has_attachments FROM messages \
             WHERE folder_eid = ? ORDER BY uid ASC LIMIT ?",
        )
        .bind(folder_eid)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(self.row_to_message(&row).await?);
        }
        Ok(messages)
    }

    pub async fn read_message(&self, folder_eid: i64, lookup: MessageLookup) -> Result<Option<Message>, StoreError> {
        let row = match lookup {
            MessageLookup::Uid(uid) => {
                sqlx::query(
                    "SELECT eid, uid, message_id, subject, from_addr, to_addr, cc_addr, date, size, \
                     in_reply_to, refs_json, eml_path, has_attachments FROM messages \
                     WHERE folder_eid = ? AND uid = ?",
                )
                .bind(folder_eid)
                .bind(uid as i64)
                .fetch_optional(&self.pool)
                .await?
            }
            MessageLookup::MessageId(message_id) => {
                sqlx::query(
                    "SELECT eid, uid, message_id, subject, from_addr, to_addr, cc_addr, date, size, \
                     in_reply_to, refs_json, eml_path, has_attachments FROM messages \
                     WHERE folder_eid = ? AND message_id = ?",
                )
                .bind(folder_eid)
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => Ok(Some(self.row_to_message(&row).await?)),
            None => Ok(None),
        }
    }

    async fn row_to_message(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
        let eid: i64 = row.get("eid");
        let refs_json: String = row.get("refs_json");
        let references: Vec<String> = serde_json::from_str(&refs_json).unwrap_or_default();
        let date_str: String = row.get("date");
        let date = DateTime::parse_from_rfc3339(&date_str).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now());

        let flag_rows = sqlx::query("SELECT flag FROM message_flags WHERE message_eid = ?").bind(eid).fetch_all(&self.pool).await?;
        let flags: FlagSet = flag_rows.into_iter().filter_map(|r| Flag::from_str(&r.get::<String, _>("flag"))).collect();

        let attachment_rows = sqlx::query("SELECT filename, content_type, size, path FROM attachments WHERE message_eid = ?")
            .bind(eid)
            .fetch_all(&self.pool)
            .await?;
        let attachments: Vec<Attachment> = attachment_rows
            .into_iter()
            .map(|r| Attachment {
                filename: r.get("filename"),
                content_type: r.get("content_type"),
                size: r.get("size"),
                path: r.get("path"),
            })
            .collect();

        Ok(Message {
            uid: row.get::<i64, _>("uid") as u64,
            message_id: row.get("message_id"),
            subject: row.get("subject"),
            from: row.get("from_addr"),
            to: row.get("to_addr"),
            cc: row.get("cc_addr"),
            date,
            flags,
            size: row.get::<i64, _>("size") as u64,
            in_reply_to: row.get("in_reply_to"),
            references,
            eml_path: row.get("eml_path"),
            has_attachments: row.get::<i64, _>("has_attachments") != 0,
            attachments,
            body: String::new(),
        })
    }

    pub async fn message_count(&self, folder_eid: i64) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE folder_eid = ?")
            .bind(folder_eid)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn list_folders(&self, account_id: &str) -> Result<Vec<Folder>, StoreError> {
        let rows = sqlx::query("SELECT account_id, name, uidvalidity, uidnext, last_sync FROM folders WHERE account_id = ? ORDER BY name")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Folder {
                account_id: row.get("account_id"),
                name: row.get("name"),
                uidvalidity: row.get::<i64, _>("uidvalidity") as u64,
                uidnext: row.get::<i64, _>("uidnext") as u64,
                last_sync: row
                    .get::<Option<String>, _>("last_sync")
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|d| d.with_timezone(&Utc)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Flag;

    fn sample_message(uid: u64, subject: &str) -> Message {
        Message {
            uid,
            message_id: Some(format!("<{uid}@example.com>")),
            subject: subject.to_string(),
            from: "Alice <alice@example.com>".to_string(),
            to: "bob@example.com".to_string(),
            cc: String::new(),
            date: Utc::now(),
            flags: [Flag::Seen].into_iter().collect(),
            size: 100,
            in_reply_to: None,
            references: vec![],
            eml_path: None,
            has_attachments: false,
            attachments: vec![],
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn stores_and_lists_messages() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        store.ensure_account("myaccount", "me@example.com").await.unwrap();
        let folder_eid = store.get_or_create_folder("myaccount", "INBOX").await.unwrap();

        store
            .store_messages_with_attachments(folder_eid, &[sample_message(1, "First"), sample_message(2, "Second")])
            .await
            .unwrap();

        let uids = store.get_local_uids(folder_eid).await.unwrap();
        assert_eq!(uids, [1, 2].into_iter().collect());
        assert_eq!(store.message_count(folder_eid).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn retract_messages_removes_attachments_too() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        store.ensure_account("myaccount", "me@example.com").await.unwrap();
        let folder_eid = store.get_or_create_folder("myaccount", "INBOX").await.unwrap();

        let mut msg = sample_message(1, "Has attachment");
        msg.attachments.push(Attachment {
            filename: "a.txt".to_string(),
            content_type: "text/plain".to_string(),
            size: 10,
            path: Some("attachments/INBOX/1/a.txt".to_string()),
        });
        store.store_messages_with_attachments(folder_eid, &[msg]).await.unwrap();

        let removed = store.retract_messages(folder_eid, &[1]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.message_count(folder_eid).await.unwrap(), 0);

        let leftover: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn update_flags_computes_minimal_diff() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        store.ensure_account("myaccount", "me@example.com").await.unwrap();
        let folder_eid = store.get_or_create_folder("myaccount", "INBOX").await.unwrap();
        store.store_messages_with_attachments(folder_eid, &[sample_message(1, "x")]).await.unwrap();

        let mut new_flags = HashMap::new();
        new_flags.insert(1u64, [Flag::Seen, Flag::Flagged].into_iter().collect());
        let changed = store.update_flags(folder_eid, &new_flags).await.unwrap();
        assert_eq!(changed, 1);

        let flags = store.get_local_flags(folder_eid).await.unwrap();
        assert_eq!(flags.get(&1).unwrap(), &[Flag::Seen, Flag::Flagged].into_iter().collect());

        // Re-running with identical flags changes nothing.
        let changed_again = store.update_flags(folder_eid, &new_flags).await.unwrap();
        assert_eq!(changed_again, 0);
    }

    #[tokio::test]
    async fn folder_sync_state_round_trips() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        store.ensure_account("myaccount", "me@example.com").await.unwrap();
        let folder_eid = store.get_or_create_folder("myaccount", "INBOX").await.unwrap();

        assert!(store.get_folder_sync_state("myaccount", "INBOX").await.unwrap().is_none());

        store.update_folder_sync_state(folder_eid, FolderState { uidvalidity: 100, uidnext: 3 }).await.unwrap();
        let (state, last_sync) = store.get_folder_sync_state("myaccount", "INBOX").await.unwrap().unwrap();
        assert_eq!(state, FolderState { uidvalidity: 100, uidnext: 3 });
        assert!(last_sync.is_some());
    }
}
