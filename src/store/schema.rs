//! Schema and migrations for the metadata store.
//!
//! Modeled after the teacher's `database::migrations::MigrationManager`:
//! versioned, hand-written SQL blocks applied in order and tracked in a
//! `schema_migrations` table, rather than reaching for `sqlx::migrate!`'s
//! filesystem-discovered migrations (this crate has no `migrations/`
//! directory to discover).

use sqlx::SqlitePool;

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id    TEXT PRIMARY KEY,
                email TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS folders (
                eid         INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id  TEXT NOT NULL REFERENCES accounts(id),
                name        TEXT NOT NULL,
                uidvalidity INTEGER NOT NULL DEFAULT 0,
                uidnext     INTEGER NOT NULL DEFAULT 0,
                last_sync   TEXT,
                UNIQUE (account_id, name)
            );

            CREATE TABLE IF NOT EXISTS messages (
                eid            INTEGER PRIMARY KEY AUTOINCREMENT,
                folder_eid     INTEGER NOT NULL REFERENCES folders(eid) ON DELETE CASCADE,
                uid            INTEGER NOT NULL,
                message_id     TEXT,
                subject        TEXT NOT NULL DEFAULT '',
                from_addr      TEXT NOT NULL DEFAULT '',
                to_addr        TEXT NOT NULL DEFAULT '',
                cc_addr        TEXT NOT NULL DEFAULT '',
                date           TEXT NOT NULL,
                size           INTEGER NOT NULL DEFAULT 0,
                in_reply_to    TEXT,
                refs_json      TEXT NOT NULL DEFAULT '[]',
                eml_path       TEXT,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                UNIQUE (folder_eid, uid)
            );

            CREATE TABLE IF NOT EXISTS message_flags (
                message_eid INTEGER NOT NULL REFERENCES messages(eid) ON DELETE CASCADE,
                flag        TEXT NOT NULL,
                PRIMARY KEY (message_eid, flag)
            );

            CREATE TABLE IF NOT EXISTS attachments (
                eid          INTEGER PRIMARY KEY AUTOINCREMENT,
                message_eid  INTEGER NOT NULL REFERENCES messages(eid) ON DELETE CASCADE,
                filename     TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT '',
                size         INTEGER NOT NULL DEFAULT -1,
                path         TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages (folder_eid);
            CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages (message_id);
            CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments (message_eid);

            CREATE TABLE IF NOT EXISTS tx_counter (
                id    INTEGER PRIMARY KEY CHECK (id = 0),
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO tx_counter (id, value) VALUES (0, 0);
        "#,
    },
];

/// Applies every migration whose version is newer than the database's
/// current `schema_migrations` high-water mark, in order, inside one
/// connection. Idempotent: re-running against an up-to-date database is a
/// no-op. Foreign key enforcement is set per-connection by the pool's
/// `SqliteConnectOptions` ([`super::MetadataStore::open`]), not here — a
/// pragma run against one pooled connection wouldn't apply to the others.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(pool)
        .await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, datetime('now'))")
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    Ok(())
}
