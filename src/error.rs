//! Crate-wide error handling, grouped by component boundary the same way the
//! teacher splits `MailError` and `SearchError`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the Metadata Store Adapter (§4.1).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("folder not found: {account_id}/{name}")]
    FolderNotFound { account_id: String, name: String },

    #[error("message not found in folder {folder_eid}: {lookup}")]
    MessageNotFound { folder_eid: i64, lookup: String },
}

/// Errors surfaced by the Index Adapter (§4.2).
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("query parse error: {0}")]
    QueryParse(#[from] tantivy::query::QueryParserError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the IMAP Gateway (§4.3).
#[derive(Debug, Error)]
pub enum ImapError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] async_imap::error::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout after {0}s: {1}")]
    Timeout(u64, String),
}

impl ImapError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ImapError::Connection(_) | ImapError::Timeout(_, _) | ImapError::Io(_))
    }
}

/// Errors surfaced by the Composite Versioning layer (§4.5).
#[derive(Debug, Error)]
pub enum VersioningError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(String),
}

/// Errors from configuration loading (§6).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("missing required field {field} for account {account}")]
    MissingField { account: String, field: &'static str },
}

/// Crate-wide error composing every component's error type. Per-folder and
/// per-message failures (§7 kinds 3-4) are *not* represented here — they are
/// captured in the sync result instead of propagating, by design.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Imap(#[from] ImapError),

    #[error(transparent)]
    Versioning(#[from] VersioningError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
