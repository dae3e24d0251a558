//! Canonical message/folder/attachment records mirrored from the remote mailbox.
//!
//! These types are the shared vocabulary between the IMAP Gateway, the
//! Metadata Store Adapter, and the Index Adapter. None of them own
//! persistence; they are plain data plus the invariants spec.md §3 holds
//! them to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// One of the five IMAP flags the engine tracks. Keywords and other
/// server-defined flags are not represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    Seen,
    Flagged,
    Answered,
    Draft,
    Deleted,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::Seen => "seen",
            Flag::Flagged => "flagged",
            Flag::Answered => "answered",
            Flag::Draft => "draft",
            Flag::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "seen" => Some(Flag::Seen),
            "flagged" => Some(Flag::Flagged),
            "answered" => Some(Flag::Answered),
            "draft" => Some(Flag::Draft),
            "deleted" => Some(Flag::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type FlagSet = HashSet<Flag>;

/// An account endpoint. Immutable after creation except for endpoint edits
/// (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub imap_host: String,
    pub imap_port: u16,
}

/// Server-reported state of a folder's UID space, as observed at a point in
/// time. Carries no identity of its own; it is compared against the locally
/// persisted equivalent to pick a sync mode (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderState {
    pub uidvalidity: u64,
    pub uidnext: u64,
}

/// A Folder record as held in the metadata store, child of an Account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub account_id: String,
    pub name: String,
    pub uidvalidity: u64,
    pub uidnext: u64,
    pub last_sync: Option<DateTime<Utc>>,
}

/// A parsed message, independent of whether it has been written anywhere
/// yet. `uid` is unique within (folder, uidvalidity) — invariant 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uid: u64,
    pub message_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub date: DateTime<Utc>,
    pub flags: FlagSet,
    pub size: u64,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Path to the raw RFC822 file, relative to `data_path`. Invariant 1:
    /// when present the file must exist and begin with a valid header block.
    pub eml_path: Option<String>,
    pub has_attachments: bool,
    pub attachments: Vec<Attachment>,
    /// Extracted plaintext body, used only to build the fulltext document;
    /// never persisted to the metadata store (spec.md §4.2).
    pub body: String,
}

/// An attachment, child of a Message. Shares the parent's lifetime
/// (invariant 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// -1 if unknown, per spec.md §3.
    pub size: i64,
    pub path: Option<String>,
}

/// A message that failed to parse. Recorded instead of a `Message`; excluded
/// from every store/index write and counted as an error in the batch result
/// (spec.md §4.4, §7 kind 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageParseError {
    pub uid: u64,
    pub error: String,
}

/// Outcome of parsing one fetched message: either a usable `Message` or a
/// recorded per-message error. Never aborts the enclosing batch.
pub type ParsedMessage = Result<Message, MessageParseError>;

/// Formats a structured IMAP address as `"name <address>"` or bare
/// `address` when no display name is present (spec.md §4.3).
pub fn format_address(name: Option<&str>, address: &str) -> String {
    match name {
        Some(n) if !n.is_empty() => format!("{} <{}>", n, address),
        _ => address.to_string(),
    }
}

/// Joins formatted addresses the way envelopes do: comma-space separated.
pub fn join_addresses<I: IntoIterator<Item = String>>(addrs: I) -> String {
    addrs.into_iter().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_address_with_name() {
        assert_eq!(
            format_address(Some("Ada Lovelace"), "ada@example.com"),
            "Ada Lovelace <ada@example.com>"
        );
    }

    #[test]
    fn formats_address_without_name() {
        assert_eq!(format_address(None, "ada@example.com"), "ada@example.com");
        assert_eq!(format_address(Some(""), "ada@example.com"), "ada@example.com");
    }

    #[test]
    fn joins_addresses_with_comma_space() {
        let joined = join_addresses(vec![
            "Ada <ada@example.com>".to_string(),
            "bob@example.com".to_string(),
        ]);
        assert_eq!(joined, "Ada <ada@example.com>, bob@example.com");
    }

    #[test]
    fn flag_round_trips_through_str() {
        for f in [Flag::Seen, Flag::Flagged, Flag::Answered, Flag::Draft, Flag::Deleted] {
            assert_eq!(Flag::from_str(f.as_str()), Some(f));
        }
        assert_eq!(Flag::from_str("bogus"), None);
    }
}
