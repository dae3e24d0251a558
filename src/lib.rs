//! Briefkasten Sync
//!
//! A sync engine that mirrors an IMAP mailbox into a local metadata store, a
//! fulltext index, and a directory of raw `.eml` files, kept consistent
//! through a copy-on-write composite versioning layer over the two stores.

pub mod account;
pub mod config;
pub mod error;
pub mod imap;
pub mod index;
pub mod model;
pub mod store;
pub mod sync;
pub mod versioning;

pub use account::{AccountHandle, FolderSyncOutcome, Registry};
pub use error::{Error, Result};

/// Library version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes structured logging. Safe to call more than once.
pub fn init() {
    let _ = tracing_subscriber::fmt::try_init();
    tracing::info!("briefkasten-sync v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        init();
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
