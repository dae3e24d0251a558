//! Sync Engine (spec.md §4.4): reconciles one folder's remote state against
//! the local metadata store and fulltext index, choosing initial,
//! incremental, or full-resync mode from the UIDVALIDITY/UID contract.

use crate::error::{Error, ImapError};
use crate::imap::ImapGateway;
use crate::index::IndexManager;
use crate::model::{FlagSet, FolderState, MessageParseError};
use crate::store::MetadataStore;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// No local state for this folder yet: everything remote is new.
    Initial,
    /// UIDVALIDITY unchanged: diff remote/local UID sets and flags.
    Incremental,
    /// UIDVALIDITY changed since the last sync: the server has
    /// renumbered this folder's UID space (invariant 3), so the local
    /// copy is retracted and rebuilt from scratch.
    FullResync,
}

/// The three possible UID-set relationships spec.md §4.4 names explicitly.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub new: Vec<u64>,
    pub deleted: Vec<u64>,
    pub existing: Vec<u64>,
}

/// Compares the UIDs the server reports against the UIDs held locally.
pub fn detect_changes(remote: &HashSet<u64>, local: &HashSet<u64>) -> ChangeSet {
    ChangeSet {
        new: remote.difference(local).copied().collect(),
        deleted: local.difference(remote).copied().collect(),
        existing: remote.intersection(local).copied().collect(),
    }
}

/// Picks a sync mode from the remote folder state and whatever local state
/// (if any) is on file.
pub fn choose_mode(remote: FolderState, local: Option<FolderState>) -> SyncMode {
    match local {
        None => SyncMode::Initial,
        Some(local) if local.uidvalidity != remote.uidvalidity => SyncMode::FullResync,
        Some(_) => SyncMode::Incremental,
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub folder: String,
    pub mode: Option<SyncMode>,
    pub added: usize,
    pub removed: usize,
    pub flags_changed: usize,
    pub errors: Vec<MessageParseError>,
    /// Set when cancellation cut the folder short at a batch boundary
    /// (spec.md §5). Partial progress up to that batch is already durable;
    /// the folder's sync state is left unbumped so the next sync resumes it.
    pub cancelled: bool,
}

pub struct SyncEngine<'a> {
    pub store: &'a MetadataStore,
    pub index: &'a IndexManager,
    pub gateway: &'a mut ImapGateway,
    pub account_id: String,
    pub data_path: PathBuf,
    pub cancel: CancellationToken,
}

impl<'a> SyncEngine<'a> {
    /// Reconciles one folder end to end. Per-message parse failures are
    /// recorded on the report rather than aborting the sync (spec.md §7
    /// kind 4); a folder-state contract violation from the server is not
    /// (spec.md §7 kind 3). Cancellation is checked at every fetch batch
    /// boundary (spec.md §5); when it cuts the folder short, batches already
    /// handed off are already durable, but flag reconciliation and the
    /// folder's sync-state bump are skipped so the next sync resumes it.
    #[instrument(skip(self), fields(account = %self.account_id, folder = %folder))]
    pub async fn sync_folder(&mut self, folder: &str) -> Result<SyncReport, Error> {
        let folder_eid = self.store.get_or_create_folder(&self.account_id, folder).await?;
        let remote_state = self.gateway.fetch_folder_state(folder).await?;
        let local = self.store.get_folder_sync_state(&self.account_id, folder).await?;
        let local_state = local.as_ref().map(|(s, _)| *s);

        let mode = choose_mode(remote_state, local_state);
        info!(?mode, "syncing folder");

        let mut report = SyncReport { folder: folder.to_string(), mode: Some(mode), ..Default::default() };

        if mode == SyncMode::FullResync {
            warn!("UIDVALIDITY changed ({:?} -> {}); retracting local copy", local_state.map(|s| s.uidvalidity), remote_state.uidvalidity);
            let removed = self.store.retract_folder_messages(folder_eid).await?;
            self.index.delete_folder(&self.account_id, folder)?;
            report.removed += removed as usize;
        }

        let remote_uids = self.gateway.fetch_uids(folder).await?;
        let local_uids = if mode == SyncMode::Incremental { self.store.get_local_uids(folder_eid).await? } else { HashSet::new() };
        let changes = detect_changes(&remote_uids, &local_uids);

        if !changes.deleted.is_empty() {
            let removed = self.store.retract_messages(folder_eid, &changes.deleted).await?;
            self.index.delete_messages(&self.account_id, folder, &changes.deleted)?;
            report.removed += removed as usize;
        }

        if !changes.new.is_empty() {
            let mut new_uids: Vec<u64> = changes.new.clone();
            new_uids.sort_unstable();
            let data_path = self.data_path.clone();
            let account_id = self.account_id.clone();
            let store = &*self.store;
            let index = &*self.index;
            let folder_owned = folder.to_string();
            let mut added = 0usize;
            let mut errors = Vec::new();
            let mut batch_num = 0usize;

            let completed = self
                .gateway
                .fetch_all_messages(folder, &new_uids, Some(data_path.as_path()), &self.cancel, |messages, batch_errors| {
                    added += messages.len();
                    errors.extend(batch_errors);
                    batch_num += 1;
                    let folder_owned = &folder_owned;
                    let account_id = &account_id;
                    let this_batch = batch_num;
                    async move {
                        if messages.is_empty() {
                            return;
                        }
                        if let Err(e) = store.store_messages_with_attachments(folder_eid, &messages).await {
                            warn!("failed to persist batch: {e}");
                            return;
                        }
                        let with_uid: Vec<(u64, &crate::model::Message)> = messages.iter().map(|m| (m.uid, m)).collect();
                        if let Err(e) = index.index_messages(account_id, folder_owned, &with_uid) {
                            warn!("failed to index batch: {e}");
                            return;
                        }
                        // Each batch is transacted and committed before the
                        // next is fetched (spec.md §4.4), keeping peak
                        // memory to one batch; the store transaction id is
                        // threaded through so the index generation it
                        // produced can be found later (spec.md §4.2, §9).
                        match store.bump_and_get_tx_id().await {
                            Ok(tx_id) => {
                                if let Err(e) = index.commit(&format!("sync {folder_owned} batch {this_batch}"), Some(tx_id)) {
                                    warn!("failed to commit index batch: {e}");
                                }
                            }
                            Err(e) => warn!("failed to mint store tx id for batch commit: {e}"),
                        }
                    }
                })
                .await?;

            report.added = added;
            report.errors = errors;
            if !completed {
                report.cancelled = true;
            }
        }

        if report.cancelled {
            info!(account = %self.account_id, folder = %folder, "sync cancelled mid-folder, leaving local state unbumped");
            return Ok(report);
        }

        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        if mode == SyncMode::Incremental && !changes.existing.is_empty() {
            let remote_flags = self.gateway.fetch_flags(folder, &changes.existing).await?;
            let changed = self.store.update_flags(folder_eid, &remote_flags).await?;
            for uid in &changes.existing {
                if let Some(flags) = remote_flags.get(uid) {
                    if let Some(message) = self.store.read_message(folder_eid, crate::store::MessageLookup::Uid(*uid)).await? {
                        let mut message = message;
                        message.flags = flags.clone();
                        self.index.index_messages(&self.account_id, folder, &[(message.uid, &message)])?;
                    }
                }
            }
            report.flags_changed = changed;
        }

        // Whatever deletions and flag re-indexing happened above become
        // visible now; batches of new messages already committed
        // individually, so this is a final, possibly empty, commit that
        // closes out the folder (spec.md §4.4: "commits the index once more
        // with a 'sync <folder>' message").
        self.index.commit(&format!("sync {folder}"), None)?;
        self.store.update_folder_sync_state(folder_eid, remote_state).await?;

        Ok(report)
    }

    /// Writes the given flags for a single message both remotely and
    /// locally, keeping the IMAP server authoritative (spec.md §4.4).
    pub async fn set_flags(&mut self, folder: &str, uid: u64, flags: FlagSet) -> Result<(), Error> {
        self.gateway.set_flags(folder, uid, &flags).await.map_err(Error::Imap)?;
        let folder_eid = self.store.get_or_create_folder(&self.account_id, folder).await?;
        let mut map = std::collections::HashMap::new();
        map.insert(uid, flags);
        self.store.update_flags(folder_eid, &map).await?;
        Ok(())
    }
}

/// Helper for callers that already know a connection has gone bad and want
/// a uniform retry decision.
pub fn should_retry(error: &ImapError) -> bool {
    error.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_new_deleted_and_existing() {
        let remote: HashSet<u64> = [1, 2, 3].into_iter().collect();
        let local: HashSet<u64> = [2, 3, 4].into_iter().collect();
        let changes = detect_changes(&remote, &local);
        assert_eq!(changes.new, vec![1]);
        assert_eq!(changes.deleted, vec![4]);
        let mut existing = changes.existing.clone();
        existing.sort_unstable();
        assert_eq!(existing, vec![2, 3]);
    }

    #[test]
    fn chooses_initial_mode_with_no_local_state() {
        let remote = FolderState { uidvalidity: 1, uidnext: 10 };
        assert_eq!(choose_mode(remote, None), SyncMode::Initial);
    }

    #[test]
    fn chooses_full_resync_on_uidvalidity_change() {
        let remote = FolderState { uidvalidity: 2, uidnext: 10 };
        let local = FolderState { uidvalidity: 1, uidnext: 5 };
        assert_eq!(choose_mode(remote, Some(local)), SyncMode::FullResync);
    }

    #[test]
    fn chooses_incremental_when_uidvalidity_matches() {
        let remote = FolderState { uidvalidity: 1, uidnext: 10 };
        let local = FolderState { uidvalidity: 1, uidnext: 5 };
        assert_eq!(choose_mode(remote, Some(local)), SyncMode::Incremental);
    }
}
