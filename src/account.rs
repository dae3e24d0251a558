//! Account handle and multi-account registry — the public engine surface of
//! spec.md §6 as a typed API, plus the multi-account orchestration
//! SPEC_FULL.md §11 adds around it. Grounded on the teacher's
//! `mail::account_manager::AccountManager` (a `RwLock<HashMap<..>>` of
//! per-account state behind a manager) generalized from mail-provider
//! accounts to the three-store mirror this crate keeps.

use crate::config::{load_accounts, AccountConfig};
use crate::error::Error;
use crate::imap::ImapGateway;
use crate::index::{IndexManager, SearchHit, SearchOptions};
use crate::model::{FlagSet, Folder, Message};
use crate::store::{MessageLookup, MetadataStore};
use crate::sync::{SyncEngine, SyncReport};
use crate::versioning::CompositeVersioning;
use std::collections::HashMap;
use std::path::Path;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// One folder's sync outcome (spec.md §6 `sync` return value). A connection
/// failure or any other exception raised while syncing a folder is caught
/// and reported here rather than aborting the whole call (spec.md §7 kinds
/// 2-3): other folders still run.
#[derive(Debug)]
pub enum FolderSyncOutcome {
    Ok(SyncReport),
    Error(String),
}

/// One open account: the metadata store, fulltext index, and composite
/// versioning layer the handle exclusively owns (spec.md §5 resource
/// ownership), plus enough config to open an IMAP connection on demand.
pub struct AccountHandle {
    pub id: String,
    config: AccountConfig,
    store: MetadataStore,
    index: IndexManager,
    composite: CompositeVersioning,
    cancel: CancellationToken,
}

impl AccountHandle {
    /// Opens (creating on first use) the account's metadata store, fulltext
    /// index, and composite versioning layer, and transacts the account
    /// entity (spec.md §6 `create_account`). The store directory name is
    /// the account id's stable v3 UUID (spec.md §6).
    #[instrument(skip(config), fields(account = %config.id))]
    pub async fn open(config: AccountConfig) -> Result<Self, Error> {
        let namespace = crate::config::account_namespace_uuid(&config.id);
        let store_path = config.data_path.join("datahike").join(namespace.to_string()).join("store.sqlite");
        let index_path = config.data_path.join("scriptum").join("main");
        let composite_path = config.data_path.join("composite");

        let store = MetadataStore::open(&store_path).await?;
        store.ensure_account(&config.id, &config.email).await?;
        let index = IndexManager::open(&index_path)?;
        let composite = CompositeVersioning::open(&composite_path).await?;

        // The account entity is transacted above; a fresh composite has no
        // history yet, so give it one commit recording that (spec.md §6
        // `create_account`, §8 scenario 6 — `history()` after account
        // creation plus two further commits has length three). Reopening an
        // existing account finds a head already on the branch and skips
        // this, so history stays stable across restarts (invariant:
        // composite history persistence).
        if composite.snapshot_id().await?.is_none() {
            composite.commit(&store, &index, "create account").await?;
        }

        info!(account = %config.id, "account opened");
        Ok(Self { id: config.id.clone(), config, store, index, composite, cancel: CancellationToken::new() })
    }

    /// Convenience constructor for a single named account loaded straight
    /// from the config file (spec.md §6 `create_account(id_or_config)`).
    pub async fn open_from_config_file(path: &Path, account_id: &str) -> Result<Self, Error> {
        let config = crate::config::load_account(path, account_id).map_err(Error::Config)?;
        Self::open(config).await
    }

    /// Syncs every folder the server reports, or just the given allow-list
    /// when `folders` is `Some` (SPEC_FULL.md §11's folder selection
    /// filter; spec.md §6 `sync(handle, { folders? })`). Cancellation is
    /// cooperative at folder boundaries (checked here before each folder)
    /// and at batch boundaries within a folder's fetch loop (spec.md §5;
    /// see [`crate::imap::ImapGateway::fetch_all_messages`]).
    #[instrument(skip(self, folders), fields(account = %self.id))]
    pub async fn sync(&mut self, folders: Option<&[String]>) -> Result<HashMap<String, FolderSyncOutcome>, Error> {
        let mut gateway = ImapGateway::connect(&self.config).await.map_err(Error::Imap)?;
        let all_folders = gateway.list_folders().await.map_err(Error::Imap)?;
        let targets: Vec<String> = match folders {
            Some(allow) => all_folders.into_iter().filter(|f| allow.iter().any(|a| a == f)).collect(),
            None => all_folders,
        };

        let mut results = HashMap::new();
        for folder in targets {
            if self.cancel.is_cancelled() {
                info!(account = %self.id, "sync cancelled before folder {}", folder);
                break;
            }

            let mut engine = SyncEngine {
                store: &self.store,
                index: &self.index,
                gateway: &mut gateway,
                account_id: self.id.clone(),
                data_path: self.config.data_path.clone(),
                cancel: self.cancel.clone(),
            };
            let outcome = match engine.sync_folder(&folder).await {
                Ok(report) => FolderSyncOutcome::Ok(report),
                Err(e) => {
                    warn!(account = %self.id, folder = %folder, error = %e, "folder sync failed");
                    FolderSyncOutcome::Error(e.to_string())
                }
            };
            results.insert(folder.clone(), outcome);

            // One composite commit per completed folder (spec.md §2, §4.5):
            // publishes a snapshot whose identity links this folder's final
            // metadata-store transaction to its final index generation.
            if let Err(e) = self.composite.commit(&self.store, &self.index, &format!("sync {folder}")).await {
                warn!(account = %self.id, folder = %folder, error = %e, "composite commit failed");
            }
        }

        gateway.disconnect().await.map_err(Error::Imap)?;
        Ok(results)
    }

    /// Requests cooperative cancellation of any in-flight sync (checked at
    /// the next folder or batch boundary; see [`AccountHandle::sync`]).
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>, Error> {
        Ok(self.store.list_folders(&self.id).await?)
    }

    pub async fn list_messages(&self, folder: &str, limit: Option<u32>) -> Result<Vec<Message>, Error> {
        let folder_eid = self.store.get_or_create_folder(&self.id, folder).await?;
        Ok(self.store.list_messages(folder_eid, limit).await?)
    }

    pub async fn read_message(&self, folder: &str, lookup: MessageLookup) -> Result<Option<Message>, Error> {
        let folder_eid = self.store.get_or_create_folder(&self.id, folder).await?;
        Ok(self.store.read_message(folder_eid, lookup).await?)
    }

    pub async fn message_count(&self, folder: &str) -> Result<u64, Error> {
        let folder_eid = self.store.get_or_create_folder(&self.id, folder).await?;
        Ok(self.store.message_count(folder_eid).await?)
    }

    pub fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<SearchHit>, Error> {
        let options = SearchOptions { account: Some(self.id.clone()), folder: None, limit };
        Ok(self.index.search(query, &options)?)
    }

    pub fn search_folder(&self, folder: &str, query: &str, limit: Option<usize>) -> Result<Vec<SearchHit>, Error> {
        let options = SearchOptions { account: Some(self.id.clone()), folder: Some(folder.to_string()), limit };
        Ok(self.index.search(query, &options)?)
    }

    /// Reads a message's raw RFC822 bytes back off disk (SPEC_FULL.md §11;
    /// spec.md §9 Open Question — decoding is left to the caller).
    pub fn read_raw_eml(&self, folder: &str, uid: u64) -> std::io::Result<Vec<u8>> {
        crate::imap::read_raw_eml(&self.config.data_path, folder, uid)
    }

    /// Diagnostic: UIDs present in the metadata store with no corresponding
    /// fulltext document (SPEC_FULL.md §11, operationalizing spec.md §5's
    /// recovery note as a callable health check).
    pub async fn find_unindexed(&self, folder: &str) -> Result<std::collections::HashSet<u64>, Error> {
        let folder_eid = self.store.get_or_create_folder(&self.id, folder).await?;
        let uids = self.store.get_local_uids(folder_eid).await?;
        let uids: Vec<u64> = uids.into_iter().collect();
        Ok(self.index.find_unindexed(&self.id, folder, &uids))
    }

    /// Writes a flag set both remotely and locally for one message,
    /// keeping the server authoritative (spec.md §4.4; non-goal: no
    /// conflict resolution beyond server-wins).
    pub async fn set_flags(&mut self, folder: &str, uid: u64, flags: FlagSet) -> Result<(), Error> {
        let mut gateway = ImapGateway::connect(&self.config).await.map_err(Error::Imap)?;
        let mut engine = SyncEngine {
            store: &self.store,
            index: &self.index,
            gateway: &mut gateway,
            account_id: self.id.clone(),
            data_path: self.config.data_path.clone(),
            cancel: self.cancel.clone(),
        };
        engine.set_flags(folder, uid, flags).await?;
        gateway.disconnect().await.map_err(Error::Imap)?;
        Ok(())
    }

    /// Commits the index with message `"close"`, commits the composite,
    /// and releases the account's connections (spec.md §6 `close`).
    pub async fn close(self) -> Result<(), Error> {
        self.index.commit("close", None)?;
        self.composite.commit(&self.store, &self.index, "close").await?;
        Ok(())
    }

    /// Records an explicit composite commit outside of a folder sync
    /// (spec.md §4.5 `commit(message)`), returning the new snapshot id.
    pub async fn commit(&self, message: &str) -> Result<String, Error> {
        Ok(self.composite.commit(&self.store, &self.index, message).await?)
    }

    /// The current branch's snapshot chain, newest first (spec.md §4.5
    /// `history()`).
    pub async fn history(&self) -> Result<Vec<String>, Error> {
        Ok(self.composite.history().await?)
    }
}

/// Loads every account from a config file and opens its triple-store
/// (SPEC_FULL.md §11's multi-account orchestration). The public per-handle
/// surface of spec.md §6 stays the unit of work; the registry is just a
/// thin fan-out over it.
pub struct Registry {
    accounts: HashMap<String, AccountHandle>,
}

impl Registry {
    pub async fn load(config_path: &Path) -> Result<Self, Error> {
        let configs = load_accounts(config_path).map_err(Error::Config)?;
        let mut accounts = HashMap::with_capacity(configs.len());
        for (id, config) in configs {
            accounts.insert(id, AccountHandle::open(config).await?);
        }
        Ok(Self { accounts })
    }

    pub fn account(&self, id: &str) -> Option<&AccountHandle> {
        self.accounts.get(id)
    }

    pub fn account_mut(&mut self, id: &str) -> Option<&mut AccountHandle> {
        self.accounts.get_mut(id)
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    /// Spawns one sync task per account (spec.md §5: "a single sync thread
    /// per account... share no mutable state"), and collects every
    /// account's `map<folder, outcome>` once all have finished.
    pub async fn sync_all(&mut self) -> HashMap<String, HashMap<String, FolderSyncOutcome>> {
        let mut tasks = JoinSet::new();
        for (id, mut handle) in self.accounts.drain() {
            tasks.spawn(async move {
                let result = handle.sync(None).await;
                (id, handle, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, handle, result)) => {
                    let folder_results = match result {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(account = %id, error = %e, "account sync failed");
                            HashMap::new()
                        }
                    };
                    self.accounts.insert(id.clone(), handle);
                    results.insert(id, folder_results);
                }
                Err(e) => warn!("sync task panicked: {e}"),
            }
        }
        results
    }

    /// Closes every account (spec.md §6 `close`), aborting any in-flight
    /// sync cooperatively first (SPEC_FULL.md §11 graceful shutdown).
    pub async fn close_all(self) -> Result<(), Error> {
        for (id, handle) in self.accounts {
            handle.cancel_handle().cancel();
            if let Err(e) = handle.close().await {
                warn!(account = %id, error = %e, "error closing account");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn account_handle_opens_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let config = AccountConfig {
            id: "myaccount".to_string(),
            email: "me@example.com".to_string(),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            imap_user: "me@example.com".to_string(),
            imap_pass: secrecy::Secret::new("hunter2".to_string()),
            imap_insecure: false,
            imap_ssl_trust: None,
            data_path: dir.path().to_path_buf(),
        };

        let handle = AccountHandle::open(config).await.unwrap();
        assert_eq!(handle.id, "myaccount");
        assert!(handle.list_folders().await.unwrap().is_empty());
        handle.close().await.unwrap();
    }
}
