//! Account configuration loading (spec.md §6).
//!
//! The external file is an associative document keyed by account symbol;
//! we accept YAML (the pack's closest standard-library analogue to the
//! original EDN map) through the `config` crate, the same crate the
//! teacher's sibling providers reach for.

use crate::error::ConfigError;
use secrecy::Secret;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// IMAP endpoint configuration for one account.
#[derive(Debug, Clone, Deserialize)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    /// Trust all certificates. Default: standard OS verification.
    #[serde(default)]
    pub insecure: bool,
    /// Trust a specific named host's certificate.
    #[serde(default)]
    pub ssl_trust: Option<String>,
}

/// Optional SMTP endpoint; unused by the sync engine itself but part of the
/// account record (spec.md §6 — outgoing mail is explicitly out of scope,
/// §1, so this is carried but never dialed by this crate).
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAccountConfig {
    pub email: String,
    pub imap: ImapEndpoint,
    pub smtp: Option<SmtpEndpoint>,
    pub data_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    accounts: HashMap<String, RawAccountConfig>,
}

/// A fully resolved account: id plus its raw config, with the password
/// wrapped so it never prints in a `{:?}` of a larger struct.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub id: String,
    pub email: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_user: String,
    pub imap_pass: Secret<String>,
    pub imap_insecure: bool,
    pub imap_ssl_trust: Option<String>,
    pub data_path: PathBuf,
}

impl AccountConfig {
    fn from_raw(id: String, raw: RawAccountConfig) -> Self {
        Self {
            id,
            email: raw.email,
            imap_host: raw.imap.host,
            imap_port: raw.imap.port,
            imap_user: raw.imap.user,
            imap_pass: Secret::new(raw.imap.pass),
            imap_insecure: raw.imap.insecure,
            imap_ssl_trust: raw.imap.ssl_trust,
            data_path: raw.data_path,
        }
    }
}

/// The account symbol's stable UUID, used to name the metadata store
/// directory (spec.md §6: "account-stable id derived as UUIDv3 of
/// `briefkasten/<account_id>`").
pub fn account_namespace_uuid(account_id: &str) -> uuid::Uuid {
    uuid::Uuid::new_v3(&uuid::Uuid::NAMESPACE_URL, format!("briefkasten/{account_id}").as_bytes())
}

/// Default config file location: `$BRIEFKASTEN_CONFIG` or
/// `~/.config/briefkasten/config.yaml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("BRIEFKASTEN_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("briefkasten")
        .join("config.yaml")
}

/// Loads every account defined in the config file at `path`.
pub fn load_accounts(path: &Path) -> Result<HashMap<String, AccountConfig>, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()?;
    let raw: RawConfig = settings.try_deserialize()?;

    Ok(raw
        .accounts
        .into_iter()
        .map(|(id, cfg)| {
            let account = AccountConfig::from_raw(id.clone(), cfg);
            (id, account)
        })
        .collect())
}

/// Loads a single named account, for callers that only need one.
pub fn load_account(path: &Path, account_id: &str) -> Result<AccountConfig, ConfigError> {
    let mut accounts = load_accounts(path)?;
    accounts
        .remove(account_id)
        .ok_or_else(|| ConfigError::AccountNotFound(account_id.to_string()))
}
