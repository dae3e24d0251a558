//! `briefkasten-sync` — drives one account's sync and exposes its read
//! surface from the command line.

use briefkasten_sync::account::AccountHandle;
use briefkasten_sync::config::{default_config_path, load_account};
use briefkasten_sync::store::MessageLookup;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "briefkasten-sync", version, about = "Sync engine for a local IMAP mirror")]
struct Cli {
    /// Account symbol to operate on, as named in the config file.
    account: String,

    /// Path to the accounts config file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Syncs every folder, or just the given ones.
    Sync {
        /// Restrict the sync to these folders; defaults to every folder the server reports.
        #[arg(long = "folder")]
        folders: Vec<String>,
    },
    /// Runs a fulltext search across the account, or one folder.
    Search {
        query: String,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Lists known folders.
    ListFolders,
    /// Lists messages in a folder.
    ListMessages {
        folder: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Prints one message by UID.
    ReadMessage { folder: String, uid: u64 },
    /// Reports UIDs present in the store but missing from the fulltext index.
    FindUnindexed { folder: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    briefkasten_sync::init();
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_account(&config_path, &cli.account)?;
    let mut handle = AccountHandle::open(config).await?;

    match cli.command {
        Command::Sync { folders } => {
            let folders = (!folders.is_empty()).then_some(folders);
            let results = handle.sync(folders.as_deref()).await?;
            for (folder, outcome) in results {
                match outcome {
                    briefkasten_sync::FolderSyncOutcome::Ok(report) => {
                        println!(
                            "{folder}: mode={:?} added={} removed={} flags_changed={} errors={}{}",
                            report.mode,
                            report.added,
                            report.removed,
                            report.flags_changed,
                            report.errors.len(),
                            if report.cancelled { " (cancelled)" } else { "" }
                        );
                    }
                    briefkasten_sync::FolderSyncOutcome::Error(error) => {
                        println!("{folder}: failed: {error}");
                    }
                }
            }
        }
        Command::Search { query, folder, limit } => {
            let hits = match &folder {
                Some(folder) => handle.search_folder(folder, &query, limit)?,
                None => handle.search(&query, limit)?,
            };
            for hit in hits {
                println!("{:>6.2}  {}/{}  {}  {}", hit.score, hit.folder, hit.uid, hit.from, hit.subject);
            }
        }
        Command::ListFolders => {
            for folder in handle.list_folders().await? {
                println!("{}\tuidvalidity={}\tuidnext={}", folder.name, folder.uidvalidity, folder.uidnext);
            }
        }
        Command::ListMessages { folder, limit } => {
            for message in handle.list_messages(&folder, limit).await? {
                println!("{}\t{}\t{}", message.uid, message.from, message.subject);
            }
        }
        Command::ReadMessage { folder, uid } => match handle.read_message(&folder, MessageLookup::Uid(uid)).await? {
            Some(message) => {
                println!("From: {}", message.from);
                println!("To: {}", message.to);
                println!("Subject: {}", message.subject);
                println!("Date: {}", message.date);
                println!();
                println!("{}", message.body);
            }
            None => println!("no such message: {folder}/{uid}"),
        },
        Command::FindUnindexed { folder } => {
            let mut missing: Vec<u64> = handle.find_unindexed(&folder).await?.into_iter().collect();
            missing.sort_unstable();
            for uid in missing {
                println!("{uid}");
            }
        }
    }

    handle.close().await?;
    Ok(())
}
