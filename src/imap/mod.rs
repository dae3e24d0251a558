//! IMAP Gateway (spec.md §4.3): the only component that speaks to the
//! remote server. Wraps a single `ImapConnection`, batches fetches at 50
//! messages and reopens the folder every 20 batches (spec.md §4.4 memory
//! bound), and writes each message's raw bytes plus attachments to disk
//! under the account's data path.

pub mod connection;
pub mod parse;

use crate::config::AccountConfig;
use crate::error::ImapError;
use crate::model::{Attachment, Flag, FlagSet, FolderState, Message, MessageParseError};
use async_imap::types::Fetch;
use connection::ImapConnection;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// Messages are fetched this many at a time (spec.md §4.4).
pub const BATCH_SIZE: usize = 50;
/// The folder is re-selected after this many batches to bound peak memory
/// (spec.md §4.4).
const REOPEN_EVERY: usize = 20;

pub struct ImapGateway {
    connection: ImapConnection,
}

impl ImapGateway {
    #[instrument(skip(config))]
    pub async fn connect(config: &AccountConfig) -> Result<Self, ImapError> {
        Ok(Self { connection: ImapConnection::connect(config).await? })
    }

    pub fn is_stale(&self) -> bool {
        self.connection.is_stale()
    }

    pub async fn disconnect(self) -> Result<(), ImapError> {
        self.connection.close().await
    }

    pub async fn list_folders(&mut self) -> Result<Vec<String>, ImapError> {
        use futures::TryStreamExt;
        let session = self.connection.session_mut();
        let names: Vec<String> = session
            .list(Some(""), Some("*"))
            .await
            .map_err(ImapError::Protocol)?
            .try_filter_map(|name| async move { Ok(Some(name.name().to_string())) })
            .try_collect()
            .await
            .map_err(ImapError::Protocol)?;
        Ok(names)
    }

    /// Selects the folder and reads its current UIDVALIDITY/UIDNEXT.
    #[instrument(skip(self))]
    pub async fn fetch_folder_state(&mut self, folder: &str) -> Result<FolderState, ImapError> {
        let session = self.connection.session_mut();
        let mailbox = session.select(folder).await.map_err(ImapError::Protocol)?;
        let uidvalidity = mailbox.uid_validity.ok_or_else(|| ImapError::connection("server did not report UIDVALIDITY"))?;
        let uidnext = mailbox.uid_next.ok_or_else(|| ImapError::connection("server did not report UIDNEXT"))?;
        Ok(FolderState { uidvalidity: uidvalidity as u64, uidnext: uidnext as u64 })
    }

    /// The full set of UIDs currently present in the selected folder.
    pub async fn fetch_uids(&mut self, folder: &str) -> Result<HashSet<u64>, ImapError> {
        self.connection.session_mut().select(folder).await.map_err(ImapError::Protocol)?;
        let uids = self.connection.session_mut().uid_search("ALL").await.map_err(ImapError::Protocol)?;
        Ok(uids.into_iter().map(|u| u as u64).collect())
    }

    /// Current flags for a set of UIDs, keyed by UID.
    pub async fn fetch_flags(&mut self, folder: &str, uids: &[u64]) -> Result<HashMap<u64, FlagSet>, ImapError> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }
        use futures::TryStreamExt;
        self.connection.session_mut().select(folder).await.map_err(ImapError::Protocol)?;
        let sequence = uid_sequence(uids);
        let fetches: Vec<Fetch> = self
            .connection
            .session_mut()
            .uid_fetch(&sequence, "(FLAGS)")
            .await
            .map_err(ImapError::Protocol)?
            .try_collect()
            .await
            .map_err(ImapError::Protocol)?;

        Ok(fetches
            .iter()
            .filter_map(|fetch| fetch.uid.map(|uid| (uid as u64, convert_flags(fetch.flags()))))
            .collect())
    }

    /// Writes a flag set back to the server for one message.
    pub async fn set_flags(&mut self, folder: &str, uid: u64, flags: &FlagSet) -> Result<(), ImapError> {
        use futures::TryStreamExt;
        self.connection.session_mut().select(folder).await.map_err(ImapError::Protocol)?;
        let query = format!("FLAGS ({})", flags_to_imap(flags));
        let _: Vec<Fetch> = self
            .connection
            .session_mut()
            .uid_store(uid.to_string(), query)
            .await
            .map_err(ImapError::Protocol)?
            .try_collect()
            .await
            .map_err(ImapError::Protocol)?;
        Ok(())
    }

    /// Permanently removes messages flagged `\Deleted`.
    pub async fn expunge(&mut self, folder: &str) -> Result<(), ImapError> {
        use futures::TryStreamExt;
        self.connection.session_mut().select(folder).await.map_err(ImapError::Protocol)?;
        let _: Vec<u32> = self.connection.session_mut().expunge().await.map_err(ImapError::Protocol)?.try_collect().await.map_err(ImapError::Protocol)?;
        Ok(())
    }

    /// Fetches and parses every UID in `uids`, in batches of [`BATCH_SIZE`],
    /// reopening the folder every [`REOPEN_EVERY`] batches. `on_batch` is
    /// invoked once per batch so callers can store+index incrementally
    /// instead of holding every message in memory at once (spec.md §4.4).
    /// `data_path` is optional (spec.md §4.3 `fetch_messages(.., data_path?)`)
    /// — when absent, messages are parsed but nothing is written to disk and
    /// `eml_path`/attachment paths stay unset. `cancel` is checked at every
    /// batch boundary (spec.md §5: cancellation is cooperative at batch
    /// boundaries, not folder boundaries); returns `false` if a cancellation
    /// cut the loop short before every UID was fetched, `true` if it ran to
    /// completion. Batches already handed to `on_batch` before cancellation
    /// stay persisted — only the remaining UIDs are left unfetched.
    #[instrument(skip(self, uids, on_batch, cancel), fields(total = uids.len()))]
    pub async fn fetch_all_messages<F, Fut>(
        &mut self,
        folder: &str,
        uids: &[u64],
        data_path: Option<&Path>,
        cancel: &CancellationToken,
        mut on_batch: F,
    ) -> Result<bool, ImapError>
    where
        F: FnMut(Vec<Message>, Vec<MessageParseError>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        self.connection.session_mut().select(folder).await.map_err(ImapError::Protocol)?;

        for (batch_index, chunk) in uids.chunks(BATCH_SIZE).enumerate() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if batch_index > 0 && batch_index % REOPEN_EVERY == 0 {
                self.connection.session_mut().select(folder).await.map_err(ImapError::Protocol)?;
            }
            let (messages, errors) = self.fetch_batch(folder, chunk, data_path).await?;
            on_batch(messages, errors).await;
        }
        Ok(true)
    }

    /// Fetches and parses exactly the given UIDs in batches of
    /// [`BATCH_SIZE`], without the reopen-every-20-batches behavior (spec.md
    /// §4.3 `fetch_messages`, used for targeted UID fetches outside the
    /// single-pass streaming path).
    pub async fn fetch_messages(
        &mut self,
        folder: &str,
        uids: &[u64],
        data_path: Option<&Path>,
    ) -> Result<(Vec<Message>, Vec<MessageParseError>), ImapError> {
        self.connection.session_mut().select(folder).await.map_err(ImapError::Protocol)?;
        let mut messages = Vec::new();
        let mut errors = Vec::new();
        for chunk in uids.chunks(BATCH_SIZE) {
            let (batch_messages, batch_errors) = self.fetch_batch(folder, chunk, data_path).await?;
            messages.extend(batch_messages);
            errors.extend(batch_errors);
        }
        Ok((messages, errors))
    }

    async fn fetch_batch(
        &mut self,
        folder: &str,
        uids: &[u64],
        data_path: Option<&Path>,
    ) -> Result<(Vec<Message>, Vec<MessageParseError>), ImapError> {
        use futures::TryStreamExt;
        let sequence = uid_sequence(uids);
        let fetches: Vec<Fetch> = self
            .connection
            .session_mut()
            .uid_fetch(&sequence, "(UID FLAGS RFC822)")
            .await
            .map_err(ImapError::Protocol)?
            .try_collect()
            .await
            .map_err(ImapError::Protocol)?;

        let mut messages = Vec::with_capacity(fetches.len());
        let mut errors = Vec::new();

        for fetch in fetches {
            let Some(uid) = fetch.uid else { continue };
            let uid = uid as u64;
            let Some(raw) = fetch.body() else {
                errors.push(MessageParseError { uid, error: "server returned no RFC822 body".to_string() });
                continue;
            };

            match parse::parse_message(uid, raw) {
                Ok(parsed) => {
                    let mut message = parsed.message;
                    message.flags = convert_flags(fetch.flags());
                    match data_path {
                        Some(data_path) => match write_to_disk(data_path, folder, uid, raw, parsed.attachments) {
                            Ok((eml_path, attachments)) => {
                                message.eml_path = Some(eml_path);
                                message.attachments = attachments;
                                messages.push(message);
                            }
                            Err(error) => errors.push(MessageParseError { uid, error: error.to_string() }),
                        },
                        None => messages.push(message),
                    }
                }
                Err(error) => errors.push(error),
            }
        }

        Ok((messages, errors))
    }
}

/// Writes the raw `.eml` to `<data_path>/eml/<folder>/<uid>.eml` and any
/// attachments to `<data_path>/attachments/<folder>/<uid>/<filename>`
/// (spec.md §6), returning paths relative to `data_path` (invariant 1: the
/// caller only records a store row once these files exist).
fn write_to_disk(
    data_path: &Path,
    folder: &str,
    uid: u64,
    raw: &[u8],
    attachments: Vec<parse::ParsedAttachment>,
) -> std::io::Result<(String, Vec<Attachment>)> {
    let safe_folder = folder.replace('/', "_");
    let message_dir = data_path.join("eml").join(&safe_folder);
    std::fs::create_dir_all(&message_dir)?;
    let eml_path = message_dir.join(format!("{uid}.eml"));
    std::fs::write(&eml_path, raw)?;

    let mut stored = Vec::with_capacity(attachments.len());
    if !attachments.is_empty() {
        let attachment_dir = data_path.join("attachments").join(&safe_folder).join(uid.to_string());
        std::fs::create_dir_all(&attachment_dir)?;
        for (index, attachment) in attachments.into_iter().enumerate() {
            let filename = sanitize_filename(&attachment.filename, index);
            let path = attachment_dir.join(&filename);
            std::fs::write(&path, &attachment.bytes)?;
            stored.push(Attachment {
                filename: attachment.filename,
                content_type: attachment.content_type,
                size: attachment.bytes.len() as i64,
                path: Some(relative(data_path, &path)),
            });
        }
    }

    Ok((relative(data_path, &eml_path), stored))
}

fn relative(base: &Path, path: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).to_string_lossy().replace('\\', "/")
}

/// Reads a message's raw RFC822 bytes back off disk. Decoding (e.g. the
/// original system's base64 helper) is left to the caller, per the Open
/// Question in spec.md §9.
pub fn read_raw_eml(data_path: &Path, folder: &str, uid: u64) -> std::io::Result<Vec<u8>> {
    let safe_folder = folder.replace('/', "_");
    std::fs::read(data_path.join("eml").join(safe_folder).join(format!("{uid}.eml")))
}

fn sanitize_filename(name: &str, index: usize) -> String {
    let cleaned: String = name.chars().filter(|c| !matches!(c, '/' | '\\' | '\0')).collect();
    if cleaned.is_empty() { format!("attachment-{index}") } else { cleaned }
}

fn uid_sequence(uids: &[u64]) -> String {
    uids.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
}

fn convert_flags(flags: impl Iterator<Item = async_imap::types::Flag<'static>>) -> FlagSet {
    flags
        .filter_map(|flag| match flag {
            async_imap::types::Flag::Seen => Some(Flag::Seen),
            async_imap::types::Flag::Flagged => Some(Flag::Flagged),
            async_imap::types::Flag::Answered => Some(Flag::Answered),
            async_imap::types::Flag::Draft => Some(Flag::Draft),
            async_imap::types::Flag::Deleted => Some(Flag::Deleted),
            other => {
                warn!("ignoring unrepresented IMAP flag: {:?}", other);
                None
            }
        })
        .collect()
}

fn flags_to_imap(flags: &FlagSet) -> String {
    flags
        .iter()
        .map(|flag| match flag {
            Flag::Seen => r"\Seen",
            Flag::Flagged => r"\Flagged",
            Flag::Answered => r"\Answered",
            Flag::Draft => r"\Draft",
            Flag::Deleted => r"\Deleted",
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_sequence_joins_with_commas() {
        assert_eq!(uid_sequence(&[1, 2, 3]), "1,2,3");
    }

    #[test]
    fn flags_to_imap_uses_standard_names() {
        let flags: FlagSet = [Flag::Seen, Flag::Flagged].into_iter().collect();
        let rendered = flags_to_imap(&flags);
        assert!(rendered.contains(r"\Seen"));
        assert!(rendered.contains(r"\Flagged"));
    }

    #[test]
    fn sanitize_filename_strips_path_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd", 0), "....etcpasswd");
        assert_eq!(sanitize_filename("", 2), "attachment-2");
    }

    #[test]
    fn write_to_disk_places_eml_and_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let attachments = vec![parse::ParsedAttachment {
            filename: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            bytes: vec![1, 2, 3],
        }];
        let (eml_path, stored) = write_to_disk(dir.path(), "INBOX", 7, b"raw bytes", attachments).unwrap();
        assert!(dir.path().join(&eml_path).exists());
        assert_eq!(stored.len(), 1);
        assert!(dir.path().join(stored[0].path.as_ref().unwrap()).exists());
    }
}
