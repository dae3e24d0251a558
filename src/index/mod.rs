//! Index Adapter (spec.md §4.2) — a Tantivy index standing in for the
//! original Lucene fulltext store. Grounded on the teacher's
//! `search::index::IndexManager`: a writer behind a mutex, a reader with
//! `ReloadPolicy::OnCommit`, and a side map tracking which document keys are
//! currently present so `find_unindexed` can answer without a scan.
//! Folder-scoped deletes use the same `BooleanQuery`/`TermQuery` combination
//! `query.rs` uses for folder-scoped search, not the teacher's own index
//! module, which only ever deletes by single exact-id term.

pub mod query;

use crate::error::IndexError;
use crate::model::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{IndexRecordOption, Schema, FAST, INDEXED, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, Term};
use tracing::{debug, info, instrument};

pub use query::{SearchHit, SearchOptions};

const WRITER_HEAP_BYTES: usize = 50_000_000;

#[derive(Clone, Copy)]
pub struct IndexFields {
    pub id: tantivy::schema::Field,
    pub account: tantivy::schema::Field,
    pub folder: tantivy::schema::Field,
    pub uid: tantivy::schema::Field,
    pub msg_id: tantivy::schema::Field,
    pub subject: tantivy::schema::Field,
    pub from: tantivy::schema::Field,
    pub to: tantivy::schema::Field,
    pub body: tantivy::schema::Field,
    pub date: tantivy::schema::Field,
}

fn build_schema() -> (Schema, IndexFields) {
    let mut builder = Schema::builder();
    let id = builder.add_text_field("id", STRING | STORED);
    let account = builder.add_text_field("account", STRING | STORED | FAST);
    let folder = builder.add_text_field("folder", STRING | STORED | FAST);
    let uid = builder.add_u64_field("uid", INDEXED | STORED | FAST);
    let msg_id = builder.add_text_field("msg_id", STRING | STORED);
    let subject = builder.add_text_field("subject", TEXT | STORED);
    let from = builder.add_text_field("from", TEXT | STORED);
    let to = builder.add_text_field("to", TEXT | STORED);
    let body = builder.add_text_field("body", TEXT);
    let date = builder.add_i64_field("date", INDEXED | STORED | FAST);
    let schema = builder.build();
    (schema, IndexFields { id, account, folder, uid, msg_id, subject, from, to, body, date })
}

/// Builds the document key `account/folder/uid` used as both the Tantivy
/// `id` field and the side-map key.
pub fn doc_key(account_id: &str, folder: &str, uid: u64) -> String {
    format!("{account_id}/{folder}/{uid}")
}

/// A commit's message plus, when the caller supplied one, the metadata
/// store transaction id it corresponds to (spec.md §4.2 `commit`).
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub opstamp: u64,
    pub message: String,
    pub store_tx_id: Option<i64>,
}

pub struct IndexManager {
    index: Arc<Index>,
    writer: Arc<Mutex<IndexWriter>>,
    reader: IndexReader,
    fields: IndexFields,
    /// Side map from document key to whether it is currently present, used
    /// only to answer `find_unindexed` cheaply without a full index scan.
    known: DashMap<String, ()>,
    /// Generation lookup keyed by metadata-store transaction id, so a
    /// reader can find the index generation corresponding to a given
    /// datalog transaction (spec.md §4.2, §9).
    generations: DashMap<i64, CommitRecord>,
}

impl IndexManager {
    #[instrument(skip(path))]
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(path)?;
        let (schema, fields) = build_schema();
        let directory = MmapDirectory::open(path)?;
        let index = Index::open_or_create(directory, schema)?;
        let writer = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index.reader_builder().reload_policy(ReloadPolicy::OnCommitWithDelay).try_into()?;

        let known = DashMap::new();
        {
            let searcher = reader.searcher();
            for segment_reader in searcher.segment_readers() {
                let store = segment_reader.get_store_reader(0)?;
                for doc_id in segment_reader.doc_ids_alive() {
                    let doc: tantivy::TantivyDocument = store.get(doc_id)?;
                    if let Some(value) = doc.get_first(fields.id) {
                        if let Some(text) = value.as_str() {
                            known.insert(text.to_string(), ());
                        }
                    }
                }
            }
        }

        info!("fulltext index opened at {}", path.display());
        Ok(Self { index: Arc::new(index), writer: Arc::new(Mutex::new(writer)), reader, fields, known, generations: DashMap::new() })
    }

    /// In-memory index, for tests.
    pub fn open_in_memory() -> Result<Self, IndexError> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        let writer = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index.reader_builder().reload_policy(ReloadPolicy::OnCommitWithDelay).try_into()?;
        Ok(Self {
            index: Arc::new(index),
            writer: Arc::new(Mutex::new(writer)),
            reader,
            fields,
            known: DashMap::new(),
            generations: DashMap::new(),
        })
    }

    /// Re-indexes a batch of messages (delete-then-add per document, as the
    /// teacher's `update_document` does). Does not commit; callers batch
    /// several folders' worth of work into one `commit()`.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub fn index_messages(&self, account_id: &str, folder: &str, messages: &[(u64, &Message)]) -> Result<(), IndexError> {
        let writer = self.writer.lock();
        for (uid, message) in messages {
            let key = doc_key(account_id, folder, *uid);
            writer.delete_term(Term::from_field_text(self.fields.id, &key));

            let mut document = doc!(
                self.fields.id => key.clone(),
                self.fields.account => account_id,
                self.fields.folder => folder,
                self.fields.uid => *uid,
                self.fields.subject => message.subject.clone(),
                self.fields.from => message.from.clone(),
                self.fields.to => message.to.clone(),
                self.fields.body => message.body.clone(),
                self.fields.date => message.date.timestamp(),
            );
            if let Some(msg_id) = &message.message_id {
                document.add_text(self.fields.msg_id, msg_id);
            }
            writer.add_document(document)?;
            self.known.insert(key, ());
        }
        Ok(())
    }

    /// Deletes the given UIDs from the folder's fulltext documents.
    pub fn delete_messages(&self, account_id: &str, folder: &str, uids: &[u64]) -> Result<(), IndexError> {
        let writer = self.writer.lock();
        for uid in uids {
            let key = doc_key(account_id, folder, *uid);
            writer.delete_term(Term::from_field_text(self.fields.id, &key));
            self.known.remove(&key);
        }
        Ok(())
    }

    /// Deletes every document belonging to a folder, ahead of a full resync.
    /// Must match account AND folder, not either alone — a plain union of
    /// two `delete_term` calls would also wipe the given account's other
    /// folders and every other account's same-named folder.
    pub fn delete_folder(&self, account_id: &str, folder: &str) -> Result<(), IndexError> {
        let writer = self.writer.lock();
        let query = BooleanQuery::new(vec![
            (
                Occur::Must,
                Box::new(TermQuery::new(Term::from_field_text(self.fields.account, account_id), IndexRecordOption::Basic))
                    as Box<dyn Query>,
            ),
            (
                Occur::Must,
                Box::new(TermQuery::new(Term::from_field_text(self.fields.folder, folder), IndexRecordOption::Basic))
                    as Box<dyn Query>,
            ),
        ]);
        writer.delete_query(Box::new(query))?;
        self.known.retain(|key, _| !key.starts_with(&format!("{account_id}/{folder}/")));
        Ok(())
    }

    /// Commits pending writes, producing a new generation. `message`
    /// documents the commit (a batch-scoped message during initial sync, or
    /// `"sync <folder>"` once a folder finishes — spec.md §4.4); `store_tx_id`,
    /// when given, is recorded so [`IndexManager::generation_for_tx`] can
    /// later find the generation a given metadata-store transaction landed
    /// in (spec.md §4.2, §9). Returns the resulting opstamp, used by the
    /// composite versioning layer as this sub-store's half of a composite
    /// snapshot id.
    #[instrument(skip(self))]
    pub fn commit(&self, message: &str, store_tx_id: Option<i64>) -> Result<u64, IndexError> {
        let opstamp = self.writer.lock().commit()?;
        self.reader.reload()?;
        debug!("index committed at opstamp {} ({})", opstamp, message);
        if let Some(tx_id) = store_tx_id {
            self.generations.insert(tx_id, CommitRecord { opstamp, message: message.to_string(), store_tx_id: Some(tx_id) });
        }
        Ok(opstamp)
    }

    /// Looks up the generation a given metadata-store transaction id
    /// committed into, if its commit supplied one (spec.md §4.2).
    pub fn generation_for_tx(&self, store_tx_id: i64) -> Option<CommitRecord> {
        self.generations.get(&store_tx_id).map(|entry| entry.clone())
    }

    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>, IndexError> {
        query::search(&self.index, &self.reader, &self.fields, query, options)
    }

    /// Returns the subset of `(folder, uid)` document keys not currently
    /// present in the index, for the diagnostic surfaced as
    /// `find_unindexed` (SPEC_FULL.md §11).
    pub fn find_unindexed(&self, account_id: &str, folder: &str, uids: &[u64]) -> HashSet<u64> {
        uids.iter().copied().filter(|uid| !self.known.contains_key(&doc_key(account_id, folder, *uid))).collect()
    }
}
