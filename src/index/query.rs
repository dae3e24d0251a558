//! Query construction for the fulltext index: token-level AND across
//! field-level OR, scoped by optional account/folder filters. Grounded on
//! the teacher's `search::query::QueryProcessor`, which combines a
//! multi-field `QueryParser` with `BooleanQuery::new` for scoping clauses.

use super::IndexFields;
use crate::error::IndexError;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{Index, IndexReader, Term};

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub account: Option<String>,
    pub folder: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub account: String,
    pub folder: String,
    pub uid: u64,
    pub subject: String,
    pub from: String,
    pub date: i64,
    pub msg_id: Option<String>,
    pub score: f32,
}

pub fn search(
    index: &Index,
    reader: &IndexReader,
    fields: &IndexFields,
    query_text: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchHit>, IndexError> {
    let mut parser = QueryParser::for_index(index, vec![fields.subject, fields.from, fields.to, fields.body]);
    parser.set_conjunction_by_default();
    let text_query = parser.parse_query(query_text)?;

    let query: Box<dyn Query> = if options.account.is_some() || options.folder.is_some() {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, text_query)];
        if let Some(account) = &options.account {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(Term::from_field_text(fields.account, account), IndexRecordOption::Basic)),
            ));
        }
        if let Some(folder) = &options.folder {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(Term::from_field_text(fields.folder, folder), IndexRecordOption::Basic)),
            ));
        }
        Box::new(BooleanQuery::new(clauses))
    } else {
        text_query
    };

    let searcher = reader.searcher();
    let limit = options.limit.unwrap_or(DEFAULT_LIMIT);
    let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

    let mut hits = Vec::with_capacity(top_docs.len());
    for (score, doc_address) in top_docs {
        let doc: tantivy::TantivyDocument = searcher.doc(doc_address)?;
        let account = doc.get_first(fields.account).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let folder = doc.get_first(fields.folder).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let uid = doc.get_first(fields.uid).and_then(|v| v.as_u64()).unwrap_or_default();
        let subject = doc.get_first(fields.subject).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let from = doc.get_first(fields.from).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let date = doc.get_first(fields.date).and_then(|v| v.as_i64()).unwrap_or_default();
        let msg_id = doc.get_first(fields.msg_id).and_then(|v| v.as_str()).map(str::to_string);
        hits.push(SearchHit { account, folder, uid, subject, from, date, msg_id, score });
    }

    Ok(hits)
}
