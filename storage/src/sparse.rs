//! Sparse Store Adapter: BM25 keyword search over chunk text, backing the
//! `bm25` retriever and the keyword leg of `hybrid`/`fusion` retrievers.
//!
//! Grounded on a Tantivy BM25 index pattern: schema with STRING|STORED id
//! fields for exact-match filtering plus TEXT content for ranked search,
//! an auto-reloading reader, and Occur::Must boolean queries to push
//! tenant/kb/ACL scoping down into the store instead of filtering hits
//! after the fact. ACL push-down (§4.3/§4.5) works by indexing each ACL
//! dimension (sensitivity level, allow-users/roles/groups) as its own
//! field and an `ACL_UNRESTRICTED` sentinel token standing in for "this
//! document's allow-list is empty", then requiring, per dimension, either
//! a direct match against the caller's identity or that sentinel.

use std::path::Path;
use std::sync::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, INDEXED, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use thiserror::Error;

use kb_core::acl::Filter;
use kb_core::error::{ErrorCode, RetrievalError};
use kb_core::model::SensitivityLevel;

#[derive(Debug, Error)]
pub enum SparseError {
    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
    #[error("tantivy query parse error: {0}")]
    QueryParse(#[from] tantivy::query::QueryParserError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrievalError for SparseError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::UpstreamUnavailable
    }
}

pub struct SparseHit {
    pub chunk_id: String,
    pub score: f32,
}

pub struct ChunkDocument<'a> {
    pub chunk_id: &'a str,
    pub tenant_id: &'a str,
    pub kb_id: &'a str,
    pub doc_id: &'a str,
    pub text: &'a str,
    pub sensitivity_level: SensitivityLevel,
    pub acl_allow_users: &'a [String],
    pub acl_allow_roles: &'a [String],
    pub acl_allow_groups: &'a [String],
}

/// Stands in for "this ACL dimension's allow-list is empty" in the index,
/// since Tantivy has no native concept of an absent field value to match
/// against. A document carries this token on a dimension instead of real
/// values exactly when that dimension is unrestricted.
const ACL_UNRESTRICTED: &str = "\0acl-unrestricted";

fn sensitivity_rank(level: SensitivityLevel) -> u64 {
    level as u64
}

/// Tantivy-backed BM25 index. One index spans all tenants; every search and
/// write is scoped to (tenant_id, kb_id) via exact-match term filters so a
/// query can never surface another tenant's chunks even under a query-string
/// injection in the free-text term. ACL fields are pushed down the same way.
pub struct SparseStore {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    chunk_id_field: Field,
    tenant_id_field: Field,
    kb_id_field: Field,
    doc_id_field: Field,
    content_field: Field,
    sensitivity_field: Field,
    acl_users_field: Field,
    acl_roles_field: Field,
    acl_groups_field: Field,
}

fn remove_stale_locks(index_path: &Path) {
    let _ = std::fs::remove_file(index_path.join(".tantivy-meta.lock"));
    let _ = std::fs::remove_file(index_path.join(".tantivy-writer.lock"));
}

impl SparseStore {
    pub fn open(data_dir: &Path) -> Result<Self, SparseError> {
        let index_path = data_dir.join("tantivy");
        std::fs::create_dir_all(&index_path)?;

        let mut schema_builder = Schema::builder();
        let chunk_id_field = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let tenant_id_field = schema_builder.add_text_field("tenant_id", STRING | STORED);
        let kb_id_field = schema_builder.add_text_field("kb_id", STRING | STORED);
        let doc_id_field = schema_builder.add_text_field("doc_id", STRING | STORED);
        let content_field = schema_builder.add_text_field("content", TEXT);
        let sensitivity_field = schema_builder.add_u64_field("sensitivity_level", INDEXED | STORED);
        let acl_users_field = schema_builder.add_text_field("acl_allow_users", STRING | STORED);
        let acl_roles_field = schema_builder.add_text_field("acl_allow_roles", STRING | STORED);
        let acl_groups_field = schema_builder.add_text_field("acl_allow_groups", STRING | STORED);
        let schema = schema_builder.build();

        let index = if index_path.join("meta.json").exists() {
            Index::open_in_dir(&index_path)?
        } else {
            Index::create_in_dir(&index_path, schema)?
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;

        let writer = match index.writer(50_000_000) {
            Ok(w) => w,
            Err(tantivy::TantivyError::LockFailure(_, _)) => {
                remove_stale_locks(&index_path);
                index.writer(50_000_000)?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            chunk_id_field,
            tenant_id_field,
            kb_id_field,
            doc_id_field,
            content_field,
            sensitivity_field,
            acl_users_field,
            acl_roles_field,
            acl_groups_field,
        })
    }

    pub fn index_chunks(&self, chunks: &[ChunkDocument<'_>]) -> Result<(), SparseError> {
        let mut writer = self.writer.lock().unwrap();

        for chunk in chunks {
            let mut doc = TantivyDocument::default();
            doc.add_text(self.chunk_id_field, chunk.chunk_id);
            doc.add_text(self.tenant_id_field, chunk.tenant_id);
            doc.add_text(self.kb_id_field, chunk.kb_id);
            doc.add_text(self.doc_id_field, chunk.doc_id);
            doc.add_text(self.content_field, chunk.text);
            doc.add_u64(self.sensitivity_field, sensitivity_rank(chunk.sensitivity_level));
            add_acl_dimension(&mut doc, self.acl_users_field, chunk.acl_allow_users);
            add_acl_dimension(&mut doc, self.acl_roles_field, chunk.acl_allow_roles);
            add_acl_dimension(&mut doc, self.acl_groups_field, chunk.acl_allow_groups);
            writer.add_document(doc)?;
        }

        writer.commit()?;
        drop(writer);
        self.reader.reload()?;
        Ok(())
    }

    /// Search scoped to a tenant/kb, with `filter` pushed down into the
    /// query itself: sensitivity ceiling and allow-list dimensions are all
    /// evaluated by Tantivy, not by the caller after hydration.
    pub fn search_scoped(
        &self,
        tenant_id: &str,
        kb_id: &str,
        query: &str,
        limit: usize,
        filter: &Filter,
    ) -> Result<Vec<SparseHit>, SparseError> {
        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.content_field]);

        let content_query = match query_parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => return Ok(vec![]),
        };

        let tenant_term = Term::from_field_text(self.tenant_id_field, tenant_id);
        let kb_term = Term::from_field_text(self.kb_id_field, kb_id);

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![
            (Occur::Must, content_query),
            (
                Occur::Must,
                Box::new(TermQuery::new(tenant_term, IndexRecordOption::Basic)),
            ),
            (
                Occur::Must,
                Box::new(TermQuery::new(kb_term, IndexRecordOption::Basic)),
            ),
            (
                Occur::Must,
                sensitivity_at_most_query(self.sensitivity_field, sensitivity_rank(filter.max_sensitivity)),
            ),
        ];
        if let Some(allow_users) = &filter.allow_users {
            clauses.push((Occur::Must, acl_dimension_query(self.acl_users_field, allow_users)));
        }
        if let Some(allow_roles) = &filter.allow_roles {
            clauses.push((Occur::Must, acl_dimension_query(self.acl_roles_field, allow_roles)));
        }
        if let Some(allow_groups) = &filter.allow_groups {
            clauses.push((Occur::Must, acl_dimension_query(self.acl_groups_field, allow_groups)));
        }

        let combined = BooleanQuery::new(clauses);
        let top_docs = searcher.search(&combined, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            if let Some(chunk_id) = doc
                .get_first(self.chunk_id_field)
                .and_then(|v| v.as_str())
            {
                results.push(SparseHit {
                    chunk_id: chunk_id.to_string(),
                    score,
                });
            }
        }

        Ok(results)
    }

    pub fn delete_chunk(&self, chunk_id: &str) -> Result<(), SparseError> {
        let mut writer = self.writer.lock().unwrap();
        let term = Term::from_field_text(self.chunk_id_field, chunk_id);
        writer.delete_term(term);
        writer.commit()?;
        drop(writer);
        self.reader.reload()?;
        Ok(())
    }

    pub fn delete_document(&self, tenant_id: &str, kb_id: &str, chunk_ids: &[String]) -> Result<(), SparseError> {
        let mut writer = self.writer.lock().unwrap();
        for chunk_id in chunk_ids {
            let term = Term::from_field_text(self.chunk_id_field, chunk_id);
            writer.delete_term(term);
        }
        let _ = (tenant_id, kb_id); // scoping already enforced by id-level delete
        writer.commit()?;
        drop(writer);
        self.reader.reload()?;
        Ok(())
    }
}

fn add_acl_dimension(doc: &mut TantivyDocument, field: Field, values: &[String]) {
    if values.is_empty() {
        doc.add_text(field, ACL_UNRESTRICTED);
    } else {
        for value in values {
            doc.add_text(field, value);
        }
    }
}

/// At-least-one-of query: the unrestricted sentinel, or any of the caller's
/// own values for this dimension. An empty `values` slice still matches only
/// the sentinel, which is correct: an identity with no roles can only see
/// chunks that impose no role restriction.
fn acl_dimension_query(field: Field, values: &[String]) -> Box<dyn Query> {
    let mut should: Vec<(Occur, Box<dyn Query>)> = vec![(
        Occur::Should,
        Box::new(TermQuery::new(
            Term::from_field_text(field, ACL_UNRESTRICTED),
            IndexRecordOption::Basic,
        )),
    )];
    for value in values {
        should.push((
            Occur::Should,
            Box::new(TermQuery::new(Term::from_field_text(field, value), IndexRecordOption::Basic)),
        ));
    }
    Box::new(BooleanQuery::new(should))
}

/// `sensitivity_level <= max_rank`, expressed as an OR over the (small,
/// fixed) set of ranks at or below the ceiling rather than a range query.
fn sensitivity_at_most_query(field: Field, max_rank: u64) -> Box<dyn Query> {
    let should: Vec<(Occur, Box<dyn Query>)> = (0..=max_rank)
        .map(|rank| {
            (
                Occur::Should,
                Box::new(TermQuery::new(Term::from_field_u64(field, rank), IndexRecordOption::Basic)) as Box<dyn Query>,
            )
        })
        .collect();
    Box::new(BooleanQuery::new(should))
}
