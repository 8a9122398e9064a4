//! BM25 sidecar index for hybrid retrieval
//!
//! Tantivy index over live chunk text, keyed by (tenant, namespace) so sparse
//! hits respect the same partitioning as the vector index. Maintained by the
//! upsert pipeline; deletion removes every chunk of a document.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Mutex;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, TantivyDocument, Term};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// A sparse search hit
#[derive(Debug, Clone)]
pub struct Bm25Hit {
    pub chunk_id: String,
    pub score: f32,
}

struct Fields {
    chunk_id: Field,
    doc_id: Field,
    tenant_id: Field,
    namespace: Field,
    text: Field,
}

/// Keyword index over live chunks
pub struct Bm25Index {
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    fields: Fields,
}

impl Bm25Index {
    /// Open (or create) the index under `data_dir/bm25`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let bm25_dir = data_dir.join("bm25");
        std::fs::create_dir_all(&bm25_dir)
            .with_context(|| format!("failed to create {}", bm25_dir.display()))?;

        let mut schema_builder = Schema::builder();
        let chunk_id = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let doc_id = schema_builder.add_text_field("doc_id", STRING);
        let tenant_id = schema_builder.add_text_field("tenant_id", STRING);
        let namespace = schema_builder.add_text_field("namespace", STRING);
        let text = schema_builder.add_text_field("text", TEXT);
        let schema = schema_builder.build();

        let directory = MmapDirectory::open(&bm25_dir)
            .with_context(|| format!("failed to open {}", bm25_dir.display()))?;
        let index = Index::open_or_create(directory, schema).context("failed to open BM25 index")?;
        let writer = index.writer(WRITER_HEAP_BYTES).context("failed to create BM25 writer")?;
        let reader = index.reader().context("failed to create BM25 reader")?;

        Ok(Self {
            index,
            writer: Mutex::new(writer),
            reader,
            fields: Fields { chunk_id, doc_id, tenant_id, namespace, text },
        })
    }

    /// Index a batch of chunks: (chunk_id, doc_id, tenant, namespace, text)
    pub fn add_chunks(&self, entries: &[(String, String, String, String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().unwrap();
        for (chunk_id, doc_id, tenant_id, namespace, text) in entries {
            writer.add_document(doc!(
                self.fields.chunk_id => chunk_id.as_str(),
                self.fields.doc_id => doc_id.as_str(),
                self.fields.tenant_id => tenant_id.as_str(),
                self.fields.namespace => namespace.as_str(),
                self.fields.text => text.as_str(),
            ))?;
        }
        writer.commit().context("failed to commit BM25 additions")?;
        self.reader.reload()?;
        Ok(())
    }

    /// Remove every chunk of a document
    pub fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.delete_term(Term::from_field_text(self.fields.doc_id, doc_id));
        writer.commit().context("failed to commit BM25 deletion")?;
        self.reader.reload()?;
        Ok(())
    }

    /// Keyword search within a (tenant, namespace) partition
    pub fn search(
        &self,
        tenant_id: &str,
        namespace: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<Bm25Hit>> {
        if query_text.trim().is_empty() || limit == 0 {
            return Ok(vec![]);
        }
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
        let (text_query, _errors) = parser.parse_query_lenient(query_text);

        let tenant_query: Box<dyn Query> = Box::new(TermQuery::new(
            Term::from_field_text(self.fields.tenant_id, tenant_id),
            IndexRecordOption::Basic,
        ));
        let namespace_query: Box<dyn Query> = Box::new(TermQuery::new(
            Term::from_field_text(self.fields.namespace, namespace),
            IndexRecordOption::Basic,
        ));
        let combined = BooleanQuery::new(vec![
            (Occur::Must, tenant_query),
            (Occur::Must, namespace_query),
            (Occur::Must, text_query),
        ]);

        let top_docs = searcher.search(&combined, &TopDocs::with_limit(limit))?;
        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(chunk_id) = doc
                .get_first(self.fields.chunk_id)
                .and_then(|v| v.as_str())
            {
                hits.push(Bm25Hit {
                    chunk_id: chunk_id.to_string(),
                    score,
                });
            }
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(chunk_id: &str, doc_id: &str, tenant: &str, ns: &str, text: &str)
        -> (String, String, String, String, String)
    {
        (
            chunk_id.to_string(),
            doc_id.to_string(),
            tenant.to_string(),
            ns.to_string(),
            text.to_string(),
        )
    }

    #[test]
    fn test_add_and_search() {
        let dir = tempdir().unwrap();
        let index = Bm25Index::open(dir.path()).unwrap();
        index
            .add_chunks(&[
                entry("d1#c0000", "d1", "t1", "ns1", "JWT authentication uses signed tokens"),
                entry("d1#c0001", "d1", "t1", "ns1", "OAuth2 is an authorization framework"),
            ])
            .unwrap();

        let hits = index.search("t1", "ns1", "JWT tokens", 10).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk_id, "d1#c0000");
    }

    #[test]
    fn test_tenant_namespace_isolation() {
        let dir = tempdir().unwrap();
        let index = Bm25Index::open(dir.path()).unwrap();
        index
            .add_chunks(&[
                entry("a#c0000", "a", "t1", "ns1", "shared keyword pineapple"),
                entry("b#c0000", "b", "t2", "ns1", "shared keyword pineapple"),
                entry("c#c0000", "c", "t1", "ns2", "shared keyword pineapple"),
            ])
            .unwrap();

        let hits = index.search("t1", "ns1", "pineapple", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a#c0000");
    }

    #[test]
    fn test_delete_doc_removes_all_chunks() {
        let dir = tempdir().unwrap();
        let index = Bm25Index::open(dir.path()).unwrap();
        index
            .add_chunks(&[
                entry("d1#c0000", "d1", "t1", "ns1", "graphql query language"),
                entry("d1#c0001", "d1", "t1", "ns1", "graphql schema types"),
                entry("d2#c0000", "d2", "t1", "ns1", "rest http verbs"),
            ])
            .unwrap();

        index.delete_doc("d1").unwrap();

        assert!(index.search("t1", "ns1", "graphql", 10).unwrap().is_empty());
        assert_eq!(index.search("t1", "ns1", "rest", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_query_returns_empty() {
        let dir = tempdir().unwrap();
        let index = Bm25Index::open(dir.path()).unwrap();
        assert!(index.search("t1", "ns1", "  ", 10).unwrap().is_empty());
    }

    #[test]
    fn test_special_characters_do_not_error() {
        let dir = tempdir().unwrap();
        let index = Bm25Index::open(dir.path()).unwrap();
        index
            .add_chunks(&[entry("d1#c0000", "d1", "t1", "ns1", "plain text body")])
            .unwrap();
        // Lenient parsing shrugs off query syntax noise
        let hits = index.search("t1", "ns1", "plain AND text) (", 10);
        assert!(hits.is_ok());
    }
}
