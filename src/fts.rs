//! Full-text search with facets on top of [`Db`].
//!
//! Documents live in an FTS5 table keyed by an application docid. Facets
//! are `(name, value)` pairs shared between documents; counting them over a
//! result set gives the usual "refine by" sidebar.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::access::{Execute, Query};
use crate::storage::db::Db;

const SCHEMA: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS documents USING fts5(content, docid UNINDEXED);
CREATE TABLE IF NOT EXISTS facets (
    id INTEGER PRIMARY KEY,
    name TEXT,
    value TEXT,
    UNIQUE(name, value)
);
CREATE TABLE IF NOT EXISTS document_facets (
    document_id TEXT,
    facet_id INTEGER,
    FOREIGN KEY(facet_id) REFERENCES facets(id)
);
CREATE INDEX IF NOT EXISTS document_facets_document ON document_facets(document_id);
";

/// A `(name, value)` label attached to documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Facet {
    pub name: String,
    pub value: String,
}

impl Facet {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A matching document with a highlighted excerpt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub docid: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetValueCount {
    pub value: String,
    pub count: u64,
}

/// Per-value document counts for one facet name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetCount {
    pub name: String,
    pub values: Vec<FacetValueCount>,
}

impl FacetCount {
    /// Sum of the counts over every value.
    pub fn total(&self) -> u64 {
        self.values.iter().map(|v| v.count).sum()
    }
}

/// Full-text search handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Fts {
    db: Db,
}

impl Fts {
    /// Create the document and facet tables if needed.
    pub async fn new(db: Db) -> Result<Self> {
        db.write(|tx| tx.execute_batch(SCHEMA)).await?;
        Ok(Self { db })
    }

    /// Store `content` under `docid`, replacing any previous content.
    pub async fn put(&self, docid: &str, content: &str) -> Result<()> {
        let (docid, content) = (docid.to_string(), content.to_string());
        self.db
            .write(move |tx| {
                // FTS5 has no upsert, so update first and insert on a miss.
                let updated = tx.execute(
                    "UPDATE documents SET content = ?1 WHERE docid = ?2",
                    params![content, docid],
                )?;
                if updated == 0 {
                    tx.execute(
                        "INSERT INTO documents (docid, content) VALUES (?1, ?2)",
                        params![docid, content],
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// Remove a document and its facet links.
    pub async fn delete(&self, docid: &str) -> Result<()> {
        let docid = docid.to_string();
        self.db
            .write(move |tx| {
                tx.execute("DELETE FROM documents WHERE docid = ?1", params![docid])?;
                tx.execute(
                    "DELETE FROM document_facets WHERE document_id = ?1",
                    params![docid],
                )?;
                Ok(())
            })
            .await
    }

    /// Fetch a document's content.
    pub fn get(&self, docid: &str) -> Result<String> {
        self.db
            .read(|conn| {
                conn.query_row(
                    "SELECT content FROM documents WHERE docid = ?1",
                    params![docid],
                    |row| row.get(0),
                )
                .optional()
            })?
            .ok_or_else(|| Error::DocumentNotFound(docid.to_string()))
    }

    /// Run an FTS5 `MATCH` query, best matches first.
    ///
    /// Snippets mark matches with `<b>`/`</b>` and elide with `...`.
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        self.db.query_all(
            "SELECT docid, snippet(documents, 0, '<b>', '</b>', '...', 64)
             FROM documents WHERE documents MATCH ?1 ORDER BY rank",
            params![query],
            |row| {
                Ok(SearchHit {
                    docid: row.get(0)?,
                    snippet: row.get(1)?,
                })
            },
        )
    }

    /// Attach facets to a document. Facets are shared by `(name, value)`
    /// and a document is linked to each facet at most once.
    pub async fn add_facets(&self, docid: &str, facets: &[Facet]) -> Result<()> {
        if facets.is_empty() {
            return Ok(());
        }
        let docid = docid.to_string();
        let facets = facets.to_vec();

        self.db
            .write(move |tx| {
                for facet in &facets {
                    tx.execute(
                        "INSERT INTO facets (name, value) VALUES (?1, ?2)
                         ON CONFLICT(name, value) DO NOTHING",
                        params![facet.name, facet.value],
                    )?;
                    let facet_id: i64 = tx.query_row(
                        "SELECT id FROM facets WHERE name = ?1 AND value = ?2",
                        params![facet.name, facet.value],
                        |row| row.get(0),
                    )?;
                    tx.execute(
                        "INSERT INTO document_facets (document_id, facet_id)
                         SELECT ?1, ?2 WHERE NOT EXISTS (
                             SELECT 1 FROM document_facets WHERE document_id = ?1 AND facet_id = ?2
                         )",
                        params![docid, facet_id],
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// Count how many of `doc_ids` carry each facet value.
    ///
    /// Groups come back in name order; values within a group by descending
    /// count, ties broken by value.
    pub fn facet_counts(&self, doc_ids: &[String]) -> Result<Vec<FacetCount>> {
        if doc_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; doc_ids.len()].join(",");
        let sql = format!(
            "SELECT f.name, f.value, COUNT(*) AS count
             FROM document_facets df JOIN facets f ON df.facet_id = f.id
             WHERE df.document_id IN ({placeholders})
             GROUP BY f.name, f.value
             ORDER BY f.name, count DESC, f.value"
        );

        let rows: Vec<(String, String, i64)> =
            self.db
                .query_all(&sql, params_from_iter(doc_ids.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;

        let mut counts: Vec<FacetCount> = Vec::new();
        for (name, value, count) in rows {
            let entry = FacetValueCount {
                value,
                count: u64::try_from(count).unwrap_or(0),
            };
            match counts.last_mut() {
                Some(group) if group.name == name => group.values.push(entry),
                _ => counts.push(FacetCount {
                    name,
                    values: vec![entry],
                }),
            }
        }
        Ok(counts)
    }
}

/// Sort facet groups by total document count, largest first.
pub fn sort_facets_by_total_doc_count(facets: &mut [FacetCount]) {
    facets.sort_by(|a, b| b.total().cmp(&a.total()));
}

/// Put the named facets first, in the order given, followed by the rest in
/// name order.
pub fn order_facets_by_names(facets: &[FacetCount], order: &[&str]) -> Vec<FacetCount> {
    let rank: HashMap<&str, usize> = order.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let mut sorted = facets.to_vec();
    sorted.sort_by(|a, b| {
        match (rank.get(a.name.as_str()), rank.get(b.name.as_str())) {
            (Some(i), Some(j)) => i.cmp(j),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        }
    });
    sorted
}

/// The docids of a result set, in result order.
pub fn doc_ids(hits: &[SearchHit]) -> Vec<String> {
    hits.iter().map(|hit| hit.docid.clone()).collect()
}
