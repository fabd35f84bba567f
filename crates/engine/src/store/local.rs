//! Persistent single-file store backend backed by [`redb`].
//!
//! # Tables
//!
//! | Name            | Key            | Value                                 |
//! |-----------------|----------------|---------------------------------------|
//! | `rows`          | entry ID (str) | JSON-serialised [`RowValue`]          |
//! | `session_index` | session ID     | newline-separated entry-ID list       |
//!
//! The `session_index` table avoids full scans for the by-session reads the
//! back-fill and reindex paths do constantly.  If the file is deleted the
//! orchestrator rebuilds it from the session logs — zero data loss.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::embed::{Embedder, cosine_similarity};
use crate::error::{EngineError, EngineResult};
use crate::schema::{MetaValue, Metadata};

use super::{Filter, QueryHit, StoredRow, VectorStore, project_fields};

const ROWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("rows");
const SESSION_TABLE: TableDefinition<&str, &str> = TableDefinition::new("session_index");

#[derive(Debug, Serialize, Deserialize)]
struct RowValue {
    text: String,
    metadata: Metadata,
    embedding: Vec<f32>,
}

pub struct RedbStore {
    db: Database,
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl RedbStore {
    /// Open or create the collection file at `dir/{collection}.redb`.
    pub fn open(
        dir: impl AsRef<Path>,
        collection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> EngineResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|err| EngineError::store(format!("creating store dir: {err}")))?;
        let path = dir.join(format!("{collection}.redb"));
        let db = Database::create(&path)
            .map_err(|err| EngineError::store(format!("opening {}: {err}", path.display())))?;

        {
            let tx = db.begin_write().map_err(store_err)?;
            tx.open_table(ROWS_TABLE).map_err(store_err)?;
            tx.open_table(SESSION_TABLE).map_err(store_err)?;
            tx.commit().map_err(store_err)?;
        }

        Ok(Self {
            db,
            path,
            embedder,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_row(&self, id: &str) -> EngineResult<Option<RowValue>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let table = tx.open_table(ROWS_TABLE).map_err(store_err)?;
        match table.get(id).map_err(store_err)? {
            None => Ok(None),
            Some(guard) => {
                let row: RowValue = serde_json::from_slice(guard.value())
                    .map_err(|err| EngineError::internal(format!("corrupt row {id}: {err}")))?;
                Ok(Some(row))
            }
        }
    }

    fn session_of(metadata: &Metadata) -> Option<String> {
        metadata
            .get("session_id")
            .and_then(MetaValue::as_str)
            .map(str::to_string)
    }

    fn scan_rows(&self) -> EngineResult<Vec<(String, RowValue)>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let table = tx.open_table(ROWS_TABLE).map_err(store_err)?;
        let mut rows = Vec::new();
        for item in table.iter().map_err(store_err)? {
            let (key, value) = item.map_err(store_err)?;
            let id = key.value().to_string();
            let row: RowValue = serde_json::from_slice(value.value())
                .map_err(|err| EngineError::internal(format!("corrupt row {id}: {err}")))?;
            rows.push((id, row));
        }
        Ok(rows)
    }

    fn session_member_ids(&self, session_id: &str) -> EngineResult<Vec<String>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let table = tx.open_table(SESSION_TABLE).map_err(store_err)?;
        let list = table
            .get(session_id)
            .map_err(store_err)?
            .map(|v| v.value().to_string())
            .unwrap_or_default();
        Ok(list
            .lines()
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect())
    }
}

fn store_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::store(err.to_string())
}

#[async_trait]
impl VectorStore for RedbStore {
    async fn upsert(
        &self,
        ids: &[String],
        texts: &[String],
        metadatas: &[Metadata],
    ) -> EngineResult<()> {
        if ids.len() != texts.len() || ids.len() != metadatas.len() {
            return Err(EngineError::validation("upsert arity mismatch"));
        }
        if ids.is_empty() {
            return Ok(());
        }

        let embeddings = self.embedder.embed_batch(texts).await?;

        let tx = self.db.begin_write().map_err(store_err)?;
        {
            let mut rows = tx.open_table(ROWS_TABLE).map_err(store_err)?;
            let mut sessions = tx.open_table(SESSION_TABLE).map_err(store_err)?;

            for (((id, text), metadata), embedding) in ids
                .iter()
                .zip(texts.iter())
                .zip(metadatas.iter())
                .zip(embeddings.into_iter())
            {
                let value = RowValue {
                    text: text.clone(),
                    metadata: metadata.clone(),
                    embedding,
                };
                let bytes = serde_json::to_vec(&value)
                    .map_err(|err| EngineError::internal(format!("encode row {id}: {err}")))?;
                rows.insert(id.as_str(), bytes.as_slice()).map_err(store_err)?;

                if let Some(session) = Self::session_of(metadata) {
                    let existing = sessions
                        .get(session.as_str())
                        .map_err(store_err)?
                        .map(|v| v.value().to_string())
                        .unwrap_or_default();
                    if !existing.lines().any(|line| line == id.as_str()) {
                        let updated = if existing.is_empty() {
                            id.clone()
                        } else {
                            format!("{existing}\n{id}")
                        };
                        sessions
                            .insert(session.as_str(), updated.as_str())
                            .map_err(store_err)?;
                    }
                }
            }
        }
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, ids: &[String]) -> EngineResult<Vec<StoredRow>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.load_row(id)? {
                out.push(StoredRow {
                    id: id.clone(),
                    text: row.text,
                    metadata: row.metadata,
                });
            }
        }
        Ok(out)
    }

    async fn get_where(
        &self,
        filter: &Filter,
        fields: Option<&[&str]>,
    ) -> EngineResult<Vec<StoredRow>> {
        // Fast path: a session_id clause narrows the scan through the index.
        let mut out = if let Some(session) = filter
            .value_of("session_id")
            .and_then(MetaValue::as_str)
            .map(str::to_string)
        {
            let mut rows = Vec::new();
            for id in self.session_member_ids(&session)? {
                if let Some(row) = self.load_row(&id)? {
                    if filter.matches(&row.metadata) {
                        rows.push(StoredRow {
                            id,
                            text: row.text,
                            metadata: project_fields(&row.metadata, fields),
                        });
                    }
                }
            }
            rows
        } else {
            self.scan_rows()?
                .into_iter()
                .filter(|(_, row)| filter.matches(&row.metadata))
                .map(|(id, row)| StoredRow {
                    id,
                    text: row.text,
                    metadata: project_fields(&row.metadata, fields),
                })
                .collect()
        };

        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn query(
        &self,
        text: &str,
        k: usize,
        filter: Option<&Filter>,
    ) -> EngineResult<Vec<QueryHit>> {
        let query_vec = self.embedder.embed(text).await?;

        let mut hits: Vec<QueryHit> = self
            .scan_rows()?
            .into_iter()
            .filter(|(_, row)| filter.is_none_or(|f| f.matches(&row.metadata)))
            .map(|(id, row)| QueryHit {
                similarity: cosine_similarity(&row.embedding, &query_vec),
                id,
                text: row.text,
                metadata: row.metadata,
            })
            .collect();

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then(a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn update(&self, ids: &[String], metadatas: &[Metadata]) -> EngineResult<()> {
        if ids.len() != metadatas.len() {
            return Err(EngineError::validation("update arity mismatch"));
        }

        // Verify every target exists before touching anything.
        let mut current = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_row(id)? {
                Some(row) => current.push(row),
                None => return Err(EngineError::not_found(format!("no row with id {id}"))),
            }
        }

        let tx = self.db.begin_write().map_err(store_err)?;
        {
            let mut rows = tx.open_table(ROWS_TABLE).map_err(store_err)?;
            for ((id, metadata), existing) in
                ids.iter().zip(metadatas.iter()).zip(current.into_iter())
            {
                let value = RowValue {
                    text: existing.text,
                    metadata: metadata.clone(),
                    embedding: existing.embedding,
                };
                let bytes = serde_json::to_vec(&value)
                    .map_err(|err| EngineError::internal(format!("encode row {id}: {err}")))?;
                rows.insert(id.as_str(), bytes.as_slice()).map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    async fn count(&self) -> EngineResult<usize> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let table = tx.open_table(ROWS_TABLE).map_err(store_err)?;
        Ok(table.len().map_err(store_err)? as usize)
    }

    async fn delete_where(&self, filter: &Filter) -> EngineResult<usize> {
        let doomed: Vec<(String, Option<String>)> = self
            .scan_rows()?
            .into_iter()
            .filter(|(_, row)| filter.matches(&row.metadata))
            .map(|(id, row)| (id, Self::session_of(&row.metadata)))
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }

        let tx = self.db.begin_write().map_err(store_err)?;
        {
            let mut rows = tx.open_table(ROWS_TABLE).map_err(store_err)?;
            let mut sessions = tx.open_table(SESSION_TABLE).map_err(store_err)?;

            for (id, session) in &doomed {
                rows.remove(id.as_str()).map_err(store_err)?;
                if let Some(session) = session {
                    let existing = sessions
                        .get(session.as_str())
                        .map_err(store_err)?
                        .map(|v| v.value().to_string())
                        .unwrap_or_default();
                    let remaining = existing
                        .lines()
                        .filter(|line| *line != id.as_str() && !line.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if remaining.is_empty() {
                        sessions.remove(session.as_str()).map_err(store_err)?;
                    } else {
                        sessions
                            .insert(session.as_str(), remaining.as_str())
                            .map_err(store_err)?;
                    }
                }
            }
        }
        tx.commit().map_err(store_err)?;
        Ok(doomed.len())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
