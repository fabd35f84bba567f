//! In-process store backend used by the test suite and as a fallback when no
//! persistent directory is configured.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::embed::{Embedder, cosine_similarity};
use crate::error::{EngineError, EngineResult};
use crate::schema::Metadata;

use super::{Filter, QueryHit, StoredRow, VectorStore, project_fields};

struct Row {
    text: String,
    metadata: Metadata,
    embedding: Vec<f32>,
}

pub struct MemoryStore {
    rows: RwLock<HashMap<String, Row>>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            embedder,
        }
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert(
        &self,
        ids: &[String],
        texts: &[String],
        metadatas: &[Metadata],
    ) -> EngineResult<()> {
        if ids.len() != texts.len() || ids.len() != metadatas.len() {
            return Err(EngineError::validation("upsert arity mismatch"));
        }

        let embeddings = self.embedder.embed_batch(texts).await?;
        let mut rows = self.rows.write().await;
        for (((id, text), metadata), embedding) in ids
            .iter()
            .zip(texts.iter())
            .zip(metadatas.iter())
            .zip(embeddings.into_iter())
        {
            rows.insert(
                id.clone(),
                Row {
                    text: text.clone(),
                    metadata: metadata.clone(),
                    embedding,
                },
            );
        }
        Ok(())
    }

    async fn get(&self, ids: &[String]) -> EngineResult<Vec<StoredRow>> {
        let rows = self.rows.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                rows.get(id).map(|row| StoredRow {
                    id: id.clone(),
                    text: row.text.clone(),
                    metadata: row.metadata.clone(),
                })
            })
            .collect())
    }

    async fn get_where(
        &self,
        filter: &Filter,
        fields: Option<&[&str]>,
    ) -> EngineResult<Vec<StoredRow>> {
        let rows = self.rows.read().await;
        let mut out: Vec<StoredRow> = rows
            .iter()
            .filter(|(_, row)| filter.matches(&row.metadata))
            .map(|(id, row)| StoredRow {
                id: id.clone(),
                text: row.text.clone(),
                metadata: project_fields(&row.metadata, fields),
            })
            .collect();
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
        let rows = self.rows.read().await;

        let mut hits: Vec<QueryHit> = rows
            .iter()
            .filter(|(_, row)| filter.is_none_or(|f| f.matches(&row.metadata)))
            .map(|(id, row)| QueryHit {
                id: id.clone(),
                text: row.text.clone(),
                metadata: row.metadata.clone(),
                similarity: cosine_similarity(&row.embedding, &query_vec),
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

        let mut rows = self.rows.write().await;
        if let Some(missing) = ids.iter().find(|id| !rows.contains_key(id.as_str())) {
            return Err(EngineError::not_found(format!("no row with id {missing}")));
        }
        for (id, metadata) in ids.iter().zip(metadatas.iter()) {
            if let Some(row) = rows.get_mut(id) {
                row.metadata = metadata.clone();
            }
        }
        Ok(())
    }

    async fn count(&self) -> EngineResult<usize> {
        Ok(self.rows.read().await.len())
    }

    async fn delete_where(&self, filter: &Filter) -> EngineResult<usize> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| !filter.matches(&row.metadata));
        Ok(before - rows.len())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::schema::MetaValue;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(HashEmbedder::new(64)))
    }

    fn meta(session: &str, position: i64) -> Metadata {
        let mut m = Metadata::new();
        m.insert("session_id".into(), MetaValue::Str(session.into()));
        m.insert("sequence_position".into(), MetaValue::Int(position));
        m
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = store();
        let ids = vec!["s_user_1".to_string()];
        let texts = vec!["hello world".to_string()];
        let metas = vec![meta("s", 1)];

        store.upsert(&ids, &texts, &metas).await.unwrap();
        store.upsert(&ids, &texts, &metas).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let rows = store.get(&ids).await.unwrap();
        assert_eq!(rows[0].text, "hello world");
    }

    #[tokio::test]
    async fn get_where_filters_and_sorts() {
        let store = store();
        store
            .upsert(
                &["b_user_1".into(), "a_user_1".into(), "a_user_2".into()],
                &["x".into(), "y".into(), "z".into()],
                &[meta("b", 1), meta("a", 1), meta("a", 2)],
            )
            .await
            .unwrap();

        let rows = store
            .get_where(&Filter::new().eq("session_id", "a"), None)
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a_user_1", "a_user_2"]);
    }

    #[tokio::test]
    async fn query_ranks_by_similarity() {
        let store = store();
        store
            .upsert(
                &["1".into(), "2".into()],
                &[
                    "deploy nginx to the production server".into(),
                    "bake a chocolate cake".into(),
                ],
                &[meta("s", 1), meta("s", 2)],
            )
            .await
            .unwrap();

        let hits = store.query("deploy nginx", 2, None).await.unwrap();
        assert_eq!(hits[0].id, "1");
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[tokio::test]
    async fn update_rejects_unknown_ids_before_writing() {
        let store = store();
        store
            .upsert(&["known".into()], &["t".into()], &[meta("s", 1)])
            .await
            .unwrap();

        let err = store
            .update(
                &["known".into(), "ghost".into()],
                &[meta("s", 1), meta("s", 2)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);

        // The known row must be untouched.
        let rows = store.get(&["known".into()]).await.unwrap();
        assert_eq!(
            rows[0].metadata.get("sequence_position"),
            Some(&MetaValue::Int(1))
        );
    }

    #[tokio::test]
    async fn delete_where_removes_matching_rows() {
        let store = store();
        store
            .upsert(
                &["a_1".into(), "b_1".into()],
                &["x".into(), "y".into()],
                &[meta("a", 1), meta("b", 1)],
            )
            .await
            .unwrap();

        let removed = store
            .delete_where(&Filter::new().eq("session_id", "a"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
