use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use backfill_core::{Document, Patch};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::{DocumentStore, Page, StoreError};

type Collection = BTreeMap<String, Document>;

/// Process-local store with the same ordering and merge rules as the real
/// database. Backs the tests and `--fixture` runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<BTreeMap<String, Collection>>,
    writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, collection: &str, doc: Document) -> Self {
        self.collections
            .get_mut()
            .entry(collection.to_string())
            .or_default()
            .insert(doc.id.clone(), doc);
        self
    }

    /// Fixture layout: `{ "<collection>": { "<doc id>": { <fields> } } }`.
    pub fn from_json(value: &JsonValue) -> anyhow::Result<Self> {
        let root = value
            .as_object()
            .context("fixture root must be an object of collections")?;
        let mut store = Self::new();
        for (collection, docs) in root {
            let docs = docs
                .as_object()
                .with_context(|| format!("collection {collection} must be an object of documents"))?;
            for (id, fields) in docs {
                store = store.with_document(collection, Document::from_json(id, fields));
            }
        }
        Ok(store)
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let value: JsonValue =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_json(&value)
    }

    pub async fn collection_json(&self, collection: &str) -> JsonValue {
        let guard = self.collections.read().await;
        let docs = guard
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| (id.clone(), doc.to_json()))
                    .collect::<serde_json::Map<_, _>>()
            })
            .unwrap_or_default();
        JsonValue::Object(docs)
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub async fn remove(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .write()
            .await
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
    }

    /// Number of merge writes served so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn list_page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(collection) else {
            return Ok(Page::default());
        };
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        Ok(Page::from_documents(
            docs.range((lower, Bound::Unbounded))
                .take(limit)
                .map(|(_, doc)| doc.clone())
                .collect(),
        ))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.document(collection, id).await)
    }

    async fn merge_write(
        &self,
        collection: &str,
        id: &str,
        patch: &Patch,
    ) -> Result<(), StoreError> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        doc.apply(patch);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
