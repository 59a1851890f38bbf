use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use backfill_core::{Document, FieldValue, Patch};
use backfill_jobs::{ListBackfill, ReferenceBackfill};
use backfill_runner::{run_job, BackfillRunner, RunnerConfig};
use backfill_storage::{DocumentStore, InMemoryStore, Page, RejectedDocument, StoreError};

fn config(page_size: usize) -> RunnerConfig {
    RunnerConfig {
        page_size,
        ..Default::default()
    }
}

fn text(value: &str) -> FieldValue {
    FieldValue::string(value)
}

fn marketplace() -> InMemoryStore {
    InMemoryStore::new()
        .with_document(
            "products",
            Document::new("p1")
                .with_field("farmerId", text("u1"))
                .with_field("ownerName", text("")),
        )
        .with_document("products", Document::new("p2").with_field("title", text("Eggs")))
        .with_document(
            "products",
            Document::new("p3")
                .with_field("farmerUID", text("u2"))
                .with_field("ownerName", text("Original Owner")),
        )
        .with_document(
            "products",
            Document::new("p4").with_field("farmer", text("ghost")),
        )
        .with_document(
            "users",
            Document::new("u1")
                .with_field("name", text("Alice"))
                .with_field("location", text("Valley")),
        )
        .with_document(
            "users",
            Document::new("u2")
                .with_field("displayName", text("Someone Else"))
                .with_field("farmLocation", text("Ridge")),
        )
}

fn products_runner(store: Arc<InMemoryStore>, page_size: usize) -> BackfillRunner {
    BackfillRunner::new(
        config(page_size),
        store,
        Box::new(ReferenceBackfill::product_owners()),
    )
}

#[tokio::test]
async fn owner_fields_are_copied_from_the_user() {
    let store = Arc::new(marketplace());
    let summary = products_runner(store.clone(), 2).run().await.expect("run");

    let p1 = store.document("products", "p1").await.expect("p1");
    assert_eq!(p1.get("ownerName"), Some(&text("Alice")));
    assert_eq!(p1.get("ownerLocation"), Some(&text("Valley")));
    assert_eq!(summary.scanned, 4);
    assert_eq!(summary.patched, 2);
}

#[tokio::test]
async fn record_without_foreign_id_is_untouched() {
    let store = Arc::new(marketplace());
    let before = store.document("products", "p2").await.expect("p2");
    products_runner(store.clone(), 10).run().await.expect("run");
    assert_eq!(store.document("products", "p2").await.expect("p2"), before);
}

#[tokio::test]
async fn existing_values_survive_merge() {
    let store = Arc::new(marketplace());
    products_runner(store.clone(), 10).run().await.expect("run");

    let p3 = store.document("products", "p3").await.expect("p3");
    assert_eq!(p3.get("ownerName"), Some(&text("Original Owner")));
    assert_eq!(p3.get("ownerLocation"), Some(&text("Ridge")));
}

#[tokio::test]
async fn missing_user_does_not_abort_the_run() {
    let store = Arc::new(marketplace());
    let summary = products_runner(store.clone(), 1).run().await.expect("run");

    assert_eq!(summary.missing_references, 1);
    let p4 = store.document("products", "p4").await.expect("p4");
    assert!(p4.get("ownerName").is_none());
    // p4 sorts last; p1 and p3 on the earlier pages were still patched.
    assert_eq!(summary.patched, 2);
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let store = Arc::new(marketplace());
    products_runner(store.clone(), 3).run().await.expect("first run");
    let after_first = store.collection_json("products").await;
    let writes_after_first = store.writes();

    let second = products_runner(store.clone(), 3).run().await.expect("second run");
    assert_eq!(second.patched, 0);
    assert_eq!(store.writes(), writes_after_first);
    assert_eq!(store.collection_json("products").await, after_first);
}

#[tokio::test]
async fn chat_with_same_buyer_and_farmer_gets_one_participant() {
    let store = Arc::new(
        InMemoryStore::new()
            .with_document(
                "chats",
                Document::new("c1")
                    .with_field("buyerId", text("b1"))
                    .with_field("farmerId", text("b1")),
            )
            .with_document(
                "chats",
                Document::new("c2")
                    .with_field("buyerId", text("b2"))
                    .with_field("participants", FieldValue::string_array(["b2", "f9"])),
            ),
    );
    let summary = run_job(
        config(200),
        store.clone(),
        Box::new(ListBackfill::chat_participants()),
    )
    .await
    .expect("run");

    let c1 = store.document("chats", "c1").await.expect("c1");
    assert_eq!(c1.get("participants"), Some(&FieldValue::string_array(["b1"])));
    let c2 = store.document("chats", "c2").await.expect("c2");
    assert_eq!(
        c2.get("participants"),
        Some(&FieldValue::string_array(["b2", "f9"]))
    );
    assert_eq!(summary.patched, 1);
}

/// Wraps the memory store and fails selected operations.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    failing_writes: HashSet<String>,
    failing_reads: HashSet<String>,
    /// Listed as rejected instead of decoded.
    undecodable: HashSet<String>,
    /// Removed from the store right after the page listing them is served.
    deleted_after_scan: HashSet<String>,
    broken_scan: bool,
    scanned_ids: tokio::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn list_page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        if self.broken_scan {
            return Err(StoreError::Message("query refused".to_string()));
        }
        let mut page = self.inner.list_page(collection, after, limit).await?;
        self.scanned_ids
            .lock()
            .await
            .extend(page.documents.iter().map(|d| d.id.clone()));

        let (rejected, documents): (Vec<_>, Vec<_>) = page
            .documents
            .into_iter()
            .partition(|doc| self.undecodable.contains(&doc.id));
        page.documents = documents;
        page.rejected = rejected
            .into_iter()
            .map(|doc| RejectedDocument {
                id: doc.id,
                reason: "unsupported value type".to_string(),
            })
            .collect();

        for doc in &page.documents {
            if self.deleted_after_scan.contains(&doc.id) {
                self.inner.remove(collection, &doc.id).await;
            }
        }
        Ok(page)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        if self.failing_reads.contains(id) {
            return Err(StoreError::Message(format!("read of {id} refused")));
        }
        self.inner.get(collection, id).await
    }

    async fn merge_write(
        &self,
        collection: &str,
        id: &str,
        patch: &Patch,
    ) -> Result<(), StoreError> {
        if self.failing_writes.contains(id) {
            return Err(StoreError::Message(format!("write to {id} refused")));
        }
        self.inner.merge_write(collection, id, patch).await
    }
}

#[tokio::test]
async fn per_record_failures_are_contained() {
    let store = Arc::new(FlakyStore {
        inner: marketplace().with_document(
            "products",
            Document::new("p5").with_field("farmerId", text("u2")),
        ),
        failing_writes: HashSet::from(["p1".to_string()]),
        ..Default::default()
    });
    let summary = BackfillRunner::new(
        config(2),
        store.clone(),
        Box::new(ReferenceBackfill::product_owners()),
    )
    .run()
    .await
    .expect("run");

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.patched, 2);
    let p5 = store.inner.document("products", "p5").await.expect("p5");
    assert_eq!(p5.get("ownerName"), Some(&text("Someone Else")));
    let p1 = store.inner.document("products", "p1").await.expect("p1");
    assert_eq!(p1.get("ownerName"), Some(&text("")));
}

#[tokio::test]
async fn failed_reference_read_skips_only_that_record() {
    let store = Arc::new(FlakyStore {
        inner: marketplace(),
        failing_reads: HashSet::from(["u1".to_string()]),
        ..Default::default()
    });
    let summary = BackfillRunner::new(
        config(10),
        store.clone(),
        Box::new(ReferenceBackfill::product_owners()),
    )
    .run()
    .await
    .expect("run");

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.patched, 1);
    let p3 = store.inner.document("products", "p3").await.expect("p3");
    assert_eq!(p3.get("ownerLocation"), Some(&text("Ridge")));
}

#[tokio::test]
async fn pages_never_revisit_a_record() {
    let inner = (0..23).fold(InMemoryStore::new(), |store, i| {
        store.with_document(
            "chats",
            Document::new(format!("chat-{i:02}")).with_field("buyerId", text("b")),
        )
    });
    let fixture = serde_json::json!({ "chats": inner.collection_json("chats").await });
    for page_size in [1, 4, 5, 23, 50] {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::from_json(&fixture).expect("fixture"),
            ..Default::default()
        });
        BackfillRunner::new(
            config(page_size),
            store.clone(),
            Box::new(ListBackfill::chat_participants()),
        )
        .run()
        .await
        .expect("run");

        let scanned = store.scanned_ids.lock().await.clone();
        let unique: HashSet<_> = scanned.iter().cloned().collect();
        assert_eq!(scanned.len(), 23, "page_size={page_size}");
        assert_eq!(unique.len(), 23, "page_size={page_size}");
    }
}

#[tokio::test]
async fn undecodable_document_is_counted_and_the_scan_moves_on() {
    let store = Arc::new(FlakyStore {
        inner: marketplace(),
        undecodable: HashSet::from(["p2".to_string()]),
        ..Default::default()
    });
    // p1, p2 fill the first page; p2 is its last entry and must still move the cursor.
    let summary = BackfillRunner::new(
        config(2),
        store.clone(),
        Box::new(ReferenceBackfill::product_owners()),
    )
    .run()
    .await
    .expect("run");

    assert_eq!(summary.scanned, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.patched, 2);
    let p3 = store.inner.document("products", "p3").await.expect("p3");
    assert_eq!(p3.get("ownerLocation"), Some(&text("Ridge")));
}

#[tokio::test]
async fn record_deleted_before_its_write_is_not_recreated() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryStore::new()
            .with_document(
                "chats",
                Document::new("c1").with_field("buyerId", text("b1")),
            )
            .with_document(
                "chats",
                Document::new("c2").with_field("buyerId", text("b2")),
            ),
        deleted_after_scan: HashSet::from(["c1".to_string()]),
        ..Default::default()
    });
    let summary = run_job(
        config(10),
        store.clone(),
        Box::new(ListBackfill::chat_participants()),
    )
    .await
    .expect("run");

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.patched, 1);
    assert!(store.inner.document("chats", "c1").await.is_none());
    let c2 = store.inner.document("chats", "c2").await.expect("c2");
    assert_eq!(c2.get("participants"), Some(&FieldValue::string_array(["b2"])));
}

#[tokio::test]
async fn failed_page_scan_aborts_the_run() {
    let store = Arc::new(FlakyStore {
        inner: marketplace(),
        broken_scan: true,
        ..Default::default()
    });
    let err = run_job(
        config(10),
        store,
        Box::new(ReferenceBackfill::product_owners()),
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("query refused"));
}
