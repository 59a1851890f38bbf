//! Document store contract plus the Firestore and in-memory implementations.

use async_trait::async_trait;
use backfill_core::{Document, Patch};
use thiserror::Error;

pub mod credentials;
pub mod firestore;
pub mod memory;

pub use credentials::{CredentialsError, ServiceAccount, CREDENTIALS_ENV};
pub use firestore::{FirestoreConfig, FirestoreStore};
pub use memory::InMemoryStore;

pub const CRATE_NAME: &str = "backfill-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("document {collection}/{id} does not exist")]
    NotFound { collection: String, id: String },
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("{0}")]
    Message(String),
}

/// A document the scan returned but could not decode.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedDocument {
    pub id: String,
    pub reason: String,
}

/// One page of a collection scan, in id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub documents: Vec<Document>,
    pub rejected: Vec<RejectedDocument>,
    /// Id of the last entry the query returned, decodable or not.
    pub last_id: Option<String>,
}

impl Page {
    pub fn from_documents(documents: Vec<Document>) -> Self {
        let last_id = documents.last().map(|doc| doc.id.clone());
        Self {
            documents,
            rejected: Vec::new(),
            last_id,
        }
    }

    /// Entries the query returned, rejected ones included.
    pub fn len(&self) -> usize {
        self.documents.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read/write surface the backfill runner needs from a document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Up to `limit` documents of `collection` ordered by id, starting strictly
    /// after `after` when given.
    async fn list_page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Writes only the fields named by `patch`; all other fields stay intact.
    /// Fails with [`StoreError::NotFound`] instead of creating a document.
    async fn merge_write(&self, collection: &str, id: &str, patch: &Patch)
        -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
