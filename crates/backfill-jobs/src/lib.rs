//! Backfill job contract plus the product-owner and chat-participant jobs.

use backfill_core::{
    distinct_strings, first_present_text, list_is_missing, text_is_missing, Document, FieldValue,
    Patch,
};
use thiserror::Error;

pub const CRATE_NAME: &str = "backfill-jobs";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown backfill job {0:?}; expected `products` or `chats`")]
    UnknownJob(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoForeignId,
    NothingMissing,
    NoDerivableValue,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoForeignId => "no foreign id",
            Self::NothingMissing => "nothing missing",
            Self::NoDerivableValue => "no derivable value",
        }
    }
}

/// A related document the job must read before it can build a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceLookup {
    pub collection: String,
    pub id: String,
    /// Target fields currently missing on the source document.
    pub needed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Skip(SkipReason),
    Write(Patch),
    Lookup(ReferenceLookup),
}

pub trait BackfillJob: Send + Sync {
    fn name(&self) -> &str;

    /// Collection whose documents get patched.
    fn collection(&self) -> &str;

    fn plan(&self, doc: &Document) -> Plan;

    /// Builds the patch once the reference named by `lookup` has been read.
    /// Only fields in `lookup.needed` with a non-empty value may appear.
    fn derive(&self, _doc: &Document, _lookup: &ReferenceLookup, _reference: &Document) -> Patch {
        Patch::new()
    }
}

/// A text field filled from the first non-empty candidate on the reference.
#[derive(Debug, Clone)]
pub struct TargetField {
    pub name: String,
    pub candidates: Vec<String>,
}

impl TargetField {
    pub fn new(name: &str, candidates: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Copies text fields from a referenced document into the source document.
#[derive(Debug, Clone)]
pub struct ReferenceBackfill {
    pub name: String,
    pub collection: String,
    pub reference_collection: String,
    /// Accepted names of the foreign id field, first non-empty wins.
    pub foreign_keys: Vec<String>,
    pub targets: Vec<TargetField>,
}

impl ReferenceBackfill {
    /// `products.ownerName` / `products.ownerLocation` from `users/{farmerId}`.
    pub fn product_owners() -> Self {
        Self {
            name: "products".to_string(),
            collection: "products".to_string(),
            reference_collection: "users".to_string(),
            foreign_keys: ["farmerId", "farmerUID", "farmer"]
                .into_iter()
                .map(String::from)
                .collect(),
            targets: vec![
                TargetField::new("ownerName", &["displayName", "name", "fullName", "seller"]),
                TargetField::new("ownerLocation", &["location", "farmLocation", "address"]),
            ],
        }
    }

    pub fn foreign_id(&self, doc: &Document) -> Option<String> {
        first_present_text(doc, &self.foreign_keys)
    }
}

impl BackfillJob for ReferenceBackfill {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn plan(&self, doc: &Document) -> Plan {
        let Some(foreign_id) = self.foreign_id(doc) else {
            return Plan::Skip(SkipReason::NoForeignId);
        };
        let needed: Vec<String> = self
            .targets
            .iter()
            .filter(|t| text_is_missing(doc.get(&t.name)))
            .map(|t| t.name.clone())
            .collect();
        if needed.is_empty() {
            return Plan::Skip(SkipReason::NothingMissing);
        }
        Plan::Lookup(ReferenceLookup {
            collection: self.reference_collection.clone(),
            id: foreign_id,
            needed,
        })
    }

    fn derive(&self, _doc: &Document, lookup: &ReferenceLookup, reference: &Document) -> Patch {
        let mut patch = Patch::new();
        for target in self
            .targets
            .iter()
            .filter(|t| lookup.needed.contains(&t.name))
        {
            if let Some(value) = first_present_text(reference, &target.candidates) {
                patch.set(target.name.clone(), FieldValue::String(value));
            }
        }
        patch
    }
}

/// Builds a list field from identity fields already on the document.
#[derive(Debug, Clone)]
pub struct ListBackfill {
    pub name: String,
    pub collection: String,
    pub list_field: String,
    /// Identity fields in output order; equal values collapse to one entry.
    pub sources: Vec<String>,
}

impl ListBackfill {
    /// `chats.participants` from `buyerId` and `farmerId`.
    pub fn chat_participants() -> Self {
        Self {
            name: "chats".to_string(),
            collection: "chats".to_string(),
            list_field: "participants".to_string(),
            sources: vec!["buyerId".to_string(), "farmerId".to_string()],
        }
    }
}

impl BackfillJob for ListBackfill {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn plan(&self, doc: &Document) -> Plan {
        if !list_is_missing(doc.get(&self.list_field)) {
            return Plan::Skip(SkipReason::NothingMissing);
        }
        let ids = distinct_strings(doc, &self.sources);
        if ids.is_empty() {
            return Plan::Skip(SkipReason::NoDerivableValue);
        }
        let mut patch = Patch::new();
        patch.set(self.list_field.clone(), FieldValue::string_array(ids));
        Plan::Write(patch)
    }
}

pub fn job_for_name(name: &str) -> Result<Box<dyn BackfillJob>, JobError> {
    match name {
        "products" => Ok(Box::new(ReferenceBackfill::product_owners())),
        "chats" => Ok(Box::new(ListBackfill::chat_participants())),
        other => Err(JobError::UnknownJob(other.to_string())),
    }
}
