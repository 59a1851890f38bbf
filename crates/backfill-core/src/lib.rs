//! Document model, field presence rules and patches shared by every backfill.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "backfill-core";

/// A single field value as stored by the document database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    /// RFC 3339 timestamp, kept in its wire form.
    Timestamp(String),
    String(String),
    /// Base64 encoded bytes.
    Bytes(String),
    /// Full resource name of another document.
    Reference(String),
    GeoPoint { latitude: f64, longitude: f64 },
    Array(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn string_array<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array(values.into_iter().map(|v| Self::String(v.into())).collect())
    }

    /// Coerces scalar values to text. Returns `None` for values with no
    /// sensible text form, for empty text, and for zero, NaN or `false`.
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            Self::String(s) | Self::Timestamp(s) | Self::Reference(s) => s.clone(),
            Self::Integer(0) | Self::Boolean(false) => return None,
            Self::Double(d) if *d == 0.0 || d.is_nan() => return None,
            Self::Integer(i) => i.to_string(),
            Self::Double(d) => d.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Null
            | Self::Bytes(_)
            | Self::GeoPoint { .. }
            | Self::Array(_)
            | Self::Map(_) => return None,
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Only genuine string values; no coercion.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Boolean(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Double(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            JsonValue::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Boolean(b) => JsonValue::Bool(*b),
            Self::Integer(i) => JsonValue::from(*i),
            Self::Double(d) => JsonValue::from(*d),
            Self::Timestamp(s) | Self::String(s) | Self::Bytes(s) | Self::Reference(s) => {
                JsonValue::String(s.clone())
            }
            Self::GeoPoint {
                latitude,
                longitude,
            } => serde_json::json!({ "latitude": latitude, "longitude": longitude }),
            Self::Array(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// A document: its id within the collection plus its top-level fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Merge semantics: fields named by the patch are replaced, every other
    /// field is left as it was.
    pub fn apply(&mut self, patch: &Patch) {
        for (name, value) in patch.iter() {
            self.fields.insert(name.to_string(), value.clone());
        }
    }

    pub fn from_json(id: impl Into<String>, value: &JsonValue) -> Self {
        let fields = value
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// A text target needs backfill when absent, null or an empty string.
pub fn text_is_missing(value: Option<&FieldValue>) -> bool {
    match value {
        None | Some(FieldValue::Null) => true,
        Some(FieldValue::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// A list target needs backfill when absent, null or an empty array. Any other
/// present value is left alone.
pub fn list_is_missing(value: Option<&FieldValue>) -> bool {
    match value {
        None | Some(FieldValue::Null) => true,
        Some(FieldValue::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// First candidate field whose value coerces to non-empty text.
pub fn first_present_text<S: AsRef<str>>(doc: &Document, candidates: &[S]) -> Option<String> {
    candidates
        .iter()
        .find_map(|name| doc.get(name.as_ref()).and_then(FieldValue::as_text))
}

/// Ordered, duplicate-free list of the non-empty string values held by `fields`.
pub fn distinct_strings<S: AsRef<str>>(doc: &Document, fields: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(fields.len());
    for name in fields {
        let Some(value) = doc.get(name.as_ref()).and_then(FieldValue::as_str) else {
            continue;
        };
        if !value.is_empty() && !out.iter().any(|seen| seen == value) {
            out.push(value.to_string());
        }
    }
    out
}

/// The minimal set of fields to merge-write into one document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Patch {
    fields: BTreeMap<String, FieldValue>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        write!(f, "{}", JsonValue::Object(body))
    }
}
