//! Firestore REST (v1) implementation of [`DocumentStore`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use backfill_core::{Document, FieldValue, Patch};
use chrono::{DateTime, Utc};
use reqwest::{Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credentials::ServiceAccount;
use crate::{DocumentStore, Page, RejectedDocument, StoreError};

pub const PRODUCTION_ENDPOINT: &str = "https://firestore.googleapis.com";
pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
pub const DEFAULT_DATABASE: &str = "(default)";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const EMULATOR_TOKEN: &str = "owner";
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    pub timeout: Duration,
    /// `host:port` of a local emulator; disables OAuth and TLS.
    pub emulator_host: Option<String>,
    pub user_agent: String,
}

impl FirestoreConfig {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: DEFAULT_DATABASE.to_string(),
            timeout: Duration::from_secs(20),
            emulator_host: None,
            user_agent: format!("document-backfill/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Environment overrides on top of the credential's project.
    pub fn from_env(account: &ServiceAccount) -> Self {
        let mut config = Self::for_project(
            std::env::var("FIRESTORE_PROJECT_ID")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| account.project_id.clone()),
        );
        if let Ok(database) = std::env::var("FIRESTORE_DATABASE") {
            if !database.is_empty() {
                config.database = database;
            }
        }
        config.timeout = Duration::from_secs(
            std::env::var("BACKFILL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        );
        config.emulator_host = std::env::var("FIRESTORE_EMULATOR_HOST")
            .ok()
            .filter(|v| !v.is_empty());
        config
    }

    fn endpoint(&self) -> String {
        match &self.emulator_host {
            Some(host) => format!("http://{host}"),
            None => PRODUCTION_ENDPOINT.to_string(),
        }
    }

    /// `projects/{project}/databases/{database}/documents`
    pub fn documents_path(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, self.database
        )
    }
}

/// Firestore's typed JSON value encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireValue {
    NullValue(()),
    BooleanValue(bool),
    IntegerValue(String),
    #[serde(with = "wire_double")]
    DoubleValue(f64),
    TimestampValue(String),
    StringValue(String),
    BytesValue(String),
    ReferenceValue(String),
    GeoPointValue(LatLng),
    ArrayValue(WireArray),
    MapValue(WireMap),
}

/// Non-finite doubles travel as the strings `NaN`, `Infinity` and `-Infinity`.
mod wire_double {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "Infinity" } else { "-Infinity" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("doubleValue {other:?} is not a number"))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WireArray {
    #[serde(default)]
    pub values: Vec<WireValue>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WireMap {
    #[serde(default)]
    pub fields: BTreeMap<String, WireValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDocument {
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, WireValue>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub fn decode_value(value: &WireValue) -> Result<FieldValue, StoreError> {
    Ok(match value {
        WireValue::NullValue(()) => FieldValue::Null,
        WireValue::BooleanValue(b) => FieldValue::Boolean(*b),
        WireValue::IntegerValue(s) => FieldValue::Integer(
            s.parse()
                .map_err(|_| StoreError::Decode(format!("integerValue {s:?} is not an i64")))?,
        ),
        WireValue::DoubleValue(d) => FieldValue::Double(*d),
        WireValue::TimestampValue(s) => FieldValue::Timestamp(s.clone()),
        WireValue::StringValue(s) => FieldValue::String(s.clone()),
        WireValue::BytesValue(s) => FieldValue::Bytes(s.clone()),
        WireValue::ReferenceValue(s) => FieldValue::Reference(s.clone()),
        WireValue::GeoPointValue(p) => FieldValue::GeoPoint {
            latitude: p.latitude,
            longitude: p.longitude,
        },
        WireValue::ArrayValue(a) => FieldValue::Array(
            a.values
                .iter()
                .map(decode_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        WireValue::MapValue(m) => FieldValue::Map(decode_fields(&m.fields)?),
    })
}

pub fn encode_value(value: &FieldValue) -> WireValue {
    match value {
        FieldValue::Null => WireValue::NullValue(()),
        FieldValue::Boolean(b) => WireValue::BooleanValue(*b),
        FieldValue::Integer(i) => WireValue::IntegerValue(i.to_string()),
        FieldValue::Double(d) => WireValue::DoubleValue(*d),
        FieldValue::Timestamp(s) => WireValue::TimestampValue(s.clone()),
        FieldValue::String(s) => WireValue::StringValue(s.clone()),
        FieldValue::Bytes(s) => WireValue::BytesValue(s.clone()),
        FieldValue::Reference(s) => WireValue::ReferenceValue(s.clone()),
        FieldValue::GeoPoint {
            latitude,
            longitude,
        } => WireValue::GeoPointValue(LatLng {
            latitude: *latitude,
            longitude: *longitude,
        }),
        FieldValue::Array(items) => WireValue::ArrayValue(WireArray {
            values: items.iter().map(encode_value).collect(),
        }),
        FieldValue::Map(map) => WireValue::MapValue(WireMap {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), encode_value(v)))
                .collect(),
        }),
    }
}

fn decode_fields(
    fields: &BTreeMap<String, WireValue>,
) -> Result<BTreeMap<String, FieldValue>, StoreError> {
    fields
        .iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

pub fn decode_document(doc: &WireDocument) -> Result<Document, StoreError> {
    let id = document_id_from_name(&doc.name)
        .ok_or_else(|| StoreError::Decode(format!("document name {:?} has no id", doc.name)))?;
    Ok(Document {
        id: id.to_string(),
        fields: decode_fields(&doc.fields)?,
    })
}

/// Decodes runQuery results one document at a time. Documents that fail to
/// decode land in [`Page::rejected`]; only an entry without a usable name
/// fails the whole page.
pub fn decode_page(items: Vec<JsonValue>) -> Result<Page, StoreError> {
    let mut page = Page::default();
    for mut item in items {
        let Some(raw) = item.get_mut("document").map(JsonValue::take) else {
            continue;
        };
        let id = raw
            .get("name")
            .and_then(JsonValue::as_str)
            .and_then(document_id_from_name)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Decode("runQuery document without a name".to_string()))?;
        let decoded = serde_json::from_value::<WireDocument>(raw)
            .map_err(|e| StoreError::Decode(e.to_string()))
            .and_then(|wire| decode_document(&wire));
        match decoded {
            Ok(doc) => page.documents.push(doc),
            Err(err) => page.rejected.push(RejectedDocument {
                id: id.clone(),
                reason: err.to_string(),
            }),
        }
        page.last_id = Some(id);
    }
    Ok(page)
}

/// Query string of a merge write: one mask entry per patched field plus an
/// existence precondition, so a missing document fails instead of appearing.
pub fn merge_query(patch: &Patch) -> Vec<(&'static str, String)> {
    let mut query: Vec<(&'static str, String)> = patch
        .field_names()
        .map(|name| ("updateMask.fieldPaths", field_path(name)))
        .collect();
    query.push(("currentDocument.exists", "true".to_string()));
    query
}

/// Last segment of a full document resource name.
pub fn document_id_from_name(name: &str) -> Option<&str> {
    name.rsplit('/').next().filter(|id| !id.is_empty())
}

/// Field paths that are not plain identifiers must be backtick-quoted.
pub fn field_path(name: &str) -> String {
    let mut chars = name.chars();
    let simple = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

#[derive(Debug)]
pub struct FirestoreStore {
    http: reqwest::Client,
    config: FirestoreConfig,
    account: ServiceAccount,
    token: Mutex<Option<CachedToken>>,
}

impl FirestoreStore {
    pub fn new(config: FirestoreConfig, account: ServiceAccount) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            config,
            account,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FirestoreConfig {
        &self.config
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.config.endpoint())
            .map_err(|e| StoreError::Message(format!("invalid endpoint: {e}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::Message("endpoint cannot be a base URL".to_string()))?;
            path.pop_if_empty()
                .extend([
                    "v1",
                    "projects",
                    self.config.project_id.as_str(),
                    "databases",
                    self.config.database.as_str(),
                ])
                .extend(segments);
        }
        Ok(url)
    }

    pub fn document_url(&self, collection: &str, id: &str) -> Result<Url, StoreError> {
        self.url(&["documents", collection, id])
    }

    pub fn run_query_url(&self) -> Result<Url, StoreError> {
        self.url(&["documents:runQuery"])
    }

    /// Structured query for one page ordered by document name.
    pub fn page_query(&self, collection: &str, after: Option<&str>, limit: usize) -> JsonValue {
        let mut query = json!({
            "from": [{ "collectionId": collection }],
            "orderBy": [{ "field": { "fieldPath": "__name__" }, "direction": "ASCENDING" }],
            "limit": limit,
        });
        if let Some(after) = after {
            query["startAt"] = json!({
                "values": [{
                    "referenceValue": format!("{}/{}/{}", self.config.documents_path(), collection, after)
                }],
                "before": false,
            });
        }
        json!({ "structuredQuery": query })
    }

    async fn bearer_token(&self) -> Result<String, StoreError> {
        if self.config.emulator_host.is_some() {
            return Ok(EMULATOR_TOKEN.to_string());
        }

        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now {
                return Ok(token.access_token.clone());
            }
        }

        let assertion = self.account.signed_assertion(DATASTORE_SCOPE, now)?;
        let resp = self
            .http
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!("token endpoint returned {status}: {body}")));
        }
        let token: TokenResponse = resp.json().await?;
        debug!(expires_in = token.expires_in, "refreshed firestore access token");
        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: now + chrono::Duration::seconds(token.expires_in),
        });
        Ok(token.access_token)
    }
}

async fn ensure_success(resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::HttpStatus {
        status: status.as_u16(),
        url,
        body,
    })
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn list_page(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .post(self.run_query_url()?)
            .bearer_auth(token)
            .json(&self.page_query(collection, after, limit))
            .send()
            .await?;
        let items: Vec<JsonValue> = ensure_success(resp).await?.json().await?;
        decode_page(items)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .get(self.document_url(collection, id)?)
            .bearer_auth(token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: WireDocument = ensure_success(resp).await?.json().await?;
        decode_document(&doc).map(Some)
    }

    async fn merge_write(
        &self,
        collection: &str,
        id: &str,
        patch: &Patch,
    ) -> Result<(), StoreError> {
        let token = self.bearer_token().await?;
        let fields: BTreeMap<&str, WireValue> = patch
            .iter()
            .map(|(name, value)| (name, encode_value(value)))
            .collect();
        let resp = self
            .http
            .patch(self.document_url(collection, id)?)
            .query(&merge_query(patch))
            .bearer_auth(token)
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        ensure_success(resp).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.token.lock().await.take();
        info!(project = %self.config.project_id, "closed firestore client");
        Ok(())
    }
}
