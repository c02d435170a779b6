use crate::error::WatchpostError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::{fmt, str::FromStr};

pub type WatcherId = i64;
pub type SourceId = i64;

/// Change operation kinds a watcher can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Replace,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Replace => "replace",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = WatchpostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            "replace" => Ok(OperationKind::Replace),
            other => Err(WatchpostError::Unexpected(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// HTTP verb used for webhook delivery. Defaults to POST when unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl WebhookMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookMethod::Get => "GET",
            WebhookMethod::Post => "POST",
            WebhookMethod::Put => "PUT",
            WebhookMethod::Patch => "PATCH",
            WebhookMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for WebhookMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookMethod {
    type Err = WatchpostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(WebhookMethod::Get),
            "POST" => Ok(WebhookMethod::Post),
            "PUT" => Ok(WebhookMethod::Put),
            "PATCH" => Ok(WebhookMethod::Patch),
            "DELETE" => Ok(WebhookMethod::Delete),
            other => Err(WatchpostError::Unexpected(format!(
                "unknown webhook method: {other}"
            ))),
        }
    }
}

/// Source engine types. Only MongoDB is operational; the others are kept in the
/// closed enum so stored configurations referencing them fail with a typed
/// "not implemented" error instead of an opaque one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[serde(rename = "mongodb")]
    MongoDb,
    #[serde(rename = "postgresql")]
    PostgreSql,
    #[serde(rename = "mysql")]
    MySql,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::MongoDb => "mongodb",
            SourceKind::PostgreSql => "postgresql",
            SourceKind::MySql => "mysql",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = WatchpostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mongodb" => Ok(SourceKind::MongoDb),
            "postgresql" => Ok(SourceKind::PostgreSql),
            "mysql" => Ok(SourceKind::MySql),
            other => Err(WatchpostError::Unexpected(format!(
                "unknown source kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failure,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failure => "failure",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = WatchpostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(DeliveryStatus::Success),
            "failure" => Ok(DeliveryStatus::Failure),
            other => Err(WatchpostError::Unexpected(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// A configured watcher: one collection on one source, relayed to one webhook.
///
/// The core only reads these records; the sole field it writes back is
/// `trigger_count`, incremented once per delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watcher {
    pub id: WatcherId,
    pub name: String,
    pub source_id: SourceId,
    pub collection: String,
    /// Explicit logical database/schema. When unset, the namespace is resolved
    /// from the source connection string or guessed.
    pub namespace: Option<String>,
    pub operations: Vec<OperationKind>,
    pub webhook_url: String,
    pub webhook_method: Option<WebhookMethod>,
    pub enabled: bool,
    pub trigger_count: i64,
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Watcher {
    pub fn method(&self) -> WebhookMethod {
        self.webhook_method.unwrap_or_default()
    }
}

/// A configured data source shared by all watchers referencing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSource {
    pub id: SourceId,
    pub name: String,
    pub kind: SourceKind,
    pub connection_string: String,
    pub config: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recorded delivery attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: i64,
    pub watcher_id: WatcherId,
    pub operation: OperationKind,
    pub status: DeliveryStatus,
    pub message: String,
    pub response: Option<Value>,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counts over a watcher's delivery log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStats {
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub last_attempt: Option<DateTime<Utc>>,
}

// Raw rows as stored in SQLite. Enum and JSON columns are TEXT and converted
// on the way out so the rest of the crate only sees domain types.

#[derive(Debug, FromRow)]
pub(crate) struct WatcherRow {
    pub id: i64,
    pub name: String,
    pub source_id: i64,
    pub collection: String,
    pub namespace: Option<String>,
    pub operations: String,
    pub webhook_url: String,
    pub webhook_method: Option<String>,
    pub enabled: bool,
    pub trigger_count: i64,
    pub config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<WatcherRow> for Watcher {
    type Error = WatchpostError;

    fn try_from(row: WatcherRow) -> Result<Self, Self::Error> {
        let webhook_method = row
            .webhook_method
            .as_deref()
            .map(WebhookMethod::from_str)
            .transpose()?;
        Ok(Watcher {
            id: row.id,
            name: row.name,
            source_id: row.source_id,
            collection: row.collection,
            namespace: row.namespace,
            operations: serde_json::from_str(&row.operations)?,
            webhook_url: row.webhook_url,
            webhook_method,
            enabled: row.enabled,
            trigger_count: row.trigger_count,
            config: serde_json::from_str(&row.config)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SourceRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub connection_string: String,
    pub config: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SourceRow> for DatabaseSource {
    type Error = WatchpostError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        Ok(DatabaseSource {
            id: row.id,
            name: row.name,
            kind: row.kind.parse()?,
            connection_string: row.connection_string,
            config: serde_json::from_str(&row.config)?,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct LogRow {
    pub id: i64,
    pub watcher_id: i64,
    pub operation: String,
    pub status: String,
    pub message: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for DeliveryLogEntry {
    type Error = WatchpostError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let response = row
            .response
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let error = row.error.as_deref().map(serde_json::from_str).transpose()?;
        Ok(DeliveryLogEntry {
            id: row.id,
            watcher_id: row.watcher_id,
            operation: row.operation.parse()?,
            status: row.status.parse()?,
            message: row.message,
            response,
            error,
            created_at: row.created_at,
        })
    }
}
