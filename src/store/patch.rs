use super::models::{DeliveryStatus, OperationKind, SourceId, SourceKind, WatcherId, WebhookMethod};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields for creating a watcher. Also the admin API request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherCreate {
    pub name: String,
    pub source_id: SourceId,
    pub collection: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_operations")]
    pub operations: Vec<OperationKind>,
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_method: Option<WebhookMethod>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_config")]
    pub config: Value,
}

/// Partial update of a watcher; `None` fields are left untouched.
/// `trigger_count` and `created_at` are deliberately not patchable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatcherPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source_id: Option<SourceId>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub operations: Option<Vec<OperationKind>>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_method: Option<WebhookMethod>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub config: Option<Value>,
}

/// Fields for creating a data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCreate {
    pub name: String,
    pub kind: SourceKind,
    pub connection_string: String,
    #[serde(default = "default_config")]
    pub config: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Partial update of a data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<SourceKind>,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// One delivery attempt to append to the log. The store assigns the row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogCreate {
    pub watcher_id: WatcherId,
    pub operation: OperationKind,
    pub status: DeliveryStatus,
    pub message: String,
    pub response: Option<Value>,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
}

fn default_operations() -> Vec<OperationKind> {
    vec![OperationKind::Insert]
}

fn default_true() -> bool {
    true
}

fn default_config() -> Value {
    Value::Object(serde_json::Map::new())
}
