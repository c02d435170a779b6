use crate::error::WatchpostError;
use crate::store::models::{DatabaseSource, OperationKind, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream::BoxStream};
use mongodb::{
    Client,
    bson::{Bson, Document, doc},
    change_stream::event::{ChangeStreamEvent, OperationType},
    options::{ClientOptions, FullDocumentType},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use url::Url;

/// Namespaces that cannot host a live feed and must never be picked by the
/// resolution fallback.
pub const RESERVED_NAMESPACES: [&str; 3] = ["admin", "local", "config"];

/// The logical database and collection a change event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedNamespace {
    #[serde(rename = "db")]
    pub database: String,
    #[serde(rename = "coll")]
    pub collection: String,
}

/// One change observed on a source, already filtered server-side to the
/// watcher's operation kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: OperationKind,
    pub document_id: Option<Value>,
    pub full_document: Option<Value>,
    pub update_description: Option<Value>,
    pub namespace: FeedNamespace,
    pub emitted_at: DateTime<Utc>,
}

/// Lazy, unbounded, non-restartable sequence of change events. Stream end
/// means the underlying feed was closed by the server.
pub type ChangeFeed = BoxStream<'static, Result<ChangeEvent, WatchpostError>>;

/// Live handle to one source backend, shared by every watcher targeting it.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Lists the logical databases/schemas available on the source.
    async fn list_namespaces(&self) -> Result<Vec<String>, WatchpostError>;

    /// Opens a live feed scoped to one namespace + collection, filtered
    /// server-side to the given operation kinds.
    async fn open_feed(
        &self,
        namespace: &str,
        collection: &str,
        operations: &[OperationKind],
    ) -> Result<ChangeFeed, WatchpostError>;

    async fn close(&self) -> Result<(), WatchpostError>;
}

/// Opens connections for a source record. Trait seam so the engine can be
/// exercised against fake backends.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(
        &self,
        source: &DatabaseSource,
    ) -> Result<Arc<dyn SourceConnection>, WatchpostError>;
}

/// Production connector: dispatches on the source's engine kind.
/// MongoDB is the one operational engine.
pub struct EngineConnector {
    connect_timeout: Duration,
}

impl EngineConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SourceConnector for EngineConnector {
    async fn connect(
        &self,
        source: &DatabaseSource,
    ) -> Result<Arc<dyn SourceConnection>, WatchpostError> {
        match source.kind {
            SourceKind::MongoDb => {
                let conn = MongoConnection::connect(source, self.connect_timeout).await?;
                Ok(Arc::new(conn) as Arc<dyn SourceConnection>)
            }
            SourceKind::PostgreSql | SourceKind::MySql => Err(
                WatchpostError::UnimplementedEngine(source.kind.as_str().to_string()),
            ),
        }
    }
}

/// MongoDB backend built on change streams.
pub struct MongoConnection {
    client: Client,
}

impl MongoConnection {
    /// Connects and performs one ping so unreachable sources fail here, at
    /// acquire time, instead of surfacing later as a feed fault.
    pub async fn connect(
        source: &DatabaseSource,
        connect_timeout: Duration,
    ) -> Result<Self, WatchpostError> {
        let mut opts = ClientOptions::parse(&source.connection_string)
            .await
            .map_err(|e| {
                WatchpostError::Connection(format!(
                    "invalid connection string for source {}: {e}",
                    source.name
                ))
            })?;
        opts.connect_timeout = Some(connect_timeout);
        opts.server_selection_timeout = Some(connect_timeout);

        let client = Client::with_options(opts)
            .map_err(|e| WatchpostError::Connection(format!("client setup failed: {e}")))?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| {
                WatchpostError::Connection(format!("source {} unreachable: {e}", source.name))
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl SourceConnection for MongoConnection {
    async fn list_namespaces(&self) -> Result<Vec<String>, WatchpostError> {
        self.client
            .list_database_names()
            .await
            .map_err(|e| WatchpostError::Connection(format!("listing databases failed: {e}")))
    }

    async fn open_feed(
        &self,
        namespace: &str,
        collection: &str,
        operations: &[OperationKind],
    ) -> Result<ChangeFeed, WatchpostError> {
        let kinds: Vec<Bson> = operations
            .iter()
            .map(|op| Bson::String(op.as_str().to_string()))
            .collect();
        let pipeline = vec![doc! { "$match": { "operationType": { "$in": kinds } } }];

        let coll = self
            .client
            .database(namespace)
            .collection::<Document>(collection);

        let stream = coll
            .watch()
            .pipeline(pipeline)
            .full_document(FullDocumentType::UpdateLookup)
            .await
            .map_err(|e| {
                WatchpostError::Connection(format!(
                    "cannot open change stream on {namespace}.{collection}: {e}"
                ))
            })?;

        let database = namespace.to_string();
        let coll_name = collection.to_string();
        let feed = stream
            .filter_map(move |res| {
                let item = match res {
                    Ok(ev) => map_change_event(ev, &database, &coll_name).map(Ok),
                    Err(e) => Some(Err(WatchpostError::Feed(e.to_string()))),
                };
                future::ready(item)
            })
            .boxed();
        Ok(feed)
    }

    async fn close(&self) -> Result<(), WatchpostError> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

fn map_change_event(
    ev: ChangeStreamEvent<Document>,
    database: &str,
    collection: &str,
) -> Option<ChangeEvent> {
    // The $match pipeline only passes the four watched kinds; anything else
    // (drop, rename, invalidate, ...) is not an event we forward.
    let operation = match ev.operation_type {
        OperationType::Insert => OperationKind::Insert,
        OperationType::Update => OperationKind::Update,
        OperationType::Delete => OperationKind::Delete,
        OperationType::Replace => OperationKind::Replace,
        _ => return None,
    };

    let document_id = ev
        .document_key
        .as_ref()
        .and_then(|d| d.get("_id"))
        .cloned()
        .map(Bson::into_relaxed_extjson);
    let full_document = ev
        .full_document
        .map(|d| Bson::Document(d).into_relaxed_extjson());
    let update_description = ev.update_description.map(|ud| {
        json!({
            "updatedFields": Bson::Document(ud.updated_fields).into_relaxed_extjson(),
            "removedFields": ud.removed_fields,
        })
    });

    let namespace = match ev.ns {
        Some(ns) => FeedNamespace {
            database: ns.db,
            collection: ns.coll.unwrap_or_else(|| collection.to_string()),
        },
        None => FeedNamespace {
            database: database.to_string(),
            collection: collection.to_string(),
        },
    };

    Some(ChangeEvent {
        operation,
        document_id,
        full_document,
        update_description,
        namespace,
        emitted_at: Utc::now(),
    })
}

/// Extracts a logical database name from a connection string, if it carries
/// one: the URL path first, then a `database` query parameter.
pub fn namespace_from_connection_string(connection_string: &str) -> Option<String> {
    if let Ok(url) = Url::parse(connection_string) {
        let path = url.path().trim_start_matches('/');
        if !path.is_empty() {
            return Some(path.to_string());
        }
        if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "database") {
            if !v.is_empty() {
                return Some(v.into_owned());
            }
        }
        return None;
    }

    // Multi-host mongodb URLs are not valid generic URLs; fall back to
    // slicing the text between the last '/' of the authority and the query.
    let after_scheme = connection_string.split_once("://").map(|(_, r)| r)?;
    let (authority_and_path, _) = after_scheme
        .split_once('?')
        .unwrap_or((after_scheme, ""));
    let (_, path) = authority_and_path.split_once('/')?;
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::namespace_from_connection_string;

    #[test]
    fn parses_database_from_url_path() {
        assert_eq!(
            namespace_from_connection_string("mongodb://localhost:27017/appdb"),
            Some("appdb".to_string())
        );
        assert_eq!(
            namespace_from_connection_string("mongodb+srv://user:pw@cluster0.example.net/orders"),
            Some("orders".to_string())
        );
    }

    #[test]
    fn parses_database_from_query_parameter() {
        assert_eq!(
            namespace_from_connection_string("mongodb://localhost:27017/?database=appdb"),
            Some("appdb".to_string())
        );
    }

    #[test]
    fn parses_database_from_multi_host_url() {
        assert_eq!(
            namespace_from_connection_string(
                "mongodb://a.example.net:27017,b.example.net:27017/appdb?replicaSet=rs0"
            ),
            Some("appdb".to_string())
        );
    }

    #[test]
    fn no_database_yields_none() {
        assert_eq!(
            namespace_from_connection_string("mongodb://localhost:27017"),
            None
        );
        assert_eq!(
            namespace_from_connection_string("mongodb://localhost:27017/"),
            None
        );
    }
}
