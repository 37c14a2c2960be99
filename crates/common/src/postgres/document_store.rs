use crate::domain::DomainError;
use crate::postgres::PostgresClient;
use chrono::Utc;
use deadpool_postgres::GenericClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Live and archive collections for the versioned variant
pub const METAUSERS: &str = "metausers";
pub const OLD_METAUSERS: &str = "old_metausers";

/// Live and archive collections for the flat variant
pub const USERS: &str = "users";
pub const OLD_USERS: &str = "old_users";

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no document {id} in {collection}")]
    NotFound { collection: String, id: String },

    #[error("document {id} already exists in {collection}")]
    AlreadyExists { collection: String, id: String },

    #[error("store {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("document encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("connection pool error: {0}")]
    Pool(anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => {
                DomainError::DocumentNotFound { collection, id }
            }
            StoreError::AlreadyExists { collection, id } => {
                DomainError::DocumentAlreadyExists { collection, id }
            }
            StoreError::Timeout { operation, .. } => DomainError::Timeout(operation.to_string()),
            other => DomainError::RepositoryError(other.into()),
        }
    }
}

/// One write inside [`PostgresDocumentStore::with_transaction`]
#[derive(Debug, Clone)]
pub enum DocumentWrite {
    Insert {
        collection: String,
        id: String,
        document: serde_json::Value,
    },
    Upsert {
        collection: String,
        id: String,
        document: serde_json::Value,
    },
    Update {
        collection: String,
        id: String,
        document: serde_json::Value,
    },
    Remove {
        collection: String,
        id: String,
    },
}

/// JSON documents keyed by id, one table per collection.
///
/// Every call is bounded by the configured timeout.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    client: PostgresClient,
    timeout: Duration,
}

impl PostgresDocumentStore {
    pub fn new(client: PostgresClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Create any missing collection tables
    #[instrument(skip(self))]
    pub async fn ensure_collections(&self, collections: &[&str]) -> Result<(), StoreError> {
        let mut ddl = String::new();
        for collection in collections {
            let table = table_name(collection)?;
            ddl.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    document JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );"
            ));
        }

        self.bounded("ensure_collections", async {
            let conn = self.connection().await?;
            conn.batch_execute(&ddl).await?;
            Ok(())
        })
        .await?;

        info!(collections = ?collections, "collections ready");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn find_one<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<T, StoreError> {
        let table = table_name(collection)?;
        let sql = format!("SELECT document FROM {table} WHERE id = $1");

        let row = self
            .bounded("find_one", async {
                let conn = self.connection().await?;
                Ok(conn.query_opt(sql.as_str(), &[&id]).await?)
            })
            .await?;

        let row = row.ok_or_else(|| not_found(collection, id))?;
        let document: serde_json::Value = row.try_get("document")?;
        Ok(serde_json::from_value(document)?)
    }

    /// Insert a new document; an existing id is an error
    #[instrument(skip(self, document))]
    pub async fn insert<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        document: &T,
    ) -> Result<String, StoreError> {
        let write = DocumentWrite::Insert {
            collection: collection.to_string(),
            id: id.to_string(),
            document: serde_json::to_value(document)?,
        };

        self.bounded("insert", async {
            let conn = self.connection().await?;
            apply(&conn, &write).await
        })
        .await?;

        debug!(collection, id, "document inserted");
        Ok(id.to_string())
    }

    /// Insert or replace a document
    #[instrument(skip(self, document))]
    pub async fn upsert<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        document: &T,
    ) -> Result<String, StoreError> {
        let write = DocumentWrite::Upsert {
            collection: collection.to_string(),
            id: id.to_string(),
            document: serde_json::to_value(document)?,
        };

        self.bounded("upsert", async {
            let conn = self.connection().await?;
            apply(&conn, &write).await
        })
        .await?;

        debug!(collection, id, "document upserted");
        Ok(id.to_string())
    }

    /// Replace an existing document in a single statement
    #[instrument(skip(self, document))]
    pub async fn update<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        document: &T,
    ) -> Result<(), StoreError> {
        let write = DocumentWrite::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            document: serde_json::to_value(document)?,
        };

        self.bounded("update", async {
            let conn = self.connection().await?;
            apply(&conn, &write).await
        })
        .await?;

        debug!(collection, id, "document updated");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let write = DocumentWrite::Remove {
            collection: collection.to_string(),
            id: id.to_string(),
        };

        self.bounded("remove", async {
            let conn = self.connection().await?;
            apply(&conn, &write).await
        })
        .await?;

        debug!(collection, id, "document removed");
        Ok(())
    }

    /// Apply `writes` atomically, in order. Any failure rolls back all of them.
    #[instrument(skip(self, writes), fields(write_count = writes.len()))]
    pub async fn with_transaction(&self, writes: Vec<DocumentWrite>) -> Result<(), StoreError> {
        self.bounded("transaction", async {
            let mut conn = self.connection().await?;
            let transaction = conn.transaction().await?;
            for write in &writes {
                apply(&transaction, write).await?;
            }
            transaction.commit().await?;
            Ok(())
        })
        .await?;

        debug!(write_count = writes.len(), "transaction committed");
        Ok(())
    }

    async fn connection(&self) -> Result<deadpool_postgres::Client, StoreError> {
        self.client
            .get_connection()
            .await
            .map_err(StoreError::Pool)
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout {
                operation,
                timeout: self.timeout,
            })?
    }
}

async fn apply<C>(conn: &C, write: &DocumentWrite) -> Result<(), StoreError>
where
    C: GenericClient + Sync,
{
    let now = Utc::now();

    match write {
        DocumentWrite::Insert {
            collection,
            id,
            document,
        } => {
            let table = table_name(collection)?;
            let sql =
                format!("INSERT INTO {table} (id, document, updated_at) VALUES ($1, $2, $3)");
            match conn.execute(sql.as_str(), &[id, document, &now]).await {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                    collection: collection.clone(),
                    id: id.clone(),
                }),
                Err(e) => Err(e.into()),
            }
        }
        DocumentWrite::Upsert {
            collection,
            id,
            document,
        } => {
            let table = table_name(collection)?;
            let sql = format!(
                "INSERT INTO {table} (id, document, updated_at) VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO UPDATE
                 SET document = EXCLUDED.document, updated_at = EXCLUDED.updated_at"
            );
            conn.execute(sql.as_str(), &[id, document, &now]).await?;
            Ok(())
        }
        DocumentWrite::Update {
            collection,
            id,
            document,
        } => {
            let table = table_name(collection)?;
            let sql = format!("UPDATE {table} SET document = $2, updated_at = $3 WHERE id = $1");
            let affected = conn.execute(sql.as_str(), &[id, document, &now]).await?;
            if affected == 0 {
                return Err(not_found(collection, id));
            }
            Ok(())
        }
        DocumentWrite::Remove { collection, id } => {
            let table = table_name(collection)?;
            let sql = format!("DELETE FROM {table} WHERE id = $1");
            let affected = conn.execute(sql.as_str(), &[id]).await?;
            if affected == 0 {
                return Err(not_found(collection, id));
            }
            Ok(())
        }
    }
}

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.as_db_error()
        .is_some_and(|db_err| db_err.code().code() == UNIQUE_VIOLATION)
}

fn not_found(collection: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}

/// Collection names become table identifiers, so only `[a-z_][a-z0-9_]*` is accepted.
fn table_name(collection: &str) -> Result<&str, StoreError> {
    let mut chars = collection.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_start && valid_rest && collection.len() <= 63 {
        Ok(collection)
    } else {
        Err(StoreError::InvalidCollection(collection.to_string()))
    }
}
