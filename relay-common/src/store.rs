use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{debug, warn};

/// Enumeration of errors for operations with a ResponseStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Persistence of inference responses, keyed by request id.
///
/// `persist` is an idempotent create: a second write with the same id is a
/// logged conflict, not an error, which is what makes redelivery of
/// already-processed records safe. Unexpected errors (connectivity, auth)
/// do propagate. `fetch` returning `None` means unknown-or-in-flight; the
/// two cannot be told apart and callers must not try.
#[async_trait]
pub trait ResponseStore {
    async fn persist(&self, request_id: &str, response: &Value) -> Result<(), StoreError>;
    async fn fetch(&self, request_id: &str) -> Result<Option<Value>, StoreError>;
}

#[async_trait]
impl<T: ResponseStore + Sync> ResponseStore for &T {
    async fn persist(&self, request_id: &str, response: &Value) -> Result<(), StoreError> {
        (**self).persist(request_id, response).await
    }

    async fn fetch(&self, request_id: &str) -> Result<Option<Value>, StoreError> {
        (**self).fetch(request_id).await
    }
}

/// ResponseStore backed by a `responses` table in PostgreSQL.
///
/// The pool is built once at startup and injected into whatever needs it;
/// connection errors surface there, before any record is consumed.
pub struct PostgresResponseStore {
    pool: PgPool,
}

impl PostgresResponseStore {
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResponseStore for PostgresResponseStore {
    async fn persist(&self, request_id: &str, response: &Value) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO responses (id, response) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(request_id)
        .bind(sqlx::types::Json(response))
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        if result.rows_affected() == 0 {
            warn!("response for request id {} already persisted", request_id);
        } else {
            debug!("persisted response for request id {}", request_id);
        }

        Ok(())
    }

    async fn fetch(&self, request_id: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(sqlx::types::Json<Value>,)> =
            sqlx::query_as("SELECT response FROM responses WHERE id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "SELECT".to_owned(),
                    error,
                })?;

        Ok(row.map(|(response,)| response.0))
    }
}

/// In-memory ResponseStore for tests and local runs without a database.
#[derive(Default)]
pub struct MemoryResponseStore {
    responses: Mutex<HashMap<String, Value>>,
}

impl MemoryResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseStore for MemoryResponseStore {
    async fn persist(&self, request_id: &str, response: &Value) -> Result<(), StoreError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.contains_key(request_id) {
            warn!("response for request id {} already persisted", request_id);
            return Ok(());
        }
        responses.insert(request_id.to_owned(), response.clone());

        Ok(())
    }

    async fn fetch(&self, request_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.responses.lock().unwrap().get(request_id).cloned())
    }
}
