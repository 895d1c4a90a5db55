use crate::error::{Error, Result};
use futures::future::BoxFuture;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{Pool, Transaction};
use std::time::Duration;

/// The relational store: a Postgres connection pool plus the retrying transaction helper
/// every handler builds its atomic multi-step work on.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Postgres>,
}

impl Store {
    /// Connects and migrates. `test_before_acquire` makes the pool probe a connection with
    /// a no-op query before handing it out and silently discard+replace it on failure.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .test_before_acquire(true)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|source| Error::Connect { source })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|source| Error::Migrate { source })?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Runs `f` against a fresh `SERIALIZABLE` transaction, retrying transparently on
    /// serialization failure or deadlock up to 5 times with jittered backoff. Every
    /// multi-step atomic operation in this workspace is a single call to `with_tx` - nested
    /// transactions are forbidden by convention; helpers take `&mut Transaction` explicitly
    /// instead of opening their own.
    pub async fn with_tx<F, T>(&self, mut f: F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut Transaction<'_, Postgres>) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        const MAX_ATTEMPTS: u32 = 5;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.pool.begin().await.map_err(|source| Error::Query { source })?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(|source| Error::Query { source })?;

            match f(&mut tx).await {
                Ok(value) => {
                    tx.commit().await.map_err(|source| Error::Query { source })?;
                    return Ok(value);
                }
                Err(Error::Query { source }) if Error::is_retryable_db_error(&source) && attempt < MAX_ATTEMPTS => {
                    let _ = tx.rollback().await;
                    let backoff = jittered_backoff(attempt);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(Error::Query { source }) if Error::is_retryable_db_error(&source) => {
                    let _ = tx.rollback().await;
                    return Err(Error::TxRetriesExhausted { attempts: attempt, source });
                }
                Err(other) => {
                    let _ = tx.rollback().await;
                    return Err(other);
                }
            }
        }
    }
}

/// Exponential backoff with full jitter, used both for store retries and (by the
/// cluster-adapter / tracker) for transient cloud rate-limit errors.
pub fn jittered_backoff(attempt: u32) -> Duration {
    use rand::Rng;
    let base_ms = 50u64.saturating_mul(1u64 << attempt.min(6));
    let jittered = rand::thread_rng().gen_range(0..=base_ms);
    Duration::from_millis(jittered.max(10))
}
