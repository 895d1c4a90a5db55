use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to connect to the store: {source}"))]
    Connect { source: sqlx::Error },

    #[snafu(display("failed to run store migrations: {source}"))]
    Migrate { source: sqlx::migrate::MigrateError },

    #[snafu(display("store query failed: {source}"))]
    Query { source: sqlx::Error },

    #[snafu(display("transaction exhausted its retry budget ({attempts} attempts): {source}"))]
    TxRetriesExhausted { attempts: u32, source: sqlx::Error },

    #[snafu(display("{what} '{id}' not found"))]
    NotFound { what: String, id: String },

    #[snafu(display("compare-and-set on {what} '{id}' lost the race"))]
    CasConflict { what: String, id: String },
}

impl Error {
    /// Postgres SQLSTATE 40001 (serialization_failure) and 40P01 (deadlock_detected) are
    /// the two classes `with_tx` retries transparently, up to 5 times with backoff.
    pub(crate) fn is_retryable_db_error(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
            _ => false,
        }
    }
}

impl From<Error> for common_lib::errors::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound { what, id } => common_lib::errors::Error::NotFound { what, id },
            Error::CasConflict { id, .. } => common_lib::errors::Error::Conflict {
                id: id.parse().unwrap_or_default(),
            },
            other => common_lib::errors::Error::Store {
                reason: other.to_string(),
            },
        }
    }
}
