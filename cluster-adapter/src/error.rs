use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors are pre-classified into transient/permanent here, at the adapter boundary,
/// rather than left for every caller to inspect vendor-specific error codes.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("transient error calling {operation}: {reason}"))]
    Transient { operation: String, reason: String },

    #[snafu(display("permanent error calling {operation}: {reason}"))]
    Permanent { operation: String, reason: String },

    #[snafu(display("{what} '{id}' not found"))]
    NotFound { what: String, id: String },
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}

impl From<Error> for common_lib::errors::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Transient { operation, reason } => common_lib::errors::Error::Transient {
                operation,
                source: reason.into(),
            },
            Error::Permanent { operation, reason } => common_lib::errors::Error::Permanent { operation, reason },
            Error::NotFound { what, id } => common_lib::errors::Error::NotFound { what, id },
        }
    }
}
