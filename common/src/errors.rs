//! The error taxonomy from the error-handling design: validation, admission, transient and
//! permanent infrastructure errors, store errors and logic errors. Every crate in the
//! workspace converts its local error type into one of these variants at its boundary so
//! the processor's dispatch loop can apply a single, uniform retry/fail/ack policy (see
//! `agents::processor::dispatch`).

use snafu::Snafu;
use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top level error type returned by store, cluster-adapter and agents operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Request shape rejected before it ever reached the queue. In practice this is caught
    /// at the (out of scope) API boundary, but handlers re-validate defensively.
    #[snafu(display("invalid request: {reason}"))]
    Validation { reason: String },

    /// No capacity available right now; the caller should queue, not fail.
    #[snafu(display("no capacity available for gpu type '{gpu_type}'"))]
    NoCapacity { gpu_type: String },

    /// Admission denied for a reason other than capacity (e.g. over the per-user cap).
    #[snafu(display("admission denied: {reason}"))]
    AdmissionDenied { reason: String },

    /// A cluster or cloud call failed in a way that's worth retrying (rate limit, 5xx,
    /// timeout). Callers retry in place with backoff up to a bounded budget.
    #[snafu(display("transient infrastructure error calling {operation}: {source}"))]
    Transient {
        operation: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A cluster or cloud call failed in a way retrying will not fix.
    #[snafu(display("permanent infrastructure error calling {operation}: {reason}"))]
    Permanent { operation: String, reason: String },

    /// The relational store reported a serialization failure or deadlock; retried a bounded
    /// number of times by the caller before being surfaced.
    #[snafu(display("store error: {reason}"))]
    Store { reason: String },

    /// The row a caller expected to exist does not.
    #[snafu(display("{what} '{id}' not found"))]
    NotFound { what: String, id: String },

    /// A compare-and-set on `status` lost the race to a concurrent writer. Not an error
    /// condition by itself - handlers treat this as "someone else already advanced it".
    #[snafu(display("status compare-and-set lost the race for reservation {id}"))]
    Conflict { id: Uuid },

    /// Disk is currently attached to a different, still-active reservation.
    #[snafu(display("disk '{name}' is in use by another active reservation"))]
    DiskInUse { name: String },

    /// Reached a branch the state machine should make unreachable. Logged with full
    /// context and treated as a permanent failure of the subject reservation.
    #[snafu(display("unreachable state: {detail}"))]
    Logic { detail: String },
}

impl Error {
    /// A short, stack-trace-free sentence suitable for `Reservation::failure_reason`.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { reason } => reason.clone(),
            Error::NoCapacity { gpu_type } => format!("No {gpu_type} capacity within configured cap"),
            Error::AdmissionDenied { reason } => reason.clone(),
            Error::Transient { operation, .. } => format!("Timed out waiting on {operation}"),
            Error::Permanent { reason, .. } => reason.clone(),
            Error::Store { .. } => "Internal store error".to_string(),
            Error::NotFound { what, id } => format!("{what} {id} not found"),
            Error::Conflict { .. } => "Concurrent update, please retry".to_string(),
            Error::DiskInUse { name } => format!("Disk '{name}' is in use"),
            Error::Logic { .. } => "Internal error".to_string(),
        }
    }

    /// Whether a handler should retry this error in place rather than fail the reservation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::Store { .. })
    }
}
