//! The relational store and its embedded transactional queue.
//!
//! Everything in this crate talks Postgres through `sqlx`. A single [`Store`] wraps a
//! connection pool and exposes CRUD for reservations, disks and the GPU type catalog, plus
//! the queue primitives (`enqueue`/`dequeue`/`ack`/`nack`) and the [`Store::with_tx`]
//! transaction primitive every multi-step atomic operation is built from.
//!
//! Nested transactions are forbidden by convention: helpers that need to participate in a
//! caller's transaction take `&mut PgConnection` explicitly instead of opening their own.

pub mod disks;
mod error;
pub mod gpu_types;
mod pool;
pub mod queue;
pub mod reservations;

pub use error::{Error, Result};
pub use pool::{jittered_backoff, Store};

#[cfg(test)]
mod tests;
