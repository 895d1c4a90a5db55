//! Library surface shared by the `processor`, `tracker` and `sweeper` binaries: the three
//! agent types themselves plus the cross-cutting helpers (`naming`, `poller`,
//! `queue_accounting`, `retry`) that keep their behavior consistent with one another.

pub mod config;
pub mod naming;
pub mod poller;
pub mod processor;
pub mod queue_accounting;
pub mod retry;
pub mod sweeper;
pub mod tracker;

pub use processor::Processor;
pub use sweeper::Sweeper;
pub use tracker::Tracker;
