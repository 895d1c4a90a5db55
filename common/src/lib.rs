//! Shared types, errors and configuration for the reservation control plane.
//!
//! This crate has no dependency on any concrete store or cluster adapter; it defines the
//! domain vocabulary (`types`), the process-wide configuration defaults (`config`) and the
//! error taxonomy (`errors`) that every other crate in the workspace builds on.

pub mod config;
pub mod errors;
pub mod types;

/// Helper to convert `Vec<F>` into `Vec<T>` where `F: Into<T>`.
pub trait IntoVec<T>: Sized {
    fn into_vec(self) -> Vec<T>;
}

impl<F: Into<T>, T> IntoVec<T> for Vec<F> {
    fn into_vec(self) -> Vec<T> {
        self.into_iter().map(Into::into).collect()
    }
}
