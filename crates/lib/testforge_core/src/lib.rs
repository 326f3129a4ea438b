//! # testforge_core
//!
//! Core domain logic for Testforge: the OAuth token lifecycle, the
//! generate → review → publish workflow, and the seams they run on
//! (provider, generation engine, stores).

pub mod auth;
pub mod generation;
pub mod models;
pub mod provider;
pub mod secrets;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod workflow;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
