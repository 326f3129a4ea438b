//! Domain models.
//!
//! These are internal domain models, distinct from the API response models in
//! `testforge_api::models` (which are shaped for the HTTP surface).

pub mod auth;
pub mod job;
pub mod provider;
