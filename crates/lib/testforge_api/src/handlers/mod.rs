//! Request handlers.

pub mod auth;
pub mod github;
pub mod health;
pub mod testcases;
