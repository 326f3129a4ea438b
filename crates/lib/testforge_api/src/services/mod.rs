//! Request-independent helpers used by handlers and middleware.

pub mod auth;
pub mod cookies;
