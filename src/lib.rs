pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod headers;
pub mod observability;
pub mod provider;
pub mod session;
pub mod state;
pub mod stream;
