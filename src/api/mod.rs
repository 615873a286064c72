//! HTTP surface over the distribution engine

pub mod routes;

pub use routes::{create_router, ApiError, AppState};
