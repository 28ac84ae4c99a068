// HTTP status server (Axum)
pub mod app;
pub mod routes;

pub use app::*;
