//! HTTP API module.
//!
//! Provides the router, shared state, and error types around the relay core.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::{AppState, CorsConfig};
