//! Application state shared across handlers.

use std::sync::Arc;

use crate::relay::RelayRegistry;

/// CORS policy for the WebSocket handshake and the health route.
#[derive(Clone, Debug, Default)]
pub struct CorsConfig {
    /// Origins allowed to open the handshake. Empty means allow any,
    /// matching the source deployment's permissive default.
    pub allowed_origins: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RelayRegistry>,
    pub cors: CorsConfig,
}

impl AppState {
    pub fn new(registry: Arc<RelayRegistry>, cors: CorsConfig) -> Self {
        Self { registry, cors }
    }
}
