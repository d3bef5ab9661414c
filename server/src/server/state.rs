//! Application state shared by HTTP handlers.

use crate::engine::Engine;
use std::sync::Arc;

/// Shared handler state. Cloned per request.
#[derive(Clone, Debug)]
pub struct AppState {
    /// The engine every handler delegates to.
    pub engine: Arc<Engine>,
    /// Token required on admin routes. `None` disables them.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    /// Create the state.
    #[must_use]
    pub fn new(engine: Engine, admin_token: Option<String>) -> Self {
        Self {
            engine: Arc::new(engine),
            admin_token: admin_token
                .filter(|token| !token.trim().is_empty())
                .map(Arc::from),
        }
    }
}
