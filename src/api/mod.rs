pub mod handlers;
pub mod routes;

pub use routes::*;

use crate::{auth::TokenVerifier, realtime::ConnectionManager};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub started_at: DateTime<Utc>,
    pub prometheus_enabled: bool,
    /// Bearer key required on `/internal` routes; `None` refuses them all
    pub internal_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(manager: Arc<ConnectionManager>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            manager,
            verifier,
            started_at: Utc::now(),
            prometheus_enabled: true,
            internal_key: None,
        }
    }

    /// Enable or disable the `/metrics` endpoint
    pub fn with_prometheus(mut self, enabled: bool) -> Self {
        self.prometheus_enabled = enabled;
        self
    }

    /// Key producers must present to publish through `/internal`
    pub fn with_internal_key(mut self, key: Option<String>) -> Self {
        self.internal_key = key.filter(|k| !k.is_empty()).map(Arc::from);
        self
    }
}
