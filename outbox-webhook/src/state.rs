//! Shared application state for the webhook server.

use std::sync::Arc;

use outbox::io::config::WebhookConfig;
use outbox::io::store::SqliteStore;

/// Shared secrets resolved once at startup. `None` means not configured.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub github: Option<String>,
    pub gitlab: Option<String>,
}

impl Secrets {
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self {
            github: config.github_secret(),
            gitlab: config.gitlab_token(),
        }
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The store serializes access internally, so handlers share one handle.
    pub store: Arc<SqliteStore>,
    pub secrets: Arc<Secrets>,
}

impl AppState {
    pub fn new(store: SqliteStore, secrets: Secrets) -> Self {
        Self {
            store: Arc::new(store),
            secrets: Arc::new(secrets),
        }
    }
}
