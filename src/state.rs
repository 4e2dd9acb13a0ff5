//! Shared application state for the command surface.

use std::sync::Arc;

use crate::auth::SessionManager;
use crate::config::AppConfig;
use crate::monitor::Scheduler;
use crate::notify::NotificationDispatcher;
use crate::store::UserStore;

/// Shared handles, cloneable across tasks via Arc-wrapped fields.
///
/// Contains the application configuration, the per-user document store, the
/// session manager, the fleet scheduler and the notification dispatcher.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<UserStore>,
    pub sessions: SessionManager,
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: Arc<dyn NotificationDispatcher>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<UserStore>,
        sessions: SessionManager,
        scheduler: Arc<Scheduler>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            sessions,
            scheduler,
            dispatcher,
        }
    }
}
