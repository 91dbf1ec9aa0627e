use std::sync::Arc;

use parley_core::Store;
use tracing::info;

use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::session::SessionStore;

/// Everything a request handler needs, cheap to clone into each
/// connection task.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn Store>,
    pub sessions: Arc<SessionStore>,
    pub hub: Arc<Hub>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let sessions = Arc::new(SessionStore::new(
            Arc::clone(&store),
            config.long_poll_lifetime,
            config.queues,
        ));
        let hub = Hub::new(Arc::clone(&store), config.topics.clone());
        Self {
            config: Arc::new(config),
            store,
            sessions,
            hub,
        }
    }

    /// Stop topics first so their sessions are detached, then tell every
    /// session the server is going away.
    pub async fn shutdown(&self) {
        self.hub.shutdown(self.config.shutdown_timeout).await;
        let notified = self.sessions.shutdown();
        info!(sessions = notified, "sessions notified of shutdown");
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("sessions", &self.sessions.len())
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}
