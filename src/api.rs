//! HTTP façade and WebSocket gateway.

mod handlers;
mod pipeline;
mod rpc;
mod sse;
mod types;
mod ws;

pub use handlers::create_router;
pub use ws::{spawn_broadcast_router, ClientRegistry};

use crate::config::ServerConfig;
use crate::db::Database;
use crate::events::EventBus;
use crate::scheduler::RunScheduler;
use crate::supervisor::Supervisor;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub bus: EventBus,
    pub scheduler: Arc<RunScheduler>,
    pub supervisor: Arc<Supervisor>,
    pub config: Arc<ServerConfig>,
    pub clients: Arc<ClientRegistry>,
}

impl AppState {
    pub fn new(
        db: Database,
        bus: EventBus,
        scheduler: Arc<RunScheduler>,
        supervisor: Arc<Supervisor>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            db,
            bus,
            scheduler,
            supervisor,
            config,
            clients: Arc::new(ClientRegistry::default()),
        }
    }
}
