pub mod appresult;
pub mod config;
pub mod error;
pub mod rooms;
pub mod store;
pub mod tasks;

use std::sync::Arc;

use axum::{Router, extract::FromRef};
use tower_http::trace::TraceLayer;

pub use appresult::{AppError, AppResult};
use config::Config;
use rooms::hub::HubHandle;
use store::MessageStore;
use tasks::{QueueDispatcher, TaskDispatcher};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub hub: HubHandle,
    pub store: Arc<dyn MessageStore>,
    pub tasks: Arc<dyn TaskDispatcher>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Spawn the connection hub and the task worker, and wire them up.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let hub = HubHandle::spawn(config.hub_buffer);
        let (dispatcher, queue) = QueueDispatcher::new(config.task_queue);
        tokio::spawn(tasks::run_worker(queue, store.clone()));

        Self {
            hub,
            store,
            tasks: Arc::new(dispatcher),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(rooms::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
