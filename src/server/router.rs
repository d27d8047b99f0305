use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{
    Router,
    routing::{get, post, put},
};

use super::{flags, schedules};
use crate::cache::FlagCache;
use crate::cascade::CascadeEngine;
use crate::dispatch::{DelayedDelivery, DispatchGateway};
use crate::schedule::ScheduleManager;
use crate::store::Store;
use crate::worker::{ExecutionWorker, StoreExecutionRoutine};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cache: Arc<FlagCache>,
    pub schedules: ScheduleManager,
    pub cascade: CascadeEngine,
    pub worker: Arc<ExecutionWorker>,
}

impl AppState {
    /// Wires the scheduling engine around one store, delivery service and cache.
    pub fn new(
        store: Arc<dyn Store>,
        delivery: Arc<dyn DelayedDelivery>,
        cache: Arc<FlagCache>,
    ) -> Self {
        let cascade = CascadeEngine::new(store.clone(), cache.clone());
        let worker = Arc::new(ExecutionWorker::new(
            store.clone(),
            Arc::new(StoreExecutionRoutine::new(store.clone())),
            cache.clone(),
            cascade.clone(),
        ));
        let schedules = ScheduleManager::new(store.clone(), DispatchGateway::new(delivery));

        Self {
            store,
            cache,
            schedules,
            cascade,
            worker,
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // Flags
        .route("/flags", get(flags::list_flags).post(flags::create_flag))
        .route(
            "/flags/{id}",
            get(flags::get_flag)
                .patch(flags::update_flag)
                .delete(flags::delete_flag),
        )
        .route("/flags/{id}/schedules", get(schedules::list_flag_schedules))
        // Schedules
        .route("/schedules", post(schedules::create_schedule))
        .route("/schedules/execute", post(schedules::execute_message))
        .route(
            "/schedules/{id}",
            put(schedules::update_schedule).delete(schedules::delete_schedule),
        )
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_router())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
