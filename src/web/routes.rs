use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::control_ws::control_ws_handler;
use super::handlers;
use super::media_ws::{audio_ws_handler, video_ws_handler};
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let stream_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stream/status", get(handlers::stream_status))
        .route("/stream/mjpeg", get(handlers::stream::mjpeg_stream))
        // WebSocket endpoints
        .route("/ws", any(ws_handler))
        .route("/ws/video", any(video_ws_handler))
        .route("/ws/audio", any(audio_ws_handler))
        .route("/ws/control", any(control_ws_handler));

    let clip_routes = Router::new()
        .route("/clips", get(handlers::clips::list_clips))
        .route("/clips/trigger", post(handlers::clips::trigger_clip))
        .route("/clips/jobs", get(handlers::clips::list_jobs))
        .route("/clips/jobs/:id", get(handlers::clips::get_job))
        // File name or clip id for GET, clip id for DELETE
        .route(
            "/clips/:id",
            get(handlers::clips::download_clip).delete(handlers::clips::delete_clip),
        );

    Router::new()
        .nest("/api", stream_routes.merge(clip_routes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
