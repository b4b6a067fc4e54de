//! Router assembly and the HTTP entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;

use crate::fleet::context::ServiceContext;
use crate::fleet::errors::{FleetError, Result};
use crate::web::{auth, bins, moves, shifts, ws};

pub fn router(ctx: Arc<ServiceContext>) -> Router {
    Router::new()
        // auth & device registration
        .route("/api/auth/login", post(auth::login))
        .route("/api/fcm-token", post(auth::register_fcm_token))
        // bins
        .route("/api/bins", get(bins::list_bins).post(bins::create_bin))
        .route("/api/bins/priority", get(bins::priority_bins))
        .route(
            "/api/bins/:id",
            get(bins::get_bin)
                .patch(bins::update_bin)
                .delete(bins::delete_bin),
        )
        // manager: bins & routes
        .route("/api/manager/bins/:id/retire", post(bins::retire_bin))
        .route("/api/manager/assign-route", post(shifts::assign_route))
        .route("/api/manager/shifts/:id/cancel", post(shifts::cancel_shift))
        .route("/api/manager/drivers/locations", get(shifts::driver_locations))
        .route(
            "/api/manager/users",
            get(auth::list_users).post(auth::create_user),
        )
        // manager: move requests
        .route(
            "/api/manager/bins/schedule-move",
            post(moves::schedule_move),
        )
        .route(
            "/api/manager/bins/move-requests",
            get(moves::list_move_requests),
        )
        .route(
            "/api/manager/bins/move-requests/:id",
            get(moves::get_move_request).put(moves::update_move_request),
        )
        .route(
            "/api/manager/bins/move-requests/:id/assign-to-shift",
            post(moves::assign_to_shift),
        )
        .route(
            "/api/manager/bins/move-requests/:id/assign-to-user",
            post(moves::assign_to_user),
        )
        .route(
            "/api/manager/bins/move-requests/:id/unassign",
            post(moves::unassign),
        )
        .route(
            "/api/manager/bins/move-requests/:id/cancel",
            put(moves::cancel_move_request),
        )
        .route(
            "/api/manager/bins/move-requests/:id/history",
            get(moves::move_request_history),
        )
        // manager: check recommendations
        .route(
            "/api/manager/check-recommendations",
            get(moves::list_recommendations),
        )
        .route(
            "/api/manager/check-recommendations/generate",
            post(moves::generate_recommendations),
        )
        .route(
            "/api/manager/check-recommendations/:id/dismiss",
            post(moves::dismiss_recommendation),
        )
        // manager: potential locations
        .route(
            "/api/manager/potential-locations",
            get(bins::list_potential_locations),
        )
        .route(
            "/api/manager/potential-locations/:id/convert",
            post(bins::convert_potential_location),
        )
        // driver
        .route("/api/driver/shift/current", get(shifts::current_shift))
        .route("/api/driver/shift/start", post(shifts::start_shift))
        .route("/api/driver/shift/pause", post(shifts::pause_shift))
        .route("/api/driver/shift/resume", post(shifts::resume_shift))
        .route("/api/driver/shift/end", post(shifts::end_shift))
        .route(
            "/api/driver/shift/complete-bin",
            post(shifts::complete_bin),
        )
        .route(
            "/api/driver/move-requests/:id/complete",
            post(moves::complete_manual),
        )
        .route(
            "/api/driver/potential-locations",
            post(bins::propose_location),
        )
        // realtime & observability
        .route("/ws", get(ws::ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(ctx)
}

async fn metrics_handler() -> String {
    crate::metrics::render()
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

/// Binds and serves until the process is stopped.
pub async fn run(ctx: Arc<ServiceContext>) -> Result<()> {
    let port = ctx.config.port;
    let app = router(ctx);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "api server listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| FleetError::internal(format!("server error: {}", e)))
}
