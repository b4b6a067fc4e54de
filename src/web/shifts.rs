//! Shift endpoints: route assignment, the driver lifecycle operations, and
//! the fleet location snapshot.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::models::DriverCurrentLocation;
use crate::fleet::shift::{
    self, AssignRouteRequest, CompleteBinRequest, ShiftSnapshot,
};
use crate::web::auth::{AdminUser, DriverUser};
use crate::web::ApiResult;

pub async fn assign_route(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Json(req): Json<AssignRouteRequest>,
) -> ApiResult<ShiftSnapshot> {
    let snap = shift::assign_route(&ctx, claims.user_id, req)?;
    Ok(Json(snap))
}

pub async fn current_shift(
    DriverUser(claims): DriverUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> ApiResult<Option<ShiftSnapshot>> {
    Ok(Json(shift::current_shift(&ctx, claims.user_id)))
}

pub async fn start_shift(
    DriverUser(claims): DriverUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> ApiResult<ShiftSnapshot> {
    Ok(Json(shift::start_shift(&ctx, claims.user_id)?))
}

pub async fn pause_shift(
    DriverUser(claims): DriverUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> ApiResult<ShiftSnapshot> {
    Ok(Json(shift::pause_shift(&ctx, claims.user_id)?))
}

pub async fn resume_shift(
    DriverUser(claims): DriverUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> ApiResult<ShiftSnapshot> {
    Ok(Json(shift::resume_shift(&ctx, claims.user_id)?))
}

pub async fn end_shift(
    DriverUser(claims): DriverUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> ApiResult<ShiftSnapshot> {
    Ok(Json(shift::end_shift(&ctx, claims.user_id)?))
}

pub async fn complete_bin(
    DriverUser(claims): DriverUser,
    State(ctx): State<Arc<ServiceContext>>,
    Json(req): Json<CompleteBinRequest>,
) -> ApiResult<ShiftSnapshot> {
    Ok(Json(shift::complete_bin(&ctx, claims.user_id, req)?))
}

#[derive(Debug, Deserialize)]
pub struct CancelShiftRequest {
    pub reason: Option<String>,
}

pub async fn cancel_shift(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(shift_id): Path<Uuid>,
    Json(req): Json<CancelShiftRequest>,
) -> ApiResult<ShiftSnapshot> {
    Ok(Json(shift::cancel_shift(
        &ctx,
        claims.user_id,
        shift_id,
        req.reason,
    )?))
}

/// Dashboard snapshot: last known position per driver, connected or not.
pub async fn driver_locations(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> ApiResult<Vec<DriverCurrentLocation>> {
    Ok(Json(ctx.store.read(|s| s.driver_locations())))
}
