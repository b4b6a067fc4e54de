//! Move-request and check-recommendation endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::errors::FleetError;
use crate::fleet::models::{
    BinCheckRecommendation, MoveRequest, MoveRequestHistory, MoveRequestStatus,
    RecommendationStatus, Urgency,
};
use crate::fleet::move_request as mr_service;
use crate::fleet::recommendations;
use crate::web::auth::{AdminUser, DriverUser};
use crate::web::ApiResult;

pub async fn schedule_move(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Json(req): Json<mr_service::ScheduleMoveRequest>,
) -> ApiResult<MoveRequest> {
    Ok(Json(mr_service::schedule(&ctx, claims.user_id, req)?))
}

#[derive(Debug, Deserialize)]
pub struct MoveRequestQuery {
    pub status: Option<MoveRequestStatus>,
    pub urgency: Option<Urgency>,
}

pub async fn list_move_requests(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Query(query): Query<MoveRequestQuery>,
) -> ApiResult<Vec<MoveRequest>> {
    let requests = ctx.store.read(|s| {
        s.move_requests()
            .into_iter()
            .filter(|mr| query.status.map_or(true, |status| mr.status == status))
            .filter(|mr| query.urgency.map_or(true, |urgency| mr.urgency == urgency))
            .collect::<Vec<_>>()
    });
    Ok(Json(requests))
}

pub async fn get_move_request(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(mr_id): Path<Uuid>,
) -> ApiResult<MoveRequest> {
    Ok(Json(ctx.store.read(|s| s.move_request(mr_id).cloned())?))
}

pub async fn update_move_request(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(mr_id): Path<Uuid>,
    Json(req): Json<mr_service::UpdateMoveRequest>,
) -> ApiResult<MoveRequest> {
    Ok(Json(mr_service::update_request(
        &ctx,
        claims.user_id,
        mr_id,
        req,
    )?))
}

#[derive(Debug, Deserialize)]
pub struct AssignToShiftRequest {
    pub shift_id: Uuid,
}

pub async fn assign_to_shift(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(mr_id): Path<Uuid>,
    Json(req): Json<AssignToShiftRequest>,
) -> ApiResult<MoveRequest> {
    Ok(Json(mr_service::assign_to_shift(
        &ctx,
        claims.user_id,
        mr_id,
        req.shift_id,
    )?))
}

#[derive(Debug, Deserialize)]
pub struct AssignToUserRequest {
    pub user_id: Uuid,
}

pub async fn assign_to_user(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(mr_id): Path<Uuid>,
    Json(req): Json<AssignToUserRequest>,
) -> ApiResult<MoveRequest> {
    Ok(Json(mr_service::assign_to_user(
        &ctx,
        claims.user_id,
        mr_id,
        req.user_id,
    )?))
}

pub async fn unassign(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(mr_id): Path<Uuid>,
) -> ApiResult<MoveRequest> {
    Ok(Json(mr_service::unassign(&ctx, claims.user_id, mr_id)?))
}

pub async fn cancel_move_request(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(mr_id): Path<Uuid>,
) -> ApiResult<MoveRequest> {
    Ok(Json(mr_service::cancel(&ctx, claims.user_id, mr_id)?))
}

pub async fn move_request_history(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(mr_id): Path<Uuid>,
) -> ApiResult<Vec<MoveRequestHistory>> {
    // 404 for an unknown id, an empty list for a fresh one.
    ctx.store.read(|s| s.move_request(mr_id).map(|_| ()))?;
    Ok(Json(ctx.store.read(|s| s.history_for_request(mr_id))))
}

/// Completion path for manually assigned requests.
pub async fn complete_manual(
    DriverUser(claims): DriverUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(mr_id): Path<Uuid>,
    Json(req): Json<mr_service::CompleteManualRequest>,
) -> ApiResult<MoveRequest> {
    Ok(Json(mr_service::complete_manual(
        &ctx,
        claims.user_id,
        mr_id,
        req,
    )?))
}

// ---- check recommendations ----

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    pub status: Option<String>,
}

pub async fn list_recommendations(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Query(query): Query<RecommendationQuery>,
) -> ApiResult<Vec<BinCheckRecommendation>> {
    let status = match query.status.as_deref() {
        Some("pending") => Some(RecommendationStatus::Pending),
        Some("resolved") => Some(RecommendationStatus::Resolved),
        Some("dismissed") => Some(RecommendationStatus::Dismissed),
        Some(other) => {
            return Err(FleetError::validation(format!(
                "unknown recommendation status: {}",
                other
            ))
            .into())
        }
        None => None,
    };
    Ok(Json(
        ctx.store.read(|s| s.recommendations_by_status(status)),
    ))
}

pub async fn dismiss_recommendation(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(rec_id): Path<Uuid>,
) -> ApiResult<BinCheckRecommendation> {
    Ok(Json(recommendations::dismiss(&ctx, rec_id)?))
}

pub async fn generate_recommendations(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> ApiResult<serde_json::Value> {
    let created = recommendations::generate(&ctx)?;
    Ok(Json(serde_json::json!({ "created": created })))
}
