//! Bin endpoints: CRUD, the priority query, retirement, and potential
//! locations.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::fleet::bins as bin_service;
use crate::fleet::context::ServiceContext;
use crate::fleet::errors::FleetError;
use crate::fleet::models::{Bin, BinStatus, PotentialLocation};
use crate::fleet::priority::{self, PriorityFilter, PrioritySort, ScoredBin};
use crate::web::auth::{AdminUser, AuthUser, DriverUser};
use crate::web::ApiResult;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list_bins(
    AuthUser(_): AuthUser,
    State(ctx): State<Arc<ServiceContext>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Bin>> {
    let bins = match query.status.as_deref() {
        Some(raw) => {
            let status: BinStatus = raw.parse().map_err(FleetError::Validation)?;
            ctx.store.read(|s| s.bins_by_status(status))
        }
        None => ctx.store.read(|s| s.bins()),
    };
    Ok(Json(bins))
}

pub async fn get_bin(
    AuthUser(_): AuthUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(bin_id): Path<Uuid>,
) -> ApiResult<Bin> {
    let bin = ctx.store.read(|s| s.bin(bin_id).cloned())?;
    Ok(Json(bin))
}

#[derive(Debug, Deserialize)]
pub struct PriorityQuery {
    pub sort: Option<String>,
    pub filter: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /api/bins/priority`: scored candidates for route planning. Scores
/// are computed per request, never stored.
pub async fn priority_bins(
    AuthUser(_): AuthUser,
    State(ctx): State<Arc<ServiceContext>>,
    Query(query): Query<PriorityQuery>,
) -> ApiResult<Vec<ScoredBin>> {
    let sort: PrioritySort = query
        .sort
        .as_deref()
        .unwrap_or("priority")
        .parse()
        .map_err(FleetError::Validation)?;
    let filter: PriorityFilter = query
        .filter
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(FleetError::Validation)?;
    let status: BinStatus = query
        .status
        .as_deref()
        .unwrap_or("active")
        .parse()
        .map_err(FleetError::Validation)?;
    let limit = query.limit.unwrap_or(50).min(500);

    let now = chrono::Utc::now().timestamp();
    let scored = ctx
        .store
        .read(|s| priority::prioritized_bins(s, status, filter, sort, limit, now));
    Ok(Json(scored))
}

pub async fn create_bin(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Json(req): Json<bin_service::CreateBinRequest>,
) -> ApiResult<Bin> {
    let bin = bin_service::create_bin(&ctx, claims.user_id, req).await?;
    Ok(Json(bin))
}

pub async fn update_bin(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(bin_id): Path<Uuid>,
    Json(req): Json<bin_service::UpdateBinRequest>,
) -> ApiResult<Bin> {
    let bin = bin_service::update_bin(&ctx, bin_id, req).await?;
    Ok(Json(bin))
}

pub async fn delete_bin(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(bin_id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    bin_service::delete_bin(&ctx, bin_id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn retire_bin(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(bin_id): Path<Uuid>,
    Json(req): Json<bin_service::RetireBinRequest>,
) -> ApiResult<Bin> {
    let bin = bin_service::retire_bin(&ctx, claims.user_id, bin_id, req)?;
    Ok(Json(bin))
}

pub async fn propose_location(
    DriverUser(claims): DriverUser,
    State(ctx): State<Arc<ServiceContext>>,
    Json(req): Json<bin_service::ProposeLocationRequest>,
) -> ApiResult<PotentialLocation> {
    let location = bin_service::propose_location(&ctx, claims.user_id, req)?;
    Ok(Json(location))
}

pub async fn list_potential_locations(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> ApiResult<Vec<PotentialLocation>> {
    Ok(Json(ctx.store.read(|s| s.potential_locations())))
}

pub async fn convert_potential_location(
    AdminUser(claims): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Path(location_id): Path<Uuid>,
) -> ApiResult<Bin> {
    let bin = bin_service::convert_location(&ctx, claims.user_id, location_id).await?;
    Ok(Json(bin))
}
