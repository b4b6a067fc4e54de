//! Shift lifecycle: assignment, the ready → active → paused → ended/cancelled
//! state machine, pause-aware timekeeping, bin completion, and archival.
//!
//! Every mutation runs in one store transaction; the WebSocket fan-out and
//! the push dispatch happen after commit and are fire-and-forget.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::errors::{FleetError, Result};
use crate::fleet::models::{
    Check, Coordinates, EndReason, MoveRequestStatus, Shift, ShiftBin, ShiftHistory, ShiftStatus,
    StopType, UserRole,
};
use crate::fleet::move_request;
use crate::fleet::providers::PushPayload;
use crate::fleet::routing;
use crate::fleet::store::StoreState;
use crate::web::ws::{ServerFrame, ShiftDeletedData};

/// Full shift state as broadcast to clients: the row plus its ordered stops.
#[derive(Debug, Clone, Serialize)]
pub struct ShiftSnapshot {
    #[serde(flatten)]
    pub shift: Shift,
    pub shift_bins: Vec<ShiftBin>,
    pub active_duration_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignRouteRequest {
    pub driver_id: Uuid,
    pub bin_ids: Vec<Uuid>,
    pub route_id: Option<Uuid>,
    #[serde(default)]
    pub optimize: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteBinRequest {
    pub bin_id: Uuid,
    pub fill_percentage: Option<u8>,
    pub photo_url: Option<String>,
}

fn snapshot(state: &StoreState, shift: &Shift, now: i64) -> ShiftSnapshot {
    ShiftSnapshot {
        shift: shift.clone(),
        shift_bins: state.shift_bins_for(shift.id),
        active_duration_seconds: shift.active_duration_seconds(now),
    }
}

/// Snapshot builder for sibling services that mutate a shift's stops.
pub(crate) fn snapshot_for(state: &StoreState, shift: &Shift, now: i64) -> ShiftSnapshot {
    snapshot(state, shift, now)
}

/// Broadcasts the post-change snapshot to the driver and the dashboard.
pub(crate) fn broadcast_update(ctx: &ServiceContext, snap: &ShiftSnapshot) {
    let frame = ServerFrame::ShiftUpdate { data: snap.clone() };
    ctx.hub.send_to_user(snap.shift.driver_id, &frame);
    ctx.hub.send_to_role(UserRole::Admin, &frame);
}

/// Creates a ready shift with one collection stop per bin and notifies the
/// driver over both channels.
pub fn assign_route(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    req: AssignRouteRequest,
) -> Result<ShiftSnapshot> {
    assign_route_at(ctx, actor, req, chrono::Utc::now().timestamp())
}

pub fn assign_route_at(
    ctx: &Arc<ServiceContext>,
    _actor: Uuid,
    req: AssignRouteRequest,
    now: i64,
) -> Result<ShiftSnapshot> {
    if req.bin_ids.is_empty() {
        return Err(FleetError::validation("a route needs at least one bin"));
    }

    let snap = ctx.store.transaction(|tx| {
        let driver = tx.user(req.driver_id)?;
        if driver.role != UserRole::Driver {
            return Err(FleetError::validation("routes can only be assigned to drivers"));
        }
        if let Some(open) = tx.open_shift_for_driver(req.driver_id) {
            return Err(FleetError::conflict(format!(
                "driver already has an open shift {}",
                open.id
            )));
        }

        let mut bins = Vec::with_capacity(req.bin_ids.len());
        for bin_id in &req.bin_ids {
            let bin = tx.bin(*bin_id)?;
            if !bin.status.is_serviceable() {
                return Err(FleetError::validation(format!(
                    "bin {} is {} and cannot be routed",
                    bin.bin_number,
                    bin.status.as_str()
                )));
            }
            bins.push(bin.clone());
        }

        if req.optimize {
            let start = route_start(tx, req.driver_id, &bins);
            if let Some(start) = start {
                bins = routing::nearest_neighbor(start, bins).bins;
            }
        }

        let shift = Shift {
            id: Uuid::new_v4(),
            driver_id: req.driver_id,
            route_id: req.route_id,
            status: ShiftStatus::Ready,
            start_time: None,
            end_time: None,
            total_pause_seconds: 0,
            pause_start_time: None,
            total_bins: bins.len() as u32,
            completed_bins: 0,
            created_at: now,
        };
        tx.insert_shift(shift.clone());

        for (idx, bin) in bins.iter().enumerate() {
            tx.insert_shift_bin(ShiftBin {
                id: Uuid::new_v4(),
                shift_id: shift.id,
                bin_id: bin.id,
                sequence_order: idx as u32 + 1,
                is_completed: false,
                completed_at: None,
                updated_fill_percentage: None,
                stop_type: StopType::Collection,
                move_request_id: None,
            });
        }

        Ok(snapshot(tx, &shift, now))
    })?;

    ctx.hub.send_to_user(
        snap.shift.driver_id,
        &ServerFrame::RouteAssigned { data: snap.clone() },
    );
    ctx.hub
        .send_to_role(UserRole::Admin, &ServerFrame::ShiftUpdate { data: snap.clone() });
    crate::fleet::context::dispatch_push(
        ctx,
        snap.shift.driver_id,
        PushPayload::RouteAssigned {
            shift_id: snap.shift.id,
            total_bins: snap.shift.total_bins,
        },
    );
    tracing::info!(shift_id = %snap.shift.id, driver_id = %snap.shift.driver_id, stops = snap.shift.total_bins, "route assigned");
    Ok(snap)
}

fn route_start(state: &StoreState, driver_id: Uuid, bins: &[crate::fleet::models::Bin]) -> Option<Coordinates> {
    if let Some(loc) = state.driver_location(driver_id) {
        return Some(Coordinates {
            latitude: loc.latitude,
            longitude: loc.longitude,
        });
    }
    bins.iter().find_map(|b| b.coordinates)
}

pub fn current_shift(ctx: &ServiceContext, driver_id: Uuid) -> Option<ShiftSnapshot> {
    let now = chrono::Utc::now().timestamp();
    ctx.store.read(|s| {
        s.open_shift_for_driver(driver_id)
            .map(|shift| snapshot(s, &shift, now))
    })
}

pub fn start_shift(ctx: &Arc<ServiceContext>, driver_id: Uuid) -> Result<ShiftSnapshot> {
    start_shift_at(ctx, driver_id, chrono::Utc::now().timestamp())
}

pub fn start_shift_at(
    ctx: &Arc<ServiceContext>,
    driver_id: Uuid,
    now: i64,
) -> Result<ShiftSnapshot> {
    let snap = ctx.store.transaction(|tx| {
        let shift = open_shift(tx, driver_id)?;
        if shift.status != ShiftStatus::Ready {
            return Err(FleetError::invalid_transition(
                "shift",
                shift.status.as_str(),
                "start",
            ));
        }
        let shift_id = shift.id;
        {
            let row = tx.shift_mut(shift_id)?;
            row.status = ShiftStatus::Active;
            row.start_time = Some(now);
        }

        // Requests parked on this shift go to work with it.
        for mr in tx.open_requests_for_shift(shift_id) {
            if mr.status == MoveRequestStatus::Pending {
                move_request::promote_in_tx(tx, mr.id, now)?;
            }
        }

        let shift = tx.shift(shift_id)?.clone();
        Ok(snapshot(tx, &shift, now))
    })?;

    broadcast_update(ctx, &snap);
    tracing::info!(shift_id = %snap.shift.id, "shift started");
    Ok(snap)
}

pub fn pause_shift(ctx: &Arc<ServiceContext>, driver_id: Uuid) -> Result<ShiftSnapshot> {
    pause_shift_at(ctx, driver_id, chrono::Utc::now().timestamp())
}

pub fn pause_shift_at(
    ctx: &Arc<ServiceContext>,
    driver_id: Uuid,
    now: i64,
) -> Result<ShiftSnapshot> {
    let snap = ctx.store.transaction(|tx| {
        let shift = open_shift(tx, driver_id)?;
        if shift.status != ShiftStatus::Active {
            return Err(FleetError::invalid_transition(
                "shift",
                shift.status.as_str(),
                "pause",
            ));
        }
        let shift_id = shift.id;
        {
            let row = tx.shift_mut(shift_id)?;
            row.status = ShiftStatus::Paused;
            row.pause_start_time = Some(now);
        }
        let shift = tx.shift(shift_id)?.clone();
        Ok(snapshot(tx, &shift, now))
    })?;

    broadcast_update(ctx, &snap);
    Ok(snap)
}

pub fn resume_shift(ctx: &Arc<ServiceContext>, driver_id: Uuid) -> Result<ShiftSnapshot> {
    resume_shift_at(ctx, driver_id, chrono::Utc::now().timestamp())
}

pub fn resume_shift_at(
    ctx: &Arc<ServiceContext>,
    driver_id: Uuid,
    now: i64,
) -> Result<ShiftSnapshot> {
    let snap = ctx.store.transaction(|tx| {
        let shift = open_shift(tx, driver_id)?;
        if shift.status != ShiftStatus::Paused {
            return Err(FleetError::invalid_transition(
                "shift",
                shift.status.as_str(),
                "resume",
            ));
        }
        let shift_id = shift.id;
        {
            let row = tx.shift_mut(shift_id)?;
            close_pause_segment(row, now);
            row.status = ShiftStatus::Active;
        }
        let shift = tx.shift(shift_id)?.clone();
        Ok(snapshot(tx, &shift, now))
    })?;

    broadcast_update(ctx, &snap);
    Ok(snap)
}

/// Folds the running pause segment into the accumulator. The caller decides
/// whether the shift stays paused (a fresh segment starts) or leaves the
/// paused state.
fn close_pause_segment(shift: &mut Shift, now: i64) {
    if let Some(pause_start) = shift.pause_start_time.take() {
        shift.total_pause_seconds += (now - pause_start).max(0);
    }
}

pub fn complete_bin(
    ctx: &Arc<ServiceContext>,
    driver_id: Uuid,
    req: CompleteBinRequest,
) -> Result<ShiftSnapshot> {
    complete_bin_at(ctx, driver_id, req, chrono::Utc::now().timestamp())
}

pub fn complete_bin_at(
    ctx: &Arc<ServiceContext>,
    driver_id: Uuid,
    req: CompleteBinRequest,
    now: i64,
) -> Result<ShiftSnapshot> {
    let snap = ctx.store.transaction(|tx| {
        let shift = open_shift(tx, driver_id)?;
        if !matches!(shift.status, ShiftStatus::Active | ShiftStatus::Paused) {
            return Err(FleetError::invalid_transition(
                "shift",
                shift.status.as_str(),
                "complete-bin",
            ));
        }
        let shift_id = shift.id;

        if shift.status == ShiftStatus::Paused {
            // Work happened: the current pause segment ends here and a new
            // one begins, while the shift stays paused.
            let row = tx.shift_mut(shift_id)?;
            close_pause_segment(row, now);
            row.pause_start_time = Some(now);
        }

        let stop = tx
            .shift_bins_for(shift_id)
            .into_iter()
            .find(|sb| !sb.is_completed && sb.bin_id == req.bin_id)
            .ok_or_else(|| {
                FleetError::conflict(format!(
                    "no incomplete stop for bin {} on this shift",
                    req.bin_id
                ))
            })?;

        {
            let row = tx.shift_bin_mut(stop.id)?;
            row.is_completed = true;
            row.completed_at = Some(now);
            row.updated_fill_percentage = req.fill_percentage;
        }

        tx.push_check(Check {
            id: Uuid::new_v4(),
            bin_id: req.bin_id,
            fill_percentage: req.fill_percentage,
            photo_url: req.photo_url.clone(),
            checked_from: Some("shift".to_string()),
            checked_by: Some(driver_id),
            shift_id: Some(shift_id),
            move_request_id: stop.move_request_id,
            timestamp: now,
        });

        {
            let bin = tx.bin_mut(req.bin_id)?;
            bin.last_checked = Some(now);
            bin.checked = true;
            if let Some(fill) = req.fill_percentage {
                bin.fill_percentage = fill.min(100);
            }
        }
        tx.resolve_recommendations_for_bin(req.bin_id, now);

        {
            let row = tx.shift_mut(shift_id)?;
            row.completed_bins = (row.completed_bins + 1).min(row.total_bins);
        }

        // A stop that belonged to a move request may finish the request.
        if let Some(mr_id) = stop.move_request_id {
            let remaining = tx
                .shift_bins_for(shift_id)
                .into_iter()
                .any(|sb| sb.move_request_id == Some(mr_id) && !sb.is_completed);
            if !remaining {
                move_request::complete_in_tx(tx, mr_id, Some(driver_id), Some(shift_id), now)?;
            }
        }

        let shift = tx.shift(shift_id)?.clone();
        Ok(snapshot(tx, &shift, now))
    })?;

    broadcast_update(ctx, &snap);
    tracing::info!(shift_id = %snap.shift.id, bin_id = %req.bin_id, completed = snap.shift.completed_bins, "stop completed");
    Ok(snap)
}

pub fn end_shift(ctx: &Arc<ServiceContext>, driver_id: Uuid) -> Result<ShiftSnapshot> {
    end_shift_at(ctx, driver_id, chrono::Utc::now().timestamp())
}

pub fn end_shift_at(
    ctx: &Arc<ServiceContext>,
    driver_id: Uuid,
    now: i64,
) -> Result<ShiftSnapshot> {
    let snap = ctx.store.transaction(|tx| {
        let shift = open_shift(tx, driver_id)?;
        if !matches!(shift.status, ShiftStatus::Active | ShiftStatus::Paused) {
            return Err(FleetError::invalid_transition(
                "shift",
                shift.status.as_str(),
                "end",
            ));
        }
        let shift_id = shift.id;
        {
            let row = tx.shift_mut(shift_id)?;
            close_pause_segment(row, now);
            row.status = ShiftStatus::Ended;
            row.end_time = Some(now);
        }

        let shift = tx.shift(shift_id)?.clone();
        let reason = if shift.completed_bins >= shift.total_bins {
            EndReason::Completed
        } else {
            EndReason::ManualEnd
        };
        archive_in_tx(tx, &shift, reason, now);
        release_requests_in_tx(tx, shift_id, Some(driver_id), now)?;

        Ok(snapshot(tx, &shift, now))
    })?;

    broadcast_update(ctx, &snap);
    tracing::info!(shift_id = %snap.shift.id, "shift ended");
    Ok(snap)
}

pub fn cancel_shift(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    shift_id: Uuid,
    reason: Option<String>,
) -> Result<ShiftSnapshot> {
    cancel_shift_at(ctx, actor, shift_id, reason, chrono::Utc::now().timestamp())
}

pub fn cancel_shift_at(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    shift_id: Uuid,
    reason: Option<String>,
    now: i64,
) -> Result<ShiftSnapshot> {
    let snap = ctx.store.transaction(|tx| {
        let shift = tx.shift(shift_id)?.clone();
        if !shift.status.is_open() {
            return Err(FleetError::invalid_transition(
                "shift",
                shift.status.as_str(),
                "cancel",
            ));
        }
        {
            let row = tx.shift_mut(shift_id)?;
            close_pause_segment(row, now);
            row.status = ShiftStatus::Cancelled;
            row.end_time = Some(now);
        }

        let shift = tx.shift(shift_id)?.clone();
        archive_in_tx(tx, &shift, EndReason::ManagerCancelled, now);
        release_requests_in_tx(tx, shift_id, Some(actor), now)?;

        Ok(snapshot(tx, &shift, now))
    })?;

    ctx.hub.send_to_user(
        snap.shift.driver_id,
        &ServerFrame::ShiftDeleted {
            data: ShiftDeletedData {
                shift_id: snap.shift.id,
            },
        },
    );
    ctx.hub
        .send_to_role(UserRole::Admin, &ServerFrame::ShiftUpdate { data: snap.clone() });
    tracing::info!(shift_id = %snap.shift.id, reason = reason.as_deref().unwrap_or(""), "shift cancelled by manager");
    Ok(snap)
}

/// Terminal transitions leave one archival row; the live shift row stays.
fn archive_in_tx(tx: &mut StoreState, shift: &Shift, end_reason: EndReason, now: i64) {
    tx.push_shift_history(ShiftHistory {
        id: Uuid::new_v4(),
        shift_id: shift.id,
        driver_id: shift.driver_id,
        total_bins: shift.total_bins,
        completed_bins: shift.completed_bins,
        completion_rate: shift.completion_rate(),
        total_pause_seconds: shift.total_pause_seconds,
        active_duration_seconds: shift.active_duration_seconds(now),
        start_time: shift.start_time,
        end_time: shift.end_time,
        end_reason,
        archived_at: now,
    });
}

/// Unfinished move requests on a terminal shift return to the pool so the
/// work is never stranded.
fn release_requests_in_tx(
    tx: &mut StoreState,
    shift_id: Uuid,
    actor: Option<Uuid>,
    now: i64,
) -> Result<()> {
    for mr in tx.open_requests_for_shift(shift_id) {
        move_request::unassign_in_tx(tx, mr.id, actor, Some("shift ended"), now)?;
    }
    Ok(())
}

fn open_shift(state: &StoreState, driver_id: Uuid) -> Result<Shift> {
    state
        .open_shift_for_driver(driver_id)
        .ok_or_else(|| FleetError::not_found("no open shift for driver"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::models::{Address, User};
    use crate::fleet::store::NewBin;

    const T0: i64 = 1_700_000_000;

    fn seed_driver(ctx: &Arc<ServiceContext>) -> Uuid {
        let driver = User {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", Uuid::new_v4()),
            password_hash: String::new(),
            name: "Driver".to_string(),
            role: UserRole::Driver,
            created_at: T0,
        };
        let id = driver.id;
        ctx.store
            .transaction(move |tx| tx.insert_user(driver))
            .unwrap();
        id
    }

    fn seed_bins(ctx: &Arc<ServiceContext>, count: usize) -> Vec<Uuid> {
        ctx.store
            .transaction(|tx| {
                let mut ids = Vec::new();
                for i in 0..count {
                    let bin = tx.insert_bin(
                        NewBin {
                            bin_number: None,
                            address: Address {
                                street: format!("Kade {}", i + 1),
                                city: "Rotterdam".to_string(),
                                zip: "3011".to_string(),
                            },
                            coordinates: None,
                            fill_percentage: 0,
                            created_by: None,
                        },
                        T0,
                    )?;
                    ids.push(bin.id);
                }
                Ok(ids)
            })
            .unwrap()
    }

    fn assigned_shift(ctx: &Arc<ServiceContext>, bins: usize) -> (Uuid, ShiftSnapshot) {
        let driver = seed_driver(ctx);
        let bin_ids = seed_bins(ctx, bins);
        let snap = assign_route_at(
            ctx,
            Uuid::new_v4(),
            AssignRouteRequest {
                driver_id: driver,
                bin_ids,
                route_id: None,
                optimize: false,
            },
            T0,
        )
        .unwrap();
        (driver, snap)
    }

    #[test]
    fn assign_route_creates_ready_shift_with_sequenced_stops() {
        let ctx = ServiceContext::for_tests();
        let (_, snap) = assigned_shift(&ctx, 3);

        assert_eq!(snap.shift.status, ShiftStatus::Ready);
        assert_eq!(snap.shift.total_bins, 3);
        assert_eq!(snap.shift.completed_bins, 0);
        let orders: Vec<u32> = snap.shift_bins.iter().map(|sb| sb.sequence_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert!(snap
            .shift_bins
            .iter()
            .all(|sb| sb.stop_type == StopType::Collection));
    }

    #[test]
    fn assign_route_rejects_second_open_shift() {
        let ctx = ServiceContext::for_tests();
        let (driver, _) = assigned_shift(&ctx, 1);
        let more_bins = seed_bins(&ctx, 1);

        let err = assign_route_at(
            &ctx,
            Uuid::new_v4(),
            AssignRouteRequest {
                driver_id: driver,
                bin_ids: more_bins,
                route_id: None,
                optimize: false,
            },
            T0,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[test]
    fn lifecycle_transitions_enforced() {
        let ctx = ServiceContext::for_tests();
        let (driver, _) = assigned_shift(&ctx, 1);

        // Pause before start is rejected.
        let err = pause_shift_at(&ctx, driver, T0 + 1).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));

        start_shift_at(&ctx, driver, T0 + 10).unwrap();
        // Double start is rejected.
        let err = start_shift_at(&ctx, driver, T0 + 11).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));

        pause_shift_at(&ctx, driver, T0 + 20).unwrap();
        // Double pause is rejected.
        let err = pause_shift_at(&ctx, driver, T0 + 21).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));

        resume_shift_at(&ctx, driver, T0 + 30).unwrap();
        let snap = end_shift_at(&ctx, driver, T0 + 40).unwrap();
        assert_eq!(snap.shift.status, ShiftStatus::Ended);

        // Nothing left to end.
        let err = end_shift_at(&ctx, driver, T0 + 50).unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[test]
    fn pause_accounting_matches_wall_clock() {
        let ctx = ServiceContext::for_tests();
        let (driver, _) = assigned_shift(&ctx, 2);

        start_shift_at(&ctx, driver, T0).unwrap();
        pause_shift_at(&ctx, driver, T0 + 600).unwrap();
        resume_shift_at(&ctx, driver, T0 + 900).unwrap();
        let snap = end_shift_at(&ctx, driver, T0 + 1800).unwrap();

        assert_eq!(snap.shift.total_pause_seconds, 300);
        assert_eq!(snap.active_duration_seconds, 1500);
        assert_eq!(snap.shift.pause_start_time, None);

        let history = ctx
            .store
            .read(|s| s.shift_history_for(snap.shift.id));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_pause_seconds, 300);
        assert_eq!(history[0].active_duration_seconds, 1500);
        assert_eq!(history[0].completion_rate, 0.0);
        assert_eq!(history[0].end_reason, EndReason::ManualEnd);
    }

    #[test]
    fn zero_length_pauses_do_not_accumulate() {
        let ctx = ServiceContext::for_tests();
        let (driver, _) = assigned_shift(&ctx, 1);

        start_shift_at(&ctx, driver, T0).unwrap();
        for _ in 0..5 {
            pause_shift_at(&ctx, driver, T0 + 100).unwrap();
            resume_shift_at(&ctx, driver, T0 + 100).unwrap();
        }
        let snap = end_shift_at(&ctx, driver, T0 + 200).unwrap();
        assert_eq!(snap.shift.total_pause_seconds, 0);
        assert_eq!(snap.active_duration_seconds, 200);
    }

    #[test]
    fn pause_invariant_holds_at_every_step() {
        let ctx = ServiceContext::for_tests();
        let (driver, snap) = assigned_shift(&ctx, 1);
        let shift_id = snap.shift.id;

        let check = |ctx: &Arc<ServiceContext>| {
            let shift = ctx.store.read(|s| s.shift(shift_id).cloned()).unwrap();
            assert_eq!(
                shift.pause_start_time.is_some(),
                shift.status == ShiftStatus::Paused
            );
            assert!(shift.total_pause_seconds >= 0);
        };

        check(&ctx);
        start_shift_at(&ctx, driver, T0).unwrap();
        check(&ctx);
        pause_shift_at(&ctx, driver, T0 + 10).unwrap();
        check(&ctx);
        resume_shift_at(&ctx, driver, T0 + 20).unwrap();
        check(&ctx);
        end_shift_at(&ctx, driver, T0 + 30).unwrap();
        check(&ctx);
    }

    #[test]
    fn complete_bin_writes_check_and_counters() {
        let ctx = ServiceContext::for_tests();
        let (driver, snap) = assigned_shift(&ctx, 2);
        let first_bin = snap.shift_bins[0].bin_id;

        start_shift_at(&ctx, driver, T0).unwrap();
        let snap = complete_bin_at(
            &ctx,
            driver,
            CompleteBinRequest {
                bin_id: first_bin,
                fill_percentage: Some(70),
                photo_url: Some("https://photos/1.jpg".to_string()),
            },
            T0 + 60,
        )
        .unwrap();

        assert_eq!(snap.shift.completed_bins, 1);
        let stop = snap
            .shift_bins
            .iter()
            .find(|sb| sb.bin_id == first_bin)
            .unwrap();
        assert!(stop.is_completed);
        assert_eq!(stop.completed_at, Some(T0 + 60));
        assert_eq!(stop.updated_fill_percentage, Some(70));

        let checks = ctx.store.read(|s| s.checks_for_bin(first_bin));
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].shift_id, Some(snap.shift.id));
        assert_eq!(checks[0].fill_percentage, Some(70));

        let bin = ctx.store.read(|s| s.bin(first_bin).cloned()).unwrap();
        assert_eq!(bin.last_checked, Some(T0 + 60));
        assert_eq!(bin.fill_percentage, 70);
        assert!(bin.checked);

        // Completing the same bin again conflicts.
        let err = complete_bin_at(
            &ctx,
            driver,
            CompleteBinRequest {
                bin_id: first_bin,
                fill_percentage: None,
                photo_url: None,
            },
            T0 + 70,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[test]
    fn complete_bin_while_paused_folds_segment_and_stays_paused() {
        let ctx = ServiceContext::for_tests();
        let (driver, snap) = assigned_shift(&ctx, 1);
        let bin_id = snap.shift_bins[0].bin_id;

        start_shift_at(&ctx, driver, T0).unwrap();
        pause_shift_at(&ctx, driver, T0 + 100).unwrap();
        let snap = complete_bin_at(
            &ctx,
            driver,
            CompleteBinRequest {
                bin_id,
                fill_percentage: None,
                photo_url: None,
            },
            T0 + 160,
        )
        .unwrap();

        assert_eq!(snap.shift.status, ShiftStatus::Paused);
        assert_eq!(snap.shift.total_pause_seconds, 60);
        assert_eq!(snap.shift.pause_start_time, Some(T0 + 160));
    }

    #[test]
    fn full_completion_ends_with_completed_reason() {
        let ctx = ServiceContext::for_tests();
        let (driver, snap) = assigned_shift(&ctx, 1);
        let bin_id = snap.shift_bins[0].bin_id;

        start_shift_at(&ctx, driver, T0).unwrap();
        complete_bin_at(
            &ctx,
            driver,
            CompleteBinRequest {
                bin_id,
                fill_percentage: Some(10),
                photo_url: None,
            },
            T0 + 60,
        )
        .unwrap();
        let snap = end_shift_at(&ctx, driver, T0 + 120).unwrap();

        let history = ctx.store.read(|s| s.shift_history_for(snap.shift.id));
        assert_eq!(history[0].end_reason, EndReason::Completed);
        assert_eq!(history[0].completion_rate, 1.0);
    }

    #[test]
    fn cancel_from_ready_archives_with_manager_reason() {
        let ctx = ServiceContext::for_tests();
        let (_, snap) = assigned_shift(&ctx, 2);
        let manager = Uuid::new_v4();

        let snap = cancel_shift_at(&ctx, manager, snap.shift.id, Some("weather".into()), T0 + 5)
            .unwrap();
        assert_eq!(snap.shift.status, ShiftStatus::Cancelled);
        assert_eq!(snap.shift.end_time, Some(T0 + 5));

        let history = ctx.store.read(|s| s.shift_history_for(snap.shift.id));
        assert_eq!(history[0].end_reason, EndReason::ManagerCancelled);

        // A cancelled shift cannot be cancelled again.
        let err = cancel_shift_at(&ctx, manager, snap.shift.id, None, T0 + 6).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn completed_bins_never_exceed_total() {
        let ctx = ServiceContext::for_tests();
        let (driver, snap) = assigned_shift(&ctx, 2);

        start_shift_at(&ctx, driver, T0).unwrap();
        for stop in &snap.shift_bins {
            complete_bin_at(
                &ctx,
                driver,
                CompleteBinRequest {
                    bin_id: stop.bin_id,
                    fill_percentage: None,
                    photo_url: None,
                },
                T0 + 60,
            )
            .unwrap();
        }
        let shift = ctx
            .store
            .read(|s| s.shift(snap.shift.id).cloned())
            .unwrap();
        assert_eq!(shift.completed_bins, shift.total_bins);
    }
}
