//! Move-request lifecycle: creation, the shift-vs-manual assignment model,
//! status transitions, and the append-only audit log.
//!
//! Every operation writes exactly one history row in the same transaction as
//! the mutation it describes. Assignment is exclusive: a request rides on a
//! shift's route or sits with a user directly, never both.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::errors::{FleetError, Result};
use crate::fleet::models::{
    Address, AssignmentType, BinStatus, Check, Coordinates, HistoryAction, Move, MoveRequest,
    MoveRequestHistory, MoveRequestStatus, MoveType, ShiftBin, ShiftStatus, StopType, Urgency,
    UserRole,
};
use crate::fleet::providers::PushPayload;
use crate::fleet::shift;
use crate::fleet::store::StoreState;

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleMoveRequest {
    pub bin_id: Uuid,
    #[serde(with = "crate::fleet::models::timefmt")]
    pub scheduled_date: i64,
    pub move_type: MoveType,
    pub new_address: Option<Address>,
    pub new_coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateMoveRequest {
    #[serde(default, with = "crate::fleet::models::timefmt::opt")]
    pub scheduled_date: Option<i64>,
    pub move_type: Option<MoveType>,
    pub new_address: Option<Address>,
    pub new_coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteManualRequest {
    pub fill_percentage: Option<u8>,
    pub photo_url: Option<String>,
}

/// A request due today (or overdue) is urgent; anything later is scheduled.
/// Days compare on the UTC calendar, not on 24-hour windows.
pub fn derive_urgency(scheduled_date: i64, now: i64) -> Urgency {
    use chrono::{TimeZone, Utc};
    let scheduled = Utc.timestamp_opt(scheduled_date, 0).single();
    let today = Utc.timestamp_opt(now, 0).single();
    match (scheduled, today) {
        (Some(s), Some(t)) if s.date_naive() <= t.date_naive() => Urgency::Urgent,
        (Some(_), Some(_)) => Urgency::Scheduled,
        // Out-of-range timestamps cannot be compared; treat as urgent so
        // they surface instead of hiding.
        _ => Urgency::Urgent,
    }
}

fn push_history(
    tx: &mut StoreState,
    before: &MoveRequest,
    after: &MoveRequest,
    action: HistoryAction,
    actor: Option<Uuid>,
    note: Option<&str>,
    now: i64,
) {
    tx.push_move_request_history(MoveRequestHistory {
        id: Uuid::new_v4(),
        move_request_id: after.id,
        action,
        actor_id: actor,
        previous_status: Some(before.status),
        new_status: Some(after.status),
        previous_assigned_shift_id: before.assigned_shift_id,
        new_assigned_shift_id: after.assigned_shift_id,
        previous_assigned_user_id: before.assigned_user_id,
        new_assigned_user_id: after.assigned_user_id,
        note: note.map(|n| n.to_string()),
        timestamp: now,
    });
}

pub fn schedule(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    req: ScheduleMoveRequest,
) -> Result<MoveRequest> {
    schedule_at(ctx, actor, req, chrono::Utc::now().timestamp())
}

pub fn schedule_at(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    req: ScheduleMoveRequest,
    now: i64,
) -> Result<MoveRequest> {
    if req.move_type == MoveType::Relocation && req.new_address.is_none() {
        return Err(FleetError::validation(
            "a relocation needs a destination address",
        ));
    }

    ctx.store.transaction(|tx| {
        let bin = tx.bin(req.bin_id)?.clone();
        if !bin.status.is_serviceable() {
            return Err(FleetError::validation(format!(
                "bin {} is {} and cannot be moved",
                bin.bin_number,
                bin.status.as_str()
            )));
        }
        if tx.open_move_request_for_bin(req.bin_id).is_some() {
            return Err(FleetError::conflict(format!(
                "bin {} already has an open move request",
                bin.bin_number
            )));
        }

        let mr = MoveRequest {
            id: Uuid::new_v4(),
            bin_id: req.bin_id,
            scheduled_date: req.scheduled_date,
            urgency: derive_urgency(req.scheduled_date, now),
            requested_by: Some(actor),
            status: MoveRequestStatus::Pending,
            original_address: bin.address.clone(),
            original_coordinates: bin.coordinates,
            new_address: req.new_address.clone(),
            new_coordinates: req.new_coordinates,
            move_type: req.move_type,
            assignment_type: None,
            assigned_shift_id: None,
            assigned_user_id: None,
            created_at: now,
            completed_at: None,
        };
        tx.insert_move_request(mr.clone());

        {
            let bin = tx.bin_mut(req.bin_id)?;
            bin.move_requested = true;
            if bin.status == BinStatus::Active {
                bin.status = BinStatus::PendingMove;
            }
        }

        push_history(tx, &mr, &mr, HistoryAction::Created, Some(actor), None, now);
        tracing::info!(move_request_id = %mr.id, bin_id = %mr.bin_id, urgency = ?mr.urgency, "move request created");
        Ok(mr)
    })
}

/// Stops a request contributes when attached to a shift: a pickup always,
/// plus a dropoff when the bin lands somewhere new.
fn stops_for(move_type: MoveType) -> Vec<StopType> {
    match move_type {
        MoveType::Relocation => vec![StopType::Pickup, StopType::Dropoff],
        MoveType::Store | MoveType::PickupOnly => vec![StopType::Pickup],
    }
}

pub fn assign_to_shift(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    mr_id: Uuid,
    shift_id: Uuid,
) -> Result<MoveRequest> {
    assign_to_shift_at(ctx, actor, mr_id, shift_id, chrono::Utc::now().timestamp())
}

pub fn assign_to_shift_at(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    mr_id: Uuid,
    shift_id: Uuid,
    now: i64,
) -> Result<MoveRequest> {
    let (mr, snap) = ctx.store.transaction(|tx| {
        let before = tx.move_request(mr_id)?.clone();
        if before.status.is_terminal() {
            return Err(FleetError::invalid_transition(
                "move request",
                before.status.as_str(),
                "assign",
            ));
        }
        if before.assigned_shift_id == Some(shift_id) {
            return Err(FleetError::conflict(
                "move request is already assigned to this shift",
            ));
        }

        let target = tx.shift(shift_id)?.clone();
        if !target.status.is_open() {
            return Err(FleetError::validation(format!(
                "cannot assign to a shift in status {}",
                target.status.as_str()
            )));
        }

        let reassignment = detach_in_tx(tx, &before)?;

        let stop_types = stops_for(before.move_type);
        let added = stop_types.len() as u32;
        for stop_type in stop_types {
            let sequence_order = tx.next_sequence_order(shift_id);
            tx.insert_shift_bin(ShiftBin {
                id: Uuid::new_v4(),
                shift_id,
                bin_id: before.bin_id,
                sequence_order,
                is_completed: false,
                completed_at: None,
                updated_fill_percentage: None,
                stop_type,
                move_request_id: Some(mr_id),
            });
        }
        {
            let row = tx.shift_mut(shift_id)?;
            row.total_bins += added;
        }

        {
            let row = tx.move_request_mut(mr_id)?;
            row.assignment_type = Some(AssignmentType::Shift);
            row.assigned_shift_id = Some(shift_id);
            row.assigned_user_id = None;
            // Rides to work with the shift: pending until the shift runs.
            if row.status == MoveRequestStatus::Pending
                && target.status == ShiftStatus::Active
            {
                row.status = MoveRequestStatus::InProgress;
            }
        }

        let after = tx.move_request(mr_id)?.clone();
        let action = if reassignment {
            HistoryAction::Reassigned
        } else {
            HistoryAction::Assigned
        };
        push_history(tx, &before, &after, action, Some(actor), None, now);

        let target = tx.shift(shift_id)?.clone();
        Ok((after, shift::snapshot_for(tx, &target, now)))
    })?;

    shift::broadcast_update(ctx, &snap);
    crate::fleet::context::dispatch_push(
        ctx,
        snap.shift.driver_id,
        PushPayload::MoveRequestAssigned {
            move_request_id: mr.id,
        },
    );
    tracing::info!(move_request_id = %mr.id, shift_id = %shift_id, "move request assigned to shift");
    Ok(mr)
}

pub fn assign_to_user(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    mr_id: Uuid,
    user_id: Uuid,
) -> Result<MoveRequest> {
    assign_to_user_at(ctx, actor, mr_id, user_id, chrono::Utc::now().timestamp())
}

pub fn assign_to_user_at(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    mr_id: Uuid,
    user_id: Uuid,
    now: i64,
) -> Result<MoveRequest> {
    let mr = ctx.store.transaction(|tx| {
        let before = tx.move_request(mr_id)?.clone();
        if before.status.is_terminal() {
            return Err(FleetError::invalid_transition(
                "move request",
                before.status.as_str(),
                "assign",
            ));
        }
        if before.assigned_user_id == Some(user_id) {
            return Err(FleetError::conflict(
                "move request is already assigned to this user",
            ));
        }

        let assignee = tx.user(user_id)?;
        if assignee.role != UserRole::Driver {
            return Err(FleetError::validation(
                "manual move requests can only be assigned to drivers",
            ));
        }

        let reassignment = detach_in_tx(tx, &before)?;

        {
            let row = tx.move_request_mut(mr_id)?;
            row.assignment_type = Some(AssignmentType::Manual);
            row.assigned_user_id = Some(user_id);
            row.assigned_shift_id = None;
            if row.status == MoveRequestStatus::Pending {
                row.status = MoveRequestStatus::InProgress;
            }
        }

        let after = tx.move_request(mr_id)?.clone();
        let action = if reassignment {
            HistoryAction::Reassigned
        } else {
            HistoryAction::Assigned
        };
        push_history(tx, &before, &after, action, Some(actor), None, now);
        Ok(after)
    })?;

    crate::fleet::context::dispatch_push(
        ctx,
        user_id,
        PushPayload::MoveRequestAssigned {
            move_request_id: mr.id,
        },
    );
    tracing::info!(move_request_id = %mr.id, user_id = %user_id, "move request assigned to user");
    Ok(mr)
}

/// Clears the current assignment, removing any stops it contributed to a
/// still-open shift. Returns whether there was an assignment (so the caller
/// records reassigned rather than assigned).
fn detach_in_tx(tx: &mut StoreState, mr: &MoveRequest) -> Result<bool> {
    match (mr.assigned_shift_id, mr.assigned_user_id) {
        (Some(old_shift), _) => {
            let old_is_open = tx.shift(old_shift).map(|s| s.status.is_open()).unwrap_or(false);
            if old_is_open {
                let removed = tx.remove_stops_for_request(old_shift, mr.id);
                let row = tx.shift_mut(old_shift)?;
                row.total_bins = row.total_bins.saturating_sub(removed);
            }
            Ok(true)
        }
        (None, Some(_)) => Ok(true),
        (None, None) => Ok(false),
    }
}

pub fn unassign(ctx: &Arc<ServiceContext>, actor: Uuid, mr_id: Uuid) -> Result<MoveRequest> {
    unassign_at(ctx, actor, mr_id, chrono::Utc::now().timestamp())
}

pub fn unassign_at(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    mr_id: Uuid,
    now: i64,
) -> Result<MoveRequest> {
    ctx.store
        .transaction(|tx| unassign_in_tx(tx, mr_id, Some(actor), None, now))
}

/// Returns a request to the pool: assignment cleared, status back to
/// pending, one `unassigned` history row.
pub(crate) fn unassign_in_tx(
    tx: &mut StoreState,
    mr_id: Uuid,
    actor: Option<Uuid>,
    note: Option<&str>,
    now: i64,
) -> Result<MoveRequest> {
    let before = tx.move_request(mr_id)?.clone();
    if before.status.is_terminal() {
        return Err(FleetError::invalid_transition(
            "move request",
            before.status.as_str(),
            "unassign",
        ));
    }
    if before.assigned_shift_id.is_none() && before.assigned_user_id.is_none() {
        return Err(FleetError::validation("move request is not assigned"));
    }

    detach_in_tx(tx, &before)?;
    {
        let row = tx.move_request_mut(mr_id)?;
        row.assignment_type = None;
        row.assigned_shift_id = None;
        row.assigned_user_id = None;
        row.status = MoveRequestStatus::Pending;
    }
    let after = tx.move_request(mr_id)?.clone();
    push_history(tx, &before, &after, HistoryAction::Unassigned, actor, note, now);
    Ok(after)
}

/// Pending → in-progress when the carrying shift starts.
pub(crate) fn promote_in_tx(tx: &mut StoreState, mr_id: Uuid, now: i64) -> Result<()> {
    let before = tx.move_request(mr_id)?.clone();
    if before.status != MoveRequestStatus::Pending {
        return Ok(());
    }
    tx.move_request_mut(mr_id)?.status = MoveRequestStatus::InProgress;
    let after = tx.move_request(mr_id)?.clone();
    push_history(
        tx,
        &before,
        &after,
        HistoryAction::Updated,
        None,
        Some("shift started"),
        now,
    );
    Ok(())
}

pub fn update_request(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    mr_id: Uuid,
    req: UpdateMoveRequest,
) -> Result<MoveRequest> {
    update_request_at(ctx, actor, mr_id, req, chrono::Utc::now().timestamp())
}

pub fn update_request_at(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    mr_id: Uuid,
    req: UpdateMoveRequest,
    now: i64,
) -> Result<MoveRequest> {
    ctx.store.transaction(|tx| {
        let before = tx.move_request(mr_id)?.clone();
        if before.status.is_terminal() {
            return Err(FleetError::invalid_transition(
                "move request",
                before.status.as_str(),
                "update",
            ));
        }

        {
            let row = tx.move_request_mut(mr_id)?;
            if let Some(scheduled) = req.scheduled_date {
                row.scheduled_date = scheduled;
                row.urgency = derive_urgency(scheduled, now);
            }
            if let Some(move_type) = req.move_type {
                row.move_type = move_type;
            }
            if let Some(address) = req.new_address.clone() {
                row.new_address = Some(address);
            }
            if let Some(coords) = req.new_coordinates {
                row.new_coordinates = Some(coords);
            }
        }

        let after = tx.move_request(mr_id)?.clone();
        push_history(tx, &before, &after, HistoryAction::Updated, Some(actor), None, now);
        Ok(after)
    })
}

pub fn cancel(ctx: &Arc<ServiceContext>, actor: Uuid, mr_id: Uuid) -> Result<MoveRequest> {
    cancel_at(ctx, actor, mr_id, chrono::Utc::now().timestamp())
}

pub fn cancel_at(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    mr_id: Uuid,
    now: i64,
) -> Result<MoveRequest> {
    ctx.store.transaction(|tx| {
        let before = tx.move_request(mr_id)?.clone();
        if before.status.is_terminal() {
            return Err(FleetError::invalid_transition(
                "move request",
                before.status.as_str(),
                "cancel",
            ));
        }

        detach_in_tx(tx, &before)?;
        {
            let row = tx.move_request_mut(mr_id)?;
            row.assignment_type = None;
            row.assigned_shift_id = None;
            row.assigned_user_id = None;
            row.status = MoveRequestStatus::Cancelled;
        }

        if let Ok(bin) = tx.bin_mut(before.bin_id) {
            bin.move_requested = false;
            if bin.status == BinStatus::PendingMove {
                bin.status = BinStatus::Active;
            }
        }

        let after = tx.move_request(mr_id)?.clone();
        push_history(tx, &before, &after, HistoryAction::Cancelled, Some(actor), None, now);
        tracing::info!(move_request_id = %mr_id, "move request cancelled");
        Ok(after)
    })
}

/// Completes a manually assigned request on behalf of its driver, writing
/// the inspection check alongside the relocation.
pub fn complete_manual(
    ctx: &Arc<ServiceContext>,
    driver_id: Uuid,
    mr_id: Uuid,
    req: CompleteManualRequest,
) -> Result<MoveRequest> {
    complete_manual_at(ctx, driver_id, mr_id, req, chrono::Utc::now().timestamp())
}

pub fn complete_manual_at(
    ctx: &Arc<ServiceContext>,
    driver_id: Uuid,
    mr_id: Uuid,
    req: CompleteManualRequest,
    now: i64,
) -> Result<MoveRequest> {
    ctx.store.transaction(|tx| {
        let mr = tx.move_request(mr_id)?.clone();
        if mr.assigned_user_id != Some(driver_id) {
            return Err(FleetError::Forbidden(
                "move request is not assigned to you".to_string(),
            ));
        }
        if mr.status != MoveRequestStatus::InProgress {
            return Err(FleetError::invalid_transition(
                "move request",
                mr.status.as_str(),
                "complete",
            ));
        }

        tx.push_check(Check {
            id: Uuid::new_v4(),
            bin_id: mr.bin_id,
            fill_percentage: req.fill_percentage,
            photo_url: req.photo_url.clone(),
            checked_from: Some("move_request".to_string()),
            checked_by: Some(driver_id),
            shift_id: None,
            move_request_id: Some(mr_id),
            timestamp: now,
        });
        {
            let bin = tx.bin_mut(mr.bin_id)?;
            bin.last_checked = Some(now);
            bin.checked = true;
            if let Some(fill) = req.fill_percentage {
                bin.fill_percentage = fill.min(100);
            }
        }
        tx.resolve_recommendations_for_bin(mr.bin_id, now);

        complete_in_tx(tx, mr_id, Some(driver_id), None, now)?;
        Ok(tx.move_request(mr_id)?.clone())
    })
}

/// Terminal completion: applies the physical effect to the bin, writes the
/// relocation record, closes the assignment, and logs the audit row. Called
/// from the shift path (dropoff completed) and the manual path.
pub(crate) fn complete_in_tx(
    tx: &mut StoreState,
    mr_id: Uuid,
    actor: Option<Uuid>,
    shift_id: Option<Uuid>,
    now: i64,
) -> Result<()> {
    let before = tx.move_request(mr_id)?.clone();
    if before.status.is_terminal() {
        return Err(FleetError::invalid_transition(
            "move request",
            before.status.as_str(),
            "complete",
        ));
    }

    let bin = tx.bin(before.bin_id)?.clone();
    let to_address = before
        .new_address
        .clone()
        .unwrap_or_else(|| bin.address.clone());

    tx.push_move(Move {
        id: Uuid::new_v4(),
        bin_id: before.bin_id,
        from_address: bin.address.clone(),
        to_address: to_address.clone(),
        timestamp: now,
        move_type: if shift_id.is_some() {
            AssignmentType::Shift
        } else {
            AssignmentType::Manual
        },
        shift_id,
        move_request_id: Some(mr_id),
        performed_by: actor,
    });

    {
        let row = tx.bin_mut(before.bin_id)?;
        row.last_moved = Some(now);
        row.move_requested = false;
        match before.move_type {
            MoveType::Relocation => {
                row.address = to_address;
                row.coordinates = before.new_coordinates;
                if row.status == BinStatus::PendingMove {
                    row.status = BinStatus::Active;
                }
            }
            MoveType::Store | MoveType::PickupOnly => {
                row.status = BinStatus::InStorage;
            }
        }
    }

    {
        let row = tx.move_request_mut(mr_id)?;
        row.status = MoveRequestStatus::Completed;
        row.completed_at = Some(now);
        row.assignment_type = None;
        row.assigned_shift_id = None;
        row.assigned_user_id = None;
    }

    let after = tx.move_request(mr_id)?.clone();
    push_history(tx, &before, &after, HistoryAction::Completed, actor, None, now);
    tracing::info!(move_request_id = %mr_id, bin_id = %before.bin_id, "move request completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::models::{Bin, User};
    use crate::fleet::shift::{
        assign_route_at, complete_bin_at, start_shift_at, AssignRouteRequest, CompleteBinRequest,
    };
    use crate::fleet::store::NewBin;

    const T0: i64 = 1_700_000_000;
    const DAY: i64 = 86_400;

    fn address(street: &str) -> Address {
        Address {
            street: street.to_string(),
            city: "Rotterdam".to_string(),
            zip: "3011".to_string(),
        }
    }

    fn seed_bin(ctx: &Arc<ServiceContext>) -> Bin {
        ctx.store
            .transaction(|tx| {
                tx.insert_bin(
                    NewBin {
                        bin_number: None,
                        address: address("Kade 1"),
                        coordinates: None,
                        fill_percentage: 30,
                        created_by: None,
                    },
                    T0,
                )
            })
            .unwrap()
    }

    fn seed_driver(ctx: &Arc<ServiceContext>) -> Uuid {
        let user = User {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", Uuid::new_v4()),
            password_hash: String::new(),
            name: "Driver".to_string(),
            role: UserRole::Driver,
            created_at: T0,
        };
        let id = user.id;
        ctx.store.transaction(move |tx| tx.insert_user(user)).unwrap();
        id
    }

    fn relocation(bin_id: Uuid, scheduled: i64) -> ScheduleMoveRequest {
        ScheduleMoveRequest {
            bin_id,
            scheduled_date: scheduled,
            move_type: MoveType::Relocation,
            new_address: Some(address("Haven 9")),
            new_coordinates: Some(Coordinates {
                latitude: 51.95,
                longitude: 4.45,
            }),
        }
    }

    fn shift_for(ctx: &Arc<ServiceContext>, driver: Uuid) -> Uuid {
        let bin = seed_bin(ctx);
        assign_route_at(
            ctx,
            Uuid::new_v4(),
            AssignRouteRequest {
                driver_id: driver,
                bin_ids: vec![bin.id],
                route_id: None,
                optimize: false,
            },
            T0,
        )
        .unwrap()
        .shift
        .id
    }

    #[test]
    fn urgency_derivation() {
        assert_eq!(derive_urgency(T0, T0), Urgency::Urgent);
        assert_eq!(derive_urgency(T0 - DAY, T0), Urgency::Urgent);
        assert_eq!(derive_urgency(T0 + 2 * DAY, T0), Urgency::Scheduled);
    }

    #[test]
    fn creation_writes_history_and_flags_bin() {
        let ctx = ServiceContext::for_tests();
        let bin = seed_bin(&ctx);
        let manager = Uuid::new_v4();

        let mr = schedule_at(&ctx, manager, relocation(bin.id, T0 + 3 * DAY), T0).unwrap();
        assert_eq!(mr.status, MoveRequestStatus::Pending);
        assert_eq!(mr.urgency, Urgency::Scheduled);
        assert_eq!(mr.original_address, address("Kade 1"));
        assert_eq!(mr.assignment_type, None);

        let bin = ctx.store.read(|s| s.bin(mr.bin_id).cloned()).unwrap();
        assert!(bin.move_requested);
        assert_eq!(bin.status, BinStatus::PendingMove);

        let history = ctx.store.read(|s| s.history_for_request(mr.id));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, HistoryAction::Created);
    }

    #[test]
    fn second_open_request_for_bin_conflicts() {
        let ctx = ServiceContext::for_tests();
        let bin = seed_bin(&ctx);
        schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();
        let err = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[test]
    fn shift_assignment_inserts_stop_pair_and_sets_exclusivity() {
        let ctx = ServiceContext::for_tests();
        let driver = seed_driver(&ctx);
        let shift_id = shift_for(&ctx, driver);
        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();

        let mr = assign_to_shift_at(&ctx, Uuid::new_v4(), mr.id, shift_id, T0 + 1).unwrap();
        assert_eq!(mr.assignment_type, Some(AssignmentType::Shift));
        assert_eq!(mr.assigned_shift_id, Some(shift_id));
        assert_eq!(mr.assigned_user_id, None);
        // The shift is still ready, so the request stays pending.
        assert_eq!(mr.status, MoveRequestStatus::Pending);

        let stops = ctx.store.read(|s| s.shift_bins_for(shift_id));
        let mr_stops: Vec<&ShiftBin> = stops
            .iter()
            .filter(|sb| sb.move_request_id == Some(mr.id))
            .collect();
        assert_eq!(mr_stops.len(), 2);
        assert_eq!(mr_stops[0].stop_type, StopType::Pickup);
        assert_eq!(mr_stops[1].stop_type, StopType::Dropoff);

        let shift = ctx.store.read(|s| s.shift(shift_id).cloned()).unwrap();
        assert_eq!(shift.total_bins, 3); // 1 collection + pickup + dropoff

        // Assigning again to the same shift conflicts.
        let err =
            assign_to_shift_at(&ctx, Uuid::new_v4(), mr.id, shift_id, T0 + 2).unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[test]
    fn assignment_to_active_shift_goes_in_progress() {
        let ctx = ServiceContext::for_tests();
        let driver = seed_driver(&ctx);
        let shift_id = shift_for(&ctx, driver);
        start_shift_at(&ctx, driver, T0 + 1).unwrap();

        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();
        let mr = assign_to_shift_at(&ctx, Uuid::new_v4(), mr.id, shift_id, T0 + 2).unwrap();
        assert_eq!(mr.status, MoveRequestStatus::InProgress);
    }

    #[test]
    fn starting_shift_promotes_parked_requests() {
        let ctx = ServiceContext::for_tests();
        let driver = seed_driver(&ctx);
        let shift_id = shift_for(&ctx, driver);

        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();
        let mr = assign_to_shift_at(&ctx, Uuid::new_v4(), mr.id, shift_id, T0 + 1).unwrap();
        assert_eq!(mr.status, MoveRequestStatus::Pending);

        start_shift_at(&ctx, driver, T0 + 2).unwrap();
        let mr = ctx.store.read(|s| s.move_request(mr.id).cloned()).unwrap();
        assert_eq!(mr.status, MoveRequestStatus::InProgress);
    }

    #[test]
    fn reassignment_moves_stops_and_audits_previous_shift() {
        let ctx = ServiceContext::for_tests();
        let driver_a = seed_driver(&ctx);
        let driver_b = seed_driver(&ctx);
        let shift_a = shift_for(&ctx, driver_a);
        let shift_b = shift_for(&ctx, driver_b);

        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();
        let mr = assign_to_shift_at(&ctx, Uuid::new_v4(), mr.id, shift_a, T0 + 1).unwrap();
        let mr = assign_to_shift_at(&ctx, Uuid::new_v4(), mr.id, shift_b, T0 + 2).unwrap();

        assert_eq!(mr.assigned_shift_id, Some(shift_b));

        let stops_a = ctx.store.read(|s| s.shift_bins_for(shift_a));
        assert!(stops_a.iter().all(|sb| sb.move_request_id.is_none()));
        let stops_b = ctx.store.read(|s| s.shift_bins_for(shift_b));
        assert_eq!(
            stops_b
                .iter()
                .filter(|sb| sb.move_request_id == Some(mr.id))
                .count(),
            2
        );

        let shift_a_row = ctx.store.read(|s| s.shift(shift_a).cloned()).unwrap();
        assert_eq!(shift_a_row.total_bins, 1);

        let history = ctx.store.read(|s| s.history_for_request(mr.id));
        let actions: Vec<HistoryAction> = history.iter().map(|h| h.action).collect();
        assert_eq!(
            actions,
            vec![
                HistoryAction::Created,
                HistoryAction::Assigned,
                HistoryAction::Reassigned
            ]
        );
        let reassigned = &history[2];
        assert_eq!(reassigned.previous_assigned_shift_id, Some(shift_a));
        assert_eq!(reassigned.new_assigned_shift_id, Some(shift_b));
    }

    #[test]
    fn manual_assignment_is_exclusive_with_shift() {
        let ctx = ServiceContext::for_tests();
        let driver = seed_driver(&ctx);
        let other_driver = seed_driver(&ctx);
        let shift_id = shift_for(&ctx, driver);

        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();
        let mr = assign_to_shift_at(&ctx, Uuid::new_v4(), mr.id, shift_id, T0 + 1).unwrap();
        let mr = assign_to_user_at(&ctx, Uuid::new_v4(), mr.id, other_driver, T0 + 2).unwrap();

        assert_eq!(mr.assignment_type, Some(AssignmentType::Manual));
        assert_eq!(mr.assigned_user_id, Some(other_driver));
        assert_eq!(mr.assigned_shift_id, None);
        assert_eq!(mr.status, MoveRequestStatus::InProgress);

        // Stops left the shift when the assignment moved.
        let stops = ctx.store.read(|s| s.shift_bins_for(shift_id));
        assert!(stops.iter().all(|sb| sb.move_request_id.is_none()));
    }

    #[test]
    fn unassign_returns_to_pool() {
        let ctx = ServiceContext::for_tests();
        let driver = seed_driver(&ctx);
        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();
        let mr = assign_to_user_at(&ctx, Uuid::new_v4(), mr.id, driver, T0 + 1).unwrap();

        let mr = unassign_at(&ctx, Uuid::new_v4(), mr.id, T0 + 2).unwrap();
        assert_eq!(mr.status, MoveRequestStatus::Pending);
        assert_eq!(mr.assignment_type, None);
        assert_eq!(mr.assigned_user_id, None);

        let err = unassign_at(&ctx, Uuid::new_v4(), mr.id, T0 + 3).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn cancellation_is_terminal_and_restores_bin() {
        let ctx = ServiceContext::for_tests();
        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();
        let mr = cancel_at(&ctx, Uuid::new_v4(), mr.id, T0 + 1).unwrap();
        assert_eq!(mr.status, MoveRequestStatus::Cancelled);

        let bin = ctx.store.read(|s| s.bin(bin.id).cloned()).unwrap();
        assert!(!bin.move_requested);
        assert_eq!(bin.status, BinStatus::Active);

        for event in ["assign", "complete", "cancel"] {
            let err = match event {
                "assign" => assign_to_user_at(&ctx, Uuid::new_v4(), mr.id, Uuid::new_v4(), T0 + 2)
                    .unwrap_err(),
                "cancel" => cancel_at(&ctx, Uuid::new_v4(), mr.id, T0 + 2).unwrap_err(),
                _ => ctx
                    .store
                    .transaction(|tx| complete_in_tx(tx, mr.id, None, None, T0 + 2))
                    .unwrap_err(),
            };
            assert!(matches!(err, FleetError::Validation(_)), "{}", event);
        }
    }

    #[test]
    fn shift_completion_of_dropoff_completes_request() {
        let ctx = ServiceContext::for_tests();
        let driver = seed_driver(&ctx);
        let shift_id = shift_for(&ctx, driver);

        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();
        assign_to_shift_at(&ctx, Uuid::new_v4(), mr.id, shift_id, T0 + 1).unwrap();
        start_shift_at(&ctx, driver, T0 + 2).unwrap();

        // Pickup first: request still in progress.
        complete_bin_at(
            &ctx,
            driver,
            CompleteBinRequest {
                bin_id: bin.id,
                fill_percentage: None,
                photo_url: None,
            },
            T0 + 10,
        )
        .unwrap();
        let in_flight = ctx.store.read(|s| s.move_request(mr.id).cloned()).unwrap();
        assert_eq!(in_flight.status, MoveRequestStatus::InProgress);

        // Dropoff: request completes, bin relocates.
        complete_bin_at(
            &ctx,
            driver,
            CompleteBinRequest {
                bin_id: bin.id,
                fill_percentage: None,
                photo_url: None,
            },
            T0 + 20,
        )
        .unwrap();

        let done = ctx.store.read(|s| s.move_request(mr.id).cloned()).unwrap();
        assert_eq!(done.status, MoveRequestStatus::Completed);
        assert_eq!(done.completed_at, Some(T0 + 20));
        assert_eq!(done.assigned_shift_id, None);

        let moved = ctx.store.read(|s| s.bin(bin.id).cloned()).unwrap();
        assert_eq!(moved.address, address("Haven 9"));
        assert_eq!(moved.last_moved, Some(T0 + 20));
        assert!(!moved.move_requested);

        let moves = ctx.store.read(|s| s.moves_for_bin(bin.id));
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].move_type, AssignmentType::Shift);
        assert_eq!(moves[0].to_address, address("Haven 9"));

        let history = ctx.store.read(|s| s.history_for_request(mr.id));
        assert_eq!(history.last().unwrap().action, HistoryAction::Completed);
    }

    #[test]
    fn store_request_puts_bin_in_storage() {
        let ctx = ServiceContext::for_tests();
        let driver = seed_driver(&ctx);
        let bin = seed_bin(&ctx);
        let mr = schedule_at(
            &ctx,
            Uuid::new_v4(),
            ScheduleMoveRequest {
                bin_id: bin.id,
                scheduled_date: T0,
                move_type: MoveType::Store,
                new_address: None,
                new_coordinates: None,
            },
            T0,
        )
        .unwrap();
        assign_to_user_at(&ctx, Uuid::new_v4(), mr.id, driver, T0 + 1).unwrap();
        complete_manual_at(
            &ctx,
            driver,
            mr.id,
            CompleteManualRequest {
                fill_percentage: Some(90),
                photo_url: None,
            },
            T0 + 2,
        )
        .unwrap();

        let stored = ctx.store.read(|s| s.bin(bin.id).cloned()).unwrap();
        assert_eq!(stored.status, BinStatus::InStorage);

        let checks = ctx.store.read(|s| s.checks_for_bin(bin.id));
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].move_request_id, Some(mr.id));
        assert_eq!(checks[0].shift_id, None);
    }

    #[test]
    fn history_is_append_only_across_lifecycle() {
        let ctx = ServiceContext::for_tests();
        let driver = seed_driver(&ctx);
        let bin = seed_bin(&ctx);
        let mr = schedule_at(&ctx, Uuid::new_v4(), relocation(bin.id, T0), T0).unwrap();

        let mut lens = vec![ctx.store.read(|s| s.history_len())];
        assign_to_user_at(&ctx, Uuid::new_v4(), mr.id, driver, T0 + 1).unwrap();
        lens.push(ctx.store.read(|s| s.history_len()));
        unassign_at(&ctx, Uuid::new_v4(), mr.id, T0 + 2).unwrap();
        lens.push(ctx.store.read(|s| s.history_len()));
        cancel_at(&ctx, Uuid::new_v4(), mr.id, T0 + 3).unwrap();
        lens.push(ctx.store.read(|s| s.history_len()));

        // Strictly growing: rows are only ever added.
        assert_eq!(lens, vec![1, 2, 3, 4]);
    }

    #[test]
    fn relocation_requires_destination() {
        let ctx = ServiceContext::for_tests();
        let bin = seed_bin(&ctx);
        let err = schedule_at(
            &ctx,
            Uuid::new_v4(),
            ScheduleMoveRequest {
                bin_id: bin.id,
                scheduled_date: T0,
                move_type: MoveType::Relocation,
                new_address: None,
                new_coordinates: None,
            },
            T0,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }
}
