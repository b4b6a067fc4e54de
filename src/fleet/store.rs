//! Typed store over the fleet entities.
//!
//! The relational database named by `DATABASE_URL` is an external
//! collaborator; this module is the seam it plugs into. The `memory:` scheme
//! selects the in-process backend, which implements the same contract the
//! relational one must honor: row transactions with rollback, unique
//! constraints on `users.email` / `bins.bin_number` / `fcm_tokens.token`,
//! upsert for driver locations, and the cascade / null-on-delete edges of the
//! ownership graph.
//!
//! A transaction runs against a working copy of the state and commits by
//! swap, so a failing operation leaves nothing behind.

use std::collections::HashMap;

use derive_more::{Display, Error};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::fleet::errors::{FleetError, Result};
use crate::fleet::models::{
    Address, Bin, BinCheckRecommendation, BinStatus, Check, Coordinates, DriverCurrentLocation,
    FcmToken, Move, MoveRequest, MoveRequestHistory, PotentialLocation, RecommendationStatus,
    Shift, ShiftBin, ShiftHistory, User,
};

#[derive(Debug, Display, Error)]
pub enum StoreError {
    #[display(fmt = "unsupported database scheme in {}", url)]
    UnsupportedScheme { url: String },
}

impl From<StoreError> for FleetError {
    fn from(err: StoreError) -> Self {
        FleetError::Validation(err.to_string())
    }
}

/// Fields a caller supplies when creating a bin. `bin_number` is assigned
/// max+1 inside the insert transaction when absent.
#[derive(Debug, Clone)]
pub struct NewBin {
    pub bin_number: Option<u32>,
    pub address: Address,
    pub coordinates: Option<Coordinates>,
    pub fill_percentage: u8,
    pub created_by: Option<Uuid>,
}

/// Full entity tables. Cloneable so a transaction can work on a copy.
#[derive(Debug, Default, Clone)]
pub struct StoreState {
    bins: HashMap<Uuid, Bin>,
    checks: Vec<Check>,
    moves: Vec<Move>,
    shifts: HashMap<Uuid, Shift>,
    shift_bins: HashMap<Uuid, ShiftBin>,
    move_requests: HashMap<Uuid, MoveRequest>,
    move_request_history: Vec<MoveRequestHistory>,
    shift_history: Vec<ShiftHistory>,
    driver_locations: HashMap<Uuid, DriverCurrentLocation>,
    recommendations: HashMap<Uuid, BinCheckRecommendation>,
    potential_locations: HashMap<Uuid, PotentialLocation>,
    users: HashMap<Uuid, User>,
    fcm_tokens: HashMap<String, FcmToken>,
}

impl StoreState {
    // ---- bins ----

    pub fn insert_bin(&mut self, draft: NewBin, now: i64) -> Result<Bin> {
        let bin_number = match draft.bin_number {
            Some(n) => {
                if self.bins.values().any(|b| b.bin_number == n) {
                    return Err(FleetError::conflict(format!(
                        "bin number {} already exists",
                        n
                    )));
                }
                n
            }
            None => self.next_bin_number(),
        };

        let bin = Bin {
            id: Uuid::new_v4(),
            bin_number,
            address: draft.address,
            coordinates: draft.coordinates,
            status: BinStatus::Active,
            fill_percentage: draft.fill_percentage.min(100),
            checked: false,
            move_requested: false,
            last_checked: None,
            last_moved: None,
            retired_at: None,
            created_by: draft.created_by,
            retired_by: None,
            created_at: now,
        };
        self.bins.insert(bin.id, bin.clone());
        Ok(bin)
    }

    fn next_bin_number(&self) -> u32 {
        self.bins.values().map(|b| b.bin_number).max().unwrap_or(0) + 1
    }

    pub fn bin(&self, id: Uuid) -> Result<&Bin> {
        self.bins
            .get(&id)
            .ok_or_else(|| FleetError::not_found(format!("bin {}", id)))
    }

    pub fn bin_mut(&mut self, id: Uuid) -> Result<&mut Bin> {
        self.bins
            .get_mut(&id)
            .ok_or_else(|| FleetError::not_found(format!("bin {}", id)))
    }

    pub fn bins(&self) -> Vec<Bin> {
        let mut out: Vec<Bin> = self.bins.values().cloned().collect();
        out.sort_by_key(|b| b.bin_number);
        out
    }

    pub fn bins_by_status(&self, status: BinStatus) -> Vec<Bin> {
        let mut out: Vec<Bin> = self
            .bins
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.bin_number);
        out
    }

    /// Cascade delete: checks, moves, and move requests owned by the bin go
    /// with it; shift stops referencing the bin are removed; weak references
    /// to the deleted move requests are nulled.
    pub fn delete_bin(&mut self, id: Uuid) -> Result<()> {
        if self.bins.remove(&id).is_none() {
            return Err(FleetError::not_found(format!("bin {}", id)));
        }
        self.checks.retain(|c| c.bin_id != id);
        self.moves.retain(|m| m.bin_id != id);

        let dead_requests: Vec<Uuid> = self
            .move_requests
            .values()
            .filter(|mr| mr.bin_id == id)
            .map(|mr| mr.id)
            .collect();
        for mr_id in &dead_requests {
            self.move_requests.remove(mr_id);
        }
        for check in self.checks.iter_mut() {
            if let Some(mr_id) = check.move_request_id {
                if dead_requests.contains(&mr_id) {
                    check.move_request_id = None;
                }
            }
        }
        for stop in self.shift_bins.values_mut() {
            if let Some(mr_id) = stop.move_request_id {
                if dead_requests.contains(&mr_id) {
                    stop.move_request_id = None;
                }
            }
        }
        self.shift_bins.retain(|_, sb| sb.bin_id != id);
        self.recommendations.retain(|_, r| r.bin_id != id);
        Ok(())
    }

    // ---- checks & moves (append-only) ----

    pub fn push_check(&mut self, check: Check) {
        self.checks.push(check);
    }

    pub fn checks_for_bin(&self, bin_id: Uuid) -> Vec<Check> {
        let mut out: Vec<Check> = self
            .checks
            .iter()
            .filter(|c| c.bin_id == bin_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.timestamp);
        out
    }

    pub fn push_move(&mut self, mv: Move) {
        self.moves.push(mv);
    }

    pub fn moves_for_bin(&self, bin_id: Uuid) -> Vec<Move> {
        let mut out: Vec<Move> = self
            .moves
            .iter()
            .filter(|m| m.bin_id == bin_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.timestamp);
        out
    }

    // ---- shifts ----

    pub fn insert_shift(&mut self, shift: Shift) {
        self.shifts.insert(shift.id, shift);
    }

    pub fn shift(&self, id: Uuid) -> Result<&Shift> {
        self.shifts
            .get(&id)
            .ok_or_else(|| FleetError::not_found(format!("shift {}", id)))
    }

    pub fn shift_mut(&mut self, id: Uuid) -> Result<&mut Shift> {
        self.shifts
            .get_mut(&id)
            .ok_or_else(|| FleetError::not_found(format!("shift {}", id)))
    }

    /// The driver's ready, active, or paused shift, if any. A driver holds at
    /// most one open shift at a time.
    pub fn open_shift_for_driver(&self, driver_id: Uuid) -> Option<Shift> {
        self.shifts
            .values()
            .find(|s| s.driver_id == driver_id && s.status.is_open())
            .cloned()
    }

    pub fn insert_shift_bin(&mut self, stop: ShiftBin) {
        self.shift_bins.insert(stop.id, stop);
    }

    /// Stops of a shift ordered by sequence.
    pub fn shift_bins_for(&self, shift_id: Uuid) -> Vec<ShiftBin> {
        let mut out: Vec<ShiftBin> = self
            .shift_bins
            .values()
            .filter(|sb| sb.shift_id == shift_id)
            .cloned()
            .collect();
        out.sort_by_key(|sb| sb.sequence_order);
        out
    }

    pub fn shift_bin_mut(&mut self, id: Uuid) -> Result<&mut ShiftBin> {
        self.shift_bins
            .get_mut(&id)
            .ok_or_else(|| FleetError::not_found(format!("shift stop {}", id)))
    }

    pub fn next_sequence_order(&self, shift_id: Uuid) -> u32 {
        self.shift_bins
            .values()
            .filter(|sb| sb.shift_id == shift_id)
            .map(|sb| sb.sequence_order)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Removes the pickup/dropoff stops a move request contributed to a
    /// shift. Returns how many were removed.
    pub fn remove_stops_for_request(&mut self, shift_id: Uuid, move_request_id: Uuid) -> u32 {
        let doomed: Vec<Uuid> = self
            .shift_bins
            .values()
            .filter(|sb| sb.shift_id == shift_id && sb.move_request_id == Some(move_request_id))
            .map(|sb| sb.id)
            .collect();
        for id in &doomed {
            self.shift_bins.remove(id);
        }
        doomed.len() as u32
    }

    pub fn push_shift_history(&mut self, row: ShiftHistory) {
        self.shift_history.push(row);
    }

    pub fn shift_history_for(&self, shift_id: Uuid) -> Vec<ShiftHistory> {
        self.shift_history
            .iter()
            .filter(|h| h.shift_id == shift_id)
            .cloned()
            .collect()
    }

    // ---- move requests ----

    pub fn insert_move_request(&mut self, mr: MoveRequest) {
        self.move_requests.insert(mr.id, mr);
    }

    pub fn move_request(&self, id: Uuid) -> Result<&MoveRequest> {
        self.move_requests
            .get(&id)
            .ok_or_else(|| FleetError::not_found(format!("move request {}", id)))
    }

    pub fn move_request_mut(&mut self, id: Uuid) -> Result<&mut MoveRequest> {
        self.move_requests
            .get_mut(&id)
            .ok_or_else(|| FleetError::not_found(format!("move request {}", id)))
    }

    pub fn move_requests(&self) -> Vec<MoveRequest> {
        let mut out: Vec<MoveRequest> = self.move_requests.values().cloned().collect();
        out.sort_by_key(|mr| (mr.scheduled_date, mr.created_at));
        out
    }

    /// The newest non-terminal request for a bin, used by priority scoring.
    pub fn open_move_request_for_bin(&self, bin_id: Uuid) -> Option<MoveRequest> {
        self.move_requests
            .values()
            .filter(|mr| mr.bin_id == bin_id && !mr.status.is_terminal())
            .max_by_key(|mr| mr.created_at)
            .cloned()
    }

    /// Non-terminal requests currently assigned to a shift.
    pub fn open_requests_for_shift(&self, shift_id: Uuid) -> Vec<MoveRequest> {
        self.move_requests
            .values()
            .filter(|mr| mr.assigned_shift_id == Some(shift_id) && !mr.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn push_move_request_history(&mut self, row: MoveRequestHistory) {
        self.move_request_history.push(row);
    }

    pub fn history_for_request(&self, move_request_id: Uuid) -> Vec<MoveRequestHistory> {
        let mut out: Vec<MoveRequestHistory> = self
            .move_request_history
            .iter()
            .filter(|h| h.move_request_id == move_request_id)
            .cloned()
            .collect();
        out.sort_by_key(|h| h.timestamp);
        out
    }

    pub fn history_len(&self) -> usize {
        self.move_request_history.len()
    }

    // ---- driver locations ----

    /// One row per driver: insert or overwrite, `ON CONFLICT`-style.
    pub fn upsert_driver_location(&mut self, loc: DriverCurrentLocation) {
        self.driver_locations.insert(loc.driver_id, loc);
    }

    pub fn driver_location(&self, driver_id: Uuid) -> Option<DriverCurrentLocation> {
        self.driver_locations.get(&driver_id).cloned()
    }

    pub fn driver_locations(&self) -> Vec<DriverCurrentLocation> {
        let mut out: Vec<DriverCurrentLocation> =
            self.driver_locations.values().cloned().collect();
        out.sort_by_key(|l| l.driver_id);
        out
    }

    // ---- check recommendations ----

    pub fn insert_recommendation(&mut self, rec: BinCheckRecommendation) {
        self.recommendations.insert(rec.id, rec);
    }

    pub fn recommendation_mut(&mut self, id: Uuid) -> Result<&mut BinCheckRecommendation> {
        self.recommendations
            .get_mut(&id)
            .ok_or_else(|| FleetError::not_found(format!("check recommendation {}", id)))
    }

    pub fn open_recommendation_for_bin(&self, bin_id: Uuid) -> Option<BinCheckRecommendation> {
        self.recommendations
            .values()
            .find(|r| r.bin_id == bin_id && r.status == RecommendationStatus::Pending)
            .cloned()
    }

    pub fn recommendations_by_status(
        &self,
        status: Option<RecommendationStatus>,
    ) -> Vec<BinCheckRecommendation> {
        let mut out: Vec<BinCheckRecommendation> = self
            .recommendations
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Marks any pending recommendation for the bin resolved.
    pub fn resolve_recommendations_for_bin(&mut self, bin_id: Uuid, now: i64) {
        for rec in self.recommendations.values_mut() {
            if rec.bin_id == bin_id && rec.status == RecommendationStatus::Pending {
                rec.status = RecommendationStatus::Resolved;
                rec.resolved_at = Some(now);
            }
        }
    }

    // ---- potential locations ----

    pub fn insert_potential_location(&mut self, loc: PotentialLocation) {
        self.potential_locations.insert(loc.id, loc);
    }

    pub fn potential_location_mut(&mut self, id: Uuid) -> Result<&mut PotentialLocation> {
        self.potential_locations
            .get_mut(&id)
            .ok_or_else(|| FleetError::not_found(format!("potential location {}", id)))
    }

    pub fn potential_locations(&self) -> Vec<PotentialLocation> {
        let mut out: Vec<PotentialLocation> =
            self.potential_locations.values().cloned().collect();
        out.sort_by_key(|l| l.created_at);
        out
    }

    // ---- users & push tokens ----

    pub fn insert_user(&mut self, user: User) -> Result<()> {
        let email = user.email.to_ascii_lowercase();
        if self
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&email))
        {
            return Err(FleetError::conflict(format!(
                "email {} already registered",
                email
            )));
        }
        self.users.insert(user.id, user);
        Ok(())
    }

    pub fn user(&self, id: Uuid) -> Result<&User> {
        self.users
            .get(&id)
            .ok_or_else(|| FleetError::not_found(format!("user {}", id)))
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        self.users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
    }

    pub fn users_is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn users(&self) -> Vec<User> {
        let mut out: Vec<User> = self.users.values().cloned().collect();
        out.sort_by(|a, b| a.email.cmp(&b.email));
        out
    }

    /// Unique on token: re-registering moves the token to the new user.
    pub fn upsert_fcm_token(&mut self, token: FcmToken) {
        self.fcm_tokens.insert(token.token.clone(), token);
    }

    pub fn fcm_tokens_for_user(&self, user_id: Uuid) -> Vec<FcmToken> {
        self.fcm_tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn remove_fcm_token(&mut self, token: &str) {
        self.fcm_tokens.remove(token);
    }
}

/// Shared handle over the backing state. Readers take shared access; a
/// transaction holds the write lock for its duration and commits by swapping
/// in the mutated working copy.
#[derive(Debug)]
pub struct Store {
    state: RwLock<StoreState>,
}

impl Store {
    /// Opens the backend selected by the URL scheme. Only the in-process
    /// `memory:` backend is built in; relational backends plug in at this
    /// seam.
    pub fn open(url: &str) -> Result<Store> {
        if url == "memory:" || url.starts_with("memory://") {
            Ok(Store {
                state: RwLock::new(StoreState::default()),
            })
        } else {
            Err(StoreError::UnsupportedScheme {
                url: url.to_string(),
            }
            .into())
        }
    }

    pub fn in_memory() -> Store {
        Store {
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        f(&self.state.read())
    }

    /// Runs `f` against a working copy; commits only on `Ok`. All mutations
    /// and their history rows inside one call are atomic.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write();
        let mut working = guard.clone();
        let out = f(&mut working)?;
        *guard = working;
        Ok(out)
    }
}
