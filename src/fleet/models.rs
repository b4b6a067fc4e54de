//! Core data model for the dispatch and shift domain.
//!
//! Every entity is stored with unix-second timestamps and serialized with
//! RFC 3339 timestamps on the wire (see [`timefmt`]). Ids are v4 UUIDs.

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// Serde helpers mapping unix-second `i64` fields to RFC 3339 strings on the
/// wire while keeping integer seconds in memory and storage.
pub mod timefmt {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        match Utc.timestamp_opt(*ts, 0).single() {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => Err(serde::ser::Error::custom("timestamp out of range")),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let dt = DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| de::Error::custom(format!("invalid RFC 3339 timestamp: {}", e)))?;
        Ok(dt.timestamp())
    }

    /// Same mapping for `Option<i64>` fields.
    pub mod opt {
        use chrono::{DateTime, TimeZone, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<i64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => match Utc.timestamp_opt(*ts, 0).single() {
                    Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
                    None => Err(serde::ser::Error::custom("timestamp out of range")),
                },
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<i64>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw {
                Some(raw) => {
                    let dt = DateTime::parse_from_rfc3339(&raw).map_err(|e| {
                        de::Error::custom(format!("invalid RFC 3339 timestamp: {}", e))
                    })?;
                    Ok(Some(dt.timestamp()))
                }
                None => Ok(None),
            }
        }
    }
}

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub zip: String,
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {} {}", self.street, self.city, self.zip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinStatus {
    Active,
    Retired,
    InStorage,
    PendingMove,
    NeedsCheck,
}

impl BinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinStatus::Active => "active",
            BinStatus::Retired => "retired",
            BinStatus::InStorage => "in_storage",
            BinStatus::PendingMove => "pending_move",
            BinStatus::NeedsCheck => "needs_check",
        }
    }

    /// Statuses eligible for route planning and default priority queries.
    pub fn is_serviceable(&self) -> bool {
        !matches!(self, BinStatus::Retired | BinStatus::InStorage)
    }
}

impl std::str::FromStr for BinStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BinStatus::Active),
            "retired" => Ok(BinStatus::Retired),
            "in_storage" => Ok(BinStatus::InStorage),
            "pending_move" => Ok(BinStatus::PendingMove),
            "needs_check" => Ok(BinStatus::NeedsCheck),
            other => Err(format!("unknown bin status: {}", other)),
        }
    }
}

/// A curbside bin. `bin_number` is unique across the fleet and assigned by
/// the store when absent on create. An address change clears `coordinates`
/// until the geocoder has produced a fresh pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bin {
    pub id: Uuid,
    pub bin_number: u32,
    pub address: Address,
    pub coordinates: Option<Coordinates>,
    pub status: BinStatus,
    pub fill_percentage: u8,
    pub checked: bool,
    pub move_requested: bool,
    #[serde(with = "timefmt::opt")]
    pub last_checked: Option<i64>,
    #[serde(with = "timefmt::opt")]
    pub last_moved: Option<i64>,
    #[serde(with = "timefmt::opt")]
    pub retired_at: Option<i64>,
    pub created_by: Option<Uuid>,
    pub retired_by: Option<Uuid>,
    #[serde(with = "timefmt")]
    pub created_at: i64,
}

/// Append-only record of a driver inspection. `fill_percentage` is absent for
/// purely incident-driven checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: Uuid,
    pub bin_id: Uuid,
    pub fill_percentage: Option<u8>,
    pub photo_url: Option<String>,
    pub checked_from: Option<String>,
    pub checked_by: Option<Uuid>,
    pub shift_id: Option<Uuid>,
    pub move_request_id: Option<Uuid>,
    #[serde(with = "timefmt")]
    pub timestamp: i64,
}

/// Append-only record of a completed relocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Move {
    pub id: Uuid,
    pub bin_id: Uuid,
    pub from_address: Address,
    pub to_address: Address,
    #[serde(with = "timefmt")]
    pub timestamp: i64,
    pub move_type: AssignmentType,
    pub shift_id: Option<Uuid>,
    pub move_request_id: Option<Uuid>,
    pub performed_by: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Ready,
    Active,
    Paused,
    Ended,
    Cancelled,
    /// Legacy value still present in stored rows; rejected on every write.
    Inactive,
}

impl ShiftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftStatus::Ready => "ready",
            ShiftStatus::Active => "active",
            ShiftStatus::Paused => "paused",
            ShiftStatus::Ended => "ended",
            ShiftStatus::Cancelled => "cancelled",
            ShiftStatus::Inactive => "inactive",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShiftStatus::Ended | ShiftStatus::Cancelled)
    }

    /// Ready, active, or paused: a shift the driver can still act on.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ShiftStatus::Ready | ShiftStatus::Active | ShiftStatus::Paused
        )
    }
}

/// A driver's working session over an ordered stop sequence.
///
/// Invariants: `pause_start_time` is non-null iff `status == Paused`;
/// `completed_bins <= total_bins`; `total_pause_seconds >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shift {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub route_id: Option<Uuid>,
    pub status: ShiftStatus,
    #[serde(with = "timefmt::opt")]
    pub start_time: Option<i64>,
    #[serde(with = "timefmt::opt")]
    pub end_time: Option<i64>,
    pub total_pause_seconds: i64,
    #[serde(with = "timefmt::opt")]
    pub pause_start_time: Option<i64>,
    pub total_bins: u32,
    pub completed_bins: u32,
    #[serde(with = "timefmt")]
    pub created_at: i64,
}

impl Shift {
    /// Working time excluding pauses, clamped to zero. `now` bounds the
    /// calculation for shifts that are still running or currently paused.
    pub fn active_duration_seconds(&self, now: i64) -> i64 {
        let start = match self.start_time {
            Some(t) => t,
            None => return 0,
        };
        let end = self.end_time.unwrap_or(now);
        let open_pause = match (self.status, self.pause_start_time) {
            (ShiftStatus::Paused, Some(pause_start)) => now.saturating_sub(pause_start),
            _ => 0,
        };
        ((end - start) - self.total_pause_seconds - open_pause).max(0)
    }

    pub fn completion_rate(&self) -> f64 {
        if self.total_bins == 0 {
            0.0
        } else {
            f64::from(self.completed_bins) / f64::from(self.total_bins)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    Collection,
    Pickup,
    Dropoff,
}

/// One ordered stop within a shift. `sequence_order` is unique per shift;
/// a completed stop always carries `completed_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftBin {
    pub id: Uuid,
    pub shift_id: Uuid,
    pub bin_id: Uuid,
    pub sequence_order: u32,
    pub is_completed: bool,
    #[serde(with = "timefmt::opt")]
    pub completed_at: Option<i64>,
    pub updated_fill_percentage: Option<u8>,
    pub stop_type: StopType,
    pub move_request_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Urgent,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveRequestStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl MoveRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveRequestStatus::Pending => "pending",
            MoveRequestStatus::InProgress => "in_progress",
            MoveRequestStatus::Completed => "completed",
            MoveRequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MoveRequestStatus::Completed | MoveRequestStatus::Cancelled
        )
    }
}

/// Physical semantics of a move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveType {
    Store,
    PickupOnly,
    Relocation,
}

/// How a move request is routed to a driver: as extra stops on a shift, or
/// as a one-off manual task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    Shift,
    Manual,
}

/// A planned relocation or removal of a bin.
///
/// Invariant: at most one of `assigned_shift_id` / `assigned_user_id` is set;
/// `status == InProgress` implies some assignment exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    pub id: Uuid,
    pub bin_id: Uuid,
    #[serde(with = "timefmt")]
    pub scheduled_date: i64,
    pub urgency: Urgency,
    pub requested_by: Option<Uuid>,
    pub status: MoveRequestStatus,
    pub original_address: Address,
    pub original_coordinates: Option<Coordinates>,
    pub new_address: Option<Address>,
    pub new_coordinates: Option<Coordinates>,
    pub move_type: MoveType,
    pub assignment_type: Option<AssignmentType>,
    pub assigned_shift_id: Option<Uuid>,
    pub assigned_user_id: Option<Uuid>,
    #[serde(with = "timefmt")]
    pub created_at: i64,
    #[serde(with = "timefmt::opt")]
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Assigned,
    Reassigned,
    Unassigned,
    Completed,
    Cancelled,
    Updated,
}

/// One append-only audit row per move-request mutation, written in the same
/// transaction as the mutation it describes. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequestHistory {
    pub id: Uuid,
    pub move_request_id: Uuid,
    pub action: HistoryAction,
    pub actor_id: Option<Uuid>,
    pub previous_status: Option<MoveRequestStatus>,
    pub new_status: Option<MoveRequestStatus>,
    pub previous_assigned_shift_id: Option<Uuid>,
    pub new_assigned_shift_id: Option<Uuid>,
    pub previous_assigned_user_id: Option<Uuid>,
    pub new_assigned_user_id: Option<Uuid>,
    pub note: Option<String>,
    #[serde(with = "timefmt")]
    pub timestamp: i64,
}

/// Latest known position per driver; exactly one row per driver after the
/// first upsert. A disconnect flips `is_connected` and preserves coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverCurrentLocation {
    pub driver_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub shift_id: Option<Uuid>,
    #[serde(with = "timefmt")]
    pub timestamp: i64,
    pub is_connected: bool,
    #[serde(with = "timefmt")]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Pending,
    Resolved,
    Dismissed,
}

/// Flag raised when a bin has gone unchecked past the staleness threshold.
/// At most one open (pending) row per bin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinCheckRecommendation {
    pub id: Uuid,
    pub bin_id: Uuid,
    pub status: RecommendationStatus,
    pub days_unchecked: Option<u32>,
    #[serde(with = "timefmt")]
    pub created_at: i64,
    #[serde(with = "timefmt::opt")]
    pub resolved_at: Option<i64>,
}

/// Driver-proposed future bin site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PotentialLocation {
    pub id: Uuid,
    pub note: String,
    pub address: Option<Address>,
    pub coordinates: Option<Coordinates>,
    pub proposed_by: Option<Uuid>,
    pub converted_to_bin: Option<Uuid>,
    #[serde(with = "timefmt")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Driver,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Driver => "driver",
            UserRole::Admin => "admin",
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "driver" => Ok(UserRole::Driver),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub role: UserRole,
    #[serde(with = "timefmt")]
    pub created_at: i64,
}

/// A registered push-notification device token. `token` is unique; a
/// re-registration moves the token to the new user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmToken {
    pub user_id: Uuid,
    pub token: String,
    pub platform: Option<String>,
    #[serde(with = "timefmt")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    ManualEnd,
    ManagerEnded,
    ManagerCancelled,
    DriverDisconnected,
    SystemTimeout,
}

/// Archival row written on every terminal shift transition. The live shift
/// row is kept; archival is additive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftHistory {
    pub id: Uuid,
    pub shift_id: Uuid,
    pub driver_id: Uuid,
    pub total_bins: u32,
    pub completed_bins: u32,
    pub completion_rate: f64,
    pub total_pause_seconds: i64,
    pub active_duration_seconds: i64,
    #[serde(with = "timefmt::opt")]
    pub start_time: Option<i64>,
    #[serde(with = "timefmt::opt")]
    pub end_time: Option<i64>,
    pub end_reason: EndReason,
    #[serde(with = "timefmt")]
    pub archived_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_serialize_as_rfc3339() {
        let check = Check {
            id: Uuid::new_v4(),
            bin_id: Uuid::new_v4(),
            fill_percentage: Some(40),
            photo_url: None,
            checked_from: Some("shift".to_string()),
            checked_by: None,
            shift_id: None,
            move_request_id: None,
            timestamp: 1_700_000_000,
        };

        let json = serde_json::to_string(&check).unwrap();
        assert!(json.contains("2023-11-14T22:13:20+00:00"));

        let parsed: Check = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.timestamp, 1_700_000_000);
    }

    #[test]
    fn enum_wire_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&BinStatus::InStorage).unwrap(),
            "\"in_storage\""
        );
        assert_eq!(
            serde_json::to_string(&MoveType::PickupOnly).unwrap(),
            "\"pickup_only\""
        );
        assert_eq!(
            serde_json::to_string(&EndReason::ManagerCancelled).unwrap(),
            "\"manager_cancelled\""
        );
    }

    #[test]
    fn password_hash_never_serialized() {
        let user = User {
            id: Uuid::new_v4(),
            email: "driver@example.com".to_string(),
            password_hash: "$2b$12$secret".to_string(),
            name: "Test Driver".to_string(),
            role: UserRole::Driver,
            created_at: 1_700_000_000,
        };

        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("driver@example.com"));
    }

    #[test]
    fn active_duration_subtracts_pauses() {
        let shift = Shift {
            id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            route_id: None,
            status: ShiftStatus::Ended,
            start_time: Some(1000),
            end_time: Some(2800),
            total_pause_seconds: 300,
            pause_start_time: None,
            total_bins: 4,
            completed_bins: 2,
            created_at: 900,
        };

        assert_eq!(shift.active_duration_seconds(3000), 1500);
        assert_eq!(shift.completion_rate(), 0.5);
    }

    #[test]
    fn active_duration_counts_open_pause() {
        let shift = Shift {
            id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            route_id: None,
            status: ShiftStatus::Paused,
            start_time: Some(1000),
            end_time: None,
            total_pause_seconds: 0,
            pause_start_time: Some(1600),
            total_bins: 1,
            completed_bins: 0,
            created_at: 900,
        };

        // 1000..2000 elapsed, paused since 1600: 600 working seconds.
        assert_eq!(shift.active_duration_seconds(2000), 600);
    }

    #[test]
    fn active_duration_never_negative() {
        let shift = Shift {
            id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            route_id: None,
            status: ShiftStatus::Paused,
            start_time: Some(1000),
            end_time: None,
            total_pause_seconds: 5000,
            pause_start_time: Some(1001),
            total_bins: 0,
            completed_bins: 0,
            created_at: 900,
        };

        assert_eq!(shift.active_duration_seconds(1200), 0);
        assert_eq!(shift.completion_rate(), 0.0);
    }
}
