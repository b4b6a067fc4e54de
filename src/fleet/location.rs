//! Driver GPS ingress: accuracy and movement gates, road snapping, and the
//! per-driver location upsert.
//!
//! The stored row always carries the original coordinates for audit; the
//! broadcast to managers carries the snapped ones. A snap failure falls
//! through to the originals and never blocks the ingest path.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::errors::Result;
use crate::fleet::models::{timefmt, Coordinates, DriverCurrentLocation, UserRole};
use crate::fleet::routing::haversine_meters;
use crate::fleet::snap_cache::RoadSnapCache;
use crate::metrics;
use crate::web::ws::ServerFrame;

/// Samples worse than this are noise and dropped outright.
pub const MAX_ACCURACY_M: f64 = 100.0;
/// Samples at or under this are treated as already on-road; no snap.
pub const ON_ROAD_ACCURACY_M: f64 = 15.0;
/// Minimum movement for the delta gate.
pub const MIN_DELTA_M: f64 = 1.0;
/// Time fallback: a stationary driver still broadcasts after this long.
pub const BROADCAST_FALLBACK_MS: i64 = 2_000;

/// Wire shape of a `location_update` frame's data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub shift_id: Option<Uuid>,
    #[serde(with = "timefmt")]
    pub timestamp: i64,
}

impl LocationSample {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Snapshot broadcast to managers after an accepted sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverLocationUpdate {
    pub driver_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub shift_id: Option<Uuid>,
    pub is_connected: bool,
    #[serde(with = "timefmt")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Accuracy above [`MAX_ACCURACY_M`].
    DroppedAccuracy,
    /// Too close in both space and time to the last accepted sample.
    DroppedStationary,
    Accepted {
        snap_candidate: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct GateState {
    last: Coordinates,
    last_broadcast_ms: i64,
}

/// Per-driver significant-position gate. State advances only on accepted
/// samples.
#[derive(Default)]
pub struct LocationFilter {
    gates: Mutex<HashMap<Uuid, GateState>>,
}

impl LocationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, driver_id: Uuid, sample: &LocationSample, now_ms: i64) -> GateOutcome {
        let accuracy = sample.accuracy.unwrap_or(0.0);
        if accuracy > MAX_ACCURACY_M {
            metrics::LOCATION_SAMPLES
                .with_label_values(&["dropped_accuracy"])
                .inc();
            return GateOutcome::DroppedAccuracy;
        }
        let snap_candidate = accuracy > ON_ROAD_ACCURACY_M;

        let mut gates = self.gates.lock();
        let position = sample.coordinates();

        if let Some(state) = gates.get(&driver_id) {
            let moved = haversine_meters(state.last, position);
            let elapsed_ms = now_ms - state.last_broadcast_ms;
            if moved < MIN_DELTA_M && elapsed_ms <= BROADCAST_FALLBACK_MS {
                metrics::LOCATION_SAMPLES
                    .with_label_values(&["dropped_stationary"])
                    .inc();
                return GateOutcome::DroppedStationary;
            }
        }

        gates.insert(
            driver_id,
            GateState {
                last: position,
                last_broadcast_ms: now_ms,
            },
        );
        metrics::LOCATION_SAMPLES
            .with_label_values(&["accepted"])
            .inc();
        GateOutcome::Accepted { snap_candidate }
    }

    /// Clears the gate so the next sample after a reconnect is accepted.
    pub fn forget(&self, driver_id: Uuid) {
        self.gates.lock().remove(&driver_id);
    }
}

/// Full ingress path for one sample: gate, snap, persist originals,
/// broadcast snapped. Returns the broadcast payload when one was emitted.
pub async fn ingest(
    ctx: &ServiceContext,
    driver_id: Uuid,
    sample: LocationSample,
) -> Result<Option<DriverLocationUpdate>> {
    let now = chrono::Utc::now();
    let outcome = ctx
        .location_filter
        .evaluate(driver_id, &sample, now.timestamp_millis());

    let snap_candidate = match outcome {
        GateOutcome::Accepted { snap_candidate } => snap_candidate,
        GateOutcome::DroppedAccuracy | GateOutcome::DroppedStationary => return Ok(None),
    };

    let snapped = if snap_candidate {
        snap_point(ctx, sample.coordinates()).await
    } else {
        sample.coordinates()
    };

    // Audit row keeps the original fix.
    ctx.store.transaction(|tx| {
        tx.upsert_driver_location(DriverCurrentLocation {
            driver_id,
            latitude: sample.latitude,
            longitude: sample.longitude,
            heading: sample.heading,
            speed: sample.speed,
            accuracy: sample.accuracy,
            shift_id: sample.shift_id,
            timestamp: sample.timestamp,
            is_connected: true,
            updated_at: now.timestamp(),
        });
        Ok(())
    })?;

    let update = DriverLocationUpdate {
        driver_id,
        latitude: snapped.latitude,
        longitude: snapped.longitude,
        heading: sample.heading,
        speed: sample.speed,
        shift_id: sample.shift_id,
        is_connected: true,
        timestamp: sample.timestamp,
    };
    ctx.hub.send_to_role(
        UserRole::Admin,
        &ServerFrame::DriverLocationUpdate {
            data: update.clone(),
        },
    );
    Ok(Some(update))
}

/// Cache-first snap of a single live point; any provider trouble falls back
/// to the original coordinates.
async fn snap_point(ctx: &ServiceContext, point: Coordinates) -> Coordinates {
    let client = match &ctx.snap {
        Some(client) => client,
        None => return point,
    };

    let path = [point];
    let signature = RoadSnapCache::route_signature(&path);
    if let Some(cached) = ctx.snap_cache.get(&signature) {
        if let Some(first) = cached.first() {
            return *first;
        }
    }

    match client.snap(&path).await {
        Ok(snapped) => {
            let result = snapped.first().copied().unwrap_or(point);
            ctx.snap_cache.insert(signature, snapped);
            result
        }
        Err(err) => {
            tracing::warn!(error = %err, "road snap failed, keeping original coordinates");
            point
        }
    }
}

/// Marks the driver disconnected, preserving the last known coordinates, and
/// resets the movement gate.
pub fn disconnect(ctx: &ServiceContext, driver_id: Uuid) -> Result<()> {
    ctx.location_filter.forget(driver_id);
    let now = chrono::Utc::now().timestamp();
    ctx.store.transaction(|tx| {
        if let Some(mut row) = tx.driver_location(driver_id) {
            row.is_connected = false;
            row.updated_at = now;
            tx.upsert_driver_location(row);
        }
        Ok(())
    })
}
