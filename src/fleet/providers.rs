//! Clients for the external collaborators: road snapping, reverse geocoding,
//! and push notification delivery.
//!
//! Every provider is optional. A missing key disables the feature and a
//! provider failure is reported to the caller, who logs it and continues;
//! nothing in this module may abort the mutation that triggered the call.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fleet::errors::{FleetError, Result};
use crate::fleet::models::{Address, Coordinates};
use crate::metrics;

pub const SNAP_TIMEOUT: Duration = Duration::from_secs(10);
pub const SNAP_BATCH_LIMIT: usize = 100;
const GEOCODE_TIMEOUT: Duration = Duration::from_secs(10);
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

// ---- road snapping ----

#[derive(Debug, Deserialize)]
struct SnapResponse {
    #[serde(default, rename = "snappedPoints")]
    snapped_points: Vec<SnappedPoint>,
}

#[derive(Debug, Deserialize)]
struct SnappedPoint {
    location: SnapLocation,
    #[serde(rename = "originalIndex")]
    original_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SnapLocation {
    latitude: f64,
    longitude: f64,
}

/// Batch coordinate → road-coordinate client.
pub struct SnapClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SnapClient {
    pub fn new(api_key: String) -> Result<SnapClient> {
        Self::with_base_url(api_key, "https://roads.googleapis.com/v1/snapToRoads".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Result<SnapClient> {
        let http = reqwest::Client::builder()
            .timeout(SNAP_TIMEOUT)
            .build()
            .map_err(|e| FleetError::External {
                provider: "snap",
                detail: e.to_string(),
            })?;
        Ok(SnapClient {
            http,
            base_url,
            api_key,
        })
    }

    /// Snaps up to [`SNAP_BATCH_LIMIT`] points per provider call. The result
    /// always has the same length as the input: points the provider could
    /// not place fall back to their originals.
    pub async fn snap(&self, points: &[Coordinates]) -> Result<Vec<Coordinates>> {
        let mut out = Vec::with_capacity(points.len());
        for chunk in points.chunks(SNAP_BATCH_LIMIT) {
            out.extend(self.snap_chunk(chunk).await?);
        }
        Ok(out)
    }

    async fn snap_chunk(&self, points: &[Coordinates]) -> Result<Vec<Coordinates>> {
        let path = points
            .iter()
            .map(|p| format!("{:.6},{:.6}", p.latitude, p.longitude))
            .collect::<Vec<_>>()
            .join("|");

        let response = self
            .http
            .get(&self.base_url)
            .query(&[("path", path.as_str()), ("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| {
                metrics::SNAP_REQUESTS.with_label_values(&["error"]).inc();
                FleetError::External {
                    provider: "snap",
                    detail: e.to_string(),
                }
            })?;

        if !response.status().is_success() {
            metrics::SNAP_REQUESTS.with_label_values(&["error"]).inc();
            return Err(FleetError::External {
                provider: "snap",
                detail: format!("status {}", response.status()),
            });
        }

        let body: SnapResponse = response.json().await.map_err(|e| {
            metrics::SNAP_REQUESTS.with_label_values(&["error"]).inc();
            FleetError::External {
                provider: "snap",
                detail: format!("bad response: {}", e),
            }
        })?;
        metrics::SNAP_REQUESTS.with_label_values(&["ok"]).inc();

        // Start from the originals so unplaced points survive.
        let mut snapped: Vec<Coordinates> = points.to_vec();
        for point in body.snapped_points {
            if let Some(idx) = point.original_index {
                if idx < snapped.len() {
                    snapped[idx] = Coordinates {
                        latitude: point.location.latitude,
                        longitude: point.location.longitude,
                    };
                }
            }
        }
        Ok(snapped)
    }
}

// ---- geocoding ----

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: GeocodeGeometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeGeometry {
    location: GeocodePoint,
}

#[derive(Debug, Deserialize)]
struct GeocodePoint {
    lat: f64,
    lng: f64,
}

/// Address → coordinates client.
pub struct GeocodeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeocodeClient {
    pub fn new(api_key: String) -> Result<GeocodeClient> {
        Self::with_base_url(
            api_key,
            "https://maps.googleapis.com/maps/api/geocode/json".to_string(),
        )
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Result<GeocodeClient> {
        let http = reqwest::Client::builder()
            .timeout(GEOCODE_TIMEOUT)
            .build()
            .map_err(|e| FleetError::External {
                provider: "geocode",
                detail: e.to_string(),
            })?;
        Ok(GeocodeClient {
            http,
            base_url,
            api_key,
        })
    }

    pub async fn geocode(&self, address: &Address) -> Result<Option<Coordinates>> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("address", address.to_string().as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FleetError::External {
                provider: "geocode",
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FleetError::External {
                provider: "geocode",
                detail: format!("status {}", response.status()),
            });
        }

        let body: GeocodeResponse = response.json().await.map_err(|e| FleetError::External {
            provider: "geocode",
            detail: format!("bad response: {}", e),
        })?;

        Ok(body.results.first().map(|r| Coordinates {
            latitude: r.geometry.location.lat,
            longitude: r.geometry.location.lng,
        }))
    }
}

// ---- push notifications ----

/// Payload of a push message; the client fetches the authoritative object
/// over HTTP using the carried ids.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushPayload {
    RouteAssigned { shift_id: Uuid, total_bins: u32 },
    ShiftUpdate { shift_id: Uuid, status: String },
    MoveRequestAssigned { move_request_id: Uuid },
}

impl PushPayload {
    fn title(&self) -> &'static str {
        match self {
            PushPayload::RouteAssigned { .. } => "New route assigned",
            PushPayload::ShiftUpdate { .. } => "Shift updated",
            PushPayload::MoveRequestAssigned { .. } => "New move request",
        }
    }
}

/// Outcome classification the caller uses to prune dead tokens.
#[derive(Debug)]
pub enum PushError {
    /// The token is gone; drop it from the registry.
    TokenGone,
    Other(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushCredentials {
    #[serde(default)]
    pub project_id: Option<String>,
    pub server_key: String,
}

impl PushCredentials {
    pub fn from_file(path: &str) -> Result<PushCredentials> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::internal(format!("push credentials file: {}", e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| FleetError::internal(format!("push credentials parse: {}", e)))
    }

    pub fn from_base64(encoded: &str) -> Result<PushCredentials> {
        let raw = base64::decode(encoded)
            .map_err(|e| FleetError::internal(format!("push credentials decode: {}", e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| FleetError::internal(format!("push credentials parse: {}", e)))
    }
}

/// Send-to-token push client. Delivery is best-effort; the caller never
/// fails a transaction on a push error.
pub struct PushClient {
    http: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl PushClient {
    pub fn new(credentials: PushCredentials) -> Result<PushClient> {
        Self::with_endpoint(credentials, "https://fcm.googleapis.com/fcm/send".to_string())
    }

    pub fn with_endpoint(credentials: PushCredentials, endpoint: String) -> Result<PushClient> {
        let http = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .map_err(|e| FleetError::External {
                provider: "push",
                detail: e.to_string(),
            })?;
        Ok(PushClient {
            http,
            endpoint,
            server_key: credentials.server_key,
        })
    }

    pub async fn send(&self, token: &str, payload: &PushPayload) -> std::result::Result<(), PushError> {
        let body = serde_json::json!({
            "to": token,
            "notification": { "title": payload.title() },
            "data": payload,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                metrics::PUSH_DISPATCHES.with_label_values(&["error"]).inc();
                PushError::Other(e.to_string())
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            metrics::PUSH_DISPATCHES
                .with_label_values(&["token_gone"])
                .inc();
            return Err(PushError::TokenGone);
        }
        if !status.is_success() {
            metrics::PUSH_DISPATCHES.with_label_values(&["error"]).inc();
            return Err(PushError::Other(format!("status {}", status)));
        }
        metrics::PUSH_DISPATCHES.with_label_values(&["ok"]).inc();
        Ok(())
    }
}
