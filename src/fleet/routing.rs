//! Route ordering over geographic stops.
//!
//! Nearest-neighbor is deliberately simple: cheap, explainable, and adequate
//! for route sizes in the hundreds. Distances are great-circle; road-graph
//! accuracy is a non-goal.

use crate::fleet::models::{Bin, Coordinates};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in kilometers.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

pub fn haversine_meters(a: Coordinates, b: Coordinates) -> f64 {
    haversine_km(a, b) * 1000.0
}

#[derive(Debug, Clone)]
pub struct OptimizedRoute {
    pub bins: Vec<Bin>,
    pub total_km: f64,
}

/// Reorders `bins` by repeatedly visiting the nearest remaining stop from the
/// cursor, starting at `start`. Ties pick the lowest original index, so the
/// result is deterministic. Bins without coordinates cannot be placed and are
/// appended at the tail in their original order.
pub fn nearest_neighbor(start: Coordinates, bins: Vec<Bin>) -> OptimizedRoute {
    let (mut placeable, tail): (Vec<Bin>, Vec<Bin>) =
        bins.into_iter().partition(|b| b.coordinates.is_some());

    let mut ordered = Vec::with_capacity(placeable.len() + tail.len());
    let mut cursor = start;
    let mut total_km = 0.0;

    while !placeable.is_empty() {
        let mut best_idx = 0;
        let mut best_dist = f64::INFINITY;
        for (idx, bin) in placeable.iter().enumerate() {
            let coords = match bin.coordinates {
                Some(c) => c,
                None => continue,
            };
            let dist = haversine_km(cursor, coords);
            if dist < best_dist {
                best_dist = dist;
                best_idx = idx;
            }
        }
        let next = placeable.remove(best_idx);
        if let Some(coords) = next.coordinates {
            cursor = coords;
        }
        total_km += best_dist;
        ordered.push(next);
    }

    ordered.extend(tail);
    OptimizedRoute {
        bins: ordered,
        total_km,
    }
}

/// Total length of visiting `bins` in the given order from `start`, skipping
/// coordinate-less stops.
pub fn route_length_km(start: Coordinates, bins: &[Bin]) -> f64 {
    let mut cursor = start;
    let mut total = 0.0;
    for bin in bins {
        if let Some(coords) = bin.coordinates {
            total += haversine_km(cursor, coords);
            cursor = coords;
        }
    }
    total
}
