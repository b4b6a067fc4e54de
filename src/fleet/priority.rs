//! Bin priority scoring.
//!
//! A pure additive score over four bands: move-request urgency, fill level,
//! staleness since the last check, and an open check recommendation. Scores
//! are recomputed on every query and never persisted; ordering ties break on
//! ascending bin number so results are stable.

use std::str::FromStr;

use serde::Serialize;

use crate::fleet::models::{
    Bin, BinCheckRecommendation, BinStatus, MoveRequest, RecommendationStatus, Urgency,
};
use crate::fleet::store::StoreState;

const SECONDS_PER_DAY: i64 = 86_400;

/// Candidate predicate applied before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityFilter {
    All,
    NextMoveRequest,
    LongestUnchecked,
    HighFill,
    HasCheckRecommendation,
}

impl FromStr for PriorityFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(PriorityFilter::All),
            "next_move_request" => Ok(PriorityFilter::NextMoveRequest),
            "longest_unchecked" => Ok(PriorityFilter::LongestUnchecked),
            "high_fill" => Ok(PriorityFilter::HighFill),
            "has_check_recommendation" => Ok(PriorityFilter::HasCheckRecommendation),
            other => Err(format!("unknown priority filter: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioritySort {
    Priority,
    BinNumber,
    Fill,
    DaysSinceCheck,
}

impl FromStr for PrioritySort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(PrioritySort::Priority),
            "bin_number" => Ok(PrioritySort::BinNumber),
            "fill" => Ok(PrioritySort::Fill),
            "days_since_check" => Ok(PrioritySort::DaysSinceCheck),
            other => Err(format!("unknown priority sort: {}", other)),
        }
    }
}

/// A scored candidate as returned by the priority query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredBin {
    #[serde(flatten)]
    pub bin: Bin,
    pub priority_score: f64,
    pub days_since_check: Option<i64>,
    pub open_move_request_id: Option<uuid::Uuid>,
}

/// Deterministic priority score; higher is more urgent.
pub fn score(
    bin: &Bin,
    move_request: Option<&MoveRequest>,
    recommendation: Option<&BinCheckRecommendation>,
    now: i64,
) -> f64 {
    let mut total = 0.0;

    if let Some(mr) = move_request {
        total += match mr.urgency {
            Urgency::Urgent => 1000.0,
            Urgency::Scheduled => {
                let days_out = (mr.scheduled_date - now) as f64 / SECONDS_PER_DAY as f64;
                if days_out <= 1.0 {
                    800.0
                } else if days_out <= 3.0 {
                    600.0
                } else if days_out <= 7.0 {
                    400.0
                } else {
                    100.0
                }
            }
        };
    }

    if bin.fill_percentage >= 80 {
        total += 300.0;
    } else if bin.fill_percentage >= 60 {
        total += 150.0;
    } else if bin.fill_percentage >= 40 {
        total += 50.0;
    }

    match days_since_check(bin, now) {
        None => total += 1000.0,
        Some(days) => {
            if days >= 30 {
                total += 800.0;
            } else if days >= 14 {
                total += 400.0;
            } else if days >= 7 {
                total += 200.0;
            }
        }
    }

    if recommendation.map_or(false, |r| r.status == RecommendationStatus::Pending) {
        total += 100.0;
    }

    total
}

/// Whole days since the last check, or None for a never-checked bin.
pub fn days_since_check(bin: &Bin, now: i64) -> Option<i64> {
    bin.last_checked
        .map(|checked| (now - checked).max(0) / SECONDS_PER_DAY)
}

/// Loads candidates by status, applies the filter predicate, scores, sorts
/// by the requested key (bin number ascending breaks every tie), and
/// truncates to `limit`.
pub fn prioritized_bins(
    state: &StoreState,
    status: BinStatus,
    filter: PriorityFilter,
    sort: PrioritySort,
    limit: usize,
    now: i64,
) -> Vec<ScoredBin> {
    let mut scored: Vec<ScoredBin> = state
        .bins_by_status(status)
        .into_iter()
        .filter_map(|bin| {
            let move_request = state.open_move_request_for_bin(bin.id);
            let recommendation = state.open_recommendation_for_bin(bin.id);

            let keep = match filter {
                PriorityFilter::All => true,
                PriorityFilter::NextMoveRequest => move_request.is_some(),
                PriorityFilter::LongestUnchecked => {
                    days_since_check(&bin, now).map_or(true, |d| d >= 7)
                }
                PriorityFilter::HighFill => bin.fill_percentage >= 60,
                PriorityFilter::HasCheckRecommendation => recommendation.is_some(),
            };
            if !keep {
                return None;
            }

            let priority_score = score(
                &bin,
                move_request.as_ref(),
                recommendation.as_ref(),
                now,
            );
            let days = days_since_check(&bin, now);
            Some(ScoredBin {
                days_since_check: days,
                open_move_request_id: move_request.map(|mr| mr.id),
                priority_score,
                bin,
            })
        })
        .collect();

    match sort {
        PrioritySort::Priority => scored.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.bin.bin_number.cmp(&b.bin.bin_number))
        }),
        PrioritySort::BinNumber => scored.sort_by_key(|s| s.bin.bin_number),
        PrioritySort::Fill => scored.sort_by(|a, b| {
            b.bin
                .fill_percentage
                .cmp(&a.bin.fill_percentage)
                .then(a.bin.bin_number.cmp(&b.bin.bin_number))
        }),
        PrioritySort::DaysSinceCheck => scored.sort_by(|a, b| {
            // Never-checked sorts first, then oldest check first.
            match (a.days_since_check, b.days_since_check) {
                (None, None) => a.bin.bin_number.cmp(&b.bin.bin_number),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(da), Some(db)) => {
                    db.cmp(&da).then(a.bin.bin_number.cmp(&b.bin.bin_number))
                }
            }
        }),
    }

    scored.truncate(limit);
    scored
}
