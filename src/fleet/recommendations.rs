//! Check recommendations: flags for bins that have gone unchecked too long.
//!
//! The sweep keeps at most one pending row per bin. Completing any check on
//! the bin resolves its open recommendation; managers can dismiss one
//! instead.

use std::sync::Arc;

use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::errors::{FleetError, Result};
use crate::fleet::models::{BinCheckRecommendation, RecommendationStatus};
use crate::fleet::priority::days_since_check;

const SECONDS_PER_DAY: i64 = 86_400;

/// Flags every serviceable bin unchecked for at least `threshold_days`
/// (or never checked and older than the threshold). Returns how many new
/// recommendations were created.
pub fn generate(ctx: &Arc<ServiceContext>) -> Result<usize> {
    generate_at(
        ctx,
        ctx.config.check_recommendation_days,
        chrono::Utc::now().timestamp(),
    )
}

pub fn generate_at(ctx: &Arc<ServiceContext>, threshold_days: u32, now: i64) -> Result<usize> {
    let created = ctx.store.transaction(|tx| {
        let mut created = 0usize;
        for bin in tx.bins() {
            if !bin.status.is_serviceable() {
                continue;
            }
            let stale = match days_since_check(&bin, now) {
                Some(days) => days >= i64::from(threshold_days),
                // Never checked: stale once the bin itself is old enough.
                None => (now - bin.created_at) / SECONDS_PER_DAY >= i64::from(threshold_days),
            };
            if !stale || tx.open_recommendation_for_bin(bin.id).is_some() {
                continue;
            }
            tx.insert_recommendation(BinCheckRecommendation {
                id: Uuid::new_v4(),
                bin_id: bin.id,
                status: RecommendationStatus::Pending,
                days_unchecked: days_since_check(&bin, now).map(|d| d as u32),
                created_at: now,
                resolved_at: None,
            });
            created += 1;
        }
        Ok(created)
    })?;

    if created > 0 {
        tracing::info!(created, "check recommendations generated");
    }
    Ok(created)
}

pub fn dismiss(ctx: &Arc<ServiceContext>, rec_id: Uuid) -> Result<BinCheckRecommendation> {
    dismiss_at(ctx, rec_id, chrono::Utc::now().timestamp())
}

pub fn dismiss_at(
    ctx: &Arc<ServiceContext>,
    rec_id: Uuid,
    now: i64,
) -> Result<BinCheckRecommendation> {
    ctx.store.transaction(|tx| {
        let rec = tx.recommendation_mut(rec_id)?;
        if rec.status != RecommendationStatus::Pending {
            return Err(FleetError::validation(
                "only pending recommendations can be dismissed",
            ));
        }
        rec.status = RecommendationStatus::Dismissed;
        rec.resolved_at = Some(now);
        Ok(rec.clone())
    })
}

/// Spawns the daily sweep.
pub fn spawn_sweeper(ctx: Arc<ServiceContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
        loop {
            interval.tick().await;
            if let Err(err) = generate(&ctx) {
                tracing::warn!(error = %err, "check recommendation sweep failed");
            }
        }
    })
}
