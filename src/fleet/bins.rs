//! Bin lifecycle outside shifts: creation, updates, retirement, and the
//! driver-proposed potential locations.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::errors::{FleetError, Result};
use crate::fleet::models::{
    Address, Bin, BinStatus, Coordinates, PotentialLocation,
};
use crate::fleet::store::NewBin;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBinRequest {
    pub bin_number: Option<u32>,
    pub address: Address,
    pub coordinates: Option<Coordinates>,
    pub fill_percentage: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBinRequest {
    pub address: Option<Address>,
    pub coordinates: Option<Coordinates>,
    pub fill_percentage: Option<u8>,
    pub status: Option<BinStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposalAction {
    Retire,
    Store,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetireBinRequest {
    pub disposal_action: DisposalAction,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposeLocationRequest {
    pub note: String,
    pub address: Option<Address>,
    pub coordinates: Option<Coordinates>,
}

fn validate_address(address: &Address) -> Result<()> {
    if address.street.trim().is_empty() || address.city.trim().is_empty() {
        return Err(FleetError::validation("address needs a street and a city"));
    }
    Ok(())
}

/// Best-effort forward geocode; a provider failure leaves the coordinates
/// empty and is only logged.
async fn geocode_best_effort(ctx: &ServiceContext, address: &Address) -> Option<Coordinates> {
    let client = ctx.geocode.as_ref()?;
    match client.geocode(address).await {
        Ok(coords) => coords,
        Err(err) => {
            tracing::warn!(error = %err, "geocoding failed, bin left without coordinates");
            None
        }
    }
}

pub async fn create_bin(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    req: CreateBinRequest,
) -> Result<Bin> {
    validate_address(&req.address)?;
    if let Some(fill) = req.fill_percentage {
        if fill > 100 {
            return Err(FleetError::validation("fill_percentage must be 0-100"));
        }
    }

    let coordinates = match req.coordinates {
        Some(c) => Some(c),
        None => geocode_best_effort(ctx, &req.address).await,
    };

    let now = chrono::Utc::now().timestamp();
    ctx.store.transaction(|tx| {
        tx.insert_bin(
            NewBin {
                bin_number: req.bin_number,
                address: req.address.clone(),
                coordinates,
                fill_percentage: req.fill_percentage.unwrap_or(0),
                created_by: Some(actor),
            },
            now,
        )
    })
}

pub async fn update_bin(
    ctx: &Arc<ServiceContext>,
    bin_id: Uuid,
    req: UpdateBinRequest,
) -> Result<Bin> {
    if let Some(status) = req.status {
        if matches!(status, BinStatus::Retired) {
            return Err(FleetError::validation(
                "retirement goes through the retire operation",
            ));
        }
    }
    if let Some(address) = &req.address {
        validate_address(address)?;
    }
    if let Some(fill) = req.fill_percentage {
        if fill > 100 {
            return Err(FleetError::validation("fill_percentage must be 0-100"));
        }
    }

    // An address change invalidates the old coordinates; try for fresh ones
    // before the write so the transaction never waits on the network.
    let regeocoded = match (&req.address, &req.coordinates) {
        (Some(address), None) => geocode_best_effort(ctx, address).await,
        _ => None,
    };

    ctx.store.transaction(|tx| {
        let bin = tx.bin_mut(bin_id)?;
        if let Some(address) = req.address.clone() {
            if address != bin.address {
                bin.address = address;
                bin.coordinates = regeocoded;
            }
        }
        if let Some(coords) = req.coordinates {
            bin.coordinates = Some(coords);
        }
        if let Some(fill) = req.fill_percentage {
            bin.fill_percentage = fill;
        }
        if let Some(status) = req.status {
            bin.status = status;
        }
        Ok(bin.clone())
    })
}

/// active → retired or active → in_storage; anything else is not retirable
/// and reads as absent.
pub fn retire_bin(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    bin_id: Uuid,
    req: RetireBinRequest,
) -> Result<Bin> {
    retire_bin_at(ctx, actor, bin_id, req, chrono::Utc::now().timestamp())
}

pub fn retire_bin_at(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    bin_id: Uuid,
    req: RetireBinRequest,
    now: i64,
) -> Result<Bin> {
    let bin = ctx.store.transaction(|tx| {
        let bin = tx.bin_mut(bin_id)?;
        if bin.status != BinStatus::Active {
            return Err(FleetError::not_found(format!(
                "no active bin {} to retire",
                bin_id
            )));
        }
        bin.status = match req.disposal_action {
            DisposalAction::Retire => BinStatus::Retired,
            DisposalAction::Store => BinStatus::InStorage,
        };
        bin.retired_at = Some(now);
        bin.retired_by = Some(actor);
        Ok(bin.clone())
    })?;

    tracing::info!(
        bin_id = %bin.id,
        bin_number = bin.bin_number,
        action = ?req.disposal_action,
        reason = req.reason.as_deref().unwrap_or(""),
        "bin retired"
    );
    Ok(bin)
}

pub fn delete_bin(ctx: &Arc<ServiceContext>, bin_id: Uuid) -> Result<()> {
    ctx.store.transaction(|tx| tx.delete_bin(bin_id))
}

// ---- potential locations ----

pub fn propose_location(
    ctx: &Arc<ServiceContext>,
    proposer: Uuid,
    req: ProposeLocationRequest,
) -> Result<PotentialLocation> {
    if req.note.trim().is_empty() {
        return Err(FleetError::validation("a proposal needs a note"));
    }
    let now = chrono::Utc::now().timestamp();
    ctx.store.transaction(|tx| {
        let location = PotentialLocation {
            id: Uuid::new_v4(),
            note: req.note.clone(),
            address: req.address.clone(),
            coordinates: req.coordinates,
            proposed_by: Some(proposer),
            converted_to_bin: None,
            created_at: now,
        };
        tx.insert_potential_location(location.clone());
        Ok(location)
    })
}

/// Turns a proposal into a real bin, stamping the back-reference.
pub async fn convert_location(
    ctx: &Arc<ServiceContext>,
    actor: Uuid,
    location_id: Uuid,
) -> Result<Bin> {
    let (address, mut coordinates) = ctx.store.transaction(|tx| {
        let location = tx.potential_location_mut(location_id)?;
        if location.converted_to_bin.is_some() {
            return Err(FleetError::conflict("proposal was already converted"));
        }
        let address = location.address.clone().ok_or_else(|| {
            FleetError::validation("proposal has no address to build a bin from")
        })?;
        Ok((address, location.coordinates))
    })?;

    if coordinates.is_none() {
        coordinates = geocode_best_effort(ctx, &address).await;
    }

    let now = chrono::Utc::now().timestamp();
    ctx.store.transaction(|tx| {
        let bin = tx.insert_bin(
            NewBin {
                bin_number: None,
                address: address.clone(),
                coordinates,
                fill_percentage: 0,
                created_by: Some(actor),
            },
            now,
        )?;
        tx.potential_location_mut(location_id)?.converted_to_bin = Some(bin.id);
        Ok(bin)
    })
}
