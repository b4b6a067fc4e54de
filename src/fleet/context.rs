//! Shared state every handler and service receives.

use std::sync::Arc;

use uuid::Uuid;

use crate::fleet::config::Config;
use crate::fleet::errors::Result;
use crate::fleet::location::LocationFilter;
use crate::fleet::providers::{
    GeocodeClient, PushClient, PushCredentials, PushError, PushPayload, SnapClient,
};
use crate::fleet::snap_cache::RoadSnapCache;
use crate::fleet::store::Store;
use crate::web::ws::HubHandle;

/// Container for the store, the hub handle, the providers, and the location
/// pipeline state. Built once at startup and shared behind an `Arc`.
pub struct ServiceContext {
    pub config: Config,
    pub store: Store,
    pub hub: HubHandle,
    pub location_filter: LocationFilter,
    pub snap_cache: Arc<RoadSnapCache>,
    pub snap: Option<SnapClient>,
    pub geocode: Option<GeocodeClient>,
    pub push: Option<PushClient>,
}

impl ServiceContext {
    pub fn new(config: Config, hub: HubHandle) -> Result<ServiceContext> {
        config.validate()?;
        let store = Store::open(&config.database_url)?;

        let snap = match &config.roads_api_key {
            Some(key) => Some(SnapClient::new(key.clone())?),
            None => None,
        };
        let geocode = match &config.geocode_api_key {
            Some(key) => Some(GeocodeClient::new(key.clone())?),
            None => None,
        };
        let push = Self::push_client(&config)?;
        if push.is_none() {
            tracing::info!("push credentials absent, notifications disabled");
        }

        Ok(ServiceContext {
            config,
            store,
            hub,
            location_filter: LocationFilter::new(),
            snap_cache: Arc::new(RoadSnapCache::new()),
            snap,
            geocode,
            push,
        })
    }

    fn push_client(config: &Config) -> Result<Option<PushClient>> {
        let credentials = if let Some(path) = &config.firebase_credentials_file {
            Some(PushCredentials::from_file(path)?)
        } else if let Some(encoded) = &config.firebase_credentials_base64 {
            Some(PushCredentials::from_base64(encoded)?)
        } else {
            None
        };
        match credentials {
            Some(c) => Ok(Some(PushClient::new(c)?)),
            None => Ok(None),
        }
    }

    /// In-process context with a detached hub for tests.
    pub fn for_tests() -> Arc<ServiceContext> {
        let ctx = ServiceContext::new(Config::for_tests(), HubHandle::detached())
            .unwrap_or_else(|e| panic!("test context: {}", e));
        Arc::new(ctx)
    }
}

/// Best-effort push to every registered token of a user. Runs detached; a
/// provider failure never reaches the caller. Tokens the provider reports
/// gone are pruned.
pub fn dispatch_push(ctx: &Arc<ServiceContext>, user_id: Uuid, payload: PushPayload) {
    if ctx.push.is_none() {
        return;
    }
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let client = match &ctx.push {
            Some(client) => client,
            None => return,
        };
        let tokens = ctx.store.read(|s| s.fcm_tokens_for_user(user_id));
        for entry in tokens {
            match client.send(&entry.token, &payload).await {
                Ok(()) => {}
                Err(PushError::TokenGone) => {
                    tracing::info!(user_id = %user_id, "pruning dead push token");
                    let _ = ctx.store.transaction(|tx| {
                        tx.remove_fcm_token(&entry.token);
                        Ok(())
                    });
                }
                Err(PushError::Other(detail)) => {
                    tracing::warn!(user_id = %user_id, detail = %detail, "push dispatch failed");
                }
            }
        }
    });
}
