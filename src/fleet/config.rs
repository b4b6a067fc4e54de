//! Environment-driven server configuration.

use clap::Parser;

use crate::fleet::errors::{FleetError, Result};

/// All runtime configuration, read from flags or environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "binhaul", version, about = "Dispatch and shift coordination server")]
pub struct Config {
    /// Store backend URL. The `memory:` scheme selects the in-process store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// HMAC secret for signing API tokens; at least 32 bytes.
    #[arg(long, env = "APP_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Push credentials as a JSON file path. Push is disabled when neither
    /// this nor the base64 variant is set.
    #[arg(long, env = "FIREBASE_CREDENTIALS_FILE")]
    pub firebase_credentials_file: Option<String>,

    /// Push credentials as base64-encoded JSON.
    #[arg(long, env = "FIREBASE_CREDENTIALS_BASE64", hide_env_values = true)]
    pub firebase_credentials_base64: Option<String>,

    /// Road-snap provider key; snapping is disabled when absent.
    #[arg(long, env = "ROADS_API_KEY", hide_env_values = true)]
    pub roads_api_key: Option<String>,

    /// Geocoding provider key; geocoding is disabled when absent.
    #[arg(long, env = "GEOCODE_API_KEY", hide_env_values = true)]
    pub geocode_api_key: Option<String>,

    /// Days without a check before a bin earns a check recommendation.
    #[arg(long, env = "CHECK_RECOMMENDATION_DAYS", default_value_t = 14)]
    pub check_recommendation_days: u32,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.len() < 32 {
            return Err(FleetError::validation(
                "APP_JWT_SECRET must be at least 32 bytes",
            ));
        }
        Ok(())
    }

    /// In-process configuration for tests: memory store, fixed secret, no
    /// providers.
    pub fn for_tests() -> Config {
        Config {
            database_url: "memory:".to_string(),
            jwt_secret: "test-secret-test-secret-test-secret!".to_string(),
            port: 0,
            firebase_credentials_file: None,
            firebase_credentials_base64: None,
            roads_api_key: None,
            geocode_api_key: None,
            check_recommendation_days: 14,
        }
    }
}
