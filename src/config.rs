use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

pub const MAX_GEO_RETRY_ATTEMPTS: u32 = 10;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub listen_addr: SocketAddr,
    pub notify_webhook_url: Option<String>,
    pub dispatch: DispatchConfig,
}

/// Dispatch and negotiation policy. The defaults mirror the values the
/// production rides service was running with.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub search_radius_km: f64,
    pub max_candidates: usize,
    pub search_timeout: Duration,
    pub offer_expiry: Duration,
    pub max_bargain_rounds: usize,
    pub min_offer_ratio: f64,
    pub max_offer_ratio: f64,
    pub geo_retry_attempts: u32,
    pub geo_retry_backoff: Duration,
    pub matching_interval: Duration,
    pub scheduler_tick: Duration,
    pub min_ride_distance_km: f64,
    pub max_ride_distance_km: f64,
    pub min_schedule_lead: Duration,
    pub max_schedule_ahead: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_radius_km: 5.0,
            max_candidates: 5,
            search_timeout: Duration::from_secs(300),
            offer_expiry: Duration::from_secs(120),
            max_bargain_rounds: 5,
            min_offer_ratio: 0.5,
            max_offer_ratio: 2.0,
            geo_retry_attempts: 3,
            geo_retry_backoff: Duration::from_millis(200),
            matching_interval: Duration::from_secs(30),
            scheduler_tick: Duration::from_millis(1000),
            min_ride_distance_km: 0.5,
            max_ride_distance_km: 200.0,
            min_schedule_lead: Duration::from_secs(30 * 60),
            max_schedule_ahead: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl DispatchConfig {
    /// Inclusive fare window for bargain offers on a ride.
    pub fn offer_bounds(&self, estimated_fare: f64) -> (f64, f64) {
        (
            estimated_fare * self.min_offer_ratio,
            estimated_fare * self.max_offer_ratio,
        )
    }

    fn validate(&self) -> Result<(), Error> {
        if !(self.min_offer_ratio > 0.0 && self.min_offer_ratio <= self.max_offer_ratio) {
            return Err(Error::Config(
                "MIN_OFFER_RATIO must be positive and not exceed MAX_OFFER_RATIO".into(),
            ));
        }

        if self.max_bargain_rounds == 0 {
            return Err(Error::Config("MAX_BARGAIN_ROUNDS must be at least 1".into()));
        }

        if !(1..=MAX_GEO_RETRY_ATTEMPTS).contains(&self.geo_retry_attempts) {
            return Err(Error::Config(format!(
                "GEO_RETRY_ATTEMPTS must be between 1 and {}",
                MAX_GEO_RETRY_ATTEMPTS
            )));
        }

        if self.search_radius_km <= 0.0 {
            return Err(Error::Config("SEARCH_RADIUS_KM must be positive".into()));
        }

        if self.min_ride_distance_km > self.max_ride_distance_km {
            return Err(Error::Config(
                "MIN_RIDE_DISTANCE_KM exceeds MAX_RIDE_DISTANCE_KM".into(),
            ));
        }

        Ok(())
    }
}

impl Config {
    #[tracing::instrument(name = "Config::from_env")]
    pub fn from_env() -> Result<Self, Error> {
        if let Err(err) = dotenv::dotenv() {
            tracing::debug!("no .env file loaded: {}", err);
        }

        let defaults = DispatchConfig::default();

        let dispatch = DispatchConfig {
            search_radius_km: env_or("SEARCH_RADIUS_KM", defaults.search_radius_km)?,
            max_candidates: env_or("MAX_CANDIDATES", defaults.max_candidates)?,
            search_timeout: secs_or("SEARCH_TIMEOUT_SECS", defaults.search_timeout)?,
            offer_expiry: secs_or("OFFER_EXPIRY_SECS", defaults.offer_expiry)?,
            max_bargain_rounds: env_or("MAX_BARGAIN_ROUNDS", defaults.max_bargain_rounds)?,
            min_offer_ratio: env_or("MIN_OFFER_RATIO", defaults.min_offer_ratio)?,
            max_offer_ratio: env_or("MAX_OFFER_RATIO", defaults.max_offer_ratio)?,
            geo_retry_attempts: env_or("GEO_RETRY_ATTEMPTS", defaults.geo_retry_attempts)?,
            geo_retry_backoff: millis_or("GEO_RETRY_BACKOFF_MS", defaults.geo_retry_backoff)?,
            matching_interval: secs_or("MATCHING_INTERVAL_SECS", defaults.matching_interval)?,
            scheduler_tick: millis_or("SCHEDULER_TICK_MS", defaults.scheduler_tick)?,
            min_ride_distance_km: env_or("MIN_RIDE_DISTANCE_KM", defaults.min_ride_distance_km)?,
            max_ride_distance_km: env_or("MAX_RIDE_DISTANCE_KM", defaults.max_ride_distance_km)?,
            ..defaults
        };

        dispatch.validate()?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5)?,
            listen_addr: env_or("LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            notify_webhook_url: optional("NOTIFY_WEBHOOK_URL")?,
            dispatch,
        })
    }
}

fn optional(key: &str) -> Result<Option<String>, Error> {
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, Error> {
    match optional(key)? {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", key, raw))),
        None => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration, Error> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(key: &str, default: Duration) -> Result<Duration, Error> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

#[test]
fn offer_bounds_scale_with_fare() {
    let config = DispatchConfig::default();
    assert_eq!(config.offer_bounds(1500.0), (750.0, 3000.0));
}

#[test]
fn unset_variables_fall_back_to_defaults() {
    let value: u32 = env_or("RIDE_DISPATCH_TEST_UNSET_VARIABLE", 7).unwrap();
    assert_eq!(value, 7);
}

#[test]
fn malformed_variables_are_rejected() {
    env::set_var("RIDE_DISPATCH_TEST_MALFORMED", "five");
    let result: Result<u32, Error> = env_or("RIDE_DISPATCH_TEST_MALFORMED", 5);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn inverted_offer_ratios_are_rejected() {
    let config = DispatchConfig {
        min_offer_ratio: 2.5,
        ..DispatchConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn retry_attempts_are_bounded() {
    for attempts in [0, MAX_GEO_RETRY_ATTEMPTS + 1, 40] {
        let config = DispatchConfig {
            geo_retry_attempts: attempts,
            ..DispatchConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    let config = DispatchConfig {
        geo_retry_attempts: MAX_GEO_RETRY_ATTEMPTS,
        ..DispatchConfig::default()
    };
    assert!(config.validate().is_ok());
}
