//! One-shot geolocation with an explicit timeout.

use crate::types::Location;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LOCATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("location permission denied: {0}")]
    PermissionDenied(String),
    #[error("location unavailable: {0}")]
    Unavailable(String),
    #[error("location request timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),
}

/// A platform positioning service that can produce one fresh fix.
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(&self) -> Result<Location, LocationError>;
}

/// Fixed coordinates, e.g. from command-line overrides.
#[derive(Debug, Clone, Copy)]
pub struct FixedPosition(pub Location);

#[async_trait]
impl PositionSource for FixedPosition {
    async fn current_position(&self) -> Result<Location, LocationError> {
        Ok(self.0)
    }
}

/// Wraps a [`PositionSource`] with a timeout and coordinate validation.
/// Never retries.
pub struct GeolocationProbe<S> {
    source: S,
    timeout: Duration,
}

impl<S: PositionSource> GeolocationProbe<S> {
    pub fn new(source: S, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn get_current_location(&self) -> Result<Location, LocationError> {
        let location = tokio::time::timeout(self.timeout, self.source.current_position())
            .await
            .map_err(|_| LocationError::Timeout(self.timeout))??;

        if !is_valid(location) {
            return Err(LocationError::Unavailable(format!(
                "invalid fix ({}, {})",
                location.latitude, location.longitude
            )));
        }

        tracing::debug!(
            lat = location.latitude,
            lng = location.longitude,
            "location resolved"
        );
        Ok(location)
    }
}

fn is_valid(location: Location) -> bool {
    location.latitude.is_finite()
        && location.longitude.is_finite()
        && (-90.0..=90.0).contains(&location.latitude)
        && (-180.0..=180.0).contains(&location.longitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Never;

    #[async_trait]
    impl PositionSource for Never {
        async fn current_position(&self) -> Result<Location, LocationError> {
            std::future::pending().await
        }
    }

    struct Denied;

    #[async_trait]
    impl PositionSource for Denied {
        async fn current_position(&self) -> Result<Location, LocationError> {
            Err(LocationError::PermissionDenied("user declined".into()))
        }
    }

    #[tokio::test]
    async fn test_fixed_position_resolves() {
        let probe = GeolocationProbe::new(
            FixedPosition(Location::new(13.821, 100.039)),
            DEFAULT_LOCATION_TIMEOUT,
        );
        let loc = probe.get_current_location().await.unwrap();
        assert_eq!(loc, Location::new(13.821, 100.039));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_distinct() {
        let probe = GeolocationProbe::new(Never, Duration::from_secs(10));
        let err = probe.get_current_location().await.unwrap_err();
        assert_eq!(err, LocationError::Timeout(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_source_errors_pass_through() {
        let probe = GeolocationProbe::new(Denied, DEFAULT_LOCATION_TIMEOUT);
        assert!(matches!(
            probe.get_current_location().await,
            Err(LocationError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_fix_rejected() {
        let probe = GeolocationProbe::new(
            FixedPosition(Location::new(f64::NAN, 100.0)),
            DEFAULT_LOCATION_TIMEOUT,
        );
        assert!(matches!(
            probe.get_current_location().await,
            Err(LocationError::Unavailable(_))
        ));

        let probe = GeolocationProbe::new(
            FixedPosition(Location::new(91.0, 100.0)),
            DEFAULT_LOCATION_TIMEOUT,
        );
        assert!(probe.get_current_location().await.is_err());
    }
}
