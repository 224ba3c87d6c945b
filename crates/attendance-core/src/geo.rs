//! Great-circle distance and the office geofence.

use crate::types::Location;
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (spherical model).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Slack applied at the boundary so a point computed to lie exactly on the
/// circle is not rejected by floating-point noise.
const BOUNDARY_EPSILON_M: f64 = 1e-6;

/// Haversine distance between two points, in meters.
pub fn distance_m(a: Location, b: Location) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_M * c
}

/// Circular check-in area around the office.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub office: Location,
    pub radius_m: f64,
}

/// Outcome of testing a position against the geofence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceVerdict {
    pub distance_m: f64,
    pub within: bool,
}

impl GeofenceVerdict {
    /// Distance rounded to whole meters, as shown to users.
    pub fn rounded_distance_m(&self) -> u64 {
        self.distance_m.round().max(0.0) as u64
    }
}

impl Geofence {
    pub const fn new(office: Location, radius_m: f64) -> Self {
        Self { office, radius_m }
    }

    /// Classify `position`. The boundary is inclusive.
    pub fn check(&self, position: Location) -> GeofenceVerdict {
        let distance_m = distance_m(position, self.office);
        GeofenceVerdict {
            distance_m,
            within: distance_m <= self.radius_m + BOUNDARY_EPSILON_M,
        }
    }
}
