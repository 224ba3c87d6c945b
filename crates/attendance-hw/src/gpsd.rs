//! Position fixes from a local gpsd over its JSON socket protocol.

use async_trait::async_trait;
use attendance_core::{Location, LocationError, PositionSource};
use serde::Deserialize;
use std::io::ErrorKind;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub const DEFAULT_GPSD_ADDR: &str = "127.0.0.1:2947";

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// The subset of a gpsd report we care about.
#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// Extract a 2D-or-better fix from one line of gpsd output.
fn parse_fix(line: &str) -> Option<Location> {
    let report: Report = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }
    Some(Location::new(report.lat?, report.lon?))
}

/// Asks gpsd for a fresh fix on every call.
#[derive(Debug, Clone)]
pub struct GpsdSource {
    addr: String,
}

impl GpsdSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl PositionSource for GpsdSource {
    /// Connects, enables watch mode and waits for the first TPV report with
    /// a fix. Timeouts are applied by the caller.
    async fn current_position(&self) -> Result<Location, LocationError> {
        let mut stream = TcpStream::connect(&self.addr).await.map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => LocationError::PermissionDenied(format!("{}: {e}", self.addr)),
            _ => LocationError::Unavailable(format!("gpsd at {}: {e}", self.addr)),
        })?;

        stream
            .write_all(WATCH_COMMAND)
            .await
            .map_err(|e| LocationError::Unavailable(format!("gpsd watch: {e}")))?;

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| LocationError::Unavailable(format!("gpsd read: {e}")))?
                .ok_or_else(|| LocationError::Unavailable("gpsd closed the connection".into()))?;

            if let Some(location) = parse_fix(&line) {
                tracing::debug!(addr = %self.addr, lat = location.latitude, lng = location.longitude, "gpsd fix");
                return Ok(location);
            }
        }
    }
}
