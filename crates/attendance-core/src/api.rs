//! Wire contract between the check-in client and the attendance service.

use crate::types::{ImageBlob, Location};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Multipart field names accepted by `POST /api/check`.
pub mod fields {
    pub const IMAGE: &str = "image";
    pub const PERIOD: &str = "period";
    pub const LAT: &str = "lat";
    pub const LNG: &str = "lng";
}

/// Everything uploaded for one check-in.
#[derive(Debug, Clone)]
pub struct CheckInSubmission {
    pub period: String,
    pub image: ImageBlob,
    pub location: Location,
}

/// Identifier and echo of a freshly stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRef {
    pub id: i64,
    pub image: String,
    pub period: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted attendance record as returned by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub image: String,
    pub period: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /api/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RecordRef>,
}

/// Body of `GET /api/records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: Vec<AttendanceRecord>,
}

/// Body of `GET /api/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub success: bool,
    pub reachable: bool,
    pub database: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
}

/// Client side of the attendance service.
#[async_trait]
pub trait AttendanceApi: Send + Sync {
    async fn submit(&self, submission: CheckInSubmission) -> Result<RecordRef, SubmitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_response_parses_server_body() {
        let body = r#"{
            "success": true,
            "message": "บันทึกสำเร็จ",
            "data": {"id": 3, "image": "1700000000000-ab12cd34-snapshot-1.png", "period": "เช้า",
                     "created_at": "2026-10-18T01:02:03.456Z"}
        }"#;
        let parsed: CheckResponse = serde_json::from_str(body).unwrap();
        let data = parsed.data.unwrap();
        assert_eq!(data.id, 3);
        assert_eq!(data.period, "เช้า");
    }

    #[test]
    fn test_error_body_without_data() {
        let parsed: CheckResponse =
            serde_json::from_str(r#"{"success": false, "message": "No image uploaded"}"#).unwrap();
        assert!(!parsed.success);
        assert!(parsed.data.is_none());
    }

    #[test]
    fn test_records_degraded_flag_omitted_when_false() {
        let body = RecordsResponse {
            success: true,
            degraded: false,
            message: None,
            data: vec![],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("degraded").is_none());
        assert_eq!(json["data"], serde_json::json!([]));
    }
}
