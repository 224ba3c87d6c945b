//! HTTP handlers.

use attendance_core::api::{fields, CheckResponse, HealthResponse, RecordsResponse};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;

use crate::error::AppError;
use crate::store::NewRecord;
use crate::AppState;

const SUCCESS_MESSAGE: &str = "บันทึกสำเร็จ";

pub async fn root() -> &'static str {
    "Server is running"
}

/// Parsed `multipart/form-data` body of a check-in.
#[derive(Debug, Default)]
struct CheckForm {
    image: Option<(Option<String>, Vec<u8>)>,
    period: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge
    } else {
        AppError::MalformedPayload(err.body_text())
    }
}

fn parse_coordinate(name: &str, raw: &str, limit: f64) -> Result<f64, AppError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.abs() <= limit)
        .ok_or_else(|| AppError::MalformedPayload(format!("invalid {name}: {raw:?}")))
}

async fn read_form(mut multipart: Multipart) -> Result<CheckForm, AppError> {
    let mut form = CheckForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            fields::IMAGE => {
                let file_name = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_error)?;
                form.image = Some((file_name, bytes.to_vec()));
            }
            fields::PERIOD => form.period = Some(field.text().await.map_err(multipart_error)?),
            fields::LAT => {
                let raw = field.text().await.map_err(multipart_error)?;
                form.lat = Some(parse_coordinate("lat", &raw, 90.0)?);
            }
            fields::LNG => {
                let raw = field.text().await.map_err(multipart_error)?;
                form.lng = Some(parse_coordinate("lng", &raw, 180.0)?);
            }
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    Ok(form)
}

/// `POST /api/check`: store one snapshot and its record.
///
/// Validation happens before anything touches disk or the database. The
/// image is written first and the row insert is the commit point; if the
/// insert fails the image is removed again.
pub async fn check(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<CheckResponse>, AppError> {
    let multipart = multipart.map_err(|e| AppError::MalformedPayload(e.body_text()))?;
    let form = read_form(multipart).await?;

    let (file_name, bytes) = form
        .image
        .filter(|(_, bytes)| !bytes.is_empty())
        .ok_or(AppError::MissingImage)?;
    let period = form
        .period
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or(AppError::MissingPeriod)?;
    let (latitude, longitude) = match (form.lat, form.lng) {
        (Some(lat), Some(lng)) => (Some(lat), Some(lng)),
        (None, None) => (None, None),
        _ => {
            return Err(AppError::MalformedPayload(
                "lat and lng must be sent together".into(),
            ))
        }
    };

    if !state.store.is_available() {
        return Err(AppError::StoreUnavailable);
    }

    let image = state.uploads.save(file_name.as_deref(), &bytes).await?;

    let record = NewRecord {
        image: image.clone(),
        period,
        latitude,
        longitude,
    };
    match state.store.insert_record(record).await {
        Ok(stored) => {
            tracing::info!(
                id = stored.id,
                period = %stored.period,
                image = %stored.image,
                bytes = bytes.len(),
                "check-in recorded"
            );
            Ok(Json(CheckResponse {
                success: true,
                message: SUCCESS_MESSAGE.to_string(),
                data: Some(stored),
            }))
        }
        Err(err) => {
            if let Err(rm) = state.uploads.remove(&image).await {
                tracing::warn!(image = %image, error = %rm, "failed to remove orphaned snapshot");
            }
            Err(err.into())
        }
    }
}

/// `GET /api/records`: all records, most recent first. A storage outage is
/// reported in the body, not as an HTTP error.
pub async fn records(State(state): State<AppState>) -> Json<RecordsResponse> {
    match state.store.list_records().await {
        Ok(data) => Json(RecordsResponse {
            success: true,
            degraded: false,
            message: None,
            data,
        }),
        Err(err) => {
            tracing::warn!(error = %err, "serving degraded record listing");
            Json(RecordsResponse {
                success: false,
                degraded: true,
                message: Some("Database unavailable".to_string()),
                data: Vec::new(),
            })
        }
    }
}

/// `GET /api/health`: always 200; reachability is in the body.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let reachable = state.store.health_check().await;
    Json(HealthResponse {
        success: true,
        reachable,
        database: if reachable { "connected" } else { "unreachable" }.to_string(),
    })
}
