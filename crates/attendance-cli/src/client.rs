//! HTTP client for the attendance service.

use std::time::Duration;

use async_trait::async_trait;
use attendance_core::api::{fields, CheckResponse, HealthResponse, RecordsResponse};
use attendance_core::{AttendanceApi, CheckInSubmission, RecordRef, SubmitError};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn records(&self) -> Result<RecordsResponse, SubmitError> {
        let response = self
            .client
            .get(self.url("/api/records"))
            .send()
            .await
            .map_err(network)?;
        parse_json(response).await
    }

    pub async fn health(&self) -> Result<HealthResponse, SubmitError> {
        let response = self
            .client
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(network)?;
        parse_json(response).await
    }
}

fn network(err: reqwest::Error) -> SubmitError {
    SubmitError::Network(err.to_string())
}

/// Read a JSON body, turning non-2xx statuses into [`SubmitError::Server`]
/// with the server's `message` when it sent one.
async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, SubmitError> {
    let status = response.status();
    let body = response.bytes().await.map_err(network)?;

    if !status.is_success() {
        let message = serde_json::from_slice::<CheckResponse>(&body)
            .map(|r| r.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).trim().to_string());
        return Err(SubmitError::Server {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_slice(&body).map_err(|e| SubmitError::Server {
        status: status.as_u16(),
        message: format!("unexpected response body: {e}"),
    })
}

#[async_trait]
impl AttendanceApi for HttpApi {
    async fn submit(&self, submission: CheckInSubmission) -> Result<RecordRef, SubmitError> {
        let CheckInSubmission {
            period,
            image,
            location,
        } = submission;

        let image_part = Part::bytes(image.bytes)
            .file_name(image.filename)
            .mime_str(image.content_type)
            .map_err(network)?;
        let form = Form::new()
            .part(fields::IMAGE, image_part)
            .text(fields::PERIOD, period)
            .text(fields::LAT, location.latitude.to_string())
            .text(fields::LNG, location.longitude.to_string());

        let response = self
            .client
            .post(self.url("/api/check"))
            .multipart(form)
            .send()
            .await
            .map_err(network)?;
        let status = response.status().as_u16();

        let body: CheckResponse = parse_json(response).await?;
        match body.data {
            Some(record) if body.success => Ok(record),
            _ => Err(SubmitError::Server {
                status,
                message: body.message,
            }),
        }
    }
}
