use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::{ErrorBody, ImageRef, PredictResponse, ServiceError, ServiceErrorKind, Specialist};
use crate::classifier::{ClassificationResult, LabelMapping};
use crate::imaging::media_type;

/// Client for a specialist served over HTTP (`POST /predict_retina`)
#[derive(Clone)]
pub struct HttpSpecialist {
    http: Client,
    endpoint: String,
    retries: u32,
    mapping: LabelMapping,
}

impl HttpSpecialist {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration, retries: u32) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ServiceError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            retries,
            mapping: LabelMapping::default(),
        })
    }

    pub fn with_mapping(mut self, mapping: LabelMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post_once(&self, bytes: &[u8], file_name: &str, mime: &str) -> Result<ClassificationResult, ServiceError> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| ServiceError::internal(format!("invalid media type {mime}: {e}")))?;
        let form = Form::new().part("file", part);

        let resp = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;

        let status = resp.status();
        if status.is_success() {
            let body: PredictResponse = resp.json().await.map_err(|e| {
                if e.is_timeout() {
                    ServiceError::unreachable(format!("specialist response timed out: {e}"))
                } else {
                    ServiceError::internal(format!("malformed specialist response: {e}"))
                }
            })?;
            return body.into_result(&self.mapping);
        }

        let text = resp.text().await.unwrap_or_default();
        let (kind, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.kind.unwrap_or_else(|| kind_for_status(status)), body.error),
            Err(_) => (kind_for_status(status), text),
        };
        Err(ServiceError::new(
            kind,
            format!("specialist returned {status}: {message}"),
        ))
    }
}

#[async_trait]
impl Specialist for HttpSpecialist {
    async fn analyze(&self, image: &ImageRef) -> Result<ClassificationResult, ServiceError> {
        let bytes = image.read().await?;
        let file_name = image.file_name();
        let mime = media_type(&bytes).unwrap_or("application/octet-stream");

        let mut attempt = 0;
        loop {
            debug!(target: "specialist", endpoint = %self.endpoint, attempt, "POST predict_retina");
            match self.post_once(&bytes, &file_name, mime).await {
                Err(e) if e.kind == ServiceErrorKind::Unreachable && attempt < self.retries => {
                    attempt += 1;
                    warn!(target: "specialist", error = %e, attempt, "Specialist unreachable; retrying");
                }
                other => return other,
            }
        }
    }
}

fn transport_error(endpoint: &str, e: reqwest::Error) -> ServiceError {
    if e.is_builder() {
        ServiceError::internal(format!("invalid specialist request: {e}"))
    } else {
        ServiceError::unreachable(format!("specialist at {endpoint} unreachable: {e}"))
    }
}

// A bare 404 means the endpoint itself is wrong, not that the image is missing.
// An explicit `NOT_FOUND` kind in the error body still wins.
fn kind_for_status(status: StatusCode) -> ServiceErrorKind {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ServiceErrorKind::DecodeFailed,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ServiceErrorKind::Unreachable
        }
        _ => ServiceErrorKind::Internal,
    }
}
