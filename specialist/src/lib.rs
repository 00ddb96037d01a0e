//! HTTP facade over the in-process retina specialist.
//!
//! - `POST /predict_retina`: multipart field `file` with the encoded image
//! - `GET /health`: liveness plus whether a model is loaded

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use retina_core::specialist::{ErrorBody, LocalSpecialist, PredictResponse};
use retina_core::{ImageRef, ServiceError, ServiceErrorKind, Specialist};

pub const PREDICT_PATH: &str = "/predict_retina";
pub const HEALTH_PATH: &str = "/health";
const FILE_FIELD: &str = "file";

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Clone)]
struct AppState {
    specialist: Arc<LocalSpecialist>,
}

/// Router for the specialist endpoints
pub fn router(specialist: LocalSpecialist, max_upload_bytes: usize) -> Router {
    let state = AppState {
        specialist: Arc::new(specialist),
    };
    Router::new()
        .route(PREDICT_PATH, post(predict_handler))
        .route(HEALTH_PATH, get(health_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr()?;
    info!(target: "specialist", url = %format!("http://{local}{PREDICT_PATH}"), "Specialist server ready");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    info!(target: "specialist", "Specialist server stopped");
    Ok(())
}

/// Bind `addr` and serve until ctrl-c
pub async fn start_server(addr: SocketAddr, specialist: LocalSpecialist, max_upload_bytes: usize) -> Result<()> {
    info!(
        target: "specialist",
        addr = %addr,
        model_loaded = specialist.classifier().is_loaded(),
        "Starting specialist server"
    );
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    serve(listener, router(specialist, max_upload_bytes), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Error response carrying the failure kind
struct ApiError(ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ServiceErrorKind::DecodeFailed | ServiceErrorKind::NotFound => StatusCode::BAD_REQUEST,
            ServiceErrorKind::ModelUnavailable | ServiceErrorKind::Unreachable | ServiceErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        let kind = if e.status().is_client_error() {
            ServiceErrorKind::DecodeFailed
        } else {
            ServiceErrorKind::Internal
        };
        ApiError(ServiceError::new(kind, format!("invalid multipart body: {}", e.body_text())))
    }
}

async fn predict_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> std::result::Result<Json<PredictResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        if field.file_name() == Some("") {
            return Err(ServiceError::new(ServiceErrorKind::DecodeFailed, "no file selected").into());
        }
        upload = Some(field.bytes().await?);
        break;
    }

    let Some(bytes) = upload else {
        return Err(ServiceError::new(
            ServiceErrorKind::DecodeFailed,
            format!("no '{FILE_FIELD}' part in request"),
        )
        .into());
    };
    debug!(target: "specialist", bytes = bytes.len(), "Received image");

    match state.specialist.analyze(&ImageRef::bytes(bytes.to_vec())).await {
        Ok(result) => {
            info!(
                target: "specialist",
                status = result.status(),
                confidence = result.confidence,
                "Prediction served"
            );
            Ok(Json(PredictResponse::from(&result)))
        }
        Err(e) => {
            warn!(target: "specialist", kind = %e.kind, error = %e.message, "Prediction failed");
            Err(e.into())
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    model_loaded: bool,
}

async fn health_handler(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        model_loaded: state.specialist.classifier().is_loaded(),
    })
}
