use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use snippet_exec::{to_response, CodeExecutionService, RunResponse, ServiceConfig, ValidationError};
use std::{any::Any, future::Future, net::SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info};

pub mod config;

pub const NO_CODE_MESSAGE: &str = "No code provided";
pub const INVALID_BODY_MESSAGE: &str = "Invalid request body";
pub const BODY_TOO_LARGE_MESSAGE: &str = "Request body too large";
pub const BUSY_MESSAGE: &str = "Server busy";
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Failed to read request body: {0}")]
    Body(#[from] BytesRejection),
    #[error("Execution error: {0}")]
    ExecutionError(#[from] snippet_exec::Error),
    #[error("Server error: {0}")]
    ServerError(String),
}

impl ServerError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ServerError::Validation(ValidationError::MissingCode) => {
                (StatusCode::BAD_REQUEST, NO_CODE_MESSAGE.to_string())
            }
            ServerError::Validation(ValidationError::MalformedRequest(_)) => {
                (StatusCode::BAD_REQUEST, INVALID_BODY_MESSAGE.to_string())
            }
            ServerError::Validation(e @ ValidationError::UnsupportedLanguage(_)) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            ServerError::Body(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                (StatusCode::PAYLOAD_TOO_LARGE, BODY_TOO_LARGE_MESSAGE.to_string())
            }
            ServerError::Body(_) => (StatusCode::BAD_REQUEST, INVALID_BODY_MESSAGE.to_string()),
            ServerError::ExecutionError(snippet_exec::Error::Validation(e)) => {
                ServerError::Validation(e.clone()).status_and_message()
            }
            ServerError::ExecutionError(snippet_exec::Error::Overloaded) => {
                (StatusCode::SERVICE_UNAVAILABLE, BUSY_MESSAGE.to_string())
            }
            ServerError::ExecutionError(_) | ServerError::ServerError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR_MESSAGE.to_string(),
            ),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected: {}", self);
        }

        (status, Json(RunResponse::failure(message))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    service: CodeExecutionService,
}

pub fn create_app(config: ServiceConfig, max_body_bytes: usize) -> Result<Router, ServerError> {
    let service = CodeExecutionService::new(config).map_err(ServerError::ExecutionError)?;
    Ok(router(service, max_body_bytes))
}

pub fn router(service: CodeExecutionService, max_body_bytes: usize) -> Router {
    let state = AppState { service };

    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_check))
        .route("/run", post(run))
        .route("/api/run", post(run))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(app: Router, addr: SocketAddr) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    serve(listener, app, shutdown_signal()).await
}

pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|e| ServerError::ServerError(e.to_string()))?;
    info!("Starting code execution server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn health_check() -> &'static str {
    "OK"
}

/// Body is taken raw so malformed and oversized bodies get the same response contract as every other error
async fn run(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<RunResponse>, ServerError> {
    let request = state.service.validate(&body?)?;
    let result = state.service.execute(request).await?;
    Ok(Json(to_response(&result)))
}

fn handle_panic(_err: Box<dyn Any + Send + 'static>) -> Response {
    error!("Request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(RunResponse::failure(INTERNAL_ERROR_MESSAGE)),
    )
        .into_response()
}
