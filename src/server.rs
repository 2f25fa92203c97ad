//! HTTP boundary: upload for conversion, queue status and queue reset.

use crate::config::Config;
use crate::error::JobFailure;
use crate::formats;
use crate::queue::ConversionQueue;
use crate::telemetry;
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Query, Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Multipart field carrying the document to convert.
const ATTACHMENT_FIELD: &str = "attachment";

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub queue: ConversionQueue,
    pub config: Arc<Config>,
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let protected = Router::new()
        .route("/convert", post(convert))
        .route("/reset", get(reset))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), require_api_key));

    Router::new()
        .merge(protected)
        .route("/status", get(status))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(ctx.config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Binds the HTTP listener and serves until `shutdown` resolves.
pub async fn serve(ctx: AppContext, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let port = ctx.config.server_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Error starting PDF server on port {port}"))?;

    info!("PDF server listening on port {}", port);

    axum::serve(listener, create_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
        .context("PDF server failed")
}

#[derive(Debug, Default, Deserialize)]
struct AuthQuery {
    authorization: Option<String>,
}

/// Middleware for API key authentication.
///
/// A query string that does not parse counts as carrying no key, so the
/// caller still gets a 401 rather than a parse error.
async fn require_api_key(
    State(ctx): State<AppContext>,
    query: Option<Query<AuthQuery>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let query_key = query.and_then(|Query(query)| query.authorization);
    if is_authorized(ctx.config.api_key.as_deref(), &headers, query_key.as_deref()) {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "API key incorrect");
    (StatusCode::UNAUTHORIZED, "API key incorrect").into_response()
}

fn is_authorized(api_key: Option<&str>, headers: &HeaderMap, query_key: Option<&str>) -> bool {
    let Some(api_key) = api_key else {
        return true;
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    bearer == Some(api_key) || query_key == Some(api_key)
}

enum Upload {
    Staged { file_name: String, path: PathBuf },
    Unsupported { extension: String },
    Missing,
}

async fn convert(State(ctx): State<AppContext>, mut multipart: Multipart) -> Response {
    let (file_name, input_path) = match stage_upload(&mut multipart, &ctx.config.upload_dir).await {
        Ok(Upload::Staged { file_name, path }) => (file_name, path),
        Ok(Upload::Unsupported { extension }) => {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("The extension .{extension} is not supported"),
            )
                .into_response();
        }
        Ok(Upload::Missing) => {
            return (StatusCode::BAD_REQUEST, "Missing attachment").into_response();
        }
        Err(e) => {
            error!("Error parsing request: {:#}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error parsing request").into_response();
        }
    };

    let output_path = ctx.config.upload_dir.join(format!(
        "{}_{}.pdf",
        Utc::now().timestamp_millis(),
        Uuid::new_v4()
    ));

    info!(file = %file_name, "Queueing file");

    // Runs on its own task so the staged files are cleaned up even if the
    // client disconnects while the job is queued.
    let queue = ctx.queue.clone();
    let conversion = tokio::spawn(run_conversion(queue, input_path, output_path));
    let result = match conversion.await {
        Ok(result) => result,
        Err(e) => {
            error!(file = %file_name, "Conversion task crashed: {}", e);
            Err(JobFailure::ConversionFailed)
        }
    };

    match result {
        Ok(pdf) => {
            info!(file = %file_name, bytes = pdf.len(), "Successfully converted");
            ([(header::CONTENT_TYPE, "application/pdf")], pdf).into_response()
        }
        Err(failure) => {
            error!(file = %file_name, "Error converting: {}", failure);
            failure_response(failure)
        }
    }
}

/// Converts a staged upload and returns the PDF bytes. Both staged files are
/// gone by the time this returns.
async fn run_conversion(
    queue: ConversionQueue,
    input_path: PathBuf,
    output_path: PathBuf,
) -> std::result::Result<Vec<u8>, JobFailure> {
    let outcome = queue.convert(input_path.clone(), output_path).await;
    remove_staged(&input_path).await;

    match outcome {
        Some(Ok(pdf_path)) => {
            let pdf = tokio::fs::read(&pdf_path).await;
            remove_staged(&pdf_path).await;
            pdf.map_err(|e| {
                error!("Error reading PDF file {}: {}", pdf_path.display(), e);
                JobFailure::ConversionFailed
            })
        }
        Some(Err(failure)) => Err(failure),
        None => {
            warn!(source = %input_path.display(), "Conversion abandoned by queue reset");
            Err(JobFailure::ConversionFailed)
        }
    }
}

fn failure_response(failure: JobFailure) -> Response {
    let status = match failure {
        JobFailure::NotSupported => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        JobFailure::ConversionFailed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, failure.to_string()).into_response()
}

/// Streams the attachment to the staging directory once its extension has
/// been admitted.
async fn stage_upload(multipart: &mut Multipart, upload_dir: &Path) -> Result<Upload> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .context("failed to read multipart field")?
    {
        if field.name() != Some(ATTACHMENT_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let extension = formats::extension_of(&file_name).unwrap_or_default();
        if !formats::is_supported(&extension) {
            return Ok(Upload::Unsupported { extension });
        }

        let path = upload_dir.join(format!("{}.{extension}", Uuid::new_v4()));
        if let Err(e) = write_field(&mut field, &path).await {
            remove_staged(&path).await;
            return Err(e);
        }
        return Ok(Upload::Staged { file_name, path });
    }

    Ok(Upload::Missing)
}

async fn write_field(field: &mut Field<'_>, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;

    while let Some(chunk) = field.chunk().await.context("failed to read upload")? {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    file.flush().await?;
    Ok(())
}

async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Successfully deleted {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Nothing to delete at {}", path.display())
        }
        Err(e) => error!("Unable to delete {}: {}", path.display(), e),
    }
}

async fn status(State(ctx): State<AppContext>) -> String {
    let queued = ctx.queue.size();
    telemetry::record_queue_heartbeat(queued);
    format!("Queued files: {queued}")
}

async fn reset(State(ctx): State<AppContext>) -> String {
    let removed = ctx.queue.reset();
    info!("Reset request: removed {} files from queue", removed);
    format!("Removed files: {removed}")
}

async fn not_found(uri: Uri) -> (StatusCode, &'static str) {
    error!("Page not found: {}", uri);
    (StatusCode::NOT_FOUND, "Page not found")
}
