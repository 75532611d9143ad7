// Transaction Unification Engine - Web Server
// REST API with Axum for the upload UI and the labeling collaborator

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use txn_unify::{
    Batch, BatchProcessor, BatchReport, EngineConfig, LateBindingError, ManualMapping, SourceFile,
    TransactionId, UnifiedLedger,
};

#[derive(Debug, Parser)]
#[command(name = "txn-unify-server", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TXN_UNIFY_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,

    /// Engine config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite file for remembered bank profiles
    #[arg(long, env = "TXN_UNIFY_PROFILES")]
    profiles: Option<PathBuf>,
}

/// Uploads of the current session plus the result of the last run
#[derive(Default)]
struct Session {
    batch: Batch,
    ledger: Arc<UnifiedLedger>,
    report: BatchReport,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    processor: Arc<BatchProcessor>,
    session: Arc<Mutex<Session>>,
}

impl AppState {
    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ledger(&self) -> Arc<UnifiedLedger> {
        Arc::clone(&self.session().ledger)
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message.into()),
        }),
    )
        .into_response()
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct UploadQuery {
    name: String,
    account: Option<String>,
}

#[derive(Serialize)]
struct UploadResponse {
    file: String,
    account: String,
    /// An earlier upload of the same name was replaced
    replaced: bool,
    files_in_batch: usize,
}

#[derive(Deserialize)]
struct MappingRequest {
    file: String,
    mapping: ManualMapping,
}

#[derive(Deserialize)]
struct CategoryRequest {
    category: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    ApiResponse::ok("OK")
}

/// POST /api/files?name=&account= - Add a raw file to the batch
async fn upload_file(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Response {
    if query.name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "file name is required");
    }

    let mut file = SourceFile::new(query.name.trim(), body.to_vec());
    if let Some(account) = query.account {
        file = file.with_account(account);
    }
    let (name, account) = (file.name.clone(), file.account_label());

    let mut session = state.session();
    let replaced = session.batch.add_file(file);
    ApiResponse::ok(UploadResponse {
        file: name,
        account,
        replaced,
        files_in_batch: session.batch.files().len(),
    })
}

/// POST /api/mappings - Supply a manual mapping for a pending file
async fn set_mapping(State(state): State<AppState>, Json(request): Json<MappingRequest>) -> Response {
    let mut session = state.session();
    if !session.batch.files().iter().any(|f| f.name == request.file) {
        return api_error(StatusCode::NOT_FOUND, format!("file {} not uploaded", request.file));
    }
    session.batch.set_mapping(request.file.clone(), request.mapping);
    ApiResponse::ok(request.file)
}

/// POST /api/process - Run the batch and replace the ledger
async fn process_batch(State(state): State<AppState>) -> Response {
    let batch = state.session().batch.clone();
    if batch.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "no files uploaded");
    }

    let processor = Arc::clone(&state.processor);
    let result = tokio::task::spawn_blocking(move || processor.process(&batch)).await;

    match result {
        Ok((ledger, report)) => {
            let mut session = state.session();
            session.ledger = Arc::new(ledger);
            session.report = report.clone();
            ApiResponse::ok(report)
        }
        Err(e) => {
            error!("Batch processing failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "batch processing failed")
        }
    }
}

/// GET /api/transactions - Ordered ledger of the last run
async fn get_transactions(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.ledger().snapshot())
}

/// GET /api/labeling - Transactions still waiting for a category
async fn get_labeling_queue(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.ledger().labeling_queue())
}

/// GET /api/diagnostics - Per-file report of the last run
async fn get_diagnostics(State(state): State<AppState>) -> Response {
    let report = state.session().report.clone();
    ApiResponse::ok(report)
}

/// GET /api/summary - Income/expense totals without internal transfers
async fn get_summary(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.ledger().summary())
}

/// GET /api/export - Canonical CSV
async fn export_csv(State(state): State<AppState>) -> Response {
    match state.ledger().to_csv_bytes() {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"ledger.csv\""),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            error!("Error exporting ledger: {:#}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "export failed")
        }
    }
}

/// PUT /api/transactions/:id/category - Category write-back (once)
async fn assign_category(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CategoryRequest>,
) -> Response {
    let id = TransactionId::from(id.as_str());

    match state.ledger().assign_category(&id, request.category) {
        Ok(()) => ApiResponse::ok(id),
        Err(e @ LateBindingError::UnknownTransaction(_)) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => api_error(StatusCode::CONFLICT, e.to_string()),
    }
}

// ============================================================================
// Main Server
// ============================================================================

fn build_processor(args: &Args) -> Result<BatchProcessor> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(path) = &args.profiles {
        config.profile_db = Some(path.clone());
    }
    BatchProcessor::from_config(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    println!("🌐 Transaction Unification Engine - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let processor = build_processor(&args)?;
    match &processor.config().profile_db {
        Some(path) => println!("✓ Bank profiles: {:?}", path),
        None => println!("✓ Bank profiles: in memory"),
    }

    // Create shared state
    let state = AppState {
        processor: Arc::new(processor),
        session: Arc::new(Mutex::new(Session::default())),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/files", post(upload_file))
        .route("/mappings", post(set_mapping))
        .route("/process", post(process_batch))
        .route("/transactions", get(get_transactions))
        .route("/transactions/:id/category", put(assign_category))
        .route("/labeling", get(get_labeling_queue))
        .route("/diagnostics", get(get_diagnostics))
        .route("/summary", get(get_summary))
        .route("/export", get(export_csv))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;

    info!(addr = %args.addr, "server listening");
    println!("\n🚀 Server running on http://{}", args.addr);
    println!("   API: http://{}/api/health", args.addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
