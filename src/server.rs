//!
//! HTTP server
//! -----------
//! The Axum-based boundary of one storage server. Request and response
//! bodies are base64-encoded bincode messages (`application/base64`).
//! Endpoints: `/add` records streams, `/list` enumerates variables by
//! prefix, `/get` runs the find → mutate → aggregate pipeline, `/get_config`
//! serves the active cluster config, `/health` reports liveness. The server
//! also owns the background machinery: record-log admin task, file-manager
//! retention loop and config reloader, all observing one shutdown flag.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tracing::{error, info, warn};

use crate::aggregate::apply_aggregations;
use crate::config::ConfigManager;
use crate::error::{Result, StoreError};
use crate::mutate::apply_mutations;
use crate::protocol::{
    decode_body, encode_body, AddRequest, AddResponse, GetRequest, GetResponse, ListRequest,
    ListResponse, ValueStream, CONTENT_TYPE_BASE64,
};
use crate::store::record_log::{RecordLogOptions, DEFAULT_MAX_LOG_SIZE_MB};
use crate::store::{file_manager::StoreFileManager, DiskDatastore};
use crate::variable::Variable;

/// Knobs for one storage server process.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub data_directory: PathBuf,
    pub config_file: Option<PathBuf>,
    pub listen_address: String,
    pub port: u16,
    pub recordlog_max_log_size_mb: u64,
    /// Advisory cache budget; logged at startup.
    pub store_max_ram_mb: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            data_directory: PathBuf::from("data"),
            config_file: None,
            listen_address: "0.0.0.0".into(),
            port: 8020,
            recordlog_max_log_size_mb: DEFAULT_MAX_LOG_SIZE_MB,
            store_max_ram_mb: 200,
        }
    }
}

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DiskDatastore>,
    pub config: Arc<ConfigManager>,
    pub files: Arc<StoreFileManager>,
}

impl AppState {
    /// Build the datastore, config manager and file manager for a data
    /// directory, replaying the record log in the process.
    pub fn open(options: &ServerOptions) -> Result<Self> {
        let log_options = RecordLogOptions {
            max_log_size_bytes: options.recordlog_max_log_size_mb * 1024 * 1024,
            ..RecordLogOptions::default()
        };
        let store = Arc::new(DiskDatastore::open(&options.data_directory, log_options)?);
        let config = Arc::new(match &options.config_file {
            Some(path) => ConfigManager::load(path),
            None => ConfigManager::unconfigured(),
        });
        let files = Arc::new(StoreFileManager::new(&options.data_directory));
        Ok(AppState {
            store,
            config,
            files,
        })
    }

    /// Spawn every background task against a shared shutdown flag.
    pub fn start_background_tasks(
        &self,
        shutdown: Arc<AtomicBool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.store.record_log().start_admin_task(Arc::clone(&shutdown)),
            self.files
                .start_background_task(Arc::clone(&self.config), Arc::clone(&shutdown)),
            self.config.start_reload_task(shutdown),
        ]
    }
}

fn base64_reply(status: StatusCode, body: String) -> impl IntoResponse {
    (
        status,
        [(header::CONTENT_TYPE, CONTENT_TYPE_BASE64)],
        body,
    )
}

/// Encode a response message, downgrading encoder failures to a 500.
fn encode_reply<T: serde::Serialize>(message: &T) -> axum::response::Response {
    match encode_body(message) {
        Ok(body) => base64_reply(StatusCode::OK, body).into_response(),
        Err(e) => {
            error!(target: "tidemark::server", "error serializing response: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "error serializing response".to_string())
                .into_response()
        }
    }
}

/// Run a handler body, mapping decode failures to a 400-class reply and
/// panics to a 500 so the worker keeps serving other requests.
fn guarded<T, F>(body: F) -> std::result::Result<T, axum::response::Response>
where
    F: FnOnce() -> Result<T>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Err((status, e.to_string()).into_response())
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "request handler panicked".into());
            error!(target: "tidemark::server", "handler panicked: {message}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, message).into_response())
        }
    }
}

async fn handle_add(State(state): State<AppState>, body: String) -> axum::response::Response {
    let request: AddRequest = match guarded(|| decode_body(&body)) {
        Ok(r) => r,
        Err(reply) => return reply,
    };
    let mut response = AddResponse {
        success: true,
        message: None,
    };
    if request.streams.is_empty() {
        response.success = false;
        response.message = Some("no streams in add request".into());
        return encode_reply(&response);
    }
    'streams: for stream in &request.streams {
        for value in &stream.values {
            if let Err(e) = state.store.record(&stream.variable, value.clone()) {
                warn!(target: "tidemark::server", "add rejected: {e}");
                response.success = false;
                response.message = Some(e.to_string());
                break 'streams;
            }
        }
    }
    encode_reply(&response)
}

async fn handle_list(State(state): State<AppState>, body: String) -> axum::response::Response {
    let response = match guarded(|| {
        let request: ListRequest = decode_body(&body)?;
        if request.prefix.is_empty() {
            return Err(StoreError::InvalidArgument("empty prefix".into()));
        }
        let streams: Vec<ValueStream> = state
            .store
            .list_variables(&request.prefix)
            .into_iter()
            .map(ValueStream::new)
            .collect();
        Ok(ListResponse {
            success: true,
            message: None,
            streams,
        })
    }) {
        Ok(r) => r,
        Err(reply) => return reply,
    };
    encode_reply(&response)
}

/// The read pipeline: matched variables × time window, then the mutation
/// chain per stream, then any requested aggregations across streams.
fn run_get(state: &AppState, request: &GetRequest) -> Result<GetResponse> {
    if request.variable.is_empty() {
        return Err(StoreError::InvalidArgument("no variable specified".into()));
    }
    let search = Variable::parse(&request.variable)?;
    let variables = state.store.find_variables(&search);
    info!(
        target: "tidemark::server",
        "found {} variables matching {}",
        variables.len(),
        request.variable
    );
    let end = request.max_timestamp.unwrap_or(0);
    let mut streams = Vec::with_capacity(variables.len());
    for variable in variables {
        let raw = state.store.get_range(&variable, request.min_timestamp, end);
        let mutated = apply_mutations(&request.mutations, &raw)?;
        streams.push(mutated);
    }
    let streams = if request.aggregations.is_empty() {
        streams
    } else {
        apply_aggregations(&request.aggregations, &streams)
    };
    Ok(GetResponse {
        success: true,
        message: None,
        streams,
    })
}

async fn handle_get(State(state): State<AppState>, body: String) -> axum::response::Response {
    let response = match guarded(|| {
        let request: GetRequest = decode_body(&body)?;
        run_get(&state, &request)
    }) {
        Ok(r) => r,
        Err(reply) => return reply,
    };
    encode_reply(&response)
}

async fn handle_get_config(State(state): State<AppState>) -> axum::response::Response {
    encode_reply(&state.config.current())
}

async fn handle_health() -> &'static str {
    "ok\n"
}

/// Mount all routes over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/add", post(handle_add))
        .route("/list", post(handle_list))
        .route("/get", post(handle_get))
        .route("/get_config", get(handle_get_config).post(handle_get_config))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Bring up a storage server: open the store, start the background tasks,
/// and serve HTTP until ctrl-c.
pub async fn run(options: ServerOptions) -> anyhow::Result<()> {
    info!(
        target: "tidemark::server",
        "starting: data_directory={}, listen={}:{}, recordlog_max={}MiB, store_max_ram={}MiB (advisory)",
        options.data_directory.display(),
        options.listen_address,
        options.port,
        options.recordlog_max_log_size_mb,
        options.store_max_ram_mb
    );
    let state = AppState::open(&options)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let tasks = state.start_background_tasks(Arc::clone(&shutdown));

    let bind = format!("{}:{}", options.listen_address, options.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(target: "tidemark::server", "listening on {bind}");

    let flag = Arc::clone(&shutdown);
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "tidemark::server", "shutdown signal received");
            flag.store(true, Ordering::Relaxed);
        })
        .await?;

    shutdown.store(true, Ordering::Relaxed);
    for task in tasks {
        let _ = task.await;
    }
    // One last flush so everything acknowledged is on disk.
    state.store.record_log().flush()?;
    info!(target: "tidemark::server", "shutdown complete");
    Ok(())
}
