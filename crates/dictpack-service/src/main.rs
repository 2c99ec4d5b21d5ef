use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use dictpack_api::{
    CatalogConfig, CatalogService, DownloadOutcome, MarkRequest, PayloadHandle, ProtocolVersion,
    API_CONTRACT_VERSION,
};
use dictpack_core::{CatalogError, RemoteWordList, WordListKey};
use http::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: CatalogService,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ProtocolQuery {
    protocol: Option<String>,
    result: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClientQuery {
    #[serde(default)]
    client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClientRequest {
    #[serde(default)]
    client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    client_id: String,
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ReconcileRequest {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    dry_run: bool,
    word_lists: Vec<RemoteWordList>,
}

#[derive(Debug, Clone, Deserialize)]
struct MarkBody {
    #[serde(default)]
    client_id: String,
    id: String,
    version: u32,
    request: MarkRequest,
}

#[derive(Debug, Clone, Deserialize)]
struct DownloadFinishedRequest {
    #[serde(default)]
    client_id: String,
    #[serde(flatten)]
    outcome: DownloadOutcome,
}

#[derive(Debug, Clone, Deserialize)]
struct CorruptPayloadRequest {
    #[serde(default)]
    client_id: String,
    id: String,
    version: u32,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteResponse {
    affected: usize,
}

#[derive(Debug, Parser)]
#[command(name = "dictpack-service")]
#[command(about = "Local HTTP service serving dictionary word-list catalogs")]
struct Args {
    #[arg(long, default_value = "./dictpack-data")]
    data_dir: PathBuf,
    /// Directory holding downloaded word-list files. Defaults to `<data-dir>/payloads`.
    #[arg(long)]
    payload_dir: Option<PathBuf>,
    /// Skip actions whose preconditions warn instead of applying them.
    #[arg(long)]
    strict: bool,
    #[arg(long)]
    auto_download_updates: bool,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn api_error(err: &anyhow::Error) -> ServiceError {
        match err.downcast_ref::<CatalogError>() {
            Some(catalog_err) => Self::catalog_error(catalog_err),
            None => Self::error(format!("{err:#}")),
        }
    }

    fn catalog_error(err: &CatalogError) -> ServiceError {
        let status = match err {
            CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
            CatalogError::Validation(_) | CatalogError::Unsupported(_) => StatusCode::BAD_REQUEST,
        };
        ServiceError { status, ..Self::error(err.to_string()) }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route(
            "/v1/catalog/*path",
            get(catalog_query).post(catalog_insert).delete(catalog_delete),
        )
        .route("/v1/payload/*path", get(payload_open))
        .route("/v1/reconcile", post(reconcile))
        .route("/v1/mark", post(mark))
        .route("/v1/downloads", get(downloads_pending))
        .route("/v1/downloads/:job_id/finished", post(download_finished))
        .route("/v1/downloads/corrupt", post(download_corrupt))
        .route("/v1/clients", get(clients_list))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = CatalogConfig::new(args.data_dir)
        .with_payload_dir(args.payload_dir)
        .with_strict(args.strict)
        .with_auto_download_updates(args.auto_download_updates);
    let state = ServiceState { api: CatalogService::open(config)? };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "dictpack service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [(CONTENT_TYPE, "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

/// Run catalog work on the blocking pool. Store calls do synchronous SQLite I/O and may wait
/// on a namespace writer lock, which must never park a runtime worker.
async fn run_catalog<T, F>(state: &ServiceState, task: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&CatalogService) -> Result<T, ServiceError> + Send + 'static,
{
    let api = state.api.clone();
    tokio::task::spawn_blocking(move || task(&api))
        .await
        .map_err(|err| ServiceState::error(format!("catalog task failed: {err}")))?
}

async fn catalog_query(
    State(state): State<ServiceState>,
    Path(path): Path<String>,
    Query(query): Query<ProtocolQuery>,
) -> Result<Json<ServiceEnvelope<dictpack_api::QueryResult>>, ServiceError> {
    let version = ProtocolVersion::from_query(query.protocol.as_deref());
    let result = run_catalog(&state, move |api| {
        api.query(version, &path).map_err(|err| ServiceState::catalog_error(&err))
    })
    .await?;
    Ok(Json(envelope(result)))
}

async fn catalog_insert(
    State(state): State<ServiceState>,
    Path(path): Path<String>,
    Query(query): Query<ProtocolQuery>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ServiceEnvelope<Option<dictpack_core::BatchReport>>>, ServiceError> {
    let version = ProtocolVersion::from_query(query.protocol.as_deref());
    let report = run_catalog(&state, move |api| {
        api.insert(version, &path, body).map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(report)))
}

async fn catalog_delete(
    State(state): State<ServiceState>,
    Path(path): Path<String>,
    Query(query): Query<ProtocolQuery>,
) -> Result<Json<ServiceEnvelope<DeleteResponse>>, ServiceError> {
    let version = ProtocolVersion::from_query(query.protocol.as_deref());
    let failure = query.result.as_deref() == Some("failure");
    let affected = run_catalog(&state, move |api| {
        api.delete(version, &path, failure).map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(DeleteResponse { affected })))
}

async fn payload_open(
    State(state): State<ServiceState>,
    Path(path): Path<String>,
    Query(query): Query<ProtocolQuery>,
) -> Result<Response, ServiceError> {
    let version = ProtocolVersion::from_query(query.protocol.as_deref());
    let route_path = path.clone();
    let handle = run_catalog(&state, move |api| {
        api.open_route(version, &route_path).map_err(|err| ServiceState::catalog_error(&err))
    })
    .await?;

    let bytes = match handle {
        PayloadHandle::Empty => Vec::new(),
        PayloadHandle::File(file) => match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(path = %file.display(), error = %err, "failed to read payload");
                return Err(ServiceState::catalog_error(&CatalogError::NotFound(format!(
                    "payload for {path} is unreadable"
                ))));
            }
        },
    };
    Ok((StatusCode::OK, [(CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

async fn reconcile(
    State(state): State<ServiceState>,
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<ServiceEnvelope<dictpack_api::ReconcileOutcome>>, ServiceError> {
    let outcome = run_catalog(&state, move |api| {
        api.reconcile(&request.client_id, request.word_lists, request.dry_run)
            .map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(outcome)))
}

async fn mark(
    State(state): State<ServiceState>,
    Json(request): Json<MarkBody>,
) -> Result<Json<ServiceEnvelope<dictpack_core::BatchReport>>, ServiceError> {
    let report = run_catalog(&state, move |api| {
        let key = WordListKey::new(request.id, request.version);
        api.mark(&request.client_id, &key, request.request)
            .map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(report)))
}

async fn downloads_pending(
    State(state): State<ServiceState>,
    Query(query): Query<ClientQuery>,
) -> Result<Json<ServiceEnvelope<Vec<dictpack_api::PendingDownload>>>, ServiceError> {
    let pending = run_catalog(&state, move |api| {
        api.pending_downloads(&query.client_id).map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(pending)))
}

async fn download_finished(
    State(state): State<ServiceState>,
    Path(job_id): Path<i64>,
    Json(request): Json<DownloadFinishedRequest>,
) -> Result<Json<ServiceEnvelope<dictpack_core::BatchReport>>, ServiceError> {
    let report = run_catalog(&state, move |api| {
        api.download_finished(&request.client_id, job_id, request.outcome)
            .map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(report)))
}

async fn download_corrupt(
    State(state): State<ServiceState>,
    Json(request): Json<CorruptPayloadRequest>,
) -> Result<Json<ServiceEnvelope<dictpack_core::BatchReport>>, ServiceError> {
    let report = run_catalog(&state, move |api| {
        let key = WordListKey::new(request.id, request.version);
        api.report_corrupt_payload(&request.client_id, &key)
            .map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(report)))
}

async fn clients_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<dictpack_api::ClientRecord>>>, ServiceError> {
    let clients =
        run_catalog(&state, |api| api.list_clients().map_err(|err| ServiceState::api_error(&err)))
            .await?;
    Ok(Json(envelope(clients)))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
    Json(request): Json<ClientRequest>,
) -> Result<Json<ServiceEnvelope<dictpack_api::SchemaStatus>>, ServiceError> {
    let status = run_catalog(&state, move |api| {
        api.schema_status(&request.client_id).map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<dictpack_api::MigrateResult>>, ServiceError> {
    let result = run_catalog(&state, move |api| {
        api.migrate(&request.client_id, request.dry_run)
            .map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
    Json(request): Json<ClientRequest>,
) -> Result<Json<ServiceEnvelope<dictpack_api::IntegrityReport>>, ServiceError> {
    let report = run_catalog(&state, move |api| {
        api.integrity_check(&request.client_id).map_err(|err| ServiceState::api_error(&err))
    })
    .await?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn unique_state() -> (ServiceState, PathBuf) {
        let data_dir = std::env::temp_dir().join(format!("dictpack-service-{}", ulid::Ulid::new()));
        let api = match CatalogService::open(CatalogConfig::new(&data_dir)) {
            Ok(api) => api,
            Err(err) => panic!("failed to open catalog service: {err}"),
        };
        (ServiceState { api }, data_dir)
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_bytes(response: Response) -> Vec<u8> {
        match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => panic!("failed to read response body: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response_bytes(response).await;
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    fn remote_feed(version: u32) -> serde_json::Value {
        serde_json::json!([{
            "id": "main:en",
            "locale": "en",
            "description": "English",
            "update": 1_700_000_000_000_i64,
            "filesize": 2,
            "checksum": "c0ffee",
            "url": format!("https://dict.example/main-en/{version}"),
            "version": version,
            "formatversion": 2
        }])
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (state, data_dir) = unique_state();
        let router = app(state);

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        let _ = std::fs::remove_dir_all(&data_dir);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_parseable_artifact() {
        let (state, data_dir) = unique_state();
        let router = app(state);

        let response = send(&router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = match String::from_utf8(response_bytes(response).await) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        let document = match serde_yaml::from_str::<serde_yaml::Value>(&body) {
            Ok(document) => document,
            Err(err) => panic!("openapi artifact is not YAML: {err}"),
        };
        assert_eq!(
            document.get("info").and_then(|info| info.get("version")).and_then(|v| v.as_str()),
            Some(SERVICE_CONTRACT_VERSION)
        );
        let paths = document.get("paths").and_then(serde_yaml::Value::as_mapping);
        assert!(paths.is_some_and(|paths| paths.contains_key("/v1/reconcile")));
        let _ = std::fs::remove_dir_all(&data_dir);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn sync_download_and_serve_payload_flow() {
        let (state, data_dir) = unique_state();
        let payload_dir = state.api.registry().config().payload_dir.clone();
        let router = app(state);

        let response = send(
            &router,
            "POST",
            "/v1/reconcile",
            Some(serde_json::json!({ "word_lists": remote_feed(1) })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &router,
            "POST",
            "/v1/mark",
            Some(serde_json::json!({ "id": "main:en", "version": 1, "request": "used" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let pending = response_json(send(&router, "GET", "/v1/downloads", None).await).await;
        let job_id = pending
            .get("data")
            .and_then(|data| data.get(0))
            .and_then(|job| job.get("job_id"))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_else(|| panic!("missing pending download job: {pending}"));

        if let Err(err) = std::fs::write(payload_dir.join("main-en-1.dict"), b"en") {
            panic!("failed to write payload fixture: {err}");
        }
        let response = send(
            &router,
            "POST",
            &format!("/v1/downloads/{job_id}/finished"),
            Some(serde_json::json!({ "outcome": "succeeded", "local_filename": "main-en-1.dict" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let resolved =
            response_json(send(&router, "GET", "/v1/catalog/en_GB", None).await).await;
        assert_eq!(
            resolved
                .get("data")
                .and_then(|data| data.get("items"))
                .and_then(|items| items.get(0))
                .and_then(|item| item.get("id"))
                .and_then(serde_json::Value::as_str),
            Some("main:en")
        );

        let response = send(&router, "GET", "/v1/payload/main:en", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_bytes(response).await, b"en".to_vec());

        let _ = std::fs::remove_dir_all(&data_dir);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn deleting_payload_serves_empty_body_then_not_found() {
        let (state, data_dir) = unique_state();
        let router = app(state);

        let response = send(
            &router,
            "POST",
            "/v1/catalog/keyboard/metadata?protocol=2",
            Some(serde_json::json!({ "metadata_uri": "" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(
            &router,
            "POST",
            "/v1/catalog/keyboard/dict/de?protocol=2",
            Some(serde_json::json!({ "id": "main:de", "locale": "de" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &router,
            "POST",
            "/v1/mark",
            Some(serde_json::json!({
                "client_id": "keyboard",
                "id": "main:de",
                "version": 1,
                "request": "deleting"
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response =
            send(&router, "GET", "/v1/payload/keyboard/datafile/main:de?protocol=2", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response_bytes(response).await.is_empty());

        let response =
            send(&router, "DELETE", "/v1/catalog/keyboard/datafile/main:de?protocol=2", None).await;
        let value = response_json(response).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("affected"))
                .and_then(serde_json::Value::as_u64),
            Some(1)
        );

        let response =
            send(&router, "GET", "/v1/payload/keyboard/datafile/main:de?protocol=2", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_dir_all(&data_dir);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn v1_insert_and_unknown_routes_are_rejected() {
        let (state, data_dir) = unique_state();
        let router = app(state);

        let response = send(
            &router,
            "POST",
            "/v1/catalog/en",
            Some(serde_json::json!({ "id": "main:en", "locale": "en" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&router, "GET", "/v1/catalog/keyboard/bogus?protocol=2", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value.get("error").and_then(serde_json::Value::as_str).is_some());

        let response = send(&router, "GET", "/v1/catalog/ghost/list?protocol=2", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let _ = std::fs::remove_dir_all(&data_dir);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn reads_proceed_while_a_write_waits_on_the_writer_lock() {
        let (state, data_dir) = unique_state();
        let router = app(state.clone());

        let response = send(
            &router,
            "POST",
            "/v1/reconcile",
            Some(serde_json::json!({ "word_lists": remote_feed(1) })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let catalog = state.api.registry().default_catalog();
        let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let released = std::sync::Arc::clone(&released);
            std::thread::spawn(move || {
                let guard = match catalog.writer() {
                    Ok(guard) => guard,
                    Err(err) => panic!("failed to take the catalog writer: {err}"),
                };
                let _ = locked_tx.send(());
                std::thread::sleep(std::time::Duration::from_secs(1));
                released.store(true, std::sync::atomic::Ordering::SeqCst);
                drop(guard);
            })
        };
        if let Err(err) = locked_rx.recv() {
            panic!("writer holder exited early: {err}");
        }

        let mark_router = router.clone();
        let mark = tokio::spawn(async move {
            send(
                &mark_router,
                "POST",
                "/v1/mark",
                Some(serde_json::json!({ "id": "main:en", "version": 1, "request": "used" })),
            )
            .await
            .status()
        });
        tokio::task::yield_now().await;

        let listed = send(&router, "GET", "/v1/catalog/list", None).await;
        assert_eq!(listed.status(), StatusCode::OK);
        assert!(!released.load(std::sync::atomic::Ordering::SeqCst));

        match mark.await {
            Ok(status) => assert_eq!(status, StatusCode::OK),
            Err(err) => panic!("mark task failed: {err}"),
        }
        if holder.join().is_err() {
            panic!("writer holder panicked");
        }
        let _ = std::fs::remove_dir_all(&data_dir);
    }
}
