use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use upvote_ledger_core::{
    LedgerError, ProjectCatalog, ProjectName, ShowcaseEntry, ToggleOutcome, UpvoteTally, UserId,
};

mod api;
mod identity;

use api::{LedgerApi, ResetResult, UpvoteStatus};
use identity::{resolve_user_id, CookiePolicy};

const SERVICE_CONTRACT_VERSION: &str = "upvote-service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: LedgerApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
    cookie_policy: CookiePolicy,
    admin_token: Option<Arc<str>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleRequest {
    #[serde(default)]
    project_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpvoteQuery {
    #[serde(default)]
    project_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: upvote_ledger_store_sqlite::SchemaStatus,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    degraded_read_total: AtomicU64,
    invalid_request_total: AtomicU64,
    validation_error_total: AtomicU64,
    write_conflict_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    degraded_read_total: u64,
    invalid_request_total: u64,
    validation_error_total: u64,
    write_conflict_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunMode {
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "upvote-ledger-service")]
#[command(about = "HTTP service for hackathon project upvotes")]
struct Args {
    #[arg(long, env = "UPVOTE_LEDGER_DB", default_value = "./upvote_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "UPVOTE_LEDGER_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "UPVOTE_LEDGER_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// JSON project catalog; the built-in catalog is used when omitted.
    #[arg(long, env = "UPVOTE_LEDGER_CATALOG")]
    catalog: Option<PathBuf>,
    /// `production` marks the identity cookie `Secure`.
    #[arg(long, env = "UPVOTE_LEDGER_MODE", value_enum, default_value_t = RunMode::Development)]
    mode: RunMode,
    /// Bearer token for `POST /admin/upvotes/reset`. Reset is disabled without it.
    #[arg(long, env = "UPVOTE_LEDGER_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
    #[arg(long, env = "UPVOTE_LEDGER_LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long, env = "UPVOTE_LEDGER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_query(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_query", false);
        Self::failure(
            rejection.status(),
            "invalid_query",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn validation_failure(&self, field: &'static str, err: &LedgerError) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            err.to_string(),
            Some(json!({ "field": field })),
        )
    }

    fn project_name(
        &self,
        raw: Option<String>,
    ) -> Result<ProjectName, ServiceFailure> {
        let raw = raw.ok_or_else(|| {
            self.validation_failure(
                "projectName",
                &LedgerError::Validation("projectName must be provided".to_string()),
            )
        })?;
        ProjectName::parse(raw).map_err(|err| self.validation_failure("projectName", &err))
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();

        if let Some(LedgerError::Validation(detail)) = err.downcast_ref::<LedgerError>() {
            return Self::failure(
                StatusCode::BAD_REQUEST,
                "validation_error",
                detail.clone(),
                None,
            );
        }

        let normalized = format!("{err:#}").to_ascii_lowercase();

        if normalized.contains("unique constraint failed") {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }

        if normalized.contains("no such table")
            || normalized.contains("schema")
            || normalized.contains("sqlite")
            || normalized.contains("database")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(LedgerApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                warn!(
                    operation = operation_label,
                    code = failure.code,
                    error = %format!("{err:#}"),
                    "ledger operation failed"
                );
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    /// Runs a read feeding page rendering. Failures are logged and replaced
    /// by `fallback` so pages still render with zero counts.
    async fn run_degradable<T, F>(&self, operation_label: &'static str, fallback: T, op: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(LedgerApi) -> anyhow::Result<T> + Send + 'static,
    {
        match self
            .run_blocking(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", operation_label, op)
            .await
        {
            Ok(value) => value,
            Err(failure) => {
                self.telemetry.degraded_read_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    operation = operation_label,
                    code = failure.code,
                    "serving empty upvote aggregates"
                );
                fallback
            }
        }
    }

    fn authorize_admin(&self, headers: &HeaderMap) -> Result<(), ServiceFailure> {
        let Some(expected) = self.admin_token.as_deref() else {
            self.telemetry.record_failure("reset_disabled", false);
            return Err(Self::failure(
                StatusCode::FORBIDDEN,
                "reset_disabled",
                "upvote reset is disabled; configure an admin token to enable it",
                None,
            ));
        };

        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        match presented {
            Some(token) if admin_token_matches(token, expected) => Ok(()),
            _ => {
                self.telemetry.record_failure("unauthorized", false);
                Err(Self::failure(
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    "missing or invalid admin bearer token",
                    None,
                ))
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" | "invalid_query" => {
                self.invalid_request_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "write_conflict" => {
                self.write_conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "store_unavailable" => {
                self.store_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            degraded_read_total: self.degraded_read_total.load(Ordering::Relaxed),
            invalid_request_total: self.invalid_request_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn admin_token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/upvote", post(upvote_toggle).get(upvote_status))
        .route("/upvotes", get(upvotes_all))
        .route("/projects", get(projects_list))
        .route("/projects/:slug", get(project_show))
        .route("/admin/upvotes/reset", post(admin_reset))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().pretty().with_env_filter(filter).init(),
    }
}

fn load_catalog(path: Option<&FsPath>) -> Result<ProjectCatalog> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read project catalog {}", path.display()))?;
            ProjectCatalog::from_json(&raw)
                .with_context(|| format!("invalid project catalog {}", path.display()))
        }
        None => ProjectCatalog::builtin().context("invalid built-in project catalog"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format);

    let catalog = load_catalog(args.catalog.as_deref())?;
    info!(projects = catalog.projects().len(), "loaded project catalog");

    let api = LedgerApi::new(args.db, catalog);
    let schema = api.migrate()?;
    info!(
        db = %api.db_path().display(),
        schema_version = schema.current_version,
        "upvote store ready"
    );

    if args.admin_token.is_none() {
        info!("admin reset endpoint disabled (no admin token configured)");
    }

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
        cookie_policy: CookiePolicy::new(args.mode == RunMode::Production),
        admin_token: args.admin_token.map(Arc::from),
    };

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, mode = ?args.mode, "upvote ledger service listening");

    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;

    info!("upvote ledger service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(err) => {
                warn!(error = %err, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                warn!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ReadinessResponse>, ServiceFailure> {
    let schema_status = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "schema_status",
            |api| api.schema_status(),
        )
        .await?;

    if schema_status.is_current() {
        return Ok(Json(ReadinessResponse { status: "ready", checks: schema_status }));
    }

    state.telemetry.record_failure("store_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "store_unavailable",
        "upvote store schema is not at the target version",
        Some(json!({
            "current_version": schema_status.current_version,
            "target_version": schema_status.target_version,
            "pending_versions": schema_status.pending_versions
        })),
    ))
}

async fn upvote_toggle(
    State(state): State<ServiceState>,
    jar: CookieJar,
    payload: Result<Json<ToggleRequest>, JsonRejection>,
) -> Result<(CookieJar, Json<ToggleOutcome>), ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let project = state.project_name(request.project_name)?;
    let (user_id, jar) = resolve_user_id(jar, &state.cookie_policy);

    let outcome = {
        let project = project.clone();
        let user_id = user_id.clone();
        state
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "write_failed",
                "toggle_upvote",
                move |api| api.toggle_upvote(&project, &user_id),
            )
            .await?
    };

    info!(
        project = %project,
        user_id = %user_id,
        action = outcome.action.as_str(),
        "upvote toggled"
    );
    Ok((jar, Json(outcome)))
}

async fn upvote_status(
    State(state): State<ServiceState>,
    jar: CookieJar,
    query: Result<Query<UpvoteQuery>, QueryRejection>,
) -> Result<(CookieJar, Json<UpvoteStatus>), ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query(&rejection))?;
    let project = state.project_name(query.project_name)?;
    let (user_id, jar) = resolve_user_id(jar, &state.cookie_policy);

    let status = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "upvote_status",
            move |api| api.upvote_status(&project, &user_id),
        )
        .await?;
    Ok((jar, Json(status)))
}

async fn upvotes_all(
    State(state): State<ServiceState>,
    jar: CookieJar,
) -> (CookieJar, Json<UpvoteTally>) {
    let (user_id, jar) = resolve_user_id(jar, &state.cookie_policy);
    let tally = state
        .run_degradable("tally_upvotes", UpvoteTally::empty(), move |api| api.tally(&user_id))
        .await;
    (jar, Json(tally))
}

async fn projects_list(
    State(state): State<ServiceState>,
    jar: CookieJar,
) -> (CookieJar, Json<Vec<ShowcaseEntry>>) {
    let (user_id, jar) = resolve_user_id(jar, &state.cookie_policy);
    let tally = state
        .run_degradable("tally_upvotes", UpvoteTally::empty(), move |api| api.tally(&user_id))
        .await;
    (jar, Json(state.api.showcase(&tally)))
}

async fn project_show(
    State(state): State<ServiceState>,
    jar: CookieJar,
    Path(slug): Path<String>,
) -> Result<(CookieJar, Json<ShowcaseEntry>), ServiceFailure> {
    let Some(project) = state.api.catalog().find_by_slug(&slug).cloned() else {
        state.telemetry.record_failure("project_not_found", false);
        return Err(ServiceState::failure(
            StatusCode::NOT_FOUND,
            "project_not_found",
            format!("no project with slug {slug:?}"),
            None,
        ));
    };

    let (user_id, jar) = resolve_user_id(jar, &state.cookie_policy);
    let name = ProjectName::parse(project.name.clone())
        .map_err(|err| state.validation_failure("slug", &err))?;
    let status = state
        .run_degradable(
            "project_upvote_status",
            UpvoteStatus { count: 0, user_upvoted: false },
            move |api| api.upvote_status(&name, &user_id),
        )
        .await;

    Ok((
        jar,
        Json(ShowcaseEntry {
            slug: project.slug(),
            upvotes: status.count,
            user_upvoted: status.user_upvoted,
            project,
        }),
    ))
}

async fn admin_reset(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ResetResult>, ServiceFailure> {
    state.authorize_admin(&headers)?;
    let result = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "reset_failed",
            "reset_upvotes",
            |api| api.reset_all(),
        )
        .await?;
    warn!(removed = result.removed, "all upvotes reset by admin");
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("upvote-ledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn unreachable_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("upvote-ledger-missing-parent-{}/db.sqlite3", ulid::Ulid::new()))
    }

    fn builtin_catalog() -> ProjectCatalog {
        match ProjectCatalog::builtin() {
            Ok(catalog) => catalog,
            Err(err) => panic!("built-in catalog must be valid: {err}"),
        }
    }

    fn migrated_api(db_path: &FsPath) -> LedgerApi {
        let api = LedgerApi::new(db_path.to_path_buf(), builtin_catalog());
        if let Err(err) = api.migrate() {
            panic!("failed to migrate test store: {err:#}");
        }
        api
    }

    fn test_state(api: LedgerApi, timeout_ms: u64) -> ServiceState {
        ServiceState {
            api,
            operation_timeout: Duration::from_millis(timeout_ms),
            telemetry: Arc::new(ServiceTelemetry::default()),
            cookie_policy: CookiePolicy::new(false),
            admin_token: None,
        }
    }

    fn remove_db(db_path: &FsPath) {
        let _ = std::fs::remove_file(db_path);
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = db_path.as_os_str().to_owned();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(sidecar));
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).method("GET");
        if let Some(user) = user {
            builder = builder.header("cookie", format!("userId={user}"));
        }
        builder.body(Body::empty()).unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn toggle_request(body: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/upvote")
            .method("POST")
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("cookie", format!("userId={user}"));
        }
        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn toggle(router: &Router, project: &str, user: &str) -> serde_json::Value {
        let body = json!({ "projectName": project }).to_string();
        let response = send(router, toggle_request(&body, Some(user))).await;
        assert_eq!(response.status(), StatusCode::OK);
        response_json(response).await
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn set_cookie(response: &Response) -> Option<String> {
        response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    }

    fn error_code(value: &serde_json::Value) -> Option<&str> {
        value.get("error").and_then(|error| error.get("code")).and_then(serde_json::Value::as_str)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state(LedgerApi::new(unique_temp_db_path(), builtin_catalog()), 2500));

        let response = send(&router, get_request("/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(serde_json::Value::as_str), Some("ok"));
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn ready_endpoint_reports_ready_when_schema_is_current() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));

        let response = send(&router, get_request("/ready", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(serde_json::Value::as_str), Some("ready"));

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn ready_endpoint_returns_store_unavailable_when_db_is_unreachable() {
        let api = LedgerApi::new(unreachable_db_path(), builtin_catalog());
        let router = app(test_state(api, 2500));

        let response = send(&router, get_request("/ready", None)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("store_unavailable"));
    }

    #[tokio::test]
    async fn toggle_and_status_follow_the_majorana_scenario() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));

        let first = toggle(&router, "Majorana", "u1").await;
        assert_eq!(first["action"], json!("added"));
        assert_eq!(first["message"], json!("Upvote added successfully"));

        let status = response_json(
            send(&router, get_request("/upvote?projectName=Majorana", Some("u1"))).await,
        )
        .await;
        assert_eq!(status, json!({ "count": 1, "userUpvoted": true }));

        let second = toggle(&router, "Majorana", "u2").await;
        assert_eq!(second["action"], json!("added"));

        let third = toggle(&router, "Majorana", "u1").await;
        assert_eq!(third["action"], json!("removed"));

        let status = response_json(
            send(&router, get_request("/upvote?projectName=Majorana", Some("u1"))).await,
        )
        .await;
        assert_eq!(status, json!({ "count": 1, "userUpvoted": false }));

        let missing = response_json(
            send(&router, get_request("/upvote?projectName=NonexistentProject", Some("u1"))).await,
        )
        .await;
        assert_eq!(missing, json!({ "count": 0, "userUpvoted": false }));

        let tally_u2 = response_json(send(&router, get_request("/upvotes", Some("u2"))).await).await;
        assert_eq!(tally_u2["projectCounts"], json!({ "Majorana": 1 }));
        assert_eq!(tally_u2["userUpvoted"], json!(["Majorana"]));

        let tally_u1 = response_json(send(&router, get_request("/upvotes", Some("u1"))).await).await;
        assert_eq!(tally_u1["userUpvoted"], json!([]));

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn first_visit_issues_identity_cookie_and_returning_visit_reuses_it() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));

        let body = json!({ "projectName": "Gaid" }).to_string();
        let response = send(&router, toggle_request(&body, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = match set_cookie(&response) {
            Some(cookie) => cookie,
            None => panic!("first visit must receive a userId cookie"),
        };
        for attribute in ["userId=", "HttpOnly", "SameSite=Strict", "Path=/", "Max-Age=31536000"] {
            assert!(cookie.contains(attribute), "missing {attribute} in {cookie}");
        }
        assert!(!cookie.contains("Secure"), "development cookies must not be Secure: {cookie}");

        let issued = cookie
            .split(';')
            .next()
            .and_then(|pair| pair.strip_prefix("userId="))
            .unwrap_or_else(|| panic!("unexpected Set-Cookie shape: {cookie}"))
            .to_string();

        let again = send(&router, get_request("/upvote?projectName=Gaid", Some(issued.as_str()))).await;
        assert!(set_cookie(&again).is_none(), "known identity must not be reissued");
        let value = response_json(again).await;
        assert_eq!(value, json!({ "count": 1, "userUpvoted": true }));

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn production_mode_marks_identity_cookie_secure() {
        let db_path = unique_temp_db_path();
        let mut state = test_state(migrated_api(&db_path), 2500);
        state.cookie_policy = CookiePolicy::new(true);
        let router = app(state);

        let response = send(&router, get_request("/upvotes", None)).await;
        let cookie = set_cookie(&response).unwrap_or_default();
        assert!(cookie.contains("Secure"), "production cookies must be Secure: {cookie}");

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn malformed_identity_cookie_is_replaced() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));

        let response = send(&router, get_request("/upvotes", Some("bad%20value"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(set_cookie(&response).is_some());

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn toggle_rejects_missing_or_blank_project_name() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));

        for body in ["{}", r#"{"projectName": ""}"#, r#"{"projectName": "   "}"#] {
            let response = send(&router, toggle_request(body, Some("u1"))).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body={body}");
            let value = response_json(response).await;
            assert_eq!(error_code(&value), Some("validation_error"));
            assert_eq!(value["error"]["details"]["field"], json!("projectName"));
        }

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn toggle_rejects_invalid_json() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));

        let response = send(&router, toggle_request("{", Some("u1"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("invalid_json"));
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn status_requires_project_name_query() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));

        for uri in ["/upvote", "/upvote?projectName="] {
            let response = send(&router, get_request(uri, Some("u1"))).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri={uri}");
            let value = response_json(response).await;
            assert_eq!(error_code(&value), Some("validation_error"));
        }

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn toggle_against_unmigrated_store_is_unavailable() {
        let db_path = unique_temp_db_path();
        let router =
            app(test_state(LedgerApi::new(db_path.clone(), builtin_catalog()), 2500));

        let body = json!({ "projectName": "Majorana" }).to_string();
        let response = send(&router, toggle_request(&body, Some("u1"))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("store_unavailable"));

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn read_all_degrades_to_empty_aggregates_when_store_fails() {
        let state = test_state(LedgerApi::new(unreachable_db_path(), builtin_catalog()), 2500);
        let telemetry = Arc::clone(&state.telemetry);
        let router = app(state);

        let response = send(&router, get_request("/upvotes", Some("u1"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value, json!({ "projectCounts": {}, "userUpvoted": [] }));

        let projects = send(&router, get_request("/projects", Some("u1"))).await;
        assert_eq!(projects.status(), StatusCode::OK);
        let listing = response_json(projects).await;
        let all_zero = listing
            .as_array()
            .is_some_and(|entries| entries.iter().all(|entry| entry["upvotes"] == json!(0)));
        assert!(all_zero, "degraded listing must show zero counts: {listing}");

        assert_eq!(telemetry.snapshot().degraded_read_total, 2);
    }

    #[tokio::test]
    async fn projects_listing_orders_podium_then_upvotes() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));

        toggle(&router, "Gaid", "u1").await;
        toggle(&router, "Gaid", "u2").await;
        toggle(&router, "Coddy", "u1").await;

        let listing = response_json(send(&router, get_request("/projects", Some("u2"))).await).await;
        let names: Vec<&str> = listing
            .as_array()
            .map(|entries| {
                entries.iter().filter_map(|entry| entry["name"].as_str()).collect()
            })
            .unwrap_or_default();
        assert_eq!(&names[..5], &["Majorana", "Burro Speech", "U0", "Gaid", "Coddy"]);

        let gaid = listing
            .as_array()
            .and_then(|entries| entries.iter().find(|entry| entry["name"] == json!("Gaid")))
            .cloned()
            .unwrap_or_default();
        assert_eq!(gaid["upvotes"], json!(2));
        assert_eq!(gaid["userUpvoted"], json!(true));
        assert_eq!(gaid["slug"], json!("gaid"));

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn project_detail_resolves_slug_or_returns_not_found() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(migrated_api(&db_path), 2500));
        toggle(&router, "Que Comí", "u7").await;

        let response = send(&router, get_request("/projects/que-comi", Some("u7"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["name"], json!("Que Comí"));
        assert_eq!(value["upvotes"], json!(1));
        assert_eq!(value["userUpvoted"], json!(true));

        let missing = send(&router, get_request("/projects/no-such-project", Some("u7"))).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let value = response_json(missing).await;
        assert_eq!(error_code(&value), Some("project_not_found"));

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn admin_reset_requires_configured_bearer_token() {
        let db_path = unique_temp_db_path();
        let disabled = app(test_state(migrated_api(&db_path), 2500));
        let reset = || {
            Request::builder()
                .uri("/admin/upvotes/reset")
                .method("POST")
                .body(Body::empty())
                .unwrap_or_else(|err| panic!("failed to build request: {err}"))
        };

        let response = send(&disabled, reset()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(&response_json(response).await), Some("reset_disabled"));

        let mut state = test_state(migrated_api(&db_path), 2500);
        state.admin_token = Some(Arc::from("s3cret"));
        let router = app(state);
        toggle(&router, "Majorana", "u1").await;
        toggle(&router, "Gaid", "u1").await;

        let wrong = Request::builder()
            .uri("/admin/upvotes/reset")
            .method("POST")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, wrong).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let authorized = Request::builder()
            .uri("/admin/upvotes/reset")
            .method("POST")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = send(&router, authorized).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["removed"], json!(2));

        let tally = response_json(send(&router, get_request("/upvotes", Some("u1"))).await).await;
        assert_eq!(tally["projectCounts"], json!({}));

        remove_db(&db_path);
    }

    #[tokio::test]
    async fn run_blocking_times_out_with_mapped_error_status() {
        let state = test_state(LedgerApi::new(unique_temp_db_path(), builtin_catalog()), 1);

        let result = state
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "write_failed",
                "unit_timeout_operation",
                |_api| {
                    std::thread::sleep(Duration::from_millis(25));
                    Ok::<_, anyhow::Error>(())
                },
            )
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(err.code, "write_failed");
                assert!(err.message.contains("timed out"), "unexpected message: {}", err.message);
            }
        }

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 1);
        assert_eq!(snapshot.timeout_total, 1);
    }

    #[test]
    fn classify_maps_validation_and_sqlite_failures() {
        let validation = anyhow::Error::new(LedgerError::Validation("bad name".to_string()))
            .context("toggle failed");
        let failure = ServiceState::classify_api_error(
            &validation,
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
        );
        assert_eq!(failure.status, StatusCode::BAD_REQUEST);
        assert_eq!(failure.code, "validation_error");

        let sqlite = anyhow::anyhow!("no such table: upvotes").context("failed to insert upvote");
        let failure =
            ServiceState::classify_api_error(&sqlite, StatusCode::INTERNAL_SERVER_ERROR, "write_failed");
        assert_eq!(failure.code, "store_unavailable");

        let other = anyhow::anyhow!("boom");
        let failure =
            ServiceState::classify_api_error(&other, StatusCode::INTERNAL_SERVER_ERROR, "write_failed");
        assert_eq!(failure.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failure.code, "write_failed");
    }

    #[test]
    fn admin_token_match_requires_the_whole_token() {
        assert!(admin_token_matches("s3cret", "s3cret"));
        assert!(!admin_token_matches("s3cree", "s3cret"));
        assert!(!admin_token_matches("s3c", "s3cret"));
        assert!(!admin_token_matches("s3cret-longer", "s3cret"));
        assert!(!admin_token_matches("", "s3cret"));
    }
}
