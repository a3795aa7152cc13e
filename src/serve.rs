//! Purpose: Serve the patient store over HTTP/JSON.
//! Exports: `ServeConfig`, `serve`, `preflight_config`.
//! Role: Axum router mapping routes to store operations and errors to status codes.
//! Invariants: Error bodies are `{"detail": <message>}`; client errors never log above debug.
//! Invariants: Repeated query parameters keep their last value.
//! Invariants: Requests observe one complete store; SIGHUP reload swaps it atomically.
//! Invariants: Loopback-only unless explicitly allowed.

use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use patient_query::api::{self, Error, ErrorKind, Store};

const HELLO_MESSAGE: &str = "Patient Management System API";
const ABOUT_MESSAGE: &str = "A fully functional API to manage your patient records";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub data_path: PathBuf,
    pub cors_allowed_origins: Vec<String>,
    pub allow_non_loopback: bool,
}

struct AppState {
    data_path: PathBuf,
    store: RwLock<Arc<Store>>,
}

impl AppState {
    fn new(data_path: PathBuf, store: Store) -> Self {
        Self {
            data_path,
            store: RwLock::new(Arc::new(store)),
        }
    }

    fn store(&self) -> Arc<Store> {
        self.store
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    /// Loads the data file in full before swapping, so a failed reload keeps
    /// the current store.
    fn reload(&self) -> Result<usize, Error> {
        let fresh = Arc::new(api::load(&self.data_path)?);
        let count = fresh.len();
        *self
            .store
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = fresh;
        Ok(count)
    }
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    let cors_origins = preflight_config(&config)?;

    init_tracing();

    let store = api::load(&config.data_path)?;
    tracing::info!(
        records = store.len(),
        path = %config.data_path.display(),
        "loaded patient records"
    );
    let state = Arc::new(AppState::new(config.data_path.clone(), store));

    let mut app = router(state.clone());
    if !cors_origins.is_empty() {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET]),
        );
    }
    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, "listening");

    #[cfg(unix)]
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(hangup) => {
            tokio::spawn(reload_on_hangup(state, hangup));
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGHUP handler; reload disabled");
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/about", get(about))
        .route("/healthz", get(healthz))
        .route("/view", get(view))
        .route("/search/:patient_id", get(search))
        .route("/query", get(query))
        .with_state(state)
}

/// Validates the config and returns the parsed CORS origins.
pub fn preflight_config(config: &ServeConfig) -> Result<Vec<HeaderValue>, Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }
    config
        .cors_allowed_origins
        .iter()
        .map(|origin| parse_cors_origin(origin))
        .collect()
}

fn parse_cors_origin(origin: &str) -> Result<HeaderValue, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid --cors-origin value: {origin}"))
            .with_hint("Use an origin like https://app.example.com (scheme and host, no path).")
    };
    let url = url::Url::parse(origin).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    if url.path() != "/" || url.query().is_some() || origin.ends_with('/') {
        return Err(invalid());
    }
    HeaderValue::from_str(origin).map_err(|_| invalid())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

#[cfg(unix)]
async fn reload_on_hangup(state: Arc<AppState>, mut hangup: tokio::signal::unix::Signal) {
    while hangup.recv().await.is_some() {
        let state = state.clone();
        let result = tokio::task::spawn_blocking(move || state.reload()).await;
        match result {
            Ok(Ok(records)) => tracing::info!(records, "reloaded patient records"),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "reload failed; keeping previous records")
            }
            Err(err) => tracing::warn!(error = %err, "reload task failed"),
        }
    }
}

#[derive(Debug, Default)]
struct QueryParams {
    name: Option<String>,
    age: Option<String>,
    city: Option<String>,
    sort_by: Option<String>,
    order: Option<String>,
}

/// What `/query` runs once the raw parameters are parsed.
#[derive(Debug, PartialEq)]
enum QueryPlan {
    Run(api::Query),
    /// `age` was a valid integer outside the stored range; sort inputs are
    /// still validated before reporting no match.
    NoAgeMatch(api::Query),
}

#[derive(Debug, PartialEq)]
enum AgeParam {
    Exact(i64),
    OutOfRange,
}

impl QueryParams {
    /// Repeated keys keep their last value; unknown keys are ignored.
    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "name" => &mut params.name,
                "age" => &mut params.age,
                "city" => &mut params.city,
                "sort_by" => &mut params.sort_by,
                "order" => &mut params.order,
                _ => continue,
            };
            *slot = Some(value);
        }
        params
    }

    fn into_plan(self) -> Result<QueryPlan, Error> {
        let age = self.age.as_deref().map(parse_age).transpose()?;
        let mut query = api::Query {
            name: self.name,
            age: None,
            city: self.city,
            sort_by: self.sort_by,
            order: self.order,
        };
        match age {
            None => Ok(QueryPlan::Run(query)),
            Some(AgeParam::Exact(age)) => {
                query.age = Some(age);
                Ok(QueryPlan::Run(query))
            }
            Some(AgeParam::OutOfRange) => Ok(QueryPlan::NoAgeMatch(query)),
        }
    }
}

/// Accepts an optionally signed integer, also written with an all-zero
/// fraction like `30.0`.
fn parse_age(raw: &str) -> Result<AgeParam, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("age must be an integer")
            .with_hint("Use a whole number like age=30.")
    };
    let raw = raw.trim();
    let integer = match raw.split_once('.') {
        None => raw,
        Some((integer, fraction))
            if !fraction.is_empty() && fraction.bytes().all(|b| b == b'0') =>
        {
            integer
        }
        Some(_) => return Err(invalid()),
    };
    let digits = integer.strip_prefix(['+', '-']).unwrap_or(integer);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    Ok(integer
        .parse::<i64>()
        .map_or(AgeParam::OutOfRange, AgeParam::Exact))
}

async fn hello() -> Response {
    Json(json!({ "message": HELLO_MESSAGE })).into_response()
}

async fn about() -> Response {
    Json(json!({ "message": ABOUT_MESSAGE })).into_response()
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn view(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store();
    Json(store.get_all()).into_response()
}

async fn search(
    State(state): State<Arc<AppState>>,
    AxumPath(patient_id): AxumPath<String>,
) -> Response {
    let store = state.store();
    match store.get_by_id(&patient_id) {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

async fn query(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let plan = match QueryParams::from_pairs(pairs).into_plan() {
        Ok(plan) => plan,
        Err(err) => return error_response(err),
    };
    let store = state.store();
    let result = match plan {
        QueryPlan::Run(query) => store.filter_and_sort(&query),
        QueryPlan::NoAgeMatch(query) => query.validate().and_then(|()| {
            Err(Error::new(ErrorKind::NoMatch).with_message(api::NO_MATCH_MESSAGE))
        }),
    };
    match result {
        Ok(records) => Json(records).into_response(),
        Err(err) => error_response(err),
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound | ErrorKind::NoMatch => StatusCode::NOT_FOUND,
        ErrorKind::InvalidSortField | ErrorKind::InvalidOrder => StatusCode::BAD_REQUEST,
        ErrorKind::Usage => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Io | ErrorKind::Corrupt | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    if err.kind().is_client_error() {
        tracing::debug!(kind = ?err.kind(), status = status.as_u16(), "request rejected");
    } else {
        tracing::error!(error = %err, "request failed");
    }
    let detail = err.message().unwrap_or("error").to_string();
    (status, Json(json!({ "detail": detail }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::{
        AgeParam, AppState, QueryParams, QueryPlan, ServeConfig, parse_age, preflight_config,
        router, serve, status_for,
    };
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use patient_query::api::{self, ErrorKind, Query};
    use serde_json::{Value, json};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tower_service::Service;

    const FIXTURE: &str = r#"{
        "P001": {"name": "Ananya Sharma", "city": "Guwahati", "age": 28},
        "P002": {"name": "Ravi Mehta", "city": "Mumbai", "age": 35},
        "P003": {"name": "Dev Bora", "city": "Guwahati", "age": 9},
        "P004": {"name": "Bikash Das", "city": "Guwahati", "age": 10}
    }"#;

    fn config(bind: &str) -> ServeConfig {
        ServeConfig {
            bind: bind.parse().expect("bind"),
            data_path: PathBuf::from("patients.json"),
            cors_allowed_origins: Vec::new(),
            allow_non_loopback: false,
        }
    }

    fn state() -> Arc<AppState> {
        let store = api::from_json_str(FIXTURE).expect("fixture");
        Arc::new(AppState::new(PathBuf::from("unused.json"), store))
    }

    async fn get(uri: &str) -> (StatusCode, Value) {
        let mut app = router(state());
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        let response = app.call(request).await.expect("infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).expect("json body");
        (status, value)
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let err = serve(config("0.0.0.0:0")).await.expect_err("usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn serve_fails_when_data_file_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = config("127.0.0.1:0");
        config.data_path = temp.path().join("missing.json");
        let err = serve(config).await.expect_err("io error");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn non_loopback_allowed_with_flag() {
        let mut config = config("0.0.0.0:8000");
        config.allow_non_loopback = true;
        preflight_config(&config).expect("config ok");
    }

    #[test]
    fn cors_origins_are_validated() {
        let mut config = config("127.0.0.1:8000");
        config.cors_allowed_origins = vec!["https://app.example.com".to_string()];
        assert_eq!(preflight_config(&config).expect("origins").len(), 1);

        for bad in ["app.example.com", "https://app.example.com/path", "*", "ftp://x"] {
            config.cors_allowed_origins = vec![bad.to_string()];
            let err = preflight_config(&config).expect_err("usage error");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::NoMatch), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::InvalidSortField), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::InvalidOrder), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Usage), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::Corrupt), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn info_routes_return_messages() {
        let (status, body) = get("/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "Patient Management System API"}));

        let (status, body) = get("/about").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"message": "A fully functional API to manage your patient records"})
        );
    }

    #[tokio::test]
    async fn view_returns_whole_store() {
        let (status, body) = get("/view").await;
        assert_eq!(status, StatusCode::OK);
        let expected: Value = serde_json::from_str(FIXTURE).expect("json");
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn search_known_and_unknown_ids() {
        let (status, body) = get("/search/P002").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Ravi Mehta");

        let (status, body) = get("/search/P999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"detail": "Patient not found"}));
    }

    #[tokio::test]
    async fn query_filters_and_sorts() {
        let (status, body) = get("/query?city=Guwahati&sort_by=name&order=asc").await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|record| record["name"].as_str())
            .collect();
        assert_eq!(names, vec!["Ananya Sharma", "Bikash Das", "Dev Bora"]);

        let (status, body) = get("/query?city=Guwahati&sort_by=age").await;
        assert_eq!(status, StatusCode::OK);
        let ages: Vec<i64> = body
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|record| record["age"].as_i64())
            .collect();
        assert_eq!(ages, vec![10, 28, 9]);

        let (status, body) = get("/query?name=Ananya%20Sharma&age=28").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    fn names(body: &Value) -> Vec<&str> {
        body.as_array()
            .expect("array")
            .iter()
            .filter_map(|record| record["name"].as_str())
            .collect()
    }

    #[test]
    fn repeated_parameters_keep_last_value() {
        let pairs = [
            ("city", "Guwahati"),
            ("city", "Mumbai"),
            ("page", "2"),
            ("sort_by", "age"),
        ]
        .map(|(key, value)| (key.to_string(), value.to_string()));
        let plan = QueryParams::from_pairs(pairs.to_vec())
            .into_plan()
            .expect("plan");
        assert_eq!(
            plan,
            QueryPlan::Run(Query::new().with_city("Mumbai").with_sort_by("age"))
        );
    }

    #[test]
    fn age_accepts_integral_forms() {
        assert_eq!(parse_age("30").expect("age"), AgeParam::Exact(30));
        assert_eq!(parse_age(" -4 ").expect("age"), AgeParam::Exact(-4));
        assert_eq!(parse_age("+7").expect("age"), AgeParam::Exact(7));
        assert_eq!(parse_age("30.0").expect("age"), AgeParam::Exact(30));
        assert_eq!(parse_age("30.000").expect("age"), AgeParam::Exact(30));
        assert_eq!(
            parse_age("99999999999999999999999").expect("age"),
            AgeParam::OutOfRange
        );
        for bad in ["", "thirty", "30.5", "30.", ".0", "3e1", "+-3", "0x1e"] {
            let err = parse_age(bad).expect_err("invalid age");
            assert_eq!(err.kind(), ErrorKind::Usage, "{bad:?}");
        }
    }

    #[tokio::test]
    async fn empty_sort_parameters_are_ignored() {
        let (status, body) = get("/query?sort_by=").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            names(&body),
            vec!["Ananya Sharma", "Ravi Mehta", "Dev Bora", "Bikash Das"]
        );

        let (status, body) = get("/query?city=Guwahati&sort_by=name&order=").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(names(&body), vec!["Ananya Sharma", "Bikash Das", "Dev Bora"]);

        let (status, body) = get("/query?order=sideways&sort_by=").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"detail": "Invalid order"}));
    }

    #[tokio::test]
    async fn repeated_query_parameters_answer_with_json() {
        let (status, body) = get("/query?city=Guwahati&city=Mumbai").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(names(&body), vec!["Ravi Mehta"]);

        let (status, body) = get("/query?city=Mumbai&city=Nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"detail": "No patients found matching the query"}));
    }

    #[tokio::test]
    async fn age_query_accepts_integral_decimals_and_large_integers() {
        let (status, body) = get("/query?age=28.0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(names(&body), vec!["Ananya Sharma"]);

        let (status, body) = get("/query?age=99999999999999999999999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"detail": "No patients found matching the query"}));

        let (status, body) = get("/query?age=99999999999999999999999&sort_by=height").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"detail": "Invalid sort_by field"}));
    }

    #[tokio::test]
    async fn query_errors_map_to_status_and_detail() {
        let cases = [
            (
                "/query?sort_by=height",
                StatusCode::BAD_REQUEST,
                "Invalid sort_by field",
            ),
            (
                "/query?sort_by=age&order=sideways",
                StatusCode::BAD_REQUEST,
                "Invalid order",
            ),
            (
                "/query?sort_by=height&order=sideways",
                StatusCode::BAD_REQUEST,
                "Invalid sort_by field",
            ),
            (
                "/query?city=Nowhere",
                StatusCode::NOT_FOUND,
                "No patients found matching the query",
            ),
            (
                "/query?age=thirty",
                StatusCode::UNPROCESSABLE_ENTITY,
                "age must be an integer",
            ),
        ];
        for (uri, expected_status, expected_detail) in cases {
            let (status, body) = get(uri).await;
            assert_eq!(status, expected_status, "{uri}");
            assert_eq!(body, json!({"detail": expected_detail}), "{uri}");
        }
    }

    #[test]
    fn reload_swaps_store_and_keeps_old_on_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("patients.json");
        std::fs::write(&path, FIXTURE).expect("write");
        let store = api::load(&path).expect("load");
        let state = AppState::new(path.clone(), store);
        let before = state.store();
        assert_eq!(before.len(), 4);

        std::fs::write(&path, r#"{"P100": {"name": "New"}}"#).expect("write");
        assert_eq!(state.reload().expect("reload"), 1);
        assert!(state.store().contains("P100"));
        // Readers holding the previous snapshot keep seeing it in full.
        assert_eq!(before.len(), 4);

        std::fs::write(&path, "{broken").expect("write");
        let err = state.reload().expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(state.store().contains("P100"));
    }
}
