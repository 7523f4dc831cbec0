//! Shared helpers for integration tests
//!
//! - [`FakeFeed`]: an axum server standing in for the live feed. Responses are
//!   keyed by the `bounds` query parameter, so each area can get its own body
//!   or error status.
//! - [`FakeCollector`]: an upload endpoint that counts the frames it receives.
//! - [`TestDatabase`]: an isolated Postgres database cloned from a migrated
//!   template, dropped again when the test ends.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use aerotrack::area::Area;
use aerotrack::config::{AreaBox, AreasConfig, PipelineConfig};
use aerotrack::uploader::UPLOAD_PATH;
use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::MigrationHarness;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Test server has no address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// One feed record with the column layout of the live feed
pub fn feed_record(icao: &str, lat: f64, lon: f64, timestamp: i64) -> serde_json::Value {
    serde_json::json!([
        icao, lat, lon, 90, 35000, 450, "1000", "F-TEST1", "A320", "D-ABCD", timestamp, "FRA",
        "LHR", "LH900", 0, 0, "DLH900", 0, "DLH"
    ])
}

/// Feed response body holding `records` under synthetic record ids
pub fn feed_body(records: &[serde_json::Value]) -> String {
    let mut body = serde_json::Map::new();
    body.insert("full_count".into(), serde_json::json!(records.len()));
    body.insert("version".into(), serde_json::json!(4));
    for (i, record) in records.iter().enumerate() {
        body.insert(format!("rec{:04}", i), record.clone());
    }
    serde_json::Value::Object(body).to_string()
}

#[derive(Clone)]
enum FeedResponse {
    Body(String),
    Status(StatusCode),
    Slow(Duration, String),
}

#[derive(Default)]
struct FeedState {
    responses: Mutex<HashMap<String, FeedResponse>>,
    requests: AtomicUsize,
}

/// Fake live feed
pub struct FakeFeed {
    addr: SocketAddr,
    state: Arc<FeedState>,
}

async fn feed_handler(
    State(state): State<Arc<FeedState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let response = params
        .get("bounds")
        .and_then(|bounds| state.responses.lock().unwrap().get(bounds).cloned());

    match response {
        Some(FeedResponse::Body(body)) => body.into_response(),
        Some(FeedResponse::Status(status)) => status.into_response(),
        Some(FeedResponse::Slow(delay, body)) => {
            tokio::time::sleep(delay).await;
            body.into_response()
        }
        // Unknown areas are empty
        None => feed_body(&[]).into_response(),
    }
}

impl FakeFeed {
    pub async fn start() -> Self {
        let state = Arc::new(FeedState::default());
        let app = Router::new()
            .route("/feed.js", get(feed_handler))
            .with_state(state.clone());
        let addr = serve(app).await;
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/feed.js", self.addr)
    }

    pub fn respond(&self, area: &Area, records: &[serde_json::Value]) {
        self.set(area, FeedResponse::Body(feed_body(records)));
    }

    pub fn fail(&self, area: &Area, status: StatusCode) {
        self.set(area, FeedResponse::Status(status));
    }

    pub fn respond_slowly(&self, area: &Area, delay: Duration, records: &[serde_json::Value]) {
        self.set(area, FeedResponse::Slow(delay, feed_body(records)));
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    fn set(&self, area: &Area, response: FeedResponse) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(area.bounds_param(), response);
    }
}

#[derive(Default)]
struct CollectorState {
    delay: Duration,
    uploads: AtomicUsize,
    frames: AtomicUsize,
    icaos: Mutex<Vec<String>>,
}

/// Fake upload endpoint
pub struct FakeCollector {
    addr: SocketAddr,
    state: Arc<CollectorState>,
}

async fn upload_handler(
    State(state): State<Arc<CollectorState>>,
    Json(frames): Json<Vec<serde_json::Value>>,
) -> StatusCode {
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    state.uploads.fetch_add(1, Ordering::SeqCst);
    state.frames.fetch_add(frames.len(), Ordering::SeqCst);
    let mut icaos = state.icaos.lock().unwrap();
    for frame in &frames {
        if let Some(icao) = frame.get("icao").and_then(|v| v.as_str()) {
            icaos.push(icao.to_string());
        }
    }
    StatusCode::OK
}

impl FakeCollector {
    pub async fn start() -> Self {
        Self::start_slow(Duration::ZERO).await
    }

    /// Collector that holds every upload for `delay` before answering
    pub async fn start_slow(delay: Duration) -> Self {
        let state = Arc::new(CollectorState {
            delay,
            ..Default::default()
        });
        let app = Router::new()
            .route(UPLOAD_PATH, post(upload_handler))
            .with_state(state.clone());
        let addr = serve(app).await;
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn uploads(&self) -> usize {
        self.state.uploads.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.state.frames.load(Ordering::SeqCst)
    }

    pub fn icaos(&self) -> Vec<String> {
        self.state.icaos.lock().unwrap().clone()
    }

    /// Wait until at least `count` frames arrived, up to `timeout`
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.frames() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.frames() >= count
    }
}

/// Config polling exactly `areas` from `feed`, uploader off
pub fn config_for(feed: &FakeFeed, areas: &[Area]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.feed.base_url = feed.url();
    config.feed.request_timeout_secs = 2;
    config.feed.cycle_timeout_secs = 5;
    config.areas = AreasConfig {
        presets: Vec::new(),
        boxes: areas
            .iter()
            .map(|area| AreaBox {
                name: Some(area.name().to_string()),
                lat_top_left: area.lat_top_left(),
                lat_bottom_right: area.lat_bottom_right(),
                lon_top_left: area.lon_top_left(),
                lon_bottom_right: area.lon_bottom_right(),
            })
            .collect(),
        grid: None,
    };
    config
}

// Ensure migrations only run once per test session
static TEMPLATE_READY: Once = Once::new();
static NEXT_DB: AtomicU64 = AtomicU64::new(0);

const TEMPLATE_DB: &str = "aerotrack_test_template";

type PgPool = Pool<ConnectionManager<PgConnection>>;

fn base_url() -> String {
    dotenvy::dotenv().ok();
    std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/aerotrack_test".to_string())
}

/// URL of another database on the same server
fn with_database(url: &str, db_name: &str) -> String {
    match url.rfind('/') {
        Some(i) => format!("{}/{}", &url[..i], db_name),
        None => format!("{}/{}", url, db_name),
    }
}

#[derive(QueryableByName)]
struct TemplateExists {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    exists: bool,
}

/// Create the template database if needed and bring it to the latest schema
fn ensure_template_migrated() {
    TEMPLATE_READY.call_once(|| {
        let base = base_url();
        let admin_url = with_database(&base, "postgres");
        let template_url = with_database(&base, TEMPLATE_DB);

        if let Ok(mut admin) = PgConnection::establish(&admin_url) {
            let exists = diesel::sql_query(format!(
                "SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = '{}') AS exists",
                TEMPLATE_DB
            ))
            .get_result::<TemplateExists>(&mut admin)
            .map(|r| r.exists);
            if exists != Ok(true) {
                let _ = diesel::sql_query(format!("CREATE DATABASE {}", TEMPLATE_DB))
                    .execute(&mut admin);
            }
            let _ = diesel::sql_query(format!(
                "UPDATE pg_database SET datistemplate = FALSE, datallowconn = TRUE \
                 WHERE datname = '{}'",
                TEMPLATE_DB
            ))
            .execute(&mut admin);
        }

        if let Ok(mut template) = PgConnection::establish(&template_url) {
            if let Err(e) = template.run_pending_migrations(aerotrack::pg_store::MIGRATIONS) {
                eprintln!("Warning: Failed to run migrations on template: {}", e);
            }
        }
        // Let Postgres finish closing the template connection before cloning
        std::thread::sleep(Duration::from_millis(50));

        if let Ok(mut admin) = PgConnection::establish(&admin_url) {
            let _ = diesel::sql_query(format!(
                "UPDATE pg_database SET datistemplate = TRUE, datallowconn = FALSE \
                 WHERE datname = '{}'",
                TEMPLATE_DB
            ))
            .execute(&mut admin);
        }
    });
}

/// An isolated database cloned from the migrated template.
///
/// Dropped with `DROP DATABASE ... WITH (FORCE)` (Postgres 13+) when this
/// value goes out of scope, also when the test panics.
pub struct TestDatabase {
    db_name: String,
    pool: PgPool,
    admin_url: String,
}

impl TestDatabase {
    pub async fn new() -> Result<Self> {
        ensure_template_migrated();

        let base = base_url();
        let admin_url = with_database(&base, "postgres");
        let db_name = format!(
            "aerotrack_test_{}_{}",
            std::process::id(),
            NEXT_DB.fetch_add(1, Ordering::SeqCst)
        );

        let create_url = admin_url.clone();
        let create_name = db_name.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&create_url)
                .context("Failed to connect to PostgreSQL. Is it running?")?;
            diesel::sql_query(format!(
                "CREATE DATABASE {} TEMPLATE {}",
                create_name, TEMPLATE_DB
            ))
            .execute(&mut conn)
            .with_context(|| format!("Failed to create {}", create_name))?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        let manager = ConnectionManager::<PgConnection>::new(with_database(&base, &db_name));
        let pool = Pool::builder()
            .max_size(5)
            .build(manager)
            .with_context(|| format!("Failed to create connection pool for {}", db_name))?;

        Ok(Self {
            db_name,
            pool,
            admin_url,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn name(&self) -> &str {
        &self.db_name
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if let Ok(mut conn) = PgConnection::establish(&self.admin_url) {
            let _ = diesel::sql_query(format!(
                "DROP DATABASE IF EXISTS {} WITH (FORCE)",
                self.db_name
            ))
            .execute(&mut conn);
        }
    }
}
