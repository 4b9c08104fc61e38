use std::{
    collections::HashMap, io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc,
    time::Duration,
};

use aircon_common::{RuntimeConfig, SeasonalMode, SmartAirconController};
use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, time::Instant};
use tracing::{info, warn};

use crate::ha::HaRestClient;

const STATUS_PUBLISH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<SmartAirconController>>,
    home: Arc<HaRestClient>,
}

#[derive(Clone)]
struct ConfigStore {
    path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load().await.unwrap_or_else(|err| {
        warn!("failed to load config from {}: {err:#}", store.path.display());
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    if runtime.zones.is_empty() {
        warn!("no zones configured, the controller will only manage the main unit");
    }
    if runtime.home_assistant.token.is_empty() {
        warn!("no Home Assistant token configured, requests will be rejected");
    }

    let home = HaRestClient::new(&runtime.home_assistant.url, &runtime.home_assistant.token)?;
    let mut controller = SmartAirconController::new(&runtime);
    let missing = controller.validate_entities(&home, local_now()).await;
    if !missing.is_empty() {
        warn!("{} configured entities are missing: {missing:?}", missing.len());
    }

    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        home: Arc::new(home),
    };

    spawn_control_loop(
        app_state.clone(),
        Duration::from_secs(runtime.controller.check_interval_secs),
    );
    spawn_status_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/enabled", post(handle_set_enabled))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/tolerance", post(handle_set_tolerance))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(url) = std::env::var("HA_URL") {
        runtime.home_assistant.url = url;
    }
    if let Ok(token) = std::env::var("HA_TOKEN") {
        runtime.home_assistant.token = token;
    }
    if let Some(port) = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.http_port = port;
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Runs the periodic check on its interval and wakes early for queued
/// activation and verification steps. Deadlines are monotonic; local time
/// is only handed to the controller.
fn spawn_control_loop(app_state: AppState, interval: Duration) {
    tokio::spawn(async move {
        let mut next_check = Instant::now();

        loop {
            let wake = {
                let mut controller = app_state.controller.lock().await;
                if Instant::now() >= next_check {
                    controller
                        .periodic_check(app_state.home.as_ref(), local_now())
                        .await;
                    next_check = Instant::now() + interval;
                }

                let now = local_now();
                controller.run_due_tasks(app_state.home.as_ref(), now).await;
                next_wake(next_check, now, controller.next_task_due())
            };

            tokio::time::sleep_until(wake).await;
        }
    });
}

// Queued steps are stamped in local time; only their remaining delay is
// carried over to the monotonic clock.
fn next_wake(next_check: Instant, now: NaiveDateTime, task_due: Option<NaiveDateTime>) -> Instant {
    match task_due {
        Some(due) => {
            let delay = (due - now).to_std().unwrap_or(Duration::ZERO);
            next_check.min(Instant::now() + delay)
        }
        None => next_check,
    }
}

fn spawn_status_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_PUBLISH_INTERVAL);
        loop {
            interval.tick().await;
            let controller = app_state.controller.lock().await;
            controller
                .publish_status(app_state.home.as_ref(), local_now())
                .await;
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let controller = state.controller.lock().await;
    Json(controller.status(local_now()))
}

async fn handle_set_enabled(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let enabled = match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => true,
        "off" | "false" | "0" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'"),
    };

    let mut controller = state.controller.lock().await;
    controller.set_enabled(state.home.as_ref(), enabled).await;
    Json(controller.status(local_now())).into_response()
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let mode = SeasonalMode::parse(value);
    if mode == SeasonalMode::Unknown {
        return error_response(StatusCode::BAD_REQUEST, "Invalid mode. Use 'heat' or 'cool'");
    }

    let mut controller = state.controller.lock().await;
    controller.set_smart_hvac_mode(state.home.as_ref(), mode).await;
    Json(controller.status(local_now())).into_response()
}

async fn handle_set_tolerance(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(tolerance) = value.parse::<f32>().ok().filter(|v| v.is_finite()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid tolerance value (0.1-5.0)");
    };

    let mut controller = state.controller.lock().await;
    let applied = controller
        .set_temp_tolerance(state.home.as_ref(), tolerance)
        .await;
    if applied != tolerance {
        info!("tolerance {tolerance} clamped to {applied}");
    }
    Json(controller.status(local_now())).into_response()
}

impl ConfigStore {
    fn new() -> Self {
        let path = std::env::var("AIRCON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./aircon.json"));
        Self {
            path: Arc::new(path),
        }
    }

    async fn load(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid config in {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("{} not found, using defaults", self.path.display());
                Ok(RuntimeConfig::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
