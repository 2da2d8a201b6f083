use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{net::TcpListener, sync::Mutex, time::MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use feeder_common::{
    config::MotorHardwareConfig,
    is_plausible_epoch,
    page::{render_history, render_index},
    CivilTimeResolver, FeedEvent, FeederConfig, FeederStatus, FiringEngine, HistoryLog,
    LocalTime, ManualFeedForm, RuntimeConfig, SessionParameters, SettingsForm, SyncedClock,
    TimeView,
};

#[derive(Clone)]
struct AppState {
    settings: Arc<Mutex<SessionParameters>>,
    engine: Arc<Mutex<FiringEngine>>,
    history: Arc<Mutex<HistoryLog>>,
    clock: Arc<Mutex<SyncedClock>>,
    motor: Arc<Mutex<SimulatedMotor>>,
    resolver: CivilTimeResolver,
    feeder: FeederConfig,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    settings_path: Arc<PathBuf>,
    history_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Stand-in for the H-bridge: logs pin transitions and holds for the run.
struct SimulatedMotor {
    pins: MotorHardwareConfig,
    completed_runs: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let settings = store.load_settings().await.unwrap_or_else(|err| {
        warn!("failed to load settings from store: {err:#}");
        SessionParameters::default()
    });

    let mut history = store.load_history().await.unwrap_or_else(|err| {
        warn!("failed to load feeding history from store: {err:#}");
        HistoryLog::default()
    });
    history.normalize();

    info!(
        "settings loaded: am={} pm={} Z={} Y={} X={} gap={} ({} feedings on record)",
        settings.am_end,
        settings.pm_end,
        settings.total_seconds,
        settings.pulse_count,
        settings.short_pulse_seconds,
        settings.gap_minutes,
        history.len(),
    );

    let app_state = AppState {
        settings: Arc::new(Mutex::new(settings)),
        engine: Arc::new(Mutex::new(FiringEngine::new())),
        history: Arc::new(Mutex::new(history)),
        clock: Arc::new(Mutex::new(SyncedClock::new())),
        motor: Arc::new(Mutex::new(SimulatedMotor::new(runtime.motor.clone()))),
        resolver: CivilTimeResolver::from_config(&runtime.clock),
        feeder: runtime.feeder.clone(),
        store,
    };

    spawn_control_loop(app_state.clone());

    let app = Router::new()
        .route("/", get(handle_index))
        .route("/save", post(handle_save))
        .route("/manual", post(handle_manual))
        .route("/getTime", get(handle_get_time))
        .route("/debug", get(handle_debug))
        .route("/api/history", get(handle_get_history))
        .route("/api/status", get(handle_get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("FEEDER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind feeder server at {addr}"))?;

    info!("feeder listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(app_state.feeder.tick_interval_ms));
        // A long pulse holds the loop; skipped ticks are not replayed.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            refresh_clock(&app_state, now_ms).await;
            let Some(now) = local_now(&app_state).await else {
                continue;
            };

            let params = app_state.settings.lock().await.clone();
            let actions = {
                let mut engine = app_state.engine.lock().await;
                engine.tick(&params, &now)
            };

            for action in actions {
                info!(
                    "{} feeding #{} firing for {}s",
                    action.session.label(),
                    action.ordinal,
                    action.duration_seconds
                );
                run_motor(&app_state, action.duration_seconds).await;

                let finished = local_now(&app_state).await.unwrap_or(now);
                record_feed(&app_state, FeedEvent::scheduled(&action, finished.local_epoch)).await;
            }
        }
    });
}

async fn refresh_clock(app_state: &AppState, now_ms: u64) {
    let mut clock = app_state.clock.lock().await;
    if !clock.refresh_due(now_ms, app_state.feeder.time_refresh_interval_ms) {
        return;
    }

    match read_time_source() {
        Ok(utc_epoch) => {
            if !clock.is_synced() {
                info!("time synced: utc epoch {utc_epoch}");
            }
            clock.record_sync(utc_epoch, now_ms);
        }
        Err(err) => {
            clock.record_failure(now_ms);
            warn!(
                "time refresh failed ({} in a row), keeping last known time: {err:#}",
                clock.failed_attempts()
            );
        }
    }
}

fn read_time_source() -> anyhow::Result<i64> {
    let utc_epoch = Utc::now().timestamp();
    if !is_plausible_epoch(utc_epoch) {
        return Err(anyhow!("system clock reports epoch {utc_epoch}"));
    }
    Ok(utc_epoch)
}

async fn local_now(app_state: &AppState) -> Option<LocalTime> {
    let utc_epoch = app_state.clock.lock().await.now_utc(monotonic_ms())?;
    Some(app_state.resolver.resolve(utc_epoch))
}

async fn run_motor(app_state: &AppState, seconds: u16) {
    let mut motor = app_state.motor.lock().await;
    motor.run(seconds).await;
}

async fn record_feed(app_state: &AppState, event: FeedEvent) {
    let mut history = app_state.history.lock().await;
    history.append(event);
    if let Err(err) = app_state.store.save_history(&history).await {
        warn!("failed to persist feeding history: {err:#}");
    }
}

async fn handle_index(State(state): State<AppState>) -> impl IntoResponse {
    let params = state.settings.lock().await.clone();
    Html(render_index(&params, &state.feeder))
}

async fn handle_save(
    State(state): State<AppState>,
    Form(form): Form<SettingsForm>,
) -> impl IntoResponse {
    // Held across the write so concurrent saves commit in order.
    let mut settings = state.settings.lock().await;
    let next = form.apply(&settings);
    if let Err(err) = state.store.save_settings(&next).await {
        warn!("failed to persist settings update: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist settings");
    }

    info!(
        "settings saved: am={} pm={} Z={} Y={} X={} gap={}",
        next.am_end,
        next.pm_end,
        next.total_seconds,
        next.pulse_count,
        next.short_pulse_seconds,
        next.gap_minutes
    );
    *settings = next;

    redirect_home()
}

async fn handle_manual(
    State(state): State<AppState>,
    Form(form): Form<ManualFeedForm>,
) -> impl IntoResponse {
    let seconds = form.duration_seconds(&state.feeder);
    info!("manual feeding for {seconds}s");

    // Detached from the request so a client hanging up cannot cut the pulse short.
    let feeding = tokio::spawn(async move {
        run_motor(&state, seconds).await;

        // Without a synced clock there is no timestamp worth recording.
        match local_now(&state).await {
            Some(now) => record_feed(&state, FeedEvent::manual(now.local_epoch, seconds)).await,
            None => warn!("manual feeding not recorded: time not synced"),
        }
    });

    if let Err(err) = feeding.await {
        warn!("manual feeding task failed: {err}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Manual feeding failed");
    }

    redirect_home()
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let view = match local_now(&state).await {
        Some(now) => TimeView::from_local(&now),
        None => TimeView::unsynced(),
    };
    Json(view)
}

async fn handle_debug(State(state): State<AppState>) -> impl IntoResponse {
    let rows = state.history.lock().await.rows();
    Html(render_history(&rows))
}

async fn handle_get_history(State(state): State<AppState>) -> impl IntoResponse {
    let rows = state.history.lock().await.rows();
    Json(rows)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now = local_now(&state).await;
    let params = state.settings.lock().await.clone();
    let engine = state.engine.lock().await.clone();
    let history = state.history.lock().await.clone();

    Json(FeederStatus::build(&params, &engine, &history, now.as_ref()))
}

impl SimulatedMotor {
    fn new(pins: MotorHardwareConfig) -> Self {
        Self {
            pins,
            completed_runs: 0,
        }
    }

    async fn run(&mut self, seconds: u16) {
        info!(
            "motor on: GPIO{} high, GPIO{} low for {seconds}s",
            self.pins.pin_a, self.pins.pin_b
        );
        tokio::time::sleep(Duration::from_secs(seconds.into())).await;
        self.completed_runs += 1;
        info!("motor off (run #{})", self.completed_runs);
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("FEEDER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.feeder"));
        Self::in_dir(&data_dir)
    }

    fn in_dir(data_dir: &Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            settings_path: Arc::new(data_dir.join("settings.json")),
            history_path: Arc::new(data_dir.join("history.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        self.load_json(&self.runtime_path).await
    }

    async fn load_settings(&self) -> anyhow::Result<SessionParameters> {
        let settings: SessionParameters = self.load_json(&self.settings_path).await?;
        Ok(settings.sanitized())
    }

    async fn save_settings(&self, settings: &SessionParameters) -> anyhow::Result<()> {
        self.save_json(&self.settings_path, settings).await
    }

    async fn load_history(&self) -> anyhow::Result<HistoryLog> {
        self.load_json(&self.history_path).await
    }

    async fn save_history(&self, history: &HistoryLog) -> anyhow::Result<()> {
        self.save_json(&self.history_path, history).await
    }

    async fn load_json<T>(&self, path: &Path) -> anyhow::Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice::<T>(&raw)
                .with_context(|| format!("invalid json in {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so a crash never leaves a half-written record.
        let staging = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&staging, payload).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

fn redirect_home() -> axum::response::Response {
    (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response()
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

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
