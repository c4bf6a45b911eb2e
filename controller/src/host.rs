use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveTime, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{info, warn};

use growlight_common::{
    AccountConfig, ControllerStatus, LampStatePayload, MqttConfig, RuntimeConfig, ScheduleConfig,
    TimingReport, TOPIC_CONTROLLER_STATE, TOPIC_CONTROLLER_STATUS,
};

use crate::{
    cloud::{CloudError, DeviceSession, HttpTransport, Transport},
    reconciler::{Reconciler, TickOutcome},
};

const MQTT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type SharedReconciler<T> = Arc<Mutex<Reconciler<DeviceSession<T>>>>;

struct AppState<T = HttpTransport> {
    // Timer ticks and admin requests all go through this lock.
    reconciler: SharedReconciler<T>,
    schedule: Arc<ScheduleConfig>,
    clock: LocalClock,
    mqtt: Option<AsyncClient>,
    // Wakes the state publish loop after the lamp changed.
    state_changed: Arc<Notify>,
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            schedule: Arc::clone(&self.schedule),
            clock: self.clock.clone(),
            mqtt: self.mqtt.clone(),
            state_changed: Arc::clone(&self.state_changed),
        }
    }
}

impl<T: Transport> AppState<T> {
    fn new(
        schedule: ScheduleConfig,
        session: DeviceSession<T>,
        clock: LocalClock,
        mqtt: Option<AsyncClient>,
    ) -> Self {
        Self {
            reconciler: Arc::new(Mutex::new(Reconciler::new(schedule.clone(), session))),
            schedule: Arc::new(schedule),
            clock,
            mqtt,
            state_changed: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ApplyResponse {
    outcome: &'static str,
    target: u8,
    #[serde(rename = "lastApplied")]
    last_applied: Option<u8>,
}

/// Wall clock in the account's timezone, or the host's when it does not parse.
#[derive(Debug, Clone)]
enum LocalClock {
    Zone(Tz),
    System,
}

impl LocalClock {
    fn from_timezone(name: &str) -> Self {
        match name.parse::<Tz>() {
            Ok(tz) => Self::Zone(tz),
            Err(_) => {
                if !name.is_empty() {
                    warn!("unknown timezone {name:?}, using system local time");
                }
                Self::System
            }
        }
    }

    fn now(&self) -> NaiveTime {
        match self {
            Self::Zone(tz) => Utc::now().with_timezone(tz).time(),
            Self::System => Local::now().time(),
        }
    }

    fn name(&self) -> String {
        match self {
            Self::Zone(tz) => tz.name().to_string(),
            Self::System => "system".to_string(),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let schedule = store.load_schedule().await?;
    let account = store.load_account().await?;
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let clock = LocalClock::from_timezone(&account.timezone);
    log_timing(&schedule.describe_timing(&clock.now()));

    let transport =
        HttpTransport::new(&runtime.cloud).context("failed to build cloud http client")?;
    let session = DeviceSession::new(
        transport,
        account,
        Duration::from_secs(runtime.cloud.token_ttl_secs),
    );

    let app_state = AppState::new(
        schedule,
        session,
        clock,
        runtime.mqtt.as_ref().map(connect_mqtt),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control_loop = spawn_control_loop(
        app_state.clone(),
        Duration::from_secs(runtime.controller.tick_interval_secs),
        shutdown_rx.clone(),
    );
    let publish_loop = app_state.mqtt.is_some().then(|| {
        spawn_state_publish_loop(
            app_state.clone(),
            Duration::from_secs(runtime.controller.state_publish_interval_secs),
            shutdown_rx,
        )
    });

    let app = router(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.controller.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Let an in-flight tick finish so its outcome is recorded.
    if let Err(err) = control_loop.await {
        warn!("control loop ended abnormally: {err}");
    }
    if let Some(handle) = publish_loop {
        if let Err(err) = handle.await {
            warn!("state publish loop ended abnormally: {err}");
        }
    }
    if let Some(mqtt) = &app_state.mqtt {
        announce_offline(mqtt).await;
    }

    info!("controller stopped");
    Ok(())
}

fn router<T: Transport + 'static>(app_state: AppState<T>) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status::<T>))
        .route("/api/timing", get(handle_get_timing::<T>))
        .route("/api/apply", post(handle_apply::<T>))
        .route("/api/switch", post(handle_switch::<T>))
        .route("/api/device", get(handle_get_device::<T>))
        .with_state(app_state)
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, finishing in-flight work");
    let _ = shutdown.send(true);
}

fn spawn_control_loop<T: Transport + 'static>(
    app_state: AppState<T>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("configuration loaded, starting control loop");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            run_tick(&app_state, false).await;
        }

        info!("control loop stopped");
    })
}

fn spawn_state_publish_loop<T: Transport + 'static>(
    app_state: AppState<T>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = app_state.state_changed.notified() => {}
                _ = shutdown.changed() => break,
            }
            publish_state(&app_state).await;
        }
    })
}

async fn run_tick<T: Transport>(app_state: &AppState<T>, force: bool) -> TickOutcome {
    let now = app_state.clock.now();
    let outcome = {
        let mut reconciler = app_state.reconciler.lock().await;
        if force {
            reconciler.forget_last_applied();
        }
        reconciler.tick(now).await
    };

    if matches!(outcome, TickOutcome::Applied(_)) {
        app_state.state_changed.notify_one();
    }
    outcome
}

fn connect_mqtt(config: &MqttConfig) -> AsyncClient {
    let mut options = MqttOptions::new("growlight-controller", config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        TOPIC_CONTROLLER_STATUS,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if !config.user.is_empty() {
        options.set_credentials(config.user.clone(), config.pass.clone());
    }

    let (mqtt, eventloop) = AsyncClient::new(options, 32);
    spawn_mqtt_loop(mqtt.clone(), eventloop);
    mqtt
}

fn spawn_mqtt_loop(mqtt: AsyncClient, mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // Non-blocking: this task is the one draining the request queue.
                    if let Err(err) =
                        mqtt.try_publish(TOPIC_CONTROLLER_STATUS, QoS::AtLeastOnce, true, "online")
                    {
                        warn!("online status publish failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Queues the retained lamp state without waiting on the broker.
async fn publish_state<T: Transport>(app_state: &AppState<T>) {
    let Some(mqtt) = &app_state.mqtt else {
        return;
    };

    let now = app_state.clock.now();
    let (phase, target) = app_state.schedule.evaluate(&now);
    let last_applied = app_state.reconciler.lock().await.state().last_applied;
    let payload = LampStatePayload {
        brightness: last_applied,
        target,
        phase: phase.as_str(),
        on: last_applied.map(|level| level > 0),
    };

    match serde_json::to_vec(&payload) {
        Ok(body) => {
            if let Err(err) =
                mqtt.try_publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
            {
                warn!("lamp state publish failed: {err}");
            }
        }
        Err(err) => warn!("lamp state serialization failed: {err}"),
    }
}

async fn announce_offline(mqtt: &AsyncClient) {
    let publish = mqtt.publish(TOPIC_CONTROLLER_STATUS, QoS::AtLeastOnce, true, "offline");
    match tokio::time::timeout(MQTT_SHUTDOWN_TIMEOUT, publish).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("offline status publish failed: {err}"),
        Err(_) => warn!("offline status publish timed out"),
    }
    match tokio::time::timeout(MQTT_SHUTDOWN_TIMEOUT, mqtt.disconnect()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("mqtt disconnect failed: {err}"),
        Err(_) => warn!("mqtt disconnect timed out"),
    }
}

async fn handle_get_status<T: Transport + 'static>(
    State(state): State<AppState<T>>,
) -> impl IntoResponse {
    let now = state.clock.now();
    let (phase, target) = state.schedule.evaluate(&now);

    let status = {
        let reconciler = state.reconciler.lock().await;
        let stats = reconciler.stats();
        ControllerStatus {
            last_applied: reconciler.state().last_applied,
            target,
            phase: phase.as_str(),
            session_state: reconciler.driver().state().as_str(),
            lamp: reconciler.driver().lamp().cloned(),
            ticks: stats.ticks,
            applied_count: stats.applied,
            failed_count: stats.failed,
            last_error: reconciler.last_error().map(str::to_string),
            timezone: state.clock.name(),
            local_time: now.format("%H:%M:%S").to_string(),
        }
    };

    Json(status)
}

async fn handle_get_timing<T: Transport + 'static>(
    State(state): State<AppState<T>>,
) -> impl IntoResponse {
    Json(state.schedule.describe_timing(&state.clock.now()))
}

async fn handle_apply<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let force = params
        .get("force")
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "1"));

    let tick = run_tick(&state, force).await;
    let target = tick.target();
    let outcome = match tick {
        TickOutcome::Applied(_) => "applied",
        TickOutcome::Remains(_) => "remains",
        TickOutcome::Failed { error, .. } => return cloud_error_response(&error),
    };

    let last_applied = state.reconciler.lock().await.state().last_applied;
    Json(ApplyResponse {
        outcome,
        target,
        last_applied,
    })
    .into_response()
}

async fn handle_switch<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let on = match value.to_ascii_lowercase().as_str() {
        "on" => true,
        "off" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'"),
    };

    let result = {
        let mut reconciler = state.reconciler.lock().await;
        reconciler.driver_mut().toggle_switch(on).await
    };
    if let Err(err) = result {
        warn!("manual switch failed: {err}");
        return cloud_error_response(&err);
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_device<T: Transport + 'static>(
    State(state): State<AppState<T>>,
) -> impl IntoResponse {
    let mut reconciler = state.reconciler.lock().await;
    let session = reconciler.driver_mut();
    if let Err(err) = session.ensure_device().await {
        warn!("device discovery failed: {err}");
        return cloud_error_response(&err);
    }

    match session.lamp() {
        Some(lamp) => Json(lamp.clone()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No lamp discovered"),
    }
}

fn log_timing(report: &TimingReport) {
    info!("timing data for reference time {}", report.reference_time);
    info!(
        "  baseline ramp {:.0}s, plateau offset {}s",
        report.baseline_ramp_secs, report.offset_secs
    );
    info!(
        "  sunrise ramp {:.0}s, sunset ramp {:.0}s",
        report.sunrise_ramp_secs, report.sunset_ramp_secs
    );
    info!(
        "  sunrise at {}, plateau {} to {} at {}%, sunset at {}",
        report.sunrise_at,
        report.plateau_start,
        report.plateau_end,
        report.plateau_brightness,
        report.sunset_at
    );
    info!(
        "  now {} -> {}%",
        report.phase.as_str(),
        report.target_brightness
    );
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Some(port) = env_parse::<u16>("GROWLIGHT_HTTP_PORT") {
        runtime.controller.http_port = port;
    }

    if let Ok(host) = std::env::var("MQTT_HOST") {
        let mqtt = runtime.mqtt.get_or_insert_with(|| MqttConfig {
            host: String::new(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
        });
        mqtt.host = host;
    }
    if let Some(mqtt) = runtime.mqtt.as_mut() {
        if let Some(port) = env_parse::<u16>("MQTT_PORT") {
            mqtt.port = port;
        }
        if let Ok(user) = std::env::var("MQTT_USER") {
            mqtt.user = user;
        }
        if let Ok(pass) = std::env::var("MQTT_PASS") {
            mqtt.pass = pass;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

/// JSON configuration files in one directory.
struct ConfigStore {
    timer_path: PathBuf,
    account_path: PathBuf,
    runtime_path: PathBuf,
}

impl ConfigStore {
    fn new() -> Self {
        let config_dir = std::env::var("GROWLIGHT_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self::in_dir(&config_dir)
    }

    fn in_dir(config_dir: &Path) -> Self {
        Self {
            timer_path: config_dir.join("timer.json"),
            account_path: config_dir.join("account.json"),
            runtime_path: config_dir.join("runtime.json"),
        }
    }

    async fn load_schedule(&self) -> anyhow::Result<ScheduleConfig> {
        let schedule: ScheduleConfig = read_json(&self.timer_path).await?;
        schedule
            .validate()
            .with_context(|| format!("invalid schedule in {}", self.timer_path.display()))?;
        Ok(schedule)
    }

    async fn load_account(&self) -> anyhow::Result<AccountConfig> {
        let account: AccountConfig = read_json(&self.account_path).await?;
        account
            .validate()
            .with_context(|| format!("invalid account in {}", self.account_path.display()))?;
        Ok(account)
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn cloud_error_status(err: &CloudError) -> StatusCode {
    match err {
        CloudError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        CloudError::AuthenticationFailed(_)
        | CloudError::CommandRejected { .. }
        | CloudError::Transport(_) => StatusCode::BAD_GATEWAY,
    }
}

fn cloud_error_response(err: &CloudError) -> axum::response::Response {
    error_response(cloud_error_status(err), &err.to_string())
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
