use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use sprinkler_common::{
    config::STORAGE_SIZE,
    error::StorageError,
    portal::{parse_credentials_form, NO_CACHE_HEADERS},
    provisioning::ProvisioningStep,
    sim::{SimulatedValve, SimulatedWifi},
    store::{check_bounds, NvStorage},
    types::{PortalInfo, RuleQuery, TimeView},
    ControllerConfig, LinkStatus, Provisioner, ScheduleSlot, SettingsUpdate,
    SprinklerApp, StartQuery, ROUTE_FWLINK, ROUTE_GENERATE_204, ROUTE_OFF, ROUTE_ON, ROUTE_PAUSE,
    ROUTE_PORTAL_INFO, ROUTE_PORTAL_SCAN, ROUTE_RESET, ROUTE_RESTART, ROUTE_RESUME, ROUTE_ROOT,
    ROUTE_SCHEDULE, ROUTE_SETTINGS, ROUTE_START, ROUTE_STATE, ROUTE_STOP, ROUTE_TIME,
};

use crate::dns::CaptiveDns;

type HostApp = SprinklerApp<FileStorage, SimulatedValve>;
type HostProvisioner = Provisioner<SimulatedWifi, CaptiveDns>;

const STORAGE_FILE: &str = "eeprom.bin";
const PORTAL_HTML: &str = include_str!("../web/portal.html");
const PORTAL_SAVED_HTML: &str =
    "<!doctype html><html><body><p>Credentials saved. Trying to connect&hellip;</p></body></html>";
const RESTART_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Restart,
    Shutdown,
}

enum PortalExit {
    Restart,
    Shutdown,
    Continue(LinkStatus),
}

#[derive(Clone)]
struct AppState {
    app: Arc<Mutex<HostApp>>,
    provisioner: Arc<Mutex<HostProvisioner>>,
    timezone: Arc<String>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

#[derive(Clone)]
struct PortalState {
    provisioner: Arc<Mutex<HostProvisioner>>,
    app: Arc<Mutex<HostApp>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SettingsResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    #[serde(flatten)]
    settings: sprinkler_common::SettingsView,
}

struct HostSettings {
    config: ControllerConfig,
    data_dir: PathBuf,
    chip_id: u32,
    networks: Vec<(String, String, i32)>,
}

impl HostSettings {
    fn from_env() -> Self {
        let mut config = ControllerConfig {
            http_port: env_parse("SPRINKLER_HTTP_PORT").unwrap_or(8080),
            dns_port: env_parse("SPRINKLER_DNS_PORT").unwrap_or(5353),
            portal_timeout_ms: env_parse::<u64>("SPRINKLER_PORTAL_TIMEOUT_SECS")
                .map(|secs| secs.saturating_mul(1_000))
                .unwrap_or(0),
            ap_password: std::env::var("SPRINKLER_AP_PASSWORD").ok(),
            ..ControllerConfig::default()
        };
        if let Ok(timezone) = std::env::var("SPRINKLER_TIMEZONE") {
            config.timezone = timezone;
        }
        config.sanitize();

        let chip_id = std::env::var("SPRINKLER_CHIP_ID")
            .ok()
            .and_then(|value| u32::from_str_radix(value.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0x00c0_ffee);

        let networks = std::env::var("SPRINKLER_SIM_NETWORKS")
            .map(|value| parse_sim_networks(&value))
            .unwrap_or_default();

        Self {
            config,
            data_dir: std::env::var("SPRINKLER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            chip_id,
            networks,
        }
    }

    fn radio(&self) -> SimulatedWifi {
        self.networks
            .iter()
            .fold(SimulatedWifi::new(), |radio, (ssid, password, rssi)| {
                radio.with_network(ssid, password, *rssi)
            })
    }
}

/// `ssid:password:rssi` entries separated by commas; the password may be empty.
fn parse_sim_networks(value: &str) -> Vec<(String, String, i32)> {
    value
        .split(',')
        .filter_map(|entry| {
            let (rest, rssi) = entry.trim().rsplit_once(':')?;
            let (ssid, password) = rest.split_once(':')?;
            let rssi = rssi.parse::<i32>().ok()?;
            (!ssid.is_empty()).then(|| (ssid.to_string(), password.to_string(), rssi))
        })
        .collect()
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

/// EEPROM emulation on a plain file; commits replace the file atomically.
pub struct FileStorage {
    path: PathBuf,
    staged: Vec<u8>,
    committed: Vec<u8>,
}

impl FileStorage {
    /// A missing or unreadable file starts the region zeroed, which loads as defaults.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!("{} unreadable, starting from empty storage: {err}", path.display());
                Vec::new()
            }
        };
        bytes.resize(capacity, 0);

        Self {
            path,
            staged: bytes.clone(),
            committed: bytes,
        }
    }
}

impl NvStorage for FileStorage {
    fn capacity(&self) -> usize {
        self.staged.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(offset, buf.len(), self.committed.len())?;
        buf.copy_from_slice(&self.committed[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(offset, data.len(), self.staged.len())?;
        self.staged[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let commit_error = |err: std::io::Error| StorageError::Commit(err.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(commit_error)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &self.staged).map_err(commit_error)?;
        fs::rename(&tmp, &self.path).map_err(commit_error)?;

        self.committed.clone_from(&self.staged);
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    let (lifecycle, _) = watch::channel(Lifecycle::Running);
    let lifecycle = Arc::new(lifecycle);

    {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                lifecycle.send_replace(Lifecycle::Shutdown);
            }
        });
    }

    loop {
        lifecycle.send_replace(Lifecycle::Running);
        match boot(&settings, lifecycle.clone()).await? {
            Lifecycle::Restart => info!("restarting"),
            _ => return Ok(()),
        }
    }
}

async fn boot(
    settings: &HostSettings,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
) -> anyhow::Result<Lifecycle> {
    let storage = FileStorage::open(settings.data_dir.join(STORAGE_FILE), STORAGE_SIZE);
    let app = SprinklerApp::boot(storage, SimulatedValve::default(), settings.chip_id);

    let mut provisioner = Provisioner::new(
        settings.radio(),
        CaptiveDns::new(settings.config.dns_port),
        app.identity().hostname(),
        &settings.config,
    );
    let link = provisioner.connect_stored(app.credentials());
    let app = Arc::new(Mutex::new(app));
    let provisioner = Arc::new(Mutex::new(provisioner));

    if link == LinkStatus::Failed {
        match run_portal(settings, provisioner.clone(), app.clone(), &lifecycle).await? {
            PortalExit::Restart => return Ok(Lifecycle::Restart),
            PortalExit::Shutdown => return Ok(Lifecycle::Shutdown),
            PortalExit::Continue(LinkStatus::Connected) => {}
            PortalExit::Continue(LinkStatus::Failed) => {
                warn!("no network after provisioning; running schedule offline")
            }
        }
    }

    run_device(settings, app, provisioner, lifecycle).await
}

async fn run_portal(
    settings: &HostSettings,
    provisioner: Arc<Mutex<HostProvisioner>>,
    app: Arc<Mutex<HostApp>>,
    lifecycle: &watch::Sender<Lifecycle>,
) -> anyhow::Result<PortalExit> {
    if let Err(err) = provisioner.lock().await.start_fallback(monotonic_ms()) {
        warn!("provisioning portal unavailable: {err}");
        return Ok(PortalExit::Continue(LinkStatus::Failed));
    }

    let state = PortalState {
        provisioner,
        app: app.clone(),
    };
    let router = portal_router(state.clone());

    let (done_tx, done_rx) = watch::channel(false);
    let server = spawn_server(settings.config.http_port, router, async move {
        let mut done_rx = done_rx;
        let _ = done_rx.wait_for(|done| *done).await;
    })
    .await?;

    let mut lifecycle_rx = lifecycle.subscribe();
    let mut interval = tokio::time::interval(Duration::from_millis(settings.config.tick_interval_ms));
    let exit = loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = lifecycle_rx.changed() => {
                if *lifecycle_rx.borrow() == Lifecycle::Shutdown {
                    break PortalExit::Shutdown;
                }
            }
        }

        let step = state.provisioner.lock().await.poll(monotonic_ms());
        match step {
            ProvisioningStep::Waiting => {}
            ProvisioningStep::Provisioned(submitted) => {
                if let Err(err) = app.lock().await.on_provisioned(submitted.station()) {
                    warn!("new credentials were not persisted: {err}");
                }
                break PortalExit::Restart;
            }
            ProvisioningStep::TimedOut(status) => break PortalExit::Continue(status),
        }
    };

    let _ = done_tx.send(true);
    if let Err(err) = server.await {
        warn!("portal server task failed: {err}");
    }
    Ok(exit)
}

fn portal_router(state: PortalState) -> Router {
    Router::new()
        .route(
            ROUTE_ROOT,
            get(handle_portal_root).post(handle_portal_submit),
        )
        .route(ROUTE_FWLINK, get(handle_portal_root))
        .route(ROUTE_PORTAL_INFO, get(handle_portal_info))
        .route(ROUTE_PORTAL_SCAN, get(handle_portal_scan))
        .route(ROUTE_GENERATE_204, get(handle_generate_204))
        .fallback(handle_portal_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn run_device(
    settings: &HostSettings,
    app: Arc<Mutex<HostApp>>,
    provisioner: Arc<Mutex<HostProvisioner>>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
) -> anyhow::Result<Lifecycle> {
    let state = AppState {
        app,
        provisioner,
        timezone: Arc::new(settings.config.timezone.clone()),
        lifecycle: lifecycle.clone(),
    };

    spawn_control_loop(state.clone(), settings.config.tick_interval_ms);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let router = Router::new()
        .route(
            ROUTE_SETTINGS,
            get(handle_get_settings).post(handle_post_settings),
        )
        .route(ROUTE_STATE, get(handle_get_state))
        .route(ROUTE_TIME, get(handle_get_time))
        .route(ROUTE_START, get(handle_start))
        .route(ROUTE_ON, get(handle_start))
        .route(ROUTE_STOP, get(handle_stop))
        .route(ROUTE_OFF, get(handle_stop))
        .route(ROUTE_PAUSE, get(handle_pause))
        .route(ROUTE_RESUME, get(handle_resume))
        .route(ROUTE_SCHEDULE, get(handle_schedule_default))
        .route(&format!("{ROUTE_SCHEDULE}/{{day}}"), get(handle_schedule_day))
        .route(ROUTE_RESET, get(handle_reset))
        .route(ROUTE_RESTART, get(handle_restart))
        .fallback_service(ServeDir::new(web_root))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let mut lifecycle_rx = lifecycle.subscribe();
    let server = spawn_server(settings.config.http_port, router, async move {
        let _ = lifecycle_rx
            .wait_for(|value| *value != Lifecycle::Running)
            .await;
    })
    .await?;

    server.await.context("controller server task failed")?;

    state.app.lock().await.stop();
    let outcome = *lifecycle.borrow();
    Ok(outcome)
}

async fn spawn_server(
    port: u16,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;
    info!("listening on http://{addr}");

    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("http server error: {err}");
        }
    }))
}

fn spawn_control_loop(state: AppState, tick_interval_ms: u64) {
    let mut lifecycle_rx = state.lifecycle.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = now_in_timezone(&state.timezone);
                    state.app.lock().await.tick(monotonic_ms(), now);
                }
                _ = lifecycle_rx.changed() => break,
            }
        }
    });
}

fn request_restart(lifecycle: &Arc<watch::Sender<Lifecycle>>) {
    let lifecycle = lifecycle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)).await;
        lifecycle.send_replace(Lifecycle::Restart);
    });
}

fn host_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::HOST).and_then(|value| value.to_str().ok())
}

fn redirect(location: &str) -> Response {
    (
        StatusCode::FOUND,
        NO_CACHE_HEADERS,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

async fn handle_portal_root(State(state): State<PortalState>, headers: HeaderMap) -> Response {
    if let Some(location) = state
        .provisioner
        .lock()
        .await
        .captive_redirect(host_header(&headers))
    {
        return redirect(&location);
    }
    (NO_CACHE_HEADERS, Html(PORTAL_HTML)).into_response()
}

async fn handle_portal_submit(State(state): State<PortalState>, body: Bytes) -> Response {
    let form = parse_credentials_form(&String::from_utf8_lossy(&body));
    if form.ssid.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'ssid' field");
    }

    state.provisioner.lock().await.submit_credentials(form);
    (NO_CACHE_HEADERS, Html(PORTAL_SAVED_HTML)).into_response()
}

async fn handle_portal_info(State(state): State<PortalState>) -> impl IntoResponse {
    let provisioner = state.provisioner.lock().await;
    let disp_name = state.app.lock().await.identity().display_name().to_string();

    Json(PortalInfo {
        host_name: provisioner.hostname().to_string(),
        disp_name,
        ap_address: provisioner.ap_address().map(|ip| ip.to_string()),
        mode: provisioner.mode(),
    })
}

async fn handle_portal_scan(State(state): State<PortalState>) -> Response {
    match state.provisioner.lock().await.scan() {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => {
            warn!("network scan failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Network scan failed")
        }
    }
}

async fn handle_generate_204(State(state): State<PortalState>, headers: HeaderMap) -> Response {
    if let Some(location) = state
        .provisioner
        .lock()
        .await
        .captive_redirect(host_header(&headers))
    {
        return redirect(&location);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_portal_not_found(State(state): State<PortalState>, headers: HeaderMap) -> Response {
    if let Some(location) = state
        .provisioner
        .lock()
        .await
        .captive_redirect(host_header(&headers))
    {
        return redirect(&location);
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn handle_get_state(State(state): State<AppState>) -> Response {
    let now = now_in_timezone(&state.timezone);
    let status = state
        .app
        .lock()
        .await
        .status(monotonic_ms(), now, &state.timezone);
    Json(status).into_response()
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let now = now_in_timezone(&state.timezone);
    Json(TimeView {
        time_synced: now.is_some(),
        timezone: state.timezone.to_string(),
        epoch: now.map(|now| now.timestamp()),
        local: now.map(|now| now.format("%Y-%m-%d %H:%M:%S").to_string()),
    })
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.app.lock().await.settings())
}

async fn handle_post_settings(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(update) = serde_json::from_slice::<SettingsUpdate>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid settings payload");
    };

    let (result, settings) = {
        let mut app = state.app.lock().await;
        (app.update_settings(&update), app.settings())
    };

    match result {
        Ok(restart_required) => {
            if restart_required {
                request_restart(&state.lifecycle);
            }
            Json(SettingsResponse {
                restart_required,
                settings,
            })
            .into_response()
        }
        Err(err) => {
            warn!("failed to persist settings update: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist settings")
        }
    }
}

async fn handle_start(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Ok(t) = optional_param::<u32>(&params, "t") else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid 't' (minutes) parameter");
    };
    let Ok(z) = optional_param::<u32>(&params, "z") else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid 'z' (cycles) parameter");
    };

    state
        .app
        .lock()
        .await
        .start(monotonic_ms(), StartQuery { t, z });
    handle_get_state(State(state)).await
}

async fn handle_stop(State(state): State<AppState>) -> Response {
    state.app.lock().await.stop();
    handle_get_state(State(state)).await
}

async fn handle_pause(State(state): State<AppState>) -> Response {
    state.app.lock().await.pause(monotonic_ms());
    handle_get_state(State(state)).await
}

async fn handle_resume(State(state): State<AppState>) -> Response {
    state.app.lock().await.resume(monotonic_ms());
    handle_get_state(State(state)).await
}

async fn handle_schedule_default(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    update_schedule(state, ScheduleSlot::Everyday, params).await
}

async fn handle_schedule_day(
    State(state): State<AppState>,
    UrlPath(day): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match day.parse::<ScheduleSlot>() {
        Ok(slot) => update_schedule(state, slot, params).await,
        Err(err) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
    }
}

async fn update_schedule(
    state: AppState,
    slot: ScheduleSlot,
    params: HashMap<String, String>,
) -> Response {
    let query = match parse_rule_query(&params) {
        Ok(query) => query,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let update = match query.to_update() {
        Ok(update) => update,
        Err(err) => {
            warn!("rejected {} rule update: {err}", slot.as_str());
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    let mut app = state.app.lock().await;
    if let Err(err) = app.update_rule(slot, update) {
        warn!("failed to persist {} rule: {err}", slot.as_str());
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist schedule");
    }
    Json(app.rule_view(slot)).into_response()
}

fn parse_rule_query(params: &HashMap<String, String>) -> Result<RuleQuery, &'static str> {
    Ok(RuleQuery {
        h: optional_param(params, "h").map_err(|_| "Invalid 'h' parameter")?,
        m: optional_param(params, "m").map_err(|_| "Invalid 'm' parameter")?,
        d: optional_param(params, "d").map_err(|_| "Invalid 'd' parameter")?,
        enabled: optional_param(params, "enabled").map_err(|_| "Invalid 'enabled' parameter")?,
    })
}

fn optional_param<T: FromStr>(params: &HashMap<String, String>, key: &str) -> Result<Option<T>, ()> {
    params
        .get(key)
        .map(|value| value.trim().parse::<T>().map_err(|_| ()))
        .transpose()
}

async fn handle_reset(State(state): State<AppState>) -> Response {
    if let Err(err) = state.app.lock().await.factory_reset() {
        warn!("factory reset failed: {err}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to erase settings");
    }
    state.provisioner.lock().await.disconnect_station();
    request_restart(&state.lifecycle);
    handle_get_state(State(state)).await
}

async fn handle_restart(State(state): State<AppState>) -> Response {
    request_restart(&state.lifecycle);
    handle_get_state(State(state)).await
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn error_response(status: StatusCode, message: &str) -> Response {
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
