use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use sprinkler_common::{
    config::STORAGE_SIZE,
    error::StorageError,
    portal::{parse_credentials_form, query_param, NO_CACHE_HEADERS},
    provisioning::{AccessPointSettings, NetworkInfo},
    store::{check_bounds, NvStorage},
    types::{PortalInfo, RuleQuery, TimeView},
    Actuator, ControllerConfig, LinkStatus, OutputLevels, Provisioner, ProvisioningStep,
    ScheduleSlot, SettingsUpdate, SprinklerApp, StartQuery, StationCredentials, ValveState,
    WifiDriver, WifiError, ROUTE_FWLINK, ROUTE_GENERATE_204, ROUTE_OFF, ROUTE_ON, ROUTE_PAUSE,
    ROUTE_PORTAL_INFO, ROUTE_PORTAL_SCAN, ROUTE_RESET, ROUTE_RESTART, ROUTE_RESUME, ROUTE_ROOT,
    ROUTE_SCHEDULE, ROUTE_SETTINGS, ROUTE_START, ROUTE_STATE, ROUTE_STOP, ROUTE_TIME,
};

use crate::dns::CaptiveDns;

type EspApp = SprinklerApp<NvsBlobStorage, PinValve>;
type EspProvisioner = Provisioner<EspWifiDriver, CaptiveDns>;
type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

const NVS_NAMESPACE: &str = "sprinkler";
const NVS_RECORD_KEY: &str = "eeprom";
const MAX_HTTP_BODY: usize = 1024;
const RESTART_DELAY_MS: u64 = 500;
/// Anything earlier means SNTP has not set the clock yet.
const MIN_SYNCED_EPOCH: i64 = 1_700_000_000;

const INDEX_HTML: &str = include_str!("../web/index.html");
const PORTAL_HTML: &str = include_str!("../web/portal.html");
const PORTAL_SAVED_HTML: &str =
    "<!doctype html><html><body><p>Credentials saved. Trying to connect&hellip;</p></body></html>";

#[derive(Debug, Serialize)]
struct SettingsResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    #[serde(flatten)]
    settings: sprinkler_common::SettingsView,
}

/// The persisted record lives in a single NVS blob; writes stay staged until commit.
pub struct NvsBlobStorage {
    nvs: EspNvs<NvsDefault>,
    staged: Vec<u8>,
    committed: Vec<u8>,
}

impl NvsBlobStorage {
    /// Only a missing NVS handle is fatal; an unreadable blob starts the region zeroed.
    fn open(partition: EspDefaultNvsPartition, capacity: usize) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; capacity];
        let stored = match nvs.get_raw(NVS_RECORD_KEY, &mut buffer) {
            Ok(found) => found.map(<[u8]>::len).unwrap_or(0),
            Err(err) => {
                warn!("config blob unreadable, starting from empty storage: {err}");
                0
            }
        };
        buffer[stored..].fill(0);

        Ok(Self {
            nvs,
            staged: buffer.clone(),
            committed: buffer,
        })
    }
}

impl NvStorage for NvsBlobStorage {
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
        self.nvs
            .set_raw(NVS_RECORD_KEY, &self.staged)
            .map_err(|err| StorageError::Commit(err.to_string()))?;
        self.committed.clone_from(&self.staged);
        Ok(())
    }
}

pub struct EspWifiDriver {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspWifiDriver {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        ap_address: Ipv4Addr,
    ) -> anyhow::Result<Self> {
        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

        let ap_netif = EspNetif::new_with_conf(&NetifConfiguration {
            ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
                subnet: Subnet {
                    gateway: ap_address,
                    mask: Mask(24),
                },
                dhcp_enabled: true,
                dns: Some(ap_address),
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        })?;
        esp_wifi
            .swap_netif_ap(ap_netif)
            .context("failed to apply access point address")?;

        Ok(Self {
            wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
        })
    }

    fn ensure_started(&mut self) -> Result<(), esp_idf_svc::sys::EspError> {
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }
}

impl WifiDriver for EspWifiDriver {
    fn connect_station(
        &mut self,
        hostname: &str,
        credentials: &StationCredentials,
    ) -> Result<(), WifiError> {
        let failed = |reason: String| WifiError::ConnectFailed {
            ssid: credentials.ssid.clone(),
            reason,
        };

        let client = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| failed("ssid too long".to_string()))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| failed("password too long".to_string()))?,
            auth_method: if credentials.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        };

        // Keep the access point up while the portal is testing new credentials.
        let configuration = match self.wifi.get_configuration() {
            Ok(Configuration::Mixed(_, ap)) | Ok(Configuration::AccessPoint(ap)) => {
                Configuration::Mixed(client, ap)
            }
            _ => Configuration::Client(client),
        };

        if let Err(err) = self.wifi.wifi_mut().sta_netif_mut().set_hostname(hostname) {
            warn!("failed to set DHCP hostname `{hostname}`: {err}");
        }

        let result = self
            .wifi
            .set_configuration(&configuration)
            .and_then(|_| self.ensure_started())
            .and_then(|_| self.wifi.connect())
            .and_then(|_| self.wifi.wait_netif_up());

        result.map_err(|err| {
            let _ = self.wifi.disconnect();
            failed(err.to_string())
        })
    }

    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<Ipv4Addr, WifiError> {
        let ap_error = WifiError::AccessPoint;

        let password = settings.password.as_deref().unwrap_or_default();
        let access_point = AccessPointConfiguration {
            ssid: settings
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| ap_error("access point SSID too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| ap_error("access point password too long".to_string()))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            channel: 1,
            ..Default::default()
        };

        self.wifi
            .set_configuration(&Configuration::Mixed(
                ClientConfiguration::default(),
                access_point,
            ))
            .and_then(|_| self.ensure_started())
            .map_err(|err| ap_error(err.to_string()))?;

        self.wifi
            .wifi()
            .ap_netif()
            .get_ip_info()
            .map(|ip_info| ip_info.ip)
            .map_err(|err| ap_error(err.to_string()))
    }

    fn stop_access_point(&mut self) {
        let client = match self.wifi.get_configuration() {
            Ok(Configuration::Mixed(client, _)) | Ok(Configuration::Client(client)) => client,
            _ => ClientConfiguration::default(),
        };
        if let Err(err) = self.wifi.set_configuration(&Configuration::Client(client)) {
            warn!("failed to stop access point: {err}");
        }
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("station disconnect failed: {err}");
        }
    }

    fn scan(&mut self) -> Result<Vec<NetworkInfo>, WifiError> {
        self.ensure_started()
            .and_then(|_| self.wifi.scan())
            .map(|found| {
                found
                    .into_iter()
                    .map(|ap| NetworkInfo {
                        ssid: ap.ssid.to_string(),
                        rssi: i32::from(ap.signal_strength),
                        secured: !matches!(ap.auth_method, None | Some(AuthMethod::None)),
                    })
                    .collect()
            })
            .map_err(|err| WifiError::Scan(err.to_string()))
    }
}

/// Relay on one pin, status LED on another; either may be missing.
pub struct PinValve {
    led: Option<PinDriver<'static, AnyOutputPin, Output>>,
    relay: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

impl PinValve {
    fn new(led_pin: i32, relay_pin: i32) -> Self {
        Self {
            led: init_output_pin(led_pin, "status LED"),
            relay: init_output_pin(relay_pin, "relay"),
        }
    }

    fn drive(&mut self, state: ValveState) {
        let levels = OutputLevels::for_state(state);

        for (pin, high, name) in [
            (self.relay.as_mut(), levels.relay_high, "relay"),
            (self.led.as_mut(), levels.led_high, "status LED"),
        ] {
            let Some(pin) = pin else {
                continue;
            };
            let result = if high { pin.set_high() } else { pin.set_low() };
            if let Err(err) = result {
                warn!("failed to drive {name}: {err}");
            }
        }
    }
}

impl Actuator for PinValve {
    fn on(&mut self) {
        info!("valve on");
        self.drive(ValveState::On);
    }

    fn off(&mut self) {
        info!("valve off");
        self.drive(ValveState::Off);
    }
}

fn init_output_pin(pin: i32, name: &str) -> Option<PinDriver<'static, AnyOutputPin, Output>> {
    match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
        Ok(driver) => Some(driver),
        Err(err) => {
            warn!("{name} unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = ControllerConfig::default();
    config.sanitize();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let storage = NvsBlobStorage::open(nvs_partition.clone(), STORAGE_SIZE)
        .context("failed to open settings storage")?;
    let valve = PinValve::new(config.led_pin, config.relay_pin);
    let app = SprinklerApp::boot(storage, valve, chip_id());

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = EspWifiDriver::new(modem, sys_loop, nvs_partition, config.ap_ipv4())
        .context("wifi startup failed")?;
    let mut provisioner = Provisioner::new(
        wifi,
        CaptiveDns::new(config.dns_port),
        app.identity().hostname(),
        &config,
    );

    let link = provisioner.connect_stored(app.credentials());
    let app = Arc::new(Mutex::new(app));
    let provisioner = Arc::new(Mutex::new(provisioner));

    if link == LinkStatus::Failed {
        run_portal(&config, provisioner.clone(), app.clone())?;
    }

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    spawn_control_loop(app.clone(), config.timezone.clone(), config.tick_interval_ms);
    let server = create_http_server(app, config.timezone.clone())?;

    // Keep services alive for the program lifetime.
    let _provisioner = provisioner;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

/// Returns once the portal times out with a live station link; every other exit restarts.
fn run_portal(
    config: &ControllerConfig,
    provisioner: Arc<Mutex<EspProvisioner>>,
    app: Arc<Mutex<EspApp>>,
) -> anyhow::Result<()> {
    if let Err(err) = lock(&provisioner).start_fallback(monotonic_ms()) {
        warn!("provisioning portal unavailable: {err}");
        restart();
    }

    let server = create_portal_server(provisioner.clone(), app.clone())?;

    loop {
        thread::sleep(Duration::from_millis(config.tick_interval_ms));

        let step = lock(&provisioner).poll(monotonic_ms());
        match step {
            ProvisioningStep::Waiting => {}
            ProvisioningStep::Provisioned(submitted) => {
                if let Err(err) = lock(&app).on_provisioned(submitted.station()) {
                    warn!("new credentials were not persisted: {err}");
                }
                drop(server);
                restart();
            }
            ProvisioningStep::TimedOut(LinkStatus::Connected) => {
                drop(server);
                return Ok(());
            }
            ProvisioningStep::TimedOut(LinkStatus::Failed) => {
                warn!("portal timed out without a network");
                drop(server);
                restart();
            }
        }
    }
}

fn create_portal_server(
    provisioner: Arc<Mutex<EspProvisioner>>,
    app: Arc<Mutex<EspApp>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in [ROUTE_ROOT, ROUTE_FWLINK] {
        let provisioner = provisioner.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            if let Some(location) = captive_location(&provisioner, &req) {
                return write_redirect(req, &location);
            }
            write_portal_page(req, PORTAL_HTML)
        })?;
    }

    {
        let provisioner = provisioner.clone();
        server.fn_handler::<anyhow::Error, _>(ROUTE_ROOT, Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = parse_credentials_form(&String::from_utf8_lossy(&body));
            if form.ssid.is_empty() {
                return write_error(req, 400, "Missing 'ssid' field");
            }

            lock(&provisioner).submit_credentials(form);
            write_portal_page(req, PORTAL_SAVED_HTML)
        })?;
    }

    {
        let provisioner = provisioner.clone();
        server.fn_handler(ROUTE_PORTAL_INFO, Method::Get, move |req| {
            let info = {
                let provisioner = lock(&provisioner);
                PortalInfo {
                    host_name: provisioner.hostname().to_string(),
                    disp_name: lock(&app).identity().display_name().to_string(),
                    ap_address: provisioner.ap_address().map(|ip| ip.to_string()),
                    mode: provisioner.mode(),
                }
            };
            write_json(req, &info)
        })?;
    }

    {
        let provisioner = provisioner.clone();
        server.fn_handler(ROUTE_PORTAL_SCAN, Method::Get, move |req| {
            let scanned = lock(&provisioner).scan();
            match scanned {
                Ok(entries) => write_json(req, &entries),
                Err(err) => {
                    warn!("network scan failed: {err}");
                    write_error(req, 500, "Network scan failed")
                }
            }
        })?;
    }

    {
        let provisioner = provisioner.clone();
        server.fn_handler::<anyhow::Error, _>(ROUTE_GENERATE_204, Method::Get, move |req| {
            if let Some(location) = captive_location(&provisioner, &req) {
                return write_redirect(req, &location);
            }
            req.into_response(204, Some("No Content"), &[])?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        if let Some(location) = captive_location(&provisioner, &req) {
            return write_redirect(req, &location);
        }
        req.into_status_response(404)?;
        Ok(())
    })?;

    Ok(server)
}

fn create_http_server(
    app: Arc<Mutex<EspApp>>,
    timezone: String,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;
    let timezone = Arc::new(timezone);

    server.fn_handler::<anyhow::Error, _>(ROUTE_ROOT, Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let app = app.clone();
        server.fn_handler(ROUTE_SETTINGS, Method::Get, move |req| {
            let settings = lock(&app).settings();
            write_json(req, &settings)
        })?;
    }

    {
        let app = app.clone();
        server.fn_handler::<anyhow::Error, _>(ROUTE_SETTINGS, Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<SettingsUpdate>(&body) else {
                return write_error(req, 400, "Invalid settings payload");
            };

            let (result, settings) = {
                let mut app = lock(&app);
                (app.update_settings(&update), app.settings())
            };
            match result {
                Ok(restart_required) => {
                    if restart_required {
                        schedule_restart();
                    }
                    write_json(
                        req,
                        &SettingsResponse {
                            restart_required,
                            settings,
                        },
                    )
                }
                Err(err) => {
                    warn!("failed to persist settings update: {err}");
                    write_error(req, 500, "Failed to persist settings")
                }
            }
        })?;
    }

    {
        let app = app.clone();
        let timezone = timezone.clone();
        server.fn_handler(ROUTE_STATE, Method::Get, move |req| {
            write_status(req, &app, &timezone)
        })?;
    }

    {
        let timezone = timezone.clone();
        server.fn_handler(ROUTE_TIME, Method::Get, move |req| {
            let now = now_in_timezone(&timezone);
            write_json(
                req,
                &TimeView {
                    time_synced: now.is_some(),
                    timezone: timezone.to_string(),
                    epoch: now.map(|now| now.timestamp()),
                    local: now.map(|now| now.format("%Y-%m-%d %H:%M:%S").to_string()),
                },
            )
        })?;
    }

    for path in [ROUTE_START, ROUTE_ON] {
        let app = app.clone();
        let timezone = timezone.clone();
        server.fn_handler(path, Method::Get, move |req| {
            let uri = req.uri().to_string();
            let query = uri.split_once('?').map_or("", |(_, query)| query);
            let Ok(t) = parse_param::<u32>(query, "t") else {
                return write_error(req, 400, "Invalid 't' (minutes) parameter");
            };
            let Ok(z) = parse_param::<u32>(query, "z") else {
                return write_error(req, 400, "Invalid 'z' (cycles) parameter");
            };

            lock(&app).start(monotonic_ms(), StartQuery { t, z });
            write_status(req, &app, &timezone)
        })?;
    }

    for path in [ROUTE_STOP, ROUTE_OFF] {
        let app = app.clone();
        let timezone = timezone.clone();
        server.fn_handler(path, Method::Get, move |req| {
            lock(&app).stop();
            write_status(req, &app, &timezone)
        })?;
    }

    {
        let app = app.clone();
        let timezone = timezone.clone();
        server.fn_handler(ROUTE_PAUSE, Method::Get, move |req| {
            lock(&app).pause(monotonic_ms());
            write_status(req, &app, &timezone)
        })?;
    }

    {
        let app = app.clone();
        let timezone = timezone.clone();
        server.fn_handler(ROUTE_RESUME, Method::Get, move |req| {
            lock(&app).resume(monotonic_ms());
            write_status(req, &app, &timezone)
        })?;
    }

    for path in [ROUTE_SCHEDULE.to_string(), format!("{ROUTE_SCHEDULE}/*")] {
        let app = app.clone();
        server.fn_handler(&path, Method::Get, move |req| {
            let uri = req.uri().to_string();
            let (path, query) = uri.split_once('?').unwrap_or((uri.as_str(), ""));

            let slot = match path.strip_prefix(ROUTE_SCHEDULE).unwrap_or_default() {
                "" | "/" => ScheduleSlot::Everyday,
                day => match day.trim_start_matches('/').parse::<ScheduleSlot>() {
                    Ok(slot) => slot,
                    Err(err) => return write_error(req, 404, &err.to_string()),
                },
            };

            let rule_query = match parse_rule_query(query) {
                Ok(rule_query) => rule_query,
                Err(message) => return write_error(req, 400, message),
            };
            let update = match rule_query.to_update() {
                Ok(update) => update,
                Err(err) => {
                    warn!("rejected {} rule update: {err}", slot.as_str());
                    return write_error(req, 400, &err.to_string());
                }
            };

            let view = {
                let mut app = lock(&app);
                if let Err(err) = app.update_rule(slot, update) {
                    warn!("failed to persist {} rule: {err}", slot.as_str());
                    None
                } else {
                    Some(app.rule_view(slot))
                }
            };
            match view {
                Some(view) => write_json(req, &view),
                None => write_error(req, 500, "Failed to persist schedule"),
            }
        })?;
    }

    {
        let app = app.clone();
        let timezone = timezone.clone();
        server.fn_handler(ROUTE_RESET, Method::Get, move |req| {
            if let Err(err) = lock(&app).factory_reset() {
                warn!("factory reset failed: {err}");
                return write_error(req, 500, "Failed to erase settings");
            }
            let _ = unsafe { esp_idf_svc::sys::esp_wifi_restore() };
            schedule_restart();
            write_status(req, &app, &timezone)
        })?;
    }

    server.fn_handler(ROUTE_RESTART, Method::Get, move |req| {
        schedule_restart();
        write_status(req, &app, &timezone)
    })?;

    Ok(server)
}

fn spawn_control_loop(app: Arc<Mutex<EspApp>>, timezone: String, tick_interval_ms: u64) {
    let spawned = thread::Builder::new()
        .name("control-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let now = now_in_timezone(&timezone);
            lock(&app).tick(monotonic_ms(), now);
            thread::sleep(Duration::from_millis(tick_interval_ms));
        });

    if let Err(err) = spawned {
        warn!("failed to spawn control loop: {err}");
        restart();
    }
}

fn write_status(
    req: HttpRequest<'_, '_>,
    app: &Mutex<EspApp>,
    timezone: &str,
) -> anyhow::Result<()> {
    let now = now_in_timezone(timezone);
    let status = lock(app).status(monotonic_ms(), now, timezone);
    write_json(req, &status)
}

fn captive_location(
    provisioner: &Mutex<EspProvisioner>,
    req: &HttpRequest<'_, '_>,
) -> Option<String> {
    lock(provisioner).captive_redirect(req.header("Host"))
}

fn parse_param<T: core::str::FromStr>(query: &str, key: &str) -> Result<Option<T>, ()> {
    query_param(query, key)
        .map(|value| value.trim().parse::<T>().map_err(|_| ()))
        .transpose()
}

fn parse_rule_query(query: &str) -> Result<RuleQuery, &'static str> {
    Ok(RuleQuery {
        h: parse_param(query, "h").map_err(|_| "Invalid 'h' parameter")?,
        m: parse_param(query, "m").map_err(|_| "Invalid 'm' parameter")?,
        d: parse_param(query, "d").map_err(|_| "Invalid 'd' parameter")?,
        enabled: parse_param(query, "enabled").map_err(|_| "Invalid 'enabled' parameter")?,
    })
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0);
    if len > MAX_HTTP_BODY as u64 {
        return Err(anyhow!("request body too large"));
    }
    let len = usize::try_from(len)?;

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_portal_page(req: HttpRequest<'_, '_>, html: &str) -> anyhow::Result<()> {
    let [cache_control, pragma, expires] = NO_CACHE_HEADERS;
    req.into_response(
        200,
        Some("OK"),
        &[
            ("Content-Type", "text/html; charset=utf-8"),
            cache_control,
            pragma,
            expires,
        ],
    )?
    .write_all(html.as_bytes())?;
    Ok(())
}

fn write_redirect(req: HttpRequest<'_, '_>, location: &str) -> anyhow::Result<()> {
    let [cache_control, pragma, expires] = NO_CACHE_HEADERS;
    req.into_response(
        302,
        Some("Found"),
        &[("Location", location), cache_control, pragma, expires],
    )?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn schedule_restart() {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            restart();
        });

    if let Err(err) = spawned {
        warn!("failed to spawn restart thread: {err}");
        restart();
    }
}

#[allow(unreachable_code)]
fn restart() -> ! {
    info!("restarting");
    unsafe { esp_idf_svc::sys::esp_restart() };
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

/// Lower three bytes of the factory MAC, as on the original hardware.
fn chip_id() -> u32 {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read factory MAC: esp_err_t={rc}");
    }
    u32::from_be_bytes([0, mac[3], mac[4], mac[5]])
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let now = Utc::now();
    if now.timestamp() < MIN_SYNCED_EPOCH {
        return None;
    }
    let tz: Tz = timezone.parse().ok()?;
    let local = now.with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
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
