use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mdns::EspMdns,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SntpConf, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use feeder_common::{
    config::{MotorHardwareConfig, NetworkConfig},
    is_plausible_epoch,
    page::{render_history, render_index},
    CivilTimeResolver, ClockTime, FeedEvent, FeederConfig, FeederStatus, FiringEngine,
    HistoryLog, LocalTime, ManualFeedForm, RuntimeConfig, SessionParameters, SettingsForm,
    SyncedClock, TimeView,
};

const SETTINGS_NAMESPACE: &str = "feeder";
const HISTORY_NAMESPACE: &str = "feedHistory";
const HISTORY_RING_KEY: &str = "ring";
const RUNTIME_KEY: &str = "runtime";
const KEY_AM_END: &str = "A";
const KEY_PM_END: &str = "P";
const KEY_TOTAL_SECONDS: &str = "Z";
const KEY_PULSE_COUNT: &str = "Y";
const KEY_SHORT_PULSE_SECONDS: &str = "X";
const KEY_GAP_MINUTES: &str = "gap";
const MAX_HTTP_BODY: usize = 1024;
const MAX_HISTORY_JSON: usize = 4000;
const MAX_RUNTIME_JSON: usize = 2048;
const HTTP_PORT: u16 = 80;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const SNTP_STARTUP_WAIT_SEC: u32 = 10;

#[derive(Clone)]
struct SharedState {
    settings: Arc<Mutex<SessionParameters>>,
    engine: Arc<Mutex<FiringEngine>>,
    history: Arc<Mutex<HistoryLog>>,
    clock: Arc<Mutex<SyncedClock>>,
    motor: Arc<Mutex<Option<MotorDriver>>>,
    resolver: CivilTimeResolver,
    feeder: FeederConfig,
    store: NvsStore,
}

/// Two-pin H-bridge: pin A high with pin B low runs the auger forward, both
/// low stops it.
struct MotorDriver {
    pin_a: PinDriver<'static, AnyOutputPin, Output>,
    pin_b: PinDriver<'static, AnyOutputPin, Output>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    info!("=== DuckFeeder start ===");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_network_defaults(&mut runtime.network);
    runtime.sanitize();

    info!(
        "runtime config loaded (ssid='{}', hostname='{}', static_ip={}, utc_offset={}h)",
        runtime.network.wifi_ssid,
        runtime.network.hostname,
        runtime.network.use_static_ip,
        runtime.clock.standard_offset_hours,
    );

    // The motor is parked before anything else can fail.
    let motor = match MotorDriver::new(&runtime.motor) {
        Ok(driver) => {
            info!(
                "motor driver ready on GPIO{} / GPIO{}",
                runtime.motor.pin_a, runtime.motor.pin_b
            );
            Some(driver)
        }
        Err(err) => {
            warn!("failed to initialize motor driver, feedings will be skipped: {err:#}");
            None
        }
    };

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            warn!("wifi not connected ({err:#}); restarting");
            restart_device();
        }
    };
    disable_wifi_power_save();

    let mdns = match start_mdns(&runtime.network) {
        Ok(mdns) => Some(mdns),
        Err(err) => {
            warn!("mDNS not started: {err:#}");
            None
        }
    };

    let sntp = start_sntp(&runtime.network.ntp_server)?;

    let settings = store.load_settings().unwrap_or_else(|err| {
        warn!("failed to load settings from NVS: {err:#}");
        SessionParameters::default()
    });
    let history = store.load_history().unwrap_or_else(|err| {
        warn!("failed to load feeding history from NVS: {err:#}");
        HistoryLog::default()
    });

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

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let shared_state = SharedState {
        settings: Arc::new(Mutex::new(settings)),
        engine: Arc::new(Mutex::new(FiringEngine::new())),
        history: Arc::new(Mutex::new(history)),
        clock: Arc::new(Mutex::new(SyncedClock::new())),
        motor: Arc::new(Mutex::new(motor)),
        resolver: CivilTimeResolver::from_config(&runtime.clock),
        feeder: runtime.feeder.clone(),
        store,
    };

    spawn_control_loop(shared_state.clone())?;
    let server = create_http_server(shared_state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _mdns = mdns;
    let _sntp = sntp;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_network_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }

    // A stored static address wins over the build-time one.
    if network.use_static_ip {
        return;
    }
    let Some(static_ip) = option_env!("FEEDER_STATIC_IP").and_then(parse_octets) else {
        return;
    };
    network.use_static_ip = true;
    network.static_ip = Some(static_ip);
    network.gateway = option_env!("FEEDER_GATEWAY").and_then(parse_octets);
    network.subnet = option_env!("FEEDER_SUBNET")
        .and_then(parse_octets)
        .or(Some([255, 255, 255, 0]));
    network.dns = option_env!("FEEDER_DNS")
        .and_then(parse_octets)
        .or(network.gateway);
}

fn parse_octets(raw: &str) -> Option<[u8; 4]> {
    raw.trim().parse::<Ipv4Addr>().ok().map(|ip| ip.octets())
}

fn start_mdns(network: &NetworkConfig) -> anyhow::Result<EspMdns> {
    let hostname = network.mdns_hostname();
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(&hostname)?;
    mdns.set_instance_name("Duck Feeder")?;
    mdns.add_service(None, "_http", "_tcp", HTTP_PORT, &[])?;
    info!("mDNS started: http://{hostname}.local");
    Ok(mdns)
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: HTTP_PORT,
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/", Method::Get, move |req| {
            let params = lock(&state.settings).clone();
            write_html(req, &render_index(&params, &state.feeder))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = SettingsForm::from_urlencoded(core::str::from_utf8(&body)?);

            // Held across the write so concurrent saves commit in order.
            let mut settings = lock(&state.settings);
            let next = form.apply(&settings);
            if let Err(err) = state.store.save_settings(&next) {
                warn!("failed to persist settings update: {err:#}");
                return write_error(req, 500, "Failed to persist settings");
            }
            *settings = next.clone();
            drop(settings);

            info!(
                "settings saved: am={} pm={} Z={} Y={} X={} gap={}",
                next.am_end,
                next.pm_end,
                next.total_seconds,
                next.pulse_count,
                next.short_pulse_seconds,
                next.gap_minutes
            );

            redirect_home(req)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/manual", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = ManualFeedForm::from_urlencoded(core::str::from_utf8(&body)?);
            let seconds = form.duration_seconds(&state.feeder);

            info!("manual feeding for {seconds}s");
            run_motor(&state, seconds);

            match local_now(&state) {
                Some(now) => record_feed(&state, FeedEvent::manual(now.local_epoch, seconds)),
                None => warn!("manual feeding not recorded: time not synced"),
            }

            redirect_home(req)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/getTime", Method::Get, move |req| {
            let view = match local_now(&state) {
                Some(now) => TimeView::from_local(&now),
                None => TimeView::unsynced(),
            };
            write_json(req, &view)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/debug", Method::Get, move |req| {
            let rows = lock(&state.history).rows();
            write_html(req, &render_history(&rows))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/history", Method::Get, move |req| {
            let rows = lock(&state.history).rows();
            write_json(req, &rows)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_html(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    html: &str,
) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(html.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
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

fn redirect_home(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
) -> anyhow::Result<()> {
    req.into_response(302, Some("Found"), &[("Location", "/")])?;
    Ok(())
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<Option<EspNetif>> {
    let Some(fixed) = network.static_ipv4()? else {
        return Ok(None);
    };
    info!(
        "using static address {}/{} via {}",
        fixed.ip, fixed.prefix_len, fixed.gateway
    );

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: fixed.ip,
                subnet: Subnet {
                    gateway: fixed.gateway,
                    mask: Mask(fixed.prefix_len),
                },
                dns: fixed.dns,
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(Some(EspNetif::new_with_conf(&conf)?))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid not configured"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if let Some(sta_netif) = build_sta_netif(network)? {
        esp_wifi
            .swap_netif_sta(sta_netif)
            .context("failed to apply static IP netif configuration")?;
    }
    if let Err(err) = esp_wifi.sta_netif_mut().set_hostname(&network.hostname) {
        warn!("failed to set hostname `{}`: {err}", network.hostname);
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
    }
}

fn start_sntp(server: &str) -> anyhow::Result<EspSntp<'static>> {
    let mut conf = SntpConf::default();
    conf.servers[0] = server;
    let sntp = EspSntp::new(&conf).context("failed to start SNTP")?;
    info!("SNTP started against `{server}`");

    // Only front-loads the first sync; the feed loop keeps retrying on its own.
    for _ in 0..SNTP_STARTUP_WAIT_SEC {
        if sntp.get_sync_status() == SyncStatus::Completed {
            info!("SNTP sync completed: utc epoch {}", Utc::now().timestamp());
            return Ok(sntp);
        }
        thread::sleep(Duration::from_secs(1));
    }

    warn!("SNTP sync still pending after {SNTP_STARTUP_WAIT_SEC}s");
    Ok(sntp)
}

fn spawn_control_loop(state: SharedState) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("feed-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register feed loop with watchdog: {err:#}");
            }

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                refresh_clock(&state, now_ms);
                if let Some(now) = local_now(&state) {
                    let params = lock(&state.settings).clone();
                    let actions = lock(&state.engine).tick(&params, &now);

                    for action in actions {
                        info!(
                            "{} feeding #{} firing for {}s",
                            action.session.label(),
                            action.ordinal,
                            action.duration_seconds
                        );
                        run_motor(&state, action.duration_seconds);

                        let finished = local_now(&state).unwrap_or(now);
                        record_feed(&state, FeedEvent::scheduled(&action, finished.local_epoch));
                    }
                }

                thread::sleep(Duration::from_millis(state.feeder.tick_interval_ms));
            }
        })
        .context("failed to spawn feed loop thread")?;

    Ok(())
}

fn refresh_clock(state: &SharedState, now_ms: u64) {
    let mut clock = lock(&state.clock);
    if !clock.refresh_due(now_ms, state.feeder.time_refresh_interval_ms) {
        return;
    }

    // SNTP disciplines the system clock in the background.
    let utc_epoch = Utc::now().timestamp();
    if is_plausible_epoch(utc_epoch) {
        if !clock.is_synced() {
            info!("time synced: utc epoch {utc_epoch}");
        }
        clock.record_sync(utc_epoch, now_ms);
    } else {
        clock.record_failure(now_ms);
        warn!(
            "time refresh failed ({} in a row): system clock at epoch {utc_epoch}",
            clock.failed_attempts()
        );
    }
}

fn local_now(state: &SharedState) -> Option<LocalTime> {
    let utc_epoch = lock(&state.clock).now_utc(monotonic_ms())?;
    Some(state.resolver.resolve(utc_epoch))
}

fn run_motor(state: &SharedState, seconds: u16) {
    let mut motor = lock(&state.motor);
    match motor.as_mut() {
        Some(driver) => {
            if let Err(err) = driver.run(seconds) {
                warn!("motor run of {seconds}s failed: {err:#}");
            }
        }
        None => warn!("motor unavailable; skipping {seconds}s run"),
    }
}

fn record_feed(state: &SharedState, event: FeedEvent) {
    let mut history = lock(&state.history);
    history.append(event);
    if let Err(err) = state.store.save_history(&history) {
        warn!("failed to persist feeding history: {err:#}");
    }
}

fn build_status(state: &SharedState) -> FeederStatus {
    let now = local_now(state);
    let params = lock(&state.settings).clone();
    let engine = lock(&state.engine).clone();
    let history = lock(&state.history).clone();

    FeederStatus::build(&params, &engine, &history, now.as_ref())
}

impl MotorDriver {
    fn new(pins: &MotorHardwareConfig) -> anyhow::Result<Self> {
        let pin_a = unsafe { PinDriver::output(AnyOutputPin::new(pins.pin_a)) }
            .with_context(|| format!("GPIO{} unavailable", pins.pin_a))?;
        let pin_b = unsafe { PinDriver::output(AnyOutputPin::new(pins.pin_b)) }
            .with_context(|| format!("GPIO{} unavailable", pins.pin_b))?;

        let mut driver = Self { pin_a, pin_b };
        driver.stop()?;
        Ok(driver)
    }

    /// Blocks for the whole run. The motor is stopped even if starting it
    /// failed part way.
    fn run(&mut self, seconds: u16) -> anyhow::Result<()> {
        let started = self.start();
        if started.is_ok() {
            // One-second slices so a long pulse does not trip the watchdog.
            for _ in 0..seconds {
                feed_watchdog();
                thread::sleep(Duration::from_secs(1));
            }
        }
        let stopped = self.stop();
        started.and(stopped)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.pin_a.set_high()?;
        self.pin_b.set_low()?;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.pin_a.set_low()?;
        self.pin_b.set_low()?;
        Ok(())
    }
}

impl NvsStore {
    /// One JSON record beside the settings keys.
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), SETTINGS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; MAX_RUNTIME_JSON];

        match nvs.get_str(RUNTIME_KEY, &mut buffer)? {
            Some(value) => serde_json::from_str::<RuntimeConfig>(value)
                .context("stored runtime config is malformed"),
            None => Ok(RuntimeConfig::default()),
        }
    }

    /// Missing keys fall back to their defaults one by one.
    fn load_settings(&self) -> anyhow::Result<SessionParameters> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), SETTINGS_NAMESPACE, true)?;
        let defaults = SessionParameters::default();
        let mut buffer = [0_u8; 16];

        let am_end = nvs
            .get_str(KEY_AM_END, &mut buffer)?
            .and_then(|raw| raw.parse::<ClockTime>().ok())
            .unwrap_or(defaults.am_end);
        let pm_end = nvs
            .get_str(KEY_PM_END, &mut buffer)?
            .and_then(|raw| raw.parse::<ClockTime>().ok())
            .unwrap_or(defaults.pm_end);

        let settings = SessionParameters {
            am_end,
            pm_end,
            total_seconds: nvs
                .get_u16(KEY_TOTAL_SECONDS)?
                .unwrap_or(defaults.total_seconds),
            pulse_count: nvs.get_u8(KEY_PULSE_COUNT)?.unwrap_or(defaults.pulse_count),
            short_pulse_seconds: nvs
                .get_u8(KEY_SHORT_PULSE_SECONDS)?
                .unwrap_or(defaults.short_pulse_seconds),
            gap_minutes: nvs.get_u8(KEY_GAP_MINUTES)?.unwrap_or(defaults.gap_minutes),
        };

        Ok(settings.sanitized())
    }

    fn save_settings(&self, settings: &SessionParameters) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), SETTINGS_NAMESPACE, true)?;
        nvs.set_str(KEY_AM_END, &settings.am_end.to_string())?;
        nvs.set_str(KEY_PM_END, &settings.pm_end.to_string())?;
        nvs.set_u16(KEY_TOTAL_SECONDS, settings.total_seconds)?;
        nvs.set_u8(KEY_PULSE_COUNT, settings.pulse_count)?;
        nvs.set_u8(KEY_SHORT_PULSE_SECONDS, settings.short_pulse_seconds)?;
        nvs.set_u8(KEY_GAP_MINUTES, settings.gap_minutes)?;
        Ok(())
    }

    fn load_history(&self) -> anyhow::Result<HistoryLog> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), HISTORY_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; MAX_HISTORY_JSON + 1];

        match nvs.get_str(HISTORY_RING_KEY, &mut buffer)? {
            Some(value) => {
                let mut history = serde_json::from_str::<HistoryLog>(value)
                    .context("stored history ring is malformed")?;
                history.normalize();
                Ok(history)
            }
            None => Ok(HistoryLog::default()),
        }
    }

    /// Ring and cursor go out in a single write.
    fn save_history(&self, history: &HistoryLog) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), HISTORY_NAMESPACE, true)?;
        let payload = serde_json::to_string(history)?;
        if payload.len() > MAX_HISTORY_JSON {
            return Err(anyhow!("history ring too large ({} bytes)", payload.len()));
        }
        nvs.set_str(HISTORY_RING_KEY, &payload)?;
        Ok(())
    }
}

// Every guarded value is replaced whole, so a poisoned lock still holds a
// consistent value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

// Unsubscribed tasks (the HTTP worker) just get ESP_ERR_NOT_FOUND back.
fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

#[allow(unreachable_code)]
fn restart_device() -> ! {
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
    loop {
        thread::sleep(Duration::from_secs(1));
    }
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
