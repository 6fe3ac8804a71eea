use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use chrono::Utc;
use dht_sensor::dht11;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, InterruptType, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvs, EspDefaultNvsPartition, EspNvs},
    wifi::EspWifi,
};
use log::{info, warn};
use serde::Serialize;

use ventilo_common::{
    command::CommandTarget,
    config::{DeviceConfig, DeviceSettings, WifiCredentials},
    connectivity::{ConnectivityMachine, RetryPolicy, StationError, StationInterface},
    fan::{DriveLevel, FanBank, FanBankConfig},
    telemetry::{reading_is_valid, TelemetrySample, TelemetrySchedule},
    types::{ConnectivityState, DeviceStatus},
    CommandError, CommandResponse, SpeedCommand, FALLBACK_AP_SSID,
};

const NVS_WIFI_NAMESPACE: &str = "wifi";
const NVS_CFG_NAMESPACE: &str = "cfg";

const KEY_SSID: &str = "ssid";
const KEY_PASSWORD: &str = "password";
const KEY_API_KEY: &str = "api_key";
const KEY_ENDPOINT_URL: &str = "endpoint_url";
const KEY_DASHBOARD_URL: &str = "dashboard_url";
const KEY_FILTRE_ID: &str = "filtre_id";
const KEY_SENSOR_NAME: &str = "sensor_name";
const KEY_SENSOR_KIND: &str = "sensor_kind";
const KEY_FILTER_STRENGTH: &str = "filter_str";

const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const RESTART_DELAY_MS: u64 = 3_000;
const LOOP_TICK_MS: u64 = 200;

const FAN_COUNT: usize = 3;
const FAN_PWM_PINS: [i32; FAN_COUNT] = [25, 26, 27];
// Input-only pins; the tach lines carry external pull-ups.
const FAN_TACH_PINS: [i32; FAN_COUNT] = [34, 35, 39];
const FAN_PWM_FREQUENCY_HZ: u32 = 25_000;
const DEFAULT_FAN_PERCENT: i32 = 50;
const DHT_PIN: i32 = 4;

const TELEMETRY_SEND_DELAY_MS: u64 = 1_500;
const API_KEY_HEADER: &str = "X-ESP32-KEY";

// Remote speed commands are only served while in station mode; in fallback
// mode the surface is configuration-only and the fans keep their defaults.
const EXPOSE_FAN_FORM_IN_FALLBACK: bool = false;

const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="fr">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Contrôleur de ventilation</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:8px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}input[type=number]{width:6rem;padding:.4rem}
    .muted{color:#555}.warn{color:#a00000}button{padding:.5rem .9rem;margin-top:.6rem}
    table{border-collapse:collapse}td,th{padding:.3rem .8rem;text-align:left}
  </style>
</head>
<body>
  <h1>Contrôleur de ventilation</h1>
  <div class="card">
    <h2>Mesures</h2>
    <p>Température : <b id="temp">--</b> °C &nbsp; Humidité : <b id="hum">--</b> %</p>
    <p id="sensorWarn" class="warn" hidden>Capteur indisponible</p>
  </div>
  <div class="card">
    <h2>Ventilateurs</h2>
    <table>
      <thead><tr><th>#</th><th>Vitesse</th><th>RPM</th></tr></thead>
      <tbody id="fans"></tbody>
    </table>
    <form action="/fan" method="POST">
      <label>Ventilateur (1-3, vide = tous)</label><input name="fan" type="number" min="1" max="3">
      <label>Vitesse (%)</label><input name="speed" type="number" min="0" max="100" required>
      <button type="submit">Appliquer</button>
    </form>
  </div>
  <p><a href="{dashboard_url}"><button>Ouvrir le Dashboard</button></a>
     <a href="/config"><button>Configuration</button></a>
     <a href="/reset"><button>Réinitialiser</button></a></p>
  <script>
    async function refresh(){
      const r=await fetch('/api/status');
      const s=await r.json();
      const missing=s.temperature==null;
      document.getElementById('sensorWarn').hidden=!missing;
      document.getElementById('temp').textContent=missing?'--':s.temperature.toFixed(1);
      document.getElementById('hum').textContent=missing?'--':s.humidity.toFixed(1);
      document.getElementById('fans').innerHTML=s.ventilateurs
        .map(f=>'<tr><td>'+(f.index+1)+'</td><td>'+f.vitesse+' %</td><td>'+f.rpm+'</td></tr>')
        .join('');
    }
    refresh();setInterval(refresh,2000);
  </script>
</body>
</html>
"#;

const CONFIG_HTML: &str = r#"<!doctype html>
<html lang="fr">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Configuration WiFi</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:8px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password],input[type=number]{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}button{padding:.5rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Configuration</h1>
  <p class="muted">Vous êtes connecté au réseau de configuration <b>Capteur_Config</b>.
     Ouvrez cette page (http://192.168.4.1) pour configurer votre WiFi.</p>
  <form action="/save" method="POST">
    <div class="card">
      <h2>Réseau WiFi</h2>
      <label>Réseau WiFi (SSID)</label><input name="ssid" type="text" required>
      <label>Mot de passe</label><input name="password" type="password">
    </div>
    <div class="card">
      <h2>Télémétrie</h2>
      <label>Clé API</label><input name="api_key" type="text">
      <label>URL du serveur de mesures</label><input name="endpoint_url" type="text">
      <label>URL du Dashboard</label><input name="dashboard_url" type="text">
      <label>Identifiant du filtre</label><input name="filtre_id" type="number" min="0">
      <label>Nom du capteur</label><input name="sensor_name" type="text">
      <label>Type du capteur</label><input name="sensor_kind" type="text">
      <label>Force du filtre</label><input name="filter_strength" type="number" min="0">
    </div>
    <button type="submit">Se connecter</button>
  </form>
  <form action="/reset" method="GET"><button type="submit">Réinitialiser le WiFi</button></form>
</body>
</html>
"#;

const SAVED_HTML: &str = r#"<!doctype html>
<html lang="fr"><head><meta charset="utf-8"><title>Connexion en cours</title></head>
<body><h2>Configuration enregistrée ✅</h2>
<p>L'appareil va redémarrer et tenter de se connecter au réseau enregistré.</p>
<p>Veuillez patienter quelques secondes...</p></body></html>
"#;

const RESET_HTML: &str =
    "<h2>Configuration réinitialisée ! Redémarrage...</h2>";

const FAN_ACK_HTML: &str = r#"<!doctype html>
<html lang="fr"><head><meta charset="utf-8"><title>Vitesse appliquée</title></head>
<body><h2>Vitesse mise à jour ✅</h2><p><a href="/">Retour</a></p></body></html>
"#;

#[derive(Debug, Clone, Copy)]
struct SensorReading {
    temperature_c: f32,
    humidity: f32,
}

#[derive(Clone)]
struct SharedState {
    fans: Arc<Mutex<FanBank>>,
    outputs: Arc<Mutex<Vec<LedcDriver<'static>>>>,
    last_reading: Arc<Mutex<Option<SensorReading>>>,
    connectivity: Arc<Mutex<ConnectivityState>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "apiKeySet")]
    api_key_set: bool,
    #[serde(rename = "endpointUrl")]
    endpoint_url: String,
    #[serde(rename = "dashboardUrl")]
    dashboard_url: String,
    #[serde(rename = "filtreId")]
    filtre_id: Option<u32>,
    #[serde(rename = "sensorName")]
    sensor_name: Option<String>,
    #[serde(rename = "sensorKind")]
    sensor_kind: Option<String>,
    #[serde(rename = "filterStrength")]
    filter_strength: Option<u32>,
}

struct EspStation<'d> {
    wifi: &'d mut EspWifi<'static>,
}

impl StationInterface for EspStation<'_> {
    fn begin_connect(&mut self, ssid: &str, password: &str) -> Result<(), StationError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let config = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| StationError("wifi ssid too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| StationError("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&config)
            .map_err(station_error)?;
        self.wifi.start().map_err(station_error)?;
        self.wifi.connect().map_err(station_error)?;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        let link_up = self.wifi.is_connected().unwrap_or(false);
        let ip_up = self
            .wifi
            .sta_netif()
            .get_ip_info()
            .map(|info| !info.ip.is_unspecified())
            .unwrap_or(false);

        link_up && ip_up
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), StationError> {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();

        let config = Configuration::AccessPoint(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| StationError("fallback AP ssid too long".to_string()))?,
            auth_method: AuthMethod::None,
            channel: 1,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&config)
            .map_err(station_error)?;
        self.wifi.start().map_err(station_error)?;
        Ok(())
    }

    fn wait(&mut self, duration_ms: u64) {
        thread::sleep(Duration::from_millis(duration_ms));
    }
}

fn station_error(err: esp_idf_svc::sys::EspError) -> StationError {
    StationError(err.to_string())
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        DeviceConfig::default()
    });
    config.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, endpoint=`{}`, filtre_id={:?}",
        config.wifi.ssid, config.settings.endpoint_url, config.settings.filtre_id,
    );

    let Peripherals { modem, ledc, .. } = Peripherals::take()?;

    let pwm_timer = LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig {
            frequency: Hertz(FAN_PWM_FREQUENCY_HZ),
            resolution: Resolution::Bits8,
            ..Default::default()
        },
    )?;

    let mut outputs = vec![
        LedcDriver::new(ledc.channel0, &pwm_timer, unsafe {
            AnyOutputPin::new(FAN_PWM_PINS[0])
        })?,
        LedcDriver::new(ledc.channel1, &pwm_timer, unsafe {
            AnyOutputPin::new(FAN_PWM_PINS[1])
        })?,
        LedcDriver::new(ledc.channel2, &pwm_timer, unsafe {
            AnyOutputPin::new(FAN_PWM_PINS[2])
        })?,
    ];

    let max_duty = outputs[0].get_max_duty();
    let mut fans = FanBank::new(
        FanBankConfig {
            max_duty,
            ..Default::default()
        },
        FAN_COUNT,
    );

    // Fans spin up before any network work and keep running no matter what
    // the connectivity ends up being.
    for drive in fans.set_all(DEFAULT_FAN_PERCENT) {
        write_drive(&mut outputs, drive)?;
    }
    for output in &mut outputs {
        output.enable()?;
    }
    info!("fan outputs initialized at {DEFAULT_FAN_PERCENT}% (max_duty={max_duty})");

    let mut tach_inputs = attach_tach_interrupts(&fans)?;

    let state = SharedState {
        fans: Arc::new(Mutex::new(fans)),
        outputs: Arc::new(Mutex::new(outputs)),
        last_reading: Arc::new(Mutex::new(None)),
        connectivity: Arc::new(Mutex::new(ConnectivityState::Booting)),
    };

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut machine = ConnectivityMachine::new(RetryPolicy::default());
    let connectivity = {
        let mut station = EspStation {
            wifi: &mut esp_wifi,
        };
        machine.establish(&config, &mut station)
    };
    *state.connectivity.lock().unwrap() = connectivity;

    let _server = match connectivity {
        ConnectivityState::Connected => {
            if let Ok(ip_info) = esp_wifi.sta_netif().get_ip_info() {
                info!("station connected, ip={}", ip_info.ip);
            }
            create_http_server(state.clone(), nvs_store.clone(), config.settings.clone())?
        }
        _ => {
            warn!("station unavailable; serving configuration AP `{FALLBACK_AP_SSID}`");
            create_fallback_server(state.clone(), nvs_store.clone())?
        }
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    let mut dht_pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(DHT_PIN) })?;
    dht_pin.set_pull(Pull::Up)?;
    dht_pin.set_high()?;

    let mut schedule = TelemetrySchedule::new(TelemetrySchedule::DEFAULT_INTERVAL_MS);

    // Keep services alive for the program lifetime.
    let _wifi = esp_wifi;
    let _pwm_timer = pwm_timer;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        {
            let mut fans = state.fans.lock().unwrap();
            for channel in 0..fans.channel_count() {
                let _ = fans.rpm(channel, now_ms);
            }
        }
        // Re-arm each tick; subscribe-based pin interrupts are one-shot on
        // some IDF versions.
        for input in &mut tach_inputs {
            let _ = input.enable_interrupt();
        }

        if connectivity == ConnectivityState::Connected && schedule.due(now_ms) {
            run_telemetry_cycle(&state, &config.settings, &mut dht_pin, &mut schedule, now_ms);
        }

        thread::sleep(Duration::from_millis(LOOP_TICK_MS));
    }
}

fn attach_tach_interrupts(
    fans: &FanBank,
) -> anyhow::Result<Vec<PinDriver<'static, AnyIOPin, esp_idf_hal::gpio::Input>>> {
    let mut inputs = Vec::with_capacity(FAN_COUNT);

    for (channel, pin) in FAN_TACH_PINS.iter().copied().enumerate() {
        let mut input = PinDriver::input(unsafe { AnyIOPin::new(pin) })?;
        input.set_interrupt_type(InterruptType::NegEdge)?;

        let counter = fans.counter(channel)?;
        unsafe {
            input.subscribe(move || counter.record_edge())?;
        }
        input.enable_interrupt()?;
        inputs.push(input);
    }

    Ok(inputs)
}

fn write_drive(outputs: &mut [LedcDriver<'static>], drive: DriveLevel) -> anyhow::Result<()> {
    let output = outputs
        .get_mut(drive.channel)
        .ok_or_else(|| anyhow!("no PWM output for channel {}", drive.channel))?;
    output.set_duty(drive.duty)?;
    Ok(())
}

/// Applies a validated command to the bank and the PWM outputs; returns the
/// cached RPM when a single channel was targeted.
fn apply_speed_command(
    state: &SharedState,
    command: &SpeedCommand,
) -> anyhow::Result<Option<u32>> {
    let mut fans = state.fans.lock().unwrap();
    let mut outputs = state.outputs.lock().unwrap();

    match command.target {
        CommandTarget::All => {
            for drive in fans.set_all(command.percent as i32) {
                write_drive(&mut outputs, drive)?;
            }
            Ok(None)
        }
        CommandTarget::Channel(channel) => {
            let drive = fans.set_speed(channel, command.percent as i32)?;
            write_drive(&mut outputs, drive)?;
            Ok(fans.rpm(channel, monotonic_ms()).ok())
        }
    }
}

fn run_telemetry_cycle(
    state: &SharedState,
    settings: &DeviceSettings,
    dht_pin: &mut PinDriver<'static, AnyIOPin, InputOutput>,
    schedule: &mut TelemetrySchedule,
    now_ms: u64,
) {
    let (temperature, humidity) = read_sensor(dht_pin);
    if !reading_is_valid(temperature) || !reading_is_valid(humidity) {
        // The schedule is left untouched so the read retries next tick.
        warn!("invalid sensor reading, telemetry cycle skipped");
        return;
    }

    *state.last_reading.lock().unwrap() = Some(SensorReading {
        temperature_c: temperature,
        humidity,
    });

    let recorded_at = Utc::now().timestamp();
    let nom = settings
        .sensor_name
        .clone()
        .unwrap_or_else(|| "capteur".to_string());

    let samples = [
        TelemetrySample::new(nom.clone(), "temperature", temperature, recorded_at),
        TelemetrySample::new(nom, "humidite", humidity, recorded_at),
    ];

    for (index, sample) in samples.iter().enumerate() {
        if index > 0 {
            thread::sleep(Duration::from_millis(TELEMETRY_SEND_DELAY_MS));
        }

        match send_sample(settings, sample) {
            Ok(status) if (200..300).contains(&status) => {
                info!("telemetry `{}` sent (HTTP {status})", sample.kind);
            }
            Ok(status) => warn!("telemetry `{}` rejected: HTTP {status}", sample.kind),
            Err(err) => warn!("telemetry `{}` send failed: {err:#}", sample.kind),
        }
    }

    schedule.mark_sent(now_ms);
}

fn read_sensor(dht_pin: &mut PinDriver<'static, AnyIOPin, InputOutput>) -> (f32, f32) {
    if let Err(err) = dht_pin.set_high() {
        warn!("failed to set DHT11 line high before read: {err:?}");
        return (f32::NAN, f32::NAN);
    }

    match dht11::blocking::read(&mut Ets, dht_pin) {
        Ok(reading) => (
            reading.temperature as f32,
            reading.relative_humidity as f32,
        ),
        Err(err) => {
            warn!("failed to read DHT11 on GPIO{DHT_PIN}: {err:?}");
            (f32::NAN, f32::NAN)
        }
    }
}

fn send_sample(settings: &DeviceSettings, sample: &TelemetrySample) -> anyhow::Result<u16> {
    let body = serde_json::to_vec(sample)?;

    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(10)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

    let content_length = body.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", content_length.as_str()),
        (API_KEY_HEADER, settings.api_key.as_str()),
    ];

    let mut request = client
        .post(&settings.endpoint_url, &headers)
        .map_err(|e| anyhow!("{e:?}"))?;
    request.write_all(&body).map_err(|e| anyhow!("{e:?}"))?;
    let response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    Ok(response.status())
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
    settings: DeviceSettings,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let dashboard = DASHBOARD_HTML.replace("{dashboard_url}", &settings.dashboard_url);
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            req.into_ok_response()?.write_all(dashboard.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/config", Method::Get, move |req| {
        req.into_ok_response()?.write_all(CONFIG_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let config = nvs_store.load_config().unwrap_or_default();
            write_json(req, &build_config_view(&config))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/fan", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;

            let channel_count = state.fans.lock().unwrap().channel_count();
            match ventilo_common::parse_remote(&body, channel_count) {
                Ok(command) => {
                    let rpm = apply_speed_command(&state, &command)?;
                    write_json(req, &CommandResponse::success(&command, rpm))
                }
                Err(err) => write_json_status(req, 400, &CommandResponse::error(&err)),
            }
        })?;
    }

    server.fn_handler("/api/fan", Method::Get, move |req| {
        let response = CommandResponse::error(&CommandError::Malformed(
            "méthode non autorisée".to_string(),
        ));
        write_json_status(req, 405, &response)
    })?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/fan", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = String::from_utf8(body).unwrap_or_default();

            let fan = form_param(&form, "fan").filter(|value| !value.is_empty());
            let speed = form_param(&form, "speed").filter(|value| !value.is_empty());

            let channel_count = state.fans.lock().unwrap().channel_count();
            match ventilo_common::parse_local(fan.as_deref(), speed.as_deref(), channel_count) {
                Ok(command) => {
                    apply_speed_command(&state, &command)?;
                    req.into_ok_response()?.write_all(FAN_ACK_HTML.as_bytes())?;
                    Ok(())
                }
                Err(err) => write_json_status(req, 400, &CommandResponse::error(&err)),
            }
        })?;
    }

    register_save_handler(&mut server, nvs_store.clone())?;
    register_reset_handler(&mut server, nvs_store)?;

    Ok(server)
}

fn create_fallback_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(CONFIG_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let config = nvs_store.load_config().unwrap_or_default();
            write_json(req, &build_config_view(&config))
        })?;
    }

    if EXPOSE_FAN_FORM_IN_FALLBACK {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/fan", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = String::from_utf8(body).unwrap_or_default();

            let fan = form_param(&form, "fan").filter(|value| !value.is_empty());
            let speed = form_param(&form, "speed").filter(|value| !value.is_empty());

            let channel_count = state.fans.lock().unwrap().channel_count();
            match ventilo_common::parse_local(fan.as_deref(), speed.as_deref(), channel_count) {
                Ok(command) => {
                    apply_speed_command(&state, &command)?;
                    req.into_ok_response()?.write_all(FAN_ACK_HTML.as_bytes())?;
                    Ok(())
                }
                Err(err) => write_json_status(req, 400, &CommandResponse::error(&err)),
            }
        })?;
    }

    register_save_handler(&mut server, nvs_store.clone())?;
    register_reset_handler(&mut server, nvs_store)?;

    Ok(server)
}

fn register_save_handler(
    server: &mut EspHttpServer<'static>,
    nvs_store: NvsStore,
) -> anyhow::Result<()> {
    server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let form = String::from_utf8(body).unwrap_or_default();

        let ssid = form_param(&form, "ssid").unwrap_or_default();
        if ssid.trim().is_empty() {
            return write_error(req, 400, "Le champ SSID est requis");
        }

        let defaults = DeviceSettings::default();
        let config = DeviceConfig {
            wifi: WifiCredentials {
                ssid: ssid.trim().to_string(),
                password: form_param(&form, "password").unwrap_or_default(),
            },
            settings: DeviceSettings {
                api_key: form_param(&form, "api_key").unwrap_or_default(),
                endpoint_url: form_param(&form, "endpoint_url")
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or(defaults.endpoint_url),
                dashboard_url: form_param(&form, "dashboard_url")
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or(defaults.dashboard_url),
                filtre_id: form_param(&form, "filtre_id").and_then(|value| value.parse().ok()),
                sensor_name: form_param(&form, "sensor_name")
                    .filter(|value| !value.trim().is_empty()),
                sensor_kind: form_param(&form, "sensor_kind")
                    .filter(|value| !value.trim().is_empty()),
                filter_strength: form_param(&form, "filter_strength")
                    .and_then(|value| value.parse().ok()),
            },
        };

        nvs_store.save_config(&config)?;
        info!("configuration saved for ssid=`{}`, restarting", config.wifi.ssid);

        req.into_ok_response()?.write_all(SAVED_HTML.as_bytes())?;
        // Saving always restarts instead of reconnecting live; the state
        // machine only ever transitions out of Booting.
        schedule_restart(RESTART_DELAY_MS);
        Ok(())
    })?;

    Ok(())
}

fn register_reset_handler(
    server: &mut EspHttpServer<'static>,
    nvs_store: NvsStore,
) -> anyhow::Result<()> {
    server.fn_handler::<anyhow::Error, _>("/reset", Method::Get, move |req| {
        nvs_store.clear_all()?;
        info!("stored configuration cleared, restarting");

        req.into_ok_response()?.write_all(RESET_HTML.as_bytes())?;
        schedule_restart(RESTART_DELAY_MS);
        Ok(())
    })?;

    Ok(())
}

fn build_status(state: &SharedState) -> DeviceStatus {
    let connectivity = state.connectivity.lock().unwrap().as_str();
    let reading = *state.last_reading.lock().unwrap();
    let fans = state.fans.lock().unwrap().snapshot();

    DeviceStatus {
        connectivity,
        temperature: reading.map(|r| r.temperature_c),
        humidity: reading.map(|r| r.humidity),
        fans,
    }
}

fn build_config_view(config: &DeviceConfig) -> ConfigView {
    ConfigView {
        wifi_ssid: config.wifi.ssid.clone(),
        wifi_pass_set: !config.wifi.password.is_empty(),
        api_key_set: !config.settings.api_key.is_empty(),
        endpoint_url: config.settings.endpoint_url.clone(),
        dashboard_url: config.settings.dashboard_url.clone(),
        filtre_id: config.settings.filtre_id,
        sensor_name: config.settings.sensor_name.clone(),
        sensor_kind: config.settings.sensor_kind.clone(),
        filter_strength: config.settings.filter_strength,
    }
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

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    write_json_status(req, 200, payload)
}

fn write_json_status<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
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

fn form_param(body: &str, key: &str) -> Option<String> {
    for pair in body.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(form_decode(value));
        }
    }

    None
}

fn form_decode(value: &str) -> String {
    let mut decoded = String::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(byte) = bytes.next() {
        match byte {
            b'+' => decoded.push(' '),
            b'%' => {
                let high = bytes.next().and_then(|b| (b as char).to_digit(16));
                let low = bytes.next().and_then(|b| (b as char).to_digit(16));
                match (high, low) {
                    (Some(high), Some(low)) => decoded.push((high * 16 + low) as u8 as char),
                    _ => decoded.push('%'),
                }
            }
            other => decoded.push(other as char),
        }
    }

    decoded
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().unwrap();

        let wifi_nvs = EspNvs::new(self.partition.clone(), NVS_WIFI_NAMESPACE, true)?;
        let wifi = WifiCredentials {
            ssid: get_string(&wifi_nvs, KEY_SSID)?.unwrap_or_default(),
            password: get_string(&wifi_nvs, KEY_PASSWORD)?.unwrap_or_default(),
        };

        let cfg_nvs = EspNvs::new(self.partition.clone(), NVS_CFG_NAMESPACE, true)?;
        let defaults = DeviceSettings::default();
        let settings = DeviceSettings {
            api_key: get_string(&cfg_nvs, KEY_API_KEY)?.unwrap_or(defaults.api_key),
            endpoint_url: get_string(&cfg_nvs, KEY_ENDPOINT_URL)?.unwrap_or(defaults.endpoint_url),
            dashboard_url: get_string(&cfg_nvs, KEY_DASHBOARD_URL)?
                .unwrap_or(defaults.dashboard_url),
            filtre_id: cfg_nvs.get_u32(KEY_FILTRE_ID)?,
            sensor_name: get_string(&cfg_nvs, KEY_SENSOR_NAME)?,
            sensor_kind: get_string(&cfg_nvs, KEY_SENSOR_KIND)?,
            filter_strength: cfg_nvs.get_u32(KEY_FILTER_STRENGTH)?,
        };

        Ok(DeviceConfig { wifi, settings })
    }

    fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();

        let mut wifi_nvs = EspNvs::new(self.partition.clone(), NVS_WIFI_NAMESPACE, true)?;
        wifi_nvs.set_str(KEY_SSID, &config.wifi.ssid)?;
        wifi_nvs.set_str(KEY_PASSWORD, &config.wifi.password)?;

        let mut cfg_nvs = EspNvs::new(self.partition.clone(), NVS_CFG_NAMESPACE, true)?;
        cfg_nvs.set_str(KEY_API_KEY, &config.settings.api_key)?;
        cfg_nvs.set_str(KEY_ENDPOINT_URL, &config.settings.endpoint_url)?;
        cfg_nvs.set_str(KEY_DASHBOARD_URL, &config.settings.dashboard_url)?;

        set_optional_u32(&mut cfg_nvs, KEY_FILTRE_ID, config.settings.filtre_id)?;
        set_optional_str(
            &mut cfg_nvs,
            KEY_SENSOR_NAME,
            config.settings.sensor_name.as_deref(),
        )?;
        set_optional_str(
            &mut cfg_nvs,
            KEY_SENSOR_KIND,
            config.settings.sensor_kind.as_deref(),
        )?;
        set_optional_u32(
            &mut cfg_nvs,
            KEY_FILTER_STRENGTH,
            config.settings.filter_strength,
        )?;

        Ok(())
    }

    fn clear_all(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();

        let mut wifi_nvs = EspNvs::new(self.partition.clone(), NVS_WIFI_NAMESPACE, true)?;
        for key in [KEY_SSID, KEY_PASSWORD] {
            wifi_nvs.remove(key)?;
        }

        let mut cfg_nvs = EspNvs::new(self.partition.clone(), NVS_CFG_NAMESPACE, true)?;
        for key in [
            KEY_API_KEY,
            KEY_ENDPOINT_URL,
            KEY_DASHBOARD_URL,
            KEY_FILTRE_ID,
            KEY_SENSOR_NAME,
            KEY_SENSOR_KIND,
            KEY_FILTER_STRENGTH,
        ] {
            cfg_nvs.remove(key)?;
        }

        Ok(())
    }
}

fn get_string(nvs: &EspDefaultNvs, key: &str) -> anyhow::Result<Option<String>> {
    let mut buffer = vec![0_u8; 512];
    Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
}

fn set_optional_str(nvs: &mut EspDefaultNvs, key: &str, value: Option<&str>) -> anyhow::Result<()> {
    match value {
        Some(value) => nvs.set_str(key, value)?,
        None => {
            nvs.remove(key)?;
        }
    }
    Ok(())
}

fn set_optional_u32(nvs: &mut EspDefaultNvs, key: &str, value: Option<u32>) -> anyhow::Result<()> {
    match value {
        Some(value) => nvs.set_u32(key, value)?,
        None => {
            nvs.remove(key)?;
        }
    }
    Ok(())
}

fn schedule_restart(delay_ms: u64) {
    thread::Builder::new()
        .name("restart".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
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

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
