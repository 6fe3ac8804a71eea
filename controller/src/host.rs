use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Form, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{info, warn};

use ventilo_common::{
    command::CommandTarget,
    config::{DeviceConfig, DeviceSettings, WifiCredentials},
    connectivity::{ConnectivityMachine, RetryPolicy, StationError, StationInterface},
    fan::{FanBank, FanBankConfig},
    telemetry::{reading_is_valid, TelemetrySample, TelemetrySchedule},
    types::{ConnectivityState, DeviceStatus},
    CommandResponse, SpeedCommand,
};

const FAN_COUNT: usize = 3;
const TELEMETRY_SEND_DELAY_MS: u64 = 1_500;
// ~1800 RPM at full speed with 2 pulses per revolution.
const SIMULATED_MAX_RPM: u32 = 1_800;

const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="fr">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Contrôleur de ventilation (simulation)</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:8px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}input[type=number]{width:6rem;padding:.4rem}
    .warn{color:#a00000}button{padding:.5rem .9rem;margin-top:.6rem}
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
  <p><a href="{dashboard_url}"><button>Ouvrir le Dashboard</button></a></p>
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

const FAN_ACK_HTML: &str = r#"<!doctype html>
<html lang="fr"><head><meta charset="utf-8"><title>Vitesse appliquée</title></head>
<body><h2>Vitesse mise à jour ✅</h2><p><a href="/">Retour</a></p></body></html>
"#;

#[derive(Clone)]
struct AppState {
    fans: Arc<Mutex<FanBank>>,
    last_reading: Arc<Mutex<Option<(f32, f32)>>>,
    connectivity: Arc<Mutex<ConnectivityState>>,
    store: AppStore,
    dashboard: Arc<String>,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Deserialize)]
struct FanForm {
    #[serde(default)]
    fan: Option<String>,
    #[serde(default)]
    speed: Option<String>,
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

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: String,
    #[serde(rename = "apiKey", default)]
    api_key: String,
    #[serde(rename = "endpointUrl", default)]
    endpoint_url: Option<String>,
    #[serde(rename = "dashboardUrl", default)]
    dashboard_url: Option<String>,
    #[serde(rename = "filtreId", default)]
    filtre_id: Option<u32>,
    #[serde(rename = "sensorName", default)]
    sensor_name: Option<String>,
    #[serde(rename = "sensorKind", default)]
    sensor_kind: Option<String>,
    #[serde(rename = "filterStrength", default)]
    filter_strength: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    config: ConfigView,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// The station always comes up on the first poll and the configuration AP
/// is a log line; the boot sequencing itself is the real one.
struct SimulatedStation;

impl StationInterface for SimulatedStation {
    fn begin_connect(&mut self, ssid: &str, _password: &str) -> Result<(), StationError> {
        info!("simulated station connecting to `{ssid}`");
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        true
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), StationError> {
        info!("simulated configuration AP `{ssid}` started");
        Ok(())
    }

    fn wait(&mut self, duration_ms: u64) {
        std::thread::sleep(Duration::from_millis(duration_ms));
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load config from store: {err:#}");
        DeviceConfig::default()
    });
    config.sanitize();

    if !config.has_station_credentials() {
        // The simulation has no provisioning portal to fall back to, so a
        // blank store still boots into station mode.
        config.wifi.ssid = std::env::var("VENTILO_WIFI_SSID")
            .unwrap_or_else(|_| "simulation".to_string());
    }

    let fans = FanBank::new(FanBankConfig::default(), FAN_COUNT);
    let dashboard = DASHBOARD_HTML.replace("{dashboard_url}", &config.settings.dashboard_url);

    let app_state = AppState {
        fans: Arc::new(Mutex::new(fans)),
        last_reading: Arc::new(Mutex::new(None)),
        connectivity: Arc::new(Mutex::new(ConnectivityState::Booting)),
        store,
        dashboard: Arc::new(dashboard),
    };

    let mut machine = ConnectivityMachine::new(RetryPolicy::default());
    let connectivity = machine.establish(&config, &mut SimulatedStation);
    *app_state.connectivity.lock().await = connectivity;
    info!("connectivity established: {}", connectivity.as_str());

    spawn_tach_simulation(app_state.clone());
    spawn_control_loop(app_state.clone(), config.settings.clone());

    let app = Router::new()
        .route("/", get(handle_dashboard))
        .route("/api/status", get(handle_get_status))
        .route("/api/fan", post(handle_post_api_fan))
        .route("/fan", post(handle_post_fan_form))
        .route(
            "/api/config",
            get(handle_get_config).put(handle_put_config),
        )
        .route("/reset", post(handle_reset))
        .with_state(app_state);

    let port = std::env::var("VENTILO_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_tach_simulation(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(250));

        loop {
            interval.tick().await;

            let fans = app_state.fans.lock().await;
            for channel in 0..fans.channel_count() {
                let percent = fans.speed(channel).unwrap_or(0) as u32;
                let Ok(counter) = fans.counter(channel) else {
                    continue;
                };

                // Edges accumulated over this 250 ms slice.
                let rpm = percent * SIMULATED_MAX_RPM / 100;
                let pulses = rpm * 2 / 60 / 4;
                for _ in 0..pulses {
                    counter.record_edge();
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState, settings: DeviceSettings) {
    tokio::spawn(async move {
        let mut schedule = TelemetrySchedule::new(TelemetrySchedule::DEFAULT_INTERVAL_MS);
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            tick = tick.saturating_add(1);
            let now_ms = monotonic_ms();

            {
                let mut fans = app_state.fans.lock().await;
                for channel in 0..fans.channel_count() {
                    let _ = fans.rpm(channel, now_ms);
                }
            }

            let connectivity = *app_state.connectivity.lock().await;
            if connectivity == ConnectivityState::Connected && schedule.due(now_ms) {
                run_telemetry_cycle(&app_state, &settings, &mut schedule, tick, now_ms).await;
            }
        }
    });
}

async fn run_telemetry_cycle(
    app_state: &AppState,
    settings: &DeviceSettings,
    schedule: &mut TelemetrySchedule,
    tick: u64,
    now_ms: u64,
) {
    // Hardware integration point: replace the simulated readings with the
    // DHT11 driver on the ESP target.
    let temperature = 21.0 + ((tick % 8) as f32 * 0.2);
    let humidity = 42.0 + ((tick % 6) as f32 * 0.5);

    if !reading_is_valid(temperature) || !reading_is_valid(humidity) {
        warn!("invalid sensor reading, telemetry cycle skipped");
        return;
    }

    *app_state.last_reading.lock().await = Some((temperature, humidity));

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
            tokio::time::sleep(Duration::from_millis(TELEMETRY_SEND_DELAY_MS)).await;
        }

        // The blocking HTTP-POST capability only exists on the ESP target;
        // the simulation logs the dispatch.
        match serde_json::to_string(sample) {
            Ok(payload) => info!(
                "telemetry `{}` -> {}: {payload}",
                sample.kind, settings.endpoint_url
            ),
            Err(err) => warn!("telemetry serialization failed: {err}"),
        }
    }

    schedule.mark_sent(now_ms);
}

async fn apply_speed_command(app_state: &AppState, command: &SpeedCommand) -> Option<u32> {
    let mut fans = app_state.fans.lock().await;

    match command.target {
        CommandTarget::All => {
            for drive in fans.set_all(command.percent as i32) {
                tracing::debug!("drive channel {} -> duty {}", drive.channel, drive.duty);
            }
            None
        }
        CommandTarget::Channel(channel) => {
            if let Ok(drive) = fans.set_speed(channel, command.percent as i32) {
                tracing::debug!("drive channel {} -> duty {}", drive.channel, drive.duty);
            }
            fans.rpm(channel, monotonic_ms()).ok()
        }
    }
}

async fn handle_dashboard(State(app_state): State<AppState>) -> impl IntoResponse {
    Html(app_state.dashboard.as_ref().clone())
}

async fn handle_get_status(State(app_state): State<AppState>) -> impl IntoResponse {
    let connectivity = app_state.connectivity.lock().await.as_str();
    let reading = *app_state.last_reading.lock().await;
    let fans = app_state.fans.lock().await.snapshot();

    Json(DeviceStatus {
        connectivity,
        temperature: reading.map(|(temperature, _)| temperature),
        humidity: reading.map(|(_, humidity)| humidity),
        fans,
    })
}

async fn handle_post_api_fan(State(app_state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let channel_count = app_state.fans.lock().await.channel_count();

    match ventilo_common::parse_remote(&body, channel_count) {
        Ok(command) => {
            let rpm = apply_speed_command(&app_state, &command).await;
            (StatusCode::OK, Json(CommandResponse::success(&command, rpm))).into_response()
        }
        Err(err) => {
            (StatusCode::BAD_REQUEST, Json(CommandResponse::error(&err))).into_response()
        }
    }
}

async fn handle_post_fan_form(
    State(app_state): State<AppState>,
    Form(form): Form<FanForm>,
) -> impl IntoResponse {
    let fan = form.fan.as_deref().filter(|value| !value.is_empty());
    let speed = form.speed.as_deref().filter(|value| !value.is_empty());

    let channel_count = app_state.fans.lock().await.channel_count();
    match ventilo_common::parse_local(fan, speed, channel_count) {
        Ok(command) => {
            apply_speed_command(&app_state, &command).await;
            Html(FAN_ACK_HTML).into_response()
        }
        Err(err) => {
            (StatusCode::BAD_REQUEST, Json(CommandResponse::error(&err))).into_response()
        }
    }
}

async fn handle_get_config(State(app_state): State<AppState>) -> impl IntoResponse {
    let config = app_state.store.load_config().await.unwrap_or_default();
    Json(build_config_view(&config))
}

async fn handle_put_config(
    State(app_state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    if update.wifi_ssid.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Le champ SSID est requis");
    }

    let defaults = DeviceSettings::default();
    let config = DeviceConfig {
        wifi: WifiCredentials {
            ssid: update.wifi_ssid.trim().to_string(),
            password: update.wifi_pass,
        },
        settings: DeviceSettings {
            api_key: update.api_key,
            endpoint_url: update
                .endpoint_url
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.endpoint_url),
            dashboard_url: update
                .dashboard_url
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.dashboard_url),
            filtre_id: update.filtre_id,
            sensor_name: update.sensor_name.filter(|value| !value.trim().is_empty()),
            sensor_kind: update.sensor_kind.filter(|value| !value.trim().is_empty()),
            filter_strength: update.filter_strength,
        },
    };

    if let Err(err) = app_state.store.save_config(&config).await {
        warn!("failed to persist configuration: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist configuration",
        );
    }

    // Saving always restarts the device instead of reconnecting live; the
    // simulation reports it and keeps running.
    info!("configuration saved for ssid=`{}`; restart required", config.wifi.ssid);

    Json(ConfigUpdateResponse {
        restart_required: true,
        config: build_config_view(&config),
    })
    .into_response()
}

async fn handle_reset(State(app_state): State<AppState>) -> impl IntoResponse {
    if let Err(err) = app_state.store.clear().await {
        warn!("failed to clear configuration store: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to clear configuration",
        );
    }

    info!("stored configuration cleared; restart required");
    Html("<h2>Configuration réinitialisée ! Redémarrage...</h2>").into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("VENTILO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.ventilo"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<DeviceConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.config_path.as_ref()).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
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
