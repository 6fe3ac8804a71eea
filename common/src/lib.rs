pub mod command;
pub mod config;
pub mod connectivity;
pub mod fan;
pub mod telemetry;
pub mod types;

pub use command::{
    parse_local, parse_remote, CommandError, CommandResponse, CommandTarget, SpeedCommand,
};
pub use config::{DeviceConfig, DeviceSettings, WifiCredentials};
pub use connectivity::{
    ConnectivityMachine, RetryPolicy, StationError, StationInterface, FALLBACK_AP_SSID,
};
pub use fan::{DriveLevel, FanBank, FanBankConfig, FanError, PulseCounter};
pub use telemetry::{reading_is_valid, TelemetrySample, TelemetrySchedule};
pub use types::{ConnectivityState, DeviceStatus, FanSnapshot};
