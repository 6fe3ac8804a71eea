use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    Booting,
    AttemptingStation,
    Connected,
    AccessPointFallback,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::AttemptingStation => "ATTEMPTING_STATION",
            Self::Connected => "CONNECTED",
            Self::AccessPointFallback => "ACCESS_POINT_FALLBACK",
        }
    }
}

/// Per-channel view used by the status payload and the dashboard page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanSnapshot {
    pub index: usize,
    #[serde(rename = "vitesse")]
    pub speed_percent: u8,
    pub rpm: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub connectivity: &'static str,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    #[serde(rename = "ventilateurs")]
    pub fans: Vec<FanSnapshot>,
}
