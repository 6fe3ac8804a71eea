use serde::{Deserialize, Serialize};

/// Station credentials, persisted under the `wifi` namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

/// Device settings, persisted under the `cfg` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub api_key: String,
    pub endpoint_url: String,
    pub dashboard_url: String,
    #[serde(default)]
    pub filtre_id: Option<u32>,
    #[serde(default)]
    pub sensor_name: Option<String>,
    #[serde(default)]
    pub sensor_kind: Option<String>,
    #[serde(default)]
    pub filter_strength: Option<u32>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint_url: "http://192.168.1.100/api/mesures/".to_string(),
            dashboard_url: "http://192.168.1.100/clients/".to_string(),
            filtre_id: None,
            sensor_name: None,
            sensor_kind: None,
            filter_strength: None,
        }
    }
}

/// The whole persisted configuration. Owned by the store; consumers take a
/// read copy and re-read explicitly after a save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub wifi: WifiCredentials,
    pub settings: DeviceSettings,
}

impl DeviceConfig {
    /// An empty (all-whitespace) SSID means "no configuration" regardless of
    /// what the password field contains.
    pub fn has_station_credentials(&self) -> bool {
        !self.wifi.ssid.trim().is_empty()
    }

    pub fn sanitize(&mut self) {
        self.wifi.ssid = self.wifi.ssid.trim().to_string();
        self.settings.endpoint_url = self.settings.endpoint_url.trim().to_string();
        self.settings.dashboard_url = self.settings.dashboard_url.trim().to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_credentials() {
        let config = DeviceConfig::default();
        assert!(!config.has_station_credentials());
    }

    #[test]
    fn blank_ssid_ignores_password() {
        let config = DeviceConfig {
            wifi: WifiCredentials {
                ssid: "   ".to_string(),
                password: "hunter2".to_string(),
            },
            ..Default::default()
        };

        assert!(!config.has_station_credentials());
    }

    #[test]
    fn stored_ssid_counts_as_credentials() {
        let config = DeviceConfig {
            wifi: WifiCredentials {
                ssid: "maison".to_string(),
                password: String::new(),
            },
            ..Default::default()
        };

        assert!(config.has_station_credentials());
    }

    #[test]
    fn sanitize_trims_ssid() {
        let mut config = DeviceConfig {
            wifi: WifiCredentials {
                ssid: " maison ".to_string(),
                password: "pw".to_string(),
            },
            ..Default::default()
        };

        config.sanitize();
        assert_eq!(config.wifi.ssid, "maison");
    }
}
