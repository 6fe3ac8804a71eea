use thiserror::Error;

use crate::{config::DeviceConfig, types::ConnectivityState};

/// SSID advertised while waiting to be configured.
pub const FALLBACK_AP_SSID: &str = "Capteur_Config";

#[derive(Debug, Error)]
#[error("station interface error: {0}")]
pub struct StationError(pub String);

/// Seam between the state machine and the radio. The ESP32 build wraps the
/// WiFi driver; the host build simulates an always-up station.
pub trait StationInterface {
    fn begin_connect(&mut self, ssid: &str, password: &str) -> Result<(), StationError>;
    fn is_connected(&mut self) -> bool;
    fn start_access_point(&mut self, ssid: &str) -> Result<(), StationError>;
    fn wait(&mut self, duration_ms: u64);
}

/// Bounded station-connect polling, injected rather than hard-coded at the
/// call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_polls: u32,
    pub poll_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_polls: 20,
            poll_interval_ms: 500,
        }
    }
}

/// Sequences boot, station attempt, success and access-point fallback.
/// Connected and AccessPointFallback are terminal for the run; new
/// credentials or a reset restart the process and re-enter Booting.
#[derive(Debug)]
pub struct ConnectivityMachine {
    state: ConnectivityState,
    policy: RetryPolicy,
}

impl ConnectivityMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectivityState::Booting,
            policy,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Drives the boot sequence to a terminal state. The poll loop is an
    /// intentional bounded blocking wait; the device is not serving anything
    /// else yet.
    pub fn establish(
        &mut self,
        config: &DeviceConfig,
        iface: &mut impl StationInterface,
    ) -> ConnectivityState {
        if !config.has_station_credentials() {
            return self.enter_fallback(iface);
        }

        self.state = ConnectivityState::AttemptingStation;
        if iface
            .begin_connect(&config.wifi.ssid, &config.wifi.password)
            .is_err()
        {
            return self.enter_fallback(iface);
        }

        for poll in 1..=self.policy.max_polls {
            if iface.is_connected() {
                self.state = ConnectivityState::Connected;
                return self.state;
            }
            if poll < self.policy.max_polls {
                iface.wait(self.policy.poll_interval_ms);
            }
        }

        self.enter_fallback(iface)
    }

    fn enter_fallback(&mut self, iface: &mut impl StationInterface) -> ConnectivityState {
        // An AP start failure leaves nothing else to try; the state still
        // reflects fallback so the surface stays configuration-only.
        let _ = iface.start_access_point(FALLBACK_AP_SSID);
        self.state = ConnectivityState::AccessPointFallback;
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WifiCredentials;

    #[derive(Default)]
    struct MockStation {
        connect_calls: Vec<(String, String)>,
        ap_ssids: Vec<String>,
        status_polls: u32,
        waits: Vec<u64>,
        connected_after_polls: Option<u32>,
        fail_begin_connect: bool,
    }

    impl StationInterface for MockStation {
        fn begin_connect(&mut self, ssid: &str, password: &str) -> Result<(), StationError> {
            self.connect_calls
                .push((ssid.to_string(), password.to_string()));
            if self.fail_begin_connect {
                return Err(StationError("radio unavailable".to_string()));
            }
            Ok(())
        }

        fn is_connected(&mut self) -> bool {
            self.status_polls += 1;
            match self.connected_after_polls {
                Some(threshold) => self.status_polls >= threshold,
                None => false,
            }
        }

        fn start_access_point(&mut self, ssid: &str) -> Result<(), StationError> {
            self.ap_ssids.push(ssid.to_string());
            Ok(())
        }

        fn wait(&mut self, duration_ms: u64) {
            self.waits.push(duration_ms);
        }
    }

    fn config_with_ssid(ssid: &str) -> DeviceConfig {
        DeviceConfig {
            wifi: WifiCredentials {
                ssid: ssid.to_string(),
                password: "secret".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn no_credentials_goes_straight_to_fallback() {
        let mut machine = ConnectivityMachine::new(RetryPolicy::default());
        let mut station = MockStation::default();

        let state = machine.establish(&DeviceConfig::default(), &mut station);

        assert_eq!(state, ConnectivityState::AccessPointFallback);
        assert!(station.connect_calls.is_empty());
        assert_eq!(station.status_polls, 0);
        assert_eq!(station.ap_ssids, vec![FALLBACK_AP_SSID.to_string()]);
    }

    #[test]
    fn connects_once_the_station_comes_up() {
        let mut machine = ConnectivityMachine::new(RetryPolicy::default());
        let mut station = MockStation {
            connected_after_polls: Some(3),
            ..Default::default()
        };

        let state = machine.establish(&config_with_ssid("maison"), &mut station);

        assert_eq!(state, ConnectivityState::Connected);
        assert_eq!(station.status_polls, 3);
        assert_eq!(station.waits, vec![500, 500]);
        assert!(station.ap_ssids.is_empty());
    }

    #[test]
    fn falls_back_only_after_exhausting_all_polls() {
        let policy = RetryPolicy {
            max_polls: 20,
            poll_interval_ms: 500,
        };
        let mut machine = ConnectivityMachine::new(policy);
        let mut station = MockStation::default();

        let state = machine.establish(&config_with_ssid("maison"), &mut station);

        assert_eq!(state, ConnectivityState::AccessPointFallback);
        assert_eq!(station.status_polls, 20);
        assert_eq!(station.waits.len(), 19);
        assert_eq!(station.ap_ssids.len(), 1);
    }

    #[test]
    fn begin_connect_failure_falls_back() {
        let mut machine = ConnectivityMachine::new(RetryPolicy::default());
        let mut station = MockStation {
            fail_begin_connect: true,
            ..Default::default()
        };

        let state = machine.establish(&config_with_ssid("maison"), &mut station);

        assert_eq!(state, ConnectivityState::AccessPointFallback);
        assert_eq!(station.status_polls, 0);
    }

    #[test]
    fn credentials_are_passed_through_verbatim() {
        let mut machine = ConnectivityMachine::new(RetryPolicy::default());
        let mut station = MockStation {
            connected_after_polls: Some(1),
            ..Default::default()
        };

        machine.establish(&config_with_ssid("maison"), &mut station);

        assert_eq!(
            station.connect_calls,
            vec![("maison".to_string(), "secret".to_string())]
        );
    }
}
