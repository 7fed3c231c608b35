//! Simulated radio, DNS and valve used by the host backend and by tests.

use std::{io, net::Ipv4Addr};

use log::info;

use crate::{
    actuator::{Actuator, ValveState},
    error::WifiError,
    provisioning::{AccessPointSettings, DnsResponder, NetworkInfo, StationCredentials, WifiDriver},
};

#[derive(Debug, Clone)]
struct KnownNetwork {
    ssid: String,
    password: String,
    rssi: i32,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedWifi {
    networks: Vec<KnownNetwork>,
    connected: Option<String>,
    access_point: Option<AccessPointSettings>,
    attempts: Vec<(String, String)>,
    fail_access_point: bool,
}

impl SimulatedWifi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reachable network. An empty password makes it open.
    pub fn with_network(mut self, ssid: &str, password: &str, rssi: i32) -> Self {
        self.networks.push(KnownNetwork {
            ssid: ssid.to_string(),
            password: password.to_string(),
            rssi,
        });
        self
    }

    pub fn failing_access_point(mut self) -> Self {
        self.fail_access_point = true;
        self
    }

    /// `(hostname, ssid)` of every station attempt so far.
    pub fn attempts(&self) -> &[(String, String)] {
        &self.attempts
    }

    pub fn access_point(&self) -> Option<&AccessPointSettings> {
        self.access_point.as_ref()
    }
}

impl WifiDriver for SimulatedWifi {
    fn connect_station(
        &mut self,
        hostname: &str,
        credentials: &StationCredentials,
    ) -> Result<(), WifiError> {
        self.attempts
            .push((hostname.to_string(), credentials.ssid.clone()));
        self.connected = None;

        let network = self
            .networks
            .iter()
            .find(|n| n.ssid == credentials.ssid)
            .ok_or_else(|| WifiError::ConnectFailed {
                ssid: credentials.ssid.clone(),
                reason: "network not found".to_string(),
            })?;

        if network.password != credentials.password {
            return Err(WifiError::ConnectFailed {
                ssid: credentials.ssid.clone(),
                reason: "authentication rejected".to_string(),
            });
        }

        self.connected = Some(network.ssid.clone());
        Ok(())
    }

    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<Ipv4Addr, WifiError> {
        if self.fail_access_point {
            return Err(WifiError::AccessPoint("radio unavailable".to_string()));
        }
        self.access_point = Some(settings.clone());
        Ok(settings.address)
    }

    fn stop_access_point(&mut self) {
        self.access_point = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    fn disconnect(&mut self) {
        self.connected = None;
    }

    fn scan(&mut self) -> Result<Vec<NetworkInfo>, WifiError> {
        Ok(self
            .networks
            .iter()
            .map(|n| NetworkInfo {
                ssid: n.ssid.clone(),
                rssi: n.rssi,
                secured: !n.password.is_empty(),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedDns {
    address: Option<Ipv4Addr>,
    polls: usize,
}

impl SimulatedDns {
    pub fn is_running(&self) -> bool {
        self.address.is_some()
    }

    pub fn polls(&self) -> usize {
        self.polls
    }
}

impl DnsResponder for SimulatedDns {
    fn start(&mut self, address: Ipv4Addr) -> io::Result<()> {
        self.address = Some(address);
        Ok(())
    }

    fn poll(&mut self) {
        if self.address.is_some() {
            self.polls += 1;
        }
    }

    fn stop(&mut self) {
        self.address = None;
    }
}

/// Valve that logs and records output transitions.
#[derive(Debug, Clone, Default)]
pub struct SimulatedValve {
    history: Vec<ValveState>,
}

impl SimulatedValve {
    pub fn state(&self) -> ValveState {
        self.history.last().copied().unwrap_or(ValveState::Off)
    }

    pub fn history(&self) -> &[ValveState] {
        &self.history
    }
}

impl Actuator for SimulatedValve {
    fn on(&mut self) {
        if self.state() != ValveState::On {
            info!("valve on");
            self.history.push(ValveState::On);
        }
    }

    fn off(&mut self) {
        if self.state() != ValveState::Off {
            info!("valve off");
            self.history.push(ValveState::Off);
        }
    }
}
