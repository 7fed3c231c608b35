//! Network provisioning: station connect with stored credentials, falling back to an access
//! point with a captive portal until new credentials connect or the portal times out.

use std::{io, net::Ipv4Addr};

use log::{info, warn};
use serde::Serialize;

use crate::{
    config::ControllerConfig,
    error::{ProvisioningError, WifiError},
    portal::{self, ScanEntry},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationCredentials {
    pub ssid: String,
    pub password: String,
}

impl StationCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ssid.is_empty()
    }
}

/// Fields posted to the portal form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmittedCredentials {
    pub host: String,
    pub ssid: String,
    pub password: String,
}

impl SubmittedCredentials {
    pub fn station(&self) -> StationCredentials {
        StationCredentials::new(self.ssid.clone(), self.password.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ssid: String,
    pub rssi: i32,
    pub secured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub password: Option<String>,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProvisioningMode {
    Idle,
    ApFallback,
    ConnectingStation,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningStep {
    Waiting,
    /// New credentials connected; persist them and restart.
    Provisioned(SubmittedCredentials),
    TimedOut(LinkStatus),
}

pub trait WifiDriver {
    /// One blocking connection attempt.
    fn connect_station(
        &mut self,
        hostname: &str,
        credentials: &StationCredentials,
    ) -> Result<(), WifiError>;
    fn start_access_point(&mut self, settings: &AccessPointSettings) -> Result<Ipv4Addr, WifiError>;
    fn stop_access_point(&mut self);
    fn is_connected(&self) -> bool;
    /// Drops the station link, if any.
    fn disconnect(&mut self);
    fn scan(&mut self) -> Result<Vec<NetworkInfo>, WifiError>;
}

/// Answers every DNS query with the access point address.
pub trait DnsResponder {
    fn start(&mut self, address: Ipv4Addr) -> io::Result<()>;
    fn poll(&mut self);
    fn stop(&mut self);
}

#[derive(Debug)]
struct PortalSession {
    started_ms: u64,
    address: Ipv4Addr,
    pending: Option<SubmittedCredentials>,
}

pub struct Provisioner<W, D> {
    wifi: W,
    dns: D,
    hostname: String,
    ap_password: Option<String>,
    ap_address: Ipv4Addr,
    timeout_ms: u64,
    mode: ProvisioningMode,
    session: Option<PortalSession>,
}

impl<W: WifiDriver, D: DnsResponder> Provisioner<W, D> {
    pub fn new(wifi: W, dns: D, hostname: impl Into<String>, config: &ControllerConfig) -> Self {
        let ap_password = match config.ap_password.as_deref() {
            Some(password) if (8..=63).contains(&password.len()) => {
                Some(password.to_string())
            }
            Some(_) => {
                warn!("access point password must be 8-63 bytes; starting an open network");
                None
            }
            None => None,
        };

        Self {
            wifi,
            dns,
            hostname: hostname.into(),
            ap_password,
            ap_address: config.ap_ipv4(),
            timeout_ms: config.portal_timeout_ms,
            mode: ProvisioningMode::Idle,
            session: None,
        }
    }

    pub fn mode(&self) -> ProvisioningMode {
        self.mode
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Address of the running access point, if any.
    pub fn ap_address(&self) -> Option<Ipv4Addr> {
        self.session.as_ref().map(|session| session.address)
    }

    pub fn wifi(&self) -> &W {
        &self.wifi
    }

    pub fn into_parts(self) -> (W, D) {
        (self.wifi, self.dns)
    }

    pub fn connect_stored(&mut self, credentials: &StationCredentials) -> LinkStatus {
        if credentials.is_empty() {
            info!("no stored network credentials");
            self.mode = ProvisioningMode::Failed;
            return LinkStatus::Failed;
        }

        self.mode = ProvisioningMode::ConnectingStation;
        let hostname = self.hostname.clone();
        self.attempt(&hostname, credentials)
    }

    pub fn start_fallback(&mut self, now_ms: u64) -> Result<Ipv4Addr, ProvisioningError> {
        let settings = AccessPointSettings {
            ssid: self.hostname.clone(),
            password: self.ap_password.clone(),
            address: self.ap_address,
        };

        let address = self
            .wifi
            .start_access_point(&settings)
            .map_err(ProvisioningError::AccessPoint)?;

        if let Err(err) = self.dns.start(address) {
            self.wifi.stop_access_point();
            return Err(ProvisioningError::Dns(err));
        }

        info!(
            "access point `{}` up at {address} ({})",
            settings.ssid,
            if settings.password.is_some() {
                "secured"
            } else {
                "open"
            }
        );
        self.mode = ProvisioningMode::ApFallback;
        self.session = Some(PortalSession {
            started_ms: now_ms,
            address,
            pending: None,
        });
        Ok(address)
    }

    /// Queues credentials for the next poll. Ignored outside the portal.
    pub fn submit_credentials(&mut self, credentials: SubmittedCredentials) -> bool {
        match self.session.as_mut() {
            Some(session) if self.mode == ProvisioningMode::ApFallback => {
                info!("credentials received for `{}`", credentials.ssid);
                session.pending = Some(credentials);
                true
            }
            _ => false,
        }
    }

    pub fn poll(&mut self, now_ms: u64) -> ProvisioningStep {
        let Some(session) = self.session.as_mut() else {
            return ProvisioningStep::Waiting;
        };
        self.dns.poll();

        if let Some(submitted) = session.pending.take() {
            let hostname = if submitted.host.trim().is_empty() {
                self.hostname.clone()
            } else {
                submitted.host.trim().to_string()
            };

            self.mode = ProvisioningMode::ConnectingStation;
            match self.attempt(&hostname, &submitted.station()) {
                LinkStatus::Connected => {
                    self.teardown();
                    return ProvisioningStep::Provisioned(submitted);
                }
                LinkStatus::Failed => self.mode = ProvisioningMode::ApFallback,
            }
        }

        let started_ms = self.session.as_ref().map_or(now_ms, |s| s.started_ms);
        if self.timeout_ms > 0 && now_ms.saturating_sub(started_ms) >= self.timeout_ms {
            warn!("provisioning portal timed out");
            self.teardown();
            let status = if self.wifi.is_connected() {
                ProvisioningMode::Connected
            } else {
                ProvisioningMode::Failed
            };
            self.mode = status;
            return ProvisioningStep::TimedOut(match status {
                ProvisioningMode::Connected => LinkStatus::Connected,
                _ => LinkStatus::Failed,
            });
        }

        ProvisioningStep::Waiting
    }

    /// Redirect target for a portal request whose `Host` is not a literal IP.
    pub fn captive_redirect(&self, host: Option<&str>) -> Option<String> {
        let session = self.session.as_ref()?;
        portal::captive_redirect(host, session.address)
    }

    pub fn disconnect_station(&mut self) {
        self.wifi.disconnect();
        if self.mode == ProvisioningMode::Connected {
            self.mode = ProvisioningMode::Idle;
        }
        info!("station disconnected");
    }

    pub fn scan(&mut self) -> Result<Vec<ScanEntry>, WifiError> {
        let networks = self.wifi.scan()?;
        Ok(portal::scan_entries(&networks))
    }

    fn attempt(&mut self, hostname: &str, credentials: &StationCredentials) -> LinkStatus {
        info!("connecting to `{}` as {hostname}", credentials.ssid);
        match self.wifi.connect_station(hostname, credentials) {
            Ok(()) => {
                info!("connected to `{}`", credentials.ssid);
                self.mode = ProvisioningMode::Connected;
                LinkStatus::Connected
            }
            Err(err) => {
                warn!("{err}");
                self.mode = ProvisioningMode::Failed;
                LinkStatus::Failed
            }
        }
    }

    fn teardown(&mut self) {
        if self.session.take().is_some() {
            self.dns.stop();
            self.wifi.stop_access_point();
            info!("access point and captive DNS stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sim::{SimulatedDns, SimulatedWifi};

    fn provisioner(
        wifi: SimulatedWifi,
        config: &ControllerConfig,
    ) -> Provisioner<SimulatedWifi, SimulatedDns> {
        Provisioner::new(wifi, SimulatedDns::default(), "sprinkler-ab12", config)
    }

    fn home_network() -> SimulatedWifi {
        SimulatedWifi::new().with_network("Home", "longenough1", -55)
    }

    #[test]
    fn empty_ssid_fails_without_attempt() {
        let mut prov = provisioner(home_network(), &ControllerConfig::default());

        assert_eq!(
            prov.connect_stored(&StationCredentials::default()),
            LinkStatus::Failed
        );
        assert!(prov.wifi().attempts().is_empty());
        assert_eq!(prov.mode(), ProvisioningMode::Failed);
    }

    #[test]
    fn stored_credentials_connect() {
        let mut prov = provisioner(home_network(), &ControllerConfig::default());

        assert_eq!(
            prov.connect_stored(&StationCredentials::new("Home", "longenough1")),
            LinkStatus::Connected
        );
        assert_eq!(prov.mode(), ProvisioningMode::Connected);
        assert_eq!(
            prov.wifi().attempts(),
            &[("sprinkler-ab12".to_string(), "Home".to_string())]
        );
    }

    #[test]
    fn disconnect_drops_station_link() {
        let mut prov = provisioner(home_network(), &ControllerConfig::default());
        prov.connect_stored(&StationCredentials::new("Home", "longenough1"));
        assert!(prov.wifi().is_connected());

        prov.disconnect_station();
        assert!(!prov.wifi().is_connected());
        assert_eq!(prov.mode(), ProvisioningMode::Idle);
    }

    #[test]
    fn short_ap_password_is_dropped() {
        let config = ControllerConfig {
            ap_password: Some("short".to_string()),
            ..ControllerConfig::default()
        };
        let mut prov = provisioner(home_network(), &config);
        prov.start_fallback(0).unwrap();

        let ap = prov.wifi().access_point().unwrap();
        assert_eq!(ap.ssid, "sprinkler-ab12");
        assert_eq!(ap.password, None);
    }

    #[test]
    fn ap_password_length_counts_bytes() {
        let config = ControllerConfig {
            ap_password: Some("é".repeat(33)),
            ..ControllerConfig::default()
        };
        let mut prov = provisioner(home_network(), &config);
        prov.start_fallback(0).unwrap();

        assert_eq!(prov.wifi().access_point().unwrap().password, None);
    }

    #[test]
    fn valid_ap_password_is_kept() {
        let config = ControllerConfig {
            ap_password: Some("sprinkler".to_string()),
            ..ControllerConfig::default()
        };
        let mut prov = provisioner(home_network(), &config);
        prov.start_fallback(0).unwrap();

        assert_eq!(
            prov.wifi().access_point().unwrap().password.as_deref(),
            Some("sprinkler")
        );
    }

    #[test]
    fn failed_submission_stays_in_portal() {
        let mut prov = provisioner(home_network(), &ControllerConfig::default());
        prov.start_fallback(0).unwrap();

        assert!(prov.submit_credentials(SubmittedCredentials {
            host: String::new(),
            ssid: "Home".to_string(),
            password: "wrong-password".to_string(),
        }));
        assert_eq!(prov.poll(100), ProvisioningStep::Waiting);
        assert_eq!(prov.mode(), ProvisioningMode::ApFallback);
        assert!(prov.wifi().access_point().is_some());

        // The pending flag was cleared; the next poll makes no new attempt.
        prov.poll(200);
        assert_eq!(prov.wifi().attempts().len(), 1);
    }

    #[test]
    fn successful_submission_tears_down_portal() {
        let mut prov = provisioner(home_network(), &ControllerConfig::default());
        prov.start_fallback(0).unwrap();
        let submitted = SubmittedCredentials {
            host: "garden".to_string(),
            ssid: "Home".to_string(),
            password: "longenough1".to_string(),
        };
        prov.submit_credentials(submitted.clone());

        assert_eq!(prov.poll(10), ProvisioningStep::Provisioned(submitted));
        assert_eq!(prov.mode(), ProvisioningMode::Connected);
        assert!(prov.wifi().access_point().is_none());
        assert_eq!(prov.ap_address(), None);
        assert_eq!(
            prov.wifi().attempts(),
            &[("garden".to_string(), "Home".to_string())]
        );

        let (_, dns) = prov.into_parts();
        assert!(!dns.is_running());
        assert!(dns.polls() > 0);
    }

    #[test]
    fn portal_times_out() {
        let config = ControllerConfig {
            portal_timeout_ms: 1_000,
            ..ControllerConfig::default()
        };
        let mut prov = provisioner(home_network(), &config);
        prov.start_fallback(5_000).unwrap();

        assert_eq!(prov.poll(5_999), ProvisioningStep::Waiting);
        assert_eq!(
            prov.poll(6_000),
            ProvisioningStep::TimedOut(LinkStatus::Failed)
        );
        assert_eq!(prov.mode(), ProvisioningMode::Failed);
        assert_eq!(prov.poll(7_000), ProvisioningStep::Waiting);
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let mut prov = provisioner(home_network(), &ControllerConfig::default());
        prov.start_fallback(0).unwrap();

        assert_eq!(prov.poll(u64::MAX / 2), ProvisioningStep::Waiting);
    }

    #[test]
    fn captive_redirect_only_in_portal() {
        let mut prov = provisioner(home_network(), &ControllerConfig::default());
        assert_eq!(prov.captive_redirect(Some("example.com")), None);

        prov.start_fallback(0).unwrap();
        assert_eq!(prov.captive_redirect(Some("192.168.4.1")), None);
        assert_eq!(
            prov.captive_redirect(Some("example.com")),
            Some("http://192.168.4.1".to_string())
        );
    }

    #[test]
    fn submissions_ignored_outside_portal() {
        let mut prov = provisioner(home_network(), &ControllerConfig::default());
        assert!(!prov.submit_credentials(SubmittedCredentials::default()));
    }

    #[test]
    fn access_point_failure_is_reported() {
        let mut prov = provisioner(
            home_network().failing_access_point(),
            &ControllerConfig::default(),
        );

        let err = prov.start_fallback(0).unwrap_err();
        assert!(matches!(err, ProvisioningError::AccessPoint(_)));
        assert_eq!(prov.mode(), ProvisioningMode::Idle);
    }
}
