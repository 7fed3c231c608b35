use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DISPLAY_NAME: &str = "Sprinkler";
pub const DEFAULT_UPDATE_ADDRESS: &str = "http://ota.voights.net/sprinkler.bin";
pub const DEFAULT_MANUAL_DURATION_MS: u32 = 15 * 60_000;

/// Size of the emulated EEPROM region that holds the persisted record.
pub const STORAGE_SIZE: usize = 1024;
pub const RECORD_OFFSET: usize = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub tick_interval_ms: u64,
    /// Overall captive-portal budget; 0 keeps the access point up indefinitely.
    pub portal_timeout_ms: u64,
    pub ap_password: Option<String>,
    pub ap_address: [u8; 4],
    pub dns_port: u16,
    pub http_port: u16,
    pub timezone: String,
    pub led_pin: i32,
    pub relay_pin: i32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            portal_timeout_ms: 0,
            ap_password: None,
            ap_address: [192, 168, 4, 1],
            dns_port: 53,
            http_port: 80,
            timezone: "UTC".to_string(),
            led_pin: 13,
            relay_pin: 12,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(50, 1_000);

        if self.timezone.trim().is_empty() {
            self.timezone = "UTC".to_string();
        }

        if self.ap_password.as_deref().is_some_and(str::is_empty) {
            self.ap_password = None;
        }
    }

    pub fn ap_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ap_address)
    }
}
