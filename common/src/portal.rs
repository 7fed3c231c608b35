//! Helpers for the captive credential portal: request classification, form decoding and
//! scan result shaping. Transport lives in the controller backends.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Serialize;

use crate::provisioning::{NetworkInfo, SubmittedCredentials};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    pub ssid: String,
    pub quality: u8,
    pub locked: bool,
}

/// Sent with portal pages and redirects so connectivity checks always reach the portal.
pub const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "-1"),
];

/// Signal quality percentage: 0 at -100 dBm or weaker, 100 at -50 dBm or stronger.
pub fn rssi_to_quality(rssi: i32) -> u8 {
    if rssi <= -100 {
        0
    } else if rssi >= -50 {
        100
    } else {
        (2 * (rssi + 100)) as u8
    }
}

/// Strongest entry per SSID, best signal first. Hidden networks are dropped.
pub fn scan_entries(networks: &[NetworkInfo]) -> Vec<ScanEntry> {
    let mut entries: Vec<ScanEntry> = Vec::with_capacity(networks.len());

    for network in networks.iter().filter(|n| !n.ssid.is_empty()) {
        let quality = rssi_to_quality(network.rssi);
        match entries.iter_mut().find(|e| e.ssid == network.ssid) {
            Some(existing) if existing.quality >= quality => {}
            Some(existing) => {
                existing.quality = quality;
                existing.locked = network.secured;
            }
            None => entries.push(ScanEntry {
                ssid: network.ssid.clone(),
                quality,
                locked: network.secured,
            }),
        }
    }

    entries.sort_by(|a, b| b.quality.cmp(&a.quality));
    entries
}

/// True when `host` (optionally with a port) is a literal IP address.
pub fn is_ip_literal(host: &str) -> bool {
    let host = host.trim();
    if host.parse::<IpAddr>().is_ok() || host.parse::<SocketAddr>().is_ok() {
        return true;
    }

    host.rsplit_once(':')
        .filter(|(_, port)| port.parse::<u16>().is_ok())
        .is_some_and(|(addr, _)| addr.parse::<Ipv4Addr>().is_ok())
}

/// Redirect target for a request in captive mode, or `None` when it should be served.
pub fn captive_redirect(host: Option<&str>, ap_address: Ipv4Addr) -> Option<String> {
    match host {
        Some(host) if is_ip_literal(host) => None,
        _ => Some(format!("http://{ap_address}")),
    }
}

pub fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let escaped = (bytes[i] == b'%')
            .then(|| bytes.get(i + 1..i + 3))
            .flatten()
            .and_then(|pair| hex_pair(pair[0], pair[1]));

        match (escaped, bytes[i]) {
            (Some(byte), _) => {
                decoded.push(byte);
                i += 3;
                continue;
            }
            (None, b'+') => decoded.push(b' '),
            (None, other) => decoded.push(other),
        }
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let high = (high as char).to_digit(16)?;
    let low = (low as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

/// First value of `key` in a `a=1&b=2` query or form body, URL-decoded.
pub fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(name, _)| url_decode(name) == key)
        .map(|(_, value)| url_decode(value))
}

pub fn parse_credentials_form(body: &str) -> SubmittedCredentials {
    SubmittedCredentials {
        host: query_param(body, "host").unwrap_or_default(),
        ssid: query_param(body, "ssid").unwrap_or_default(),
        password: query_param(body, "pass").unwrap_or_default(),
    }
}
