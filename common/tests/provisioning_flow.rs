use pretty_assertions::assert_eq;
use sprinkler_common::{
    config::STORAGE_SIZE,
    portal::parse_credentials_form,
    sim::{SimulatedDns, SimulatedValve, SimulatedWifi},
    ConfigStore, ControllerConfig, LinkStatus, MemoryStorage, Provisioner, ProvisioningMode,
    ProvisioningStep, SprinklerApp, StationCredentials,
};

const CHIP_ID: u32 = 0x00c0_ffee;

fn radio() -> SimulatedWifi {
    SimulatedWifi::new()
        .with_network("Home", "longenough1", -58)
        .with_network("Neighbour", "", -81)
}

#[test]
fn blank_device_is_provisioned_through_portal() {
    let mut app = SprinklerApp::boot(
        MemoryStorage::new(STORAGE_SIZE),
        SimulatedValve::default(),
        CHIP_ID,
    );
    assert_eq!(app.record().credentials, StationCredentials::default());

    let mut provisioner = Provisioner::new(
        radio(),
        SimulatedDns::default(),
        app.identity().hostname(),
        &ControllerConfig::default(),
    );

    assert_eq!(provisioner.connect_stored(app.credentials()), LinkStatus::Failed);
    provisioner.start_fallback(0).unwrap();
    assert_eq!(provisioner.mode(), ProvisioningMode::ApFallback);
    assert_eq!(
        provisioner.wifi().access_point().map(|ap| ap.ssid.as_str()),
        Some("sprinkler-c0ffee")
    );

    // Idle polls only service DNS.
    assert_eq!(provisioner.poll(500), ProvisioningStep::Waiting);

    assert!(provisioner.submit_credentials(parse_credentials_form("ssid=Home&pass=longenough1")));
    let ProvisioningStep::Provisioned(submitted) = provisioner.poll(1_000) else {
        panic!("expected the submitted credentials to connect");
    };
    assert_eq!(provisioner.mode(), ProvisioningMode::Connected);
    assert!(provisioner.wifi().access_point().is_none());
    assert_eq!(
        provisioner.wifi().attempts().last(),
        Some(&("sprinkler-c0ffee".to_string(), "Home".to_string()))
    );

    app.on_provisioned(submitted.station()).unwrap();

    let (storage, valve) = app.into_parts();
    let record = ConfigStore::new(storage.clone()).load();
    assert_eq!(record.version, 2);
    assert_eq!(record.credentials, StationCredentials::new("Home", "longenough1"));

    // After the restart the stored credentials connect directly.
    let app = SprinklerApp::boot(storage, valve, CHIP_ID);
    let mut provisioner = Provisioner::new(
        radio(),
        SimulatedDns::default(),
        app.identity().hostname(),
        &ControllerConfig::default(),
    );
    assert_eq!(provisioner.connect_stored(app.credentials()), LinkStatus::Connected);
    assert!(provisioner.wifi().access_point().is_none());
}

#[test]
fn wrong_password_keeps_portal_open_until_timeout() {
    let config = ControllerConfig {
        portal_timeout_ms: 180_000,
        ..ControllerConfig::default()
    };
    let mut provisioner = Provisioner::new(radio(), SimulatedDns::default(), "sprinkler-1", &config);
    provisioner.start_fallback(10_000).unwrap();

    provisioner.submit_credentials(parse_credentials_form("host=&ssid=Home&pass=nope"));
    assert_eq!(provisioner.poll(11_000), ProvisioningStep::Waiting);
    assert_eq!(provisioner.mode(), ProvisioningMode::ApFallback);
    assert_eq!(
        provisioner.captive_redirect(Some("captive.apple.com")),
        Some("http://192.168.4.1".to_string())
    );

    assert_eq!(
        provisioner.poll(190_000),
        ProvisioningStep::TimedOut(LinkStatus::Failed)
    );
    assert_eq!(provisioner.captive_redirect(Some("captive.apple.com")), None);

    let (wifi, dns) = provisioner.into_parts();
    assert!(wifi.access_point().is_none());
    assert!(!dns.is_running());
}

#[test]
fn portal_serves_ip_hosts_and_redirects_names() {
    let mut provisioner = Provisioner::new(
        radio(),
        SimulatedDns::default(),
        "sprinkler-1",
        &ControllerConfig::default(),
    );
    provisioner.start_fallback(0).unwrap();

    assert_eq!(provisioner.captive_redirect(Some("192.168.4.1")), None);
    assert_eq!(
        provisioner.captive_redirect(Some("example.com")),
        Some("http://192.168.4.1".to_string())
    );

    let scan = provisioner.scan().unwrap();
    assert_eq!(scan.len(), 2);
    assert_eq!(scan[0].ssid, "Home");
    assert!(scan[0].locked);
    assert!(!scan[1].locked);
}
