use serde::{Deserialize, Serialize};

use crate::{
    device::DeviceIdentity,
    error::RuleError,
    provisioning::ProvisioningMode,
    schedule::{DayRule, RuleUpdate, ScheduleSlot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize)]
pub struct SprinklerStatus {
    pub state: RunPhase,
    #[serde(rename = "valveOn")]
    pub valve_on: bool,
    #[serde(rename = "remainingMs")]
    pub remaining_ms: u64,
    #[serde(rename = "remainingMin")]
    pub remaining_min: u64,
    #[serde(rename = "durationMs")]
    pub duration_ms: u32,
    pub cycles: u32,
    #[serde(rename = "nextRunEpoch")]
    pub next_run_epoch: Option<i64>,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsView {
    pub disp_name: String,
    pub safe_name: String,
    pub host_name: String,
    pub upds_addr: String,
}

impl SettingsView {
    pub fn from_identity(identity: &DeviceIdentity) -> Self {
        Self {
            disp_name: identity.display_name().to_string(),
            safe_name: identity.safe_name().to_string(),
            host_name: identity.hostname().to_string(),
            upds_addr: identity.update_address().to_string(),
        }
    }
}

/// Body of `POST /api/settings`; absent keys are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SettingsUpdate {
    pub disp_name: Option<String>,
    pub upds_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct StartQuery {
    /// Run length in minutes.
    pub t: Option<u32>,
    /// Cycle count reported for the run.
    pub z: Option<u32>,
}

impl StartQuery {
    pub fn duration_ms(&self) -> Option<u32> {
        self.t.map(|minutes| minutes.saturating_mul(60_000))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RuleQuery {
    pub h: Option<i64>,
    pub m: Option<i64>,
    pub d: Option<i64>,
    pub enabled: Option<i64>,
}

impl RuleQuery {
    pub fn to_update(self) -> Result<RuleUpdate, RuleError> {
        RuleUpdate::from_api(self.h, self.m, self.d, self.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleView {
    pub day: ScheduleSlot,
    pub enabled: bool,
    pub hour: u8,
    pub minute: u8,
    #[serde(rename = "durationMs")]
    pub duration_ms: u32,
    #[serde(rename = "durationMin")]
    pub duration_min: u32,
}

impl RuleView {
    pub fn new(day: ScheduleSlot, rule: DayRule) -> Self {
        Self {
            day,
            enabled: rule.enabled,
            hour: rule.hour,
            minute: rule.minute,
            duration_ms: rule.duration_ms,
            duration_min: rule.duration_ms / 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortalInfo {
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "dispName")]
    pub disp_name: String,
    #[serde(rename = "apAddress")]
    pub ap_address: Option<String>,
    pub mode: ProvisioningMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeView {
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    pub epoch: Option<i64>,
    pub local: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_serializes_camel_case() {
        let status = SprinklerStatus {
            state: RunPhase::Paused,
            valve_on: false,
            remaining_ms: 90_000,
            remaining_min: 1,
            duration_ms: 600_000,
            cycles: 2,
            next_run_epoch: None,
            time_synced: true,
            timezone: "UTC".to_string(),
        };

        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["state"], "paused");
        assert_eq!(value["valveOn"], false);
        assert_eq!(value["remainingMs"], 90_000);
        assert_eq!(value["nextRunEpoch"], serde_json::Value::Null);
    }

    #[test]
    fn settings_update_accepts_partial_body() {
        let update: SettingsUpdate =
            serde_json::from_value(json!({ "upds_addr": "ota.local/fw.bin" })).unwrap();

        assert_eq!(update.disp_name, None);
        assert_eq!(update.upds_addr.as_deref(), Some("ota.local/fw.bin"));
    }

    #[test]
    fn start_query_converts_minutes() {
        let query = StartQuery {
            t: Some(10),
            z: None,
        };
        assert_eq!(query.duration_ms(), Some(600_000));
        assert_eq!(StartQuery::default().duration_ms(), None);
    }

    #[test]
    fn rule_view_reports_minutes() {
        let view = RuleView::new(
            ScheduleSlot::Tue,
            DayRule {
                enabled: true,
                hour: 5,
                minute: 45,
                duration_ms: 20 * 60_000,
            },
        );

        let value = serde_json::to_value(view).unwrap();
        assert_eq!(value["day"], "tue");
        assert_eq!(value["durationMin"], 20);
    }
}
