use chrono::{DateTime, FixedOffset};
use log::{info, warn};

use crate::{
    actuator::{Actuator, ValveState},
    device::DeviceIdentity,
    engine::ScheduleEngine,
    error::StoreError,
    provisioning::StationCredentials,
    schedule::{DayRule, RuleUpdate, ScheduleSlot, WeeklySchedule},
    store::{ConfigStore, NvStorage, PersistedRecord, CURRENT_VERSION},
    types::{RuleView, SettingsUpdate, SettingsView, SprinklerStatus, StartQuery},
};

/// Application context shared by the control loop and the HTTP handlers.
pub struct SprinklerApp<S, A> {
    store: ConfigStore<S>,
    chip_id: u32,
    identity: DeviceIdentity,
    engine: ScheduleEngine,
    credentials: StationCredentials,
    actuator: A,
    applied: Option<ValveState>,
}

impl<S: NvStorage, A: Actuator> SprinklerApp<S, A> {
    /// Loads the persisted record and forces the valve closed.
    pub fn boot(storage: S, actuator: A, chip_id: u32) -> Self {
        let store = ConfigStore::new(storage);
        let record = store.load();

        let mut identity = DeviceIdentity::new(chip_id);
        identity.set_display_name(&record.display_name);
        identity.set_update_address(&record.update_address);

        info!(
            "booted `{}` as {} (record v{})",
            identity.display_name(),
            identity.hostname(),
            record.version
        );

        let mut app = Self {
            store,
            chip_id,
            identity,
            engine: ScheduleEngine::new(WeeklySchedule::from_rules(record.rules)),
            credentials: record.credentials,
            actuator,
            applied: None,
        };
        app.apply(ValveState::Off);
        app
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn engine(&self) -> &ScheduleEngine {
        &self.engine
    }

    pub fn credentials(&self) -> &StationCredentials {
        &self.credentials
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn storage(&self) -> &S {
        self.store.storage()
    }

    pub fn into_parts(self) -> (S, A) {
        (self.store.into_storage(), self.actuator)
    }

    pub fn record(&self) -> PersistedRecord {
        PersistedRecord {
            version: CURRENT_VERSION,
            display_name: self.identity.display_name().to_string(),
            update_address: self.identity.update_address().to_string(),
            rules: *self.engine.schedule().rules(),
            credentials: self.credentials.clone(),
        }
    }

    pub fn tick(&mut self, now_ms: u64, wall_clock: Option<DateTime<FixedOffset>>) -> ValveState {
        let desired = self.engine.evaluate(now_ms, wall_clock);
        self.apply(desired)
    }

    pub fn start(&mut self, now_ms: u64, query: StartQuery) -> ValveState {
        let desired = self.engine.start(now_ms, query.duration_ms(), query.z);
        self.apply(desired)
    }

    pub fn stop(&mut self) -> ValveState {
        let desired = self.engine.stop();
        self.apply(desired)
    }

    pub fn pause(&mut self, now_ms: u64) -> ValveState {
        let desired = self.engine.pause(now_ms);
        self.apply(desired)
    }

    pub fn resume(&mut self, now_ms: u64) -> ValveState {
        let desired = self.engine.resume(now_ms);
        self.apply(desired)
    }

    /// Applies a rule change and persists it. The rule stays applied in memory even
    /// when persisting fails.
    pub fn update_rule(
        &mut self,
        slot: ScheduleSlot,
        update: RuleUpdate,
    ) -> Result<DayRule, StoreError> {
        let rule = self.engine.set_rule(slot, update);
        if update != RuleUpdate::default() {
            self.persist()?;
        }
        Ok(rule)
    }

    pub fn rule_view(&self, slot: ScheduleSlot) -> RuleView {
        RuleView::new(slot, self.engine.schedule().rule(slot))
    }

    pub fn settings(&self) -> SettingsView {
        SettingsView::from_identity(&self.identity)
    }

    /// Returns whether a restart is required: display name changes take effect after reboot.
    pub fn update_settings(&mut self, update: &SettingsUpdate) -> Result<bool, StoreError> {
        let mut restart_required = false;
        let mut changed = false;

        if let Some(name) = update.disp_name.as_deref() {
            if self.identity.set_display_name(name) {
                info!("display name set to `{}`", self.identity.display_name());
                restart_required = true;
                changed = true;
            }
        }

        if let Some(address) = update.upds_addr.as_deref() {
            let previous = self.identity.update_address().to_string();
            if self.identity.set_update_address(address) != previous {
                info!("update address set to {}", self.identity.update_address());
                changed = true;
            }
        }

        if changed {
            self.persist()?;
        }
        Ok(restart_required)
    }

    pub fn on_provisioned(&mut self, credentials: StationCredentials) -> Result<(), StoreError> {
        info!("storing credentials for `{}`", credentials.ssid);
        self.credentials = credentials;
        self.persist()
    }

    /// Wipes the record and every runtime setting; the valve is closed first.
    pub fn factory_reset(&mut self) -> Result<(), StoreError> {
        warn!("factory reset requested");
        self.engine.reset();
        self.apply(ValveState::Off);
        self.identity = DeviceIdentity::new(self.chip_id);
        self.credentials = StationCredentials::default();
        self.store.erase()
    }

    pub fn status(
        &self,
        now_ms: u64,
        wall_clock: Option<DateTime<FixedOffset>>,
        timezone: &str,
    ) -> SprinklerStatus {
        self.engine.status(now_ms, wall_clock, timezone)
    }

    fn persist(&mut self) -> Result<(), StoreError> {
        let record = self.record();
        self.store.save(&record).inspect_err(|err| warn!("{err}"))
    }

    fn apply(&mut self, desired: ValveState) -> ValveState {
        if self.applied != Some(desired) {
            self.actuator.apply(desired);
            self.applied = Some(desired);
        }
        desired
    }
}
