pub mod actuator;
pub mod app;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod portal;
pub mod provisioning;
pub mod routes;
pub mod schedule;
pub mod sim;
pub mod store;
pub mod types;

pub use actuator::{Actuator, OutputLevels, ValveState};
pub use app::SprinklerApp;
pub use config::ControllerConfig;
pub use device::DeviceIdentity;
pub use engine::{RunState, ScheduleEngine};
pub use error::{ProvisioningError, RuleError, StorageError, StoreError, WifiError};
pub use provisioning::{
    DnsResponder, LinkStatus, Provisioner, ProvisioningMode, ProvisioningStep, StationCredentials,
    SubmittedCredentials, WifiDriver,
};
pub use routes::*;
pub use schedule::{DayRule, RuleUpdate, ScheduleSlot, WeeklySchedule};
pub use store::{ConfigStore, MemoryStorage, NvStorage, PersistedRecord};
pub use types::{RuleView, RunPhase, SettingsUpdate, SettingsView, SprinklerStatus, StartQuery};
