pub const ROUTE_ROOT: &str = "/";
pub const ROUTE_PORTAL_INFO: &str = "/info";
pub const ROUTE_PORTAL_SCAN: &str = "/scan";
pub const ROUTE_GENERATE_204: &str = "/generate_204";
pub const ROUTE_FWLINK: &str = "/fwlink";

pub const ROUTE_SETTINGS: &str = "/api/settings";
pub const ROUTE_STATE: &str = "/api/state";
pub const ROUTE_TIME: &str = "/api/time";
pub const ROUTE_START: &str = "/api/start";
pub const ROUTE_ON: &str = "/api/on";
pub const ROUTE_STOP: &str = "/api/stop";
pub const ROUTE_OFF: &str = "/api/off";
pub const ROUTE_PAUSE: &str = "/api/pause";
pub const ROUTE_RESUME: &str = "/api/resume";
pub const ROUTE_SCHEDULE: &str = "/api/schedule";
pub const ROUTE_RESET: &str = "/reset";
pub const ROUTE_RESTART: &str = "/restart";
