use crate::config::{DEFAULT_DISPLAY_NAME, DEFAULT_UPDATE_ADDRESS};

/// Longest display name that still fits the persisted NUL-terminated buffer.
pub const MAX_DISPLAY_NAME_LEN: usize = 49;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    display_name: String,
    safe_name: String,
    hostname: String,
    update_address: String,
}

impl DeviceIdentity {
    pub fn new(chip_id: u32) -> Self {
        Self {
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            safe_name: safe_name_for(DEFAULT_DISPLAY_NAME),
            hostname: format!("sprinkler-{chip_id:x}"),
            update_address: DEFAULT_UPDATE_ADDRESS.to_string(),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn safe_name(&self) -> &str {
        &self.safe_name
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn update_address(&self) -> &str {
        &self.update_address
    }

    /// Returns whether the name changed. Blank names are ignored.
    pub fn set_display_name(&mut self, name: &str) -> bool {
        let name = truncate_to_boundary(name.trim(), MAX_DISPLAY_NAME_LEN);
        if name.is_empty() || name == self.display_name {
            return false;
        }

        self.display_name = name.to_string();
        self.safe_name = safe_name_for(name);
        true
    }

    pub fn set_update_address(&mut self, address: &str) -> &str {
        let address = address.trim();
        self.update_address = if address.is_empty() {
            DEFAULT_UPDATE_ADDRESS.to_string()
        } else if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        &self.update_address
    }
}

pub fn safe_name_for(display_name: &str) -> String {
    display_name.replace(' ', "_").to_lowercase()
}

pub(crate) fn truncate_to_boundary(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }

    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
