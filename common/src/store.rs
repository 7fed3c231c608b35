use log::{info, warn};

use crate::{
    config::{DEFAULT_DISPLAY_NAME, DEFAULT_UPDATE_ADDRESS, RECORD_OFFSET},
    device::truncate_to_boundary,
    error::{StorageError, StoreError},
    provisioning::StationCredentials,
    schedule::DayRule,
};

/// Format version written by [`ConfigStore::save`].
pub const CURRENT_VERSION: u8 = 2;

const NAME_OFFSET: usize = 1;
const NAME_LEN: usize = 50;
const ADDRESS_OFFSET: usize = 51;
const ADDRESS_LEN: usize = 50;
const RULES_OFFSET: usize = 104;
const RULE_LEN: usize = 16;
const SSID_OFFSET: usize = 232;
const SSID_LEN: usize = 33;
const PASSWORD_OFFSET: usize = 265;
const PASSWORD_LEN: usize = 65;

pub const RECORD_LEN: usize = PASSWORD_OFFSET + PASSWORD_LEN;

/// Byte-addressed non-volatile region, EEPROM style: writes are staged until `commit`.
pub trait NvStorage {
    fn capacity(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
}

pub fn check_bounds(offset: usize, len: usize, capacity: usize) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(StorageError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

/// Volatile storage for tests and simulation.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    staged: Vec<u8>,
    committed: Vec<u8>,
    commits: usize,
    fail_commits: bool,
}

impl MemoryStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            staged: vec![0; capacity],
            committed: vec![0; capacity],
            commits: 0,
            fail_commits: false,
        }
    }

    pub fn committed(&self) -> &[u8] {
        &self.committed
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Makes every subsequent commit fail, simulating a worn or missing flash region.
    pub fn fail_commits(&mut self, fail: bool) {
        self.fail_commits = fail;
    }
}

impl NvStorage for MemoryStorage {
    fn capacity(&self) -> usize {
        self.staged.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(offset, buf.len(), self.capacity())?;
        buf.copy_from_slice(&self.committed[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(offset, data.len(), self.capacity())?;
        self.staged[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.fail_commits {
            self.staged.clone_from(&self.committed);
            return Err(StorageError::Commit("simulated flash failure".to_string()));
        }
        self.committed.clone_from(&self.staged);
        self.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub version: u8,
    pub display_name: String,
    pub update_address: String,
    pub rules: [DayRule; 8],
    pub credentials: StationCredentials,
}

impl Default for PersistedRecord {
    fn default() -> Self {
        Self {
            version: 0,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            update_address: DEFAULT_UPDATE_ADDRESS.to_string(),
            rules: [DayRule::default(); 8],
            credentials: StationCredentials::default(),
        }
    }
}

impl PersistedRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0] = CURRENT_VERSION;
        put_str(&mut buf, NAME_OFFSET, NAME_LEN, &self.display_name);
        put_str(&mut buf, ADDRESS_OFFSET, ADDRESS_LEN, &self.update_address);

        for (index, rule) in self.rules.iter().enumerate() {
            let base = RULES_OFFSET + index * RULE_LEN;
            buf[base] = u8::from(rule.enabled);
            put_u32(&mut buf, base + 4, rule.hour as u32);
            put_u32(&mut buf, base + 8, rule.minute as u32);
            put_u32(&mut buf, base + 12, rule.duration_ms);
        }

        put_str(&mut buf, SSID_OFFSET, SSID_LEN, &self.credentials.ssid);
        put_str(&mut buf, PASSWORD_OFFSET, PASSWORD_LEN, &self.credentials.password);
        buf
    }

    /// Decodes the fields guaranteed by the stored version; everything else comes from `defaults`.
    pub fn decode(buf: &[u8; RECORD_LEN], defaults: PersistedRecord) -> PersistedRecord {
        let version = buf[0];
        if version == 0 {
            return defaults;
        }
        if version > CURRENT_VERSION {
            warn!(
                "record format v{version} is newer than v{CURRENT_VERSION}; reading known fields only"
            );
        }

        let mut record = defaults;
        record.version = version;

        record.display_name = get_str(buf, NAME_OFFSET, NAME_LEN, "display name")
            .unwrap_or(record.display_name);
        record.update_address = get_str(buf, ADDRESS_OFFSET, ADDRESS_LEN, "update address")
            .unwrap_or(record.update_address);

        if version >= 2 {
            for (index, slot) in record.rules.iter_mut().enumerate() {
                *slot = decode_rule(buf, index);
            }
            record.credentials = decode_credentials(buf);
        }

        record
    }
}

fn decode_rule(buf: &[u8; RECORD_LEN], index: usize) -> DayRule {
    let base = RULES_OFFSET + index * RULE_LEN;
    let hour = get_u32(buf, base + 4);
    let minute = get_u32(buf, base + 8);

    if hour > 23 || minute > 59 {
        warn!("rule {index} is corrupt (hour={hour}, minute={minute}); using a disabled default");
        return DayRule::default();
    }

    DayRule {
        enabled: buf[base] != 0,
        hour: hour as u8,
        minute: minute as u8,
        duration_ms: get_u32(buf, base + 12),
    }
}

/// Records written before credentials moved into the record leave this tail as erased
/// flash or zeros; anything that is not a terminated, printable SSID reads as no credentials.
fn decode_credentials(buf: &[u8; RECORD_LEN]) -> StationCredentials {
    let ssid_field = &buf[SSID_OFFSET..SSID_OFFSET + SSID_LEN];
    let password_field = &buf[PASSWORD_OFFSET..PASSWORD_OFFSET + PASSWORD_LEN];
    if !ssid_field.contains(&0) || !password_field.contains(&0) {
        return StationCredentials::default();
    }

    let ssid = get_str(buf, SSID_OFFSET, SSID_LEN, "ssid").unwrap_or_default();
    if ssid.is_empty() || ssid.chars().any(char::is_control) {
        return StationCredentials::default();
    }

    StationCredentials {
        ssid,
        password: get_str(buf, PASSWORD_OFFSET, PASSWORD_LEN, "passphrase").unwrap_or_default(),
    }
}

fn put_str(buf: &mut [u8], offset: usize, field_len: usize, value: &str) {
    let value = truncate_to_boundary(value, field_len - 1);
    buf[offset..offset + value.len()].copy_from_slice(value.as_bytes());
}

fn get_str(buf: &[u8], offset: usize, field_len: usize, field: &str) -> Option<String> {
    let raw = &buf[offset..offset + field_len];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(field_len);
    match std::str::from_utf8(&raw[..end]) {
        Ok(value) => Some(value.to_string()),
        Err(_) => {
            warn!("stored {field} is not valid UTF-8; using default");
            None
        }
    }
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub struct ConfigStore<S> {
    storage: S,
}

impl<S: NvStorage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn load(&self) -> PersistedRecord {
        self.load_with(PersistedRecord::default())
    }

    pub fn load_with(&self, defaults: PersistedRecord) -> PersistedRecord {
        let mut buf = [0u8; RECORD_LEN];
        if let Err(err) = self.storage.read(RECORD_OFFSET, &mut buf) {
            warn!("config record unreadable, using defaults: {err}");
            return defaults;
        }

        let record = PersistedRecord::decode(&buf, defaults);
        info!("loaded config record v{}", record.version);
        record
    }

    pub fn save(&mut self, record: &PersistedRecord) -> Result<(), StoreError> {
        self.storage
            .write(RECORD_OFFSET, &record.encode())
            .and_then(|()| self.storage.commit())
            .map_err(StoreError::Save)?;
        info!("saved config record v{CURRENT_VERSION}");
        Ok(())
    }

    pub fn erase(&mut self) -> Result<(), StoreError> {
        let zeros = vec![0u8; self.storage.capacity()];
        self.storage
            .write(0, &zeros)
            .and_then(|()| self.storage.commit())
            .map_err(StoreError::Erase)?;
        info!("config storage erased");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::STORAGE_SIZE;

    fn sample_record() -> PersistedRecord {
        let mut rules = [DayRule::default(); 8];
        rules[0] = DayRule {
            enabled: true,
            hour: 6,
            minute: 15,
            duration_ms: 10 * 60_000,
        };
        rules[3] = DayRule {
            enabled: false,
            hour: 21,
            minute: 45,
            duration_ms: 90_000,
        };

        PersistedRecord {
            version: CURRENT_VERSION,
            display_name: "Back Yard".to_string(),
            update_address: "http://ota.example.net/fw.bin".to_string(),
            rules,
            credentials: StationCredentials {
                ssid: "Home".to_string(),
                password: "longenough1".to_string(),
            },
        }
    }

    #[test]
    fn record_layout_matches_device_format() {
        assert_eq!(RECORD_LEN, 330);

        let bytes = sample_record().encode();
        assert_eq!(bytes[0], CURRENT_VERSION);
        assert_eq!(&bytes[1..10], b"Back Yard");
        assert_eq!(bytes[10], 0);
        assert_eq!(bytes[RULES_OFFSET], 1);
        assert_eq!(&bytes[RULES_OFFSET + 4..RULES_OFFSET + 8], &6u32.to_le_bytes());
        assert_eq!(&bytes[RULES_OFFSET + 12..RULES_OFFSET + 16], &600_000u32.to_le_bytes());
        assert_eq!(&bytes[SSID_OFFSET..SSID_OFFSET + 4], b"Home");
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut store = ConfigStore::new(MemoryStorage::new(STORAGE_SIZE));
        let record = sample_record();

        store.save(&record).unwrap();

        assert_eq!(store.load(), record);
        assert_eq!(store.storage().commits(), 1);
    }

    #[test]
    fn version_zero_loads_defaults() {
        let store = ConfigStore::new(MemoryStorage::new(STORAGE_SIZE));
        let record = store.load();

        assert_eq!(record, PersistedRecord::default());
        assert_eq!(record.display_name, DEFAULT_DISPLAY_NAME);
        assert!(record.rules.iter().all(|rule| !rule.enabled));
    }

    #[test]
    fn version_one_ignores_stale_rule_bytes() {
        let mut bytes = sample_record().encode();
        bytes[0] = 1;
        let mut storage = MemoryStorage::new(STORAGE_SIZE);
        storage.write(RECORD_OFFSET, &bytes).unwrap();
        storage.commit().unwrap();

        let record = ConfigStore::new(storage).load();

        assert_eq!(record.version, 1);
        assert_eq!(record.display_name, "Back Yard");
        assert_eq!(record.rules, [DayRule::default(); 8]);
        assert_eq!(record.credentials, StationCredentials::default());
    }

    #[test]
    fn newer_version_reads_known_fields() {
        let mut bytes = sample_record().encode();
        bytes[0] = CURRENT_VERSION + 1;
        let mut storage = MemoryStorage::new(STORAGE_SIZE);
        storage.write(RECORD_OFFSET, &bytes).unwrap();
        storage.commit().unwrap();

        let record = ConfigStore::new(storage).load();

        assert_eq!(record.version, CURRENT_VERSION + 1);
        assert_eq!(record.rules, sample_record().rules);
        assert_eq!(record.credentials.ssid, "Home");
    }

    #[test]
    fn load_with_keeps_caller_defaults() {
        let store = ConfigStore::new(MemoryStorage::new(STORAGE_SIZE));
        let defaults = PersistedRecord {
            display_name: "Garden".to_string(),
            ..PersistedRecord::default()
        };

        assert_eq!(store.load_with(defaults.clone()), defaults);
    }

    #[test]
    fn long_strings_truncate_on_char_boundary() {
        let mut store = ConfigStore::new(MemoryStorage::new(STORAGE_SIZE));
        let record = PersistedRecord {
            display_name: "ü".repeat(30),
            ..sample_record()
        };

        store.save(&record).unwrap();
        let loaded = store.load();

        assert_eq!(loaded.display_name, "ü".repeat(24));
        assert_eq!(loaded.update_address, record.update_address);
    }

    #[test]
    fn corrupt_rule_decodes_disabled() {
        let mut bytes = sample_record().encode();
        put_u32(&mut bytes, RULES_OFFSET + 4, 99);
        let mut storage = MemoryStorage::new(STORAGE_SIZE);
        storage.write(RECORD_OFFSET, &bytes).unwrap();
        storage.commit().unwrap();

        let record = ConfigStore::new(storage).load();

        assert_eq!(record.rules[0], DayRule::default());
        assert_eq!(record.rules[3], sample_record().rules[3]);
    }

    #[test]
    fn invalid_utf8_name_uses_default() {
        let mut bytes = sample_record().encode();
        bytes[NAME_OFFSET] = 0xff;
        let mut storage = MemoryStorage::new(STORAGE_SIZE);
        storage.write(RECORD_OFFSET, &bytes).unwrap();
        storage.commit().unwrap();

        let record = ConfigStore::new(storage).load();

        assert_eq!(record.display_name, DEFAULT_DISPLAY_NAME);
        assert_eq!(record.credentials.password, "longenough1");
    }

    #[test]
    fn erased_credential_tail_reads_as_no_credentials() {
        let mut bytes = sample_record().encode();
        bytes[SSID_OFFSET..].fill(0xff);
        let mut storage = MemoryStorage::new(STORAGE_SIZE);
        storage.write(RECORD_OFFSET, &bytes).unwrap();
        storage.commit().unwrap();

        let record = ConfigStore::new(storage).load();

        assert_eq!(record.version, CURRENT_VERSION);
        assert_eq!(record.rules, sample_record().rules);
        assert_eq!(record.credentials, StationCredentials::default());
    }

    #[test]
    fn garbage_ssid_drops_password_too() {
        let mut bytes = sample_record().encode();
        bytes[SSID_OFFSET..SSID_OFFSET + 3].copy_from_slice(&[0x01, 0x7f, 0x02]);
        bytes[SSID_OFFSET + 3] = 0;
        let mut storage = MemoryStorage::new(STORAGE_SIZE);
        storage.write(RECORD_OFFSET, &bytes).unwrap();
        storage.commit().unwrap();

        let record = ConfigStore::new(storage).load();

        assert_eq!(record.credentials, StationCredentials::default());
        assert_eq!(record.display_name, "Back Yard");
    }

    #[test]
    fn unreadable_region_loads_defaults() {
        let store = ConfigStore::new(MemoryStorage::new(64));
        assert_eq!(store.load(), PersistedRecord::default());
    }

    #[test]
    fn failed_commit_surfaces_error() {
        let mut storage = MemoryStorage::new(STORAGE_SIZE);
        storage.fail_commits(true);
        let mut store = ConfigStore::new(storage);

        let err = store.save(&sample_record()).unwrap_err();

        assert!(matches!(err, StoreError::Save(StorageError::Commit(_))));
        assert_eq!(store.load(), PersistedRecord::default());
    }

    #[test]
    fn erase_zeroes_region() {
        let mut store = ConfigStore::new(MemoryStorage::new(STORAGE_SIZE));
        store.save(&sample_record()).unwrap();

        store.erase().unwrap();

        assert!(store.storage().committed().iter().all(|b| *b == 0));
        assert_eq!(store.load(), PersistedRecord::default());
    }
}
