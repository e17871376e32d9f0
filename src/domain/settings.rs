use crate::domain::models::DeviceAddress;
use crate::domain::telemetry::{COMM_GET_DECODED_BALANCE, COMM_GET_VALUES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// One periodic poll: a command id plus argument bytes, written every
/// `interval_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub command_id: u8,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

impl PollSettings {
    pub fn new(command_id: u8) -> Self {
        Self {
            command_id,
            payload: Vec::new(),
            interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub known_addresses: Vec<DeviceAddress>,
    #[serde(default)]
    pub last_connected_address: Option<DeviceAddress>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Peripheral endpoints (Nordic UART service)
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: uuid::Uuid,
    #[serde(default = "default_command_uuid")]
    pub ble_command_char_uuid: uuid::Uuid,
    #[serde(default = "default_telemetry_uuid")]
    pub ble_telemetry_char_uuid: uuid::Uuid,

    // Link Settings
    /// MTU to negotiate once the link is up; `None` keeps the default (23).
    #[serde(default)]
    pub requested_mtu: Option<u16>,
    /// Fail an in-flight operation after this long. `None` (the default)
    /// never times out, so a silent peripheral stalls its queue.
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,

    // Polling
    #[serde(default = "default_polls")]
    pub polls: Vec<PollSettings>,

    // Debug Settings
    #[serde(default = "default_false")]
    pub debug_raw_data_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            known_addresses: Vec::new(),
            last_connected_address: None,
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_command_char_uuid: default_command_uuid(),
            ble_telemetry_char_uuid: default_telemetry_uuid(),
            requested_mtu: None,
            operation_timeout_ms: None,
            polls: default_polls(),
            debug_raw_data_logging: false,
        }
    }
}

impl Settings {
    /// Add the balance poll next to the default values poll if absent.
    pub fn enable_balance_poll(&mut self) {
        if !self
            .polls
            .iter()
            .any(|p| p.command_id == COMM_GET_DECODED_BALANCE)
        {
            self.polls.push(PollSettings::new(COMM_GET_DECODED_BALANCE));
        }
    }

    pub fn set_poll_interval(&mut self, interval_ms: u64) {
        for poll in &mut self.polls {
            poll.interval_ms = interval_ms;
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "floaty".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_service_uuid() -> uuid::Uuid {
    uuid::uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e")
}
fn default_command_uuid() -> uuid::Uuid {
    uuid::uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e")
}
fn default_telemetry_uuid() -> uuid::Uuid {
    uuid::uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e")
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_polls() -> Vec<PollSettings> {
    vec![PollSettings::new(COMM_GET_VALUES)]
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::open(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file
    /// is missing or unreadable.
    pub fn open(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("Floaty");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_address(&mut self, address: DeviceAddress) -> anyhow::Result<()> {
        if !self.settings.known_addresses.contains(&address) {
            self.settings.known_addresses.push(address);
        }
        self.settings.last_connected_address = Some(address);
        self.save()
    }
}
