pub mod command;
pub mod config;
pub mod console;
pub mod controller;
pub mod notify;
pub mod settings;
pub mod store;
pub mod timer;
pub mod topics;

pub use command::{parse_int, parse_line, process_command, settings_dump, CommandKey, CommandOutcome};
pub use config::{DeviceConfig, IndicatorMode};
pub use console::LineAssembler;
pub use controller::{Board, Controller};
pub use notify::{send_status, LastWill, NotificationChannel, NotifyError, SessionConfig};
pub use settings::{RecordError, Settings, TextField, RECORD_SIZE, VALID_SETTINGS_MARKER};
pub use store::{LoadOutcome, MemoryStorage, SettingsStorage, SettingsStore, StorageError};
pub use timer::{RunState, RuntimeTimer, TimerAction};
pub use topics::*;
