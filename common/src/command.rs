//! The `key=value` line protocol shared by the local console and the remote
//! command topic.
//!
//! A line is split on its first `=`, trailing line terminators are dropped
//! from both halves, and the key is looked up in a fixed, case-sensitive
//! table. Every setting key writes its field and persists the record right
//! away. The action keys (`resetmqttid`, `factorydefaults`, `reset`) only fire
//! on the exact value `yes`.

use std::{collections::HashMap, fmt::Write as _, sync::OnceLock};

use log::info;

use crate::{
    settings::{Settings, TextField},
    store::{SettingsStorage, SettingsStore},
};

pub const CONFIRM_VALUE: &str = "yes";
pub const FACTORY_RESET_DELAY_MS: u64 = 2_000;
pub const RESET_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKey {
    Ssid,
    WifiPass,
    Broker,
    BrokerPort,
    UserName,
    UserPass,
    LwtMessage,
    RunMessage,
    TimeoutMessage,
    TopicRoot,
    MaxRuntime,
    ResetMqttId,
    Debug,
    FactoryDefaults,
    Reset,
}

impl CommandKey {
    pub const ALL: [CommandKey; 15] = [
        Self::Ssid,
        Self::WifiPass,
        Self::Broker,
        Self::BrokerPort,
        Self::UserName,
        Self::UserPass,
        Self::LwtMessage,
        Self::RunMessage,
        Self::TimeoutMessage,
        Self::TopicRoot,
        Self::MaxRuntime,
        Self::ResetMqttId,
        Self::Debug,
        Self::FactoryDefaults,
        Self::Reset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssid => "ssid",
            Self::WifiPass => "wifipass",
            Self::Broker => "broker",
            Self::BrokerPort => "brokerPort",
            Self::UserName => "userName",
            Self::UserPass => "userPass",
            Self::LwtMessage => "lwtMessage",
            Self::RunMessage => "runMessage",
            Self::TimeoutMessage => "timeoutMessage",
            Self::TopicRoot => "topicRoot",
            Self::MaxRuntime => "maxRuntime",
            Self::ResetMqttId => "resetmqttid",
            Self::Debug => "debug",
            Self::FactoryDefaults => "factorydefaults",
            Self::Reset => "reset",
        }
    }

    /// Exact-match lookup.
    pub fn lookup(name: &str) -> Option<Self> {
        static TABLE: OnceLock<HashMap<&'static str, CommandKey>> = OnceLock::new();
        TABLE
            .get_or_init(|| CommandKey::ALL.iter().map(|&key| (key.as_str(), key)).collect())
            .get(name)
            .copied()
    }

    fn text_field(self) -> Option<TextField> {
        match self {
            Self::Ssid => Some(TextField::Ssid),
            Self::WifiPass => Some(TextField::WifiPassword),
            Self::Broker => Some(TextField::BrokerAddress),
            Self::UserName => Some(TextField::Username),
            Self::UserPass => Some(TextField::UserPassword),
            Self::LwtMessage => Some(TextField::LwtMessage),
            Self::RunMessage => Some(TextField::RunMessage),
            Self::TimeoutMessage => Some(TextField::TimeoutMessage),
            Self::TopicRoot => Some(TextField::TopicRoot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub name: &'a str,
    pub value: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// A setting was written and persisted.
    Applied(CommandKey),
    /// The command asks for a device restart after `delay_ms`.
    Restart { key: CommandKey, delay_ms: u64 },
    /// Empty, unknown or unconfirmed command; nothing was changed.
    Rejected,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

pub fn parse_line(line: &str) -> ParsedLine<'_> {
    let (name, value) = match line.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (line, None),
    };

    ParsedLine {
        name: strip_line_ending(name),
        value: value.map(strip_line_ending),
    }
}

/// Drops up to two trailing CR/LF characters.
fn strip_line_ending(text: &str) -> &str {
    let mut text = text;
    for _ in 0..2 {
        text = text.strip_suffix(&['\r', '\n'][..]).unwrap_or(text);
    }
    text
}

/// C `atoi` semantics: leading whitespace, optional sign, longest digit
/// prefix. Text without a digit prefix reads as 0.
pub fn parse_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0_i64, |acc, digit| {
            acc.saturating_mul(10).saturating_add(i64::from(digit - b'0'))
        });

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

pub fn process_command<S: SettingsStorage>(
    store: &mut SettingsStore<S>,
    line: &str,
) -> CommandOutcome {
    let ParsedLine { name, value } = parse_line(line);
    let value = value.unwrap_or("");

    if store.settings().debug {
        info!("processing command {name:?} (len {}) value {value:?}", name.len());
    }

    if name.is_empty() {
        return CommandOutcome::Rejected;
    }
    let Some(key) = CommandKey::lookup(name) else {
        return CommandOutcome::Rejected;
    };

    if let Some(field) = key.text_field() {
        store.settings_mut().set_text(field, value);
        store.save();
        return CommandOutcome::Applied(key);
    }

    match key {
        CommandKey::BrokerPort => {
            store.settings_mut().broker_port = i32::try_from(parse_int(value)).unwrap_or(0);
        }
        CommandKey::MaxRuntime => {
            store.settings_mut().max_runtime_secs = u32::try_from(parse_int(value)).unwrap_or(0);
        }
        CommandKey::Debug => {
            store.settings_mut().debug = value != "false";
        }
        CommandKey::ResetMqttId if value == CONFIRM_VALUE => {
            store.regenerate_client_identity();
            return CommandOutcome::Applied(key);
        }
        CommandKey::FactoryDefaults if value == CONFIRM_VALUE => {
            info!("resetting all settings to factory defaults");
            store.initialize();
            return CommandOutcome::Restart {
                key,
                delay_ms: FACTORY_RESET_DELAY_MS,
            };
        }
        CommandKey::Reset if value == CONFIRM_VALUE => {
            info!("resetting device");
            return CommandOutcome::Restart {
                key,
                delay_ms: RESET_DELAY_MS,
            };
        }
        _ => return CommandOutcome::Rejected,
    }

    store.save();
    CommandOutcome::Applied(key)
}

/// Canonical listing of every setting, in fixed order.
pub fn settings_dump(settings: &Settings) -> String {
    let mut out = String::new();
    let mut text = |label: &str, value: &str, help: &str| {
        if value.is_empty() {
            let _ = writeln!(out, "{label}=<{help}>");
        } else {
            let _ = writeln!(out, "{label}={value}");
        }
    };

    text("ssid", &settings.ssid, "wifi ssid");
    text("wifipass", &settings.wifi_password, "wifi password");
    text("broker", &settings.broker_address, "address of MQTT broker");
    text(
        "brokerPort",
        &settings.broker_port.to_string(),
        "port number MQTT broker",
    );
    text("userName", &settings.username, "user ID for MQTT broker");
    text(
        "userPass",
        &settings.user_password,
        "user password for MQTT broker",
    );
    text(
        "topicRoot",
        &settings.topic_root,
        "MQTT topic base to which status or other topics will be added",
    );
    text(
        "runMessage",
        &settings.run_message,
        "status message to send when power is applied",
    );
    text(
        "lwtMessage",
        &settings.lwt_message,
        "status message to send when power is removed",
    );
    text(
        "timeoutMessage",
        &settings.timeout_message,
        "status message to send when runtime is exceeded",
    );
    text(
        "maxRuntime",
        &settings.max_runtime_secs.to_string(),
        "maximum allowable seconds to run",
    );
    text(
        "debug",
        if settings.debug { "true" } else { "false" },
        "print debug messages to serial port",
    );
    text(
        "MQTT client ID",
        &settings.client_id,
        "automatically generated client ID",
    );

    out.push_str("**Use \"resetmqttid=yes\" to regenerate the MQTT client ID\n");
    out.push_str("*** Use \"factorydefaults=yes\" to reset all settings ***\n");
    out
}
