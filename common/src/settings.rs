use thiserror::Error;

/// Marker stored in the first two bytes of a fully configured record.
pub const VALID_SETTINGS_MARKER: u16 = 0xDAB0;

pub const SSID_SIZE: usize = 100;
pub const PASSWORD_SIZE: usize = 50;
pub const ADDRESS_SIZE: usize = 30;
pub const USERNAME_SIZE: usize = 50;
pub const TOPIC_ROOT_SIZE: usize = 50;
pub const MESSAGE_SIZE: usize = 15;
pub const CLIENT_ID_SIZE: usize = 25;

pub const DEFAULT_BROKER_PORT: i32 = 1883;
pub const DEFAULT_MAX_RUNTIME_SECS: u32 = 300;
pub const DEFAULT_TOPIC_ROOT: &str = "esp8266/runlimiter/";
pub const DEFAULT_RUN_MESSAGE: &str = "started";
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "timeout";
pub const DEFAULT_LWT_MESSAGE: &str = "stopped";
pub const CLIENT_ID_ROOT: &str = "RunTimeLimiter";

/// Size of the persisted block, in bytes.
pub const RECORD_SIZE: usize = 2
    + SSID_SIZE
    + PASSWORD_SIZE
    + ADDRESS_SIZE
    + 4
    + USERNAME_SIZE
    + PASSWORD_SIZE
    + TOPIC_ROOT_SIZE
    + MESSAGE_SIZE * 3
    + 4
    + 1
    + CLIENT_ID_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Ssid,
    WifiPassword,
    BrokerAddress,
    Username,
    UserPassword,
    TopicRoot,
    RunMessage,
    TimeoutMessage,
    LwtMessage,
    ClientId,
}

impl TextField {
    /// Record layout order.
    pub const ALL: [TextField; 10] = [
        Self::Ssid,
        Self::WifiPassword,
        Self::BrokerAddress,
        Self::Username,
        Self::UserPassword,
        Self::TopicRoot,
        Self::RunMessage,
        Self::TimeoutMessage,
        Self::LwtMessage,
        Self::ClientId,
    ];

    /// Buffer size in the persisted record, terminator included.
    pub const fn capacity(self) -> usize {
        match self {
            Self::Ssid => SSID_SIZE,
            Self::WifiPassword | Self::UserPassword => PASSWORD_SIZE,
            Self::BrokerAddress => ADDRESS_SIZE,
            Self::Username => USERNAME_SIZE,
            Self::TopicRoot => TOPIC_ROOT_SIZE,
            Self::RunMessage | Self::TimeoutMessage | Self::LwtMessage => MESSAGE_SIZE,
            Self::ClientId => CLIENT_ID_SIZE,
        }
    }

    pub const fn max_len(self) -> usize {
        self.capacity() - 1
    }

    /// Fields that must be non-empty for the record to count as configured.
    pub const fn is_required(self) -> bool {
        !matches!(self, Self::Username | Self::UserPassword | Self::ClientId)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssid => "ssid",
            Self::WifiPassword => "wifipass",
            Self::BrokerAddress => "broker",
            Self::Username => "userName",
            Self::UserPassword => "userPass",
            Self::TopicRoot => "topicRoot",
            Self::RunMessage => "runMessage",
            Self::TimeoutMessage => "timeoutMessage",
            Self::LwtMessage => "lwtMessage",
            Self::ClientId => "clientId",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("settings block is {len} bytes, expected {RECORD_SIZE}")]
    Truncated { len: usize },
    #[error("text field `{}` is not terminated", .0.as_str())]
    UnterminatedText(TextField),
    #[error("text field `{}` is not valid UTF-8", .0.as_str())]
    InvalidUtf8(TextField),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    validity_marker: u16,
    pub ssid: String,
    pub wifi_password: String,
    pub broker_address: String,
    pub broker_port: i32,
    pub username: String,
    pub user_password: String,
    pub topic_root: String,
    pub run_message: String,
    pub timeout_message: String,
    pub lwt_message: String,
    pub max_runtime_secs: u32,
    pub debug: bool,
    pub client_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            validity_marker: 0,
            ssid: String::new(),
            wifi_password: String::new(),
            broker_address: String::new(),
            broker_port: DEFAULT_BROKER_PORT,
            username: String::new(),
            user_password: String::new(),
            topic_root: DEFAULT_TOPIC_ROOT.to_string(),
            run_message: DEFAULT_RUN_MESSAGE.to_string(),
            timeout_message: DEFAULT_TIMEOUT_MESSAGE.to_string(),
            lwt_message: DEFAULT_LWT_MESSAGE.to_string(),
            max_runtime_secs: DEFAULT_MAX_RUNTIME_SECS,
            debug: false,
            client_id: String::new(),
        }
    }
}

impl Settings {
    pub fn validity_marker(&self) -> u16 {
        self.validity_marker
    }

    pub fn is_marked_valid(&self) -> bool {
        self.validity_marker == VALID_SETTINGS_MARKER
    }

    pub fn text(&self, field: TextField) -> &str {
        match field {
            TextField::Ssid => &self.ssid,
            TextField::WifiPassword => &self.wifi_password,
            TextField::BrokerAddress => &self.broker_address,
            TextField::Username => &self.username,
            TextField::UserPassword => &self.user_password,
            TextField::TopicRoot => &self.topic_root,
            TextField::RunMessage => &self.run_message,
            TextField::TimeoutMessage => &self.timeout_message,
            TextField::LwtMessage => &self.lwt_message,
            TextField::ClientId => &self.client_id,
        }
    }

    /// Stores `value`, cut to the field's bound on a character boundary.
    pub fn set_text(&mut self, field: TextField, value: &str) {
        let value = truncate_to(value, field.max_len()).to_string();
        let slot = match field {
            TextField::Ssid => &mut self.ssid,
            TextField::WifiPassword => &mut self.wifi_password,
            TextField::BrokerAddress => &mut self.broker_address,
            TextField::Username => &mut self.username,
            TextField::UserPassword => &mut self.user_password,
            TextField::TopicRoot => &mut self.topic_root,
            TextField::RunMessage => &mut self.run_message,
            TextField::TimeoutMessage => &mut self.timeout_message,
            TextField::LwtMessage => &mut self.lwt_message,
            TextField::ClientId => &mut self.client_id,
        };
        *slot = value;
    }

    /// True iff every required text field is non-empty, every text field fits
    /// its bound, and the port and runtime are in range.
    pub fn is_complete(&self) -> bool {
        let text_ok = TextField::ALL.iter().all(|&field| {
            let text = self.text(field);
            text.len() <= field.max_len() && (!field.is_required() || !text.is_empty())
        });

        text_ok && (1..=65_535).contains(&self.broker_port) && self.max_runtime_secs > 0
    }

    /// Recomputes the marker from [`Settings::is_complete`].
    pub(crate) fn refresh_validity_marker(&mut self) -> bool {
        let complete = self.is_complete();
        self.validity_marker = if complete { VALID_SETTINGS_MARKER } else { 0 };
        complete
    }

    /// Boot-time plausibility check of a freshly decoded record.
    pub fn passes_load_check(&self) -> bool {
        (self.validity_marker == 0 || self.validity_marker == VALID_SETTINGS_MARKER)
            && (0..=65_535).contains(&self.broker_port)
            && self.max_runtime_secs > 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_SIZE);
        out.extend_from_slice(&self.validity_marker.to_le_bytes());
        self.encode_text(&mut out, TextField::Ssid);
        self.encode_text(&mut out, TextField::WifiPassword);
        self.encode_text(&mut out, TextField::BrokerAddress);
        out.extend_from_slice(&self.broker_port.to_le_bytes());
        self.encode_text(&mut out, TextField::Username);
        self.encode_text(&mut out, TextField::UserPassword);
        self.encode_text(&mut out, TextField::TopicRoot);
        self.encode_text(&mut out, TextField::RunMessage);
        self.encode_text(&mut out, TextField::TimeoutMessage);
        self.encode_text(&mut out, TextField::LwtMessage);
        out.extend_from_slice(&self.max_runtime_secs.to_le_bytes());
        out.push(u8::from(self.debug));
        self.encode_text(&mut out, TextField::ClientId);
        out
    }

    pub fn decode(block: &[u8]) -> Result<Self, RecordError> {
        if block.len() < RECORD_SIZE {
            return Err(RecordError::Truncated { len: block.len() });
        }

        let mut reader = RecordReader { block, pos: 0 };
        let mut settings = Settings {
            validity_marker: u16::from_le_bytes(reader.array()),
            ..Settings::default()
        };
        settings.ssid = reader.text(TextField::Ssid)?;
        settings.wifi_password = reader.text(TextField::WifiPassword)?;
        settings.broker_address = reader.text(TextField::BrokerAddress)?;
        settings.broker_port = i32::from_le_bytes(reader.array());
        settings.username = reader.text(TextField::Username)?;
        settings.user_password = reader.text(TextField::UserPassword)?;
        settings.topic_root = reader.text(TextField::TopicRoot)?;
        settings.run_message = reader.text(TextField::RunMessage)?;
        settings.timeout_message = reader.text(TextField::TimeoutMessage)?;
        settings.lwt_message = reader.text(TextField::LwtMessage)?;
        settings.max_runtime_secs = u32::from_le_bytes(reader.array());
        settings.debug = reader.array::<1>()[0] != 0;
        settings.client_id = reader.text(TextField::ClientId)?;
        Ok(settings)
    }

    fn encode_text(&self, out: &mut Vec<u8>, field: TextField) {
        let text = truncate_to(self.text(field), field.max_len()).as_bytes();
        out.extend_from_slice(text);
        out.resize(out.len() + field.capacity() - text.len(), 0);
    }
}

struct RecordReader<'a> {
    block: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, len: usize) -> &'a [u8] {
        let bytes = &self.block[self.pos..self.pos + len];
        self.pos += len;
        bytes
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0_u8; N];
        out.copy_from_slice(self.take(N));
        out
    }

    fn text(&mut self, field: TextField) -> Result<String, RecordError> {
        let raw = self.take(field.capacity());
        let end = raw
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(RecordError::UnterminatedText(field))?;
        core::str::from_utf8(&raw[..end])
            .map(str::to_string)
            .map_err(|_| RecordError::InvalidUtf8(field))
    }
}

fn truncate_to(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Settings {
        let mut settings = Settings::default();
        settings.ssid = "workshop".to_string();
        settings.wifi_password = "hunter22".to_string();
        settings.broker_address = "10.0.0.5".to_string();
        settings.client_id = "RunTimeLimiter1A2B".to_string();
        settings
    }

    #[test]
    fn record_size_matches_layout() {
        assert_eq!(RECORD_SIZE, 411);
        assert_eq!(Settings::default().encode().len(), RECORD_SIZE);
    }

    #[test]
    fn defaults_are_incomplete() {
        let settings = Settings::default();
        assert!(!settings.is_complete());
        assert_eq!(settings.broker_port, 1883);
        assert_eq!(settings.max_runtime_secs, 300);
        assert_eq!(settings.topic_root, "esp8266/runlimiter/");
    }

    #[test]
    fn complete_without_optional_broker_credentials() {
        let settings = configured();
        assert!(settings.username.is_empty());
        assert!(settings.is_complete());
    }

    #[test]
    fn any_empty_required_field_makes_record_incomplete() {
        for field in TextField::ALL.into_iter().filter(|field| field.is_required()) {
            let mut settings = configured();
            settings.set_text(field, "");
            assert!(!settings.is_complete(), "{} left empty", field.as_str());
        }
    }

    #[test]
    fn out_of_bound_text_makes_record_incomplete() {
        let mut settings = configured();
        settings.user_password = "x".repeat(PASSWORD_SIZE);
        assert!(!settings.is_complete());

        settings.user_password = "x".repeat(PASSWORD_SIZE - 1);
        assert!(settings.is_complete());
    }

    #[test]
    fn port_and_runtime_ranges() {
        let mut settings = configured();
        for (port, expected) in [(0, false), (1, true), (65_535, true), (65_536, false), (-1, false)] {
            settings.broker_port = port;
            assert_eq!(settings.is_complete(), expected, "port {port}");
        }

        settings.broker_port = 1883;
        settings.max_runtime_secs = 0;
        assert!(!settings.is_complete());
    }

    #[test]
    fn refresh_marker_is_all_or_nothing() {
        let mut settings = configured();
        assert!(settings.refresh_validity_marker());
        assert_eq!(settings.validity_marker(), VALID_SETTINGS_MARKER);

        settings.broker_address.clear();
        assert!(!settings.refresh_validity_marker());
        assert_eq!(settings.validity_marker(), 0);
    }

    #[test]
    fn set_text_truncates_on_char_boundary() {
        let mut settings = Settings::default();
        settings.set_text(TextField::RunMessage, "ééééééééé");
        // 14 bytes available, each char is two bytes wide
        assert_eq!(settings.run_message, "ééééééé");

        settings.set_text(TextField::TimeoutMessage, "way-too-long-message");
        assert_eq!(settings.timeout_message.len(), MESSAGE_SIZE - 1);
    }

    #[test]
    fn marker_leads_the_block() {
        let mut settings = configured();
        settings.refresh_validity_marker();
        let block = settings.encode();
        assert_eq!(&block[..2], &[0xB0, 0xDA]);
    }

    #[test]
    fn decode_restores_encoded_record() {
        let mut settings = configured();
        settings.username = "pump".to_string();
        settings.broker_port = 8883;
        settings.max_runtime_secs = 45;
        settings.debug = true;
        settings.refresh_validity_marker();

        let block = settings.encode();
        let decoded = Settings::decode(&block).unwrap();
        assert_eq!(decoded, settings);
        assert_eq!(decoded.encode(), block);
    }

    #[test]
    fn decode_rejects_short_and_unterminated_blocks() {
        assert_eq!(
            Settings::decode(&[0_u8; 10]),
            Err(RecordError::Truncated { len: 10 })
        );

        let erased = vec![0xFF_u8; RECORD_SIZE];
        assert_eq!(
            Settings::decode(&erased),
            Err(RecordError::UnterminatedText(TextField::Ssid))
        );
    }

    #[test]
    fn load_check_accepts_zero_and_magic_markers_only() {
        let mut settings = Settings::default();
        assert!(settings.passes_load_check());

        settings.validity_marker = VALID_SETTINGS_MARKER;
        assert!(settings.passes_load_check());

        settings.validity_marker = 0x1234;
        assert!(!settings.passes_load_check());

        settings.validity_marker = 0;
        settings.broker_port = 70_000;
        assert!(!settings.passes_load_check());

        settings.broker_port = 1883;
        settings.max_runtime_secs = 0;
        assert!(!settings.passes_load_check());
    }
}
