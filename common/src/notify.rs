use std::net::Ipv4Addr;

use log::warn;
use thiserror::Error;

use crate::{
    settings::Settings,
    topics::{topic, TOPIC_COMMAND, TOPIC_RSSI, TOPIC_STATUS},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("messaging channel is not connected")]
    Disconnected,
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Publish capability offered by the platform's messaging session.
pub trait NotificationChannel {
    fn is_connected(&self) -> bool;

    /// Non-blocking: reports the current link state. When the link is down
    /// this starts a session for `session` if none exists for it yet, or
    /// kicks a reconnect of the existing one.
    fn ensure_connected(&mut self, session: &SessionConfig) -> bool;

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), NotifyError>;

    /// Signal strength in dBm, if the link reports one.
    fn signal_strength(&self) -> Option<i32>;

    fn local_address(&self) -> Option<Ipv4Addr>;
}

/// Publishes `message` to the status topic, retained.
///
/// The signal strength goes out first on the rssi topic. Its failure is
/// logged and does not stop the status publish.
pub fn send_status<N: NotificationChannel + ?Sized>(
    channel: &mut N,
    settings: &Settings,
    message: &str,
) -> Result<(), NotifyError> {
    if !channel.ensure_connected(&SessionConfig::from_settings(settings)) {
        return Err(NotifyError::Disconnected);
    }

    let root = &settings.topic_root;
    let rssi = channel.signal_strength().unwrap_or_default().to_string();
    if let Err(err) = channel.publish(&topic(root, TOPIC_RSSI), &rssi, true) {
        warn!("rssi publish failed: {err}");
    }

    channel.publish(&topic(root, TOPIC_STATUS), message, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: String,
    pub retain: bool,
}

/// Link and broker session parameters derived from the persisted settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub ssid: String,
    pub wifi_password: String,
    pub client_id: String,
    pub host: String,
    pub port: u16,
    /// Only present when a username is configured.
    pub credentials: Option<(String, String)>,
    pub last_will: LastWill,
    pub command_topic: String,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let credentials = (!settings.username.is_empty())
            .then(|| (settings.username.clone(), settings.user_password.clone()));

        Self {
            ssid: settings.ssid.clone(),
            wifi_password: settings.wifi_password.clone(),
            client_id: settings.client_id.clone(),
            host: settings.broker_address.clone(),
            port: u16::try_from(settings.broker_port).unwrap_or_default(),
            credentials,
            last_will: LastWill {
                topic: topic(&settings.topic_root, TOPIC_STATUS),
                message: settings.lwt_message.clone(),
                retain: true,
            },
            command_topic: topic(&settings.topic_root, TOPIC_COMMAND),
        }
    }

    pub fn broker_url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{fake::*, *};

    fn pump_settings() -> Settings {
        let mut settings = Settings::default();
        settings.ssid = "workshop".to_string();
        settings.broker_address = "10.0.0.5".to_string();
        settings.topic_root = "pump/".to_string();
        settings
    }

    #[test]
    fn status_is_preceded_by_retained_rssi() {
        let mut channel = RecordingChannel::connected();

        send_status(&mut channel, &pump_settings(), "started").unwrap();

        assert_eq!(
            channel.published,
            vec![
                Published {
                    topic: "pump/rssi".to_string(),
                    payload: "-61".to_string(),
                    retain: true,
                },
                Published {
                    topic: "pump/status".to_string(),
                    payload: "started".to_string(),
                    retain: true,
                },
            ]
        );
    }

    #[test]
    fn rssi_failure_does_not_block_status() {
        let mut channel = RecordingChannel::connected();
        channel.failing.push("pump/rssi".to_string());

        send_status(&mut channel, &pump_settings(), "timeout").unwrap();

        assert_eq!(channel.payloads_on("pump/status"), vec!["timeout"]);
        assert!(channel.payloads_on("pump/rssi").is_empty());
    }

    #[test]
    fn disconnected_channel_is_not_published_to() {
        let mut channel = RecordingChannel::default();

        assert_eq!(
            send_status(&mut channel, &pump_settings(), "timeout"),
            Err(NotifyError::Disconnected)
        );
        assert_eq!(channel.attempts, 0);
    }

    #[test]
    fn send_opens_session_from_current_settings() {
        let mut channel = RecordingChannel {
            link_up_on_demand: true,
            ..RecordingChannel::default()
        };

        send_status(&mut channel, &pump_settings(), "timeout").unwrap();

        assert_eq!(channel.sessions.len(), 1);
        assert_eq!(channel.sessions[0].ssid, "workshop");
        assert_eq!(channel.sessions[0].host, "10.0.0.5");
        assert_eq!(channel.sessions[0].command_topic, "pump/command");
        assert_eq!(channel.payloads_on("pump/status"), vec!["timeout"]);
    }

    #[test]
    fn session_config_carries_last_will_and_command_topic() {
        let mut settings = Settings::default();
        settings.broker_address = "10.0.0.5".to_string();
        settings.client_id = "RunTimeLimiter42".to_string();

        let session = SessionConfig::from_settings(&settings);

        assert_eq!(session.broker_url(), "mqtt://10.0.0.5:1883");
        assert_eq!(session.credentials, None);
        assert_eq!(
            session.last_will,
            LastWill {
                topic: "esp8266/runlimiter/status".to_string(),
                message: "stopped".to_string(),
                retain: true,
            }
        );
        assert_eq!(session.command_topic, "esp8266/runlimiter/command");
    }

    #[test]
    fn credentials_only_with_username() {
        let mut settings = Settings::default();
        settings.user_password = "secret".to_string();
        assert_eq!(SessionConfig::from_settings(&settings).credentials, None);

        settings.username = "relay".to_string();
        assert_eq!(
            SessionConfig::from_settings(&settings).credentials,
            Some(("relay".to_string(), "secret".to_string()))
        );
    }
}
