//! Top-level owner of the device state.
//!
//! The controller holds the settings store, the runtime timer, the console
//! line buffer and the platform collaborators. Both command transports and
//! the periodic tick go through it, so there is exactly one place that
//! mutates settings.

use log::{debug, info, warn};

use crate::{
    command::{process_command, settings_dump, CommandOutcome},
    config::DeviceConfig,
    console::LineAssembler,
    notify::{send_status, NotificationChannel, SessionConfig},
    store::{LoadOutcome, SettingsStorage, SettingsStore},
    timer::{RuntimeTimer, TimerAction},
    topics::topic,
};

/// Remote payload that asks for the settings listing instead of a command.
pub const SETTINGS_REQUEST: &str = "settings";
pub const RESPONSE_OK: &str = "OK";
pub const RESPONSE_REJECTED: &str = "(empty)";

/// Relay, indicators, console output and restart of the target board.
pub trait Board {
    fn set_relay(&mut self, energized: bool);
    fn set_fault_indicator(&mut self, lit: bool);
    fn set_link_indicator(&mut self, lit: bool);
    /// Echo of one console byte as it arrives.
    fn echo(&mut self, byte: u8);
    /// User-facing console text.
    fn print(&mut self, text: &str);
    fn restart(&mut self, delay_ms: u64);
}

pub struct Controller<S, N, B> {
    store: SettingsStore<S>,
    channel: N,
    board: B,
    timer: RuntimeTimer,
    console: LineAssembler,
    load_outcome: LoadOutcome,
    link_lit: bool,
    restart_pending: bool,
}

impl<S, N, B> Controller<S, N, B>
where
    S: SettingsStorage,
    N: NotificationChannel,
    B: Board,
{
    /// Boots the device: relay on, indicators off, settings loaded, timer armed.
    pub fn new(
        mut store: SettingsStore<S>,
        channel: N,
        mut board: B,
        config: &DeviceConfig,
        now_ms: u32,
    ) -> Self {
        board.set_link_indicator(false);
        board.set_relay(true);
        board.set_fault_indicator(false);
        board.print("Running.\n");

        let load_outcome = store.load();
        info!("settings loaded: {load_outcome:?}");

        let timer = RuntimeTimer::arm(store.settings().max_runtime_secs, now_ms, config.indicator);

        Self {
            store,
            channel,
            board,
            timer,
            console: LineAssembler::new(),
            load_outcome,
            link_lit: false,
            restart_pending: false,
        }
    }

    pub fn store(&self) -> &SettingsStore<S> {
        &self.store
    }

    pub fn channel(&self) -> &N {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut N {
        &mut self.channel
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn timer(&self) -> &RuntimeTimer {
        &self.timer
    }

    pub fn load_outcome(&self) -> LoadOutcome {
        self.load_outcome
    }

    pub fn settings_valid(&self) -> bool {
        self.store.is_valid()
    }

    /// Set once a command has asked the board to restart.
    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    /// Session parameters for the current settings, if they are complete.
    pub fn session(&self) -> Option<SessionConfig> {
        self.store
            .is_valid()
            .then(|| SessionConfig::from_settings(self.store.settings()))
    }

    /// Asks the channel to bring the link up for the current settings.
    pub fn connect_link(&mut self) -> bool {
        match self.session() {
            Some(session) => self.channel.ensure_connected(&session),
            None => false,
        }
    }

    /// Publishes the run message. Only done at boot with valid settings and a
    /// live channel.
    pub fn announce_start(&mut self) -> bool {
        if !self.store.is_valid() {
            return false;
        }

        let settings = self.store.settings();
        match send_status(&mut self.channel, settings, &settings.run_message) {
            Ok(()) => true,
            Err(err) => {
                warn!("run message not sent: {err}");
                false
            }
        }
    }

    pub fn receive_console_byte(&mut self, byte: u8) -> Option<CommandOutcome> {
        self.board.echo(byte);
        let line = self.console.push(byte)?;
        Some(self.handle_local_line(&line))
    }

    pub fn handle_local_line(&mut self, line: &str) -> CommandOutcome {
        let outcome = process_command(&mut self.store, line);
        if !outcome.is_success() {
            self.print_settings();
        }
        self.apply_restart(outcome);
        outcome
    }

    /// Runs a payload from the command topic and publishes the response,
    /// not retained, to `<topicRoot><payload>`.
    pub fn handle_remote_command(&mut self, payload: &str) -> Option<CommandOutcome> {
        if self.store.settings().debug {
            info!("remote command {payload:?}");
        }

        let (response, outcome) = if payload == SETTINGS_REQUEST {
            (self.settings_report(), None)
        } else {
            let outcome = process_command(&mut self.store, payload);
            if outcome.is_success() {
                (RESPONSE_OK.to_string(), Some(outcome))
            } else {
                self.print_settings();
                (RESPONSE_REJECTED.to_string(), Some(outcome))
            }
        };

        let response_topic = topic(&self.store.settings().topic_root, payload);
        if let Err(err) = self.channel.publish(&response_topic, &response, false) {
            warn!("failed to publish command response on {response_topic}: {err}");
        }

        if let Some(outcome) = outcome {
            self.apply_restart(outcome);
        }
        outcome
    }

    /// One pass of the main loop after transport input has been drained.
    pub fn tick(&mut self, now_ms: u32) {
        let connected = self.channel.is_connected();
        if connected != self.link_lit {
            self.link_lit = connected;
            self.board.set_link_indicator(connected);
        }

        let valid = self.store.is_valid();
        let diagnostics = valid && self.store.settings().debug;

        for action in self.timer.tick(now_ms, valid, diagnostics) {
            match action {
                TimerAction::RelayOff => {
                    info!("runtime exceeded, relay off");
                    self.board.set_relay(false);
                }
                TimerAction::FaultIndicator(lit) => self.board.set_fault_indicator(lit),
                TimerAction::PublishTimeout => self.publish_timeout(),
                TimerAction::Countdown { remaining_ms } => {
                    self.board.print(&format!("{remaining_ms} ms remaining\n"));
                }
            }
        }
    }

    /// The settings listing followed by the device address.
    pub fn settings_report(&self) -> String {
        let address = self
            .channel
            .local_address()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "(unset)".to_string());
        format!("{}IP Address={address}", settings_dump(self.store.settings()))
    }

    fn print_settings(&mut self) {
        let report = self.settings_report();
        self.board.print(&report);
        self.board.print("\n");
    }

    fn publish_timeout(&mut self) {
        let settings = self.store.settings();
        match send_status(&mut self.channel, settings, &settings.timeout_message) {
            Ok(()) => {
                info!("timeout message sent");
                self.timer.confirm_timeout_sent();
            }
            Err(err) => debug!("timeout message pending: {err}"),
        }
    }

    fn apply_restart(&mut self, outcome: CommandOutcome) {
        if let CommandOutcome::Restart { key, delay_ms } = outcome {
            info!("{} requested restart in {delay_ms} ms", key.as_str());
            self.restart_pending = true;
            self.board.restart(delay_ms);
        }
    }
}
