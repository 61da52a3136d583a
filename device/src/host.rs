use std::{
    io::{ErrorKind, Write},
    net::{IpAddr, Ipv4Addr, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::{io::AsyncReadExt, sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use runlimiter_common::{
    Board, Controller, DeviceConfig, NotificationChannel, NotifyError, SessionConfig,
    SettingsStorage, SettingsStore, StorageError,
};

const SETTINGS_FILE: &str = "settings.bin";
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(1);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const DEFAULT_LOG_FILTER: &str = "info";

enum SessionEnd {
    Restart,
    Shutdown,
}

pub async fn run() -> anyhow::Result<()> {
    let directives = log_directives(std::env::var(EnvFilter::DEFAULT_ENV).ok());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .init();

    let config = load_device_config();

    let data_dir = std::env::var("RUNLIMITER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.runlimiter"));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let mut console = spawn_console_reader();

    loop {
        match run_session(&config, &data_dir, &mut console).await {
            SessionEnd::Restart => info!("restarting"),
            SessionEnd::Shutdown => return Ok(()),
        }
    }
}

/// `RUST_LOG` when set, otherwise `info` so debug-mode diagnostics show.
fn log_directives(env: Option<String>) -> String {
    env.filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// One power cycle: boot, bounded broker wait, then the poll loop until a
/// restart is requested or the process is interrupted.
async fn run_session(
    config: &DeviceConfig,
    data_dir: &Path,
    console: &mut mpsc::Receiver<u8>,
) -> SessionEnd {
    let storage = FileStorage::new(data_dir.join(SETTINGS_FILE));
    let (commands, mut remote) = mpsc::channel(16);
    let mut controller = Controller::new(
        SettingsStore::new(storage),
        MqttChannel::new(commands),
        HostBoard::default(),
        config,
        millis(),
    );

    if controller.settings_valid() {
        controller.connect_link();
        wait_for_link(&mut controller, config, console).await;
    } else {
        info!("settings incomplete, staying offline");
    }

    controller.announce_start();

    let mut tick = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => controller.tick(millis()),
            Some(byte) = console.recv() => {
                controller.receive_console_byte(byte);
            }
            Some(payload) = remote.recv() => {
                controller.handle_remote_command(&payload);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                controller.channel_mut().shutdown();
                return SessionEnd::Shutdown;
            }
        }

        if let Some(delay_ms) = controller.board().restart_delay_ms {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            controller.channel_mut().shutdown();
            return SessionEnd::Restart;
        }
    }
}

/// Gives the broker session a bounded number of attempts to come up,
/// servicing the console in between.
async fn wait_for_link(
    controller: &mut Controller<FileStorage, MqttChannel, HostBoard>,
    config: &DeviceConfig,
    console: &mut mpsc::Receiver<u8>,
) -> bool {
    for attempt in 1..=config.wifi_connect_attempts {
        if controller.channel().is_connected() {
            break;
        }
        if controller.store().settings().debug {
            info!(attempt, "waiting for mqtt session");
        }

        let delay = tokio::time::sleep(Duration::from_millis(config.wifi_retry_delay_ms));
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                Some(byte) = console.recv() => {
                    controller.receive_console_byte(byte);
                }
            }
        }
    }

    let connected = controller.channel().is_connected();
    if connected {
        let address = controller
            .channel()
            .local_address()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "(unset)".to_string());
        controller.board_mut().print(&format!("{address}\n"));
    } else {
        warn!("mqtt connection unsuccessful, continuing without it");
    }
    connected
}

fn spawn_console_reader() -> mpsc::Receiver<u8> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0_u8; 64];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(len) => {
                    for &byte in &buf[..len] {
                        if tx.send(byte).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!("console read failed: {err}");
                    break;
                }
            }
        }
        debug!("console closed");
    });
    rx
}

fn load_device_config() -> DeviceConfig {
    let mut config = match std::env::var("RUNLIMITER_DEVICE_CONFIG") {
        Ok(path) => read_device_config(Path::new(&path)).unwrap_or_else(|err| {
            warn!("failed to load device config: {err:#}");
            DeviceConfig::default()
        }),
        Err(_) => DeviceConfig::default(),
    };
    config.sanitize();
    config
}

fn read_device_config(path: &Path) -> anyhow::Result<DeviceConfig> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Settings block kept as a file holding the record at offset 0.
struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SettingsStorage for FileStorage {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_block(&mut self, block: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, block)?;
        Ok(())
    }
}

/// rumqttc session, opened on demand for the current settings. Remote
/// command payloads are forwarded to `commands`.
struct MqttChannel {
    commands: mpsc::Sender<String>,
    session: Option<SessionConfig>,
    client: Option<AsyncClient>,
    event_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    local_address: Option<Ipv4Addr>,
}

impl MqttChannel {
    fn new(commands: mpsc::Sender<String>) -> Self {
        Self {
            commands,
            session: None,
            client: None,
            event_task: None,
            connected: Arc::new(AtomicBool::new(false)),
            local_address: None,
        }
    }

    fn connect(&mut self, session: &SessionConfig) {
        self.shutdown();
        info!(
            broker = %session.broker_url(),
            client_id = %session.client_id,
            "connecting to mqtt broker"
        );

        let mut options =
            MqttOptions::new(session.client_id.clone(), session.host.clone(), session.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        if let Some((user, pass)) = &session.credentials {
            options.set_credentials(user.clone(), pass.clone());
        }
        let will = &session.last_will;
        options.set_last_will(rumqttc::LastWill::new(
            will.topic.clone(),
            will.message.clone(),
            QoS::AtMostOnce,
            will.retain,
        ));

        let (client, eventloop) = AsyncClient::new(options, 64);
        self.connected = Arc::new(AtomicBool::new(false));
        self.event_task = Some(tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            session.command_topic.clone(),
            self.connected.clone(),
            self.commands.clone(),
        )));
        self.client = Some(client);
        self.session = Some(session.clone());
        self.local_address = probe_local_address(&session.host, session.port);
    }

    fn shutdown(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(err) = client.try_disconnect() {
                debug!("mqtt disconnect failed: {err}");
            }
        }
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.session = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl NotificationChannel for MqttChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn ensure_connected(&mut self, session: &SessionConfig) -> bool {
        if self.is_connected() {
            return true;
        }
        // an open session keeps retrying in its event loop
        if self.session.as_ref() != Some(session) {
            self.connect(session);
        }
        false
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), NotifyError> {
        let Some(client) = &self.client else {
            return Err(NotifyError::Disconnected);
        };
        if !self.is_connected() {
            return Err(NotifyError::Disconnected);
        }
        client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.as_bytes().to_vec())
            .map_err(|err| NotifyError::Rejected(err.to_string()))
    }

    fn signal_strength(&self) -> Option<i32> {
        None
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.local_address
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    command_topic: String,
    connected: Arc<AtomicBool>,
    commands: mpsc::Sender<String>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
                connected.store(true, Ordering::Relaxed);
                if let Err(err) = client.try_subscribe(command_topic.as_str(), QoS::AtMostOnce) {
                    warn!("subscribe to {command_topic} failed: {err}");
                }
            }
            Ok(Event::Incoming(Incoming::Publish(message))) if message.topic == command_topic => {
                let payload = String::from_utf8_lossy(&message.payload).into_owned();
                if commands.send(payload).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                connected.store(false, Ordering::Relaxed);
                warn!("mqtt poll error: {err}");
                tokio::time::sleep(MQTT_RETRY_DELAY).await;
            }
        }
    }
}

/// Address of the interface that routes to the broker.
fn probe_local_address(host: &str, port: u16) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((host, port)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

/// Relay and LEDs are simulated as log lines; console text goes to stdout.
#[derive(Default)]
struct HostBoard {
    restart_delay_ms: Option<u64>,
}

impl HostBoard {
    fn write_stdout(bytes: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        if let Err(err) = stdout.write_all(bytes).and_then(|()| stdout.flush()) {
            debug!("console write failed: {err}");
        }
    }
}

impl Board for HostBoard {
    fn set_relay(&mut self, energized: bool) {
        info!(energized, "relay");
    }

    fn set_fault_indicator(&mut self, lit: bool) {
        debug!(lit, "fault indicator");
    }

    fn set_link_indicator(&mut self, lit: bool) {
        info!(lit, "link indicator");
    }

    fn echo(&mut self, byte: u8) {
        Self::write_stdout(&[byte]);
    }

    fn print(&mut self, text: &str) {
        Self::write_stdout(text.as_bytes());
    }

    fn restart(&mut self, delay_ms: u64) {
        self.restart_delay_ms = Some(delay_ms);
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// 32-bit millisecond clock; wraps like the device's.
fn millis() -> u32 {
    monotonic_ms() as u32
}

#[cfg(test)]
mod tests {
    use runlimiter_common::{IndicatorMode, Settings, RECORD_SIZE};

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("runlimiter-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn log_filter_defaults_to_info() {
        assert_eq!(log_directives(None), "info");
        assert_eq!(log_directives(Some("  ".to_string())), "info");
        assert_eq!(log_directives(Some("runlimiter=debug".to_string())), "runlimiter=debug");
    }

    #[test]
    fn file_storage_reports_missing_block() {
        let mut storage = FileStorage::new(scratch_dir("missing").join(SETTINGS_FILE));
        assert!(storage.read_block().unwrap().is_none());
    }

    #[test]
    fn file_storage_round_trips_record() {
        let dir = scratch_dir("roundtrip");
        let mut storage = FileStorage::new(dir.join(SETTINGS_FILE));
        let block = Settings::default().encode();

        storage.write_block(&block).unwrap();

        assert_eq!(storage.read_block().unwrap(), Some(block));
        assert_eq!(std::fs::metadata(dir.join(SETTINGS_FILE)).unwrap().len(), RECORD_SIZE as u64);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn device_config_file_is_parsed() {
        let dir = scratch_dir("config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("device.json");
        std::fs::write(&path, r#"{ "indicator": "steady", "tick_interval_ms": 20 }"#).unwrap();

        let config = read_device_config(&path).unwrap();

        assert_eq!(config.indicator, IndicatorMode::Steady);
        assert_eq!(config.tick_interval_ms, 20);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_device_config_is_an_error() {
        let dir = scratch_dir("badconfig");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("device.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(read_device_config(&path).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn channel_without_session_refuses_publish() {
        let (commands, _remote) = mpsc::channel(1);
        let mut channel = MqttChannel::new(commands);

        assert!(!channel.is_connected());
        assert_eq!(
            channel.publish("pump/status", "started", true),
            Err(NotifyError::Disconnected)
        );
    }

    #[tokio::test]
    async fn settings_entered_after_boot_open_session_for_timeout() {
        let dir = scratch_dir("live");
        let (commands, _remote) = mpsc::channel(16);
        let mut controller = Controller::new(
            SettingsStore::new(FileStorage::new(dir.join(SETTINGS_FILE))),
            MqttChannel::new(commands),
            HostBoard::default(),
            &DeviceConfig::default(),
            0,
        );
        assert!(!controller.settings_valid());
        assert!(controller.channel().client.is_none());

        for line in [
            "ssid=workshop\n",
            "wifipass=hunter22\n",
            "broker=127.0.0.1\n",
            "maxRuntime=1\n",
        ] {
            controller.handle_local_line(line);
        }
        assert!(controller.settings_valid());

        // armed at boot with the default 300 s
        for now in (0..=300_500).step_by(500) {
            controller.tick(now);
        }

        assert!(controller.timer().is_timed_out());
        assert!(controller.channel().client.is_some());
        let session = controller.channel().session.clone().unwrap();
        assert_eq!(session.host, "127.0.0.1");
        assert_eq!(session.ssid, "workshop");

        // later ticks with the same settings keep the open session
        controller.tick(301_000);
        assert_eq!(controller.channel().session.as_ref(), Some(&session));

        controller.channel_mut().shutdown();
        let _ = std::fs::remove_dir_all(dir);
    }
}
