use core::convert::TryInto;
use std::{
    io::{Read, Write},
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    wifi::EspWifi,
};
use log::{debug, info, warn};

use runlimiter_common::{
    Board, Controller, DeviceConfig, NotificationChannel, NotifyError, SessionConfig,
    SettingsStorage, SettingsStore, StorageError, RECORD_SIZE,
};

const NVS_NAMESPACE: &str = "runlimiter";
const NVS_SETTINGS_KEY: &str = "settings";
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(1);
const LINK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

type Device = Controller<NvsStorage, EspMqttChannel, EspBoard>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = DeviceConfig::default();
    config.sanitize();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let board = EspBoard::new(&config).context("relay gpio setup failed")?;
    let storage = NvsStorage::new(nvs_partition.clone())?;
    let console = spawn_console_reader()?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))
        .context("wifi driver setup failed")?;
    let (commands, remote) = mpsc::channel();

    let mut controller = Controller::new(
        SettingsStore::new(storage),
        EspMqttChannel::new(wifi, commands),
        board,
        &config,
        millis(),
    );

    init_watchdog(config.watchdog_timeout_sec)?;
    add_current_task_to_watchdog()?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    if controller.settings_valid() {
        // first call joins the network, the second starts the broker client
        controller.connect_link();
        if wait_for_wifi(&mut controller, &config, &console) {
            controller.connect_link();
            wait_for_broker(&mut controller, &config, &console);
        }
    } else {
        info!("settings incomplete, staying offline");
    }

    controller.announce_start();

    let tick = Duration::from_millis(config.tick_interval_ms);
    loop {
        feed_watchdog();
        service_console(&mut controller, &console);
        while let Ok(payload) = remote.try_recv() {
            controller.handle_remote_command(&payload);
        }
        controller.tick(millis());
        thread::sleep(tick);
    }
}

fn service_console(controller: &mut Device, console: &mpsc::Receiver<u8>) {
    while let Ok(byte) = console.try_recv() {
        controller.receive_console_byte(byte);
    }
}

fn spawn_console_reader() -> anyhow::Result<mpsc::Receiver<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("console-rx".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0_u8; 64];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => thread::sleep(Duration::from_millis(10)),
                    Ok(len) => {
                        for &byte in &buf[..len] {
                            if tx.send(byte).is_err() {
                                return;
                            }
                        }
                    }
                    Err(_) => thread::sleep(Duration::from_millis(10)),
                }
            }
        })
        .context("failed to spawn console reader thread")?;
    Ok(rx)
}

/// Bounded association wait. The console and the watchdog are serviced
/// between attempts.
fn wait_for_wifi(
    controller: &mut Device,
    config: &DeviceConfig,
    console: &mpsc::Receiver<u8>,
) -> bool {
    let attempts = config.wifi_connect_attempts;
    for attempt in 1..=attempts {
        if controller.channel().station_address().is_some() {
            break;
        }
        if controller.store().settings().debug {
            info!("wifi attempt {attempt}/{attempts}");
        }
        service_console(controller, console);
        feed_watchdog();
        thread::sleep(Duration::from_millis(config.wifi_retry_delay_ms));
    }

    match controller.channel().station_address() {
        Some(ip) => {
            controller.board_mut().print(&format!("{ip}\n"));
            true
        }
        None => {
            warn!("wifi connection unsuccessful after {attempts} attempts");
            false
        }
    }
}

fn wait_for_broker(controller: &mut Device, config: &DeviceConfig, console: &mpsc::Receiver<u8>) {
    for _ in 0..config.wifi_connect_attempts {
        if controller.channel().is_connected() {
            return;
        }
        service_console(controller, console);
        feed_watchdog();
        thread::sleep(Duration::from_millis(config.wifi_retry_delay_ms));
    }
    warn!("mqtt broker not reachable yet, retrying in the background");
}

/// Settings record kept as one NVS blob.
struct NvsStorage {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .context("failed to open settings namespace")?;
        Ok(Self { nvs })
    }
}

impl SettingsStorage for NvsStorage {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let mut buffer = vec![0_u8; RECORD_SIZE];
        match self.nvs.get_raw(NVS_SETTINGS_KEY, &mut buffer) {
            Ok(block) => Ok(block.map(<[u8]>::to_vec)),
            Err(err) => Err(StorageError::Backend(err.to_string())),
        }
    }

    fn write_block(&mut self, block: &[u8]) -> Result<(), StorageError> {
        self.nvs
            .set_raw(NVS_SETTINGS_KEY, block)
            .map(|_| ())
            .map_err(|err| StorageError::Backend(err.to_string()))
    }
}

/// Wi-Fi station plus esp-mqtt client, brought up on demand for the
/// current settings. Remote command payloads are forwarded to `commands`.
struct EspMqttChannel {
    wifi: EspWifi<'static>,
    joined: Option<(String, String)>,
    commands: mpsc::Sender<String>,
    session: Option<SessionConfig>,
    client: Option<Arc<Mutex<EspMqttClient<'static>>>>,
    connected: Arc<AtomicBool>,
    local_address: Option<Ipv4Addr>,
    last_wifi_attempt: Option<Instant>,
    last_client_attempt: Option<Instant>,
}

impl EspMqttChannel {
    fn new(wifi: EspWifi<'static>, commands: mpsc::Sender<String>) -> Self {
        Self {
            wifi,
            joined: None,
            commands,
            session: None,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            local_address: None,
            last_wifi_attempt: None,
            last_client_attempt: None,
        }
    }

    /// Station address once associated and addressed.
    fn station_address(&self) -> Option<Ipv4Addr> {
        if !self.wifi.is_up().unwrap_or(false) {
            return None;
        }
        self.wifi.sta_netif().get_ip_info().ok().map(|info| info.ip)
    }

    fn join_wifi(&mut self, session: &SessionConfig) -> anyhow::Result<()> {
        let auth_method = if session.wifi_password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: session
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: session
                .wifi_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        info!("connecting to ssid `{}`", session.ssid);
        self.wifi.connect()?;
        Ok(())
    }

    fn start_client(&mut self, session: &SessionConfig) -> anyhow::Result<()> {
        // the old receiver thread ends once its client is dropped
        self.client = None;
        self.session = None;

        let (client, conn) = create_mqtt_client(session)?;
        let client = Arc::new(Mutex::new(client));
        let connected = Arc::new(AtomicBool::new(false));
        spawn_mqtt_receiver(
            conn,
            Arc::downgrade(&client),
            session.command_topic.clone(),
            connected.clone(),
            self.commands.clone(),
        )?;

        self.client = Some(client);
        self.connected = connected;
        self.session = Some(session.clone());
        self.local_address = self.station_address();
        Ok(())
    }

    fn kick_wifi(&mut self) {
        if !attempt_due(&mut self.last_wifi_attempt) {
            return;
        }
        if let Err(err) = self.wifi.connect() {
            debug!("wifi reconnect failed: {err}");
        }
    }
}

/// At most one attempt per [`LINK_RETRY_INTERVAL`].
fn attempt_due(last: &mut Option<Instant>) -> bool {
    let now = Instant::now();
    if last.is_some_and(|at| now.duration_since(at) < LINK_RETRY_INTERVAL) {
        return false;
    }
    *last = Some(now);
    true
}

impl NotificationChannel for EspMqttChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn ensure_connected(&mut self, session: &SessionConfig) -> bool {
        if self.is_connected() {
            return true;
        }

        let credentials = (session.ssid.clone(), session.wifi_password.clone());
        if self.joined.as_ref() != Some(&credentials) {
            if attempt_due(&mut self.last_wifi_attempt) {
                match self.join_wifi(session) {
                    Ok(()) => self.joined = Some(credentials),
                    Err(err) => warn!("wifi startup failed: {err:#}"),
                }
            }
            return false;
        }

        if !self.wifi.is_connected().unwrap_or(false) {
            self.kick_wifi();
            return false;
        }

        // an existing client reconnects to the broker on its own
        if self.session.as_ref() != Some(session)
            && self.station_address().is_some()
            && attempt_due(&mut self.last_client_attempt)
        {
            if let Err(err) = self.start_client(session) {
                warn!("mqtt client startup failed: {err:#}");
            }
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

        let mut client = client.lock().unwrap();
        client
            .publish(topic, QoS::AtMostOnce, retain, payload.as_bytes())
            .map(|_| ())
            .map_err(|err| NotifyError::Rejected(err.to_string()))
    }

    fn signal_strength(&self) -> Option<i32> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then(|| i32::from(ap_info.rssi))
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.local_address
    }
}

fn create_mqtt_client(
    session: &SessionConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = session.broker_url();
    let will = &session.last_will;

    let conf = MqttClientConfiguration {
        client_id: Some(session.client_id.as_str()),
        username: session.credentials.as_ref().map(|(user, _)| user.as_str()),
        password: session.credentials.as_ref().map(|(_, pass)| pass.as_str()),
        lwt: Some(LwtConfiguration {
            topic: will.topic.as_str(),
            payload: will.message.as_bytes(),
            qos: QoS::AtMostOnce,
            retain: will.retain,
        }),
        ..Default::default()
    };

    info!("mqtt client `{}` connecting to {url}", session.client_id);
    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    client: Weak<Mutex<EspMqttClient<'static>>>,
    command_topic: String,
    connected: Arc<AtomicBool>,
    commands: mpsc::Sender<String>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        connected.store(true, Ordering::Relaxed);
                        let Some(client) = client.upgrade() else {
                            break;
                        };
                        let result = client
                            .lock()
                            .unwrap()
                            .subscribe(&command_topic, QoS::AtMostOnce);
                        if let Err(err) = result {
                            warn!("subscribe to {command_topic} failed: {err:?}");
                        }
                    }
                    EventPayload::Disconnected => {
                        connected.store(false, Ordering::Relaxed);
                        warn!("mqtt disconnected");
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } if topic == command_topic => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!("dropping oversized command ({} bytes)", data.len());
                            continue;
                        }
                        let payload = String::from_utf8_lossy(data).into_owned();
                        if commands.send(payload).is_err() {
                            break;
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    if client.upgrade().is_none() {
                        debug!("mqtt connection closed: {err:?}");
                        break;
                    }
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(MQTT_RETRY_DELAY);
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

struct EspBoard {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    fault_led: Option<PinDriver<'static, AnyOutputPin, Output>>,
    link_led: Option<PinDriver<'static, AnyOutputPin, Output>>,
    leds_active_low: bool,
}

impl EspBoard {
    fn new(config: &DeviceConfig) -> anyhow::Result<Self> {
        let relay = unsafe { PinDriver::output(AnyOutputPin::new(config.relay_pin)) }
            .with_context(|| format!("relay unavailable on GPIO{}", config.relay_pin))?;

        Ok(Self {
            relay,
            fault_led: init_led(config.fault_led_pin),
            link_led: init_led(config.link_led_pin),
            leds_active_low: config.leds_active_low,
        })
    }

    fn write_console(bytes: &[u8]) {
        let mut stdout = std::io::stdout();
        if let Err(err) = stdout.write_all(bytes).and_then(|()| stdout.flush()) {
            debug!("console write failed: {err}");
        }
    }
}

fn init_led(pin: i32) -> Option<PinDriver<'static, AnyOutputPin, Output>> {
    match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
        Ok(driver) => Some(driver),
        Err(err) => {
            warn!("LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn drive_led(led: &mut Option<PinDriver<'static, AnyOutputPin, Output>>, high: bool) {
    let Some(led) = led.as_mut() else {
        return;
    };
    let result = if high { led.set_high() } else { led.set_low() };
    if let Err(err) = result {
        warn!("failed to drive LED: {err}");
    }
}

impl Board for EspBoard {
    fn set_relay(&mut self, energized: bool) {
        let result = if energized {
            self.relay.set_high()
        } else {
            self.relay.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive relay: {err}");
        }
    }

    fn set_fault_indicator(&mut self, lit: bool) {
        drive_led(&mut self.fault_led, lit != self.leds_active_low);
    }

    fn set_link_indicator(&mut self, lit: bool) {
        drive_led(&mut self.link_led, lit != self.leds_active_low);
    }

    fn echo(&mut self, byte: u8) {
        Self::write_console(&[byte]);
    }

    fn print(&mut self, text: &str) {
        Self::write_console(text.as_bytes());
    }

    fn restart(&mut self, delay_ms: u64) {
        info!("restarting in {delay_ms} ms");
        thread::sleep(Duration::from_millis(delay_ms));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

/// 32-bit millisecond clock since boot; wraps after ~49 days.
fn millis() -> u32 {
    let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    (micros / 1_000) as u32
}
