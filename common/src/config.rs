use serde::{Deserialize, Serialize};

/// How the fault indicator behaves once the runtime limit is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorMode {
    Steady,
    Flashing,
}

impl Default for IndicatorMode {
    fn default() -> Self {
        if cfg!(feature = "steady-indicator") {
            Self::Steady
        } else {
            Self::Flashing
        }
    }
}

/// Board wiring and timing knobs. User settings live in the persisted record,
/// not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub indicator: IndicatorMode,
    pub relay_pin: i32,
    pub fault_led_pin: i32,
    pub link_led_pin: i32,
    pub leds_active_low: bool,
    pub wifi_connect_attempts: u32,
    pub wifi_retry_delay_ms: u64,
    pub tick_interval_ms: u64,
    pub watchdog_timeout_sec: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            indicator: IndicatorMode::default(),
            relay_pin: 5,
            fault_led_pin: 4,
            link_led_pin: 2,
            leds_active_low: true,
            wifi_connect_attempts: 15,
            wifi_retry_delay_ms: 500,
            tick_interval_ms: 10,
            watchdog_timeout_sec: 30,
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        for (pin, fallback) in [
            (&mut self.relay_pin, defaults.relay_pin),
            (&mut self.fault_led_pin, defaults.fault_led_pin),
            (&mut self.link_led_pin, defaults.link_led_pin),
        ] {
            if *pin < 0 {
                *pin = fallback;
            }
        }

        if self.wifi_connect_attempts == 0 {
            self.wifi_connect_attempts = defaults.wifi_connect_attempts;
        }
        self.wifi_retry_delay_ms = self.wifi_retry_delay_ms.clamp(50, 10_000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 250);
        self.watchdog_timeout_sec = self.watchdog_timeout_sec.clamp(5, 120);
    }
}
