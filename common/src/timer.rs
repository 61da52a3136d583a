use log::info;

use crate::config::IndicatorMode;

/// Interval between countdown diagnostics.
pub const REPORT_INTERVAL_MS: u64 = 5_000;
/// Half period of the flashing fault indicator.
pub const FLASH_INTERVAL_MS: u64 = 250;
/// A remaining time above this on the 32-bit clock is taken as a wrap.
pub const WRAP_SENTINEL_MS: u32 = 4_294_900_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    RelayOff,
    FaultIndicator(bool),
    /// Try to publish the timeout message. Repeats every tick until
    /// [`RuntimeTimer::confirm_timeout_sent`] is called.
    PublishTimeout,
    Countdown { remaining_ms: u32 },
}

/// Tracks powered-on time against the configured maximum.
///
/// Time comes in as a free-running 32-bit millisecond clock that may wrap.
/// Elapsed time is accumulated from wrapping deltas, so a wrap never re-arms
/// the relay. Once timed out the timer stays there until it is re-armed at
/// the next boot.
#[derive(Debug, Clone)]
pub struct RuntimeTimer {
    threshold_ms: u64,
    indicator: IndicatorMode,
    state: RunState,
    armed_at_ms: u32,
    last_now_ms: u32,
    elapsed_ms: u64,
    timeout_sent: bool,
    indicator_lit: bool,
    last_flash_ms: u64,
    next_report_ms: u64,
}

impl RuntimeTimer {
    pub fn arm(max_runtime_secs: u32, now_ms: u32, indicator: IndicatorMode) -> Self {
        let threshold_ms = u64::from(max_runtime_secs) * 1_000;
        info!("runtime limit armed at {threshold_ms} ms");

        Self {
            threshold_ms,
            indicator,
            state: RunState::Running,
            armed_at_ms: now_ms,
            last_now_ms: now_ms,
            elapsed_ms: 0,
            timeout_sent: false,
            indicator_lit: false,
            last_flash_ms: 0,
            next_report_ms: REPORT_INTERVAL_MS,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_timed_out(&self) -> bool {
        self.state == RunState::TimedOut
    }

    pub fn timeout_sent(&self) -> bool {
        self.timeout_sent
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn threshold_ms(&self) -> u64 {
        self.threshold_ms
    }

    /// Latches the timeout notification; no further publish is requested.
    /// A flashing indicator starts toggling from here.
    pub fn confirm_timeout_sent(&mut self) {
        self.timeout_sent = true;
        self.last_flash_ms = self.elapsed_ms;
    }

    /// Advances the timer to `now_ms`.
    ///
    /// `notify_enabled` gates timeout publishing (settings valid).
    /// `diagnostics` gates the countdown report (debug on and settings valid).
    pub fn tick(&mut self, now_ms: u32, notify_enabled: bool, diagnostics: bool) -> Vec<TimerAction> {
        let delta = now_ms.wrapping_sub(self.last_now_ms);
        self.last_now_ms = now_ms;
        self.elapsed_ms += u64::from(delta);

        let mut actions = Vec::new();

        if self.state == RunState::Running {
            if diagnostics && !self.timeout_sent {
                self.report_countdown(now_ms, &mut actions);
            }

            if self.elapsed_ms >= self.threshold_ms {
                info!("runtime limit of {} ms exceeded", self.threshold_ms);
                self.state = RunState::TimedOut;
                self.indicator_lit = true;
                self.last_flash_ms = self.elapsed_ms;
                actions.push(TimerAction::RelayOff);
                actions.push(TimerAction::FaultIndicator(true));
            }
        } else if self.indicator == IndicatorMode::Flashing
            && self.timeout_sent
            && self.elapsed_ms - self.last_flash_ms >= FLASH_INTERVAL_MS
        {
            self.indicator_lit = !self.indicator_lit;
            self.last_flash_ms = self.elapsed_ms;
            actions.push(TimerAction::FaultIndicator(self.indicator_lit));
        }

        if self.state == RunState::TimedOut && !self.timeout_sent && notify_enabled {
            actions.push(TimerAction::PublishTimeout);
        }

        actions
    }

    fn report_countdown(&mut self, now_ms: u32, actions: &mut Vec<TimerAction>) {
        if self.elapsed_ms < self.next_report_ms {
            return;
        }
        self.next_report_ms = (self.elapsed_ms / REPORT_INTERVAL_MS + 1) * REPORT_INTERVAL_MS;

        // deadline on the wrapping clock; a limit beyond 2^32 ms truncates
        let deadline = self.armed_at_ms.wrapping_add(self.threshold_ms as u32);
        let remaining_ms = deadline.wrapping_sub(now_ms);
        if remaining_ms > WRAP_SENTINEL_MS {
            return;
        }
        actions.push(TimerAction::Countdown { remaining_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn countdowns(actions: &[TimerAction]) -> Vec<u32> {
        actions
            .iter()
            .filter_map(|action| match action {
                TimerAction::Countdown { remaining_ms } => Some(*remaining_ms),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn stays_running_below_threshold() {
        let mut timer = RuntimeTimer::arm(1, 0, IndicatorMode::Steady);

        for now in [0, 10, 500, 999] {
            assert!(timer.tick(now, true, false).is_empty());
        }
        assert_eq!(timer.state(), RunState::Running);
    }

    #[test]
    fn times_out_once_and_publishes_until_confirmed() {
        let mut timer = RuntimeTimer::arm(1, 0, IndicatorMode::Steady);
        timer.tick(500, true, false);

        assert_eq!(
            timer.tick(1_000, true, false),
            vec![
                TimerAction::RelayOff,
                TimerAction::FaultIndicator(true),
                TimerAction::PublishTimeout,
            ]
        );
        assert!(timer.is_timed_out());

        // publish failed, retried on the next tick without repeating the relay action
        assert_eq!(timer.tick(1_010, true, false), vec![TimerAction::PublishTimeout]);
        assert_eq!(timer.tick(1_020, true, false), vec![TimerAction::PublishTimeout]);

        timer.confirm_timeout_sent();
        for now in [1_030, 5_000, 60_000] {
            assert!(timer.tick(now, true, false).is_empty());
        }
        assert!(timer.is_timed_out());
    }

    #[test]
    fn no_publish_when_notifications_disabled() {
        let mut timer = RuntimeTimer::arm(1, 0, IndicatorMode::Steady);

        assert_eq!(
            timer.tick(2_000, false, false),
            vec![TimerAction::RelayOff, TimerAction::FaultIndicator(true)]
        );
        assert!(timer.tick(2_010, false, false).is_empty());

        // channel became usable later
        assert_eq!(timer.tick(2_020, true, false), vec![TimerAction::PublishTimeout]);
    }

    #[test]
    fn clock_wrap_does_not_rearm_or_trip_early() {
        let start = u32::MAX - 200;
        let mut timer = RuntimeTimer::arm(1, start, IndicatorMode::Steady);

        assert!(timer.tick(u32::MAX, true, false).is_empty());
        assert!(timer.tick(300, true, false).is_empty());
        assert_eq!(timer.elapsed_ms(), 501);

        let actions = timer.tick(799, true, false);
        assert_eq!(actions[0], TimerAction::RelayOff);
        assert!(timer.is_timed_out());
    }

    #[test]
    fn flashing_indicator_toggles_every_quarter_second() {
        let mut timer = RuntimeTimer::arm(1, 0, IndicatorMode::Flashing);
        timer.tick(1_000, true, false);
        timer.confirm_timeout_sent();

        assert!(timer.tick(1_100, true, false).is_empty());
        assert_eq!(timer.tick(1_250, true, false), vec![TimerAction::FaultIndicator(false)]);
        assert!(timer.tick(1_400, true, false).is_empty());
        assert_eq!(timer.tick(1_500, true, false), vec![TimerAction::FaultIndicator(true)]);
        assert_eq!(timer.tick(1_760, true, false), vec![TimerAction::FaultIndicator(false)]);
    }

    #[test]
    fn flashing_waits_for_timeout_delivery() {
        let mut timer = RuntimeTimer::arm(1, 0, IndicatorMode::Flashing);
        timer.tick(1_000, true, false);

        // undelivered: steady on, publish retried
        assert_eq!(timer.tick(1_300, true, false), vec![TimerAction::PublishTimeout]);
        assert_eq!(timer.tick(2_000, true, false), vec![TimerAction::PublishTimeout]);

        timer.confirm_timeout_sent();
        assert!(timer.tick(2_100, true, false).is_empty());
        assert_eq!(timer.tick(2_250, true, false), vec![TimerAction::FaultIndicator(false)]);
    }

    #[test]
    fn flashing_stays_steady_without_notifications() {
        let mut timer = RuntimeTimer::arm(1, 0, IndicatorMode::Flashing);
        timer.tick(1_000, false, false);

        for now in (1_250..5_000).step_by(250) {
            assert!(timer.tick(now, false, false).is_empty());
        }
    }

    #[test]
    fn steady_indicator_never_toggles() {
        let mut timer = RuntimeTimer::arm(1, 0, IndicatorMode::Steady);
        timer.tick(1_000, false, false);

        for now in (1_250..5_000).step_by(250) {
            assert!(timer.tick(now, false, false).is_empty());
        }
    }

    #[test]
    fn countdown_reported_every_five_seconds() {
        let mut timer = RuntimeTimer::arm(30, 0, IndicatorMode::Steady);
        let mut reported = Vec::new();

        for now in (0..=16_000).step_by(10) {
            reported.extend(countdowns(&timer.tick(now, true, true)));
        }

        assert_eq!(reported, vec![25_000, 20_000, 15_000]);
    }

    #[test]
    fn countdown_silent_without_diagnostics() {
        let mut timer = RuntimeTimer::arm(30, 0, IndicatorMode::Steady);

        for now in (0..=16_000).step_by(100) {
            assert!(countdowns(&timer.tick(now, true, false)).is_empty());
        }
    }

    #[test]
    fn implausible_remaining_time_is_suppressed() {
        // limit beyond the 32-bit clock range truncates the diagnostic deadline
        let mut timer = RuntimeTimer::arm(4_294_968, 0, IndicatorMode::Steady);

        let actions = timer.tick(5_000, true, true);
        assert!(countdowns(&actions).is_empty());
        assert_eq!(timer.state(), RunState::Running);

        let actions = timer.tick(9_000, true, true);
        assert!(actions.is_empty());
    }
}
