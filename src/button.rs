//! Button state machine.
//!
//! A single active-low input gates mode changes, BLE re-enable, emergency
//! shutdown, and factory reset. The FSM is sampled: the highest-priority
//! task polls it with the debounced-raw level and the current time, and
//! routes the returned events to the motor and BLE tasks.
//!
//! While the FSM reports [`ButtonState::Countdown`], the caller must keep
//! feeding the watchdog (countdown blocks the task's normal feed points)
//! and should run the purple [`StatusPattern::Countdown`] indication.
//!
//! [`StatusPattern::Countdown`]: crate::actuator::StatusPattern::Countdown

use crate::time::{Duration, Instant};

/// Debounce interval for the raw level.
pub const DEBOUNCE: Duration = Duration::from_millis(50);

/// Releases shorter than this cycle the stimulation mode.
pub const SHORT_PRESS_MAX: Duration = Duration::from_secs(1);

/// Releases between [`SHORT_PRESS_MAX`] and this re-enable BLE.
pub const REENABLE_MAX: Duration = Duration::from_secs(2);

/// Holding this long arms the shutdown countdown.
pub const SHUTDOWN_HOLD: Duration = Duration::from_secs(5);

/// Holding this long (early after boot) wipes NVS.
pub const FACTORY_HOLD: Duration = Duration::from_secs(15);

/// Factory reset is only armed during this window after boot.
pub const FACTORY_WINDOW: Duration = Duration::from_secs(30);

/// Number of countdown blinks before shutdown fires.
pub const COUNTDOWN_BLINKS: u32 = 5;

/// Length of one countdown blink period.
pub const COUNTDOWN_BLINK: Duration = Duration::from_millis(200);

/// Total countdown duration (5 × 200 ms).
pub const COUNTDOWN_TOTAL: Duration = Duration::from_millis(1_000);

/// Observable FSM state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ButtonState {
    Idle,
    Debounce,
    Pressed,
    /// Held past the re-enable window; release does nothing.
    HoldDetect,
    /// Held past the shutdown threshold; release starts the countdown.
    ShutdownHold,
    Countdown,
    /// Countdown completed; the shutdown event is being emitted.
    Shutdown,
    /// Terminal.
    ShutdownSent,
}

/// Events produced by the FSM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ButtonEvent {
    /// Short press: cycle the stimulation mode (to the motor task).
    ModeChange,
    /// Medium press: bring BLE back up (to the BLE task).
    BleReEnable,
    /// Countdown ran to completion (to the motor *and* BLE tasks).
    EmergencyShutdown,
    /// Very long hold right after boot: wipe NVS.
    FactoryReset,
    /// The abortable countdown began.
    CountdownStarted,
    /// A press aborted the countdown.
    CountdownAborted,
}

enum State {
    Idle,
    Debounce { since: Instant },
    Pressed { since: Instant },
    HoldDetect { since: Instant },
    ShutdownHold { since: Instant },
    Countdown { started: Instant },
    Shutdown,
    ShutdownSent,
}

/// The button FSM. See the module docs.
pub struct ButtonFsm {
    state: State,
    boot_time: Instant,
}

impl ButtonFsm {
    /// Creates the FSM; `boot_time` anchors the factory-reset window.
    pub const fn new(boot_time: Instant) -> Self {
        ButtonFsm {
            state: State::Idle,
            boot_time,
        }
    }

    pub fn state(&self) -> ButtonState {
        match self.state {
            State::Idle => ButtonState::Idle,
            State::Debounce { .. } => ButtonState::Debounce,
            State::Pressed { .. } => ButtonState::Pressed,
            State::HoldDetect { .. } => ButtonState::HoldDetect,
            State::ShutdownHold { .. } => ButtonState::ShutdownHold,
            State::Countdown { .. } => ButtonState::Countdown,
            State::Shutdown => ButtonState::Shutdown,
            State::ShutdownSent => ButtonState::ShutdownSent,
        }
    }

    /// Which countdown blink is active, while counting down.
    pub fn countdown_blink(&self, now: Instant) -> Option<u32> {
        match self.state {
            State::Countdown { started } => {
                let n =
                    now.saturating_duration_since(started).whole_millis()
                        / COUNTDOWN_BLINK.whole_millis();
                Some((n as u32).min(COUNTDOWN_BLINKS - 1))
            }
            _ => None,
        }
    }

    /// Samples the FSM with the current (active-high = pressed) level.
    ///
    /// Returns at most one event; poll at a few-millisecond cadence.
    pub fn poll(&mut self, now: Instant, pressed: bool) -> Option<ButtonEvent> {
        match self.state {
            State::Idle => {
                if pressed {
                    self.state = State::Debounce { since: now };
                }
                None
            }
            State::Debounce { since } => {
                if !pressed {
                    self.state = State::Idle;
                } else if now.saturating_duration_since(since) >= DEBOUNCE {
                    self.state = State::Pressed { since };
                }
                None
            }
            State::Pressed { since } => {
                let held = now.saturating_duration_since(since);
                if !pressed {
                    self.state = State::Idle;
                    return Some(if held < SHORT_PRESS_MAX {
                        ButtonEvent::ModeChange
                    } else {
                        ButtonEvent::BleReEnable
                    });
                }
                if held >= REENABLE_MAX {
                    self.state = State::HoldDetect { since };
                }
                None
            }
            State::HoldDetect { since } => {
                if !pressed {
                    // 2–5 s holds are a dead zone.
                    self.state = State::Idle;
                } else if now.saturating_duration_since(since) >= SHUTDOWN_HOLD {
                    debug!("shutdown hold armed");
                    self.state = State::ShutdownHold { since };
                }
                None
            }
            State::ShutdownHold { since } => {
                if !pressed {
                    self.state = State::Countdown { started: now };
                    return Some(ButtonEvent::CountdownStarted);
                }
                let held = now.saturating_duration_since(since);
                let early_boot =
                    now.saturating_duration_since(self.boot_time) <= FACTORY_WINDOW;
                if held >= FACTORY_HOLD && early_boot {
                    warn!("factory reset hold");
                    self.state = State::Idle;
                    return Some(ButtonEvent::FactoryReset);
                }
                None
            }
            State::Countdown { started } => {
                if pressed {
                    info!("countdown aborted");
                    self.state = State::Idle;
                    return Some(ButtonEvent::CountdownAborted);
                }
                if now.saturating_duration_since(started) >= COUNTDOWN_TOTAL {
                    warn!("countdown complete, shutting down");
                    self.state = State::Shutdown;
                    return Some(ButtonEvent::EmergencyShutdown);
                }
                None
            }
            State::Shutdown => {
                self.state = State::ShutdownSent;
                None
            }
            State::ShutdownSent => None,
        }
    }
}
