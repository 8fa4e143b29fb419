//! BLE task state machine.
//!
//! The NimBLE host, the GATT profile, and the GAP callbacks live in the
//! platform layer; this FSM owns the *policy*: when to advertise and for
//! how long, the pairing timeout, the emergency teardown order, and the
//! settle window after a disconnect.
//!
//! The platform feeds [`BleInput`]s in and executes the returned
//! [`BleAction`]s; [`BleTask::poll`] advances the timers.

use crate::addr::DeviceId;
use crate::kdf::Ltk;
use crate::time::{Duration, Instant};

/// Advertising gives up after this long without a connection.
pub const ADV_TIMEOUT: Duration = Duration::from_secs(300);

/// Pairing must complete within this long after the link comes up.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait after a disconnect for the lower layer's automatic advertising
/// restart before deciding between `Advertising` and `Idle`.
pub const DISCONNECT_SETTLE: Duration = Duration::from_millis(150);

/// BLE task lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BleTaskState {
    Idle,
    Advertising,
    Pairing,
    Connected,
    /// Terminal; entered on emergency shutdown.
    Shutdown,
}

/// Inputs from the button task and the platform's GAP callbacks.
#[derive(Debug, Clone)]
pub enum BleInput {
    /// Button asked for BLE to come back up.
    ReEnable,
    /// Button-initiated emergency shutdown.
    EmergencyShutdown,
    /// A peer device connected (pairing starts now).
    PeerConnected,
    PeerDisconnected,
    /// Security manager finished; the LTK and peer identity are known.
    PairingComplete {
        ltk: Ltk,
        peer: DeviceId,
        /// Whether we started advertising before the peer did; decides the
        /// server role.
        advertised_first: bool,
    },
    PairingFailed,
    /// The mobile app connected; the advertising timeout is suspended.
    AppConnected,
    AppDisconnected,
    /// The lower layer restarted advertising on its own after a
    /// disconnect.
    AdvRestartObserved,
}

/// Actions for the platform layer and downstream tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum BleAction {
    StartAdvertising,
    StopAdvertising,
    /// Cleanly terminate peer and app GAP connections (shutdown path).
    TerminateConnections,
    /// Tear the whole BLE stack down. Issued on a client once the
    /// low-latency link is bootstrapped, so BLE stops contending for the
    /// radio.
    DisableStack,
    /// Forward pairing results to the motor/pattern task.
    NotifyPairingComplete {
        ltk: Ltk,
        peer: DeviceId,
        advertised_first: bool,
    },
    NotifyPairingFailed,
}

/// The BLE task FSM. See the module docs.
pub struct BleTask {
    state: BleTaskState,
    /// Remaining advertising budget; counted down only while not suspended.
    adv_budget: Duration,
    /// When the budget last started draining; `None` while suspended.
    adv_resumed_at: Option<Instant>,
    pairing_deadline: Option<Instant>,
    settle_until: Option<Instant>,
    adv_restart_seen: bool,
}

impl Default for BleTask {
    fn default() -> Self {
        Self::new()
    }
}

impl BleTask {
    pub const fn new() -> Self {
        BleTask {
            state: BleTaskState::Idle,
            adv_budget: Duration::ZERO,
            adv_resumed_at: None,
            pairing_deadline: None,
            settle_until: None,
            adv_restart_seen: false,
        }
    }

    pub fn state(&self) -> BleTaskState {
        self.state
    }

    fn start_advertising(&mut self, now: Instant) -> Option<BleAction> {
        self.state = BleTaskState::Advertising;
        self.adv_budget = ADV_TIMEOUT;
        self.adv_resumed_at = Some(now);
        info!("advertising started");
        Some(BleAction::StartAdvertising)
    }

    fn drain_adv_budget(&mut self, now: Instant) {
        if let Some(resumed) = self.adv_resumed_at.take() {
            let spent = now.saturating_duration_since(resumed);
            self.adv_budget = if spent >= self.adv_budget {
                Duration::ZERO
            } else {
                self.adv_budget - spent
            };
        }
    }

    /// Feeds one input into the FSM.
    pub fn handle(&mut self, input: BleInput, now: Instant) -> Option<BleAction> {
        if self.state == BleTaskState::Shutdown {
            return None;
        }
        match input {
            BleInput::ReEnable => {
                if self.state == BleTaskState::Idle {
                    self.start_advertising(now)
                } else {
                    debug!("re-enable ignored in {:?}", self.state);
                    None
                }
            }
            BleInput::EmergencyShutdown => {
                let action = match self.state {
                    BleTaskState::Connected | BleTaskState::Pairing => {
                        Some(BleAction::TerminateConnections)
                    }
                    BleTaskState::Advertising => Some(BleAction::StopAdvertising),
                    _ => None,
                };
                warn!("emergency shutdown from {:?}", self.state);
                self.state = BleTaskState::Shutdown;
                action
            }
            BleInput::PeerConnected => {
                if self.state == BleTaskState::Advertising {
                    self.drain_adv_budget(now);
                    self.state = BleTaskState::Pairing;
                    self.pairing_deadline = Some(now + PAIRING_TIMEOUT);
                }
                None
            }
            BleInput::PairingComplete {
                ltk,
                peer,
                advertised_first,
            } => {
                if self.state != BleTaskState::Pairing {
                    return None;
                }
                self.state = BleTaskState::Connected;
                self.pairing_deadline = None;
                info!("paired with {:?}", peer);
                Some(BleAction::NotifyPairingComplete {
                    ltk,
                    peer,
                    advertised_first,
                })
            }
            BleInput::PairingFailed => {
                if self.state != BleTaskState::Pairing {
                    return None;
                }
                warn!("pairing failed");
                self.state = BleTaskState::Idle;
                self.pairing_deadline = None;
                Some(BleAction::NotifyPairingFailed)
            }
            BleInput::PeerDisconnected => {
                if self.state == BleTaskState::Connected {
                    self.settle_until = Some(now + DISCONNECT_SETTLE);
                    self.adv_restart_seen = false;
                }
                None
            }
            BleInput::AdvRestartObserved => {
                self.adv_restart_seen = true;
                None
            }
            BleInput::AppConnected => {
                if self.state == BleTaskState::Advertising {
                    self.drain_adv_budget(now);
                }
                None
            }
            BleInput::AppDisconnected => {
                if self.state == BleTaskState::Advertising && self.adv_resumed_at.is_none() {
                    self.adv_resumed_at = Some(now);
                }
                None
            }
        }
    }

    /// Advances the timeouts.
    pub fn poll(&mut self, now: Instant) -> Option<BleAction> {
        match self.state {
            BleTaskState::Advertising => {
                if let Some(resumed) = self.adv_resumed_at {
                    if now.saturating_duration_since(resumed) >= self.adv_budget {
                        info!("advertising timed out");
                        self.state = BleTaskState::Idle;
                        self.adv_resumed_at = None;
                        return Some(BleAction::StopAdvertising);
                    }
                }
                None
            }
            BleTaskState::Pairing => {
                if let Some(deadline) = self.pairing_deadline {
                    if now >= deadline {
                        warn!("pairing timed out");
                        self.state = BleTaskState::Idle;
                        self.pairing_deadline = None;
                        return Some(BleAction::NotifyPairingFailed);
                    }
                }
                None
            }
            BleTaskState::Connected => {
                if let Some(until) = self.settle_until {
                    if now >= until {
                        self.settle_until = None;
                        return if self.adv_restart_seen {
                            // The lower layer already restarted advertising;
                            // just track the state and the timeout.
                            self.state = BleTaskState::Advertising;
                            self.adv_budget = ADV_TIMEOUT;
                            self.adv_resumed_at = Some(now);
                            None
                        } else {
                            self.state = BleTaskState::Idle;
                            None
                        };
                    }
                }
                None
            }
            _ => None,
        }
    }
}
