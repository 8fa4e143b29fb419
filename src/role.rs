//! Role negotiation, BLE-loss fallback, and session lifecycle.
//!
//! Two paired devices are asymmetric: the SERVER owns the timebase and
//! emits beacons, the CLIENT follows. The role is decided once per pairing
//! (first advertiser wins) and only ever changes in one direction — a
//! client that has lost its server for long enough promotes itself so a
//! reconnecting device can join as the new client.
//!
//! When the BLE link drops mid-session the pair must keep the bilateral
//! rhythm going. The parameters in effect are frozen into a
//! [`FallbackState`] and the rhythm continues against the frozen epoch,
//! first in full (phase 1), then reduced to the own-role column (phase 2).

use crate::pattern::zone::{Zone, ZoneConfig};
use crate::time::{Duration, Instant};
use crate::Error;

/// How long a disconnected client waits for beacons before promoting
/// itself to server. Edge-inclusive.
pub const ROLE_SURVIVOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Length of fallback phase 1, during which the full bilateral rhythm
/// continues against the frozen epoch.
pub const FALLBACK_PHASE1: Duration = Duration::from_secs(120);

/// Spacing of reconnect attempts while in fallback.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(300);

/// A session may end on request once it has run at least this long.
pub const SESSION_DURATION_MIN: Duration = Duration::from_secs(10 * 60);

/// A session ends unconditionally after this long.
pub const SESSION_DURATION_MAX: Duration = Duration::from_secs(60 * 60);

/// Operational role of one device in the pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Not yet negotiated.
    Undetermined,
    /// Timebase owner; emits beacons.
    Server,
    /// Follows the server's timebase.
    Client,
    /// No peer found; single-device operation.
    Standalone,
}

impl Role {
    /// Wire encoding used in role/params coordination messages.
    pub fn to_wire(self) -> u8 {
        match self {
            Role::Undetermined => 0,
            Role::Server => 1,
            Role::Client => 2,
            Role::Standalone => 3,
        }
    }

    /// Decodes a wire role byte, rejecting unknown values.
    pub fn from_wire(raw: u8) -> Result<Self, Error> {
        Ok(match raw {
            0 => Role::Undetermined,
            1 => Role::Server,
            2 => Role::Client,
            3 => Role::Standalone,
            _ => return Err(Error::InvalidArg),
        })
    }
}

/// Link-level connection state, tracked for diagnostics and fallback
/// entry/exit decisions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Advertising,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Fallback progress after a BLE disconnect.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FallbackPhase {
    /// Link is up (or never was); no fallback active.
    None,
    /// Full bilateral rhythm against the frozen epoch.
    Phase1Sync,
    /// Own-role column only.
    Phase2Role,
}

/// Operational parameters shared between the pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Full bilateral cycle (left + right) in milliseconds.
    pub cycle_ms: u16,
    /// Active motor time per side in milliseconds.
    pub duty_ms: u16,
    /// Motor intensity in percent.
    pub intensity: u8,
    /// Stimulation mode id.
    pub mode: u8,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            cycle_ms: 500,
            duty_ms: 125,
            intensity: 60,
            mode: 0,
        }
    }
}

/// Parameters captured at the moment of a BLE disconnect.
#[derive(Debug, Copy, Clone)]
pub struct FallbackState {
    pub params: SessionParams,
    /// Session-time reference the rhythm stays aligned to.
    pub reference_epoch_us: u64,
    /// Whether the local motor was on its forward turn at disconnect.
    pub forward_turn: bool,
    pub disconnected_at: Instant,
    /// Last time a command from the peer or app was seen before the drop.
    pub last_command_at: Instant,
}

/// Events surfaced by [`RoleManager::poll`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoleEvent {
    /// Fallback moved from phase 1 to phase 2.
    FallbackPhase2,
    /// This (former client) device is now the server.
    SurvivorPromoted,
    /// A reconnect attempt is due; the caller performs it inside a
    /// TDM-safe window.
    AttemptReconnect,
}

struct SessionState {
    started: Instant,
}

/// Owner of role, connection state, and fallback policy.
pub struct RoleManager {
    role: Role,
    connection: ConnectionState,
    phase: FallbackPhase,
    fallback: Option<FallbackState>,
    session: Option<SessionState>,
    last_beacon: Option<Instant>,
    next_reconnect: Option<Instant>,
}

impl Default for RoleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleManager {
    pub const fn new() -> Self {
        RoleManager {
            role: Role::Undetermined,
            connection: ConnectionState::Idle,
            phase: FallbackPhase::None,
            fallback: None,
            session: None,
            last_beacon: None,
            next_reconnect: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn fallback_phase(&self) -> FallbackPhase {
        self.phase
    }

    pub fn fallback(&self) -> Option<&FallbackState> {
        self.fallback.as_ref()
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        if state != self.connection {
            debug!("connection {:?} -> {:?}", self.connection, state);
            self.connection = state;
        }
    }

    /// Assigns the role after the first successful pairing: the device that
    /// began advertising first becomes the server.
    ///
    /// Only allowed while the role is still undetermined; roles never renegotiate
    /// within a pairing.
    pub fn assign_from_pairing(&mut self, advertised_first: bool) -> Result<Role, Error> {
        if self.role != Role::Undetermined {
            return Err(Error::InvalidState);
        }
        self.role = if advertised_first {
            Role::Server
        } else {
            Role::Client
        };
        info!("role assigned: {:?}", self.role);
        Ok(self.role)
    }

    /// Enters standalone operation after the discovery window closed
    /// without a peer.
    pub fn enter_standalone(&mut self) -> Result<(), Error> {
        if self.role != Role::Undetermined {
            return Err(Error::InvalidState);
        }
        self.role = Role::Standalone;
        info!("no peer found, standalone");
        Ok(())
    }

    /// Records a received beacon; resets the survivor-promotion clock.
    pub fn note_beacon(&mut self, now: Instant) {
        self.last_beacon = Some(now);
    }

    /// Enters fallback after a BLE disconnect with a session active.
    pub fn on_disconnect(&mut self, now: Instant, state: FallbackState) {
        self.connection = ConnectionState::Disconnected;
        self.phase = FallbackPhase::Phase1Sync;
        self.fallback = Some(state);
        self.next_reconnect = Some(now + RECONNECT_INTERVAL);
        warn!("link lost, fallback phase 1 (params {:?})", state.params);
    }

    /// Leaves fallback after the link came back.
    pub fn on_reconnected(&mut self) {
        self.connection = ConnectionState::Connected;
        self.phase = FallbackPhase::None;
        self.fallback = None;
        self.next_reconnect = None;
        info!("link restored, fallback cleared");
    }

    /// Advances time-based role/fallback policy. At most one event is
    /// returned per call; callers poll repeatedly.
    pub fn poll(&mut self, now: Instant) -> Option<RoleEvent> {
        let fb = self.fallback?;

        // Survivor promotion: a client that has seen neither link nor
        // beacons for the timeout takes over as server. Edge-inclusive.
        if self.role == Role::Client {
            let reference = match self.last_beacon {
                Some(b) if b > fb.disconnected_at => b,
                _ => fb.disconnected_at,
            };
            if now.saturating_duration_since(reference) >= ROLE_SURVIVOR_TIMEOUT {
                self.role = Role::Server;
                warn!("survivor promotion: client -> server");
                return Some(RoleEvent::SurvivorPromoted);
            }
        }

        if self.phase == FallbackPhase::Phase1Sync {
            let elapsed = now.saturating_duration_since(fb.disconnected_at);
            if elapsed > FALLBACK_PHASE1 {
                self.phase = FallbackPhase::Phase2Role;
                warn!("fallback phase 2 after {}", elapsed);
                return Some(RoleEvent::FallbackPhase2);
            }
        }

        if let Some(due) = self.next_reconnect {
            if now >= due {
                self.next_reconnect = Some(due + RECONNECT_INTERVAL);
                return Some(RoleEvent::AttemptReconnect);
            }
        }

        None
    }

    /// Effective zone for playback: phase 2 ignores the configured zone and
    /// routes strictly by role.
    pub fn effective_zone(&self, cfg: &ZoneConfig) -> Zone {
        if self.phase == FallbackPhase::Phase2Role {
            Zone::for_role(self.role)
        } else {
            cfg.zone(self.role)
        }
    }

    /// Whether the local motor should be active at `session_now_us` under
    /// the frozen fallback rhythm, and at what intensity.
    ///
    /// The LEFT half fires at epoch-aligned cycle multiples, the RIGHT half
    /// half a cycle later, so the two sides keep alternating without any
    /// link as long as their clocks hold.
    pub fn fallback_drive(&self, session_now_us: u64, zone: Zone) -> Option<FallbackDrive> {
        let fb = self.fallback.as_ref()?;
        let cycle_us = u64::from(fb.params.cycle_ms) * 1_000;
        let duty_us = u64::from(fb.params.duty_ms) * 1_000;
        if cycle_us == 0 || session_now_us < fb.reference_epoch_us {
            return None;
        }
        let phase = (session_now_us - fb.reference_epoch_us) % cycle_us;
        let window_start = match zone {
            Zone::Left => 0,
            Zone::Right => cycle_us / 2,
        };
        let active = phase >= window_start && phase < window_start + duty_us;
        Some(FallbackDrive {
            active,
            intensity: fb.params.intensity,
        })
    }

    /// Starts the session clock.
    pub fn session_start(&mut self, now: Instant) {
        self.session = Some(SessionState { started: now });
        info!("session started");
    }

    /// Elapsed session time, if a session is running.
    pub fn session_elapsed(&self, now: Instant) -> Option<Duration> {
        self.session
            .as_ref()
            .map(|s| now.saturating_duration_since(s.started))
    }

    /// Session end rule: an end request is honored once the minimum
    /// duration has passed; past the maximum the session ends regardless.
    pub fn session_should_end(&self, now: Instant, end_requested: bool) -> bool {
        match self.session_elapsed(now) {
            None => false,
            Some(elapsed) => {
                if elapsed > SESSION_DURATION_MAX {
                    true
                } else {
                    end_requested && elapsed >= SESSION_DURATION_MIN
                }
            }
        }
    }

    /// Ends the session.
    pub fn session_stop(&mut self) {
        self.session = None;
    }
}

/// Output of [`RoleManager::fallback_drive`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FallbackDrive {
    pub active: bool,
    pub intensity: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> Instant {
        Instant::from_raw_micros(secs * 1_000_000)
    }

    fn fallback_at(now: Instant) -> FallbackState {
        FallbackState {
            params: SessionParams::default(),
            reference_epoch_us: 0,
            forward_turn: true,
            disconnected_at: now,
            last_command_at: now,
        }
    }

    #[test]
    fn role_transitions_are_one_way() {
        let mut rm = RoleManager::new();
        assert_eq!(rm.assign_from_pairing(true), Ok(Role::Server));
        // Re-negotiation is rejected.
        assert_eq!(rm.assign_from_pairing(false), Err(Error::InvalidState));
        assert_eq!(rm.enter_standalone(), Err(Error::InvalidState));
        assert_eq!(rm.role(), Role::Server);
    }

    #[test]
    fn survivor_promotion_fires_at_exact_timeout() {
        let mut rm = RoleManager::new();
        rm.assign_from_pairing(false).unwrap();
        rm.on_disconnect(at(0), fallback_at(at(0)));

        let just_before = at(0) + ROLE_SURVIVOR_TIMEOUT - Duration::from_micros(1);
        assert_eq!(rm.poll(just_before), None);
        assert_eq!(rm.role(), Role::Client);

        let exactly = at(0) + ROLE_SURVIVOR_TIMEOUT;
        assert_eq!(rm.poll(exactly), Some(RoleEvent::SurvivorPromoted));
        assert_eq!(rm.role(), Role::Server);
    }

    #[test]
    fn beacons_defer_survivor_promotion() {
        let mut rm = RoleManager::new();
        rm.assign_from_pairing(false).unwrap();
        rm.on_disconnect(at(0), fallback_at(at(0)));
        rm.note_beacon(at(20));
        assert_eq!(rm.poll(at(30)), None);
        assert_eq!(rm.poll(at(50)), Some(RoleEvent::SurvivorPromoted));
    }

    #[test]
    fn fallback_reaches_phase_2_after_budget() {
        let mut rm = RoleManager::new();
        rm.assign_from_pairing(true).unwrap();
        rm.on_disconnect(at(0), fallback_at(at(0)));
        assert_eq!(rm.fallback_phase(), FallbackPhase::Phase1Sync);
        // Exactly at the boundary phase 1 still holds (strictly greater).
        assert_eq!(rm.poll(at(120)), None);
        assert_eq!(rm.poll(at(121)), Some(RoleEvent::FallbackPhase2));
        assert_eq!(rm.fallback_phase(), FallbackPhase::Phase2Role);
    }

    #[test]
    fn fallback_rhythm_is_epoch_aligned() {
        // S6: cycle 500 ms, duty 125 ms, disconnect at t=0.
        let mut rm = RoleManager::new();
        rm.assign_from_pairing(false).unwrap();
        rm.on_disconnect(at(0), fallback_at(at(0)));

        let ms = |v: u64| v * 1_000;
        // Left fires at epoch-aligned 500 ms multiples.
        let d = rm.fallback_drive(ms(2_000), Zone::Left).unwrap();
        assert!(d.active);
        assert_eq!(d.intensity, 60);
        assert!(!rm.fallback_drive(ms(2_200), Zone::Left).unwrap().active);
        // Right fires half a cycle later.
        assert!(!rm.fallback_drive(ms(2_000), Zone::Right).unwrap().active);
        assert!(rm.fallback_drive(ms(2_300), Zone::Right).unwrap().active);
    }

    #[test]
    fn phase_2_routes_zone_by_role() {
        let mut rm = RoleManager::new();
        rm.assign_from_pairing(false).unwrap();
        rm.on_disconnect(at(0), fallback_at(at(0)));
        let cfg = ZoneConfig::manual(Zone::Left);
        assert_eq!(rm.effective_zone(&cfg), Zone::Left);
        while rm.poll(at(200)).is_some() {}
        assert_eq!(rm.fallback_phase(), FallbackPhase::Phase2Role);
        // The 200 s poll also promoted this client to server, so phase 2
        // overrides the manual Left config with the server's Right column.
        assert_eq!(rm.role(), Role::Server);
        assert_eq!(rm.effective_zone(&cfg), Zone::Right);
    }

    #[test]
    fn reconnects_are_spaced() {
        let mut rm = RoleManager::new();
        rm.assign_from_pairing(true).unwrap();
        rm.on_disconnect(at(0), fallback_at(at(0)));
        // Consume the phase-2 transition first; it outranks reconnects.
        assert_eq!(rm.poll(at(150)), Some(RoleEvent::FallbackPhase2));
        assert_eq!(rm.poll(at(299)), None);
        assert_eq!(rm.poll(at(300)), Some(RoleEvent::AttemptReconnect));
        assert_eq!(rm.poll(at(301)), None);
        assert_eq!(rm.poll(at(600)), Some(RoleEvent::AttemptReconnect));
    }

    #[test]
    fn session_window_rules() {
        let mut rm = RoleManager::new();
        assert!(!rm.session_should_end(at(0), true));
        rm.session_start(at(0));
        assert!(!rm.session_should_end(at(60), true));
        assert!(!rm.session_should_end(at(3000), false));
        assert!(rm.session_should_end(at(700), true));
        assert!(rm.session_should_end(at(3601), false));
    }
}
