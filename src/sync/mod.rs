//! Dual-device time synchronization.
//!
//! The engine establishes a shared microsecond timeline between server and
//! client and keeps it within O(100 µs):
//!
//! 1. **Handshake** — the client runs PTP four-message exchanges over the
//!    coordination channel until ≥ 4 clean samples produce a robust offset.
//! 2. **Fast lock** — the server emits a short burst of forced beacons; the
//!    client declares lock when its offset observations settle.
//! 3. **Coordinated start** — the server arms an epoch a few seconds out
//!    and carries it in every beacon; both sides start playback on it.
//! 4. **Steady state** — periodic beacons keep the client slewed; large
//!    corrections are rate-limited so motor timing never jerks.
//!
//! The engine is sans-IO: [`SyncEngine::poll`] returns frames to transmit
//! and events to act on, and the orchestrator moves them through the
//! transport. This keeps the engine free of any reference to the transport
//! (which in turn knows nothing about the engine).
//!
//! The engine owns beacon sequencing: stale sequence numbers are discarded
//! here, not in the transport.

pub mod filter;

use crate::radio::frame::{Beacon, BeaconFlags, CoordinationMsg};
use crate::role::Role;
use crate::time::{Duration, Instant, WallClock};
use crate::{Error, PROTOCOL_VERSION};

use self::filter::{HandshakeFilter, OffsetWindow, PtpExchange};

/// Steady-state beacon cadence. The protocol tolerates 50–200 ms; 100 ms
/// keeps the client slewed tightly while staying well clear of the TDM
/// window budget.
pub const BEACON_INTERVAL: Duration = Duration::from_millis(100);

/// Number of forced beacons in the fast-lock burst.
pub const FAST_LOCK_BEACONS: u8 = 5;

/// Cadence of the fast-lock burst.
pub const FAST_LOCK_INTERVAL: Duration = Duration::from_millis(200);

/// The fast-lock burst must complete within this budget.
pub const FAST_LOCK_BUDGET: Duration = Duration::from_micros(1_500_000);

/// Lead time of the coordinated-start epoch.
pub const COORD_START_DELAY: Duration = Duration::from_secs(3);

/// A client that has seen no beacon for three intervals considers the link
/// gone.
pub const BEACON_GAP_TIMEOUT: Duration = BEACON_INTERVAL.mul(3);

/// Per-exchange reply timeout during the handshake.
pub const HANDSHAKE_EXCHANGE_TIMEOUT: Duration = Duration::from_millis(250);

/// Overall handshake budget; exhaustion returns to role negotiation.
pub const HANDSHAKE_BUDGET: Duration = Duration::from_secs(5);

/// Maximum clock correction applied per beacon in steady state.
pub const SLEW_LIMIT_US: i64 = 200;

/// Spacing of asymmetry probes in steady state.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Engine phase, roughly mirroring the protocol stages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    /// Not running (pre-negotiation, or after a failure event).
    Idle,
    /// Client: PTP exchanges in flight.
    Handshake,
    /// Server: forced-beacon burst. Client: waiting for its filter to
    /// settle.
    FastLock,
    /// Locked and maintaining.
    Synced,
}

/// Events surfaced to the orchestrator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Client side locked onto the server timeline.
    LockAcquired { offset_us: i64 },
    /// A coordinated-start epoch is known; arm playback with it.
    EpochArmed { epoch_us: u64 },
    /// Handshake budget exhausted; return to role negotiation.
    HandshakeFailed,
    /// No beacons for [`BEACON_GAP_TIMEOUT`]; treat the link as lost.
    BeaconGap,
    /// The peer speaks another protocol version; refuse coordination.
    VersionMismatch,
}

/// Something the engine wants done, returned from [`SyncEngine::poll`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncOutput {
    /// Broadcast this beacon now (server).
    Beacon(Beacon),
    /// Send this coordination message to the peer.
    Send(CoordinationMsg),
    /// Policy event for the orchestrator.
    Event(SyncEvent),
}

/// The synchronization engine. One per device; behavior depends on the
/// negotiated role passed to [`start`](Self::start).
pub struct SyncEngine {
    role: Role,
    phase: SyncPhase,
    clock: WallClock,

    // Server side.
    sequence: u32,
    next_beacon: Option<Instant>,
    forced_remaining: u8,
    epoch_us: Option<u64>,

    // Client side.
    handshake: HandshakeFilter,
    pending_t1: Option<u64>,
    exchange_deadline: Option<Instant>,
    handshake_deadline: Option<Instant>,
    lock_window: OffsetWindow,
    last_sequence: Option<u32>,
    last_beacon_rx: Option<Instant>,
    epoch_seen: Option<u64>,
    version_reported: bool,

    // Asymmetry probing.
    next_probe: Option<Instant>,
    probe_id: u16,
    probe_in_flight: Option<(u16, u64)>,
    last_asymmetry_us: Option<i64>,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngine {
    pub const fn new() -> Self {
        SyncEngine {
            role: Role::Undetermined,
            phase: SyncPhase::Idle,
            clock: WallClock::new(),
            sequence: 0,
            next_beacon: None,
            forced_remaining: 0,
            epoch_us: None,
            handshake: HandshakeFilter::new(),
            pending_t1: None,
            exchange_deadline: None,
            handshake_deadline: None,
            lock_window: OffsetWindow::new(),
            last_sequence: None,
            last_beacon_rx: None,
            epoch_seen: None,
            version_reported: false,
            next_probe: None,
            probe_id: 0,
            probe_in_flight: None,
            last_asymmetry_us: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Current clock offset onto the session timeline.
    pub fn offset_us(&self) -> i64 {
        self.clock.offset_us()
    }

    /// Maps a local instant to session time.
    pub fn session_time_us(&self, local: Instant) -> u64 {
        self.clock.session_time_us(local)
    }

    /// The coordinated-start epoch, once known on either side.
    pub fn epoch_us(&self) -> Option<u64> {
        match self.role {
            Role::Server => self.epoch_us,
            _ => self.epoch_seen,
        }
    }

    /// Last measured path asymmetry (recorded, not applied).
    pub fn asymmetry_us(&self) -> Option<i64> {
        self.last_asymmetry_us
    }

    /// Starts the engine for the negotiated role.
    ///
    /// The server enters the fast-lock burst immediately; the client starts
    /// its PTP handshake.
    pub fn start(&mut self, role: Role, now: Instant) -> Result<(), Error> {
        match role {
            Role::Server => {
                self.role = role;
                self.phase = SyncPhase::FastLock;
                self.sequence = 0;
                self.forced_remaining = FAST_LOCK_BEACONS;
                self.next_beacon = Some(now);
                self.epoch_us = None;
                info!("sync: server fast-lock burst starting");
                Ok(())
            }
            Role::Client => {
                self.role = role;
                self.phase = SyncPhase::Handshake;
                self.handshake.clear();
                self.pending_t1 = None;
                self.exchange_deadline = None;
                self.handshake_deadline = Some(now + HANDSHAKE_BUDGET);
                self.lock_window.clear();
                self.last_sequence = None;
                self.last_beacon_rx = Some(now);
                self.epoch_seen = None;
                info!("sync: client handshake starting");
                Ok(())
            }
            _ => Err(Error::InvalidArg),
        }
    }

    /// Stops the engine and forgets all session state. The clock offset is
    /// kept: fallback playback continues against the frozen timeline.
    pub fn stop(&mut self) {
        self.phase = SyncPhase::Idle;
        self.next_beacon = None;
        self.pending_t1 = None;
        self.next_probe = None;
        self.probe_in_flight = None;
    }

    /// Advances timers. Call frequently (every few milliseconds is fine);
    /// at most one output is produced per call, so loop until `None`.
    pub fn poll(&mut self, now: Instant) -> Option<SyncOutput> {
        match self.role {
            Role::Server => self.poll_server(now),
            Role::Client => self.poll_client(now),
            _ => None,
        }
    }

    fn poll_server(&mut self, now: Instant) -> Option<SyncOutput> {
        if self.phase == SyncPhase::Idle {
            return None;
        }

        // Burst exhausted: arm the coordinated-start epoch exactly once.
        if self.phase == SyncPhase::FastLock && self.forced_remaining == 0 {
            self.phase = SyncPhase::Synced;
            let epoch = self.arm_epoch(now);
            return Some(SyncOutput::Event(SyncEvent::EpochArmed { epoch_us: epoch }));
        }

        let due = self.next_beacon?;
        if now < due {
            return None;
        }

        let fast = self.forced_remaining > 0;
        if fast {
            self.forced_remaining -= 1;
        }
        let mut flags = BeaconFlags::empty();
        if fast {
            flags |= BeaconFlags::FAST_LOCK;
        }
        let mut epoch_us = 0;
        if let Some(epoch) = self.epoch_us {
            flags |= BeaconFlags::EPOCH_VALID;
            epoch_us = epoch;
        }

        self.sequence += 1;
        let interval = if fast {
            FAST_LOCK_INTERVAL
        } else {
            BEACON_INTERVAL
        };
        self.next_beacon = Some(due + interval);

        Some(SyncOutput::Beacon(Beacon {
            server_time_us: self.clock.session_time_us(now),
            sequence: self.sequence,
            epoch_us,
            flags,
            version: PROTOCOL_VERSION,
        }))
    }

    /// Picks the coordinated-start epoch `now + COORD_START_DELAY` and
    /// starts carrying it in beacons. Server only.
    pub fn arm_epoch(&mut self, now: Instant) -> u64 {
        let epoch = self.clock.session_time_us(now + COORD_START_DELAY);
        self.epoch_us = Some(epoch);
        info!("coordinated start armed at {}µs", epoch);
        epoch
    }

    fn poll_client(&mut self, now: Instant) -> Option<SyncOutput> {
        match self.phase {
            SyncPhase::Idle => None,
            SyncPhase::Handshake => {
                if let Some(deadline) = self.handshake_deadline {
                    if now >= deadline {
                        warn!("sync: handshake budget exhausted");
                        self.phase = SyncPhase::Idle;
                        return Some(SyncOutput::Event(SyncEvent::HandshakeFailed));
                    }
                }
                let retry = self
                    .exchange_deadline
                    .map_or(true, |deadline| now >= deadline);
                if self.pending_t1.is_none() || retry {
                    let t1 = now.raw_micros();
                    self.pending_t1 = Some(t1);
                    self.exchange_deadline = Some(now + HANDSHAKE_EXCHANGE_TIMEOUT);
                    return Some(SyncOutput::Send(CoordinationMsg::PtpSample {
                        t1,
                        t2: 0,
                        t3: 0,
                        t4: 0,
                    }));
                }
                None
            }
            SyncPhase::FastLock | SyncPhase::Synced => {
                if let Some(last) = self.last_beacon_rx {
                    if now.saturating_duration_since(last) > BEACON_GAP_TIMEOUT {
                        warn!("sync: beacon gap, link considered lost");
                        self.phase = SyncPhase::Idle;
                        return Some(SyncOutput::Event(SyncEvent::BeaconGap));
                    }
                }
                if self.phase == SyncPhase::Synced {
                    if let Some(due) = self.next_probe {
                        if now >= due {
                            self.probe_id = self.probe_id.wrapping_add(1);
                            let tx = self.clock.session_time_us(now);
                            self.probe_in_flight = Some((self.probe_id, tx));
                            self.next_probe = Some(due + PROBE_INTERVAL);
                            return Some(SyncOutput::Send(CoordinationMsg::AsymmetryProbe {
                                probe_id: self.probe_id,
                                tx_time_us: tx,
                            }));
                        }
                    }
                }
                None
            }
        }
    }

    /// Server-side handling of an inbound coordination message.
    ///
    /// `rx_time` is the receive timestamp captured in the radio callback;
    /// `tx_time` must be taken immediately before the returned reply is
    /// handed to the transport, since it becomes the PTP T3 stamp.
    pub fn handle_coordination_server(
        &mut self,
        msg: &CoordinationMsg,
        rx_time: Instant,
        tx_time: Instant,
    ) -> Option<CoordinationMsg> {
        match *msg {
            CoordinationMsg::PtpSample { t1, .. } => Some(CoordinationMsg::PtpSample {
                t1,
                t2: self.clock.session_time_us(rx_time),
                t3: self.clock.session_time_us(tx_time),
                t4: 0,
            }),
            CoordinationMsg::AsymmetryProbe { probe_id, .. } => {
                Some(CoordinationMsg::AsymmetryProbe {
                    probe_id,
                    tx_time_us: self.clock.session_time_us(tx_time),
                })
            }
            CoordinationMsg::RoleParams { .. } => None, // role manager's concern
        }
    }

    /// Client-side handling of an inbound coordination message.
    pub fn handle_coordination_client(
        &mut self,
        msg: &CoordinationMsg,
        rx_time: Instant,
    ) -> Option<SyncEvent> {
        match *msg {
            CoordinationMsg::PtpSample { t1, t2, t3, .. } => {
                if self.phase != SyncPhase::Handshake || self.pending_t1 != Some(t1) {
                    trace!("stray PTP reply (t1={})", t1);
                    return None;
                }
                self.pending_t1 = None;
                self.exchange_deadline = None;
                let exchange = PtpExchange {
                    t1,
                    t2,
                    t3,
                    t4: rx_time.raw_micros(),
                };
                self.handshake.push(&exchange);
                debug!(
                    "PTP sample {}: θ={}µs δ={}µs",
                    self.handshake.len(),
                    exchange.offset_us(),
                    exchange.delay_us()
                );

                if let Some(offset) = self.handshake.offset_us() {
                    self.clock.set_offset_us(offset);
                    self.phase = SyncPhase::FastLock;
                    self.lock_window.clear();
                    info!("handshake complete, offset {}µs", offset);
                }
                None
            }
            CoordinationMsg::AsymmetryProbe {
                probe_id,
                tx_time_us,
            } => {
                if let Some((id, our_tx)) = self.probe_in_flight {
                    if id == probe_id {
                        self.probe_in_flight = None;
                        let our_rx = self.clock.session_time_us(rx_time) as i64;
                        // Outbound minus return path, peer turnaround
                        // included on both sides of the echo stamp.
                        let asym =
                            (tx_time_us as i64 - our_tx as i64) - (our_rx - tx_time_us as i64);
                        self.last_asymmetry_us = Some(asym);
                        trace!("asymmetry probe {}: {}µs", probe_id, asym);
                    }
                }
                None
            }
            CoordinationMsg::RoleParams { .. } => None,
        }
    }

    /// Client-side beacon ingestion.
    ///
    /// Ordering, version checking, lock detection, slew-limited correction,
    /// and epoch extraction all happen here. At most one event is returned.
    pub fn handle_beacon(&mut self, beacon: &Beacon, rx_time: Instant) -> Option<SyncEvent> {
        if beacon.version != PROTOCOL_VERSION {
            if !self.version_reported {
                self.version_reported = true;
                error!(
                    "peer protocol version {} != ours {}",
                    beacon.version, PROTOCOL_VERSION
                );
                return Some(SyncEvent::VersionMismatch);
            }
            return None;
        }

        // Stale sequences are discarded outright; there is no reordering
        // buffer.
        if let Some(last) = self.last_sequence {
            if beacon.sequence <= last {
                trace!("stale beacon seq {} (last {})", beacon.sequence, last);
                return None;
            }
        }
        self.last_sequence = Some(beacon.sequence);
        self.last_beacon_rx = Some(rx_time);

        // Offset observation: the one-way flight time lands in here as a
        // near-constant bias that the lock detector tolerates.
        let observed = beacon.server_time_us as i64 - rx_time.raw_micros() as i64;
        let err = observed - self.clock.offset_us();

        match self.phase {
            SyncPhase::FastLock => {
                self.clock.adjust_us(err);
                self.lock_window.push(observed);
                if self.lock_window.locked() {
                    self.phase = SyncPhase::Synced;
                    self.next_probe = Some(rx_time + PROBE_INTERVAL);
                    info!("lock acquired, offset {}µs", self.clock.offset_us());
                    return Some(SyncEvent::LockAcquired {
                        offset_us: self.clock.offset_us(),
                    });
                }
            }
            SyncPhase::Synced => {
                // Rate-limited slew; a session in progress must never see
                // its timeline jump.
                self.clock
                    .adjust_us(err.clamp(-SLEW_LIMIT_US, SLEW_LIMIT_US));
            }
            _ => {}
        }

        if beacon.flags.contains(BeaconFlags::EPOCH_VALID) && self.epoch_seen != Some(beacon.epoch_us)
        {
            self.epoch_seen = Some(beacon.epoch_us);
            return Some(SyncEvent::EpochArmed {
                epoch_us: beacon.epoch_us,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_ms(ms: u64) -> Instant {
        Instant::from_raw_micros(ms * 1_000)
    }

    /// Drives a complete client handshake against a simulated server whose
    /// clock is `offset` µs ahead, with symmetric `one_way` µs flight time.
    fn run_handshake(engine: &mut SyncEngine, offset: i64, one_way: u64) {
        engine.start(Role::Client, at_ms(0)).unwrap();
        let mut now = at_ms(0);
        for _ in 0..filter::MIN_HANDSHAKE_SAMPLES {
            let out = engine.poll(now).expect("engine should emit a request");
            let t1 = match out {
                SyncOutput::Send(CoordinationMsg::PtpSample { t1, .. }) => t1,
                other => panic!("expected PTP request, got {:?}", other),
            };
            let t2 = (t1 as i64 + offset) as u64 + one_way;
            let t3 = t2 + 150;
            let reply = CoordinationMsg::PtpSample { t1, t2, t3, t4: 0 };
            let t4_local = (t3 as i64 - offset) as u64 + one_way;
            engine.handle_coordination_client(&reply, Instant::from_raw_micros(t4_local));
            now = now + Duration::from_millis(20);
        }
    }

    #[test]
    fn server_burst_then_steady_cadence() {
        let mut e = SyncEngine::new();
        e.start(Role::Server, at_ms(0)).unwrap();

        let mut sends = Vec::new();
        let mut epoch = None;
        let mut t = 0u64;
        while t < 3_000 {
            while let Some(out) = e.poll(at_ms(t)) {
                match out {
                    SyncOutput::Beacon(b) => sends.push((t, b)),
                    SyncOutput::Event(SyncEvent::EpochArmed { epoch_us }) => {
                        epoch = Some((t, epoch_us))
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            t += 10;
        }

        // First FAST_LOCK_BEACONS beacons are forced, 200 ms apart, and
        // complete inside the fast-lock budget.
        let burst: Vec<_> = sends
            .iter()
            .filter(|(_, b)| b.flags.contains(BeaconFlags::FAST_LOCK))
            .collect();
        assert_eq!(burst.len(), usize::from(FAST_LOCK_BEACONS));
        assert_eq!(burst.last().unwrap().0, 800);
        assert!(Duration::from_millis(800 as u32) < FAST_LOCK_BUDGET);

        // Sequences increase monotonically.
        for pair in sends.windows(2) {
            assert!(pair[1].1.sequence > pair[0].1.sequence);
        }

        // After the burst the epoch is armed 3 s out and carried in
        // beacons.
        let (armed_at, epoch_us) = epoch.expect("epoch must arm after burst");
        assert!(armed_at >= 800);
        assert_eq!(epoch_us, (armed_at + 3_000) * 1_000);
        let steady = sends.iter().find(|(t, _)| *t > armed_at).unwrap();
        assert!(steady.1.flags.contains(BeaconFlags::EPOCH_VALID));
        assert_eq!(steady.1.epoch_us, epoch_us);

        // Steady cadence is BEACON_INTERVAL.
        let steady_times: Vec<u64> = sends
            .iter()
            .filter(|(_, b)| !b.flags.contains(BeaconFlags::FAST_LOCK))
            .map(|(t, _)| *t)
            .collect();
        for pair in steady_times.windows(2) {
            assert_eq!(pair[1] - pair[0], BEACON_INTERVAL.whole_millis());
        }
    }

    #[test]
    fn client_handshake_recovers_offset() {
        let mut e = SyncEngine::new();
        run_handshake(&mut e, 250_000, 400);
        assert_eq!(e.phase(), SyncPhase::FastLock);
        assert_eq!(e.offset_us(), 250_000);
        assert_eq!(
            e.session_time_us(Instant::from_raw_micros(1_000)),
            251_000
        );
    }

    #[test]
    fn handshake_timeout_fails_over() {
        let mut e = SyncEngine::new();
        e.start(Role::Client, at_ms(0)).unwrap();
        assert!(matches!(
            e.poll(at_ms(0)),
            Some(SyncOutput::Send(CoordinationMsg::PtpSample { .. }))
        ));
        // No replies ever arrive; requests are re-issued until the budget
        // runs out.
        let mut t = 250;
        let mut failed = false;
        while t <= 5_500 {
            match e.poll(at_ms(t)) {
                Some(SyncOutput::Event(SyncEvent::HandshakeFailed)) => {
                    failed = true;
                    break;
                }
                Some(SyncOutput::Send(_)) | None => {}
                other => panic!("unexpected {:?}", other),
            }
            t += 250;
        }
        assert!(failed);
        assert_eq!(e.phase(), SyncPhase::Idle);
        assert_eq!(e.poll(at_ms(6_000)), None);
    }

    fn beacon(seq: u32, server_time_us: u64) -> Beacon {
        Beacon {
            server_time_us,
            sequence: seq,
            epoch_us: 0,
            flags: BeaconFlags::FAST_LOCK,
            version: PROTOCOL_VERSION,
        }
    }

    #[test]
    fn beacons_lock_and_surface_epoch() {
        let mut e = SyncEngine::new();
        run_handshake(&mut e, 250_000, 400);

        // Stable beacons: server time = local + 250 000 + 400 flight.
        let mut seq = 0;
        let mut lock = None;
        for i in 0..10u64 {
            let local = 10_000 + i * 100_000;
            seq += 1;
            let b = beacon(seq, (local as i64 + 250_400) as u64);
            if let Some(ev) = e.handle_beacon(&b, Instant::from_raw_micros(local)) {
                lock = Some(ev);
                break;
            }
        }
        assert!(matches!(lock, Some(SyncEvent::LockAcquired { .. })));
        assert_eq!(e.phase(), SyncPhase::Synced);
        // The applied offset absorbed the one-way flight as bias.
        assert_eq!(e.offset_us(), 250_400);

        // An epoch-carrying beacon surfaces exactly one arm event.
        seq += 1;
        let local = 2_000_000u64;
        let mut b = beacon(seq, (local as i64 + 250_400) as u64);
        b.flags = BeaconFlags::EPOCH_VALID;
        b.epoch_us = 5_000_000;
        assert_eq!(
            e.handle_beacon(&b, Instant::from_raw_micros(local)),
            Some(SyncEvent::EpochArmed {
                epoch_us: 5_000_000
            })
        );
        assert_eq!(e.epoch_us(), Some(5_000_000));
        seq += 1;
        let mut again = b;
        again.sequence = seq;
        assert_eq!(
            e.handle_beacon(&again, Instant::from_raw_micros(local + 100_000)),
            None
        );
    }

    #[test]
    fn stale_sequences_are_discarded() {
        let mut e = SyncEngine::new();
        run_handshake(&mut e, 0, 0);

        e.handle_beacon(&beacon(10, 100_000), Instant::from_raw_micros(100_000));
        let before = e.offset_us();
        // Replayed and out-of-order beacons with absurd times must not
        // perturb the clock.
        e.handle_beacon(&beacon(10, 900_000_000), Instant::from_raw_micros(200_000));
        e.handle_beacon(&beacon(9, 900_000_000), Instant::from_raw_micros(200_100));
        assert_eq!(e.offset_us(), before);
    }

    #[test]
    fn steady_state_slew_is_rate_limited() {
        let mut e = SyncEngine::new();
        run_handshake(&mut e, 250_000, 0);
        // Reach Synced with five identical observations.
        for i in 0..5u64 {
            let local = 10_000 + i * 100_000;
            e.handle_beacon(
                &beacon(i as u32 + 1, (local as i64 + 250_000) as u64),
                Instant::from_raw_micros(local),
            );
        }
        assert_eq!(e.phase(), SyncPhase::Synced);
        let locked = e.offset_us();

        // A beacon implying a 10 ms jump only moves the clock by the slew
        // limit.
        let local = 1_000_000u64;
        e.handle_beacon(
            &beacon(100, (local as i64 + locked + 10_000) as u64),
            Instant::from_raw_micros(local),
        );
        assert_eq!(e.offset_us(), locked + SLEW_LIMIT_US);
    }

    #[test]
    fn beacon_gap_reports_link_loss() {
        let mut e = SyncEngine::new();
        run_handshake(&mut e, 0, 0);
        e.handle_beacon(&beacon(1, 500_000), Instant::from_raw_micros(500_000));
        assert_eq!(e.poll(Instant::from_raw_micros(700_000)), None);
        assert_eq!(
            e.poll(Instant::from_raw_micros(900_000)),
            Some(SyncOutput::Event(SyncEvent::BeaconGap))
        );
        assert_eq!(e.phase(), SyncPhase::Idle);
    }

    #[test]
    fn version_mismatch_reported_once() {
        let mut e = SyncEngine::new();
        run_handshake(&mut e, 0, 0);
        let mut b = beacon(1, 100_000);
        b.version = PROTOCOL_VERSION + 1;
        assert_eq!(
            e.handle_beacon(&b, Instant::from_raw_micros(100_000)),
            Some(SyncEvent::VersionMismatch)
        );
        assert_eq!(e.handle_beacon(&b, Instant::from_raw_micros(200_000)), None);
    }

    #[test]
    fn server_answers_ptp_and_probes() {
        let mut e = SyncEngine::new();
        e.start(Role::Server, at_ms(0)).unwrap();
        let req = CoordinationMsg::PtpSample {
            t1: 77,
            t2: 0,
            t3: 0,
            t4: 0,
        };
        let reply = e
            .handle_coordination_server(&req, at_ms(10), at_ms(11))
            .unwrap();
        assert_eq!(
            reply,
            CoordinationMsg::PtpSample {
                t1: 77,
                t2: 10_000,
                t3: 11_000,
                t4: 0
            }
        );

        let probe = CoordinationMsg::AsymmetryProbe {
            probe_id: 3,
            tx_time_us: 123,
        };
        let echo = e
            .handle_coordination_server(&probe, at_ms(20), at_ms(21))
            .unwrap();
        assert_eq!(
            echo,
            CoordinationMsg::AsymmetryProbe {
                probe_id: 3,
                tx_time_us: 21_000
            }
        );
    }
}
