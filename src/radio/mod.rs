//! Framed datagram transport over the vendor low-latency radio.
//!
//! The transport owns the peer record (and with it the session key), routes
//! inbound frames by shape, and enforces the send policies: beacons are
//! broadcast fire-and-forget, coordination messages are unicast with
//! bounded retries, optionally gated on the TDM-safe window.
//!
//! The physical radio is reached through the [`Phy`] trait, implemented
//! once per platform around the vendor stack. Receive timestamps must be
//! captured *first thing* in the platform's receive callback and passed in
//! unchanged; everything downstream depends on their accuracy.
//!
//! Inbound traffic is returned to the caller as [`Inbound`] values rather
//! than delivered through a stored callback; the orchestrator forwards them
//! to the sync engine. This keeps the transport free of references to its
//! consumers.

pub mod frame;
pub mod jitter;
pub mod tdm;

use crate::addr::DeviceId;
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::kdf::SessionKey;
use crate::role::Role;
use crate::time::{Delay, Duration, Instant, Timer};
use crate::utils::HexSlice;
use crate::Error;

use self::frame::{Beacon, CoordinationMsg, COORD_PREFIX};
use self::jitter::JitterMetrics;
use self::tdm::TdmSchedule;

/// Radio channel the pair communicates on. The BLE controller may move the
/// shared radio off this channel; `set_peer` forces it back.
pub const DEFAULT_CHANNEL: u8 = 1;

/// Maximum frame payload the PHY accepts.
pub const MAX_FRAME_LEN: usize = 250;

/// Unicast send attempts for one coordination message.
pub const COORD_SEND_ATTEMPTS: u32 = 3;

/// Pause between coordination send attempts.
pub const COORD_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Interface to the vendor radio stack.
///
/// All methods map 1:1 onto vendor calls; implementations must not block
/// beyond what the vendor stack itself does.
pub trait Phy {
    /// Brings up the radio and registers the platform's receive callback.
    fn power_up(&mut self) -> Result<(), Error>;

    /// Returns the current radio channel.
    fn channel(&mut self) -> Result<u8, Error>;

    /// Moves the radio to `channel`.
    fn set_channel(&mut self, channel: u8) -> Result<(), Error>;

    /// Installs a peer, optionally with a link key for frame encryption.
    fn add_peer(&mut self, addr: &DeviceId, key: Option<&SessionKey>) -> Result<(), Error>;

    /// Removes a previously installed peer.
    fn remove_peer(&mut self, addr: &DeviceId) -> Result<(), Error>;

    /// Queues one frame for transmission to `dest`.
    fn send(&mut self, dest: &DeviceId, frame: &[u8]) -> Result<(), Error>;
}

/// Transport lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Ready,
    PeerSet,
    /// PHY bring-up failed; `init` may be retried.
    Error,
}

/// A frame accepted by the receive path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Inbound {
    Beacon { beacon: Beacon, rx_time: Instant },
    Coordination {
        msg: CoordinationMsg,
        rx_time: Instant,
    },
}

struct Peer {
    addr: DeviceId,
    /// Copy of the link key held for the lifetime of the peer record;
    /// zeroized when the record is dropped.
    key: Option<SessionKey>,
}

/// Framed datagram transport. See the module docs.
pub struct Transport {
    state: TransportState,
    channel: u8,
    peer: Option<Peer>,
    broadcast_installed: bool,
    beacon_interval: Duration,
    expected_rx: Option<Instant>,
    metrics: JitterMetrics,
    coord_failures: u32,
    warnings: u32,
}

impl Transport {
    /// Creates an uninitialized transport for `channel`.
    ///
    /// `beacon_interval` is the cadence the sync engine will use; the
    /// receive path needs it to compute expected beacon arrival times.
    pub fn new(channel: u8, beacon_interval: Duration) -> Self {
        Transport {
            state: TransportState::Uninitialized,
            channel,
            peer: None,
            broadcast_installed: false,
            beacon_interval,
            expected_rx: None,
            metrics: JitterMetrics::new(),
            coord_failures: 0,
            warnings: 0,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// The configured unicast peer, if any.
    pub fn peer(&self) -> Option<&DeviceId> {
        self.peer.as_ref().map(|p| &p.addr)
    }

    /// Whether the current peer record carries a link key.
    pub fn is_encrypted(&self) -> bool {
        self.peer.as_ref().map_or(false, |p| p.key.is_some())
    }

    /// Jitter and beacon accounting.
    pub fn metrics(&self) -> &JitterMetrics {
        &self.metrics
    }

    /// Frames discarded for shape or origin.
    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    /// Coordination messages lost after exhausting all retries.
    pub fn coord_failures(&self) -> u32 {
        self.coord_failures
    }

    /// Brings up the PHY, installs the broadcast peer, and fixes the
    /// channel. Idempotent; also clears a previous `Error` state.
    pub fn init<P: Phy>(&mut self, phy: &mut P) -> Result<(), Error> {
        match self.bring_up(phy) {
            Ok(()) => {
                if self.state == TransportState::Uninitialized
                    || self.state == TransportState::Error
                {
                    self.state = TransportState::Ready;
                }
                info!("transport ready on channel {}", self.channel);
                Ok(())
            }
            Err(e) => {
                error!("transport init failed: {}", e);
                self.state = TransportState::Error;
                Err(e)
            }
        }
    }

    fn bring_up<P: Phy>(&mut self, phy: &mut P) -> Result<(), Error> {
        phy.power_up()?;
        if !self.broadcast_installed {
            phy.add_peer(&DeviceId::BROADCAST, None)?;
            self.broadcast_installed = true;
        }
        phy.set_channel(self.channel)
    }

    /// Replaces the unicast peer, without encryption.
    pub fn set_peer<P: Phy>(&mut self, phy: &mut P, addr: DeviceId) -> Result<(), Error> {
        self.install_peer(phy, addr, None)
    }

    /// Replaces the unicast peer and installs the link key.
    pub fn set_peer_encrypted<P: Phy>(
        &mut self,
        phy: &mut P,
        addr: DeviceId,
        key: SessionKey,
    ) -> Result<(), Error> {
        self.install_peer(phy, addr, Some(key))
    }

    fn install_peer<P: Phy>(
        &mut self,
        phy: &mut P,
        addr: DeviceId,
        key: Option<SessionKey>,
    ) -> Result<(), Error> {
        if self.state == TransportState::Uninitialized || self.state == TransportState::Error {
            return Err(Error::InvalidState);
        }
        if addr.is_broadcast() {
            return Err(Error::InvalidArg);
        }

        // Drop any existing record first; its key is zeroized on drop.
        if let Some(old) = self.peer.take() {
            self.state = TransportState::Ready;
            phy.remove_peer(&old.addr)?;
        }

        // Coexisting BLE occasionally drags the shared radio to another
        // channel. Check and force it back before installing the peer.
        let current = phy.channel()?;
        if current != self.channel {
            warn!("channel drifted {} -> {}, forcing back", self.channel, current);
            phy.set_channel(self.channel)?;
        }

        phy.add_peer(&addr, key.as_ref())?;
        debug!("peer {:?} installed, encrypted={}", addr, key.is_some());
        self.peer = Some(Peer { addr, key });
        self.metrics.reset();
        self.expected_rx = None;
        self.state = TransportState::PeerSet;
        Ok(())
    }

    /// Removes the peer record and zeroizes its key.
    pub fn clear_peer<P: Phy>(&mut self, phy: &mut P) -> Result<(), Error> {
        let peer = self.peer.take().ok_or(Error::InvalidState)?;
        phy.remove_peer(&peer.addr)?;
        drop(peer); // zeroizes the key
        self.expected_rx = None;
        self.state = TransportState::Ready;
        Ok(())
    }

    /// Broadcasts a beacon, fire-and-forget.
    ///
    /// Send failures are counted but never retried and never propagate;
    /// the next beacon supersedes this one anyway.
    pub fn send_beacon<P: Phy>(&mut self, phy: &mut P, beacon: &Beacon) -> Result<(), Error> {
        if self.state != TransportState::Ready && self.state != TransportState::PeerSet {
            return Err(Error::InvalidState);
        }
        let frame = beacon.encode();
        let dest = if self.broadcast_installed {
            DeviceId::BROADCAST
        } else {
            // Broadcast peer missing (vendor table exhaustion); fall back
            // to unicast if we have a peer to fall back to.
            self.peer.as_ref().ok_or(Error::InvalidState)?.addr
        };
        match phy.send(&dest, &frame) {
            Ok(()) => self.metrics.beacons_sent += 1,
            Err(_) => {
                self.metrics.send_failures += 1;
                trace!("beacon {} send failed (ignored)", beacon.sequence);
            }
        }
        Ok(())
    }

    /// Sends a coordination message to the peer, retrying on failure.
    pub fn send_coordination<P: Phy, D: Delay>(
        &mut self,
        phy: &mut P,
        delay: &mut D,
        msg: &CoordinationMsg,
    ) -> Result<(), Error> {
        self.send_coordination_inner(phy, delay, msg, None, None)
    }

    /// Like [`send_coordination`](Self::send_coordination), but each attempt
    /// first waits for a TDM-safe window.
    ///
    /// Only the server still runs BLE alongside the low-latency link, so
    /// only the server waits; a client sends immediately.
    pub fn send_coordination_tdm<P: Phy, D: Delay, T: Timer>(
        &mut self,
        phy: &mut P,
        delay: &mut D,
        timer: &T,
        tdm: &TdmSchedule,
        role: Role,
        msg: &CoordinationMsg,
    ) -> Result<(), Error> {
        let gate = if role == Role::Server { Some(tdm) } else { None };
        self.send_coordination_inner(phy, delay, msg, gate, Some(timer))
    }

    fn send_coordination_inner<P: Phy, D: Delay>(
        &mut self,
        phy: &mut P,
        delay: &mut D,
        msg: &CoordinationMsg,
        gate: Option<&TdmSchedule>,
        timer: Option<&dyn Timer>,
    ) -> Result<(), Error> {
        let peer = self.peer.as_ref().ok_or(Error::InvalidState)?.addr;

        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = {
            let mut w = ByteWriter::new(&mut buf);
            w.write_u8(COORD_PREFIX)?;
            msg.to_bytes(&mut w)?;
            MAX_FRAME_LEN - w.space_left()
        };

        for attempt in 1..=COORD_SEND_ATTEMPTS {
            if let (Some(tdm), Some(timer)) = (gate, timer) {
                let waited = tdm.delay_until_safe(timer.now());
                delay.delay(waited);
            }
            match phy.send(&peer, &buf[..len]) {
                Ok(()) => return Ok(()),
                Err(_) if attempt < COORD_SEND_ATTEMPTS => {
                    trace!("coordination send attempt {} failed, retrying", attempt);
                    delay.delay(COORD_RETRY_DELAY);
                }
                Err(e) => {
                    self.coord_failures += 1;
                    warn!("coordination send failed after {} attempts", attempt);
                    return Err(e);
                }
            }
        }
        unreachable!("attempt loop always returns")
    }

    /// Processes one received frame.
    ///
    /// `rx_time` must be the timestamp captured at the top of the receive
    /// callback. Frames from anything but the configured peer, and frames
    /// of unknown shape, are counted and dropped (`Ok(None)`).
    pub fn handle_frame(
        &mut self,
        src: DeviceId,
        data: &[u8],
        rx_time: Instant,
    ) -> Result<Option<Inbound>, Error> {
        let peer = match &self.peer {
            Some(p) => p.addr,
            None => {
                self.warnings += 1;
                return Ok(None);
            }
        };
        if src != peer {
            trace!("frame from stranger {:?} dropped", src);
            self.warnings += 1;
            return Ok(None);
        }

        match data.first() {
            Some(&COORD_PREFIX) => {
                let mut r = ByteReader::new(&data[1..]);
                match CoordinationMsg::from_bytes(&mut r) {
                    Ok(msg) => Ok(Some(Inbound::Coordination { msg, rx_time })),
                    Err(_) => {
                        warn!("bad coordination frame {:?}", HexSlice(data));
                        self.warnings += 1;
                        Ok(None)
                    }
                }
            }
            _ if data.len() == Beacon::SIZE => match Beacon::parse(data) {
                Ok(beacon) => {
                    self.note_beacon_arrival(rx_time);
                    Ok(Some(Inbound::Beacon { beacon, rx_time }))
                }
                Err(e) => {
                    self.warnings += 1;
                    Err(e)
                }
            },
            _ => {
                self.warnings += 1;
                trace!("unroutable {}-byte frame dropped", data.len());
                Ok(None)
            }
        }
    }

    fn note_beacon_arrival(&mut self, rx_time: Instant) {
        self.metrics.beacons_received += 1;
        if let Some(expected) = self.expected_rx {
            let sample = rx_time.raw_micros() as i64 - expected.raw_micros() as i64;
            self.metrics.record(sample);
        }
        self.expected_rx = Some(rx_time + self.beacon_interval);
    }
}
