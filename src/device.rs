//! Device orchestrator.
//!
//! [`Core`] owns every engine and the platform handles, and wires the data
//! flow between them: BLE pairing exposes the LTK and peer address, the KDF
//! turns them into the link key, the transport installs the encrypted peer,
//! the role manager fixes server/client, the sync engine runs the handshake
//! and beacon stream (TDM-mediated), and the synchronized epoch finally
//! arms pattern playback. Button and BLE events interrupt the flow; a BLE
//! loss drops into the role manager's fallback rhythm.
//!
//! On an RTOS each `poll_*`/`on_*` entry point is called from its owning
//! task: [`poll_button`](Core::poll_button) from the button task,
//! [`on_ble_input`](Core::on_ble_input) from the BLE host callbacks, and
//! [`poll`](Core::poll) from the motor/pattern task. Traffic between task
//! contexts crosses only the bounded [`msg`](crate::msg) queues — events
//! are enqueued on the way out and each context drains its own mailbox —
//! so the engines hold no locks and share no state.

use crate::actuator::{self, LedMux, Motor, StatusPattern};
use crate::addr::DeviceId;
use crate::ble::{BleAction, BleInput, BleTask};
use crate::button::{ButtonEvent, ButtonFsm};
use crate::config::Config;
use crate::kdf::{self, Ltk};
use crate::msg::{
    BleMsg, BleToMotorQueue, ButtonMsg, ButtonToBleQueue, ButtonToMotorQueue, MotorMsg,
    MotorToButtonQueue,
};
use crate::pattern::segment::BuiltinPattern;
use crate::pattern::zone::ZoneConfig;
use crate::pattern::{PatternEngine, PlaybackEvent, TICK_INTERVAL};
use crate::power;
use crate::radio::frame::CoordinationMsg;
use crate::radio::tdm::TdmSchedule;
use crate::radio::{Inbound, Transport, DEFAULT_CHANNEL};
use crate::role::{FallbackPhase, FallbackState, Role, RoleEvent, RoleManager, SessionParams};
use crate::settings::Settings;
use crate::sync::{SyncEngine, SyncEvent, SyncOutput, BEACON_INTERVAL, COORD_START_DELAY};
use crate::time::{Instant, Timer};
use crate::Error;
use heapless::Deque;

/// PTP handshake restarts before giving up on the peer's timebase and
/// free-running locally.
pub const HANDSHAKE_RETRY_MAX: u8 = 2;

/// The platform handles, bundled for [`Core::new`].
pub struct Platform<C: Config> {
    pub timer: C::Timer,
    pub delay: C::Delay,
    pub phy: C::Phy,
    pub motor: C::Motor,
    pub led: C::Led,
    pub storage: C::Storage,
    pub sleep: C::Sleep,
}

/// The assembled device core. See the module docs.
pub struct Core<C: Config> {
    platform: Platform<C>,
    local_mac: DeviceId,

    transport: Transport,
    tdm: TdmSchedule,
    sync: SyncEngine,
    roles: RoleManager,
    pattern: PatternEngine,
    zone_cfg: ZoneConfig,
    ble: BleTask,
    button: ButtonFsm,
    led_mux: LedMux,

    settings: Settings,
    params: SessionParams,
    last_tick: Option<Instant>,
    handshake_retries: u8,
    end_requested: bool,
    shutting_down: bool,
    /// GAP-level actions awaiting the platform's BLE shim.
    ble_actions: Deque<BleAction, 4>,

    // Cross-task mailboxes. Each entry point below runs in its owning
    // task's context (`poll_button` on the button task, `on_ble_input` on
    // the BLE task, `poll` on the motor/pattern task), and traffic between
    // them crosses only through these bounded queues.
    button_to_motor: ButtonToMotorQueue,
    button_to_ble: ButtonToBleQueue,
    ble_to_motor: BleToMotorQueue,
    motor_to_button: MotorToButtonQueue,
}

fn builtin_for_mode(mode: u8) -> BuiltinPattern {
    match mode % 4 {
        0 => BuiltinPattern::Emergency,
        1 => BuiltinPattern::Alternating,
        2 => BuiltinPattern::Breathe,
        _ => BuiltinPattern::EmergencyQuad,
    }
}

impl<C: Config> Core<C> {
    pub fn new(platform: Platform<C>, local_mac: DeviceId) -> Self {
        let boot = platform.timer.now();
        Core {
            platform,
            local_mac,
            transport: Transport::new(DEFAULT_CHANNEL, BEACON_INTERVAL),
            tdm: TdmSchedule::default(),
            sync: SyncEngine::new(),
            roles: RoleManager::new(),
            pattern: PatternEngine::new(),
            zone_cfg: ZoneConfig::default(),
            ble: BleTask::new(),
            button: ButtonFsm::new(boot),
            led_mux: LedMux::new(),
            settings: Settings::default(),
            params: SessionParams::default(),
            last_tick: None,
            handshake_retries: 0,
            end_requested: false,
            shutting_down: false,
            ble_actions: Deque::new(),
            button_to_motor: ButtonToMotorQueue::new(),
            button_to_ble: ButtonToBleQueue::new(),
            ble_to_motor: BleToMotorQueue::new(),
            motor_to_button: MotorToButtonQueue::new(),
        }
    }

    /// Loads settings and brings up the radio transport.
    pub fn init(&mut self) -> Result<(), Error> {
        self.settings = Settings::load(&mut self.platform.storage);
        self.params = self.settings.session_params();
        self.transport.init(&mut self.platform.phy)
    }

    pub fn role(&self) -> Role {
        self.roles.role()
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn pattern(&self) -> &PatternEngine {
        &self.pattern
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn zone_config_mut(&mut self) -> &mut ZoneConfig {
        &mut self.zone_cfg
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn platform(&self) -> &Platform<C> {
        &self.platform
    }

    /// Asks the session-end rule to wind the session down at the next
    /// opportunity.
    pub fn request_session_end(&mut self) {
        self.end_requested = true;
    }

    /// Drains one pending GAP action for the platform's BLE shim.
    pub fn take_ble_action(&mut self) -> Option<BleAction> {
        self.ble_actions.pop_front()
    }

    /// Entry point for GAP/SMP callbacks from the BLE host shim.
    pub fn on_ble_input(&mut self, input: BleInput) -> Result<(), Error> {
        if self.shutting_down {
            return Ok(());
        }
        let now = self.platform.timer.now();
        let was_disconnect = matches!(input, BleInput::PeerDisconnected);

        if let Some(action) = self.ble.handle(input, now) {
            self.on_ble_action(action)?;
        }

        if was_disconnect
            && self.pattern.playback().playing
            && self.roles.fallback_phase() == FallbackPhase::None
        {
            self.enter_fallback(now);
        }
        Ok(())
    }

    fn on_ble_action(&mut self, action: BleAction) -> Result<(), Error> {
        match action {
            BleAction::NotifyPairingComplete {
                ltk,
                peer,
                advertised_first,
            } => {
                self.pairing_complete(ltk, peer, advertised_first)?;
                // Hand the session parameters over to the motor task.
                if self
                    .ble_to_motor
                    .enqueue(MotorMsg::PairingComplete(self.params))
                    .is_err()
                {
                    warn!("ble->motor queue full, params dropped");
                }
                Ok(())
            }
            BleAction::NotifyPairingFailed => {
                if self.ble_to_motor.enqueue(MotorMsg::PairingFailed).is_err() {
                    warn!("ble->motor queue full");
                }
                Ok(())
            }
            BleAction::StopAdvertising => {
                // The discovery window closed without a peer: run alone.
                if self.roles.role() == Role::Undetermined && !self.shutting_down {
                    self.roles.enter_standalone()?;
                    let now = self.platform.timer.now();
                    self.start_free_running(now)?;
                }
                self.queue_gap_action(BleAction::StopAdvertising);
                Ok(())
            }
            other => {
                self.queue_gap_action(other);
                Ok(())
            }
        }
    }

    fn queue_gap_action(&mut self, action: BleAction) {
        if self.ble_actions.push_back(action).is_err() {
            warn!("GAP action queue full, action dropped");
        }
    }

    /// Arms playback against the local clock only (standalone operation,
    /// or a peer whose timebase we gave up on).
    fn start_free_running(&mut self, now: Instant) -> Result<(), Error> {
        let epoch = self.sync.session_time_us(now + COORD_START_DELAY);
        if !self.pattern.is_valid() {
            self.pattern
                .load_builtin(builtin_for_mode(self.settings.mode), epoch)?;
        }
        self.pattern.start(epoch)?;
        self.roles.session_start(now);
        self.led_mux.set_motor_ownership(true);
        Ok(())
    }

    /// BLE pairing finished: derive the link key, install the encrypted
    /// peer, fix roles, and start synchronization.
    fn pairing_complete(
        &mut self,
        ltk: Ltk,
        peer: DeviceId,
        advertised_first: bool,
    ) -> Result<(), Error> {
        let role = self.roles.assign_from_pairing(advertised_first)?;
        let (server_mac, client_mac) = match role {
            Role::Server => (self.local_mac, peer),
            _ => (peer, self.local_mac),
        };
        let key = kdf::derive_from_ltk(ltk.as_bytes(), &server_mac, &client_mac)?;
        self.transport
            .set_peer_encrypted(&mut self.platform.phy, peer, key)?;
        self.roles
            .set_connection(crate::role::ConnectionState::Connected);

        let now = self.platform.timer.now();
        self.handshake_retries = 0;
        self.sync.start(role, now)?;

        if role == Role::Server {
            // Share the operational parameters with the new client.
            let msg = CoordinationMsg::RoleParams {
                role,
                params: self.params,
            };
            if let Err(e) = self.transport.send_coordination_tdm(
                &mut self.platform.phy,
                &mut self.platform.delay,
                &self.platform.timer,
                &self.tdm,
                role,
                &msg,
            ) {
                warn!("param share failed: {}", e);
            }
        } else {
            // The low-latency link is bootstrapped; a client stops running
            // BLE so it no longer contends for the radio.
            self.queue_gap_action(BleAction::DisableStack);
        }

        if !self.pattern.is_valid() {
            let now_us = self.sync.session_time_us(now);
            self.pattern
                .load_builtin(builtin_for_mode(self.settings.mode), now_us)?;
        }

        let _ = self
            .led_mux
            .apply_status(&mut self.platform.led, StatusPattern::PairingSuccess, true);
        Ok(())
    }

    /// Entry point for the radio receive callback.
    ///
    /// Must be called as the *first* thing after the frame arrives so the
    /// timestamp below is honest.
    pub fn on_radio_frame(&mut self, src: DeviceId, data: &[u8]) -> Result<(), Error> {
        let rx_time = self.platform.timer.now();
        match self.transport.handle_frame(src, data, rx_time)? {
            Some(Inbound::Beacon { beacon, rx_time }) => {
                self.roles.note_beacon(rx_time);
                if let Some(ev) = self.sync.handle_beacon(&beacon, rx_time) {
                    self.on_sync_event(ev)?;
                }
            }
            Some(Inbound::Coordination { msg, rx_time }) => {
                if let CoordinationMsg::RoleParams { params, .. } = msg {
                    debug!("peer params received: {:?}", params);
                    if self
                        .ble_to_motor
                        .enqueue(MotorMsg::PairingComplete(params))
                        .is_err()
                    {
                        warn!("ble->motor queue full, peer params dropped");
                    }
                }
                if self.roles.role() == Role::Server {
                    // T3 is stamped immediately before the send; PTP
                    // replies skip the TDM gate to keep the stamp honest.
                    let tx_time = self.platform.timer.now();
                    if let Some(reply) =
                        self.sync.handle_coordination_server(&msg, rx_time, tx_time)
                    {
                        if let Err(e) = self.transport.send_coordination(
                            &mut self.platform.phy,
                            &mut self.platform.delay,
                            &reply,
                        ) {
                            warn!("coordination reply failed: {}", e);
                        }
                    }
                } else if let Some(ev) = self.sync.handle_coordination_client(&msg, rx_time) {
                    self.on_sync_event(ev)?;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn on_sync_event(&mut self, event: SyncEvent) -> Result<(), Error> {
        let now = self.platform.timer.now();
        match event {
            SyncEvent::EpochArmed { epoch_us } => {
                if !self.pattern.is_valid() {
                    self.pattern
                        .load_builtin(builtin_for_mode(self.settings.mode), epoch_us)?;
                }
                self.pattern.start(epoch_us)?;
                self.roles.session_start(now);
                self.led_mux.set_motor_ownership(true);
                info!("playback armed for epoch {}µs", epoch_us);
            }
            SyncEvent::LockAcquired { offset_us } => {
                debug!("client locked, offset {}µs", offset_us);
            }
            SyncEvent::HandshakeFailed => {
                self.handshake_retries += 1;
                if self.handshake_retries <= HANDSHAKE_RETRY_MAX {
                    warn!("handshake retry {}", self.handshake_retries);
                    self.sync.start(self.roles.role(), now)?;
                } else {
                    // Give up on the peer's timebase and free-run: arm a
                    // local epoch so single-device stimulation still works.
                    warn!("handshake abandoned, free-running");
                    self.start_free_running(now)?;
                }
            }
            SyncEvent::BeaconGap => {
                self.enter_fallback(now);
            }
            SyncEvent::VersionMismatch => {
                let _ = self.led_mux.apply_status(
                    &mut self.platform.led,
                    StatusPattern::VersionMismatch,
                    true,
                );
            }
        }
        Ok(())
    }

    fn enter_fallback(&mut self, now: Instant) {
        let reference = if self.pattern.playback().playing {
            self.pattern.playback().start_time_us
        } else {
            self.sync.session_time_us(now)
        };
        self.roles.on_disconnect(
            now,
            FallbackState {
                params: self.params,
                reference_epoch_us: reference,
                forward_turn: true,
                disconnected_at: now,
                last_command_at: now,
            },
        );
    }

    /// Entry point for the button task: sample the (debounced-raw) level.
    ///
    /// FSM events leave through the button's outbound queues; the motor
    /// and BLE tasks pick them up on their own schedules.
    pub fn poll_button(&mut self, pressed: bool) -> Result<(), Error> {
        if self.shutting_down {
            return Ok(());
        }
        while let Some(msg) = self.motor_to_button.dequeue() {
            match msg {
                ButtonMsg::SessionTimeout => debug!("session timeout acknowledged"),
            }
        }

        let now = self.platform.timer.now();
        match self.button.poll(now, pressed) {
            Some(ButtonEvent::ModeChange) => {
                if self.button_to_motor.enqueue(MotorMsg::ModeChange).is_err() {
                    warn!("button->motor queue full, mode change dropped");
                }
                Ok(())
            }
            Some(ButtonEvent::BleReEnable) => {
                if self.button_to_ble.enqueue(BleMsg::ReEnable).is_err() {
                    warn!("button->ble queue full, re-enable dropped");
                }
                Ok(())
            }
            Some(ButtonEvent::EmergencyShutdown) => {
                if self
                    .button_to_motor
                    .enqueue(MotorMsg::EmergencyShutdown)
                    .is_err()
                {
                    warn!("button->motor queue full");
                }
                if self
                    .button_to_ble
                    .enqueue(BleMsg::EmergencyShutdown)
                    .is_err()
                {
                    warn!("button->ble queue full");
                }
                Ok(())
            }
            Some(ButtonEvent::FactoryReset) => {
                match crate::settings::factory_reset(&mut self.platform.storage) {
                    Ok(()) => {
                        let _ = self.led_mux.apply_status(
                            &mut self.platform.led,
                            StatusPattern::NvsReset,
                            true,
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Some(ButtonEvent::CountdownStarted) => {
                // Reclaim the LED for the purple countdown blinks.
                self.led_mux.set_motor_ownership(false);
                let _ = self.led_mux.apply_status(
                    &mut self.platform.led,
                    StatusPattern::Countdown,
                    true,
                );
                Ok(())
            }
            Some(ButtonEvent::CountdownAborted) => {
                let _ = self
                    .led_mux
                    .apply_status(&mut self.platform.led, StatusPattern::Countdown, false);
                if self.pattern.playback().playing {
                    self.led_mux.set_motor_ownership(true);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn cycle_mode(&mut self) -> Result<(), Error> {
        let next = (self.settings.mode + 1) % 4;
        let now_us = self
            .sync
            .session_time_us(self.platform.timer.now());
        let resume_at = if self.pattern.playback().playing {
            Some(self.pattern.playback().start_time_us)
        } else {
            None
        };
        match self.pattern.load_builtin(builtin_for_mode(next), now_us) {
            Ok(()) => {
                self.settings.mode = next;
                self.params.mode = next;
                if let Some(start) = resume_at {
                    self.pattern.start(start)?;
                }
                let _ = self.led_mux.apply_status(
                    &mut self.platform.led,
                    StatusPattern::ModeChange,
                    true,
                );
                Ok(())
            }
            Err(e) => {
                warn!("mode change rejected: {}", e);
                Ok(())
            }
        }
    }

    /// Shutdown sequence: settings out, key material zeroized, deep sleep.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        self.shutting_down = true;
        self.pattern.stop();
        self.sync.stop();
        power::shutdown(
            &self.settings,
            &mut self.platform.storage,
            &mut self.transport,
            &mut self.platform.phy,
            &mut self.platform.sleep,
        )
    }

    /// Main periodic entry point; drives every time-based engine.
    pub fn poll(&mut self) -> Result<(), Error> {
        if self.shutting_down {
            return Ok(());
        }
        let now = self.platform.timer.now();

        while let Some(output) = self.sync.poll(now) {
            match output {
                SyncOutput::Beacon(beacon) => {
                    self.transport.send_beacon(&mut self.platform.phy, &beacon)?;
                }
                SyncOutput::Send(msg) => {
                    if let Err(e) = self.transport.send_coordination_tdm(
                        &mut self.platform.phy,
                        &mut self.platform.delay,
                        &self.platform.timer,
                        &self.tdm,
                        self.roles.role(),
                        &msg,
                    ) {
                        warn!("coordination send failed: {}", e);
                    }
                }
                SyncOutput::Event(ev) => self.on_sync_event(ev)?,
            }
        }

        while let Some(event) = self.roles.poll(now) {
            match event {
                RoleEvent::SurvivorPromoted => {
                    // We are the server now; bring up a timebase for a
                    // future rejoiner.
                    self.sync.start(Role::Server, now)?;
                }
                RoleEvent::FallbackPhase2 => {}
                RoleEvent::AttemptReconnect => {
                    self.on_ble_input(BleInput::ReEnable)?;
                }
            }
        }

        // BLE task context: button requests first, then timer-driven work.
        while let Some(msg) = self.button_to_ble.dequeue() {
            let input = match msg {
                BleMsg::ReEnable => BleInput::ReEnable,
                BleMsg::EmergencyShutdown => BleInput::EmergencyShutdown,
            };
            if let Some(action) = self.ble.handle(input, now) {
                self.on_ble_action(action)?;
            }
        }
        if let Some(action) = self.ble.poll(now) {
            self.on_ble_action(action)?;
        }

        // Motor task context: drain the mailboxes, then run the tick. A
        // queued emergency shutdown abandons the tick entirely.
        while let Some(msg) = self.ble_to_motor.dequeue() {
            self.on_motor_msg(msg)?;
        }
        while let Some(msg) = self.button_to_motor.dequeue() {
            self.on_motor_msg(msg)?;
        }
        if self.shutting_down {
            return Ok(());
        }

        let due = self
            .last_tick
            .map_or(true, |last| now.saturating_duration_since(last) >= TICK_INTERVAL);
        if due {
            self.last_tick = Some(now);
            self.tick_playback(now)?;
        }

        Ok(())
    }

    /// Motor-task message handling.
    fn on_motor_msg(&mut self, msg: MotorMsg) -> Result<(), Error> {
        match msg {
            MotorMsg::ModeChange => self.cycle_mode(),
            MotorMsg::EmergencyShutdown => {
                self.led_mux.set_motor_ownership(false);
                self.platform.motor.coast()?;
                self.shutdown()
            }
            MotorMsg::PairingComplete(params) => {
                debug!("session params adopted: {:?}", params);
                self.params = params;
                Ok(())
            }
            MotorMsg::PairingFailed => {
                let _ = self
                    .led_mux
                    .apply_status(&mut self.platform.led, StatusPattern::PairingFailed, true);
                Ok(())
            }
        }
    }

    fn tick_playback(&mut self, now: Instant) -> Result<(), Error> {
        if self.roles.session_should_end(now, self.end_requested) {
            info!("session window elapsed");
            self.pattern.stop();
            self.roles.session_stop();
            self.end_requested = false;
            self.led_mux.set_motor_ownership(false);
            self.platform.motor.coast()?;
            // Depth-1 queue; a note already pending is enough.
            let _ = self.motor_to_button.enqueue(ButtonMsg::SessionTimeout);
            return Ok(());
        }

        let session_now = self.sync.session_time_us(now);
        let zone = self.roles.effective_zone(&self.zone_cfg);

        if self.roles.fallback_phase() != FallbackPhase::None {
            if let Some(drive) = self.roles.fallback_drive(session_now, zone) {
                if drive.active {
                    actuator::drive_zone(&mut self.platform.motor, zone, drive.intensity)?;
                } else {
                    self.platform.motor.coast()?;
                }
            }
            return Ok(());
        }

        match self.pattern.execute_tick(
            session_now,
            zone,
            &mut self.platform.motor,
            &mut self.platform.led,
        )? {
            PlaybackEvent::Completed => {
                self.roles.session_stop();
                self.led_mux.set_motor_ownership(false);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::testutil::{MotorCmd, SpyLed, SpyMotor};
    use crate::kdf::SessionKey;
    use crate::power::{Sleep, WakeSource};
    use crate::radio::Phy;
    use crate::settings::testutil::MemStorage;
    use crate::sync::SyncPhase;
    use crate::time::{Delay, Duration};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    const MAC_A: DeviceId = DeviceId::new([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
    const MAC_B: DeviceId = DeviceId::new([0xAA, 0xBB, 0xCC, 0x04, 0x05, 0x06]);

    /// Shared simulated wall clock with a per-device skew.
    #[derive(Clone)]
    struct SimClock {
        global: Rc<Cell<u64>>,
        skew_us: u64,
    }

    impl Timer for SimClock {
        fn now(&self) -> Instant {
            Instant::from_raw_micros(self.global.get() + self.skew_us)
        }
    }

    struct SimDelay;
    impl Delay for SimDelay {
        fn delay(&mut self, _d: Duration) {}
    }

    /// Collects outbound frames for the test harness to shuttle.
    struct SimPhy {
        outbox: Rc<RefCell<Vec<(DeviceId, Vec<u8>)>>>,
        channel: u8,
    }

    impl Phy for SimPhy {
        fn power_up(&mut self) -> Result<(), Error> {
            Ok(())
        }
        fn channel(&mut self) -> Result<u8, Error> {
            Ok(self.channel)
        }
        fn set_channel(&mut self, channel: u8) -> Result<(), Error> {
            self.channel = channel;
            Ok(())
        }
        fn add_peer(&mut self, _addr: &DeviceId, _key: Option<&SessionKey>) -> Result<(), Error> {
            Ok(())
        }
        fn remove_peer(&mut self, _addr: &DeviceId) -> Result<(), Error> {
            Ok(())
        }
        fn send(&mut self, dest: &DeviceId, frame: &[u8]) -> Result<(), Error> {
            self.outbox.borrow_mut().push((*dest, frame.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct SimSleep {
        slept: Cell<bool>,
    }
    impl Sleep for SimSleep {
        fn enter_deep_sleep(&mut self) -> Result<(), Error> {
            self.slept.set(true);
            Ok(())
        }
        fn wake_source(&self) -> WakeSource {
            WakeSource::PowerOn
        }
    }

    struct SimConfig;
    impl Config for SimConfig {
        type Timer = SimClock;
        type Delay = SimDelay;
        type Phy = SimPhy;
        type Motor = SpyMotor;
        type Led = SpyLed;
        type Storage = MemStorage;
        type Sleep = SimSleep;
    }

    struct SimDevice {
        core: Core<SimConfig>,
        mac: DeviceId,
        outbox: Rc<RefCell<Vec<(DeviceId, Vec<u8>)>>>,
    }

    fn device(global: &Rc<Cell<u64>>, mac: DeviceId, skew_us: u64) -> SimDevice {
        let outbox = Rc::new(RefCell::new(Vec::new()));
        let platform = Platform::<SimConfig> {
            timer: SimClock {
                global: global.clone(),
                skew_us,
            },
            delay: SimDelay,
            phy: SimPhy {
                outbox: outbox.clone(),
                channel: 0,
            },
            motor: SpyMotor::default(),
            led: SpyLed::default(),
            storage: MemStorage::default(),
            sleep: SimSleep::default(),
        };
        let mut core = Core::new(platform, mac);
        core.init().unwrap();
        SimDevice { core, mac, outbox }
    }

    fn pair(dev: &mut SimDevice, peer: DeviceId, advertised_first: bool) {
        dev.core.on_ble_input(BleInput::ReEnable).unwrap();
        dev.core.on_ble_input(BleInput::PeerConnected).unwrap();
        dev.core
            .on_ble_input(BleInput::PairingComplete {
                ltk: Ltk::new([0x42; 16]),
                peer,
                advertised_first,
            })
            .unwrap();
    }

    /// Moves every queued frame from `from` to `to` (broadcast or unicast
    /// to `to`'s address).
    fn shuttle(from: &mut SimDevice, to: &mut SimDevice) {
        let frames: Vec<_> = from.outbox.borrow_mut().drain(..).collect();
        for (dest, frame) in frames {
            if dest == to.mac || dest.is_broadcast() {
                to.core.on_radio_frame(from.mac, &frame).unwrap();
            }
        }
    }

    fn run_until(
        a: &mut SimDevice,
        b: &mut SimDevice,
        global: &Rc<Cell<u64>>,
        stop_at_us: u64,
    ) {
        while global.get() < stop_at_us {
            global.set(global.get() + 1_000);
            a.core.poll().unwrap();
            shuttle(a, b);
            b.core.poll().unwrap();
            shuttle(b, a);
            // Replies may themselves need delivering.
            shuttle(a, b);
        }
    }

    /// Full pair-sync-play exercise across two simulated devices whose
    /// clocks disagree by 123.456 ms.
    #[test]
    fn two_devices_pair_sync_and_alternate() {
        let global = Rc::new(Cell::new(1_000_000u64));
        let mut a = device(&global, MAC_A, 0);
        let mut b = device(&global, MAC_B, 123_456);

        pair(&mut a, MAC_B, true);
        pair(&mut b, MAC_A, false);
        assert_eq!(a.core.role(), Role::Server);
        assert_eq!(b.core.role(), Role::Client);
        assert!(a.core.transport().is_encrypted());
        assert!(b.core.transport().is_encrypted());
        // The client shuts its BLE stack down once bootstrapped.
        assert_eq!(b.core.take_ble_action(), Some(BleAction::StartAdvertising));
        assert_eq!(b.core.take_ble_action(), Some(BleAction::DisableStack));

        // Run two simulated seconds: handshake, burst, lock, epoch.
        run_until(&mut a, &mut b, &global, 3_000_000);

        assert_eq!(b.core.sync().phase(), SyncPhase::Synced);
        // Zero simulated flight time: the client recovers the skew
        // exactly.
        assert_eq!(b.core.sync().offset_us(), -123_456);

        let epoch = a.core.sync().epoch_us().expect("server armed an epoch");
        assert_eq!(b.core.sync().epoch_us(), Some(epoch));
        assert!(a.core.pattern().playback().playing);
        assert!(b.core.pattern().playback().playing);
        // The client adopted the server's session parameters.
        assert_eq!(b.core.params, a.core.params);

        // 520 ms into the pattern: segment 0 — left on, right silent.
        run_until(&mut a, &mut b, &global, epoch + 520_000);
        assert_eq!(
            b.core.platform().motor.last(),
            Some(MotorCmd::Forward(60)),
            "client (left zone) should be driving"
        );
        assert_eq!(a.core.platform().motor.last(), Some(MotorCmd::Coast));

        // 1520 ms in: segment 1 — the columns swap.
        run_until(&mut a, &mut b, &global, epoch + 1_520_000);
        assert_eq!(a.core.platform().motor.last(), Some(MotorCmd::Reverse(60)));
        assert_eq!(b.core.platform().motor.last(), Some(MotorCmd::Coast));
    }

    #[test]
    fn beacon_loss_enters_fallback_and_promotes_survivor() {
        let global = Rc::new(Cell::new(1_000_000u64));
        let mut a = device(&global, MAC_A, 0);
        let mut b = device(&global, MAC_B, 50_000);

        pair(&mut a, MAC_B, true);
        pair(&mut b, MAC_A, false);
        run_until(&mut a, &mut b, &global, 3_000_000);
        assert_eq!(b.core.sync().phase(), SyncPhase::Synced);

        // The server dies: advance the client alone. The beacon gap must
        // push it into fallback, and after the survivor timeout it owns
        // the server role.
        let die_at = global.get();
        while global.get() < die_at + 31_000_000 {
            global.set(global.get() + 1_000);
            b.core.poll().unwrap();
            b.outbox.borrow_mut().clear();
        }
        assert_ne!(b.core.roles.fallback_phase(), FallbackPhase::None);
        assert_eq!(b.core.role(), Role::Server);

        // The fallback rhythm keeps driving the motor.
        let cmds = &b.core.platform().motor.commands;
        assert!(cmds.iter().any(|c| matches!(c, MotorCmd::Forward(_))));
    }

    #[test]
    fn discovery_timeout_enters_standalone_free_run() {
        let global = Rc::new(Cell::new(1_000_000u64));
        let mut a = device(&global, MAC_A, 0);
        a.core.on_ble_input(BleInput::ReEnable).unwrap();

        // The advertising budget expires with no peer in sight.
        global.set(global.get() + 301_000_000);
        a.core.poll().unwrap();
        assert_eq!(a.core.role(), Role::Standalone);
        assert!(a.core.pattern().playback().playing);

        // Free-running epoch lies 3 s out; run past it and observe the
        // left-zone output (standalone devices drive left).
        let epoch = a.core.pattern().playback().start_time_us;
        while global.get() < epoch + 600_000 {
            global.set(global.get() + 10_000);
            a.core.poll().unwrap();
            a.outbox.borrow_mut().clear();
        }
        assert_eq!(a.core.platform().motor.last(), Some(MotorCmd::Forward(60)));
    }

    #[test]
    fn emergency_shutdown_round_trip() {
        let global = Rc::new(Cell::new(1_000_000u64));
        let mut a = device(&global, MAC_A, 0);
        pair(&mut a, MAC_B, true);

        // Hold 5.5 s, release, let the countdown run out.
        let mut t = global.get();
        for _ in 0..560 {
            t += 10_000;
            global.set(t);
            a.core.poll_button(true).unwrap();
        }
        for _ in 0..110 {
            t += 10_000;
            global.set(t);
            a.core.poll_button(false).unwrap();
        }

        // The shutdown crossed the button->motor and button->ble queues;
        // the next motor/BLE poll consumes it and powers down.
        assert!(!a.core.is_shutting_down());
        a.core.poll().unwrap();
        assert!(a.core.is_shutting_down());
        assert!(a.core.platform().sleep.slept.get());
        // The encrypted peer was torn down on the way out.
        assert!(!a.core.transport().is_encrypted());
        // Settings were persisted.
        assert!(!a.core.platform.storage.map.is_empty());
    }
}
