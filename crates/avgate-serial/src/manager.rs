use avgate_proto::{
    encode_payload, invert_bytes, DataFrame, Direction, EncodeError, EncodeMode, EventBus, EventKind, SerialStatus,
    Suffix,
};
use serde::Deserialize;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::autobaud::{is_supported_baud, AutoBaud, ScanStep, BAUD_LADDER};
use crate::bridge::{Bridge, BridgeEvent};
use crate::line::SerialLine;
use crate::loopback::{Loopback, LoopbackOutcome, MARKER};
use crate::profile;

/// Normal RX is drained at most one buffer per tick.
pub const RX_CHUNK: usize = 256;

const MAX_COMMANDS_PER_TICK: usize = 16;
const MAX_SCAN_BYTES_PER_TICK: usize = 4096;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("baud {0} is not a supported rate")]
    UnsupportedBaud(u32),
    #[error("unknown profile index {0}")]
    UnknownProfile(usize),
    #[error("preset {0} out of range (1..=3)")]
    UnknownPreset(u8),
    #[error("{active} is running")]
    ModeBusy { active: &'static str },
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("serial manager is not running")]
    Closed,
}

/// Control-surface commands, decoded from `{"action": ...}` JSON.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SerialCommand {
    Baud { baud: u32 },
    Invert { val: bool },
    Profile { id: usize },
    Preset { n: u8 },
    Autobaud { start: bool },
    Loopback,
    Send {
        #[serde(default)]
        data: String,
        #[serde(default)]
        mode: EncodeMode,
        #[serde(default)]
        suffix: Suffix,
    },
    /// Pre-encoded clean bytes queued by another context.
    #[serde(skip)]
    Transmit(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialMode {
    Idle,
    AutoBaudScanning,
    LoopbackTesting,
}

enum Mode {
    Idle,
    AutoBaud(AutoBaud),
    Loopback(Loopback),
}

impl Mode {
    fn public(&self) -> SerialMode {
        match self {
            Mode::Idle => SerialMode::Idle,
            Mode::AutoBaud(_) => SerialMode::AutoBaudScanning,
            Mode::Loopback(_) => SerialMode::LoopbackTesting,
        }
    }
}

/// Cloneable entry point for contexts that do not own the manager. Commands
/// are queued and applied by the owning loop on its next pump.
#[derive(Debug, Clone)]
pub struct SerialHandle {
    tx: mpsc::UnboundedSender<SerialCommand>,
}

impl SerialHandle {
    pub fn submit(&self, cmd: SerialCommand) -> Result<(), SerialError> {
        self.tx.send(cmd).map_err(|_| SerialError::Closed)
    }

    /// Encodes up front so a malformed payload is reported to the caller.
    pub fn send(&self, payload: &str, mode: EncodeMode, suffix: Suffix) -> Result<(), SerialError> {
        let bytes = encode_payload(payload, mode, suffix)?;
        self.submit(SerialCommand::Transmit(bytes))
    }
}

/// Sole owner of the UART.
pub struct SerialManager {
    line: Box<dyn SerialLine>,
    baud: u32,
    invert: bool,
    profile: usize,
    mode: Mode,
    last_loopback: Option<LoopbackOutcome>,
    bridge: Option<Bridge>,
    events: EventBus,
    commands: mpsc::UnboundedReceiver<SerialCommand>,
    handle: SerialHandle,
}

impl SerialManager {
    /// `line` must already be open at `baud`.
    pub fn new(line: Box<dyn SerialLine>, baud: u32, events: EventBus) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        Self {
            line,
            baud,
            invert: false,
            profile: 0,
            mode: Mode::Idle,
            last_loopback: None,
            bridge: None,
            events,
            commands,
            handle: SerialHandle { tx },
        }
    }

    pub fn with_bridge(mut self, bridge: Bridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn handle(&self) -> SerialHandle {
        self.handle.clone()
    }

    pub fn mode(&self) -> SerialMode {
        self.mode.public()
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn last_loopback(&self) -> Option<LoopbackOutcome> {
        self.last_loopback
    }

    pub fn status(&self) -> SerialStatus {
        SerialStatus {
            baud: self.baud,
            invert_enabled: self.invert,
            auto_baud_running: matches!(self.mode, Mode::AutoBaud(_)),
            loopback_running: matches!(self.mode, Mode::Loopback(_)),
            profile_index: self.profile,
            bridge_connected: self.bridge.as_ref().is_some_and(|b| b.is_connected()),
            bridge_remote_address: self.bridge.as_ref().and_then(|b| b.remote()).map(|a| a.to_string()),
        }
    }

    pub fn apply(&mut self, cmd: SerialCommand) -> Result<(), SerialError> {
        self.apply_at(cmd, Instant::now())
    }

    pub fn apply_at(&mut self, cmd: SerialCommand, now: Instant) -> Result<(), SerialError> {
        match cmd {
            SerialCommand::Baud { baud } => self.set_baud(baud),
            SerialCommand::Invert { val } => {
                self.set_invert(val);
                Ok(())
            }
            SerialCommand::Profile { id } => self.select_profile(id),
            SerialCommand::Preset { n } => self.trigger_preset(n),
            SerialCommand::Autobaud { start: true } => self.start_auto_baud_at(now),
            SerialCommand::Autobaud { start: false } => {
                self.stop_auto_baud();
                Ok(())
            }
            SerialCommand::Loopback => self.start_loopback_at(now),
            SerialCommand::Send { data, mode, suffix } => self.send(&data, mode, suffix),
            SerialCommand::Transmit(bytes) => {
                self.transmit(&bytes, true);
                Ok(())
            }
        }
    }

    /// Refused while an auto-baud scan owns the rate.
    pub fn set_baud(&mut self, baud: u32) -> Result<(), SerialError> {
        self.ensure_not_scanning()?;
        self.apply_baud(baud)
    }

    fn apply_baud(&mut self, baud: u32) -> Result<(), SerialError> {
        if !is_supported_baud(baud) {
            return Err(SerialError::UnsupportedBaud(baud));
        }
        if baud == self.baud {
            return Ok(());
        }
        self.baud = baud;
        if let Err(e) = self.line.reopen(baud) {
            warn!("serial: reopen @ {} failed: {:#}", baud, e);
        }
        info!("serial: baud changed to {}", baud);
        self.broadcast_status();
        self.sys(format!("Baud changed to {}", baud));
        Ok(())
    }

    pub fn set_invert(&mut self, invert: bool) {
        self.invert = invert;
        info!("serial: invert polarity {}", if invert { "on" } else { "off" });
        self.broadcast_status();
        self.sys(format!("Invert Polarity: {}", if invert { "ON" } else { "OFF" }));
    }

    pub fn select_profile(&mut self, index: usize) -> Result<(), SerialError> {
        let p = profile::profile(index).ok_or(SerialError::UnknownProfile(index))?;
        self.ensure_not_scanning()?;
        self.profile = index;
        if p.baud == self.baud {
            self.broadcast_status();
        } else {
            self.apply_baud(p.baud)?;
        }
        self.sys(format!("Profile set: {}", p.name));
        Ok(())
    }

    pub fn trigger_preset(&mut self, n: u8) -> Result<(), SerialError> {
        let p = profile::profile(self.profile).ok_or(SerialError::UnknownProfile(self.profile))?;
        let cmd = p.preset(n).ok_or(SerialError::UnknownPreset(n))?;
        self.send(&cmd, EncodeMode::Ascii, Suffix::None)
    }

    pub fn start_auto_baud(&mut self) -> Result<(), SerialError> {
        self.start_auto_baud_at(Instant::now())
    }

    pub fn start_auto_baud_at(&mut self, now: Instant) -> Result<(), SerialError> {
        if let Mode::Loopback(_) = self.mode {
            return Err(SerialError::ModeBusy { active: "loopback test" });
        }
        self.apply_baud(BAUD_LADDER[0])?;
        self.mode = Mode::AutoBaud(AutoBaud::start(now));
        info!("serial: auto-baud scan started");
        self.sys("Auto-baud scan started...".into());
        self.broadcast_status();
        Ok(())
    }

    pub fn stop_auto_baud(&mut self) {
        if let Mode::AutoBaud(_) = self.mode {
            self.mode = Mode::Idle;
            info!("serial: auto-baud scan stopped at {}", self.baud);
        }
        self.sys("Auto-baud stopped".into());
        self.broadcast_status();
    }

    pub fn start_loopback(&mut self) -> Result<(), SerialError> {
        self.start_loopback_at(Instant::now())
    }

    pub fn start_loopback_at(&mut self, now: Instant) -> Result<(), SerialError> {
        if let Mode::AutoBaud(_) = self.mode {
            return Err(SerialError::ModeBusy { active: "auto-baud scan" });
        }
        self.mode = Mode::Loopback(Loopback::start(now));
        self.last_loopback = None;
        self.sys("Loopback test started...".into());
        self.send(MARKER, EncodeMode::Ascii, Suffix::CrLf)?;
        self.broadcast_status();
        Ok(())
    }

    pub fn send(&mut self, payload: &str, mode: EncodeMode, suffix: Suffix) -> Result<(), SerialError> {
        let bytes = encode_payload(payload, mode, suffix)?;
        self.transmit(&bytes, true);
        Ok(())
    }

    pub fn pump(&mut self) {
        self.pump_at(Instant::now())
    }

    /// One non-blocking service pass. Call every loop iteration.
    pub fn pump_at(&mut self, now: Instant) {
        self.drain_commands(now);
        self.service_bridge();

        if let Mode::AutoBaud(_) = self.mode {
            self.scan(now);
            return;
        }

        self.drain_rx(now);
        self.check_loopback_deadline(now);
    }

    fn drain_commands(&mut self, now: Instant) {
        for _ in 0..MAX_COMMANDS_PER_TICK {
            let Ok(cmd) = self.commands.try_recv() else { break };
            if let Err(e) = self.apply_at(cmd, now) {
                warn!("serial: command rejected: {}", e);
                self.sys(format!("Command rejected: {}", e));
            }
        }
    }

    fn service_bridge(&mut self) {
        let Some(bridge) = self.bridge.as_mut() else { return };
        let mut inbound = Vec::new();
        let events = bridge.service(&mut inbound);

        for ev in events {
            match ev {
                BridgeEvent::Connected(peer) => {
                    info!("bridge: client connected {}", peer);
                    self.sys(format!("Bridge connected: {}", peer.ip()));
                    self.broadcast_status();
                }
                BridgeEvent::Rejected(peer) => {
                    info!("bridge: rejected {} (busy)", peer);
                }
                BridgeEvent::Disconnected(peer) => {
                    info!("bridge: client disconnected {}", peer);
                    self.sys("Bridge disconnected".into());
                    self.broadcast_status();
                }
            }
        }

        if !inbound.is_empty() {
            self.transmit(&inbound, false);
        }
    }

    fn scan(&mut self, now: Instant) {
        let mut buf = [0u8; RX_CHUNK];
        let mut consumed = 0;
        while consumed < MAX_SCAN_BYTES_PER_TICK {
            let n = self.read_line(&mut buf);
            if n == 0 {
                break;
            }
            consumed += n;
            if self.invert {
                invert_bytes(&mut buf[..n]);
            }
            if let Mode::AutoBaud(scan) = &mut self.mode {
                scan.observe(&buf[..n]);
            }
        }

        let step = match &mut self.mode {
            Mode::AutoBaud(scan) => scan.tick(now),
            _ => return,
        };

        match step {
            ScanStep::Pending => {}
            ScanStep::Scored { good, score } => {
                self.sys(format!("Auto-baud check: good bytes={} score={}", good, score));
            }
            ScanStep::Detected { good } => {
                self.sys(format!("Auto-baud check: good bytes={} score={}", good, crate::autobaud::REQUIRED_SCORE));
                self.mode = Mode::Idle;
                info!("serial: auto-baud detected {}", self.baud);
                self.sys(format!("Auto-baud detected: {}", self.baud));
                self.broadcast_status();
            }
            ScanStep::Advance { baud } => {
                debug!("serial: auto-baud trying {}", baud);
                if let Err(e) = self.apply_baud(baud) {
                    warn!("serial: auto-baud could not switch: {}", e);
                }
                self.sys(format!("Scanning {}...", baud));
            }
        }
    }

    fn drain_rx(&mut self, now: Instant) {
        let mut buf = [0u8; RX_CHUNK];
        let n = self.read_line(&mut buf);
        if n == 0 {
            return;
        }
        let clean = &mut buf[..n];
        if self.invert {
            invert_bytes(clean);
        }

        let outcome = match &mut self.mode {
            Mode::Loopback(test) => test.observe(clean),
            _ => None,
        };
        if let Some(outcome) = outcome {
            self.finish_loopback(outcome, now);
        }

        if let Some(bridge) = self.bridge.as_mut() {
            bridge.write(clean);
        }
        self.events.emit(EventKind::Data(DataFrame::new(Direction::Rx, clean)));
    }

    fn check_loopback_deadline(&mut self, now: Instant) {
        let outcome = match &self.mode {
            Mode::Loopback(test) => test.check_deadline(now),
            _ => None,
        };
        if let Some(outcome) = outcome {
            self.finish_loopback(outcome, now);
        }
    }

    fn finish_loopback(&mut self, outcome: LoopbackOutcome, now: Instant) {
        let elapsed = match &self.mode {
            Mode::Loopback(test) => test.elapsed(now),
            _ => Default::default(),
        };
        self.mode = Mode::Idle;
        self.last_loopback = Some(outcome);
        match outcome {
            LoopbackOutcome::Pass => {
                info!("serial: loopback PASS after {} ms", elapsed.as_millis());
                self.sys("Loopback PASS".into());
            }
            LoopbackOutcome::Fail => {
                warn!("serial: loopback FAIL (timeout after {} ms)", elapsed.as_millis());
                self.sys("Loopback FAIL (Timeout)".into());
            }
        }
        self.broadcast_status();
    }

    /// Writes clean bytes to the wire, complemented when inversion is on.
    /// The line view and the observer always see the clean form.
    fn transmit(&mut self, clean: &[u8], mirror_to_bridge: bool) {
        let mut wire = clean.to_vec();
        if self.invert {
            invert_bytes(&mut wire);
        }
        if let Err(e) = self.line.write_bytes(&wire) {
            warn!("serial: write failed: {:#}", e);
        }
        if mirror_to_bridge {
            if let Some(bridge) = self.bridge.as_mut() {
                bridge.write(clean);
            }
        }
        self.events.emit(EventKind::Data(DataFrame::new(Direction::Tx, clean)));
    }

    fn read_line(&mut self, buf: &mut [u8]) -> usize {
        match self.line.read_available(buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("serial: read failed: {:#}", e);
                0
            }
        }
    }

    fn ensure_not_scanning(&self) -> Result<(), SerialError> {
        match self.mode {
            Mode::AutoBaud(_) => Err(SerialError::ModeBusy { active: "auto-baud scan" }),
            _ => Ok(()),
        }
    }

    fn broadcast_status(&self) {
        self.events.emit(EventKind::Status(self.status()));
    }

    fn sys(&self, msg: String) {
        self.events.emit(EventKind::Sys { msg });
    }
}
