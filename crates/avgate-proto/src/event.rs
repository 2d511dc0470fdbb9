use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::codec::{render_ascii, render_hex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialStatus {
    pub baud: u32,
    pub invert_enabled: bool,
    pub auto_baud_running: bool,
    pub loopback_running: bool,
    pub profile_index: usize,
    pub bridge_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_remote_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub direction: Direction,
    pub hex: String,
    pub ascii: String,
}

impl DataFrame {
    pub fn new(direction: Direction, bytes: &[u8]) -> Self {
        Self { direction, hex: render_hex(bytes), ascii: render_ascii(bytes) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Status(SerialStatus),
    Sys { msg: String },
    Data(DataFrame),
    #[serde(rename_all = "camelCase")]
    MacroStarted { id: String, name: String, step_count: usize },
    #[serde(rename_all = "camelCase")]
    MacroStep { id: String, index: usize, kind: String, ok: bool, detail: String },
    #[serde(rename_all = "camelCase")]
    MacroFinished { id: String, ok_steps: usize, failed_steps: usize, elapsed_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    pub ts_unix_ms: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl GatewayEvent {
    pub fn now(kind: EventKind) -> Self {
        let ts_unix_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        Self { ts_unix_ms, kind }
    }
}

/// Observer sink shared by every component. Emitting with no subscriber
/// attached is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind) {
        let _ = self.tx.send(GatewayEvent::now(kind));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
