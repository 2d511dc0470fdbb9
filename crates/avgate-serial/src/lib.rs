pub mod autobaud;
pub mod bridge;
pub mod doctor;
pub mod line;
pub mod loopback;
pub mod manager;
pub mod profile;

use anyhow::Result;
use serde::Deserialize;

pub use line::{MemoryLine, SerialLine, UartLine};
pub use manager::{SerialCommand, SerialError, SerialHandle, SerialManager, SerialMode};

pub const DEFAULT_BAUD: u32 = 9600;

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. "/dev/ttyUSB0". "loopback" runs against an
    /// in-memory line that echoes every write back.
    pub dev: String,

    /// Initial rate; must be one of the auto-baud ladder values.
    pub baud: Option<u32>,

    /// Start with polarity inversion enabled.
    pub invert: Option<bool>,

    /// Profile applied at startup (sets baud and presets).
    pub profile: Option<usize>,
}

impl SerialConfig {
    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(DEFAULT_BAUD)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub enable: bool,

    /// Listen address for the line-view client. Default 0.0.0.0:23.
    pub listen: Option<String>,
}

impl BridgeConfig {
    pub fn listen_addr(&self) -> String {
        self.listen.clone().unwrap_or_else(|| "0.0.0.0:23".into())
    }
}

pub fn open_line(cfg: &SerialConfig) -> Result<Box<dyn SerialLine>> {
    if cfg.dev == "loopback" {
        tracing::info!("serial: using in-memory loopback line");
        return Ok(Box::new(MemoryLine::echo(cfg.baud())));
    }
    Ok(Box::new(UartLine::open(&cfg.dev, cfg.baud())?))
}
