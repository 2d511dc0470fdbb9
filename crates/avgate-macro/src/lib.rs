pub mod doctor;
pub mod error;
pub mod executor;
pub mod model;
pub mod scheduler;
pub mod store;

use serde::Deserialize;
use std::time::Duration;

pub use error::{MacroError, StepError};
pub use executor::{Rs232Port, StepExecutor};
pub use model::{Macro, MacroRecord, MacroStep, MacroSummary, StepKind};
pub use scheduler::{RunReport, Scheduler, StepReport};
pub use store::{BlobStore, FileBlobStore, MacroStore, MemoryBlobStore};

#[derive(Debug, Clone, Deserialize)]
pub struct MacroConfig {
    /// Directory holding the persisted macro blob.
    pub store_dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepConfig {
    /// TCP connect timeout per step. Default 3000 ms.
    pub tcp_connect_timeout_ms: Option<u64>,

    /// How long a TCP step listens for a reply before closing. Default 200 ms.
    pub tcp_read_window_ms: Option<u64>,
}

impl StepConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_timeout_ms.unwrap_or(3000))
    }

    pub fn read_window(&self) -> Duration {
        Duration::from_millis(self.tcp_read_window_ms.unwrap_or(200))
    }
}
