use avgate_proto::{encode_payload, EncodeMode, Suffix};
use avgate_serial::{SerialError, SerialHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::info;

use crate::error::StepError;
use crate::model::{MacroStep, StepKind};
use crate::StepConfig;

const RESPONSE_LIMIT: usize = 1024;
const RESPONSE_PREVIEW_CHARS: usize = 80;

/// Where RS-232 steps go. The gateway wires this to the serial manager's handle.
pub trait Rs232Port: Send + Sync {
    fn send(&self, payload: &str, mode: EncodeMode, suffix: Suffix) -> Result<(), StepError>;
}

impl Rs232Port for SerialHandle {
    fn send(&self, payload: &str, mode: EncodeMode, suffix: Suffix) -> Result<(), StepError> {
        SerialHandle::send(self, payload, mode, suffix).map_err(|e| match e {
            SerialError::Encode(e) => StepError::Encode(e),
            other => StepError::SerialUnavailable(other.to_string()),
        })
    }
}

pub struct StepExecutor {
    connect_timeout: Duration,
    read_window: Duration,
    serial: Option<Arc<dyn Rs232Port>>,
}

impl StepExecutor {
    pub fn new(cfg: &StepConfig) -> Self {
        Self { connect_timeout: cfg.connect_timeout(), read_window: cfg.read_window(), serial: None }
    }

    pub fn with_serial(mut self, port: Arc<dyn Rs232Port>) -> Self {
        self.serial = Some(port);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Performs the step's transport action. Delay steps do nothing here; the
    /// scheduler owns all sleeping. Returns a short description for the report.
    pub async fn execute(&self, step: &MacroStep) -> Result<String, StepError> {
        match step.kind {
            StepKind::Tcp => self.tcp(step).await,
            StepKind::Udp => self.udp(step).await,
            StepKind::Rs232 => self.rs232(step),
            StepKind::Delay => Ok(format!("wait {} ms", step.delay_ms)),
        }
    }

    async fn tcp(&self, step: &MacroStep) -> Result<String, StepError> {
        let bytes = encode_payload(&step.payload, step.mode, step.suffix)?;
        let addr = format!("{}:{}", step.target, step.port);

        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => return Err(StepError::Connect { addr, source }),
            Err(_) => return Err(StepError::ConnectTimeout { addr, after: self.connect_timeout }),
        };

        if let Err(source) = stream.write_all(&bytes).await {
            return Err(StepError::Io { addr, source });
        }

        let response = self.read_response(&mut stream).await;
        let _ = stream.shutdown().await;

        if !response.is_empty() {
            let text: String = String::from_utf8_lossy(&response).chars().take(RESPONSE_PREVIEW_CHARS).collect();
            info!("macro:     response: {}", text.trim_end());
        }
        Ok(format!("sent {} bytes to {}, {} bytes back", bytes.len(), addr, response.len()))
    }

    async fn read_response(&self, stream: &mut TcpStream) -> Vec<u8> {
        let deadline = Instant::now() + self.read_window;
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while out.len() < RESPONSE_LIMIT {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match timeout(left, stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            }
        }
        out
    }

    async fn udp(&self, step: &MacroStep) -> Result<String, StepError> {
        let bytes = encode_payload(&step.payload, step.mode, step.suffix)?;
        let addr = format!("{}:{}", step.target, step.port);
        let sock = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(source) => return Err(StepError::Io { addr, source }),
        };
        if let Err(source) = sock.send_to(&bytes, &addr).await {
            return Err(StepError::Io { addr, source });
        }
        Ok(format!("sent {} bytes to {}", bytes.len(), addr))
    }

    fn rs232(&self, step: &MacroStep) -> Result<String, StepError> {
        let port = self
            .serial
            .as_ref()
            .ok_or_else(|| StepError::SerialUnavailable("no serial port attached".into()))?;
        port.send(&step.payload, step.mode, step.suffix)?;
        Ok(format!("queued {:?} for serial", step.payload))
    }
}
