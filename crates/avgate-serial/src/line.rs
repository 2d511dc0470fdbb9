use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_serial::SerialPort;
use tracing::info;

/// Pause between closing the UART and reopening it at a new rate. `reopen`
/// sleeps for this on the calling thread, so a baud change costs the pump one
/// slice of at most this long plus the open itself.
pub const SETTLE: Duration = Duration::from_millis(10);

/// The physical RS-232 line. Only the serial manager holds one.
pub trait SerialLine: Send {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Never blocks: returns 0 when nothing is buffered.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Runs on the pump; may block for up to [`SETTLE`] plus the device open.
    fn reopen(&mut self, baud: u32) -> Result<()>;
}

pub struct UartLine {
    dev: String,
    port: Option<Box<dyn SerialPort>>,
}

impl UartLine {
    pub fn open(dev: &str, baud: u32) -> Result<Self> {
        let port = open_port(dev, baud)?;
        info!("serial: opened {} @ {}", dev, baud);
        Ok(Self { dev: dev.to_string(), port: Some(port) })
    }
}

fn open_port(dev: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    tokio_serial::new(dev, baud)
        .timeout(Duration::from_millis(1))
        .open()
        .with_context(|| format!("open serial device {} @ {}", dev, baud))
}

impl SerialLine for UartLine {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().context("serial line is closed")?;
        port.write_all(data).context("serial write")?;
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(port) = self.port.as_mut() else { return Ok(0) };
        let pending = port.bytes_to_read().context("serial bytes_to_read")? as usize;
        if pending == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = pending.min(buf.len());
        match port.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e).context("serial read"),
        }
    }

    fn reopen(&mut self, baud: u32) -> Result<()> {
        self.port = None;
        std::thread::sleep(SETTLE);
        self.port = Some(open_port(&self.dev, baud)?);
        Ok(())
    }
}

pub fn available_devices() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().context("enumerate serial ports")?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[derive(Debug, Default)]
struct MemoryInner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    baud: u32,
    reopens: u32,
    echo: bool,
}

/// In-memory line for dry runs and tests. Clones share the same buffers, so a
/// test can keep one clone to inject RX bytes and inspect what hit the wire.
#[derive(Debug, Clone, Default)]
pub struct MemoryLine {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryLine {
    pub fn new(baud: u32) -> Self {
        let line = Self::default();
        line.inner.lock().unwrap().baud = baud;
        line
    }

    /// Every write is fed back into the receive queue, like a TX-RX jumper.
    pub fn echo(baud: u32) -> Self {
        let line = Self::new(baud);
        line.inner.lock().unwrap().echo = true;
        line
    }

    pub fn inject(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().rx.extend(bytes.iter().copied());
    }

    pub fn take_tx(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().tx)
    }

    pub fn baud(&self) -> u32 {
        self.inner.lock().unwrap().baud
    }

    pub fn reopens(&self) -> u32 {
        self.inner.lock().unwrap().reopens
    }

    pub fn pending_rx(&self) -> usize {
        self.inner.lock().unwrap().rx.len()
    }
}

impl SerialLine for MemoryLine {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tx.extend_from_slice(data);
        if inner.echo {
            inner.rx.extend(data.iter().copied());
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.rx.len().min(buf.len());
        for (slot, b) in buf.iter_mut().zip(inner.rx.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }

    fn reopen(&mut self, baud: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.baud = baud;
        inner.reopens += 1;
        Ok(())
    }
}
