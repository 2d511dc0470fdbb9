mod control;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use avgate_macro::{doctor as macro_doctor, FileBlobStore, MacroConfig, MacroRecord, MacroStore, Scheduler, StepConfig, StepExecutor};
use avgate_proto::EventBus;
use avgate_serial::{bridge, doctor as serial_doctor, line, open_line, BridgeConfig, SerialConfig, SerialManager};

use control::Control;

#[derive(Debug, Parser)]
#[command(name = "avgate", version, about = "AVgate - AV control gateway (macros + RS-232)")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    /// Run the gateway; control requests are read as JSON lines on stdin.
    Run,
    Macros { #[command(subcommand)] cmd: MacrosCmd },
    Serial { #[command(subcommand)] cmd: SerialCmd },
}

#[derive(Debug, Subcommand)]
enum MacrosCmd {
    List,
    Show { id: String },
    Delete { id: String },
    /// Import one macro object or an array of them from a JSON file.
    Import { file: String },
}

#[derive(Debug, Subcommand)]
enum SerialCmd {
    /// List serial devices visible to the host.
    Ports,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    serial: SerialConfig,
    bridge: Option<BridgeConfig>,
    macros: MacroConfig,
    steps: Option<StepConfig>,
    gateway: Option<GatewayConfig>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct GatewayConfig {
    /// Cooperative loop period. Default 10 ms.
    tick_ms: Option<u64>,
    /// Event channel depth; slow observers past this lag and drop events.
    event_capacity: Option<usize>,
}

impl GatewayConfig {
    fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.unwrap_or(10).max(1))
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

fn open_store(cfg: &MacroConfig) -> Result<MacroStore> {
    MacroStore::load(Box::new(FileBlobStore::new(&cfg.store_dir))).context("open macro store")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(&cfg).await?,
        Command::Macros { cmd } => macros_cmd(&cfg, cmd)?,
        Command::Serial { cmd } => serial_cmd(cmd)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    serial_doctor::check_serial(&cfg.serial)?;
    if let Some(b) = &cfg.bridge {
        serial_doctor::check_bridge(b)?;
    }
    macro_doctor::check_store_dir(&cfg.macros.store_dir)?;
    if let Some(s) = &cfg.steps {
        macro_doctor::check_step_timeouts(s)?;
    }
    if let Some(g) = &cfg.gateway {
        anyhow::ensure!(g.tick_ms.unwrap_or(10) > 0, "gateway.tick_ms must be > 0");
    }

    if cfg.serial.dev != "loopback" {
        match line::available_devices() {
            Ok(devs) if !devs.contains(&cfg.serial.dev) => {
                warn!("doctor: serial.dev {} not among visible ports {:?}", cfg.serial.dev, devs)
            }
            Ok(_) => {}
            Err(e) => warn!("doctor: could not list serial ports: {:#}", e),
        }
    }

    let store = open_store(&cfg.macros)?;
    info!("doctor: {} macros readable", store.len());

    info!("doctor: OK");
    Ok(())
}

fn macros_cmd(cfg: &Config, cmd: MacrosCmd) -> Result<()> {
    let mut store = open_store(&cfg.macros)?;
    match cmd {
        MacrosCmd::List => {
            for m in store.list() {
                println!("{}  {} {}  ({} steps)", m.id, m.icon, m.name, m.step_count);
            }
        }
        MacrosCmd::Show { id } => {
            let m = store.get(&id).with_context(|| format!("no macro {}", id))?;
            println!("{}", serde_json::to_string_pretty(&m)?);
        }
        MacrosCmd::Delete { id } => {
            let m = store.delete(&id)?;
            info!("macros: deleted {} ({})", id, m.name);
        }
        MacrosCmd::Import { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("read {}", file))?;
            let value: serde_json::Value = serde_json::from_str(&raw).context("parse import file")?;
            let items = match value {
                serde_json::Value::Array(items) => items,
                single => vec![single],
            };
            for (i, item) in items.into_iter().enumerate() {
                let record: MacroRecord =
                    serde_json::from_value(item).with_context(|| format!("import entry {}", i + 1))?;
                let id = store.save(record)?;
                println!("{}", id);
            }
        }
    }
    Ok(())
}

fn serial_cmd(cmd: SerialCmd) -> Result<()> {
    match cmd {
        SerialCmd::Ports => {
            for dev in line::available_devices()? {
                println!("{}", dev);
            }
        }
    }
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");
    let defaults = GatewayConfig::default();
    let gw = cfg.gateway.as_ref().unwrap_or(&defaults);
    let tick = gw.tick();

    let events = EventBus::new(gw.event_capacity.unwrap_or(256));
    spawn_event_printer(&events);

    let baud = cfg.serial.baud();
    let line = open_line(&cfg.serial).context("serial open")?;
    let mut manager = SerialManager::new(line, baud, events.clone());
    if let Some(b) = cfg.bridge.as_ref().filter(|b| b.enable) {
        manager = manager.with_bridge(bridge::bind(&b.listen_addr()).await?);
    }
    if cfg.serial.invert.unwrap_or(false) {
        manager.set_invert(true);
    }
    if let Some(p) = cfg.serial.profile {
        manager.select_profile(p).context("serial.profile")?;
    }

    let store = Arc::new(Mutex::new(open_store(&cfg.macros)?));
    let steps = cfg.steps.clone().unwrap_or_default();
    let executor = StepExecutor::new(&steps).with_serial(Arc::new(manager.handle()));
    let scheduler = Scheduler::new(store.clone(), executor, events.clone());
    let control = Control::new(store.clone(), scheduler, manager.handle());

    info!("run: ready ({} macros, {} @ {}, tick {:?})", store.lock().unwrap().len(), cfg.serial.dev, manager.baud(), tick);

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.pump();
                match control.scheduler().poll() {
                    Ok(Some(task)) => {
                        tokio::spawn(async move {
                            match task.await {
                                Ok(report) => debug!("macro: {} finished in {:?}", report.macro_id, report.elapsed),
                                Err(e) => warn!("macro: run task failed: {}", e),
                            }
                        });
                    }
                    Ok(None) => {}
                    Err(e) => warn!("macro: {}", e),
                }
            }
            req = console.next_line(), if console_open => match req {
                Ok(Some(req)) if req.trim().is_empty() => {}
                Ok(Some(req)) => println!("{}", control.handle(&req)),
                Ok(None) => {
                    info!("console: stdin closed");
                    console_open = false;
                }
                Err(e) => {
                    warn!("console: read failed: {}", e);
                    console_open = false;
                }
            },
            _ = &mut shutdown => {
                info!("run: shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Writes every gateway event to stdout as one JSON line.
fn spawn_event_printer(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ev) => match serde_json::to_string(&ev) {
                    Ok(s) => println!("{}", s),
                    Err(e) => warn!("events: encode failed: {}", e),
                },
                Err(RecvError::Lagged(n)) => warn!("events: printer lagged, dropped {}", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
