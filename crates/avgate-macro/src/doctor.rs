use anyhow::Result;
use std::path::Path;

use crate::StepConfig;

pub fn check_store_dir(store_dir: &str) -> Result<()> {
    anyhow::ensure!(!store_dir.is_empty(), "macros.store_dir missing");
    let p = Path::new(store_dir);
    if p.exists() {
        anyhow::ensure!(p.is_dir(), "macros.store_dir is not a dir: {}", store_dir);
    }
    Ok(())
}

pub fn check_step_timeouts(cfg: &StepConfig) -> Result<()> {
    let connect = cfg.connect_timeout().as_millis();
    anyhow::ensure!(connect >= 100, "steps.tcp_connect_timeout_ms too small ({} ms); set >= 100", connect);
    anyhow::ensure!(connect <= 30_000, "steps.tcp_connect_timeout_ms too large ({} ms); set <= 30000", connect);
    anyhow::ensure!(cfg.read_window().as_millis() <= 5_000, "steps.tcp_read_window_ms too large; set <= 5000");
    Ok(())
}
