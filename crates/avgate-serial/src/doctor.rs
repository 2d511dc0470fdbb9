use anyhow::Result;

use crate::autobaud::{is_supported_baud, BAUD_LADDER};
use crate::{profile, BridgeConfig, SerialConfig};

pub fn check_serial(cfg: &SerialConfig) -> Result<()> {
    anyhow::ensure!(!cfg.dev.is_empty(), "serial.dev missing");
    anyhow::ensure!(
        is_supported_baud(cfg.baud()),
        "serial.baud {} not one of {:?}",
        cfg.baud(),
        BAUD_LADDER
    );
    if let Some(idx) = cfg.profile {
        anyhow::ensure!(profile::profile(idx).is_some(), "serial.profile {} out of range (0..{})", idx, profile::PROFILES.len());
    }
    Ok(())
}

pub fn check_bridge(cfg: &BridgeConfig) -> Result<()> {
    if cfg.enable {
        let addr = cfg.listen_addr();
        anyhow::ensure!(addr.parse::<std::net::SocketAddr>().is_ok(), "bridge.listen is not host:port: {}", addr);
    }
    Ok(())
}
