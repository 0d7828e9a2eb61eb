//! Configuration handling for the loom CLI.
//!
//! Options come from the YAML file first, then `LOOM_*` environment
//! variables, then command line flags.

use anyhow::{Context, Result};
use loom_session::{ClientOptions, TransportKind};
use std::path::Path;
use tracing::info;

/// Values given on the command line; `None` keeps the configured value
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub addr: Option<String>,
    pub transport: Option<String>,
    pub server_name: Option<String>,
    pub insecure: bool,
    pub name: Option<String>,
    pub room: Option<String>,
    pub token: Option<String>,
}

impl CliOverrides {
    /// Apply the flags on top of `options`
    pub fn apply(&self, options: &mut ClientOptions) -> Result<()> {
        if let Some(addr) = &self.addr {
            options.addr = addr.clone();
        }
        if let Some(transport) = &self.transport {
            options.transport = transport
                .parse::<TransportKind>()
                .with_context(|| format!("invalid --transport {:?}", transport))?;
        }
        if let Some(server_name) = &self.server_name {
            options.tls.server_name = Some(server_name.clone());
        }
        if self.insecure {
            options.tls.insecure_skip_verify = true;
        }
        if let Some(name) = &self.name {
            options.name = name.clone();
        }
        if let Some(room) = &self.room {
            options.room = room.clone();
        }
        if let Some(token) = &self.token {
            options.token = token.clone();
        }
        Ok(())
    }
}

/// Load the config file, environment and flags into client options
pub fn resolve<P: AsRef<Path>>(config_path: P, overrides: &CliOverrides) -> Result<ClientOptions> {
    let mut options = ClientOptions::load_from_file(config_path)?;
    overrides.apply(&mut options)?;
    options.validate()?;

    info!(
        "Final loom configuration: addr={}, transport={}, room={:?}, reconnect={}",
        options.addr,
        options.transport,
        options.room,
        if options.reconnect.enabled { "on" } else { "off" }
    );
    Ok(options)
}
