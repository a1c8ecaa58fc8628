//! CLI command implementations

mod manage;
mod run;

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use wharf_config::EngineConfig;
use wharf_core::Engine;

pub use manage::*;
pub use run::*;

/// Open the engine over the configured state root
pub async fn open_engine(config: EngineConfig) -> Result<Engine> {
    let root = config.root_dir()?;
    let launcher = native_launcher(&config)?;
    Engine::open(config, root.clone(), launcher)
        .await
        .with_context(|| format!("Failed to open state root {}", root.display()))
}

#[cfg(unix)]
fn native_launcher(config: &EngineConfig) -> Result<Arc<dyn wharf_runtime::ProcessLauncher>> {
    Ok(Arc::new(wharf_runtime::NativeLauncher::new(config)))
}

#[cfg(not(unix))]
fn native_launcher(_config: &EngineConfig) -> Result<Arc<dyn wharf_runtime::ProcessLauncher>> {
    Err(anyhow!("wharf can only run containers on unix hosts"))
}

/// Parse a `KEY=VALUE` environment assignment
pub fn parse_env(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid environment variable '{}', expected KEY=VALUE", s))?;
    if key.is_empty() {
        return Err(anyhow!("environment variable name is empty in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}
