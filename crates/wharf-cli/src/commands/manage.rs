//! Management commands: ps, logs, rm, config

use anyhow::{Context, Result};
use std::sync::Arc;
use wharf_config::EngineConfig;
use wharf_core::{Container, Engine, LogFormat, LogOptions};

/// List containers, only the running ones unless `all`
pub async fn ps(engine: &Engine, all: bool) -> Result<()> {
    let containers: Vec<Arc<Container>> = engine
        .list()
        .await
        .into_iter()
        .filter(|c| all || c.is_running())
        .collect();

    // Column widths
    const ID_WIDTH: usize = 12;
    const IMAGE_WIDTH: usize = 12;
    const COMMAND_WIDTH: usize = 24;
    const CREATED_WIDTH: usize = 20;

    println!(
        "{:<ID_WIDTH$}  {:<IMAGE_WIDTH$}  {:<COMMAND_WIDTH$}  {:<CREATED_WIDTH$}  STATUS",
        "CONTAINER ID", "IMAGE", "COMMAND", "CREATED"
    );

    for container in containers {
        let config = container.config();
        let command = truncate(&format!("\"{}\"", config.command_line()), COMMAND_WIDTH);
        let created = container.created().format("%Y-%m-%d %H:%M:%S").to_string();
        println!(
            "{:<ID_WIDTH$}  {:<IMAGE_WIDTH$}  {:<COMMAND_WIDTH$}  {:<CREATED_WIDTH$}  {}",
            container.short_id(),
            truncate(&config.image, IMAGE_WIDTH),
            command,
            created,
            container.state().describe()
        );
    }

    Ok(())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Print a container's log, following it while the container runs
pub async fn logs(engine: &Engine, container: &str, format: LogFormat, follow: bool) -> Result<()> {
    let options = LogOptions {
        format,
        follow,
        ..LogOptions::default()
    };
    let reader = engine.logs(container, options).await?;
    let mut stdout = tokio::io::stdout();
    reader.copy_to(&mut stdout).await?;
    Ok(())
}

/// Remove a stopped container
pub async fn remove(engine: &Engine, container: &str, purge_logs: bool) -> Result<()> {
    let id = engine.remove(container, purge_logs).await?;
    println!("{}", id.short());
    Ok(())
}

/// Show or edit the configuration file
pub async fn config(edit: bool) -> Result<()> {
    let config_path = EngineConfig::config_path()?;

    if edit {
        let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

        // Create config file with defaults if it doesn't exist
        if !config_path.exists() {
            EngineConfig::default().save()?;
            println!("Created default config at {:?}", config_path);
        }

        std::process::Command::new(&editor)
            .arg(&config_path)
            .status()
            .context(format!("Failed to open editor: {}", editor))?;
    } else if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("# Config file: {:?}\n", config_path);
        println!("{}", content);
    } else {
        println!("# Config file: {:?} (not created yet)\n", config_path);
        println!("# Default configuration:");
        let content = toml::to_string_pretty(&EngineConfig::default())?;
        println!("{}", content);
        println!("\n# Run 'wharf config --edit' to create and edit the config file.");
    }

    Ok(())
}
