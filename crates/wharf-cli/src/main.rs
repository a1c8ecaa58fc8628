//! wharf - container engine CLI

use clap::{ArgAction, Parser, Subcommand};
use wharf_cli::commands;
use wharf_config::EngineConfig;
use wharf_core::{AttachOptions, LogFormat, RunOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "wharf")]
#[command(author, version, about = "Minimal container engine", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in a new container
    #[command(disable_help_flag = true)]
    Run {
        /// Keep stdin open and attach it
        #[arg(short, long)]
        interactive: bool,
        /// Allocate a pseudo-terminal
        #[arg(short, long)]
        tty: bool,
        /// Run in the background and print the container ID
        #[arg(short, long)]
        detach: bool,
        /// Attach to STDIN, STDOUT or STDERR (repeatable)
        #[arg(short, long = "attach", value_name = "STREAM")]
        attach: Vec<String>,
        /// Container hostname
        #[arg(short = 'h', long)]
        hostname: Option<String>,
        /// Set an environment variable (repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Working directory inside the container
        #[arg(short, long)]
        workdir: Option<String>,
        /// Print help
        #[arg(long, action = ArgAction::Help)]
        help: Option<bool>,
        /// Image to run
        image: String,
        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },

    /// List containers
    Ps {
        /// Show all containers, not only running ones
        #[arg(short, long)]
        all: bool,
    },

    /// Print a container's output log
    Logs {
        /// Container ID or unique ID prefix
        container: String,
        /// Keep printing new output until the container exits
        #[arg(short, long)]
        follow: bool,
        /// Output format
        #[arg(long, default_value = "json", value_parser = ["json", "raw"])]
        format: String,
    },

    /// Remove a stopped container
    Rm {
        /// Container ID or unique ID prefix
        container: String,
        /// Also delete the output log
        #[arg(long)]
        purge_logs: bool,
    },

    /// Show or edit the configuration
    Config {
        /// Open config in editor
        #[arg(short, long)]
        edit: bool,
    },
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    commands::parse_env(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };
    // the stdio transport reads stdin on a blocking thread that runtime
    // shutdown would wait on
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Handle config command separately (doesn't need the engine)
    if let Commands::Config { edit } = &cli.command {
        commands::config(*edit).await?;
        return Ok(0);
    }

    let config = EngineConfig::load()?;
    let engine = commands::open_engine(config).await?;

    match cli.command {
        Commands::Run {
            interactive,
            tty,
            detach,
            attach,
            hostname,
            env,
            workdir,
            help: _,
            image,
            cmd,
        } => {
            let attach = if attach.is_empty() {
                None
            } else {
                Some(AttachOptions::parse(&attach)?)
            };
            let opts = RunOptions {
                interactive,
                tty,
                detach,
                attach,
                hostname,
                env,
                working_dir: workdir,
                ..RunOptions::new(image, cmd)
            };
            commands::run(&engine, opts).await
        }
        Commands::Ps { all } => {
            commands::ps(&engine, all).await?;
            Ok(0)
        }
        Commands::Logs {
            container,
            follow,
            format,
        } => {
            let format: LogFormat = format.parse()?;
            commands::logs(&engine, &container, format, follow).await?;
            Ok(0)
        }
        Commands::Rm {
            container,
            purge_logs,
        } => {
            commands::remove(&engine, &container, purge_logs).await?;
            Ok(0)
        }
        Commands::Config { .. } => Ok(0),
    }
}
