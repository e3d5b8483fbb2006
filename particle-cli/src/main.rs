//! CLI entry point for particle

mod tui;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input};
use particle_chat::ConversationController;
use particle_core::config::loader::API_URL_ENV;
use particle_core::config::validate::validate_config;
use particle_core::config::{Config, ConfigLoader};
use particle_core::logging::{init_logging, LogOutput};
use particle_transport::HttpTransport;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Path-style override for the base URL, checked after the alias
const BASE_URL_PATH_ENV: &str = "PARTICLE__API__BASE_URL";

#[derive(Parser)]
#[command(name = "particle")]
#[command(about = "Terminal client for the particle parts assistant")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file
    Onboard,
    /// Launch the interactive chat
    Chat {
        /// Continue an existing server session
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Send a single message and print the answer
    Ask {
        /// Message to send
        #[arg(short, long)]
        message: String,
        /// Continue an existing server session
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Show resolved configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config_loader = if let Some(dir) = cli.config_dir {
        ConfigLoader::with_dir(dir)
    } else {
        ConfigLoader::new()
    };

    // Logging comes up before the command validates the config, so a broken
    // file still gets reported by the command itself.
    let logging = config_loader
        .load()
        .map(|config| config.logging)
        .unwrap_or_default();
    let output = match cli.command {
        Commands::Chat { .. } => LogOutput::FileOnly,
        _ => LogOutput::Console,
    };
    let _log_guard = init_logging(&logging, output);

    match cli.command {
        Commands::Onboard => {
            info!("Running onboard command");
            run_onboard(&config_loader)?;
        }
        Commands::Chat { session } => {
            info!("Starting chat");
            run_chat(&config_loader, session).await?;
        }
        Commands::Ask { message, session } => {
            info!("Sending one-shot message");
            run_ask(&config_loader, &message, session).await?;
        }
        Commands::Status => {
            info!("Showing status");
            run_status(&config_loader)?;
        }
    }

    Ok(())
}

fn build_controller(config: &Config, session: Option<&str>) -> Result<ConversationController> {
    let transport = HttpTransport::new(&config.api)?;
    info!(endpoint = %transport.chat_url(), "Using chat endpoint");

    let mut controller = ConversationController::new(Arc::new(transport));
    if let Some(session_id) = session.filter(|s| !s.trim().is_empty()) {
        controller.resume_session(session_id.trim());
    }
    Ok(controller)
}

/// Run the interactive chat
async fn run_chat(loader: &ConfigLoader, session: Option<String>) -> Result<()> {
    let config = loader.load()?;
    let controller = build_controller(&config, session.as_deref())?;
    tui::run(controller).await
}

/// Send one message through the controller and print the outcome
async fn run_ask(loader: &ConfigLoader, message: &str, session: Option<String>) -> Result<()> {
    let config = loader.load()?;
    let mut controller = build_controller(&config, session.as_deref())?;

    println!("{}", style("Thinking...").cyan());
    let target = controller.send_message(message).await?;

    if let Some(err) = controller.last_error() {
        error!("Send failed: {}", err);
        anyhow::bail!("Failed to send message: {}", err);
    }

    let session = controller.state().session(target);
    if let Some(answer) = session.messages().last() {
        println!("\n{}", style("Answer:").bold());
        println!("{}", answer.text());
        if !answer.sources().is_empty() {
            println!("\n{}", style("Sources:").bold());
            for source in answer.sources() {
                println!("  - {}", source.relevant_doc);
            }
        }
    }
    if let Some(session_id) = session.session_id() {
        println!(
            "\n{} {}",
            style("Session:").dim(),
            style(session_id).dim()
        );
    }

    Ok(())
}

/// Where the effective base URL came from
fn base_url_origin(loader: &ConfigLoader) -> &'static str {
    let is_set = |key: &str| {
        std::env::var(key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    };
    describe_origin(
        is_set(BASE_URL_PATH_ENV),
        is_set(API_URL_ENV),
        loader.config_path().exists(),
    )
}

fn describe_origin(path_override: bool, alias_override: bool, file_exists: bool) -> &'static str {
    if path_override {
        "environment (PARTICLE__API__BASE_URL)"
    } else if alias_override {
        "environment (PARTICLE_API_URL)"
    } else if file_exists {
        "config file"
    } else {
        "default"
    }
}

/// Show resolved configuration
fn run_status(loader: &ConfigLoader) -> Result<()> {
    let config = loader.load()?;

    println!("{}", style("particle status").bold().cyan());
    println!("Version: {}\n", env!("CARGO_PKG_VERSION"));

    println!("{}", style("Configuration:").bold());
    println!("  Config directory: {}", loader.config_dir().display());
    let file_state = if loader.config_path().exists() {
        style("found").green()
    } else {
        style("not found, using defaults").yellow()
    };
    println!("  Config file: {}", file_state);
    println!();

    println!("{}", style("Endpoint:").bold());
    println!("  Chat URL: {}", config.api.chat_url());
    println!("  Base URL from: {}", base_url_origin(loader));
    println!("  Timeout: {}s", config.api.timeout_secs);
    println!();

    println!("{}", style("Logging:").bold());
    println!("  Level: {}", config.logging.level);
    println!("  Format: {}", config.logging.format);
    println!("  Directory: {}", config.logging.dir);

    Ok(())
}

/// Run the onboard wizard
fn run_onboard(loader: &ConfigLoader) -> Result<()> {
    println!("{}", style("Welcome to particle!").bold().cyan());
    println!("Let's set up your configuration.\n");

    let config_path = loader.config_path();
    if config_path.exists() {
        let overwrite = Confirm::new()
            .with_prompt("Configuration already exists. Overwrite?")
            .default(false)
            .interact()?;
        if !overwrite {
            println!("Onboard cancelled.");
            return Ok(());
        }
    }

    let mut config = Config::default();
    config.api.base_url = Input::new()
        .with_prompt("Chat service base URL")
        .default(config.api.base_url.clone())
        .interact_text()?;
    config.api.timeout_secs = Input::new()
        .with_prompt("Request timeout in seconds")
        .default(config.api.timeout_secs)
        .interact_text()?;

    validate_config(&config)?;
    loader.save(&config)?;

    println!(
        "\n{}",
        style("Configuration saved successfully!").green().bold()
    );
    println!("Config location: {}", config_path.display());
    println!("\nYou can now run:");
    println!("  {} - Start chatting", style("particle chat").cyan());
    println!(
        "  {} - Ask a single question",
        style("particle ask --message 'How do I reset my dishwasher?'").cyan()
    );

    Ok(())
}
