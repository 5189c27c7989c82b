//! hstack: isolated development stacks on one machine.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, configures logging and dispatches to the command handlers.

mod auth;
mod config;
mod dotenv;
mod error;
mod events;
mod health;
mod lifecycle;
mod output;
mod ownership;
mod paths;
mod ports;
mod process;
mod runner;
mod runtime_state;
mod service;
mod settings;
mod stack;
mod stack_env;
mod update;

use std::path::PathBuf;

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::lifecycle::{StartArgs, StopArgs};
use crate::output::print_result;
use crate::paths::{StackPaths, MAIN_STACK};
use crate::service::ServiceAction;
use crate::settings::Settings;
use crate::stack::{EditArgs, EnvCommand, NewArgs};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "hstack",
    version,
    about = "Run isolated development stacks side by side",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Print exactly one JSON object on stdout.
    #[arg(long, global = true)]
    json: bool,
    /// Log progress to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Path to the services file (default: <home>/hstack.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the main stack.
    Setup {
        /// Server port for main
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage stacks.
    Stack {
        #[command(subcommand)]
        command: StackCommand,
    },
    /// Manage the autostart unit of a stack.
    Service {
        #[command(subcommand)]
        action: ServiceAction,
        /// Stack the unit runs
        #[arg(long, default_value = MAIN_STACK, global = true)]
        stack: String,
    },
    /// Information about hstack itself.
    #[command(name = "self")]
    SelfCmd {
        #[command(subcommand)]
        command: SelfCommand,
    },
}

#[derive(Debug, Subcommand)]
enum StackCommand {
    /// Create a stack.
    New(NewArgs),
    /// Change pinned settings of a stack.
    Edit(EditArgs),
    /// Inspect or change a stack env file.
    Env {
        name: String,
        #[command(subcommand)]
        command: Option<EnvCommand>,
    },
    /// List stacks.
    List,
    /// Show paths, ports and run state of a stack.
    Info { name: String },
    /// Run the services of a stack.
    Start(StartArgs),
    /// Stop a stack and everything it owns.
    Stop(StopArgs),
    /// Move a stopped stack out of the way.
    Archive { name: String },
    /// Credentials of a stack.
    Auth {
        name: String,
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AuthCommand {
    /// Copy credentials from another stack.
    CopyFrom {
        source: String,
        /// Symlink instead of copying
        #[arg(long)]
        link: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SelfCommand {
    /// Show the version and whether an update is available.
    Status {
        /// Only consult the cached result
        #[arg(long)]
        no_check: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings = match Settings::from_process_env() {
        Ok(settings) => settings,
        Err(err) => {
            output::print_error(cli.json, &err);
            std::process::exit(1);
        }
    };

    let verbose = cli.verbose || settings.verbose();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if verbose {
                EnvFilter::new("info")
            } else {
                EnvFilter::new("warn")
            }
        }))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(err) = run(cli.command, &settings, cli.json, cli.config).await {
        output::print_error(cli.json, &err);
        std::process::exit(1);
    }
}

async fn run(command: Commands, settings: &Settings, json: bool, config: Option<PathBuf>) -> Result<()> {
    let config_path = config.unwrap_or_else(|| settings.config_path());
    match command {
        Commands::Setup { port } => stack::setup(settings, json, port),
        Commands::Stack { command } => match command {
            StackCommand::New(args) => stack::new_stack(settings, json, &args),
            StackCommand::Edit(args) => stack::edit_stack(settings, json, &args),
            StackCommand::Env { name, command } => {
                stack::stack_env_command(settings, json, &name, command.as_ref())
            }
            StackCommand::List => stack::list_stacks(settings, json),
            StackCommand::Info { name } => stack::stack_info(settings, json, &name),
            StackCommand::Start(args) => {
                let config = config::load_config_or_default(&config_path)?;
                lifecycle::start(settings, &config, &config_path, json, &args).await
            }
            StackCommand::Stop(args) => {
                let config = config::load_config_or_default(&config_path)?;
                lifecycle::stop(settings, &config, json, &args).await
            }
            StackCommand::Archive { name } => stack::archive_stack(settings, json, &name),
            StackCommand::Auth { name, command } => match command {
                AuthCommand::CopyFrom { source, link } => {
                    stack::auth_copy_from(settings, json, &name, &source, link)
                }
            },
        },
        Commands::Service { action, stack } => {
            paths::validate_stack_name(&stack)?;
            let paths = StackPaths::new(&settings.storage_dir, &stack);
            let report = service::run_service_action(settings, &paths, action)?;
            print_result(json, &report, || {
                let mut text = format!(
                    "[service] {} {} ({}, {})",
                    report.action, report.stack_name, report.platform, report.label
                );
                text.push_str(&format!("\n  unit: {}", report.unit_path));
                text.push_str(&format!("\n  installed: {}", report.installed));
                if let Some(detail) = &report.detail {
                    text.push_str(&format!("\n{}", detail.trim_end()));
                }
                text
            })
        }
        Commands::SelfCmd { command } => match command {
            SelfCommand::Status { no_check } => {
                let status = update::check_for_update(settings, !no_check).await;
                print_result(json, &status, || {
                    let mut text = format!("hstack {}", status.current);
                    match &status.latest {
                        Some(latest) if status.update_available => {
                            text.push_str(&format!("\n  update available: {}", latest));
                        }
                        Some(latest) => text.push_str(&format!("\n  latest: {} (up to date)", latest)),
                        None => text.push_str("\n  latest: unknown"),
                    }
                    text
                })
            }
        },
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
