//! rbox CLI entry point.

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rbox_vbox::types::StartMode;
use rbox_vbox::Operation;
use remotebox::app::{vault_from_env, PASSPHRASE_ENV};
use remotebox::config::default_config_path;
use remotebox::logging::init_logging;
use remotebox::{App, AppConfig};

/// rbox - manage VirtualBox hosts over SSH
#[derive(Parser, Debug)]
#[command(name = "rbox")]
#[command(about = "Drive VBoxManage on local and remote VirtualBox hosts")]
#[command(version)]
struct Cli {
    /// Path to config file (JSON).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured servers.
    Servers,
    /// List the VMs registered on a server.
    Vms {
        server: String,
        /// Also read each VM's state (one extra command per VM).
        #[arg(long)]
        state: bool,
    },
    /// Show a VM's settings, storage and snapshots as JSON.
    Show { server: String, vm: String },
    /// Power on a VM.
    Start {
        server: String,
        vm: String,
        /// gui, headless or separate.
        #[arg(long, default_value = "headless")]
        mode: StartMode,
    },
    /// Save the VM state and stop it.
    Save { server: String, vm: String },
    /// Press the ACPI power button.
    Shutdown { server: String, vm: String },
    /// Cut power to a VM.
    Poweroff { server: String, vm: String },
    /// Print the server's VBoxManage version.
    Version { server: String },
    /// Encrypt a password read from stdin for the servers file.
    Encrypt,
    /// Refresh every VM of a server until interrupted.
    Poll { server: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = AppConfig::load(&config_path)?;
    init_logging(&config.log_level, config.log_json)?;
    tracing::debug!(config = %config_path.display(), "starting rbox");

    let vault = vault_from_env();
    if let Commands::Encrypt = cli.command {
        let Some(vault) = vault else {
            bail!("set {} to the vault passphrase", PASSPHRASE_ENV);
        };
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("reading password from stdin")?;
        println!("{}", vault.encrypt(line.trim_end_matches(['\r', '\n']))?);
        return Ok(());
    }

    let app = App::build(config, vault.as_ref()).await?;
    let service = &app.service;

    match cli.command {
        Commands::Servers => {
            for server in service.servers().await {
                let target = match &server.params().remote {
                    Some(ssh) => ssh.display_target(),
                    None => "local".to_string(),
                };
                println!("{}\t{}", server.name(), target);
            }
        }
        Commands::Vms { server, state } => {
            service.connect(&server).await?;
            for vm in service.list_vms(&server).await? {
                if state {
                    let summary = service.vm_summary(&server, vm.uuid()).await?;
                    println!("{}\t{}\t{:?}", vm.listed_name(), vm.uuid(), summary.state);
                } else {
                    println!("{}\t{}", vm.listed_name(), vm.uuid());
                }
            }
        }
        Commands::Show { server, vm } => {
            service.connect(&server).await?;
            let details = serde_json::json!({
                "summary": service.vm_summary(&server, &vm).await?,
                "storage": service.storage(&server, &vm).await?,
                "snapshots": service.snapshots(&server, &vm).await?,
            });
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        Commands::Start { server, vm, mode } => {
            service.connect(&server).await?;
            follow(service.start_vm(&server, &vm, mode).await?).await?;
        }
        Commands::Save { server, vm } => {
            service.connect(&server).await?;
            follow(service.save_vm(&server, &vm).await?).await?;
        }
        Commands::Shutdown { server, vm } => {
            service.connect(&server).await?;
            follow(service.shutdown_vm(&server, &vm).await?).await?;
        }
        Commands::Poweroff { server, vm } => {
            service.connect(&server).await?;
            follow(service.power_off_vm(&server, &vm).await?).await?;
        }
        Commands::Version { server } => {
            println!("{}", service.connect(&server).await?);
        }
        Commands::Poll { server } => {
            service.connect(&server).await?;
            let poller = service.start_poller(&server).await?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            drop(poller);
            service.disconnect(&server).await?;
        }
        Commands::Encrypt => {}
    }
    Ok(())
}

/// Print progress while the command runs, then wait for the refresh.
async fn follow(op: Operation) -> Result<()> {
    let mut shown = None;
    while !op.command.is_finished() {
        let progress = op.command.progress();
        if progress.is_some() && progress != shown {
            eprint!("\r{}: {}%", op.command.label(), progress.unwrap_or_default());
            shown = progress;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if shown.is_some() {
        eprintln!();
    }
    op.wait().await?;
    Ok(())
}
