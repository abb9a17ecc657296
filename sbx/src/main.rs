//! Ephemeral, policy-constrained containers for coding agents

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sbx_core::calls::{self, ErrorKind};
use sbx_core::driver::{docker, DriverCall};
use sbx_core::error::SandboxError;
use sbx_core::signal::spawn_signal_bridge;
use sbx_core::{CommonArgs, ContainerDriver, DockerDriver, EphemeralRunner, RecordingDriver};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// sysexits(3) codes
const EX_UNAVAILABLE: u8 = 69;
const EX_SOFTWARE: u8 = 70;
const EX_NOPERM: u8 = 77;
const EX_CONFIG: u8 = 78;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "sbx",
    about = "Run coding agents in ephemeral, policy-constrained containers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command (or an interactive shell) in a fresh container
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Container runtime CLI
        #[arg(long, env = "SBX_RUNTIME", default_value = "docker")]
        runtime: String,

        /// Allocate a TTY for the command (default: when stdin and stdout are terminals)
        #[arg(long, overrides_with = "no_tty")]
        tty: bool,

        #[arg(long, hide = true)]
        no_tty: bool,

        /// Print the runtime commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the resolved policy for a directory as JSON
    Policy {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Invoke a declared host command through the call gateway (inside a sandbox)
    Call {
        /// Gateway socket
        #[arg(long, env = "SBX_CALLS_SOCKET", value_name = "PATH")]
        socket: PathBuf,

        /// Declared call name
        name: String,

        /// Call arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Command {
    fn verbose(&self) -> bool {
        match self {
            Command::Run { common, .. } | Command::Policy { common } => common.verbose,
            Command::Call { .. } => false,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_env("SBX_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if cli.command.verbose() { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            if !matches!(e.downcast_ref::<SandboxError>(), Some(SandboxError::Exit(_))) {
                eprintln!("sbx: {:#}", e);
            }
            ExitCode::from(code)
        }
    }
}

async fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run {
            common,
            runtime,
            tty,
            no_tty,
            dry_run,
        } => {
            let tty = if tty || no_tty {
                tty
            } else {
                std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
            };
            run(common, runtime, tty, dry_run).await
        }
        Command::Policy { common } => policy(common),
        Command::Call { socket, name, args } => call(&socket, &name, &args).await,
    }
}

async fn run(common: CommonArgs, runtime: String, tty: bool, dry_run: bool) -> Result<ExitCode> {
    let interactive = common.command.is_empty() || tty;
    let config = common.into_options(tty).normalize()?;

    let recorder = Arc::new(RecordingDriver::new());
    let driver: Arc<dyn ContainerDriver> = if dry_run {
        recorder.clone()
    } else {
        Arc::new(DockerDriver::new(runtime.as_str()))
    };

    let mut runner = EphemeralRunner::new(config, driver)?;
    if let Ok(exe) = std::env::current_exe() {
        runner = runner.with_call_client(exe);
    }

    let ctx = CancellationToken::new();
    let bridge = spawn_signal_bridge(ctx.clone(), interactive).context("Failed to install signal handlers")?;

    let result = runner.run(&ctx).await;
    bridge.abort();

    if dry_run {
        print_dry_run(&runtime, &recorder.calls());
    }
    result?;
    Ok(ExitCode::SUCCESS)
}

fn print_dry_run(runtime: &str, calls: &[DriverCall]) {
    let render = |args: Vec<std::ffi::OsString>| {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    };

    for call in calls {
        let line = match call {
            DriverCall::Create(spec) => render(docker::create_args(spec)),
            DriverCall::Start(id) => format!("start {}", id),
            DriverCall::Exec(id, request) => render(docker::exec_args(id, request)),
            DriverCall::Stop(id, signal) => render(docker::stop_args(id, *signal)),
            DriverCall::Remove(id) => format!("rm -f {}", id),
        };
        println!("{} {}", runtime, line);
    }
}

fn policy(common: CommonArgs) -> Result<ExitCode> {
    let config = common.into_options(false).normalize()?;
    let runner = EphemeralRunner::new(config, Arc::new(RecordingDriver::new()))?;

    let report = serde_json::json!({
        "policy": runner.policy(),
        "mounts": runner.mounts(),
        "network": runner.network_policy(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn call(socket: &std::path::Path, name: &str, args: &[String]) -> Result<ExitCode> {
    let response = calls::call(socket, name, args)
        .await
        .with_context(|| format!("Failed to reach call gateway at {:?}", socket))?;

    if response.ok {
        print!("{}", response.output.unwrap_or_default());
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("sbx call: {}", response.error.unwrap_or_default());
    let code = match response.kind {
        Some(ErrorKind::Policy) => EX_NOPERM,
        Some(ErrorKind::Failed) => clamp_exit(response.code.unwrap_or(1)),
        Some(ErrorKind::Internal) | None => EX_SOFTWARE,
    };
    Ok(ExitCode::from(code))
}

fn clamp_exit(code: i64) -> u8 {
    u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1)
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<SandboxError>() {
        Some(SandboxError::Config(_)) => EX_CONFIG,
        Some(SandboxError::Driver(_)) => EX_UNAVAILABLE,
        Some(SandboxError::PolicyViolation(_)) => EX_NOPERM,
        Some(SandboxError::Exit(exit)) => clamp_exit(exit.code),
        Some(SandboxError::Cancelled) => EXIT_CANCELLED,
        _ => 1,
    }
}
