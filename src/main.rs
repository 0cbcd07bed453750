use clap::{Parser, ValueEnum};
use nix::sys::signal::{raise, Signal};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use framefarm::config::LauncherConfig;
use framefarm::error::{ExitCategory, FarmError};
use framefarm::grpc::GrpcServer;
use framefarm::launcher::{FrameCompleteReport, FrameLauncher, RunFrame, StatusReporter};
use framefarm::modules::ModuleRegistry;
use framefarm::outline::{load_outline, ExecOutcome};
use framefarm::proto::launcher_service_client::LauncherServiceClient;
use framefarm::proto::{
    GetStatusRequest, KillFrameRequest, LockRequest, RebootIdleRequest, SetNimbyRequest,
    ShutdownMode as ProtoShutdownMode, ShutdownRequest, UnlockRequest,
};
use framefarm::shutdown::drain_on_signal;

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_NOT_FOUND: i32 = 2;
const EXIT_CONFLICT: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "framefarm")]
#[command(version)]
#[command(about = "Render-farm frame launcher and outline executor")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the frame launcher on this host
    Serve(ServeArgs),

    /// Administer a running launcher
    Host {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: HostCommands,
    },

    /// Run one frame of a layer in-process (used by the launcher)
    Execute(ExecuteArgs),

    /// Launch one frame locally, without a server, and print its report
    RunFrame(RunFrameArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// YAML configuration file; flags below override it
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to listen on for gRPC
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Run frames inside containers
    #[arg(long)]
    container_mode: bool,

    /// Request GPUs for containerized frames
    #[arg(long)]
    gpu_mode: bool,

    /// Directory frame logs are written under
    #[arg(long)]
    log_root: Option<PathBuf>,

    /// Hostname reported to the orchestrator
    #[arg(long)]
    hostname: Option<String>,

    /// Cores offered to frames
    #[arg(long)]
    cores: Option<f32>,

    /// Memory offered to frames, in KiB
    #[arg(long)]
    memory_kb: Option<u64>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Launcher address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50061")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ShutdownArg {
    Idle,
    Now,
}

// =============================================================================
// Host Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum HostCommands {
    /// Show host state and running frames
    Status,
    /// Release the host when a local user returns
    Nimby {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Refuse new frames; running frames continue
    Lock,
    /// Accept new frames again
    Unlock,
    /// Kill a running frame
    Kill {
        /// The frame id
        frame_id: String,

        /// Reason recorded with the kill
        #[arg(long, default_value = "killed from the command line")]
        reason: String,
    },
    /// Reboot once no frames are running
    RebootIdle,
    /// Stop the launcher
    Shutdown {
        #[arg(value_enum)]
        mode: ShutdownArg,
    },
}

// =============================================================================
// Frame Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ExecuteArgs {
    /// Session directory holding outline.yaml
    #[arg(long)]
    session: PathBuf,

    /// Layer to run
    #[arg(long)]
    layer: String,

    /// Frame number (the chunk leader)
    #[arg(long, allow_negative_numbers = true)]
    frame: i64,
}

#[derive(Parser, Debug)]
struct RunFrameArgs {
    #[command(flatten)]
    frame: ExecuteArgs,

    /// YAML launcher configuration
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Directory frame logs are written under
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct FrameOutput {
    frame_id: String,
    frame_name: String,
    layer: String,
    frame: i64,
    cores: f32,
    rss_kb: u64,
    max_rss_kb: u64,
    cpu_secs: f64,
    started_at: String,
    log_path: String,
}

#[derive(Serialize)]
struct HostStatusOutput {
    hostname: String,
    locked: bool,
    nimby: bool,
    reboot_pending: bool,
    total_cores: f32,
    reserved_cores: f32,
    total_memory_kb: u64,
    reserved_memory_kb: u64,
    load_average: f64,
    frames: Vec<FrameOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn category_exit_code(category: ExitCategory) -> i32 {
    match category {
        ExitCategory::Success | ExitCategory::Skipped => EXIT_OK,
        ExitCategory::UnknownLayer | ExitCategory::SessionIo => EXIT_NOT_FOUND,
        _ => EXIT_USAGE,
    }
}

fn status_exit_code(status: &tonic::Status) -> i32 {
    match status.code() {
        tonic::Code::NotFound => EXIT_NOT_FOUND,
        tonic::Code::AlreadyExists | tonic::Code::FailedPrecondition | tonic::Code::Aborted => {
            EXIT_CONFLICT
        }
        _ => EXIT_USAGE,
    }
}

fn error_exit_code(err: &(dyn std::error::Error + 'static)) -> i32 {
    if let Some(status) = err.downcast_ref::<tonic::Status>() {
        return status_exit_code(status);
    }
    if let Some(err) = err.downcast_ref::<FarmError>() {
        return match err {
            FarmError::DuplicateFrame(_)
            | FarmError::SessionConflict(_)
            | FarmError::HostLocked(_)
            | FarmError::InsufficientResources(_) => EXIT_CONFLICT,
            FarmError::FrameNotFound(_) => EXIT_NOT_FOUND,
            other => category_exit_code(other.category()),
        };
    }
    EXIT_USAGE
}

fn print_report(report: &FrameCompleteReport, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Table => {
            println!("Frame:       {}", report.frame_name);
            println!("Frame ID:    {}", report.frame_id);
            println!("Category:    {}", report.category);
            println!("Exit Status: {}", report.exit_status);
            if report.exit_signal != 0 {
                println!("Signal:      {}", report.exit_signal);
            }
            println!("Run Time:    {:.3}s", report.run_time_secs);
            println!("Max RSS:     {} KiB", report.max_rss_kb);
            if let Some(path) = &report.log_path {
                println!("Log:         {}", path.display());
            }
            if let Some(message) = &report.message {
                println!("Message:     {}", message);
            }
            if !report.error_lines.is_empty() {
                println!("Errors:");
                for line in &report.error_lines {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<i32, Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = match &args.config {
        Some(path) => LauncherConfig::from_file(path)?,
        None => LauncherConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.container_mode {
        config.container_mode = true;
    }
    if args.gpu_mode {
        config.gpu_mode = true;
    }
    if let Some(log_root) = args.log_root {
        config.log_root = log_root;
    }
    if let Some(hostname) = args.hostname {
        config.hostname = hostname;
    }
    if let Some(cores) = args.cores {
        config.capacity.cores = cores;
    }
    if let Some(memory_kb) = args.memory_kb {
        config.capacity.memory_kb = memory_kb;
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        hostname = %config.hostname,
        container_mode = config.container_mode,
        cores = config.capacity.cores,
        memory_kb = config.capacity.memory_kb,
        "Starting framefarm launcher"
    );

    let launcher = Arc::new(FrameLauncher::new(
        config.clone(),
        ModuleRegistry::with_builtins(),
    ));
    let shutdown = launcher.shutdown_token();
    launcher.start().await;

    let reporter = StatusReporter::new(config.status_interval_ms);
    let reporter_task = {
        let launcher = launcher.clone();
        let sink = launcher.sink();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reporter.run(launcher, sink, shutdown).await })
    };

    let drain_task = drain_on_signal(launcher.clone());

    GrpcServer::new(config.listen_addr, launcher.clone())
        .run(shutdown.clone())
        .await?;

    if let Err(e) = drain_task.await {
        tracing::warn!(error = %e, "Drain task failed");
    }
    if let Err(e) = reporter_task.await {
        tracing::warn!(error = %e, "Status reporter failed");
    }
    tracing::info!("Launcher stopped");
    Ok(EXIT_OK)
}

// =============================================================================
// Frame Command Handlers
// =============================================================================

fn handle_execute(args: ExecuteArgs) -> Result<i32, Box<dyn std::error::Error>> {
    init_tracing();
    let registry = ModuleRegistry::with_builtins();
    let outline = load_outline(&args.session, &registry)?;
    match outline.execute(&registry, &args.layer, args.frame) {
        Ok(ExecOutcome::Completed) => Ok(EXIT_OK),
        Ok(ExecOutcome::Skipped) => Ok(EXIT_OK),
        Err(FarmError::ShellCommand { command, status }) => {
            tracing::error!(command = %command, status, "Command failed");
            Ok(if status > 0 { status.min(255) } else { EXIT_USAGE })
        }
        Err(FarmError::CommandSignalled { command, signal }) => {
            tracing::error!(command = %command, signal, "Command killed by signal");
            reraise(signal)
        }
        Err(e) => Err(e.into()),
    }
}

/// Die of `signal` so the launcher sees the frame as signalled. Signals
/// ignored by default fall back to the shell convention of 128 + signal.
fn reraise(signal: i32) -> Result<i32, Box<dyn std::error::Error>> {
    let sig = Signal::try_from(signal)?;
    raise(sig)?;
    Ok(128 + signal)
}

async fn handle_run_frame(args: RunFrameArgs) -> Result<i32, Box<dyn std::error::Error>> {
    init_tracing();
    let config = match &args.config {
        Some(path) => LauncherConfig::from_file(path)?,
        None => LauncherConfig::default(),
    };
    let launcher = FrameLauncher::new(config, ModuleRegistry::with_builtins());
    let mut run_frame = RunFrame::new(args.frame.session, args.frame.layer, args.frame.frame);
    if let Some(dir) = args.log_dir {
        run_frame = run_frame.with_log_dir(dir);
    }
    let report = launcher.run(run_frame).await?;
    print_report(&report, &args.output)?;
    Ok(category_exit_code(report.category))
}

// =============================================================================
// Host Command Handlers
// =============================================================================

async fn handle_host_status(
    client: &mut LauncherServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    let response = client
        .get_status(GetStatusRequest {})
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = HostStatusOutput {
                hostname: response.hostname,
                locked: response.locked,
                nimby: response.nimby,
                reboot_pending: response.reboot_pending,
                total_cores: response.total_cores,
                reserved_cores: response.reserved_cores,
                total_memory_kb: response.total_memory_kb,
                reserved_memory_kb: response.reserved_memory_kb,
                load_average: response.load_average,
                frames: response
                    .frames
                    .into_iter()
                    .map(|f| FrameOutput {
                        frame_id: f.frame_id,
                        frame_name: f.frame_name,
                        layer: f.layer,
                        frame: f.frame,
                        cores: f.cores,
                        rss_kb: f.rss_kb,
                        max_rss_kb: f.max_rss_kb,
                        cpu_secs: f.cpu_secs,
                        started_at: f.started_at,
                        log_path: f.log_path,
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            let state = if response.locked { "locked" } else { "accepting" };
            println!("Host Status");
            println!("{}", "=".repeat(40));
            println!("Host:    {}", response.hostname);
            println!("State:   {}", state);
            println!("NIMBY:   {}", if response.nimby { "on" } else { "off" });
            if response.reboot_pending {
                println!("Reboot:  pending");
            }
            println!(
                "Cores:   {:.1} / {:.1} reserved",
                response.reserved_cores, response.total_cores
            );
            println!(
                "Memory:  {} / {} KiB reserved",
                response.reserved_memory_kb, response.total_memory_kb
            );
            println!("Load:    {:.2}", response.load_average);
            println!();
            if response.frames.is_empty() {
                println!("No frames running.");
            } else {
                println!("{:<38} {:<30} {:<6} {:<12} STARTED", "FRAME ID", "FRAME", "CORES", "RSS KiB");
                println!("{}", "-".repeat(110));
                for frame in &response.frames {
                    println!(
                        "{:<38} {:<30} {:<6} {:<12} {}",
                        frame.frame_id, frame.frame_name, frame.cores, frame.rss_kb, frame.started_at
                    );
                }
            }
        }
    }
    Ok(EXIT_OK)
}

async fn handle_host_command(
    client: &mut LauncherServiceClient<Channel>,
    command: HostCommands,
    output_format: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    match command {
        HostCommands::Status => return handle_host_status(client, output_format).await,
        HostCommands::Nimby { state } => {
            let enabled = matches!(state, Toggle::On);
            client.set_nimby(SetNimbyRequest { enabled }).await?;
            println!("NIMBY {}", if enabled { "enabled" } else { "disabled" });
        }
        HostCommands::Lock => {
            client.lock(LockRequest {}).await?;
            println!("Host locked");
        }
        HostCommands::Unlock => {
            client.unlock(UnlockRequest {}).await?;
            println!("Host unlocked");
        }
        HostCommands::Kill { frame_id, reason } => {
            client
                .kill_frame(KillFrameRequest {
                    frame_id: frame_id.clone(),
                    reason,
                })
                .await?;
            println!("Kill sent to frame {}", frame_id);
        }
        HostCommands::RebootIdle => {
            let response = client.reboot_idle(RebootIdleRequest {}).await?.into_inner();
            if response.rebooting {
                println!("Host is rebooting");
            } else {
                println!("Host will reboot once idle");
            }
        }
        HostCommands::Shutdown { mode } => {
            let mode = match mode {
                ShutdownArg::Idle => ProtoShutdownMode::Idle,
                ShutdownArg::Now => ProtoShutdownMode::Now,
            };
            let response = client
                .shutdown(ShutdownRequest { mode: mode as i32 })
                .await?
                .into_inner();
            println!(
                "Shutdown requested ({} frame(s) running)",
                response.running_frames
            );
        }
    }
    Ok(EXIT_OK)
}

// =============================================================================
// Main Entry Point
// =============================================================================

async fn run(args: Args) -> Result<i32, Box<dyn std::error::Error>> {
    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await,
        Commands::Execute(execute_args) => handle_execute(execute_args),
        Commands::RunFrame(run_frame_args) => handle_run_frame(run_frame_args).await,
        Commands::Host { client, command } => {
            let channel = Channel::from_shared(client.addr.clone())?.connect().await?;
            let mut grpc_client = LauncherServiceClient::new(channel);
            handle_host_command(&mut grpc_client, command, &client.output).await
        }
    }
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_OK };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            error_exit_code(e.as_ref())
        }
    };
    std::process::exit(code);
}
