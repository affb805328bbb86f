use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatehouse_core::admin::AdminApi;
use gatehouse_core::config::Config;
use gatehouse_core::convert::convert_file;
use gatehouse_core::pid;
use gatehouse_core::serve::GatewayServer;

#[derive(Parser, Debug)]
#[command(
    name = "gatehouse",
    author,
    version,
    about = "Virtual-host HTTP front end with Apache config migration",
    propagate_version = true
)]
struct Cli {
    /// Increase output verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Output log format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bind the configured listeners and serve requests.
    Start(StartArgs),
    /// Terminate the running server recorded in the PID file.
    Stop(PidArgs),
    /// Report whether the recorded server process is alive.
    Status(StatusArgs),
    /// Convert a foreign configuration into the native format.
    Convert(ConvertArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "/etc/gatehouse/gatehouse.json")]
    config: PathBuf,

    #[arg(long, default_value = pid::DEFAULT_PID_PATH)]
    pid_file: PathBuf,
}

#[derive(Args, Debug)]
struct PidArgs {
    #[arg(long, default_value = pid::DEFAULT_PID_PATH)]
    pid_file: PathBuf,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long, default_value = pid::DEFAULT_PID_PATH)]
    pid_file: PathBuf,

    /// Configuration file used to report the serving ports.
    #[arg(short, long, default_value = "/etc/gatehouse/gatehouse.json")]
    config: PathBuf,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Source configuration dialect; only "apache" is supported.
    #[arg(long, default_value = "apache")]
    from: String,

    /// Input file (httpd.conf or a file that includes the rest).
    #[arg(long)]
    input: PathBuf,

    /// Where to write the native JSON configuration.
    #[arg(long, default_value = "gatehouse.json")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Command::Start(args) => start(args).await,
        Command::Stop(args) => stop(&args),
        Command::Status(args) => status(&args),
        Command::Convert(args) => convert(&args),
    }
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gatehouse={default_level}")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn start(args: StartArgs) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        vhosts = config.virtual_hosts.len(),
        ports = ?config.all_listen_ports(),
        "configuration loaded"
    );

    let admin_enabled = config.admin_enabled;
    let (config_tx, config_rx) = watch::channel(Arc::new(config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if admin_enabled {
        let api = AdminApi::new(config_tx, &args.config);
        let admin_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = api.run(admin_shutdown).await {
                warn!(error = %err, "admin api stopped with error");
            }
        });
    }

    if let Err(err) = pid::write_pid_file(&args.pid_file) {
        warn!(pid_file = %args.pid_file.display(), error = %err, "could not write pid file");
    }

    let result = GatewayServer::new(config_rx).run().await;

    let _ = shutdown_tx.send(true);
    pid::remove_pid_file(&args.pid_file);
    result.context("server terminated with error")
}

fn stop(args: &PidArgs) -> Result<()> {
    pid::stop(&args.pid_file)
        .with_context(|| format!("failed to stop server via {}", args.pid_file.display()))?;
    println!("server stopped");
    Ok(())
}

fn status(args: &StatusArgs) -> Result<()> {
    let running = pid::is_running(&args.pid_file)
        .with_context(|| format!("cannot read {}", args.pid_file.display()))?;
    if !running {
        println!("server is not running");
        return Ok(());
    }

    let pid = pid::read_pid_file(&args.pid_file)?;
    match Config::load(&args.config) {
        Ok(config) => println!(
            "server is running with pid {pid} on ports {}",
            config.all_listen_ports().join(", ")
        ),
        Err(_) => println!("server is running with pid {pid}"),
    }
    Ok(())
}

fn convert(args: &ConvertArgs) -> Result<()> {
    if !args.from.eq_ignore_ascii_case("apache") {
        bail!("unsupported conversion source: {}", args.from);
    }

    let config = convert_file(&args.input, Config::default())
        .with_context(|| format!("failed to convert {}", args.input.display()))?;

    let serialized = serde_json::to_string_pretty(&config)?;
    std::fs::write(&args.output, serialized)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    println!(
        "converted {} virtual host(s), listening on [{}] -> {}",
        config.virtual_hosts.len(),
        config.all_listen_ports().join(", "),
        args.output.display()
    );
    Ok(())
}
