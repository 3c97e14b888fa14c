use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logrelay_gate::{
    exec_command, probe_for, Backoff, CredentialKind, CredentialRef, Endpoint, FailureClass,
    ProbeKind, ReadinessGate, RetryPolicy, DEFAULT_PROBE_TIMEOUT,
};
use logrelay_logs::{line_stream, sink_from_config, PipelineRunner};
use logrelay_types::{parse_duration, FileConfig, OrphanPolicy, SinkKind};

/// logrelay - wait for dependencies and relay multi-line logs
#[derive(Parser, Debug)]
#[command(name = "logrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Diagnostic log format
    #[arg(long, value_enum, global = true, env = "LOGRELAY_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Block until a dependency accepts connections, then run a command
    Wait(WaitArgs),

    /// Reassemble multi-line records from stdin and forward them
    Pipeline(PipelineArgs),
}

#[derive(clap::Args, Debug)]
struct WaitArgs {
    /// Dependency host
    #[arg(long, env = "LOGRELAY_GATE_HOST", default_value = "localhost")]
    host: String,

    /// Dependency port
    #[arg(long, env = "LOGRELAY_GATE_PORT")]
    port: u16,

    /// How to check the dependency
    #[arg(long, value_enum, default_value = "tcp")]
    probe: ProbeArg,

    /// Request path for the http probe
    #[arg(long, default_value = "/")]
    path: String,

    /// Read the credential from <PREFIX>_USER/<PREFIX>_PASSWORD or <PREFIX>_TOKEN
    #[arg(long, value_name = "PREFIX")]
    credential_prefix: Option<String>,

    /// Credential kind
    #[arg(long, value_enum, default_value = "basic")]
    credential: CredentialArg,

    /// Delay between probes
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    interval: Duration,

    /// Give up after this many probes (default: never)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Give up after this long (default: never)
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Bound on a single probe
    #[arg(long, value_parser = parse_duration)]
    probe_timeout: Option<Duration>,

    /// Back off exponentially on auth failures, up to this delay
    #[arg(long, value_parser = parse_duration)]
    auth_backoff_max: Option<Duration>,

    /// Command to replace this process with once the dependency is ready
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProbeArg {
    Tcp,
    Http,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CredentialArg {
    Basic,
    #[value(alias = "token")]
    Bearer,
}

impl From<CredentialArg> for CredentialKind {
    fn from(arg: CredentialArg) -> Self {
        match arg {
            CredentialArg::Basic => Self::Basic,
            CredentialArg::Bearer => Self::Bearer,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OrphanArg {
    Wrap,
    #[value(alias = "drop")]
    Discard,
}

impl From<OrphanArg> for OrphanPolicy {
    fn from(arg: OrphanArg) -> Self {
        match arg {
            OrphanArg::Wrap => Self::Wrap,
            OrphanArg::Discard => Self::Discard,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SinkArg {
    Stdout,
    Loki,
}

impl From<SinkArg> for SinkKind {
    fn from(arg: SinkArg) -> Self {
        match arg {
            SinkArg::Stdout => Self::Stdout,
            SinkArg::Loki => Self::Loki,
        }
    }
}

#[derive(clap::Args, Debug)]
struct PipelineArgs {
    /// TOML config file with [pipeline] and [sink] sections
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Pattern matching the first line of a record
    #[arg(long)]
    start_pattern: Option<String>,

    /// Pattern with `time` and `message` named groups
    #[arg(long)]
    extract_pattern: Option<String>,

    /// chrono format for the `time` group
    #[arg(long)]
    time_format: Option<String>,

    /// Flush a record after this long without new lines
    #[arg(long, value_parser = parse_duration)]
    max_wait_time: Option<Duration>,

    /// Flush a record once it holds this many lines (0 = no limit)
    #[arg(long)]
    max_lines: Option<usize>,

    /// What to do with continuation lines outside a record
    #[arg(long, value_enum)]
    orphan_policy: Option<OrphanArg>,

    /// Where records go
    #[arg(long, value_enum)]
    sink: Option<SinkArg>,

    /// Loki push endpoint
    #[arg(long, env = "LOGRELAY_LOKI_URL")]
    loki_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.log_format);

    let result = match args.command {
        Command::Wait(wait) => run_wait(wait).await,
        Command::Pipeline(pipeline) => run_pipeline(pipeline).await,
    };

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

/// Diagnostics go to stderr; RUST_LOG wins over LOG_LEVEL
fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::try_new(level.to_lowercase())
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    });

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Cancel the returned token on Ctrl-C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal received");
        token.cancel();
    });

    cancel
}

async fn run_wait(args: WaitArgs) -> Result<()> {
    let probe = match args.probe {
        ProbeArg::Tcp => ProbeKind::Tcp,
        ProbeArg::Http => ProbeKind::Http {
            path: args.path.clone(),
        },
    };

    let mut endpoint = Endpoint::new(args.host.clone(), args.port, probe);
    if let Some(prefix) = &args.credential_prefix {
        let cref = CredentialRef::new(CredentialKind::from(args.credential), prefix.clone());
        let credential = cref
            .resolve()
            .with_context(|| format!("Failed to resolve credential for {}", endpoint))?;
        endpoint = endpoint.with_credential(credential);
    }

    let mut policy = RetryPolicy::fixed(args.interval);
    if let Some(max) = args.max_attempts {
        policy = policy.with_max_attempts(max);
    }
    if let Some(deadline) = args.timeout {
        policy = policy.with_deadline(deadline);
    }
    if let Some(max) = args.auth_backoff_max {
        policy = policy.with_backoff(FailureClass::Auth, Backoff::Exponential { multiplier: 2, max });
    }

    let probe_timeout = args.probe_timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT);
    let mut gate = ReadinessGate::new(probe_for(&endpoint, probe_timeout)?, policy)
        .with_cancellation(shutdown_token());

    gate.wait(&endpoint).await?;

    if args.command.is_empty() {
        return Ok(());
    }

    // Only returns if the handoff itself failed
    match exec_command(&args.command)? {}
}

async fn run_pipeline(args: PipelineArgs) -> Result<()> {
    let config = load_pipeline_config(&args)?;

    let sink = sink_from_config(&config.sink).context("Failed to set up sink")?;
    let runner = PipelineRunner::new(&config.pipeline, sink)
        .context("Invalid pipeline configuration")?
        .with_cancellation(shutdown_token());

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let (stats, _sink) = runner.run(line_stream(stdin)).await?;

    if stats.discarded > 0 {
        info!(discarded = stats.discarded, "Dropped continuation lines outside any record");
    }
    Ok(())
}

/// Config file first, then CLI overrides
fn load_pipeline_config(args: &PipelineArgs) -> Result<FileConfig> {
    let mut config = match &args.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => FileConfig::default(),
    };

    let pipeline = &mut config.pipeline;
    if let Some(pattern) = &args.start_pattern {
        pipeline.start_pattern = pattern.clone();
    }
    if let Some(pattern) = &args.extract_pattern {
        pipeline.extract_pattern = pattern.clone();
    }
    if let Some(format) = &args.time_format {
        pipeline.time_format = format.clone();
    }
    if let Some(wait) = args.max_wait_time {
        pipeline.max_wait_time = wait;
    }
    if let Some(max) = args.max_lines {
        pipeline.max_lines = max;
    }
    if let Some(policy) = args.orphan_policy {
        pipeline.orphan_policy = policy.into();
    }

    if let Some(sink) = args.sink {
        config.sink.kind = sink.into();
    }
    if let Some(url) = &args.loki_url {
        config.sink.url = Some(url.clone());
        if args.sink.is_none() {
            config.sink.kind = SinkKind::Loki;
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_args_collect_trailing_command() {
        let args = Args::try_parse_from([
            "logrelay", "wait", "--host", "db", "--port", "5432", "--max-attempts", "5", "--",
            "uvicorn", "app.main:app", "--port", "8000",
        ])
        .unwrap();

        let Command::Wait(wait) = args.command else {
            panic!("expected wait subcommand");
        };
        assert_eq!(wait.host, "db");
        assert_eq!(wait.port, 5432);
        assert_eq!(wait.max_attempts, Some(5));
        assert_eq!(wait.interval, Duration::from_secs(1));
        assert_eq!(wait.command, vec!["uvicorn", "app.main:app", "--port", "8000"]);
    }

    #[test]
    fn test_pipeline_cli_overrides_defaults() {
        let args = Args::try_parse_from([
            "logrelay",
            "pipeline",
            "--max-wait-time",
            "500ms",
            "--orphan-policy",
            "discard",
            "--loki-url",
            "http://loki:3100/loki/api/v1/push",
        ])
        .unwrap();

        let Command::Pipeline(pipeline) = args.command else {
            panic!("expected pipeline subcommand");
        };
        let config = load_pipeline_config(&pipeline).unwrap();
        assert_eq!(config.pipeline.max_wait_time, Duration::from_millis(500));
        assert_eq!(config.pipeline.orphan_policy, OrphanPolicy::Discard);
        assert_eq!(config.sink.kind, SinkKind::Loki);
    }

    #[test]
    fn test_unknown_enum_values_rejected() {
        assert!(Args::try_parse_from(["logrelay", "pipeline", "--sink", "lokki"]).is_err());
        assert!(Args::try_parse_from(["logrelay", "pipeline", "--orphan-policy", "discrad"]).is_err());
        assert!(Args::try_parse_from(["logrelay", "wait", "--port", "1", "--credential", "berer"]).is_err());
    }

    #[test]
    fn test_enum_aliases_accepted() {
        let args = Args::try_parse_from(["logrelay", "wait", "--port", "1", "--credential", "token"]).unwrap();
        let Command::Wait(wait) = args.command else {
            panic!("expected wait subcommand");
        };
        assert_eq!(CredentialKind::from(wait.credential), CredentialKind::Bearer);
    }

    #[test]
    fn test_bad_duration_rejected() {
        assert!(Args::try_parse_from(["logrelay", "wait", "--port", "1", "--interval", "soon"]).is_err());
    }
}
